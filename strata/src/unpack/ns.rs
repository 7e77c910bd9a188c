//! Unprivileged unpacking via user-namespace re-exec.
//!
//! The current binary is spawned again with the hidden `unpack` subcommand
//! inside a fresh user namespace. The parent writes the id mappings with
//! `newuidmap`/`newgidmap` while the child blocks on a control pipe, then
//! streams the layer tar over the child's stdin. Inside the namespace the
//! child runs the plain tar unpacker as namespace-root and the kernel
//! performs the ownership translation.

use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::errors::{StrataError, StrataResult};
use crate::idmap::IdMapping;
use crate::unpack::{UnpackOutput, UnpackSpec, Unpacker};

/// Applies uid/gid mappings to a process via the setuid shadow-utils
/// helpers.
#[derive(Clone, Debug)]
pub struct IdMapper {
    newuidmap_bin: PathBuf,
    newgidmap_bin: PathBuf,
}

impl IdMapper {
    pub fn new(newuidmap_bin: PathBuf, newgidmap_bin: PathBuf) -> Self {
        Self {
            newuidmap_bin,
            newgidmap_bin,
        }
    }

    pub fn map_uids(&self, pid: u32, mappings: &[IdMapping]) -> StrataResult<()> {
        self.run(&self.newuidmap_bin, pid, mappings)
    }

    pub fn map_gids(&self, pid: u32, mappings: &[IdMapping]) -> StrataResult<()> {
        self.run(&self.newgidmap_bin, pid, mappings)
    }

    fn run(&self, bin: &PathBuf, pid: u32, mappings: &[IdMapping]) -> StrataResult<()> {
        let args = mapping_args(pid, mappings);
        tracing::debug!(bin = %bin.display(), ?args, "applying-id-mappings");

        let output = Command::new(bin).args(&args).output().map_err(|e| {
            StrataError::Config(format!("running {}: {}", bin.display(), e))
        })?;

        if !output.status.success() {
            return Err(StrataError::Unpackable(format!(
                "{} exited with {}: {}",
                bin.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

fn mapping_args(pid: u32, mappings: &[IdMapping]) -> Vec<String> {
    let mut args = vec![pid.to_string()];
    for mapping in mappings {
        args.push(mapping.namespace_id.to_string());
        args.push(mapping.host_id.to_string());
        args.push(mapping.size.to_string());
    }
    args
}

pub struct NsIdMapperUnpacker {
    id_mapper: IdMapper,
}

impl NsIdMapperUnpacker {
    pub fn new(id_mapper: IdMapper) -> Self {
        Self { id_mapper }
    }
}

impl Unpacker for NsIdMapperUnpacker {
    fn unpack(&self, mut spec: UnpackSpec) -> StrataResult<UnpackOutput> {
        let has_mappings = !spec.uid_mappings.is_empty() || !spec.gid_mappings.is_empty();

        let (ctl_read, ctl_write) = nix::unistd::pipe()
            .map_err(|e| StrataError::Backend(format!("creating control pipe: {}", e)))?;

        let exe = std::env::current_exe()
            .map_err(|e| StrataError::Backend(format!("resolving current binary: {}", e)))?;

        // The pipe is created without close-on-exec, so the child inherits
        // it at the same descriptor number.
        let mut cmd = Command::new(exe);
        cmd.arg("unpack")
            .arg("--target-path")
            .arg(&spec.target_path)
            .arg("--whiteout-device")
            .arg(&spec.whiteout_device_path)
            .arg("--ctl-pipe-fd")
            .arg(ctl_read.as_raw_fd().to_string());
        if !spec.base_directory.is_empty() {
            cmd.arg("--base-directory").arg(&spec.base_directory);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if has_mappings {
            enter_new_user_namespace(&mut cmd);
        }

        tracing::debug!(target = %spec.target_path.display(), "starting-unpack-reexec");
        let mut child = cmd
            .spawn()
            .map_err(|e| StrataError::Backend(format!("spawning unpack process: {}", e)))?;
        drop(ctl_read);

        if has_mappings {
            self.id_mapper.map_uids(child.id(), &spec.uid_mappings)?;
            self.id_mapper.map_gids(child.id(), &spec.gid_mappings)?;
        }

        // Mappings are in place: let the child proceed.
        nix::unistd::write(&ctl_write, &[0])
            .map_err(|e| StrataError::Backend(format!("writing to control pipe: {}", e)))?;
        drop(ctl_write);

        let mut stdin = child.stdin.take().ok_or_else(|| {
            StrataError::Backend("unpack child has no stdin".to_string())
        })?;
        let copy_result = io::copy(&mut spec.stream, &mut stdin);
        drop(stdin);

        let output = child
            .wait_with_output()
            .map_err(|e| StrataError::Backend(format!("waiting for unpack process: {}", e)))?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Err(e) = copy_result {
            return Err(StrataError::Unpackable(format!(
                "streaming layer to unpack process: {}: {}",
                e,
                stderr.trim()
            )));
        }

        if !output.status.success() {
            let message = stderr.trim();
            return Err(if message.contains("ID-mapped unpacking") {
                StrataError::Unpackable(message.to_string())
            } else {
                StrataError::Unpackable(format!(
                    "unpack process exited with {}: {}",
                    output.status, message
                ))
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            StrataError::Backend(format!("parsing unpack process output: {}", e))
        })
    }
}

fn enter_new_user_namespace(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: unshare is async-signal-safe; nothing else runs between fork
    // and exec.
    unsafe {
        cmd.pre_exec(|| {
            nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWUSER)
                .map_err(io::Error::from)
        });
    }
}

/// Child-side entrypoint for the `unpack` subcommand: wait for the parent
/// to finish mapping, become namespace root, unpack stdin, report the
/// result as JSON on stdout.
pub fn run_reexec_child(
    target_path: PathBuf,
    base_directory: String,
    whiteout_device_path: PathBuf,
    ctl_pipe_fd: i32,
) -> StrataResult<UnpackOutput> {
    wait_for_parent(ctl_pipe_fd)?;

    // Inside a fresh namespace the process may still carry its unmapped
    // host id; switching to namespace root makes chown authoritative.
    if unsafe { libc::geteuid() } != 0 {
        if let Err(e) = nix::unistd::setgid(nix::unistd::Gid::from_raw(0)) {
            tracing::debug!(error = %e, "setgid-to-namespace-root-failed");
        }
        if let Err(e) = nix::unistd::setuid(nix::unistd::Uid::from_raw(0)) {
            tracing::debug!(error = %e, "setuid-to-namespace-root-failed");
        }
    }

    let unpacker = crate::unpack::TarUnpacker::new();
    unpacker.unpack(UnpackSpec {
        stream: Box::new(io::stdin()),
        target_path,
        base_directory,
        // The kernel translates ownership through the namespace mappings.
        uid_mappings: Vec::new(),
        gid_mappings: Vec::new(),
        whiteout_device_path,
    })
}

fn wait_for_parent(ctl_pipe_fd: i32) -> StrataResult<()> {
    use std::os::fd::FromRawFd;

    tracing::debug!(fd = ctl_pipe_fd, "waiting-for-control-pipe");
    // SAFETY: the fd was inherited from the parent, which owns the write
    // end and told us its number.
    let mut pipe = unsafe { std::fs::File::from_raw_fd(ctl_pipe_fd) };
    let mut buffer = [0u8; 1];
    pipe.read_exact(&mut buffer).map_err(|e| {
        StrataError::Backend(format!("reading control pipe: {}", e))
    })?;
    Ok(())
}

/// Serialize an unpack result onto stdout for the parent to parse.
pub fn write_reexec_output(output: &UnpackOutput) -> StrataResult<()> {
    let payload = serde_json::to_vec(output)?;
    io::stdout()
        .write_all(&payload)
        .map_err(|e| StrataError::Backend(format!("writing unpack output: {}", e)))?;
    Ok(())
}
