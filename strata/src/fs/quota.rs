//! Quota-group management through the privileged helper binary.
//!
//! Quota commands need elevated capabilities the main process usually does
//! not have, so they are delegated to an external set-UID helper. The
//! helper's command surface is `limit`, `destroy`, `stats` and `list`, each
//! taking the btrfs binary to drive as a global flag.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::errors::{StrataError, StrataResult};
use crate::fs::{DiskUsage, VolumeStats};

#[derive(Clone, Debug)]
pub struct QuotaHelper {
    helper_bin: PathBuf,
    btrfs_bin: PathBuf,
}

impl QuotaHelper {
    pub fn new(helper_bin: PathBuf, btrfs_bin: PathBuf) -> Self {
        Self {
            helper_bin,
            btrfs_bin,
        }
    }

    /// Attach or update the quota group for `volume_path`.
    pub fn apply_disk_limit(
        &self,
        volume_path: &Path,
        disk_limit_bytes: i64,
        exclusive: bool,
    ) -> StrataResult<()> {
        let mut args = vec![
            "limit".to_string(),
            "--volume-path".to_string(),
            volume_path.display().to_string(),
            "--disk-limit-bytes".to_string(),
            disk_limit_bytes.to_string(),
        ];
        if exclusive {
            args.push("--exclude-image-from-quota".to_string());
        }

        self.run(&args).map(|_| ())
    }

    /// Remove the quota group accounting `volume_path`.
    pub fn destroy_quota_group(&self, volume_path: &Path) -> StrataResult<()> {
        self.run(&[
            "destroy".to_string(),
            "--volume-path".to_string(),
            volume_path.display().to_string(),
        ])
        .map(|_| ())
    }

    /// Read quota-group usage for `volume_path`. The helper prints total and
    /// exclusive byte counts as the last two columns of its output.
    pub fn stats(&self, volume_path: &Path) -> StrataResult<VolumeStats> {
        let output = self.run(&[
            "stats".to_string(),
            "--volume-path".to_string(),
            volume_path.display().to_string(),
            "--force-sync".to_string(),
        ])?;

        parse_stats(&output)
    }

    /// List subvolume paths below `path`, deepest last.
    pub fn list_subvolumes(&self, path: &Path) -> StrataResult<Vec<String>> {
        let output = self.run(&["list".to_string(), path.display().to_string()])?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn run(&self, args: &[String]) -> StrataResult<String> {
        self.ensure_usable()?;

        let mut cmd = Command::new(&self.helper_bin);
        cmd.arg("--btrfs-bin").arg(&self.btrfs_bin).args(args);
        tracing::debug!(helper = %self.helper_bin.display(), ?args, "running-quota-helper");

        let output = cmd.output().map_err(|e| {
            StrataError::Backend(format!(
                "running quota helper {}: {}",
                self.helper_bin.display(),
                e
            ))
        })?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StrataError::Backend(format!(
                "quota helper exited with {}: {} {}",
                output.status,
                stdout.trim(),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// The helper must exist, and must be set-UID when we are not root.
    fn ensure_usable(&self) -> StrataResult<()> {
        let Some(resolved) = resolve_binary(&self.helper_bin) else {
            return Err(StrataError::Config(format!(
                "quota helper `{}` was not found in the $PATH",
                self.helper_bin.display()
            )));
        };

        if unsafe { libc::geteuid() } == 0 {
            return Ok(());
        }

        let metadata = std::fs::metadata(&resolved).map_err(|e| {
            StrataError::Config(format!(
                "inspecting quota helper {}: {}",
                resolved.display(),
                e
            ))
        })?;
        if metadata.permissions().mode() & 0o4000 == 0 {
            return Err(StrataError::Config(format!(
                "missing the setuid bit on {}",
                resolved.display()
            )));
        }

        Ok(())
    }
}

/// PATH lookup for bare binary names, passthrough for explicit paths.
fn resolve_binary(bin: &Path) -> Option<PathBuf> {
    if bin.components().count() > 1 {
        return bin.exists().then(|| bin.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(bin))
        .find(|candidate| candidate.is_file())
}

fn parse_stats(raw: &str) -> StrataResult<VolumeStats> {
    let last_line = raw
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| StrataError::Backend("could not parse stats: empty output".to_string()))?;

    let mut columns = last_line.split_whitespace().rev();
    let exclusive = columns.next().and_then(|c| c.parse::<i64>().ok());
    let total = columns.next().and_then(|c| c.parse::<i64>().ok());

    match (total, exclusive) {
        (Some(total_bytes_used), Some(exclusive_bytes_used)) => Ok(VolumeStats {
            disk_usage: DiskUsage {
                total_bytes_used,
                exclusive_bytes_used,
            },
        }),
        _ => Err(StrataError::Backend(format!(
            "could not parse stats, raw output: {}",
            raw.trim()
        ))),
    }
}
