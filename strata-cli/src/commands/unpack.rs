//! Hidden re-exec entrypoint: runs inside the user namespace set up by the
//! parent and unpacks the tar arriving on stdin.

use anyhow::anyhow;

use strata::unpack::ns;

use crate::cli::UnpackArgs;

pub fn execute(args: UnpackArgs) -> anyhow::Result<()> {
    let output = ns::run_reexec_child(
        args.target_path,
        args.base_directory,
        args.whiteout_device,
        args.ctl_pipe_fd,
    )
    .map_err(|e| anyhow!(e.to_string()))?;

    ns::write_reexec_output(&output).map_err(|e| anyhow!(e.to_string()))?;
    Ok(())
}
