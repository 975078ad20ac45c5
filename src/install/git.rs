//! Git install path — clone the source repo and optionally build it.

use std::path::Path;

use crate::install::run_step;
use crate::transport::stdio::parse_command_line;

/// Clone `source` into the server's install directory (optionally a
/// specific branch) and run the declared post-clone build command.
pub(crate) async fn install(
    server: &str,
    dir: &Path,
    source: &str,
    branch: Option<&str>,
    build_command: Option<&str>,
) -> crate::Result<()> {
    let mut args = vec!["clone"];
    if let Some(branch) = branch {
        args.extend(["--branch", branch]);
    }
    args.extend([source, "."]);
    run_step(server, "git", &args, Some(dir)).await?;

    if let Some(build) = build_command {
        let argv = parse_command_line(build);
        if let Some((command, rest)) = argv.split_first() {
            let rest: Vec<&str> = rest.iter().map(String::as_str).collect();
            run_step(server, command, &rest, Some(dir)).await?;
        }
    }
    Ok(())
}
