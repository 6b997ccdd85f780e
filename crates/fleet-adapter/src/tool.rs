//! One-shot tool invocations with a hard deadline

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use fleet_core::prelude::*;
use fleet_core::types::ExecOutput;

/// Run `program args...` to completion, bounded by `limit`.
///
/// The child is spawned with `kill_on_drop`, so when the deadline passes the
/// dropped future takes the process with it.
pub async fn run_tool(program: &str, args: &[&str], limit: Duration) -> Result<ExecOutput> {
    let operation = format!("{} {}", program, args.first().copied().unwrap_or_default());
    debug!("Running tool: {} {:?}", program, args);

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ToolNotFound {
                    tool: program.to_string(),
                }
            } else {
                Error::ProcessSpawn {
                    reason: format!("{}: {}", program, e),
                }
            }
        })?;

    let output = timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| {
            warn!("{} did not finish within {:?}", operation, limit);
            Error::timeout(operation.clone(), limit)
        })??;

    let result = ExecOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };

    trace!("{} exited with {:?}", operation, result.exit_code);
    Ok(result)
}

/// Like [`run_tool`], but a non-zero exit becomes an [`Error::ExternalToolFailure`]
pub async fn run_tool_checked(program: &str, args: &[&str], limit: Duration) -> Result<String> {
    let output = run_tool(program, args, limit).await?;
    if output.success() {
        Ok(output.stdout)
    } else {
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        Err(Error::tool(format!(
            "{} {} exited with {:?}: {}",
            program,
            args.join(" "),
            output.exit_code,
            detail
        )))
    }
}
