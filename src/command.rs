use anyhow::{bail, Context, Result};
use std::process::ExitStatus;

use crate::ssh::CommandOutput;

/// Human-friendly error messages for local programs that failed to start or exited non-zero
pub fn status_to_pretty_err<E>(
    res: std::result::Result<ExitStatus, E>,
    command: &str,
    args: &[&str],
) -> Result<()>
where
    E: Send + 'static,
    E: Sync,
    E: std::error::Error,
{
    let status = res.with_context(|| format!("failed to start this command: {command}"))?;
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => bail!(
            "command {command} failed ({command} {}) with exit code: {code}",
            args.join(" ")
        ),
        None => bail!(
            "command {command} ({command} {}) was terminated by a signal",
            args.join(" ")
        ),
    }
}

/// Human-friendly error messages for remote commands
pub fn output_to_pretty_err(output: CommandOutput, host: &str, command: &str) -> Result<Vec<u8>> {
    if output.success() {
        return Ok(output.stdout);
    }
    let stderr = output.stderr.trim();
    match output.code {
        Some(code) if stderr.is_empty() => {
            bail!("remote command `{command}` failed on {host} with exit code: {code}")
        }
        Some(code) => {
            bail!("remote command `{command}` failed on {host} with exit code {code}: {stderr}")
        }
        None => bail!("remote command `{command}` on {host} was terminated by a signal"),
    }
}

#[test]
fn test_output_to_pretty_err() {
    let ok = CommandOutput {
        code: Some(0),
        stdout: b"ssh-rsa AAAA\n".to_vec(),
        stderr: String::new(),
    };
    assert_eq!(
        output_to_pretty_err(ok, "web-00", "cat").unwrap(),
        b"ssh-rsa AAAA\n"
    );

    let failed = CommandOutput {
        code: Some(1),
        stdout: Vec::new(),
        stderr: "mv: cannot move\n".to_string(),
    };
    let err = output_to_pretty_err(failed, "web-00", "mv").unwrap_err();
    assert_eq!(
        err.to_string(),
        "remote command `mv` failed on web-00 with exit code 1: mv: cannot move"
    );

    let killed = CommandOutput {
        code: None,
        stdout: Vec::new(),
        stderr: String::new(),
    };
    assert!(output_to_pretty_err(killed, "web-00", "cat")
        .unwrap_err()
        .to_string()
        .contains("terminated by a signal"));
}
