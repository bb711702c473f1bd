//! [`Connector`] backed by the OpenSSH client binary.
//!
//! Every session is a master connection bound to a control socket in a
//! private temporary directory. Commands are multiplexed over that socket, so
//! a host is authenticated exactly once per session.

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::{Builder, TempDir};

use crate::command::status_to_pretty_err;
use crate::ssh::{CommandOutput, Connector, Session, Target};

const CONTROL_SOCKET: &str = "control";
const CLIENT_LOG: &str = "ssh.log";

/// Client options shared by every connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshOptions {
    /// Seconds to wait for the tcp connection, client default when unset
    pub connect_timeout: Option<u64>,
    /// Private key to offer for public key authentication
    pub identity_file: Option<PathBuf>,
    /// Alternative known hosts file for trust-on-first-use
    pub known_hosts_file: Option<PathBuf>,
}

/// Connects using `ssh`, or `sshpass -e ssh` for password logins
#[derive(Debug, Clone, Default)]
pub struct OpenSsh {
    options: SshOptions,
}

impl OpenSsh {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    fn master_args(&self, target: &Target, control_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "-M".to_string(),
            "-N".to_string(),
            "-f".to_string(),
            "-S".to_string(),
            control_dir.join(CONTROL_SOCKET).display().to_string(),
            "-E".to_string(),
            control_dir.join(CLIENT_LOG).display().to_string(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if target.password.is_some() {
            args.push("-o".to_string());
            args.push("NumberOfPasswordPrompts=1".to_string());
        } else {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        if let Some(port) = target.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(timeout) = self.options.connect_timeout {
            args.push("-o".to_string());
            args.push(format!("ConnectTimeout={timeout}"));
        }
        if let Some(identity_file) = &self.options.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.display().to_string());
        }
        if let Some(known_hosts_file) = &self.options.known_hosts_file {
            args.push("-o".to_string());
            args.push(format!("UserKnownHostsFile={}", known_hosts_file.display()));
        }
        args.push(target.destination());
        args
    }
}

impl Connector for OpenSsh {
    type Session = OpenSshSession;

    fn connect(&self, target: &Target) -> Result<OpenSshSession> {
        let control_dir = Builder::new()
            .prefix("keyfleet-ssh.")
            .tempdir()
            .context("cannot create temporary directory")?;
        let args = self.master_args(target, control_dir.path());
        let args = args.iter().map(String::as_str).collect::<Vec<_>>();

        let (program, mut command) = match &target.password {
            Some(password) => {
                let mut command = Command::new("sshpass");
                command.arg("-e").arg("ssh").env("SSHPASS", password);
                ("sshpass", command)
            }
            None => ("ssh", Command::new("ssh")),
        };
        debug!("$ {program} {}", args.join(" "));
        // ssh forks into the background once authenticated, the inherited
        // pipes would keep us waiting for the master to exit.
        let status = command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        if let Err(err) = status_to_pretty_err(status, program, &args) {
            let client_log = fs::read_to_string(control_dir.path().join(CLIENT_LOG))
                .unwrap_or_default()
                .trim()
                .to_string();
            let err = if client_log.is_empty() {
                err
            } else {
                anyhow!(client_log)
            };
            return Err(err)
                .with_context(|| format!("failed to connect to {}", target.destination()));
        }

        Ok(OpenSshSession {
            destination: target.destination(),
            control_dir,
            closed: false,
        })
    }
}

/// A master connection held open through its control socket
pub struct OpenSshSession {
    destination: String,
    control_dir: TempDir,
    closed: bool,
}

impl OpenSshSession {
    fn socket(&self) -> String {
        self.control_dir
            .path()
            .join(CONTROL_SOCKET)
            .display()
            .to_string()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let socket = self.socket();
        let args = [
            "-S",
            socket.as_str(),
            "-o",
            "BatchMode=yes",
            "-O",
            "exit",
            self.destination.as_str(),
        ];
        debug!("$ ssh {}", args.join(" "));
        let status = Command::new("ssh")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        status_to_pretty_err(status, "ssh", &args)
            .with_context(|| format!("failed to close connection to {}", self.destination))
    }
}

impl Session for OpenSshSession {
    fn exec(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let socket = self.socket();
        let args = [
            "-S",
            socket.as_str(),
            "-o",
            "ControlMaster=no",
            "-o",
            "BatchMode=yes",
            self.destination.as_str(),
            "--",
            command,
        ];
        debug!("$ ssh {}", args.join(" "));
        let mut child = Command::new("ssh")
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to start this command: ssh")?;

        if let Some(input) = stdin {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("could not pipe stdin"))?;
            pipe.write_all(input)
                .with_context(|| format!("failed to send input to {}", self.destination))?;
        }
        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for ssh on {}", self.destination))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn close(mut self) -> Result<()> {
        self.shutdown()
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("{err:#}");
        }
    }
}
