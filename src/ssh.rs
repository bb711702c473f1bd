//! The SSH capability the key manager is written against.

use anyhow::Result;
use std::fmt;

/// A server to connect to, resolved from the command line and the inventory
#[derive(Clone, PartialEq, Eq)]
pub struct Target {
    /// Name as given on the command line, used in reports
    pub name: String,
    /// Hostname or ip address to connect to
    pub hostname: String,
    /// Remote login user
    pub username: String,
    /// SSH port, the client default applies when unset
    pub port: Option<u16>,
    /// Password for password authentication
    pub password: Option<String>,
}

impl Target {
    /// `user@host` as understood by ssh
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("name", &self.name)
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Result of a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the command was killed by a signal
    pub code: Option<i32>,
    /// Raw output, remote files are not necessarily valid UTF-8
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// An open, authenticated connection to one host.
///
/// Implementations release the connection on drop if `close` was never called.
pub trait Session {
    /// Run `command` through the remote shell, feeding `stdin` if given
    fn exec(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput>;

    /// Tear the connection down
    fn close(self) -> Result<()>;
}

/// Opens sessions to targets
pub trait Connector {
    type Session: Session;

    /// Connect and authenticate. Unknown host keys are trusted on first use.
    fn connect(&self, target: &Target) -> Result<Self::Session>;
}

#[test]
fn test_target_debug_redacts_password() {
    let target = Target {
        name: "web-00".to_string(),
        hostname: "192.168.0.10".to_string(),
        username: "root".to_string(),
        port: Some(2222),
        password: Some("hunter2".to_string()),
    };
    assert_eq!(target.destination(), "root@192.168.0.10");
    let debug = format!("{target:?}");
    assert!(!debug.contains("hunter2"));
    assert!(debug.contains("<redacted>"));
}
