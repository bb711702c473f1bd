//! An in-memory fleet speaking just enough shell for the key manager.

use anyhow::{anyhow, bail, Result};
use keyfleet::fleet::{READ_AUTHORIZED_KEYS, WRITE_AUTHORIZED_KEYS};
use keyfleet::ssh::{CommandOutput, Connector, Session, Target};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    /// Content of `~/.ssh/authorized_keys`, `None` if the file does not exist
    pub authorized_keys: Option<Vec<u8>>,
    pub unreachable: bool,
    /// Accept only this password when set
    pub password: Option<String>,
    pub read_only: bool,
}

impl FakeHost {
    pub fn with_keys(content: impl AsRef<[u8]>) -> Self {
        Self {
            authorized_keys: Some(content.as_ref().to_vec()),
            ..Default::default()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct FleetState {
    hosts: BTreeMap<String, FakeHost>,
    connection_attempts: Vec<String>,
    commands: Vec<(String, String)>,
    open_sessions: usize,
    max_open_sessions: usize,
    closed_sessions: usize,
}

/// Hosts are looked up by [`Target::hostname`]
#[derive(Debug, Clone, Default)]
pub struct FakeFleet {
    state: Rc<RefCell<FleetState>>,
}

impl FakeFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, hostname: &str, host: FakeHost) -> Self {
        self.state
            .borrow_mut()
            .hosts
            .insert(hostname.to_string(), host);
        self
    }

    pub fn authorized_keys(&self, hostname: &str) -> Option<Vec<u8>> {
        self.state
            .borrow()
            .hosts
            .get(hostname)
            .and_then(|host| host.authorized_keys.clone())
    }

    /// Hostnames in the order connections were attempted
    pub fn connection_attempts(&self) -> Vec<String> {
        self.state.borrow().connection_attempts.clone()
    }

    /// `(hostname, command)` pairs in execution order
    pub fn commands(&self) -> Vec<(String, String)> {
        self.state.borrow().commands.clone()
    }

    pub fn writes_to(&self, hostname: &str) -> usize {
        self.state
            .borrow()
            .commands
            .iter()
            .filter(|(host, command)| host == hostname && command == WRITE_AUTHORIZED_KEYS)
            .count()
    }

    pub fn max_open_sessions(&self) -> usize {
        self.state.borrow().max_open_sessions
    }

    pub fn open_sessions(&self) -> usize {
        self.state.borrow().open_sessions
    }

    pub fn closed_sessions(&self) -> usize {
        self.state.borrow().closed_sessions
    }
}

impl Connector for FakeFleet {
    type Session = FakeSession;

    fn connect(&self, target: &Target) -> Result<FakeSession> {
        let mut state = self.state.borrow_mut();
        state.connection_attempts.push(target.hostname.clone());
        let host = state.hosts.get(&target.hostname).ok_or_else(|| {
            anyhow!(
                "ssh: Could not resolve hostname {}: Name or service not known",
                target.hostname
            )
        })?;
        if host.unreachable {
            bail!(
                "ssh: connect to host {} port 22: Connection refused",
                target.hostname
            );
        }
        if host.password.is_some() && host.password != target.password {
            bail!("{}: Permission denied (password).", target.destination());
        }
        state.open_sessions += 1;
        state.max_open_sessions = state.max_open_sessions.max(state.open_sessions);
        Ok(FakeSession {
            hostname: target.hostname.clone(),
            state: self.state.clone(),
            closed: false,
        })
    }
}

pub struct FakeSession {
    hostname: String,
    state: Rc<RefCell<FleetState>>,
    closed: bool,
}

impl FakeSession {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut state = self.state.borrow_mut();
            state.open_sessions -= 1;
            state.closed_sessions += 1;
        }
    }
}

fn output(code: i32, stdout: &[u8], stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: stdout.to_vec(),
        stderr: stderr.to_string(),
    }
}

impl Session for FakeSession {
    fn exec(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let mut state = self.state.borrow_mut();
        state
            .commands
            .push((self.hostname.clone(), command.to_string()));
        let host = state
            .hosts
            .get_mut(&self.hostname)
            .ok_or_else(|| anyhow!("host {} vanished", self.hostname))?;

        let result = match command {
            READ_AUTHORIZED_KEYS => {
                let content = host.authorized_keys.as_deref().unwrap_or_default();
                output(0, content, "")
            }
            WRITE_AUTHORIZED_KEYS if host.read_only => output(
                1,
                b"",
                "cat: /home/deploy/.ssh/authorized_keys.keyfleet: Permission denied\n",
            ),
            WRITE_AUTHORIZED_KEYS => {
                host.authorized_keys = Some(stdin.unwrap_or_default().to_vec());
                output(0, b"", "")
            }
            _ => output(127, b"", "sh: command not found\n"),
        };
        Ok(result)
    }

    fn close(mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.release();
    }
}
