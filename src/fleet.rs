//! Fleet wide key distribution, rotation and revocation.
//!
//! Hosts are handled one after another in the order given. Each host gets its
//! own connection which is closed before the next host is contacted, and a
//! failing host never stops the run.

use anyhow::{Context, Result};
use log::{error, info, warn};
use std::fmt;
use std::path::Path;

use crate::authorized_keys::AuthorizedKeys;
use crate::command::output_to_pretty_err;
use crate::keys::read_public_key;
use crate::ssh::{Connector, Session, Target};

/// Prints the remote authorized keys file, nothing if it does not exist yet
pub const READ_AUTHORIZED_KEYS: &str =
    "if [ -e ~/.ssh/authorized_keys ]; then cat ~/.ssh/authorized_keys; fi";

/// Replaces the remote authorized keys file with stdin
pub const WRITE_AUTHORIZED_KEYS: &str = "umask 077 && mkdir -p ~/.ssh && \
     cat > ~/.ssh/authorized_keys.keyfleet && \
     mv -f ~/.ssh/authorized_keys.keyfleet ~/.ssh/authorized_keys";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Distribute,
    Rotate,
    Revoke,
}

impl Action {
    fn done(&self, host: &str) -> String {
        match self {
            Action::Distribute => format!("Key distributed to {host}"),
            Action::Rotate => format!("Key rotated on {host}"),
            Action::Revoke => format!("Key revoked from {host}"),
        }
    }

    fn failed(&self, host: &str) -> String {
        match self {
            Action::Distribute => format!("Failed to distribute key to {host}"),
            Action::Rotate => format!("Failed to rotate key on {host}"),
            Action::Revoke => format!("Failed to revoke key from {host}"),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Distribute => write!(f, "distribute"),
            Action::Rotate => write!(f, "rotate"),
            Action::Revoke => write!(f, "revoke"),
        }
    }
}

/// What happened on a single host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOutcome {
    /// The authorized keys file was rewritten
    Changed,
    /// Nothing to do, the file was left alone
    Unchanged(String),
    /// Connection, authentication or command failure
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostReport {
    pub name: String,
    pub outcome: HostOutcome,
}

/// Outcome of one operation across the fleet, in server order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetReport {
    pub action: Action,
    pub hosts: Vec<HostReport>,
}

impl FleetReport {
    pub fn failed(&self) -> usize {
        self.hosts
            .iter()
            .filter(|h| matches!(h.outcome, HostOutcome::Failed(_)))
            .count()
    }

    pub fn succeeded(&self) -> usize {
        self.hosts.len() - self.failed()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

/// Result of editing one authorized keys file
enum Edit {
    Write,
    Skip(String),
}

/// Runs key lifecycle operations over a [`Connector`]
pub struct KeyManager<C: Connector> {
    connector: C,
}

impl<C: Connector> KeyManager<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }

    /// Append the public key at `key_path` to every target.
    ///
    /// Unless `skip_present` is set the key is appended even if the host already has it.
    pub fn distribute(
        &self,
        targets: &[Target],
        key_path: &Path,
        skip_present: bool,
    ) -> Result<FleetReport> {
        let key = read_public_key(key_path)?;
        Ok(self.for_each_host(Action::Distribute, targets, |keys| {
            if skip_present && keys.contains(&key) {
                return Ok(Edit::Skip("key already present".to_string()));
            }
            keys.append(&key)?;
            Ok(Edit::Write)
        }))
    }

    /// Replace every entry of the old key with the new key.
    ///
    /// A host without the old key is left untouched and still counts as a success.
    pub fn rotate(
        &self,
        targets: &[Target],
        old_key_path: &Path,
        new_key_path: &Path,
    ) -> Result<FleetReport> {
        let old_key = read_public_key(old_key_path)?;
        let new_key = read_public_key(new_key_path)?;
        Ok(self.for_each_host(Action::Rotate, targets, |keys| {
            if keys.replace(&old_key, &new_key)? == 0 {
                return Ok(Edit::Skip("old key not present".to_string()));
            }
            Ok(Edit::Write)
        }))
    }

    /// Delete every entry of the key at `key_path`
    pub fn revoke(&self, targets: &[Target], key_path: &Path) -> Result<FleetReport> {
        let key = read_public_key(key_path)?;
        Ok(self.for_each_host(Action::Revoke, targets, |keys| {
            if keys.remove(&key) == 0 {
                return Ok(Edit::Skip("key not present".to_string()));
            }
            Ok(Edit::Write)
        }))
    }

    fn for_each_host<F>(&self, action: Action, targets: &[Target], edit: F) -> FleetReport
    where
        F: Fn(&mut AuthorizedKeys) -> Result<Edit>,
    {
        let hosts = targets
            .iter()
            .map(|target| {
                let outcome = match self.edit_host(target, &edit) {
                    Ok(Edit::Write) => {
                        info!("{}", action.done(&target.name));
                        HostOutcome::Changed
                    }
                    Ok(Edit::Skip(reason)) => {
                        match action {
                            Action::Distribute => {
                                info!("{} left unchanged: {reason}", target.name)
                            }
                            _ => warn!("{} left unchanged: {reason}", target.name),
                        }
                        HostOutcome::Unchanged(reason)
                    }
                    Err(err) => {
                        error!("{}: {:#}", action.failed(&target.name), err);
                        HostOutcome::Failed(format!("{err:#}"))
                    }
                };
                HostReport {
                    name: target.name.clone(),
                    outcome,
                }
            })
            .collect();
        FleetReport { action, hosts }
    }

    fn edit_host<F>(&self, target: &Target, edit: &F) -> Result<Edit>
    where
        F: Fn(&mut AuthorizedKeys) -> Result<Edit>,
    {
        let mut session = self.connector.connect(target)?;
        let result = edit_authorized_keys(&mut session, target, edit);
        if let Err(err) = session.close() {
            warn!("{err:#}");
        }
        result
    }
}

fn edit_authorized_keys<S, F>(session: &mut S, target: &Target, edit: &F) -> Result<Edit>
where
    S: Session,
    F: Fn(&mut AuthorizedKeys) -> Result<Edit>,
{
    let output = session
        .exec(READ_AUTHORIZED_KEYS, None)
        .with_context(|| format!("failed to read authorized keys of {}", target.name))?;
    let content = output_to_pretty_err(output, &target.name, READ_AUTHORIZED_KEYS)?;
    let mut keys = AuthorizedKeys::parse(&content);

    let change = edit(&mut keys)?;
    if let Edit::Write = change {
        let rendered = keys.render();
        let output = session
            .exec(WRITE_AUTHORIZED_KEYS, Some(&rendered))
            .with_context(|| format!("failed to write authorized keys of {}", target.name))?;
        output_to_pretty_err(output, &target.name, WRITE_AUTHORIZED_KEYS)?;
    }
    Ok(change)
}

