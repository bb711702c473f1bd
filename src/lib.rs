//! Manage SSH public keys across a fleet of Linux hosts.

pub use config::{load_configuration, parse_config, Config, Host};
pub use fleet::{Action, FleetReport, HostOutcome, HostReport, KeyManager};
pub use keys::{generate_key_pair, public_key_path, read_public_key};
pub use openssh::{OpenSsh, SshOptions};

pub mod authorized_keys;
mod command;
pub mod config;
pub mod fleet;
pub mod keys;
pub mod openssh;
pub mod ssh;

pub const VERSION: &str = concat!("keyfleet v", env!("CARGO_PKG_VERSION"));
