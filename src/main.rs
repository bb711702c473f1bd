//! keyfleet - a cli for managing ssh keys across a fleet of linux servers

#![deny(missing_docs)]

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use keyfleet::config::ConfigFile;
use keyfleet::{
    generate_key_pair, load_configuration, Config, FleetReport, HostOutcome, KeyManager, OpenSsh,
    VERSION,
};
use log::{debug, info, LevelFilter};
use logger::{FleetLogger, LogFormat};
use std::path::{Path, PathBuf};
use toml_example::traits::TomlExample;

const DEFAULT_CONFIG: &str = "keyfleet.toml";

#[derive(clap::Args, PartialEq, Debug, Clone)]
struct GenerateArgs {
    /// Path to save the key pair, the public key gets a `.pub` suffix
    #[clap(long, default_value = "id_rsa")]
    key_path: PathBuf,

    /// Overwrite an existing key pair
    #[clap(long, default_value = "false")]
    force: bool,

    /// Comment appended to the public key
    #[clap(long, default_value = "")]
    comment: String,
}

#[derive(clap::Args, PartialEq, Clone)]
struct ServerArgs {
    /// List of server IPs or hostnames, or host names from the configuration
    #[clap(long, required = true, num_args = 1.., value_delimiter = ',')]
    servers: Vec<String>,

    /// Username for SSH login
    #[clap(long)]
    username: String,

    /// Password for SSH login
    #[clap(long, env = "KEYFLEET_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

// keeps the password out of error messages
impl std::fmt::Debug for ServerArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerArgs")
            .field("servers", &self.servers)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(clap::Args, PartialEq, Debug, Clone)]
struct DistributeArgs {
    #[clap(flatten)]
    servers: ServerArgs,

    /// Path to the public key
    #[clap(long)]
    key_path: PathBuf,

    /// Leave hosts that already have the key alone instead of appending it again
    #[clap(long, default_value = "false")]
    skip_present: bool,
}

#[derive(clap::Args, PartialEq, Debug, Clone)]
struct RotateArgs {
    #[clap(flatten)]
    servers: ServerArgs,

    /// Path to the old public key
    #[clap(long)]
    old_key_path: PathBuf,

    /// Path to the new public key
    #[clap(long)]
    new_key_path: PathBuf,
}

#[derive(clap::Args, PartialEq, Debug, Clone)]
struct RevokeArgs {
    #[clap(flatten)]
    servers: ServerArgs,

    /// Path to the public key to revoke
    #[clap(long)]
    key_path: PathBuf,
}

/// Subcommand to run
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(clap::Subcommand, PartialEq, Debug, Clone)]
enum Command {
    /// Generate a new SSH key pair
    Generate(GenerateArgs),
    /// Distribute a public key to servers
    Distribute(DistributeArgs),
    /// Rotate an old SSH key with a new one
    Rotate(RotateArgs),
    /// Revoke an SSH key from servers
    Revoke(RevokeArgs),
    /// Print an example keyfleet.toml
    GenerateExample,
}

#[derive(Parser)]
#[clap(author, version, about = "SSH key manager for fleets of Linux servers", long_about = None)]
struct Args {
    /// configuration file to load
    #[clap(long, default_value = DEFAULT_CONFIG, env = "KEYFLEET_CONFIG")]
    config: PathBuf,

    /// log level: off, error, warn, info, debug or trace
    #[clap(long, default_value = "info", env = "KEYFLEET_LOG_LEVEL")]
    log_level: LevelFilter,

    /// log output format
    #[clap(long, value_enum, default_value_t = LogFormat::Text, env = "KEYFLEET_LOG_FORMAT")]
    log_format: LogFormat,

    #[clap(subcommand)]
    action: Option<Command>,
}

/// A missing default configuration is fine, a missing explicit one is not
fn configuration(path: &Path) -> Result<Config> {
    if path == Path::new(DEFAULT_CONFIG) && !path.exists() {
        return Ok(Config::default());
    }
    load_configuration(path)
        .with_context(|| format!("failed to parse configuration file: {}", path.display()))
}

fn key_manager(config: &Config) -> KeyManager<OpenSsh> {
    KeyManager::new(OpenSsh::new(config.ssh.clone()))
}

fn summarize(report: FleetReport) -> Result<()> {
    info!(
        "{}: {} of {} hosts succeeded",
        report.action,
        report.succeeded(),
        report.hosts.len()
    );
    if report.is_success() {
        return Ok(());
    }
    let failed = report
        .hosts
        .iter()
        .filter(|host| matches!(host.outcome, HostOutcome::Failed(_)))
        .map(|host| host.name.as_str())
        .collect::<Vec<_>>();
    bail!(
        "{} failed on {} of {} hosts: {}",
        report.action,
        failed.len(),
        report.hosts.len(),
        failed.join(", ")
    )
}

/// The keyfleet program entry point
pub fn main() -> Result<()> {
    let args = Args::parse();
    FleetLogger::init(args.log_format, args.log_level);
    debug!("{VERSION}");

    let action = match args.action {
        Some(action) => action,
        None => {
            Args::command().print_help()?;
            return Ok(());
        }
    };

    match action {
        Command::GenerateExample => {
            println!("{}", ConfigFile::toml_example());
            Ok(())
        }
        Command::Generate(generate_args) => {
            let config = configuration(&args.config)?;
            generate_key_pair(
                &generate_args.key_path,
                config.rsa_bits,
                &generate_args.comment,
                generate_args.force,
            )
            .map(|_| ())
        }
        Command::Distribute(distribute_args) => {
            let config = configuration(&args.config)?;
            let servers = &distribute_args.servers;
            let targets = config.targets(
                &servers.servers,
                &servers.username,
                servers.password.as_deref(),
            )?;
            let report = key_manager(&config).distribute(
                &targets,
                &distribute_args.key_path,
                distribute_args.skip_present,
            )?;
            summarize(report)
        }
        Command::Rotate(rotate_args) => {
            let config = configuration(&args.config)?;
            let servers = &rotate_args.servers;
            let targets = config.targets(
                &servers.servers,
                &servers.username,
                servers.password.as_deref(),
            )?;
            let report = key_manager(&config).rotate(
                &targets,
                &rotate_args.old_key_path,
                &rotate_args.new_key_path,
            )?;
            summarize(report)
        }
        Command::Revoke(revoke_args) => {
            let config = configuration(&args.config)?;
            let servers = &revoke_args.servers;
            let targets = config.targets(
                &servers.servers,
                &servers.username,
                servers.password.as_deref(),
            )?;
            let report = key_manager(&config).revoke(&targets, &revoke_args.key_path)?;
            summarize(report)
        }
    }
}
