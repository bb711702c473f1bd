use anyhow::{bail, Context, Result};
use serde_derive::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use toml_example::TomlExample;

use crate::keys::DEFAULT_RSA_BITS;
use crate::openssh::SshOptions;
use crate::ssh::Target;

/// Smallest rsa key we are willing to generate
const MIN_RSA_BITS: u32 = 2048;

#[derive(TomlExample, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Options applied to every ssh connection
    #[serde(default)]
    #[toml_example(nesting)]
    ssh: SshConfig,

    /// Key pair generation
    #[serde(default)]
    #[toml_example(nesting)]
    keygen: KeygenConfig,

    /// Named hosts. A `--servers` entry matching a name connects to that host's hostname and port,
    /// any other entry is used as a hostname as is.
    #[serde(default)]
    #[toml_example(nesting)]
    hosts: HashMap<String, HostConfig>,
}

#[derive(Debug, Default, Deserialize, TomlExample)]
#[serde(deny_unknown_fields)]
struct SshConfig {
    /// Port used for hosts that do not set one
    #[serde(default)]
    #[toml_example(default = 22)]
    port: Option<u16>,
    /// Seconds to wait for a connection, the ssh client default applies if unset
    #[serde(default)]
    #[toml_example(default = 10)]
    connect_timeout: Option<u64>,
    /// Private key offered for public key authentication
    #[serde(default)]
    #[toml_example(default = "~/.ssh/id_ed25519")]
    identity_file: Option<PathBuf>,
    /// Known hosts file new host keys are learned into
    #[serde(default)]
    #[toml_example(default = "~/.ssh/known_hosts")]
    known_hosts_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, TomlExample)]
#[serde(deny_unknown_fields)]
struct KeygenConfig {
    /// Bit length of generated rsa keys
    #[serde(default)]
    #[toml_example(default = 2048)]
    rsa_bits: Option<u32>,
}

#[derive(Debug, Default, Deserialize, TomlExample)]
#[serde(deny_unknown_fields)]
struct HostConfig {
    /// Hostname or ip address to connect to
    #[toml_example(default = "192.168.0.10")]
    hostname: String,
    /// SSH port of this host
    #[serde(default)]
    #[toml_example(default = 2222)]
    port: Option<u16>,
}

/// A host from the inventory
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Host {
    /// Name identifying the host
    pub name: String,
    /// Hostname or ip address to connect to
    pub hostname: String,
    /// SSH port, falls back to the `[ssh]` port
    pub port: Option<u16>,
}

/// Validated configuration
#[derive(Debug, PartialEq, Eq)]
pub struct Config {
    /// Hosts as defined in the configuration
    pub hosts: BTreeMap<String, Host>,
    /// Options for the ssh client
    pub ssh: SshOptions,
    /// Port for hosts without their own
    pub default_port: Option<u16>,
    /// Bit length of generated rsa keys
    pub rsa_bits: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hosts: BTreeMap::new(),
            ssh: SshOptions::default(),
            default_port: None,
            rsa_bits: DEFAULT_RSA_BITS,
        }
    }
}

impl Config {
    /// Resolve command line server names into connection targets, keeping their order
    pub fn targets(
        &self,
        servers: &[String],
        username: &str,
        password: Option<&str>,
    ) -> Result<Vec<Target>> {
        if !is_ssh_word(username) {
            bail!("invalid username: {username:?}");
        }
        servers
            .iter()
            .map(|name| {
                let (hostname, port) = match self.hosts.get(name) {
                    Some(host) => (host.hostname.clone(), host.port.or(self.default_port)),
                    None if is_ssh_word(name) => (name.clone(), self.default_port),
                    None => bail!("invalid server: {name:?}"),
                };
                Ok(Target {
                    name: name.clone(),
                    hostname,
                    username: username.to_string(),
                    port,
                    password: password.map(str::to_string),
                })
            })
            .collect()
    }
}

/// Usable as part of an ssh destination without being taken for an option
fn is_ssh_word(word: &str) -> bool {
    !word.is_empty() && !word.starts_with('-') && !word.contains(char::is_whitespace)
}

fn validate_host(name: &str, host: &HostConfig) -> Result<Host> {
    let hostname = host.hostname.trim();
    if hostname.is_empty() {
        bail!("host {name} has an empty hostname");
    }
    if !is_ssh_word(hostname) {
        bail!("host {name} has an invalid hostname: {hostname}");
    }
    Ok(Host {
        name: name.to_string(),
        hostname: hostname.to_string(),
        port: host.port,
    })
}

/// Parse toml configuration
pub fn parse_config(content: &str) -> Result<Config> {
    let config: ConfigFile = toml::from_str(content)?;

    let hosts = config
        .hosts
        .iter()
        .map(|(name, host)| Ok((name.to_string(), validate_host(name, host)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;

    let rsa_bits = config.keygen.rsa_bits.unwrap_or(DEFAULT_RSA_BITS);
    if rsa_bits < MIN_RSA_BITS {
        bail!("keygen.rsa_bits must be at least {MIN_RSA_BITS}, got {rsa_bits}");
    }

    Ok(Config {
        hosts,
        ssh: SshOptions {
            connect_timeout: config.ssh.connect_timeout,
            identity_file: config.ssh.identity_file,
            known_hosts_file: config.ssh.known_hosts_file,
        },
        default_port: config.ssh.port,
        rsa_bits,
    })
}

/// Load configuration from path
pub fn load_configuration(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path).context("Cannot read file")?;
    parse_config(&content)
}

#[cfg(test)]
pub(crate) const TEST_CONFIG: &str = r#"
[ssh]
port = 2200
connect_timeout = 5
identity_file = "~/.ssh/fleet_ed25519"

[keygen]
rsa_bits = 3072

[hosts.web-00]
hostname = "192.168.0.10"

[hosts.db-00]
hostname = "db-00.internal"
port = 2222
"#;

#[test]
pub fn test_parse_config() -> Result<()> {
    let config = parse_config(TEST_CONFIG)?;
    assert_eq!(config.hosts.len(), 2);
    assert_eq!(config.hosts["web-00"].hostname, "192.168.0.10");
    assert_eq!(config.hosts["db-00"].port, Some(2222));
    assert_eq!(config.default_port, Some(2200));
    assert_eq!(config.ssh.connect_timeout, Some(5));
    assert_eq!(
        config.ssh.identity_file,
        Some(PathBuf::from("~/.ssh/fleet_ed25519"))
    );
    assert_eq!(config.ssh.known_hosts_file, None);
    assert_eq!(config.rsa_bits, 3072);
    Ok(())
}

#[test]
pub fn test_parse_empty_config() -> Result<()> {
    assert_eq!(parse_config("")?, Config::default());
    Ok(())
}

#[test]
pub fn test_parse_config_with_redundant_fields() {
    let parse_result = parse_config(&format!("{}\nredundant = 111", TEST_CONFIG));
    assert!(parse_result.is_err());
}

#[test]
pub fn test_reject_weak_rsa_keys() {
    assert!(parse_config("[keygen]\nrsa_bits = 1024\n").is_err());
}

#[test]
pub fn test_reject_invalid_hostname() {
    assert!(parse_config("[hosts.evil]\nhostname = \"-oProxyCommand=sh\"\n").is_err());
    assert!(parse_config("[hosts.blank]\nhostname = \" \"\n").is_err());
}

#[test]
pub fn test_targets_keep_order_and_resolve_inventory() -> Result<()> {
    let config = parse_config(TEST_CONFIG)?;
    let servers = ["db-00", "10.1.1.1", "web-00"].map(String::from);
    let targets = config.targets(&servers, "deploy", Some("secret"))?;

    let names = targets.iter().map(|t| t.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, ["db-00", "10.1.1.1", "web-00"]);
    assert_eq!(targets[0].hostname, "db-00.internal");
    assert_eq!(targets[0].port, Some(2222));
    assert_eq!(targets[1].hostname, "10.1.1.1");
    assert_eq!(targets[1].port, Some(2200));
    assert_eq!(targets[2].destination(), "deploy@192.168.0.10");
    assert!(targets
        .iter()
        .all(|t| t.password.as_deref() == Some("secret")));
    Ok(())
}

#[test]
pub fn test_example_parses() -> Result<()> {
    use toml_example::traits::TomlExample as _;
    parse_config(&ConfigFile::toml_example())?;
    Ok(())
}

#[test]
pub fn test_targets_reject_option_like_words() -> Result<()> {
    let config = parse_config(TEST_CONFIG)?;
    let servers = ["web-00".to_string()];
    assert!(config.targets(&servers, "-oProxyCommand=sh", None).is_err());
    assert!(config.targets(&servers, "", None).is_err());

    let servers = ["web-00", "-oProxyCommand=sh"].map(String::from);
    assert!(config.targets(&servers, "deploy", None).is_err());
    let servers = ["db 00".to_string()];
    assert!(config.targets(&servers, "deploy", None).is_err());
    Ok(())
}
