use anyhow::{bail, Context, Result};
use log::info;
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::{LineEnding, PrivateKey, PublicKey};
use std::fs::{self, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Bit length of generated rsa keys unless configured otherwise
pub const DEFAULT_RSA_BITS: u32 = 2048;

/// Location of the public half of the key pair stored at `private_key`
pub fn public_key_path(private_key: &Path) -> PathBuf {
    let mut path = private_key.as_os_str().to_owned();
    path.push(".pub");
    PathBuf::from(path)
}

fn write_key_file(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .with_context(|| format!("cannot open {} for writing", path.display()))?;
    // mode only applies to newly created files
    fs::set_permissions(path, Permissions::from_mode(mode))
        .with_context(|| format!("cannot set permissions of {}", path.display()))?;
    file.write_all(content)
        .with_context(|| format!("cannot write {}", path.display()))
}

/// Generate an rsa key pair, the private key goes to `path` and the public key to `path.pub`
pub fn generate_key_pair(
    path: &Path,
    rsa_bits: u32,
    comment: &str,
    force: bool,
) -> Result<PathBuf> {
    if !force && path.exists() {
        bail!(
            "{} already exists, pass --force to overwrite it",
            path.display()
        );
    }
    let mut rng = rand::thread_rng();
    let keypair = RsaKeypair::random(&mut rng, rsa_bits as usize)
        .with_context(|| format!("failed to generate {rsa_bits} bit rsa key"))?;
    let private_key = PrivateKey::new(KeypairData::from(keypair), comment)
        .context("failed to assemble private key")?;

    let private_pem = private_key
        .to_openssh(LineEnding::LF)
        .context("failed to encode private key")?;
    let public_line = private_key
        .public_key()
        .to_openssh()
        .context("failed to encode public key")?;

    let public_path = public_key_path(path);
    write_key_file(path, private_pem.as_bytes(), 0o600)?;
    write_key_file(&public_path, format!("{public_line}\n").as_bytes(), 0o644)?;

    info!(
        "SSH key pair generated at {} and {}",
        path.display(),
        public_path.display()
    );
    Ok(public_path)
}

/// Read a public key file in `<algorithm> <base64> [comment]` format
pub fn read_public_key(path: &Path) -> Result<PublicKey> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("cannot read public key {}", path.display()))?;
    PublicKey::from_openssh(content.trim())
        .with_context(|| format!("{} does not contain an OpenSSH public key", path.display()))
}
