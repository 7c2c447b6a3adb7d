//! Ed25519 key material: head keypair bootstrap and the node-side ring of
//! trusted head public keys.
//!
//! Keys travel as PEM (PKCS#8 private, SPKI public). A key id is the first
//! 8 bytes of the SHA-256 of the SPKI DER, hex-encoded; it names keys in the
//! envelope and in enrollment filenames without revealing anything secret.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// The head's signing identity.
pub struct HeadKeypair {
    pub signing: SigningKey,
    pub key_id: String,
    pub public_pem: String,
}

pub fn key_id_for(verifying: &VerifyingKey) -> Result<String> {
    let der = verifying
        .to_public_key_der()
        .context("encode public key DER")?;
    let digest = Sha256::digest(der.as_bytes());
    Ok(hex::encode(&digest[..8]))
}

/// Load the head keypair, generating and persisting it on first start.
/// The private key file is written with mode 0600.
pub fn ensure_keypair(private_path: &Path, public_path: &Path) -> Result<HeadKeypair> {
    if let Some(parent) = private_path.parent() {
        fs::create_dir_all(parent).context("create head key directory")?;
    }

    let signing = if private_path.exists() {
        let pem = fs::read_to_string(private_path).context("read head private key")?;
        SigningKey::from_pkcs8_pem(&pem).context("parse head private key PEM")?
    } else {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let signing = SigningKey::from_bytes(&seed);
        let pem = signing
            .to_pkcs8_pem(LineEnding::LF)
            .context("encode head private key PEM")?;
        fs::write(private_path, pem.as_bytes()).context("write head private key")?;
        restrict_permissions(private_path)?;
        tracing::info!(path = %private_path.display(), "generated head signing key");
        signing
    };

    let verifying = signing.verifying_key();
    let public_pem = verifying
        .to_public_key_pem(LineEnding::LF)
        .context("encode head public key PEM")?;
    if !public_path.exists() {
        if let Some(parent) = public_path.parent() {
            fs::create_dir_all(parent).context("create head public key directory")?;
        }
        fs::write(public_path, &public_pem).context("write head public key")?;
    }

    Ok(HeadKeypair {
        key_id: key_id_for(&verifying)?,
        signing,
        public_pem,
    })
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .context("restrict private key permissions")
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// One trusted head public key.
#[derive(Clone)]
pub struct TrustedKey {
    pub key_id: String,
    pub verifying: VerifyingKey,
}

fn trusted_key_from_pem(pem: &str) -> Result<TrustedKey> {
    let verifying = VerifyingKey::from_public_key_pem(pem).context("parse public key PEM")?;
    Ok(TrustedKey {
        key_id: key_id_for(&verifying)?,
        verifying,
    })
}

/// Hot-reloadable set of trusted head public keys.
///
/// Sources come from `HEAD_PUBLIC_KEYS` (paths or literal PEM) plus any PEM
/// files enrolled into the trust directory. A source path that does not exist
/// yet is skipped, so a node can start before the head has written its key
/// file; `reload` picks it up later (on SIGHUP or on a lookup miss).
pub struct KeyRing {
    sources: Vec<String>,
    trust_dir: PathBuf,
    ring: ArcSwap<Vec<TrustedKey>>,
}

impl KeyRing {
    pub fn load(sources: Vec<String>, trust_dir: PathBuf) -> Result<Self> {
        let ring = Self {
            sources,
            trust_dir,
            ring: ArcSwap::from_pointee(Vec::new()),
        };
        ring.reload()?;
        Ok(ring)
    }

    /// Re-read every source. Returns the number of trusted keys.
    pub fn reload(&self) -> Result<usize> {
        let mut keys: Vec<TrustedKey> = Vec::new();
        for source in &self.sources {
            if source.contains("-----BEGIN") {
                keys.push(trusted_key_from_pem(source)?);
                continue;
            }
            let path = Path::new(source);
            if !path.exists() {
                tracing::debug!(path = %source, "trusted key source not present yet, skipping");
                continue;
            }
            let pem = fs::read_to_string(path)
                .with_context(|| format!("read trusted key {source}"))?;
            keys.push(
                trusted_key_from_pem(&pem)
                    .with_context(|| format!("invalid trusted key {source}"))?,
            );
        }
        if self.trust_dir.is_dir() {
            let mut entries: Vec<PathBuf> = fs::read_dir(&self.trust_dir)
                .context("read trust directory")?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "pem"))
                .collect();
            entries.sort();
            for path in entries {
                let pem = fs::read_to_string(&path)
                    .with_context(|| format!("read enrolled key {}", path.display()))?;
                match trusted_key_from_pem(&pem) {
                    Ok(key) => keys.push(key),
                    Err(error) => {
                        tracing::warn!(path = %path.display(), %error, "skipping unparsable enrolled key");
                    }
                }
            }
        }
        keys.dedup_by(|a, b| a.key_id == b.key_id);
        let count = keys.len();
        self.ring.store(Arc::new(keys));
        Ok(count)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.load().is_empty()
    }

    pub fn len(&self) -> usize {
        self.ring.load().len()
    }

    /// Look up a key by id, retrying once after a reload so freshly written
    /// key files are honored without a restart.
    pub fn find(&self, key_id: &str) -> Option<TrustedKey> {
        if let Some(key) = self.find_loaded(key_id) {
            return Some(key);
        }
        if let Err(error) = self.reload() {
            tracing::warn!(%error, "trusted key reload failed");
            return None;
        }
        self.find_loaded(key_id)
    }

    fn find_loaded(&self, key_id: &str) -> Option<TrustedKey> {
        self.ring
            .load()
            .iter()
            .find(|key| key.key_id == key_id)
            .cloned()
    }

    /// Persist an enrolled head key and add it to the live ring.
    pub fn install(&self, pem: &str) -> Result<TrustedKey> {
        let key = trusted_key_from_pem(pem)?;
        fs::create_dir_all(&self.trust_dir).context("create trust directory")?;
        let path = self.trust_dir.join(format!("head-{}.pem", key.key_id));
        fs::write(&path, pem.trim_end().to_string() + "\n")
            .with_context(|| format!("write enrolled key {}", path.display()))?;
        self.reload()?;
        tracing::info!(key_id = %key.key_id, "installed head public key");
        Ok(key)
    }
}

/// Generate a fresh keypair without touching disk (test and enrollment use).
pub fn generate_keypair() -> Result<HeadKeypair> {
    let mut seed = [0u8; 32];
    rand::rng().fill_bytes(&mut seed);
    let signing = SigningKey::from_bytes(&seed);
    let verifying = signing.verifying_key();
    Ok(HeadKeypair {
        key_id: key_id_for(&verifying)?,
        public_pem: verifying
            .to_public_key_pem(LineEnding::LF)
            .context("encode public key PEM")?,
        signing,
    })
}
