//! SSH key material: generation, parsing, fingerprints
//!
//! Wraps the `russh::keys` types so the rest of the fabric never touches
//! raw encodings. Hubs use a [`KeyPair`] as their host key; agents use one
//! to authenticate. Public keys travel as `russh::keys::PublicKey` and are
//! indexed everywhere by their SHA-256 fingerprint.

use std::path::Path;

use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{decode_secret_key, HashAlg, PrivateKey, PublicKey};

use crate::errors::Error;

/// An SSH keypair usable as a hub host key or an agent identity key.
#[derive(Clone)]
pub struct KeyPair {
    inner: PrivateKey,
}

impl KeyPair {
    /// Generate a fresh Ed25519 keypair.
    pub fn generate() -> Result<Self, Error> {
        let inner = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|e| Error::key(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Generate an RSA keypair of the given modulus size (1024, 2048, or
    /// 4096 bits), for interoperating with deployments that still pin RSA.
    pub fn generate_rsa(bits: usize) -> Result<Self, Error> {
        if !matches!(bits, 1024 | 2048 | 4096) {
            return Err(Error::key(format!("unsupported RSA key size {bits}")));
        }
        let pair = RsaKeypair::random(&mut OsRng, bits).map_err(|e| Error::key(e.to_string()))?;
        let inner =
            PrivateKey::new(KeypairData::Rsa(pair), "").map_err(|e| Error::key(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Parse a private key from its PEM encoding (OpenSSH or PKCS#1/#8).
    pub fn parse(pem: &str) -> Result<Self, Error> {
        let inner = decode_secret_key(pem, None).map_err(|e| Error::key(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Parse a private key from a file on disk.
    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let pem = std::fs::read_to_string(path)?;
        Self::parse(&pem)
    }

    /// The public half of this keypair.
    pub fn public_key(&self) -> PublicKey {
        self.inner.public_key().clone()
    }

    /// SHA-256 fingerprint of the public half, in `SHA256:…` form.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key())
    }

    /// Encode the private key as OpenSSH PEM.
    pub fn encode(&self) -> Result<String, Error> {
        let pem = self
            .inner
            .to_openssh(LineEnding::LF)
            .map_err(|e| Error::key(e.to_string()))?;
        Ok(pem.to_string())
    }

    pub(crate) fn private(&self) -> &PrivateKey {
        &self.inner
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.inner.algorithm())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// SHA-256 fingerprint of a public key, in `SHA256:…` form.
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Parse a public key from its one-line OpenSSH encoding
/// (`ssh-ed25519 AAAA… comment`).
pub fn parse_public_key(line: &str) -> Result<PublicKey, Error> {
    PublicKey::from_openssh(line).map_err(|e| Error::key(e.to_string()))
}

/// Encode a public key in one-line OpenSSH form.
pub fn encode_public_key(key: &PublicKey) -> Result<String, Error> {
    key.to_openssh().map_err(|e| Error::key(e.to_string()))
}

/// Read an OpenSSH `authorized_keys` file, invoking `f` once per entry
/// with the comment column as the identity and the parsed key.
///
/// Blank lines and `#` comments are skipped. Returns the number of
/// entries consumed. Used to bootstrap a hub's
/// [`KeyMaster`](crate::KeyMaster) from disk.
pub fn read_authorized_keys(
    path: impl AsRef<Path>,
    mut f: impl FnMut(&str, &PublicKey),
) -> Result<usize, Error> {
    let contents = std::fs::read_to_string(&path)?;
    let mut seen = 0;
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let key = PublicKey::from_openssh(line).map_err(|e| {
            Error::key(format!(
                "{}:{}: {e}",
                path.as_ref().display(),
                lineno + 1
            ))
        })?;
        f(key.comment().as_ref(), &key);
        seen += 1;
    }
    Ok(seen)
}
