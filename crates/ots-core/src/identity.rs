//! Ephemeral host identity
//!
//! A fresh Ed25519 keypair is generated on every run and never written to
//! disk. The private half is handed to the SSH server in the OpenSSH
//! container format; the public half is printed as an authorized_keys /
//! known_hosts style line so it can be pinned by the connecting peer.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use ssh_key::private::{Ed25519Keypair, KeypairData};
use ssh_key::{HashAlg, LineEnding, PrivateKey, PublicKey};
use zeroize::Zeroizing;

use crate::error::StartupError;

/// Server-side keypair, valid for a single process run
pub struct HostIdentity {
    private_key: PrivateKey,
}

impl HostIdentity {
    /// Generate a new Ed25519 identity from the operating system's random source
    ///
    /// Fails if the random source cannot be read.
    pub fn generate() -> Result<Self, StartupError> {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng
            .try_fill_bytes(&mut seed[..])
            .map_err(|e| StartupError::KeyGeneration(e.to_string()))?;

        let keypair = Ed25519Keypair::from_seed(&seed);
        let private_key = PrivateKey::new(KeypairData::Ed25519(keypair), "")
            .map_err(|e| StartupError::KeyGeneration(e.to_string()))?;

        Ok(Self { private_key })
    }

    /// The private key
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// The public key
    pub fn public_key(&self) -> &PublicKey {
        self.private_key.public_key()
    }

    /// Encode the private key as an unencrypted `openssh-key-v1` PEM document
    /// (cipher "none", kdf "none", one keypair)
    pub fn encode_private_key_for_transport(&self) -> Result<Zeroizing<String>, StartupError> {
        self.private_key
            .to_openssh(LineEnding::LF)
            .map_err(|e| StartupError::KeyEncoding(e.to_string()))
    }

    /// Format the public key as `<algorithm> <base64-wire-key>`
    pub fn public_key_line(&self) -> Result<String, StartupError> {
        let line = self
            .public_key()
            .to_openssh()
            .map_err(|e| StartupError::KeyEncoding(e.to_string()))?;
        Ok(line.trim_end().to_string())
    }

    /// SHA256 fingerprint of the public key
    pub fn fingerprint(&self) -> String {
        self.public_key().fingerprint(HashAlg::Sha256).to_string()
    }

    /// Decode the transport container into the key type used by the SSH server
    pub fn to_russh_keypair(&self) -> Result<russh_keys::key::KeyPair, StartupError> {
        let pem = self.encode_private_key_for_transport()?;
        russh_keys::decode_secret_key(&pem, None)
            .map_err(|e| StartupError::KeyEncoding(e.to_string()))
    }
}

impl fmt::Debug for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostIdentity")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}
