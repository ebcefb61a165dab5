//! At-rest envelope for uploaded documents.
//!
//! One secret per process: an age X25519 identity. Sealing goes through the
//! identity's recipient with fresh ephemeral key material, so two seals of the
//! same plaintext never match. Opening authenticates every payload chunk and
//! returns nothing unless the whole stream verifies.

use std::env;
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use age::{x25519, Decryptor, Encryptor};
use secrecy::SecretString;
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};

pub const KEY_ENV_VAR: &str = "RISKSHIELD_ENCRYPTION_KEY";
const ENVELOPE_MAGIC: &[u8] = b"riskshield-envelope/v1\n";
const KEY_ID_LEN: usize = 16;

pub struct EncryptionKey {
    identity: x25519::Identity,
    recipient: x25519::Recipient,
    key_id: String,
}

impl EncryptionKey {
    pub fn generate() -> Self {
        Self::from_identity(x25519::Identity::generate())
    }

    pub fn parse(secret: &str) -> Result<Self> {
        let identity = x25519::Identity::from_str(secret.trim()).map_err(|_| {
            PipelineError::Configuration("encryption key is not a valid age secret key".into())
        })?;
        Ok(Self::from_identity(identity))
    }

    /// Reads the key from `RISKSHIELD_ENCRYPTION_KEY`. `Ok(None)` when unset.
    pub fn from_env() -> Result<Option<Self>> {
        match env::var(KEY_ENV_VAR) {
            Ok(value) if !value.trim().is_empty() => Self::parse(&value).map(Some),
            _ => Ok(None),
        }
    }

    fn from_identity(identity: x25519::Identity) -> Self {
        let recipient = identity.to_public();
        let key_id = key_id_for(&recipient);
        Self {
            identity,
            recipient,
            key_id,
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Secret encoding suitable for `RISKSHIELD_ENCRYPTION_KEY`.
    pub fn to_secret(&self) -> SecretString {
        self.identity.to_string()
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key_id", &self.key_id)
            .field("secret", &"[redacted]")
            .finish()
    }
}

fn key_id_for(recipient: &x25519::Recipient) -> String {
    let digest = Sha256::digest(recipient.to_string().as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(KEY_ID_LEN);
    id
}

#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub key_id: String,
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(ENVELOPE_MAGIC.len() + KEY_ID_LEN + 1 + self.ciphertext.len());
        out.extend_from_slice(ENVELOPE_MAGIC);
        out.extend_from_slice(self.key_id.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let rest = bytes
            .strip_prefix(ENVELOPE_MAGIC)
            .ok_or_else(|| PipelineError::Authentication("not a riskshield envelope".into()))?;
        let newline = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| PipelineError::Authentication("truncated envelope header".into()))?;
        let key_id = std::str::from_utf8(&rest[..newline])
            .map_err(|_| PipelineError::Authentication("malformed key id".into()))?
            .to_string();
        Ok(Self {
            key_id,
            ciphertext: rest[newline + 1..].to_vec(),
        })
    }
}

impl fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedBlob")
            .field("key_id", &self.key_id)
            .field("len", &self.ciphertext.len())
            .finish()
    }
}

pub fn encrypt(plaintext: &[u8], key: &EncryptionKey) -> Result<EncryptedBlob> {
    let encryptor = Encryptor::with_recipients(vec![Box::new(key.recipient.clone())])
        .ok_or_else(|| PipelineError::Configuration("missing recipients".into()))?;
    let mut ciphertext = Vec::with_capacity(plaintext.len() + 256);
    let mut writer = encryptor
        .wrap_output(&mut ciphertext)
        .map_err(|e| PipelineError::Encryption(e.to_string()))?;
    writer.write_all(plaintext)?;
    writer.finish()?;
    Ok(EncryptedBlob {
        key_id: key.key_id.clone(),
        ciphertext,
    })
}

pub fn decrypt(blob: &EncryptedBlob, key: &EncryptionKey) -> Result<Vec<u8>> {
    if blob.key_id != key.key_id {
        return Err(PipelineError::Authentication(
            "envelope was sealed with a different key".into(),
        ));
    }
    let decryptor = match Decryptor::new(blob.ciphertext.as_slice()).map_err(auth_error)? {
        Decryptor::Recipients(d) => d,
        _ => {
            return Err(PipelineError::Authentication(
                "unsupported envelope recipient type".into(),
            ))
        }
    };
    let mut reader = decryptor
        .decrypt(std::iter::once(&key.identity as &dyn age::Identity))
        .map_err(auth_error)?;
    let mut plaintext = Vec::new();
    if let Err(err) = reader.read_to_end(&mut plaintext) {
        // the partially verified prefix is dropped with `plaintext`
        return Err(PipelineError::Authentication(err.to_string()));
    }
    Ok(plaintext)
}

fn auth_error(err: age::DecryptError) -> PipelineError {
    PipelineError::Authentication(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn roundtrips_plaintext() {
        let key = EncryptionKey::generate();
        let blob = encrypt(b"We require MFA for all accounts", &key).unwrap();
        assert_eq!(
            decrypt(&blob, &key).unwrap(),
            b"We require MFA for all accounts".to_vec()
        );
    }

    #[test]
    fn sealing_is_not_deterministic() {
        let key = EncryptionKey::generate();
        let a = encrypt(b"same bytes", &key).unwrap();
        let b = encrypt(b"same bytes", &key).unwrap();
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let key = EncryptionKey::generate();
        let other = EncryptionKey::generate();
        let blob = encrypt(b"payload", &key).unwrap();
        let err = decrypt(&blob, &other).unwrap_err();
        assert!(matches!(err, PipelineError::Authentication(_)));

        // same key id forged onto a blob sealed for another identity
        let forged = EncryptedBlob {
            key_id: other.key_id().to_string(),
            ciphertext: blob.ciphertext.clone(),
        };
        assert!(matches!(
            decrypt(&forged, &other),
            Err(PipelineError::Authentication(_))
        ));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = EncryptionKey::generate();
        let mut blob = encrypt(&vec![7u8; 4096], &key).unwrap();
        let last = blob.ciphertext.len() - 1;
        blob.ciphertext[last] ^= 0x01;
        assert!(matches!(
            decrypt(&blob, &key),
            Err(PipelineError::Authentication(_))
        ));
    }

    #[test]
    fn envelope_bytes_roundtrip_and_reject_garbage() {
        let key = EncryptionKey::generate();
        let blob = encrypt(b"abc", &key).unwrap();
        let parsed = EncryptedBlob::from_bytes(&blob.to_bytes()).unwrap();
        assert_eq!(parsed, blob);
        assert!(EncryptedBlob::from_bytes(b"plain text").is_err());
    }

    #[test]
    fn parses_generated_secret_and_hides_it_in_debug() {
        let key = EncryptionKey::generate();
        let secret = key.to_secret();
        let parsed = EncryptionKey::parse(secret.expose_secret()).unwrap();
        assert_eq!(parsed.key_id(), key.key_id());
        assert!(!format!("{key:?}").contains(secret.expose_secret().as_str()));
        assert!(EncryptionKey::parse("not-a-key").is_err());
    }
}
