//! Split-knowledge credential crypto.
//!
//! The 32-byte master key never leaves this process. Each stored
//! credential is encrypted under a key derived from (user, domain), so a
//! blob minted for `discord.com` cannot be opened with any other domain's
//! key — the domain is part of the key material, not a label.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, KeyInit, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha512;

use dotbot_domain::error::{Error, Result};

/// AES-256-GCM with the blob format's 16-byte IV.
type BlobCipher = AesGcm<Aes256, U16>;

/// Domain separation string baked into every derived key.
const KDF_INFO_PREFIX: &str = "dotbot-credential-v1:";

/// Stored blobs carry this prefix so the client can tell server-encrypted
/// values from legacy plaintext.
pub const BLOB_PREFIX: &str = "srv:";

const MASTER_KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Master key
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Load the master key, generating it on first start.
///
/// A key file of the wrong length aborts startup — regenerating would
/// silently invalidate every stored blob.
pub fn load_or_create_master_key(path: &std::path::Path) -> Result<[u8; MASTER_KEY_LEN]> {
    if path.exists() {
        let bytes = std::fs::read(path)?;
        let key: [u8; MASTER_KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            Error::Crypto(format!(
                "master key at {} is {} bytes, expected {MASTER_KEY_LEN}. \
                 Refusing to start: regenerating would invalidate all stored credentials. \
                 Restore the key from backup or delete every stored blob first.",
                path.display(),
                bytes.len()
            ))
        })?;
        return Ok(key);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut key = [0u8; MASTER_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    std::fs::write(path, key)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    {
        tracing::warn!(
            path = %path.display(),
            "platform ignores POSIX file modes; protect the master key file manually"
        );
    }

    tracing::info!(path = %path.display(), "generated new master key");
    Ok(key)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Blob format
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// JSON envelope inside the base64 blob. Short field names keep the
/// encoded blob compact.
#[derive(Debug, Serialize, Deserialize)]
struct BlobEnvelope {
    v: u8,
    u: String,
    d: String,
    iv: String,
    tag: String,
    ct: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CredentialCipher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CredentialCipher {
    master_key: [u8; MASTER_KEY_LEN],
}

impl CredentialCipher {
    pub fn new(master_key: [u8; MASTER_KEY_LEN]) -> Self {
        Self { master_key }
    }

    /// HKDF-SHA-512 over the master key: salt = user id, info = the
    /// version string plus the lowercased domain.
    fn derive_key(&self, user_id: &str, domain: &str) -> [u8; 32] {
        let info = format!("{KDF_INFO_PREFIX}{}", domain.to_lowercase());
        let hk = Hkdf::<Sha512>::new(Some(user_id.as_bytes()), &self.master_key);
        let mut okm = [0u8; 32];
        hk.expand(info.as_bytes(), &mut okm)
            .expect("32 bytes is a valid HKDF-SHA512 output length");
        okm
    }

    /// Encrypt a plaintext for (user, domain) into a `srv:` blob.
    pub fn encrypt(&self, plaintext: &str, user_id: &str, domain: &str) -> Result<String> {
        let domain = domain.to_lowercase();
        let key = self.derive_key(user_id, &domain);
        let cipher = BlobCipher::new_from_slice(&key)
            .map_err(|_| Error::Crypto("derived key has wrong length".into()))?;

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::<U16>::from_slice(&iv);

        let combined = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: &[],
                },
            )
            .map_err(|_| Error::Crypto("encryption failed".into()))?;
        let (ct, tag) = combined.split_at(combined.len() - TAG_LEN);

        let envelope = BlobEnvelope {
            v: 1,
            u: user_id.to_string(),
            d: domain,
            iv: hex::encode(iv),
            tag: hex::encode(tag),
            ct: hex::encode(ct),
        };
        let json = serde_json::to_string(&envelope)?;
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(json);
        Ok(format!("{BLOB_PREFIX}{encoded}"))
    }

    /// Decrypt a `srv:` blob. When `request_domain` is given it must equal
    /// the stored domain before derivation is even attempted.
    pub fn decrypt(&self, blob: &str, request_domain: Option<&str>) -> Result<String> {
        let envelope = parse_blob(blob)?;

        if let Some(requested) = request_domain {
            if requested.to_lowercase() != envelope.d {
                return Err(Error::DomainMismatch(format!(
                    "blob is scoped to '{}', request was for '{}'",
                    envelope.d, requested
                )));
            }
        }

        let key = self.derive_key(&envelope.u, &envelope.d);
        let cipher = BlobCipher::new_from_slice(&key)
            .map_err(|_| Error::Crypto("derived key has wrong length".into()))?;

        let iv = hex::decode(&envelope.iv).map_err(|_| Error::Crypto("bad IV hex".into()))?;
        if iv.len() != IV_LEN {
            return Err(Error::Crypto("bad IV length".into()));
        }
        let mut combined =
            hex::decode(&envelope.ct).map_err(|_| Error::Crypto("bad ciphertext hex".into()))?;
        let tag = hex::decode(&envelope.tag).map_err(|_| Error::Crypto("bad tag hex".into()))?;
        combined.extend_from_slice(&tag);

        let plaintext = cipher
            .decrypt(
                Nonce::<U16>::from_slice(&iv),
                Payload {
                    msg: &combined,
                    aad: &[],
                },
            )
            .map_err(|_| {
                Error::DomainMismatch("authentication failed: wrong domain or tampered blob".into())
            })?;
        String::from_utf8(plaintext).map_err(|_| Error::Crypto("plaintext is not UTF-8".into()))
    }
}

/// The domain a blob is scoped to, without decrypting. The proxy uses
/// this to verify the target host before touching key material.
pub fn blob_domain(blob: &str) -> Result<String> {
    Ok(parse_blob(blob)?.d)
}

fn parse_blob(blob: &str) -> Result<BlobEnvelope> {
    let encoded = blob
        .strip_prefix(BLOB_PREFIX)
        .ok_or_else(|| Error::Crypto("missing srv: prefix".into()))?;
    use base64::Engine;
    let json = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| Error::Crypto("bad base64".into()))?;
    let envelope: BlobEnvelope = serde_json::from_slice(&json)?;
    if envelope.v != 1 {
        return Err(Error::Crypto(format!("unknown blob version {}", envelope.v)));
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotbot_domain::ErrorKind;

    fn cipher() -> CredentialCipher {
        CredentialCipher::new([7u8; 32])
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let c = cipher();
        let blob = c.encrypt("bot-token-123", "user-1", "discord.com").unwrap();
        assert!(blob.starts_with("srv:"));
        assert_eq!(c.decrypt(&blob, None).unwrap(), "bot-token-123");
        assert_eq!(
            c.decrypt(&blob, Some("discord.com")).unwrap(),
            "bot-token-123"
        );
    }

    #[test]
    fn encryption_is_non_deterministic() {
        let c = cipher();
        let a = c.encrypt("secret", "u", "api.example.com").unwrap();
        let b = c.encrypt("secret", "u", "api.example.com").unwrap();
        assert_ne!(a, b);
        assert_eq!(c.decrypt(&a, None).unwrap(), "secret");
        assert_eq!(c.decrypt(&b, None).unwrap(), "secret");
    }

    #[test]
    fn wrong_domain_key_fails_auth() {
        // Forge a blob claiming domain_2 but encrypted under domain_1's key:
        // stamp a different domain into the envelope and re-encode.
        let c = cipher();
        let blob = c.encrypt("secret", "u", "domain-one.com").unwrap();

        use base64::Engine;
        let json = base64::engine::general_purpose::STANDARD
            .decode(blob.strip_prefix("srv:").unwrap())
            .unwrap();
        let mut envelope: serde_json::Value = serde_json::from_slice(&json).unwrap();
        envelope["d"] = serde_json::json!("domain-two.com");
        let forged = format!(
            "srv:{}",
            base64::engine::general_purpose::STANDARD
                .encode(serde_json::to_string(&envelope).unwrap())
        );

        let err = c.decrypt(&forged, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CredentialDomainMismatch);
    }

    #[test]
    fn request_domain_checked_before_derivation() {
        let c = cipher();
        let blob = c.encrypt("secret", "u", "discord.com").unwrap();
        let err = c.decrypt(&blob, Some("evil.example")).unwrap_err();
        assert!(matches!(err, Error::DomainMismatch(_)));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let c = cipher();
        let blob = c.encrypt("secret", "u", "discord.com").unwrap();

        use base64::Engine;
        let json = base64::engine::general_purpose::STANDARD
            .decode(blob.strip_prefix("srv:").unwrap())
            .unwrap();
        let mut envelope: serde_json::Value = serde_json::from_slice(&json).unwrap();
        let ct = envelope["ct"].as_str().unwrap().to_string();
        let flipped = if ct.starts_with('0') { "1" } else { "0" };
        envelope["ct"] = serde_json::json!(format!("{flipped}{}", &ct[1..]));
        let tampered = format!(
            "srv:{}",
            base64::engine::general_purpose::STANDARD
                .encode(serde_json::to_string(&envelope).unwrap())
        );

        assert!(c.decrypt(&tampered, None).is_err());
    }

    #[test]
    fn domain_is_lowercased_before_derivation() {
        let c = cipher();
        let blob = c.encrypt("secret", "u", "Discord.COM").unwrap();
        assert_eq!(blob_domain(&blob).unwrap(), "discord.com");
        assert_eq!(c.decrypt(&blob, Some("DISCORD.com")).unwrap(), "secret");
    }

    #[test]
    fn master_key_wrong_length_aborts() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("master.key");
        std::fs::write(&path, [0u8; 16]).unwrap();
        let err = load_or_create_master_key(&path).unwrap_err();
        assert!(err.to_string().contains("Refusing to start"));
        // The corrupt file must be left untouched.
        assert_eq!(std::fs::read(&path).unwrap().len(), 16);
    }

    #[test]
    fn master_key_created_once_and_reloaded() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("master.key");
        let k1 = load_or_create_master_key(&path).unwrap();
        let k2 = load_or_create_master_key(&path).unwrap();
        assert_eq!(k1, k2);
    }
}
