//! Password-encrypted keypair bundles
//!
//! The only at-rest form of a keypair's private material. The four key fields
//! are serialized with MessagePack, then sealed with XChaCha20-Poly1305 under
//! an Argon2id key derived from the passphrase and a fresh 16-byte salt.
//! `type` and `hint` are bound as associated data (`"<type>|<hint>"`), so
//! editing either one fails decryption.
//!
//! ```json
//! { "type": "keypair-bundle", "hint": "...",
//!   "data": { "salt": "<b64>", "nonce": "<b64>", "cipher": "<b64>" } }
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, Payload},
    Key, KeyInit, XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use tracing::debug;
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{AgentIdentity, Keypair, ENC_PUB_LEN, SIGN_PUB_LEN};
use crate::config::KdfParams;
use crate::primitives;
use crate::types::{Result, WormholeError};

/// Type tag written into every bundle
pub const BUNDLE_TYPE: &str = "keypair-bundle";

/// Argon2id salt length
pub const BUNDLE_SALT_LEN: usize = 16;

/// XChaCha20-Poly1305 nonce length
pub const BUNDLE_NONCE_LEN: usize = 24;

/// Serialized, password-encrypted keypair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceBundle {
    #[serde(rename = "type")]
    pub bundle_type: String,
    pub hint: String,
    pub data: BundleData,
}

/// Base64 encoded KDF salt, AEAD nonce and ciphertext
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleData {
    pub salt: String,
    pub nonce: String,
    pub cipher: String,
}

/// Sealed plaintext. Private fields are empty for a public-only keypair.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
struct KeyFields {
    #[serde(with = "serde_bytes")]
    sign_pub: Vec<u8>,
    #[serde(with = "serde_bytes")]
    sign_priv: Vec<u8>,
    #[serde(with = "serde_bytes")]
    enc_pub: Vec<u8>,
    #[serde(with = "serde_bytes")]
    enc_priv: Vec<u8>,
}

/// Argon2id V1 over the passphrase, on the blocking pool.
async fn passphrase_key(
    passphrase: &str,
    salt: [u8; BUNDLE_SALT_LEN],
) -> Result<Zeroizing<[u8; 32]>> {
    let passphrase = Zeroizing::new(passphrase.as_bytes().to_vec());

    tokio::task::spawn_blocking(move || -> Result<Zeroizing<[u8; 32]>> {
        let mut key = Zeroizing::new([0u8; 32]);
        KdfParams::V1
            .argon2()?
            .hash_password_into(&passphrase, &salt, &mut key[..])
            .map_err(|e| WormholeError::Crypto(format!("Key derivation failed: {e}")))?;
        Ok(key)
    })
    .await?
}

fn associated_data(bundle_type: &str, hint: &str) -> String {
    format!("{bundle_type}|{hint}")
}

fn decode_field(value: &str, field: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| WormholeError::InvalidBundle(format!("Invalid {field} encoding: {e}")))
}

fn fixed<const N: usize>(bytes: &[u8], field: &str) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| {
        WormholeError::InvalidBundle(format!(
            "{field}: expected {N} bytes, got {}",
            bytes.len()
        ))
    })
}

impl Keypair {
    /// Export this keypair as a passphrase-encrypted bundle.
    ///
    /// Key derivation runs on the blocking pool; V1 parameters allocate 64 MB.
    pub async fn get_bundle(
        &self,
        passphrase: &str,
        hint: impl Into<String>,
    ) -> Result<PersistenceBundle> {
        let primitives = primitives::ready()?;
        let hint = hint.into();

        let fields = KeyFields {
            sign_pub: self.sign_pub().to_vec(),
            sign_priv: self
                .sign_secret()
                .map(|k| k.to_bytes().to_vec())
                .unwrap_or_default(),
            enc_pub: self.enc_pub().to_vec(),
            enc_priv: self
                .enc_secret()
                .map(|k| k.to_bytes().to_vec())
                .unwrap_or_default(),
        };
        let plaintext = Zeroizing::new(rmp_serde::to_vec(&fields)?);

        let salt: [u8; BUNDLE_SALT_LEN] = primitives.random_bytes()?;
        let nonce: [u8; BUNDLE_NONCE_LEN] = primitives.random_bytes()?;
        let key = passphrase_key(passphrase, salt).await?;

        let aad = associated_data(BUNDLE_TYPE, &hint);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_slice()))
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_slice(),
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|e| WormholeError::Crypto(format!("Encryption failed: {e}")))?;

        debug!(identity = %self.identity(), "Exported keypair bundle");

        Ok(PersistenceBundle {
            bundle_type: BUNDLE_TYPE.to_string(),
            hint,
            data: BundleData {
                salt: BASE64.encode(salt),
                nonce: BASE64.encode(nonce),
                cipher: BASE64.encode(cipher),
            },
        })
    }

    /// Import a keypair from a bundle produced by [`Keypair::get_bundle`].
    ///
    /// A wrong passphrase or a tampered bundle fails with
    /// [`WormholeError::AuthDecryptionFailure`], including one whose hint was
    /// edited.
    pub async fn from_bundle(bundle: &PersistenceBundle, passphrase: &str) -> Result<Keypair> {
        primitives::ready()?;

        if bundle.bundle_type != BUNDLE_TYPE {
            return Err(WormholeError::InvalidBundle(format!(
                "unsupported bundle type '{}'",
                bundle.bundle_type
            )));
        }

        let salt = decode_field(&bundle.data.salt, "salt")?;
        let nonce = decode_field(&bundle.data.nonce, "nonce")?;
        let cipher = decode_field(&bundle.data.cipher, "cipher")?;

        let salt: [u8; BUNDLE_SALT_LEN] = fixed(&salt, "salt")?;
        let nonce: [u8; BUNDLE_NONCE_LEN] = fixed(&nonce, "nonce")?;

        let key = passphrase_key(passphrase, salt).await?;
        let aad = associated_data(&bundle.bundle_type, &bundle.hint);
        let plaintext = XChaCha20Poly1305::new(Key::from_slice(key.as_slice()))
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: cipher.as_slice(),
                    aad: aad.as_bytes(),
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| WormholeError::AuthDecryptionFailure)?;

        let fields: KeyFields = rmp_serde::from_slice(&plaintext)
            .map_err(|e| WormholeError::InvalidBundle(format!("Invalid key fields: {e}")))?;

        let identity = AgentIdentity::from_public_keys(
            fixed::<SIGN_PUB_LEN>(&fields.sign_pub, "signPub")?,
            fixed::<ENC_PUB_LEN>(&fields.enc_pub, "encPub")?,
        );

        let keypair = match (fields.sign_priv.is_empty(), fields.enc_priv.is_empty()) {
            (true, true) => Keypair::from_identity(identity),
            (false, false) => {
                let sign_priv = Zeroizing::new(fixed::<32>(&fields.sign_priv, "signPriv")?);
                let enc_priv = Zeroizing::new(fixed::<32>(&fields.enc_priv, "encPriv")?);
                let keypair = Keypair::from_secrets(
                    SigningKey::from_bytes(&sign_priv),
                    StaticSecret::from(*enc_priv),
                );
                if keypair.identity() != &identity {
                    return Err(WormholeError::InvalidBundle(
                        "private keys do not match public keys".into(),
                    ));
                }
                keypair
            }
            _ => {
                return Err(WormholeError::InvalidBundle(
                    "bundle carries only one private key".into(),
                ))
            }
        };

        debug!(identity = %keypair.identity(), hint = %bundle.hint, "Imported keypair bundle");
        Ok(keypair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entropy::Entropy;

    fn seeded(byte: u8) -> Keypair {
        Keypair::from_seed(&Entropy::from_bytes([byte; 32])).unwrap()
    }

    #[tokio::test]
    async fn test_bundle_roundtrip() {
        let kp = seeded(1);
        let bundle = kp.get_bundle("correct horse", "laptop").await.unwrap();

        assert_eq!(bundle.bundle_type, BUNDLE_TYPE);
        assert_eq!(bundle.hint, "laptop");

        let restored = Keypair::from_bundle(&bundle, "correct horse").await.unwrap();
        assert_eq!(restored, kp);
        assert!(restored.has_private_keys());
    }

    #[tokio::test]
    async fn test_wrong_passphrase_fails() {
        let kp = seeded(2);
        let bundle = kp.get_bundle("right", "").await.unwrap();
        assert!(matches!(
            Keypair::from_bundle(&bundle, "wrong").await,
            Err(WormholeError::AuthDecryptionFailure)
        ));
    }

    #[tokio::test]
    async fn test_fresh_salt_and_nonce_per_export() {
        let kp = seeded(3);
        let a = kp.get_bundle("pw", "h").await.unwrap();
        let b = kp.get_bundle("pw", "h").await.unwrap();
        assert_ne!(a.data.salt, b.data.salt);
        assert_ne!(a.data.nonce, b.data.nonce);
        assert_ne!(a.data.cipher, b.data.cipher);
    }

    #[tokio::test]
    async fn test_json_shape() {
        let bundle = seeded(4).get_bundle("pw", "phone").await.unwrap();
        let json = serde_json::to_value(&bundle).unwrap();

        assert_eq!(json["type"], "keypair-bundle");
        assert_eq!(json["hint"], "phone");
        let salt = BASE64.decode(json["data"]["salt"].as_str().unwrap()).unwrap();
        let nonce = BASE64.decode(json["data"]["nonce"].as_str().unwrap()).unwrap();
        assert_eq!(salt.len(), BUNDLE_SALT_LEN);
        assert_eq!(nonce.len(), BUNDLE_NONCE_LEN);

        let back: PersistenceBundle = serde_json::from_value(json).unwrap();
        assert_eq!(back, bundle);
    }

    #[tokio::test]
    async fn test_public_only_roundtrip() {
        let public = Keypair::from_identity(seeded(5).identity().clone());
        let bundle = public.get_bundle("pw", "").await.unwrap();
        let restored = Keypair::from_bundle(&bundle, "pw").await.unwrap();

        assert!(!restored.has_private_keys());
        assert_eq!(restored.identity(), public.identity());
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let mut bundle = seeded(6).get_bundle("pw", "").await.unwrap();
        bundle.bundle_type = "keypair-bundle-v9".into();
        assert!(matches!(
            Keypair::from_bundle(&bundle, "pw").await,
            Err(WormholeError::InvalidBundle(_))
        ));
    }

    #[tokio::test]
    async fn test_tampered_cipher_fails() {
        let mut bundle = seeded(7).get_bundle("pw", "").await.unwrap();
        let mut cipher = BASE64.decode(&bundle.data.cipher).unwrap();
        cipher[0] ^= 0x01;
        bundle.data.cipher = BASE64.encode(cipher);

        assert!(matches!(
            Keypair::from_bundle(&bundle, "pw").await,
            Err(WormholeError::AuthDecryptionFailure)
        ));
    }

    #[tokio::test]
    async fn test_hint_is_authenticated() {
        let mut bundle = seeded(8).get_bundle("pw", "laptop").await.unwrap();
        bundle.hint = "phone".into();

        assert!(matches!(
            Keypair::from_bundle(&bundle, "pw").await,
            Err(WormholeError::AuthDecryptionFailure)
        ));
    }

    #[tokio::test]
    async fn test_short_salt_rejected() {
        let mut bundle = seeded(9).get_bundle("pw", "").await.unwrap();
        bundle.data.salt = BASE64.encode([0u8; 8]);

        assert!(matches!(
            Keypair::from_bundle(&bundle, "pw").await,
            Err(WormholeError::InvalidBundle(_))
        ));
    }
}
