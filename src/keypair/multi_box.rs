//! Multi-recipient authenticated encryption
//!
//! One fresh symmetric secret per message. For each recipient the secret is
//! wrapped under a transport key derived from X25519(sender, recipient);
//! the payload is sealed once under the secret.
//!
//! Wire format (MessagePack):
//!
//! ```text
//! [ [nonce_1, wrapped_1], ..., [nonce_n, wrapped_n], [nonce_p, payload] ]
//! ```
//!
//! Every slot draws its own 24-byte XChaCha20-Poly1305 nonce. Associated data,
//! when present, authenticates every slot.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use futures::future::try_join_all;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::{AgentIdentity, Keypair, ENC_PUB_LEN};
use crate::primitives;
use crate::types::{Result, WormholeError};

/// XChaCha20-Poly1305 nonce length
pub const BOX_NONCE_LEN: usize = 24;

/// Symmetric secret length
const SECRET_LEN: usize = 32;

/// HKDF info prefix for transport keys
const TRANSPORT_INFO: &[u8] = b"doorway-wormhole/box/v1";

/// One `(nonce, ciphertext)` pair
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BoxSlot(
    #[serde(with = "serde_bytes")] Vec<u8>,
    #[serde(with = "serde_bytes")] Vec<u8>,
);

/// Derive the sender→recipient transport key.
///
/// Both sides compute the same key: the DH output is symmetric and the info
/// string fixes the direction by ordering sender before recipient.
fn transport_key(
    own_secret: &StaticSecret,
    peer_pub: &[u8; ENC_PUB_LEN],
    sender_pub: &[u8; ENC_PUB_LEN],
    recipient_pub: &[u8; ENC_PUB_LEN],
) -> Result<Zeroizing<[u8; 32]>> {
    let shared = own_secret.diffie_hellman(&X25519PublicKey::from(*peer_pub));
    if !shared.was_contributory() {
        return Err(WormholeError::Crypto(
            "key exchange produced a non-contributory secret".into(),
        ));
    }

    let mut info = Vec::with_capacity(TRANSPORT_INFO.len() + 2 * ENC_PUB_LEN);
    info.extend_from_slice(TRANSPORT_INFO);
    info.extend_from_slice(sender_pub);
    info.extend_from_slice(recipient_pub);

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(&info, &mut key[..])
        .map_err(|e| WormholeError::Crypto(format!("HKDF expand failed: {e}")))?;
    Ok(key)
}

fn seal(key: &[u8; 32], msg: &[u8], aad: &[u8]) -> Result<BoxSlot> {
    let nonce: [u8; BOX_NONCE_LEN] = primitives::ready()?.random_bytes()?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let ct = cipher
        .encrypt(XNonce::from_slice(&nonce), Payload { msg, aad })
        .map_err(|e| WormholeError::Crypto(format!("Encryption failed: {e}")))?;
    Ok(BoxSlot(nonce.to_vec(), ct))
}

fn open(key: &[u8; 32], slot: &BoxSlot, aad: &[u8]) -> Option<Vec<u8>> {
    if slot.0.len() != BOX_NONCE_LEN {
        return None;
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            XNonce::from_slice(&slot.0),
            Payload {
                msg: &slot.1,
                aad,
            },
        )
        .ok()
}

impl Keypair {
    /// Encrypt `data` so each of `recipients` can decrypt it independently.
    ///
    /// Per-recipient wrapping runs as independent blocking tasks; the output
    /// keeps recipient order.
    pub async fn encrypt(
        &self,
        recipients: &[AgentIdentity],
        data: &[u8],
        associated_data: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let primitives = primitives::ready()?;
        let sender_secret = self.enc_secret().ok_or(WormholeError::NoPrivateKey)?.clone();

        if recipients.is_empty() {
            return Err(WormholeError::Crypto("no recipients".into()));
        }

        let secret = Zeroizing::new(primitives.random_bytes::<SECRET_LEN>()?);
        let aad = associated_data.unwrap_or_default().to_vec();
        let sender_pub = *self.enc_pub();

        let wraps = recipients.iter().map(|recipient| {
            let sender_secret = sender_secret.clone();
            let secret = secret.clone();
            let aad = aad.clone();
            let recipient_pub = *recipient.enc_pub();

            tokio::task::spawn_blocking(move || -> Result<BoxSlot> {
                let key = transport_key(&sender_secret, &recipient_pub, &sender_pub, &recipient_pub)?;
                seal(&key, secret.as_slice(), &aad)
            })
        });

        let mut slots = try_join_all(wraps)
            .await?
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        slots.push(seal(&secret, data, &aad)?);

        debug!(recipients = recipients.len(), "Encrypted multi-recipient box");
        Ok(rmp_serde::to_vec(&slots)?)
    }

    /// Decrypt a box produced by `sender` for this keypair.
    pub fn decrypt(
        &self,
        sender: &AgentIdentity,
        ciphertext: &[u8],
        associated_data: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        primitives::ready()?;
        let own_secret = self.enc_secret().ok_or(WormholeError::NoPrivateKey)?;

        let slots: Vec<BoxSlot> = rmp_serde::from_slice(ciphertext)?;
        let Some((payload, wrapped)) = slots.split_last() else {
            return Err(WormholeError::MalformedCiphertext("empty box".into()));
        };
        if wrapped.is_empty() {
            return Err(WormholeError::MalformedCiphertext(
                "box has no recipient slots".into(),
            ));
        }

        let aad = associated_data.unwrap_or_default();
        let key = transport_key(own_secret, sender.enc_pub(), sender.enc_pub(), self.enc_pub())?;

        let secret = wrapped
            .iter()
            .find_map(|slot| open(&key, slot, aad))
            .map(Zeroizing::new)
            .ok_or(WormholeError::NotARecipient)?;

        let secret: &[u8; SECRET_LEN] = secret
            .as_slice()
            .try_into()
            .map_err(|_| WormholeError::MalformedCiphertext("wrapped secret has wrong length".into()))?;

        open(secret, payload, aad).ok_or(WormholeError::AuthDecryptionFailure)
    }
}
