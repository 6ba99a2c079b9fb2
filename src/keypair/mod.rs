//! Agent keypair primitive
//!
//! A [`Keypair`] pairs an Ed25519 signing key with an X25519 key-exchange key.
//! Its public [`AgentIdentity`] string encodes both public halves. A keypair
//! rebuilt from an identity alone can verify and be encrypted to, but cannot
//! sign or decrypt.
//!
//! # Derivation
//!
//! From a 32-byte seed:
//! - signing secret = seed
//! - exchange secret = HKDF-SHA256(seed, info = "doorway-wormhole/kx/v1")
//!
//! The seed itself is never stored.

pub mod bundle;
pub mod multi_box;

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::entropy::Entropy;
use crate::primitives;
use crate::types::{Result, WormholeError};

pub use bundle::{BundleData, PersistenceBundle, BUNDLE_TYPE};

/// Multibase-style prefix for base64url identities
const IDENTITY_PREFIX: char = 'u';

/// HKDF info for the key-exchange secret
const KX_INFO: &[u8] = b"doorway-wormhole/kx/v1";

/// Ed25519 public key length
pub const SIGN_PUB_LEN: usize = 32;

/// X25519 public key length
pub const ENC_PUB_LEN: usize = 32;

/// Ed25519 signature length
pub const SIGNATURE_LEN: usize = 64;

// =============================================================================
// Agent identity
// =============================================================================

/// Public identifier: `"u"` + base64url(signPub ‖ encPub)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AgentIdentity {
    encoded: String,
    sign_pub: [u8; SIGN_PUB_LEN],
    enc_pub: [u8; ENC_PUB_LEN],
}

impl AgentIdentity {
    /// Build from the two public keys.
    pub fn from_public_keys(sign_pub: [u8; SIGN_PUB_LEN], enc_pub: [u8; ENC_PUB_LEN]) -> Self {
        let mut raw = [0u8; SIGN_PUB_LEN + ENC_PUB_LEN];
        raw[..SIGN_PUB_LEN].copy_from_slice(&sign_pub);
        raw[SIGN_PUB_LEN..].copy_from_slice(&enc_pub);

        Self {
            encoded: format!("{IDENTITY_PREFIX}{}", BASE64_URL.encode(raw)),
            sign_pub,
            enc_pub,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn sign_pub(&self) -> &[u8; SIGN_PUB_LEN] {
        &self.sign_pub
    }

    pub fn enc_pub(&self) -> &[u8; ENC_PUB_LEN] {
        &self.enc_pub
    }

    /// Name of the event a host pushes sign requests on for this agent
    pub fn sign_event(&self) -> String {
        format!("agent/{}/sign", self.encoded)
    }

    /// Verify an Ed25519 signature made by this identity.
    pub fn verify(&self, signature: &[u8], data: &[u8]) -> bool {
        let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
            return false;
        };
        let Ok(vk) = VerifyingKey::from_bytes(&self.sign_pub) else {
            return false;
        };
        vk.verify_strict(data, &Signature::from_bytes(&sig_bytes))
            .is_ok()
    }
}

impl FromStr for AgentIdentity {
    type Err = WormholeError;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix(IDENTITY_PREFIX)
            .ok_or_else(|| WormholeError::InvalidIdentity(format!("missing '{IDENTITY_PREFIX}' prefix")))?;

        let raw = BASE64_URL
            .decode(body)
            .map_err(|e| WormholeError::InvalidIdentity(format!("bad encoding: {e}")))?;

        if raw.len() != SIGN_PUB_LEN + ENC_PUB_LEN {
            return Err(WormholeError::InvalidIdentity(format!(
                "expected {} bytes, got {}",
                SIGN_PUB_LEN + ENC_PUB_LEN,
                raw.len()
            )));
        }

        let mut sign_pub = [0u8; SIGN_PUB_LEN];
        let mut enc_pub = [0u8; ENC_PUB_LEN];
        sign_pub.copy_from_slice(&raw[..SIGN_PUB_LEN]);
        enc_pub.copy_from_slice(&raw[SIGN_PUB_LEN..]);

        VerifyingKey::from_bytes(&sign_pub)
            .map_err(|_| WormholeError::InvalidIdentity("signing key is not a curve point".into()))?;

        Ok(Self::from_public_keys(sign_pub, enc_pub))
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentIdentity({})", self.encoded)
    }
}

impl Serialize for AgentIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encoded)
    }
}

impl<'de> Deserialize<'de> for AgentIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Keypair
// =============================================================================

/// Signing + key-exchange keypair.
///
/// Immutable once built. Rebinding a session replaces the keypair rather
/// than changing it, so in-flight operations always see consistent keys.
#[derive(Clone)]
pub struct Keypair {
    identity: AgentIdentity,
    sign_priv: Option<SigningKey>,
    enc_priv: Option<StaticSecret>,
}

impl Keypair {
    /// Deterministically derive a full keypair from a 32-byte seed.
    pub fn from_seed(seed: &Entropy) -> Result<Self> {
        primitives::ready()?;

        let sign_priv = SigningKey::from_bytes(seed.as_bytes());

        let hk = Hkdf::<Sha256>::new(None, seed.as_bytes());
        let mut kx_secret = Zeroizing::new([0u8; 32]);
        hk.expand(KX_INFO, &mut kx_secret[..])
            .map_err(|e| WormholeError::Crypto(format!("HKDF expand failed: {e}")))?;
        let enc_priv = StaticSecret::from(*kx_secret);

        Ok(Self::from_secrets(sign_priv, enc_priv))
    }

    /// Build from private key material.
    pub fn from_secrets(sign_priv: SigningKey, enc_priv: StaticSecret) -> Self {
        let identity = AgentIdentity::from_public_keys(
            sign_priv.verifying_key().to_bytes(),
            *X25519PublicKey::from(&enc_priv).as_bytes(),
        );
        Self {
            identity,
            sign_priv: Some(sign_priv),
            enc_priv: Some(enc_priv),
        }
    }

    /// A public-only keypair for a received identity.
    pub fn from_identity(identity: AgentIdentity) -> Self {
        Self {
            identity,
            sign_priv: None,
            enc_priv: None,
        }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn sign_pub(&self) -> &[u8; SIGN_PUB_LEN] {
        self.identity.sign_pub()
    }

    pub fn enc_pub(&self) -> &[u8; ENC_PUB_LEN] {
        self.identity.enc_pub()
    }

    /// Whether both private halves are present
    pub fn has_private_keys(&self) -> bool {
        self.sign_priv.is_some() && self.enc_priv.is_some()
    }

    /// Sign `data` with Ed25519.
    pub fn sign(&self, data: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
        primitives::ready()?;
        let key = self.sign_priv.as_ref().ok_or(WormholeError::NoPrivateKey)?;
        Ok(key.sign(data).to_bytes())
    }

    /// Verify a signature against this keypair's public identity.
    pub fn verify(&self, signature: &[u8], data: &[u8]) -> bool {
        self.identity.verify(signature, data)
    }

    pub(crate) fn sign_secret(&self) -> Option<&SigningKey> {
        self.sign_priv.as_ref()
    }

    pub(crate) fn enc_secret(&self) -> Option<&StaticSecret> {
        self.enc_priv.as_ref()
    }
}

impl PartialEq for Keypair {
    fn eq(&self, other: &Self) -> bool {
        let sign_eq = match (&self.sign_priv, &other.sign_priv) {
            (Some(a), Some(b)) => a.to_bytes() == b.to_bytes(),
            (None, None) => true,
            _ => false,
        };
        let enc_eq = match (&self.enc_priv, &other.enc_priv) {
            (Some(a), Some(b)) => a.to_bytes() == b.to_bytes(),
            (None, None) => true,
            _ => false,
        };
        self.identity == other.identity && sign_eq && enc_eq
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity)
            .field("sign_priv", &self.sign_priv.as_ref().map(|_| ".."))
            .field("enc_priv", &self.enc_priv.as_ref().map(|_| ".."))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn seeded(byte: u8) -> Keypair {
        Keypair::from_seed(&Entropy::from_bytes([byte; 32])).unwrap()
    }

    #[test]
    fn test_from_seed_is_deterministic() {
        let a = seeded(1);
        let b = seeded(1);
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.sign_pub(), b.sign_pub());
        assert_eq!(a.enc_pub(), b.enc_pub());
        assert_eq!(a, b);

        assert_ne!(seeded(2).identity(), a.identity());
    }

    #[test]
    fn test_identity_encodes_both_public_keys() {
        let kp = seeded(5);
        let parsed: AgentIdentity = kp.identity().as_str().parse().unwrap();
        assert_eq!(parsed.sign_pub(), kp.sign_pub());
        assert_eq!(parsed.enc_pub(), kp.enc_pub());
        assert!(kp.identity().as_str().starts_with('u'));
        assert_ne!(kp.sign_pub(), kp.enc_pub());
    }

    #[test]
    fn test_identity_parse_rejects_garbage() {
        assert!("abc".parse::<AgentIdentity>().is_err());
        assert!("u!!!".parse::<AgentIdentity>().is_err());

        let short = format!("u{}", BASE64_URL.encode([1u8; 32]));
        assert!(matches!(
            short.parse::<AgentIdentity>(),
            Err(WormholeError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn test_sign_event_name() {
        let kp = seeded(9);
        assert_eq!(
            kp.identity().sign_event(),
            format!("agent/{}/sign", kp.identity())
        );
    }

    #[test]
    fn test_public_only_cannot_sign() {
        let kp = seeded(3);
        let public = Keypair::from_identity(kp.identity().clone());
        assert!(!public.has_private_keys());
        assert!(matches!(public.sign(b"x"), Err(WormholeError::NoPrivateKey)));

        let sig = kp.sign(b"x").unwrap();
        assert!(public.verify(&sig, b"x"));
    }

    #[test]
    fn test_verify_rejects_wrong_length() {
        let kp = seeded(4);
        assert!(!kp.verify(&[0u8; 10], b"data"));
    }

    #[test]
    fn test_identity_serde() {
        let kp = seeded(6);
        let json = serde_json::to_string(kp.identity()).unwrap();
        let back: AgentIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, kp.identity());
    }

    #[test]
    fn test_debug_hides_private_keys() {
        let kp = seeded(7);
        let debug = format!("{kp:?}");
        assert!(debug.contains(".."));
        assert!(!debug.contains(&hex::encode(kp.sign_secret().unwrap().to_bytes())));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_sign_verify_and_tamper(
            seed in any::<[u8; 32]>(),
            data in proptest::collection::vec(any::<u8>(), 1..256),
            flip in any::<usize>(),
        ) {
            let kp = Keypair::from_seed(&Entropy::from_bytes(seed)).unwrap();
            let sig = kp.sign(&data).unwrap();
            prop_assert!(kp.verify(&sig, &data));

            let mut tampered = data.clone();
            let i = flip % tampered.len();
            tampered[i] ^= 0x01;
            prop_assert!(!kp.verify(&sig, &tampered));

            let mut bad_sig = sig;
            bad_sig[flip % SIGNATURE_LEN] ^= 0x01;
            prop_assert!(!kp.verify(&bad_sig, &data));
        }
    }
}
