//! One-time initialisation of the crypto primitives
//!
//! Every public operation goes through [`ready`] before touching key material.
//! The first call probes the OS random generator and runs a sign/verify
//! self-check; later calls return the cached result.
//!
//! When the OS generator is unavailable, random bytes come from a ChaCha-based
//! generator keyed from a hash of process-local state. That path is flagged
//! as [`Assurance::Reduced`] and logged once.

use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signer, SigningKey, Verifier};
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::types::{Result, WormholeError};

/// Quality of the local random source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assurance {
    /// OS cryptographically secure generator
    Full,
    /// Keyed pseudorandom fallback
    Reduced,
}

/// Initialised primitive state
pub struct Primitives {
    assurance: Assurance,
    fallback: Option<Mutex<StdRng>>,
}

static PRIMITIVES: OnceLock<std::result::Result<Primitives, String>> = OnceLock::new();

/// Await the primitives' readiness. Initialisation runs exactly once per process.
pub fn ready() -> Result<&'static Primitives> {
    PRIMITIVES
        .get_or_init(Primitives::init)
        .as_ref()
        .map_err(|e| WormholeError::Crypto(e.clone()))
}

impl Primitives {
    fn init() -> std::result::Result<Self, String> {
        let mut probe = [0u8; 32];
        let (assurance, fallback) = match OsRng.try_fill_bytes(&mut probe) {
            Ok(()) => (Assurance::Full, None),
            Err(e) => {
                warn!(error = %e, "OS random generator unavailable, using keyed fallback (reduced assurance)");
                (Assurance::Reduced, Some(Mutex::new(fallback_rng())))
            }
        };

        self_check()?;
        debug!(?assurance, "Crypto primitives ready");

        Ok(Self {
            assurance,
            fallback,
        })
    }

    /// Quality of the local random source
    pub fn assurance(&self) -> Assurance {
        self.assurance
    }

    /// Fill `dest` with random bytes from the best available generator.
    pub fn fill_random(&self, dest: &mut [u8]) -> Result<()> {
        match &self.fallback {
            None => OsRng
                .try_fill_bytes(dest)
                .map_err(|e| WormholeError::Crypto(format!("OS random generator failed: {e}"))),
            Some(rng) => {
                let mut rng = rng
                    .lock()
                    .map_err(|_| WormholeError::Internal("Fallback RNG lock poisoned".into()))?;
                rng.fill_bytes(dest);
                Ok(())
            }
        }
    }

    /// Generate `N` random bytes.
    pub fn random_bytes<const N: usize>(&self) -> Result<[u8; N]> {
        let mut bytes = [0u8; N];
        self.fill_random(&mut bytes)?;
        Ok(bytes)
    }
}

/// Known-key sign/verify round trip; catches a broken build of the curve library.
fn self_check() -> std::result::Result<(), String> {
    let key = SigningKey::from_bytes(&[7u8; 32]);
    let message = b"doorway-wormhole self check";
    let signature = key.sign(message);
    key.verifying_key()
        .verify(message, &signature)
        .map_err(|e| format!("Ed25519 self check failed: {e}"))
}

fn fallback_rng() -> StdRng {
    let mut hasher = Sha256::new();
    hasher.update(b"doorway-wormhole/fallback-rng/v1");
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    hasher.update(now.as_nanos().to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(format!("{:?}", std::thread::current().id()).as_bytes());
    StdRng::from_seed(hasher.finalize().into())
}
