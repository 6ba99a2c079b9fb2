//! Entropy sources for key derivation
//!
//! A seed is the XOR of two independent 32-byte contributions: one drawn
//! locally and one issued by a remote service. Neither party alone can pick
//! the resulting key as long as the other is honest. Entropy is fetched fresh
//! for every derivation and never cached.

pub mod salt_service;

use async_trait::async_trait;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::primitives;
use crate::types::{Result, WormholeError};

pub use salt_service::{InMemorySaltRegistry, SaltRegistry, SaltServiceClient};

/// Length of every entropy contribution and of the combined seed
pub const ENTROPY_LEN: usize = 32;

/// 32 bytes of key material input. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Entropy([u8; ENTROPY_LEN]);

impl Entropy {
    pub fn from_bytes(bytes: [u8; ENTROPY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, rejecting anything but 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; ENTROPY_LEN] =
            bytes.try_into().map_err(|_| WormholeError::EntropyLength {
                expected: ENTROPY_LEN,
                got: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; ENTROPY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for Entropy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Entropy(..)")
    }
}

/// Locally generated entropy from the best available generator.
pub fn local_entropy() -> Result<Entropy> {
    let bytes = primitives::ready()?.random_bytes::<ENTROPY_LEN>()?;
    Ok(Entropy(bytes))
}

/// Bytewise XOR of two equal-length contributions.
pub fn combine(a: &[u8], b: &[u8]) -> Result<Entropy> {
    if a.len() != ENTROPY_LEN {
        return Err(WormholeError::EntropyLength {
            expected: ENTROPY_LEN,
            got: a.len(),
        });
    }
    if b.len() != ENTROPY_LEN {
        return Err(WormholeError::EntropyLength {
            expected: ENTROPY_LEN,
            got: b.len(),
        });
    }

    let mut out = [0u8; ENTROPY_LEN];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    Ok(Entropy(out))
}

// ============================================================================
// Entropy Source Trait (for dependency injection)
// ============================================================================

/// Something that can hand out 32 bytes of entropy
#[async_trait]
pub trait EntropySource: Send + Sync {
    async fn entropy(&self) -> Result<Entropy>;
}

/// The local generator as an [`EntropySource`]
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalEntropy;

#[async_trait]
impl EntropySource for LocalEntropy {
    async fn entropy(&self) -> Result<Entropy> {
        local_entropy()
    }
}

/// A source that always returns the same bytes. Useful for reproducible
/// derivations in tests and fixtures.
#[derive(Clone)]
pub struct FixedEntropy(pub [u8; ENTROPY_LEN]);

#[async_trait]
impl EntropySource for FixedEntropy {
    async fn entropy(&self) -> Result<Entropy> {
        Ok(Entropy(self.0))
    }
}
