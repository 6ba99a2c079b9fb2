//! Identity derivation
//!
//! Three ways to obtain a [`Keypair`]:
//!
//! - **readonly**: seed = local ⊕ remote entropy. Anonymous, not recoverable.
//! - **new readwrite**: salt = local ⊕ remote entropy, registered under the
//!   email; seed = Argon2id(password, salt[..16]).
//! - **regenerate**: fetch the registered salt, hash the password the same way.
//!
//! # Limitation
//!
//! Regeneration cannot tell a wrong password from a right one. A mistyped
//! password yields a different, valid-looking identity. Callers that know the
//! expected identity should use [`IdentityDeriver::regenerate_verified`].

use std::sync::Arc;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::KdfParams;
use crate::entropy::{combine, Entropy, EntropySource, LocalEntropy, SaltRegistry, ENTROPY_LEN};
use crate::keypair::{AgentIdentity, Keypair};
use crate::types::{Result, WormholeError};

/// Bytes of the registered salt fed to Argon2id
pub const PASSWORD_SALT_LEN: usize = 16;

/// Outcome of recording the salt for a new readwrite identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaltRegistration {
    /// The salt service stored the salt; the identity can be regenerated
    Registered,
    /// The salt service did not store the salt. The identity works for this
    /// session but may not be recoverable.
    Unregistered { reason: String },
}

impl SaltRegistration {
    pub fn is_registered(&self) -> bool {
        matches!(self, SaltRegistration::Registered)
    }
}

/// A newly derived readwrite keypair plus how its salt registration went
#[derive(Debug)]
pub struct Registration {
    pub keypair: Keypair,
    pub salt_registration: SaltRegistration,
}

/// Hash `password` with Argon2id over the first 16 bytes of `salt`.
///
/// Runs on the blocking pool; V1 parameters allocate 64 MB.
pub async fn hash_password(password: &str, salt: &Entropy, kdf: KdfParams) -> Result<Entropy> {
    let password = Zeroizing::new(password.as_bytes().to_vec());
    let mut short_salt = [0u8; PASSWORD_SALT_LEN];
    short_salt.copy_from_slice(&salt.as_bytes()[..PASSWORD_SALT_LEN]);

    tokio::task::spawn_blocking(move || -> Result<Entropy> {
        let mut out = Zeroizing::new([0u8; ENTROPY_LEN]);
        kdf.argon2()?
            .hash_password_into(&password, &short_salt, &mut out[..])
            .map_err(|e| WormholeError::Crypto(format!("Password hashing failed: {e}")))?;
        Ok(Entropy::from_bytes(*out))
    })
    .await?
}

/// Derives keypairs from combined entropy or from a password.
///
/// `R` supplies remote entropy and `S` stores per-email salts; the salt
/// service client implements both.
pub struct IdentityDeriver<R: EntropySource, S: SaltRegistry> {
    remote: Arc<R>,
    local: Arc<dyn EntropySource>,
    registry: Arc<S>,
    kdf: KdfParams,
}

impl<R: EntropySource, S: SaltRegistry> IdentityDeriver<R, S> {
    /// Create a deriver using the local OS generator and V1 KDF parameters
    pub fn new(remote: Arc<R>, registry: Arc<S>) -> Self {
        Self {
            remote,
            local: Arc::new(LocalEntropy),
            registry,
            kdf: KdfParams::V1,
        }
    }

    /// Replace the local entropy source
    pub fn with_local_source(mut self, local: Arc<dyn EntropySource>) -> Self {
        self.local = local;
        self
    }

    /// Replace the KDF parameters. Every derivation for a given email must
    /// use the same value.
    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn kdf(&self) -> KdfParams {
        self.kdf
    }

    async fn combined_entropy(&self) -> Result<Entropy> {
        let remote = self.remote.entropy().await?;
        let local = self.local.entropy().await?;
        combine(remote.as_bytes(), local.as_bytes())
    }

    /// Derive an anonymous keypair from fresh local and remote entropy.
    pub async fn derive_readonly(&self) -> Result<Keypair> {
        let seed = self.combined_entropy().await?;
        let keypair = Keypair::from_seed(&seed)?;
        debug!(identity = %keypair.identity(), "Derived readonly identity");
        Ok(keypair)
    }

    /// Derive a new password-backed keypair and register its salt.
    ///
    /// A registration failure does not fail the derivation; it is reported in
    /// [`Registration::salt_registration`].
    pub async fn derive_new_readwrite(&self, email: &str, password: &str) -> Result<Registration> {
        let salt = self.combined_entropy().await?;

        let salt_registration = match self.registry.register_salt(email, &salt).await {
            Ok(()) => SaltRegistration::Registered,
            Err(e) => {
                warn!(error = %e, "Salt registration failed, continuing with local salt");
                SaltRegistration::Unregistered {
                    reason: e.to_string(),
                }
            }
        };

        let seed = hash_password(password, &salt, self.kdf).await?;
        let keypair = Keypair::from_seed(&seed)?;

        info!(
            identity = %keypair.identity(),
            registered = salt_registration.is_registered(),
            "Derived new readwrite identity"
        );

        Ok(Registration {
            keypair,
            salt_registration,
        })
    }

    /// Rebuild a readwrite keypair from the salt registered under `email`.
    ///
    /// Fails with [`WormholeError::RegistrationNotFound`] when no salt was
    /// registered. A wrong password is not detected here.
    pub async fn regenerate(&self, email: &str, password: &str) -> Result<Keypair> {
        let salt = self
            .registry
            .registered_salt(email)
            .await?
            .ok_or_else(|| WormholeError::RegistrationNotFound(email.to_string()))?;

        let seed = hash_password(password, &salt, self.kdf).await?;
        let keypair = Keypair::from_seed(&seed)?;
        debug!(identity = %keypair.identity(), "Regenerated readwrite identity");
        Ok(keypair)
    }

    /// Like [`regenerate`](Self::regenerate), but fails with
    /// [`WormholeError::IdentityMismatch`] unless the result is `expected`.
    pub async fn regenerate_verified(
        &self,
        email: &str,
        password: &str,
        expected: &AgentIdentity,
    ) -> Result<Keypair> {
        let keypair = self.regenerate(email, password).await?;
        if keypair.identity() != expected {
            warn!(expected = %expected, "Regenerated identity does not match");
            return Err(WormholeError::IdentityMismatch {
                expected: expected.to_string(),
                derived: keypair.identity().to_string(),
            });
        }
        Ok(keypair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entropy::{FixedEntropy, InMemorySaltRegistry};
    use async_trait::async_trait;

    /// Cheap parameters so tests stay fast
    const TEST_KDF: KdfParams = KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    };

    struct FailingRegistry;

    #[async_trait]
    impl SaltRegistry for FailingRegistry {
        async fn register_salt(&self, _email: &str, _salt: &Entropy) -> Result<()> {
            Err(WormholeError::SaltService("service unavailable".into()))
        }

        async fn registered_salt(&self, _email: &str) -> Result<Option<Entropy>> {
            Ok(None)
        }
    }

    fn deriver(
        remote: [u8; 32],
        local: [u8; 32],
    ) -> IdentityDeriver<FixedEntropy, InMemorySaltRegistry> {
        IdentityDeriver::new(
            Arc::new(FixedEntropy(remote)),
            Arc::new(InMemorySaltRegistry::new()),
        )
        .with_local_source(Arc::new(FixedEntropy(local)))
        .with_kdf(TEST_KDF)
    }

    #[tokio::test]
    async fn test_readonly_from_stub_entropy() {
        let d = deriver([0u8; 32], [0xffu8; 32]);
        let kp = d.derive_readonly().await.unwrap();

        let expected = Keypair::from_seed(&combine(&[0u8; 32], &[0xffu8; 32]).unwrap()).unwrap();
        assert_eq!(kp.identity(), expected.identity());
    }

    #[tokio::test]
    async fn test_readonly_with_real_local_entropy_differs() {
        let registry = Arc::new(InMemorySaltRegistry::new());
        let d = IdentityDeriver::new(Arc::new(FixedEntropy([1u8; 32])), registry);
        let a = d.derive_readonly().await.unwrap();
        let b = d.derive_readonly().await.unwrap();
        assert_ne!(a.identity(), b.identity());
    }

    #[tokio::test]
    async fn test_signup_then_regenerate() {
        let d = deriver([7u8; 32], [9u8; 32]);

        let reg = d.derive_new_readwrite("ana@example.com", "hunter2").await.unwrap();
        assert_eq!(reg.salt_registration, SaltRegistration::Registered);

        let again = d.regenerate("ana@example.com", "hunter2").await.unwrap();
        assert_eq!(again.identity(), reg.keypair.identity());
    }

    #[tokio::test]
    async fn test_password_uses_first_16_salt_bytes() {
        let mut a = [3u8; 32];
        let mut b = [3u8; 32];
        a[20] = 1;
        b[20] = 2;

        let ha = hash_password("pw", &Entropy::from_bytes(a), TEST_KDF).await.unwrap();
        let hb = hash_password("pw", &Entropy::from_bytes(b), TEST_KDF).await.unwrap();
        assert_eq!(ha, hb);

        b[0] = 0;
        let hc = hash_password("pw", &Entropy::from_bytes(b), TEST_KDF).await.unwrap();
        assert_ne!(ha, hc);
    }

    #[tokio::test]
    async fn test_regenerate_without_registration() {
        let d = deriver([1u8; 32], [2u8; 32]);
        let err = d.regenerate("nobody@example.com", "pw").await.unwrap_err();
        assert!(matches!(err, WormholeError::RegistrationNotFound(email) if email == "nobody@example.com"));
    }

    #[tokio::test]
    async fn test_wrong_password_yields_different_identity() {
        let d = deriver([5u8; 32], [6u8; 32]);
        let reg = d.derive_new_readwrite("bo@example.com", "right").await.unwrap();

        let wrong = d.regenerate("bo@example.com", "wrong").await.unwrap();
        assert_ne!(wrong.identity(), reg.keypair.identity());

        let err = d
            .regenerate_verified("bo@example.com", "wrong", reg.keypair.identity())
            .await
            .unwrap_err();
        assert!(matches!(err, WormholeError::IdentityMismatch { .. }));

        let ok = d
            .regenerate_verified("bo@example.com", "right", reg.keypair.identity())
            .await
            .unwrap();
        assert_eq!(ok.identity(), reg.keypair.identity());
    }

    #[tokio::test]
    async fn test_registration_failure_is_soft() {
        let d = IdentityDeriver::new(Arc::new(FixedEntropy([1u8; 32])), Arc::new(FailingRegistry))
            .with_local_source(Arc::new(FixedEntropy([2u8; 32])))
            .with_kdf(TEST_KDF);

        let reg = d.derive_new_readwrite("cy@example.com", "pw").await.unwrap();
        assert!(!reg.salt_registration.is_registered());
        assert!(matches!(
            reg.salt_registration,
            SaltRegistration::Unregistered { ref reason } if reason.contains("service unavailable")
        ));

        // Keypair still comes from the local salt
        let salt = combine(&[1u8; 32], &[2u8; 32]).unwrap();
        let seed = hash_password("pw", &salt, TEST_KDF).await.unwrap();
        assert_eq!(
            reg.keypair.identity(),
            Keypair::from_seed(&seed).unwrap().identity()
        );
    }

    /// Collects formatted log output for inspection
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn test_registration_failure_log_omits_email() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let d = IdentityDeriver::new(Arc::new(FixedEntropy([1u8; 32])), Arc::new(FailingRegistry))
            .with_local_source(Arc::new(FixedEntropy([2u8; 32])))
            .with_kdf(TEST_KDF);
        d.derive_new_readwrite("dora.private@example.com", "pw")
            .await
            .unwrap();

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Salt registration failed"), "{output}");
        assert!(!output.contains("dora.private"), "{output}");
    }

    #[tokio::test]
    async fn test_kdf_params_change_identity() {
        let salt = Entropy::from_bytes([8u8; 32]);
        let light = hash_password("pw", &salt, TEST_KDF).await.unwrap();
        let heavier = hash_password(
            "pw",
            &salt,
            KdfParams {
                iterations: 2,
                ..TEST_KDF
            },
        )
        .await
        .unwrap();
        assert_ne!(light, heavier);
    }
}
