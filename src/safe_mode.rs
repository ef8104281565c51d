//! Safe Mode: a fail-closed posture for encryption-dependent persisted credential
//! storage, entered when cryptographic modules fail to initialize (§7, §9). Grounded in
//! `cloudllm::mcp_server_builder_utils::AuthConfig::validate`'s use of `sha2` + `subtle`
//! to compare secrets in constant time rather than with `==`, which an optimizer can
//! short-circuit into a timing oracle.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Whether encryption-dependent flows (persisted credential storage) are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeModeStatus {
    /// Crypto modules initialized normally; credential storage is enabled.
    Normal,
    /// Crypto modules failed to initialize; credential storage is disabled and callers
    /// must fall back to plaintext-allowed paths only where correctness is preserved.
    Degraded { reason: String },
}

impl SafeModeStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, SafeModeStatus::Degraded { .. })
    }
}

/// Stores a single hashed credential (e.g. an API key) and compares candidates against
/// it in constant time. Construction fails closed: an empty credential is rejected
/// rather than silently accepting anything.
pub struct CredentialStore {
    digest: [u8; 32],
}

impl CredentialStore {
    pub fn new(credential: &str) -> Result<Self, String> {
        if credential.is_empty() {
            return Err("credential must not be empty".to_string());
        }
        let digest: [u8; 32] = Sha256::digest(credential.as_bytes()).into();
        Ok(CredentialStore { digest })
    }

    /// Constant-time comparison: the optimizer cannot short-circuit `ct_eq`, unlike `==`.
    pub fn matches(&self, candidate: &str) -> bool {
        let candidate_digest: [u8; 32] = Sha256::digest(candidate.as_bytes()).into();
        self.digest.ct_eq(&candidate_digest).into()
    }
}

/// Guards access to a [`CredentialStore`] behind the crate's Safe Mode posture. When
/// degraded, every credential operation is refused with `ReverieError::SafeMode` rather
/// than falling back to an insecure plaintext comparison.
pub struct SafeModeGuard {
    status: SafeModeStatus,
}

impl SafeModeGuard {
    pub fn normal() -> Self {
        SafeModeGuard {
            status: SafeModeStatus::Normal,
        }
    }

    pub fn degraded(reason: impl Into<String>) -> Self {
        SafeModeGuard {
            status: SafeModeStatus::Degraded { reason: reason.into() },
        }
    }

    pub fn status(&self) -> &SafeModeStatus {
        &self.status
    }

    /// Stores a credential, refusing when Safe Mode is active.
    pub fn store_credential(&self, credential: &str) -> crate::errors::Result<CredentialStore> {
        match &self.status {
            SafeModeStatus::Normal => {
                CredentialStore::new(credential).map_err(crate::errors::ReverieError::validation)
            }
            SafeModeStatus::Degraded { reason } => Err(crate::errors::ReverieError::SafeMode {
                message: format!("credential storage disabled: {reason}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_credential_compares_equal() {
        let store = CredentialStore::new("sk-test-key").unwrap();
        assert!(store.matches("sk-test-key"));
        assert!(!store.matches("sk-wrong-key"));
    }

    #[test]
    fn empty_credential_is_rejected() {
        assert!(CredentialStore::new("").is_err());
    }

    #[test]
    fn degraded_guard_refuses_storage() {
        let guard = SafeModeGuard::degraded("crypto module failed to initialize");
        let err = guard.store_credential("sk-test-key").unwrap_err();
        assert!(matches!(err, crate::errors::ReverieError::SafeMode { .. }));
    }

    #[test]
    fn normal_guard_allows_storage() {
        let guard = SafeModeGuard::normal();
        let store = guard.store_credential("sk-test-key").unwrap();
        assert!(store.matches("sk-test-key"));
    }
}
