//! In-memory bearer credential store with single-flight refresh.
//!
//! The credential lives only in process memory. All mutations go through
//! `set_credential`/`clear`, and the refresh gate is the sole concurrency
//! guard: callers that arrive while a renewal is in flight wait on the gate
//! and observe the completed outcome instead of issuing a second renewal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Errors produced while renewing the bearer credential.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Network or transport failure while reaching the renewal endpoint.
    #[error("renewal transport failure: {0}")]
    Transport(String),

    /// Renewal endpoint rejected the request.
    #[error("renewal rejected with status {status}")]
    Rejected { status: u16 },

    /// Renewal response did not carry a usable credential.
    #[error("renewal response malformed: {0}")]
    MalformedResponse(String),
}

/// Remote collaborator that exchanges the renewal capability for a fresh
/// bearer credential. The capability itself is opaque to this crate.
#[async_trait]
pub trait CredentialRenewer: Send + Sync {
    async fn renew(&self) -> Result<SecretString, AuthError>;
}

/// Holds the current bearer credential and coordinates refresh.
pub struct SessionStore {
    renewer: Box<dyn CredentialRenewer>,
    credential: RwLock<Option<SecretString>>,
    refresh_gate: Mutex<()>,
    refresh_epoch: AtomicU64,
}

impl SessionStore {
    /// Creates an unauthenticated store backed by the given renewer.
    pub fn new(renewer: impl CredentialRenewer + 'static) -> Self {
        Self {
            renewer: Box::new(renewer),
            credential: RwLock::new(None),
            refresh_gate: Mutex::new(()),
            refresh_epoch: AtomicU64::new(0),
        }
    }

    /// True iff a non-empty credential is held.
    pub fn is_authenticated(&self) -> bool {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|credential| !credential.expose_secret().is_empty())
    }

    /// Returns a clone of the held credential, if any.
    pub fn credential(&self) -> Option<SecretString> {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the held credential.
    pub fn set_credential(&self, credential: SecretString) {
        *self
            .credential
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(credential);
    }

    /// Removes the credential; subsequent refreshes start unauthenticated.
    pub fn clear(&self) {
        *self
            .credential
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Renews the credential via the remote collaborator.
    ///
    /// Single-flight: concurrent callers do not start a second renewal. The
    /// first caller holds the gate across the renewal; late arrivals park on
    /// the gate and, once the epoch has advanced, return the shared outcome.
    /// A failed renewal always clears the store; it never preserves a stale
    /// credential.
    pub async fn refresh(&self) -> bool {
        let seen_epoch = self.refresh_epoch.load(Ordering::Acquire);
        let _gate = self.refresh_gate.lock().await;

        if self.refresh_epoch.load(Ordering::Acquire) != seen_epoch {
            // A refresh completed while this caller waited on the gate.
            let shared = self.is_authenticated();
            debug!(event = "credential_refresh_joined", outcome = shared);
            return shared;
        }

        let outcome = match self.renewer.renew().await {
            Ok(credential) if !credential.expose_secret().is_empty() => {
                self.set_credential(credential);
                debug!(event = "credential_refresh_ok");
                true
            }
            Ok(_) => {
                warn!(event = "credential_refresh_failed", reason = "empty credential");
                self.clear();
                false
            }
            Err(err) => {
                warn!(event = "credential_refresh_failed", error = %err);
                self.clear();
                false
            }
        };

        self.refresh_epoch.fetch_add(1, Ordering::Release);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use secrecy::{ExposeSecret, SecretString};

    use super::{AuthError, CredentialRenewer, SessionStore};

    struct CountingRenewer {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl CredentialRenewer for CountingRenewer {
        async fn renew(&self) -> Result<SecretString, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                Err(AuthError::Rejected { status: 403 })
            } else {
                Ok(SecretString::new("renewed-token".to_string()))
            }
        }
    }

    fn store_with(fail: bool) -> (SessionStore, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = SessionStore::new(CountingRenewer {
            calls: Arc::clone(&calls),
            fail,
        });
        (store, calls)
    }

    #[tokio::test]
    async fn starts_unauthenticated_and_tracks_credential() {
        let (store, _) = store_with(false);
        assert!(!store.is_authenticated());

        store.set_credential(SecretString::new("abc".to_string()));
        assert!(store.is_authenticated());
        assert_eq!(
            store.credential().expect("credential").expose_secret(),
            "abc"
        );

        store.clear();
        assert!(!store.is_authenticated());
    }

    #[tokio::test]
    async fn empty_credential_does_not_authenticate() {
        let (store, _) = store_with(false);
        store.set_credential(SecretString::new(String::new()));
        assert!(!store.is_authenticated());
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_renewal() {
        let (store, calls) = store_with(false);

        let (first, second) = tokio::join!(store.refresh(), store.refresh());
        assert!(first);
        assert!(second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.is_authenticated());
    }

    #[tokio::test]
    async fn failed_refresh_clears_stale_credential() {
        let (store, calls) = store_with(true);
        store.set_credential(SecretString::new("stale".to_string()));

        assert!(!store.refresh().await);
        assert!(!store.is_authenticated());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_observe_shared_failure() {
        let (store, calls) = store_with(true);

        let (first, second) = tokio::join!(store.refresh(), store.refresh());
        assert!(!first);
        assert!(!second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_gate_is_released_after_failure() {
        let (store, calls) = store_with(true);

        assert!(!store.refresh().await);
        assert!(!store.refresh().await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
