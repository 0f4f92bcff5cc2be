//! Credential-aware call wrapper with a single refresh-and-retry path.
//!
//! This is the only sanctioned retry path in the crate: an authorization
//! failure triggers exactly one refresh and, when that succeeds, exactly one
//! retry. Everything else propagates unchanged.

use std::future::Future;
use std::sync::Arc;

use secrecy::SecretString;
use thiserror::Error;
use tracing::debug;

use crate::auth::session::SessionStore;

/// Failure of an invoked operation, or of the authentication around it.
#[derive(Debug, Error)]
pub enum InvokeError<E> {
    /// No credential is held; the caller must authenticate first.
    #[error("no credential held; authenticate before calling")]
    Unauthenticated,

    /// The credential expired and refresh failed; re-login is required.
    #[error("credential refresh failed; re-authentication required")]
    AuthenticationRequired,

    /// The operation itself failed for a non-authentication reason.
    #[error("operation failed: {0}")]
    Op(E),
}

/// Wraps remote calls with the live credential and 401-driven refresh.
#[derive(Clone)]
pub struct AuthenticatedInvoker {
    session: Arc<SessionStore>,
}

impl AuthenticatedInvoker {
    pub fn new(session: Arc<SessionStore>) -> Self {
        Self { session }
    }

    /// The session store this invoker consults.
    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    /// Executes `op` with the current credential.
    ///
    /// `op` receives the live credential and may be called at most twice:
    /// once up front, and once more after a successful refresh when
    /// `is_unauthorized` classified the first failure as an authorization
    /// error. The retry outcome is final.
    pub async fn invoke<T, E, Op, Fut, IsAuth>(
        &self,
        mut op: Op,
        is_unauthorized: IsAuth,
    ) -> Result<T, InvokeError<E>>
    where
        Op: FnMut(SecretString) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        IsAuth: Fn(&E) -> bool,
    {
        let Some(credential) = self.session.credential() else {
            return Err(InvokeError::Unauthenticated);
        };

        match op(credential).await {
            Ok(value) => Ok(value),
            Err(err) if is_unauthorized(&err) => {
                debug!(event = "invoke_unauthorized_refreshing");
                if !self.session.refresh().await {
                    return Err(InvokeError::AuthenticationRequired);
                }
                let Some(renewed) = self.session.credential() else {
                    return Err(InvokeError::AuthenticationRequired);
                };
                op(renewed).await.map_err(InvokeError::Op)
            }
            Err(err) => Err(InvokeError::Op(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use secrecy::{ExposeSecret, SecretString};

    use super::{AuthenticatedInvoker, InvokeError};
    use crate::auth::session::{AuthError, CredentialRenewer, SessionStore};

    struct FixedRenewer {
        outcome: Result<&'static str, u16>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CredentialRenewer for FixedRenewer {
        async fn renew(&self) -> Result<SecretString, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.outcome {
                Ok(token) => Ok(SecretString::new(token.to_string())),
                Err(status) => Err(AuthError::Rejected { status }),
            }
        }
    }

    fn invoker_with(
        initial: Option<&str>,
        renewal: Result<&'static str, u16>,
    ) -> (AuthenticatedInvoker, Arc<AtomicUsize>) {
        let renew_calls = Arc::new(AtomicUsize::new(0));
        let session = Arc::new(SessionStore::new(FixedRenewer {
            outcome: renewal,
            calls: Arc::clone(&renew_calls),
        }));
        if let Some(token) = initial {
            session.set_credential(SecretString::new(token.to_string()));
        }
        (AuthenticatedInvoker::new(session), renew_calls)
    }

    #[derive(Debug, PartialEq)]
    enum FakeError {
        Unauthorized,
        Timeout,
    }

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    #[tokio::test]
    async fn fails_fast_without_credential() {
        let (invoker, renew_calls) = invoker_with(None, Ok("fresh"));
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = invoker
            .invoke(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(FakeError::Unauthorized) }
                },
                |err| matches!(err, FakeError::Unauthorized),
            )
            .await;

        assert!(matches!(result, Err(InvokeError::Unauthenticated)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(renew_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retries_once_after_successful_refresh() {
        let (invoker, renew_calls) = invoker_with(Some("expired"), Ok("fresh"));
        let calls = AtomicUsize::new(0);

        let result = invoker
            .invoke(
                |credential| {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst);
                    let token = credential.expose_secret().to_string();
                    async move {
                        if attempt == 0 {
                            Err(FakeError::Unauthorized)
                        } else {
                            Ok(token)
                        }
                    }
                },
                |err| matches!(err, FakeError::Unauthorized),
            )
            .await;

        assert_eq!(result.expect("retried call succeeds"), "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(renew_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_failure_is_final() {
        let (invoker, renew_calls) = invoker_with(Some("expired"), Ok("fresh"));
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = invoker
            .invoke(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(FakeError::Unauthorized) }
                },
                |err| matches!(err, FakeError::Unauthorized),
            )
            .await;

        assert!(matches!(result, Err(InvokeError::Op(FakeError::Unauthorized))));
        // No third attempt even though the retry failed with 401 again.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(renew_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_requires_reauthentication() {
        let (invoker, renew_calls) = invoker_with(Some("expired"), Err(403));
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = invoker
            .invoke(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(FakeError::Unauthorized) }
                },
                |err| matches!(err, FakeError::Unauthorized),
            )
            .await;

        assert!(matches!(result, Err(InvokeError::AuthenticationRequired)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(renew_calls.load(Ordering::SeqCst), 1);
        assert!(!invoker.session().is_authenticated());
    }

    #[tokio::test]
    async fn non_authorization_failures_propagate_without_refresh() {
        let (invoker, renew_calls) = invoker_with(Some("valid"), Ok("fresh"));
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = invoker
            .invoke(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(FakeError::Timeout) }
                },
                |err| matches!(err, FakeError::Unauthorized),
            )
            .await;

        assert!(matches!(result, Err(InvokeError::Op(FakeError::Timeout))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(renew_calls.load(Ordering::SeqCst), 0);
    }
}
