//! Session state and coordinated re-authorization
//!
//! Many workers share one [AuthSession]. When the remote store
//! rejects a token only one worker performs the refresh while
//! the others wait and then simply pick up the new state.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::{errors::TransferError, object_client::PartSizeHints};

/// Credentials and negotiated session values from a successful
/// authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    pub auth_token: String,
    pub api_url: String,
    pub download_url: String,
    /// Part size bounds the store announced during authorization
    pub part_size_hints: Option<PartSizeHints>,
}

/// Performs the actual authorization call against the remote store
pub trait Authorizer: Send + Sync + 'static {
    fn authorize(&self) -> BoxFuture<'static, Result<AuthState, TransferError>>;
}

struct SessionState {
    auth: Option<Arc<AuthState>>,
    /// Bumped on every successful refresh so a waiting caller can
    /// tell whether somebody else already did the work
    generation: u64,
}

/// Shared session handle
///
/// Cloning is cheap. All clones observe the same state.
#[derive(Clone)]
pub struct AuthSession {
    authorizer: Arc<dyn Authorizer>,
    state: Arc<Mutex<SessionState>>,
    refresh_lock: Arc<tokio::sync::Mutex<()>>,
}

impl AuthSession {
    pub fn new<A: Authorizer>(authorizer: A) -> Self {
        Self {
            authorizer: Arc::new(authorizer),
            state: Arc::new(Mutex::new(SessionState {
                auth: None,
                generation: 0,
            })),
            refresh_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Get the current state, authorizing first if there is none yet
    pub async fn current(&self) -> Result<Arc<AuthState>, TransferError> {
        if let Some(auth) = self.snapshot().1 {
            return Ok(auth);
        }

        self.refresh().await
    }

    /// Get a fresh state after the current one was rejected
    ///
    /// Only one caller performs the network call. Callers which
    /// arrive while a refresh is already running wait for it and
    /// return its result without a second call.
    pub async fn refresh(&self) -> Result<Arc<AuthState>, TransferError> {
        let (generation_seen, _) = self.snapshot();

        let _guard = self.refresh_lock.lock().await;

        let (generation_now, auth) = self.snapshot();
        if generation_now > generation_seen {
            if let Some(auth) = auth {
                debug!("another worker already refreshed the session");
                return Ok(auth);
            }
        }

        info!("authorizing session");
        let fresh = self.authorizer.authorize().await?;
        let fresh = Arc::new(fresh);

        let mut state = self.lock_state();
        state.auth = Some(Arc::clone(&fresh));
        state.generation += 1;

        Ok(fresh)
    }

    /// The part size bounds from the last authorization if any
    pub fn part_size_hints(&self) -> Option<PartSizeHints> {
        self.snapshot().1.and_then(|auth| auth.part_size_hints)
    }

    fn snapshot(&self) -> (u64, Option<Arc<AuthState>>) {
        let state = self.lock_state();
        (state.generation, state.auth.clone())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    use super::*;

    struct CountingAuthorizer {
        calls: Arc<AtomicUsize>,
    }

    impl Authorizer for CountingAuthorizer {
        fn authorize(&self) -> BoxFuture<'static, Result<AuthState, TransferError>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                tokio::task::yield_now().await;
                Ok(AuthState {
                    auth_token: format!("token-{call}"),
                    api_url: "http://api.localhost".to_owned(),
                    download_url: "http://download.localhost".to_owned(),
                    part_size_hints: None,
                })
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn current_authorizes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let session = AuthSession::new(CountingAuthorizer {
            calls: Arc::clone(&calls),
        });

        let first = session.current().await.unwrap();
        let second = session.current().await.unwrap();

        assert_eq!(first.auth_token, "token-1");
        assert_eq!(second.auth_token, "token-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_refreshes_collapse_into_one_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let session = AuthSession::new(CountingAuthorizer {
            calls: Arc::clone(&calls),
        });

        session.current().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = session.clone();
            handles.push(tokio::spawn(async move { session.refresh().await }));
        }

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap().auth_token.clone());
        }

        // Exactly one of the racing refreshes made a network call
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(tokens.iter().all(|t| t == "token-2"));
    }

    #[tokio::test]
    async fn sequential_refreshes_each_call_out() {
        let calls = Arc::new(AtomicUsize::new(0));
        let session = AuthSession::new(CountingAuthorizer {
            calls: Arc::clone(&calls),
        });

        session.refresh().await.unwrap();
        session.refresh().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
