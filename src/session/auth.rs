//! Single-flight authentication.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{info, warn};

use super::correlation::CorrelationTable;
use crate::api::{AuthorizeRequest, AuthorizeResponse};
use crate::error::{EngineError, EngineResult};
use crate::models::AuthState;

type AuthFuture = Shared<BoxFuture<'static, EngineResult<AuthState>>>;

enum AuthSlot {
    Idle,
    InFlight { generation: u64, future: AuthFuture },
    Ready(AuthState),
    Disposed,
}

/// Owns the session's [`AuthState`].
///
/// Callers arriving while an `authorize` exchange is in flight join that
/// exchange instead of starting another one.
pub struct Authenticator {
    correlation: Arc<CorrelationTable>,
    token: Option<String>,
    slot: Mutex<AuthSlot>,
    generation: AtomicU64,
}

impl Authenticator {
    pub fn new(correlation: Arc<CorrelationTable>, token: Option<String>) -> Self {
        Self {
            correlation,
            token,
            slot: Mutex::new(AuthSlot::Idle),
            generation: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AuthSlot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Authenticated state, authorizing first if needed.
    ///
    /// Failure yields `AuthenticationFailed` and leaves the session
    /// unauthenticated; retrying is up to the caller.
    pub async fn ensure_authenticated(&self) -> EngineResult<AuthState> {
        let (generation, future) = {
            let mut slot = self.lock();
            match &*slot {
                AuthSlot::Ready(state) => return Ok(state.clone()),
                AuthSlot::Disposed => return Err(EngineError::SessionDisposed),
                AuthSlot::InFlight { generation, future } => (*generation, future.clone()),
                AuthSlot::Idle => {
                    let token = self.token.clone().ok_or_else(|| {
                        EngineError::AuthenticationFailed {
                            reason: "no API token configured".to_string(),
                        }
                    })?;
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    let future = authorize(Arc::clone(&self.correlation), token)
                        .boxed()
                        .shared();
                    *slot = AuthSlot::InFlight {
                        generation,
                        future: future.clone(),
                    };
                    (generation, future)
                }
            }
        };

        let result = future.await;

        let mut slot = self.lock();
        if matches!(&*slot, AuthSlot::InFlight { generation: g, .. } if *g == generation) {
            *slot = match &result {
                Ok(state) => AuthSlot::Ready(state.clone()),
                Err(_) => AuthSlot::Idle,
            };
        }
        result
    }

    pub fn current(&self) -> Option<AuthState> {
        match &*self.lock() {
            AuthSlot::Ready(state) => Some(state.clone()),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.current().is_some()
    }

    /// Forget the auth state; later calls fail with `SessionDisposed`.
    pub fn dispose(&self) {
        *self.lock() = AuthSlot::Disposed;
    }
}

async fn authorize(correlation: Arc<CorrelationTable>, token: String) -> EngineResult<AuthState> {
    let request = serde_json::to_value(AuthorizeRequest::new(token.clone()))
        .map_err(|e| EngineError::Protocol(e.to_string()))?;

    let response = match correlation.request(request).await {
        Ok(response) => response,
        Err(EngineError::SessionDisposed) => return Err(EngineError::SessionDisposed),
        Err(e) => {
            warn!(error = %e, "Authorization failed");
            return Err(EngineError::AuthenticationFailed { reason: e.reason() });
        }
    };

    let body = response
        .get("authorize")
        .cloned()
        .ok_or_else(|| EngineError::AuthenticationFailed {
            reason: "response has no authorize body".to_string(),
        })?;
    let body: AuthorizeResponse =
        serde_json::from_value(body).map_err(|e| EngineError::AuthenticationFailed {
            reason: format!("malformed authorize response: {}", e),
        })?;

    info!(
        login_id = %body.loginid,
        currency = %body.currency,
        accounts = body.account_list.len(),
        "Authorized"
    );

    Ok(AuthState {
        token,
        login_id: body.loginid,
        currency: body.currency,
        is_virtual: body.is_virtual,
        accounts: body.account_list,
        authenticated: true,
    })
}
