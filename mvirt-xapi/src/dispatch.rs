//! Evict-on-fault dispatch for pooled connections.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::info;

use crate::error::{Result, XapiError};
use crate::pool::{ConnectionCache, remove_if_session};
use crate::session::{LOGIN_METHOD, LOGOUT_METHOD, SLAVE_LOGIN_METHOD};
use crate::transport::Transport;
use crate::xmlrpc::Value;

/// Wraps the raw transport of a pooled connection.
///
/// Fatal session or transport errors drop the pool's cache entry before the
/// error is handed back, so the next `connect` logs in again. The entry is
/// only dropped while it still holds this session. Holders of the evicted
/// connection keep using it; the session is logged out when the last one
/// releases it.
pub struct EvictOnFault {
    inner: Arc<dyn Transport>,
    pool_id: String,
    session_ref: String,
    cache: Weak<ConnectionCache>,
}

impl EvictOnFault {
    pub(crate) fn new(
        inner: Arc<dyn Transport>,
        pool_id: &str,
        session_ref: &str,
        cache: Weak<ConnectionCache>,
    ) -> Self {
        Self {
            inner,
            pool_id: pool_id.to_string(),
            session_ref: session_ref.to_string(),
            cache,
        }
    }

    async fn evict(&self, method: &str, cause: &XapiError) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        let Some(evicted) = remove_if_session(&cache, &self.pool_id, &self.session_ref).await
        else {
            return;
        };

        info!(
            pool_id = %self.pool_id,
            address = %self.inner.address(),
            method = %method,
            error = %cause,
            "Evicted pooled connection"
        );

        // A session the server already forgot cannot be logged out.
        if matches!(cause, XapiError::SessionInvalid(_)) {
            evicted.forget_session();
        }
    }
}

fn bypasses_eviction(method: &str) -> bool {
    matches!(method, LOGIN_METHOD | SLAVE_LOGIN_METHOD | LOGOUT_METHOD)
}

#[async_trait]
impl Transport for EvictOnFault {
    fn address(&self) -> &str {
        self.inner.address()
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        if bypasses_eviction(method) {
            return self.inner.call(method, params).await;
        }

        match self.inner.call(method, params).await {
            Err(e) if e.evicts_connection() => {
                self.evict(method, &e).await;
                Err(e)
            }
            other => other,
        }
    }
}
