//! Master-aware connection pool.
//!
//! One cached [`Connection`] per pool id. Establishment and validation for a
//! given pool id run under that pool id's lock; other pools are unaffected.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::api::{self, XapiCall};
use crate::credentials::CredentialStore;
use crate::dispatch::EvictOnFault;
use crate::error::{Result, XapiError};
use crate::locks::KeyedLocks;
use crate::session::{LoginOutcome, Session, login_with_fallback, with_session};
use crate::transport::{Transport, TransportFactory};
use crate::xmlrpc::Value;

pub(crate) type ConnectionCache = RwLock<HashMap<String, Arc<Connection>>>;

/// Per-connection parameters kept for reconnects and call-level retries.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Per-request timeout.
    pub wait: Duration,
    /// Retries for idempotent calls after a connection-evicting failure.
    pub retries: u32,
    pub retry_interval: Duration,
    pub api_version: String,
    pub originator: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(600),
            retries: 1,
            retry_interval: Duration::from_millis(200),
            api_version: "1.0".to_string(),
            originator: "mvirt-xapi".to_string(),
        }
    }
}

/// Everything needed to reach and authenticate against a pool.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub host_uuid: String,
    pub pool_id: String,
    pub address: String,
    pub credentials: Arc<CredentialStore>,
    pub settings: ConnectionSettings,
}

impl ConnectRequest {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("host uuid", &self.host_uuid),
            ("pool id", &self.pool_id),
            ("address", &self.address),
        ] {
            if value.trim().is_empty() {
                return Err(XapiError::Configuration(format!("{name} is required")));
            }
        }
        if self.credentials.username().is_empty() || self.credentials.is_empty() {
            return Err(XapiError::Configuration(
                "credentials are required".to_string(),
            ));
        }
        Ok(())
    }
}

/// An authenticated, pool-scoped channel.
///
/// Calls go through [`EvictOnFault`]. A connection dropped from the pool stays
/// usable by whoever still holds it; its session is logged out once the last
/// handle is released.
pub struct Connection {
    pool_id: String,
    pool_uuid: String,
    session: Session,
    dispatch: Arc<dyn Transport>,
    settings: ConnectionSettings,
    logged_out: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("pool_id", &self.pool_id)
            .field("pool_uuid", &self.pool_uuid)
            .field("address", &self.session.address())
            .finish()
    }
}

impl Connection {
    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn pool_uuid(&self) -> &str {
        &self.pool_uuid
    }

    pub fn address(&self) -> &str {
        self.session.address()
    }

    pub fn session_ref(&self) -> &str {
        self.session.session_ref()
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Issue a call; fatal failures evict this connection from its pool.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.dispatch
            .call(method, with_session(self.session.session_ref(), args))
            .await
    }

    async fn logout(&self) {
        if !self.logged_out.swap(true, Ordering::AcqRel) {
            self.session.logout().await;
        }
    }

    /// The server already dropped the session; skip the logout on release.
    pub(crate) fn forget_session(&self) {
        self.logged_out.store(true, Ordering::Release);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.logged_out.load(Ordering::Acquire) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(pool_id = %self.pool_id, "No runtime, session left to expire");
            return;
        };
        let session = Session::new(
            self.session.address(),
            self.session.session_ref().to_string(),
            Arc::clone(self.session.transport()),
        );
        handle.spawn(async move { session.logout().await });
    }
}

#[async_trait]
impl XapiCall for Connection {
    async fn xapi_call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call(method, args).await
    }
}

/// Remove `pool_id`'s entry if it still holds `session_ref`.
pub(crate) async fn remove_if_session(
    cache: &ConnectionCache,
    pool_id: &str,
    session_ref: &str,
) -> Option<Arc<Connection>> {
    let mut connections = cache.write().await;
    if connections
        .get(pool_id)
        .is_some_and(|conn| conn.session_ref() == session_ref)
    {
        connections.remove(pool_id)
    } else {
        None
    }
}

/// Cache of live connections keyed by pool id.
pub struct ConnectionPool {
    factory: Arc<dyn TransportFactory>,
    connections: Arc<ConnectionCache>,
    locks: KeyedLocks,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            connections: Arc::new(RwLock::new(HashMap::new())),
            locks: KeyedLocks::new(),
        }
    }

    /// Return a validated connection for the request's pool, logging in if needed.
    pub async fn connect(&self, req: &ConnectRequest) -> Result<Arc<Connection>> {
        req.validate()?;
        let pool_id = req.pool_id.trim();
        let result = {
            let _guard = self.locks.lock(pool_id).await;
            self.connect_locked(pool_id, req).await
        };
        self.locks.prune().await;
        result
    }

    async fn connect_locked(&self, pool_id: &str, req: &ConnectRequest) -> Result<Arc<Connection>> {
        if let Some(conn) = self.get(pool_id).await {
            match host_enabled(conn.as_ref(), &req.host_uuid).await {
                Ok(true) => {
                    debug!(pool_id = %pool_id, address = %conn.address(), "Reusing cached connection");
                    return Ok(conn);
                }
                Ok(false) => {
                    warn!(pool_id = %pool_id, host_uuid = %req.host_uuid, "Host is disabled");
                    if conn.address() == req.address.trim() {
                        self.evict_connection(pool_id, &conn).await;
                    }
                    return Err(XapiError::HostDisabled {
                        host_uuid: req.host_uuid.clone(),
                    });
                }
                Err(e) => {
                    warn!(pool_id = %pool_id, error = %e, "Cached connection failed validation, reconnecting");
                    self.evict_connection(pool_id, &conn).await;
                }
            }
        }

        let conn = Arc::new(self.establish(pool_id, req).await?);
        self.connections
            .write()
            .await
            .insert(pool_id.to_string(), Arc::clone(&conn));
        info!(
            pool_id = %pool_id,
            pool_uuid = %conn.pool_uuid(),
            address = %conn.address(),
            "Connection established"
        );
        Ok(conn)
    }

    async fn establish(&self, pool_id: &str, req: &ConnectRequest) -> Result<Connection> {
        let address = req.address.trim();
        info!(pool_id = %pool_id, address = %address, "Connecting to pool");

        let session = match self.login(address, req).await {
            LoginOutcome::Authenticated(session) => session,
            LoginOutcome::RedirectTo(master) => match self.login(&master, req).await {
                LoginOutcome::Authenticated(session) => session,
                // Only the master named by the first member is tried.
                LoginOutcome::RedirectTo(other) => {
                    return Err(connection_error(
                        &master,
                        XapiError::HostIsSlave { master: other },
                    ));
                }
                LoginOutcome::Failed(e) => return Err(connection_error(&master, e)),
            },
            LoginOutcome::Failed(e) => return Err(connection_error(address, e)),
        };

        let checked = async {
            let enabled = host_enabled(&session, &req.host_uuid).await?;
            let pool_ref = api::pool_get_all(&session)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| XapiError::Malformed("pool.get_all returned no pools".into()))?;
            let pool_uuid = api::pool_get_uuid(&session, &pool_ref).await?;
            Ok::<_, XapiError>((enabled, pool_uuid))
        }
        .await;

        let pool_uuid = match checked {
            Ok((true, pool_uuid)) => pool_uuid,
            Ok((false, _)) => {
                session.logout().await;
                return Err(XapiError::HostDisabled {
                    host_uuid: req.host_uuid.clone(),
                });
            }
            Err(e) => {
                session.logout().await;
                return Err(connection_error(session.address(), e));
            }
        };

        let dispatch: Arc<dyn Transport> = Arc::new(EvictOnFault::new(
            Arc::clone(session.transport()),
            pool_id,
            session.session_ref(),
            Arc::downgrade(&self.connections),
        ));

        Ok(Connection {
            pool_id: pool_id.to_string(),
            pool_uuid,
            session,
            dispatch,
            settings: req.settings.clone(),
            logged_out: AtomicBool::new(false),
        })
    }

    async fn login(&self, address: &str, req: &ConnectRequest) -> LoginOutcome {
        let transport = self.factory.open(address, req.settings.wait);
        login_with_fallback(
            transport,
            &req.credentials,
            &req.settings.api_version,
            &req.settings.originator,
        )
        .await
    }

    /// Cached connection for `pool_id`, without validation.
    pub async fn get(&self, pool_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(pool_id.trim()).cloned()
    }

    /// Drop and log out the cached connection for `pool_id`.
    pub async fn evict(&self, pool_id: &str) -> bool {
        let removed = self.connections.write().await.remove(pool_id.trim());
        match removed {
            Some(conn) => {
                info!(pool_id = %pool_id, address = %conn.address(), "Evicted connection");
                conn.logout().await;
                true
            }
            None => false,
        }
    }

    /// Drop `conn` from the cache; its session ends when the last holder lets go.
    async fn evict_connection(&self, pool_id: &str, conn: &Connection) {
        if remove_if_session(&self.connections, pool_id, conn.session_ref())
            .await
            .is_some()
        {
            info!(pool_id = %pool_id, address = %conn.address(), "Evicted connection");
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Log out every cached session and empty the pool.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.connections.write().await.drain().collect();
        for (pool_id, conn) in drained {
            debug!(pool_id = %pool_id, "Closing connection");
            conn.logout().await;
        }
        self.locks.prune().await;
        info!("Connection pool shut down");
    }
}

async fn host_enabled<C: XapiCall + ?Sized>(c: &C, host_uuid: &str) -> Result<bool> {
    let host_ref = api::host_get_by_uuid(c, host_uuid).await?;
    api::host_get_enabled(c, &host_ref).await
}

fn connection_error(address: &str, cause: XapiError) -> XapiError {
    match cause {
        e @ (XapiError::AuthenticationFailed(_)
        | XapiError::Configuration(_)
        | XapiError::HostDisabled { .. }) => e,
        e => XapiError::Connection {
            address: address.to_string(),
            source: Box::new(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_util::{FakeCluster, connect_request, credentials};

    fn request(pool_id: &str, address: &str) -> ConnectRequest {
        ConnectRequest {
            host_uuid: "host-1".into(),
            pool_id: pool_id.into(),
            address: address.into(),
            credentials: Arc::new(CredentialStore::new("root", ["pw"])),
            settings: ConnectionSettings::default(),
        }
    }

    #[test]
    fn validate_rejects_missing_fields() {
        assert!(request("pool", "10.0.0.1").validate().is_ok());
        assert!(matches!(
            request("", "10.0.0.1").validate(),
            Err(XapiError::Configuration(_))
        ));
        assert!(matches!(
            request("pool", "  ").validate(),
            Err(XapiError::Configuration(_))
        ));

        let mut req = request("pool", "10.0.0.1");
        req.credentials = Arc::new(CredentialStore::new("root", Vec::<String>::new()));
        assert!(matches!(req.validate(), Err(XapiError::Configuration(_))));
    }

    #[test]
    fn connection_error_keeps_auth_failures_unwrapped() {
        assert!(matches!(
            connection_error("a", XapiError::AuthenticationFailed("x".into())),
            XapiError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            connection_error("a", XapiError::Transport("x".into())),
            XapiError::Connection { address, .. } if address == "a"
        ));
    }

    #[tokio::test]
    async fn connect_leaves_no_idle_locks_behind() {
        let cluster = FakeCluster::new("pool-uuid-1");
        cluster.add_master("10.0.0.1", "host-1");
        cluster.accept_password("pw");
        let pool = ConnectionPool::new(Arc::new(cluster.clone()));

        for pool_id in ["pool-a", "pool-b", " pool-c "] {
            pool.connect(&connect_request(pool_id, "host-1", "10.0.0.1", credentials(&["pw"])))
                .await
                .unwrap();
        }
        cluster.reject_password("pw");
        assert!(
            pool.connect(&connect_request("pool-d", "host-1", "10.0.0.1", credentials(&["pw"])))
                .await
                .is_err()
        );

        assert_eq!(pool.len().await, 3);
        assert_eq!(pool.locks.len().await, 0);
    }

    #[tokio::test]
    async fn evicted_connection_logs_out_on_last_release() {
        let cluster = FakeCluster::new("pool-uuid-1");
        cluster.add_master("10.0.0.1", "host-1");
        cluster.accept_password("pw");
        let pool = ConnectionPool::new(Arc::new(cluster.clone()));
        let conn = pool
            .connect(&connect_request("pool-a", "host-1", "10.0.0.1", credentials(&["pw"])))
            .await
            .unwrap();

        pool.evict_connection("pool-a", &conn).await;
        assert!(pool.is_empty().await);
        assert!(api::pool_get_all(conn.as_ref()).await.is_ok());
        assert_eq!(cluster.calls("session.logout"), 0);

        drop(conn);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cluster.calls("session.logout"), 1);
        assert_eq!(cluster.active_sessions(), 0);
    }
}
