//! Test utilities for mvirt-xapi.
//!
//! Provides an in-memory pool that speaks the subset of XAPI the bridge uses,
//! with call counters and fault injection.

pub mod fake_cluster;

pub use fake_cluster::{FakeCluster, Fault, LoginGate, TaskPlan};

use std::sync::Arc;
use std::time::Duration;

use crate::credentials::CredentialStore;
use crate::pool::{ConnectRequest, ConnectionSettings};

/// Default pool id used by tests.
pub const TEST_POOL: &str = "pool-a";

/// Build a connect request against `address` for `pool_id`.
pub fn connect_request(
    pool_id: &str,
    host_uuid: &str,
    address: &str,
    credentials: Arc<CredentialStore>,
) -> ConnectRequest {
    ConnectRequest {
        host_uuid: host_uuid.to_string(),
        pool_id: pool_id.to_string(),
        address: address.to_string(),
        credentials,
        settings: ConnectionSettings {
            wait: Duration::from_secs(5),
            retries: 1,
            retry_interval: Duration::from_millis(10),
            ..Default::default()
        },
    }
}

/// Credentials with the given passwords for user `root`.
pub fn credentials(passwords: &[&str]) -> Arc<CredentialStore> {
    Arc::new(CredentialStore::new("root", passwords.iter().copied()))
}
