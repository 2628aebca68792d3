//! mvirt-xapi - bridge between mvirt and XenServer/XCP-ng pools.
//!
//! Keeps one authenticated session per pool (following master changes),
//! and drives the pool's asynchronous tasks to completion.
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use mvirt_xapi::{HttpTransportFactory, XapiConfig, XapiResource};
//!
//! let config = XapiConfig::load("/etc/mvirt/xapi.json".as_ref())?;
//! let factory = Arc::new(HttpTransportFactory::new(config.accept_invalid_certs)?);
//! let resource = XapiResource::new(config, factory)?;
//! resource.start_vm("0b1e5c4e-...").await?;
//! resource.shutdown().await;
//! ```

pub mod api;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod locks;
pub mod pool;
pub mod resource;
pub mod session;
pub mod state;
pub mod task;
pub mod transport;
pub mod xmlrpc;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use api::{PoolRecord, TaskStatus, VmPowerState};
pub use config::XapiConfig;
pub use credentials::{CredentialStore, Secret};
pub use error::{Result, XapiError};
pub use pool::{ConnectRequest, Connection, ConnectionPool, ConnectionSettings};
pub use resource::XapiResource;
pub use session::{LoginOutcome, Session, login_with_fallback};
pub use state::{InMemoryStateStore, ObjectState, StateEvent, StateTransition, Versioned};
pub use task::{EndStateProbe, TaskOutcome, TaskRunner, VmPowerStateProbe};
pub use transport::{HttpTransport, HttpTransportFactory, Transport, TransportFactory};
