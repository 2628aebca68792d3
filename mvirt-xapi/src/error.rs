//! Error types for the XAPI bridge.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while talking to a pool.
#[derive(Debug, Error)]
pub enum XapiError {
    /// A required connection parameter is missing.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Every candidate credential was rejected.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The contacted member is a pool slave. Only used for redirecting.
    #[error("host is a pool slave, master is {master}")]
    HostIsSlave { master: String },

    /// The target host is administratively disabled.
    #[error("host {host_uuid} is disabled")]
    HostDisabled { host_uuid: String },

    /// The session reference is no longer known to the pool.
    #[error("session invalid: {0}")]
    SessionInvalid(String),

    /// An object reference (task, VM, host) no longer exists.
    #[error("handle invalid: {class} {handle}")]
    HandleInvalid { class: String, handle: String },

    /// XML-RPC client error (connect, TLS, timeout, HTTP status).
    #[error("transport error: {0}")]
    Transport(String),

    /// XML-RPC level fault.
    #[error("XML-RPC fault {code}: {message}")]
    Fault { code: i64, message: String },

    /// The response could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Any other error description returned by the remote API.
    #[error("API call failed: {code} {params:?}")]
    Api { code: String, params: Vec<String> },

    /// No reachable member could be contacted.
    #[error("failed to connect to {address}: {source}")]
    Connection {
        address: String,
        #[source]
        source: Box<XapiError>,
    },

    /// Local poll deadline exceeded.
    #[error("task {task} timed out after {elapsed:?}")]
    TimedOut { task: String, elapsed: Duration },

    /// Task reached a terminal non-success state.
    #[error("task {task} failed: {error_info:?}")]
    TaskFailed {
        task: String,
        error_info: Vec<String>,
    },

    /// Optimistic state transition rejected.
    #[error("state conflict: {0}")]
    Conflict(String),
}

/// Result type for XAPI operations.
pub type Result<T> = std::result::Result<T, XapiError>;

impl XapiError {
    /// Classify a remote `ErrorDescription` (`[CODE, param...]`).
    pub fn from_error_description(description: Vec<String>) -> Self {
        let mut parts = description.into_iter();
        let code = parts.next().unwrap_or_default();
        let params: Vec<String> = parts.collect();

        match code.as_str() {
            "SESSION_INVALID" => {
                XapiError::SessionInvalid(params.first().cloned().unwrap_or_default())
            }
            "HOST_IS_SLAVE" => XapiError::HostIsSlave {
                master: params.first().cloned().unwrap_or_default(),
            },
            "SESSION_AUTHENTICATION_FAILED" => {
                XapiError::AuthenticationFailed(params.join(" "))
            }
            "HANDLE_INVALID" => XapiError::HandleInvalid {
                class: params.first().cloned().unwrap_or_default(),
                handle: params.get(1).cloned().unwrap_or_default(),
            },
            _ => XapiError::Api { code, params },
        }
    }

    /// Failures after which login moves on to the next credential.
    pub fn is_authentication_class(&self) -> bool {
        matches!(
            self,
            XapiError::AuthenticationFailed(_)
                | XapiError::Malformed(_)
                | XapiError::Transport(_)
                | XapiError::Fault { .. }
        )
    }

    /// Dispatch failures that make a cached connection unusable.
    pub fn evicts_connection(&self) -> bool {
        matches!(
            self,
            XapiError::SessionInvalid(_)
                | XapiError::Transport(_)
                | XapiError::Fault { .. }
                | XapiError::Malformed(_)
                | XapiError::HostIsSlave { .. }
        )
    }

    /// Strip `Connection` wrappers down to the underlying cause.
    pub fn root_cause(&self) -> &XapiError {
        match self {
            XapiError::Connection { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
