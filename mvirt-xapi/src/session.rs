//! Authenticated sessions and the credential-fallback login protocol.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::credentials::{CredentialStore, Secret};
use crate::error::{Result, XapiError};
use crate::transport::Transport;
use crate::xmlrpc::Value;

pub(crate) const LOGIN_METHOD: &str = "session.login_with_password";
pub(crate) const SLAVE_LOGIN_METHOD: &str = "session.slave_local_login_with_password";
pub(crate) const LOGOUT_METHOD: &str = "session.logout";

/// One authenticated handle on a pool member.
pub struct Session {
    address: String,
    session_ref: String,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address)
            .field("session_ref", &self.session_ref)
            .finish()
    }
}

impl Session {
    pub fn new(address: &str, session_ref: String, transport: Arc<dyn Transport>) -> Self {
        Self {
            address: address.to_string(),
            session_ref,
            transport,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn session_ref(&self) -> &str {
        &self.session_ref
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Call `method` with the session reference prepended.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.transport
            .call(method, with_session(&self.session_ref, args))
            .await
    }

    /// Invalidate the session on the server. Failures are logged only.
    pub async fn logout(&self) {
        match self
            .transport
            .call(LOGOUT_METHOD, vec![Value::from(self.session_ref.as_str())])
            .await
        {
            Ok(_) => debug!(address = %self.address, "Session logged out"),
            Err(e) => {
                warn!(address = %self.address, error = %e, "Failed to log out session")
            }
        }
    }
}

pub(crate) fn with_session(session_ref: &str, args: Vec<Value>) -> Vec<Value> {
    let mut params = Vec::with_capacity(args.len() + 1);
    params.push(Value::from(session_ref));
    params.extend(args);
    params
}

/// Result of one login protocol run against one member.
#[derive(Debug)]
pub enum LoginOutcome {
    Authenticated(Session),
    /// The member is a slave. Contains the master's address.
    RedirectTo(String),
    Failed(XapiError),
}

async fn login_once(
    transport: &Arc<dyn Transport>,
    username: &str,
    secret: &Secret,
    api_version: &str,
    originator: &str,
) -> Result<String> {
    transport
        .call(
            LOGIN_METHOD,
            vec![
                Value::from(username),
                Value::from(secret.expose()),
                Value::from(api_version),
                Value::from(originator),
            ],
        )
        .await?
        .into_string()
}

/// Log in, falling back through the candidate credentials.
///
/// Authentication-class failures consume the head and retry with the next
/// candidate. The last candidate is never consumed; its failure ends the
/// protocol. A slave member short-circuits into [`LoginOutcome::RedirectTo`].
pub async fn login_with_fallback(
    transport: Arc<dyn Transport>,
    credentials: &CredentialStore,
    api_version: &str,
    originator: &str,
) -> LoginOutcome {
    let address = transport.address().to_string();
    let username = credentials.username();

    loop {
        let Some(secret) = credentials.current_head() else {
            return LoginOutcome::Failed(XapiError::Configuration(format!(
                "no credentials configured for {username}"
            )));
        };

        match login_once(&transport, username, &secret, api_version, originator).await {
            Ok(session_ref) => {
                info!(address = %address, username = %username, "Logged in");
                return LoginOutcome::Authenticated(Session::new(
                    &address,
                    session_ref,
                    transport,
                ));
            }
            Err(XapiError::HostIsSlave { master }) => {
                info!(address = %address, master = %master, "Member is a slave, redirecting");
                return LoginOutcome::RedirectTo(master);
            }
            Err(e) if e.is_authentication_class() => {
                if credentials.discard_if_head(&secret) {
                    warn!(
                        address = %address,
                        username = %username,
                        error = %e,
                        remaining = credentials.len(),
                        "Login failed, trying next credential"
                    );
                    continue;
                }
                // Someone else consumed this head concurrently; try the new one.
                if credentials
                    .current_head()
                    .is_some_and(|head| head != secret)
                {
                    continue;
                }
                warn!(address = %address, username = %username, error = %e, "Login failed, no credentials left");
                return LoginOutcome::Failed(e);
            }
            Err(e) => {
                warn!(address = %address, username = %username, error = %e, "Login failed");
                return LoginOutcome::Failed(e);
            }
        }
    }
}
