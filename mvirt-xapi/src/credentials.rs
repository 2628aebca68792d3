//! Candidate credentials for logging into a pool.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A password that never shows up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Secret::new(s)
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Secret::new(s)
    }
}

/// Username plus an ordered queue of candidate passwords.
///
/// The head is tried first. Rotation appends at the tail, failed logins
/// consume from the head, and the last entry is never consumed.
#[derive(Debug)]
pub struct CredentialStore {
    username: String,
    secrets: Mutex<VecDeque<Secret>>,
}

impl CredentialStore {
    pub fn new<I, S>(username: impl Into<String>, secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Secret>,
    {
        Self {
            username: username.into(),
            secrets: Mutex::new(secrets.into_iter().map(Into::into).collect()),
        }
    }

    fn secrets(&self) -> MutexGuard<'_, VecDeque<Secret>> {
        self.secrets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn current_head(&self) -> Option<Secret> {
        self.secrets().front().cloned()
    }

    pub fn len(&self) -> usize {
        self.secrets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets().is_empty()
    }

    /// Append a new password. The current head stays usable until it fails.
    pub fn rotate(&self, secret: impl Into<Secret>) {
        self.secrets().push_back(secret.into());
    }

    /// Drop `secret` if it is still the head and something remains behind it.
    ///
    /// Returns true if the head was removed. A concurrent login that already
    /// consumed the same head makes this a no-op.
    pub fn discard_if_head(&self, secret: &Secret) -> bool {
        let mut secrets = self.secrets();
        if secrets.len() > 1 && secrets.front() == Some(secret) {
            secrets.pop_front();
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> Vec<Secret> {
        self.secrets().iter().cloned().collect()
    }
}
