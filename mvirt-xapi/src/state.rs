//! Optimistic state transitions for objects whose operations run on the pool.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, XapiError};

/// Lifecycle of a managed object as tracked by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Migrating,
    Error,
}

/// What moved an object between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    StartRequested,
    StopRequested,
    MigrationRequested,
    OperationSucceeded,
    OperationFailed,
}

impl fmt::Display for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A stored object with its version counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub id: String,
    pub state: ObjectState,
    pub updated_count: u64,
}

/// Persistence contract for state changes.
///
/// `update_state` applies only if the stored state is `current` and the stored
/// `updated_count` still equals `object.updated_count`; otherwise it returns
/// `Ok(false)` and the caller has to re-read.
#[async_trait]
pub trait StateTransition: Send + Sync {
    async fn update_state(
        &self,
        current: ObjectState,
        event: StateEvent,
        next: ObjectState,
        object: &Versioned,
        aux: Option<&str>,
    ) -> Result<bool>;

    async fn get(&self, id: &str) -> Result<Option<Versioned>>;
}

/// In-memory implementation, useful standalone and in tests.
#[derive(Default)]
pub struct InMemoryStateStore {
    objects: RwLock<HashMap<String, Versioned>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: &str, state: ObjectState) {
        self.objects.write().await.insert(
            id.to_string(),
            Versioned {
                id: id.to_string(),
                state,
                updated_count: 0,
            },
        );
    }
}

#[async_trait]
impl StateTransition for InMemoryStateStore {
    async fn update_state(
        &self,
        current: ObjectState,
        event: StateEvent,
        next: ObjectState,
        object: &Versioned,
        aux: Option<&str>,
    ) -> Result<bool> {
        let mut objects = self.objects.write().await;
        let Some(stored) = objects.get_mut(&object.id) else {
            return Ok(false);
        };
        if stored.state != current || stored.updated_count != object.updated_count {
            return Ok(false);
        }
        stored.state = next;
        stored.updated_count += 1;
        debug!(id = %object.id, event = %event, from = ?current, to = ?next, aux = ?aux, "State updated");
        Ok(true)
    }

    async fn get(&self, id: &str) -> Result<Option<Versioned>> {
        Ok(self.objects.read().await.get(id).cloned())
    }
}

/// Move `id` to `next`, re-reading and retrying when the update is rejected.
///
/// Fails with `Conflict` if the object is missing or every attempt lost the race.
pub async fn transition(
    store: &dyn StateTransition,
    id: &str,
    event: StateEvent,
    next: ObjectState,
    attempts: u32,
) -> Result<Versioned> {
    for attempt in 1..=attempts.max(1) {
        let object = store
            .get(id)
            .await?
            .ok_or_else(|| XapiError::Conflict(format!("{id} not found")))?;

        if store
            .update_state(object.state, event, next, &object, None)
            .await?
        {
            return Ok(Versioned {
                state: next,
                updated_count: object.updated_count + 1,
                ..object
            });
        }
        warn!(id = %id, event = %event, attempt = attempt, "State update rejected, retrying");
    }

    Err(XapiError::Conflict(format!(
        "{id}: {event} lost every update attempt"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_requires_matching_version() {
        let store = InMemoryStateStore::new();
        store.insert("vm-1", ObjectState::Stopped).await;
        let stale = store.get("vm-1").await.unwrap().unwrap();

        assert!(
            store
                .update_state(
                    ObjectState::Stopped,
                    StateEvent::StartRequested,
                    ObjectState::Starting,
                    &stale,
                    None
                )
                .await
                .unwrap()
        );
        // Same read, second writer loses.
        assert!(
            !store
                .update_state(
                    ObjectState::Stopped,
                    StateEvent::StartRequested,
                    ObjectState::Starting,
                    &stale,
                    None
                )
                .await
                .unwrap()
        );

        let current = store.get("vm-1").await.unwrap().unwrap();
        assert_eq!(current.state, ObjectState::Starting);
        assert_eq!(current.updated_count, 1);
    }

    #[tokio::test]
    async fn transition_rereads_and_succeeds() {
        let store = InMemoryStateStore::new();
        store.insert("vm-1", ObjectState::Stopped).await;

        let moved = transition(&store, "vm-1", StateEvent::StartRequested, ObjectState::Starting, 3)
            .await
            .unwrap();
        assert_eq!(moved.state, ObjectState::Starting);
        assert_eq!(moved.updated_count, 1);
    }

    #[tokio::test]
    async fn transition_on_missing_object_conflicts() {
        let store = InMemoryStateStore::new();
        let err = transition(&store, "ghost", StateEvent::StopRequested, ObjectState::Stopping, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, XapiError::Conflict(_)));
    }

    /// Always loses the race.
    struct Contended(InMemoryStateStore);

    #[async_trait]
    impl StateTransition for Contended {
        async fn update_state(
            &self,
            _current: ObjectState,
            _event: StateEvent,
            _next: ObjectState,
            _object: &Versioned,
            _aux: Option<&str>,
        ) -> Result<bool> {
            Ok(false)
        }

        async fn get(&self, id: &str) -> Result<Option<Versioned>> {
            self.0.get(id).await
        }
    }

    #[tokio::test]
    async fn transition_gives_up_after_attempts() {
        let inner = InMemoryStateStore::new();
        inner.insert("vm-1", ObjectState::Running).await;
        let store = Contended(inner);

        let err = transition(&store, "vm-1", StateEvent::StopRequested, ObjectState::Stopping, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, XapiError::Conflict(_)));
    }
}
