//! Orchestrator-facing adapter over one pool.
//!
//! Composes the connection pool, the task runner and the configuration.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::api::{self, PoolRecord, VmPowerState};
use crate::config::XapiConfig;
use crate::credentials::{CredentialStore, Secret};
use crate::error::{Result, XapiError};
use crate::pool::{Connection, ConnectionPool};
use crate::state::{self, ObjectState, StateEvent, StateTransition};
use crate::task::{EndStateProbe, TaskOutcome, TaskRunner, VmPowerStateProbe};
use crate::transport::TransportFactory;

const STATE_UPDATE_ATTEMPTS: u32 = 3;

pub struct XapiResource {
    config: XapiConfig,
    credentials: Arc<CredentialStore>,
    pool: Arc<ConnectionPool>,
    runner: TaskRunner,
    states: Option<Arc<dyn StateTransition>>,
}

impl XapiResource {
    pub fn new(config: XapiConfig, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        Self::with_pool(config, Arc::new(ConnectionPool::new(factory)))
    }

    /// Share a pool across adapters managing different pools.
    pub fn with_pool(config: XapiConfig, pool: Arc<ConnectionPool>) -> Result<Self> {
        config.validate()?;
        let credentials = Arc::new(config.credential_store());
        let runner = TaskRunner::new(config.poll_interval(), config.task_timeout());
        Ok(Self {
            config,
            credentials,
            pool,
            runner,
            states: None,
        })
    }

    pub fn with_state_store(mut self, states: Arc<dyn StateTransition>) -> Self {
        self.states = Some(states);
        self
    }

    pub fn config(&self) -> &XapiConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub async fn connection(&self) -> Result<Arc<Connection>> {
        self.pool
            .connect(&self.config.connect_request(Arc::clone(&self.credentials)))
            .await
    }

    /// Accept a new password; in-flight reconnects may still use the old one.
    pub fn rotate_password(&self, secret: impl Into<Secret>) {
        self.credentials.rotate(secret);
        info!(pool_id = %self.config.pool_id, candidates = self.credentials.len(), "Password rotated");
    }

    pub async fn pool_master(&self) -> Result<PoolRecord> {
        let conn = self.connection().await?;
        api::pool_record(conn.as_ref()).await
    }

    pub async fn host_enabled(&self) -> Result<bool> {
        let conn = self.connection().await?;
        let host_ref = api::host_get_by_uuid(conn.as_ref(), &self.config.host_uuid).await?;
        api::host_get_enabled(conn.as_ref(), &host_ref).await
    }

    /// Read a VM's power state, reconnecting on connection-level failures.
    pub async fn vm_power_state(&self, vm_uuid: &str) -> Result<VmPowerState> {
        let retries = self.config.retries;
        let interval = Duration::from_millis(self.config.retry_interval_ms);
        let mut attempt = 0;

        loop {
            let result = async {
                let conn = self.connection().await?;
                let vm_ref = api::vm_get_by_uuid(conn.as_ref(), vm_uuid).await?;
                api::vm_get_power_state(conn.as_ref(), &vm_ref).await
            }
            .await;

            match result {
                Err(e) if attempt < retries && e.root_cause().evicts_connection() => {
                    attempt += 1;
                    warn!(vm_uuid = %vm_uuid, attempt = attempt, error = %e, "Power state read failed, retrying");
                    tokio::time::sleep(interval).await;
                }
                other => return other,
            }
        }
    }

    pub async fn start_vm(&self, vm_uuid: &str) -> Result<TaskOutcome> {
        self.run_vm_action(
            vm_uuid,
            StateEvent::StartRequested,
            ObjectState::Starting,
            ObjectState::Running,
            self.runner.timeout(),
            Some(VmPowerState::Running),
            VmAction::Start,
        )
        .await
    }

    pub async fn clean_shutdown_vm(&self, vm_uuid: &str) -> Result<TaskOutcome> {
        self.run_vm_action(
            vm_uuid,
            StateEvent::StopRequested,
            ObjectState::Stopping,
            ObjectState::Stopped,
            self.runner.timeout(),
            Some(VmPowerState::Halted),
            VmAction::CleanShutdown,
        )
        .await
    }

    pub async fn hard_shutdown_vm(&self, vm_uuid: &str) -> Result<TaskOutcome> {
        self.run_vm_action(
            vm_uuid,
            StateEvent::StopRequested,
            ObjectState::Stopping,
            ObjectState::Stopped,
            self.runner.timeout(),
            Some(VmPowerState::Halted),
            VmAction::HardShutdown,
        )
        .await
    }

    pub async fn migrate_vm(&self, vm_uuid: &str, dest_host_uuid: &str) -> Result<TaskOutcome> {
        self.run_vm_action(
            vm_uuid,
            StateEvent::MigrationRequested,
            ObjectState::Migrating,
            ObjectState::Running,
            self.config.migrate_timeout(),
            None,
            VmAction::Migrate(dest_host_uuid.to_string()),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_vm_action(
        &self,
        vm_uuid: &str,
        event: StateEvent,
        pending: ObjectState,
        done: ObjectState,
        timeout: Duration,
        end_state: Option<VmPowerState>,
        action: VmAction,
    ) -> Result<TaskOutcome> {
        self.record(vm_uuid, event, pending).await?;

        let result = async {
            let conn = self.connection().await?;
            let vm_ref = api::vm_get_by_uuid(conn.as_ref(), vm_uuid).await?;
            let task = match &action {
                VmAction::Start => api::async_vm_start(conn.as_ref(), &vm_ref).await?,
                VmAction::CleanShutdown => {
                    api::async_vm_clean_shutdown(conn.as_ref(), &vm_ref).await?
                }
                VmAction::HardShutdown => {
                    api::async_vm_hard_shutdown(conn.as_ref(), &vm_ref).await?
                }
                VmAction::Migrate(host_uuid) => {
                    let host_ref = api::host_get_by_uuid(conn.as_ref(), host_uuid).await?;
                    api::async_vm_pool_migrate(conn.as_ref(), &vm_ref, &host_ref).await?
                }
            };
            info!(vm_uuid = %vm_uuid, task = %task, action = ?action, "VM task issued");

            let probe = end_state.map(|expected| VmPowerStateProbe { vm_ref, expected });
            self.runner
                .wait_for_task_with(
                    &conn,
                    &task,
                    self.runner.poll_interval(),
                    timeout,
                    probe.as_ref().map(|p| p as &dyn EndStateProbe),
                )
                .await
        }
        .await;

        match &result {
            Ok(_) => self.record(vm_uuid, StateEvent::OperationSucceeded, done).await?,
            Err(e) => {
                warn!(vm_uuid = %vm_uuid, action = ?action, error = %e, "VM task failed");
                if let Err(record_err) = self
                    .record(vm_uuid, StateEvent::OperationFailed, ObjectState::Error)
                    .await
                {
                    warn!(vm_uuid = %vm_uuid, error = %record_err, "Failed to record error state");
                }
            }
        }
        result
    }

    async fn record(&self, id: &str, event: StateEvent, next: ObjectState) -> Result<()> {
        let Some(states) = &self.states else {
            return Ok(());
        };
        state::transition(states.as_ref(), id, event, next, STATE_UPDATE_ATTEMPTS)
            .await
            .map(|_| ())
    }

    /// Finish cleanups of abandoned task waits, then log out every pooled session.
    pub async fn shutdown(&self) {
        self.runner.finish_cleanups().await;
        self.pool.shutdown().await;
    }
}

#[derive(Debug)]
enum VmAction {
    Start,
    CleanShutdown,
    HardShutdown,
    Migrate(String),
}
