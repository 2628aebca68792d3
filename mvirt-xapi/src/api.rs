//! Typed wrappers over the XAPI calls the bridge needs.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;

use crate::error::{Result, XapiError};
use crate::session::Session;
use crate::xmlrpc::Value;

/// Anything that can issue a call on behalf of a session.
#[async_trait]
pub trait XapiCall: Send + Sync {
    async fn xapi_call(&self, method: &str, args: Vec<Value>) -> Result<Value>;
}

#[async_trait]
impl XapiCall for Session {
    async fn xapi_call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call(method, args).await
    }
}

// =============================================================================
// Pool / host
// =============================================================================

/// Snapshot of pool membership. Never cached: the master can move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRecord {
    pub pool_ref: String,
    pub uuid: String,
    pub master_ref: String,
    pub master_address: String,
}

pub async fn pool_get_all<C: XapiCall + ?Sized>(c: &C) -> Result<Vec<String>> {
    c.xapi_call("pool.get_all", vec![]).await?.into_strings()
}

pub async fn pool_get_master<C: XapiCall + ?Sized>(c: &C, pool_ref: &str) -> Result<String> {
    c.xapi_call("pool.get_master", vec![Value::from(pool_ref)])
        .await?
        .into_string()
}

pub async fn pool_get_uuid<C: XapiCall + ?Sized>(c: &C, pool_ref: &str) -> Result<String> {
    c.xapi_call("pool.get_uuid", vec![Value::from(pool_ref)])
        .await?
        .into_string()
}

/// Fetch the pool record (a pool-of-one is still a pool).
pub async fn pool_record<C: XapiCall + ?Sized>(c: &C) -> Result<PoolRecord> {
    let pool_ref = pool_get_all(c)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| XapiError::Malformed("pool.get_all returned no pools".into()))?;
    let uuid = pool_get_uuid(c, &pool_ref).await?;
    let master_ref = pool_get_master(c, &pool_ref).await?;
    let master_address = host_get_address(c, &master_ref).await?;

    Ok(PoolRecord {
        pool_ref,
        uuid,
        master_ref,
        master_address,
    })
}

pub async fn session_get_this_host<C: XapiCall + ?Sized>(c: &C, session_ref: &str) -> Result<String> {
    c.xapi_call("session.get_this_host", vec![Value::from(session_ref)])
        .await?
        .into_string()
}

pub async fn host_get_by_uuid<C: XapiCall + ?Sized>(c: &C, uuid: &str) -> Result<String> {
    c.xapi_call("host.get_by_uuid", vec![Value::from(uuid)])
        .await?
        .into_string()
}

pub async fn host_get_enabled<C: XapiCall + ?Sized>(c: &C, host_ref: &str) -> Result<bool> {
    c.xapi_call("host.get_enabled", vec![Value::from(host_ref)])
        .await?
        .into_bool()
}

pub async fn host_get_address<C: XapiCall + ?Sized>(c: &C, host_ref: &str) -> Result<String> {
    c.xapi_call("host.get_address", vec![Value::from(host_ref)])
        .await?
        .into_string()
}

pub async fn host_get_uuid<C: XapiCall + ?Sized>(c: &C, host_ref: &str) -> Result<String> {
    c.xapi_call("host.get_uuid", vec![Value::from(host_ref)])
        .await?
        .into_string()
}

// =============================================================================
// VM
// =============================================================================

/// VM power state as reported by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmPowerState {
    Halted,
    Paused,
    Running,
    Suspended,
    Unknown(String),
}

impl From<&str> for VmPowerState {
    fn from(s: &str) -> Self {
        match s {
            "Halted" => VmPowerState::Halted,
            "Paused" => VmPowerState::Paused,
            "Running" => VmPowerState::Running,
            "Suspended" => VmPowerState::Suspended,
            other => VmPowerState::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for VmPowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmPowerState::Halted => write!(f, "Halted"),
            VmPowerState::Paused => write!(f, "Paused"),
            VmPowerState::Running => write!(f, "Running"),
            VmPowerState::Suspended => write!(f, "Suspended"),
            VmPowerState::Unknown(s) => write!(f, "{s}"),
        }
    }
}

pub async fn vm_get_by_uuid<C: XapiCall + ?Sized>(c: &C, uuid: &str) -> Result<String> {
    c.xapi_call("VM.get_by_uuid", vec![Value::from(uuid)])
        .await?
        .into_string()
}

pub async fn vm_get_power_state<C: XapiCall + ?Sized>(c: &C, vm_ref: &str) -> Result<VmPowerState> {
    let state = c
        .xapi_call("VM.get_power_state", vec![Value::from(vm_ref)])
        .await?
        .into_string()?;
    Ok(VmPowerState::from(state.as_str()))
}

/// `Async.VM.start(vm, start_paused, force)`. Returns the task reference.
pub async fn async_vm_start<C: XapiCall + ?Sized>(c: &C, vm_ref: &str) -> Result<String> {
    c.xapi_call(
        "Async.VM.start",
        vec![Value::from(vm_ref), Value::from(false), Value::from(true)],
    )
    .await?
    .into_string()
}

pub async fn async_vm_clean_shutdown<C: XapiCall + ?Sized>(c: &C, vm_ref: &str) -> Result<String> {
    c.xapi_call("Async.VM.clean_shutdown", vec![Value::from(vm_ref)])
        .await?
        .into_string()
}

pub async fn async_vm_hard_shutdown<C: XapiCall + ?Sized>(c: &C, vm_ref: &str) -> Result<String> {
    c.xapi_call("Async.VM.hard_shutdown", vec![Value::from(vm_ref)])
        .await?
        .into_string()
}

/// Live migration within the pool.
pub async fn async_vm_pool_migrate<C: XapiCall + ?Sized>(
    c: &C,
    vm_ref: &str,
    host_ref: &str,
) -> Result<String> {
    let mut options = BTreeMap::new();
    options.insert("live".to_string(), Value::from("true"));
    c.xapi_call(
        "Async.VM.pool_migrate",
        vec![
            Value::from(vm_ref),
            Value::from(host_ref),
            Value::Struct(options),
        ],
    )
    .await?
    .into_string()
}

// =============================================================================
// Task
// =============================================================================

/// Remote task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Success,
    Failure,
    Cancelling,
    Cancelled,
}

impl TaskStatus {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "success" => Ok(TaskStatus::Success),
            "failure" => Ok(TaskStatus::Failure),
            "cancelling" => Ok(TaskStatus::Cancelling),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(XapiError::Malformed(format!("unknown task status {other:?}"))),
        }
    }
}

pub async fn task_get_status<C: XapiCall + ?Sized>(c: &C, task_ref: &str) -> Result<TaskStatus> {
    let status = c
        .xapi_call("task.get_status", vec![Value::from(task_ref)])
        .await?
        .into_string()?;
    TaskStatus::parse(&status)
}

pub async fn task_get_result<C: XapiCall + ?Sized>(c: &C, task_ref: &str) -> Result<String> {
    c.xapi_call("task.get_result", vec![Value::from(task_ref)])
        .await?
        .into_string()
}

pub async fn task_get_error_info<C: XapiCall + ?Sized>(c: &C, task_ref: &str) -> Result<Vec<String>> {
    c.xapi_call("task.get_error_info", vec![Value::from(task_ref)])
        .await?
        .into_strings()
}

pub async fn task_cancel<C: XapiCall + ?Sized>(c: &C, task_ref: &str) -> Result<()> {
    c.xapi_call("task.cancel", vec![Value::from(task_ref)])
        .await
        .map(|_| ())
}

pub async fn task_destroy<C: XapiCall + ?Sized>(c: &C, task_ref: &str) -> Result<()> {
    c.xapi_call("task.destroy", vec![Value::from(task_ref)])
        .await
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_parsing() {
        assert_eq!(TaskStatus::parse("pending").unwrap(), TaskStatus::Pending);
        assert_eq!(TaskStatus::parse("cancelling").unwrap(), TaskStatus::Cancelling);
        assert!(matches!(
            TaskStatus::parse("exploded"),
            Err(XapiError::Malformed(_))
        ));
    }

    #[test]
    fn power_state_round_trips_unknown() {
        assert_eq!(VmPowerState::from("Running"), VmPowerState::Running);
        let odd = VmPowerState::from("Migrating");
        assert_eq!(odd.to_string(), "Migrating");
    }
}
