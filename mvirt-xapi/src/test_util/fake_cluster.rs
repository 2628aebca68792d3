//! Scripted in-memory pool.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use crate::api::{TaskStatus, VmPowerState};
use crate::error::{Result, XapiError};
use crate::session::{LOGIN_METHOD, LOGOUT_METHOD};
use crate::transport::{Transport, TransportFactory};
use crate::xmlrpc::{self, Value};

const POOL_REF: &str = "OpaqueRef:pool";

/// Error injected into the next call of a method.
#[derive(Debug, Clone)]
pub enum Fault {
    SessionInvalid,
    Transport,
    HandleInvalid,
    HostIsSlave(String),
    Api(String),
}

impl Fault {
    fn into_error(self, subject: &str) -> XapiError {
        match self {
            Fault::SessionInvalid => XapiError::SessionInvalid(subject.to_string()),
            Fault::Transport => XapiError::Transport("connection reset by peer".into()),
            Fault::HandleInvalid => XapiError::HandleInvalid {
                class: "task".into(),
                handle: subject.to_string(),
            },
            Fault::HostIsSlave(master) => XapiError::HostIsSlave { master },
            Fault::Api(code) => XapiError::Api {
                code,
                params: vec![],
            },
        }
    }
}

/// How the next created task behaves.
#[derive(Debug, Clone)]
pub struct TaskPlan {
    /// Status returned per poll; the last one repeats.
    pub statuses: Vec<TaskStatus>,
    pub result: String,
    pub error_info: Vec<String>,
    /// The handle disappears after this many status polls.
    pub vanish_after: Option<usize>,
}

impl TaskPlan {
    pub fn succeeds_after(pending_polls: usize, result: &str) -> Self {
        let mut statuses = vec![TaskStatus::Pending; pending_polls];
        statuses.push(TaskStatus::Success);
        Self {
            statuses,
            result: result.to_string(),
            error_info: vec![],
            vanish_after: None,
        }
    }

    pub fn fails_after(pending_polls: usize, error_info: &[&str]) -> Self {
        let mut statuses = vec![TaskStatus::Pending; pending_polls];
        statuses.push(TaskStatus::Failure);
        Self {
            statuses,
            result: String::new(),
            error_info: error_info.iter().map(|s| s.to_string()).collect(),
            vanish_after: None,
        }
    }

    pub fn never_finishes() -> Self {
        Self {
            statuses: vec![TaskStatus::Pending],
            result: String::new(),
            error_info: vec![],
            vanish_after: None,
        }
    }

    /// Completes its side effect, then the handle is reaped mid-poll.
    pub fn vanishes_after(polls: usize) -> Self {
        Self {
            statuses: vec![TaskStatus::Pending],
            result: String::new(),
            error_info: vec![],
            vanish_after: Some(polls),
        }
    }
}

/// Blocks logins to one address until released.
#[derive(Clone)]
pub struct LoginGate {
    entered: Arc<Notify>,
    permits: Arc<Semaphore>,
}

impl LoginGate {
    /// Wait until a login is parked at the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let `n` parked or future logins through.
    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }
}

#[derive(Debug)]
struct Member {
    host_uuid: String,
    master: Option<String>,
    reachable: bool,
}

#[derive(Debug)]
struct Host {
    host_ref: String,
    address: String,
    enabled: bool,
}

#[derive(Debug)]
enum SideEffect {
    PowerState(String, VmPowerState),
}

#[derive(Debug)]
struct FakeTask {
    plan: TaskPlan,
    polls: usize,
    cancelled: bool,
    destroyed: bool,
    effect: Option<SideEffect>,
}

impl FakeTask {
    fn status(&self) -> TaskStatus {
        if self.cancelled {
            return TaskStatus::Cancelled;
        }
        let idx = self.polls.min(self.plan.statuses.len().saturating_sub(1));
        self.plan
            .statuses
            .get(idx)
            .copied()
            .unwrap_or(TaskStatus::Pending)
    }
}

#[derive(Default)]
struct State {
    pool_uuid: String,
    members: HashMap<String, Member>,
    hosts: HashMap<String, Host>,
    passwords: HashSet<String>,
    sessions: HashMap<String, String>,
    vms: HashMap<String, (String, VmPowerState)>,
    tasks: HashMap<String, FakeTask>,
    next_plans: VecDeque<TaskPlan>,
    faults: HashMap<String, VecDeque<Fault>>,
    calls: Vec<(String, String)>,
    next_id: u64,
}

impl State {
    fn next_ref(&mut self, kind: &str) -> String {
        self.next_id += 1;
        format!("OpaqueRef:{kind}-{}", self.next_id)
    }

    fn vm_ref_to_uuid(&self, vm_ref: &str) -> Option<String> {
        self.vms
            .iter()
            .find(|(_, (r, _))| r == vm_ref)
            .map(|(uuid, _)| uuid.clone())
    }

    fn host_by_ref(&self, host_ref: &str) -> Option<(&String, &Host)> {
        self.hosts.iter().find(|(_, h)| h.host_ref == host_ref)
    }

    fn apply(&mut self, effect: SideEffect) {
        match effect {
            SideEffect::PowerState(uuid, state) => {
                if let Some((_, power)) = self.vms.get_mut(&uuid) {
                    *power = state;
                }
            }
        }
    }

    fn create_task(&mut self, effect: Option<SideEffect>) -> String {
        let task_ref = self.next_ref("task");
        let plan = self
            .next_plans
            .pop_front()
            .unwrap_or_else(|| TaskPlan::succeeds_after(1, ""));
        self.tasks.insert(
            task_ref.clone(),
            FakeTask {
                plan,
                polls: 0,
                cancelled: false,
                destroyed: false,
                effect,
            },
        );
        task_ref
    }
}

/// An in-memory XAPI pool.
///
/// Members are addressed by IP-like strings. Each member runs one host.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
    gates: Arc<Mutex<HashMap<String, LoginGate>>>,
}

impl FakeCluster {
    pub fn new(pool_uuid: &str) -> Self {
        let cluster = Self::default();
        cluster.state().pool_uuid = pool_uuid.to_string();
        cluster
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_member(&self, address: &str, host_uuid: &str, master: Option<&str>) {
        let mut state = self.state();
        let host_ref = state.next_ref("host");
        state.members.insert(
            address.to_string(),
            Member {
                host_uuid: host_uuid.to_string(),
                master: master.map(str::to_string),
                reachable: true,
            },
        );
        state.hosts.insert(
            host_uuid.to_string(),
            Host {
                host_ref,
                address: address.to_string(),
                enabled: true,
            },
        );
    }

    pub fn add_master(&self, address: &str, host_uuid: &str) {
        self.add_member(address, host_uuid, None);
    }

    pub fn add_slave(&self, address: &str, host_uuid: &str, master: &str) {
        self.add_member(address, host_uuid, Some(master));
    }

    /// Make `address` the master; every other member becomes its slave.
    pub fn promote(&self, address: &str) {
        let mut state = self.state();
        for (member_address, member) in state.members.iter_mut() {
            member.master = (member_address != address).then(|| address.to_string());
        }
    }

    pub fn set_reachable(&self, address: &str, reachable: bool) {
        if let Some(member) = self.state().members.get_mut(address) {
            member.reachable = reachable;
        }
    }

    pub fn set_host_enabled(&self, host_uuid: &str, enabled: bool) {
        if let Some(host) = self.state().hosts.get_mut(host_uuid) {
            host.enabled = enabled;
        }
    }

    pub fn accept_password(&self, password: &str) {
        self.state().passwords.insert(password.to_string());
    }

    pub fn reject_password(&self, password: &str) {
        self.state().passwords.remove(password);
    }

    /// Forget every session, as after a toolstack restart.
    pub fn invalidate_sessions(&self) {
        self.state().sessions.clear();
    }

    pub fn active_sessions(&self) -> usize {
        self.state().sessions.len()
    }

    pub fn add_vm(&self, uuid: &str, power_state: VmPowerState) -> String {
        let mut state = self.state();
        let vm_ref = state.next_ref("vm");
        state
            .vms
            .insert(uuid.to_string(), (vm_ref.clone(), power_state));
        vm_ref
    }

    pub fn vm_power_state(&self, uuid: &str) -> Option<VmPowerState> {
        self.state().vms.get(uuid).map(|(_, p)| p.clone())
    }

    /// Plan for the next task created by an `Async.*` call.
    pub fn plan_next_task(&self, plan: TaskPlan) {
        self.state().next_plans.push_back(plan);
    }

    /// Create a task directly, as if issued by another client.
    pub fn add_task(&self, plan: TaskPlan) -> String {
        let mut state = self.state();
        state.next_plans.push_front(plan);
        state.create_task(None)
    }

    pub fn task_destroyed(&self, task_ref: &str) -> bool {
        self.state()
            .tasks
            .get(task_ref)
            .is_some_and(|t| t.destroyed)
    }

    /// Fail the next call of `method` with `fault`.
    pub fn fail_next(&self, method: &str, fault: Fault) {
        self.state()
            .faults
            .entry(method.to_string())
            .or_default()
            .push_back(fault);
    }

    /// Park logins to `address` until the gate releases them.
    pub fn gate_logins(&self, address: &str) -> LoginGate {
        let gate = LoginGate {
            entered: Arc::new(Notify::new()),
            permits: Arc::new(Semaphore::new(0)),
        };
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_string(), gate.clone());
        gate
    }

    /// Number of calls of `method` across all members.
    pub fn calls(&self, method: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|(_, m)| m == method)
            .count()
    }

    /// Number of calls of `method` made to `address`.
    pub fn calls_to(&self, address: &str, method: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|(a, m)| a == address && m == method)
            .count()
    }

    /// Distinct addresses contacted, in first-contact order.
    pub fn contacted(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for (address, _) in &self.state().calls {
            if !seen.contains(address) {
                seen.push(address.clone());
            }
        }
        seen
    }

    pub fn logins(&self) -> usize {
        self.calls(LOGIN_METHOD)
    }

    async fn dispatch(&self, address: &str, method: &str, params: Vec<Value>) -> Result<Value> {
        if method == LOGIN_METHOD {
            let gate = self
                .gates
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(address)
                .cloned();
            if let Some(gate) = gate {
                gate.entered.notify_one();
                if let Ok(permit) = gate.permits.acquire().await {
                    permit.forget();
                }
            }
        }

        self.handle(address, method, &params)
    }

    fn handle(&self, address: &str, method: &str, params: &[Value]) -> Result<Value> {
        let mut state = self.state();
        state.calls.push((address.to_string(), method.to_string()));

        let arg = |i: usize| -> String {
            params
                .get(i)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        match state.members.get(address) {
            Some(member) if member.reachable => {}
            _ => return Err(XapiError::Transport(format!("no route to host {address}"))),
        }

        if let Some(fault) = state.faults.get_mut(method).and_then(VecDeque::pop_front) {
            return Err(fault.into_error(&arg(1)));
        }

        // Slaves turn away everything but logout.
        if method != LOGOUT_METHOD {
            if let Some(master) = state.members.get(address).and_then(|m| m.master.clone()) {
                return Err(XapiError::HostIsSlave { master });
            }
        }

        if method == LOGIN_METHOD {
            if !state.passwords.contains(&arg(1)) {
                return Err(XapiError::AuthenticationFailed(format!(
                    "Authentication failure for {}",
                    arg(0)
                )));
            }
            let session_ref = state.next_ref("session");
            state
                .sessions
                .insert(session_ref.clone(), address.to_string());
            return Ok(Value::from(session_ref));
        }

        let session = arg(0);
        if !state.sessions.contains_key(&session) {
            return Err(XapiError::SessionInvalid(session));
        }

        match method {
            LOGOUT_METHOD => {
                state.sessions.remove(&session);
                Ok(Value::from(""))
            }
            "session.get_this_host" => {
                let uuid = state
                    .members
                    .get(address)
                    .map(|m| m.host_uuid.clone())
                    .unwrap_or_default();
                Ok(Value::from(state.hosts[&uuid].host_ref.clone()))
            }
            "pool.get_all" => Ok(Value::Array(vec![Value::from(POOL_REF)])),
            "pool.get_uuid" => Ok(Value::from(state.pool_uuid.clone())),
            "pool.get_master" => {
                let master_uuid = state
                    .members
                    .values()
                    .find(|m| m.master.is_none())
                    .map(|m| m.host_uuid.clone())
                    .ok_or_else(|| XapiError::Api {
                        code: "INTERNAL_ERROR".into(),
                        params: vec!["no master".into()],
                    })?;
                Ok(Value::from(state.hosts[&master_uuid].host_ref.clone()))
            }
            "host.get_by_uuid" => state
                .hosts
                .get(&arg(1))
                .map(|h| Value::from(h.host_ref.clone()))
                .ok_or_else(|| XapiError::from_error_description(vec![
                    "UUID_INVALID".into(),
                    "host".into(),
                    arg(1),
                ])),
            "host.get_enabled" => host_field(&state, &arg(1), |_, h| Value::Bool(h.enabled)),
            "host.get_address" => {
                host_field(&state, &arg(1), |_, h| Value::from(h.address.clone()))
            }
            "host.get_uuid" => host_field(&state, &arg(1), |uuid, _| Value::from(uuid.clone())),
            "VM.get_by_uuid" => state
                .vms
                .get(&arg(1))
                .map(|(r, _)| Value::from(r.clone()))
                .ok_or_else(|| XapiError::from_error_description(vec![
                    "UUID_INVALID".into(),
                    "VM".into(),
                    arg(1),
                ])),
            "VM.get_power_state" => {
                let uuid = state.vm_ref_to_uuid(&arg(1)).ok_or_else(|| {
                    XapiError::HandleInvalid {
                        class: "VM".into(),
                        handle: arg(1),
                    }
                })?;
                Ok(Value::from(state.vms[&uuid].1.to_string()))
            }
            "Async.VM.start" | "Async.VM.clean_shutdown" | "Async.VM.hard_shutdown"
            | "Async.VM.pool_migrate" => {
                let uuid = state.vm_ref_to_uuid(&arg(1)).ok_or_else(|| {
                    XapiError::HandleInvalid {
                        class: "VM".into(),
                        handle: arg(1),
                    }
                })?;
                let target = match method {
                    "Async.VM.start" | "Async.VM.pool_migrate" => VmPowerState::Running,
                    _ => VmPowerState::Halted,
                };
                let task_ref = state.create_task(Some(SideEffect::PowerState(uuid, target)));
                Ok(Value::from(task_ref))
            }
            "task.get_status" => {
                let task_ref = arg(1);
                let task = live_task(&mut state, &task_ref)?;
                let status = task.status();
                task.polls += 1;

                let vanished = task.plan.vanish_after.is_some_and(|n| task.polls > n);
                if vanished {
                    task.destroyed = true;
                }
                let effect = if vanished || status == TaskStatus::Success {
                    task.effect.take()
                } else {
                    None
                };
                if let Some(effect) = effect {
                    state.apply(effect);
                }

                if vanished {
                    return Err(XapiError::HandleInvalid {
                        class: "task".into(),
                        handle: task_ref,
                    });
                }
                Ok(Value::from(task_status_str(status)))
            }
            "task.get_result" => {
                let task = live_task(&mut state, &arg(1))?;
                let result = task.plan.result.clone();
                Ok(Value::from(if result.is_empty() {
                    String::new()
                } else {
                    format!("<value>{result}</value>")
                }))
            }
            "task.get_error_info" => {
                let task = live_task(&mut state, &arg(1))?;
                let info = if task.cancelled {
                    vec!["TASK_CANCELLED".to_string(), arg(1)]
                } else {
                    task.plan.error_info.clone()
                };
                Ok(Value::Array(info.into_iter().map(Value::from).collect()))
            }
            "task.cancel" => {
                let task = live_task(&mut state, &arg(1))?;
                task.cancelled = true;
                Ok(Value::from(""))
            }
            "task.destroy" => {
                let task = live_task(&mut state, &arg(1))?;
                task.destroyed = true;
                Ok(Value::from(""))
            }
            other => Err(XapiError::Api {
                code: "MESSAGE_METHOD_UNKNOWN".into(),
                params: vec![other.to_string()],
            }),
        }
    }
}

fn host_field(state: &State, host_ref: &str, f: impl Fn(&String, &Host) -> Value) -> Result<Value> {
    state
        .host_by_ref(host_ref)
        .map(|(uuid, host)| f(uuid, host))
        .ok_or_else(|| XapiError::HandleInvalid {
            class: "host".into(),
            handle: host_ref.to_string(),
        })
}

fn live_task<'a>(state: &'a mut State, task_ref: &str) -> Result<&'a mut FakeTask> {
    match state.tasks.get_mut(task_ref) {
        Some(task) if !task.destroyed => Ok(task),
        _ => Err(XapiError::HandleInvalid {
            class: "task".into(),
            handle: task_ref.to_string(),
        }),
    }
}

fn task_status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Success => "success",
        TaskStatus::Failure => "failure",
        TaskStatus::Cancelling => "cancelling",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn error_description(err: &XapiError) -> Vec<String> {
    match err {
        XapiError::SessionInvalid(session) => vec!["SESSION_INVALID".into(), session.clone()],
        XapiError::HostIsSlave { master } => vec!["HOST_IS_SLAVE".into(), master.clone()],
        XapiError::AuthenticationFailed(message) => {
            vec!["SESSION_AUTHENTICATION_FAILED".into(), message.clone()]
        }
        XapiError::HandleInvalid { class, handle } => {
            vec!["HANDLE_INVALID".into(), class.clone(), handle.clone()]
        }
        XapiError::Api { code, params } => {
            std::iter::once(code.clone()).chain(params.iter().cloned()).collect()
        }
        other => vec!["INTERNAL_ERROR".into(), other.to_string()],
    }
}

struct FakeTransport {
    address: String,
    cluster: FakeCluster,
}

#[async_trait]
impl Transport for FakeTransport {
    fn address(&self) -> &str {
        &self.address
    }

    /// Replies travel through the XML-RPC envelope like real responses.
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let document = match self.cluster.dispatch(&self.address, method, params).await {
            Ok(value) => xmlrpc::success_response(&value),
            Err(e @ XapiError::Transport(_)) => return Err(e),
            Err(e) => {
                let description = error_description(&e);
                let parts: Vec<&str> = description.iter().map(String::as_str).collect();
                xmlrpc::failure_response(&parts)
            }
        };
        xmlrpc::decode_api_response(&document)
    }
}

impl TransportFactory for FakeCluster {
    fn open(&self, address: &str, _wait: Duration) -> Arc<dyn Transport> {
        Arc::new(FakeTransport {
            address: address.to_string(),
            cluster: self.clone(),
        })
    }
}
