//! Task polling: outcomes, timeout boundary and destroy-once cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use mvirt_xapi::test_util::{
    FakeCluster, Fault, TEST_POOL, TaskPlan, connect_request, credentials,
};
use mvirt_xapi::{
    Connection, ConnectionPool, EndStateProbe, TaskOutcome, TaskRunner, VmPowerState,
    VmPowerStateProbe, XapiError, api,
};

const MASTER: &str = "10.0.0.1";

async fn setup() -> (FakeCluster, ConnectionPool, Arc<Connection>) {
    let cluster = FakeCluster::new("pool-uuid-1");
    cluster.add_master(MASTER, "host-1");
    cluster.accept_password("pw");
    let pool = ConnectionPool::new(Arc::new(cluster.clone()));
    let conn = pool
        .connect(&connect_request(TEST_POOL, "host-1", MASTER, credentials(&["pw"])))
        .await
        .unwrap();
    (cluster, pool, conn)
}

fn runner() -> TaskRunner {
    TaskRunner::new(Duration::from_millis(100), Duration::from_secs(60))
}

#[tokio::test(start_paused = true)]
async fn success_on_third_poll_returns_result() {
    let (cluster, _pool, conn) = setup().await;
    let task = cluster.add_task(TaskPlan::succeeds_after(2, "R"));

    let outcome = runner().wait(&conn, &task, None).await.unwrap();

    assert_eq!(outcome.result(), Some("R"));
    assert_eq!(cluster.calls("task.get_status"), 3);
    assert_eq!(cluster.calls("task.get_result"), 1);
    assert_eq!(cluster.calls("task.destroy"), 1);
    assert_eq!(cluster.calls("task.cancel"), 0);
    assert!(cluster.task_destroyed(&task));
}

#[tokio::test(start_paused = true)]
async fn empty_result_is_none() {
    let (cluster, _pool, conn) = setup().await;
    let task = cluster.add_task(TaskPlan::succeeds_after(0, ""));

    let outcome = runner().wait(&conn, &task, None).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Completed { result: None });
}

#[tokio::test(start_paused = true)]
async fn pending_task_times_out_within_one_tick() {
    let (cluster, _pool, conn) = setup().await;
    let task = cluster.add_task(TaskPlan::never_finishes());
    let timeout = Duration::from_millis(250);
    let interval = Duration::from_millis(100);

    let start = Instant::now();
    let err = runner()
        .wait_for_task(&conn, &task, interval, timeout)
        .await
        .unwrap_err();
    let waited = start.elapsed();

    match err {
        XapiError::TimedOut { task: t, elapsed } => {
            assert_eq!(t, task);
            assert!(elapsed > timeout);
            assert!(elapsed <= timeout + interval);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(waited >= timeout && waited <= timeout + interval);
    assert_eq!(cluster.calls("task.cancel"), 1);
    assert_eq!(cluster.calls("task.destroy"), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_task_surfaces_error_info() {
    let (cluster, _pool, conn) = setup().await;
    let task = cluster.add_task(TaskPlan::fails_after(
        1,
        &["VM_BAD_POWER_STATE", "OpaqueRef:vm", "halted", "running"],
    ));

    let err = runner().wait(&conn, &task, None).await.unwrap_err();

    match err {
        XapiError::TaskFailed { error_info, .. } => {
            assert_eq!(error_info[0], "VM_BAD_POWER_STATE");
            assert_eq!(error_info.len(), 4);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(cluster.calls("task.get_result"), 0);
    assert_eq!(cluster.calls("task.cancel"), 1);
    assert_eq!(cluster.calls("task.destroy"), 1);
}

#[tokio::test(start_paused = true)]
async fn destroy_runs_once_on_every_exit() {
    let plans = [
        TaskPlan::succeeds_after(1, "ok"),
        TaskPlan::fails_after(1, &["INTERNAL_ERROR"]),
        TaskPlan::never_finishes(),
    ];

    for plan in plans {
        let (cluster, _pool, conn) = setup().await;
        let task = cluster.add_task(plan);
        let _ = runner()
            .wait_for_task(&conn, &task, Duration::from_millis(100), Duration::from_millis(300))
            .await;
        assert_eq!(cluster.calls("task.destroy"), 1);
        assert!(cluster.task_destroyed(&task));
    }
}

#[tokio::test(start_paused = true)]
async fn vanished_handle_with_end_state_reached_succeeds() {
    let (cluster, _pool, conn) = setup().await;
    let vm_ref = cluster.add_vm("vm-1", VmPowerState::Halted);
    cluster.plan_next_task(TaskPlan::vanishes_after(1));

    let task = api::async_vm_start(conn.as_ref(), &vm_ref).await.unwrap();
    let probe = VmPowerStateProbe {
        vm_ref,
        expected: VmPowerState::Running,
    };
    let outcome = runner()
        .wait(&conn, &task, Some(&probe as &dyn EndStateProbe))
        .await
        .unwrap();

    assert_eq!(outcome, TaskOutcome::EndStateReached);
    assert_eq!(cluster.vm_power_state("vm-1"), Some(VmPowerState::Running));
    // Destroy is still attempted; the pool already reaped the handle.
    assert_eq!(cluster.calls("task.destroy"), 1);
}

#[tokio::test(start_paused = true)]
async fn vanished_handle_without_probe_fails() {
    let (cluster, pool, conn) = setup().await;
    let task = cluster.add_task(TaskPlan::vanishes_after(1));

    let err = runner().wait(&conn, &task, None).await.unwrap_err();

    assert!(matches!(err, XapiError::HandleInvalid { ref class, .. } if class == "task"));
    assert_eq!(cluster.calls("task.destroy"), 1);
    // A stale task handle says nothing about the session.
    assert!(pool.get(TEST_POOL).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn vanished_handle_with_end_state_missed_fails() {
    let (cluster, _pool, conn) = setup().await;
    let vm_ref = cluster.add_vm("vm-1", VmPowerState::Halted);
    let task = cluster.add_task(TaskPlan::vanishes_after(1));
    let probe = VmPowerStateProbe {
        vm_ref,
        expected: VmPowerState::Running,
    };

    let err = runner()
        .wait(&conn, &task, Some(&probe as &dyn EndStateProbe))
        .await
        .unwrap_err();
    assert!(matches!(err, XapiError::HandleInvalid { .. }));
}

#[tokio::test(start_paused = true)]
async fn abandoned_wait_cancels_and_destroys() {
    let (cluster, _pool, conn) = setup().await;
    let task = cluster.add_task(TaskPlan::never_finishes());
    let runner = runner();

    tokio::select! {
        _ = runner.wait(&conn, &task, None) => panic!("wait finished on a pending task"),
        _ = tokio::time::sleep(Duration::from_millis(350)) => {}
    }
    runner.finish_cleanups().await;

    assert_eq!(cluster.calls("task.cancel"), 1);
    assert_eq!(cluster.calls("task.destroy"), 1);
    assert!(cluster.task_destroyed(&task));
}

#[tokio::test(start_paused = true)]
async fn transport_fault_mid_poll_still_cleans_up() {
    let (cluster, pool, conn) = setup().await;
    let task = cluster.add_task(TaskPlan::never_finishes());
    cluster.fail_next("task.get_status", Fault::Transport);

    let err = runner().wait(&conn, &task, None).await.unwrap_err();

    assert!(matches!(err, XapiError::Transport(_)));
    // Evicted from the pool, but the session outlives the wait.
    assert!(pool.get(TEST_POOL).await.is_none());
    assert_eq!(cluster.calls("session.logout"), 0);
    assert_eq!(cluster.calls("task.cancel"), 1);
    assert!(cluster.task_destroyed(&task));
}

#[tokio::test(start_paused = true)]
async fn concurrent_wait_survives_eviction_by_another() {
    let (cluster, _pool, conn) = setup().await;
    let slow = cluster.add_task(TaskPlan::succeeds_after(3, "slow"));
    let broken = cluster.add_task(TaskPlan::never_finishes());
    let runner = runner();

    let slow_wait = runner.wait(&conn, &slow, None);
    let broken_wait = async {
        cluster.fail_next("task.get_status", Fault::Transport);
        runner.wait(&conn, &broken, None).await
    };
    let (slow_outcome, broken_outcome) = tokio::join!(slow_wait, broken_wait);

    assert_eq!(slow_outcome.unwrap().result(), Some("slow"));
    assert!(broken_outcome.is_err());
    assert!(cluster.task_destroyed(&slow));
    assert!(cluster.task_destroyed(&broken));
}
