//! Controller lifecycle tests with thread-backed workers running the
//! script runner end to end.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use taskmill::controller::{Controller, LaunchOptions, TaskState};
use taskmill::error::{TaskError, TaskResult};
use taskmill::identity::{IdentityProvider, Principal, SessionIdentity};
use taskmill::protocol::{ColumnType, Value};
use taskmill::shm::{open_channel, RingSender};
use taskmill::supervisor::{ProcessSupervisor, WorkerHandle, WorkerStatus};

use common::{test_settings, ThreadSupervisor};

fn controller() -> Controller<ThreadSupervisor, SessionIdentity> {
    Controller::new(
        ThreadSupervisor,
        SessionIdentity::new("tester"),
        test_settings(),
    )
}

#[tokio::test]
async fn test_launch_and_retrieve_rows() {
    let mut ctl = controller();
    let (pid, cookie) = ctl
        .launch_v2(b"rows 3\ntag SCRIPT", LaunchOptions::default())
        .await
        .unwrap();

    let result = ctl
        .result(pid, Some(cookie), &[ColumnType::Int64])
        .await
        .unwrap();
    assert_eq!(
        result.rows,
        vec![
            vec![Value::Int64(1)],
            vec![Value::Int64(2)],
            vec![Value::Int64(3)],
        ]
    );
    assert_eq!(result.command_tags, ["SCRIPT"]);
    // Successful retrieval reaps the task.
    assert_eq!(ctl.task_count(), 0);
}

#[tokio::test]
async fn test_legacy_launch_addresses_by_pid_only() {
    let mut ctl = controller();
    let pid = ctl
        .launch(b"tag LEGACY", LaunchOptions::default())
        .await
        .unwrap();

    let result = ctl.result(pid, None, &[ColumnType::Text]).await.unwrap();
    // No result set: one synthetic row carrying the completion tag.
    assert_eq!(result.rows, vec![vec![Value::Text("LEGACY".into())]]);
}

#[tokio::test]
async fn test_synthetic_row_uses_last_tag() {
    let mut ctl = controller();
    let (pid, cookie) = ctl
        .launch_v2(b"tag FIRST\ntag SECOND", LaunchOptions::default())
        .await
        .unwrap();

    let result = ctl.result(pid, Some(cookie), &[ColumnType::Text]).await.unwrap();
    assert_eq!(result.rows, vec![vec![Value::Text("SECOND".into())]]);
    assert_eq!(result.command_tags, ["FIRST", "SECOND"]);
}

#[tokio::test]
async fn test_wrong_cookie_is_not_found() {
    let mut ctl = controller();
    let (pid, cookie) = ctl
        .launch_v2(b"tag X", LaunchOptions::default())
        .await
        .unwrap();

    let err = ctl
        .result(pid, Some(cookie.wrapping_add(1)), &[ColumnType::Text])
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::NotFound { pid: p } if p == pid));

    // The right cookie still works afterwards.
    ctl.result(pid, Some(cookie), &[ColumnType::Text]).await.unwrap();
}

#[tokio::test]
async fn test_result_is_consumed_once() {
    let mut ctl = controller();
    let (pid, cookie) = ctl
        .launch_v2(b"error boom", LaunchOptions::default())
        .await
        .unwrap();

    let err = ctl
        .result(pid, Some(cookie), &[ColumnType::Text])
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Remote { ref code, .. } if code == "P0001"));

    // The failed entry survives for inspection but cannot be read again.
    let err = ctl
        .result(pid, Some(cookie), &[ColumnType::Text])
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::AlreadyConsumed { pid: p } if p == pid));

    let infos = ctl.list();
    assert_eq!(infos.len(), 1);
    assert!(infos[0].last_error.as_deref().unwrap().contains("boom"));
    assert_eq!(ctl.status(pid, Some(cookie)).unwrap().state, TaskState::Failed);
}

#[tokio::test]
async fn test_empty_request_rejected() {
    let mut ctl = controller();
    let err = ctl.launch(b"", LaunchOptions::default()).await.unwrap_err();
    assert!(matches!(err, TaskError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_queue_capacity_bounds() {
    let mut ctl = controller();
    let err = ctl
        .launch(
            b"tag X",
            LaunchOptions {
                queue_capacity: Some(1),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::InvalidArgument(_)));

    let err = ctl
        .launch(
            b"tag X",
            LaunchOptions {
                queue_capacity: Some(u32::MAX),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_admission_limit() {
    let mut ctl = controller();
    let mut launched = Vec::new();
    for _ in 0..4 {
        launched.push(
            ctl.launch_v2(b"sleep 2000", LaunchOptions::default())
                .await
                .unwrap(),
        );
    }
    let err = ctl
        .launch_v2(b"tag X", LaunchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::ResourceExhausted(_)));

    // Detaching frees a slot.
    let (pid, cookie) = launched.pop().unwrap();
    ctl.detach(pid, Some(cookie)).unwrap();
    ctl.launch_v2(b"tag X", LaunchOptions::default()).await.unwrap();
}

#[tokio::test]
async fn test_cancel_then_wait() {
    let mut ctl = controller();
    let (pid, cookie) = ctl
        .launch_v2(b"sleep 30000", LaunchOptions::default())
        .await
        .unwrap();

    ctl.cancel(pid, Some(cookie), 5_000).await.unwrap();
    assert_eq!(ctl.status(pid, Some(cookie)).unwrap().state, TaskState::Canceled);
    // The entry survives cancellation; a wait with a generous timeout
    // still finds it and reports the worker gone at once.
    assert!(ctl.wait(pid, Some(cookie), Some(60_000)).await.unwrap());

    // The stream ends with the cancellation error, not silence.
    let err = ctl
        .result(pid, Some(cookie), &[ColumnType::Text])
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Remote { ref code, .. } if code == "57014"));
}

#[tokio::test]
async fn test_fire_and_forget_has_no_results() {
    let mut ctl = controller();
    let (pid, cookie) = ctl
        .submit_v2(b"rows 100\ntag DONE", LaunchOptions::default())
        .await
        .unwrap();

    let err = ctl
        .result(pid, Some(cookie), &[ColumnType::Int64])
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::FeatureDisabled(_)));

    // The worker runs to completion even with nobody reading: the sink
    // discards frames once the queue consumer is gone.
    assert!(ctl.wait(pid, Some(cookie), None).await.unwrap());
    assert_eq!(ctl.status(pid, Some(cookie)).unwrap().state, TaskState::Complete);
}

#[tokio::test]
async fn test_detach_forgets_the_task() {
    let mut ctl = controller();
    let (pid, cookie) = ctl
        .launch_v2(b"sleep 200\ntag DONE", LaunchOptions::default())
        .await
        .unwrap();

    ctl.detach(pid, Some(cookie)).unwrap();
    let err = ctl
        .result(pid, Some(cookie), &[ColumnType::Text])
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::NotFound { pid: p } if p == pid));
    assert_eq!(ctl.task_count(), 0);
}

#[tokio::test]
async fn test_unknown_pid_is_not_found() {
    let mut ctl = controller();
    assert!(matches!(
        ctl.wait(999_999, None, None).await,
        Err(TaskError::NotFound { pid: 999_999 })
    ));
}

#[tokio::test]
async fn test_progress_reporting() {
    let mut ctl = controller();
    let (pid, cookie) = ctl
        .launch_v2(b"progress 42 halfway there\nsleep 2000", LaunchOptions::default())
        .await
        .unwrap();

    // The report lands shortly after launch; poll until it shows up.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let progress = loop {
        if let Some(p) = ctl.progress(pid, Some(cookie)).unwrap() {
            break p;
        }
        assert!(tokio::time::Instant::now() < deadline, "no progress report");
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(progress.pct, 42);
    assert_eq!(progress.message, "halfway there");

    ctl.cancel(pid, Some(cookie), 1_000).await.unwrap();
}

#[tokio::test]
async fn test_notices_and_events_collected() {
    let mut ctl = controller();
    let (pid, cookie) = ctl
        .launch_v2(
            b"notice be advised\nnotify something happened\ntag OK",
            LaunchOptions::default(),
        )
        .await
        .unwrap();

    let result = ctl.result(pid, Some(cookie), &[ColumnType::Text]).await.unwrap();
    assert_eq!(result.notices.len(), 1);
    assert_eq!(result.notices[0].message, "be advised");
    assert_eq!(result.async_events, vec![b"something happened".to_vec()]);
    assert_eq!(result.rows, vec![vec![Value::Text("OK".into())]]);
}

#[tokio::test]
async fn test_list_reflects_lifecycle() {
    let mut ctl = controller();
    let (pid, cookie) = ctl
        .launch_v2(b"sleep 5000", LaunchOptions::default())
        .await
        .unwrap();

    let infos = ctl.list();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].pid, pid);
    assert_eq!(infos[0].owner, "tester");
    assert_eq!(infos[0].cookie, cookie);
    assert_eq!(infos[0].queue_capacity, 4096);
    assert_eq!(infos[0].state, TaskState::Running);
    assert!(infos[0].preview.starts_with("sleep"));
    assert!(!infos[0].consumed);

    ctl.cancel(pid, Some(cookie), 1_000).await.unwrap();
    let infos = ctl.list();
    assert_eq!(infos[0].state, TaskState::Canceled);
}

#[tokio::test]
async fn test_expected_shape_mismatch_is_protocol_error() {
    let mut ctl = controller();
    let (pid, cookie) = ctl
        .launch_v2(b"rows 1", LaunchOptions::default())
        .await
        .unwrap();

    // The script produces a single int64 column.
    let err = ctl
        .result(pid, Some(cookie), &[ColumnType::Text, ColumnType::Text])
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Protocol(_)));
    assert_eq!(ctl.status(pid, Some(cookie)).unwrap().state, TaskState::Failed);
}

/// Identity whose current principal can be swapped mid-test, standing in
/// for a session whose effective user changes between calls.
#[derive(Clone)]
struct SwitchableIdentity {
    name: Arc<Mutex<String>>,
}

impl SwitchableIdentity {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::new(Mutex::new(name.to_owned())),
        }
    }

    fn switch_to(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_owned();
    }
}

impl IdentityProvider for SwitchableIdentity {
    fn current(&self) -> Principal {
        Principal::new(self.name.lock().unwrap().clone())
    }

    fn has_privileges_of(&self, caller: &Principal, owner: &Principal) -> bool {
        caller == owner
    }
}

#[tokio::test]
async fn test_list_hides_other_principals_tasks() {
    let identity = SwitchableIdentity::new("alice");
    let mut ctl = Controller::new(ThreadSupervisor, identity.clone(), test_settings());
    let (pid, cookie) = ctl
        .launch_v2(b"sleep 5000", LaunchOptions::default())
        .await
        .unwrap();

    // Another principal sees an empty listing, not a redacted row.
    identity.switch_to("bob");
    assert!(ctl.list().is_empty());

    identity.switch_to("alice");
    let infos = ctl.list();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].pid, pid);
    assert_eq!(infos[0].cookie, cookie);

    ctl.cancel(pid, Some(cookie), 1_000).await.unwrap();
}

#[tokio::test]
async fn test_wait_times_out_on_running_worker() {
    let mut ctl = controller();
    let (pid, cookie) = ctl
        .launch_v2(b"sleep 30000", LaunchOptions::default())
        .await
        .unwrap();

    assert!(!ctl.wait(pid, Some(cookie), Some(50)).await.unwrap());

    // Once the worker is gone the same call reports so immediately.
    ctl.cancel(pid, Some(cookie), 1_000).await.unwrap();
    assert!(ctl.wait(pid, Some(cookie), Some(50)).await.unwrap());
}

#[tokio::test]
async fn test_status_tracks_activity_timestamps() {
    let mut ctl = controller();
    let (pid, cookie) = ctl
        .launch_v2(b"sleep 30000", LaunchOptions::default())
        .await
        .unwrap();

    let before = ctl.status(pid, Some(cookie)).unwrap();
    assert!(before.started_at <= before.last_activity);

    tokio::time::sleep(Duration::from_millis(20)).await;
    ctl.cancel(pid, Some(cookie), 1_000).await.unwrap();
    let after = ctl.status(pid, Some(cookie)).unwrap();
    assert_eq!(after.started_at, before.started_at);
    assert!(after.last_activity > before.last_activity);
}

/// Supervisor whose workers attach to the channel and then ignore every
/// stop request, for exercising the cancellation escalation path.
struct StubbornSupervisor;

struct StubbornHandle {
    pid: u32,
    _sender: RingSender,
}

#[async_trait]
impl ProcessSupervisor for StubbornSupervisor {
    async fn start(&self, channel: &str) -> TaskResult<Box<dyn WorkerHandle>> {
        let (sender, _control, _request) = open_channel(channel)?;
        Ok(Box::new(StubbornHandle {
            pid: 424_242,
            _sender: sender,
        }))
    }
}

impl WorkerHandle for StubbornHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn status(&mut self) -> WorkerStatus {
        WorkerStatus::Running
    }

    fn stop_graceful(&mut self) {}

    fn stop_forceful(&mut self) {}
}

#[tokio::test]
async fn test_cancel_returns_even_if_worker_survives_termination() {
    let mut ctl = Controller::new(
        StubbornSupervisor,
        SessionIdentity::new("tester"),
        test_settings(),
    );
    let (pid, cookie) = ctl
        .launch_v2(b"sleep 30000", LaunchOptions::default())
        .await
        .unwrap();

    let begun = Instant::now();
    ctl.cancel(pid, Some(cookie), 50).await.unwrap();
    // Grace (50 ms) plus the bounded post-termination wait, with slack
    // for poll backoff.
    assert!(begun.elapsed() < Duration::from_secs(5));
    // The worker never actually stopped, and the state says so.
    assert_eq!(ctl.status(pid, Some(cookie)).unwrap().state, TaskState::Running);
}
