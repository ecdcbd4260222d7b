//! Scheduler 单元测试
//!
//! 测试任务状态、失败传播、上下文亲和性和死锁检测

use crate::runtime::scheduler::{
    delay, yield_now, ConfigureAwait, ContinuationQueue, Escalation, ExecutionContext, FailureOrigin, Handle,
    PoolContext, Scheduler, SchedulerConfig, TaskError, TaskHeader, TaskId, TaskKind, TaskState, UnobservedFailure,
    UnobservedFailureSink, WaitError,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};


/// Failures that reached the fatal path of the test sink.
type Fatal = Arc<Mutex<Vec<UnobservedFailure>>>;

/// Sink whose fatal path records instead of aborting.
fn recording_sink() -> (UnobservedFailureSink, Fatal) {
    let fatal: Fatal = Arc::new(Mutex::new(Vec::new()));
    let recorded = fatal.clone();
    let sink = UnobservedFailureSink::with_terminator(move |failure| recorded.lock().push(failure.clone()));
    (sink, fatal)
}

fn test_config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        num_workers: workers,
        idle_timeout: Duration::from_millis(5),
        thread_name_prefix: "test".to_string(),
        ..SchedulerConfig::default()
    }
}

fn test_scheduler(workers: usize) -> (Scheduler, Fatal) {
    let (sink, fatal) = recording_sink();
    (Scheduler::with_config_and_sink(test_config(workers), sink), fatal)
}

fn detached_context() -> ExecutionContext {
    ExecutionContext::Pooled(PoolContext::new(ContinuationQueue::new()))
}

/// Poll `check` until it holds or `timeout` passes.
fn wait_for(
    timeout: Duration,
    check: impl Fn() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    check()
}

fn boom(message: &str) -> anyhow::Error {
    anyhow::anyhow!("{}", message.to_string())
}

#[cfg(test)]
mod task_id_tests {
    use super::*;

    #[test]
    fn test_task_ids_are_unique_and_increasing() {
        let a = TaskHeader::new(None, TaskKind::Tracked, detached_context());
        let b = TaskHeader::new(None, TaskKind::Tracked, detached_context());
        assert_ne!(a.id(), b.id());
        assert!(a.id() < b.id());
    }

    #[test]
    fn test_task_id_display() {
        let header = TaskHeader::new(None, TaskKind::Tracked, detached_context());
        let shown = header.id().to_string();
        assert_eq!(shown, format!("Task({})", header.id().inner()));
        // Unnamed tasks are named after their id.
        assert_eq!(header.name(), shown);
    }
}

#[cfg(test)]
mod task_state_tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [TaskState; 6] = [
        TaskState::Pending,
        TaskState::Running,
        TaskState::Suspended,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    #[test]
    fn test_task_state_u8_roundtrip() {
        for state in ALL {
            assert_eq!(TaskState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_task_state_terminal() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Suspended.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn test_new_header_is_pending_and_unobserved() {
        let header = TaskHeader::new(Some("named".to_string()), TaskKind::FireAndForget, detached_context());
        assert_eq!(header.state(), TaskState::Pending);
        assert_eq!(header.kind(), TaskKind::FireAndForget);
        assert_eq!(header.name(), "named");
        assert!(!header.is_observed());
    }

    proptest! {
        #[test]
        fn prop_terminal_state_never_changes(steps in prop::collection::vec(0u8..6, 1..32)) {
            let header = TaskHeader::new(None, TaskKind::Tracked, detached_context());
            let mut terminal: Option<TaskState> = None;

            for step in steps {
                let to = TaskState::from_u8(step);
                let moved = header.transition(to);
                match terminal {
                    Some(state) => {
                        prop_assert!(!moved);
                        prop_assert_eq!(header.state(), state);
                    },
                    None => {
                        prop_assert!(moved);
                        prop_assert_eq!(header.state(), to);
                        if to.is_terminal() {
                            terminal = Some(to);
                        }
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod scheduler_config_tests {
    use super::*;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert!(config.num_workers > 0);
        assert_eq!(config.idle_timeout, Duration::from_millis(10));
        assert!(config.stall_timeout.is_none());
        assert_eq!(config.thread_name_prefix, "taskctx");
    }

    #[test]
    fn test_scheduler_spawns_named_workers() {
        let (scheduler, _fatal) = test_scheduler(3);
        assert_eq!(scheduler.num_workers(), 3);
        assert_eq!(scheduler.workers().len(), 3);
        let names: Vec<_> = scheduler
            .workers()
            .snapshot()
            .iter()
            .map(|slot| slot.name().to_string())
            .collect();
        assert_eq!(names, vec!["test-worker-0", "test-worker-1", "test-worker-2"]);
    }
}

#[cfg(test)]
mod captured_tests {
    use super::*;

    #[test]
    fn test_submit_and_block_returns_value() {
        let (scheduler, fatal) = test_scheduler(2);
        let pool = scheduler.pooled_context();
        let task = scheduler.submit(async { anyhow::Ok(40 + 2) }, &pool);

        assert_eq!(task.block_until_complete().unwrap(), 42);
        assert_eq!(task.state(), TaskState::Completed);
        assert!(task.is_observed());
        assert!(fatal.lock().is_empty());
    }

    #[test]
    fn test_block_on_failed_pooled_task_returns_error() {
        let (scheduler, fatal) = test_scheduler(2);
        let pool = scheduler.pooled_context();
        let task = scheduler.submit(
            async {
                delay(Duration::from_millis(20)).await;
                Err::<(), _>(boom("some async failed"))
            },
            &pool,
        );

        let err = task.block_until_complete().unwrap_err();
        assert!(matches!(err, TaskError::Faulted(_)));
        assert!(err.to_string().contains("some async failed"));
        assert_eq!(task.state(), TaskState::Failed);

        drop(task);
        assert!(fatal.lock().is_empty());
        assert_eq!(scheduler.sink().reported_count(), 0);
    }

    #[test]
    fn test_await_propagates_failure_exactly_once() {
        let (scheduler, fatal) = test_scheduler(2);
        let pool = scheduler.pooled_context();
        let handle = scheduler.handle();
        let caught = Arc::new(AtomicUsize::new(0));
        let counter = caught.clone();
        let inner_pool = pool.clone();

        let outer = scheduler.submit(
            async move {
                let failing = handle.submit(async { Err::<(), _>(boom("thrown")) }, &inner_pool);
                if let Err(err) = failing.await {
                    assert!(err.is_failure());
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                anyhow::Ok("handled")
            },
            &pool,
        );

        assert_eq!(outer.block_until_complete().unwrap(), "handled");
        assert_eq!(caught.load(Ordering::SeqCst), 1);
        assert!(fatal.lock().is_empty());
    }

    #[test]
    fn test_every_awaiter_receives_the_error() {
        let (scheduler, fatal) = test_scheduler(4);
        let pool = scheduler.pooled_context();
        let target = scheduler.submit(
            async {
                delay(Duration::from_millis(30)).await;
                Err::<u32, _>(boom("shared failure"))
            },
            &pool,
        );

        let awaiters: Vec<_> = (0..3)
            .map(|_| {
                let target = target.clone();
                scheduler.submit(async move { anyhow::Ok(target.await.is_err()) }, &pool)
            })
            .collect();

        for awaiter in awaiters {
            assert!(awaiter.block_until_complete().unwrap());
        }
        drop(target);
        assert!(fatal.lock().is_empty());
    }

    #[test]
    fn test_panic_is_captured() {
        let (scheduler, fatal) = test_scheduler(1);
        let pool = scheduler.pooled_context();
        let task = scheduler.submit(
            async {
                if true {
                    panic!("body panicked");
                }
                anyhow::Ok(())
            },
            &pool,
        );

        match task.block_until_complete() {
            Err(TaskError::Panicked(message)) => assert!(message.contains("body panicked")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(fatal.lock().is_empty());
    }

    #[test]
    fn test_downcast_body_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("invalid operation")]
        struct InvalidOperation;

        let (scheduler, _fatal) = test_scheduler(1);
        let pool = scheduler.pooled_context();
        let task = scheduler.submit(async { Err::<(), _>(anyhow::Error::new(InvalidOperation)) }, &pool);

        let err = task.block_until_complete().unwrap_err();
        assert!(err.downcast_ref::<InvalidOperation>().is_some());
    }

    #[test]
    fn test_block_timeout() {
        let (scheduler, _fatal) = test_scheduler(1);
        let pool = scheduler.pooled_context();
        let task = scheduler.submit(
            async {
                delay(Duration::from_millis(500)).await;
                anyhow::Ok(())
            },
            &pool,
        );

        let err = task
            .block_until_complete_timeout(Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, WaitError::TimedOut(_)));
        assert!(!task.is_finished());
    }
}

#[cfg(test)]
mod unobserved_tests {
    use super::*;

    #[test]
    fn test_fire_and_forget_failure_reported_once() {
        let (scheduler, fatal) = test_scheduler(2);
        let pool = scheduler.pooled_context();
        scheduler.fire_and_forget_named("void", async { Err(boom("async void")) }, &pool);

        assert!(wait_for(Duration::from_secs(2), || !fatal.lock().is_empty()));
        thread::sleep(Duration::from_millis(20));

        let fatal = fatal.lock();
        assert_eq!(fatal.len(), 1);
        assert_eq!(fatal[0].origin, FailureOrigin::FireAndForget);
        assert_eq!(fatal[0].name, "void");
        assert!(fatal[0].error.to_string().contains("async void"));
    }

    #[test]
    fn test_fire_and_forget_success_is_silent() {
        let (scheduler, fatal) = test_scheduler(1);
        let pool = scheduler.pooled_context();
        scheduler.fire_and_forget(async { anyhow::Ok(()) }, &pool);

        assert!(wait_for(Duration::from_secs(2), || scheduler.pending_tasks() == 0));
        assert!(fatal.lock().is_empty());
        assert_eq!(scheduler.stats().tasks_completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_unobserved_handle_reports() {
        let (scheduler, fatal) = test_scheduler(1);
        let pool = scheduler.pooled_context();
        let task = scheduler.submit(async { Err::<(), _>(boom("nobody looked")) }, &pool);

        assert!(wait_for(Duration::from_secs(2), || task.is_finished()));
        // A live handle can still observe the failure.
        assert!(fatal.lock().is_empty());

        drop(task);
        let fatal = fatal.lock();
        assert_eq!(fatal.len(), 1);
        assert_eq!(fatal[0].origin, FailureOrigin::Unobserved);
    }

    #[test]
    fn test_last_clone_decides() {
        let (scheduler, fatal) = test_scheduler(1);
        let pool = scheduler.pooled_context();
        let task = scheduler.submit(async { Err::<(), _>(boom("twice held")) }, &pool);
        let clone = task.clone();

        assert!(wait_for(Duration::from_secs(2), || task.is_finished()));
        drop(task);
        assert!(fatal.lock().is_empty());
        drop(clone);
        assert_eq!(fatal.lock().len(), 1);
    }

    #[test]
    fn test_observed_failure_never_reports() {
        let (scheduler, fatal) = test_scheduler(1);
        let pool = scheduler.pooled_context();
        let task = scheduler.submit(async { Err::<(), _>(boom("seen")) }, &pool);
        assert!(task.block_until_complete().is_err());
        drop(task);
        assert!(fatal.lock().is_empty());
        assert_eq!(scheduler.sink().reported_count(), 0);
    }

    #[test]
    fn test_handled_callback_keeps_process_alive() {
        let (scheduler, fatal) = test_scheduler(1);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        scheduler.on_unobserved_failure(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Escalation::Handled
        });

        let pool = scheduler.pooled_context();
        scheduler.fire_and_forget(async { Err(boom("handled")) }, &pool);

        assert!(wait_for(Duration::from_secs(2), || seen.load(Ordering::SeqCst) == 1));
        assert!(fatal.lock().is_empty());
    }

    #[test]
    fn test_posted_panic_reaches_sink() {
        let (scheduler, fatal) = test_scheduler(1);
        let pool = scheduler.pooled_context();
        pool.post(|| panic!("handler exploded"));

        assert!(wait_for(Duration::from_secs(2), || !fatal.lock().is_empty()));
        let fatal = fatal.lock();
        assert_eq!(fatal[0].origin, FailureOrigin::Posted);
        assert!(fatal[0].task.is_none());
        assert!(matches!(fatal[0].error, TaskError::Panicked(_)));
    }
}

#[cfg(test)]
mod affinity_tests {
    use super::*;
    use crossbeam::channel;

    fn thread_name() -> String {
        thread::current().name().unwrap_or_default().to_string()
    }

    #[test]
    fn test_affine_posts_run_in_order_on_one_thread() {
        let (scheduler, _fatal) = test_scheduler(2);
        let ui = scheduler.affine_context("ui").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = channel::unbounded();

        for i in 0..3 {
            let order = order.clone();
            let tx = tx.clone();
            ui.post(move || {
                order.lock().push((i, thread_name()));
                let _ = tx.send(());
            });
        }
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }

        let order = order.lock();
        assert_eq!(order.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(order.iter().all(|(_, name)| name == "test-ui"));
    }

    #[test]
    fn test_affine_task_resumes_on_its_worker() {
        let (scheduler, _fatal) = test_scheduler(2);
        let ui = scheduler.affine_context("ui").unwrap();
        let pool = scheduler.pooled_context();
        let handle = scheduler.handle();

        let task = scheduler.submit(
            async move {
                let before = thread_name();
                let inner = handle.submit(
                    async {
                        delay(Duration::from_millis(10)).await;
                        anyhow::Ok(thread_name())
                    },
                    &pool,
                );
                let inner_thread = inner.await?;
                anyhow::Ok((before, inner_thread, thread_name()))
            },
            &ui,
        );

        let (before, inner_thread, after) = task.block_until_complete().unwrap();
        assert_eq!(before, "test-ui");
        assert!(inner_thread.starts_with("test-worker-"));
        assert_eq!(after, "test-ui");
    }

    #[test]
    fn test_configure_await_false_moves_to_pool() {
        let (scheduler, _fatal) = test_scheduler(2);
        let ui = scheduler.affine_context("ui").unwrap();

        let captured = scheduler.submit(
            async {
                delay(Duration::from_millis(5)).configure_await(true).await;
                anyhow::Ok(thread_name())
            },
            &ui,
        );
        let released = scheduler.submit(
            async {
                delay(Duration::from_millis(5)).configure_await(false).await;
                anyhow::Ok(thread_name())
            },
            &ui,
        );

        assert_eq!(captured.block_until_complete().unwrap(), "test-ui");
        assert!(released.block_until_complete().unwrap().starts_with("test-worker-"));
        assert!(!released.context().is_affine());
        assert!(captured.context().is_affine());
    }

    #[test]
    fn test_configure_await_ready_future_stays() {
        let (scheduler, _fatal) = test_scheduler(1);
        let ui = scheduler.affine_context("ui").unwrap();
        let task = scheduler.submit(
            async {
                std::future::ready(()).configure_await(false).await;
                anyhow::Ok(thread_name())
            },
            &ui,
        );
        assert_eq!(task.block_until_complete().unwrap(), "test-ui");
        assert!(task.context().is_affine());
    }

    #[test]
    fn test_start_runs_first_span_inline() {
        let (scheduler, _fatal) = test_scheduler(1);
        let pool = scheduler.pooled_context();
        let caller = thread_name();

        let task = scheduler.start(
            async {
                let first = thread_name();
                delay(Duration::from_millis(5)).await;
                anyhow::Ok((first, thread_name()))
            },
            &pool,
        );

        let (first, rest) = task.block_until_complete().unwrap();
        assert_eq!(first, caller);
        assert_eq!(rest, "test-worker-0");
    }

    #[test]
    fn test_current_task_and_handle() {
        let (scheduler, _fatal) = test_scheduler(1);
        let pool = scheduler.pooled_context();
        assert!(crate::runtime::scheduler::current_task().is_none());
        assert!(Handle::current().is_none());

        let task = scheduler.submit(
            async {
                let id: Option<TaskId> = crate::runtime::scheduler::current_task();
                anyhow::Ok((id, Handle::current().is_some()))
            },
            &pool,
        );
        let (id, has_handle) = task.block_until_complete().unwrap();
        assert_eq!(id, Some(task.id()));
        assert!(has_handle);
    }

    #[test]
    fn test_yield_now_interleaves_on_affine_context() {
        let (scheduler, _fatal) = test_scheduler(1);
        let ui = scheduler.affine_context("ui").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = scheduler.handle();
        let target = ui.clone();
        let shared_log = log.clone();
        let (tx, rx) = channel::bounded(1);

        // Submit from the ui worker so both first spans are queued before either runs.
        ui.post(move || {
            let tasks: Vec<_> = ["a", "b"]
                .into_iter()
                .map(|label| {
                    let log = shared_log.clone();
                    handle.submit(
                        async move {
                            for step in 0..2 {
                                log.lock().push(format!("{}{}", label, step));
                                yield_now().await;
                            }
                            anyhow::Ok(())
                        },
                        &target,
                    )
                })
                .collect();
            let _ = tx.send(tasks);
        });

        let tasks = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        for task in tasks {
            task.block_until_complete().unwrap();
        }

        assert_eq!(*log.lock(), vec!["a0", "b0", "a1", "b1"]);
    }

    #[test]
    fn test_pooled_block_inside_task_completes() {
        let (scheduler, _fatal) = test_scheduler(2);
        let pool = scheduler.pooled_context();
        let handle = scheduler.handle();
        let inner_pool = pool.clone();

        let outer = scheduler.submit(
            async move {
                let inner = handle.submit(
                    async {
                        delay(Duration::from_millis(10)).await;
                        anyhow::Ok(7)
                    },
                    &inner_pool,
                );
                // Another pool worker runs the continuation.
                anyhow::Ok(inner.block_until_complete()?)
            },
            &pool,
        );

        assert_eq!(
            outer
                .block_until_complete_timeout(Duration::from_secs(2))
                .unwrap(),
            7
        );
    }
}

#[cfg(test)]
mod deadlock_tests {
    use super::*;
    use crossbeam::channel;

    #[test]
    fn test_affine_self_block_is_reported_and_released_by_shutdown() {
        let (sink, fatal) = recording_sink();
        let config = SchedulerConfig {
            stall_timeout: Some(Duration::from_millis(50)),
            stall_poll_interval: Duration::from_millis(10),
            ..test_config(1)
        };
        let scheduler = Scheduler::with_config_and_sink(config, sink);
        let ui = scheduler.affine_context("ui").unwrap();
        let handle = scheduler.handle();
        let target = ui.clone();

        let (id_tx, id_rx) = channel::bounded(1);
        let (done_tx, done_rx) = channel::bounded(1);
        ui.post(move || {
            let task = handle.submit(async { anyhow::Ok(1) }, &target);
            let _ = id_tx.send(task.id());
            let _ = done_tx.send(task.block_until_complete());
        });

        let id = id_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(wait_for(Duration::from_secs(2), || !scheduler.stall_reports().is_empty()));

        let reports = scheduler.stall_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].task, id);
        assert_eq!(reports[0].worker_name, "test-ui");
        assert!(reports[0].stranded >= 1);

        // Still blocked: no result without outside intervention.
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

        scheduler.shutdown();
        let outcome = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(outcome, Err(TaskError::Cancelled)));
        assert!(fatal.lock().is_empty());
        assert_eq!(scheduler.stats().tasks_cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stall_callback_is_invoked_once() {
        let (sink, _fatal) = recording_sink();
        let config = SchedulerConfig {
            stall_timeout: Some(Duration::from_millis(30)),
            stall_poll_interval: Duration::from_millis(5),
            ..test_config(1)
        };
        let scheduler = Scheduler::with_config_and_sink(config, sink);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        scheduler.on_stall(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let ui = scheduler.affine_context("ui").unwrap();
        let handle = scheduler.handle();
        let target = ui.clone();
        ui.post(move || {
            let task = handle.submit(async { anyhow::Ok(()) }, &target);
            let _ = task.block_until_complete();
        });

        assert!(wait_for(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(60));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

#[cfg(test)]
mod shutdown_tests {
    use super::*;

    #[test]
    fn test_shutdown_cancels_suspended_tasks() {
        let (scheduler, fatal) = test_scheduler(1);
        let pool = scheduler.pooled_context();
        let task = scheduler.submit(
            async {
                delay(Duration::from_secs(30)).await;
                anyhow::Ok(())
            },
            &pool,
        );
        assert!(wait_for(Duration::from_secs(2), || task.state() == TaskState::Suspended));

        scheduler.shutdown();
        assert!(!scheduler.is_running());
        assert!(matches!(task.block_until_complete(), Err(TaskError::Cancelled)));
        assert_eq!(scheduler.pending_tasks(), 0);
        drop(task);
        // Cancellation is not a failure.
        assert!(fatal.lock().is_empty());
    }

    #[test]
    fn test_submit_after_shutdown_is_cancelled() {
        let (scheduler, _fatal) = test_scheduler(1);
        let pool = scheduler.pooled_context();
        scheduler.shutdown();
        scheduler.shutdown();

        let task = scheduler.submit(async { anyhow::Ok(()) }, &pool);
        assert_eq!(task.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_stats_track_outcomes() {
        let (scheduler, _fatal) = test_scheduler(2);
        let pool = scheduler.pooled_context();
        let ok = scheduler.submit(async { anyhow::Ok(()) }, &pool);
        let failed = scheduler.submit(async { Err::<(), _>(boom("x")) }, &pool);
        ok.block_until_complete().unwrap();
        failed.block_until_complete().unwrap_err();

        assert!(wait_for(Duration::from_secs(2), || scheduler.stats().in_flight() == 0));
        let stats = scheduler.stats();
        assert_eq!(stats.tasks_submitted.load(Ordering::SeqCst), 2);
        assert_eq!(stats.tasks_completed.load(Ordering::SeqCst), 1);
        assert_eq!(stats.tasks_failed.load(Ordering::SeqCst), 1);
        assert!(stats.continuations_run.load(Ordering::SeqCst) >= 2);
    }
}
