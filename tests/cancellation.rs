//! Integration tests for hierarchical cancellation.

mod common;

use std::sync::{Arc, Mutex};

use jobrun::context::ambient;
use jobrun::{BlockingCondition, JobDescriptor, JobError, JobHandle};

use common::{
    is_parked, scheduler, session_context, transactional, wait_until, CountingMember,
    TEST_TIMEOUT,
};

/// job1 (id 1, S1) → job2 (id 1, S2) → schedule job3 (blocks)
///                                  → job4 (no-op)
///                                  → job5 (blocks)
#[tokio::test]
async fn cancel_reaches_nested_inline_jobs_but_not_scheduled_ones() {
    let scheduler = scheduler();
    let members: Vec<_> = (1..=5)
        .map(|i| CountingMember::new(&format!("job{i}")))
        .collect();
    let gate3 = BlockingCondition::new("job3", true);
    let gate5 = BlockingCondition::new("job5", true);
    let job3_handle: Arc<Mutex<Option<JobHandle<()>>>> = Arc::default();

    let outer = {
        let s = scheduler.clone();
        let m = members.clone();
        let (gate3, gate5) = (gate3.clone(), gate5.clone());
        let job3_handle = Arc::clone(&job3_handle);
        tokio::spawn(async move {
            let s1 = s.clone();
            s.run_now(transactional("job1", 1, "S1", &m[0]), async move {
                let s2 = s1.clone();
                s1.run_now(transactional("job2", 1, "S2", &m[1]), async move {
                    let handle = s2.schedule(transactional("job3", 3, "S2", &m[2]), async move {
                        gate3.wait(None).await
                    })?;
                    *job3_handle.lock().unwrap() = Some(handle);

                    s2.run_now(transactional("job4", 4, "S2", &m[3]), async { Ok(()) })
                        .await?;

                    s2.run_now(transactional("job5", 5, "S2", &m[4]), async move {
                        gate5.wait(None).await
                    })
                    .await
                })
                .await
            })
            .await
        })
    };

    wait_until("job5 to park", || is_parked(&scheduler, 5)).await;
    wait_until("job3 to park", || is_parked(&scheduler, 3)).await;

    assert!(
        !scheduler.cancel(1, Some("S2")),
        "job2 is nested and not directly cancellable"
    );
    assert!(scheduler.is_running(5));

    assert!(scheduler.cancel(1, Some("S1")));
    let result = tokio::time::timeout(TEST_TIMEOUT, outer)
        .await
        .expect("job1 should unwind")
        .unwrap();
    assert!(matches!(result, Err(JobError::Cancelled)));

    for (i, member) in members.iter().enumerate() {
        let expected_rollbacks = match i + 1 {
            1 | 2 | 5 => 1,
            _ => 0,
        };
        assert_eq!(
            member.rollbacks(),
            expected_rollbacks,
            "rollbacks of job{}",
            i + 1
        );
    }
    assert_eq!(members[3].commits(), 1, "job4 finished and committed");

    let job3 = job3_handle.lock().unwrap().take().unwrap();
    assert!(!job3.is_cancelled(), "job3 is a separate root");
    gate3.set_blocking(false);
    tokio::time::timeout(TEST_TIMEOUT, job3.join())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(members[2].commits(), 1);
    assert_eq!(members[2].rollbacks(), 0);
    assert!(scheduler.running_jobs().is_empty());
}

#[tokio::test]
async fn cancel_with_unknown_id_is_a_no_op() {
    let scheduler = scheduler();
    let gate = BlockingCondition::new("gate", true);
    let waiter = gate.clone();
    let handle = scheduler
        .schedule(
            JobDescriptor::new("bystander")
                .with_id(1)
                .with_context(session_context("s1")),
            async move { waiter.wait(None).await },
        )
        .unwrap();
    wait_until("bystander to park", || is_parked(&scheduler, 1)).await;

    assert!(!scheduler.cancel(42, Some("s1")));
    assert!(!scheduler.cancel(42, Some("s1")));
    assert!(!scheduler.cancel(1, Some("other-session")));
    assert!(!handle.is_cancelled());

    gate.set_blocking(false);
    tokio::time::timeout(TEST_TIMEOUT, handle.join())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn cancelled_wait_reports_cancellation_and_rolls_back_once() {
    let scheduler = scheduler();
    let member = CountingMember::new("db");
    let gate = BlockingCondition::new("answer", true);

    let waiter = gate.clone();
    let handle = scheduler
        .schedule(transactional("ask", 7, "s1", &member), async move {
            waiter.wait(Some(TEST_TIMEOUT * 4)).await
        })
        .unwrap();
    wait_until("job to park", || is_parked(&scheduler, 7)).await;

    assert!(scheduler.cancel(7, Some("s1")));
    let err = tokio::time::timeout(TEST_TIMEOUT, handle.join())
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, JobError::Cancelled), "got {err:?}");
    assert_eq!(member.rollbacks(), 1);
    assert_eq!(member.releases(), 1);
    assert_eq!(member.commits(), 0);
}

#[tokio::test]
async fn request_registrations_cancel_running_work() {
    let scheduler = scheduler();
    let registered = Arc::new(tokio::sync::Notify::new());

    let s = scheduler.clone();
    let signal = Arc::clone(&registered);
    let handle = scheduler
        .schedule(
            JobDescriptor::new("upload").with_context(session_context("s1")),
            async move {
                let monitor = ambient::monitor().expect("job has a monitor");
                let registration = s.register(&monitor, "s1", "req-9");
                signal.notify_one();
                monitor.cancelled().await;
                s.unregister(registration);
                Err::<(), _>(JobError::Cancelled)
            },
        )
        .unwrap();

    tokio::time::timeout(TEST_TIMEOUT, registered.notified())
        .await
        .unwrap();
    assert!(!scheduler.cancel_all_by_session_and_request_id("s1", "req-8"));
    assert!(scheduler.cancel_all_by_session_and_request_id("s1", "req-9"));

    let err = tokio::time::timeout(TEST_TIMEOUT, handle.join())
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(!scheduler.cancel_all_by_session_and_request_id("s1", "req-9"));
}

#[tokio::test]
async fn cancel_all_by_session_leaves_other_sessions_alone() {
    let scheduler = scheduler();
    let gate = BlockingCondition::new("gate", true);

    let spawn = |id: u64, session: &str| {
        let waiter = gate.clone();
        scheduler
            .schedule(
                JobDescriptor::new("worker")
                    .with_id(id)
                    .with_context(session_context(session))
                    .without_mutex(),
                async move { waiter.wait(None).await },
            )
            .unwrap()
    };
    let a = spawn(1, "s1");
    let b = spawn(2, "s1");
    let c = spawn(3, "s2");
    for id in 1..=3 {
        wait_until("worker to park", || is_parked(&scheduler, id)).await;
    }

    assert!(scheduler.cancel_all_by_session("s1"));
    assert!(a.join().await.unwrap_err().is_cancelled());
    assert!(b.join().await.unwrap_err().is_cancelled());
    assert!(!c.is_cancelled());

    gate.set_blocking(false);
    tokio::time::timeout(TEST_TIMEOUT, c.join())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn explicit_parent_monitor_propagates_into_scheduled_job() {
    let scheduler = scheduler();
    let s = scheduler.clone();

    let child = scheduler
        .run_now(
            JobDescriptor::new("parent").with_context(session_context("s1")),
            async move {
                let parent = ambient::monitor().expect("job has a monitor");
                let child = s.schedule(
                    JobDescriptor::new("child")
                        .with_context(session_context("s2"))
                        .with_parent_monitor(parent.clone()),
                    async {
                        if let Some(monitor) = ambient::monitor() {
                            monitor.cancelled().await;
                        }
                        Err::<(), _>(JobError::Cancelled)
                    },
                )?;
                parent.cancel();
                Ok(child)
            },
        )
        .await;

    // The parent cancelled itself but still returned normally.
    let child = child.unwrap();
    let err = tokio::time::timeout(TEST_TIMEOUT, child.join())
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn soft_cancel_leaves_a_parked_job_waiting() {
    let scheduler = scheduler();
    let gate = BlockingCondition::new("gate", true);
    let waiter = gate.clone();
    let handle = scheduler
        .schedule(
            JobDescriptor::new("patient")
                .with_id(11)
                .with_context(session_context("s1")),
            async move {
                waiter.wait(None).await?;
                let monitor = ambient::monitor().expect("job has a monitor");
                Ok(monitor.is_cancelled())
            },
        )
        .unwrap();
    wait_until("job to park", || is_parked(&scheduler, 11)).await;

    assert!(handle.cancel_soft());
    assert!(handle.is_cancelled());
    assert!(!handle.monitor().is_interrupted());
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(is_parked(&scheduler, 11), "a soft cancel must not end the wait");

    gate.set_blocking(false);
    let saw_cancel = tokio::time::timeout(TEST_TIMEOUT, handle.join())
        .await
        .unwrap()
        .unwrap();
    assert!(saw_cancel, "the body observes the cancelled flag after waking");
}

#[tokio::test]
async fn forced_cancel_after_soft_cancel_ends_the_wait() {
    let scheduler = scheduler();
    let gate = BlockingCondition::new("gate", true);
    let waiter = gate.clone();
    let handle = scheduler
        .schedule(
            JobDescriptor::new("stubborn")
                .with_id(12)
                .with_context(session_context("s1")),
            async move { waiter.wait(None).await },
        )
        .unwrap();
    wait_until("job to park", || is_parked(&scheduler, 12)).await;

    assert!(handle.cancel_soft());
    assert!(!handle.cancel(), "already cancelled");
    let err = tokio::time::timeout(TEST_TIMEOUT, handle.join())
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_cancelled());
}
