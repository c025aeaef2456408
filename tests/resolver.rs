use std::time::Duration;

use fdwxact::prelude::*;

mod common;

use common::*;

fn resolved_servers(env: &TestEnv) -> Vec<(Oid, bool)> {
    env.events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Resolve {
                server_id,
                is_commit,
                ..
            } => Some((server_id, is_commit)),
            _ => None,
        })
        .collect()
}

/// Prepares servers 1 and 2 for `xid` and commits locally, leaving the
/// session ready to wait.
fn committed_session(env: &TestEnv, xid: TransactionId) -> FdwXactSession {
    let mut session = session_with_writes(env, xid, &[1, 2]);
    session.pre_commit().unwrap();
    env.oracle.set_status(xid, LocalXactStatus::Committed);
    session.finish(true);
    session
}

mod single_threaded_tests {
    use super::*;

    #[test]
    fn test_nothing_to_resolve() {
        let env = setup(CommitPolicy::Required);
        assert!(!env.manager.resolve_one(DB, true).unwrap());
        assert!(!env.manager.resolve_one(DB, false).unwrap());
        assert_eq!(env.manager.resolve_all_dangling(DB).unwrap(), 0);

        let mut session = env.manager.session(DB);
        assert_eq!(
            session.wait_for_resolution(999, true).unwrap(),
            WaitOutcome::NotRequired
        );
    }

    #[test]
    fn test_dangling_sweep_resolves_by_local_outcome() {
        let env = setup(CommitPolicy::Required);
        orphan_prepared(&env, 100, &[1]);
        orphan_prepared(&env, 101, &[2]);
        env.oracle.set_status(100, LocalXactStatus::Committed);
        env.oracle.set_status(101, LocalXactStatus::Aborted);
        assert_eq!(env.manager.distributed_xmin(), Some(100));

        assert_eq!(env.manager.resolve_all_dangling(DB).unwrap(), 2);

        assert_eq!(env.manager.entry_count(), 0);
        assert_eq!(env.manager.distributed_xmin(), None);
        let mut resolved = resolved_servers(&env);
        resolved.sort();
        assert_eq!(resolved, vec![(1, true), (2, false)]);
    }

    #[test]
    fn test_dangling_sweep_is_per_database() {
        let env = setup(CommitPolicy::Required);
        orphan_prepared(&env, 100, &[1]);

        assert_eq!(env.manager.resolve_all_dangling(DB + 1).unwrap(), 0);
        assert_eq!(env.manager.entry_count(), 1);
    }

    #[test]
    fn test_in_progress_transaction_is_not_resolved() {
        let env = setup(CommitPolicy::Required);
        orphan_prepared(&env, 300, &[1]);
        env.oracle.set_status(300, LocalXactStatus::InProgress);

        let err = env.manager.resolve_all_dangling(DB).unwrap_err();
        assert!(matches!(err, FdwXactError::TransactionInProgress(300)));
        assert_eq!(env.manager.entry_count(), 1);
        assert_eq!(env.manager.distributed_xmin(), Some(300));

        env.oracle.set_status(300, LocalXactStatus::Aborted);
        assert_eq!(env.manager.resolve_all_dangling(DB).unwrap(), 1);
        assert_eq!(resolved_servers(&env), vec![(1, false)]);
    }

    #[test]
    fn test_failed_sweep_keeps_entry_for_next_attempt() {
        let env = setup(CommitPolicy::Required);
        orphan_prepared(&env, 100, &[1, 2]);
        env.driver.fail_resolve(2, true);

        let err = env.manager.resolve_all_dangling(DB).unwrap_err();
        assert!(matches!(
            err,
            FdwXactError::RemoteResolveFailed { server_id: 2, .. }
        ));
        let rows = env.manager.list_foreign_xacts();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].server_id, 2);

        env.driver.fail_resolve(2, false);
        assert_eq!(env.manager.resolve_all_dangling(DB).unwrap(), 1);
        assert_eq!(env.manager.entry_count(), 0);
    }

    #[test]
    fn test_warning_severity_forgets_entry() {
        let env = setup_with(|config| {
            config.commit_policy = CommitPolicy::Required;
            config.resolution_failure = FailureSeverity::Warning;
        });
        orphan_prepared(&env, 400, &[1]);
        env.driver.fail_resolve(1, true);

        assert_eq!(env.manager.resolve_all_dangling(DB).unwrap(), 1);
        assert_eq!(env.manager.entry_count(), 0);
        assert!(resolved_servers(&env).is_empty());
    }

    #[test]
    fn test_sweep_skips_locally_prepared_transaction() {
        let env = setup(CommitPolicy::Required);
        let mut session = session_with_writes(&env, 200, &[1, 2]);
        session.register_participant(3, USER, false).unwrap();
        session.prepare_transaction().unwrap();
        env.oracle.set_prepared(200, true);

        // The read-only server was committed right away.
        assert!(env.events().contains(&Event::Commit { server_id: 3 }));
        assert_eq!(env.manager.entry_count(), 2);
        assert_eq!(env.manager.distributed_xmin(), Some(200));

        assert_eq!(env.manager.resolve_all_dangling(DB).unwrap(), 0);
        assert_eq!(env.manager.entry_count(), 2);

        // COMMIT PREPARED from another session.
        env.oracle.set_prepared(200, false);
        env.oracle.set_status(200, LocalXactStatus::Committed);
        let mut other = env.manager.session(DB);
        let outcome = std::thread::scope(|s| {
            let handle = s.spawn(|| other.wait_for_resolution(200, true));
            wait_until(|| env.manager.active_waiters() == 1);
            assert!(env.manager.resolve_one(DB, true).unwrap());
            handle.join().unwrap().unwrap()
        });
        assert_eq!(outcome, WaitOutcome::Resolved);
        assert_eq!(env.manager.entry_count(), 0);
        let mut resolved = resolved_servers(&env);
        resolved.sort();
        assert_eq!(resolved, vec![(1, true), (2, true)]);
    }
}

mod concurrency_tests {
    use super::*;

    #[test]
    fn test_failed_resolution_moves_waiter_to_retry_queue() {
        let env = setup(CommitPolicy::Required);
        let mut session = committed_session(&env, 100);
        env.driver.fail_resolve(2, true);
        let waiter = session.waiter();

        let outcome = std::thread::scope(|s| {
            let handle = s.spawn(|| session.wait_for_resolution(100, true));
            wait_until(|| env.manager.active_waiters() == 1);

            let err = env.manager.resolve_one(DB, true).unwrap_err();
            assert!(matches!(
                err,
                FdwXactError::RemoteResolveFailed { server_id: 2, .. }
            ));
            assert_eq!(waiter.state(), WaitState::WaitingRetry);
            assert_eq!(env.manager.active_waiters(), 0);
            assert_eq!(env.manager.retry_waiters(), 1);
            assert!(!env.manager.resolve_one(DB, true).unwrap());

            // Server 1 went through; only server 2 is left.
            let rows = env.manager.list_foreign_xacts();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].server_id, 2);

            env.driver.fail_resolve(2, false);
            assert!(env.manager.resolve_one(DB, false).unwrap());
            handle.join().unwrap().unwrap()
        });

        assert_eq!(outcome, WaitOutcome::Resolved);
        assert_eq!(env.manager.retry_waiters(), 0);
        assert_eq!(env.manager.entry_count(), 0);
        assert_eq!(waiter.state(), WaitState::NotWaiting);
    }

    #[test]
    fn test_waiters_are_served_in_arrival_order() {
        let env = setup(CommitPolicy::Required);
        let mut first = committed_session(&env, 100);
        let mut second = committed_session(&env, 101);
        let second_waiter = second.waiter();

        std::thread::scope(|s| {
            let a = s.spawn(|| first.wait_for_resolution(100, true));
            wait_until(|| env.manager.active_waiters() == 1);
            let b = s.spawn(|| second.wait_for_resolution(101, true));
            wait_until(|| env.manager.active_waiters() == 2);

            assert!(env.manager.resolve_one(DB, true).unwrap());
            assert_eq!(a.join().unwrap().unwrap(), WaitOutcome::Resolved);
            assert_eq!(second_waiter.state(), WaitState::Waiting);
            let rows = env.manager.list_foreign_xacts();
            assert!(rows.iter().all(|r| r.xid == 101));

            assert!(env.manager.resolve_one(DB, true).unwrap());
            assert_eq!(b.join().unwrap().unwrap(), WaitOutcome::Resolved);
        });
        assert_eq!(env.manager.entry_count(), 0);
    }

    #[test]
    fn test_cancelled_wait_leaves_entries_to_resolvers() {
        let env = setup(CommitPolicy::Required);
        let mut session = committed_session(&env, 100);
        let waiter = session.waiter();

        let outcome = std::thread::scope(|s| {
            let handle = s.spawn(|| session.wait_for_resolution(100, true));
            wait_until(|| env.manager.active_waiters() == 1);
            waiter.cancel();
            handle.join().unwrap().unwrap()
        });

        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert_eq!(env.manager.active_waiters(), 0);
        assert_eq!(env.manager.distributed_xmin(), Some(100));
        let rows = env.manager.list_foreign_xacts();
        assert_eq!(rows.len(), 2);
        assert!(rows
            .iter()
            .all(|r| r.status == FdwXactStatus::CommittingPrepared));

        assert_eq!(env.manager.resolve_all_dangling(DB).unwrap(), 2);
        let mut resolved = resolved_servers(&env);
        resolved.sort();
        assert_eq!(resolved, vec![(1, true), (2, true)]);
    }

    #[test]
    fn test_cancel_outside_a_wait_is_dropped() {
        let env = setup(CommitPolicy::Required);
        let mut session = session_with_writes(&env, 100, &[1, 2]);
        let waiter = session.waiter();
        waiter.cancel();
        session.pre_commit().unwrap();
        env.oracle.set_status(100, LocalXactStatus::Committed);
        session.finish(true);

        let outcome = std::thread::scope(|s| {
            let handle = s.spawn(|| session.wait_for_resolution(100, true));
            wait_until(|| env.manager.active_waiters() == 1);
            assert_eq!(waiter.state(), WaitState::Waiting);
            assert_eq!(env.manager.entry_count(), 2);
            assert!(env.manager.resolve_one(DB, true).unwrap());
            handle.join().unwrap().unwrap()
        });

        assert_eq!(outcome, WaitOutcome::Resolved);
        assert_eq!(env.manager.entry_count(), 0);
        assert_eq!(waiter.state(), WaitState::NotWaiting);
    }

    #[test]
    fn test_resolver_only_takes_entries_the_waiter_holds() {
        let env = setup(CommitPolicy::Required);
        orphan_prepared(&env, 100, &[1]);
        let mut session = env.manager.session(DB);

        std::thread::scope(|s| {
            let handle = s.spawn(|| session.wait_for_resolution(100, true));
            wait_until(|| env.manager.active_waiters() == 1);
            // Same xid, but nobody holds this one.
            orphan_prepared(&env, 100, &[2]);
            env.clear_events();

            assert!(env.manager.resolve_one(DB, true).unwrap());
            assert_eq!(handle.join().unwrap().unwrap(), WaitOutcome::Resolved);
        });

        assert_eq!(resolved_servers(&env), vec![(1, true)]);
        let rows = env.manager.list_foreign_xacts();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].server_id, 2);

        env.clear_events();
        assert_eq!(env.manager.resolve_all_dangling(DB).unwrap(), 1);
        assert_eq!(resolved_servers(&env), vec![(2, false)]);
    }

    #[test]
    fn test_failed_resolution_hands_entries_back_to_waiter() {
        let env = setup(CommitPolicy::Required);
        let mut session = committed_session(&env, 100);
        let waiter = session.waiter();
        let backend_id = waiter.backend_id();
        env.driver.fail_resolve(1, true);

        let outcome = std::thread::scope(|s| {
            let handle = s.spawn(|| session.wait_for_resolution(100, true));
            wait_until(|| env.manager.active_waiters() == 1);
            assert!(env.manager.resolve_one(DB, true).is_err());

            let admin = env.manager.session(DB);
            for server_id in [1, 2] {
                let err = admin
                    .resolve_foreign_xact(100, server_id, USER, true)
                    .unwrap_err();
                assert!(matches!(
                    err,
                    FdwXactError::EntryBusy { backend, .. } if backend == backend_id
                ));
            }
            waiter.cancel();
            handle.join().unwrap().unwrap()
        });

        assert_eq!(outcome, WaitOutcome::Cancelled);
        env.driver.fail_resolve(1, false);
        assert_eq!(env.manager.resolve_all_dangling(DB).unwrap(), 2);
        assert_eq!(env.manager.entry_count(), 0);
    }

    #[test]
    fn test_pending_shutdown_ends_next_wait() {
        let env = setup(CommitPolicy::Required);
        let mut session = committed_session(&env, 100);
        let waiter = session.waiter();
        waiter.shutdown();

        assert_eq!(
            session.wait_for_resolution(100, true).unwrap(),
            WaitOutcome::Shutdown
        );
        assert_eq!(env.manager.entry_count(), 2);
        assert_eq!(env.manager.resolve_all_dangling(DB).unwrap(), 2);
    }

    #[test]
    fn test_supervisor_death_ends_wait() {
        let env = setup(CommitPolicy::Required);
        let mut session = committed_session(&env, 100);
        let waiter = session.waiter();

        let outcome = std::thread::scope(|s| {
            let handle = s.spawn(|| session.wait_for_resolution(100, true));
            wait_until(|| env.manager.active_waiters() == 1);
            waiter.supervisor_died();
            handle.join().unwrap().unwrap()
        });

        assert_eq!(outcome, WaitOutcome::Shutdown);
        assert_eq!(waiter.state(), WaitState::NotWaiting);
        assert_eq!(env.manager.entry_count(), 2);
        assert_eq!(env.manager.resolve_all_dangling(DB).unwrap(), 2);
        assert!(resolved_servers(&env).iter().all(|(_, commit)| *commit));
    }

    #[test]
    fn test_background_resolver_completes_wait() {
        let env = setup_with(|config| {
            config.commit_policy = CommitPolicy::Required;
            config.autostart_resolvers = true;
        });
        let mut session = committed_session(&env, 100);

        let outcome = session.wait_for_resolution(100, true).unwrap();

        assert_eq!(outcome, WaitOutcome::Resolved);
        assert_eq!(env.manager.entry_count(), 0);
        assert!(env.manager.resolver_wakeups() >= 1);
        // An idle resolver retires after the timeout.
        wait_until(|| env.manager.running_resolvers() == 0);
    }

    #[test]
    fn test_background_resolver_retries_failed_resolution() {
        let env = setup_with(|config| {
            config.commit_policy = CommitPolicy::Required;
            config.autostart_resolvers = true;
        });
        let mut session = committed_session(&env, 100);
        env.driver.fail_resolve(1, true);
        let waiter = session.waiter();

        let outcome = std::thread::scope(|s| {
            let handle = s.spawn(|| session.wait_for_resolution(100, true));
            wait_until(|| waiter.state() == WaitState::WaitingRetry);
            assert_eq!(env.manager.running_resolvers(), 1);
            env.driver.fail_resolve(1, false);
            handle.join().unwrap().unwrap()
        });

        assert_eq!(outcome, WaitOutcome::Resolved);
        assert_eq!(env.manager.entry_count(), 0);
    }

    #[test]
    fn test_background_resolver_sweeps_dangling_entries() {
        let env = setup_with(|config| {
            config.commit_policy = CommitPolicy::Required;
            config.autostart_resolvers = true;
            config.resolution_retry_interval = Duration::from_millis(10);
        });
        orphan_prepared(&env, 100, &[1, 2]);

        wait_until(|| env.manager.entry_count() == 0);
        assert_eq!(env.manager.distributed_xmin(), None);
        let mut resolved = resolved_servers(&env);
        resolved.sort();
        assert_eq!(resolved, vec![(1, false), (2, false)]);
    }

    #[test]
    fn test_resolver_slots_are_limited() {
        let env = setup_with(|config| {
            config.commit_policy = CommitPolicy::Required;
            config.autostart_resolvers = true;
            config.max_foreign_xact_resolvers = 1;
            config.resolver_timeout = Duration::from_secs(30);
        });
        orphan_prepared(&env, 100, &[1]);
        wait_until(|| env.manager.running_resolvers() == 1);

        // A second database finds no free slot.
        let mut session = env.manager.session(DB + 1);
        session.begin(500);
        session.register_participant(1, USER, true).unwrap();
        session.register_participant(2, USER, true).unwrap();
        session.pre_commit().unwrap();
        session.finish(false);

        assert_eq!(env.manager.running_resolvers(), 1);
        let rows = env.manager.list_foreign_xacts();
        assert!(rows.iter().any(|r| r.database_id == DB + 1));
    }
}
