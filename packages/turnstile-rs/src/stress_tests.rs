//! Stress tests for the dispatch pipeline.
//!
//! These exercise interleavings: jittered thunks, racing settlements, many
//! idle waiters, and admission under both strategies.

#[cfg(test)]
mod stress_tests {
    use crate::action::{Action, Settlement};
    use crate::config::Strategy;
    use crate::ledger::{ChainId, ExecutionStack, Operation};
    use crate::middleware::{Middleware, MiddlewareContext, Next};
    use crate::store::{Store, StoreBuilder};
    use crate::thunk::{Thunk, ThunkContext};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;

    // ==========================================================================
    // Helpers
    // ==========================================================================

    fn adder(state: &i64, action: &Action) -> i64 {
        match action.action_type() {
            "ADD" => state + action.payload_as::<i64>().unwrap_or(0),
            _ => *state,
        }
    }

    /// Appends each committed action type, so state is the commit log.
    fn journal(state: &Vec<String>, action: &Action) -> Vec<String> {
        let mut next = state.clone();
        next.push(action.action_type().to_string());
        next
    }

    /// Holds `SLOW` actions back before passing them on.
    struct HoldSlow {
        delay: Duration,
    }

    #[async_trait]
    impl Middleware<Vec<String>, ()> for HoldSlow {
        async fn handle(
            &self,
            _ctx: &MiddlewareContext<Vec<String>, ()>,
            action: Action,
            next: Next<'_, Vec<String>, ()>,
        ) -> Result<Action> {
            if action.action_type() == "SLOW" {
                tokio::time::sleep(self.delay).await;
            }
            next.run(action).await
        }
    }

    /// Random delay before every commit.
    struct Jitter;

    #[async_trait]
    impl Middleware<Vec<String>, ()> for Jitter {
        async fn handle(
            &self,
            _ctx: &MiddlewareContext<Vec<String>, ()>,
            action: Action,
            next: Next<'_, Vec<String>, ()>,
        ) -> Result<Action> {
            jitter().await;
            next.run(action).await
        }
    }

    /// Fails `AUDITED` actions, either before or after the commit step.
    struct FailingAudit {
        after_commit: bool,
    }

    #[async_trait]
    impl Middleware<i64, ()> for FailingAudit {
        async fn handle(
            &self,
            _ctx: &MiddlewareContext<i64, ()>,
            action: Action,
            next: Next<'_, i64, ()>,
        ) -> Result<Action> {
            if action.action_type() != "AUDITED" {
                return next.run(action).await;
            }
            if !self.after_commit {
                anyhow::bail!("audit failed");
            }
            next.run(action).await?;
            anyhow::bail!("audit failed")
        }
    }

    async fn jitter() {
        tokio::time::sleep(Duration::from_millis(fastrand::u64(1..5))).await;
    }

    /// Thunk that tracks how many bodies run at once.
    fn tracked(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>, amount: i64) -> Thunk<i64, ()> {
        Thunk::new("TRACKED", move |ctx: ThunkContext<i64, ()>| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                jitter().await;
                ctx.dispatch(Action::new("ADD").with_payload(serde_json::json!(amount)))
                    .await;

                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    async fn run_tracked(store: &Store<i64>, roots: usize) -> usize {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..roots)
            .map(|i| {
                let store = store.clone();
                let thunk = tracked(active.clone(), peak.clone(), i as i64);
                tokio::spawn(async move { store.dispatch(thunk).await })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().wait_for_completion().await;
        }
        store
            .wait_until_idle_timeout(Duration::from_secs(5))
            .await
            .unwrap();

        peak.load(Ordering::SeqCst)
    }

    // ==========================================================================
    // Admission
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exclusive_never_overlaps_roots() {
        let store = StoreBuilder::new(0i64, adder)
            .with_strategy(Strategy::Exclusive)
            .build();

        let peak = run_tracked(&store, 20).await;

        assert_eq!(peak, 1, "exclusive strategy admitted overlapping roots");
        assert_eq!(store.state(), (0..20).sum::<i64>());
    }

    #[tokio::test]
    async fn test_concurrent_overlaps_roots() {
        let store = StoreBuilder::new(0i64, adder)
            .with_strategy(Strategy::Concurrent)
            .build();

        // Sequential root dispatches: each returns as soon as the body is spawned.
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut tokens = Vec::new();
        for i in 0..10 {
            tokens.push(store.dispatch(tracked(active.clone(), peak.clone(), i)).await);
        }
        for token in tokens {
            token.wait_for_completion().await;
        }

        assert!(peak.load(Ordering::SeqCst) > 1);
        assert_eq!(store.state(), 45);
    }

    // ==========================================================================
    // Commit ordering
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_jittered_chains_lose_no_commits() {
        let store = StoreBuilder::new(0i64, adder).build();

        let handles: Vec<_> = (1..=100)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move {
                    jitter().await;
                    store
                        .dispatch(Action::new("ADD").with_payload(serde_json::json!(n)))
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().settlement().is_resolved());
        }

        assert_eq!(store.state(), 5050);
        assert!(store.is_idle());
    }

    #[tokio::test]
    async fn test_subscriber_sees_monotonic_fold() {
        let store = StoreBuilder::new(0i64, adder).build();
        let mut updates = store.subscribe();

        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while updates.changed().await.is_ok() {
                let value = *updates.borrow_and_update();
                seen.push(value);
                if value == 55 {
                    break;
                }
            }
            seen
        });

        for n in 1..=10 {
            store
                .dispatch(Action::new("ADD").with_payload(serde_json::json!(n)))
                .await;
            tokio::task::yield_now().await;
        }

        let seen = observer.await.unwrap();
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "non-monotonic: {:?}", seen);
        assert_eq!(seen.last(), Some(&55));
    }

    #[tokio::test]
    async fn test_delayed_chain_commits_at_its_commit_point() {
        let store = StoreBuilder::new(Vec::<String>::new(), journal)
            .with_strategy(Strategy::Concurrent)
            .with_middleware(HoldSlow {
                delay: Duration::from_millis(50),
            })
            .build();
        let mut updates = store.subscribe();

        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while updates.changed().await.is_ok() {
                let log = updates.borrow_and_update().clone();
                let done = log.len() == 2;
                seen.push(log);
                if done {
                    break;
                }
            }
            seen
        });

        let slow = tokio::spawn({
            let store = store.clone();
            async move { store.dispatch(Action::new("SLOW")).await }
        });
        while store.is_idle() {
            tokio::task::yield_now().await;
        }
        let fast = store.dispatch(Action::new("FAST")).await;
        let slow = slow.await.unwrap();

        assert!(fast.settlement().is_resolved());
        assert!(slow.settlement().is_resolved());

        // FAST overtook SLOW, so it reached the commit point first.
        assert_eq!(store.state(), vec!["FAST", "SLOW"]);

        // Every published state extends the previous one by one commit.
        let seen = observer.await.unwrap();
        assert_eq!(seen, vec![vec!["FAST"], vec!["FAST", "SLOW"]]);
        assert!(store.is_idle());
    }

    #[tokio::test]
    async fn test_sequential_dispatches_commit_in_arrival_order() {
        let store = StoreBuilder::new(Vec::<String>::new(), journal)
            .with_strategy(Strategy::Concurrent)
            .with_middleware(Jitter)
            .build();

        let expected: Vec<String> = (0..20).map(|i| format!("STEP_{}", i)).collect();
        for action_type in &expected {
            store.dispatch(Action::new(action_type.as_str())).await;
        }

        assert_eq!(store.state(), expected);
    }

    fn audited(state: &i64, action: &Action) -> i64 {
        match action.action_type() {
            "AUDITED" => state + 1,
            _ => adder(state, action),
        }
    }

    #[tokio::test]
    async fn test_failure_before_next_commits_nothing() {
        let store = StoreBuilder::new(0i64, audited)
            .with_middleware(FailingAudit {
                after_commit: false,
            })
            .build();

        let token = store.dispatch(Action::new("AUDITED")).await;

        assert_eq!(
            token.settlement(),
            Settlement::Rejected("audit failed".to_string())
        );
        assert_eq!(store.state(), 0);
        assert!(store.is_idle());

        // Pipeline still usable
        store
            .dispatch(Action::new("ADD").with_payload(serde_json::json!(5)))
            .await;
        assert_eq!(store.state(), 5);
    }

    #[tokio::test]
    async fn test_failure_after_next_keeps_commit_and_rejects_token() {
        let store = StoreBuilder::new(0i64, audited)
            .with_middleware(FailingAudit { after_commit: true })
            .build();

        let token = store.dispatch(Action::new("AUDITED")).await;

        assert_eq!(store.state(), 1);
        assert_eq!(
            token.settlement(),
            Settlement::Rejected("audit failed".to_string())
        );
        assert!(store.is_idle());
    }

    // ==========================================================================
    // Settlement races
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_settlements_have_one_winner() {
        for _ in 0..50 {
            let token = Action::new("RACE");
            let winners = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let token = token.clone();
                    let winners = winners.clone();
                    tokio::spawn(async move {
                        let won = if i % 2 == 0 {
                            token.resolve()
                        } else {
                            token.reject(format!("loser {}", i))
                        };
                        if won {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.await.unwrap();
            }

            assert_eq!(winners.load(Ordering::SeqCst), 1);
            assert_ne!(token.settlement(), Settlement::Pending);
        }
    }

    // ==========================================================================
    // Ledger
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_waiters_released_by_one_transition() {
        let ledger = ExecutionStack::new();
        let ops: Vec<_> = (0..10)
            .map(|_| Operation::effect("work", ChainId::new()))
            .collect();
        for op in &ops {
            ledger.push(op.clone());
        }

        let waiters: Vec<_> = (0..32)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.wait_for_empty().await })
            })
            .collect();

        while ledger.waiter_count() < 32 {
            tokio::task::yield_now().await;
        }

        let removers: Vec<_> = ops
            .into_iter()
            .map(|op| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    jitter().await;
                    ledger.remove(op.id());
                })
            })
            .collect();
        for remover in removers {
            remover.await.unwrap();
        }

        for waiter in waiters {
            let snapshot = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter hung")
                .unwrap();
            assert!(snapshot.is_empty());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_nested_thunks_drain_ledger() {
        let store = StoreBuilder::new(0i64, adder).build();
        let runs = Arc::new(AtomicUsize::new(0));

        let outer = Thunk::new("OUTER", {
            let runs = runs.clone();
            move |ctx: ThunkContext<i64, ()>| {
                let runs = runs.clone();
                async move {
                    for _ in 0..5 {
                        let runs = runs.clone();
                        let inner = Thunk::new("INNER", move |ctx: ThunkContext<i64, ()>| {
                            let runs = runs.clone();
                            async move {
                                jitter().await;
                                runs.fetch_add(1, Ordering::SeqCst);
                                ctx.dispatch(Action::new("ADD").with_payload(serde_json::json!(1)))
                                    .await;
                                Ok(())
                            }
                        });
                        ctx.dispatch(inner).await;
                    }
                    Ok(())
                }
            }
        });

        store.dispatch(outer).await;
        store
            .wait_until_idle_timeout(Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 5);
        assert_eq!(store.state(), 5);
    }
}
