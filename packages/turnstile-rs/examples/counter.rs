//! Counter demo
//!
//! Runs a small counter store through plain actions, a thunk, bound creators
//! and a lazily registered feature module, logging every step.
//!
//! ```text
//! RUST_LOG=debug TURNSTILE_STRATEGY=exclusive cargo run --example counter
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turnstile::{
    async_trait, bind_action_creators, create_action, create_action_with, create_thunk, Action,
    Bindable, FeatureModule, LoggingMiddleware, PerformanceMonitor, Store, StoreBuilder,
    StoreConfig, StoreProvider, ThunkContext,
};

#[derive(Debug, Clone, Default)]
struct Counter {
    value: i64,
    history: Vec<String>,
}

fn reducer(state: &Counter, action: &Action) -> Counter {
    let value = match action.action_type() {
        "INC" => state.value + 1,
        "ADD" => state.value + action.payload_as::<i64>().unwrap_or(0),
        "RESET" => 0,
        _ => return state.clone(),
    };

    let mut history = state.history.clone();
    history.push(action.action_type().to_string());
    Counter { value, history }
}

/// Seeds the counter once the store exists.
struct Seed;

#[async_trait]
impl FeatureModule<Counter, ()> for Seed {
    fn name(&self) -> &str {
        "seed"
    }

    async fn load(&self, store: &Store<Counter, ()>) -> Result<()> {
        store
            .dispatch(Action::new("ADD").with_payload(serde_json::json!(100)))
            .await
            .outcome()
            .await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,turnstile=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let config = StoreConfig::from_env().context("Failed to load store configuration")?;
    tracing::info!(strategy = %config.strategy, "Starting counter demo");

    let monitor = PerformanceMonitor::new().with_slow_threshold(Duration::from_millis(50));
    let provider = StoreProvider::new({
        let monitor = monitor.clone();
        move || {
            StoreBuilder::new(Counter::default(), reducer)
                .with_config(config.clone())
                .with_middleware(LoggingMiddleware)
                .with_middleware(monitor.clone())
                .build()
        }
    });

    // Registered before the store exists: replayed on first `get`.
    provider.register_feature(Seed).await;
    let store = provider.get().await;

    let inc = create_action("INC");
    let add = create_action_with("ADD", |n: i64| Some(n));
    let add_slowly = create_thunk("ADD_SLOWLY", |n: i64, ctx: ThunkContext<Counter, ()>| async move {
        for _ in 0..n {
            tokio::time::sleep(Duration::from_millis(5)).await;
            ctx.dispatch(Action::new("INC")).await;
        }
        Ok(())
    });

    store.dispatch(inc.action()).await;

    let bound = bind_action_creators(
        Bindable::map([
            ("add", add.into()),
            ("add_slowly", add_slowly.into()),
        ]),
        store.clone(),
    );
    bound.call("add", 10).await?;
    bound.call("add_slowly", 3).await?;

    store.wait_until_idle().await?;

    let state = store.state();
    tracing::info!(value = state.value, history = ?state.history, "Counter settled");
    for (action_type, stats) in monitor.snapshot() {
        tracing::info!(
            action_type = %action_type,
            count = stats.count,
            mean_us = stats.mean().as_micros() as u64,
            "Action timing"
        );
    }

    Ok(())
}
