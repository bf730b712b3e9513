// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

//! Process-wide counter registry.
//!
//! Counters are the only global mutable state in the whole agent. They are
//! plain atomics behind a lazily-populated registry; a background task
//! logs a snapshot of every counter on a fixed interval so long-running
//! captures leave an audit trail of drops and parse failures.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::Duration,
};

use lazy_static::lazy_static;

lazy_static! {
    static ref REGISTRY: RwLock<BTreeMap<&'static str, &'static AtomicU64>> =
        RwLock::new(BTreeMap::new());
}

/// Get or register the counter with the given name.
pub fn counter(name: &'static str) -> &'static AtomicU64 {
    if let Some(counter) = REGISTRY.read().ok().and_then(|r| r.get(name).copied()) {
        return counter;
    }
    match REGISTRY.write() {
        Ok(mut registry) => registry
            .entry(name)
            .or_insert_with(|| Box::leak(Box::new(AtomicU64::new(0)))),
        // A poisoned registry means a panic elsewhere; keep counting into
        // a detached atomic rather than propagating it.
        Err(_) => Box::leak(Box::new(AtomicU64::new(0))),
    }
}

pub fn inc(name: &'static str) {
    counter(name).fetch_add(1, Ordering::Relaxed);
}

pub fn add(name: &'static str, value: u64) {
    counter(name).fetch_add(value, Ordering::Relaxed);
}

pub fn snapshot() -> BTreeMap<&'static str, u64> {
    match REGISTRY.read() {
        Ok(registry) => registry
            .iter()
            .map(|(&name, counter)| (name, counter.load(Ordering::Relaxed)))
            .collect(),
        Err(_) => BTreeMap::new(),
    }
}

/// Spawn the periodic status reporter.
pub fn spawn_status_reporter(interval_sec: u64) {
    let period = Duration::from_secs(interval_sec.max(1));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        // the first tick fires immediately, skip it
        tick.tick().await;
        loop {
            tick.tick().await;
            let stats = snapshot();
            match serde_json::to_string(&stats) {
                Ok(stats) => tracing::info!(
                    stats = tracing::field::display(&stats),
                    "tcpagent statistics",
                ),
                Err(_) => tracing::info!(?stats, "tcpagent statistics"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    #[test]
    fn counters_accumulate_and_snapshot() {
        super::inc("test.metrics.counter_a");
        super::add("test.metrics.counter_a", 2);
        super::inc("test.metrics.counter_b");
        let snapshot = super::snapshot();
        assert!(snapshot["test.metrics.counter_a"] >= 3);
        assert!(snapshot["test.metrics.counter_b"] >= 1);
    }

    #[test]
    fn same_name_resolves_to_same_counter() {
        let a = super::counter("test.metrics.same") as *const _;
        super::counter("test.metrics.same").fetch_add(1, Ordering::Relaxed);
        let b = super::counter("test.metrics.same") as *const _;
        assert_eq!(a, b);
    }
}
