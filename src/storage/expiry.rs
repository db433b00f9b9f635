//! Active expiry: the background cycle that reclaims volatile keys
//! nobody reads anymore.
//!
//! Lazy expiry only fires on access, so an abandoned key with a TTL
//! would hold memory forever. Instead of scanning the whole keyspace
//! on a timer, each cycle samples a bounded number of volatile
//! entries, deletes the dead ones, and repeats within the same tick
//! while at least a quarter of the sample was dead. That caps the
//! cost of a tick on a mostly-healthy keyspace while still draining a
//! mass expiry (thousands of keys dying at once) in a handful of
//! ticks.
//!
//! The task holds only a weak handle to the engine and exits when the
//! engine is dropped; the [`ExpirySweeper`] handle aborts it early.

use crate::storage::StorageEngine;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// Tuning for the sampling cycle.
#[derive(Debug, Clone)]
pub struct ExpiryCycle {
    /// Cadence of the cycle.
    pub tick: Duration,
    /// Volatile entries examined per round.
    pub sample_size: usize,
    /// Fraction of a sample that must be dead for another round to
    /// run within the same tick.
    pub repeat_threshold: f64,
    /// Hard cap on rounds per tick.
    pub max_rounds: usize,
}

impl Default for ExpiryCycle {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            sample_size: 20,
            repeat_threshold: 0.25,
            max_rounds: 16,
        }
    }
}

/// Handle to the running sweeper task. Dropping it aborts the task;
/// the task also exits on its own once the engine is gone.
#[derive(Debug)]
pub struct ExpirySweeper {
    task: JoinHandle<()>,
}

impl ExpirySweeper {
    /// Starts the expiry cycle as a background task.
    pub fn start(engine: Arc<StorageEngine>, cycle: ExpiryCycle) -> Self {
        let engine = Arc::downgrade(&engine);
        let task = tokio::spawn(run_cycle(engine, cycle));
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_cycle(engine: Weak<StorageEngine>, cycle: ExpiryCycle) {
    let mut tick = tokio::time::interval(cycle.tick);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tick.tick().await;
        let engine = match engine.upgrade() {
            Some(engine) => engine,
            None => return, // server state is gone
        };

        let mut removed_this_tick = 0;
        for _ in 0..cycle.max_rounds {
            let outcome = engine.sweep_expired_sample(cycle.sample_size);
            removed_this_tick += outcome.removed;
            if outcome.sampled == 0 {
                break;
            }
            let dead_fraction = outcome.removed as f64 / outcome.sampled as f64;
            if dead_fraction < cycle.repeat_threshold {
                break;
            }
        }

        if removed_this_tick > 0 {
            trace!(removed = removed_this_tick, "expiry cycle reclaimed keys");
        }
    }
}

/// Starts the sweeper with default tuning.
pub fn start_expiry_sweeper(engine: Arc<StorageEngine>) -> ExpirySweeper {
    ExpirySweeper::start(engine, ExpiryCycle::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::engine::{now_ms, SetOptions};
    use bytes::Bytes;

    fn volatile(engine: &StorageEngine, key: &str, expires_at: u64) {
        engine.set(
            Bytes::from(key.to_string()),
            Bytes::from("v"),
            SetOptions {
                expires_at: Some(expires_at),
                ..Default::default()
            },
        );
    }

    #[tokio::test]
    async fn cycle_reclaims_untouched_expired_keys() {
        let engine = Arc::new(StorageEngine::new());
        let soon = now_ms() + 30;
        for i in 0..10 {
            volatile(&engine, &format!("key{}", i), soon);
        }
        engine.set(Bytes::from("keep"), Bytes::from("v"), SetOptions::default());

        let _sweeper = ExpirySweeper::start(
            Arc::clone(&engine),
            ExpiryCycle {
                tick: Duration::from_millis(10),
                ..Default::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.dbsize(), 1);
    }

    #[tokio::test]
    async fn mass_expiry_drains_within_one_tick() {
        let engine = Arc::new(StorageEngine::new());
        let past = now_ms().saturating_sub(5);
        // Far more dead keys than one sample: the repeat rule has to
        // keep the cycle going inside a single tick.
        for i in 0..200 {
            volatile(&engine, &format!("burst{}", i), past);
        }

        let _sweeper = ExpirySweeper::start(
            Arc::clone(&engine),
            ExpiryCycle {
                tick: Duration::from_millis(10),
                sample_size: 20,
                repeat_threshold: 0.25,
                max_rounds: 32,
            },
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(engine.dbsize(), 0);
    }

    #[tokio::test]
    async fn stopped_sweeper_ends_the_task() {
        let engine = Arc::new(StorageEngine::new());
        let sweeper = ExpirySweeper::start(
            Arc::clone(&engine),
            ExpiryCycle {
                tick: Duration::from_millis(10),
                ..Default::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        sweeper.stop();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sweeper.task.is_finished());

        // Lazy expiry still covers reads once the task is gone.
        volatile(&engine, "k", now_ms() + 10);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.get(b"k").unwrap(), None);
    }
}
