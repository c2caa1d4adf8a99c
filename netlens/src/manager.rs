//! The metrics manager: a ring of window buckets with rotation, deep-sample
//! gating, and snapshot read paths.
//!
//! The ring is the only manager-level shared structure. It is read-mostly:
//! ingest and readers take the read lock, and only rotation (and the final
//! drain in `stop`) takes the write lock, briefly. Primitive state is never
//! touched while the ring lock is held for writing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use parking_lot::{Condvar, Mutex, RwLock};
use quanta::Clock;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::bucket::MetricsBucket;
use crate::common::{Error, State};
use crate::config::WindowConfig;
use crate::labels::LabelMap;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

struct ManagerCore<B: MetricsBucket> {
    ring: RwLock<VecDeque<Arc<B>>>,
    bucket_config: B::Config,
    config: WindowConfig,
    state: AtomicU8,
    shutdown: Mutex<bool>,
    wakeup: Condvar,
    clock: Clock,
}

impl<B: MetricsBucket> ManagerCore<B> {
    fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            CREATED => State::Created,
            RUNNING => State::Running,
            _ => State::Stopped,
        }
    }

    /// Closes the live window and opens a new one. Bucket construction
    /// happens outside the write lock; the critical section is the head
    /// swap and ring truncation only.
    fn rotate(&self) {
        if self.state() != State::Running {
            return;
        }

        let fresh = Arc::new(B::new(&self.bucket_config));
        let now = SystemTime::now();
        let mut dropped = false;
        {
            let mut ring = self.ring.write();
            if let Some(live) = ring.front() {
                live.mark_read_only(now);
            }
            ring.push_front(fresh);
            while ring.len() > self.config.num_periods as usize + 1 {
                ring.pop_back();
                dropped = true;
            }
        }
        debug!(dropped_oldest = dropped, "rotated window");
    }
}

/// The ring of window buckets behind every handler.
///
/// `B` is the handler's bucket type; the manager routes events into the
/// live bucket without knowing its primitive set.
pub struct MetricsManager<B: MetricsBucket> {
    core: Arc<ManagerCore<B>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<B: MetricsBucket> MetricsManager<B> {
    /// Creates a manager with one idle live bucket.
    ///
    /// Fails if `config` does not validate. The manager does not accept
    /// ingest until [`start`](Self::start).
    pub fn new(config: WindowConfig, bucket_config: B::Config) -> Result<MetricsManager<B>, Error> {
        config.validate()?;

        let mut ring = VecDeque::with_capacity(config.num_periods as usize + 1);
        ring.push_front(Arc::new(B::new(&bucket_config)));

        Ok(MetricsManager {
            core: Arc::new(ManagerCore {
                ring: RwLock::new(ring),
                bucket_config,
                config,
                state: AtomicU8::new(CREATED),
                shutdown: Mutex::new(false),
                wakeup: Condvar::new(),
                clock: Clock::new(),
            }),
            timer: Mutex::new(None),
        })
    }

    /// Transitions to `Running` and arms the rotation timer.
    ///
    /// Fails outside `Created`; in particular, a stopped manager cannot be
    /// restarted.
    pub fn start(&self) -> Result<(), Error> {
        self.transition(CREATED, RUNNING, "start")?;

        let core = Arc::clone(&self.core);
        let window = self.core.config.window_duration();
        let handle = thread::Builder::new()
            .name("netlens-rotation".to_string())
            .spawn(move || {
                let mut deadline = core.clock.now() + window;
                loop {
                    {
                        let mut stopped = core.shutdown.lock();
                        loop {
                            if *stopped {
                                return;
                            }
                            let now = core.clock.now();
                            if now >= deadline {
                                break;
                            }
                            core.wakeup.wait_for(&mut stopped, deadline - now);
                        }
                    }
                    core.rotate();
                    deadline += window;
                }
            })
            .expect("spawning the rotation timer thread failed");
        *self.timer.lock() = Some(handle);

        info!(
            periods = self.core.config.num_periods,
            window_secs = self.core.config.window_secs,
            "metrics manager started"
        );
        Ok(())
    }

    /// Stops the rotation timer, drains in-flight ingest, and freezes the
    /// live bucket. Ingest after `stop` fails with a lifecycle error.
    pub fn stop(&self) -> Result<(), Error> {
        self.transition(RUNNING, STOPPED, "stop")?;

        *self.core.shutdown.lock() = true;
        self.core.wakeup.notify_all();
        if let Some(handle) = self.timer.lock().take() {
            let _ = handle.join();
        }

        // Ingest holds the ring read lock for the duration of a bucket
        // update, so taking the write lock here waits out every in-flight
        // event before the freeze.
        {
            let ring = self.core.ring.write();
            if let Some(live) = ring.front() {
                live.mark_read_only(SystemTime::now());
            }
        }

        info!("metrics manager stopped");
        Ok(())
    }

    /// Routes one event into the live bucket.
    ///
    /// The manager decides the deep-sample gate and updates the common event
    /// data; `f` applies the handler-specific update with the decision.
    pub fn process_event<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&B, bool),
    {
        if self.core.state() != State::Running {
            return Err(Error::Lifecycle { op: "process_event", state: self.core.state() });
        }

        let deep = self.deep_decision();
        let ring = self.core.ring.read();
        if let Some(live) = ring.front() {
            live.event_data().new_event(deep);
            f(live, deep);
        }
        Ok(())
    }

    /// Applies `f` to the live bucket without counting an event. Used for
    /// out-of-band updates such as device statistics.
    pub fn with_live_bucket<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&B),
    {
        if self.core.state() != State::Running {
            return Err(Error::Lifecycle { op: "with_live_bucket", state: self.core.state() });
        }

        let ring = self.core.ring.read();
        if let Some(live) = ring.front() {
            f(live);
        }
        Ok(())
    }

    /// Closes the live window and opens a new one.
    ///
    /// Normally driven by the rotation timer at each window boundary; public
    /// so replays and tests can rotate deterministically. A no-op outside
    /// `Running`.
    pub fn rotate(&self) {
        self.core.rotate();
    }

    /// A handle to the `i`-th bucket, `0` being the live one. `None` when
    /// `i` is beyond the retained windows; readers render that as an empty
    /// object rather than an error.
    pub fn bucket(&self, i: usize) -> Option<Arc<B>> {
        self.core.ring.read().get(i).cloned()
    }

    /// A synthetic frozen bucket merging the `k` most recent windows (the
    /// live one plus up to `k - 1` finalized ones). The result never aliases
    /// a ring bucket and is meant to be rendered and discarded.
    pub fn window_merged(&self, k: usize) -> B {
        let mut merged = B::new(&self.core.bucket_config);
        {
            let ring = self.core.ring.read();
            for bucket in ring.iter().take(k.max(1)) {
                merged.merge(bucket);
            }
        }
        merged.mark_read_only(SystemTime::now());
        merged
    }

    /// Renders one window as JSON under `schema`.
    ///
    /// With `merged`, the `period` most recent windows are merged first;
    /// otherwise `period` indexes the ring directly and an out-of-range
    /// index yields an empty object.
    pub fn window_json(&self, schema: &str, period: usize, merged: bool) -> Value {
        let mut j = json!({});
        if merged {
            j[schema] = self.window_merged(period).to_json();
        } else if let Some(bucket) = self.bucket(period) {
            j[schema] = bucket.to_json();
        }
        j
    }

    /// Renders the most recent finalized window as Prometheus text, falling
    /// back to the live window before the first rotation.
    pub fn window_prometheus(&self, out: &mut String, extra: &LabelMap) {
        if let Some(bucket) = self.bucket(1).or_else(|| self.bucket(0)) {
            bucket.to_prometheus(out, extra);
        }
    }

    /// The manager's lifecycle state.
    pub fn state(&self) -> State {
        self.core.state()
    }

    /// Number of buckets currently retained (live plus finalized).
    pub fn num_buckets(&self) -> usize {
        self.core.ring.read().len()
    }

    /// The configured number of finalized windows.
    pub fn periods(&self) -> u64 {
        self.core.config.num_periods
    }

    fn deep_decision(&self) -> bool {
        let rate = self.core.config.deep_sample_rate;
        rate >= 100 || rand::rng().random_range(0..100u64) < rate
    }

    fn transition(&self, from: u8, to: u8, op: &'static str) -> Result<(), Error> {
        self.core
            .state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::Lifecycle { op, state: self.core.state() })
    }
}

impl<B: MetricsBucket> Drop for MetricsManager<B> {
    fn drop(&mut self) {
        if self.core.state() == State::Running {
            let _ = self.stop();
        }
    }
}
