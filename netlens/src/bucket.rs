//! Per-window metric buckets.
//!
//! A bucket is the aggregate state for a single time window. Handlers define
//! the domain-specific primitive set; the pipeline contributes the event
//! data common to every bucket: the event/deep-sample counts, the events-per-
//! second rate, the window timestamps, and the read-only flag set at
//! rotation.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use crate::labels::LabelMap;
use crate::metrics::{Counter, MetricId, Rate};

fn events_total(schema: &'static str) -> MetricId {
    MetricId::new(schema, &["events", "total"], "Total events processed in this window")
}

fn events_deep(schema: &'static str) -> MetricId {
    MetricId::new(
        schema,
        &["events", "deep_samples"],
        "Events selected for deep sampling in this window",
    )
}

fn events_rate(schema: &'static str) -> MetricId {
    MetricId::new(schema, &["events", "rate"], "Events per second in this window")
}

/// The event counters every bucket carries.
///
/// The pair is always read together under the bucket's shared lock so
/// snapshots never observe `num_samples > num_events`.
#[derive(Clone)]
pub struct EventCounts {
    /// All events routed to this bucket.
    pub num_events: Counter,
    /// The subset that passed the deep-sample gate.
    pub num_samples: Counter,
}

struct Window {
    start: SystemTime,
    end: Option<SystemTime>,
}

/// Event data common to every metrics bucket.
pub struct EventData {
    counts: RwLock<EventCounts>,
    rate_events: Rate,
    window: RwLock<Window>,
    read_only: AtomicBool,
}

impl EventData {
    /// Creates event data for a freshly opened window starting now.
    /// `schema` prefixes the Prometheus names of the event metrics.
    pub fn new(schema: &'static str) -> EventData {
        EventData {
            counts: RwLock::new(EventCounts {
                num_events: Counter::new(events_total(schema)),
                num_samples: Counter::new(events_deep(schema)),
            }),
            rate_events: Rate::new(events_rate(schema)),
            window: RwLock::new(Window { start: SystemTime::now(), end: None }),
            read_only: AtomicBool::new(false),
        }
    }

    /// Records one routed event; `deep` marks it as a deep sample.
    pub fn new_event(&self, deep: bool) {
        {
            let mut counts = self.counts.write();
            counts.num_events.inc();
            if deep {
                counts.num_samples.inc();
            }
        }
        self.rate_events.add(1);
    }

    /// A consistent snapshot of the event counters.
    pub fn counts(&self) -> EventCounts {
        self.counts.read().clone()
    }

    /// The events-per-second rate.
    pub fn rate_events(&self) -> &Rate {
        &self.rate_events
    }

    /// The window delimiters; `end` is open while the bucket is live.
    pub fn window(&self) -> (SystemTime, Option<SystemTime>) {
        let window = self.window.read();
        (window.start, window.end)
    }

    /// Whether this bucket has been frozen by rotation.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Freezes this bucket, closing its window at `end`. Idempotent: only
    /// the first call records the end timestamp.
    pub fn mark_read_only(&self, end: SystemTime) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            self.window.write().end = Some(end);
            self.rate_events.freeze();
        }
    }

    /// Folds another bucket's event data into this one. The window expands
    /// to cover both spans.
    pub fn merge(&self, other: &EventData) {
        {
            let mut counts = self.counts.write();
            let theirs = other.counts();
            counts.num_events.merge(&theirs.num_events);
            counts.num_samples.merge(&theirs.num_samples);
        }
        if let Err(err) = self.rate_events.merge(&other.rate_events) {
            warn!(error = %err, "skipping event rate merge");
        }

        let (their_start, their_end) = other.window();
        let mut window = self.window.write();
        if their_start < window.start {
            window.start = their_start;
        }
        match (window.end, their_end) {
            (Some(mine), Some(theirs)) if theirs > mine => window.end = Some(theirs),
            (None, Some(theirs)) => window.end = Some(theirs),
            _ => {}
        }
    }

    /// Writes the `period` and `events` sections.
    pub fn to_json(&self, j: &mut Value, include_live_rate: bool) {
        let (start, end) = self.window();
        let start_secs = start.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs();
        let length = end
            .unwrap_or_else(SystemTime::now)
            .duration_since(start)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        j["period"] = json!({ "start_ts": start_secs, "length": length });

        let counts = self.counts();
        counts.num_events.to_json(j);
        counts.num_samples.to_json(j);
        self.rate_events.to_json(j, include_live_rate);
    }
}

/// The per-window aggregate a handler maintains.
///
/// Implementations hold their primitives behind group locks so `&self`
/// ingest is safe under concurrent callers; the pipeline-owned event data is
/// internally synchronized the same way. Merging is only performed into a
/// caller-owned synthetic target.
pub trait MetricsBucket: Send + Sync + 'static {
    /// Per-bucket construction parameters (e.g. `topn`), cloned into every
    /// window the manager opens.
    type Config: Clone + Send + Sync + 'static;

    /// Opens an empty bucket for a new window.
    fn new(config: &Self::Config) -> Self;

    /// The event data common to every bucket.
    fn event_data(&self) -> &EventData;

    /// Merges the domain primitives of `other` into this bucket, matched by
    /// identity.
    fn merge_metrics(&mut self, other: &Self);

    /// Renders the domain primitives into a JSON tree.
    fn metrics_json(&self, j: &mut Value);

    /// Renders the domain primitives as Prometheus text.
    fn metrics_prometheus(&self, out: &mut String, extra: &LabelMap);

    /// Merges all of `other` (event data plus domain primitives) into this
    /// bucket.
    fn merge(&mut self, other: &Self) {
        self.event_data().merge(other.event_data());
        self.merge_metrics(other);
    }

    /// Renders the full bucket as JSON.
    fn to_json(&self) -> Value {
        let mut j = json!({});
        let live = !self.event_data().is_read_only();
        self.event_data().to_json(&mut j, live);
        self.metrics_json(&mut j);
        j
    }

    /// Renders the full bucket as Prometheus text.
    fn to_prometheus(&self, out: &mut String, extra: &LabelMap) {
        let counts = self.event_data().counts();
        counts.num_events.to_prometheus(out, extra);
        counts.num_samples.to_prometheus(out, extra);
        self.event_data().rate_events.to_prometheus(out, extra);
        self.metrics_prometheus(out, extra);
    }

    /// Freezes this bucket; rotation calls this exactly once per window.
    fn mark_read_only(&self, end: SystemTime) {
        self.event_data().mark_read_only(end);
    }
}
