//! Metric primitives.
//!
//! Every primitive pairs immutable identity (schema key, dotted name path,
//! help text) with mergeable state, and knows how to emit itself as nested
//! JSON and as Prometheus text. Identity and label rendering are orthogonal
//! to state: merging never touches identity, and the same primitive can be
//! rendered with different handler labels.
//!
//! Counters, summaries, cardinality sketches, heavy hitters, and histograms
//! rely on their bucket's group lock for ingest synchronization. [`Rate`] is
//! the exception: it is internally synchronized so its per-second accumulator
//! can roll into the quantile summary independently of the bucket lock.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use quanta::{Clock, Instant};
use serde_json::{json, Value};

use netlens_util::{
    pipeline_quantiles, Histogram as HistogramSketch, HyperLogLog, SketchError, Summary, TopK,
};

use crate::formatting::{write_help_line, write_metric_line, write_type_line};
use crate::labels::{static_labels, LabelMap};

/// Immutable identity of a metric primitive.
///
/// `schema` is the handler's schema key (the Prometheus name prefix);
/// `path` is the dotted name as JSON nesting segments; `desc` is the
/// Prometheus help text.
#[derive(Debug, Clone, Copy)]
pub struct MetricId {
    schema: &'static str,
    path: &'static [&'static str],
    desc: &'static str,
}

impl MetricId {
    /// Creates a metric identity.
    pub const fn new(
        schema: &'static str,
        path: &'static [&'static str],
        desc: &'static str,
    ) -> MetricId {
        MetricId { schema, path, desc }
    }

    /// The flat Prometheus name: `schema` plus the path segments joined with
    /// underscores.
    pub fn flat_name(&self) -> String {
        let mut name = String::from(self.schema);
        for part in self.path {
            name.push('_');
            name.push_str(part);
        }
        name
    }

    /// Assigns `value` under this identity's path in a JSON tree.
    pub fn assign(&self, j: &mut Value, value: Value) {
        self.assign_nested(j, &[], value);
    }

    /// Assigns `value` under this identity's path plus `extra` trailing
    /// segments (e.g. `["p50"]`).
    pub fn assign_nested(&self, j: &mut Value, extra: &[&str], value: Value) {
        let mut node = j;
        for part in self.path {
            node = &mut node[*part];
        }
        for part in extra {
            node = &mut node[*part];
        }
        *node = value;
    }

    /// The help text.
    pub fn desc(&self) -> &'static str {
        self.desc
    }
}

/// A monotonically increasing count.
#[derive(Debug, Clone)]
pub struct Counter {
    id: MetricId,
    value: u64,
}

impl Counter {
    /// Creates a zeroed counter.
    pub fn new(id: MetricId) -> Counter {
        Counter { id, value: 0 }
    }

    /// Increments by one.
    pub fn inc(&mut self) {
        self.value += 1;
    }

    /// Increments by `k`.
    pub fn add(&mut self, k: u64) {
        self.value += k;
    }

    /// The current count.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Adds another counter's count into this one.
    pub fn merge(&mut self, other: &Counter) {
        self.value += other.value;
    }

    /// Writes the count under this counter's name path.
    pub fn to_json(&self, j: &mut Value) {
        self.id.assign(j, json!(self.value));
    }

    /// Writes a gauge sample line.
    pub fn to_prometheus(&self, out: &mut String, extra: &LabelMap) {
        let name = self.id.flat_name();
        write_help_line(out, &name, self.id.desc);
        write_type_line(out, &name, "gauge");
        write_metric_line::<&str, u64>(
            out,
            &name,
            None,
            &[static_labels(), extra],
            None,
            self.value,
        );
    }
}

struct RateInner {
    summary: Summary,
    last_second: u64,
    frozen: bool,
}

/// Events per second, summarized as quantiles over per-second deltas.
///
/// Ingest increments an atomic accumulator. Once per elapsed second the
/// accumulator rolls into the quantile summary as one sample; rolling is
/// lazy, performed by the next `add` or by any read, and attributes zero
/// samples to idle seconds so a quiet stream is not biased upward.
///
/// `live` reads the in-flight accumulator without waiting for the roll.
pub struct Rate {
    id: MetricId,
    counter: AtomicU64,
    inner: Mutex<RateInner>,
    clock: Clock,
    origin: Instant,
}

impl Rate {
    /// Creates a rate driven by the system clock.
    pub fn new(id: MetricId) -> Rate {
        Rate::with_clock(id, Clock::new())
    }

    /// Creates a rate driven by the given clock. Tests pair this with
    /// `quanta::Clock::mock()` to make second boundaries deterministic.
    pub fn with_clock(id: MetricId, clock: Clock) -> Rate {
        let origin = clock.now();
        Rate {
            id,
            counter: AtomicU64::new(0),
            inner: Mutex::new(RateInner {
                summary: Summary::with_defaults(),
                last_second: 0,
                frozen: false,
            }),
            clock,
            origin,
        }
    }

    /// Adds `k` events to the current second.
    pub fn add(&self, k: u64) {
        self.roll();
        self.counter.fetch_add(k, Ordering::Relaxed);
    }

    /// The in-flight per-second accumulator.
    pub fn live(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Number of per-second samples the summary has absorbed.
    pub fn count(&self) -> usize {
        self.inner.lock().summary.count()
    }

    fn roll(&self) {
        let now_second = (self.clock.now() - self.origin).as_secs();
        let mut inner = self.inner.lock();
        if inner.frozen || now_second <= inner.last_second {
            return;
        }

        let sample = self.counter.swap(0, Ordering::Relaxed);
        inner.summary.add(sample as f64);
        for _ in (inner.last_second + 1)..now_second {
            inner.summary.add(0.0);
        }
        inner.last_second = now_second;
    }

    /// Flushes the accumulator into the summary and stops future rolling.
    /// Called when the owning bucket is frozen at rotation; idempotent.
    pub fn freeze(&self) {
        let mut inner = self.inner.lock();
        if inner.frozen {
            return;
        }
        let sample = self.counter.swap(0, Ordering::Relaxed);
        if sample > 0 {
            inner.summary.add(sample as f64);
        }
        inner.frozen = true;
    }

    /// Merges another rate's summary into this one. Live accumulators do not
    /// merge; freeze both rates first.
    pub fn merge(&self, other: &Rate) -> Result<(), SketchError> {
        let mut mine = self.inner.lock();
        let theirs = other.inner.lock();
        mine.summary.merge(&theirs.summary)
    }

    /// Writes `p50`/`p90`/`p95`/`p99` under this rate's name path, plus the
    /// live accumulator under `live` when requested.
    pub fn to_json(&self, j: &mut Value, include_live: bool) {
        self.roll();
        let inner = self.inner.lock();
        if !inner.summary.is_empty() {
            for q in pipeline_quantiles() {
                if let Some(value) = inner.summary.quantile(q.value()) {
                    self.id.assign_nested(j, &[q.label()], json!(value));
                }
            }
        }
        if include_live {
            self.id.assign_nested(j, &["live"], json!(self.live()));
        }
    }

    /// Writes a Prometheus summary: one line per quantile plus `_sum` and
    /// `_count`. An empty rate writes nothing.
    pub fn to_prometheus(&self, out: &mut String, extra: &LabelMap) {
        self.roll();
        let inner = self.inner.lock();
        if inner.summary.is_empty() {
            return;
        }

        let name = self.id.flat_name();
        write_help_line(out, &name, self.id.desc);
        write_type_line(out, &name, "summary");
        let groups = [static_labels(), extra];
        for q in pipeline_quantiles() {
            if let Some(value) = inner.summary.quantile(q.value()) {
                write_metric_line(out, &name, None, &groups, Some(("quantile", q.value())), value);
            }
        }
        write_metric_line::<&str, f64>(
            out,
            &name,
            Some("sum"),
            &groups,
            None,
            inner.summary.max().unwrap_or(0.0),
        );
        write_metric_line::<&str, usize>(
            out,
            &name,
            Some("count"),
            &groups,
            None,
            inner.summary.count(),
        );
    }
}

/// A mergeable quantile summary of double samples.
pub struct Quantile {
    id: MetricId,
    summary: Summary,
}

impl Quantile {
    /// Creates an empty summary.
    pub fn new(id: MetricId) -> Quantile {
        Quantile { id, summary: Summary::with_defaults() }
    }

    /// Adds one sample.
    pub fn update(&mut self, value: f64) {
        self.summary.add(value);
    }

    /// Number of samples absorbed.
    pub fn count(&self) -> usize {
        self.summary.count()
    }

    /// Estimated value at quantile `q`, if any samples were absorbed.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        self.summary.quantile(q)
    }

    /// Merges another summary into this one.
    pub fn merge(&mut self, other: &Quantile) -> Result<(), SketchError> {
        self.summary.merge(&other.summary)
    }

    /// Writes `p50`/`p90`/`p95`/`p99` under this summary's name path. The
    /// quantile fields always appear together; an empty summary writes
    /// nothing.
    pub fn to_json(&self, j: &mut Value) {
        if self.summary.is_empty() {
            return;
        }
        for q in pipeline_quantiles() {
            if let Some(value) = self.summary.quantile(q.value()) {
                self.id.assign_nested(j, &[q.label()], json!(value));
            }
        }
    }

    /// Writes a Prometheus summary. `_sum` reports the maximum seen value
    /// and `_count` the sample count; an empty summary writes nothing.
    pub fn to_prometheus(&self, out: &mut String, extra: &LabelMap) {
        if self.summary.is_empty() {
            return;
        }

        let name = self.id.flat_name();
        write_help_line(out, &name, self.id.desc);
        write_type_line(out, &name, "summary");
        let groups = [static_labels(), extra];
        for q in pipeline_quantiles() {
            if let Some(value) = self.summary.quantile(q.value()) {
                write_metric_line(out, &name, None, &groups, Some(("quantile", q.value())), value);
            }
        }
        write_metric_line::<&str, f64>(
            out,
            &name,
            Some("sum"),
            &groups,
            None,
            self.summary.max().unwrap_or(0.0),
        );
        write_metric_line::<&str, usize>(
            out,
            &name,
            Some("count"),
            &groups,
            None,
            self.summary.count(),
        );
    }
}

/// An approximate count of distinct keys.
pub struct Cardinality {
    id: MetricId,
    sketch: HyperLogLog,
}

impl Cardinality {
    /// Creates an empty sketch.
    pub fn new(id: MetricId) -> Cardinality {
        Cardinality { id, sketch: HyperLogLog::new() }
    }

    /// Observes one key.
    pub fn update(&mut self, key: &[u8]) {
        self.sketch.insert(key);
    }

    /// The estimate, rounded to the nearest integer.
    pub fn value(&self) -> u64 {
        self.sketch.estimate().round() as u64
    }

    /// Unions another sketch into this one. Merging is a sketch union, never
    /// estimate addition.
    pub fn merge(&mut self, other: &Cardinality) {
        self.sketch.merge(&other.sketch);
    }

    /// Writes the rounded estimate under this sketch's name path.
    pub fn to_json(&self, j: &mut Value) {
        self.id.assign(j, json!(self.value()));
    }

    /// Writes a gauge sample line with the rounded estimate.
    pub fn to_prometheus(&self, out: &mut String, extra: &LabelMap) {
        let name = self.id.flat_name();
        write_help_line(out, &name, self.id.desc);
        write_type_line(out, &name, "gauge");
        write_metric_line::<&str, u64>(
            out,
            &name,
            None,
            &[static_labels(), extra],
            None,
            self.value(),
        );
    }
}

/// The heaviest keys by accumulated weight.
pub struct TopN {
    id: MetricId,
    item_label: &'static str,
    topn: usize,
    sketch: TopK,
}

impl TopN {
    /// Creates an empty top-K list. `item_label` is the Prometheus label key
    /// the item name renders under (e.g. `ipv4`, `port`, `qname`); `topn`
    /// bounds the emitted list length.
    pub fn new(id: MetricId, item_label: &'static str, topn: usize) -> TopN {
        TopN { id, item_label, topn, sketch: TopK::new() }
    }

    /// Adds `weight` to `key`. Weights below one count as one.
    pub fn update(&mut self, key: &str, weight: u64) {
        self.sketch.add(key, weight.max(1));
    }

    /// The emitted list: ordered by decreasing estimate, ties broken by
    /// lexicographic key order, truncated to `topn`.
    pub fn top(&self) -> Vec<(String, u64)> {
        self.sketch.top(self.topn)
    }

    /// Merges another top-K sketch into this one.
    pub fn merge(&mut self, other: &TopN) {
        self.sketch.merge(&other.sketch);
    }

    /// Writes the ordered `{name, estimate}` list under this list's name
    /// path.
    pub fn to_json(&self, j: &mut Value) {
        let items: Vec<Value> = self
            .top()
            .into_iter()
            .map(|(name, estimate)| json!({ "name": name, "estimate": estimate }))
            .collect();
        self.id.assign(j, Value::Array(items));
    }

    /// Writes one gauge sample line per emitted item, with the item name as
    /// the trailing label.
    pub fn to_prometheus(&self, out: &mut String, extra: &LabelMap) {
        let items = self.top();
        if items.is_empty() {
            return;
        }

        let name = self.id.flat_name();
        write_help_line(out, &name, self.id.desc);
        write_type_line(out, &name, "gauge");
        let groups = [static_labels(), extra];
        for (key, estimate) in items {
            write_metric_line(out, &name, None, &groups, Some((self.item_label, key)), estimate);
        }
    }
}

/// A fixed-bound histogram emitting the pipeline quantile set.
pub struct Histogram {
    id: MetricId,
    sketch: HistogramSketch,
}

impl Histogram {
    /// Creates an empty histogram over `bounds`.
    ///
    /// Panics if `bounds` is empty; callers pass compile-time bound tables.
    pub fn new(id: MetricId, bounds: &[f64]) -> Histogram {
        let sketch = HistogramSketch::new(bounds).expect("histogram bounds should never be empty");
        Histogram { id, sketch }
    }

    /// Records one sample.
    pub fn update(&mut self, value: f64) {
        self.sketch.record(value);
    }

    /// The sample count.
    pub fn count(&self) -> u64 {
        self.sketch.count()
    }

    /// Merges another histogram into this one; fails on mismatched bounds.
    pub fn merge(&mut self, other: &Histogram) -> Result<(), SketchError> {
        self.sketch.merge(&other.sketch)
    }

    /// Writes the fixed quantile set estimated from the bucket bounds.
    pub fn to_json(&self, j: &mut Value) {
        if self.sketch.is_empty() {
            return;
        }
        for q in pipeline_quantiles() {
            if let Some(value) = self.sketch.quantile(q.value()) {
                self.id.assign_nested(j, &[q.label()], json!(value));
            }
        }
    }

    /// Writes a Prometheus summary with bound-estimated quantiles plus
    /// `_sum` and `_count`.
    pub fn to_prometheus(&self, out: &mut String, extra: &LabelMap) {
        if self.sketch.is_empty() {
            return;
        }

        let name = self.id.flat_name();
        write_help_line(out, &name, self.id.desc);
        write_type_line(out, &name, "summary");
        let groups = [static_labels(), extra];
        for q in pipeline_quantiles() {
            if let Some(value) = self.sketch.quantile(q.value()) {
                write_metric_line(out, &name, None, &groups, Some(("quantile", q.value())), value);
            }
        }
        write_metric_line::<&str, f64>(out, &name, Some("sum"), &groups, None, self.sketch.sum());
        write_metric_line::<&str, u64>(
            out,
            &name,
            Some("count"),
            &groups,
            None,
            self.sketch.count(),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use approx::assert_relative_eq;
    use serde_json::{json, Value};

    use super::{Cardinality, Counter, Histogram, MetricId, Quantile, Rate, TopN};
    use crate::labels::LabelMap;

    const TCP: MetricId = MetricId::new("flow", &["tcp"], "Count of TCP flow samples");
    const PAYLOAD: MetricId =
        MetricId::new("flow", &["payload_size"], "Quantiles of flow sample payload sizes");

    #[test]
    fn counter_json_nested_path() {
        const DEEP: MetricId = MetricId::new("flow", &["cardinality", "src_ips_in"], "x");
        let mut counter = Counter::new(DEEP);
        counter.add(4);

        let mut j = json!({});
        counter.to_json(&mut j);
        assert_eq!(j, json!({ "cardinality": { "src_ips_in": 4 } }));
    }

    #[test]
    fn counter_prometheus() {
        let mut counter = Counter::new(TCP);
        counter.add(52785);

        let mut out = String::new();
        counter.to_prometheus(&mut out, &LabelMap::new());
        assert_eq!(
            out,
            "# HELP flow_tcp Count of TCP flow samples\n\
             # TYPE flow_tcp gauge\n\
             flow_tcp 52785\n"
        );
    }

    #[test]
    fn counter_merge_sums() {
        let mut a = Counter::new(TCP);
        let mut b = Counter::new(TCP);
        a.add(3);
        b.add(4);
        a.merge(&b);
        assert_eq!(a.value(), 7);
    }

    #[test]
    fn quantile_fields_appear_together() {
        let mut quantile = Quantile::new(PAYLOAD);
        let mut j = json!({});
        quantile.to_json(&mut j);
        assert_eq!(j, json!({}), "empty summary emits nothing");

        quantile.update(1518.0);
        quantile.to_json(&mut j);
        let payload = j.get("payload_size").expect("payload_size present");
        for label in ["p50", "p90", "p95", "p99"] {
            assert!(payload.get(label).is_some(), "missing {label}");
        }
    }

    #[test]
    fn quantile_prometheus_has_sum_and_count() {
        let mut quantile = Quantile::new(PAYLOAD);
        for _ in 0..9 {
            quantile.update(1518.0);
        }

        let mut out = String::new();
        quantile.to_prometheus(&mut out, &LabelMap::new());
        assert!(out.starts_with(
            "# HELP flow_payload_size Quantiles of flow sample payload sizes\n\
             # TYPE flow_payload_size summary\n"
        ));
        assert!(out.contains("flow_payload_size{quantile=\"0.5\"} "));
        assert!(out.contains("flow_payload_size{quantile=\"0.99\"} "));
        assert!(out.contains("flow_payload_size_sum 1518\n"));
        assert!(out.contains("flow_payload_size_count 9\n"));
    }

    #[test]
    fn quantile_merge_within_tolerance() {
        let mut a = Quantile::new(PAYLOAD);
        let mut b = Quantile::new(PAYLOAD);
        let mut whole = Quantile::new(PAYLOAD);
        for i in 1..=100 {
            a.update(i as f64);
            whole.update(i as f64);
        }
        for i in 101..=200 {
            b.update(i as f64);
            whole.update(i as f64);
        }

        a.merge(&b).unwrap();
        assert_relative_eq!(
            a.quantile(0.5).unwrap(),
            whole.quantile(0.5).unwrap(),
            max_relative = 0.001
        );
    }

    #[test]
    fn rate_rolls_zeroes_for_idle_seconds() {
        let (clock, mock) = quanta::Clock::mock();
        const EVENTS: MetricId = MetricId::new("flow", &["events", "rate"], "Events per second");
        let rate = Rate::with_clock(EVENTS, clock);

        // Second 0: 100 events. Then four idle seconds before the next add.
        rate.add(100);
        mock.increment(Duration::from_secs(5));
        rate.add(1);

        // The roll sampled 100 once and zero-filled the idle gap.
        assert_eq!(rate.live(), 1);
        assert_eq!(rate.count(), 5);

        let mut j = json!({});
        rate.to_json(&mut j, true);
        let r = &j["events"]["rate"];
        assert_eq!(r["live"], json!(1));
        assert_eq!(r["p50"], json!(0.0));
    }

    #[test]
    fn rate_freeze_flushes_accumulator() {
        let (clock, _mock) = quanta::Clock::mock();
        const EVENTS: MetricId = MetricId::new("flow", &["events", "rate"], "Events per second");
        let rate = Rate::with_clock(EVENTS, clock);

        rate.add(7);
        rate.freeze();
        assert_eq!(rate.count(), 1);
        assert_eq!(rate.live(), 0);

        // Frozen rates ignore later rolls; rendering twice is stable.
        let mut first = json!({});
        rate.to_json(&mut first, false);
        let mut second = json!({});
        rate.to_json(&mut second, false);
        assert_eq!(first, second);
    }

    #[test]
    fn cardinality_rounds_estimate() {
        const IPS: MetricId = MetricId::new("flow", &["cardinality", "dst_ips_out"], "x");
        let mut cardinality = Cardinality::new(IPS);
        assert_eq!(cardinality.value(), 0);

        for ip in ["10.4.1.2", "10.4.2.2", "10.4.3.2", "10.4.4.2"] {
            cardinality.update(ip.as_bytes());
        }
        assert_eq!(cardinality.value(), 4);

        let mut j = json!({});
        cardinality.to_json(&mut j);
        assert_eq!(j, json!({ "cardinality": { "dst_ips_out": 4 } }));
    }

    #[test]
    fn topn_ordering_and_truncation() {
        const TOP: MetricId = MetricId::new("flow", &["top_src_ips_bytes"], "x");
        let mut topn = TopN::new(TOP, "ipv4", 2);
        topn.update("10.4.1.2", 300);
        topn.update("10.4.3.2", 100);
        topn.update("10.4.2.2", 100);

        let mut j = json!({});
        topn.to_json(&mut j);
        assert_eq!(
            j["top_src_ips_bytes"],
            json!([
                { "name": "10.4.1.2", "estimate": 300 },
                { "name": "10.4.2.2", "estimate": 100 },
            ])
        );

        let mut out = String::new();
        topn.to_prometheus(&mut out, &LabelMap::new());
        assert!(out.contains("flow_top_src_ips_bytes{ipv4=\"10.4.1.2\"} 300\n"));
    }

    #[test]
    fn topn_empty_renders_empty_list() {
        const TOP: MetricId = MetricId::new("flow", &["top_src_ips_bytes"], "x");
        let topn = TopN::new(TOP, "ipv4", 10);

        let mut j = json!({});
        topn.to_json(&mut j);
        assert_eq!(j["top_src_ips_bytes"], Value::Array(vec![]));

        let mut out = String::new();
        topn.to_prometheus(&mut out, &LabelMap::new());
        assert!(out.is_empty());
    }

    #[test]
    fn histogram_emits_quantile_set() {
        const SIZES: MetricId = MetricId::new("pcap", &["packet_sizes"], "x");
        let mut histogram = Histogram::new(SIZES, &[64.0, 512.0, 1500.0]);
        for _ in 0..99 {
            histogram.update(60.0);
        }
        histogram.update(1400.0);

        let mut j = json!({});
        histogram.to_json(&mut j);
        assert_eq!(j["packet_sizes"]["p50"], json!(64.0));
        assert_eq!(j["packet_sizes"]["p99"], json!(64.0));

        let mut out = String::new();
        histogram.to_prometheus(&mut out, &LabelMap::new());
        assert!(out.contains("# TYPE pcap_packet_sizes summary\n"));
        assert!(out.contains("pcap_packet_sizes_count 100\n"));
    }
}
