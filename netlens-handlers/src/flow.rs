//! The flow handler: aggregates sFlow/NetFlow samples.
//!
//! One [`FlowRecord`] is one received flow datagram; it counts as a single
//! event, while its decoded samples drive the per-protocol counters and the
//! deep primitives. Byte and packet weights are multiplied by the exporter's
//! sampling rate unless `sample_rate_scaling` is disabled, and the
//! `only_hosts` filter drops samples whose endpoints both fall outside the
//! configured networks, counting them as `filtered`.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use netlens::bucket::{EventData, MetricsBucket};
use netlens::config::{HostFilter, WindowConfig};
use netlens::event::{FlowRecord, InputSource, L3Proto, L4Proto, SlotId};
use netlens::handler::StreamHandler;
use netlens::labels::LabelMap;
use netlens::manager::MetricsManager;
use netlens::metrics::{Cardinality, Counter, MetricId, Quantile, TopN};
use netlens::Error;

/// Flow handler configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowConfig {
    pub window: WindowConfig,
    /// Maximum length of each emitted top-K list.
    pub topn: u64,
    /// Multiply byte/packet counts by the sample's sampling rate.
    pub sample_rate_scaling: bool,
    /// CIDR allowlist; empty admits everything.
    pub only_hosts: Vec<String>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            window: WindowConfig::default(),
            topn: 10,
            sample_rate_scaling: true,
            only_hosts: Vec::new(),
        }
    }
}

impl FlowConfig {
    /// Validates the window parameters and `topn`; the CIDR list is parsed
    /// (and thereby validated) at handler construction.
    pub fn validate(&self) -> Result<(), Error> {
        self.window.validate()?;
        if self.topn == 0 {
            return Err(Error::Config {
                field: "topn",
                reason: "top-K lists need at least one entry".to_string(),
            });
        }
        Ok(())
    }
}

/// Per-bucket construction parameters.
#[derive(Clone)]
pub struct FlowBucketConfig {
    pub topn: usize,
}

/// The per-sample protocol counters. `total` excludes filtered samples.
#[derive(Clone)]
pub struct FlowCounters {
    pub tcp: Counter,
    pub udp: Counter,
    pub other_l4: Counter,
    pub ipv4: Counter,
    pub ipv6: Counter,
    pub filtered: Counter,
    pub total: Counter,
}

impl FlowCounters {
    fn new() -> FlowCounters {
        FlowCounters {
            tcp: Counter::new(MetricId::new("flow", &["tcp"], "Count of TCP flow samples")),
            udp: Counter::new(MetricId::new("flow", &["udp"], "Count of UDP flow samples")),
            other_l4: Counter::new(MetricId::new(
                "flow",
                &["other_l4"],
                "Count of flow samples with an unrecognized transport protocol",
            )),
            ipv4: Counter::new(MetricId::new("flow", &["ipv4"], "Count of IPv4 flow samples")),
            ipv6: Counter::new(MetricId::new("flow", &["ipv6"], "Count of IPv6 flow samples")),
            filtered: Counter::new(MetricId::new(
                "flow",
                &["filtered"],
                "Count of flow samples dropped by the host filter",
            )),
            total: Counter::new(MetricId::new(
                "flow",
                &["total"],
                "Total flow samples aggregated",
            )),
        }
    }

    fn merge(&mut self, other: &FlowCounters) {
        self.tcp.merge(&other.tcp);
        self.udp.merge(&other.udp);
        self.other_l4.merge(&other.other_l4);
        self.ipv4.merge(&other.ipv4);
        self.ipv6.merge(&other.ipv6);
        self.filtered.merge(&other.filtered);
        self.total.merge(&other.total);
    }

    fn to_json(&self, j: &mut Value) {
        self.tcp.to_json(j);
        self.udp.to_json(j);
        self.other_l4.to_json(j);
        self.ipv4.to_json(j);
        self.ipv6.to_json(j);
        self.filtered.to_json(j);
        self.total.to_json(j);
    }

    fn to_prometheus(&self, out: &mut String, extra: &LabelMap) {
        self.tcp.to_prometheus(out, extra);
        self.udp.to_prometheus(out, extra);
        self.other_l4.to_prometheus(out, extra);
        self.ipv4.to_prometheus(out, extra);
        self.ipv6.to_prometheus(out, extra);
        self.filtered.to_prometheus(out, extra);
        self.total.to_prometheus(out, extra);
    }
}

struct FlowSketches {
    src_ips_in: Cardinality,
    dst_ips_out: Cardinality,
    src_ports_in: Cardinality,
    dst_ports_out: Cardinality,
    top_src_ips_bytes: TopN,
    top_src_ips_packets: TopN,
    top_dst_ips_bytes: TopN,
    top_dst_ips_packets: TopN,
    top_dst_ports_bytes: TopN,
    top_src_ips_and_port_bytes: TopN,
    payload_size: Quantile,
}

impl FlowSketches {
    fn new(topn: usize) -> FlowSketches {
        FlowSketches {
            src_ips_in: Cardinality::new(MetricId::new(
                "flow",
                &["cardinality", "src_ips_in"],
                "Distinct source addresses seen",
            )),
            dst_ips_out: Cardinality::new(MetricId::new(
                "flow",
                &["cardinality", "dst_ips_out"],
                "Distinct destination addresses seen",
            )),
            src_ports_in: Cardinality::new(MetricId::new(
                "flow",
                &["cardinality", "src_ports_in"],
                "Distinct source ports seen",
            )),
            dst_ports_out: Cardinality::new(MetricId::new(
                "flow",
                &["cardinality", "dst_ports_out"],
                "Distinct destination ports seen",
            )),
            top_src_ips_bytes: TopN::new(
                MetricId::new(
                    "flow",
                    &["top_src_ips_bytes"],
                    "Top source addresses by byte count",
                ),
                "ip",
                topn,
            ),
            top_src_ips_packets: TopN::new(
                MetricId::new(
                    "flow",
                    &["top_src_ips_packets"],
                    "Top source addresses by packet count",
                ),
                "ip",
                topn,
            ),
            top_dst_ips_bytes: TopN::new(
                MetricId::new(
                    "flow",
                    &["top_dst_ips_bytes"],
                    "Top destination addresses by byte count",
                ),
                "ip",
                topn,
            ),
            top_dst_ips_packets: TopN::new(
                MetricId::new(
                    "flow",
                    &["top_dst_ips_packets"],
                    "Top destination addresses by packet count",
                ),
                "ip",
                topn,
            ),
            top_dst_ports_bytes: TopN::new(
                MetricId::new(
                    "flow",
                    &["top_dst_ports_bytes"],
                    "Top destination ports by byte count",
                ),
                "port",
                topn,
            ),
            top_src_ips_and_port_bytes: TopN::new(
                MetricId::new(
                    "flow",
                    &["top_src_ips_and_port_bytes"],
                    "Top source endpoints by byte count",
                ),
                "endpoint",
                topn,
            ),
            payload_size: Quantile::new(MetricId::new(
                "flow",
                &["payload_size"],
                "Quantiles of flow sample payload sizes",
            )),
        }
    }

    fn merge(&mut self, other: &FlowSketches) {
        self.src_ips_in.merge(&other.src_ips_in);
        self.dst_ips_out.merge(&other.dst_ips_out);
        self.src_ports_in.merge(&other.src_ports_in);
        self.dst_ports_out.merge(&other.dst_ports_out);
        self.top_src_ips_bytes.merge(&other.top_src_ips_bytes);
        self.top_src_ips_packets.merge(&other.top_src_ips_packets);
        self.top_dst_ips_bytes.merge(&other.top_dst_ips_bytes);
        self.top_dst_ips_packets.merge(&other.top_dst_ips_packets);
        self.top_dst_ports_bytes.merge(&other.top_dst_ports_bytes);
        self.top_src_ips_and_port_bytes.merge(&other.top_src_ips_and_port_bytes);
        if let Err(err) = self.payload_size.merge(&other.payload_size) {
            warn!(error = %err, "skipping payload size merge");
        }
    }

    fn to_json(&self, j: &mut Value) {
        self.src_ips_in.to_json(j);
        self.dst_ips_out.to_json(j);
        self.src_ports_in.to_json(j);
        self.dst_ports_out.to_json(j);
        self.top_src_ips_bytes.to_json(j);
        self.top_src_ips_packets.to_json(j);
        self.top_dst_ips_bytes.to_json(j);
        self.top_dst_ips_packets.to_json(j);
        self.top_dst_ports_bytes.to_json(j);
        self.top_src_ips_and_port_bytes.to_json(j);
        self.payload_size.to_json(j);
    }

    fn to_prometheus(&self, out: &mut String, extra: &LabelMap) {
        self.src_ips_in.to_prometheus(out, extra);
        self.dst_ips_out.to_prometheus(out, extra);
        self.src_ports_in.to_prometheus(out, extra);
        self.dst_ports_out.to_prometheus(out, extra);
        self.top_src_ips_bytes.to_prometheus(out, extra);
        self.top_src_ips_packets.to_prometheus(out, extra);
        self.top_dst_ips_bytes.to_prometheus(out, extra);
        self.top_dst_ips_packets.to_prometheus(out, extra);
        self.top_dst_ports_bytes.to_prometheus(out, extra);
        self.top_src_ips_and_port_bytes.to_prometheus(out, extra);
        self.payload_size.to_prometheus(out, extra);
    }
}

/// The per-window aggregate of the flow handler.
pub struct FlowBucket {
    event_data: EventData,
    counters: RwLock<FlowCounters>,
    sketches: RwLock<FlowSketches>,
}

impl FlowBucket {
    /// A consistent snapshot of the protocol counters.
    pub fn counters(&self) -> FlowCounters {
        self.counters.read().clone()
    }

    /// Aggregates one flow datagram's samples. `deep` gates the cardinality,
    /// top-K, and payload-size updates; counters see every admitted sample.
    pub fn process_record(
        &self,
        record: &FlowRecord,
        deep: bool,
        scaling: bool,
        filter: &HostFilter,
    ) {
        for sample in &record.samples {
            if !filter.admits(sample.src_ip, sample.dst_ip) {
                self.counters.write().filtered.inc();
                continue;
            }

            {
                let mut counters = self.counters.write();
                match sample.l4 {
                    L4Proto::Tcp => counters.tcp.inc(),
                    L4Proto::Udp => counters.udp.inc(),
                    L4Proto::Other => counters.other_l4.inc(),
                }
                match sample.l3 {
                    L3Proto::Ipv4 => counters.ipv4.inc(),
                    L3Proto::Ipv6 => counters.ipv6.inc(),
                    L3Proto::Other => {}
                }
                counters.total.inc();
            }

            if !deep {
                continue;
            }

            let factor = if scaling { sample.sampling_rate.max(1) } else { 1 };
            let bytes = sample.byte_count.saturating_mul(factor);
            let packets = sample.packet_count.saturating_mul(factor);
            let src = sample.src_ip.to_string();
            let dst = sample.dst_ip.to_string();

            let mut sketches = self.sketches.write();
            sketches.src_ips_in.update(src.as_bytes());
            sketches.dst_ips_out.update(dst.as_bytes());
            if sample.src_port > 0 {
                sketches.src_ports_in.update(&sample.src_port.to_be_bytes());
            }
            if sample.dst_port > 0 {
                sketches.dst_ports_out.update(&sample.dst_port.to_be_bytes());
            }
            sketches.top_src_ips_bytes.update(&src, bytes);
            sketches.top_src_ips_packets.update(&src, packets);
            sketches.top_dst_ips_bytes.update(&dst, bytes);
            sketches.top_dst_ips_packets.update(&dst, packets);
            if sample.dst_port > 0 {
                sketches.top_dst_ports_bytes.update(&sample.dst_port.to_string(), bytes);
            }
            if sample.src_port > 0 {
                sketches
                    .top_src_ips_and_port_bytes
                    .update(&format!("{src}:{}", sample.src_port), bytes);
            }
            sketches.payload_size.update(bytes as f64);
        }
    }
}

impl MetricsBucket for FlowBucket {
    type Config = FlowBucketConfig;

    fn new(config: &FlowBucketConfig) -> Self {
        FlowBucket {
            event_data: EventData::new("flow"),
            counters: RwLock::new(FlowCounters::new()),
            sketches: RwLock::new(FlowSketches::new(config.topn)),
        }
    }

    fn event_data(&self) -> &EventData {
        &self.event_data
    }

    fn merge_metrics(&mut self, other: &Self) {
        self.counters.write().merge(&other.counters.read());
        self.sketches.write().merge(&other.sketches.read());
    }

    fn metrics_json(&self, j: &mut Value) {
        self.counters.read().to_json(j);
        self.sketches.read().to_json(j);
    }

    fn metrics_prometheus(&self, out: &mut String, extra: &LabelMap) {
        self.counters.read().to_prometheus(out, extra);
        self.sketches.read().to_prometheus(out, extra);
    }
}

/// Binds one input stream's flow signal to a window manager.
pub struct FlowStreamHandler {
    name: String,
    source: Arc<InputSource>,
    manager: Arc<MetricsManager<FlowBucket>>,
    filter: HostFilter,
    scaling: bool,
    slot: Mutex<Option<SlotId>>,
}

impl FlowStreamHandler {
    /// Creates a handler. Configuration problems (including unparsable
    /// `only_hosts` entries) fail here and prevent `start()`.
    pub fn new(
        name: &str,
        source: Arc<InputSource>,
        config: &FlowConfig,
    ) -> Result<FlowStreamHandler, Error> {
        config.validate()?;
        let filter = HostFilter::parse(&config.only_hosts)?;
        let manager = MetricsManager::new(
            config.window.clone(),
            FlowBucketConfig { topn: config.topn as usize },
        )?;

        Ok(FlowStreamHandler {
            name: name.to_string(),
            source,
            manager: Arc::new(manager),
            filter,
            scaling: config.sample_rate_scaling,
            slot: Mutex::new(None),
        })
    }

    /// The handler's window manager.
    pub fn metrics(&self) -> &MetricsManager<FlowBucket> {
        &self.manager
    }
}

impl StreamHandler for FlowStreamHandler {
    fn schema_key(&self) -> &'static str {
        "flow"
    }

    fn start(&self) -> Result<(), Error> {
        self.manager.start()?;

        let manager = Arc::clone(&self.manager);
        let filter = self.filter.clone();
        let scaling = self.scaling;
        let slot = self.source.flows.connect(move |record| {
            let _ = manager
                .process_event(|bucket, deep| bucket.process_record(record, deep, scaling, &filter));
        });
        *self.slot.lock() = Some(slot);

        debug!(handler = %self.name, stream = %self.source.name(), "flow handler started");
        Ok(())
    }

    fn stop(&self) -> Result<(), Error> {
        if let Some(slot) = self.slot.lock().take() {
            self.source.flows.disconnect(slot);
        }
        self.manager.stop()
    }

    fn window_json(&self, period: usize, merged: bool) -> Value {
        self.manager.window_json(self.schema_key(), period, merged)
    }

    fn window_prometheus(&self, out: &mut String) {
        let mut extra = LabelMap::new();
        extra.insert("module".to_string(), self.name.clone());
        self.manager.window_prometheus(out, &extra);
    }
}
