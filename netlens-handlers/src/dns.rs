//! The DNS handler: aggregates paired query/response transactions.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use netlens::bucket::{EventData, MetricsBucket};
use netlens::config::WindowConfig;
use netlens::event::{DnsTransaction, DnsTransport, InputSource, SlotId};
use netlens::handler::StreamHandler;
use netlens::labels::LabelMap;
use netlens::manager::MetricsManager;
use netlens::metrics::{Cardinality, Counter, MetricId, Quantile, TopN};
use netlens::Error;

const RCODE_NOERROR: u16 = 0;
const RCODE_SERVFAIL: u16 = 2;
const RCODE_NXDOMAIN: u16 = 3;
const RCODE_REFUSED: u16 = 5;

fn qtype_name(qtype: u16) -> &'static str {
    match qtype {
        1 => "A",
        2 => "NS",
        5 => "CNAME",
        6 => "SOA",
        12 => "PTR",
        15 => "MX",
        16 => "TXT",
        28 => "AAAA",
        33 => "SRV",
        43 => "DS",
        46 => "RRSIG",
        48 => "DNSKEY",
        65 => "HTTPS",
        255 => "ANY",
        _ => "OTHER",
    }
}

/// DNS handler configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DnsConfig {
    pub window: WindowConfig,
    /// Maximum length of each emitted top-K list.
    pub topn: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig { window: WindowConfig::default(), topn: 10 }
    }
}

impl DnsConfig {
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
pub struct DnsBucketConfig {
    pub topn: usize,
}

/// The transaction counters.
#[derive(Clone)]
pub struct DnsCounters {
    pub xacts: Counter,
    pub timed_out: Counter,
    pub udp: Counter,
    pub tcp: Counter,
    pub noerror: Counter,
    pub servfail: Counter,
    pub nxdomain: Counter,
    pub refused: Counter,
}

impl DnsCounters {
    fn new() -> DnsCounters {
        DnsCounters {
            xacts: Counter::new(MetricId::new("dns", &["xacts"], "Total DNS transactions")),
            timed_out: Counter::new(MetricId::new(
                "dns",
                &["timed_out"],
                "DNS transactions that never received a response",
            )),
            udp: Counter::new(MetricId::new("dns", &["udp"], "DNS transactions over UDP")),
            tcp: Counter::new(MetricId::new("dns", &["tcp"], "DNS transactions over TCP")),
            noerror: Counter::new(MetricId::new(
                "dns",
                &["noerror"],
                "DNS transactions answered NOERROR",
            )),
            servfail: Counter::new(MetricId::new(
                "dns",
                &["servfail"],
                "DNS transactions answered SERVFAIL",
            )),
            nxdomain: Counter::new(MetricId::new(
                "dns",
                &["nxdomain"],
                "DNS transactions answered NXDOMAIN",
            )),
            refused: Counter::new(MetricId::new(
                "dns",
                &["refused"],
                "DNS transactions answered REFUSED",
            )),
        }
    }

    fn merge(&mut self, other: &DnsCounters) {
        self.xacts.merge(&other.xacts);
        self.timed_out.merge(&other.timed_out);
        self.udp.merge(&other.udp);
        self.tcp.merge(&other.tcp);
        self.noerror.merge(&other.noerror);
        self.servfail.merge(&other.servfail);
        self.nxdomain.merge(&other.nxdomain);
        self.refused.merge(&other.refused);
    }

    fn to_json(&self, j: &mut Value) {
        self.xacts.to_json(j);
        self.timed_out.to_json(j);
        self.udp.to_json(j);
        self.tcp.to_json(j);
        self.noerror.to_json(j);
        self.servfail.to_json(j);
        self.nxdomain.to_json(j);
        self.refused.to_json(j);
    }

    fn to_prometheus(&self, out: &mut String, extra: &LabelMap) {
        self.xacts.to_prometheus(out, extra);
        self.timed_out.to_prometheus(out, extra);
        self.udp.to_prometheus(out, extra);
        self.tcp.to_prometheus(out, extra);
        self.noerror.to_prometheus(out, extra);
        self.servfail.to_prometheus(out, extra);
        self.nxdomain.to_prometheus(out, extra);
        self.refused.to_prometheus(out, extra);
    }
}

struct DnsSketches {
    qnames: Cardinality,
    top_qnames: TopN,
    top_qtypes: TopN,
    xact_time_us: Quantile,
}

impl DnsSketches {
    fn new(topn: usize) -> DnsSketches {
        DnsSketches {
            qnames: Cardinality::new(MetricId::new(
                "dns",
                &["cardinality", "qnames"],
                "Distinct query names seen",
            )),
            top_qnames: TopN::new(
                MetricId::new("dns", &["top_qnames"], "Most queried names"),
                "qname",
                topn,
            ),
            top_qtypes: TopN::new(
                MetricId::new("dns", &["top_qtypes"], "Most queried record types"),
                "qtype",
                topn,
            ),
            xact_time_us: Quantile::new(MetricId::new(
                "dns",
                &["xact_time_us"],
                "Quantiles of transaction time in microseconds",
            )),
        }
    }

    fn merge(&mut self, other: &DnsSketches) {
        self.qnames.merge(&other.qnames);
        self.top_qnames.merge(&other.top_qnames);
        self.top_qtypes.merge(&other.top_qtypes);
        if let Err(err) = self.xact_time_us.merge(&other.xact_time_us) {
            warn!(error = %err, "skipping transaction time merge");
        }
    }

    fn to_json(&self, j: &mut Value) {
        self.qnames.to_json(j);
        self.top_qnames.to_json(j);
        self.top_qtypes.to_json(j);
        self.xact_time_us.to_json(j);
    }

    fn to_prometheus(&self, out: &mut String, extra: &LabelMap) {
        self.qnames.to_prometheus(out, extra);
        self.top_qnames.to_prometheus(out, extra);
        self.top_qtypes.to_prometheus(out, extra);
        self.xact_time_us.to_prometheus(out, extra);
    }
}

/// The per-window aggregate of the DNS handler.
pub struct DnsBucket {
    event_data: EventData,
    counters: RwLock<DnsCounters>,
    sketches: RwLock<DnsSketches>,
}

impl DnsBucket {
    /// A consistent snapshot of the transaction counters.
    pub fn counters(&self) -> DnsCounters {
        self.counters.read().clone()
    }

    /// Aggregates one transaction. `deep` gates the qname cardinality,
    /// top-K, and latency updates.
    pub fn process_xact(&self, xact: &DnsTransaction, deep: bool) {
        {
            let mut counters = self.counters.write();
            counters.xacts.inc();
            match xact.transport {
                DnsTransport::Udp => counters.udp.inc(),
                DnsTransport::Tcp => counters.tcp.inc(),
            }
            if xact.timed_out {
                counters.timed_out.inc();
            } else {
                match xact.rcode {
                    RCODE_NOERROR => counters.noerror.inc(),
                    RCODE_SERVFAIL => counters.servfail.inc(),
                    RCODE_NXDOMAIN => counters.nxdomain.inc(),
                    RCODE_REFUSED => counters.refused.inc(),
                    _ => {}
                }
            }
        }

        if !deep {
            return;
        }

        let mut sketches = self.sketches.write();
        sketches.qnames.update(xact.qname.as_bytes());
        sketches.top_qnames.update(&xact.qname, 1);
        sketches.top_qtypes.update(qtype_name(xact.qtype), 1);
        if !xact.timed_out {
            sketches.xact_time_us.update(xact.xact_time.as_micros() as f64);
        }
    }
}

impl MetricsBucket for DnsBucket {
    type Config = DnsBucketConfig;

    fn new(config: &DnsBucketConfig) -> Self {
        DnsBucket {
            event_data: EventData::new("dns"),
            counters: RwLock::new(DnsCounters::new()),
            sketches: RwLock::new(DnsSketches::new(config.topn)),
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

/// Binds one input stream's DNS signal to a window manager.
pub struct DnsStreamHandler {
    name: String,
    source: Arc<InputSource>,
    manager: Arc<MetricsManager<DnsBucket>>,
    slot: Mutex<Option<SlotId>>,
}

impl DnsStreamHandler {
    /// Creates a handler; configuration problems fail here.
    pub fn new(
        name: &str,
        source: Arc<InputSource>,
        config: &DnsConfig,
    ) -> Result<DnsStreamHandler, Error> {
        config.validate()?;
        let manager = MetricsManager::new(
            config.window.clone(),
            DnsBucketConfig { topn: config.topn as usize },
        )?;

        Ok(DnsStreamHandler {
            name: name.to_string(),
            source,
            manager: Arc::new(manager),
            slot: Mutex::new(None),
        })
    }

    /// The handler's window manager.
    pub fn metrics(&self) -> &MetricsManager<DnsBucket> {
        &self.manager
    }
}

impl StreamHandler for DnsStreamHandler {
    fn schema_key(&self) -> &'static str {
        "dns"
    }

    fn start(&self) -> Result<(), Error> {
        self.manager.start()?;

        let manager = Arc::clone(&self.manager);
        let slot = self.source.dns.connect(move |xact| {
            let _ = manager.process_event(|bucket, deep| bucket.process_xact(xact, deep));
        });
        *self.slot.lock() = Some(slot);

        debug!(handler = %self.name, stream = %self.source.name(), "dns handler started");
        Ok(())
    }

    fn stop(&self) -> Result<(), Error> {
        if let Some(slot) = self.slot.lock().take() {
            self.source.dns.disconnect(slot);
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
