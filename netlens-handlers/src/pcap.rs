//! The pcap handler: aggregates packet observations and capture-device
//! statistics.
//!
//! Device drop counters arrive as monotonic totals; the bucket remembers the
//! previous report and accumulates deltas, so the first report after a
//! window opens only establishes a baseline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use netlens::bucket::{EventData, MetricsBucket};
use netlens::config::WindowConfig;
use netlens::event::{DeviceStats, Direction, InputSource, L3Proto, PacketEvent, SlotId};
use netlens::handler::StreamHandler;
use netlens::labels::LabelMap;
use netlens::manager::MetricsManager;
use netlens::metrics::{Counter, Histogram, MetricId};
use netlens::Error;

const PACKET_SIZE_BOUNDS: &[f64] =
    &[64.0, 128.0, 256.0, 512.0, 1024.0, 1500.0, 9000.0, 65535.0];

/// Pcap handler configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PcapConfig {
    pub window: WindowConfig,
}

impl PcapConfig {
    pub fn validate(&self) -> Result<(), Error> {
        self.window.validate()
    }
}

/// The packet counters.
#[derive(Clone)]
pub struct PcapCounters {
    pub ipv4: Counter,
    pub ipv6: Counter,
    pub dir_in: Counter,
    pub dir_out: Counter,
    pub os_drops: Counter,
    pub if_drops: Counter,
}

impl PcapCounters {
    fn new() -> PcapCounters {
        PcapCounters {
            ipv4: Counter::new(MetricId::new("pcap", &["ipv4"], "Count of IPv4 packets")),
            ipv6: Counter::new(MetricId::new("pcap", &["ipv6"], "Count of IPv6 packets")),
            dir_in: Counter::new(MetricId::new(
                "pcap",
                &["in"],
                "Count of packets toward the observed host",
            )),
            dir_out: Counter::new(MetricId::new(
                "pcap",
                &["out"],
                "Count of packets away from the observed host",
            )),
            os_drops: Counter::new(MetricId::new(
                "pcap",
                &["os_drops"],
                "Count of packets dropped by the operating system (if supported)",
            )),
            if_drops: Counter::new(MetricId::new(
                "pcap",
                &["if_drops"],
                "Count of packets dropped by the interface (if supported)",
            )),
        }
    }

    fn merge(&mut self, other: &PcapCounters) {
        self.ipv4.merge(&other.ipv4);
        self.ipv6.merge(&other.ipv6);
        self.dir_in.merge(&other.dir_in);
        self.dir_out.merge(&other.dir_out);
        self.os_drops.merge(&other.os_drops);
        self.if_drops.merge(&other.if_drops);
    }

    fn to_json(&self, j: &mut Value) {
        self.ipv4.to_json(j);
        self.ipv6.to_json(j);
        self.dir_in.to_json(j);
        self.dir_out.to_json(j);
        self.os_drops.to_json(j);
        self.if_drops.to_json(j);
    }

    fn to_prometheus(&self, out: &mut String, extra: &LabelMap) {
        self.ipv4.to_prometheus(out, extra);
        self.ipv6.to_prometheus(out, extra);
        self.dir_in.to_prometheus(out, extra);
        self.dir_out.to_prometheus(out, extra);
        self.os_drops.to_prometheus(out, extra);
        self.if_drops.to_prometheus(out, extra);
    }
}

/// The per-window aggregate of the pcap handler.
pub struct PcapBucket {
    event_data: EventData,
    counters: RwLock<PcapCounters>,
    packet_sizes: RwLock<Histogram>,
    // Previous monotonic totals; u64::MAX marks "no report seen yet".
    last_os_drops: AtomicU64,
    last_if_drops: AtomicU64,
}

impl PcapBucket {
    /// A consistent snapshot of the packet counters.
    pub fn counters(&self) -> PcapCounters {
        self.counters.read().clone()
    }

    /// Aggregates one packet observation. `deep` gates the size histogram.
    pub fn process_packet(&self, packet: &PacketEvent, deep: bool) {
        {
            let mut counters = self.counters.write();
            match packet.l3 {
                L3Proto::Ipv4 => counters.ipv4.inc(),
                L3Proto::Ipv6 => counters.ipv6.inc(),
                L3Proto::Other => {}
            }
            match packet.direction {
                Direction::In => counters.dir_in.inc(),
                Direction::Out => counters.dir_out.inc(),
                Direction::Unknown => {}
            }
        }

        if deep {
            self.packet_sizes.write().update(packet.size as f64);
        }
    }

    /// Accumulates drop deltas from a device statistics report.
    pub fn process_device_stats(&self, stats: &DeviceStats) {
        let prior = self.last_os_drops.swap(stats.os_drops, Ordering::AcqRel);
        if prior != u64::MAX && stats.os_drops > prior {
            self.counters.write().os_drops.add(stats.os_drops - prior);
        }

        let prior = self.last_if_drops.swap(stats.if_drops, Ordering::AcqRel);
        if prior != u64::MAX && stats.if_drops > prior {
            self.counters.write().if_drops.add(stats.if_drops - prior);
        }
    }
}

impl MetricsBucket for PcapBucket {
    type Config = ();

    fn new(_: &()) -> Self {
        PcapBucket {
            event_data: EventData::new("pcap"),
            counters: RwLock::new(PcapCounters::new()),
            packet_sizes: RwLock::new(Histogram::new(
                MetricId::new("pcap", &["packet_sizes"], "Quantiles of packet sizes in bytes"),
                PACKET_SIZE_BOUNDS,
            )),
            last_os_drops: AtomicU64::new(u64::MAX),
            last_if_drops: AtomicU64::new(u64::MAX),
        }
    }

    fn event_data(&self) -> &EventData {
        &self.event_data
    }

    fn merge_metrics(&mut self, other: &Self) {
        self.counters.write().merge(&other.counters.read());
        if let Err(err) = self.packet_sizes.write().merge(&other.packet_sizes.read()) {
            warn!(error = %err, "skipping packet size merge");
        }
        // Baseline totals are window-local and deliberately not merged.
    }

    fn metrics_json(&self, j: &mut Value) {
        self.counters.read().to_json(j);
        self.packet_sizes.read().to_json(j);
    }

    fn metrics_prometheus(&self, out: &mut String, extra: &LabelMap) {
        self.counters.read().to_prometheus(out, extra);
        self.packet_sizes.read().to_prometheus(out, extra);
    }
}

/// Binds one input stream's packet and device-stats signals to a window
/// manager.
pub struct PcapStreamHandler {
    name: String,
    source: Arc<InputSource>,
    manager: Arc<MetricsManager<PcapBucket>>,
    packet_slot: Mutex<Option<SlotId>>,
    stats_slot: Mutex<Option<SlotId>>,
}

impl PcapStreamHandler {
    /// Creates a handler; configuration problems fail here.
    pub fn new(
        name: &str,
        source: Arc<InputSource>,
        config: &PcapConfig,
    ) -> Result<PcapStreamHandler, Error> {
        config.validate()?;
        let manager = MetricsManager::new(config.window.clone(), ())?;

        Ok(PcapStreamHandler {
            name: name.to_string(),
            source,
            manager: Arc::new(manager),
            packet_slot: Mutex::new(None),
            stats_slot: Mutex::new(None),
        })
    }

    /// The handler's window manager.
    pub fn metrics(&self) -> &MetricsManager<PcapBucket> {
        &self.manager
    }
}

impl StreamHandler for PcapStreamHandler {
    fn schema_key(&self) -> &'static str {
        "pcap"
    }

    fn start(&self) -> Result<(), Error> {
        self.manager.start()?;

        let manager = Arc::clone(&self.manager);
        let slot = self.source.packets.connect(move |packet| {
            let _ = manager.process_event(|bucket, deep| bucket.process_packet(packet, deep));
        });
        *self.packet_slot.lock() = Some(slot);

        // Device statistics update the live bucket out of band: they are not
        // traffic events and must not disturb the event counts.
        let manager = Arc::clone(&self.manager);
        let slot = self.source.device_stats.connect(move |stats| {
            let _ = manager.with_live_bucket(|bucket| bucket.process_device_stats(stats));
        });
        *self.stats_slot.lock() = Some(slot);

        debug!(handler = %self.name, stream = %self.source.name(), "pcap handler started");
        Ok(())
    }

    fn stop(&self) -> Result<(), Error> {
        if let Some(slot) = self.packet_slot.lock().take() {
            self.source.packets.disconnect(slot);
        }
        if let Some(slot) = self.stats_slot.lock().take() {
            self.source.device_stats.disconnect(slot);
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

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::SystemTime;

    use serde_json::json;

    use netlens::bucket::MetricsBucket;
    use netlens::config::WindowConfig;
    use netlens::event::{DeviceStats, Direction, InputSource, L3Proto, PacketEvent};
    use netlens::handler::StreamHandler;

    use super::{PcapConfig, PcapStreamHandler};

    fn packet(size: u64, direction: Direction, l3: L3Proto) -> PacketEvent {
        PacketEvent { size, direction, l3, timestamp: SystemTime::now() }
    }

    fn handler_with_source() -> (PcapStreamHandler, Arc<InputSource>) {
        let source = Arc::new(InputSource::new("pcap-test"));
        let config = PcapConfig {
            window: WindowConfig { num_periods: 1, ..WindowConfig::default() },
        };
        let handler = PcapStreamHandler::new("pcap-test", Arc::clone(&source), &config).unwrap();
        (handler, source)
    }

    #[test]
    fn counts_packets_by_l3_and_direction() {
        let (handler, source) = handler_with_source();
        handler.start().unwrap();

        for _ in 0..3 {
            source.packets.emit(&packet(64, Direction::In, L3Proto::Ipv4));
        }
        source.packets.emit(&packet(1400, Direction::Out, L3Proto::Ipv6));
        handler.stop().unwrap();

        let bucket = handler.metrics().bucket(0).unwrap();
        assert_eq!(bucket.event_data().counts().num_events.value(), 4);

        let counters = bucket.counters();
        assert_eq!(counters.ipv4.value(), 3);
        assert_eq!(counters.ipv6.value(), 1);
        assert_eq!(counters.dir_in.value(), 3);
        assert_eq!(counters.dir_out.value(), 1);

        let j = handler.window_json(0, false);
        assert_eq!(j["pcap"]["ipv4"], json!(3));
        assert_eq!(j["pcap"]["packet_sizes"]["p50"], json!(64.0));
    }

    #[test]
    fn device_stats_first_report_is_baseline() {
        let (handler, source) = handler_with_source();
        handler.start().unwrap();

        source.device_stats.emit(&DeviceStats { os_drops: 1000, if_drops: 50 });
        source.device_stats.emit(&DeviceStats { os_drops: 1007, if_drops: 50 });
        source.device_stats.emit(&DeviceStats { os_drops: 1010, if_drops: 53 });
        handler.stop().unwrap();

        let bucket = handler.metrics().bucket(0).unwrap();
        // Device stats are not events.
        assert_eq!(bucket.event_data().counts().num_events.value(), 0);

        let counters = bucket.counters();
        assert_eq!(counters.os_drops.value(), 10);
        assert_eq!(counters.if_drops.value(), 3);
    }

    #[test]
    fn device_stats_counter_reset_is_ignored() {
        let (handler, source) = handler_with_source();
        handler.start().unwrap();

        source.device_stats.emit(&DeviceStats { os_drops: 500, if_drops: 0 });
        // The device reset its counters; no negative delta is recorded, and
        // the new total becomes the next baseline.
        source.device_stats.emit(&DeviceStats { os_drops: 20, if_drops: 0 });
        source.device_stats.emit(&DeviceStats { os_drops: 25, if_drops: 0 });
        handler.stop().unwrap();

        let counters = handler.metrics().bucket(0).unwrap().counters();
        assert_eq!(counters.os_drops.value(), 5);
    }

    #[test]
    fn size_histogram_is_deep_gated() {
        let source = Arc::new(InputSource::new("pcap-test"));
        let config = PcapConfig {
            window: WindowConfig {
                num_periods: 1,
                deep_sample_rate: 0,
                ..WindowConfig::default()
            },
        };
        let handler = PcapStreamHandler::new("pcap-test", Arc::clone(&source), &config).unwrap();

        handler.start().unwrap();
        for _ in 0..10 {
            source.packets.emit(&packet(512, Direction::In, L3Proto::Ipv4));
        }
        handler.stop().unwrap();

        let bucket = handler.metrics().bucket(0).unwrap();
        assert_eq!(bucket.counters().ipv4.value(), 10);

        let j = handler.window_json(0, false);
        assert_eq!(j["pcap"]["ipv4"], json!(10));
        assert!(j["pcap"].get("packet_sizes").is_none());
    }

    #[test]
    fn rotation_resets_drop_baseline() {
        let (handler, source) = handler_with_source();
        handler.start().unwrap();

        source.device_stats.emit(&DeviceStats { os_drops: 100, if_drops: 0 });
        source.device_stats.emit(&DeviceStats { os_drops: 110, if_drops: 0 });
        handler.metrics().rotate();
        // First report into the fresh window is a baseline again.
        source.device_stats.emit(&DeviceStats { os_drops: 130, if_drops: 0 });
        source.device_stats.emit(&DeviceStats { os_drops: 131, if_drops: 0 });
        handler.stop().unwrap();

        assert_eq!(handler.metrics().bucket(1).unwrap().counters().os_drops.value(), 10);
        assert_eq!(handler.metrics().bucket(0).unwrap().counters().os_drops.value(), 1);
    }
}
