//! Typed event streams.
//!
//! An input stream (pcap device, flow socket, replay file) decodes traffic
//! and emits typed events through [`Signal`]s. Handlers connect closures at
//! `start()` and disconnect them by [`SlotId`] at `stop()`; the stream
//! outlives its handlers and never learns their types. There is no global
//! event bus.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;

/// Identity of a connected callback, used for disconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(u64);

type Callback<E> = Box<dyn Fn(&E) + Send + Sync>;

/// A multi-subscriber dispatch point for one event type.
///
/// Emission runs every connected callback on the emitting thread, in
/// connection order.
pub struct Signal<E> {
    slots: RwLock<Vec<(SlotId, Callback<E>)>>,
    next: AtomicU64,
}

impl<E> Default for Signal<E> {
    fn default() -> Self {
        Signal { slots: RwLock::new(Vec::new()), next: AtomicU64::new(0) }
    }
}

impl<E> Signal<E> {
    /// Creates a signal with no subscribers.
    pub fn new() -> Signal<E> {
        Signal::default()
    }

    /// Connects a callback, returning its identity for later disconnection.
    pub fn connect<F>(&self, callback: F) -> SlotId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SlotId(self.next.fetch_add(1, Ordering::Relaxed));
        self.slots.write().push((id, Box::new(callback)));
        id
    }

    /// Disconnects a callback. Returns whether the slot was still connected;
    /// once this returns, the callback will not be invoked again.
    pub fn disconnect(&self, id: SlotId) -> bool {
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|(slot, _)| *slot != id);
        slots.len() != before
    }

    /// Invokes every connected callback with `event`.
    pub fn emit(&self, event: &E) {
        for (_, callback) in self.slots.read().iter() {
            callback(event);
        }
    }

    /// Number of connected callbacks.
    pub fn connected(&self) -> usize {
        self.slots.read().len()
    }
}

/// Direction of a packet relative to the observed host or tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Toward the observed host.
    In,
    /// Away from the observed host.
    Out,
    /// Direction could not be determined.
    Unknown,
}

/// Network-layer protocol of a decoded packet or flow sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L3Proto {
    Ipv4,
    Ipv6,
    Other,
}

/// Transport-layer protocol of a decoded packet or flow sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Proto {
    Tcp,
    Udp,
    Other,
}

/// A decoded packet observation.
#[derive(Debug, Clone)]
pub struct PacketEvent {
    /// Wire length in bytes.
    pub size: u64,
    pub direction: Direction,
    pub l3: L3Proto,
    pub timestamp: SystemTime,
}

/// One flow sample decoded from a flow datagram.
#[derive(Debug, Clone)]
pub struct FlowSample {
    /// The exporter's sampling rate; byte and packet counts are multiplied
    /// by this when sample-rate scaling is enabled.
    pub sampling_rate: u64,
    pub byte_count: u64,
    pub packet_count: u64,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    /// Zero when the exporter did not report a port.
    pub src_port: u16,
    /// Zero when the exporter did not report a port.
    pub dst_port: u16,
    pub l3: L3Proto,
    pub l4: L4Proto,
}

/// One received flow datagram (sFlow sample packet, NetFlow export packet)
/// carrying its decoded flow samples.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub timestamp: SystemTime,
    pub samples: Vec<FlowSample>,
}

/// Transport a DNS transaction was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsTransport {
    Udp,
    Tcp,
}

/// A paired DNS query and response.
#[derive(Debug, Clone)]
pub struct DnsTransaction {
    pub timestamp: SystemTime,
    pub qname: String,
    /// Query type code (1 = A, 28 = AAAA, ...).
    pub qtype: u16,
    /// Response code (0 = NOERROR, 2 = SERVFAIL, 3 = NXDOMAIN, ...).
    pub rcode: u16,
    pub transport: DnsTransport,
    /// Whether the response never arrived within the stream's timeout.
    pub timed_out: bool,
    /// Time between query and response.
    pub xact_time: Duration,
}

/// Device-level statistics reported by a capture stream. Counters are
/// monotonic totals; the pipeline computes deltas against the previous
/// report.
#[derive(Debug, Clone, Copy)]
pub struct DeviceStats {
    pub os_drops: u64,
    pub if_drops: u64,
}

/// The bundle of typed signals an input stream exposes.
///
/// Handlers hold a non-owning `Arc` to the source and must disconnect their
/// slots before tearing down their managers.
#[derive(Default)]
pub struct InputSource {
    name: String,
    /// Decoded packets.
    pub packets: Signal<PacketEvent>,
    /// Decoded flow datagrams.
    pub flows: Signal<FlowRecord>,
    /// Paired DNS transactions.
    pub dns: Signal<DnsTransaction>,
    /// Periodic device statistics.
    pub device_stats: Signal<DeviceStats>,
}

impl InputSource {
    /// Creates a source with the given name and no subscribers.
    pub fn new(name: &str) -> InputSource {
        InputSource { name: name.to_string(), ..InputSource::default() }
    }

    /// The stream's configured name.
    pub fn name(&self) -> &str {
        &self.name
    }
}
