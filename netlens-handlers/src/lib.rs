//! Protocol handlers for the netlens metrics pipeline.
//!
//! A handler owns a [`netlens::manager::MetricsManager`] over its own bucket
//! type and connects to the typed signals of one
//! [`netlens::event::InputSource`]. Handler kinds are statically registered:
//! the orchestrating layer constructs them by name with
//! `(name, stream, config)` and drives them through the
//! [`netlens::handler::StreamHandler`] facade.

pub mod dns;
pub mod flow;
pub mod pcap;

pub use dns::{DnsConfig, DnsStreamHandler};
pub use flow::{FlowConfig, FlowStreamHandler};
pub use pcap::{PcapConfig, PcapStreamHandler};
