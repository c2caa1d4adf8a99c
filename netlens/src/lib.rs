//! netlens is a metrics pipeline for network observability agents. Protocol
//! handlers feed decoded traffic events into per-window buckets of streaming
//! sketches; a manager rotates the windows on a wall-clock cadence and serves
//! merged JSON and Prometheus snapshots to readers concurrent with ingest.
//!
//! The pipeline is built from four layers, leaves first:
//!
//! * [`metrics`] — the metric primitives: counters, rates, quantile
//!   summaries, cardinality sketches, heavy hitters, and histograms, each
//!   with ingest, merge, and emit contracts.
//! * [`bucket`] — the per-window aggregate: a domain-specific set of
//!   primitives plus the event counts and window timestamps common to every
//!   bucket.
//! * [`manager`] — the ring of windows: rotation, deep-sample gating, and
//!   the snapshot read paths.
//! * [`handler`] — the facade protocol handlers implement to bind an input
//!   stream to a manager and expose `window_json` / `window_prometheus`.
//!
//! Packet parsing, configuration loading, and HTTP serving are external
//! collaborators: the pipeline consumes decoded events through the typed
//! signals in [`event`] and renders into caller-provided buffers.

pub mod bucket;
pub mod config;
pub mod event;
pub mod formatting;
pub mod handler;
pub mod labels;
pub mod manager;
pub mod metrics;

mod common;

pub use common::{Error, State};
