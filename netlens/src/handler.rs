//! The facade protocol handlers implement.
//!
//! A handler binds one input stream to one metrics manager: it connects
//! typed callbacks at `start()`, forwards each event into
//! `MetricsManager::process_event`, disconnects at `stop()` before the
//! manager is torn down, and exposes the manager's window read paths under
//! its schema key.

use serde_json::Value;

use crate::common::Error;

/// A protocol-specific stream handler.
///
/// Handlers declare their primitive set at construction by choosing their
/// bucket type; the manager stays generic over it. The `schema_key` prefixes
/// every Prometheus name the handler emits and wraps its JSON output.
pub trait StreamHandler {
    /// The schema key, e.g. `"flow"`, `"dns"`, `"pcap"`.
    fn schema_key(&self) -> &'static str;

    /// Connects stream callbacks and starts the manager.
    fn start(&self) -> Result<(), Error>;

    /// Disconnects stream callbacks, then stops the manager. Disconnection
    /// completes first so no callback can observe a stopped manager.
    fn stop(&self) -> Result<(), Error>;

    /// Renders one window as JSON under the schema key. `period` indexes the
    /// bucket ring (0 = live); with `merged`, the `period` most recent
    /// windows are merged first. An out-of-range `period` yields an empty
    /// object.
    fn window_json(&self, period: usize, merged: bool) -> Value;

    /// Renders the most recent complete window as Prometheus text.
    fn window_prometheus(&self, out: &mut String);
}
