//! Configuration recognized by the pipeline core.
//!
//! The YAML/TOML loading layer is an external collaborator; it hands the
//! core deserialized structs which are validated here before `start()`.

use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;

use crate::common::Error;

/// Upper bound on retained finalized windows.
pub const MAX_PERIODS: u64 = 10;

/// Windowing parameters shared by every handler.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WindowConfig {
    /// Number of finalized windows retained, in `[1, 10]`.
    pub num_periods: u64,
    /// Percentage of events that update the high-cost primitives
    /// (cardinality, top-K, payload sizes), in `[0, 100]`.
    pub deep_sample_rate: u64,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig { num_periods: 5, deep_sample_rate: 100, window_secs: 60 }
    }
}

impl WindowConfig {
    /// Validates ranges; violations prevent `start()`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.num_periods < 1 || self.num_periods > MAX_PERIODS {
            return Err(Error::Config {
                field: "num_periods",
                reason: format!("{} is outside [1, {MAX_PERIODS}]", self.num_periods),
            });
        }
        if self.deep_sample_rate > 100 {
            return Err(Error::Config {
                field: "deep_sample_rate",
                reason: format!("{} is outside [0, 100]", self.deep_sample_rate),
            });
        }
        if self.window_secs == 0 {
            return Err(Error::Config {
                field: "window_secs",
                reason: "window length must be at least one second".to_string(),
            });
        }
        Ok(())
    }

    /// The window length as a duration.
    pub fn window_duration(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// The `only_hosts` CIDR filter.
///
/// When non-empty, an event is admitted only if its source or destination
/// address falls inside one of the networks; everything else is counted as
/// filtered and skipped for all other primitives.
#[derive(Clone, Debug, Default)]
pub struct HostFilter {
    nets: Vec<IpNet>,
}

impl HostFilter {
    /// Parses a list of CIDR strings. An unparsable entry is a
    /// configuration error.
    pub fn parse(specs: &[String]) -> Result<HostFilter, Error> {
        let mut nets = Vec::with_capacity(specs.len());
        for spec in specs {
            let net: IpNet = spec.parse().map_err(|e| Error::Config {
                field: "only_hosts",
                reason: format!("`{spec}` is not a valid CIDR: {e}"),
            })?;
            nets.push(net);
        }
        Ok(HostFilter { nets })
    }

    /// Whether the filter admits everything.
    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    /// Whether `addr` falls inside any configured network.
    pub fn matches(&self, addr: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&addr))
    }

    /// Whether an event with the given endpoints passes the filter.
    pub fn admits(&self, src: IpAddr, dst: IpAddr) -> bool {
        self.is_empty() || self.matches(src) || self.matches(dst)
    }
}
