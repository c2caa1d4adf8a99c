//! Process-wide static labels.
//!
//! Agents typically stamp every exported metric with deployment identity
//! (site, region, instance). That mapping is fixed for the lifetime of the
//! process: it is installed once during initialization and read-only
//! thereafter, so renders can borrow it without synchronization.

use std::collections::BTreeMap;

use once_cell::sync::OnceCell;

/// An ordered label map. `BTreeMap` keeps rendering alphabetically stable.
pub type LabelMap = BTreeMap<String, String>;

static STATIC_LABELS: OnceCell<LabelMap> = OnceCell::new();

/// Installs the process-wide static labels.
///
/// The first caller wins; later calls return `false` and leave the installed
/// labels untouched.
pub fn set_static_labels(labels: LabelMap) -> bool {
    STATIC_LABELS.set(labels).is_ok()
}

/// The installed static labels, or an empty map if none were installed.
pub fn static_labels() -> &'static LabelMap {
    STATIC_LABELS.get_or_init(LabelMap::new)
}
