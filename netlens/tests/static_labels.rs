//! Static labels are process-global, so this lives in its own integration
//! test binary: installing them here cannot disturb the render assertions in
//! the unit tests.

use netlens::labels::{set_static_labels, LabelMap};
use netlens::metrics::{Counter, MetricId};

#[test]
fn static_labels_render_before_handler_labels() {
    let mut statics = LabelMap::new();
    statics.insert("site".to_string(), "lhr".to_string());
    statics.insert("region".to_string(), "eu".to_string());
    assert!(set_static_labels(statics));

    // Installation is first-wins.
    let mut override_attempt = LabelMap::new();
    override_attempt.insert("site".to_string(), "sfo".to_string());
    assert!(!set_static_labels(override_attempt));

    const TCP: MetricId = MetricId::new("flow", &["tcp"], "Count of TCP flow samples");
    let mut counter = Counter::new(TCP);
    counter.add(7);

    let mut extra = LabelMap::new();
    extra.insert("module".to_string(), "flow-default".to_string());

    let mut out = String::new();
    counter.to_prometheus(&mut out, &extra);
    assert_eq!(
        out,
        "# HELP flow_tcp Count of TCP flow samples\n\
         # TYPE flow_tcp gauge\n\
         flow_tcp{region=\"eu\",site=\"lhr\",module=\"flow-default\"} 7\n"
    );
}
