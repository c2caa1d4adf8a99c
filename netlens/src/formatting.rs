//! Helpers for rendering metrics in the Prometheus exposition format 0.0.4.

use std::fmt::Display;

use crate::labels::LabelMap;

/// Writes a help (description) line in the Prometheus [exposition format].
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn write_help_line(buffer: &mut String, name: &str, desc: &str) {
    buffer.push_str("# HELP ");
    buffer.push_str(name);
    buffer.push(' ');
    buffer.push_str(&sanitize_description(desc));
    buffer.push('\n');
}

/// Writes a metric type line in the Prometheus [exposition format].
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn write_type_line(buffer: &mut String, name: &str, metric_type: &str) {
    buffer.push_str("# TYPE ");
    buffer.push_str(name);
    buffer.push(' ');
    buffer.push_str(metric_type);
    buffer.push('\n');
}

/// Writes a single sample line.
///
/// `suffix` is appended to `name` with an underscore, which is how the
/// `_sum`/`_count` lines of a summary are produced. Label groups render in
/// the order given (static labels first, handler labels second), each
/// alphabetically stable; `sample_label` renders last and typically carries
/// the data-point-specific label such as `quantile` or a top-K item key.
pub fn write_metric_line<T, V>(
    buffer: &mut String,
    name: &str,
    suffix: Option<&'static str>,
    label_groups: &[&LabelMap],
    sample_label: Option<(&'static str, T)>,
    value: V,
) where
    T: Display,
    V: Display,
{
    buffer.push_str(name);
    if let Some(suffix) = suffix {
        buffer.push('_');
        buffer.push_str(suffix);
    }

    let has_labels = label_groups.iter().any(|g| !g.is_empty());
    if has_labels || sample_label.is_some() {
        buffer.push('{');

        let mut first = true;
        for group in label_groups {
            for (key, value) in group.iter() {
                if first {
                    first = false;
                } else {
                    buffer.push(',');
                }
                buffer.push_str(&sanitize_label_key(key));
                buffer.push_str("=\"");
                buffer.push_str(&sanitize_label_value(value));
                buffer.push('"');
            }
        }

        if let Some((key, value)) = sample_label {
            if !first {
                buffer.push(',');
            }
            buffer.push_str(key);
            buffer.push_str("=\"");
            buffer.push_str(&sanitize_label_value(&value.to_string()));
            buffer.push('"');
        }

        buffer.push('}');
    }

    buffer.push(' ');
    buffer.push_str(&value.to_string());
    buffer.push('\n');
}

/// Sanitizes a metric name to be valid under the Prometheus [data model].
///
/// [data model]: https://prometheus.io/docs/concepts/data_model/#metric-names-and-labels
pub fn sanitize_metric_name(name: &str) -> String {
    // The first character must be [a-zA-Z_:], and all subsequent characters
    // must be [a-zA-Z0-9_:].
    let mut out = String::with_capacity(name.len());
    let mut is_invalid: fn(char) -> bool = invalid_metric_name_start_character;
    for c in name.chars() {
        if is_invalid(c) {
            out.push('_');
        } else {
            out.push(c);
        }
        is_invalid = invalid_metric_name_character;
    }
    out
}

/// Sanitizes a label key to be valid under the Prometheus [data model].
///
/// [data model]: https://prometheus.io/docs/concepts/data_model/#metric-names-and-labels
pub fn sanitize_label_key(key: &str) -> String {
    // The first character must be [a-zA-Z_], and all subsequent characters
    // must be [a-zA-Z0-9_].
    let mut out = String::with_capacity(key.len());
    let mut is_invalid: fn(char) -> bool = invalid_label_key_start_character;
    for c in key.chars() {
        if is_invalid(c) {
            out.push('_');
        } else {
            out.push(c);
        }
        is_invalid = invalid_label_key_character;
    }
    out
}

/// Sanitizes a label value: backslashes, double quotes, and line feeds are
/// escaped; everything else passes through.
pub fn sanitize_label_value(value: &str) -> String {
    escape_value(value, false)
}

/// Sanitizes a help-line description: backslashes and line feeds are escaped;
/// double quotes are legal in descriptions and pass through.
pub fn sanitize_description(value: &str) -> String {
    escape_value(value, true)
}

fn escape_value(value: &str, is_desc: bool) -> String {
    let mut sanitized = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\n' => sanitized.push_str("\\n"),
            '\\' => sanitized.push_str("\\\\"),
            '"' if !is_desc => sanitized.push_str("\\\""),
            c => sanitized.push(c),
        }
    }
    sanitized
}

#[inline]
fn invalid_metric_name_start_character(c: char) -> bool {
    !(c.is_ascii_alphabetic() || c == '_' || c == ':')
}

#[inline]
fn invalid_metric_name_character(c: char) -> bool {
    !(c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

#[inline]
fn invalid_label_key_start_character(c: char) -> bool {
    !(c.is_ascii_alphabetic() || c == '_')
}

#[inline]
fn invalid_label_key_character(c: char) -> bool {
    !(c.is_ascii_alphanumeric() || c == '_')
}
