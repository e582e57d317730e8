//! Parsing of Kubernetes quantities into plain numbers for capacity accounting.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Suffixes and what they multiply by. Binary suffixes come first so `Gi` is not read as `G`.
const SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("k", 1e3),
    ("K", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("m", 1e-3),
];

/// Splits a quantity into its number and the multiplier of its suffix.
fn split(raw: &str) -> (&str, f64) {
    SUFFIXES
        .iter()
        .find_map(|(suffix, multiplier)| {
            raw.strip_suffix(suffix)
                .filter(|n| n.ends_with(|c: char| c.is_ascii_digit() || c == '.'))
                .map(|n| (n, *multiplier))
        })
        .unwrap_or((raw, 1.0))
}

/// Converts a quantity into its base value (bytes, cores or devices). Malformed quantities
/// count as zero, so one bad object never spoils the totals.
pub(crate) fn value(q: &Quantity) -> f64 {
    let (number, multiplier) = split(q.0.trim());
    number
        .parse::<f64>()
        .map(|n| n * multiplier)
        .unwrap_or_default()
}
