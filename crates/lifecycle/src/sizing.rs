//! Conversion of user-facing resource amounts into absolute quantities.
//!
//! All memory and storage amounts flow through [`to_megabytes`] so every component agrees on the
//! same absolute value. The result is rounded to two decimal places before it is scaled to
//! bytes.

use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const MIB_IN_MB: f64 = 1.048576;
const GIB_IN_MB: f64 = 1073.741824;

/// The units memory and storage may be requested in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeUnit {
    /// Megabytes. Also used for anything unrecognized.
    MB,
    /// Mebibytes
    MiB,
    /// Gigabytes
    GB,
    /// Gibibytes
    GiB,
    /// Terabytes
    TB,
    /// Tebibytes
    TiB,
}

impl Default for SizeUnit {
    fn default() -> Self {
        SizeUnit::MB
    }
}

impl FromStr for SizeUnit {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "MiB" => SizeUnit::MiB,
            "GB" => SizeUnit::GB,
            "GiB" => SizeUnit::GiB,
            "TB" => SizeUnit::TB,
            "TiB" => SizeUnit::TiB,
            _ => SizeUnit::MB,
        })
    }
}

impl SizeUnit {
    /// The number of megabytes in one of this unit.
    pub const fn megabytes(&self) -> f64 {
        match self {
            Self::MB => 1.0,
            Self::MiB => MIB_IN_MB,
            Self::GB => 1000.0,
            Self::GiB => GIB_IN_MB,
            Self::TB => 1000.0 * 1000.0,
            Self::TiB => GIB_IN_MB * GIB_IN_MB,
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Converts an amount into megabytes, rounded to two decimal places.
pub fn to_megabytes(amount: f64, unit: SizeUnit) -> f64 {
    match unit {
        SizeUnit::MB => amount,
        other => round2(amount * other.megabytes()),
    }
}

/// Converts a megabyte amount back into the given unit.
pub fn from_megabytes(megabytes: f64, unit: SizeUnit) -> f64 {
    megabytes / unit.megabytes()
}

/// Converts an amount into bytes, going through the rounded megabyte value.
pub fn to_bytes(amount: f64, unit: SizeUnit) -> i64 {
    (to_megabytes(amount, unit) * 1024.0 * 1024.0) as i64
}

/// Converts a fractional CPU count into millicores, truncating.
pub fn milli_cpu(cpus: f64) -> i64 {
    (cpus * 1000.0) as i64
}

/// Parses a volume size given either as a raw byte count or with a unit suffix such as `10GiB`
/// or `10Gi`. Anything unparsable is treated as zero, meaning no external volume.
pub fn parse_volume_size(raw: &str) -> i64 {
    let raw = raw.trim();
    if let Ok(bytes) = raw.parse::<i64>() {
        return bytes.max(0);
    }
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let number: f64 = match number.parse() {
        Ok(n) => n,
        Err(_) => return 0,
    };
    let multiplier: f64 = match suffix {
        "K" | "KB" => 1e3,
        "M" | "MB" => 1e6,
        "G" | "GB" => 1e9,
        "T" | "TB" => 1e12,
        "Ki" | "KiB" => 1024.0,
        "Mi" | "MiB" => 1024.0 * 1024.0,
        "Gi" | "GiB" => 1024.0 * 1024.0 * 1024.0,
        "Ti" | "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return 0,
    };
    (number * multiplier) as i64
}

/// A CPU quantity expressed in millicores.
pub fn cpu_quantity(milli: i64) -> Quantity {
    Quantity(format!("{}m", milli))
}

/// A plain byte quantity.
pub fn byte_quantity(bytes: i64) -> Quantity {
    Quantity(bytes.to_string())
}

/// A quantity for a count of whole devices.
pub fn count_quantity(count: i64) -> Quantity {
    Quantity(count.to_string())
}
