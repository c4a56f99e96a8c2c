//! IO throttle parameters
//!
//! Parses the bandwidth and IOPS limits a volume may carry and renders them
//! as cgroup v2 `io.max` lines.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Mutable parameter that clears every limit when set to `true`
pub const CLEAR_THROTTLING_PARAM: &str = "clear-throttling";

/// Prefix under which limits travel in the volume context and annotations
pub const THROTTLE_CONTEXT_PREFIX: &str = "csi.storage.k8s.io/throttle.";

/// Limit axes in the order `io.max` lists them
const AXES: [&str; 4] = ["rbps", "wbps", "riops", "wiops"];

// =============================================================================
// Throttle Spec
// =============================================================================

/// Per-axis limits; `None` means unlimited on that axis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleSpec {
    pub rbps: Option<u64>,
    pub wbps: Option<u64>,
    pub riops: Option<u64>,
    pub wiops: Option<u64>,
}

/// What to do with the limits of pods using a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleRequest {
    Set(ThrottleSpec),
    Clear,
}

impl ThrottleSpec {
    pub fn is_empty(&self) -> bool {
        self.values().iter().all(|(_, v)| v.is_none())
    }

    fn values(&self) -> [(&'static str, Option<u64>); 4] {
        [
            (AXES[0], self.rbps),
            (AXES[1], self.wbps),
            (AXES[2], self.riops),
            (AXES[3], self.wiops),
        ]
    }

    fn set(&mut self, axis: &str, value: u64) {
        match axis {
            "rbps" => self.rbps = Some(value),
            "wbps" => self.wbps = Some(value),
            "riops" => self.riops = Some(value),
            "wiops" => self.wiops = Some(value),
            _ => {}
        }
    }

    /// Validate mutable parameters.
    ///
    /// Returns `None` when the parameters carry no throttle keys. A
    /// `clear-throttling=true` entry wins over any limits present.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Option<ThrottleRequest>> {
        if params.is_empty() {
            return Ok(None);
        }
        if params.get(CLEAR_THROTTLING_PARAM).map(String::as_str) == Some("true") {
            return Ok(Some(ThrottleRequest::Clear));
        }

        let mut spec = ThrottleSpec::default();
        let mut found = false;
        for axis in AXES {
            if let Some(raw) = params.get(axis) {
                found = true;
                spec.set(axis, parse_quantity(raw, axis)?);
            }
        }
        Ok(found.then_some(ThrottleRequest::Set(spec)))
    }

    /// Limits recorded in a volume context; unparsable entries are skipped
    pub fn from_volume_context(context: &HashMap<String, String>) -> Option<ThrottleSpec> {
        let mut spec = ThrottleSpec::default();
        for axis in AXES {
            let key = format!("{}{}", THROTTLE_CONTEXT_PREFIX, axis);
            if let Some(value) = context.get(&key).and_then(|v| v.parse::<u64>().ok()) {
                spec.set(axis, value);
            }
        }
        (!spec.is_empty()).then_some(spec)
    }

    /// Context or annotation entries describing this spec
    pub fn to_context(&self) -> BTreeMap<String, String> {
        self.values()
            .into_iter()
            .filter_map(|(axis, v)| {
                v.map(|v| (format!("{}{}", THROTTLE_CONTEXT_PREFIX, axis), v.to_string()))
            })
            .collect()
    }

    /// `io.max` line for the device `maj_min`
    pub fn io_max_line(&self, maj_min: &str) -> String {
        let mut line = maj_min.to_string();
        for (axis, value) in self.values() {
            if let Some(v) = value {
                line.push_str(&format!(" {}={}", axis, v));
            }
        }
        line
    }
}

impl ThrottleRequest {
    /// `io.max` line applying this request to the device `maj_min`
    pub fn io_max_line(&self, maj_min: &str) -> String {
        match self {
            ThrottleRequest::Set(spec) => spec.io_max_line(maj_min),
            ThrottleRequest::Clear => clear_line(maj_min),
        }
    }
}

impl fmt::Display for ThrottleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .values()
            .iter()
            .filter_map(|(axis, v)| v.map(|v| format!("{}={}", axis, v)))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

/// `io.max` line lifting every limit on `maj_min`
pub fn clear_line(maj_min: &str) -> String {
    format!("{} rbps=max wbps=max riops=max wiops=max", maj_min)
}

// =============================================================================
// Quantity Parsing
// =============================================================================

/// Accept `K` for `k` and `g` for `G`; binary suffixes are left alone
fn normalize_suffix(value: &str) -> String {
    if value.ends_with('K') && !value.ends_with("Ki") {
        format!("{}k", &value[..value.len() - 1])
    } else if value.ends_with('g') && !value.ends_with("Gi") {
        format!("{}G", &value[..value.len() - 1])
    } else {
        value.to_string()
    }
}

fn multiplier(suffix: &str) -> Option<u128> {
    Some(match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        _ => return None,
    })
}

/// Parse a plain integer or a size-suffixed quantity (`50k`, `100Mi`, `1.5G`).
///
/// Fractional results round up to the next whole unit.
pub fn parse_quantity(value: &str, name: &str) -> Result<u64> {
    let invalid = || {
        Error::QuantityParse(format!(
            "invalid {} value {:?}: must be an integer or quantity such as 50k, 100Mi or 1G",
            name, value
        ))
    };
    if value.is_empty() {
        return Err(Error::QuantityParse(format!("{} parameter cannot be empty", name)));
    }
    let normalized = normalize_suffix(value.trim());
    if normalized.starts_with('-') {
        return Err(Error::QuantityParse(format!(
            "{} value {} cannot be negative",
            name, value
        )));
    }
    let number = normalized.trim_start_matches('+');

    let split = number
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(number.len());
    let (digits, suffix) = number.split_at(split);
    let mult = multiplier(suffix).ok_or_else(invalid)?;

    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    let whole: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let mut total = whole.checked_mul(mult).ok_or_else(invalid)?;
    if !frac.is_empty() {
        let scale = 10u128.checked_pow(frac.len() as u32).ok_or_else(invalid)?;
        let frac: u128 = frac.parse().map_err(|_| invalid())?;
        let scaled = frac.checked_mul(mult).ok_or_else(invalid)?;
        total = total.checked_add(scaled.div_ceil(scale)).ok_or_else(invalid)?;
    }
    u64::try_from(total).map_err(|_| invalid())
}
