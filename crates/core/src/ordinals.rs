//! Ordinal windows and reserved ordinals.
//!
//! A workload with `n` replicas occupies the first `n` non-reserved ordinals at or
//! after its start ordinal. The window `[start, end)` is the smallest half-open
//! range holding exactly those `n` slots.

#![forbid(unsafe_code)]

use std::ops::RangeInclusive;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::warn;

use crate::Workload;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrdinalError {
    #[error("reserved ordinal {0} is negative")]
    Negative(i64),
    #[error("reserved ordinal spec {0:?} is neither an integer nor an a-b range")]
    Malformed(String),
    #[error("reserved ordinal range {0}-{1} is reversed")]
    Reversed(i32, i32),
}

/// One entry of `spec.reserveOrdinals`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservedSpec {
    Single(i32),
    /// Inclusive on both ends.
    Range(i32, i32),
}

impl ReservedSpec {
    pub fn parse(v: &IntOrString) -> Result<Self, OrdinalError> {
        match v {
            IntOrString::Int(n) if *n < 0 => Err(OrdinalError::Negative(*n as i64)),
            IntOrString::Int(n) => Ok(ReservedSpec::Single(*n)),
            IntOrString::String(s) => s.parse(),
        }
    }

    pub fn ordinals(&self) -> RangeInclusive<i32> {
        match *self {
            ReservedSpec::Single(n) => n..=n,
            ReservedSpec::Range(a, b) => a..=b,
        }
    }
}

fn parse_ordinal(s: &str, whole: &str) -> Result<i32, OrdinalError> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(OrdinalError::Malformed(whole.to_string()));
    }
    s.parse::<i32>().map_err(|_| OrdinalError::Malformed(whole.to_string()))
}

impl FromStr for ReservedSpec {
    type Err = OrdinalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if let Some(rest) = t.strip_prefix('-') {
            // "-3" is a negative single, not a range with an empty start
            return match rest.trim().parse::<i64>() {
                Ok(n) => Err(OrdinalError::Negative(-n)),
                Err(_) => Err(OrdinalError::Malformed(s.to_string())),
            };
        }
        match t.split_once('-') {
            None => Ok(ReservedSpec::Single(parse_ordinal(t, s)?)),
            Some((a, b)) => {
                let (a, b) = (parse_ordinal(a, s)?, parse_ordinal(b, s)?);
                if a > b {
                    return Err(OrdinalError::Reversed(a, b));
                }
                Ok(ReservedSpec::Range(a, b))
            }
        }
    }
}

/// Union of reserved ordinals, kept as sorted, disjoint, non-adjacent inclusive ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservedSet {
    ranges: Vec<(i32, i32)>,
}

impl ReservedSet {
    pub fn from_specs<I: IntoIterator<Item = ReservedSpec>>(specs: I) -> Self {
        let mut ranges: Vec<(i32, i32)> = specs
            .into_iter()
            .map(|s| {
                let r = s.ordinals();
                (*r.start(), *r.end())
            })
            .collect();
        ranges.sort_unstable();
        let mut merged: Vec<(i32, i32)> = Vec::with_capacity(ranges.len());
        for (a, b) in ranges {
            match merged.last_mut() {
                Some(last) if a <= last.1.saturating_add(1) => last.1 = last.1.max(b),
                _ => merged.push((a, b)),
            }
        }
        Self { ranges: merged }
    }

    /// Parse `spec.reserveOrdinals`. Invalid entries are logged and skipped.
    pub fn parse(specs: &[IntOrString]) -> Self {
        let parsed = specs.iter().filter_map(|v| match ReservedSpec::parse(v) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(spec = ?v, error = %e, "ignoring invalid reserved ordinal");
                None
            }
        });
        Self::from_specs(parsed)
    }

    pub fn is_empty(&self) -> bool { self.ranges.is_empty() }

    pub fn contains(&self, ordinal: i32) -> bool { self.range_of(ordinal).is_some() }

    /// The merged range holding `ordinal`, if reserved.
    fn range_of(&self, ordinal: i32) -> Option<(i32, i32)> {
        let idx = self.ranges.partition_point(|&(_, b)| b < ordinal);
        self.ranges.get(idx).copied().filter(|&(a, _)| a <= ordinal)
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.ranges.iter().flat_map(|&(a, b)| a..=b)
    }
}

/// Half-open ordinal window plus the reserved ordinals skipped inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrdinalWindow {
    pub start: i32,
    pub end: i32,
    pub reserved: ReservedSet,
}

impl OrdinalWindow {
    /// Walk upward from `start` until `replicas` non-reserved slots are counted.
    ///
    /// `end` never exceeds `i32::MAX`; a window that runs out of ordinals first is
    /// clamped there and holds fewer than `replicas` live slots.
    pub fn compute(replicas: i32, start: i32, reserved: ReservedSet) -> Self {
        let limit = i64::from(i32::MAX);
        let mut end = i64::from(start);
        let mut counted = 0;
        while counted < replicas {
            if end >= limit {
                warn!(start, replicas, counted, "ordinal window exhausted; clamping at i32::MAX");
                break;
            }
            match reserved.range_of(end as i32) {
                Some((_, last)) => end = i64::from(last) + 1,
                None => {
                    counted += 1;
                    end += 1;
                }
            }
        }
        Self { start, end: end.min(limit) as i32, reserved }
    }

    pub fn is_reserved(&self, ordinal: i32) -> bool { self.reserved.contains(ordinal) }

    /// Whether a replica should currently exist at `ordinal`.
    pub fn is_live(&self, ordinal: i32) -> bool {
        ordinal >= self.start && ordinal < self.end && !self.reserved.contains(ordinal)
    }

    pub fn live_ordinals(&self) -> impl Iterator<Item = i32> + '_ {
        (self.start..self.end).filter(|o| !self.reserved.contains(*o))
    }
}

/// Compute the live window of `set`.
pub fn compute_replica_range(set: &Workload) -> OrdinalWindow {
    let reserved = ReservedSet::parse(&set.spec.reserve_ordinals);
    OrdinalWindow::compute(set.replicas(), set.start_ordinal(), reserved)
}
