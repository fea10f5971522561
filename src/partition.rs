//! Splitting oversized search queries into disjoint numeric sub-ranges.
//!
//! GitHub search never returns more than 1000 results per query, so a query
//! whose `total_count` exceeds that window is re-issued once per range of a
//! numeric facet (stars or file size). Ranges are half-open `[low, high)` plus a
//! final open-ended `[last, ∞)`, together covering `[0, ∞)` without overlap.

use std::fmt;

/// Numeric qualifier used to partition a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facet {
    Stars,
    Size,
}

impl Facet {
    pub fn qualifier(&self) -> &'static str {
        match self {
            Facet::Stars => "stars",
            Facet::Size => "size",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRange {
    /// `[low, high)`
    Bounded { low: u64, high: u64 },
    /// `[low, ∞)`
    Above { low: u64 },
}

impl PartitionRange {
    #[cfg(test)]
    pub fn low(&self) -> u64 {
        match self {
            PartitionRange::Bounded { low, .. } | PartitionRange::Above { low } => *low,
        }
    }

    #[cfg(test)]
    pub fn contains(&self, value: u64) -> bool {
        match *self {
            PartitionRange::Bounded { low, high } => value >= low && value < high,
            PartitionRange::Above { low } => value >= low,
        }
    }

    /// GitHub search qualifier for this range.
    ///
    /// GitHub's `a..b` is inclusive on both ends, so the exclusive upper bound
    /// is rendered as `high - 1`.
    pub fn to_qualifier(&self, facet: Facet) -> String {
        match *self {
            PartitionRange::Bounded { low, high } => {
                format!("{}:{}..{}", facet.qualifier(), low, high - 1)
            }
            PartitionRange::Above { low } => format!("{}:>={}", facet.qualifier(), low),
        }
    }

    /// This range with values below `floor` removed, or `None` when nothing
    /// is left
    pub fn clamp_low(&self, floor: u64) -> Option<PartitionRange> {
        match *self {
            PartitionRange::Bounded { high, .. } if high <= floor => None,
            PartitionRange::Bounded { low, high } => Some(PartitionRange::Bounded {
                low: low.max(floor),
                high,
            }),
            PartitionRange::Above { low } => Some(PartitionRange::Above { low: low.max(floor) }),
        }
    }
}

impl fmt::Display for PartitionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionRange::Bounded { low, high } => write!(f, "{}..{}", low, high),
            PartitionRange::Above { low } => write!(f, ">={}", low),
        }
    }
}

/// Build contiguous, non-overlapping ranges from a list of split points.
///
/// Unsorted or duplicated split points are normalised first. A leading
/// `[0, first)` range is added when the first split is above zero, so the
/// result always starts at 0 and ends with an open range.
pub fn generate_ranges(split_points: &[u64]) -> Vec<PartitionRange> {
    let mut points: Vec<u64> = split_points.to_vec();
    points.sort_unstable();
    points.dedup();

    if points.first().copied() != Some(0) {
        points.insert(0, 0);
    }

    let mut ranges: Vec<PartitionRange> = points
        .windows(2)
        .map(|w| PartitionRange::Bounded { low: w[0], high: w[1] })
        .collect();

    // points is never empty here
    let last = points[points.len() - 1];
    ranges.push(PartitionRange::Above { low: last });
    ranges
}

/// Ranges as in [`generate_ranges`], starting at `floor` instead of 0.
pub fn generate_ranges_from(floor: u64, split_points: &[u64]) -> Vec<PartitionRange> {
    generate_ranges(split_points)
        .iter()
        .filter_map(|range| range.clamp_low(floor))
        .collect()
}

/// Append the partition qualifier for `range` to `base_query`.
pub fn partitioned_query(base_query: &str, facet: Facet, range: &PartitionRange) -> String {
    format!("{} {}", base_query.trim_end(), range.to_qualifier(facet))
}
