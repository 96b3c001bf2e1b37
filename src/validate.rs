//! Structural checks on parsed rating and ranking vectors.
//!
//! Every check is order-independent, so vectors can be validated in the order
//! the model answered them, before any de-shuffling.

use std::collections::BTreeSet;
use std::fmt;

/// Q-method thresholds: the mean may sit at most this far from the median...
pub const QUASI_NORMAL_MAX_MEAN_MEDIAN_GAP: f64 = 10.0;
/// ...and the interquartile range must stay below this.
pub const QUASI_NORMAL_MAX_IQR: f64 = 30.0;

/// Expected shape of one completion for a survey.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurveyConstraints {
    pub considerations: usize,
    pub policies: usize,
    pub scale_max: u32,
    pub q_method: bool,
}

/// A single reason a completion was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    RatingCount { expected: usize, got: usize },
    RankCount { expected: usize, got: usize },
    RatingOutOfRange { position: usize, value: u32, scale_max: u32 },
    RankOutOfRange { position: usize, value: u32, max: usize },
    DuplicateRank { value: u32 },
    NotQuasiNormal(DistributionStats),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::RatingCount { expected, got } => {
                write!(f, "expected {expected} consideration ratings, got {got}")
            }
            Violation::RankCount { expected, got } => {
                write!(f, "expected {expected} policy ranks, got {got}")
            }
            Violation::RatingOutOfRange {
                position,
                value,
                scale_max,
            } => write!(
                f,
                "rating {value} at position {position} outside 1..={scale_max}"
            ),
            Violation::RankOutOfRange {
                position,
                value,
                max,
            } => write!(f, "rank {value} at position {position} outside 1..={max}"),
            Violation::DuplicateRank { value } => write!(f, "rank {value} assigned more than once"),
            Violation::NotQuasiNormal(stats) => write!(
                f,
                "ratings not quasi-normal (mean {:.2}, median {:.2}, iqr {:.2})",
                stats.mean, stats.median, stats.iqr
            ),
        }
    }
}

/// Outcome of validating one completion.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Validation {
    pub violations: Vec<Violation>,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// All reasons joined for a single log line.
    pub fn reasons(&self) -> String {
        self.violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub fn validate(ratings: &[u32], ranks: &[u32], constraints: &SurveyConstraints) -> Validation {
    let mut violations = Vec::new();

    if ratings.len() != constraints.considerations {
        violations.push(Violation::RatingCount {
            expected: constraints.considerations,
            got: ratings.len(),
        });
    }
    if ranks.len() != constraints.policies {
        violations.push(Violation::RankCount {
            expected: constraints.policies,
            got: ranks.len(),
        });
    }

    for (position, &value) in ratings.iter().enumerate() {
        if value < 1 || value > constraints.scale_max {
            violations.push(Violation::RatingOutOfRange {
                position,
                value,
                scale_max: constraints.scale_max,
            });
        }
    }

    let max_rank = ranks.len();
    for (position, &value) in ranks.iter().enumerate() {
        if value < 1 || value as usize > max_rank {
            violations.push(Violation::RankOutOfRange {
                position,
                value,
                max: max_rank,
            });
        }
    }

    let mut seen = BTreeSet::new();
    let mut reported = BTreeSet::new();
    for &value in ranks {
        if !seen.insert(value) && reported.insert(value) {
            violations.push(Violation::DuplicateRank { value });
        }
    }

    if constraints.q_method {
        match DistributionStats::of(ratings) {
            Some(stats) if stats.is_quasi_normal() => {}
            Some(stats) => violations.push(Violation::NotQuasiNormal(stats)),
            None => violations.push(Violation::NotQuasiNormal(DistributionStats::default())),
        }
    }

    Validation { violations }
}

// =============================================================================
// Quasi-normal shape
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DistributionStats {
    pub mean: f64,
    pub median: f64,
    pub q1: f64,
    pub q3: f64,
    pub iqr: f64,
}

impl DistributionStats {
    /// `None` for an empty sample.
    pub fn of(values: &[u32]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = values.iter().map(|&v| f64::from(v)).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
        let median = percentile(&sorted, 50.0);
        let q1 = percentile(&sorted, 25.0);
        let q3 = percentile(&sorted, 75.0);
        Some(Self {
            mean,
            median,
            q1,
            q3,
            iqr: q3 - q1,
        })
    }

    pub fn is_quasi_normal(&self) -> bool {
        (self.mean - self.median).abs() < QUASI_NORMAL_MAX_MEAN_MEDIAN_GAP
            && self.iqr < QUASI_NORMAL_MAX_IQR
    }
}

/// Shape check used for q-method surveys. An empty vector fails.
pub fn quasi_normal(values: &[u32]) -> bool {
    DistributionStats::of(values).is_some_and(|s| s.is_quasi_normal())
}

/// Percentile of a sorted, non-empty sample using linear interpolation between
/// the closest ranks (`rank = p/100 * (n - 1)`).
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}
