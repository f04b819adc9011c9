//! Pure aggregation arithmetic: judge votes into criterion results, criterion
//! scores into case scores, iteration outcomes into a final verdict.
//!
//! Nothing here performs I/O, so every rule is testable from plain numbers.

use serde::Serialize;

/// Slack for thresholds written as rounded percentages: wide enough that
/// 2/3 meets 0.67, narrow enough that it misses 0.68.
const THRESHOLD_SLACK: f64 = 0.0034;

/// `fraction >= threshold`, allowing for thresholds that round a third.
/// A threshold of 1.0 or more is unanimous and gets no slack.
pub fn meets_threshold(fraction: f64, threshold: f64) -> bool {
    if threshold >= 1.0 {
        return fraction >= 1.0;
    }
    fraction + THRESHOLD_SLACK >= threshold
}

/// One backend's weighted vote on a criterion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Vote {
    pub backend: String,
    pub satisfied: bool,
    pub weight: f64,
}

impl Vote {
    pub fn new(backend: impl Into<String>, satisfied: bool, weight: f64) -> Self {
        Self {
            backend: backend.into(),
            satisfied,
            weight,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tally {
    pub satisfied_weight: f64,
    pub total_weight: f64,
}

impl Tally {
    /// `None` when nobody voted.
    pub fn fraction(&self) -> Option<f64> {
        (self.total_weight > 0.0).then(|| self.satisfied_weight / self.total_weight)
    }
}

/// Sums votes in backend-key order, so the float result does not depend on
/// the order calls completed in.
pub fn tally(votes: &[Vote]) -> Tally {
    let mut ordered: Vec<&Vote> = votes.iter().collect();
    ordered.sort_by(|a, b| a.backend.cmp(&b.backend).then(a.satisfied.cmp(&b.satisfied)));

    ordered.into_iter().fold(
        Tally {
            satisfied_weight: 0.0,
            total_weight: 0.0,
        },
        |mut tally, vote| {
            tally.total_weight += vote.weight;
            if vote.satisfied {
                tally.satisfied_weight += vote.weight;
            }
            tally
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CriterionAggregate {
    pub passed: bool,
    pub score: f64,
    /// No backend produced a vote; fails closed.
    pub inconclusive: bool,
}

pub fn aggregate_criterion(votes: &[Vote], consensus_threshold: f64) -> CriterionAggregate {
    match tally(votes).fraction() {
        Some(score) => CriterionAggregate {
            passed: meets_threshold(score, consensus_threshold),
            score,
            inconclusive: false,
        },
        None => CriterionAggregate {
            passed: false,
            score: 0.0,
            inconclusive: true,
        },
    }
}

/// `Σ(weight × score) / Σ(weight)` over `(weight, score)` pairs. An empty
/// case scores 1.0; criteria with no positive total weight score 0.0.
pub fn weighted_case_score(items: &[(f64, f64)]) -> f64 {
    if items.is_empty() {
        return 1.0;
    }
    let total: f64 = items.iter().map(|(weight, _)| weight).sum();
    if total <= 0.0 {
        return 0.0;
    }
    items.iter().map(|(weight, score)| weight * score).sum::<f64>() / total
}

/// Returns whether enough iterations passed, plus the pass rate.
pub fn iteration_consensus(passes: &[bool], threshold: f64) -> (bool, f64) {
    if passes.is_empty() {
        return (true, 1.0);
    }
    let rate = passes.iter().filter(|passed| **passed).count() as f64 / passes.len() as f64;
    (meets_threshold(rate, threshold), rate)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Spread of case scores across iterations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreDistribution {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl ScoreDistribution {
    pub fn from_scores(scores: &[f64]) -> Option<Self> {
        let mean = mean(scores)?;
        let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self { min, max, mean })
    }
}
