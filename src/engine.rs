use serde::Serialize;

use crate::baseline::Baseline;
use crate::config::{BlendWeights, HIGH_THRESHOLD, MEDIUM_THRESHOLD, STANDARD_PRICE};
use crate::model::{Confidence, Direction, GradeOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Evaluation {
    pub line: f64,
    pub expected: f64,
    pub deviation: f64,
    /// `None` when the stat has no usable variance.
    pub score: Option<f64>,
    pub confidence: Confidence,
    pub confidence_pct: f64,
    /// `None` is a no-play.
    pub direction: Option<Direction>,
}

impl Evaluation {
    pub fn is_play(&self) -> bool {
        self.direction.is_some()
    }

    pub fn abs_score(&self) -> f64 {
        self.score.map(f64::abs).unwrap_or(0.0)
    }
}

/// Turns a posted line and a baseline into a classified recommendation. Pure and deterministic.
///
/// The direction follows the deviation: a line posted below the expectation is an UNDER, a
/// line above it an OVER.
pub fn evaluate(line: f64, baseline: &Baseline, stddev: f64, weights: BlendWeights) -> Evaluation {
    let expected = weights.season * baseline.season_avg + weights.recent * baseline.recent_avg;
    let deviation = line - expected;

    let score = (stddev.is_finite() && stddev > 0.0 && deviation.is_finite())
        .then(|| deviation / stddev);
    let Some(z) = score else {
        return no_play(line, expected, deviation, None);
    };

    let confidence = classify(z);
    if confidence == Confidence::None {
        return no_play(line, expected, deviation, score);
    }
    let direction = if z < 0.0 {
        Direction::Under
    } else {
        Direction::Over
    };

    Evaluation {
        line,
        expected,
        deviation,
        score,
        confidence,
        confidence_pct: confidence_pct(score),
        direction: Some(direction),
    }
}

/// Tier by |score|; each tier includes its lower bound.
pub fn classify(score: f64) -> Confidence {
    let abs = score.abs();
    if abs >= HIGH_THRESHOLD {
        Confidence::High
    } else if abs >= MEDIUM_THRESHOLD {
        Confidence::Medium
    } else {
        Confidence::None
    }
}

/// 50% plus 20 points per unit of |score|, capped at 99.
pub fn confidence_pct(score: Option<f64>) -> f64 {
    match score {
        Some(z) if z.is_finite() => (50.0 + z.abs() * 20.0).min(99.0),
        _ => 50.0,
    }
}

/// Downgrades confidence for thin samples: under 3 games high becomes medium and medium is
/// dropped; under 5 games high becomes medium.
pub fn apply_sample_size_penalty(eval: Evaluation, games_played: u32) -> Evaluation {
    if !eval.is_play() || games_played == 0 {
        return eval;
    }
    let confidence = match (eval.confidence, games_played) {
        (Confidence::High, n) if n < 5 => Confidence::Medium,
        (Confidence::Medium, n) if n < 3 => Confidence::None,
        (c, _) => c,
    };
    if confidence == Confidence::None {
        return no_play(eval.line, eval.expected, eval.deviation, eval.score);
    }
    Evaluation { confidence, ..eval }
}

/// Profit of a flat `stake` at American `price`. A negative price risks |price| to win 100, a
/// positive one risks 100 to win `price`. Missing or out-of-range prices count as -110.
pub fn profit_for(price: Option<i32>, stake: f64, outcome: GradeOutcome) -> f64 {
    let price = price
        .filter(|p| (100..=100_000).contains(&p.unsigned_abs()))
        .unwrap_or(STANDARD_PRICE);
    match outcome {
        GradeOutcome::Win if price < 0 => stake * 100.0 / f64::from(-price),
        GradeOutcome::Win => stake * f64::from(price) / 100.0,
        GradeOutcome::Loss => -stake,
        GradeOutcome::Push => 0.0,
    }
}

fn no_play(line: f64, expected: f64, deviation: f64, score: Option<f64>) -> Evaluation {
    Evaluation {
        line,
        expected,
        deviation,
        score,
        confidence: Confidence::None,
        confidence_pct: confidence_pct(score),
        direction: None,
    }
}
