// ============================================================
// Layer 5 — Binary Classification Metrics
// ============================================================
// Accuracy and AUROC over one epoch's flattened predictions.
//
//   binary_accuracy:  fraction correct; a prediction is positive
//                     when its score is strictly above 0.5.
//                     Scores outside [0, 1] are read as logits and
//                     squashed with a sigmoid first.
//   binary_auroc:     trapezoidal area under the ROC curve, with
//                     tied scores sharing one threshold. Returns
//                     0.0 when only one class is present.

use crate::domain::records::PredictionBuffer;
use crate::error::{Result, TrainError};

/// Decision threshold for binary accuracy.
pub const THRESHOLD: f32 = 0.5;

fn check_inputs(scores: &[f32], labels: &[bool]) -> Result<()> {
    if scores.is_empty() {
        return Err(TrainError::Metric("no predictions to score".into()));
    }
    if scores.len() != labels.len() {
        return Err(TrainError::Metric(format!(
            "{} scores but {} labels",
            scores.len(),
            labels.len()
        )));
    }
    if scores.iter().any(|s| s.is_nan()) {
        return Err(TrainError::Metric("NaN score in predictions".into()));
    }
    Ok(())
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Probabilities as-is, or sigmoid(logits) when any score leaves [0, 1].
pub fn normalize_scores(scores: &[f32]) -> Vec<f32> {
    if scores.iter().all(|s| (0.0..=1.0).contains(s)) {
        scores.to_vec()
    } else {
        scores.iter().map(|&s| sigmoid(s)).collect()
    }
}

pub fn binary_accuracy(scores: &[f32], labels: &[bool]) -> Result<f64> {
    check_inputs(scores, labels)?;
    let probs = normalize_scores(scores);
    let correct = probs
        .iter()
        .zip(labels)
        .filter(|(&p, &y)| (p > THRESHOLD) == y)
        .count();
    Ok(correct as f64 / labels.len() as f64)
}

pub fn binary_auroc(scores: &[f32], labels: &[bool]) -> Result<f64> {
    check_inputs(scores, labels)?;

    let positives = labels.iter().filter(|&&y| y).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        tracing::warn!(
            positives,
            negatives,
            "AUROC undefined with a single class present; reporting 0.0"
        );
        return Ok(0.0);
    }

    // Highest score first; the ROC curve is traced one distinct
    // threshold at a time.
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut area = 0.0f64;
    let (mut tp, mut fp) = (0usize, 0usize);
    let (mut prev_tp, mut prev_fp) = (0usize, 0usize);
    let mut i = 0;
    while i < order.len() {
        let threshold = scores[order[i]];
        while i < order.len() && scores[order[i]] == threshold {
            if labels[order[i]] {
                tp += 1;
            } else {
                fp += 1;
            }
            i += 1;
        }
        area += (fp - prev_fp) as f64 * (tp + prev_tp) as f64 / 2.0;
        prev_tp = tp;
        prev_fp = fp;
    }

    Ok(area / (positives as f64 * negatives as f64))
}

/// Accuracy and AUROC over a whole epoch buffer.
pub fn epoch_scores(buffer: &PredictionBuffer) -> Result<(f64, f64)> {
    let acc = binary_accuracy(buffer.scores(), buffer.labels())?;
    let auroc = binary_auroc(buffer.scores(), buffer.labels())?;
    Ok((acc, auroc))
}
