// ============================================================
// Layer 3 — Batch Domain Type
// ============================================================
// A mini-batch as the training and validation loops see it:
// for every example, one feature vector per expert (depth,
// edges, segmentation, ...) and the answer text.

/// Feature vectors produced by the expert encoders for one example,
/// one row per expert.
pub type ExpertBundle = Vec<Vec<f32>>;

/// One mini-batch. `experts[i]` and `answers[i]` describe the same example.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub experts: Vec<ExpertBundle>,
    pub answers: Vec<String>,
}

impl Batch {
    pub fn new(experts: Vec<ExpertBundle>, answers: Vec<String>) -> Self {
        Self { experts, answers }
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }
}
