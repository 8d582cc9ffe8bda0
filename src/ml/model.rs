use ndarray::{Array1, Array2, ArrayD, Axis, IxDyn};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::domain::batch::{Batch, ExpertBundle};
use crate::domain::params::ParamSet;
use crate::domain::traits::{
    ClassificationModel, InferenceOptions, ModelMode, RankOutput, TrainOutput,
};
use crate::error::{Result, TrainError};

pub const POS_EMBED_KEY: &str = "expert_encoder.positional_embedding";
pub const WEIGHT_KEY:    &str = "classifier.weight";
pub const BIAS_KEY:      &str = "classifier.bias";

const INIT_RANGE: f32 = 0.02;
const PROB_EPS:   f32 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpertFusionConfig {
    pub num_experts: usize,
    pub expert_dim:  usize,
}

impl ExpertFusionConfig {
    pub fn new(num_experts: usize, expert_dim: usize) -> Self {
        Self { num_experts, expert_dim }
    }

    pub fn init(&self, seed: u64) -> ExpertFusionClassifier {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut uniform = |shape: &[usize]| {
            ArrayD::from_shape_fn(IxDyn(shape), |_| rng.gen_range(-INIT_RANGE..INIT_RANGE))
        };

        let mut params = ParamSet::new();
        params.insert(POS_EMBED_KEY, uniform(&[self.num_experts, self.expert_dim]));
        params.insert(WEIGHT_KEY,    uniform(&[self.expert_dim]));
        params.insert(BIAS_KEY,      ArrayD::zeros(IxDyn(&[1])));

        ExpertFusionClassifier {
            config: *self,
            params,
            mode:   ModelMode::Train,
            cache:  None,
        }
    }
}

/// Activations from the last training forward pass.
#[derive(Debug, Clone)]
struct ForwardCache {
    /// Pooled representation per example, [batch, dim].
    pooled:        Array2<f32>,
    /// Number of expert rows each example contributed.
    expert_counts: Vec<usize>,
    /// dLoss/dLogit per example, already divided by the batch size.
    dlogits:       Vec<f32>,
}

/// Mean-pools positionally embedded expert features and applies a
/// single linear head.
///
///   h = mean_j (x_j + P_j)
///   z = w · h + b
///   p = sigmoid(z)
///
/// Training uses binary cross-entropy on p. Ranked inference scores
/// every candidate answer, keeps the top `k_test` and reports the
/// softmax mass on the positive answer.
#[derive(Debug, Clone)]
pub struct ExpertFusionClassifier {
    config: ExpertFusionConfig,
    params: ParamSet,
    mode:   ModelMode,
    cache:  Option<ForwardCache>,
}

impl ExpertFusionClassifier {
    fn param(&self, name: &str) -> Result<&ArrayD<f32>> {
        self.params
            .get(name)
            .ok_or_else(|| TrainError::Model(format!("parameter '{name}' is not registered")))
    }

    fn pool(&self, bundle: &ExpertBundle) -> Result<Array1<f32>> {
        let (num_experts, dim) = (self.config.num_experts, self.config.expert_dim);
        if bundle.is_empty() || bundle.len() > num_experts {
            return Err(TrainError::Shape(format!(
                "example has {} expert rows, expected 1..={num_experts}",
                bundle.len()
            )));
        }
        let pos = self.param(POS_EMBED_KEY)?;

        let mut pooled = Array1::<f32>::zeros(dim);
        for (j, row) in bundle.iter().enumerate() {
            if row.len() != dim {
                return Err(TrainError::Shape(format!(
                    "expert row {j} has width {}, expected {dim}",
                    row.len()
                )));
            }
            for (d, &x) in row.iter().enumerate() {
                pooled[d] += x + pos[[j, d]];
            }
        }
        pooled /= bundle.len() as f32;
        Ok(pooled)
    }

    fn logits(&self, batch: &Batch) -> Result<(Array2<f32>, Vec<f32>)> {
        let weight = self.param(WEIGHT_KEY)?;
        let bias = self.param(BIAS_KEY)?[[0]];

        let mut pooled = Array2::<f32>::zeros((batch.len(), self.config.expert_dim));
        let mut logits = Vec::with_capacity(batch.len());
        for (i, bundle) in batch.experts.iter().enumerate() {
            let h = self.pool(bundle)?;
            let z = h.iter().zip(weight.iter()).map(|(a, b)| a * b).sum::<f32>() + bias;
            pooled.row_mut(i).assign(&h);
            logits.push(z);
        }
        Ok((pooled, logits))
    }
}

// ─── Targets ─────────────────────────────────────────────────────────────────

fn check_batch(batch: &Batch) -> Result<()> {
    if batch.is_empty() {
        return Err(TrainError::Model("empty batch".into()));
    }
    if batch.experts.len() != batch.answers.len() {
        return Err(TrainError::Model(format!(
            "batch has {} feature bundles but {} answers",
            batch.experts.len(),
            batch.answers.len()
        )));
    }
    Ok(())
}

/// Binary targets for a batch: strip the prompt prefix, check the answer
/// is a known candidate, and compare it with the positive answer.
pub fn answer_targets(answers: &[String], options: &InferenceOptions<'_>) -> Result<Vec<bool>> {
    answers
        .iter()
        .map(|raw| {
            let answer = raw.strip_prefix(options.prefix).unwrap_or(raw).trim();
            if !options.answer_list.iter().any(|a| a == answer) {
                return Err(TrainError::Dataset(format!(
                    "answer '{answer}' is not in the candidate list {:?}",
                    options.answer_list
                )));
            }
            Ok(answer == options.positive_answer)
        })
        .collect()
}

// ─── Numerics ────────────────────────────────────────────────────────────────

fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

/// BCE with logits: softplus(z) - y*z, stable for large |z|.
fn bce_with_logit(z: f32, y: bool) -> f64 {
    let z = z as f64;
    let softplus = z.max(0.0) + (-z.abs()).exp().ln_1p();
    softplus - if y { z } else { 0.0 }
}

fn bce_with_prob(p: f32, y: bool) -> f64 {
    let p = p.clamp(PROB_EPS, 1.0 - PROB_EPS) as f64;
    if y {
        -p.ln()
    } else {
        -(1.0 - p).ln()
    }
}

/// Softmax mass on `target` after keeping the `k` largest candidate logits.
/// Zero when `target` falls outside the top `k`.
fn top_k_probability(logits: &[f32], target: usize, k: usize) -> f32 {
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]).then(a.cmp(&b)));
    order.truncate(k.max(1));
    if !order.contains(&target) {
        return 0.0;
    }
    let max = logits[order[0]];
    let denom: f32 = order.iter().map(|&c| (logits[c] - max).exp()).sum();
    (logits[target] - max).exp() / denom
}

// ─── ClassificationModel ─────────────────────────────────────────────────────

impl ClassificationModel for ExpertFusionClassifier {
    fn set_mode(&mut self, mode: ModelMode) {
        if mode == ModelMode::Eval {
            self.cache = None;
        }
        self.mode = mode;
    }

    fn mode(&self) -> ModelMode {
        self.mode
    }

    fn forward_train(
        &mut self,
        batch:   &Batch,
        options: &InferenceOptions<'_>,
    ) -> Result<TrainOutput> {
        if self.mode != ModelMode::Train {
            return Err(TrainError::Model("forward_train called in eval mode".into()));
        }
        check_batch(batch)?;
        let targets = answer_targets(&batch.answers, options)?;
        let (pooled, logits) = self.logits(batch)?;

        let n = batch.len() as f32;
        let mut loss = 0.0f64;
        let mut outputs = Vec::with_capacity(logits.len());
        let mut dlogits = Vec::with_capacity(logits.len());
        for (&z, &y) in logits.iter().zip(&targets) {
            let p = sigmoid(z);
            loss += bce_with_logit(z, y);
            outputs.push(p);
            dlogits.push((p - if y { 1.0 } else { 0.0 }) / n);
        }

        self.cache = Some(ForwardCache {
            pooled,
            expert_counts: batch.experts.iter().map(Vec::len).collect(),
            dlogits,
        });

        Ok(TrainOutput {
            loss: loss / batch.len() as f64,
            outputs,
            targets,
        })
    }

    fn backward(&mut self) -> Result<()> {
        let cache = self
            .cache
            .take()
            .ok_or_else(|| TrainError::Model("backward called without a forward pass".into()))?;
        let weight = self.param(WEIGHT_KEY)?.clone();

        let mut grad_w = ArrayD::<f32>::zeros(weight.raw_dim());
        let mut grad_b = 0.0f32;
        let mut grad_pos = ArrayD::<f32>::zeros(IxDyn(&[
            self.config.num_experts,
            self.config.expert_dim,
        ]));

        for (i, h) in cache.pooled.axis_iter(Axis(0)).enumerate() {
            let dz = cache.dlogits[i];
            grad_b += dz;
            grad_w.iter_mut().zip(h.iter()).for_each(|(g, &x)| *g += dz * x);

            // h = mean_j(x_j + P_j) so dh/dP_j = 1/n for each used row.
            let scale = dz / cache.expert_counts[i] as f32;
            for j in 0..cache.expert_counts[i] {
                for (d, &w) in weight.iter().enumerate() {
                    grad_pos[[j, d]] += scale * w;
                }
            }
        }

        for (name, delta) in [
            (WEIGHT_KEY,    grad_w),
            (BIAS_KEY,      ArrayD::from_elem(IxDyn(&[1]), grad_b)),
            (POS_EMBED_KEY, grad_pos),
        ] {
            let grad = self
                .params
                .grad_mut(name)
                .ok_or_else(|| TrainError::Model(format!("no gradient buffer for '{name}'")))?;
            *grad += &delta;
        }
        Ok(())
    }

    fn rank(&self, batch: &Batch, options: &InferenceOptions<'_>) -> Result<RankOutput> {
        check_batch(batch)?;
        let positive = options
            .answer_list
            .iter()
            .position(|a| a == options.positive_answer)
            .ok_or_else(|| {
                TrainError::Model(format!(
                    "positive answer '{}' is not a candidate",
                    options.positive_answer
                ))
            })?;
        let ground_truth = answer_targets(&batch.answers, options)?;
        let (_, logits) = self.logits(batch)?;

        let mut loss = 0.0f64;
        let mut scores = Vec::with_capacity(logits.len());
        let mut candidates = vec![0.0f32; options.answer_list.len()];
        for (&z, &y) in logits.iter().zip(&ground_truth) {
            candidates.fill(0.0);
            candidates[positive] = z;
            let score = top_k_probability(&candidates, positive, options.k_test);
            loss += bce_with_prob(score, y);
            scores.push(score);
        }

        Ok(RankOutput {
            loss: loss / batch.len() as f64,
            scores,
            ground_truth,
        })
    }

    fn params(&self) -> &ParamSet {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamSet {
        &mut self.params
    }

    fn positional_embedding_key(&self) -> &str {
        POS_EMBED_KEY
    }

    fn positional_embedding_len(&self) -> usize {
        self.config.num_experts
    }
}
