// ============================================================
// Layer 4 — Batch Loader
// ============================================================
// Turns a Dataset into per-worker mini-batches for one epoch.
//
//   shuffle(seed):  permute indices with StdRng(seed + epoch),
//                   so every worker agrees on the order and
//                   each epoch sees a new one
//   shard(r, w):    worker r takes indices r, r+w, r+2w, ...
//   pad_shards():   repeat indices from the start until the
//                   index count divides evenly by w, so every
//                   worker runs the same number of batches
//
// Training loaders pad (gradient all-reduce runs in lockstep);
// validation loaders do not (no example is scored twice).

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::data::dataset::Dataset;
use crate::domain::batch::Batch;
use crate::error::{Result, TrainError};

pub struct BatchLoader<'a, D: Dataset> {
    dataset:    &'a D,
    batch_size: usize,
    seed:       Option<u64>,
    rank:       usize,
    world_size: usize,
    pad:        bool,
}

impl<'a, D: Dataset> BatchLoader<'a, D> {
    pub fn new(dataset: &'a D, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainError::Config("batch size must be positive".into()));
        }
        Ok(Self {
            dataset,
            batch_size,
            seed:       None,
            rank:       0,
            world_size: 1,
            pad:        false,
        })
    }

    pub fn shuffle(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn shard(mut self, rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(TrainError::Config(format!(
                "invalid shard rank {rank} of world size {world_size}"
            )));
        }
        self.rank = rank;
        self.world_size = world_size;
        Ok(self)
    }

    pub fn pad_shards(mut self) -> Self {
        self.pad = true;
        self
    }

    /// Number of examples this worker sees per epoch.
    pub fn shard_len(&self) -> usize {
        let (n, w) = (self.dataset.len(), self.world_size);
        if self.pad {
            n.div_ceil(w)
        } else if self.rank < n {
            (n - self.rank).div_ceil(w)
        } else {
            0
        }
    }

    /// Batches per epoch on this worker; the last batch may be short.
    pub fn num_batches(&self) -> usize {
        self.shard_len().div_ceil(self.batch_size)
    }

    fn shard_indices(&self, epoch: usize) -> Vec<usize> {
        let n = self.dataset.len();
        let mut order: Vec<usize> = (0..n).collect();
        if let Some(seed) = self.seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        if self.pad && n > 0 {
            let total = n.div_ceil(self.world_size) * self.world_size;
            for i in n..total {
                order.push(order[i % n]);
            }
        }
        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }

    /// This worker's batches for `epoch`, in order.
    pub fn iter(&self, epoch: usize) -> impl Iterator<Item = Result<Batch>> + 'a {
        let dataset = self.dataset;
        let indices = self.shard_indices(epoch);
        let batch_size = self.batch_size;
        let count = indices.len().div_ceil(batch_size);
        (0..count).map(move |b| {
            let end = ((b + 1) * batch_size).min(indices.len());
            collate(dataset, &indices[b * batch_size..end])
        })
    }
}

fn collate<D: Dataset>(dataset: &D, indices: &[usize]) -> Result<Batch> {
    let mut experts = Vec::with_capacity(indices.len());
    let mut answers = Vec::with_capacity(indices.len());
    for &i in indices {
        let example = dataset.get(i).ok_or_else(|| {
            TrainError::Dataset(format!("index {i} out of range for {} examples", dataset.len()))
        })?;
        experts.push(example.experts.clone());
        answers.push(example.answer.clone());
    }
    Ok(Batch::new(experts, answers))
}
