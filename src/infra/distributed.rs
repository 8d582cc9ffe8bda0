// ============================================================
// Layer 6 — Worker Groups and Accelerator Options
// ============================================================
// Two Collective implementations:
//
//   SingleWorker:  world size 1; every collective is a no-op.
//   ThreadGroup:   N workers as scoped threads in one process,
//                  sharing a gather buffer and an abortable
//                  barrier. Started with `launch`.
//
// If any worker fails or panics, the barrier is aborted so the
// others return an error instead of waiting forever. `launch`
// then reports the root cause rather than the follow-on
// "group aborted" errors.
//
// Sharding and mixed-precision flags are parsed and reported
// here; the reference backend always computes in f32.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    str::FromStr,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread,
};

use crate::domain::traits::Collective;
use crate::error::{Result, TrainError};

// ─── SingleWorker ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct SingleWorker;

impl Collective for SingleWorker {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_gather_f32(&self, local: &[f32]) -> Result<Vec<f32>> {
        Ok(local.to_vec())
    }
}

// ─── ThreadGroup ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct BarrierState {
    arrived:    usize,
    generation: u64,
    aborted:    bool,
}

#[derive(Debug)]
struct Shared {
    world_size: usize,
    state:      Mutex<BarrierState>,
    released:   Condvar,
    slots:      Mutex<Vec<Vec<f32>>>,
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| TrainError::Collective("worker group lock poisoned".into()))
}

fn aborted() -> TrainError {
    TrainError::Collective("worker group aborted by a failing peer".into())
}

impl Shared {
    fn new(world_size: usize) -> Self {
        Self {
            world_size,
            state:    Mutex::new(BarrierState::default()),
            released: Condvar::new(),
            slots:    Mutex::new(vec![Vec::new(); world_size]),
        }
    }

    fn wait(&self) -> Result<()> {
        let mut state = lock(&self.state)?;
        if state.aborted {
            return Err(aborted());
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.world_size {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(());
        }
        while state.generation == generation && !state.aborted {
            state = self
                .released
                .wait(state)
                .map_err(|_| TrainError::Collective("worker group lock poisoned".into()))?;
        }
        if state.generation == generation {
            Err(aborted())
        } else {
            Ok(())
        }
    }

    fn abort(&self) {
        // A poisoned lock means a peer already panicked; waiters see that too.
        if let Ok(mut state) = self.state.lock() {
            state.aborted = true;
        }
        self.released.notify_all();
    }
}

/// One member of an in-process worker group.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    rank:   usize,
    shared: Arc<Shared>,
}

impl ThreadGroup {
    /// Release every peer blocked in a collective with an error.
    pub fn abort(&self) {
        self.shared.abort();
    }
}

impl Collective for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn barrier(&self) -> Result<()> {
        self.shared.wait()
    }

    fn all_gather_f32(&self, local: &[f32]) -> Result<Vec<f32>> {
        lock(&self.shared.slots)?[self.rank] = local.to_vec();
        self.shared.wait()?;
        let gathered = lock(&self.shared.slots)?.concat();
        // Nobody may overwrite a slot until every peer has read it.
        self.shared.wait()?;
        Ok(gathered)
    }
}

/// Run `worker` on `world_size` threads, each with its own `ThreadGroup`
/// handle, and return the per-rank results in rank order.
pub fn launch<T, F>(world_size: usize, worker: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(&ThreadGroup) -> Result<T> + Sync,
{
    if world_size == 0 {
        return Err(TrainError::Config("world size must be at least 1".into()));
    }
    tracing::info!(world_size, "launching in-process worker group");

    let shared = Arc::new(Shared::new(world_size));
    let outcomes: Vec<Result<T>> = thread::scope(|s| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let group = ThreadGroup { rank, shared: Arc::clone(&shared) };
                let worker = &worker;
                s.spawn(move || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker(&group)))
                        .unwrap_or_else(|_| {
                            Err(TrainError::Collective(format!("worker {rank} panicked")))
                        });
                    if let Err(e) = &outcome {
                        tracing::error!(rank, error = %e, "worker failed");
                        group.abort();
                    }
                    outcome
                })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, h)| {
                h.join().unwrap_or_else(|_| {
                    Err(TrainError::Collective(format!("worker {rank} could not be joined")))
                })
            })
            .collect()
    });

    let mut values = Vec::with_capacity(world_size);
    let mut first_error: Option<TrainError> = None;
    for outcome in outcomes {
        match outcome {
            Ok(v) => values.push(v),
            Err(e) => {
                let replace = match &first_error {
                    None => true,
                    Some(TrainError::Collective(_)) => !matches!(e, TrainError::Collective(_)),
                    Some(_) => false,
                };
                if replace {
                    first_error = Some(e);
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

// ─── Accelerator Options ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardingMode {
    /// Every worker holds the full model and optimizer state.
    #[default]
    NoShard,
    /// Gradients and optimizer state sharded (ZeRO-2).
    ShardGradOp,
    /// Parameters, gradients and optimizer state sharded (ZeRO-3).
    FullShard,
}

impl ShardingMode {
    pub fn from_flags(shard_grad_op: bool, full_shard: bool) -> Result<Self> {
        match (shard_grad_op, full_shard) {
            (true, true) => Err(TrainError::Config(
                "--shard_grad_op and --full_shard are mutually exclusive".into(),
            )),
            (true, false) => Ok(Self::ShardGradOp),
            (false, true) => Ok(Self::FullShard),
            (false, false) => Ok(Self::NoShard),
        }
    }
}

impl fmt::Display for ShardingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoShard => "NO_SHARD",
            Self::ShardGradOp => "SHARD_GRAD_OP",
            Self::FullShard => "FULL_SHARD",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MixedPrecision {
    No,
    #[default]
    Fp16,
    Bf16,
}

impl FromStr for MixedPrecision {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "no" => Ok(Self::No),
            "fp16" => Ok(Self::Fp16),
            "bf16" => Ok(Self::Bf16),
            other => Err(TrainError::Config(format!(
                "unknown mixed precision '{other}', expected no, fp16 or bf16"
            ))),
        }
    }
}

impl fmt::Display for MixedPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::No => "no",
            Self::Fp16 => "fp16",
            Self::Bf16 => "bf16",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcceleratorOptions {
    pub sharding:        ShardingMode,
    pub mixed_precision: MixedPrecision,
}

impl AcceleratorOptions {
    pub fn report(&self, world_size: usize) {
        tracing::info!(
            world_size,
            sharding = %self.sharding,
            mixed_precision = %self.mixed_precision,
            "accelerator configured (reference backend computes in f32)"
        );
    }
}
