//! Distributed runtime seam.
//!
//! Components never ask an ambient global for rank or world size; they receive a
//! [`DistributedContext`] wrapping whichever [`Collective`] backend the launcher
//! set up.

use crate::error::{TrainingError, TrainingResult};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Collective operations every worker must call in the same order.
pub trait Collective: Send + Sync {
    fn world_size(&self) -> usize;

    fn rank(&self) -> usize;

    /// Element-wise sum of `values` across all workers, written back in place.
    fn all_reduce_sum(&self, values: &mut [f64]) -> TrainingResult<()>;

    fn barrier(&self) -> TrainingResult<()>;

    /// Release every peer blocked in a collective with an error. Called by a
    /// worker that is about to stop early.
    fn abort(&self) {}
}

#[derive(Clone)]
pub struct DistributedContext {
    collective: Arc<dyn Collective>,
}

impl std::fmt::Debug for DistributedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedContext")
            .field("rank", &self.rank())
            .field("world_size", &self.world_size())
            .finish()
    }
}

impl DistributedContext {
    #[must_use]
    pub fn new(collective: Arc<dyn Collective>) -> Self {
        Self { collective }
    }

    /// Single-worker context.
    #[must_use]
    pub fn local() -> Self {
        Self::new(Arc::new(LocalCollective))
    }

    #[must_use]
    pub fn world_size(&self) -> usize {
        self.collective.world_size()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.rank() == 0
    }

    pub fn all_reduce_sum(&self, values: &mut [f64]) -> TrainingResult<()> {
        self.collective.all_reduce_sum(values)
    }

    pub fn barrier(&self) -> TrainingResult<()> {
        self.collective.barrier()
    }

    pub fn abort(&self) {
        self.collective.abort();
    }

    /// Fail unless every worker reports the same `steps`.
    ///
    /// Sum and sum of squares agree with `world * steps` and `world * steps^2`
    /// only when all values are equal.
    pub fn verify_equal_steps(&self, steps: usize) -> TrainingResult<()> {
        let local = steps as f64;
        let mut sums = [local, local * local];
        self.all_reduce_sum(&mut sums)?;

        let world = self.world_size() as f64;
        let mean = sums[0] / world;
        let variance = sums[1] / world - mean * mean;
        if (mean - local).abs() > f64::EPSILON || variance.abs() > 1e-6 {
            return Err(TrainingError::DistributedDesync(format!(
                "rank {} runs {steps} steps per epoch but the group average is {mean}",
                self.rank()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCollective;

impl Collective for LocalCollective {
    fn world_size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) -> TrainingResult<()> {
        Ok(())
    }

    fn barrier(&self) -> TrainingResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct GroupState {
    arrived: usize,
    generation: u64,
    aborted: bool,
    accumulator: Vec<f64>,
}

struct ThreadGroupShared {
    world_size: usize,
    state: Mutex<GroupState>,
    turn: Condvar,
}

impl ThreadGroupShared {
    fn lock(&self) -> TrainingResult<MutexGuard<'_, GroupState>> {
        self.state
            .lock()
            .map_err(|_| TrainingError::Distributed("thread group state poisoned".to_string()))
    }

    /// Block until every worker arrives. The last arrival runs `on_complete`
    /// under the lock before releasing the others.
    fn wait(&self, on_complete: impl FnOnce(&mut GroupState)) -> TrainingResult<()> {
        let mut state = self.lock()?;
        if state.aborted {
            return Err(TrainingError::PeerAborted);
        }
        state.arrived += 1;
        if state.arrived == self.world_size {
            on_complete(&mut state);
            state.arrived = 0;
            state.generation += 1;
            self.turn.notify_all();
            return Ok(());
        }

        let generation = state.generation;
        while state.generation == generation && !state.aborted {
            state = self
                .turn
                .wait(state)
                .map_err(|_| TrainingError::Distributed("thread group state poisoned".to_string()))?;
        }
        if state.generation == generation {
            return Err(TrainingError::PeerAborted);
        }
        Ok(())
    }
}

/// In-process SPMD group: one handle per worker thread.
#[derive(Clone)]
pub struct ThreadCollective {
    rank: usize,
    shared: Arc<ThreadGroupShared>,
}

impl ThreadCollective {
    /// Create handles for `world_size` workers, indexed by rank.
    #[must_use]
    pub fn group(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(ThreadGroupShared {
            world_size,
            state: Mutex::new(GroupState::default()),
            turn: Condvar::new(),
        });
        (0..world_size).map(|rank| Self { rank, shared: shared.clone() }).collect()
    }
}

impl Collective for ThreadCollective {
    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> TrainingResult<()> {
        // Every worker passes both barriers even on a length mismatch, so a bad
        // call cannot leave the others blocked.
        let mismatch = {
            let mut state = self.shared.lock()?;
            if state.accumulator.is_empty() {
                state.accumulator.resize(values.len(), 0.0);
            }
            if state.accumulator.len() == values.len() {
                for (a, v) in state.accumulator.iter_mut().zip(values.iter()) {
                    *a += *v;
                }
                false
            } else {
                true
            }
        };

        self.shared.wait(|_| {})?;
        if !mismatch {
            values.copy_from_slice(&self.shared.lock()?.accumulator);
        }
        self.shared.wait(|state| state.accumulator.clear())?;

        if mismatch {
            return Err(TrainingError::DistributedDesync(format!(
                "rank {} all-reduce length {} differs from the group",
                self.rank,
                values.len()
            )));
        }
        Ok(())
    }

    fn barrier(&self) -> TrainingResult<()> {
        self.shared.wait(|_| {})
    }

    fn abort(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.aborted = true;
        }
        self.shared.turn.notify_all();
    }
}
