//! Per-epoch shuffled, drop-last sharding of record indices across workers.

use crate::distributed::DistributedContext;
use crate::error::{TrainingError, TrainingResult};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

#[derive(Debug, Clone)]
pub struct EpochSampler {
    dataset_len: usize,
    batch_size: usize,
    world_size: usize,
    rank: usize,
    seed: u64,
}

impl EpochSampler {
    /// Fails when the dataset cannot give every worker at least one full batch.
    pub fn new(dataset_len: usize, batch_size: usize, ctx: &DistributedContext, seed: u64) -> TrainingResult<Self> {
        if batch_size == 0 {
            return Err(TrainingError::InvalidConfig("batch size must be positive".to_string()));
        }
        let sampler = Self { dataset_len, batch_size, world_size: ctx.world_size(), rank: ctx.rank(), seed };
        if sampler.steps_per_epoch() == 0 {
            return Err(TrainingError::DistributedDesync(format!(
                "{dataset_len} records cannot fill one batch of {batch_size} on each of {} workers",
                sampler.world_size
            )));
        }
        Ok(sampler)
    }

    /// Identical on every worker: trailing records that do not fill a global batch are dropped.
    #[must_use]
    pub fn steps_per_epoch(&self) -> usize {
        self.dataset_len / (self.batch_size * self.world_size)
    }

    /// This worker's record indices for every step of `epoch`.
    #[must_use]
    pub fn epoch_batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset_len).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        order.shuffle(&mut rng);

        let global = self.batch_size * self.world_size;
        let offset = self.rank * self.batch_size;
        order
            .chunks_exact(global)
            .map(|chunk| chunk[offset..offset + self.batch_size].to_vec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::ThreadCollective;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn ctx_for(rank: usize, world: usize) -> DistributedContext {
        let group = ThreadCollective::group(world);
        DistributedContext::new(Arc::new(group.into_iter().nth(rank).unwrap()))
    }

    #[test]
    fn test_drop_last_steps() {
        let sampler = EpochSampler::new(10, 3, &DistributedContext::local(), 1).unwrap();
        assert_eq!(sampler.steps_per_epoch(), 3);
        let batches = sampler.epoch_batches(0);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() == 3));
    }

    #[test]
    fn test_ranks_get_disjoint_equal_shards() {
        let a = EpochSampler::new(9, 2, &ctx_for(0, 2), 7).unwrap();
        let b = EpochSampler::new(9, 2, &ctx_for(1, 2), 7).unwrap();
        assert_eq!(a.steps_per_epoch(), b.steps_per_epoch());

        let left: HashSet<usize> = a.epoch_batches(3).into_iter().flatten().collect();
        let right: HashSet<usize> = b.epoch_batches(3).into_iter().flatten().collect();
        assert_eq!(left.len(), 4);
        assert_eq!(right.len(), 4);
        assert!(left.is_disjoint(&right));
    }

    #[test]
    fn test_shuffle_is_deterministic_per_epoch() {
        let sampler = EpochSampler::new(64, 4, &DistributedContext::local(), 2002).unwrap();
        assert_eq!(sampler.epoch_batches(1), sampler.epoch_batches(1));
        assert_ne!(sampler.epoch_batches(0), sampler.epoch_batches(1));
    }

    #[test]
    fn test_too_few_records_is_desync() {
        let err = EpochSampler::new(3, 2, &ctx_for(0, 2), 0).unwrap_err();
        assert!(matches!(err, TrainingError::DistributedDesync(_)));
        assert!(EpochSampler::new(3, 0, &DistributedContext::local(), 0).is_err());
    }
}
