use crate::domain::{DoseError, DoseResult};

/// Stride between the seed blocks of consecutive beams.
pub const BEAM_SEED_STRIDE: u64 = 1_000_003;

/// One worker's slice of a beam's histories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerShare {
    pub worker_index: usize,
    pub histories: usize,
    pub seed: u64,
}

/// Splits `num_particles` over `workers`; the last worker takes the
/// remainder and empty shares are dropped.
pub fn partition(num_particles: usize, workers: usize, seed: u64, beam_index: usize) -> Vec<WorkerShare> {
    let workers = workers.max(1);
    let base = num_particles / workers;
    let remainder = num_particles % workers;
    let beam_seed = seed.wrapping_add((beam_index as u64).wrapping_mul(BEAM_SEED_STRIDE));
    (0..workers)
        .map(|worker_index| WorkerShare {
            worker_index,
            histories: if worker_index + 1 == workers {
                base + remainder
            } else {
                base
            },
            seed: beam_seed.wrapping_add(worker_index as u64),
        })
        .filter(|share| share.histories > 0)
        .collect()
}

/// Per-voxel sums of history scores and squared history scores.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerTally {
    pub worker_index: usize,
    pub histories: usize,
    pub sum: Vec<f64>,
    pub sum_sq: Vec<f64>,
}

impl WorkerTally {
    pub fn new(worker_index: usize, len: usize) -> Self {
        Self {
            worker_index,
            histories: 0,
            sum: vec![0.0; len],
            sum_sq: vec![0.0; len],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sum.iter().all(|value| *value == 0.0)
    }
}

/// Adds worker tallies in worker-index order, whatever order they arrive in.
pub fn combine_tallies(mut tallies: Vec<WorkerTally>, len: usize) -> DoseResult<WorkerTally> {
    tallies.sort_by_key(|tally| tally.worker_index);
    let mut combined = WorkerTally::new(0, len);
    for tally in &tallies {
        if tally.sum.len() != len || tally.sum_sq.len() != len {
            return Err(DoseError::internal(
                "SYS.TALLY_SHAPE",
                format!(
                    "worker {} returned {} voxels, expected {len}",
                    tally.worker_index,
                    tally.sum.len()
                ),
            ));
        }
        combined.histories += tally.histories;
        for (target, value) in combined.sum.iter_mut().zip(&tally.sum) {
            *target += value;
        }
        for (target, value) in combined.sum_sq.iter_mut().zip(&tally.sum_sq) {
            *target += value;
        }
    }
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::{BEAM_SEED_STRIDE, WorkerTally, combine_tallies, partition};

    #[test]
    fn partition_gives_the_remainder_to_the_last_worker() {
        let shares = partition(10, 3, 7, 0);
        let histories: Vec<usize> = shares.iter().map(|share| share.histories).collect();
        assert_eq!(histories, vec![3, 3, 4]);
        assert_eq!(shares.iter().map(|share| share.seed).collect::<Vec<_>>(), vec![7, 8, 9]);

        let second_beam = partition(10, 3, 7, 2);
        assert_eq!(second_beam[0].seed, 7 + 2 * BEAM_SEED_STRIDE);
    }

    #[test]
    fn partition_skips_empty_shares() {
        let shares = partition(2, 4, 0, 0);
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].worker_index, 3);
        assert_eq!(shares[0].histories, 2);
        assert!(partition(0, 4, 0, 0).is_empty());
    }

    #[test]
    fn combination_ignores_completion_order() {
        let tallies: Vec<WorkerTally> = (0..4)
            .map(|worker| WorkerTally {
                worker_index: worker,
                histories: 10 + worker,
                sum: vec![0.1 * worker as f64, 1.0e16, 0.3],
                sum_sq: vec![0.01, 0.2 / (worker + 1) as f64, 1.0e-17],
            })
            .collect();
        let ordered = combine_tallies(tallies.clone(), 3).expect("combine");
        let mut reversed = tallies.clone();
        reversed.reverse();
        let mut shuffled = tallies;
        shuffled.swap(0, 2);
        shuffled.swap(1, 3);

        assert_eq!(combine_tallies(reversed, 3).expect("combine"), ordered);
        assert_eq!(combine_tallies(shuffled, 3).expect("combine"), ordered);
        assert_eq!(ordered.histories, 46);
    }

    #[test]
    fn combination_rejects_mismatched_tallies() {
        let error = combine_tallies(vec![WorkerTally::new(0, 2)], 3).expect_err("mismatch");
        assert_eq!(error.placeholder(), "SYS.TALLY_SHAPE");
    }
}
