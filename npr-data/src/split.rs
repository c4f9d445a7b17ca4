//! Deterministic train/val/test partitioning of filename lists

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

pub const DEFAULT_SPLIT_SEED: u64 = 42;
pub const DEFAULT_SPLIT_RATIO: f64 = 0.1;

/// One partition of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitKind {
    Train,
    Val,
    Test,
}

impl SplitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitKind::Train => "train",
            SplitKind::Val => "val",
            SplitKind::Test => "test",
        }
    }
}

/// Parameters of a split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitConfig {
    pub seed: u64,
    /// Fraction of frames used for validation (and test, without explicit indices).
    pub ratio: f64,
    /// Held-out frame indices into the sorted list; they always form the test set.
    pub test_indices: Vec<usize>,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SPLIT_SEED,
            ratio: DEFAULT_SPLIT_RATIO,
            test_indices: Vec::new(),
        }
    }
}

/// Sorted filename lists of each partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitLists {
    pub train: Vec<String>,
    pub val: Vec<String>,
    pub test: Vec<String>,
}

impl SplitLists {
    pub fn get(&self, kind: SplitKind) -> &[String] {
        match kind {
            SplitKind::Train => &self.train,
            SplitKind::Val => &self.val,
            SplitKind::Test => &self.test,
        }
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.val.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Number of validation frames for `total` frames: `floor(ratio * total) + 1`.
pub fn validation_count(total: usize, ratio: f64) -> usize {
    (ratio * total as f64) as usize + 1
}

/// Partitions `names` into train/val/test.
///
/// Without explicit test indices the sorted list is shuffled with `seed`, the
/// first `n_val` names go to val, the next `n_val` to test, and the rest to
/// train. With explicit indices the named frames (indices into the sorted
/// list, out-of-range ones ignored) form the test set, and the remainder is
/// shuffled and sliced into val and train. Every output list is sorted, so the
/// shuffle only decides membership.
pub fn split_filename_list(names: &[String], config: &SplitConfig) -> SplitLists {
    let mut sorted = names.to_vec();
    sorted.sort();
    let total = sorted.len();
    let num_val = validation_count(total, config.ratio).min(total);
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);

    let (mut train, mut val, mut test) = if config.test_indices.is_empty() {
        let num_test = num_val.min(total - num_val);
        let mut shuffled = sorted;
        shuffled.shuffle(&mut rng);
        let train = shuffled.split_off(num_val + num_test);
        let test = shuffled.split_off(num_val);
        (train, shuffled, test)
    } else {
        let held_out: BTreeSet<usize> = config
            .test_indices
            .iter()
            .copied()
            .filter(|&i| i < total)
            .collect();
        let test: Vec<String> = held_out.iter().map(|&i| sorted[i].clone()).collect();
        let mut remainder: Vec<String> = sorted
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !held_out.contains(i))
            .map(|(_, name)| name)
            .collect();
        remainder.shuffle(&mut rng);
        let train = remainder.split_off(num_val.min(remainder.len()));
        (train, remainder, test)
    };

    train.sort();
    val.sort();
    test.sort();
    debug!(
        "Split {} frames into train={} val={} test={}",
        total,
        train.len(),
        val.len(),
        test.len()
    );
    SplitLists { train, val, test }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("frame_{i:04}")).collect()
    }

    fn assert_partition(lists: &SplitLists, names: &[String]) {
        let mut all: Vec<String> = lists
            .train
            .iter()
            .chain(&lists.val)
            .chain(&lists.test)
            .cloned()
            .collect();
        all.sort();
        let mut expected = names.to_vec();
        expected.sort();
        assert_eq!(all, expected);
    }

    #[test]
    fn test_ratio_split_counts_for_ten_frames() {
        let names = frames(10);
        let lists = split_filename_list(&names, &SplitConfig::default());
        assert_eq!(lists.val.len(), 2);
        assert_eq!(lists.test.len(), 2);
        assert_eq!(lists.train.len(), 6);
        assert_partition(&lists, &names);
    }

    #[test]
    fn test_split_is_deterministic_and_sorted() {
        let names = frames(37);
        let config = SplitConfig::default();
        let a = split_filename_list(&names, &config);
        let b = split_filename_list(&names, &config);
        assert_eq!(a, b);
        for list in [&a.train, &a.val, &a.test] {
            assert!(list.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let names = frames(20);
        let mut reversed = names.clone();
        reversed.reverse();
        let config = SplitConfig::default();
        assert_eq!(
            split_filename_list(&names, &config),
            split_filename_list(&reversed, &config)
        );
    }

    #[test]
    fn test_explicit_indices_form_test_set() {
        let names = frames(30);
        let config = SplitConfig {
            test_indices: vec![0, 5, 10, 29],
            ..SplitConfig::default()
        };
        let lists = split_filename_list(&names, &config);
        assert_eq!(
            lists.test,
            vec![
                names[0].clone(),
                names[5].clone(),
                names[10].clone(),
                names[29].clone()
            ]
        );
        assert_eq!(lists.val.len(), validation_count(30, 0.1));
        assert_partition(&lists, &names);
        for held_out in &lists.test {
            assert!(!lists.train.contains(held_out));
            assert!(!lists.val.contains(held_out));
        }
    }

    #[test]
    fn test_out_of_range_indices_are_ignored() {
        let names = frames(8);
        let config = SplitConfig {
            test_indices: vec![1, 100],
            ..SplitConfig::default()
        };
        let lists = split_filename_list(&names, &config);
        assert_eq!(lists.test, vec![names[1].clone()]);
        assert_partition(&lists, &names);
    }

    #[test]
    fn test_tiny_lists_do_not_panic() {
        let names = frames(1);
        let lists = split_filename_list(&names, &SplitConfig::default());
        assert_partition(&lists, &names);
        assert!(split_filename_list(&[], &SplitConfig::default()).is_empty());
    }
}
