//! Turning verification results into miner scores.
//!
//! Scoring never fails: malformed input scores zero.
use std::collections::{HashMap, VecDeque};

use crate::{config::Policy, gpu::GpuTable};

/// Map `value` from `[min, max]` onto `[0, 1]`, clamping outliers.
pub fn normalize(value: f64, min: f64, max: f64) -> f64 {
    if !value.is_finite() || !(max > min) {
        return 0.0;
    }
    ((value - min) / (max - min)).clamp(0.0, 1.0)
}

/// Score of a solved challenge.
///
/// Difficulty dominates, solving faster adds a little. The result is offset by
/// the base score and a bonus for trusted (registered) miners.
pub fn score(policy: &Policy, difficulty: u32, elapsed: f64, trusted: bool) -> f64 {
    if !elapsed.is_finite() || elapsed < 0.0 {
        return 0.0;
    }
    let (pow, cfg) = (&policy.pow, &policy.score);
    let difficulty = pow.clamp_difficulty(difficulty);
    let difficulty = normalize(
        difficulty as f64,
        pow.min_difficulty as f64,
        pow.max_difficulty as f64,
    );
    // a fixed difficulty range collapses to full marks
    let difficulty = if pow.min_difficulty == pow.max_difficulty {
        1.0
    } else {
        difficulty
    };
    let time = normalize(elapsed, 0.0, pow.timeout.as_secs_f64());

    let score = 100.0 * (cfg.difficulty_weight * difficulty + cfg.time_weight * (1.0 - time));
    let bonus = if trusted { cfg.registration_bonus } else { 0.0 };
    cfg.base + score + bonus
}

/// Proof-of-GPU score in `[0, 1]`.
///
/// A full rig (`max_gpus`) of the best card scores 1.
pub fn score_pog(policy: &Policy, gpu_name: &str, num_gpus: u32, allocated: bool) -> f64 {
    pog_score(&policy.gpus, policy.score.max_gpus, policy.score.allocation_multiplier, gpu_name, num_gpus, allocated)
}

fn pog_score(
    table: &GpuTable,
    max_gpus: u32,
    allocation_multiplier: f64,
    gpu_name: &str,
    num_gpus: u32,
    allocated: bool,
) -> f64 {
    let Some(max_score) = table.max_score().filter(|s| *s > 0.0) else {
        return 0.0;
    };
    let Some(spec) = table.get(gpu_name) else {
        return 0.0;
    };
    if num_gpus == 0 || max_gpus == 0 || !spec.score.is_finite() || spec.score < 0.0 {
        return 0.0;
    }
    let score_factor = 100.0 / (max_score * max_gpus as f64);
    let mut score = spec.score * num_gpus.min(max_gpus) as f64 * score_factor;
    if allocated {
        score *= allocation_multiplier;
    }
    normalize(score, 0.0, 100.0)
}

/// Per-miner challenge difficulty.
///
/// Difficulty climbs after each solved challenge and drops after each failure.
#[derive(Debug, Clone)]
pub struct DifficultyTracker {
    min: u32,
    max: u32,
    current: HashMap<String, u32>,
}

impl DifficultyTracker {
    pub fn new(policy: &Policy) -> Self {
        Self {
            min: policy.pow.min_difficulty,
            max: policy.pow.max_difficulty,
            current: HashMap::new(),
        }
    }

    pub fn difficulty(&self, miner: &str) -> u32 {
        self.current.get(miner).copied().unwrap_or(self.min)
    }

    pub fn record(&mut self, miner: &str, solved: bool) -> u32 {
        let current = self.difficulty(miner);
        let next = if solved {
            current.saturating_add(1)
        } else {
            current.saturating_sub(1)
        }
        .clamp(self.min, self.max);
        self.current.insert(miner.to_string(), next);
        next
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Entry {
    difficulty: u32,
    elapsed: f64,
    solved: bool,
}

/// The latest challenge results of a miner.
#[derive(Debug, Clone)]
pub struct ChallengeStats {
    window: usize,
    entries: VecDeque<Entry>,
}

impl ChallengeStats {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, difficulty: u32, elapsed: f64, solved: bool) {
        if self.entries.len() == self.window {
            self.entries.pop_front();
        }
        self.entries.push_back(Entry {
            difficulty,
            elapsed,
            solved,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn failures(&self) -> usize {
        self.entries.iter().filter(|e| !e.solved).count()
    }

    fn solved(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|e| e.solved)
    }

    /// Average difficulty of solved challenges.
    pub fn avg_difficulty(&self) -> Option<f64> {
        let (sum, count) = self.solved().fold((0.0, 0usize), |(s, c), e| (s + e.difficulty as f64, c + 1));
        (count > 0).then(|| sum / count as f64)
    }

    /// Average time spent on solved challenges.
    pub fn avg_elapsed(&self) -> Option<f64> {
        let (sum, count) = self.solved().fold((0.0, 0usize), |(s, c), e| (s + e.elapsed, c + 1));
        (count > 0).then(|| sum / count as f64)
    }

    /// Score of the averages, scaled by the share of solved challenges.
    pub fn score(&self, policy: &Policy, trusted: bool) -> f64 {
        let (Some(difficulty), Some(elapsed)) = (self.avg_difficulty(), self.avg_elapsed()) else {
            return 0.0;
        };
        let solved_ratio = (self.len() - self.failures()) as f64 / self.len() as f64;
        score(policy, difficulty.round() as u32, elapsed, trusted) * solved_ratio
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn policy() -> Policy {
        Policy::builtin().unwrap()
    }

    #[test]
    fn normalizing() {
        assert_eq!(0.5, normalize(5.0, 0.0, 10.0));
        assert_eq!(1.0, normalize(50.0, 0.0, 10.0));
        assert_eq!(0.0, normalize(-1.0, 0.0, 10.0));
        assert_eq!(0.0, normalize(1.0, 1.0, 1.0));
        assert_eq!(0.0, normalize(f64::NAN, 0.0, 1.0));
    }

    #[rstest]
    #[case(12, 0.0, false, 110.0)]
    #[case(7, 30.0, false, 10.0)]
    #[case(7, 0.0, false, 15.0)]
    #[case(12, 0.0, true, 210.0)]
    fn challenge_scores(#[case] difficulty: u32, #[case] elapsed: f64, #[case] trusted: bool, #[case] expected: f64) {
        assert!((expected - score(&policy(), difficulty, elapsed, trusted)).abs() < 1e-9);
    }

    #[test]
    fn difficulty_is_clamped_before_scoring() {
        let p = policy();
        assert_eq!(score(&p, 12, 3.0, false), score(&p, 99, 3.0, false));
        assert_eq!(score(&p, 7, 3.0, false), score(&p, 1, 3.0, false));
    }

    #[test]
    fn malformed_elapsed_scores_zero() {
        let p = policy();
        assert_eq!(0.0, score(&p, 10, f64::NAN, true));
        assert_eq!(0.0, score(&p, 10, -1.0, true));
        // slower than the timeout is not rewarded
        assert_eq!(score(&p, 10, 30.0, false), score(&p, 10, 300.0, false));
    }

    #[test]
    fn pog_scores() {
        let p = policy();
        // the best card in a full rig
        assert_eq!(1.0, score_pog(&p, "NVIDIA B200", 8, false));
        assert_eq!(1.0, score_pog(&p, "NVIDIA B200", 16, false));
        assert!((0.125 - score_pog(&p, "NVIDIA B200", 1, false)).abs() < 1e-12);
        // 3.3 / 5.0 of a full rig
        assert!((0.66 - score_pog(&p, "NVIDIA H100 80GB HBM3", 8, false)).abs() < 1e-12);

        assert_eq!(0.0, score_pog(&p, "unknown", 8, false));
        assert_eq!(0.0, score_pog(&p, "NVIDIA B200", 0, false));
    }

    #[test]
    fn allocation_multiplier() {
        let mut p = policy();
        p.score.allocation_multiplier = 2.0;
        let free = score_pog(&p, "NVIDIA L40", 4, false);
        let allocated = score_pog(&p, "NVIDIA L40", 4, true);
        assert!((2.0 * free - allocated).abs() < 1e-12);
        assert_eq!(1.0, score_pog(&p, "NVIDIA B200", 8, true));
    }

    #[test]
    fn tracking_difficulty() {
        let p = policy();
        let mut tracker = DifficultyTracker::new(&p);
        assert_eq!(7, tracker.difficulty("m"));
        assert_eq!(7, tracker.record("m", false));
        for _ in 0..10 {
            tracker.record("m", true);
        }
        assert_eq!(12, tracker.difficulty("m"));
        assert_eq!(11, tracker.record("m", false));
        assert_eq!(7, tracker.difficulty("other"));
    }

    #[test]
    fn stats_window() {
        let p = policy();
        let mut stats = ChallengeStats::new(3);
        assert_eq!(0.0, stats.score(&p, false));

        stats.push(8, 2.0, true);
        stats.push(10, 4.0, true);
        stats.push(12, 1.0, false);
        assert_eq!(1, stats.failures());
        assert_eq!(Some(9.0), stats.avg_difficulty());
        assert_eq!(Some(3.0), stats.avg_elapsed());
        let expected = score(&p, 9, 3.0, false) * 2.0 / 3.0;
        assert!((expected - stats.score(&p, false)).abs() < 1e-9);

        stats.push(12, 1.0, true);
        assert_eq!(3, stats.len());
        assert_eq!(Some(11.0), stats.avg_difficulty());
    }
}
