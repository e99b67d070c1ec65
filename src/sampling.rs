//! 候选类别采样
//!
//! sampled softmax 用 log-uniform（Zipf）分布抽取负类：词表按频率降序排列时，
//! id 越小越常见，被抽中的概率越大。

use rand::Rng;
use std::collections::HashSet;

/// 一次采样的结果
#[derive(Debug, Clone)]
pub struct SampledCandidates {
    /// 不重复的候选类别
    pub classes: Vec<usize>,
    /// 抽样次数（含重复），用于估计期望出现次数
    pub num_tries: usize,
}

/// log-uniform 候选采样器
///
/// ```text
/// P(k) = (ln(k + 2) - ln(k + 1)) / ln(V + 1)
/// ```
#[derive(Debug, Clone, Copy)]
pub struct LogUniformSampler {
    num_classes: usize,
    log_range: f64,
}

impl LogUniformSampler {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            log_range: ((num_classes + 1) as f64).ln(),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// 类别 k 的单次抽样概率
    pub fn probability(&self, class: usize) -> f64 {
        let k = class as f64;
        ((k + 2.0) / (k + 1.0)).ln() / self.log_range
    }

    /// 单次抽样
    pub fn sample_one<R: Rng>(&self, rng: &mut R) -> usize {
        let u: f64 = rng.gen();
        let value = (u * self.log_range).exp() as usize;
        value.saturating_sub(1).min(self.num_classes - 1)
    }

    /// 不放回地抽取 `num_sampled` 个不同类别
    ///
    /// 调用方保证 `num_sampled < num_classes`。
    pub fn sample_unique<R: Rng>(&self, num_sampled: usize, rng: &mut R) -> SampledCandidates {
        let target = num_sampled.min(self.num_classes);
        let mut seen = HashSet::with_capacity(target);
        let mut classes = Vec::with_capacity(target);
        let mut num_tries = 0;

        while classes.len() < target {
            let class = self.sample_one(rng);
            num_tries += 1;
            if seen.insert(class) {
                classes.push(class);
            }
        }

        SampledCandidates { classes, num_tries }
    }

    /// 在 `num_tries` 次抽样中出现的期望次数（不重复采样时）
    pub fn expected_count(&self, class: usize, num_tries: usize) -> f64 {
        let p = self.probability(class);
        -((num_tries as f64) * (-p).ln_1p()).exp_m1()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_probabilities_sum_to_one() {
        let sampler = LogUniformSampler::new(50);
        let total: f64 = (0..50).map(|k| sampler.probability(k)).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(sampler.probability(0) > sampler.probability(49));
    }

    #[test]
    fn test_sample_unique() {
        let sampler = LogUniformSampler::new(20);
        let mut rng = StdRng::seed_from_u64(3);
        let sampled = sampler.sample_unique(10, &mut rng);

        assert_eq!(sampled.classes.len(), 10);
        assert!(sampled.num_tries >= 10);
        let unique: HashSet<_> = sampled.classes.iter().collect();
        assert_eq!(unique.len(), 10);
        assert!(sampled.classes.iter().all(|&c| c < 20));
    }

    #[test]
    fn test_expected_count_bounds() {
        let sampler = LogUniformSampler::new(100);
        let q = sampler.expected_count(0, 30);
        assert!(q > 0.0 && q <= 1.0);
        assert!(sampler.expected_count(0, 30) > sampler.expected_count(99, 30));
    }
}
