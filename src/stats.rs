use std::sync::Mutex;

use crate::types::TokenPair;

/// Zero-means-default knobs for [`TokenStats`]. A value of `0` in the parsed
/// config is treated as "use the default" (see [`TokenStatsConfig::resolve`]).
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenStatsConfig {
    pub window_size: usize,
    pub min_samples: usize,
    pub max_ratio: f64,
    pub max_tokens_per_req: u64,
    pub exceed_factor: f64,
}

const DEFAULT_WINDOW_SIZE: usize = 1000;
const DEFAULT_MIN_SAMPLES: usize = 10;
const DEFAULT_MAX_RATIO: f64 = 4.0;
const DEFAULT_MAX_TOKENS_PER_REQ: u64 = 2000;
const DEFAULT_EXCEED_FACTOR: f64 = 1.5;

impl TokenStatsConfig {
    fn resolve(self) -> ResolvedTokenStatsConfig {
        ResolvedTokenStatsConfig {
            window_size: if self.window_size == 0 {
                DEFAULT_WINDOW_SIZE
            } else {
                self.window_size
            },
            min_samples: if self.min_samples == 0 {
                DEFAULT_MIN_SAMPLES
            } else {
                self.min_samples
            },
            max_ratio: if self.max_ratio == 0.0 {
                DEFAULT_MAX_RATIO
            } else {
                self.max_ratio
            },
            max_tokens_per_req: if self.max_tokens_per_req == 0 {
                DEFAULT_MAX_TOKENS_PER_REQ
            } else {
                self.max_tokens_per_req
            },
            exceed_factor: if self.exceed_factor == 0.0 {
                DEFAULT_EXCEED_FACTOR
            } else {
                self.exceed_factor
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ResolvedTokenStatsConfig {
    window_size: usize,
    min_samples: usize,
    max_ratio: f64,
    max_tokens_per_req: u64,
    exceed_factor: f64,
}

struct Window {
    data: Vec<TokenPair>,
    index: usize,
}

/// Bounded sliding-window estimator of the prompt→completion token ratio.
///
/// Every mutating and reading operation is serialized under one mutex; this
/// is process-local state with no cross-replica sharing by design — Redis,
/// via [`crate::limiter::DistributedLimiter`], is what enforces budgets
/// across replicas.
pub struct TokenStats {
    config: ResolvedTokenStatsConfig,
    window: Mutex<Window>,
}

impl TokenStats {
    pub fn new(config: TokenStatsConfig) -> Self {
        let config = config.resolve();
        Self {
            window: Mutex::new(Window {
                data: Vec::with_capacity(config.window_size),
                index: 0,
            }),
            config,
        }
    }

    /// Inserts an observed `(prompt, completion)` pair into the circular
    /// buffer, overwriting the eldest entry once the window is full.
    pub fn add(&self, prompt: u64, completion: u64) {
        let mut window = self.window.lock().expect("token stats mutex poisoned");
        let pair = TokenPair { prompt, completion };
        if window.data.len() < self.config.window_size {
            window.data.push(pair);
        } else {
            let index = window.index;
            window.data[index] = pair;
            window.index = (window.index + 1) % self.config.window_size;
        }
    }

    /// Admission test: `true` means the request should be rejected.
    pub fn is_exceeded(&self, prompt: u64) -> bool {
        let window = self.window.lock().expect("token stats mutex poisoned");

        if window.data.len() < self.config.min_samples {
            return prompt as f64 * self.config.max_ratio > self.config.max_tokens_per_req as f64;
        }

        let mut ratios: Vec<f64> = Vec::new();
        let mut completions: Vec<u64> = Vec::with_capacity(window.data.len());
        for pair in &window.data {
            if pair.prompt > 0 {
                ratios.push(pair.completion as f64 / pair.prompt as f64);
            }
            completions.push(pair.completion);
        }
        ratios.sort_by(|a, b| a.partial_cmp(b).expect("token ratio is NaN"));
        completions.sort_unstable();

        if ratios.is_empty() || completions.is_empty() {
            return prompt as f64 * self.config.max_ratio > self.config.max_tokens_per_req as f64;
        }

        let pos_ratio = percentile_index(ratios.len(), 0.95);
        let expected_completion = prompt as f64 * ratios[pos_ratio];

        let pos_completion = percentile_index(completions.len(), 0.95);
        let completion_p95 = completions[pos_completion] as f64;

        expected_completion < completion_p95 * self.config.exceed_factor
    }

    /// Provisional debit amount for a request with the given prompt size.
    pub fn predict_completion(&self, prompt: u64) -> u64 {
        let window = self.window.lock().expect("token stats mutex poisoned");

        if window.data.len() < self.config.min_samples {
            let estimated = prompt as f64 * self.config.max_ratio;
            return estimated.min(self.config.max_tokens_per_req as f64) as u64;
        }

        let mut sum_ratio = 0.0;
        let mut count = 0u64;
        for pair in &window.data {
            if pair.prompt > 0 {
                sum_ratio += pair.completion as f64 / pair.prompt as f64;
                count += 1;
            }
        }
        if count == 0 {
            return (prompt as f64 * self.config.max_ratio) as u64;
        }

        let avg_ratio = sum_ratio / count as f64;
        let estimated = prompt as f64 * avg_ratio;
        estimated.min(self.config.max_tokens_per_req as f64) as u64
    }
}

/// `floor(p * len)`, clamped to the last valid index.
fn percentile_index(len: usize, p: f64) -> usize {
    let idx = (p * len as f64) as usize;
    idx.min(len - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> TokenStats {
        TokenStats::new(TokenStatsConfig::default())
    }

    #[test]
    fn window_never_exceeds_capacity() {
        let stats = TokenStats::new(TokenStatsConfig {
            window_size: 4,
            ..Default::default()
        });
        for i in 0..10 {
            stats.add(i, i * 2);
        }
        let window = stats.window.lock().unwrap();
        assert_eq!(window.data.len(), 4);
    }

    #[test]
    fn window_keeps_most_recent_observations() {
        let stats = TokenStats::new(TokenStatsConfig {
            window_size: 3,
            ..Default::default()
        });
        for i in 0..5u64 {
            stats.add(i, i);
        }
        let window = stats.window.lock().unwrap();
        let mut prompts: Vec<u64> = window.data.iter().map(|p| p.prompt).collect();
        prompts.sort_unstable();
        assert_eq!(prompts, vec![2, 3, 4]);
    }

    #[test]
    fn cold_admission_is_monotone_in_prompt_size() {
        let stats = defaults();
        assert!(!stats.is_exceeded(1));
        assert!(stats.is_exceeded(10_000));
    }

    #[test]
    fn scenario_s1_cold_admission_pass() {
        let stats = defaults();
        assert!(!stats.is_exceeded(400));
        assert_eq!(stats.predict_completion(400), 1600);
    }

    #[test]
    fn scenario_s2_cold_admission_fail() {
        let stats = defaults();
        assert!(stats.is_exceeded(700));
    }

    #[test]
    fn scenario_s3_warm_prediction() {
        let stats = defaults();
        for _ in 0..20 {
            stats.add(100, 150);
        }
        assert_eq!(stats.predict_completion(200), 300);
    }

    #[test]
    fn prediction_never_exceeds_max_tokens_per_req() {
        let stats = TokenStats::new(TokenStatsConfig {
            max_tokens_per_req: 50,
            ..Default::default()
        });
        assert!(stats.predict_completion(1_000_000) <= 50);
        for _ in 0..20 {
            stats.add(10, 9999);
        }
        assert!(stats.predict_completion(1_000_000) <= 50);
    }

    #[test]
    fn prediction_is_never_negative() {
        let stats = defaults();
        assert_eq!(stats.predict_completion(0), 0);
    }
}
