//! Output-token budget expansion across prompt retries.

use serde::{Deserialize, Serialize};

/// Growth policy for the output-token budget of successive attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudgetPolicy {
    /// Explicit leading attempt sizes; expansion continues from the last one.
    pub attempts: Vec<u32>,
    pub max_attempts: usize,
    pub multiplier: f64,
    /// Hard ceiling for any attempt.
    pub cap: u32,
    /// Additive bonus per retry, 0 to disable.
    pub retry_bonus: u32,
}

impl TokenBudgetPolicy {
    pub fn new(initial: u32, max_attempts: usize, multiplier: f64, cap: u32) -> Self {
        Self {
            attempts: vec![initial],
            max_attempts,
            multiplier,
            cap,
            retry_bonus: 0,
        }
    }

    pub fn with_retry_bonus(mut self, bonus: u32) -> Self {
        self.retry_bonus = bonus;
        self
    }

    /// Same policy with a different starting size.
    pub fn starting_at(&self, initial: u32) -> Self {
        Self { attempts: vec![initial], ..self.clone() }
    }

    pub fn expand(&self) -> Vec<u32> {
        expand_attempts(&self.attempts, self.max_attempts, self.multiplier, self.cap, self.retry_bonus)
    }
}

/// Expand a sequence of attempt sizes up to `max_attempts` entries.
///
/// Each new size is `min(cap, max(prev + 1, ceil(prev * multiplier), prev + bonus))`.
/// Expansion halts as soon as a candidate does not exceed its predecessor,
/// which happens once the cap is reached.
pub fn expand_attempts(
    initial: &[u32],
    max_attempts: usize,
    multiplier: f64,
    cap: u32,
    bonus: u32,
) -> Vec<u32> {
    let mut out: Vec<u32> = initial.iter().copied().take(max_attempts).collect();
    while out.len() < max_attempts {
        let Some(&prev) = out.last() else { break };
        // Epsilon keeps float noise (1000 * 1.2 = 1200.0000001) from rounding up.
        let scaled = ((prev as f64) * multiplier - 1e-9).ceil().max(0.0) as u64;
        let grown = (prev as u64 + 1)
            .max(scaled)
            .max(prev as u64 + bonus as u64);
        let next = grown.min(cap as u64) as u32;
        if next <= prev {
            break;
        }
        out.push(next);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplier_growth() {
        assert_eq!(expand_attempts(&[1000], 3, 1.2, 10_000, 0), vec![1000, 1200, 1440]);
    }

    #[test]
    fn additive_bonus_dominates_until_cap() {
        assert_eq!(expand_attempts(&[3200], 3, 1.2, 6400, 1600), vec![3200, 4800, 6400]);
    }

    #[test]
    fn growth_halts_once_capped() {
        assert_eq!(expand_attempts(&[1000], 10, 2.0, 2500, 0), vec![1000, 2000, 2500]);
    }

    #[test]
    fn small_multiplier_still_grows_by_one() {
        assert_eq!(expand_attempts(&[10], 3, 1.0, 100, 0), vec![10, 11, 12]);
    }

    #[test]
    fn explicit_prefix_is_kept_and_truncated() {
        assert_eq!(expand_attempts(&[500, 900], 4, 1.5, 10_000, 0), vec![500, 900, 1350, 2025]);
        assert_eq!(expand_attempts(&[500, 900, 1300], 2, 1.5, 10_000, 0), vec![500, 900]);
        assert!(expand_attempts(&[], 3, 1.5, 100, 0).is_empty());
    }

    #[test]
    fn policy_expand_uses_its_fields() {
        let p = TokenBudgetPolicy::new(3200, 3, 1.2, 6400).with_retry_bonus(1600);
        assert_eq!(p.expand(), vec![3200, 4800, 6400]);
        assert_eq!(p.starting_at(1000).expand(), vec![1000, 2600, 4200]);
    }
}
