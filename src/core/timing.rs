use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::time::{Duration, Instant};

/// Random value in `[min_ms, max_ms]`, seeded from a fresh `RandomState`.
pub fn calculate_jitter(min_ms: u64, max_ms: u64) -> u64 {
    if max_ms <= min_ms {
        return min_ms;
    }

    let s = RandomState::new();
    let mut hasher = s.build_hasher();
    Instant::now().hash(&mut hasher);
    let hash = hasher.finish();

    min_ms + (hash % (max_ms - min_ms + 1))
}

pub fn jitter_between(min: Duration, max: Duration) -> Duration {
    Duration::from_millis(calculate_jitter(min.as_millis() as u64, max.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_in_bounds() {
        for _ in 0..200 {
            let j = calculate_jitter(100, 300);
            assert!((100..=300).contains(&j));
        }
        assert_eq!(calculate_jitter(50, 50), 50);
        assert_eq!(calculate_jitter(80, 10), 80);
    }
}
