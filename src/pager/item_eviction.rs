//! Frequency/age histogram and threshold learner.
//!
//! The paging visitor feeds every eligible item it sees into this
//! summariser and periodically re-learns the eviction thresholds from
//! the distribution of the population being decided over.

use crate::storage::item::MAX_FREQ_COUNT;

/// Population size after which thresholds are first learned; they are
/// re-learned every time another full learning population has been seen.
pub const LEARNING_POPULATION: u64 = 100;

const FREQ_BUCKETS: usize = MAX_FREQ_COUNT as usize + 1;
/// One bucket per bit length of the age value (0, 1, 2..3, 4..7, ...)
const AGE_BUCKETS: usize = 65;

pub struct ItemEviction {
    freq_counts: [u64; FREQ_BUCKETS],
    age_counts: [u64; AGE_BUCKETS],
    population: u64,
}

impl ItemEviction {
    pub fn new() -> Self {
        Self {
            freq_counts: [0; FREQ_BUCKETS],
            age_counts: [0; AGE_BUCKETS],
            population: 0,
        }
    }

    #[inline]
    fn age_bucket(age: u64) -> usize {
        (u64::BITS - age.leading_zeros()) as usize
    }

    #[inline]
    fn age_bucket_floor(bucket: usize) -> u64 {
        if bucket == 0 { 0 } else { 1u64 << (bucket - 1) }
    }

    #[inline]
    pub fn add(&mut self, freq: u8, age: u64) {
        self.freq_counts[freq as usize] += 1;
        self.age_counts[Self::age_bucket(age)] += 1;
        self.population += 1;
    }

    pub fn reset(&mut self) {
        self.freq_counts = [0; FREQ_BUCKETS];
        self.age_counts = [0; AGE_BUCKETS];
        self.population = 0;
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.population
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.population == 0
    }

    /// Is it time to (re-)learn thresholds after the latest insertion?
    #[inline]
    pub fn should_learn(&self) -> bool {
        self.population > 0 && self.population % LEARNING_POPULATION == 0
    }

    fn freq_at_percentile(&self, percentile: f64) -> u8 {
        let target = ((percentile / 100.0) * self.population as f64).ceil() as u64;
        let target = target.max(1);
        let mut cumulative = 0u64;
        for (value, count) in self.freq_counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return value as u8;
            }
        }
        MAX_FREQ_COUNT
    }

    fn age_at_percentile(&self, percentile: f64) -> u64 {
        let target = ((percentile / 100.0) * self.population as f64).ceil() as u64;
        let target = target.max(1);
        let mut cumulative = 0u64;
        for (bucket, count) in self.age_counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return Self::age_bucket_floor(bucket);
            }
        }
        u64::MAX
    }

    /// Learn `(freq_threshold, age_threshold)` from the population seen
    /// so far. An empty histogram answers the minimum for both.
    ///
    /// The frequency threshold never lands on the saturating maximum
    /// while anything below it exists; evicting untouched saturated
    /// items only because the percentile rounded up would strip the
    /// hottest part of the working set.
    pub fn thresholds(&self, freq_percentile: f64, age_percentile: f64) -> (u8, u64) {
        if self.population == 0 {
            return (0, 0);
        }

        let mut freq = self.freq_at_percentile(freq_percentile);
        if freq == MAX_FREQ_COUNT {
            let below_max: u64 = self.freq_counts[..FREQ_BUCKETS - 1].iter().sum();
            if below_max > 0 {
                freq = self.freq_counts[..FREQ_BUCKETS - 1]
                    .iter()
                    .rposition(|&c| c > 0)
                    .map(|v| v as u8)
                    .unwrap_or(0);
            }
        }

        (freq, self.age_at_percentile(age_percentile))
    }
}

impl Default for ItemEviction {
    fn default() -> Self {
        Self::new()
    }
}
