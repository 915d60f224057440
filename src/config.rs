//! Engine configuration

/// Hash-table eviction policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Classic 2-bit NRU clock
    TwoBitLru,
    /// Frequency-counter policy with learned thresholds
    #[default]
    HifiMfu,
}

impl std::str::FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "2-bit_lru" => Ok(Self::TwoBitLru),
            "hifi_mfu" => Ok(Self::HifiMfu),
            _ => Err(format!("Unknown ht_eviction_policy: {}", s)),
        }
    }
}

impl EvictionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TwoBitLru => "2-bit_lru",
            Self::HifiMfu => "hifi_mfu",
        }
    }
}

/// Bucket flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BucketType {
    #[default]
    Persistent,
    Ephemeral,
}

impl std::str::FromStr for BucketType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "persistent" => Ok(Self::Persistent),
            "ephemeral" => Ok(Self::Ephemeral),
            _ => Err(format!("Unknown bucket_type: {}", s)),
        }
    }
}

/// Residency policy for persistent buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistentEvictionMode {
    #[default]
    ValueOnly,
    FullEviction,
}

impl std::str::FromStr for PersistentEvictionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "value_only" => Ok(Self::ValueOnly),
            "full_eviction" => Ok(Self::FullEviction),
            _ => Err(format!("Unknown item_eviction_policy: {}", s)),
        }
    }
}

/// What an ephemeral bucket does when memory is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EphemeralFullPolicy {
    /// Pager deletes items outright to reclaim memory
    #[default]
    AutoDelete,
    /// Writes fail until expiry frees memory; nothing is ever paged out
    FailNewData,
}

impl std::str::FromStr for EphemeralFullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto_delete" => Ok(Self::AutoDelete),
            "fail_new_data" => Ok(Self::FailNewData),
            _ => Err(format!("Unknown ephemeral_full_policy: {}", s)),
        }
    }
}

/// Item compressor mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMode {
    #[default]
    Off,
    /// Accept compressed values from clients, never compress in place
    Passive,
    /// Background compressor sweeps resident values
    Active,
}

impl std::str::FromStr for CompressionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "passive" => Ok(Self::Passive),
            "active" => Ok(Self::Active),
            _ => Err(format!("Unknown compression_mode: {}", s)),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // --- Memory ---
    /// Bucket quota in bytes (0 = unlimited, paging never triggers)
    pub max_size: u64,
    /// Low watermark in bytes (0 = derive 75% of quota)
    pub mem_low_wat: u64,
    /// High watermark in bytes (0 = derive 85% of quota)
    pub mem_high_wat: u64,

    // --- Bucket flavour ---
    pub bucket_type: BucketType,
    pub item_eviction_policy: PersistentEvictionMode,
    pub ephemeral_full_policy: EphemeralFullPolicy,

    // --- Paging ---
    pub ht_eviction_policy: EvictionPolicy,
    /// Age percentile used when learning the age threshold (0..=100)
    pub item_eviction_age_percentage: u32,
    /// Cap on the frequency percentile used when learning the frequency
    /// threshold (0..=100)
    pub item_eviction_freq_counter_age_threshold: u32,

    // --- Expiry pager ---
    pub exp_pager_enabled: bool,
    /// Sweep period in seconds
    pub exp_pager_stime: u64,
    /// Delay before the first sweep (0 = use the period)
    pub exp_pager_initial_delay: u64,

    // --- Layout ---
    /// Number of vBuckets this bucket is partitioned into
    pub max_vbuckets: u16,
    /// Shards per vBucket hash table (power of two)
    pub ht_shards: usize,

    // --- Compression ---
    pub compression_mode: CompressionMode,

    // --- Logging ---
    pub loglevel: String,
    pub logfile: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_size: 0,
            mem_low_wat: 0,
            mem_high_wat: 0,

            bucket_type: BucketType::Persistent,
            item_eviction_policy: PersistentEvictionMode::ValueOnly,
            ephemeral_full_policy: EphemeralFullPolicy::AutoDelete,

            ht_eviction_policy: EvictionPolicy::HifiMfu,
            item_eviction_age_percentage: 30,
            item_eviction_freq_counter_age_threshold: 100,

            exp_pager_enabled: true,
            exp_pager_stime: 3600,
            exp_pager_initial_delay: 0,

            max_vbuckets: 16,
            ht_shards: 16,

            compression_mode: CompressionMode::Off,

            loglevel: "notice".to_string(),
            logfile: "".to_string(),
        }
    }
}

impl EngineConfig {
    /// Effective low watermark (derived from the quota when unset)
    pub fn low_watermark(&self) -> u64 {
        if self.mem_low_wat != 0 {
            self.mem_low_wat
        } else {
            self.max_size * 3 / 4
        }
    }

    /// Effective high watermark (derived from the quota when unset)
    pub fn high_watermark(&self) -> u64 {
        if self.mem_high_wat != 0 {
            self.mem_high_wat
        } else {
            self.max_size * 85 / 100
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.bucket_type == BucketType::Ephemeral
    }

    /// Ephemeral fail_new_data buckets have no item pager at all; the
    /// expiry pager is the only reclamation path.
    pub fn has_item_pager(&self) -> bool {
        !(self.is_ephemeral() && self.ephemeral_full_policy == EphemeralFullPolicy::FailNewData)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_round_trips() {
        assert_eq!(
            "2-bit_lru".parse::<EvictionPolicy>().unwrap(),
            EvictionPolicy::TwoBitLru
        );
        assert_eq!(
            "hifi_mfu".parse::<EvictionPolicy>().unwrap(),
            EvictionPolicy::HifiMfu
        );
        assert!("lru".parse::<EvictionPolicy>().is_err());
        assert_eq!(EvictionPolicy::TwoBitLru.as_str(), "2-bit_lru");
    }

    #[test]
    fn watermarks_derive_from_quota() {
        let cfg = EngineConfig {
            max_size: 1000,
            ..Default::default()
        };
        assert_eq!(cfg.low_watermark(), 750);
        assert_eq!(cfg.high_watermark(), 850);

        let cfg = EngineConfig {
            max_size: 200 * 1024,
            mem_low_wat: 120 * 1024,
            mem_high_wat: 160 * 1024,
            ..Default::default()
        };
        assert_eq!(cfg.low_watermark(), 120 * 1024);
        assert_eq!(cfg.high_watermark(), 160 * 1024);
    }

    #[test]
    fn fail_new_data_has_no_item_pager() {
        let cfg = EngineConfig {
            bucket_type: BucketType::Ephemeral,
            ephemeral_full_policy: EphemeralFullPolicy::FailNewData,
            ..Default::default()
        };
        assert!(!cfg.has_item_pager());
        assert!(EngineConfig::default().has_item_pager());
    }
}
