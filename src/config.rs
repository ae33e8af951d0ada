use std::time::Duration;

use num_bigint::BigInt;

use crate::error::{AppError, AppResult};

/// Maximum page size the reconciliation engine will accept
pub const MAX_RECONCILIATION_BATCH: u32 = 200;

/// Core configuration: worker cadences, retry policy and escrow economics.
/// Everything is env-overridable with the documented defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    /// Recovery worker tick (default 30 s)
    pub recovery_tick_interval: Duration,
    /// Stuck-saga scan (default 5 min); also the stuck threshold
    pub stuck_scan_interval: Duration,
    /// DLQ depth sampler (default 10 min)
    pub dlq_sample_interval: Duration,
    /// Scheduled reconciliation cadence (default 6 h)
    pub reconciliation_interval: Duration,

    /// Retries before DLQ promotion (default 5)
    pub recovery_max_retries: u32,
    /// Exponential backoff cap in minutes (default 60)
    pub recovery_backoff_cap_minutes: u32,
    /// Recovery entries claimed per tick
    pub recovery_batch_size: u32,

    /// Reconciliation page size (default 50, max 200)
    pub reconciliation_batch_size: u32,

    /// Dispute quorum percentage (default 51)
    pub quorum_percentage: u32,
    /// Where release fees are paid out
    pub treasury_address: String,
    /// Escrow fee in basis points (default 50 = 0.5%)
    fee_basis_points: u32,
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        dotenv::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| AppError::Config("DATABASE_URL must be set".into()))?;

        let mut config = Self {
            database_url,
            recovery_tick_interval: Duration::from_secs(env_u64("RECOVERY_TICK_SECONDS", 30)),
            stuck_scan_interval: Duration::from_secs(env_u64("STUCK_SCAN_SECONDS", 300)),
            dlq_sample_interval: Duration::from_secs(env_u64("DLQ_SAMPLE_SECONDS", 600)),
            reconciliation_interval: Duration::from_secs(env_u64(
                "RECONCILIATION_INTERVAL_SECONDS",
                6 * 3600,
            )),
            recovery_max_retries: env_u64("RECOVERY_MAX_RETRIES", 5) as u32,
            recovery_backoff_cap_minutes: env_u64("RECOVERY_BACKOFF_CAP_MINUTES", 60) as u32,
            recovery_batch_size: env_u64("RECOVERY_BATCH_SIZE", 10) as u32,
            reconciliation_batch_size: env_u64("RECONCILIATION_BATCH_SIZE", 50) as u32,
            quorum_percentage: env_u64("QUORUM_PERCENTAGE", 51) as u32,
            treasury_address: std::env::var("TREASURY_ADDRESS")
                .unwrap_or_else(|_| "treasury".to_string()),
            fee_basis_points: 50,
        };
        config.set_fee_basis_points(env_u64("FEE_BASIS_POINTS", 50) as u32)?;

        if config.reconciliation_batch_size > MAX_RECONCILIATION_BATCH {
            return Err(AppError::Config(format!(
                "RECONCILIATION_BATCH_SIZE {} exceeds maximum {}",
                config.reconciliation_batch_size, MAX_RECONCILIATION_BATCH
            )));
        }
        if config.quorum_percentage == 0 || config.quorum_percentage > 100 {
            return Err(AppError::Config(format!(
                "QUORUM_PERCENTAGE {} out of range 1..=100",
                config.quorum_percentage
            )));
        }

        Ok(config)
    }

    pub fn fee_basis_points(&self) -> u32 {
        self.fee_basis_points
    }

    /// Update the fee rate. The minimum escrow amount is derived from it,
    /// so the fee on any accepted amount is strictly positive.
    pub fn set_fee_basis_points(&mut self, fee_bps: u32) -> AppResult<()> {
        if fee_bps == 0 || fee_bps > 10_000 {
            return Err(AppError::Config(format!(
                "FEE_BASIS_POINTS {fee_bps} out of range 1..=10000"
            )));
        }
        self.fee_basis_points = fee_bps;
        Ok(())
    }

    /// minimum = ceil(10000 / fee_bps), so floor(minimum * fee_bps / 10000) >= 1
    pub fn minimum_escrow_amount(&self) -> BigInt {
        BigInt::from((10_000 + self.fee_basis_points - 1) / self.fee_basis_points)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            recovery_tick_interval: Duration::from_secs(30),
            stuck_scan_interval: Duration::from_secs(300),
            dlq_sample_interval: Duration::from_secs(600),
            reconciliation_interval: Duration::from_secs(6 * 3600),
            recovery_max_retries: 5,
            recovery_backoff_cap_minutes: 60,
            recovery_batch_size: 10,
            reconciliation_batch_size: 50,
            quorum_percentage: 51,
            treasury_address: "treasury".to_string(),
            fee_basis_points: 50,
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_tracks_fee_rate() {
        let mut config = Config::default();
        assert_eq!(config.minimum_escrow_amount(), BigInt::from(200));

        config.set_fee_basis_points(100).unwrap();
        assert_eq!(config.minimum_escrow_amount(), BigInt::from(100));

        // 10000/3 = 3333.33.. rounds up
        config.set_fee_basis_points(3).unwrap();
        assert_eq!(config.minimum_escrow_amount(), BigInt::from(3334));

        config.set_fee_basis_points(10_000).unwrap();
        assert_eq!(config.minimum_escrow_amount(), BigInt::from(1));
    }

    #[test]
    fn rejects_zero_fee_rate() {
        let mut config = Config::default();
        assert!(config.set_fee_basis_points(0).is_err());
        assert!(config.set_fee_basis_points(10_001).is_err());
    }
}
