//! Probe configuration
//!
//! Holds where program builds are found, perf buffer sizing, and the rate
//! curve the kernel program uses to space out update events of long-lived
//! flows.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use acct_common::{RateCurveKey, RATE_CURVE_POINTS};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default directory holding `acct_<version>.o` program builds
pub const DEFAULT_OBJECT_DIR: &str = "/usr/lib/conntrack-acct";

/// One point of the age-based rate curve.
///
/// Flows at least `age_secs` old emit an update event at most once every
/// `interval_secs`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCurvePoint {
    pub age_secs: u64,
    pub interval_secs: u64,
}

impl RateCurvePoint {
    pub const fn new(age_secs: u64, interval_secs: u64) -> Self {
        Self {
            age_secs,
            interval_secs,
        }
    }

    pub fn age(&self) -> Duration {
        Duration::from_secs(self.age_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Configuration applied to the probe at load time
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Directory containing program builds
    pub object_dir: PathBuf,
    /// Pages per CPU for each perf buffer, a power of two. `None` uses the
    /// loader default.
    pub perf_pages: Option<usize>,
    /// Age-based rate limiting curve, youngest point first
    pub rate_curve: [RateCurvePoint; RATE_CURVE_POINTS],
}

impl Default for Config {
    fn default() -> Self {
        Self {
            object_dir: PathBuf::from(DEFAULT_OBJECT_DIR),
            perf_pages: None,
            rate_curve: [
                RateCurvePoint::new(0, 20),
                RateCurvePoint::new(60, 60),
                RateCurvePoint::new(300, 300),
            ],
        }
    }
}

impl Config {
    /// Read a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&data).map_err(|e| {
            Error::InvalidConfig(format!("parsing {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(pages) = self.perf_pages {
            if !pages.is_power_of_two() {
                return Err(Error::InvalidConfig(format!(
                    "perf_pages must be a non-zero power of two, got {}",
                    pages
                )));
            }
        }

        if self.rate_curve[0].age_secs != 0 {
            return Err(Error::InvalidConfig(
                "first rate curve point must have age 0".to_string(),
            ));
        }

        for (i, point) in self.rate_curve.iter().enumerate() {
            if point.interval_secs == 0 {
                return Err(Error::InvalidConfig(format!(
                    "rate curve point {} has a zero interval",
                    i
                )));
            }
        }

        for (i, pair) in self.rate_curve.windows(2).enumerate() {
            if pair[1].age_secs <= pair[0].age_secs {
                return Err(Error::InvalidConfig(format!(
                    "rate curve ages must increase: point {} ({}s) <= point {} ({}s)",
                    i + 1,
                    pair[1].age_secs,
                    i,
                    pair[0].age_secs
                )));
            }
        }

        Ok(())
    }

    /// `config_ratecurve` map entries as (index, nanoseconds)
    pub fn rate_curve_entries(&self) -> Vec<(u32, u64)> {
        self.rate_curve
            .iter()
            .enumerate()
            .filter_map(|(i, point)| {
                let (age, interval) = RateCurveKey::point(i)?;
                Some([
                    (age as u32, point.age().as_nanos() as u64),
                    (interval as u32, point.interval().as_nanos() as u64),
                ])
            })
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_rate_curve_entries() {
        let entries = Config::default().rate_curve_entries();
        assert_eq!(
            entries,
            vec![
                (0, 0),
                (1, 20_000_000_000),
                (2, 60_000_000_000),
                (3, 60_000_000_000),
                (4, 300_000_000_000),
                (5, 300_000_000_000),
            ]
        );
    }

    #[test]
    fn test_validate_rejects_bad_curves() {
        let mut cfg = Config::default();
        cfg.rate_curve[0].age_secs = 5;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        let mut cfg = Config::default();
        cfg.rate_curve[2].age_secs = 60;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        let mut cfg = Config::default();
        cfg.rate_curve[1].interval_secs = 0;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        let cfg = Config {
            perf_pages: Some(3),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"perf_pages": 64}"#).unwrap();
        assert_eq!(cfg.perf_pages, Some(64));
        assert_eq!(cfg.rate_curve, Config::default().rate_curve);
        assert_eq!(cfg.object_dir, PathBuf::from(DEFAULT_OBJECT_DIR));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("acct-config-{}.json", std::process::id()));
        fs::write(
            &path,
            r#"{"object_dir": "/opt/acct", "rate_curve": [
                {"age_secs": 0, "interval_secs": 10},
                {"age_secs": 30, "interval_secs": 30},
                {"age_secs": 120, "interval_secs": 90}
            ]}"#,
        )
        .unwrap();

        let cfg = Config::from_file(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(cfg.object_dir, PathBuf::from("/opt/acct"));
        assert_eq!(cfg.rate_curve[2], RateCurvePoint::new(120, 90));
        assert_eq!(cfg.rate_curve[1].interval(), Duration::from_secs(30));
    }
}
