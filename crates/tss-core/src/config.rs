//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// How the over-blame guard compares the accused count against the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlameBound {
    /// Accept blame when `count <= T`
    #[default]
    AtMostThreshold,
    /// Accept blame when `count < T`
    BelowThreshold,
}

impl BlameBound {
    /// Whether accusing `count` peers is allowed for threshold `threshold`
    pub fn allows(&self, count: usize, threshold: usize) -> bool {
        match self {
            BlameBound::AtMostThreshold => count <= threshold,
            BlameBound::BelowThreshold => count < threshold,
        }
    }
}

/// Timeouts and policies of one engine instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TssConfig {
    /// Inactivity timeout of the keygen round loop
    #[serde(with = "duration_secs")]
    pub keygen_timeout: Duration,
    /// Inactivity timeout of the keysign round loop
    #[serde(with = "duration_secs")]
    pub keysign_timeout: Duration,
    /// Join-session deadline
    #[serde(with = "duration_secs")]
    pub party_timeout: Duration,
    /// Deadline for ECDSA pre-parameter generation
    #[serde(with = "duration_secs")]
    pub pre_param_timeout: Duration,
    /// Re-broadcast interval of the join ready signal
    #[serde(with = "duration_millis")]
    pub join_resend_interval: Duration,
    /// How long a finished session keeps routing for slower peers
    #[serde(with = "duration_secs")]
    pub task_done_grace: Duration,
    /// Lifetime of messages buffered for sessions not yet subscribed
    #[serde(with = "duration_secs")]
    pub pending_message_ttl: Duration,
    pub blame_bound: BlameBound,
}

impl Default for TssConfig {
    fn default() -> Self {
        Self {
            keygen_timeout: Duration::from_secs(120),
            keysign_timeout: Duration::from_secs(60),
            party_timeout: Duration::from_secs(30),
            pre_param_timeout: Duration::from_secs(300),
            join_resend_interval: Duration::from_millis(500),
            task_done_grace: Duration::from_secs(5),
            pending_message_ttl: Duration::from_secs(30),
            blame_bound: BlameBound::default(),
        }
    }
}

impl TssConfig {
    /// Load a configuration file (JSON); missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let config: TssConfig = serde_json::from_str(&json)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("keygen_timeout", self.keygen_timeout),
            ("keysign_timeout", self.keysign_timeout),
            ("party_timeout", self.party_timeout),
            ("pre_param_timeout", self.pre_param_timeout),
            ("join_resend_interval", self.join_resend_interval),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(Error::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.join_resend_interval >= self.party_timeout {
            return Err(Error::InvalidConfig(
                "join_resend_interval must be shorter than party_timeout".into(),
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: TssConfig =
            serde_json::from_str(r#"{"keysign_timeout": 2.5, "blame_bound": "below_threshold"}"#)
                .unwrap();
        assert_eq!(config.keysign_timeout, Duration::from_millis(2500));
        assert_eq!(config.keygen_timeout, Duration::from_secs(120));
        assert_eq!(config.blame_bound, BlameBound::BelowThreshold);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_resend_longer_than_join() {
        let config = TssConfig {
            party_timeout: Duration::from_millis(100),
            join_resend_interval: Duration::from_millis(200),
            ..TssConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blame_bound() {
        assert!(BlameBound::AtMostThreshold.allows(2, 2));
        assert!(!BlameBound::BelowThreshold.allows(2, 2));
        assert!(BlameBound::BelowThreshold.allows(1, 2));
    }
}
