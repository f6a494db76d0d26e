//! Runtime settings and feature gates.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable settings for batching, consolidation, and label policy.
///
/// All durations (de)serialize as seconds.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Quiet period that closes a batching window early.
    #[serde(with = "duration_secs")]
    pub batch_idle_duration: Duration,

    /// Hard cap on a batching window.
    #[serde(with = "duration_secs")]
    pub batch_max_duration: Duration,

    /// Wall-clock bound on one multi-node consolidation attempt.
    #[serde(with = "duration_secs")]
    pub multi_node_consolidation_timeout: Duration,

    /// Maximum candidates considered by one multi-node attempt.
    pub multi_node_consolidation_batch_max: usize,

    /// How long a consolidation command stays valid against a snapshot.
    #[serde(with = "duration_secs")]
    pub consolidation_ttl: Duration,

    /// Feature gates.
    pub feature_gates: FeatureGates,

    /// Extra label sub-domains pods may constrain despite the restricted
    /// domain policy.
    pub allowed_label_domains: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batch_idle_duration: Duration::from_secs(1),
            batch_max_duration: Duration::from_secs(10),
            multi_node_consolidation_timeout: Duration::from_secs(60),
            multi_node_consolidation_batch_max: 100,
            consolidation_ttl: Duration::from_secs(15),
            feature_gates: FeatureGates::default(),
            allowed_label_domains: Vec::new(),
        }
    }
}

/// Optional behaviors that default off.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureGates {
    /// React to node drift from its pool template.
    pub drift: bool,
    /// Allow consolidation to replace a spot node with another spot node.
    pub spot_to_spot_consolidation: bool,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.batch_idle_duration, Duration::from_secs(1));
        assert_eq!(settings.batch_max_duration, Duration::from_secs(10));
        assert_eq!(settings.multi_node_consolidation_timeout, Duration::from_secs(60));
        assert_eq!(settings.multi_node_consolidation_batch_max, 100);
        assert!(!settings.feature_gates.drift);
        assert!(!settings.feature_gates.spot_to_spot_consolidation);
    }

    #[test]
    fn settings_round_trip_through_json() {
        let json = serde_json::json!({
            "batchIdleDuration": 2.5,
            "featureGates": { "spotToSpotConsolidation": true }
        });
        let settings: Settings = serde_json::from_value(json).unwrap();
        assert_eq!(settings.batch_idle_duration, Duration::from_millis(2500));
        assert!(settings.feature_gates.spot_to_spot_consolidation);
        // Unspecified fields keep their defaults.
        assert_eq!(settings.batch_max_duration, Duration::from_secs(10));

        let encoded = serde_json::to_value(&settings).unwrap();
        let decoded: Settings = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, settings);
    }

    #[test]
    fn negative_durations_are_rejected() {
        let json = serde_json::json!({ "batchIdleDuration": -1 });
        assert!(serde_json::from_value::<Settings>(json).is_err());
    }
}
