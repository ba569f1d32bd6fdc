//! Licensed feature identifiers and the typed feature grant set.
//!
//! The master server ships features as a string-keyed JSON bag; it is
//! parsed into [`FeatureSet`] once at sync time so admission reads never
//! touch raw JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use pbxgate_core::AppError;

/// A capability gated by the license.
///
/// `Premium` is the distinguished feature whose concurrency is bounded by
/// the license's `max_feature_users` sub-quota; all other features admit
/// against `max_users`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "feature", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    /// Core telephony (device registration, calls).
    Telephony,
    /// Voicemail boxes.
    Voicemail,
    /// Call recording.
    Recording,
    /// Conference bridges.
    Conference,
    /// Premium extension types, bounded by the feature sub-quota.
    Premium,
}

impl Feature {
    /// All features, in a stable order.
    pub const ALL: [Feature; 5] = [
        Feature::Telephony,
        Feature::Voicemail,
        Feature::Recording,
        Feature::Conference,
        Feature::Premium,
    ];

    /// Return the feature as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telephony => "telephony",
            Self::Voicemail => "voicemail",
            Self::Recording => "recording",
            Self::Conference => "conference",
            Self::Premium => "premium",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Feature {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "telephony" => Ok(Self::Telephony),
            "voicemail" => Ok(Self::Voicemail),
            "recording" => Ok(Self::Recording),
            "conference" => Ok(Self::Conference),
            "premium" => Ok(Self::Premium),
            _ => Err(AppError::validation(format!(
                "Invalid feature: '{s}'. Expected one of: telephony, voicemail, recording, conference, premium"
            ))),
        }
    }
}

/// Typed mapping from [`Feature`] to its enabled flag.
///
/// Unknown feature names from the master are dropped at parse time;
/// features absent from the map are disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet(BTreeMap<Feature, bool>);

impl FeatureSet {
    /// Empty set: everything disabled.
    pub fn none() -> Self {
        Self::default()
    }

    /// Set with every feature enabled.
    pub fn all() -> Self {
        Self(Feature::ALL.iter().map(|f| (*f, true)).collect())
    }

    /// Set with exactly the given features enabled.
    pub fn of(features: &[Feature]) -> Self {
        Self(features.iter().map(|f| (*f, true)).collect())
    }

    /// Parse the master server's string-keyed feature bag, dropping
    /// unrecognized names.
    pub fn from_wire(raw: &BTreeMap<String, bool>) -> Self {
        let mut map = BTreeMap::new();
        for (name, enabled) in raw {
            if let Ok(feature) = name.parse::<Feature>() {
                map.insert(feature, *enabled);
            }
        }
        Self(map)
    }

    /// Whether the feature is enabled.
    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.0.get(&feature).copied().unwrap_or(false)
    }

    /// Enabled features, in stable order.
    pub fn enabled(&self) -> Vec<Feature> {
        self.0
            .iter()
            .filter(|(_, on)| **on)
            .map(|(f, _)| *f)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_wire_drops_unknown_names() {
        let mut raw = BTreeMap::new();
        raw.insert("telephony".to_string(), true);
        raw.insert("recording".to_string(), false);
        raw.insert("jetpack".to_string(), true);

        let set = FeatureSet::from_wire(&raw);
        assert!(set.is_enabled(Feature::Telephony));
        assert!(!set.is_enabled(Feature::Recording));
        assert_eq!(set.enabled(), vec![Feature::Telephony]);
    }

    #[test]
    fn test_absent_feature_is_disabled() {
        let set = FeatureSet::of(&[Feature::Telephony]);
        assert!(!set.is_enabled(Feature::Premium));
    }

    #[test]
    fn test_feature_parse_roundtrip() {
        for feature in Feature::ALL {
            assert_eq!(feature.as_str().parse::<Feature>().unwrap(), feature);
        }
        assert!("fax".parse::<Feature>().is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let set = FeatureSet::of(&[Feature::Telephony, Feature::Premium]);
        let json = serde_json::to_string(&set).unwrap();
        let back: FeatureSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
