//! Evaluated flag values as served by the flag service.
use std::collections::BTreeMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

#[allow(missing_docs)]
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// A JSON-like flag value.
///
/// Flag values are already evaluated server-side, so the client only needs to carry them around
/// and compare them structurally.
///
/// Conveniently implements `From` conversions for `bool`, `f64`, `String`, and `&str`.
///
/// ```
/// # use flagsync::FlagValue;
/// let enabled: FlagValue = true.into();
/// let color: FlagValue = "blue".into();
/// assert_eq!(enabled.as_bool(), Some(true));
/// assert_eq!(color.as_str(), Some("blue"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From, Default)]
#[serde(untagged)]
pub enum FlagValue {
    /// `null`, also used when a flag has no value on one side of a change.
    #[default]
    Null,
    #[allow(missing_docs)]
    Bool(bool),
    #[allow(missing_docs)]
    Number(f64),
    #[allow(missing_docs)]
    String(String),
    #[allow(missing_docs)]
    Array(Vec<FlagValue>),
    #[allow(missing_docs)]
    Object(BTreeMap<String, FlagValue>),
}

impl FlagValue {
    #[allow(missing_docs)]
    pub fn is_null(&self) -> bool {
        matches!(self, FlagValue::Null)
    }

    #[allow(missing_docs)]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FlagValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the number if it is integral and fits into `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        let value = self.as_f64()?;
        if value.fract() == 0.0 && value >= i64::MIN as f64 && value <= i64::MAX as f64 {
            Some(value as i64)
        } else {
            None
        }
    }

    #[allow(missing_docs)]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::String(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        FlagValue::String(value.to_owned())
    }
}

/// One evaluated flag: the value plus metadata needed for ordering and analytics.
///
/// A flag whose `value` is null and `variation` is `None` is a valid "evaluated to nothing"
/// marker. This is different from a key that is absent from the snapshot, which means the flag
/// was never seen.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct FeatureFlag {
    #[serde(default)]
    pub value: FlagValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<i64>,
    /// Version of the flag itself. Used for analytics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_version: Option<i64>,
    /// Environment-wide model version. Used to order patches and deletes.
    #[serde(default, rename = "version", skip_serializing_if = "Option::is_none")]
    pub model_version: Option<i64>,
    #[serde(default)]
    pub track_events: bool,
    #[serde(default)]
    pub track_reason: bool,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub debug_events_until_date: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FlagValue>,
}

impl FeatureFlag {
    /// Create a flag with the given value and no metadata.
    pub fn new(value: impl Into<FlagValue>) -> FeatureFlag {
        FeatureFlag {
            value: value.into(),
            ..FeatureFlag::default()
        }
    }

    #[allow(missing_docs)]
    pub fn with_variation(mut self, variation: i64) -> FeatureFlag {
        self.variation = Some(variation);
        self
    }

    #[allow(missing_docs)]
    pub fn with_model_version(mut self, version: i64) -> FeatureFlag {
        self.model_version = Some(version);
        self
    }

    #[allow(missing_docs)]
    pub fn with_flag_version(mut self, version: i64) -> FeatureFlag {
        self.flag_version = Some(version);
        self
    }

    /// Version reported in analytics events: the flag version if known, the model version
    /// otherwise.
    pub fn version_for_events(&self) -> Option<i64> {
        self.flag_version.or(self.model_version)
    }

    /// Change-detection equality.
    ///
    /// Values are identified by variation index and model version. Only when neither side has a
    /// variation are the values compared directly.
    pub fn is_same_evaluation(&self, other: &FeatureFlag) -> bool {
        match (self.variation, other.variation) {
            (None, None) => self.value == other.value,
            (a, b) => a == b && self.model_version == other.model_version,
        }
    }
}

/// A patch payload: one flag plus its key.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FlagPatch {
    pub key: String,
    #[serde(flatten)]
    pub flag: FeatureFlag,
}

/// A delete payload.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FlagDelete {
    pub key: String,
    pub version: i64,
}
