use std::collections::BTreeMap;

use serde::Serialize;

use crate::{flag::Timestamp, FeatureFlag, FlagValue, Identity};

/// The value of a flag along with how it was determined.
///
/// Returned by [`Client::variation_detail`](crate::Client::variation_detail).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetail {
    /// Value returned to the application.
    pub value: FlagValue,
    /// Variation index, if the flag was known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<i64>,
    /// Evaluation reason. The flag service only sends reasons when they are requested with
    /// [`ClientConfig::evaluation_reasons`](crate::ClientConfig::evaluation_reasons) or when the
    /// flag tracks them. Unknown flags get `{"kind": "ERROR", "errorKind": "FLAG_NOT_FOUND"}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FlagValue>,
}

impl EvaluationDetail {
    pub(crate) fn new(flag: Option<&FeatureFlag>, default: FlagValue) -> EvaluationDetail {
        match flag {
            Some(flag) => EvaluationDetail {
                value: if flag.value.is_null() {
                    default
                } else {
                    flag.value.clone()
                },
                variation: flag.variation,
                reason: flag.reason.clone(),
            },
            None => EvaluationDetail {
                value: default,
                variation: None,
                reason: Some(error_reason("FLAG_NOT_FOUND")),
            },
        }
    }
}

fn error_reason(error_kind: &str) -> FlagValue {
    FlagValue::Object(BTreeMap::from([
        ("kind".to_owned(), FlagValue::from("ERROR")),
        ("errorKind".to_owned(), FlagValue::from(error_kind)),
    ]))
}

/// Records that the application evaluated a flag through [`Client::variation`](crate::Client::variation)
/// or [`Client::variation_detail`](crate::Client::variation_detail).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationEvent {
    /// Key of the evaluated flag.
    pub flag_key: String,
    /// Context the flag was evaluated for.
    pub context_key: String,
    /// Value returned to the application.
    pub value: FlagValue,
    /// Default the application supplied.
    pub default_value: FlagValue,
    /// Variation index, if the flag was known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<i64>,
    /// Flag version (or model version if the flag has none).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    /// Evaluation reason. Only present for detailed evaluations or if the flag asks for reasons to
    /// be tracked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FlagValue>,
    /// Whether full event tracking is enabled for this flag.
    pub track_events: bool,
    /// Debug events should be sent until this time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<Timestamp>,
    /// When the evaluation happened.
    pub timestamp: Timestamp,
}

impl EvaluationEvent {
    pub(crate) fn new(
        identity: &Identity,
        flag_key: &str,
        flag: Option<&FeatureFlag>,
        value: FlagValue,
        default_value: FlagValue,
        include_reason: bool,
    ) -> EvaluationEvent {
        EvaluationEvent {
            flag_key: flag_key.to_owned(),
            context_key: identity.context_key().to_owned(),
            value,
            default_value,
            variation: flag.and_then(|f| f.variation),
            version: flag.and_then(FeatureFlag::version_for_events),
            reason: flag
                .filter(|f| include_reason || f.track_reason)
                .and_then(|f| f.reason.clone()),
            track_events: flag.map_or(false, |f| f.track_events),
            debug_events_until_date: flag.and_then(|f| f.debug_events_until_date),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// A trait for handing evaluation events to your analytics pipeline.
pub trait EvaluationLogger {
    /// Logs the evaluation event.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use flagsync::{EvaluationLogger, EvaluationEvent};
    /// struct MyEvaluationLogger;
    ///
    /// impl EvaluationLogger for MyEvaluationLogger {
    ///     fn log_evaluation(&self, event: EvaluationEvent) {
    ///         // Forward the event to your event tracker here
    ///     }
    /// }
    /// ```
    ///
    /// # Notes
    ///
    /// This method is called before the value is returned to the caller and should not block or
    /// panic. Errors should be handled within the implementation.
    fn log_evaluation(&self, event: EvaluationEvent);
}

pub(crate) struct NoopEvaluationLogger;
impl EvaluationLogger for NoopEvaluationLogger {
    fn log_evaluation(&self, _event: EvaluationEvent) {}
}

impl<T: Fn(EvaluationEvent)> EvaluationLogger for T {
    fn log_evaluation(&self, event: EvaluationEvent) {
        self(event);
    }
}

#[cfg(test)]
mod tests {
    use super::{EvaluationDetail, EvaluationEvent};
    use crate::{FeatureFlag, FlagValue, Identity};

    #[test]
    fn carries_flag_metadata() {
        let mut flag = FeatureFlag::new("blue")
            .with_variation(2)
            .with_model_version(10)
            .with_flag_version(4);
        flag.track_events = true;
        flag.reason = Some(FlagValue::from("FALLTHROUGH"));

        let event = EvaluationEvent::new(
            &Identity::new("user", "env"),
            "color",
            Some(&flag),
            "blue".into(),
            "red".into(),
            false,
        );

        assert_eq!(event.context_key, "user");
        assert_eq!(event.variation, Some(2));
        assert_eq!(event.version, Some(4));
        assert!(event.track_events);
        // Reasons are only reported when the flag asks for them.
        assert_eq!(event.reason, None);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["flagKey"], "color");
        assert_eq!(json["defaultValue"], "red");
    }

    #[test]
    fn unknown_flag_has_no_metadata() {
        let event = EvaluationEvent::new(
            &Identity::new("user", "env"),
            "missing",
            None,
            false.into(),
            false.into(),
            false,
        );

        assert_eq!(event.variation, None);
        assert_eq!(event.version, None);
        assert!(!event.track_events);
    }

    #[test]
    fn detailed_evaluations_include_reason() {
        let mut flag = FeatureFlag::new(3.0).with_variation(1);
        flag.reason = Some(FlagValue::from("TARGET_MATCH"));

        let event = EvaluationEvent::new(
            &Identity::new("user", "env"),
            "limit",
            Some(&flag),
            3.0.into(),
            0.0.into(),
            true,
        );

        assert_eq!(event.reason, Some(FlagValue::from("TARGET_MATCH")));
    }

    #[test]
    fn detail_of_known_and_unknown_flags() {
        let mut flag = FeatureFlag::new(FlagValue::Null).with_variation(2);
        flag.reason = Some(FlagValue::from("OFF"));

        let known = EvaluationDetail::new(Some(&flag), "default".into());
        assert_eq!(known.value, FlagValue::from("default"));
        assert_eq!(known.variation, Some(2));
        assert_eq!(known.reason, Some(FlagValue::from("OFF")));

        let unknown = EvaluationDetail::new(None, "default".into());
        assert_eq!(unknown.value, FlagValue::from("default"));
        assert_eq!(unknown.variation, None);
        assert_eq!(
            serde_json::to_value(&unknown.reason).unwrap(),
            serde_json::json!({"kind": "ERROR", "errorKind": "FLAG_NOT_FOUND"})
        );
    }
}
