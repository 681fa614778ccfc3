use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime, UtcOffset};

mod config;
mod store;

pub use config::{ClientEnvironment, LaunchConfig, RetryPolicy};
pub use store::{LaunchStore, MemoryLaunchStore, PersistedState, StoreKey};

/// Prefix applied to routing keys when they are folded into a merged record.
pub const DEEP_KEY_PREFIX: &str = "deep_";
/// Attribution key carrying the install classification.
pub const ATTRIBUTION_STATUS_KEY: &str = "af_status";
pub const ORGANIC_STATUS: &str = "Organic";
/// Marker key set when the attribution provider reported a failure instead of data.
pub const ERROR_KEY: &str = "error";
pub const SETUP_STATUS_ACTIVE: &str = "Active";

pub const PERMISSION_PROMPT_COOLDOWN: Duration = Duration::days(3);

const OBFUSCATION_KEY: &[u8] = b"launch-gate/routing.v1";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LaunchError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("codec error: {0}")]
    Codec(String),
}

macro_rules! string_record {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
        #[serde(transparent)]
        pub struct $name {
            entries: BTreeMap<String, String>,
        }

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self::default()
            }

            #[must_use]
            pub fn get(&self, key: &str) -> Option<&str> {
                self.entries.get(key).map(String::as_str)
            }

            #[must_use]
            pub fn contains_key(&self, key: &str) -> bool {
                self.entries.contains_key(key)
            }

            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.entries.is_empty()
            }

            #[must_use]
            pub fn len(&self) -> usize {
                self.entries.len()
            }

            pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
                self.entries
                    .iter()
                    .map(|(key, value)| (key.as_str(), value.as_str()))
            }

            #[must_use]
            pub fn entries(&self) -> &BTreeMap<String, String> {
                &self.entries
            }

            /// Builds a record from a JSON object, stringifying every value.
            ///
            /// # Errors
            /// Returns [`LaunchError::Validation`] when `value` is not a JSON object.
            pub fn from_json_object(value: &Value) -> Result<Self, LaunchError> {
                let object = value.as_object().ok_or_else(|| {
                    LaunchError::Validation(format!(
                        "{} payload MUST be a JSON object",
                        stringify!($name)
                    ))
                })?;
                Ok(object
                    .iter()
                    .map(|(key, value)| (key.clone(), stringify_value(value)))
                    .collect())
            }

            #[must_use]
            pub fn to_json_object(&self) -> Map<String, Value> {
                self.entries
                    .iter()
                    .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                    .collect()
            }
        }

        impl<K, V> FromIterator<(K, V)> for $name
        where
            K: Into<String>,
            V: Into<String>,
        {
            fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
                Self {
                    entries: iter
                        .into_iter()
                        .map(|(key, value)| (key.into(), value.into()))
                        .collect(),
                }
            }
        }
    };
}

string_record!(
    /// Install attribution delivered by the attribution provider.
    AttributionRecord
);
string_record!(
    /// Deep-link parameters delivered by the routing provider.
    RoutingRecord
);
string_record!(
    /// Attribution plus `deep_`-prefixed routing keys. Immutable once built.
    MergedRecord
);

impl AttributionRecord {
    /// Record standing in for a provider failure; merge logic treats it like any other record.
    #[must_use]
    pub fn failure(message: &str) -> Self {
        std::iter::once((ERROR_KEY, message)).collect()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    #[must_use]
    pub fn is_organic(&self) -> bool {
        is_organic_status(self.get(ATTRIBUTION_STATUS_KEY))
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.contains_key(ERROR_KEY)
    }
}

impl RoutingRecord {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }
}

impl MergedRecord {
    #[must_use]
    pub fn is_organic(&self) -> bool {
        is_organic_status(self.get(ATTRIBUTION_STATUS_KEY))
    }
}

fn is_organic_status(value: Option<&str>) -> bool {
    value.is_some_and(|status| status.eq_ignore_ascii_case(ORGANIC_STATUS))
}

/// Merges attribution with routing. Attribution keys always win; every routing
/// key lands under `deep_<key>` unless that name is already taken.
#[must_use]
pub fn merge_records(
    attribution: &AttributionRecord,
    routing: Option<&RoutingRecord>,
) -> MergedRecord {
    let mut entries = attribution.entries.clone();
    if let Some(routing) = routing {
        for (key, value) in &routing.entries {
            entries
                .entry(format!("{DEEP_KEY_PREFIX}{key}"))
                .or_insert_with(|| value.clone());
        }
    }
    MergedRecord { entries }
}

/// Renders a heterogeneous JSON value the way attribution consumers expect it.
#[must_use]
pub fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Initializing,
    Processing,
    Verifying,
    Verified,
    Active,
    Standby,
    Disconnected,
}

impl WorkflowState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Processing => "processing",
            Self::Verifying => "verifying",
            Self::Verified => "verified",
            Self::Active => "active",
            Self::Standby => "standby",
            Self::Disconnected => "disconnected",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initializing" => Some(Self::Initializing),
            "processing" => Some(Self::Processing),
            "verifying" => Some(Self::Verifying),
            "verified" => Some(Self::Verified),
            "active" => Some(Self::Active),
            "standby" => Some(Self::Standby),
            "disconnected" => Some(Self::Disconnected),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Active | Self::Standby)
    }

    /// State as shown to the user: `Disconnected` masks every non-terminal
    /// state while connectivity is missing.
    #[must_use]
    pub fn displayed(self, online: bool) -> Self {
        if online || self.is_terminal() {
            self
        } else {
            Self::Disconnected
        }
    }
}

impl Display for WorkflowState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single terminal navigation outcome of a launch.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "url", rename_all = "snake_case")]
pub enum Navigation {
    NativeContent,
    Destination(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOutcome {
    Granted,
    Denied,
    Deferred,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionPromptState {
    pub granted: bool,
    pub denied: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub asked_at: Option<OffsetDateTime>,
}

impl PermissionPromptState {
    /// Validates the granted/denied exclusivity invariant.
    ///
    /// # Errors
    /// Returns [`LaunchError::Validation`] when both flags are set.
    pub fn validate(&self) -> Result<(), LaunchError> {
        if self.granted && self.denied {
            return Err(LaunchError::Validation(
                "permission state cannot be both granted and denied".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn should_prompt(&self, now: OffsetDateTime) -> bool {
        if self.granted || self.denied {
            return false;
        }
        match self.asked_at {
            None => true,
            Some(asked_at) => now - asked_at >= PERMISSION_PROMPT_COOLDOWN,
        }
    }

    #[must_use]
    pub fn record(self, outcome: PermissionOutcome, now: OffsetDateTime) -> Self {
        let (granted, denied) = match outcome {
            PermissionOutcome::Granted => (true, false),
            PermissionOutcome::Denied => (false, true),
            PermissionOutcome::Deferred => (self.granted, self.denied),
        };
        Self {
            granted,
            denied,
            asked_at: Some(now),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetupState {
    pub is_first_run: bool,
    pub last_resolved_destination: Option<String>,
    pub last_resolved_status: Option<String>,
}

impl Default for SetupState {
    fn default() -> Self {
        Self {
            is_first_run: true,
            last_resolved_destination: None,
            last_resolved_status: None,
        }
    }
}

/// Reads a destination URL out of a push payload (`url` or `data.url`).
#[must_use]
pub fn extract_push_destination(payload: &Value) -> Option<String> {
    let candidate = payload
        .get("url")
        .or_else(|| payload.get("data").and_then(|data| data.get("url")))?
        .as_str()?
        .trim();

    if is_http_url(candidate) {
        Some(candidate.to_string())
    } else {
        None
    }
}

#[must_use]
pub fn is_http_url(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    (lower.starts_with("https://") && lower.len() > "https://".len())
        || (lower.starts_with("http://") && lower.len() > "http://".len())
}

/// Reversible encoding for values that should not sit in plaintext at rest.
/// Not a security boundary.
#[must_use]
pub fn obfuscate(plain: &str) -> String {
    hex::encode(xor_with_key(plain.as_bytes()))
}

/// Reverses [`obfuscate`].
///
/// # Errors
/// Returns [`LaunchError::Codec`] when the input is not valid hex or does not
/// decode to UTF-8.
pub fn deobfuscate(encoded: &str) -> Result<String, LaunchError> {
    let bytes = hex::decode(encoded)
        .map_err(|err| LaunchError::Codec(format!("invalid obfuscated payload: {err}")))?;
    String::from_utf8(xor_with_key(&bytes))
        .map_err(|err| LaunchError::Codec(format!("obfuscated payload is not UTF-8: {err}")))
}

fn xor_with_key(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .zip(OBFUSCATION_KEY.iter().cycle())
        .map(|(byte, key)| byte ^ key)
        .collect()
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LaunchError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LaunchError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LaunchError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LaunchError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LaunchError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LaunchError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            LaunchError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    #[test]
    fn merge_prefixes_routing_keys_and_keeps_attribution() {
        let attribution: AttributionRecord =
            [("af_status", "Non-organic"), ("campaign", "spring")].into_iter().collect();
        let routing: RoutingRecord =
            [("campaign", "deep-spring"), ("path", "/fish/pike")].into_iter().collect();

        let merged = merge_records(&attribution, Some(&routing));

        assert_eq!(merged.get("campaign"), Some("spring"));
        assert_eq!(merged.get("deep_campaign"), Some("deep-spring"));
        assert_eq!(merged.get("deep_path"), Some("/fish/pike"));
        assert_eq!(merged.len(), 4);
    }

    #[test]
    fn merge_never_overwrites_existing_deep_key() {
        let attribution: AttributionRecord =
            [("deep_path", "from-attribution")].into_iter().collect();
        let routing: RoutingRecord = [("path", "from-routing")].into_iter().collect();

        let merged = merge_records(&attribution, Some(&routing));

        assert_eq!(merged.get("deep_path"), Some("from-attribution"));
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn merge_without_routing_copies_attribution() {
        let attribution: AttributionRecord = [("af_status", "Organic")].into_iter().collect();
        let merged = merge_records(&attribution, None);
        assert_eq!(merged.entries(), attribution.entries());
        assert!(merged.is_organic());
    }

    #[test]
    fn ingestion_stringifies_heterogeneous_values() {
        let record = must_ok(AttributionRecord::from_json_object(&json!({
            "af_status": "Organic",
            "is_first_launch": true,
            "cost": 1.5,
            "clicks": 3,
            "media_source": null,
            "extra": {"a": 1}
        })));

        assert_eq!(record.get("is_first_launch"), Some("true"));
        assert_eq!(record.get("cost"), Some("1.5"));
        assert_eq!(record.get("clicks"), Some("3"));
        assert_eq!(record.get("media_source"), Some("null"));
        assert_eq!(record.get("extra"), Some("{\"a\":1}"));
        assert!(record.is_organic());
    }

    #[test]
    fn ingestion_rejects_non_objects() {
        let err = RoutingRecord::from_json_object(&json!(["a", "b"]));
        assert!(matches!(err, Err(LaunchError::Validation(_))));
    }

    #[test]
    fn failure_record_carries_error_marker() {
        let record = AttributionRecord::failure("timeout");
        assert!(record.is_failure());
        assert!(!record.is_organic());
        assert_eq!(record.get(ERROR_KEY), Some("timeout"));
    }

    #[test]
    fn prompt_cooldown_is_three_days() {
        let now = must_utc("2026-03-10T12:00:00Z");
        let two_days = PermissionPromptState {
            granted: false,
            denied: false,
            asked_at: Some(must_utc("2026-03-08T12:00:00Z")),
        };
        let four_days = PermissionPromptState {
            asked_at: Some(must_utc("2026-03-06T12:00:00Z")),
            ..two_days
        };

        assert!(!two_days.should_prompt(now));
        assert!(four_days.should_prompt(now));
        assert!(PermissionPromptState::default().should_prompt(now));
    }

    #[test]
    fn answered_prompt_never_prompts_again() {
        let now = must_utc("2026-03-10T12:00:00Z");
        let later = must_utc("2027-03-10T12:00:00Z");

        let granted = PermissionPromptState::default().record(PermissionOutcome::Granted, now);
        let denied = PermissionPromptState::default().record(PermissionOutcome::Denied, now);
        let deferred = PermissionPromptState::default().record(PermissionOutcome::Deferred, now);

        assert!(!granted.should_prompt(later));
        assert!(!denied.should_prompt(later));
        assert!(deferred.should_prompt(later));
        assert!(!deferred.should_prompt(now));
        assert!(granted.validate().is_ok());
    }

    #[test]
    fn conflicting_permission_flags_fail_validation() {
        let state = PermissionPromptState {
            granted: true,
            denied: true,
            asked_at: None,
        };
        assert!(state.validate().is_err());
    }

    #[test]
    fn obfuscated_routing_hides_plaintext() {
        let plain = r#"{"path":"/fish/pike"}"#;
        let encoded = obfuscate(plain);
        assert!(!encoded.contains("fish"));
        assert_eq!(must_ok(deobfuscate(&encoded)), plain);
        assert!(matches!(deobfuscate("zz"), Err(LaunchError::Codec(_))));
    }

    #[test]
    fn push_payload_destination_extraction() {
        assert_eq!(
            extract_push_destination(&json!({"url": "https://example.test/a"})),
            Some("https://example.test/a".to_string())
        );
        assert_eq!(
            extract_push_destination(&json!({"data": {"url": " http://example.test/b "}})),
            Some("http://example.test/b".to_string())
        );
        assert_eq!(extract_push_destination(&json!({"url": "ftp://x"})), None);
        assert_eq!(extract_push_destination(&json!({"aps": {}})), None);
    }

    #[test]
    fn disconnected_masks_only_non_terminal_states() {
        assert_eq!(
            WorkflowState::Verifying.displayed(false),
            WorkflowState::Disconnected
        );
        assert_eq!(WorkflowState::Standby.displayed(false), WorkflowState::Standby);
        assert_eq!(WorkflowState::Processing.displayed(true), WorkflowState::Processing);
        assert_eq!(WorkflowState::parse("verified"), Some(WorkflowState::Verified));
    }

    #[test]
    fn navigation_serializes_with_kind_tag() {
        let value = must_ok(serde_json::to_value(Navigation::Destination(
            "https://example.test".to_string(),
        )));
        assert_eq!(value, json!({"kind": "destination", "url": "https://example.test"}));
        let native = must_ok(serde_json::to_value(Navigation::NativeContent));
        assert_eq!(native, json!({"kind": "native_content"}));
    }

    proptest! {
        #[test]
        fn prop_merge_keeps_attribution_and_adds_every_unshadowed_routing_key(
            attribution in prop::collection::btree_map("[a-z_]{1,8}", "[a-z0-9]{0,6}", 0..12),
            routing in prop::collection::btree_map("[a-z_]{1,8}", "[a-z0-9]{0,6}", 0..12),
        ) {
            let attribution_record: AttributionRecord = attribution.clone().into_iter().collect();
            let routing_record: RoutingRecord = routing.clone().into_iter().collect();
            let merged = merge_records(&attribution_record, Some(&routing_record));

            for (key, value) in &attribution {
                prop_assert_eq!(merged.get(key), Some(value.as_str()));
            }
            for (key, value) in &routing {
                let deep_key = format!("{DEEP_KEY_PREFIX}{key}");
                match attribution.get(&deep_key) {
                    Some(existing) => prop_assert_eq!(merged.get(&deep_key), Some(existing.as_str())),
                    None => prop_assert_eq!(merged.get(&deep_key), Some(value.as_str())),
                }
            }
        }
    }
}
