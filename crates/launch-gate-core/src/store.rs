use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    deobfuscate, format_rfc3339, obfuscate, parse_rfc3339_utc, AttributionRecord,
    PermissionPromptState, RoutingRecord, SetupState,
};

/// Logical keys of the durable launch state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StoreKey {
    AttributionRecord,
    RoutingRecord,
    RoutingFinalized,
    ResolvedDestination,
    SetupStatus,
    FirstRun,
    PermissionGranted,
    PermissionDenied,
    PermissionAskedAt,
}

impl StoreKey {
    pub const ALL: [Self; 9] = [
        Self::AttributionRecord,
        Self::RoutingRecord,
        Self::RoutingFinalized,
        Self::ResolvedDestination,
        Self::SetupStatus,
        Self::FirstRun,
        Self::PermissionGranted,
        Self::PermissionDenied,
        Self::PermissionAskedAt,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AttributionRecord => "attribution_record",
            Self::RoutingRecord => "routing_record",
            Self::RoutingFinalized => "routing_finalized",
            Self::ResolvedDestination => "resolved_destination_url",
            Self::SetupStatus => "setup_status",
            Self::FirstRun => "first_run",
            Self::PermissionGranted => "permission_granted",
            Self::PermissionDenied => "permission_denied",
            Self::PermissionAskedAt => "permission_asked_at",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == value)
    }
}

/// Everything the store holds, decoded. Used for inspection surfaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedState {
    pub attribution: Option<AttributionRecord>,
    pub routing: Option<RoutingRecord>,
    pub routing_finalized: bool,
    pub setup: SetupState,
    pub permission: PermissionPromptState,
}

/// Durable key/value launch state with typed accessors.
///
/// Backends only provide raw string reads and batch writes; a batch MUST be
/// applied as a whole and be durable before it returns. Encoding (JSON, booleans, timestamps, routing
/// obfuscation) lives in the provided methods so all backends agree on the
/// at-rest layout.
pub trait LaunchStore: Send {
    #[allow(clippy::missing_errors_doc)]
    fn read_value(&self, key: StoreKey) -> Result<Option<String>>;

    /// Applies every entry or none of them. `None` removes the key.
    #[allow(clippy::missing_errors_doc)]
    fn write_values(&mut self, entries: &[(StoreKey, Option<&str>)]) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn clear_values(&mut self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn write_value(&mut self, key: StoreKey, value: &str) -> Result<()> {
        self.write_values(&[(key, Some(value))])
    }

    #[allow(clippy::missing_errors_doc)]
    fn attribution_record(&self) -> Result<Option<AttributionRecord>> {
        self.read_value(StoreKey::AttributionRecord)?
            .map(|raw| serde_json::from_str(&raw).context("invalid stored attribution record"))
            .transpose()
    }

    #[allow(clippy::missing_errors_doc)]
    fn put_attribution_record(&mut self, record: &AttributionRecord) -> Result<()> {
        let raw = serde_json::to_string(record).context("failed to serialize attribution record")?;
        self.write_value(StoreKey::AttributionRecord, &raw)
    }

    #[allow(clippy::missing_errors_doc)]
    fn routing_record(&self) -> Result<Option<RoutingRecord>> {
        let Some(encoded) = self.read_value(StoreKey::RoutingRecord)? else {
            return Ok(None);
        };
        let raw = deobfuscate(&encoded).map_err(|err| anyhow!("stored routing record: {err}"))?;
        let record = serde_json::from_str(&raw).context("invalid stored routing record")?;
        Ok(Some(record))
    }

    #[allow(clippy::missing_errors_doc)]
    fn put_routing_record(&mut self, record: &RoutingRecord) -> Result<()> {
        let raw = serde_json::to_string(record).context("failed to serialize routing record")?;
        self.write_value(StoreKey::RoutingRecord, &obfuscate(&raw))
    }

    #[allow(clippy::missing_errors_doc)]
    fn routing_finalized(&self) -> Result<bool> {
        read_flag(self, StoreKey::RoutingFinalized, false)
    }

    #[allow(clippy::missing_errors_doc)]
    fn set_routing_finalized(&mut self, finalized: bool) -> Result<()> {
        self.write_value(StoreKey::RoutingFinalized, flag_to_str(finalized))
    }

    #[allow(clippy::missing_errors_doc)]
    fn resolved_destination(&self) -> Result<Option<String>> {
        self.read_value(StoreKey::ResolvedDestination)
    }

    #[allow(clippy::missing_errors_doc)]
    fn put_resolved_destination(&mut self, url: &str) -> Result<()> {
        self.write_value(StoreKey::ResolvedDestination, url)
    }

    #[allow(clippy::missing_errors_doc)]
    fn setup_status(&self) -> Result<Option<String>> {
        self.read_value(StoreKey::SetupStatus)
    }

    #[allow(clippy::missing_errors_doc)]
    fn put_setup_status(&mut self, status: &str) -> Result<()> {
        self.write_value(StoreKey::SetupStatus, status)
    }

    /// `true` until a remote destination resolution succeeds once.
    #[allow(clippy::missing_errors_doc)]
    fn is_first_run(&self) -> Result<bool> {
        read_flag(self, StoreKey::FirstRun, true)
    }

    #[allow(clippy::missing_errors_doc)]
    fn set_first_run(&mut self, first_run: bool) -> Result<()> {
        self.write_value(StoreKey::FirstRun, flag_to_str(first_run))
    }

    #[allow(clippy::missing_errors_doc)]
    fn permission_state(&self) -> Result<PermissionPromptState> {
        let asked_at = self
            .read_value(StoreKey::PermissionAskedAt)?
            .map(|raw| {
                parse_rfc3339_utc(&raw).map_err(|err| anyhow!("stored permission_asked_at: {err}"))
            })
            .transpose()?;
        let state = PermissionPromptState {
            granted: read_flag(self, StoreKey::PermissionGranted, false)?,
            denied: read_flag(self, StoreKey::PermissionDenied, false)?,
            asked_at,
        };
        state
            .validate()
            .map_err(|err| anyhow!("stored permission state: {err}"))?;
        Ok(state)
    }

    #[allow(clippy::missing_errors_doc)]
    fn put_permission_state(&mut self, state: &PermissionPromptState) -> Result<()> {
        state
            .validate()
            .map_err(|err| anyhow!("refusing to persist permission state: {err}"))?;
        let asked_at = state
            .asked_at
            .map(|value| format_rfc3339(value).map_err(|err| anyhow!(err.to_string())))
            .transpose()?;
        self.write_values(&[
            (StoreKey::PermissionGranted, Some(flag_to_str(state.granted))),
            (StoreKey::PermissionDenied, Some(flag_to_str(state.denied))),
            (StoreKey::PermissionAskedAt, asked_at.as_deref()),
        ])
        .context("failed to persist permission state")
    }

    #[allow(clippy::missing_errors_doc)]
    fn setup_state(&self) -> Result<SetupState> {
        Ok(SetupState {
            is_first_run: self.is_first_run()?,
            last_resolved_destination: self.resolved_destination()?,
            last_resolved_status: self.setup_status()?,
        })
    }

    /// Drops every persisted key; the next launch behaves like a first install.
    #[allow(clippy::missing_errors_doc)]
    fn reset(&mut self) -> Result<()> {
        self.clear_values()
            .context("failed to reset launch state")
    }

    #[allow(clippy::missing_errors_doc)]
    fn snapshot(&self) -> Result<PersistedState> {
        Ok(PersistedState {
            attribution: self.attribution_record()?,
            routing: self.routing_record()?,
            routing_finalized: self.routing_finalized()?,
            setup: self.setup_state()?,
            permission: self.permission_state()?,
        })
    }
}

fn read_flag<S: LaunchStore + ?Sized>(store: &S, key: StoreKey, default: bool) -> Result<bool> {
    match store.read_value(key)?.as_deref() {
        None => Ok(default),
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(other) => Err(anyhow!(
            "invalid stored flag for {}: '{other}'",
            key.as_str()
        )),
    }
}

fn flag_to_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Process-local store. Clones share the same map, so a host can keep a
/// handle while the orchestrator owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryLaunchStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    values: BTreeMap<StoreKey, String>,
    writes: Vec<StoreKey>,
}

impl MemoryLaunchStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys in the order they were written.
    ///
    /// # Errors
    /// Returns an error when the shared map lock is poisoned.
    pub fn write_log(&self) -> Result<Vec<StoreKey>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("memory launch store lock poisoned"))?;
        Ok(inner.writes.clone())
    }

    /// Raw at-rest value, bypassing decoding.
    ///
    /// # Errors
    /// Returns an error when the shared map lock is poisoned.
    pub fn raw_value(&self, key: StoreKey) -> Result<Option<String>> {
        self.read_value(key)
    }
}

impl LaunchStore for MemoryLaunchStore {
    fn read_value(&self, key: StoreKey) -> Result<Option<String>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("memory launch store lock poisoned"))?;
        Ok(inner.values.get(&key).cloned())
    }

    fn write_values(&mut self, entries: &[(StoreKey, Option<&str>)]) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("memory launch store lock poisoned"))?;
        for (key, value) in entries {
            match value {
                Some(value) => {
                    inner.values.insert(*key, (*value).to_string());
                }
                None => {
                    inner.values.remove(key);
                }
            }
            inner.writes.push(*key);
        }
        Ok(())
    }

    fn clear_values(&mut self) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("memory launch store lock poisoned"))?;
        inner.values.clear();
        Ok(())
    }
}
