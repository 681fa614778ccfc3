#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use launch_gate_core::{format_rfc3339, now_utc, LaunchStore, StoreKey};
use rusqlite::{params, Connection, OptionalExtension};

const LAUNCH_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LAUNCH_V1: &str = r"
CREATE TABLE IF NOT EXISTS launch_state (
  state_key TEXT PRIMARY KEY CHECK (
    state_key IN (
      'attribution_record',
      'routing_record',
      'routing_finalized',
      'resolved_destination_url',
      'setup_status',
      'first_run',
      'permission_granted',
      'permission_denied',
      'permission_asked_at'
    )
  ),
  state_value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// `SQLite`-backed launch state. Every batch of writes commits in one
/// transaction, so it is durable once the call returns.
pub struct SqliteLaunchStore {
    conn: Connection,
    // Shadows `resolved_destination_url`; `None` until primed by `migrate`.
    destination_cache: Option<Option<String>>,
}

impl SqliteLaunchStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            destination_cache: None,
        })
    }

    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LAUNCH_V1)
            .context("failed to apply launch state schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LAUNCH_MIGRATION_VERSION, now],
            )
            .context("failed to register launch state schema migration")?;

        let destination = self.select_value(StoreKey::ResolvedDestination)?;
        self.destination_cache = Some(destination);
        tracing::debug!("launch state schema ready");
        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()
            .context("failed to read schema version")
            .map(Option::flatten)
    }

    fn select_value(&self, key: StoreKey) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT state_value FROM launch_state WHERE state_key = ?1",
                params![key.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read launch state {}", key.as_str()))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl LaunchStore for SqliteLaunchStore {
    fn read_value(&self, key: StoreKey) -> Result<Option<String>> {
        if key == StoreKey::ResolvedDestination {
            if let Some(cached) = &self.destination_cache {
                return Ok(cached.clone());
            }
        }
        self.select_value(key)
    }

    fn write_values(&mut self, entries: &[(StoreKey, Option<&str>)]) -> Result<()> {
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let tx = self
            .conn
            .transaction()
            .context("failed to begin launch state transaction")?;
        for (key, value) in entries {
            let written = match value {
                Some(value) => tx.execute(
                    "INSERT INTO launch_state(state_key, state_value, updated_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(state_key) DO UPDATE SET
                       state_value = excluded.state_value,
                       updated_at = excluded.updated_at",
                    params![key.as_str(), value, now],
                ),
                None => tx.execute(
                    "DELETE FROM launch_state WHERE state_key = ?1",
                    params![key.as_str()],
                ),
            };
            written.with_context(|| format!("failed to write launch state {}", key.as_str()))?;
        }
        tx.commit()
            .context("failed to commit launch state transaction")?;

        for (key, value) in entries {
            if *key == StoreKey::ResolvedDestination {
                self.destination_cache = Some(value.map(str::to_string));
            }
        }
        Ok(())
    }

    fn clear_values(&mut self) -> Result<()> {
        self.conn
            .execute("DELETE FROM launch_state", [])
            .context("failed to clear launch state")?;
        self.destination_cache = Some(None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use launch_gate_core::{AttributionRecord, PermissionPromptState, RoutingRecord};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteLaunchStore {
        let mut store = must(SqliteLaunchStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("launch-gate-store-{}.sqlite3", Ulid::new()))
    }

    #[test]
    fn typed_accessors_round_trip() {
        let mut store = fixture_store();
        let attribution: AttributionRecord =
            [("af_status", "Non-organic"), ("campaign", "spring")].into_iter().collect();
        let routing: RoutingRecord = [("path", "/bait/worm")].into_iter().collect();

        must(store.put_attribution_record(&attribution));
        must(store.put_routing_record(&routing));
        must(store.set_routing_finalized(true));
        must(store.put_resolved_destination("https://example.test/landing"));
        must(store.put_setup_status("Active"));
        must(store.set_first_run(false));

        let snapshot = must(store.snapshot());
        assert_eq!(snapshot.attribution, Some(attribution));
        assert_eq!(snapshot.routing, Some(routing));
        assert!(snapshot.routing_finalized);
        assert!(!snapshot.setup.is_first_run);
        assert_eq!(
            snapshot.setup.last_resolved_destination.as_deref(),
            Some("https://example.test/landing")
        );
        assert_eq!(snapshot.setup.last_resolved_status.as_deref(), Some("Active"));
    }

    #[test]
    fn routing_record_is_not_stored_in_plaintext() {
        let mut store = fixture_store();
        let routing: RoutingRecord = [("path", "/bait/worm")].into_iter().collect();
        must(store.put_routing_record(&routing));

        let raw: String = match store.connection().query_row(
            "SELECT state_value FROM launch_state WHERE state_key = 'routing_record'",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to read raw routing row: {err}"),
        };
        assert!(!raw.contains("worm"));
        assert!(!raw.contains("path"));
    }

    #[test]
    fn state_survives_reopen() {
        let db_path = unique_temp_db_path();
        {
            let mut store = must(SqliteLaunchStore::open(&db_path));
            must(store.migrate());
            must(store.put_resolved_destination("https://example.test/cached"));
            must(store.set_first_run(false));
            must(store.put_permission_state(&PermissionPromptState {
                granted: true,
                denied: false,
                asked_at: None,
            }));
        }

        let mut reopened = must(SqliteLaunchStore::open(&db_path));
        must(reopened.migrate());
        assert_eq!(
            must(reopened.resolved_destination()).as_deref(),
            Some("https://example.test/cached")
        );
        assert!(!must(reopened.is_first_run()));
        assert!(must(reopened.permission_state()).granted);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn destination_cache_tracks_writes_and_reset() {
        let mut store = fixture_store();
        assert_eq!(must(store.resolved_destination()), None);

        must(store.put_resolved_destination("https://example.test/one"));
        assert_eq!(
            store.destination_cache,
            Some(Some("https://example.test/one".to_string()))
        );

        must(store.reset());
        assert_eq!(must(store.resolved_destination()), None);
        assert!(must(store.is_first_run()));
    }

    #[test]
    fn failed_permission_write_leaves_previous_state_intact() {
        let mut store = fixture_store();
        let denied = PermissionPromptState {
            granted: false,
            denied: true,
            asked_at: None,
        };
        must(store.put_permission_state(&denied));

        if let Err(err) = store.connection().execute_batch(
            "CREATE TRIGGER reject_denied_update BEFORE UPDATE ON launch_state
             WHEN NEW.state_key = 'permission_denied'
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        ) {
            panic!("failed to install trigger: {err}");
        }

        let result = store.put_permission_state(&PermissionPromptState {
            granted: true,
            denied: false,
            asked_at: None,
        });
        assert!(result.is_err());
        assert_eq!(must(store.permission_state()), denied);
        assert_eq!(must(store.read_value(StoreKey::PermissionGranted)).as_deref(), Some("false"));
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let mut store = fixture_store();
        must(store.put_setup_status("Active"));
        must(store.migrate());
        must(store.migrate());

        assert_eq!(must(store.schema_version()), Some(LAUNCH_MIGRATION_VERSION));
        assert_eq!(must(store.setup_status()).as_deref(), Some("Active"));
    }

    #[test]
    fn unknown_state_keys_are_rejected_by_schema() {
        let store = fixture_store();
        let result = store.connection().execute(
            "INSERT INTO launch_state(state_key, state_value, updated_at) VALUES ('bogus', 'x', 'now')",
            [],
        );
        assert!(result.is_err());
    }
}
