use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Device-local state. Everything shared between devices lives in the backend.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub user_id: String,
    pub display_name: String,
    pub recovery_code: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Identity as written by callers. The store stamps creation and update times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityFields {
    pub user_id: String,
    pub display_name: String,
    pub recovery_code: String,
    pub email: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }

    pub fn load_identity(&self) -> Result<Option<IdentityRecord>> {
        let conn = self.conn.lock();
        query_identity(&conn)
    }

    /// Replaces the device identity, keeping the original creation time.
    pub fn save_identity(&self, fields: &IdentityFields) -> Result<IdentityRecord> {
        if fields.user_id.trim().is_empty() {
            bail!("storage: user id required");
        }
        let now = Utc::now().timestamp();

        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO identity (slot, user_id, display_name, recovery_code, email, created_at, updated_at)
VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(slot) DO UPDATE SET
  user_id = excluded.user_id,
  display_name = excluded.display_name,
  recovery_code = excluded.recovery_code,
  email = excluded.email,
  updated_at = excluded.updated_at
"#,
            params![
                fields.user_id,
                fields.display_name,
                fields.recovery_code,
                fields.email,
                now,
                now,
            ],
        )
        .context("storage: save identity")?;
        query_identity(&conn)?.ok_or_else(|| anyhow!("storage: identity missing after save"))
    }
}

fn query_identity(conn: &Connection) -> Result<Option<IdentityRecord>> {
    conn.query_row(
        r#"
SELECT user_id, display_name, recovery_code, email, created_at, updated_at
FROM identity
WHERE slot = 1
"#,
        [],
        identity_from_row,
    )
    .optional()
    .context("storage: query identity")
}

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<IdentityRecord> {
    let created: i64 = row.get(4)?;
    let updated: i64 = row.get(5)?;
    Ok(IdentityRecord {
        user_id: row.get(0)?,
        display_name: row.get(1)?,
        recovery_code: row.get(2)?,
        email: row.get(3)?,
        created_at: Utc
            .timestamp_opt(created, 0)
            .single()
            .unwrap_or_else(Utc::now),
        updated_at: Utc
            .timestamp_opt(updated, 0)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let migrations = migrations();
    for (idx, sql) in migrations.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![
                version,
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::from_secs(0))
                    .as_secs() as i64,
            ],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![r#"
CREATE TABLE IF NOT EXISTS identity (
  slot INTEGER PRIMARY KEY CHECK (slot = 1),
  user_id TEXT NOT NULL,
  display_name TEXT NOT NULL,
  recovery_code TEXT NOT NULL,
  email TEXT,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);
"#]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("comic-daily").join("state.db"))
}
