use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};

use crate::models::Tool;
use crate::tool_manager::{EnsureOutcome, ToolReport};

/// Database schema version.
///
/// Bump this when introducing a new migration.
const SCHEMA_VERSION: i64 = 1;

const DB_FILE: &str = "vidgrab.sqlite3";
const COOKIE_FILE: &str = "cookies.txt";
const LOG_FILE: &str = "vidgrab.log";

/// Database handle wrapper.
///
/// `rusqlite::Connection` is not `Sync`; keep access on one thread.
pub struct Db {
    conn: Connection,
    path: PathBuf,
}

/// Last recorded `ensure` result for a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCheckRow {
    pub tool: Tool,
    pub path: String,
    pub outcome: Option<String>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Determines the per-user app data directory.
///
/// macOS:  ~/Library/Application Support/com.vidgrab.vidgrab
/// Linux:  ~/.local/share/vidgrab (depending on XDG)
pub fn app_project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "vidgrab", "vidgrab")
        .ok_or_else(|| anyhow!("failed to resolve per-user app data directory"))
}

/// Returns the directory where vidgrab stores its state (db, logs, tools).
pub fn app_data_dir() -> Result<PathBuf> {
    Ok(app_project_dirs()?.data_dir().to_path_buf())
}

/// Create required directories for state storage: data dir, logs dir, tools dir.
pub fn ensure_app_dirs() -> Result<AppDirs> {
    AppDirs::create(app_data_dir()?)
}

#[derive(Debug, Clone)]
pub struct AppDirs {
    pub data: PathBuf,
    pub logs: PathBuf,
    /// Install directory for the managed tools.
    pub tools: PathBuf,
}

impl AppDirs {
    /// Lay out (and create) the state directories under `data`.
    pub fn create(data: PathBuf) -> Result<Self> {
        let logs = data.join("logs");
        let tools = data.join("tools");

        fs::create_dir_all(&data).with_context(|| format!("create data dir: {}", data.display()))?;
        fs::create_dir_all(&logs).with_context(|| format!("create logs dir: {}", logs.display()))?;
        fs::create_dir_all(&tools)
            .with_context(|| format!("create tools dir: {}", tools.display()))?;

        Ok(Self { data, logs, tools })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data.join(DB_FILE)
    }

    pub fn cookie_path(&self) -> PathBuf {
        self.data.join(COOKIE_FILE)
    }

    /// File the logger appends to, alongside stderr.
    pub fn log_path(&self) -> PathBuf {
        self.logs.join(LOG_FILE)
    }
}

impl Db {
    /// Open database connection at the per-user location and apply migrations.
    pub fn open(dirs: &AppDirs) -> Result<Self> {
        Self::open_at(&dirs.db_path())
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)
            .with_context(|| format!("open sqlite db: {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrate(&mut conn)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Record the result of one tool check, replacing the previous one.
    pub fn record_tool_check(&mut self, report: &ToolReport) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO tool_checks (tool, path, outcome, error, checked_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(tool) DO UPDATE SET
              path = excluded.path,
              outcome = excluded.outcome,
              error = excluded.error,
              checked_at = excluded.checked_at
            "#,
            params![
                report.tool.as_str(),
                report.path.to_string_lossy(),
                report.outcome.map(EnsureOutcome::as_str),
                report.error,
                report.checked_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Latest check per tool, in startup check order.
    pub fn last_tool_checks(&self) -> Result<Vec<ToolCheckRow>> {
        let mut out = Vec::new();
        for tool in Tool::ALL {
            let row = self
                .conn
                .query_row(
                    r#"
                    SELECT path, outcome, error, checked_at
                    FROM tool_checks
                    WHERE tool = ?1
                    "#,
                    params![tool.as_str()],
                    |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, Option<String>>(1)?,
                            r.get::<_, Option<String>>(2)?,
                            r.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;

            if let Some((path, outcome, error, checked_at)) = row {
                let checked_at = DateTime::parse_from_rfc3339(&checked_at)
                    .with_context(|| format!("bad timestamp for {tool}: {checked_at}"))?
                    .with_timezone(&Utc);
                out.push(ToolCheckRow {
                    tool,
                    path,
                    outcome,
                    error,
                    checked_at,
                });
            }
        }
        Ok(out)
    }
}

/// Apply migrations to bring database to current schema.
fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );
        "#,
    )?;

    let existing: Option<String> = conn
        .query_row(
            r#"SELECT value FROM meta WHERE key = 'schema_version'"#,
            [],
            |r| r.get(0),
        )
        .optional()?;

    let current_version: i64 = existing
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        return Err(anyhow!(
            "db schema version {} is newer than app supports {}",
            current_version,
            SCHEMA_VERSION
        ));
    }

    if current_version == 0 {
        migration_v1(conn)?;
        set_schema_version(conn, 1)?;
    }

    Ok(())
}

fn set_schema_version(conn: &mut Connection, v: i64) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO meta(key, value) VALUES('schema_version', ?1)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
        params![v.to_string()],
    )?;
    Ok(())
}

fn migration_v1(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
          key TEXT PRIMARY KEY,
          value_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tool_checks (
          tool TEXT PRIMARY KEY,
          path TEXT NOT NULL,
          outcome TEXT NULL,
          error TEXT NULL,
          checked_at TEXT NOT NULL
        );
        "#,
    )?;

    Ok(())
}
