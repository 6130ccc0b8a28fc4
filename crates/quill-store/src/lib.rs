use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quill_core::{
    ChangeTracker, ChatMessage, FileChangeRecord, SessionRecord, SessionStats, SessionStore,
    runtime_dir,
};
use rusqlite::{Connection, OptionalExtension, params};
use std::fs;
use std::path::{Path, PathBuf};

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            cwd TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id);",
    ),
    (
        2,
        "CREATE TABLE IF NOT EXISTS file_changes (
            id INTEGER PRIMARY KEY,
            session_id TEXT NOT NULL,
            path TEXT NOT NULL,
            action TEXT NOT NULL,
            created_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_file_changes_session ON file_changes(session_id, id);",
    ),
];

/// SQLite-backed conversation history, one database per workspace unless
/// `session.db_path` points elsewhere.
pub struct SqliteStore {
    db_path: PathBuf,
    cwd: String,
}

impl SqliteStore {
    pub fn new(workspace: &Path, db_path: Option<&Path>) -> Result<Self> {
        let db_path = match db_path {
            Some(path) => path.to_path_buf(),
            None => runtime_dir(workspace).join("sessions.db"),
        };
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = Self {
            db_path,
            cwd: workspace.to_string_lossy().to_string(),
        };
        store
            .init_db()
            .with_context(|| format!("failed to open session database {}", store.db_path.display()))?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn db(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    /// Most recently updated first.
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.model, s.cwd, s.created_at, s.updated_at,
                    (SELECT COUNT(1) FROM messages m WHERE m.session_id = s.id)
             FROM sessions s ORDER BY s.updated_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, model, cwd, created_at, updated_at, count) = row?;
            out.push(SessionRecord {
                id,
                model,
                cwd,
                created_at: parse_timestamp(&created_at)?,
                updated_at: parse_timestamp(&updated_at)?,
                message_count: count.max(0) as u64,
            });
        }
        Ok(out)
    }

    pub fn stats(&self, session_id: &str) -> Result<SessionStats> {
        let conn = self.db()?;
        let mut stats = SessionStats::default();
        let mut stmt =
            conn.prepare("SELECT role, COUNT(1) FROM messages WHERE session_id = ?1 GROUP BY role")?;
        let rows = stmt.query_map([session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (role, count) = row?;
            let count = count.max(0) as u64;
            match role.as_str() {
                "user" => stats.user_messages = count,
                "assistant" => stats.assistant_messages = count,
                "tool" => stats.tool_messages = count,
                _ => {}
            }
        }
        let changes: i64 = conn.query_row(
            "SELECT COUNT(1) FROM file_changes WHERE session_id = ?1",
            [session_id],
            |r| r.get(0),
        )?;
        stats.file_changes = changes.max(0) as u64;
        Ok(stats)
    }

    /// Oldest first.
    pub fn file_changes(&self, session_id: &str) -> Result<Vec<FileChangeRecord>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT path, action, created_at FROM file_changes WHERE session_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (path, action, created_at) = row?;
            out.push(FileChangeRecord {
                path,
                action,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(out)
    }

    fn load_session(&self, conn: &Connection, session_id: &str) -> Result<Option<SessionRecord>> {
        let row = conn
            .query_row(
                "SELECT model, cwd, created_at, updated_at,
                        (SELECT COUNT(1) FROM messages WHERE session_id = ?1)
                 FROM sessions WHERE id = ?1",
                [session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((model, cwd, created_at, updated_at, count)) = row else {
            return Ok(None);
        };
        Ok(Some(SessionRecord {
            id: session_id.to_string(),
            model,
            cwd,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
            message_count: count.max(0) as u64,
        }))
    }

    fn touch(&self, conn: &Connection, session_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO sessions (id, model, cwd, created_at, updated_at) VALUES (?1, '', ?2, ?3, ?3)
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
            params![session_id, self.cwd, now],
        )?;
        Ok(())
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.db()?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
             );",
        )?;

        for (version, sql) in MIGRATIONS {
            let already: i64 = conn.query_row(
                "SELECT COUNT(1) FROM schema_migrations WHERE version = ?1",
                [*version],
                |r| r.get(0),
            )?;
            if already == 0 {
                conn.execute_batch(sql)?;
                conn.execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                    params![version, Utc::now().to_rfc3339()],
                )?;
            }
        }
        Ok(())
    }
}

impl ChangeTracker for SqliteStore {
    fn track_change(&self, session_id: &str, path: &str, action: &str) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO file_changes (session_id, path, action, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, path, action, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

impl SessionStore for SqliteStore {
    fn get_or_create(&self, session_id: &str, model: &str) -> Result<SessionRecord> {
        let conn = self.db()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO sessions (id, model, cwd, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET model = excluded.model, updated_at = excluded.updated_at",
            params![session_id, model, self.cwd, now],
        )?;
        self.load_session(&conn, session_id)?
            .with_context(|| format!("session '{session_id}' vanished after insert"))
    }

    fn append(&self, session_id: &str, message: &ChatMessage) -> Result<()> {
        let conn = self.db()?;
        self.touch(&conn, session_id)?;
        conn.execute(
            "INSERT INTO messages (session_id, role, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                session_id,
                message.role(),
                serde_json::to_string(message)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn history(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.db()?;
        let mut stmt =
            conn.prepare("SELECT payload FROM messages WHERE session_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map([session_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for payload in rows {
            let payload = payload?;
            out.push(
                serde_json::from_str(&payload)
                    .with_context(|| format!("corrupt message in session '{session_id}'"))?,
            );
        }
        Ok(out)
    }

    fn clear(&self, session_id: &str) -> Result<()> {
        let conn = self.db()?;
        conn.execute("DELETE FROM messages WHERE session_id = ?1", [session_id])?;
        conn.execute("DELETE FROM file_changes WHERE session_id = ?1", [session_id])?;
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp '{raw}'"))?
        .with_timezone(&Utc))
}
