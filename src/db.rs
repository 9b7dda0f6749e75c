//! Append-only persistence for users, reactions, effects, and sessions.
//!
//! Backed by SQLite (default, file under `data/`) or PostgreSQL, chosen by
//! the `DATABASE_URL` scheme. DDL differs per backend; DML is shared and
//! uses `$n` placeholders, which both accept. Every write helper is
//! best-effort from the caller's point of view: a failure is returned for
//! the caller to log, and nothing upstream is torn down because of it.

use std::path::Path;

use log::info;
use serde::Serialize;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};

use crate::messages::EffectType;
use crate::store::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Sqlite,
    Postgres,
}

/// One effect decision as persisted (and broadcast). Automatic effects
/// carry the active-user count; manual ones carry the injector's session
/// and video position instead.
#[derive(Debug, Clone)]
pub struct EffectRecord {
    pub timestamp: i64,
    pub effect_type: EffectType,
    pub intensity: f64,
    pub duration_ms: i64,
    pub session_id: Option<String>,
    pub video_time: Option<f64>,
    pub active_users: Option<i64>,
}

#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
    backend: Backend,
    display_path: String,
}

impl Database {
    /// Open the database, creating the SQLite data directory and all
    /// tables as needed. A failure here is fatal at boot.
    pub async fn connect(url: &str) -> Result<Self, String> {
        sqlx::any::install_default_drivers();

        let backend = if url.starts_with("postgres") {
            Backend::Postgres
        } else {
            Backend::Sqlite
        };

        let display_path = match backend {
            Backend::Postgres => "postgresql".to_string(),
            Backend::Sqlite => {
                let path = sqlite_file_path(url);
                if let Some(parent) = Path::new(&path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)
                            .map_err(|e| format!("failed to create {}: {e}", parent.display()))?;
                    }
                }
                path
            }
        };

        // SQLite serializes writers at the file level; a single pooled
        // connection avoids busy errors under concurrent appends.
        let max_connections = match backend {
            Backend::Sqlite => 1,
            Backend::Postgres => 8,
        };

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| format!("failed to open database at {display_path}: {e}"))?;

        let db = Self {
            pool,
            backend,
            display_path,
        };
        db.init_schema().await?;
        info!("database ready at {}", db.display_path);
        Ok(db)
    }

    /// Where the data lives, for the status endpoint.
    pub fn display_path(&self) -> &str {
        &self.display_path
    }

    async fn init_schema(&self) -> Result<(), String> {
        let statements: &[&str] = match self.backend {
            Backend::Sqlite => &[
                "CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    experiment_group TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                )",
                "CREATE TABLE IF NOT EXISTS reactions_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    is_smiling BOOLEAN,
                    is_surprised BOOLEAN,
                    is_concentrating BOOLEAN,
                    is_hand_up BOOLEAN,
                    nod_count INTEGER DEFAULT 0,
                    sway_vertical_count INTEGER DEFAULT 0,
                    sway_horizontal_count INTEGER DEFAULT 0,
                    shake_head_count INTEGER DEFAULT 0,
                    cheer_count INTEGER DEFAULT 0,
                    clap_count INTEGER DEFAULT 0,
                    video_time REAL,
                    session_id TEXT
                )",
                "CREATE TABLE IF NOT EXISTS effects_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp INTEGER NOT NULL,
                    effect_type TEXT NOT NULL,
                    intensity REAL NOT NULL,
                    duration_ms INTEGER NOT NULL,
                    session_id TEXT,
                    video_time REAL,
                    active_users INTEGER
                )",
                "CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    video_id TEXT NOT NULL,
                    started_at INTEGER NOT NULL,
                    completed_at INTEGER
                )",
            ],
            Backend::Postgres => &[
                "CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    experiment_group TEXT NOT NULL,
                    created_at BIGINT NOT NULL
                )",
                "CREATE TABLE IF NOT EXISTS reactions_log (
                    id BIGSERIAL PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    timestamp BIGINT NOT NULL,
                    is_smiling BOOLEAN,
                    is_surprised BOOLEAN,
                    is_concentrating BOOLEAN,
                    is_hand_up BOOLEAN,
                    nod_count INTEGER DEFAULT 0,
                    sway_vertical_count INTEGER DEFAULT 0,
                    sway_horizontal_count INTEGER DEFAULT 0,
                    shake_head_count INTEGER DEFAULT 0,
                    cheer_count INTEGER DEFAULT 0,
                    clap_count INTEGER DEFAULT 0,
                    video_time DOUBLE PRECISION,
                    session_id TEXT
                )",
                "CREATE TABLE IF NOT EXISTS effects_log (
                    id BIGSERIAL PRIMARY KEY,
                    timestamp BIGINT NOT NULL,
                    effect_type TEXT NOT NULL,
                    intensity DOUBLE PRECISION NOT NULL,
                    duration_ms BIGINT NOT NULL,
                    session_id TEXT,
                    video_time DOUBLE PRECISION,
                    active_users BIGINT
                )",
                "CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    video_id TEXT NOT NULL,
                    started_at BIGINT NOT NULL,
                    completed_at BIGINT
                )",
            ],
        };

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| format!("schema init failed: {e}"))?;
        }
        Ok(())
    }

    /// Insert the user row on first sight; later calls are no-ops. The
    /// user row always lands before any reaction row for that user.
    pub async fn ensure_user_row(
        &self,
        user_id: &str,
        experiment_group: &str,
        created_ms: i64,
    ) -> Result<(), String> {
        sqlx::query(
            "INSERT INTO users (id, experiment_group, created_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(user_id)
        .bind(experiment_group)
        .bind(created_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("ensure_user_row for {user_id}: {e}"))?;
        Ok(())
    }

    pub async fn log_reaction(&self, user_id: &str, sample: &Sample) -> Result<(), String> {
        sqlx::query(
            "INSERT INTO reactions_log
                (user_id, timestamp, is_smiling, is_surprised, is_concentrating, is_hand_up,
                 nod_count, sway_vertical_count, sway_horizontal_count, shake_head_count,
                 cheer_count, clap_count, video_time, session_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(user_id)
        .bind(sample.received_ms)
        .bind(sample.states.is_smiling)
        .bind(sample.states.is_surprised)
        .bind(sample.states.is_concentrating)
        .bind(sample.states.is_hand_up)
        .bind(i64::from(sample.events.nod))
        .bind(i64::from(sample.events.sway_vertical))
        .bind(i64::from(sample.events.sway_horizontal))
        .bind(i64::from(sample.events.shake_head))
        .bind(i64::from(sample.events.cheer))
        .bind(i64::from(sample.events.clap))
        .bind(sample.video_time)
        .bind(sample.session_id.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| format!("log_reaction for {user_id}: {e}"))?;
        Ok(())
    }

    pub async fn log_effect(&self, effect: &EffectRecord) -> Result<(), String> {
        sqlx::query(
            "INSERT INTO effects_log
                (timestamp, effect_type, intensity, duration_ms, session_id, video_time, active_users)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(effect.timestamp)
        .bind(effect.effect_type.name())
        .bind(effect.intensity)
        .bind(effect.duration_ms)
        .bind(effect.session_id.as_deref())
        .bind(effect.video_time)
        .bind(effect.active_users)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("log_effect {}: {e}", effect.effect_type.name()))?;
        Ok(())
    }

    pub async fn session_create(
        &self,
        session_id: &str,
        user_id: &str,
        video_id: &str,
        started_ms: i64,
    ) -> Result<(), String> {
        sqlx::query(
            "INSERT INTO sessions (id, user_id, video_id, started_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(session_id)
        .bind(user_id)
        .bind(video_id)
        .bind(started_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("session_create {session_id}: {e}"))?;
        Ok(())
    }

    /// Stamp the session completed. The first completion wins.
    pub async fn session_complete(&self, session_id: &str, completed_ms: i64) -> Result<(), String> {
        sqlx::query(
            "UPDATE sessions SET completed_at = $1
             WHERE id = $2 AND completed_at IS NULL",
        )
        .bind(completed_ms)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("session_complete {session_id}: {e}"))?;
        Ok(())
    }

    /// Row counts plus the tail of the two log tables, for `/debug/database`.
    pub async fn debug_snapshot(&self, tail: i64) -> Result<DatabaseDebug, String> {
        let row_counts = RowCounts {
            users: self.count("users").await?,
            reactions_log: self.count("reactions_log").await?,
            effects_log: self.count("effects_log").await?,
            sessions: self.count("sessions").await?,
        };

        let reaction_rows = sqlx::query(
            "SELECT id, user_id, timestamp, session_id
             FROM reactions_log ORDER BY id DESC LIMIT $1",
        )
        .bind(tail)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| format!("reading recent reactions: {e}"))?;

        let mut recent_reactions = Vec::with_capacity(reaction_rows.len());
        for row in reaction_rows {
            recent_reactions.push(ReactionRow {
                id: row.try_get(0).map_err(|e| e.to_string())?,
                user_id: row.try_get(1).map_err(|e| e.to_string())?,
                timestamp: row.try_get(2).map_err(|e| e.to_string())?,
                session_id: row.try_get(3).map_err(|e| e.to_string())?,
            });
        }

        let effect_rows = sqlx::query(
            "SELECT id, timestamp, effect_type, intensity, duration_ms
             FROM effects_log ORDER BY id DESC LIMIT $1",
        )
        .bind(tail)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| format!("reading recent effects: {e}"))?;

        let mut recent_effects = Vec::with_capacity(effect_rows.len());
        for row in effect_rows {
            recent_effects.push(EffectRow {
                id: row.try_get(0).map_err(|e| e.to_string())?,
                timestamp: row.try_get(1).map_err(|e| e.to_string())?,
                effect_type: row.try_get(2).map_err(|e| e.to_string())?,
                intensity: row.try_get(3).map_err(|e| e.to_string())?,
                duration_ms: row.try_get(4).map_err(|e| e.to_string())?,
            });
        }

        Ok(DatabaseDebug {
            row_counts,
            recent_reactions,
            recent_effects,
        })
    }

    async fn count(&self, table: &str) -> Result<i64, String> {
        let row = sqlx::query(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| format!("counting {table}: {e}"))?;
        row.try_get(0).map_err(|e| format!("counting {table}: {e}"))
    }

    /// Flush and close the pool at shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn sqlite_file_path(url: &str) -> String {
    let without_scheme = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    without_scheme
        .split('?')
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct RowCounts {
    pub users: i64,
    pub reactions_log: i64,
    pub effects_log: i64,
    pub sessions: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRow {
    pub id: i64,
    pub user_id: String,
    pub timestamp: i64,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectRow {
    pub id: i64,
    pub timestamp: i64,
    pub effect_type: String,
    pub intensity: f64,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseDebug {
    pub row_counts: RowCounts,
    pub recent_reactions: Vec<ReactionRow>,
    pub recent_effects: Vec<EffectRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_url_parsing_strips_scheme_and_query() {
        assert_eq!(
            sqlite_file_path("sqlite://data/live_reaction.db?mode=rwc"),
            "data/live_reaction.db"
        );
        assert_eq!(sqlite_file_path("sqlite://x.db"), "x.db");
        assert_eq!(sqlite_file_path("sqlite::memory:"), ":memory:");
    }
}
