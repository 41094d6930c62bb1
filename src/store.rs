//! Persistence seam.
//!
//! The relay core only talks to the [`Store`] trait. Every operation is
//! transactional on a single row; cross-row atomicity is never assumed.
//! [`SqliteStore`] is the default backend, [`MemStore`] backs unit tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::pricing::{ModelPricingOverride, ToolingConfig};
use crate::relay::meta::ChannelType;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,
    #[error("insufficient quota")]
    InsufficientQuota,
    #[error("database error: {0}")]
    Db(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Db(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Enabled,
    Disabled,
    Paused,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Enabled => "enabled",
            ChannelStatus::Disabled => "disabled",
            ChannelStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enabled" => Some(ChannelStatus::Enabled),
            "disabled" => Some(ChannelStatus::Disabled),
            "paused" => Some(ChannelStatus::Paused),
            _ => None,
        }
    }
}

/// One configured upstream credential. The key is opaque to the core; the
/// adaptor for the channel type knows how to decode it (Bedrock packs
/// `ak|sk|region`, Vertex packs `region|project|adc`).
#[derive(Debug, Clone)]
pub struct ChannelRow {
    pub id: i64,
    pub channel_type: ChannelType,
    pub status: ChannelStatus,
    pub priority: i64,
    pub weight: u32,
    pub base_url: Option<String>,
    pub key: String,
    pub models: Vec<String>,
    pub groups: Vec<String>,
    /// Ordered client-name -> upstream-name pairs, keys unique.
    pub model_mapping: Vec<(String, String)>,
    pub model_configs: HashMap<String, ModelPricingOverride>,
    pub tooling: Option<ToolingConfig>,
    pub used_quota: i64,
}

impl ChannelRow {
    pub fn serves(&self, model: &str, group: &str) -> bool {
        self.status == ChannelStatus::Enabled
            && self.models.iter().any(|m| m == model)
            && (self.groups.is_empty() || self.groups.iter().any(|g| g == group))
    }

    /// Apply the channel's model mapping; unmapped names pass through.
    pub fn map_model(&self, origin: &str) -> String {
        self.model_mapping
            .iter()
            .find(|(from, _)| from == origin)
            .map(|(_, to)| to.clone())
            .unwrap_or_else(|| origin.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct TokenRow {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    /// Remaining quota; ignored when `unlimited`.
    pub quota: i64,
    pub used_quota: i64,
    pub unlimited: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub quota: i64,
    pub used_quota: i64,
    pub group: String,
    pub role: String,
    pub enabled: bool,
}

/// One billing log row per completed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub user_id: i64,
    pub channel_id: i64,
    pub model_name: String,
    pub token_name: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    /// Human-readable billing breakdown.
    pub content: String,
    pub is_stream: bool,
    pub elapsed_ms: i64,
    pub request_id: String,
    pub trace_id: String,
    pub created_at: i64,
}

/// Links an opaque upstream job id to the channel and billing dimensions
/// that created it. Written once, deleted on terminal reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBinding {
    pub task_id: String,
    pub task_type: String,
    pub channel_id: i64,
    pub channel_type: i64,
    pub user_id: i64,
    pub token_id: i64,
    pub origin_model: String,
    pub actual_model: String,
    pub request_method: String,
    pub request_path: String,
    /// JSON snapshot of the originating request.
    pub request_params: String,
    pub created_at: i64,
}

pub trait Store: Send + Sync {
    // users
    fn user(&self, user_id: i64) -> StoreResult<UserRow>;
    fn user_quota(&self, user_id: i64) -> StoreResult<i64>;
    fn decrement_user_quota(&self, user_id: i64, amount: i64) -> StoreResult<()>;
    fn increment_user_used(&self, user_id: i64, amount: i64) -> StoreResult<()>;

    // tokens
    fn token(&self, token_id: i64) -> StoreResult<TokenRow>;
    fn token_by_key(&self, key: &str) -> StoreResult<TokenRow>;
    /// Atomically decrement the token's remaining quota; fails with
    /// `InsufficientQuota` when the balance cannot cover `amount`.
    fn pre_consume_token(&self, token_id: i64, amount: i64) -> StoreResult<()>;
    /// Apply the reconciliation delta (negative refunds) and grow
    /// `used_quota` by the final billed amount.
    fn post_consume_token(&self, token_id: i64, delta: i64, used_delta: i64) -> StoreResult<()>;

    // channels
    fn channel(&self, channel_id: i64) -> StoreResult<ChannelRow>;
    fn list_channels(&self) -> StoreResult<Vec<ChannelRow>>;
    fn channels_for_model(&self, model: &str, group: &str) -> StoreResult<Vec<ChannelRow>>;
    fn increment_channel_used(&self, channel_id: i64, amount: i64) -> StoreResult<()>;
    fn update_channel_status(&self, channel_id: i64, status: ChannelStatus) -> StoreResult<()>;

    // logs
    fn record_log(&self, entry: &LogEntry) -> StoreResult<()>;

    // request cost (idempotent upsert keyed by request id)
    fn upsert_request_cost(&self, request_id: &str, user_id: i64, quota: i64) -> StoreResult<()>;
    fn zero_request_cost(&self, request_id: &str) -> StoreResult<()>;
    fn request_cost(&self, request_id: &str) -> StoreResult<Option<i64>>;

    // async task bindings
    fn save_task_binding(&self, binding: &TaskBinding) -> StoreResult<()>;
    fn task_binding(&self, task_id: &str) -> StoreResult<Option<TaskBinding>>;
    fn delete_task_binding(&self, task_id: &str) -> StoreResult<()>;
}

// ============================================================================
// SQLite backend
// ============================================================================

pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(dir: Option<&std::path::Path>) -> StoreResult<Self> {
        let mut p = dir
            .map(PathBuf::from)
            .or_else(dirs::data_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        p.push("modelgate");
        std::fs::create_dir_all(&p).map_err(|e| StoreError::Db(e.to_string()))?;
        p.push("modelgate.db");
        let store = Self { path: p };
        store.init()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_at(path: PathBuf) -> StoreResult<Self> {
        let store = Self { path };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "busy_timeout", 5000).ok();
        Ok(conn)
    }

    fn init(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                quota INTEGER NOT NULL DEFAULT 0,
                used_quota INTEGER NOT NULL DEFAULT 0,
                grp TEXT NOT NULL DEFAULT 'default',
                role TEXT NOT NULL DEFAULT 'common',
                enabled INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                key TEXT NOT NULL UNIQUE,
                quota INTEGER NOT NULL DEFAULT 0,
                used_quota INTEGER NOT NULL DEFAULT 0,
                unlimited INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS channels (
                id INTEGER PRIMARY KEY,
                channel_type INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'enabled',
                priority INTEGER NOT NULL DEFAULT 0,
                weight INTEGER NOT NULL DEFAULT 1,
                base_url TEXT,
                key TEXT NOT NULL DEFAULT '',
                models TEXT NOT NULL DEFAULT '[]',
                grps TEXT NOT NULL DEFAULT '[]',
                model_mapping TEXT NOT NULL DEFAULT '[]',
                model_configs TEXT NOT NULL DEFAULT '{}',
                tooling TEXT,
                used_quota INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS request_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                channel_id INTEGER NOT NULL,
                model_name TEXT NOT NULL,
                token_name TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                quota INTEGER NOT NULL,
                content TEXT NOT NULL,
                is_stream INTEGER NOT NULL,
                elapsed_ms INTEGER NOT NULL,
                request_id TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_request_logs_created
                ON request_logs(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_request_logs_user
                ON request_logs(user_id, created_at DESC);
            CREATE TABLE IF NOT EXISTS request_costs (
                request_id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                quota INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS task_bindings (
                task_id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                channel_id INTEGER NOT NULL,
                channel_type INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                token_id INTEGER NOT NULL,
                origin_model TEXT NOT NULL,
                actual_model TEXT NOT NULL,
                request_method TEXT NOT NULL,
                request_path TEXT NOT NULL,
                request_params TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChannelRow> {
        let type_id: i64 = row.get(1)?;
        let status_str: String = row.get(2)?;
        let models_json: String = row.get(7)?;
        let groups_json: String = row.get(8)?;
        let mapping_json: String = row.get(9)?;
        let configs_json: String = row.get(10)?;
        let tooling_json: Option<String> = row.get(11)?;
        Ok(ChannelRow {
            id: row.get(0)?,
            channel_type: ChannelType::from_id(type_id),
            status: ChannelStatus::parse(&status_str).unwrap_or(ChannelStatus::Disabled),
            priority: row.get(3)?,
            weight: row.get::<_, i64>(4)?.max(0) as u32,
            base_url: row.get(5)?,
            key: row.get(6)?,
            models: serde_json::from_str(&models_json).unwrap_or_default(),
            groups: serde_json::from_str(&groups_json).unwrap_or_default(),
            model_mapping: serde_json::from_str(&mapping_json).unwrap_or_default(),
            model_configs: serde_json::from_str(&configs_json).unwrap_or_default(),
            tooling: tooling_json.and_then(|t| serde_json::from_str(&t).ok()),
            used_quota: row.get(12)?,
        })
    }

    const CHANNEL_COLS: &'static str = "id, channel_type, status, priority, weight, base_url, \
         key, models, grps, model_mapping, model_configs, tooling, used_quota";

    /// Insert or replace a channel row. Keys are write-only after the first
    /// save: an empty key on an existing row keeps the stored one.
    pub fn save_channel(&self, ch: &ChannelRow) -> StoreResult<()> {
        let conn = self.conn()?;
        let existing_key: Option<String> = conn
            .query_row(
                "SELECT key FROM channels WHERE id = ?1",
                params![ch.id],
                |r| r.get(0),
            )
            .optional()?;
        let key = if ch.key.is_empty() {
            existing_key.unwrap_or_default()
        } else {
            ch.key.clone()
        };
        conn.execute(
            "INSERT OR REPLACE INTO channels
             (id, channel_type, status, priority, weight, base_url, key, models, grps,
              model_mapping, model_configs, tooling, used_quota)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                ch.id,
                ch.channel_type.id(),
                ch.status.as_str(),
                ch.priority,
                ch.weight as i64,
                ch.base_url,
                key,
                serde_json::to_string(&ch.models).unwrap_or_default(),
                serde_json::to_string(&ch.groups).unwrap_or_default(),
                serde_json::to_string(&ch.model_mapping).unwrap_or_default(),
                serde_json::to_string(&ch.model_configs).unwrap_or_default(),
                ch.tooling
                    .as_ref()
                    .map(|t| serde_json::to_string(t).unwrap_or_default()),
                ch.used_quota,
            ],
        )?;
        Ok(())
    }

    pub fn save_user(&self, user: &UserRow) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO users (id, quota, used_quota, grp, role, enabled)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                user.id,
                user.quota,
                user.used_quota,
                user.group,
                user.role,
                user.enabled as i64
            ],
        )?;
        Ok(())
    }

    pub fn save_token(&self, token: &TokenRow, key: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO tokens
             (id, user_id, name, key, quota, used_quota, unlimited, enabled)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                token.id,
                token.user_id,
                token.name,
                key,
                token.quota,
                token.used_quota,
                token.unlimited as i64,
                token.enabled as i64
            ],
        )?;
        Ok(())
    }

    fn row_to_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenRow> {
        Ok(TokenRow {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            quota: row.get(3)?,
            used_quota: row.get(4)?,
            unlimited: row.get::<_, i64>(5)? != 0,
            enabled: row.get::<_, i64>(6)? != 0,
        })
    }
}

impl Store for SqliteStore {
    fn user(&self, user_id: i64) -> StoreResult<UserRow> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, quota, used_quota, grp, role, enabled FROM users WHERE id = ?1",
            params![user_id],
            |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    quota: row.get(1)?,
                    used_quota: row.get(2)?,
                    group: row.get(3)?,
                    role: row.get(4)?,
                    enabled: row.get::<_, i64>(5)? != 0,
                })
            },
        )
        .map_err(Into::into)
    }

    fn user_quota(&self, user_id: i64) -> StoreResult<i64> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT quota FROM users WHERE id = ?1",
            params![user_id],
            |r| r.get(0),
        )
        .map_err(Into::into)
    }

    fn decrement_user_quota(&self, user_id: i64, amount: i64) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE users SET quota = quota - ?2 WHERE id = ?1",
            params![user_id, amount],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn increment_user_used(&self, user_id: i64, amount: i64) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE users SET used_quota = used_quota + ?2 WHERE id = ?1",
            params![user_id, amount],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn token(&self, token_id: i64) -> StoreResult<TokenRow> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, user_id, name, quota, used_quota, unlimited, enabled
             FROM tokens WHERE id = ?1",
            params![token_id],
            Self::row_to_token,
        )
        .map_err(Into::into)
    }

    fn token_by_key(&self, key: &str) -> StoreResult<TokenRow> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, user_id, name, quota, used_quota, unlimited, enabled
             FROM tokens WHERE key = ?1",
            params![key],
            Self::row_to_token,
        )
        .map_err(Into::into)
    }

    fn pre_consume_token(&self, token_id: i64, amount: i64) -> StoreResult<()> {
        let conn = self.conn()?;
        // Guarded single-statement decrement keeps concurrent pre-consumes
        // on the same token serialized by the row write.
        let changed = conn.execute(
            "UPDATE tokens SET quota = quota - ?2
             WHERE id = ?1 AND (unlimited = 1 OR quota >= ?2)",
            params![token_id, amount],
        )?;
        if changed == 0 {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM tokens WHERE id = ?1",
                    params![token_id],
                    |r| r.get(0),
                )
                .optional()?;
            return match exists {
                Some(_) => Err(StoreError::InsufficientQuota),
                None => Err(StoreError::NotFound),
            };
        }
        Ok(())
    }

    fn post_consume_token(&self, token_id: i64, delta: i64, used_delta: i64) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tokens SET quota = quota - ?2, used_quota = used_quota + ?3
             WHERE id = ?1",
            params![token_id, delta, used_delta],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn channel(&self, channel_id: i64) -> StoreResult<ChannelRow> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM channels WHERE id = ?1",
                Self::CHANNEL_COLS
            ),
            params![channel_id],
            Self::row_to_channel,
        )
        .map_err(Into::into)
    }

    fn list_channels(&self) -> StoreResult<Vec<ChannelRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM channels", Self::CHANNEL_COLS))?;
        let rows = stmt.query_map([], Self::row_to_channel)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn channels_for_model(&self, model: &str, group: &str) -> StoreResult<Vec<ChannelRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM channels WHERE status = 'enabled'",
            Self::CHANNEL_COLS
        ))?;
        let rows = stmt.query_map([], Self::row_to_channel)?;
        let mut out = Vec::new();
        for row in rows {
            let ch = row?;
            if ch.serves(model, group) {
                out.push(ch);
            }
        }
        Ok(out)
    }

    fn increment_channel_used(&self, channel_id: i64, amount: i64) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE channels SET used_quota = used_quota + ?2 WHERE id = ?1",
            params![channel_id, amount],
        )?;
        Ok(())
    }

    fn update_channel_status(&self, channel_id: i64, status: ChannelStatus) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE channels SET status = ?2 WHERE id = ?1",
            params![channel_id, status.as_str()],
        )?;
        Ok(())
    }

    fn record_log(&self, entry: &LogEntry) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO request_logs
             (user_id, channel_id, model_name, token_name, prompt_tokens,
              completion_tokens, quota, content, is_stream, elapsed_ms,
              request_id, trace_id, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                entry.user_id,
                entry.channel_id,
                entry.model_name,
                entry.token_name,
                entry.prompt_tokens,
                entry.completion_tokens,
                entry.quota,
                entry.content,
                entry.is_stream as i64,
                entry.elapsed_ms,
                entry.request_id,
                entry.trace_id,
                entry.created_at,
            ],
        )?;
        Ok(())
    }

    fn upsert_request_cost(&self, request_id: &str, user_id: i64, quota: i64) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO request_costs (request_id, user_id, quota, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(request_id) DO UPDATE SET
                quota = excluded.quota, updated_at = excluded.updated_at",
            params![request_id, user_id, quota, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    fn zero_request_cost(&self, request_id: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE request_costs SET quota = 0, updated_at = ?2 WHERE request_id = ?1",
            params![request_id, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    fn request_cost(&self, request_id: &str) -> StoreResult<Option<i64>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT quota FROM request_costs WHERE request_id = ?1",
            params![request_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    fn save_task_binding(&self, b: &TaskBinding) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO task_bindings
             (task_id, task_type, channel_id, channel_type, user_id, token_id,
              origin_model, actual_model, request_method, request_path,
              request_params, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                b.task_id,
                b.task_type,
                b.channel_id,
                b.channel_type,
                b.user_id,
                b.token_id,
                b.origin_model,
                b.actual_model,
                b.request_method,
                b.request_path,
                b.request_params,
                b.created_at,
            ],
        )?;
        Ok(())
    }

    fn task_binding(&self, task_id: &str) -> StoreResult<Option<TaskBinding>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT task_id, task_type, channel_id, channel_type, user_id, token_id,
                    origin_model, actual_model, request_method, request_path,
                    request_params, created_at
             FROM task_bindings WHERE task_id = ?1",
            params![task_id],
            |row| {
                Ok(TaskBinding {
                    task_id: row.get(0)?,
                    task_type: row.get(1)?,
                    channel_id: row.get(2)?,
                    channel_type: row.get(3)?,
                    user_id: row.get(4)?,
                    token_id: row.get(5)?,
                    origin_model: row.get(6)?,
                    actual_model: row.get(7)?,
                    request_method: row.get(8)?,
                    request_path: row.get(9)?,
                    request_params: row.get(10)?,
                    created_at: row.get(11)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    fn delete_task_binding(&self, task_id: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM task_bindings WHERE task_id = ?1",
            params![task_id],
        )?;
        Ok(())
    }
}

// ============================================================================
// In-memory backend for tests
// ============================================================================

#[derive(Default)]
struct MemInner {
    users: HashMap<i64, UserRow>,
    tokens: HashMap<i64, TokenRow>,
    token_keys: HashMap<String, i64>,
    channels: HashMap<i64, ChannelRow>,
    logs: Vec<LogEntry>,
    request_costs: HashMap<String, i64>,
    bindings: HashMap<String, TaskBinding>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: UserRow) {
        self.inner.lock().unwrap().users.insert(user.id, user);
    }

    pub fn insert_token(&self, token: TokenRow, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.token_keys.insert(key.to_string(), token.id);
        inner.tokens.insert(token.id, token);
    }

    pub fn insert_channel(&self, channel: ChannelRow) {
        self.inner
            .lock()
            .unwrap()
            .channels
            .insert(channel.id, channel);
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.inner.lock().unwrap().logs.clone()
    }
}

impl Store for MemStore {
    fn user(&self, user_id: i64) -> StoreResult<UserRow> {
        self.inner
            .lock()
            .unwrap()
            .users
            .get(&user_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn user_quota(&self, user_id: i64) -> StoreResult<i64> {
        self.user(user_id).map(|u| u.quota)
    }

    fn decrement_user_quota(&self, user_id: i64, amount: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let user = inner.users.get_mut(&user_id).ok_or(StoreError::NotFound)?;
        user.quota -= amount;
        Ok(())
    }

    fn increment_user_used(&self, user_id: i64, amount: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let user = inner.users.get_mut(&user_id).ok_or(StoreError::NotFound)?;
        user.used_quota += amount;
        Ok(())
    }

    fn token(&self, token_id: i64) -> StoreResult<TokenRow> {
        self.inner
            .lock()
            .unwrap()
            .tokens
            .get(&token_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn token_by_key(&self, key: &str) -> StoreResult<TokenRow> {
        let inner = self.inner.lock().unwrap();
        let id = inner.token_keys.get(key).ok_or(StoreError::NotFound)?;
        inner.tokens.get(id).cloned().ok_or(StoreError::NotFound)
    }

    fn pre_consume_token(&self, token_id: i64, amount: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let token = inner.tokens.get_mut(&token_id).ok_or(StoreError::NotFound)?;
        if !token.unlimited && token.quota < amount {
            return Err(StoreError::InsufficientQuota);
        }
        token.quota -= amount;
        Ok(())
    }

    fn post_consume_token(&self, token_id: i64, delta: i64, used_delta: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let token = inner.tokens.get_mut(&token_id).ok_or(StoreError::NotFound)?;
        token.quota -= delta;
        token.used_quota += used_delta;
        Ok(())
    }

    fn channel(&self, channel_id: i64) -> StoreResult<ChannelRow> {
        self.inner
            .lock()
            .unwrap()
            .channels
            .get(&channel_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn list_channels(&self) -> StoreResult<Vec<ChannelRow>> {
        Ok(self.inner.lock().unwrap().channels.values().cloned().collect())
    }

    fn channels_for_model(&self, model: &str, group: &str) -> StoreResult<Vec<ChannelRow>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .channels
            .values()
            .filter(|c| c.serves(model, group))
            .cloned()
            .collect())
    }

    fn increment_channel_used(&self, channel_id: i64, amount: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let ch = inner
            .channels
            .get_mut(&channel_id)
            .ok_or(StoreError::NotFound)?;
        ch.used_quota += amount;
        Ok(())
    }

    fn update_channel_status(&self, channel_id: i64, status: ChannelStatus) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let ch = inner
            .channels
            .get_mut(&channel_id)
            .ok_or(StoreError::NotFound)?;
        ch.status = status;
        Ok(())
    }

    fn record_log(&self, entry: &LogEntry) -> StoreResult<()> {
        self.inner.lock().unwrap().logs.push(entry.clone());
        Ok(())
    }

    fn upsert_request_cost(&self, request_id: &str, _user_id: i64, quota: i64) -> StoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .request_costs
            .insert(request_id.to_string(), quota);
        Ok(())
    }

    fn zero_request_cost(&self, request_id: &str) -> StoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .request_costs
            .insert(request_id.to_string(), 0);
        Ok(())
    }

    fn request_cost(&self, request_id: &str) -> StoreResult<Option<i64>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .request_costs
            .get(request_id)
            .copied())
    }

    fn save_task_binding(&self, binding: &TaskBinding) -> StoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .bindings
            .insert(binding.task_id.clone(), binding.clone());
        Ok(())
    }

    fn task_binding(&self, task_id: &str) -> StoreResult<Option<TaskBinding>> {
        Ok(self.inner.lock().unwrap().bindings.get(task_id).cloned())
    }

    fn delete_task_binding(&self, task_id: &str) -> StoreResult<()> {
        self.inner.lock().unwrap().bindings.remove(task_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(id: i64, quota: i64, unlimited: bool) -> TokenRow {
        TokenRow {
            id,
            user_id: 1,
            name: format!("t{}", id),
            quota,
            used_quota: 0,
            unlimited,
            enabled: true,
        }
    }

    #[test]
    fn mem_pre_consume_rejects_when_short() {
        let store = MemStore::new();
        store.insert_token(token(1, 50, false), "sk-a");
        assert!(matches!(
            store.pre_consume_token(1, 100),
            Err(StoreError::InsufficientQuota)
        ));
        store.pre_consume_token(1, 30).unwrap();
        assert_eq!(store.token(1).unwrap().quota, 20);
    }

    #[test]
    fn mem_unlimited_token_skips_balance_check() {
        let store = MemStore::new();
        store.insert_token(token(2, 0, true), "sk-b");
        store.pre_consume_token(2, 1_000_000).unwrap();
    }

    #[test]
    fn mem_post_consume_applies_delta_and_used() {
        let store = MemStore::new();
        store.insert_token(token(3, 1000, false), "sk-c");
        store.pre_consume_token(3, 100).unwrap();
        // Final cost 37 -> refund 63, used grows by 37.
        store.post_consume_token(3, 37 - 100, 37).unwrap();
        let t = store.token(3).unwrap();
        assert_eq!(t.quota, 1000 - 37);
        assert_eq!(t.used_quota, 37);
    }

    #[test]
    fn sqlite_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_at(dir.path().join("t.db")).unwrap();
        store
            .save_user(&UserRow {
                id: 1,
                quota: 1000,
                used_quota: 0,
                group: "default".into(),
                role: "common".into(),
                enabled: true,
            })
            .unwrap();
        store.save_token(&token(1, 500, false), "sk-test").unwrap();

        let t = store.token_by_key("sk-test").unwrap();
        assert_eq!(t.quota, 500);

        store.pre_consume_token(1, 100).unwrap();
        assert_eq!(store.token(1).unwrap().quota, 400);
        assert!(matches!(
            store.pre_consume_token(1, 401),
            Err(StoreError::InsufficientQuota)
        ));

        store.upsert_request_cost("req-1", 1, 100).unwrap();
        store.upsert_request_cost("req-1", 1, 37).unwrap();
        assert_eq!(store.request_cost("req-1").unwrap(), Some(37));
        store.zero_request_cost("req-1").unwrap();
        assert_eq!(store.request_cost("req-1").unwrap(), Some(0));
    }

    #[test]
    fn sqlite_channel_key_write_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_at(dir.path().join("t.db")).unwrap();
        let mut ch = ChannelRow {
            id: 7,
            channel_type: ChannelType::OpenAI,
            status: ChannelStatus::Enabled,
            priority: 0,
            weight: 1,
            base_url: None,
            key: "sk-secret".into(),
            models: vec!["gpt-4o".into()],
            groups: vec![],
            model_mapping: vec![],
            model_configs: HashMap::new(),
            tooling: None,
            used_quota: 0,
        };
        store.save_channel(&ch).unwrap();

        // Re-saving with an empty key keeps the stored secret.
        ch.key = String::new();
        ch.priority = 5;
        store.save_channel(&ch).unwrap();
        let loaded = store.channel(7).unwrap();
        assert_eq!(loaded.key, "sk-secret");
        assert_eq!(loaded.priority, 5);
    }

    #[test]
    fn channel_mapping_and_groups() {
        let ch = ChannelRow {
            id: 1,
            channel_type: ChannelType::OpenAI,
            status: ChannelStatus::Enabled,
            priority: 0,
            weight: 1,
            base_url: None,
            key: String::new(),
            models: vec!["gpt-4o".into()],
            groups: vec!["vip".into()],
            model_mapping: vec![("gpt-4o".into(), "gpt-4o-2024-08-06".into())],
            model_configs: HashMap::new(),
            tooling: None,
            used_quota: 0,
        };
        assert!(ch.serves("gpt-4o", "vip"));
        assert!(!ch.serves("gpt-4o", "default"));
        assert!(!ch.serves("gpt-4", "vip"));
        assert_eq!(ch.map_model("gpt-4o"), "gpt-4o-2024-08-06");
        assert_eq!(ch.map_model("other"), "other");
    }
}
