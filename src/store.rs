//! Persistence surface the relay core consumes. The quota methods are the
//! transactional RPCs the coordinator treats as atomic; the lookup methods
//! serve the auth/distribution layer. Errors are `String`-typed at this
//! boundary and mapped into the canonical envelope by callers.

use crate::context::ChannelType;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct TokenRow {
    pub id: i64,
    pub name: String,
    pub user_id: i64,
    pub group: String,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
}

#[derive(Debug, Clone)]
pub struct ChannelRow {
    pub id: i64,
    pub channel_type: ChannelType,
    pub name: String,
    pub key: String,
    pub base_url: Option<String>,
    pub model_mapping: Option<String>,
    pub api_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConsumeLog {
    pub user_id: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub model: String,
    pub token_name: String,
    pub quota: i64,
    pub content: String,
    pub channel_name: String,
}

#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn token_by_key(&self, key: &str) -> Result<Option<TokenRow>, String>;
    async fn channel_for_request(
        &self,
        group: &str,
        model: &str,
    ) -> Result<Option<ChannelRow>, String>;

    async fn cache_get_user_quota(&self, user_id: i64) -> Result<i64, String>;
    async fn pre_consume_token_quota(&self, token_id: i64, amount: i64) -> Result<(), String>;
    async fn post_consume_token_quota(&self, token_id: i64, delta: i64) -> Result<(), String>;
    async fn cache_update_user_quota(&self, user_id: i64) -> Result<(), String>;
    async fn update_user_used_quota_and_request_count(&self, user_id: i64, cost: i64);
    async fn update_channel_used_quota(&self, channel_id: i64, cost: i64);
    async fn record_consume_log(&self, entry: ConsumeLog);
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

/// SQLite-backed store. The user-quota cache is an in-process map refreshed
/// by `cache_update_user_quota`; the wealth-skip heuristic reads it instead
/// of the table.
#[derive(Clone)]
pub struct SqliteRelayStore {
    pool: Pool<Sqlite>,
    user_quota_cache: Arc<RwLock<HashMap<i64, i64>>>,
}

impl SqliteRelayStore {
    pub async fn connect(dsn: &str) -> Result<Self, String> {
        ensure_sqlite_file(dsn)?;
        let options = dsn
            .parse::<SqliteConnectOptions>()
            .map_err(|err| format!("sqlite_dsn_parse_failed: {err}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|err| format!("sqlite_connect_failed: {err}"))?;
        let store = Self {
            pool,
            user_quota_cache: Arc::new(RwLock::new(HashMap::new())),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), String> {
        for statement in [
            r#"CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                user_group TEXT NOT NULL DEFAULT 'default',
                quota INTEGER NOT NULL DEFAULT 0,
                used_quota INTEGER NOT NULL DEFAULT 0,
                request_count INTEGER NOT NULL DEFAULT 0
            )"#,
            r#"CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                status INTEGER NOT NULL DEFAULT 1,
                remain_quota INTEGER NOT NULL DEFAULT 0,
                unlimited_quota INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )"#,
            r#"CREATE TABLE IF NOT EXISTS channels (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type INTEGER NOT NULL DEFAULT 0,
                name TEXT NOT NULL,
                key TEXT NOT NULL DEFAULT '',
                base_url TEXT,
                models TEXT NOT NULL DEFAULT '',
                channel_group TEXT NOT NULL DEFAULT 'default',
                model_mapping TEXT,
                api_version TEXT,
                status INTEGER NOT NULL DEFAULT 1,
                used_quota INTEGER NOT NULL DEFAULT 0
            )"#,
            r#"CREATE TABLE IF NOT EXISTS consume_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                model TEXT NOT NULL,
                token_name TEXT NOT NULL,
                quota INTEGER NOT NULL,
                content TEXT NOT NULL,
                channel_name TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_consume_logs_user ON consume_logs(user_id)",
            "CREATE INDEX IF NOT EXISTS idx_channels_group ON channels(channel_group)",
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|err| err.to_string())?;
        }
        Ok(())
    }

    pub async fn create_user(&self, username: &str, group: &str, quota: i64) -> Result<i64, String> {
        let result = sqlx::query(
            "INSERT INTO users (username, user_group, quota) VALUES (?, ?, ?)",
        )
        .bind(username)
        .bind(group)
        .bind(quota)
        .execute(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(result.last_insert_rowid())
    }

    pub async fn create_token(
        &self,
        key: &str,
        name: &str,
        user_id: i64,
        remain_quota: i64,
        unlimited_quota: bool,
    ) -> Result<i64, String> {
        let result = sqlx::query(
            "INSERT INTO tokens (key, name, user_id, remain_quota, unlimited_quota) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(name)
        .bind(user_id)
        .bind(remain_quota)
        .bind(unlimited_quota as i64)
        .execute(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(result.last_insert_rowid())
    }

    pub async fn create_channel(
        &self,
        channel_type: ChannelType,
        name: &str,
        key: &str,
        group: &str,
        models: &str,
        base_url: Option<&str>,
        model_mapping: Option<&str>,
        api_version: Option<&str>,
    ) -> Result<i64, String> {
        let result = sqlx::query(
            r#"INSERT INTO channels (type, name, key, channel_group, models, base_url, model_mapping, api_version)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(channel_type.as_i64())
        .bind(name)
        .bind(key)
        .bind(group)
        .bind(models)
        .bind(base_url)
        .bind(model_mapping)
        .bind(api_version)
        .execute(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(result.last_insert_rowid())
    }

    pub async fn token_remain_quota(&self, token_id: i64) -> Result<i64, String> {
        sqlx::query_scalar::<_, i64>("SELECT remain_quota FROM tokens WHERE id = ?")
            .bind(token_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| err.to_string())
    }

    pub async fn user_quota(&self, user_id: i64) -> Result<i64, String> {
        sqlx::query_scalar::<_, i64>("SELECT quota FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| err.to_string())
    }

    pub async fn list_consume_logs(&self, user_id: i64) -> Result<Vec<ConsumeLog>, String> {
        let rows = sqlx::query(
            r#"SELECT user_id, prompt_tokens, completion_tokens, model, token_name, quota, content, channel_name
               FROM consume_logs WHERE user_id = ? ORDER BY id"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(rows
            .into_iter()
            .map(|row| ConsumeLog {
                user_id: row.get("user_id"),
                prompt_tokens: row.get("prompt_tokens"),
                completion_tokens: row.get("completion_tokens"),
                model: row.get("model"),
                token_name: row.get("token_name"),
                quota: row.get("quota"),
                content: row.get("content"),
                channel_name: row.get("channel_name"),
            })
            .collect())
    }
}

#[async_trait]
impl RelayStore for SqliteRelayStore {
    async fn token_by_key(&self, key: &str) -> Result<Option<TokenRow>, String> {
        let row = sqlx::query(
            r#"SELECT t.id, t.name, t.user_id, t.remain_quota, t.unlimited_quota, u.user_group
               FROM tokens t JOIN users u ON u.id = t.user_id
               WHERE t.key = ? AND t.status = 1"#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(row.map(|row| TokenRow {
            id: row.get("id"),
            name: row.get("name"),
            user_id: row.get("user_id"),
            group: row.get("user_group"),
            remain_quota: row.get("remain_quota"),
            unlimited_quota: row.get::<i64, _>("unlimited_quota") != 0,
        }))
    }

    async fn channel_for_request(
        &self,
        group: &str,
        model: &str,
    ) -> Result<Option<ChannelRow>, String> {
        let rows = sqlx::query(
            r#"SELECT id, type, name, key, base_url, models, model_mapping, api_version
               FROM channels WHERE status = 1 AND channel_group = ? ORDER BY id"#,
        )
        .bind(group)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        for row in rows {
            let models: String = row.get("models");
            let serves_model =
                models.is_empty() || models.split(',').any(|entry| entry.trim() == model);
            if !serves_model {
                continue;
            }
            return Ok(Some(ChannelRow {
                id: row.get("id"),
                channel_type: ChannelType::from_i64(row.get("type")),
                name: row.get("name"),
                key: row.get("key"),
                base_url: row
                    .get::<Option<String>, _>("base_url")
                    .filter(|v| !v.is_empty()),
                model_mapping: row
                    .get::<Option<String>, _>("model_mapping")
                    .filter(|v| !v.is_empty()),
                api_version: row
                    .get::<Option<String>, _>("api_version")
                    .filter(|v| !v.is_empty()),
            }));
        }
        Ok(None)
    }

    async fn cache_get_user_quota(&self, user_id: i64) -> Result<i64, String> {
        if let Some(quota) = self.user_quota_cache.read().await.get(&user_id) {
            return Ok(*quota);
        }
        let quota = sqlx::query_scalar::<_, i64>("SELECT quota FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| err.to_string())?;
        self.user_quota_cache.write().await.insert(user_id, quota);
        Ok(quota)
    }

    async fn pre_consume_token_quota(&self, token_id: i64, amount: i64) -> Result<(), String> {
        let row = sqlx::query("SELECT remain_quota, unlimited_quota FROM tokens WHERE id = ?")
            .bind(token_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| err.to_string())?;
        if row.get::<i64, _>("unlimited_quota") != 0 {
            return Ok(());
        }
        let result = sqlx::query(
            "UPDATE tokens SET remain_quota = remain_quota - ? WHERE id = ? AND remain_quota >= ?",
        )
        .bind(amount)
        .bind(token_id)
        .bind(amount)
        .execute(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        if result.rows_affected() == 0 {
            return Err("token quota is not enough".to_string());
        }
        Ok(())
    }

    async fn post_consume_token_quota(&self, token_id: i64, delta: i64) -> Result<(), String> {
        sqlx::query(
            "UPDATE tokens SET remain_quota = remain_quota - ? WHERE id = ? AND unlimited_quota = 0",
        )
        .bind(delta)
        .bind(token_id)
        .execute(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        sqlx::query(
            "UPDATE users SET quota = quota - ? WHERE id = (SELECT user_id FROM tokens WHERE id = ?)",
        )
        .bind(delta)
        .bind(token_id)
        .execute(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(())
    }

    async fn cache_update_user_quota(&self, user_id: i64) -> Result<(), String> {
        let quota = sqlx::query_scalar::<_, i64>("SELECT quota FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| err.to_string())?;
        self.user_quota_cache.write().await.insert(user_id, quota);
        Ok(())
    }

    async fn update_user_used_quota_and_request_count(&self, user_id: i64, cost: i64) {
        let result = sqlx::query(
            "UPDATE users SET used_quota = used_quota + ?, request_count = request_count + 1 WHERE id = ?",
        )
        .bind(cost)
        .bind(user_id)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            tracing::error!("failed to update user used quota: {err}");
        }
    }

    async fn update_channel_used_quota(&self, channel_id: i64, cost: i64) {
        let result = sqlx::query("UPDATE channels SET used_quota = used_quota + ? WHERE id = ?")
            .bind(cost)
            .bind(channel_id)
            .execute(&self.pool)
            .await;
        if let Err(err) = result {
            tracing::error!("failed to update channel used quota: {err}");
        }
    }

    async fn record_consume_log(&self, entry: ConsumeLog) {
        let result = sqlx::query(
            r#"INSERT INTO consume_logs
               (user_id, created_at, prompt_tokens, completion_tokens, model, token_name, quota, content, channel_name)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.user_id)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(entry.prompt_tokens)
        .bind(entry.completion_tokens)
        .bind(&entry.model)
        .bind(&entry.token_name)
        .bind(entry.quota)
        .bind(&entry.content)
        .bind(&entry.channel_name)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            tracing::error!("failed to record consume log: {err}");
        }
    }
}
