use crate::db::models::CredentialRecord;
use crate::db::schema::SQLITE_INIT;
use crate::error::KeeperError;
use crate::types::credential::NewCredential;
use crate::types::provider::Provider;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

pub type SqlitePool = Pool<Sqlite>;

const SELECT_COLUMNS: &str = r#"SELECT id, user_id, provider, provider_identity,
    access_token, refresh_token, expires_at, is_active, created_at, updated_at
    FROM credentials"#;

/// Open (creating if needed) the SQLite database behind `database_url`.
pub async fn connect(database_url: &str) -> Result<SqlitePool, KeeperError> {
    let connect_opts = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(connect_opts).await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct CredentialsStorage {
    pool: SqlitePool,
}

impl CredentialsStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the schema by executing the bundled DDL.
    pub async fn init_schema(&self) -> Result<(), KeeperError> {
        // sqlx::query runs one statement at a time
        for stmt in SQLITE_INIT.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            sqlx::query(s).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn find_active(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<CredentialRecord>, KeeperError> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE user_id = ? AND provider = ? AND is_active = 1"
        ))
        .bind(user_id)
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_model).transpose()
    }

    /// Deactivate the slot's current record (if any) and insert `cred` as the
    /// new active one, in a single transaction. Returns the new row id.
    pub async fn insert_active(
        &self,
        cred: &NewCredential,
        now: DateTime<Utc>,
    ) -> Result<i64, KeeperError> {
        let now = encode_ts(now);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"UPDATE credentials SET is_active = 0, updated_at = ?
               WHERE user_id = ? AND provider = ? AND is_active = 1"#,
        )
        .bind(&now)
        .bind(&cred.user_id)
        .bind(cred.provider.as_str())
        .execute(&mut *tx)
        .await?;

        let rec: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO credentials (
                user_id, provider, provider_identity, access_token, refresh_token,
                expires_at, is_active, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&cred.user_id)
        .bind(cred.provider.as_str())
        .bind(&cred.provider_identity)
        .bind(&cred.access_token)
        .bind(&cred.refresh_token)
        .bind(encode_ts(cred.expires_at))
        .bind(&now)
        .bind(&now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(rec.0)
    }

    /// Deactivate the active record of a slot. Returns the number of rows touched.
    pub async fn deactivate_slot(
        &self,
        user_id: &str,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> Result<u64, KeeperError> {
        let result = sqlx::query(
            r#"UPDATE credentials SET is_active = 0, updated_at = ?
               WHERE user_id = ? AND provider = ? AND is_active = 1"#,
        )
        .bind(encode_ts(now))
        .bind(user_id)
        .bind(provider.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn deactivate_by_id(&self, id: i64, now: DateTime<Utc>) -> Result<bool, KeeperError> {
        let result = sqlx::query(
            "UPDATE credentials SET is_active = 0, updated_at = ? WHERE id = ? AND is_active = 1",
        )
        .bind(encode_ts(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Persist refreshed token material as one unit.
    ///
    /// Last write wins on `updated_at`: a write stamped earlier than the row's
    /// current `updated_at` is dropped, as is a write to an inactive row.
    /// Returns whether the row was updated.
    pub async fn update_tokens(
        &self,
        id: i64,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, KeeperError> {
        let now = encode_ts(now);
        let result = sqlx::query(
            r#"UPDATE credentials SET
                access_token = ?,
                refresh_token = ?,
                expires_at = ?,
                updated_at = ?
              WHERE id = ? AND is_active = 1 AND updated_at <= ?"#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(encode_ts(expires_at))
        .bind(&now)
        .bind(id)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_active_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<CredentialRecord>, KeeperError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE user_id = ? AND is_active = 1 ORDER BY provider"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_model).collect()
    }

    /// Every record ever stored for a slot, newest first.
    pub async fn list_slot_history(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Vec<CredentialRecord>, KeeperError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE user_id = ? AND provider = ? ORDER BY id DESC"
        ))
        .bind(user_id)
        .bind(provider.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_model).collect()
    }

    fn row_to_model(row: SqliteRow) -> Result<CredentialRecord, KeeperError> {
        let id: i64 = row.try_get("id")?;
        let user_id: String = row.try_get("user_id")?;
        let provider_str: String = row.try_get("provider")?;
        let provider_identity: String = row.try_get("provider_identity")?;
        let access_token: String = row.try_get("access_token")?;
        let refresh_token: String = row.try_get("refresh_token")?;
        let expires_at_str: String = row.try_get("expires_at")?;
        let is_active_i: i64 = row.try_get("is_active")?;
        let created_at_str: String = row.try_get("created_at")?;
        let updated_at_str: String = row.try_get("updated_at")?;

        let provider = provider_str
            .parse::<Provider>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(CredentialRecord {
            id,
            user_id,
            provider,
            provider_identity,
            access_token,
            refresh_token,
            expires_at: decode_ts(&expires_at_str)?,
            is_active: is_active_i != 0,
            created_at: decode_ts(&created_at_str)?,
            updated_at: decode_ts(&updated_at_str)?,
        })
    }
}

/// Fixed-width UTC form (`2026-01-02T03:04:05.000006Z`); lexical order is time order.
fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn memory_storage() -> CredentialsStorage {
        // a single connection keeps every query on the same in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let storage = CredentialsStorage::new(pool);
        storage.init_schema().await.unwrap();
        storage
    }

    fn new_cred(user_id: &str, provider: Provider, access: &str) -> NewCredential {
        NewCredential {
            user_id: user_id.to_string(),
            provider,
            provider_identity: format!("{user_id}@example.com"),
            access_token: access.to_string(),
            refresh_token: format!("refresh-{access}"),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    async fn active_count(storage: &CredentialsStorage, user_id: &str, provider: Provider) -> usize {
        storage
            .list_slot_history(user_id, provider)
            .await
            .unwrap()
            .iter()
            .filter(|r| r.is_active)
            .count()
    }

    #[tokio::test]
    async fn reauthorization_keeps_one_active_record() {
        let storage = memory_storage().await;
        for access in ["a1", "a2", "a3"] {
            storage
                .insert_active(&new_cred("u1", Provider::Gmail, access), Utc::now())
                .await
                .unwrap();
        }
        storage
            .insert_active(&new_cred("u1", Provider::Airtable, "b1"), Utc::now())
            .await
            .unwrap();

        assert_eq!(active_count(&storage, "u1", Provider::Gmail).await, 1);
        assert_eq!(active_count(&storage, "u1", Provider::Airtable).await, 1);

        let history = storage.list_slot_history("u1", Provider::Gmail).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].access_token, "a3");
        assert!(history[0].is_active);

        let active = storage.find_active("u1", Provider::Gmail).await.unwrap().unwrap();
        assert_eq!(active.access_token, "a3");
        assert_eq!(active.provider_identity, "u1@example.com");
    }

    #[tokio::test]
    async fn partial_index_rejects_a_second_active_row() {
        let storage = memory_storage().await;
        storage
            .insert_active(&new_cred("u1", Provider::Gmail, "a1"), Utc::now())
            .await
            .unwrap();
        let now = encode_ts(Utc::now());
        let res = sqlx::query(
            r#"INSERT INTO credentials (user_id, provider, provider_identity, access_token,
               refresh_token, expires_at, is_active, created_at, updated_at)
               VALUES ('u1', 'gmail', 'x', 'x', 'x', ?, 1, ?, ?)"#,
        )
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(storage.pool())
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn deactivate_slot_without_record_is_noop() {
        let storage = memory_storage().await;
        let touched = storage
            .deactivate_slot("nobody", Provider::Airtable, Utc::now())
            .await
            .unwrap();
        assert_eq!(touched, 0);
    }

    #[tokio::test]
    async fn stale_token_write_does_not_overwrite_newer_one() {
        let storage = memory_storage().await;
        let id = storage
            .insert_active(&new_cred("u1", Provider::Gmail, "a1"), Utc::now())
            .await
            .unwrap();

        let newer = Utc::now() + Duration::seconds(10);
        let older = newer - Duration::seconds(5);
        let newer_expiry = Utc::now() + Duration::hours(2);

        assert!(
            storage
                .update_tokens(id, "fresh", "r-fresh", newer_expiry, newer)
                .await
                .unwrap()
        );
        assert!(
            !storage
                .update_tokens(id, "stale", "r-stale", Utc::now(), older)
                .await
                .unwrap()
        );

        let rec = storage.find_active("u1", Provider::Gmail).await.unwrap().unwrap();
        assert_eq!(rec.access_token, "fresh");
        assert_eq!(rec.refresh_token, "r-fresh");
        assert_eq!(encode_ts(rec.expires_at), encode_ts(newer_expiry));
    }

    #[tokio::test]
    async fn token_update_skips_inactive_rows() {
        let storage = memory_storage().await;
        let id = storage
            .insert_active(&new_cred("u1", Provider::Gmail, "a1"), Utc::now())
            .await
            .unwrap();
        assert!(storage.deactivate_by_id(id, Utc::now()).await.unwrap());
        assert!(!storage.deactivate_by_id(id, Utc::now()).await.unwrap());

        let written = storage
            .update_tokens(id, "fresh", "r", Utc::now(), Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert!(!written);
        assert!(storage.find_active("u1", Provider::Gmail).await.unwrap().is_none());
    }

    #[test]
    fn encoded_timestamps_sort_chronologically() {
        let a = Utc::now();
        let b = a + Duration::microseconds(1);
        let c = a + Duration::days(400);
        assert!(encode_ts(a) < encode_ts(b));
        assert!(encode_ts(b) < encode_ts(c));
        assert_eq!(encode_ts(decode_ts(&encode_ts(a)).unwrap()), encode_ts(a));
    }
}
