//! Client credential database operations

use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::Result;
use crate::upload::checksum_bytes;

/// Client repository
pub struct ClientRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ClientRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a client, replacing its key if it already exists
    pub async fn register(&self, client_id: &str, api_key: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO clients (client_id, api_key_hash, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(client_id) DO UPDATE SET api_key_hash = excluded.api_key_hash
            "#,
        )
        .bind(client_id)
        .bind(hash_api_key(api_key))
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Resolve an API key to its client ID
    pub async fn find_by_api_key(&self, api_key: &str) -> Result<Option<String>> {
        let client_id = sqlx::query_scalar::<_, String>(
            "SELECT client_id FROM clients WHERE api_key_hash = ?",
        )
        .bind(hash_api_key(api_key))
        .fetch_optional(self.pool)
        .await?;

        Ok(client_id)
    }
}

fn hash_api_key(api_key: &str) -> String {
    checksum_bytes(api_key.as_bytes()).digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[tokio::test]
    async fn test_register_and_lookup() {
        let pool = testutil::pool().await;
        let repo = ClientRepository::new(&pool);

        repo.register("acme", "s3cret").await.unwrap();

        assert_eq!(repo.find_by_api_key("s3cret").await.unwrap().as_deref(), Some("acme"));
        assert_eq!(repo.find_by_api_key("wrong").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_register_rotates_key() {
        let pool = testutil::pool().await;
        let repo = ClientRepository::new(&pool);

        repo.register("acme", "old").await.unwrap();
        repo.register("acme", "new").await.unwrap();

        assert_eq!(repo.find_by_api_key("old").await.unwrap(), None);
        assert_eq!(repo.find_by_api_key("new").await.unwrap().as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn test_keys_are_not_stored_in_clear() {
        let pool = testutil::pool().await;
        ClientRepository::new(&pool).register("acme", "s3cret").await.unwrap();

        let stored: String = sqlx::query_scalar("SELECT api_key_hash FROM clients")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_ne!(stored, "s3cret");
        assert_eq!(stored.len(), 64);
    }
}
