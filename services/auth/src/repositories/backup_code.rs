//! Backup recovery code repository
//!
//! Codes are stored one ciphertext per row, distinct from the TOTP
//! secret. Consumption deletes the row, so a code can be used at most
//! once; the DELETE row count is the consumption check.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::stores::{BackupCodeStore, StoredBackupCode};

/// Backup code repository
#[derive(Clone)]
pub struct BackupCodeRepository {
    pool: PgPool,
}

impl BackupCodeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BackupCodeStore for BackupCodeRepository {
    async fn store(&self, account_id: i64, ciphertexts: Vec<Vec<u8>>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM backup_codes WHERE account_id = $1")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;

        for ciphertext in &ciphertexts {
            sqlx::query("INSERT INTO backup_codes (account_id, code_ciphertext) VALUES ($1, $2)")
                .bind(account_id)
                .bind(ciphertext)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, account_id: i64) -> Result<Vec<StoredBackupCode>> {
        let rows = sqlx::query(
            "SELECT id, code_ciphertext FROM backup_codes WHERE account_id = $1 ORDER BY id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StoredBackupCode {
                id: row.get("id"),
                ciphertext: row.get("code_ciphertext"),
            })
            .collect())
    }

    async fn consume(&self, account_id: i64, code_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM backup_codes WHERE id = $1 AND account_id = $2")
            .bind(code_id)
            .bind(account_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_all(&self, account_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM backup_codes WHERE account_id = $1")
            .bind(account_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
