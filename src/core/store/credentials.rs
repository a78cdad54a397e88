use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use tracing::warn;

use super::types::{CredentialRecord, CredentialStatus, NewCredential};
use super::{Store, from_millis, now_millis, to_millis};

const CREDENTIAL_COLUMNS: &str = "id, vendor, label, key_id, secret, status, usage_count, \
     last_used_at, expires_at, cooldown_until";

struct CredentialRow {
    id: i64,
    vendor: String,
    label: Option<String>,
    key_id: Option<String>,
    stored_secret: String,
    status: String,
    usage_count: i64,
    last_used_at: Option<i64>,
    expires_at: Option<i64>,
    cooldown_until: Option<i64>,
}

impl CredentialRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            vendor: row.get(1)?,
            label: row.get(2)?,
            key_id: row.get(3)?,
            stored_secret: row.get(4)?,
            status: row.get(5)?,
            usage_count: row.get(6)?,
            last_used_at: row.get(7)?,
            expires_at: row.get(8)?,
            cooldown_until: row.get(9)?,
        })
    }
}

impl Store {
    fn reveal_row(&self, row: CredentialRow) -> Result<(CredentialRecord, bool)> {
        let revealed = self.cipher.reveal(&row.stored_secret, row.id);
        let status = CredentialStatus::from_str_opt(&row.status)
            .ok_or_else(|| anyhow!("credential {} has unknown status '{}'", row.id, row.status))?;
        Ok((
            CredentialRecord {
                id: row.id,
                vendor: row.vendor,
                label: row.label,
                key_id: row.key_id,
                secret: revealed.secret,
                status,
                usage_count: row.usage_count,
                last_used_at: row.last_used_at.map(from_millis),
                expires_at: row.expires_at.map(from_millis),
                cooldown_until: row.cooldown_until.map(from_millis),
            },
            revealed.needs_rewrite,
        ))
    }

    async fn reveal_rows(&self, rows: Vec<CredentialRow>) -> Result<Vec<CredentialRecord>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let (record, needs_rewrite) = self.reveal_row(row)?;
            if needs_rewrite && let Err(e) = self.rewrite_secret(record.id, &record.secret).await {
                warn!(credential_id = record.id, "Failed to re-encrypt secret: {}", e);
            }
            out.push(record);
        }
        Ok(out)
    }

    async fn rewrite_secret(&self, id: i64, secret: &str) -> Result<()> {
        let encrypted = self.cipher.encrypt(secret)?;
        let db = self.db.lock().await;
        db.execute(
            "UPDATE credentials SET secret = ?1 WHERE id = ?2",
            params![encrypted, id],
        )?;
        Ok(())
    }

    pub async fn insert_credential(&self, credential: &NewCredential) -> Result<i64> {
        let encrypted = self.cipher.encrypt(&credential.secret)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO credentials (vendor, label, key_id, secret, status, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                credential.vendor,
                credential.label,
                credential.key_id,
                encrypted,
                credential.status.as_str(),
                credential.expires_at.map(to_millis),
                now_millis(),
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Replace secret, key id, status and expiry of an existing credential.
    pub async fn update_credential(&self, id: i64, credential: &NewCredential) -> Result<bool> {
        let encrypted = self.cipher.encrypt(&credential.secret)?;
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE credentials SET key_id = ?1, secret = ?2, status = ?3, expires_at = ?4
             WHERE id = ?5",
            params![
                credential.key_id,
                encrypted,
                credential.status.as_str(),
                credential.expires_at.map(to_millis),
                id,
            ],
        )?;
        Ok(rows > 0)
    }

    pub async fn find_credential_by_label(
        &self,
        vendor: &str,
        label: &str,
    ) -> Result<Option<CredentialRecord>> {
        let row = {
            let db = self.db.lock().await;
            db.query_row(
                &format!(
                    "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE vendor = ?1 AND label = ?2"
                ),
                params![vendor, label],
                CredentialRow::from_row,
            )
            .optional()?
        };
        Ok(self
            .reveal_rows(row.into_iter().collect())
            .await?
            .into_iter()
            .next())
    }

    pub async fn get_credential(&self, id: i64) -> Result<Option<CredentialRecord>> {
        let row = {
            let db = self.db.lock().await;
            db.query_row(
                &format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE id = ?1"),
                params![id],
                CredentialRow::from_row,
            )
            .optional()?
        };
        Ok(self
            .reveal_rows(row.into_iter().collect())
            .await?
            .into_iter()
            .next())
    }

    /// All credentials of a vendor regardless of usability; ranking happens
    /// in the selector.
    pub async fn list_credentials(&self, vendor: &str) -> Result<Vec<CredentialRecord>> {
        let rows = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare(&format!(
                "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE vendor = ?1 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![vendor], CredentialRow::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        self.reveal_rows(rows).await
    }

    pub async fn record_credential_use(&self, id: i64) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE credentials SET usage_count = usage_count + 1, last_used_at = ?1 WHERE id = ?2",
            params![now_millis(), id],
        )?;
        Ok(())
    }

    /// Never shortens an existing, longer cooldown.
    pub async fn set_credential_cooldown(&self, id: i64, until: DateTime<Utc>) -> Result<()> {
        let until = to_millis(until);
        let db = self.db.lock().await;
        db.execute(
            "UPDATE credentials SET cooldown_until = ?1
             WHERE id = ?2 AND (cooldown_until IS NULL OR cooldown_until < ?1)",
            params![until, id],
        )?;
        Ok(())
    }

    pub async fn set_credential_status(&self, id: i64, status: CredentialStatus) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE credentials SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;
    use chrono::Duration;

    fn new_credential(secret: &str) -> NewCredential {
        NewCredential {
            vendor: "acme".into(),
            label: Some(format!("key-{secret}")),
            secret: secret.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn secrets_are_encrypted_at_rest() {
        let store = test_store();
        let id = store
            .insert_credential(&new_credential("sk-1"))
            .await
            .unwrap();

        let raw: String = {
            let db = store.db.lock().await;
            db.query_row(
                "SELECT secret FROM credentials WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .unwrap()
        };
        assert_ne!(raw, "sk-1");
        assert_eq!(store.get_credential(id).await.unwrap().unwrap().secret, "sk-1");
    }

    #[tokio::test]
    async fn usage_and_cooldown_updates_are_visible() {
        let store = test_store();
        let id = store
            .insert_credential(&new_credential("sk-2"))
            .await
            .unwrap();
        store.record_credential_use(id).await.unwrap();
        store.record_credential_use(id).await.unwrap();

        let later = Utc::now() + Duration::seconds(120);
        store.set_credential_cooldown(id, later).await.unwrap();
        // a shorter cooldown does not override the longer one
        store
            .set_credential_cooldown(id, Utc::now() + Duration::seconds(5))
            .await
            .unwrap();

        let cred = store.get_credential(id).await.unwrap().unwrap();
        assert_eq!(cred.usage_count, 2);
        assert!(cred.last_used_at.is_some());
        assert_eq!(
            cred.cooldown_until.map(|t| t.timestamp_millis()),
            Some(later.timestamp_millis())
        );
        assert!(!cred.is_usable(Utc::now()));
    }

    #[tokio::test]
    async fn legacy_plaintext_rows_are_reencrypted_on_read() {
        let store = test_store();
        {
            let db = store.db.lock().await;
            db.execute(
                "INSERT INTO credentials (vendor, secret, status, created_at) VALUES ('acme', 'plain', 'active', 0)",
                [],
            )
            .unwrap();
        }
        let creds = store.list_credentials("acme").await.unwrap();
        assert_eq!(creds[0].secret, "plain");

        let raw: String = {
            let db = store.db.lock().await;
            db.query_row("SELECT secret FROM credentials", [], |r| r.get(0))
                .unwrap()
        };
        assert_ne!(raw, "plain");
    }
}
