use anyhow::{Result, anyhow};
use rusqlite::{OptionalExtension, Row, params};

use super::{Store, now_millis};
use crate::core::catalog::types::{Capability, CapabilityStatus, Category};

const CAPABILITY_COLUMNS: &str = "id, name, category, vendor, executor_id, provider_json, \
     default_params, input_schema, status, requires_image, pricing_json";

struct CapabilityRow {
    id: String,
    name: String,
    category: String,
    vendor: String,
    executor_id: Option<String>,
    provider_json: String,
    default_params: String,
    input_schema: String,
    status: String,
    requires_image: bool,
    pricing_json: Option<String>,
}

impl CapabilityRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            category: row.get(2)?,
            vendor: row.get(3)?,
            executor_id: row.get(4)?,
            provider_json: row.get(5)?,
            default_params: row.get(6)?,
            input_schema: row.get(7)?,
            status: row.get(8)?,
            requires_image: row.get(9)?,
            pricing_json: row.get(10)?,
        })
    }

    fn into_capability(self) -> Result<Capability> {
        Ok(Capability {
            category: Category::from_str_opt(&self.category)
                .ok_or_else(|| anyhow!("capability {} has unknown category", self.id))?,
            status: CapabilityStatus::from_str_opt(&self.status)
                .ok_or_else(|| anyhow!("capability {} has unknown status", self.id))?,
            provider: serde_json::from_str(&self.provider_json)?,
            default_params: serde_json::from_str(&self.default_params)?,
            input_schema: serde_json::from_str(&self.input_schema)?,
            pricing: self
                .pricing_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            id: self.id,
            name: self.name,
            vendor: self.vendor,
            executor_id: self.executor_id,
            requires_image: self.requires_image,
        })
    }
}

impl Store {
    pub async fn upsert_capability(&self, capability: &Capability) -> Result<()> {
        let provider_json = serde_json::to_string(&capability.provider)?;
        let default_params = serde_json::to_string(&capability.default_params)?;
        let input_schema = serde_json::to_string(&capability.input_schema)?;
        let pricing_json = capability
            .pricing
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO capabilities (id, name, category, vendor, executor_id, provider_json,
                default_params, input_schema, status, requires_image, pricing_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                category = excluded.category,
                vendor = excluded.vendor,
                executor_id = excluded.executor_id,
                provider_json = excluded.provider_json,
                default_params = excluded.default_params,
                input_schema = excluded.input_schema,
                status = excluded.status,
                requires_image = excluded.requires_image,
                pricing_json = excluded.pricing_json,
                updated_at = excluded.updated_at",
            params![
                capability.id,
                capability.name,
                capability.category.as_str(),
                capability.vendor,
                capability.executor_id,
                provider_json,
                default_params,
                input_schema,
                capability.status.as_str(),
                capability.requires_image,
                pricing_json,
                now_millis(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_capability(&self, id: &str) -> Result<Option<Capability>> {
        let row = {
            let db = self.db.lock().await;
            db.query_row(
                &format!("SELECT {CAPABILITY_COLUMNS} FROM capabilities WHERE id = ?1"),
                params![id],
                CapabilityRow::from_row,
            )
            .optional()?
        };
        row.map(CapabilityRow::into_capability).transpose()
    }

    pub async fn list_capabilities(&self) -> Result<Vec<Capability>> {
        let rows = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare(&format!(
                "SELECT {CAPABILITY_COLUMNS} FROM capabilities ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map([], CapabilityRow::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        rows.into_iter()
            .map(CapabilityRow::into_capability)
            .collect()
    }
}
