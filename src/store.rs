use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::warn;

use crate::types::Contact;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a contact with that number already exists for this tenant")]
    DuplicateContact,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persistent tenant data: the global bot flag, the contact directory and
/// bearer tokens. Backed by Postgres in production; tests use the in-memory
/// implementation.
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Global "bot enabled" flag for a tenant. A tenant without a config
    /// record reads as enabled; the record is created lazily on first read.
    async fn bot_config(&self, tenant_id: &str) -> bool;

    /// Flip the global flag, creating the record if needed. Returns the
    /// stored value.
    async fn set_bot_config(&self, tenant_id: &str, active: bool) -> bool;

    /// Whether a contact number is excluded from the automation pipeline.
    /// `number` is the bare phone number, without the `@c.us` suffix.
    async fn is_excluded(&self, tenant_id: &str, number: &str) -> bool;

    /// Resolve the tenant a bearer token was issued for.
    async fn tenant_for_token(&self, token: &str) -> Option<String>;

    async fn create_contact(&self, contact: Contact) -> Result<Contact, StoreError>;
    async fn list_contacts(&self, tenant_id: &str) -> Vec<Contact>;
    async fn update_contact(
        &self,
        tenant_id: &str,
        number: &str,
        name: Option<String>,
        excluded: Option<bool>,
    ) -> Option<Contact>;
    async fn delete_contact(&self, tenant_id: &str, number: &str) -> bool;
}

pub struct PgTenantStore {
    db: PgPool,
}

impl PgTenantStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn contact_from_row(row: sqlx::postgres::PgRow) -> Contact {
    Contact {
        tenant_id: row.get("tenant_id"),
        number: row.get("number"),
        name: row.get("name"),
        excluded_from_automation: row.get("excluded_from_automation"),
    }
}

#[async_trait]
impl TenantStore for PgTenantStore {
    async fn bot_config(&self, tenant_id: &str) -> bool {
        let stored = sqlx::query_scalar::<_, bool>(
            "SELECT active FROM tenant_bot_config WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.db)
        .await
        .ok()
        .flatten();

        match stored {
            Some(active) => active,
            None => {
                let _ = sqlx::query(
                    "INSERT INTO tenant_bot_config (tenant_id, active) VALUES ($1, TRUE) \
                     ON CONFLICT (tenant_id) DO NOTHING",
                )
                .bind(tenant_id)
                .execute(&self.db)
                .await;
                true
            }
        }
    }

    async fn set_bot_config(&self, tenant_id: &str, active: bool) -> bool {
        let result = sqlx::query(
            "INSERT INTO tenant_bot_config (tenant_id, active) VALUES ($1, $2) \
             ON CONFLICT (tenant_id) DO UPDATE SET active = EXCLUDED.active",
        )
        .bind(tenant_id)
        .bind(active)
        .execute(&self.db)
        .await;
        if let Err(err) = result {
            warn!(tenant_id, error = %err, "failed to persist bot config");
        }
        active
    }

    async fn is_excluded(&self, tenant_id: &str, number: &str) -> bool {
        sqlx::query_scalar::<_, bool>(
            "SELECT excluded_from_automation FROM contacts WHERE tenant_id = $1 AND number = $2",
        )
        .bind(tenant_id)
        .bind(number)
        .fetch_optional(&self.db)
        .await
        .ok()
        .flatten()
        .unwrap_or(false)
    }

    async fn tenant_for_token(&self, token: &str) -> Option<String> {
        sqlx::query_scalar::<_, String>("SELECT tenant_id FROM auth_tokens WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.db)
            .await
            .ok()
            .flatten()
    }

    async fn create_contact(&self, contact: Contact) -> Result<Contact, StoreError> {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM contacts WHERE tenant_id = $1 AND number = $2",
        )
        .bind(&contact.tenant_id)
        .bind(&contact.number)
        .fetch_one(&self.db)
        .await?;
        if exists > 0 {
            return Err(StoreError::DuplicateContact);
        }

        sqlx::query(
            "INSERT INTO contacts (tenant_id, number, name, excluded_from_automation, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&contact.tenant_id)
        .bind(&contact.number)
        .bind(&contact.name)
        .bind(contact.excluded_from_automation)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;
        Ok(contact)
    }

    async fn list_contacts(&self, tenant_id: &str) -> Vec<Contact> {
        sqlx::query(
            "SELECT tenant_id, number, name, excluded_from_automation \
             FROM contacts WHERE tenant_id = $1 ORDER BY number",
        )
        .bind(tenant_id)
        .fetch_all(&self.db)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(contact_from_row)
        .collect()
    }

    async fn update_contact(
        &self,
        tenant_id: &str,
        number: &str,
        name: Option<String>,
        excluded: Option<bool>,
    ) -> Option<Contact> {
        let row = sqlx::query(
            "UPDATE contacts \
             SET name = COALESCE($1, name), \
                 excluded_from_automation = COALESCE($2, excluded_from_automation) \
             WHERE tenant_id = $3 AND number = $4 \
             RETURNING tenant_id, number, name, excluded_from_automation",
        )
        .bind(name)
        .bind(excluded)
        .bind(tenant_id)
        .bind(number)
        .fetch_optional(&self.db)
        .await
        .ok()
        .flatten()?;
        Some(contact_from_row(row))
    }

    async fn delete_contact(&self, tenant_id: &str, number: &str) -> bool {
        sqlx::query("DELETE FROM contacts WHERE tenant_id = $1 AND number = $2")
            .bind(tenant_id)
            .bind(number)
            .execute(&self.db)
            .await
            .map(|result| result.rows_affected() > 0)
            .unwrap_or(false)
    }
}

/// In-memory store for tests and single-box development runs.
#[derive(Default)]
pub struct MemoryTenantStore {
    configs: Mutex<HashMap<String, bool>>,
    contacts: Mutex<HashMap<(String, String), Contact>>,
    tokens: Mutex<HashMap<String, String>>,
}

impl MemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_token(&self, token: &str, tenant_id: &str) {
        self.tokens
            .lock()
            .insert(token.to_string(), tenant_id.to_string());
    }
}

#[async_trait]
impl TenantStore for MemoryTenantStore {
    async fn bot_config(&self, tenant_id: &str) -> bool {
        *self
            .configs
            .lock()
            .entry(tenant_id.to_string())
            .or_insert(true)
    }

    async fn set_bot_config(&self, tenant_id: &str, active: bool) -> bool {
        self.configs.lock().insert(tenant_id.to_string(), active);
        active
    }

    async fn is_excluded(&self, tenant_id: &str, number: &str) -> bool {
        self.contacts
            .lock()
            .get(&(tenant_id.to_string(), number.to_string()))
            .map(|contact| contact.excluded_from_automation)
            .unwrap_or(false)
    }

    async fn tenant_for_token(&self, token: &str) -> Option<String> {
        self.tokens.lock().get(token).cloned()
    }

    async fn create_contact(&self, contact: Contact) -> Result<Contact, StoreError> {
        let key = (contact.tenant_id.clone(), contact.number.clone());
        let mut contacts = self.contacts.lock();
        if contacts.contains_key(&key) {
            return Err(StoreError::DuplicateContact);
        }
        contacts.insert(key, contact.clone());
        Ok(contact)
    }

    async fn list_contacts(&self, tenant_id: &str) -> Vec<Contact> {
        let mut list: Vec<Contact> = self
            .contacts
            .lock()
            .values()
            .filter(|contact| contact.tenant_id == tenant_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.number.cmp(&b.number));
        list
    }

    async fn update_contact(
        &self,
        tenant_id: &str,
        number: &str,
        name: Option<String>,
        excluded: Option<bool>,
    ) -> Option<Contact> {
        let mut contacts = self.contacts.lock();
        let contact = contacts.get_mut(&(tenant_id.to_string(), number.to_string()))?;
        if let Some(name) = name {
            contact.name = Some(name);
        }
        if let Some(excluded) = excluded {
            contact.excluded_from_automation = excluded;
        }
        Some(contact.clone())
    }

    async fn delete_contact(&self, tenant_id: &str, number: &str) -> bool {
        self.contacts
            .lock()
            .remove(&(tenant_id.to_string(), number.to_string()))
            .is_some()
    }
}
