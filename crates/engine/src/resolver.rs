//! Recipient resolver — maps roles to active users.

use async_trait::async_trait;
use sqlx::PgPool;

use tidings_common::error::StoreError;
use tidings_common::types::Recipient;

/// Directory lookup of active personnel by role.
///
/// No ordering is guaranteed. An empty role set yields an empty result.
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    async fn resolve(&self, roles: &[String]) -> Result<Vec<Recipient>, StoreError>;
}

/// Resolver backed by the `employees` table.
#[derive(Clone)]
pub struct PgRecipientResolver {
    pool: PgPool,
}

impl PgRecipientResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecipientResolver for PgRecipientResolver {
    async fn resolve(&self, roles: &[String]) -> Result<Vec<Recipient>, StoreError> {
        if roles.is_empty() {
            return Ok(Vec::new());
        }

        let recipients: Vec<Recipient> = sqlx::query_as(
            r#"
            SELECT id::text AS user_id, role, email AS contact_address
            FROM employees
            WHERE role = ANY($1)
              AND is_active = TRUE
            "#,
        )
        .bind(roles)
        .fetch_all(&self.pool)
        .await?;

        Ok(recipients)
    }
}

/// A directory entry for [`StaticRecipientResolver`].
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub recipient: Recipient,
    pub active: bool,
}

/// Fixed in-memory directory.
#[derive(Debug, Clone, Default)]
pub struct StaticRecipientResolver {
    entries: Vec<DirectoryEntry>,
}

impl StaticRecipientResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: &str, role: &str, active: bool) -> Self {
        self.entries.push(DirectoryEntry {
            recipient: Recipient {
                user_id: user_id.to_string(),
                role: role.to_string(),
                contact_address: None,
            },
            active,
        });
        self
    }
}

#[async_trait]
impl RecipientResolver for StaticRecipientResolver {
    async fn resolve(&self, roles: &[String]) -> Result<Vec<Recipient>, StoreError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.active && roles.iter().any(|r| *r == e.recipient.role))
            .map(|e| e.recipient.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver_skips_inactive_and_other_roles() {
        let resolver = StaticRecipientResolver::new()
            .with_user("1", "Administrator", true)
            .with_user("2", "Sales Head", true)
            .with_user("3", "Sales Head", false)
            .with_user("4", "Sales Representative", true);

        let mut ids: Vec<String> = resolver
            .resolve(&["Sales Head".to_string(), "Administrator".to_string()])
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.user_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_empty_roles_yield_empty_result() {
        let resolver = StaticRecipientResolver::new().with_user("1", "Administrator", true);
        assert!(resolver.resolve(&[]).await.unwrap().is_empty());
    }
}
