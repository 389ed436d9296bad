//! Secret store client. Credentials live under `tenants/{tenant_id}/...`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::ignore_missing;
use crate::error::{ProviderError, StageError};
use crate::models::{CredentialBundle, IntegrationKeys};
use crate::naming::{ResourceNames, TAG_TENANT};
use crate::providers::SecretService;

pub struct SecretStoreClient {
    secrets: Arc<dyn SecretService>,
    recovery_window_days: u32,
}

impl SecretStoreClient {
    pub fn new(secrets: Arc<dyn SecretService>, recovery_window_days: u32) -> Self {
        Self {
            secrets,
            recovery_window_days,
        }
    }

    /// Store the tenant's database credentials; returns the secret reference.
    pub async fn store_credentials(
        &self,
        tenant_id: &str,
        bundle: &CredentialBundle,
    ) -> Result<String, StageError> {
        let names = ResourceNames::new(tenant_id);
        let value = serde_json::to_string(bundle)
            .map_err(|e| StageError::ConfigValidation(format!("credential bundle: {e}")))?;
        self.put(&names, &names.database_secret(), &value).await
    }

    pub async fn get_credentials(&self, tenant_id: &str) -> Result<CredentialBundle, StageError> {
        let name = ResourceNames::new(tenant_id).database_secret();
        let secret = self
            .secrets
            .get_secret(&name)
            .await
            .map_err(StageError::api("GetSecret"))?;
        serde_json::from_str(&secret.value).map_err(|e| StageError::ExternalApi {
            op: "GetSecret",
            source: ProviderError::Api(format!("secret {name} is not a credential bundle: {e}")),
        })
    }

    /// Replace only the password of the stored bundle.
    pub async fn rotate_password(
        &self,
        tenant_id: &str,
        new_password: String,
    ) -> Result<String, StageError> {
        let bundle = self.get_credentials(tenant_id).await?.with_password(new_password);
        let name = ResourceNames::new(tenant_id).database_secret();
        let value = serde_json::to_string(&bundle)
            .map_err(|e| StageError::ConfigValidation(format!("credential bundle: {e}")))?;
        let reference = self
            .secrets
            .update_secret(&name, &value)
            .await
            .map_err(StageError::api("UpdateSecret"))?;
        tracing::info!(tenant_id, secret = %name, "database password rotated in secret store");
        Ok(reference)
    }

    /// Store third-party keys. Nothing is written when there are none.
    pub async fn store_integration_keys(
        &self,
        tenant_id: &str,
        keys: &IntegrationKeys,
    ) -> Result<Option<String>, StageError> {
        if keys.is_empty() {
            return Ok(None);
        }
        let names = ResourceNames::new(tenant_id);
        let value = serde_json::to_string(keys)
            .map_err(|e| StageError::ConfigValidation(format!("integration keys: {e}")))?;
        self.put(&names, &names.integrations_secret(), &value)
            .await
            .map(Some)
    }

    pub async fn list_tenant_secrets(&self, tenant_id: &str) -> Result<Vec<String>, StageError> {
        self.secrets
            .list_secrets_by_tag(TAG_TENANT, tenant_id)
            .await
            .map_err(StageError::api("ListSecretsByTag"))
    }

    /// Schedule deletion of one secret. `None` when it was already gone.
    pub async fn delete_secret(&self, name: &str) -> Result<Option<DateTime<Utc>>, StageError> {
        let when = ignore_missing(
            self.secrets
                .delete_secret(name, self.recovery_window_days)
                .await,
        )
        .map_err(StageError::api("DeleteSecret"))?;
        if let Some(when) = when {
            tracing::info!(secret = %name, erase_after = %when, "secret scheduled for deletion");
        }
        Ok(when)
    }

    /// Schedule deletion of every secret tagged with the tenant.
    pub async fn delete_tenant_secrets(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StageError> {
        let mut scheduled = Vec::new();
        for name in self.list_tenant_secrets(tenant_id).await? {
            if let Some(when) = self.delete_secret(&name).await? {
                scheduled.push((name, when));
            }
        }
        Ok(scheduled)
    }

    pub fn recovery_window_days(&self) -> u32 {
        self.recovery_window_days
    }

    /// Create, or update when the name is taken, so retries converge.
    async fn put(
        &self,
        names: &ResourceNames,
        name: &str,
        value: &str,
    ) -> Result<String, StageError> {
        let tags = names.tags();

        match self.secrets.create_secret(name, value, &tags).await {
            Ok(reference) => {
                tracing::info!(tenant_id = names.tenant_id(), secret = %name, "secret created");
                Ok(reference)
            }
            Err(e) if e.is_already_exists() => {
                tracing::debug!(secret = %name, "secret exists, updating");
                self.secrets
                    .update_secret(name, value)
                    .await
                    .map_err(StageError::api("UpdateSecret"))
            }
            Err(e) => Err(StageError::ExternalApi {
                op: "CreateSecret",
                source: e,
            }),
        }
    }
}
