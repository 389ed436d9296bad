//! Managed database provisioning: shared network prerequisites, a
//! per-tenant instance sized by tier, resize and teardown.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::containers::catalog;
use super::secrets::SecretStoreClient;
use super::{find_or_create, ignore_missing};
use crate::config::ProvisionerConfig;
use crate::error::{ProviderError, StageError};
use crate::models::{AccountTier, CredentialBundle, DatabaseHandle, PaidPlan, TenantConfig};
use crate::naming::{ResourceNames, DB_SECURITY_GROUP, SHARED_SUBNET_GROUP};
use crate::poll::{poll_until, Poll, PollSettings};
use crate::providers::{
    CreateInstanceRequest, DatabaseService, DeleteInstanceRequest, IngressRule,
    InstanceDescription, InstanceStatus, ModifyInstanceRequest, NetworkService,
};

pub const ENGINE: &str = "postgres";
pub const ENGINE_VERSION: &str = "15";
pub const PORT: u16 = 5432;
pub const MAIN_DATABASE: &str = "tenant_main";

const PASSWORD_LEN: usize = 32;
const USERNAME_SUFFIX_LEN: usize = 6;

/// Instance sizing policy per account tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSizing {
    pub instance_class: String,
    pub allocated_storage_gb: u32,
    pub multi_az: bool,
    pub backup_retention_days: u32,
    pub deletion_protection: bool,
}

impl InstanceSizing {
    pub fn for_tier(tier: AccountTier) -> Self {
        let (class, storage, multi_az, retention) = match tier {
            AccountTier::Trial => ("db.t3.micro", 20, false, 0),
            AccountTier::Paid(PaidPlan::Basic) => ("db.t3.micro", 20, false, 3),
            AccountTier::Paid(PaidPlan::Professional) => ("db.t3.small", 50, true, 7),
        };
        Self {
            instance_class: class.to_string(),
            allocated_storage_gb: storage,
            multi_az,
            backup_retention_days: retention,
            deletion_protection: !tier.is_trial(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseOutcome {
    pub credentials: CredentialBundle,
    pub handle: DatabaseHandle,
    /// The instance already existed and its stored credentials were reused.
    pub reused: bool,
}

/// Result of a tier change on an existing instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeSummary {
    pub tenant_id: String,
    pub from: AccountTier,
    pub to: AccountTier,
    pub snapshot_id: String,
    pub sizing: InstanceSizing,
    pub apply_immediately: bool,
}

pub struct DatabaseProvisioner {
    databases: Arc<dyn DatabaseService>,
    network: Arc<dyn NetworkService>,
    poll: PollSettings,
}

impl DatabaseProvisioner {
    pub fn new(
        databases: Arc<dyn DatabaseService>,
        network: Arc<dyn NetworkService>,
        config: &ProvisionerConfig,
    ) -> Self {
        Self {
            databases,
            network,
            poll: config.database_poll,
        }
    }

    /// Create (or reuse) the tenant's instance and wait until it is available.
    pub async fn ensure_database(
        &self,
        config: &TenantConfig,
        secrets: &SecretStoreClient,
        cancel: &CancellationToken,
    ) -> Result<DatabaseOutcome, StageError> {
        let names = ResourceNames::new(&config.tenant_id);
        let instance_id = names.db_instance();
        let (subnet_group, security_group_id) = self.ensure_network().await?;

        let existing = ignore_missing(self.databases.describe_instance(&instance_id).await)
            .map_err(StageError::api("DescribeInstance"))?;
        if let Some(existing) = existing {
            return self.reuse(config, existing, secrets, cancel).await;
        }

        let sizing = InstanceSizing::for_tier(config.tier);
        let credentials = CredentialBundle {
            engine: ENGINE.to_string(),
            host: String::new(),
            port: PORT,
            username: names.db_username(&random_suffix()),
            password: random_password(),
            database: MAIN_DATABASE.to_string(),
            service_databases: service_databases(config, &names),
        };

        let request = CreateInstanceRequest {
            instance_id: instance_id.clone(),
            instance_class: sizing.instance_class.clone(),
            engine: ENGINE.to_string(),
            engine_version: ENGINE_VERSION.to_string(),
            allocated_storage_gb: sizing.allocated_storage_gb,
            master_username: credentials.username.clone(),
            master_password: credentials.password.clone(),
            db_name: MAIN_DATABASE.to_string(),
            port: PORT,
            subnet_group,
            security_group_ids: vec![security_group_id],
            multi_az: sizing.multi_az,
            backup_retention_days: sizing.backup_retention_days,
            storage_encrypted: true,
            deletion_protection: sizing.deletion_protection,
            publicly_accessible: false,
            tags: names.tags(),
        };

        match self.databases.create_instance(&request).await {
            Ok(_) => {
                tracing::info!(
                    tenant_id = %config.tenant_id,
                    %instance_id,
                    instance_class = %sizing.instance_class,
                    multi_az = sizing.multi_az,
                    "database instance creating"
                );
            }
            Err(e) if e.is_already_exists() => {
                // Another run created it between describe and create.
                let existing = self
                    .databases
                    .describe_instance(&instance_id)
                    .await
                    .map_err(StageError::api("DescribeInstance"))?;
                return self.reuse(config, existing, secrets, cancel).await;
            }
            Err(e) => {
                return Err(StageError::ExternalApi {
                    op: "CreateInstance",
                    source: e,
                })
            }
        }

        // Stored before the wait so a later run can adopt the instance.
        secrets.store_credentials(&config.tenant_id, &credentials).await?;

        let available = self.wait_available(&instance_id, cancel).await?;
        let handle = handle_from(&available)?;
        Ok(DatabaseOutcome {
            credentials: CredentialBundle {
                host: handle.endpoint.clone(),
                port: handle.port,
                ..credentials
            },
            handle,
            reused: false,
        })
    }

    /// Existing instance: the password only lives in the secret store.
    async fn reuse(
        &self,
        config: &TenantConfig,
        existing: InstanceDescription,
        secrets: &SecretStoreClient,
        cancel: &CancellationToken,
    ) -> Result<DatabaseOutcome, StageError> {
        if matches!(existing.status, InstanceStatus::Deleting | InstanceStatus::Failed) {
            return Err(StageError::ExternalApi {
                op: "DescribeInstance",
                source: ProviderError::Api(format!(
                    "instance {} exists in state {:?} and cannot be reused",
                    existing.instance_id, existing.status
                )),
            });
        }
        let stored = secrets.get_credentials(&config.tenant_id).await?;
        tracing::info!(
            tenant_id = %config.tenant_id,
            instance_id = %existing.instance_id,
            "reusing existing database instance"
        );

        let available = if existing.status == InstanceStatus::Available && existing.endpoint.is_some() {
            existing
        } else {
            self.wait_available(&existing.instance_id, cancel).await?
        };
        let handle = handle_from(&available)?;
        Ok(DatabaseOutcome {
            credentials: CredentialBundle {
                host: handle.endpoint.clone(),
                port: handle.port,
                ..stored
            },
            handle,
            reused: true,
        })
    }

    async fn wait_available(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<InstanceDescription, StageError> {
        let databases = &self.databases;
        poll_until(
            &format!("database instance {instance_id}"),
            &self.poll,
            cancel,
            || async move {
                let desc = databases
                    .describe_instance(instance_id)
                    .await
                    .map_err(StageError::api("DescribeInstance"))?;
                match desc.status {
                    InstanceStatus::Available => Ok(Poll::Ready(desc)),
                    InstanceStatus::Failed => Err(StageError::DatabaseFailed(instance_id.to_string())),
                    other => Ok(Poll::Pending(format!("{other:?}"))),
                }
            },
        )
        .await
    }

    /// Shared subnet group and database security group, created on first use.
    async fn ensure_network(&self) -> Result<(String, String), StageError> {
        let network = self
            .network
            .describe_default_network()
            .await
            .map_err(StageError::api("DescribeDefaultNetwork"))?;
        let subnets = self
            .network
            .describe_subnets(&network.id)
            .await
            .map_err(StageError::api("DescribeSubnets"))?;
        let mut private: Vec<String> = subnets
            .iter()
            .filter(|s| !s.public)
            .map(|s| s.id.clone())
            .collect();
        if private.is_empty() {
            private = subnets.iter().map(|s| s.id.clone()).collect();
        }

        let databases = &self.databases;
        let private = private.as_slice();
        let subnet_group = find_or_create(
            "CreateSubnetGroup",
            || async move { ignore_missing(databases.describe_subnet_group(SHARED_SUBNET_GROUP).await) },
            || async move {
                databases
                    .create_subnet_group(SHARED_SUBNET_GROUP, private, "tenantstack shared database subnets")
                    .await
            },
        )
        .await?
        .into_inner();

        let net = &self.network;
        let network_id = network.id.as_str();
        let group = find_or_create(
            "CreateSecurityGroup",
            || async move { net.find_security_group(network_id, DB_SECURITY_GROUP).await },
            || async move {
                net.create_security_group(network_id, DB_SECURITY_GROUP, "tenant database access")
                    .await
            },
        )
        .await?;

        if group.was_created() {
            tracing::info!(group = DB_SECURITY_GROUP, "created database security group");
        }
        let group = group.into_inner();
        let rule = IngressRule {
            protocol: "tcp".to_string(),
            port: PORT,
            cidr: network.cidr.clone(),
        };
        match self.network.authorize_ingress(&group.id, &rule).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {}
            Err(e) => {
                return Err(StageError::ExternalApi {
                    op: "AuthorizeIngress",
                    source: e,
                })
            }
        }

        Ok((subnet_group.name, group.id))
    }

    /// Snapshot, then resize during the next maintenance window.
    pub async fn upgrade_database(
        &self,
        tenant_id: &str,
        current: &DatabaseHandle,
        from: AccountTier,
        to: AccountTier,
    ) -> Result<UpgradeSummary, StageError> {
        let names = ResourceNames::new(tenant_id);
        let snapshot_id = self
            .databases
            .create_snapshot(&current.instance_id, &names.upgrade_snapshot(Utc::now().timestamp()))
            .await
            .map_err(StageError::api("CreateSnapshot"))?;

        let mut sizing = InstanceSizing::for_tier(to);
        // Storage can grow but never shrink.
        sizing.allocated_storage_gb = sizing.allocated_storage_gb.max(current.allocated_storage_gb);

        let request = ModifyInstanceRequest {
            instance_id: current.instance_id.clone(),
            instance_class: Some(sizing.instance_class.clone()),
            allocated_storage_gb: Some(sizing.allocated_storage_gb),
            multi_az: Some(sizing.multi_az),
            backup_retention_days: Some(sizing.backup_retention_days),
            deletion_protection: Some(sizing.deletion_protection),
            master_password: None,
            apply_immediately: false,
        };
        self.databases
            .modify_instance(&request)
            .await
            .map_err(StageError::api("ModifyInstance"))?;

        tracing::info!(
            tenant_id,
            instance_id = %current.instance_id,
            %snapshot_id,
            instance_class = %sizing.instance_class,
            "database resize scheduled for the maintenance window"
        );
        Ok(UpgradeSummary {
            tenant_id: tenant_id.to_string(),
            from,
            to,
            snapshot_id,
            sizing,
            apply_immediately: false,
        })
    }

    pub async fn rotate_master_password(
        &self,
        instance_id: &str,
        new_password: &str,
    ) -> Result<(), StageError> {
        let request = ModifyInstanceRequest {
            instance_id: instance_id.to_string(),
            master_password: Some(new_password.to_string()),
            apply_immediately: true,
            ..Default::default()
        };
        self.databases
            .modify_instance(&request)
            .await
            .map_err(StageError::api("ModifyInstance"))?;
        Ok(())
    }

    /// Delete with a final snapshot. Returns the snapshot id, `None` if the
    /// instance was already gone.
    pub async fn delete_database(
        &self,
        tenant_id: &str,
        handle: &DatabaseHandle,
    ) -> Result<Option<String>, StageError> {
        if handle.deletion_protection {
            let request = ModifyInstanceRequest {
                instance_id: handle.instance_id.clone(),
                deletion_protection: Some(false),
                apply_immediately: true,
                ..Default::default()
            };
            let modified = ignore_missing(self.databases.modify_instance(&request).await)
                .map_err(StageError::api("ModifyInstance"))?;
            if modified.is_none() {
                return Ok(None);
            }
        }

        let snapshot = ResourceNames::new(tenant_id).final_snapshot(Utc::now().timestamp());
        let request = DeleteInstanceRequest {
            instance_id: handle.instance_id.clone(),
            final_snapshot_id: Some(snapshot.clone()),
        };
        let deleted = ignore_missing(self.databases.delete_instance(&request).await)
            .map_err(StageError::api("DeleteInstance"))?;
        Ok(deleted.map(|()| snapshot))
    }

    /// Delete the tenant's instance by name, whatever state it is in. Used
    /// when the database stage failed after the instance was requested.
    pub async fn delete_leftover(&self, tenant_id: &str) -> Result<Option<RemovedInstance>, StageError> {
        let instance_id = ResourceNames::new(tenant_id).db_instance();
        let found = ignore_missing(self.databases.describe_instance(&instance_id).await)
            .map_err(StageError::api("DescribeInstance"))?;
        let Some(desc) = found else {
            return Ok(None);
        };
        if desc.status == InstanceStatus::Deleting {
            return Ok(Some(RemovedInstance {
                instance_id,
                final_snapshot: None,
            }));
        }

        let handle = DatabaseHandle {
            instance_id: desc.instance_id.clone(),
            endpoint: desc.endpoint.clone().unwrap_or_default(),
            port: desc.port,
            instance_class: desc.instance_class.clone(),
            allocated_storage_gb: desc.allocated_storage_gb,
            multi_az: desc.multi_az,
            backup_retention_days: desc.backup_retention_days,
            deletion_protection: desc.deletion_protection,
        };
        let final_snapshot = self.delete_database(tenant_id, &handle).await?;
        tracing::info!(tenant_id, %instance_id, status = ?desc.status, "removed database left by a failed stage");
        Ok(Some(RemovedInstance {
            instance_id,
            final_snapshot,
        }))
    }
}

/// Instance removed while cleaning up after a failed database stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedInstance {
    pub instance_id: String,
    pub final_snapshot: Option<String>,
}

fn handle_from(desc: &InstanceDescription) -> Result<DatabaseHandle, StageError> {
    let endpoint = desc.endpoint.clone().ok_or_else(|| StageError::ExternalApi {
        op: "DescribeInstance",
        source: ProviderError::Api(format!(
            "instance {} is available but reports no endpoint",
            desc.instance_id
        )),
    })?;
    Ok(DatabaseHandle {
        instance_id: desc.instance_id.clone(),
        endpoint,
        port: desc.port,
        instance_class: desc.instance_class.clone(),
        allocated_storage_gb: desc.allocated_storage_gb,
        multi_az: desc.multi_az,
        backup_retention_days: desc.backup_retention_days,
        deletion_protection: desc.deletion_protection,
    })
}

fn service_databases(config: &TenantConfig, names: &ResourceNames) -> BTreeMap<String, String> {
    catalog(config)
        .into_iter()
        .map(|entry| (entry.name.to_string(), names.service_database(entry.name)))
        .collect()
}

pub(crate) fn random_password() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

fn random_suffix() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(USERNAME_SUFFIX_LEN)
        .map(char::from)
        .collect::<String>()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing_follows_tier_table() {
        let trial = InstanceSizing::for_tier(AccountTier::Trial);
        assert_eq!(trial.instance_class, "db.t3.micro");
        assert_eq!(trial.backup_retention_days, 0);
        assert!(!trial.deletion_protection);

        let basic = InstanceSizing::for_tier(AccountTier::Paid(PaidPlan::Basic));
        assert_eq!(basic.backup_retention_days, 3);
        assert!(basic.deletion_protection);

        let pro = InstanceSizing::for_tier(AccountTier::Paid(PaidPlan::Professional));
        assert_eq!(pro.instance_class, "db.t3.small");
        assert_eq!(pro.allocated_storage_gb, 50);
        assert!(pro.multi_az);
        assert_eq!(pro.backup_retention_days, 7);
    }

    #[test]
    fn generated_credentials_are_random() {
        let a = random_password();
        let b = random_password();
        assert_eq!(a.len(), PASSWORD_LEN);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(random_suffix().len(), USERNAME_SUFFIX_LEN);
    }

    #[test]
    fn service_databases_follow_catalog() {
        let config = TenantConfig::new("acme-1", AccountTier::Trial);
        let dbs = service_databases(&config, &ResourceNames::new("acme-1"));
        assert_eq!(dbs.get("crm").map(String::as_str), Some("acme_1_crm"));
        assert_eq!(dbs.get("portal").map(String::as_str), Some("acme_1_portal"));
        assert!(!dbs.contains_key("booking"));
    }
}
