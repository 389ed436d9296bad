//! DNS record manager: upserts for challenges and tenant hosts, deletes for rollback.

use std::sync::Arc;

use tokio::sync::OnceCell;

use super::ignore_missing;
use crate::error::{ProviderError, StageError};
use crate::providers::{DnsRecord, DnsService, HostedZone};

#[derive(Clone)]
pub struct DnsRecordManager {
    dns: Arc<dyn DnsService>,
    ttl: u32,
    zones: Arc<OnceCell<Vec<HostedZone>>>,
}

impl DnsRecordManager {
    pub fn new(dns: Arc<dyn DnsService>, ttl: u32) -> Self {
        Self {
            dns,
            ttl,
            zones: Arc::new(OnceCell::new()),
        }
    }

    /// Create or replace a record. Returns the provider's change reference.
    pub async fn upsert_record(
        &self,
        name: &str,
        record_type: &str,
        value: &str,
    ) -> Result<String, StageError> {
        let zone = self.zone_for(name).await?;
        let record = self.record(name, record_type, value);
        let change = self
            .dns
            .upsert_record(&zone.id, &record)
            .await
            .map_err(StageError::api("UpsertRecord"))?;
        tracing::info!(name = %record.name, record_type, zone = %zone.name, %change, "DNS record upserted");
        Ok(change)
    }

    /// Remove a record. A record that is already gone counts as removed.
    pub async fn delete_record(
        &self,
        name: &str,
        record_type: &str,
        value: &str,
    ) -> Result<(), StageError> {
        let zone = self.zone_for(name).await?;
        let record = self.record(name, record_type, value);
        match ignore_missing(self.dns.delete_record(&zone.id, &record).await)
            .map_err(StageError::api("DeleteRecord"))?
        {
            Some(change) => tracing::info!(name = %record.name, %change, "DNS record deleted"),
            None => tracing::debug!(name = %record.name, "DNS record already absent"),
        }
        Ok(())
    }

    fn record(&self, name: &str, record_type: &str, value: &str) -> DnsRecord {
        DnsRecord {
            name: normalize(name).to_string(),
            record_type: record_type.to_string(),
            value: normalize(value).to_string(),
            ttl: self.ttl,
        }
    }

    /// Hosted zone with the longest name that is a suffix of `name`.
    async fn zone_for(&self, name: &str) -> Result<HostedZone, StageError> {
        let zones = self
            .zones
            .get_or_try_init(|| async { self.dns.list_zones().await })
            .await
            .map_err(StageError::api("ListZones"))?;

        best_zone(zones, name).cloned().ok_or_else(|| StageError::ExternalApi {
            op: "ListZones",
            source: ProviderError::not_found("hosted zone", name),
        })
    }
}

fn normalize(name: &str) -> &str {
    name.trim_end_matches('.')
}

fn best_zone<'a>(zones: &'a [HostedZone], name: &str) -> Option<&'a HostedZone> {
    let name = normalize(name);
    zones
        .iter()
        .filter(|z| {
            let zone = normalize(&z.name);
            name == zone || name.ends_with(&format!(".{zone}"))
        })
        .max_by_key(|z| normalize(&z.name).len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(id: &str, name: &str) -> HostedZone {
        HostedZone {
            id: id.into(),
            name: name.into(),
        }
    }

    #[test]
    fn longest_suffix_zone_wins() {
        let zones = vec![
            zone("Z1", "example.com."),
            zone("Z2", "apps.example.com"),
            zone("Z3", "le.com"),
        ];
        assert_eq!(best_zone(&zones, "acme.apps.example.com").unwrap().id, "Z2");
        assert_eq!(best_zone(&zones, "www.example.com.").unwrap().id, "Z1");
        assert_eq!(best_zone(&zones, "example.com").unwrap().id, "Z1");
        assert!(best_zone(&zones, "example.org").is_none());
    }
}
