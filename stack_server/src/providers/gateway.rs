//! HTTP gateway backend.
//!
//! Every capability call is `POST {base}/{service}/{Action}` with a JSON
//! body and a bearer token. The gateway answers 409 when a resource with
//! the requested name already exists and 404 when it is missing.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::*;
use crate::error::ProviderError;

#[derive(Clone)]
pub struct GatewayCloud {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct Reference {
    #[serde(alias = "arn", alias = "id")]
    reference: String,
}

#[derive(Deserialize)]
struct DeletionDate {
    deletion_date: DateTime<Utc>,
}

#[derive(Deserialize)]
struct Names {
    names: Vec<String>,
}

impl GatewayCloud {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("tenantstack")
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn send<B>(&self, service: &str, action: &str, target: (&str, &str), body: &B) -> ProviderResult<reqwest::Response>
    where
        B: Serialize + ?Sized + Sync,
    {
        let (resource, name) = target;
        let url = format!("{}/{service}/{action}", self.base_url);
        tracing::debug!(%url, resource, name, "gateway call");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        match resp.status() {
            status if status.is_success() => Ok(resp),
            StatusCode::CONFLICT => Err(ProviderError::already_exists(resource, name)),
            StatusCode::NOT_FOUND => Err(ProviderError::not_found(resource, name)),
            status => {
                let text = resp.text().await.unwrap_or_default();
                Err(ProviderError::Api(format!("{action} returned {status}: {text}")))
            }
        }
    }

    async fn call<B, T>(&self, service: &str, action: &str, target: (&str, &str), body: &B) -> ProviderResult<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        self.send(service, action, target, body)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Transport(format!("{action}: bad response body: {e}")))
    }

    /// Like `call`, but the response body is ignored.
    async fn call_unit<B>(&self, service: &str, action: &str, target: (&str, &str), body: &B) -> ProviderResult<()>
    where
        B: Serialize + ?Sized + Sync,
    {
        self.send(service, action, target, body).await.map(|_| ())
    }

    /// Lookups answer 404 for "no such resource".
    async fn find<B, T>(&self, service: &str, action: &str, target: (&str, &str), body: &B) -> ProviderResult<Option<T>>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        match self.call(service, action, target, body).await {
            Ok(found) => Ok(Some(found)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl CertificateService for GatewayCloud {
    async fn request_certificate(&self, request: &CertificateRequest) -> ProviderResult<String> {
        let r: Reference = self
            .call("acm", "RequestCertificate", ("certificate", &request.domain), request)
            .await?;
        Ok(r.reference)
    }

    async fn describe_certificate(&self, arn: &str) -> ProviderResult<CertificateDescription> {
        self.call("acm", "DescribeCertificate", ("certificate", arn), &json!({ "arn": arn }))
            .await
    }

    async fn list_certificates(&self) -> ProviderResult<Vec<CertificateDescription>> {
        self.call("acm", "ListCertificates", ("certificate", "*"), &json!({}))
            .await
    }
}

#[async_trait]
impl DatabaseService for GatewayCloud {
    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> ProviderResult<InstanceDescription> {
        self.call("rds", "CreateInstance", ("db instance", &request.instance_id), request)
            .await
    }

    async fn describe_instance(&self, instance_id: &str) -> ProviderResult<InstanceDescription> {
        self.call(
            "rds",
            "DescribeInstance",
            ("db instance", instance_id),
            &json!({ "instance_id": instance_id }),
        )
        .await
    }

    async fn create_snapshot(&self, instance_id: &str, snapshot_id: &str) -> ProviderResult<String> {
        let r: Reference = self
            .call(
                "rds",
                "CreateSnapshot",
                ("db snapshot", snapshot_id),
                &json!({ "instance_id": instance_id, "snapshot_id": snapshot_id }),
            )
            .await?;
        Ok(r.reference)
    }

    async fn modify_instance(
        &self,
        request: &ModifyInstanceRequest,
    ) -> ProviderResult<InstanceDescription> {
        self.call("rds", "ModifyInstance", ("db instance", &request.instance_id), request)
            .await
    }

    async fn delete_instance(&self, request: &DeleteInstanceRequest) -> ProviderResult<()> {
        self.call_unit("rds", "DeleteInstance", ("db instance", &request.instance_id), request)
            .await
    }

    async fn describe_subnet_group(&self, name: &str) -> ProviderResult<SubnetGroup> {
        self.call(
            "rds",
            "DescribeSubnetGroup",
            ("db subnet group", name),
            &json!({ "name": name }),
        )
        .await
    }

    async fn create_subnet_group(
        &self,
        name: &str,
        subnet_ids: &[String],
        description: &str,
    ) -> ProviderResult<SubnetGroup> {
        self.call(
            "rds",
            "CreateSubnetGroup",
            ("db subnet group", name),
            &json!({ "name": name, "subnet_ids": subnet_ids, "description": description }),
        )
        .await
    }
}

#[async_trait]
impl NetworkService for GatewayCloud {
    async fn describe_default_network(&self) -> ProviderResult<Network> {
        self.call("ec2", "DescribeDefaultNetwork", ("network", "default"), &json!({}))
            .await
    }

    async fn describe_subnets(&self, network_id: &str) -> ProviderResult<Vec<Subnet>> {
        self.call(
            "ec2",
            "DescribeSubnets",
            ("network", network_id),
            &json!({ "network_id": network_id }),
        )
        .await
    }

    async fn find_security_group(
        &self,
        network_id: &str,
        name: &str,
    ) -> ProviderResult<Option<SecurityGroup>> {
        self.find(
            "ec2",
            "FindSecurityGroup",
            ("security group", name),
            &json!({ "network_id": network_id, "name": name }),
        )
        .await
    }

    async fn create_security_group(
        &self,
        network_id: &str,
        name: &str,
        description: &str,
    ) -> ProviderResult<SecurityGroup> {
        self.call(
            "ec2",
            "CreateSecurityGroup",
            ("security group", name),
            &json!({ "network_id": network_id, "name": name, "description": description }),
        )
        .await
    }

    async fn authorize_ingress(&self, group_id: &str, rule: &IngressRule) -> ProviderResult<()> {
        self.call_unit(
            "ec2",
            "AuthorizeIngress",
            ("ingress rule", group_id),
            &json!({ "group_id": group_id, "rule": rule }),
        )
        .await
    }
}

#[async_trait]
impl SecretService for GatewayCloud {
    async fn create_secret(&self, name: &str, value: &str, tags: &Tags) -> ProviderResult<String> {
        let r: Reference = self
            .call(
                "secrets",
                "CreateSecret",
                ("secret", name),
                &json!({ "name": name, "value": value, "tags": tags }),
            )
            .await?;
        Ok(r.reference)
    }

    async fn get_secret(&self, name: &str) -> ProviderResult<SecretValue> {
        self.call("secrets", "GetSecret", ("secret", name), &json!({ "name": name }))
            .await
    }

    async fn update_secret(&self, name: &str, value: &str) -> ProviderResult<String> {
        let r: Reference = self
            .call(
                "secrets",
                "UpdateSecret",
                ("secret", name),
                &json!({ "name": name, "value": value }),
            )
            .await?;
        Ok(r.reference)
    }

    async fn delete_secret(
        &self,
        name: &str,
        recovery_window_days: u32,
    ) -> ProviderResult<DateTime<Utc>> {
        let r: DeletionDate = self
            .call(
                "secrets",
                "DeleteSecret",
                ("secret", name),
                &json!({ "name": name, "recovery_window_days": recovery_window_days }),
            )
            .await?;
        Ok(r.deletion_date)
    }

    async fn list_secrets_by_tag(&self, key: &str, value: &str) -> ProviderResult<Vec<String>> {
        let r: Names = self
            .call(
                "secrets",
                "ListSecrets",
                ("secret", value),
                &json!({ "tag_key": key, "tag_value": value }),
            )
            .await?;
        Ok(r.names)
    }
}

#[async_trait]
impl LoadBalancerService for GatewayCloud {
    async fn find_load_balancer(&self, name: &str) -> ProviderResult<Option<LoadBalancer>> {
        self.find("elb", "DescribeLoadBalancer", ("load balancer", name), &json!({ "name": name }))
            .await
    }

    async fn create_load_balancer(&self, spec: &LoadBalancerSpec) -> ProviderResult<LoadBalancer> {
        self.call("elb", "CreateLoadBalancer", ("load balancer", &spec.name), spec)
            .await
    }

    async fn find_target_group(&self, name: &str) -> ProviderResult<Option<TargetGroup>> {
        self.find("elb", "DescribeTargetGroup", ("target group", name), &json!({ "name": name }))
            .await
    }

    async fn create_target_group(&self, spec: &TargetGroupSpec) -> ProviderResult<TargetGroup> {
        self.call("elb", "CreateTargetGroup", ("target group", &spec.name), spec)
            .await
    }

    async fn describe_listeners(&self, load_balancer_arn: &str) -> ProviderResult<Vec<Listener>> {
        self.call(
            "elb",
            "DescribeListeners",
            ("load balancer", load_balancer_arn),
            &json!({ "load_balancer_arn": load_balancer_arn }),
        )
        .await
    }

    async fn create_listener(&self, spec: &ListenerSpec) -> ProviderResult<Listener> {
        let name = format!("{}:{}", spec.load_balancer_arn, spec.port);
        self.call("elb", "CreateListener", ("listener", &name), spec)
            .await
    }

    async fn register_targets(
        &self,
        target_group_arn: &str,
        targets: &[Target],
    ) -> ProviderResult<()> {
        self.call_unit(
            "elb",
            "RegisterTargets",
            ("target group", target_group_arn),
            &json!({ "target_group_arn": target_group_arn, "targets": targets }),
        )
        .await
    }

    async fn deregister_targets(
        &self,
        target_group_arn: &str,
        targets: &[Target],
    ) -> ProviderResult<()> {
        self.call_unit(
            "elb",
            "DeregisterTargets",
            ("target group", target_group_arn),
            &json!({ "target_group_arn": target_group_arn, "targets": targets }),
        )
        .await
    }

    async fn describe_target_health(
        &self,
        target_group_arn: &str,
    ) -> ProviderResult<Vec<TargetHealth>> {
        self.call(
            "elb",
            "DescribeTargetHealth",
            ("target group", target_group_arn),
            &json!({ "target_group_arn": target_group_arn }),
        )
        .await
    }

    async fn delete_listener(&self, listener_arn: &str) -> ProviderResult<()> {
        self.call_unit(
            "elb",
            "DeleteListener",
            ("listener", listener_arn),
            &json!({ "listener_arn": listener_arn }),
        )
        .await
    }

    async fn delete_load_balancer(&self, load_balancer_arn: &str) -> ProviderResult<()> {
        self.call_unit(
            "elb",
            "DeleteLoadBalancer",
            ("load balancer", load_balancer_arn),
            &json!({ "load_balancer_arn": load_balancer_arn }),
        )
        .await
    }

    async fn delete_target_group(&self, target_group_arn: &str) -> ProviderResult<()> {
        self.call_unit(
            "elb",
            "DeleteTargetGroup",
            ("target group", target_group_arn),
            &json!({ "target_group_arn": target_group_arn }),
        )
        .await
    }
}

#[async_trait]
impl CdnService for GatewayCloud {
    async fn find_distribution(
        &self,
        caller_reference: &str,
    ) -> ProviderResult<Option<Distribution>> {
        self.find(
            "cdn",
            "FindDistribution",
            ("distribution", caller_reference),
            &json!({ "caller_reference": caller_reference }),
        )
        .await
    }

    async fn create_distribution(&self, spec: &DistributionSpec) -> ProviderResult<Distribution> {
        self.call(
            "cdn",
            "CreateDistribution",
            ("distribution", &spec.caller_reference),
            spec,
        )
        .await
    }

    async fn update_distribution(&self, id: &str, enabled: bool) -> ProviderResult<Distribution> {
        self.call(
            "cdn",
            "UpdateDistribution",
            ("distribution", id),
            &json!({ "id": id, "enabled": enabled }),
        )
        .await
    }

    async fn delete_distribution(&self, id: &str) -> ProviderResult<()> {
        self.call_unit("cdn", "DeleteDistribution", ("distribution", id), &json!({ "id": id }))
            .await
    }

    async fn create_invalidation(
        &self,
        id: &str,
        paths: &[String],
        caller_reference: &str,
    ) -> ProviderResult<String> {
        let r: Reference = self
            .call(
                "cdn",
                "CreateInvalidation",
                ("distribution", id),
                &json!({ "id": id, "paths": paths, "caller_reference": caller_reference }),
            )
            .await?;
        Ok(r.reference)
    }
}

#[async_trait]
impl DnsService for GatewayCloud {
    async fn list_zones(&self) -> ProviderResult<Vec<HostedZone>> {
        self.call("dns", "ListZones", ("hosted zone", "*"), &json!({}))
            .await
    }

    async fn upsert_record(&self, zone_id: &str, record: &DnsRecord) -> ProviderResult<String> {
        let r: Reference = self
            .call(
                "dns",
                "UpsertRecord",
                ("dns record", &record.name),
                &json!({ "zone_id": zone_id, "record": record }),
            )
            .await?;
        Ok(r.reference)
    }

    async fn delete_record(&self, zone_id: &str, record: &DnsRecord) -> ProviderResult<String> {
        let r: Reference = self
            .call(
                "dns",
                "DeleteRecord",
                ("dns record", &record.name),
                &json!({ "zone_id": zone_id, "record": record }),
            )
            .await?;
        Ok(r.reference)
    }
}

#[async_trait]
impl ContainerRuntimeService for GatewayCloud {
    async fn deploy_stack(&self, spec: &StackSpec) -> ProviderResult<String> {
        let r: Reference = self
            .call("containers", "DeployStack", ("stack", &spec.stack_name), spec)
            .await?;
        Ok(r.reference)
    }

    async fn describe_services(&self, stack_name: &str) -> ProviderResult<Vec<ServiceStatus>> {
        self.call(
            "containers",
            "DescribeServices",
            ("stack", stack_name),
            &json!({ "stack_name": stack_name }),
        )
        .await
    }

    async fn remove_stack(&self, stack_name: &str) -> ProviderResult<()> {
        self.call_unit(
            "containers",
            "RemoveStack",
            ("stack", stack_name),
            &json!({ "stack_name": stack_name }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_accepts_arn_or_id_keys() {
        let by_arn: Reference = serde_json::from_str(r#"{"arn":"arn:x"}"#).unwrap();
        let by_id: Reference = serde_json::from_str(r#"{"id":"E1"}"#).unwrap();
        assert_eq!(by_arn.reference, "arn:x");
        assert_eq!(by_id.reference, "E1");
    }

    #[test]
    fn base_url_is_normalized() {
        let cloud = GatewayCloud::new("http://gw.local/", "t", Duration::from_secs(5)).unwrap();
        assert_eq!(cloud.base_url, "http://gw.local");
    }
}
