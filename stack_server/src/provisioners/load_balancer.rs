//! Per-tenant application load balancer: security group, target group and listeners.

use std::sync::Arc;

use super::{find_or_create, ignore_missing};
use crate::error::StageError;
use crate::models::{LoadBalancerHandle, ServiceEndpoint, TenantConfig};
use crate::naming::{ResourceNames, LB_SECURITY_GROUP};
use crate::providers::{
    HealthCheck, IngressRule, Listener, ListenerAction, ListenerSpec, LoadBalancerService,
    LoadBalancerSpec, NetworkService, Target, TargetGroupSpec, TargetHealth,
};

/// The load balancer spans at least two availability zones.
pub const MIN_PUBLIC_SUBNETS: usize = 2;

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;
const TARGET_PORT: u16 = 3000;

pub struct LoadBalancerProvisioner {
    load_balancers: Arc<dyn LoadBalancerService>,
    network: Arc<dyn NetworkService>,
}

impl LoadBalancerProvisioner {
    pub fn new(load_balancers: Arc<dyn LoadBalancerService>, network: Arc<dyn NetworkService>) -> Self {
        Self {
            load_balancers,
            network,
        }
    }

    /// Create the tenant's load balancer. Without a certificate only a plain
    /// HTTP listener is attached.
    pub async fn create_load_balancer(
        &self,
        config: &TenantConfig,
        certificate_ref: Option<&str>,
    ) -> Result<LoadBalancerHandle, StageError> {
        let names = ResourceNames::new(&config.tenant_id);
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
        let public: Vec<String> = subnets
            .iter()
            .filter(|s| s.public)
            .map(|s| s.id.clone())
            .collect();
        if public.len() < MIN_PUBLIC_SUBNETS {
            return Err(StageError::ConfigValidation(format!(
                "load balancer needs at least {MIN_PUBLIC_SUBNETS} public subnets, network {} has {}",
                network.id,
                public.len()
            )));
        }

        let security_group_id = self.ensure_security_group(&network.id).await?;

        let lbs = &self.load_balancers;
        let lb_name = names.load_balancer();
        let lb_spec = LoadBalancerSpec {
            name: lb_name.clone(),
            subnet_ids: public,
            security_group_ids: vec![security_group_id],
            internet_facing: true,
            tags: names.tags(),
        };
        let (lb_name, lb_spec) = (lb_name.as_str(), &lb_spec);
        let load_balancer = find_or_create(
            "CreateLoadBalancer",
            || async move { lbs.find_load_balancer(lb_name).await },
            || async move { lbs.create_load_balancer(lb_spec).await },
        )
        .await?
        .into_inner();

        let tg_name = names.target_group();
        let tg_spec = TargetGroupSpec {
            name: tg_name.clone(),
            protocol: "HTTP".to_string(),
            port: TARGET_PORT,
            network_id: network.id.clone(),
            health_check: HealthCheck {
                path: "/health".to_string(),
                interval_secs: 30,
                timeout_secs: 5,
                healthy_threshold: 2,
                unhealthy_threshold: 5,
            },
            stickiness: true,
            tags: names.tags(),
        };
        let (tg_name, tg_spec) = (tg_name.as_str(), &tg_spec);
        let target_group = find_or_create(
            "CreateTargetGroup",
            || async move { lbs.find_target_group(tg_name).await },
            || async move { lbs.create_target_group(tg_spec).await },
        )
        .await?
        .into_inner();

        let wanted = listener_specs(&load_balancer.arn, &target_group.arn, certificate_ref);
        let listener_refs = self.ensure_listeners(&load_balancer.arn, wanted).await?;

        tracing::info!(
            tenant_id = %config.tenant_id,
            load_balancer = %load_balancer.name,
            dns_name = %load_balancer.dns_name,
            listeners = listener_refs.len(),
            tls = certificate_ref.is_some(),
            "load balancer ready"
        );
        Ok(LoadBalancerHandle {
            load_balancer_ref: load_balancer.arn,
            dns_name: load_balancer.dns_name,
            target_group_ref: target_group.arn,
            listener_refs,
        })
    }

    async fn ensure_security_group(&self, network_id: &str) -> Result<String, StageError> {
        let net = &self.network;
        let group = find_or_create(
            "CreateSecurityGroup",
            || async move { net.find_security_group(network_id, LB_SECURITY_GROUP).await },
            || async move {
                net.create_security_group(network_id, LB_SECURITY_GROUP, "public web ingress")
                    .await
            },
        )
        .await?
        .into_inner();

        for port in [HTTP_PORT, HTTPS_PORT] {
            let rule = IngressRule {
                protocol: "tcp".to_string(),
                port,
                cidr: "0.0.0.0/0".to_string(),
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
        }
        Ok(group.id)
    }

    /// Listeners are keyed by port; an existing one on the same port is kept.
    async fn ensure_listeners(
        &self,
        load_balancer_arn: &str,
        wanted: Vec<ListenerSpec>,
    ) -> Result<Vec<String>, StageError> {
        let existing = self
            .load_balancers
            .describe_listeners(load_balancer_arn)
            .await
            .map_err(StageError::api("DescribeListeners"))?;

        let mut refs = Vec::with_capacity(wanted.len());
        for spec in wanted {
            if let Some(found) = existing.iter().find(|l| l.port == spec.port) {
                refs.push(found.arn.clone());
                continue;
            }
            let listener: Listener = match self.load_balancers.create_listener(&spec).await {
                Ok(listener) => listener,
                Err(e) if e.is_already_exists() => {
                    let again = self
                        .load_balancers
                        .describe_listeners(load_balancer_arn)
                        .await
                        .map_err(StageError::api("DescribeListeners"))?;
                    match again.into_iter().find(|l| l.port == spec.port) {
                        Some(listener) => listener,
                        None => {
                            return Err(StageError::ExternalApi {
                                op: "CreateListener",
                                source: e,
                            })
                        }
                    }
                }
                Err(e) => {
                    return Err(StageError::ExternalApi {
                        op: "CreateListener",
                        source: e,
                    })
                }
            };
            refs.push(listener.arn);
        }
        Ok(refs)
    }

    pub async fn register_targets(
        &self,
        target_group_ref: &str,
        endpoints: &[ServiceEndpoint],
    ) -> Result<(), StageError> {
        self.load_balancers
            .register_targets(target_group_ref, &targets(endpoints))
            .await
            .map_err(StageError::api("RegisterTargets"))
    }

    pub async fn deregister_targets(
        &self,
        target_group_ref: &str,
        endpoints: &[ServiceEndpoint],
    ) -> Result<(), StageError> {
        ignore_missing(
            self.load_balancers
                .deregister_targets(target_group_ref, &targets(endpoints))
                .await,
        )
        .map_err(StageError::api("DeregisterTargets"))?;
        Ok(())
    }

    pub async fn target_health(&self, target_group_ref: &str) -> Result<Vec<TargetHealth>, StageError> {
        self.load_balancers
            .describe_target_health(target_group_ref)
            .await
            .map_err(StageError::api("DescribeTargetHealth"))
    }

    /// Tear down listeners, the load balancer, then the target group.
    /// Returns `false` when everything was already gone.
    pub async fn delete(&self, handle: &LoadBalancerHandle) -> Result<bool, StageError> {
        self.teardown(
            &handle.listener_refs,
            Some(handle.load_balancer_ref.as_str()),
            Some(handle.target_group_ref.as_str()),
        )
        .await
    }

    /// Remove whatever a failed load balancer stage created, found by name.
    pub async fn delete_leftovers(&self, tenant_id: &str) -> Result<bool, StageError> {
        let names = ResourceNames::new(tenant_id);
        let load_balancer = self
            .load_balancers
            .find_load_balancer(&names.load_balancer())
            .await
            .map_err(StageError::api("FindLoadBalancer"))?;
        let target_group = self
            .load_balancers
            .find_target_group(&names.target_group())
            .await
            .map_err(StageError::api("FindTargetGroup"))?;

        let listener_refs: Vec<String> = match &load_balancer {
            Some(lb) => ignore_missing(self.load_balancers.describe_listeners(&lb.arn).await)
                .map_err(StageError::api("DescribeListeners"))?
                .unwrap_or_default()
                .into_iter()
                .map(|l| l.arn)
                .collect(),
            None => Vec::new(),
        };
        self.teardown(
            &listener_refs,
            load_balancer.as_ref().map(|lb| lb.arn.as_str()),
            target_group.as_ref().map(|tg| tg.arn.as_str()),
        )
        .await
    }

    async fn teardown(
        &self,
        listener_refs: &[String],
        load_balancer_ref: Option<&str>,
        target_group_ref: Option<&str>,
    ) -> Result<bool, StageError> {
        let mut removed = false;
        for listener in listener_refs {
            removed |= ignore_missing(self.load_balancers.delete_listener(listener).await)
                .map_err(StageError::api("DeleteListener"))?
                .is_some();
        }
        if let Some(arn) = load_balancer_ref {
            removed |= ignore_missing(self.load_balancers.delete_load_balancer(arn).await)
                .map_err(StageError::api("DeleteLoadBalancer"))?
                .is_some();
        }
        if let Some(arn) = target_group_ref {
            removed |= ignore_missing(self.load_balancers.delete_target_group(arn).await)
                .map_err(StageError::api("DeleteTargetGroup"))?
                .is_some();
        }
        Ok(removed)
    }
}

fn listener_specs(
    load_balancer_arn: &str,
    target_group_arn: &str,
    certificate_ref: Option<&str>,
) -> Vec<ListenerSpec> {
    let forward = ListenerAction::Forward {
        target_group_arn: target_group_arn.to_string(),
    };
    match certificate_ref {
        Some(cert) => vec![
            ListenerSpec {
                load_balancer_arn: load_balancer_arn.to_string(),
                protocol: "HTTPS".to_string(),
                port: HTTPS_PORT,
                certificate_arn: Some(cert.to_string()),
                action: forward,
            },
            ListenerSpec {
                load_balancer_arn: load_balancer_arn.to_string(),
                protocol: "HTTP".to_string(),
                port: HTTP_PORT,
                certificate_arn: None,
                action: ListenerAction::Redirect {
                    protocol: "HTTPS".to_string(),
                    port: HTTPS_PORT,
                    status_code: 301,
                },
            },
        ],
        None => vec![ListenerSpec {
            load_balancer_arn: load_balancer_arn.to_string(),
            protocol: "HTTP".to_string(),
            port: HTTP_PORT,
            certificate_arn: None,
            action: forward,
        }],
    }
}

fn targets(endpoints: &[ServiceEndpoint]) -> Vec<Target> {
    endpoints
        .iter()
        .map(|e| Target {
            id: e.target_id.clone(),
            port: e.port,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_listeners_redirect_plain_http() {
        let specs = listener_specs("lb", "tg", Some("cert"));
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].port, 443);
        assert_eq!(specs[0].certificate_arn.as_deref(), Some("cert"));
        assert_eq!(
            specs[1].action,
            ListenerAction::Redirect {
                protocol: "HTTPS".into(),
                port: 443,
                status_code: 301
            }
        );
    }

    #[test]
    fn bypass_forwards_plain_http() {
        let specs = listener_specs("lb", "tg", None);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].port, 80);
        assert_eq!(
            specs[0].action,
            ListenerAction::Forward {
                target_group_arn: "tg".into()
            }
        );
    }
}
