//! In-memory cloud used by tests and by `--simulate` runs.
//!
//! Behaves like a provider control plane closely enough to exercise the
//! pipeline: names are unique per resource kind, creates report
//! `AlreadyExists`, asynchronous resources advance one step per describe
//! call, and any operation can be made to fail on demand.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::*;
use crate::error::ProviderError;
use crate::models::{ValidationRecord, ValidationStatus};

/// How an asynchronous resource settles, counted in describe calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    ReadyAfter(u32),
    FailAfter(u32),
    Never,
}

#[derive(Debug, Clone)]
pub struct SimulationSettings {
    pub base_domain: String,
    pub network_cidr: String,
    pub public_subnets: usize,
    pub certificate: Outcome,
    pub database: Outcome,
    pub services_ready_after: u32,
    /// Describe calls before challenge records become visible.
    pub challenge_records_after: u32,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            base_domain: "tenantstack.test".to_string(),
            network_cidr: "10.20.0.0/16".to_string(),
            public_subnets: 3,
            certificate: Outcome::ReadyAfter(2),
            database: Outcome::ReadyAfter(3),
            services_ready_after: 1,
            challenge_records_after: 0,
        }
    }
}

/// One recorded capability call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: String,
    pub name: String,
}

struct SimCertificate {
    description: CertificateDescription,
    idempotency_token: String,
    challenge: ValidationRecord,
    describes: u32,
    validated: u32,
}

struct SimInstance {
    request: CreateInstanceRequest,
    description: InstanceDescription,
    describes: u32,
    modifications: Vec<ModifyInstanceRequest>,
}

struct SimSecret {
    arn: String,
    value: String,
    tags: Tags,
    deletion_date: Option<DateTime<Utc>>,
}

struct SimListener {
    load_balancer_arn: String,
    listener: Listener,
}

struct SimStack {
    spec: StackSpec,
    describes: u32,
}

#[derive(Default)]
struct SimState {
    seq: u64,
    journal: Vec<Call>,
    failing: BTreeSet<String>,
    certificates: BTreeMap<String, SimCertificate>,
    instances: BTreeMap<String, SimInstance>,
    snapshots: BTreeSet<String>,
    subnet_groups: BTreeMap<String, SubnetGroup>,
    security_groups: BTreeMap<String, (SecurityGroup, Vec<IngressRule>)>,
    secrets: BTreeMap<String, SimSecret>,
    load_balancers: BTreeMap<String, LoadBalancer>,
    target_groups: BTreeMap<String, TargetGroup>,
    listeners: BTreeMap<String, SimListener>,
    targets: BTreeMap<String, Vec<Target>>,
    distributions: BTreeMap<String, (DistributionSpec, Distribution)>,
    invalidations: Vec<(String, Vec<String>)>,
    records: BTreeMap<(String, String), DnsRecord>,
    stacks: BTreeMap<String, SimStack>,
}

impl SimState {
    fn next(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

pub struct SimulatedCloud {
    settings: SimulationSettings,
    zone_id: String,
    state: Mutex<SimState>,
}

impl SimulatedCloud {
    pub fn new(settings: SimulationSettings) -> Self {
        Self {
            zone_id: "Z-SIM-PRIMARY".to_string(),
            settings,
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the call and fail it if the operation was marked failing.
    fn enter(&self, state: &mut SimState, op: &str, name: &str) -> ProviderResult<()> {
        state.journal.push(Call {
            op: op.to_string(),
            name: name.to_string(),
        });
        if state.failing.contains(op) {
            return Err(ProviderError::Api(format!("injected failure in {op} for {name}")));
        }
        Ok(())
    }

    // ── Test controls and inspection ──

    /// Make every future call of `op` fail with an API error.
    pub fn fail_on(&self, op: &str) {
        self.state().failing.insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        self.state().failing.clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().journal.clone()
    }

    pub fn calls_to(&self, op: &str) -> Vec<Call> {
        self.state()
            .journal
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    /// Names passed to resource-creating calls, in call order.
    pub fn created_names(&self) -> Vec<String> {
        const CREATES: [&str; 10] = [
            "CreateInstance",
            "CreateSecret",
            "CreateLoadBalancer",
            "CreateTargetGroup",
            "CreateListener",
            "CreateDistribution",
            "UpsertRecord",
            "DeployStack",
            "RequestCertificate",
            "RegisterTargets",
        ];
        self.state()
            .journal
            .iter()
            .filter(|c| CREATES.contains(&c.op.as_str()))
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn instance_request(&self, instance_id: &str) -> Option<CreateInstanceRequest> {
        self.state()
            .instances
            .get(instance_id)
            .map(|i| i.request.clone())
    }

    pub fn instance(&self, instance_id: &str) -> Option<InstanceDescription> {
        self.state()
            .instances
            .get(instance_id)
            .map(|i| i.description.clone())
    }

    pub fn modifications(&self, instance_id: &str) -> Vec<ModifyInstanceRequest> {
        self.state()
            .instances
            .get(instance_id)
            .map(|i| i.modifications.clone())
            .unwrap_or_default()
    }

    pub fn snapshots(&self) -> Vec<String> {
        self.state().snapshots.iter().cloned().collect()
    }

    pub fn live_secret_names(&self) -> Vec<String> {
        self.state()
            .secrets
            .iter()
            .filter(|(_, s)| s.deletion_date.is_none())
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn record(&self, name: &str, record_type: &str) -> Option<DnsRecord> {
        self.state()
            .records
            .get(&(name.to_string(), record_type.to_string()))
            .cloned()
    }

    pub fn distribution(&self, caller_reference: &str) -> Option<Distribution> {
        self.state()
            .distributions
            .values()
            .find(|(spec, _)| spec.caller_reference == caller_reference)
            .map(|(_, d)| d.clone())
    }

    pub fn load_balancer_names(&self) -> Vec<String> {
        self.state().load_balancers.keys().cloned().collect()
    }

    pub fn listeners_of(&self, load_balancer_arn: &str) -> Vec<Listener> {
        self.state()
            .listeners
            .values()
            .filter(|l| l.load_balancer_arn == load_balancer_arn)
            .map(|l| l.listener.clone())
            .collect()
    }

    pub fn targets_of(&self, target_group_arn: &str) -> Vec<Target> {
        self.state()
            .targets
            .get(target_group_arn)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stack(&self, stack_name: &str) -> Option<StackSpec> {
        self.state().stacks.get(stack_name).map(|s| s.spec.clone())
    }

    pub fn certificate_count(&self) -> usize {
        self.state().certificates.len()
    }

    fn advance(outcome: Outcome, steps: u32) -> Option<bool> {
        match outcome {
            Outcome::ReadyAfter(n) if steps >= n => Some(true),
            Outcome::FailAfter(n) if steps >= n => Some(false),
            _ => None,
        }
    }
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new(SimulationSettings::default())
    }
}

#[async_trait]
impl CertificateService for SimulatedCloud {
    async fn request_certificate(&self, request: &CertificateRequest) -> ProviderResult<String> {
        let mut state = self.state();
        self.enter(&mut state, "RequestCertificate", &request.domain)?;

        if let Some((arn, _)) = state
            .certificates
            .iter()
            .find(|(_, c)| c.idempotency_token == request.idempotency_token)
        {
            return Ok(arn.clone());
        }

        let seq = state.next();
        let arn = format!("arn:sim:acm:certificate/{seq:06}");
        let challenge = ValidationRecord {
            domain: request.domain.clone(),
            record_name: format!("_c{seq:04}.{}", request.domain),
            record_type: "CNAME".to_string(),
            record_value: format!("_v{seq:04}.validations.sim"),
            status: ValidationStatus::PendingValidation,
        };
        state.certificates.insert(
            arn.clone(),
            SimCertificate {
                description: CertificateDescription {
                    arn: arn.clone(),
                    domain: request.domain.clone(),
                    subject_alternative_names: request.subject_alternative_names.clone(),
                    status: CertificateStatus::PendingValidation,
                    not_after: None,
                    validation_records: Vec::new(),
                },
                idempotency_token: request.idempotency_token.clone(),
                challenge,
                describes: 0,
                validated: 0,
            },
        );
        Ok(arn)
    }

    async fn describe_certificate(&self, arn: &str) -> ProviderResult<CertificateDescription> {
        let mut state = self.state();
        self.enter(&mut state, "DescribeCertificate", arn)?;

        let published: BTreeSet<(String, String)> = state.records.keys().cloned().collect();
        let settings = &self.settings;
        let cert = state
            .certificates
            .get_mut(arn)
            .ok_or_else(|| ProviderError::not_found("certificate", arn))?;
        cert.describes += 1;

        if cert.description.status == CertificateStatus::PendingValidation {
            if cert.describes > settings.challenge_records_after {
                cert.description.validation_records = vec![cert.challenge.clone()];
            }
            let key = (
                cert.challenge.record_name.clone(),
                cert.challenge.record_type.clone(),
            );
            if published.contains(&key) {
                cert.validated += 1;
                match Self::advance(settings.certificate, cert.validated) {
                    Some(true) => {
                        cert.description.status = CertificateStatus::Issued;
                        cert.description.not_after = Some(Utc::now() + Duration::days(395));
                        for record in &mut cert.description.validation_records {
                            record.status = ValidationStatus::Success;
                        }
                    }
                    Some(false) => {
                        cert.description.status = CertificateStatus::Failed;
                        for record in &mut cert.description.validation_records {
                            record.status = ValidationStatus::Failed;
                        }
                    }
                    None => {}
                }
            }
        }
        Ok(cert.description.clone())
    }

    async fn list_certificates(&self) -> ProviderResult<Vec<CertificateDescription>> {
        let mut state = self.state();
        self.enter(&mut state, "ListCertificates", "*")?;
        Ok(state
            .certificates
            .values()
            .map(|c| c.description.clone())
            .collect())
    }
}

#[async_trait]
impl DatabaseService for SimulatedCloud {
    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> ProviderResult<InstanceDescription> {
        let mut state = self.state();
        self.enter(&mut state, "CreateInstance", &request.instance_id)?;

        if state.instances.contains_key(&request.instance_id) {
            return Err(ProviderError::already_exists(
                "db instance",
                &request.instance_id,
            ));
        }
        if !state.subnet_groups.contains_key(&request.subnet_group) {
            return Err(ProviderError::not_found(
                "db subnet group",
                &request.subnet_group,
            ));
        }
        for group in &request.security_group_ids {
            if !state.security_groups.values().any(|(g, _)| &g.id == group) {
                return Err(ProviderError::not_found("security group", group));
            }
        }

        let description = InstanceDescription {
            instance_id: request.instance_id.clone(),
            status: InstanceStatus::Creating,
            endpoint: None,
            port: request.port,
            instance_class: request.instance_class.clone(),
            allocated_storage_gb: request.allocated_storage_gb,
            multi_az: request.multi_az,
            backup_retention_days: request.backup_retention_days,
            deletion_protection: request.deletion_protection,
            storage_encrypted: request.storage_encrypted,
        };
        state.instances.insert(
            request.instance_id.clone(),
            SimInstance {
                request: request.clone(),
                description: description.clone(),
                describes: 0,
                modifications: Vec::new(),
            },
        );
        Ok(description)
    }

    async fn describe_instance(&self, instance_id: &str) -> ProviderResult<InstanceDescription> {
        let mut state = self.state();
        self.enter(&mut state, "DescribeInstance", instance_id)?;

        let outcome = self.settings.database;
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| ProviderError::not_found("db instance", instance_id))?;
        instance.describes += 1;
        if instance.description.status == InstanceStatus::Creating {
            match Self::advance(outcome, instance.describes) {
                Some(true) => {
                    instance.description.status = InstanceStatus::Available;
                    instance.description.endpoint =
                        Some(format!("{instance_id}.db.sim.internal"));
                }
                Some(false) => instance.description.status = InstanceStatus::Failed,
                None => {}
            }
        }
        Ok(instance.description.clone())
    }

    async fn create_snapshot(&self, instance_id: &str, snapshot_id: &str) -> ProviderResult<String> {
        let mut state = self.state();
        self.enter(&mut state, "CreateSnapshot", snapshot_id)?;
        if !state.instances.contains_key(instance_id) {
            return Err(ProviderError::not_found("db instance", instance_id));
        }
        if !state.snapshots.insert(snapshot_id.to_string()) {
            return Err(ProviderError::already_exists("db snapshot", snapshot_id));
        }
        Ok(snapshot_id.to_string())
    }

    async fn modify_instance(
        &self,
        request: &ModifyInstanceRequest,
    ) -> ProviderResult<InstanceDescription> {
        let mut state = self.state();
        self.enter(&mut state, "ModifyInstance", &request.instance_id)?;
        let instance = state
            .instances
            .get_mut(&request.instance_id)
            .ok_or_else(|| ProviderError::not_found("db instance", &request.instance_id))?;

        let d = &mut instance.description;
        if let Some(class) = &request.instance_class {
            d.instance_class = class.clone();
        }
        if let Some(storage) = request.allocated_storage_gb {
            d.allocated_storage_gb = storage;
        }
        if let Some(multi_az) = request.multi_az {
            d.multi_az = multi_az;
        }
        if let Some(retention) = request.backup_retention_days {
            d.backup_retention_days = retention;
        }
        if let Some(protection) = request.deletion_protection {
            d.deletion_protection = protection;
        }
        if let Some(password) = &request.master_password {
            instance.request.master_password = password.clone();
        }
        instance.modifications.push(request.clone());
        Ok(instance.description.clone())
    }

    async fn delete_instance(&self, request: &DeleteInstanceRequest) -> ProviderResult<()> {
        let mut state = self.state();
        self.enter(&mut state, "DeleteInstance", &request.instance_id)?;
        let instance = state
            .instances
            .get(&request.instance_id)
            .ok_or_else(|| ProviderError::not_found("db instance", &request.instance_id))?;
        if instance.description.deletion_protection {
            return Err(ProviderError::Api(format!(
                "instance {} has deletion protection enabled",
                request.instance_id
            )));
        }
        state.instances.remove(&request.instance_id);
        if let Some(snapshot) = &request.final_snapshot_id {
            state.snapshots.insert(snapshot.clone());
        }
        Ok(())
    }

    async fn describe_subnet_group(&self, name: &str) -> ProviderResult<SubnetGroup> {
        let mut state = self.state();
        self.enter(&mut state, "DescribeSubnetGroup", name)?;
        state
            .subnet_groups
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::not_found("db subnet group", name))
    }

    async fn create_subnet_group(
        &self,
        name: &str,
        subnet_ids: &[String],
        _description: &str,
    ) -> ProviderResult<SubnetGroup> {
        let mut state = self.state();
        self.enter(&mut state, "CreateSubnetGroup", name)?;
        if state.subnet_groups.contains_key(name) {
            return Err(ProviderError::already_exists("db subnet group", name));
        }
        let group = SubnetGroup {
            name: name.to_string(),
            subnet_ids: subnet_ids.to_vec(),
        };
        state.subnet_groups.insert(name.to_string(), group.clone());
        Ok(group)
    }
}

#[async_trait]
impl NetworkService for SimulatedCloud {
    async fn describe_default_network(&self) -> ProviderResult<Network> {
        let mut state = self.state();
        self.enter(&mut state, "DescribeDefaultNetwork", "default")?;
        Ok(Network {
            id: "net-sim-default".to_string(),
            cidr: self.settings.network_cidr.clone(),
        })
    }

    async fn describe_subnets(&self, network_id: &str) -> ProviderResult<Vec<Subnet>> {
        let mut state = self.state();
        self.enter(&mut state, "DescribeSubnets", network_id)?;
        let zones = ["a", "b", "c", "d"];
        let mut subnets: Vec<Subnet> = (0..self.settings.public_subnets)
            .map(|i| Subnet {
                id: format!("subnet-pub-{i}"),
                availability_zone: format!("sim-1{}", zones[i % zones.len()]),
                public: true,
            })
            .collect();
        subnets.extend((0..2).map(|i| Subnet {
            id: format!("subnet-priv-{i}"),
            availability_zone: format!("sim-1{}", zones[i % zones.len()]),
            public: false,
        }));
        Ok(subnets)
    }

    async fn find_security_group(
        &self,
        _network_id: &str,
        name: &str,
    ) -> ProviderResult<Option<SecurityGroup>> {
        let mut state = self.state();
        self.enter(&mut state, "FindSecurityGroup", name)?;
        Ok(state.security_groups.get(name).map(|(g, _)| g.clone()))
    }

    async fn create_security_group(
        &self,
        _network_id: &str,
        name: &str,
        _description: &str,
    ) -> ProviderResult<SecurityGroup> {
        let mut state = self.state();
        self.enter(&mut state, "CreateSecurityGroup", name)?;
        if state.security_groups.contains_key(name) {
            return Err(ProviderError::already_exists("security group", name));
        }
        let seq = state.next();
        let group = SecurityGroup {
            id: format!("sg-{seq:08}"),
            name: name.to_string(),
        };
        state
            .security_groups
            .insert(name.to_string(), (group.clone(), Vec::new()));
        Ok(group)
    }

    async fn authorize_ingress(&self, group_id: &str, rule: &IngressRule) -> ProviderResult<()> {
        let mut state = self.state();
        self.enter(&mut state, "AuthorizeIngress", group_id)?;
        let (_, rules) = state
            .security_groups
            .values_mut()
            .find(|(g, _)| g.id == group_id)
            .ok_or_else(|| ProviderError::not_found("security group", group_id))?;
        if rules.contains(rule) {
            return Err(ProviderError::already_exists(
                "ingress rule",
                &format!("{}:{}", rule.cidr, rule.port),
            ));
        }
        rules.push(rule.clone());
        Ok(())
    }
}

#[async_trait]
impl SecretService for SimulatedCloud {
    async fn create_secret(&self, name: &str, value: &str, tags: &Tags) -> ProviderResult<String> {
        let mut state = self.state();
        self.enter(&mut state, "CreateSecret", name)?;
        if state.secrets.contains_key(name) {
            return Err(ProviderError::already_exists("secret", name));
        }
        let arn = format!("arn:sim:secrets:{name}");
        state.secrets.insert(
            name.to_string(),
            SimSecret {
                arn: arn.clone(),
                value: value.to_string(),
                tags: tags.clone(),
                deletion_date: None,
            },
        );
        Ok(arn)
    }

    async fn get_secret(&self, name: &str) -> ProviderResult<SecretValue> {
        let mut state = self.state();
        self.enter(&mut state, "GetSecret", name)?;
        match state.secrets.get(name) {
            Some(secret) if secret.deletion_date.is_none() => Ok(SecretValue {
                name: name.to_string(),
                arn: secret.arn.clone(),
                value: secret.value.clone(),
                tags: secret.tags.clone(),
            }),
            _ => Err(ProviderError::not_found("secret", name)),
        }
    }

    async fn update_secret(&self, name: &str, value: &str) -> ProviderResult<String> {
        let mut state = self.state();
        self.enter(&mut state, "UpdateSecret", name)?;
        let secret = state
            .secrets
            .get_mut(name)
            .ok_or_else(|| ProviderError::not_found("secret", name))?;
        // Updating a secret pending deletion restores it.
        secret.deletion_date = None;
        secret.value = value.to_string();
        Ok(secret.arn.clone())
    }

    async fn delete_secret(
        &self,
        name: &str,
        recovery_window_days: u32,
    ) -> ProviderResult<DateTime<Utc>> {
        let mut state = self.state();
        self.enter(&mut state, "DeleteSecret", name)?;
        let secret = state
            .secrets
            .get_mut(name)
            .ok_or_else(|| ProviderError::not_found("secret", name))?;
        let when = Utc::now() + Duration::days(i64::from(recovery_window_days));
        secret.deletion_date = Some(when);
        Ok(when)
    }

    async fn list_secrets_by_tag(&self, key: &str, value: &str) -> ProviderResult<Vec<String>> {
        let mut state = self.state();
        self.enter(&mut state, "ListSecretsByTag", &format!("{key}={value}"))?;
        Ok(state
            .secrets
            .iter()
            .filter(|(_, s)| s.deletion_date.is_none())
            .filter(|(_, s)| s.tags.get(key).map(String::as_str) == Some(value))
            .map(|(n, _)| n.clone())
            .collect())
    }
}

#[async_trait]
impl LoadBalancerService for SimulatedCloud {
    async fn find_load_balancer(&self, name: &str) -> ProviderResult<Option<LoadBalancer>> {
        let mut state = self.state();
        self.enter(&mut state, "FindLoadBalancer", name)?;
        Ok(state.load_balancers.get(name).cloned())
    }

    async fn create_load_balancer(&self, spec: &LoadBalancerSpec) -> ProviderResult<LoadBalancer> {
        let mut state = self.state();
        self.enter(&mut state, "CreateLoadBalancer", &spec.name)?;
        if state.load_balancers.contains_key(&spec.name) {
            return Err(ProviderError::already_exists("load balancer", &spec.name));
        }
        if spec.subnet_ids.len() < 2 {
            return Err(ProviderError::Api(
                "a load balancer needs subnets in at least two zones".to_string(),
            ));
        }
        let seq = state.next();
        let lb = LoadBalancer {
            arn: format!("arn:sim:elb:loadbalancer/{}/{seq:06}", spec.name),
            name: spec.name.clone(),
            dns_name: format!("{}-{seq}.elb.sim", spec.name),
        };
        state.load_balancers.insert(spec.name.clone(), lb.clone());
        Ok(lb)
    }

    async fn find_target_group(&self, name: &str) -> ProviderResult<Option<TargetGroup>> {
        let mut state = self.state();
        self.enter(&mut state, "FindTargetGroup", name)?;
        Ok(state.target_groups.get(name).cloned())
    }

    async fn create_target_group(&self, spec: &TargetGroupSpec) -> ProviderResult<TargetGroup> {
        let mut state = self.state();
        self.enter(&mut state, "CreateTargetGroup", &spec.name)?;
        if state.target_groups.contains_key(&spec.name) {
            return Err(ProviderError::already_exists("target group", &spec.name));
        }
        let seq = state.next();
        let tg = TargetGroup {
            arn: format!("arn:sim:elb:targetgroup/{}/{seq:06}", spec.name),
            name: spec.name.clone(),
        };
        state.target_groups.insert(spec.name.clone(), tg.clone());
        Ok(tg)
    }

    async fn describe_listeners(&self, load_balancer_arn: &str) -> ProviderResult<Vec<Listener>> {
        let mut state = self.state();
        self.enter(&mut state, "DescribeListeners", load_balancer_arn)?;
        Ok(state
            .listeners
            .values()
            .filter(|l| l.load_balancer_arn == load_balancer_arn)
            .map(|l| l.listener.clone())
            .collect())
    }

    async fn create_listener(&self, spec: &ListenerSpec) -> ProviderResult<Listener> {
        let mut state = self.state();
        let name = format!("{}:{}", spec.load_balancer_arn, spec.port);
        self.enter(&mut state, "CreateListener", &name)?;
        if !state
            .load_balancers
            .values()
            .any(|lb| lb.arn == spec.load_balancer_arn)
        {
            return Err(ProviderError::not_found(
                "load balancer",
                &spec.load_balancer_arn,
            ));
        }
        if spec.protocol == "HTTPS" && spec.certificate_arn.is_none() {
            return Err(ProviderError::Api(
                "HTTPS listener requires a certificate".to_string(),
            ));
        }
        if state
            .listeners
            .values()
            .any(|l| l.load_balancer_arn == spec.load_balancer_arn && l.listener.port == spec.port)
        {
            return Err(ProviderError::already_exists("listener", &name));
        }
        let seq = state.next();
        let listener = Listener {
            arn: format!("arn:sim:elb:listener/{seq:06}"),
            protocol: spec.protocol.clone(),
            port: spec.port,
            action: spec.action.clone(),
        };
        state.listeners.insert(
            listener.arn.clone(),
            SimListener {
                load_balancer_arn: spec.load_balancer_arn.clone(),
                listener: listener.clone(),
            },
        );
        Ok(listener)
    }

    async fn register_targets(
        &self,
        target_group_arn: &str,
        targets: &[Target],
    ) -> ProviderResult<()> {
        let mut state = self.state();
        self.enter(&mut state, "RegisterTargets", target_group_arn)?;
        if !state
            .target_groups
            .values()
            .any(|tg| tg.arn == target_group_arn)
        {
            return Err(ProviderError::not_found("target group", target_group_arn));
        }
        let registered = state.targets.entry(target_group_arn.to_string()).or_default();
        for target in targets {
            if !registered.contains(target) {
                registered.push(target.clone());
            }
        }
        Ok(())
    }

    async fn deregister_targets(
        &self,
        target_group_arn: &str,
        targets: &[Target],
    ) -> ProviderResult<()> {
        let mut state = self.state();
        self.enter(&mut state, "DeregisterTargets", target_group_arn)?;
        if let Some(registered) = state.targets.get_mut(target_group_arn) {
            registered.retain(|t| !targets.contains(t));
        }
        Ok(())
    }

    async fn describe_target_health(
        &self,
        target_group_arn: &str,
    ) -> ProviderResult<Vec<TargetHealth>> {
        let mut state = self.state();
        self.enter(&mut state, "DescribeTargetHealth", target_group_arn)?;
        Ok(state
            .targets
            .get(target_group_arn)
            .map(|targets| {
                targets
                    .iter()
                    .map(|t| TargetHealth {
                        target: t.clone(),
                        state: "healthy".to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_listener(&self, listener_arn: &str) -> ProviderResult<()> {
        let mut state = self.state();
        self.enter(&mut state, "DeleteListener", listener_arn)?;
        state
            .listeners
            .remove(listener_arn)
            .map(|_| ())
            .ok_or_else(|| ProviderError::not_found("listener", listener_arn))
    }

    async fn delete_load_balancer(&self, load_balancer_arn: &str) -> ProviderResult<()> {
        let mut state = self.state();
        self.enter(&mut state, "DeleteLoadBalancer", load_balancer_arn)?;
        let name = state
            .load_balancers
            .iter()
            .find(|(_, lb)| lb.arn == load_balancer_arn)
            .map(|(n, _)| n.clone())
            .ok_or_else(|| ProviderError::not_found("load balancer", load_balancer_arn))?;
        state.load_balancers.remove(&name);
        state
            .listeners
            .retain(|_, l| l.load_balancer_arn != load_balancer_arn);
        Ok(())
    }

    async fn delete_target_group(&self, target_group_arn: &str) -> ProviderResult<()> {
        let mut state = self.state();
        self.enter(&mut state, "DeleteTargetGroup", target_group_arn)?;
        let in_use = state.listeners.values().any(|l| {
            matches!(&l.listener.action, ListenerAction::Forward { target_group_arn: arn } if arn == target_group_arn)
        });
        if in_use {
            return Err(ProviderError::Api(format!(
                "target group {target_group_arn} is in use by a listener"
            )));
        }
        let name = state
            .target_groups
            .iter()
            .find(|(_, tg)| tg.arn == target_group_arn)
            .map(|(n, _)| n.clone())
            .ok_or_else(|| ProviderError::not_found("target group", target_group_arn))?;
        state.target_groups.remove(&name);
        state.targets.remove(target_group_arn);
        Ok(())
    }
}

#[async_trait]
impl CdnService for SimulatedCloud {
    async fn find_distribution(
        &self,
        caller_reference: &str,
    ) -> ProviderResult<Option<Distribution>> {
        let mut state = self.state();
        self.enter(&mut state, "FindDistribution", caller_reference)?;
        Ok(state
            .distributions
            .values()
            .find(|(spec, _)| spec.caller_reference == caller_reference)
            .map(|(_, d)| d.clone()))
    }

    async fn create_distribution(&self, spec: &DistributionSpec) -> ProviderResult<Distribution> {
        let mut state = self.state();
        self.enter(&mut state, "CreateDistribution", &spec.caller_reference)?;
        if state
            .distributions
            .values()
            .any(|(s, _)| s.caller_reference == spec.caller_reference)
        {
            return Err(ProviderError::already_exists(
                "distribution",
                &spec.caller_reference,
            ));
        }
        if spec.origin_domain.is_empty() {
            return Err(ProviderError::Api("origin domain is required".to_string()));
        }
        let seq = state.next();
        let distribution = Distribution {
            id: format!("E{seq:08}"),
            domain_name: format!("d{seq:06}.cdn.sim"),
            caller_reference: spec.caller_reference.clone(),
            status: "InProgress".to_string(),
            enabled: true,
            viewer_protocol_policy: spec.viewer_protocol_policy,
            compress: spec.compress,
            aliases: spec.aliases.clone(),
        };
        state
            .distributions
            .insert(distribution.id.clone(), (spec.clone(), distribution.clone()));
        Ok(distribution)
    }

    async fn update_distribution(&self, id: &str, enabled: bool) -> ProviderResult<Distribution> {
        let mut state = self.state();
        self.enter(&mut state, "UpdateDistribution", id)?;
        let (_, distribution) = state
            .distributions
            .get_mut(id)
            .ok_or_else(|| ProviderError::not_found("distribution", id))?;
        distribution.enabled = enabled;
        distribution.status = "Deployed".to_string();
        Ok(distribution.clone())
    }

    async fn delete_distribution(&self, id: &str) -> ProviderResult<()> {
        let mut state = self.state();
        self.enter(&mut state, "DeleteDistribution", id)?;
        let (_, distribution) = state
            .distributions
            .get(id)
            .ok_or_else(|| ProviderError::not_found("distribution", id))?;
        if distribution.enabled {
            return Err(ProviderError::Api(format!(
                "distribution {id} must be disabled before deletion"
            )));
        }
        state.distributions.remove(id);
        Ok(())
    }

    async fn create_invalidation(
        &self,
        id: &str,
        paths: &[String],
        _caller_reference: &str,
    ) -> ProviderResult<String> {
        let mut state = self.state();
        self.enter(&mut state, "CreateInvalidation", id)?;
        if !state.distributions.contains_key(id) {
            return Err(ProviderError::not_found("distribution", id));
        }
        let seq = state.next();
        state.invalidations.push((id.to_string(), paths.to_vec()));
        Ok(format!("I{seq:08}"))
    }
}

#[async_trait]
impl DnsService for SimulatedCloud {
    async fn list_zones(&self) -> ProviderResult<Vec<HostedZone>> {
        let mut state = self.state();
        self.enter(&mut state, "ListZones", "*")?;
        Ok(vec![HostedZone {
            id: self.zone_id.clone(),
            name: self.settings.base_domain.clone(),
        }])
    }

    async fn upsert_record(&self, zone_id: &str, record: &DnsRecord) -> ProviderResult<String> {
        let mut state = self.state();
        self.enter(&mut state, "UpsertRecord", &record.name)?;
        if zone_id != self.zone_id {
            return Err(ProviderError::not_found("hosted zone", zone_id));
        }
        if !record.name.ends_with(&self.settings.base_domain) {
            return Err(ProviderError::Api(format!(
                "record {} is outside zone {}",
                record.name, self.settings.base_domain
            )));
        }
        let seq = state.next();
        state.records.insert(
            (record.name.clone(), record.record_type.clone()),
            record.clone(),
        );
        Ok(format!("C{seq:08}"))
    }

    async fn delete_record(&self, zone_id: &str, record: &DnsRecord) -> ProviderResult<String> {
        let mut state = self.state();
        self.enter(&mut state, "DeleteRecord", &record.name)?;
        if zone_id != self.zone_id {
            return Err(ProviderError::not_found("hosted zone", zone_id));
        }
        let key = (record.name.clone(), record.record_type.clone());
        if state.records.remove(&key).is_none() {
            return Err(ProviderError::not_found("dns record", &record.name));
        }
        let seq = state.next();
        Ok(format!("C{seq:08}"))
    }
}

#[async_trait]
impl ContainerRuntimeService for SimulatedCloud {
    async fn deploy_stack(&self, spec: &StackSpec) -> ProviderResult<String> {
        let mut state = self.state();
        self.enter(&mut state, "DeployStack", &spec.stack_name)?;
        state.stacks.insert(
            spec.stack_name.clone(),
            SimStack {
                spec: spec.clone(),
                describes: 0,
            },
        );
        Ok(format!("stack-{}", spec.stack_name))
    }

    async fn describe_services(&self, stack_name: &str) -> ProviderResult<Vec<ServiceStatus>> {
        let mut state = self.state();
        self.enter(&mut state, "DescribeServices", stack_name)?;
        let ready_after = self.settings.services_ready_after;
        let stack = state
            .stacks
            .get_mut(stack_name)
            .ok_or_else(|| ProviderError::not_found("stack", stack_name))?;
        stack.describes += 1;
        let running = stack.describes >= ready_after;
        Ok(stack
            .spec
            .services
            .iter()
            .enumerate()
            .map(|(i, service)| ServiceStatus {
                name: service.name.clone(),
                state: if running {
                    ServiceState::Running
                } else {
                    ServiceState::Pending
                },
                target_id: running.then(|| format!("{stack_name}-{}", service.name)),
                host: running.then(|| format!("10.20.1.{}", i + 10)),
                port: service.port,
                message: None,
            })
            .collect())
    }

    async fn remove_stack(&self, stack_name: &str) -> ProviderResult<()> {
        let mut state = self.state();
        self.enter(&mut state, "RemoveStack", stack_name)?;
        state
            .stacks
            .remove(stack_name)
            .map(|_| ())
            .ok_or_else(|| ProviderError::not_found("stack", stack_name))
    }
}
