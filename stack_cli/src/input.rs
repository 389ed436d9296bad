//! Tenant config files: YAML for `.yaml`/`.yml`, JSON otherwise.

use std::path::Path;

use eyre::WrapErr;
use tenantstack::models::TenantConfig;

pub fn load_tenant_config(path: &Path) -> eyre::Result<TenantConfig> {
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    parse_tenant_config(&raw, is_yaml(path)).wrap_err_with(|| format!("parsing {}", path.display()))
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    )
}

fn parse_tenant_config(raw: &str, yaml: bool) -> eyre::Result<TenantConfig> {
    let config = if yaml {
        serde_yaml::from_str(raw)?
    } else {
        serde_json::from_str(raw)?
    };
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_and_json_parse_to_the_same_config() {
        let yaml = "tenant_id: acme-1\ntier: paid/basic\nfeatures:\n  booking: true\n";
        let json = r#"{"tenant_id":"acme-1","tier":"paid/basic","features":{"booking":true}}"#;
        let a = parse_tenant_config(yaml, true).unwrap();
        let b = parse_tenant_config(json, false).unwrap();
        assert_eq!(a.tenant_id, b.tenant_id);
        assert_eq!(a.tier, b.tier);
        assert_eq!(a.features, b.features);
    }

    #[test]
    fn unknown_tier_is_a_parse_error() {
        assert!(parse_tenant_config(r#"{"tenant_id":"acme-1","tier":"gold"}"#, false).is_err());
    }

    #[test]
    fn extension_selects_the_format() {
        assert!(is_yaml(Path::new("tenant.yml")));
        assert!(is_yaml(Path::new("tenant.yaml")));
        assert!(!is_yaml(Path::new("tenant.json")));
    }
}
