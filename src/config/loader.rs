//! Configuration file loader and validation.

use super::error::{ConfigError, ConfigResult};
use super::types::{ProxyConfig, RouteRuleConfig, ServiceConfig, MAX_WEIGHT, MIN_WEIGHT};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// The raw document: a mapping whose single key must be `proxy`.
#[derive(Debug, Deserialize)]
struct RootDocument(BTreeMap<String, ProxyConfig>);

/// Load and validate configuration from a file path.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the YAML is malformed, the
/// root is not a single `proxy` mapping, or validation fails.
pub fn load_file<P: AsRef<Path>>(path: P) -> ConfigResult<ProxyConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    load_str(&content)
}

/// Load and validate configuration from a YAML string.
///
/// # Errors
///
/// Returns an error if the YAML is malformed, the root is not a single
/// `proxy` mapping, or validation fails.
pub fn load_str(content: &str) -> ConfigResult<ProxyConfig> {
    let RootDocument(mut root) = serde_yaml::from_str(content)?;
    if root.len() != 1 {
        return Err(ConfigError::InvalidRoot);
    }
    let config = root.remove("proxy").ok_or(ConfigError::InvalidRoot)?;
    validate(&config)?;
    Ok(config)
}

/// Validate the whole tree, reporting the first problem with its key path.
fn validate(config: &ProxyConfig) -> ConfigResult<()> {
    if let Some(metrics) = &config.metrics {
        let scheme = metrics
            .address
            .split_once("://")
            .map_or("http", |(scheme, _)| scheme);
        match scheme {
            "http" if metrics.certificate.is_some() => {
                return Err(ConfigError::InvalidValue {
                    key: "proxy.metrics.certificate".to_string(),
                    message: "certificate is not allowed for http".to_string(),
                });
            }
            "https" if metrics.certificate.is_none() => {
                return Err(ConfigError::MissingField {
                    key: "proxy.metrics".to_string(),
                    field: "certificate (required for https)".to_string(),
                });
            }
            "http" | "https" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "proxy.metrics.address".to_string(),
                    message: format!("unsupported metrics scheme `{other}`"),
                });
            }
        }
    }

    for (name, service) in &config.services {
        validate_service(name, service)?;
    }
    Ok(())
}

fn validate_service(name: &str, service: &ServiceConfig) -> ConfigResult<()> {
    let key = format!("proxy.services.{name}");

    for (i, frontend) in service.frontends.iter().enumerate() {
        if frontend.address.is_empty() {
            return Err(ConfigError::MissingField {
                key: format!("{key}.frontends[{i}]"),
                field: "address".to_string(),
            });
        }
    }

    let mut backend_names = Vec::with_capacity(service.backends.len());
    for (i, backend) in service.backends.iter().enumerate() {
        let key = format!("{key}.backends[{i}]");
        if backend.address.is_empty() {
            return Err(ConfigError::MissingField {
                key,
                field: "address".to_string(),
            });
        }
        if let Some(weight) = backend.weight {
            if weight > 0 && !(MIN_WEIGHT..=MAX_WEIGHT).contains(&weight) {
                return Err(ConfigError::WeightOutOfRange { key, weight });
            }
        }
        backend_names.push(
            backend
                .name
                .clone()
                .unwrap_or_else(|| backend.address.clone()),
        );
    }

    for (group, members) in &service.backend_groups {
        for (i, member) in members.iter().enumerate() {
            let key = format!("{key}.backendGroups.{group}[{i}]");
            if member.name.is_empty() {
                return Err(ConfigError::MissingField {
                    key,
                    field: "name".to_string(),
                });
            }
            if !backend_names.iter().any(|n| n == &member.name) {
                return Err(ConfigError::UnknownReference {
                    key,
                    name: member.name.clone(),
                    kind: "backend".to_string(),
                });
            }
            if let Some(weight) = member.weight {
                if weight > 0 && !(MIN_WEIGHT..=MAX_WEIGHT).contains(&weight) {
                    return Err(ConfigError::WeightOutOfRange { key, weight });
                }
            }
        }
    }

    for (i, rule) in service.routes.iter().enumerate() {
        validate_route_rule(&format!("{key}.routes[{i}]"), rule, &backend_names, service)?;
    }

    if let Some(default_route) = &service.default_route {
        if !service.backend_groups.contains_key(default_route) {
            return Err(ConfigError::UnknownReference {
                key: format!("{key}.defaultRoute"),
                name: default_route.clone(),
                kind: "backendGroup".to_string(),
            });
        }
    }

    Ok(())
}

fn validate_route_rule(
    key: &str,
    rule: &RouteRuleConfig,
    backend_names: &[String],
    service: &ServiceConfig,
) -> ConfigResult<()> {
    if rule.client_addr.is_empty() {
        return Err(ConfigError::MissingField {
            key: key.to_string(),
            field: "clientAddr".to_string(),
        });
    }
    match (&rule.backend, &rule.backend_group) {
        (None, None) => Err(ConfigError::MissingField {
            key: key.to_string(),
            field: "backend or backendGroup".to_string(),
        }),
        (Some(_), Some(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "only one of `backend` and `backendGroup` is allowed".to_string(),
        }),
        (Some(backend), None) => {
            if backend_names.iter().any(|n| n == backend) {
                Ok(())
            } else {
                Err(ConfigError::UnknownReference {
                    key: key.to_string(),
                    name: backend.clone(),
                    kind: "backend".to_string(),
                })
            }
        }
        (None, Some(group)) => {
            // Synthetic groups are materialised later, so only explicit
            // groups can be checked here.
            if service.backend_groups.contains_key(group)
                || crate::proxy::route::is_synthetic_group(group)
            {
                Ok(())
            } else {
                Err(ConfigError::UnknownReference {
                    key: key.to_string(),
                    name: group.clone(),
                    kind: "backendGroup".to_string(),
                })
            }
        }
    }
}
