use super::resolve::{ResolvedServer, ServerResolver};
use crate::config::{EnvMap, ServerRole};
use crate::error::ResolutionError;
use serde::Serialize;
use std::collections::BTreeMap;

/// One server as the template engine sees it. Env keys are lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateServer {
    pub name: String,
    pub role: ServerRole,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub tags: Vec<String>,
    pub env: EnvMap,
    pub is_current: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterInfo {
    pub size: usize,
    pub manager_count: usize,
    pub worker_count: usize,
    pub manager_hosts: Vec<String>,
    pub worker_hosts: Vec<String>,
}

/// Data handed to the external renderer for one target server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateContext {
    pub current: TemplateServer,
    pub servers: BTreeMap<String, TemplateServer>,
    pub cluster: ClusterInfo,
}

impl TemplateContext {
    pub fn to_json(&self) -> serde_json::Value {
        // Every field is a plain string/number/map, so this cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Resolve `environment` and build the context for `current_server`.
pub fn build_template_context(
    resolver: &ServerResolver,
    environment: &str,
    current_server: &str,
) -> Result<TemplateContext, ResolutionError> {
    let servers = resolver.resolve_servers_for_environment(environment);
    context_from_servers(&servers, environment, current_server)
}

pub fn context_from_servers(
    servers: &[ResolvedServer],
    environment: &str,
    current_server: &str,
) -> Result<TemplateContext, ResolutionError> {
    if servers.is_empty() {
        return Err(ResolutionError::NoMatchingServers {
            environment: environment.to_string(),
        });
    }
    let current = servers
        .iter()
        .find(|s| s.name == current_server)
        .ok_or_else(|| ResolutionError::ServerNotFound {
            server: current_server.to_string(),
            environment: environment.to_string(),
        })?;

    let hosts = |role: ServerRole| -> Vec<String> {
        servers
            .iter()
            .filter(|s| s.role == role)
            .map(|s| s.host.clone())
            .collect()
    };
    let manager_hosts = hosts(ServerRole::Manager);
    let worker_hosts = hosts(ServerRole::Worker);

    let servers: BTreeMap<String, TemplateServer> = servers
        .iter()
        .map(|s| (s.name.clone(), template_server(s, s.name == current.name)))
        .collect();

    Ok(TemplateContext {
        current: template_server(current, true),
        cluster: ClusterInfo {
            size: manager_hosts.len() + worker_hosts.len(),
            manager_count: manager_hosts.len(),
            worker_count: worker_hosts.len(),
            manager_hosts,
            worker_hosts,
        },
        servers,
    })
}

fn template_server(server: &ResolvedServer, is_current: bool) -> TemplateServer {
    TemplateServer {
        name: server.name.clone(),
        role: server.role,
        host: server.host.clone(),
        port: server.port,
        user: server.user.clone(),
        tags: server.tags.clone(),
        env: lowercase_keys(&server.env),
        is_current,
    }
}

pub fn lowercase_keys(env: &EnvMap) -> EnvMap {
    env.iter()
        .map(|(k, v)| (k.to_lowercase(), v.clone()))
        .collect()
}
