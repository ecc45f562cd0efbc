use super::shell::{ConnectionInfo, Shell};
use crate::error::ConnectionError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const SERVICE_LS: &str =
    "docker service ls --format '{{.ID}}|{{.Name}}|{{.Mode}}|{{.Replicas}}|{{.Image}}'";
const NODE_LS: &str =
    "docker node ls --format '{{.ID}}|{{.Hostname}}|{{.Status}}|{{.Availability}}|{{.ManagerStatus}}'";
const STACK_SERVICES: &str =
    "docker stack services --format '{{.ID}}|{{.Name}}|{{.Mode}}|{{.Replicas}}|{{.Image}}'";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    pub mode: String,
    pub replicas: String,
    pub image: String,
}

impl ServiceInfo {
    /// `3/3` style replica counts where running equals desired.
    pub fn is_converged(&self) -> bool {
        match self.replicas.split_whitespace().next().and_then(|r| r.split_once('/')) {
            Some((running, desired)) => running == desired,
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub hostname: String,
    pub status: String,
    pub availability: String,
    /// `Leader`, `Reachable`, or empty for workers.
    pub manager_status: String,
}

pub struct Monitor;

impl Monitor {
    /// Services of one stack, or every service when `stack` is `None`.
    pub async fn list_services(
        manager: &ConnectionInfo,
        stack: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<ServiceInfo>, ConnectionError> {
        let cmd = match stack {
            Some(stack) => format!("{} {}", STACK_SERVICES, super::process::shell_quote(stack)),
            None => SERVICE_LS.to_string(),
        };
        let output = Shell::exec_checked(manager, &cmd, timeout).await?;
        Ok(parse_services(&output.stdout))
    }

    pub async fn list_nodes(
        manager: &ConnectionInfo,
        timeout: Duration,
    ) -> Result<Vec<NodeInfo>, ConnectionError> {
        let output = Shell::exec_checked(manager, NODE_LS, timeout).await?;
        Ok(parse_nodes(&output.stdout))
    }
}

pub fn parse_services(output: &str) -> Vec<ServiceInfo> {
    let mut services = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() >= 5 {
            services.push(ServiceInfo {
                id: parts[0].to_string(),
                name: parts[1].to_string(),
                mode: parts[2].to_string(),
                replicas: parts[3].to_string(),
                image: parts[4].to_string(),
            });
        }
    }
    services
}

pub fn parse_nodes(output: &str) -> Vec<NodeInfo> {
    let mut nodes = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() >= 4 {
            nodes.push(NodeInfo {
                // The current node is marked with a trailing `*`.
                id: parts[0].trim_end_matches(" *").trim_end_matches('*').to_string(),
                hostname: parts[1].to_string(),
                status: parts[2].to_string(),
                availability: parts[3].to_string(),
                manager_status: parts.get(4).map(|s| s.to_string()).unwrap_or_default(),
            });
        }
    }
    nodes
}
