//! Server resolution: turns `servers.yml` plus env overlays into concrete
//! servers for one environment, and picks the active manager.
//!
//! An environment is just a tag. Env layers are folded left to right:
//! `all` -> each of the server's tags (declaration order) -> the server's own
//! `env` -> the external overlay. Later layers win on key collisions.
//! Credential and host override keys never enter the overlay layer; they are
//! only read by [`ServerResolver::connection_info`] and host resolution.

use super::shell::ConnectionInfo;
use crate::config::env::{is_credential_key, override_key, Overlay};
use crate::config::{EnvMap, ServerConfig, ServerRole, ServersFile, ALL_TAG};
use crate::error::ResolutionError;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedServer {
    pub name: String,
    pub role: ServerRole,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub env: EnvMap,
    pub tags: Vec<String>,
    #[serde(skip)]
    pub key_path: Option<String>,
}

/// Servers that resolved plus the ones dropped along the way.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub servers: Vec<ResolvedServer>,
    pub warnings: Vec<ResolutionError>,
}

#[derive(Debug, Clone)]
pub struct ResolvedDeployment {
    pub environment: String,
    /// The manager operations are sent to.
    pub manager: ResolvedServer,
    /// Every manager in declaration order, the active one included.
    pub managers: Vec<ResolvedServer>,
    pub workers: Vec<ResolvedServer>,
}

impl ResolvedDeployment {
    pub fn nodes(&self) -> impl Iterator<Item = &ResolvedServer> {
        self.managers.iter().chain(self.workers.iter())
    }

    /// Managers to try, starting at the active one, then the rest in declaration order.
    pub fn failover_order(&self) -> Vec<&ResolvedServer> {
        let mut order = vec![&self.manager];
        order.extend(self.managers.iter().filter(|m| m.name != self.manager.name));
        order
    }
}

/// Fold env maps left to right; the last writer of a key wins.
pub fn merge_env<'a, I>(layers: I) -> EnvMap
where
    I: IntoIterator<Item = &'a EnvMap>,
{
    layers.into_iter().fold(EnvMap::new(), |mut merged, layer| {
        merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    })
}

#[derive(Debug, Clone)]
pub struct ServerResolver {
    config: ServersFile,
    overlay: Overlay,
    /// Overlay variables that are safe to hand to servers and templates.
    overlay_env: EnvMap,
}

impl ServerResolver {
    pub fn new(config: ServersFile, overlay: Overlay) -> Self {
        let overlay_env = overlay_env_layer(&config, &overlay);
        Self {
            config,
            overlay,
            overlay_env,
        }
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    /// Resolve every server tagged `environment`, in declaration order.
    pub fn resolve(&self, environment: &str) -> Resolution {
        let mut resolution = Resolution::default();
        for (name, server) in &self.config.servers {
            if !server.tags.iter().any(|tag| tag == environment) {
                continue;
            }
            match self.resolve_one(environment, name, server) {
                Ok(resolved) => resolution.servers.push(resolved),
                Err(warning) => resolution.warnings.push(warning),
            }
        }
        resolution
    }

    /// Resolved servers only. An environment matching nothing yields an empty list.
    pub fn resolve_servers_for_environment(&self, environment: &str) -> Vec<ResolvedServer> {
        let resolution = self.resolve(environment);
        for warning in &resolution.warnings {
            tracing::warn!(environment = %environment, "Skipping server: {}", warning);
        }
        resolution.servers
    }

    /// Offline targeting: the first declared manager is active.
    pub fn resolve_deployment(
        &self,
        environment: &str,
    ) -> Result<ResolvedDeployment, ResolutionError> {
        let (managers, workers) = self.partition(environment)?;
        Ok(ResolvedDeployment {
            environment: environment.to_string(),
            manager: managers[0].clone(),
            managers,
            workers,
        })
    }

    /// Online targeting: the first declared manager whose probe succeeds is active.
    ///
    /// When no manager answers the first declared one stays active; reaching it
    /// is then a connection problem for the caller, not a resolution failure.
    pub async fn resolve_deployment_with_probe<F, Fut>(
        &self,
        environment: &str,
        mut probe: F,
    ) -> Result<ResolvedDeployment, ResolutionError>
    where
        F: FnMut(&ResolvedServer) -> Fut,
        Fut: Future<Output = bool>,
    {
        let (managers, workers) = self.partition(environment)?;
        let mut active = None;
        for manager in &managers {
            if probe(manager).await {
                active = Some(manager.clone());
                break;
            }
            tracing::warn!(server = %manager.name, host = %manager.host, "Manager unreachable");
        }
        let manager = active.unwrap_or_else(|| managers[0].clone());
        Ok(ResolvedDeployment {
            environment: environment.to_string(),
            manager,
            managers,
            workers,
        })
    }

    /// Credentials for `server`: CI-provided key or password, else its `key_path`.
    pub fn connection_info(
        &self,
        environment: &str,
        server: &ResolvedServer,
    ) -> Result<ConnectionInfo, ResolutionError> {
        let key_names = credential_keys(environment, &server.name, "SSH_PRIVATE_KEY");
        let password_names = credential_keys(environment, &server.name, "SSH_PASSWORD");
        let password = self.overlay.lookup_first(&password_names);

        let private_key = match self.overlay.lookup_first(&key_names) {
            Some(key) => Some(key),
            None => match &server.key_path {
                Some(path) => Some(read_key_path(&server.name, path)?),
                None => None,
            },
        };

        match (private_key, password) {
            (Some(private_key), sudo_password) => Ok(ConnectionInfo::Key {
                host: server.host.clone(),
                port: server.port,
                user: server.user.clone(),
                private_key,
                sudo_password,
            }),
            (None, Some(password)) => Ok(ConnectionInfo::Password {
                host: server.host.clone(),
                port: server.port,
                user: server.user.clone(),
                password,
            }),
            (None, None) => Err(ResolutionError::MissingCredentials {
                server: server.name.clone(),
                looked_for: format!("{} or {}", key_names[0], password_names[0]),
            }),
        }
    }

    fn partition(
        &self,
        environment: &str,
    ) -> Result<(Vec<ResolvedServer>, Vec<ResolvedServer>), ResolutionError> {
        let (managers, workers): (Vec<_>, Vec<_>) = self
            .resolve_servers_for_environment(environment)
            .into_iter()
            .partition(|s| s.role == ServerRole::Manager);
        if managers.is_empty() {
            return Err(ResolutionError::NoManagerReachable {
                environment: environment.to_string(),
            });
        }
        Ok((managers, workers))
    }

    fn resolve_one(
        &self,
        environment: &str,
        name: &str,
        server: &ServerConfig,
    ) -> Result<ResolvedServer, ResolutionError> {
        let host = self
            .overlay
            .host_for(environment, name)
            .or_else(|| server.host.clone())
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ResolutionError::UnresolvedHost {
                server: name.to_string(),
                override_key: override_key(&[environment, name, "HOST"]),
            })?;

        let mut tags: Vec<String> = Vec::new();
        for tag in &server.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }

        let empty = EnvMap::new();
        let mut layers: Vec<&EnvMap> = vec![self.config.env.get(ALL_TAG).unwrap_or(&empty)];
        layers.extend(
            tags.iter()
                .filter(|tag| tag.as_str() != ALL_TAG)
                .filter_map(|tag| self.config.env.get(tag)),
        );
        layers.push(&server.env);
        layers.push(&self.overlay_env);

        Ok(ResolvedServer {
            name: name.to_string(),
            role: server.role,
            host,
            port: server.port.unwrap_or(self.config.defaults.port),
            user: server
                .user
                .clone()
                .unwrap_or_else(|| self.config.defaults.user.clone()),
            env: merge_env(layers),
            tags,
            key_path: server.key_path.clone(),
        })
    }
}

/// The overlay minus SSH credentials and `<ENV>_<SERVER>_HOST` overrides.
fn overlay_env_layer(config: &ServersFile, overlay: &Overlay) -> EnvMap {
    let host_keys: Vec<String> = config
        .servers
        .iter()
        .flat_map(|(name, server)| {
            server
                .tags
                .iter()
                .map(move |tag| override_key(&[tag.as_str(), name.as_str(), "HOST"]))
        })
        .collect();
    overlay
        .variables
        .iter()
        .filter(|(key, _)| !is_credential_key(key) && !host_keys.contains(*key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Most specific first: per server, per environment, global.
fn credential_keys(environment: &str, server: &str, suffix: &str) -> Vec<String> {
    vec![
        override_key(&[environment, server, suffix]),
        override_key(&[environment, suffix]),
        suffix.to_string(),
    ]
}

fn read_key_path(server: &str, raw: &str) -> Result<String, ResolutionError> {
    let path = match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(raw)),
        None => PathBuf::from(raw),
    };
    std::fs::read_to_string(&path).map_err(|e| ResolutionError::KeyUnreadable {
        server: server.to_string(),
        path,
        reason: e.to_string(),
    })
}
