use super::lock::{DeployLock, SwarmLockStore};
use super::operation::OperationHandle;
use super::process::shell_quote;
use super::resolve::{ResolvedDeployment, ResolvedServer, ServerResolver};
use super::shell::{ConnectionInfo, Shell};
use crate::config::{EnvMap, FailoverConfig};
use crate::error::{ConnectionError, DeployError, LockError, ResolutionError};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Where compose files are uploaded on the manager.
const REMOTE_STACK_DIR: &str = "/tmp/dockflow/stacks";

/// How hard to try the next manager when the active one stops answering.
#[derive(Debug, Clone)]
pub struct FailoverPolicy {
    pub max_attempts: usize,
    pub backoff: Duration,
    pub probe_timeout: Duration,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self::from(&FailoverConfig::default())
    }
}

impl From<&FailoverConfig> for FailoverPolicy {
    fn from(config: &FailoverConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
        }
    }
}

/// Run `attempt` against each candidate manager in turn.
///
/// Only `HostUnreachable` and `Timeout` move on to the next manager; any
/// other error is returned as is.
pub async fn with_failover<T, F, Fut>(
    environment: &str,
    candidates: &[ResolvedServer],
    policy: &FailoverPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, DeployError>
where
    F: FnMut(ResolvedServer) -> Fut,
    Fut: Future<Output = Result<T, DeployError>>,
{
    let mut last_error = None;
    for (index, server) in candidates.iter().take(policy.max_attempts.max(1)).enumerate() {
        if index > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return Err(DeployError::Cancelled),
                _ = tokio::time::sleep(policy.backoff) => {}
            }
            tracing::info!(server = %server.name, host = %server.host, "Failing over to next manager");
        }
        match attempt(server.clone()).await {
            Ok(value) => return Ok(value),
            Err(DeployError::Connection(e)) if e.is_failover_candidate() => {
                tracing::warn!(server = %server.name, "Manager attempt failed: {}", e);
                last_error = Some(DeployError::Connection(e));
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        DeployError::Resolution(ResolutionError::NoManagerReachable {
            environment: environment.to_string(),
        })
    }))
}

/// Everything one deploy needs besides the cluster itself.
#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub environment: String,
    pub stack: String,
    pub compose_file: PathBuf,
    /// Image archives to `docker load` on every node.
    pub archives: Vec<PathBuf>,
    pub prune: bool,
    pub holder: String,
}

pub struct Deployer {
    resolver: ServerResolver,
    failover: FailoverPolicy,
    command_timeout: Duration,
}

impl Deployer {
    pub fn new(resolver: ServerResolver, failover: FailoverPolicy) -> Self {
        Self {
            resolver,
            failover,
            command_timeout: Duration::from_secs(60),
        }
    }

    /// Resolve, lock, transfer, deploy, prune, unlock. Progress goes to `op`.
    pub async fn deploy(&self, plan: &DeployPlan, op: &OperationHandle) -> Result<(), DeployError> {
        let cancel = op.cancel_token();
        let environment = plan.environment.as_str();

        op.log(format!("🔎 Resolving servers for '{}'...", environment));
        let probe_timeout = self.failover.probe_timeout;
        let deployment = self
            .resolver
            .resolve_deployment_with_probe(environment, |server| {
                let info = self.resolver.connection_info(environment, server);
                async move {
                    match info {
                        Ok(info) => Shell::test_connection(&info, probe_timeout).await,
                        Err(_) => false,
                    }
                }
            })
            .await?;
        op.log(format!(
            "   Active manager: {} ({}), {} manager(s), {} worker(s)",
            deployment.manager.name,
            deployment.manager.host,
            deployment.managers.len(),
            deployment.workers.len()
        ));

        // The lock lives in the swarm, not on one manager, so it is taken once
        // and stays put while the steps below fail over between managers.
        let lock = DeployLock::new(SwarmLockStore::for_deployment(
            &self.resolver,
            &deployment,
            self.command_timeout,
        )?);
        op.log(format!("🔒 Acquiring deploy lock for '{}'...", environment));
        lock.acquire(environment, &plan.holder)
            .await
            .map_err(lock_err)?;

        let candidates: Vec<ResolvedServer> =
            deployment.failover_order().into_iter().cloned().collect();
        let result = with_failover(environment, &candidates, &self.failover, &cancel, |manager| {
            self.deploy_via(&deployment, manager, plan, op, &cancel)
        })
        .await;

        match lock.release(environment, &plan.holder).await {
            Ok(()) => {
                op.log("🔓 Deploy lock released");
            }
            Err(e) => {
                tracing::warn!(environment = %environment, "Failed to release deploy lock: {}", e);
                op.log(format!("⚠️  Could not release deploy lock: {}", e));
            }
        }
        result
    }

    async fn deploy_via(
        &self,
        deployment: &ResolvedDeployment,
        manager: ResolvedServer,
        plan: &DeployPlan,
        op: &OperationHandle,
        cancel: &CancellationToken,
    ) -> Result<(), DeployError> {
        let info = self.resolver.connection_info(&plan.environment, &manager)?;
        self.run_locked(deployment, &manager, &info, plan, op, cancel).await
    }

    async fn run_locked(
        &self,
        deployment: &ResolvedDeployment,
        manager: &ResolvedServer,
        manager_info: &ConnectionInfo,
        plan: &DeployPlan,
        op: &OperationHandle,
        cancel: &CancellationToken,
    ) -> Result<(), DeployError> {
        // 1. Ship images to every node.
        for node in deployment.nodes() {
            let info = self.resolver.connection_info(&plan.environment, node)?;
            for archive in &plan.archives {
                check_cancelled(cancel)?;
                op.log(format!("📦 Loading {} on {}...", archive.display(), node.name));
                let loaded = Shell::pipe_file(&info, archive, "docker load", cancel)
                    .await
                    .and_then(|r| r.checked(info.host(), "docker load"))
                    .map_err(|e| node_err(node, manager, e))?;
                for line in loaded.stdout.lines() {
                    op.log(format!("   [{}] {}", node.name, line));
                }
            }
        }

        // 2. Compose file to the manager.
        check_cancelled(cancel)?;
        let remote_dir = format!("{}/{}", REMOTE_STACK_DIR, plan.stack);
        let remote_file = format!("{}/docker-compose.yml", remote_dir);
        op.log(format!("📄 Uploading {}...", plan.compose_file.display()));
        let upload = format!(
            "mkdir -p {} && cat > {}",
            shell_quote(&remote_dir),
            shell_quote(&remote_file)
        );
        Shell::pipe_file(manager_info, &plan.compose_file, &upload, cancel)
            .await
            .and_then(|r| r.checked(manager_info.host(), &upload))
            .map_err(connection_err)?;

        // 3. Stack deploy, streamed. Env values go over stdin into a 0600 file.
        check_cancelled(cancel)?;
        let env_file = format!("{}/stack.env", remote_dir);
        let env_upload = format!("umask 077 && cat > {}", shell_quote(&env_file));
        Shell::pipe_bytes(
            manager_info,
            stack_env_file(&manager.env).as_bytes(),
            &env_upload,
            cancel,
        )
        .await
        .and_then(|r| r.checked(manager_info.host(), &env_upload))
        .map_err(connection_err)?;
        let command = stack_deploy_command(&env_file, &remote_file, &plan.stack);
        op.log(format!("🚀 Deploying stack '{}'...", plan.stack));
        Shell::stream_checked(manager_info, &command, cancel.clone(), |line| {
            op.log(format!("   {}", line.text()));
        })
        .await
        .map_err(connection_err)?;

        // 4. Best effort cleanup.
        if plan.prune {
            for node in deployment.nodes() {
                check_cancelled(cancel)?;
                let pruned = match self.resolver.connection_info(&plan.environment, node) {
                    Ok(info) => {
                        Shell::exec_checked(&info, "docker image prune -f", self.command_timeout)
                            .await
                            .map_err(|e| e.to_string())
                    }
                    Err(e) => Err(e.to_string()),
                };
                match pruned {
                    Ok(_) => {
                        op.log(format!("🧹 Pruned images on {}", node.name));
                    }
                    Err(e) => {
                        tracing::warn!(server = %node.name, "Prune failed: {}", e);
                        op.log(format!("⚠️  Prune failed on {}: {}", node.name, e));
                    }
                }
            }
        }

        op.log("✅ Deployment complete");
        Ok(())
    }
}

/// `KEY='value'` lines for the manager's merged env. Keys a shell cannot
/// assign are skipped.
pub fn stack_env_file(env: &EnvMap) -> String {
    let mut file = String::new();
    for (key, value) in env {
        if !is_shell_name(key) {
            tracing::warn!(key = %key, "Skipping env key that is not a valid shell variable name");
            continue;
        }
        file.push_str(&format!("{}={}\n", key, shell_quote(value)));
    }
    file
}

/// `docker stack deploy` with `env_file` exported for substitution, then removed.
pub fn stack_deploy_command(env_file: &str, compose_file: &str, stack: &str) -> String {
    let env_file = shell_quote(env_file);
    format!(
        "set -a && . {env} && set +a && docker stack deploy --with-registry-auth -c {compose} {stack}; \
         status=$?; rm -f {env}; exit $status",
        env = env_file,
        compose = shell_quote(compose_file),
        stack = shell_quote(stack)
    )
}

fn is_shell_name(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), DeployError> {
    if cancel.is_cancelled() {
        Err(DeployError::Cancelled)
    } else {
        Ok(())
    }
}

fn connection_err(e: ConnectionError) -> DeployError {
    match e {
        ConnectionError::Cancelled { .. } => DeployError::Cancelled,
        other => DeployError::Connection(other),
    }
}

/// Failures on the manager stay failover candidates; other nodes' do not.
fn node_err(node: &ResolvedServer, manager: &ResolvedServer, e: ConnectionError) -> DeployError {
    if node.name == manager.name {
        return connection_err(e);
    }
    match e {
        ConnectionError::Cancelled { .. } => DeployError::Cancelled,
        other => DeployError::NodeFailed {
            server: node.name.clone(),
            source: other,
        },
    }
}

fn lock_err(e: LockError) -> DeployError {
    match e {
        LockError::Connection(c) => connection_err(c),
        other => DeployError::Lock(other),
    }
}
