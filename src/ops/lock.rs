//! Per-environment deploy lock.
//!
//! A lock is one record per environment, created with an atomic
//! create-if-absent. On a cluster the record is a swarm config object,
//! which the managers replicate through Raft: whichever manager an
//! invocation reaches, it sees the same record, so failing over to another
//! manager never moves or forks the lock. Locally the record is a file that
//! is written aside and hard-linked into place.
//!
//! Removal can be conditional on the acquisition `token`, so a holder that
//! lost its lock to a force-release never deletes its successor's record.

use super::process::shell_quote;
use super::resolve::{ResolvedDeployment, ServerResolver};
use super::shell::{ConnectionInfo, Shell};
use crate::error::{LockError, ResolutionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

/// Status surface: `{locked, holder?, acquiredAt?}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<DateTime<Utc>>,
}

impl LockInfo {
    pub fn unlocked() -> Self {
        Self::default()
    }
}

/// What is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub environment: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    /// Identifies one acquisition. Swarm records use the config ID.
    #[serde(default)]
    pub token: String,
}

impl From<&LockRecord> for LockInfo {
    fn from(record: &LockRecord) -> Self {
        Self {
            locked: true,
            holder: Some(record.holder.clone()),
            acquired_at: Some(record.acquired_at),
        }
    }
}

/// Storage shared by every invocation targeting an environment.
pub trait LockStore {
    /// Atomically create the record. `Ok(false)` when one already exists.
    fn create_if_absent(
        &self,
        record: &LockRecord,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;

    fn read(
        &self,
        environment: &str,
    ) -> impl Future<Output = Result<Option<LockRecord>, LockError>> + Send;

    /// Remove the record, only if it still carries `token` when one is given.
    /// `Ok(false)` when nothing was removed.
    fn remove(
        &self,
        environment: &str,
        token: Option<&str>,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;
}

fn lock_file_name(environment: &str) -> String {
    format!("{}.lock", environment)
}

fn parse_record(environment: &str, raw: &str) -> Result<Option<LockRecord>, LockError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|e| LockError::Corrupt {
            environment: environment.to_string(),
            reason: e.to_string(),
        })
}

fn encode_record(record: &LockRecord) -> Result<String, LockError> {
    serde_json::to_string(record).map_err(|e| LockError::Storage(e.to_string()))
}

/// Lock records in a local directory.
#[derive(Debug, Clone)]
pub struct FsLockStore {
    dir: PathBuf,
}

impl FsLockStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl LockStore for FsLockStore {
    async fn create_if_absent(&self, record: &LockRecord) -> Result<bool, LockError> {
        let storage = |e: std::io::Error| LockError::Storage(e.to_string());
        tokio::fs::create_dir_all(&self.dir).await.map_err(storage)?;

        let target = self.dir.join(lock_file_name(&record.environment));
        let staging = self.dir.join(format!(
            ".{}.{}.tmp",
            record.environment,
            uuid::Uuid::new_v4()
        ));
        tokio::fs::write(&staging, encode_record(record)?)
            .await
            .map_err(storage)?;

        let linked = tokio::fs::hard_link(&staging, &target).await;
        let _ = tokio::fs::remove_file(&staging).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(storage(e)),
        }
    }

    async fn read(&self, environment: &str) -> Result<Option<LockRecord>, LockError> {
        let path = self.dir.join(lock_file_name(environment));
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => parse_record(environment, &raw),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LockError::Storage(e.to_string())),
        }
    }

    async fn remove(&self, environment: &str, token: Option<&str>) -> Result<bool, LockError> {
        let storage = |e: std::io::Error| LockError::Storage(e.to_string());
        let target = self.dir.join(lock_file_name(environment));
        let aside = self.dir.join(format!(
            ".{}.{}.release",
            environment,
            uuid::Uuid::new_v4()
        ));
        // Taking the record out of place first makes the token check and the
        // delete one step for every other caller.
        match tokio::fs::rename(&target, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(storage(e)),
        }

        let owned = match token {
            None => true,
            Some(token) => match tokio::fs::read_to_string(&aside).await {
                Ok(raw) => parse_record(environment, &raw)
                    .ok()
                    .flatten()
                    .is_some_and(|record| record.token == token),
                Err(_) => false,
            },
        };
        if !owned {
            match tokio::fs::hard_link(&aside, &target).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    tracing::warn!(environment = %environment, "Lock replaced while being released");
                }
                Err(e) => {
                    tracing::warn!(environment = %environment, "Failed to restore lock record: {}", e);
                }
            }
        }
        tokio::fs::remove_file(&aside).await.map_err(storage)?;
        Ok(owned)
    }
}

/// Swarm config name holding an environment's lock.
pub fn swarm_lock_name(environment: &str) -> String {
    format!("dockflow-lock-{}", environment)
}

const LABEL_ENVIRONMENT: &str = "dockflow.lock.environment";
const LABEL_HOLDER: &str = "dockflow.lock.holder";
const LABEL_ACQUIRED_AT: &str = "dockflow.lock.acquired_at";

#[derive(Debug, Deserialize)]
struct SwarmLockLabels {
    #[serde(rename = "dockflow.lock.environment")]
    environment: String,
    #[serde(rename = "dockflow.lock.holder")]
    holder: String,
    #[serde(rename = "dockflow.lock.acquired_at")]
    acquired_at: DateTime<Utc>,
}

/// Parse `<config id> <labels json>` as printed by `docker config inspect`.
fn parse_swarm_record(environment: &str, raw: &str) -> Result<Option<LockRecord>, LockError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let corrupt = |reason: String| LockError::Corrupt {
        environment: environment.to_string(),
        reason,
    };
    let (id, labels) = raw
        .split_once(' ')
        .ok_or_else(|| corrupt(format!("unexpected inspect output '{}'", raw)))?;
    let labels: SwarmLockLabels =
        serde_json::from_str(labels).map_err(|e| corrupt(e.to_string()))?;
    Ok(Some(LockRecord {
        environment: labels.environment,
        holder: labels.holder,
        acquired_at: labels.acquired_at,
        token: id.to_string(),
    }))
}

/// Lock records kept in the swarm's replicated config store.
///
/// Every call goes to the first manager that answers; a manager that is
/// unreachable or times out is skipped.
#[derive(Debug, Clone)]
pub struct SwarmLockStore {
    managers: Vec<ConnectionInfo>,
    timeout: Duration,
}

impl SwarmLockStore {
    pub fn new(managers: Vec<ConnectionInfo>, timeout: Duration) -> Self {
        Self { managers, timeout }
    }

    /// Every manager of `deployment`, active one first.
    pub fn for_deployment(
        resolver: &ServerResolver,
        deployment: &ResolvedDeployment,
        timeout: Duration,
    ) -> Result<Self, ResolutionError> {
        let managers = deployment
            .failover_order()
            .into_iter()
            .map(|manager| resolver.connection_info(&deployment.environment, manager))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(managers, timeout))
    }

    async fn run(&self, script: &str) -> Result<String, LockError> {
        let mut last_error = None;
        for manager in &self.managers {
            match Shell::exec_checked(manager, script, self.timeout).await {
                Ok(result) => return Ok(result.stdout.trim().to_string()),
                Err(e) if e.is_failover_candidate() => {
                    tracing::warn!(host = %manager.host(), "Lock storage unreachable: {}", e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(match last_error {
            Some(e) => e.into(),
            None => LockError::Storage("no manager to hold the lock".to_string()),
        })
    }
}

/// Run `command`, print `ok` on success, `missing` when its error matches
/// `pattern`, and fail with the error otherwise.
fn docker_outcome(command: &str, ok: &str, pattern: &str, missing: &str) -> String {
    format!(
        "if out=$({command} 2>&1); then echo {ok}; \
         elif printf '%s' \"$out\" | grep -qiE '{pattern}'; then echo {missing}; \
         else printf '%s\\n' \"$out\" >&2; exit 1; fi"
    )
}

impl LockStore for SwarmLockStore {
    async fn create_if_absent(&self, record: &LockRecord) -> Result<bool, LockError> {
        let create = format!(
            "printf '%s' {json} | docker config create --label {env} --label {holder} --label {at} {name} -",
            json = shell_quote(&encode_record(record)?),
            env = shell_quote(&format!("{}={}", LABEL_ENVIRONMENT, record.environment)),
            holder = shell_quote(&format!("{}={}", LABEL_HOLDER, record.holder)),
            at = shell_quote(&format!("{}={}", LABEL_ACQUIRED_AT, record.acquired_at.to_rfc3339())),
            name = shell_quote(&swarm_lock_name(&record.environment)),
        );
        let script = docker_outcome(&create, "acquired", "already exists", "held");
        Ok(self.run(&script).await? == "acquired")
    }

    async fn read(&self, environment: &str) -> Result<Option<LockRecord>, LockError> {
        let script = format!(
            "if out=$(docker config inspect --format '{{{{.ID}}}} {{{{json .Spec.Labels}}}}' {name} 2>&1); \
             then printf '%s' \"$out\"; \
             elif printf '%s' \"$out\" | grep -qiE 'not found|no such config'; then :; \
             else printf '%s\\n' \"$out\" >&2; exit 1; fi",
            name = shell_quote(&swarm_lock_name(environment)),
        );
        let raw = self.run(&script).await?;
        parse_swarm_record(environment, &raw)
    }

    async fn remove(&self, environment: &str, token: Option<&str>) -> Result<bool, LockError> {
        // A config ID names one acquisition; the name matches whichever is current.
        let target = match token {
            Some(id) => id.to_string(),
            None => swarm_lock_name(environment),
        };
        let command = format!("docker config rm {}", shell_quote(&target));
        let script = docker_outcome(&command, "removed", "not found|no such config", "absent");
        Ok(self.run(&script).await? == "removed")
    }
}

/// Acquire attempts when a lock vanishes between a failed create and the read.
const ACQUIRE_ATTEMPTS: usize = 3;

pub struct DeployLock<S> {
    store: S,
}

impl<S: LockStore> DeployLock<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Take the lock. Re-acquiring a lock already held by `holder` is a no-op.
    pub async fn acquire(&self, environment: &str, holder: &str) -> Result<LockInfo, LockError> {
        validate_environment(environment)?;
        for _ in 0..ACQUIRE_ATTEMPTS {
            let record = LockRecord {
                environment: environment.to_string(),
                holder: holder.to_string(),
                acquired_at: Utc::now(),
                token: uuid::Uuid::new_v4().to_string(),
            };
            if self.store.create_if_absent(&record).await? {
                tracing::info!(environment = %environment, holder = %holder, "Deploy lock acquired");
                return Ok(LockInfo::from(&record));
            }
            match self.store.read(environment).await? {
                Some(existing) if existing.holder == holder => {
                    return Ok(LockInfo::from(&existing));
                }
                Some(existing) => {
                    return Err(LockError::AlreadyLocked {
                        environment: environment.to_string(),
                        holder: existing.holder,
                        acquired_at: existing.acquired_at.to_rfc3339(),
                    });
                }
                // Released between our create and read; try again.
                None => continue,
            }
        }
        Err(LockError::Storage(format!(
            "lock for '{}' kept changing while acquiring",
            environment
        )))
    }

    /// Current state. No record means unlocked.
    pub async fn status(&self, environment: &str) -> Result<LockInfo, LockError> {
        validate_environment(environment)?;
        Ok(self
            .store
            .read(environment)
            .await?
            .as_ref()
            .map(LockInfo::from)
            .unwrap_or_else(LockInfo::unlocked))
    }

    /// Release a lock held by `holder`.
    pub async fn release(&self, environment: &str, holder: &str) -> Result<(), LockError> {
        validate_environment(environment)?;
        let not_locked = || LockError::NotLocked {
            environment: environment.to_string(),
        };
        let existing = self.store.read(environment).await?.ok_or_else(not_locked)?;
        if existing.holder != holder {
            return Err(LockError::NotHolder {
                environment: environment.to_string(),
                holder: existing.holder,
                requester: holder.to_string(),
            });
        }
        if !self.store.remove(environment, Some(&existing.token)).await? {
            // Force-released, and possibly re-acquired, since the read.
            return match self.store.read(environment).await? {
                Some(current) => Err(LockError::NotHolder {
                    environment: environment.to_string(),
                    holder: current.holder,
                    requester: holder.to_string(),
                }),
                None => Err(not_locked()),
            };
        }
        tracing::info!(environment = %environment, holder = %holder, "Deploy lock released");
        Ok(())
    }

    /// Operator recovery: drop whatever lock exists. Returns the previous state.
    pub async fn force_release(
        &self,
        environment: &str,
        operator: &str,
    ) -> Result<LockInfo, LockError> {
        validate_environment(environment)?;
        let previous = self.store.read(environment).await.unwrap_or_else(|e| {
            tracing::warn!(environment = %environment, "Unreadable lock record: {}", e);
            None
        });
        self.store.remove(environment, None).await?;
        match &previous {
            Some(record) => tracing::warn!(
                environment = %environment,
                operator = %operator,
                previous_holder = %record.holder,
                acquired_at = %record.acquired_at.to_rfc3339(),
                "Deploy lock force-released"
            ),
            None => tracing::warn!(
                environment = %environment,
                operator = %operator,
                "Force-release requested on an unlocked environment"
            ),
        }
        Ok(previous
            .as_ref()
            .map(LockInfo::from)
            .unwrap_or_else(LockInfo::unlocked))
    }

    /// Run `work` while holding the lock; the lock is released once it finishes.
    pub async fn with_lock<F, T>(
        &self,
        environment: &str,
        holder: &str,
        work: F,
    ) -> Result<T, LockError>
    where
        F: Future<Output = T>,
    {
        self.acquire(environment, holder).await?;
        let output = work.await;
        if let Err(e) = self.release(environment, holder).await {
            tracing::warn!(environment = %environment, "Failed to release deploy lock: {}", e);
        }
        Ok(output)
    }
}

pub fn validate_environment(environment: &str) -> Result<(), LockError> {
    let valid = !environment.is_empty()
        && !environment.starts_with('.')
        && environment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(LockError::InvalidEnvironment(environment.to_string()))
    }
}

/// Who is deploying: the CI run when there is one, else `user@host:pid`.
pub fn default_holder() -> String {
    if let Ok(run) = std::env::var("GITHUB_RUN_ID") {
        return format!("github-run-{}", run);
    }
    if let Ok(job) = std::env::var("CI_JOB_ID") {
        return format!("gitlab-job-{}", job);
    }
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = gethostname::gethostname().to_string_lossy().to_string();
    format!("{}@{}:{}", user, host, std::process::id())
}
