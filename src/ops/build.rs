use super::operation::OperationHandle;
use super::process::{self, shell_command, shell_quote, StreamEnd};
use crate::config::ImageConfig;
use crate::error::BuildError;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SAVE_COMMAND: &str = "docker save -o {archive} {image}";

/// One image to build: an opaque shell command plus the image it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub image: String,
    pub command: String,
    pub workdir: Option<PathBuf>,
}

impl BuildSpec {
    pub fn new(image: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            command: command.into(),
            workdir: None,
        }
    }

    /// `docker build` for a configured image, run from the deployment root.
    pub fn from_image_config(config: &ImageConfig, root: &Path) -> Self {
        let command = match &config.command {
            Some(custom) => custom.clone(),
            None => {
                let mut command = format!("docker build -t {}", shell_quote(&config.name));
                if let Some(dockerfile) = &config.dockerfile {
                    command.push_str(&format!(" -f {}", shell_quote(dockerfile)));
                }
                command.push_str(&format!(" {}", shell_quote(&config.context)));
                command
            }
        };
        Self {
            image: config.name.clone(),
            command,
            workdir: Some(root.to_path_buf()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Skip the archive step.
    pub build_only: bool,
    /// Cancel the remaining builds after the first failure.
    pub fail_fast: bool,
    pub artifact_dir: PathBuf,
    pub parallelism: usize,
    /// `{archive}` and `{image}` are substituted (shell-quoted).
    pub save_command: String,
}

impl BuildOptions {
    pub fn new(artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_only: false,
            fail_fast: false,
            artifact_dir: artifact_dir.into(),
            parallelism: default_parallelism(),
            save_command: DEFAULT_SAVE_COMMAND.to_string(),
        }
    }
}

/// One build at a time per CPU, at least one.
pub fn default_parallelism() -> usize {
    num_cpus::get().max(1)
}

/// `registry.example.com/app:1.2.3` -> `registry.example.com-app-1.2.3.tar`
pub fn archive_file_name(image: &str) -> String {
    format!("{}.tar", image.replace(|c: char| c == ':' || c == '/', "-"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Built, archive step skipped.
    Built,
    Archived(PathBuf),
    Failed(BuildError),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecord {
    pub image: String,
    pub outcome: BuildOutcome,
}

impl BuildRecord {
    pub fn succeeded(&self) -> bool {
        matches!(
            self.outcome,
            BuildOutcome::Built | BuildOutcome::Archived(_)
        )
    }

    pub fn artifact(&self) -> Option<&Path> {
        match &self.outcome {
            BuildOutcome::Archived(path) => Some(path),
            _ => None,
        }
    }
}

pub struct BuildCoordinator {
    options: BuildOptions,
}

impl BuildCoordinator {
    pub fn new(options: BuildOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Build every spec, at most `parallelism` at once. Lines go to `op` live,
    /// prefixed with the image. Records come back in input order.
    pub async fn run(&self, specs: &[BuildSpec], op: &OperationHandle) -> Vec<BuildRecord> {
        let batch = op.cancel_token().child_token();
        let semaphore = Semaphore::new(self.options.parallelism.max(1));
        let builds = specs
            .iter()
            .map(|spec| self.build_one(spec, op, &batch, &semaphore));
        let records = join_all(builds).await;

        let failed = records.iter().filter(|r| !r.succeeded()).count();
        tracing::info!(
            total = records.len(),
            failed = failed,
            "Build batch finished"
        );
        records
    }

    async fn build_one(
        &self,
        spec: &BuildSpec,
        op: &OperationHandle,
        batch: &CancellationToken,
        semaphore: &Semaphore,
    ) -> BuildRecord {
        let record = |outcome| BuildRecord {
            image: spec.image.clone(),
            outcome,
        };

        let _permit = tokio::select! {
            _ = batch.cancelled() => return record(BuildOutcome::Cancelled),
            permit = semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return record(BuildOutcome::Cancelled),
            },
        };

        let outcome = self.execute(spec, op, batch).await;
        match &outcome {
            BuildOutcome::Failed(e) => {
                tracing::warn!(image = %spec.image, "{}", e);
                op.log(format!("[{}] ❌ {}", spec.image, e));
                if self.options.fail_fast {
                    batch.cancel();
                }
            }
            BuildOutcome::Cancelled => {
                op.log(format!("[{}] cancelled", spec.image));
            }
            BuildOutcome::Archived(path) => {
                op.log(format!("[{}] ✅ saved {}", spec.image, path.display()));
            }
            BuildOutcome::Built => {
                op.log(format!("[{}] ✅ built", spec.image));
            }
        }
        record(outcome)
    }

    async fn execute(
        &self,
        spec: &BuildSpec,
        op: &OperationHandle,
        batch: &CancellationToken,
    ) -> BuildOutcome {
        if batch.is_cancelled() {
            return BuildOutcome::Cancelled;
        }

        op.log(format!("[{}] $ {}", spec.image, spec.command));
        match self.stream(&spec.image, &spec.command, spec.workdir.as_deref(), op, batch).await {
            Ok(StreamEnd::Exited(0)) => {}
            Ok(StreamEnd::Exited(code)) => {
                return BuildOutcome::Failed(BuildError::BuildFailed {
                    image: spec.image.clone(),
                    exit_code: code,
                })
            }
            Ok(StreamEnd::Cancelled) => return BuildOutcome::Cancelled,
            Err(e) => {
                return BuildOutcome::Failed(BuildError::Spawn {
                    image: spec.image.clone(),
                    reason: e.to_string(),
                })
            }
        }

        if self.options.build_only {
            return BuildOutcome::Built;
        }

        let archive = self.options.artifact_dir.join(archive_file_name(&spec.image));
        let archive_failed = |reason: String| {
            BuildOutcome::Failed(BuildError::ArchiveFailed {
                image: spec.image.clone(),
                path: archive.clone(),
                reason,
            })
        };
        if let Err(e) = tokio::fs::create_dir_all(&self.options.artifact_dir).await {
            return archive_failed(e.to_string());
        }

        let save = self
            .options
            .save_command
            .replace("{archive}", &shell_quote(&archive.to_string_lossy()))
            .replace("{image}", &shell_quote(&spec.image));
        match self.stream(&spec.image, &save, None, op, batch).await {
            Ok(StreamEnd::Exited(0)) => BuildOutcome::Archived(archive.clone()),
            Ok(StreamEnd::Exited(code)) => archive_failed(format!("save exited with {}", code)),
            Ok(StreamEnd::Cancelled) => BuildOutcome::Cancelled,
            Err(e) => archive_failed(e.to_string()),
        }
    }

    async fn stream(
        &self,
        image: &str,
        script: &str,
        workdir: Option<&Path>,
        op: &OperationHandle,
        batch: &CancellationToken,
    ) -> std::io::Result<StreamEnd> {
        let mut command = shell_command(script);
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }
        let stream = process::spawn_stream(command, batch.clone(), ())?;
        Ok(stream
            .forward(|line| {
                op.log(format!("[{}] {}", image, line.text()));
            })
            .await)
    }
}
