//! Cross-module scenarios: resolution feeding contexts, lock contention,
//! operation lifecycles and build batches.

#[cfg(test)]
mod resolution_tests {
    use crate::config::env::Overlay;
    use crate::config::{EnvMap, ServerRole, ServersFile};
    use crate::error::ResolutionError;
    use crate::ops::resolve::ServerResolver;

    const SERVERS: &str = r#"
defaults:
  user: deploy
  port: 22
servers:
  m1:
    host: 10.0.0.1
    tags: [production]
  w1:
    host: 10.0.0.2
    role: worker
    tags: [production]
env:
  all:
    LOG_LEVEL: info
  production:
    LOG_LEVEL: warn
"#;

    fn resolver(yaml: &str, overlay: &[(&str, &str)]) -> ServerResolver {
        let variables: EnvMap = overlay
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerResolver::new(
            ServersFile::from_yaml(yaml).unwrap(),
            Overlay::from_variables(variables),
        )
    }

    #[test]
    fn test_environment_layer_beats_all() {
        let servers = resolver(SERVERS, &[]).resolve_servers_for_environment("production");
        assert_eq!(servers.len(), 2);
        for server in &servers {
            assert_eq!(server.env["LOG_LEVEL"], "warn");
            assert_eq!(server.user, "deploy");
            assert_eq!(server.port, 22);
        }
        assert_eq!(servers[0].name, "m1");
        assert_eq!(servers[1].role, ServerRole::Worker);
    }

    #[test]
    fn test_layers_fold_in_order() {
        let yaml = r#"
servers:
  api:
    host: api.internal
    tags: [production, eu]
    env:
      C: server
env:
  all:
    A: all
    B: all
    C: all
    D: all
  production:
    B: production
    C: production
  eu:
    B: eu
"#;
        let servers = resolver(yaml, &[("D", "overlay")]).resolve_servers_for_environment("production");
        let env = &servers[0].env;
        assert_eq!(env["A"], "all");
        assert_eq!(env["B"], "eu");
        assert_eq!(env["C"], "server");
        assert_eq!(env["D"], "overlay");
        assert_eq!(servers[0].user, "root");
    }

    #[test]
    fn test_unknown_environment_is_empty() {
        let r = resolver(SERVERS, &[]);
        assert!(r.resolve_servers_for_environment("staging").is_empty());
        assert!(matches!(
            r.resolve_deployment("staging"),
            Err(ResolutionError::NoManagerReachable { .. })
        ));
    }

    #[test]
    fn test_no_manager_only_when_no_managers() {
        let yaml = r#"
servers:
  w1:
    host: 10.0.0.2
    role: worker
    tags: [production]
"#;
        assert!(matches!(
            resolver(yaml, &[]).resolve_deployment("production"),
            Err(ResolutionError::NoManagerReachable { .. })
        ));

        let deployment = resolver(SERVERS, &[]).resolve_deployment("production").unwrap();
        assert_eq!(deployment.manager.name, "m1");
        assert_eq!(deployment.workers.len(), 1);
        assert_eq!(deployment.nodes().count(), 2);
    }

    #[tokio::test]
    async fn test_probe_picks_first_reachable_manager() {
        let yaml = r#"
servers:
  m1:
    host: 10.0.0.1
    tags: [production]
  m2:
    host: 10.0.0.2
    tags: [production]
"#;
        let deployment = resolver(yaml, &[])
            .resolve_deployment_with_probe("production", |server| {
                let up = server.name == "m2";
                async move { up }
            })
            .await
            .unwrap();
        assert_eq!(deployment.manager.name, "m2");
        let order: Vec<&str> = deployment
            .failover_order()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(order, vec!["m2", "m1"]);
    }

    #[test]
    fn test_environments_are_isolated() {
        let yaml = r#"
servers:
  prod:
    host: 10.0.0.1
    tags: [production]
  stage:
    host: 10.0.1.1
    tags: [staging]
env:
  production:
    TIER: prod
  staging:
    TIER: stage
"#;
        let r = resolver(yaml, &[]);
        let production = r.resolve_servers_for_environment("production");
        let staging = r.resolve_servers_for_environment("staging");
        assert_eq!(production.len(), 1);
        assert_eq!(production[0].env["TIER"], "prod");
        assert_eq!(staging.len(), 1);
        assert_eq!(staging[0].env["TIER"], "stage");
    }

    #[test]
    fn test_missing_host_is_dropped_with_warning() {
        let yaml = r#"
servers:
  m1:
    host: 10.0.0.1
    tags: [production]
  ghost:
    tags: [production]
"#;
        let resolution = resolver(yaml, &[]).resolve("production");
        assert_eq!(resolution.servers.len(), 1);
        assert_eq!(
            resolution.warnings,
            vec![ResolutionError::UnresolvedHost {
                server: "ghost".into(),
                override_key: "PRODUCTION_GHOST_HOST".into(),
            }]
        );
    }

    #[test]
    fn test_ci_host_override() {
        let r = resolver(SERVERS, &[("PRODUCTION_W1_HOST", "203.0.113.9")]);
        let servers = r.resolve_servers_for_environment("production");
        assert_eq!(servers[1].host, "203.0.113.9");
        assert_eq!(servers[0].host, "10.0.0.1");
    }

    #[test]
    fn test_credentials_most_specific_first() {
        let r = resolver(
            SERVERS,
            &[
                ("SSH_PRIVATE_KEY", "global-key"),
                ("PRODUCTION_M1_SSH_PRIVATE_KEY", "m1-key"),
                ("PRODUCTION_SSH_PASSWORD", "sudo-secret"),
            ],
        );
        let servers = r.resolve_servers_for_environment("production");
        match r.connection_info("production", &servers[0]).unwrap() {
            crate::ops::shell::ConnectionInfo::Key {
                private_key,
                sudo_password,
                ..
            } => {
                assert_eq!(private_key, "m1-key");
                assert_eq!(sudo_password.as_deref(), Some("sudo-secret"));
            }
            other => panic!("expected key auth, got {:?}", other),
        }
        match r.connection_info("production", &servers[1]).unwrap() {
            crate::ops::shell::ConnectionInfo::Key { private_key, .. } => {
                assert_eq!(private_key, "global-key")
            }
            other => panic!("expected key auth, got {:?}", other),
        }
    }

    #[test]
    fn test_credentials_and_host_overrides_stay_out_of_env() {
        let r = resolver(
            SERVERS,
            &[
                ("PRODUCTION_SSH_PRIVATE_KEY", "-----BEGIN SECRET KEY-----"),
                ("PRODUCTION_SSH_PASSWORD", "hunter2"),
                ("SSH_PASSWORD", "fallback"),
                ("PRODUCTION_W1_HOST", "203.0.113.9"),
                ("LOG_LEVEL", "debug"),
            ],
        );
        let servers = r.resolve_servers_for_environment("production");
        for server in &servers {
            assert_eq!(server.env.keys().collect::<Vec<_>>(), vec!["LOG_LEVEL"]);
            assert_eq!(server.env["LOG_LEVEL"], "debug");
        }
        assert_eq!(servers[1].host, "203.0.113.9");
        assert!(matches!(
            r.connection_info("production", &servers[0]).unwrap(),
            crate::ops::shell::ConnectionInfo::Key { .. }
        ));

        let ctx = crate::ops::context::build_template_context(&r, "production", "m1").unwrap();
        let rendered = serde_json::to_string(&ctx).unwrap();
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("SECRET KEY"));
        assert!(!rendered.contains("production_w1_host"));
    }

    #[test]
    fn test_password_only_and_missing_credentials() {
        let r = resolver(SERVERS, &[("PRODUCTION_SSH_PASSWORD", "pw")]);
        let servers = r.resolve_servers_for_environment("production");
        assert!(matches!(
            r.connection_info("production", &servers[0]).unwrap(),
            crate::ops::shell::ConnectionInfo::Password { .. }
        ));

        let bare = resolver(SERVERS, &[]);
        let servers = bare.resolve_servers_for_environment("production");
        assert!(matches!(
            bare.connection_info("production", &servers[0]),
            Err(ResolutionError::MissingCredentials { .. })
        ));
    }
}

#[cfg(test)]
mod context_tests {
    use crate::config::env::Overlay;
    use crate::config::ServersFile;
    use crate::error::ResolutionError;
    use crate::ops::context::build_template_context;
    use crate::ops::resolve::ServerResolver;

    fn resolver() -> ServerResolver {
        let yaml = r#"
servers:
  m1:
    host: 10.0.0.1
    tags: [production]
  m2:
    host: 10.0.0.2
    tags: [production]
  w1:
    host: 10.0.0.3
    role: worker
    tags: [production]
  s1:
    host: 10.0.1.1
    tags: [staging]
env:
  production:
    Api_Url: https://api.example.com
"#;
        ServerResolver::new(
            ServersFile::from_yaml(yaml).unwrap(),
            Overlay::from_variables(Default::default()),
        )
    }

    #[test]
    fn test_cluster_size_matches_servers() {
        let ctx = build_template_context(&resolver(), "production", "w1").unwrap();
        assert_eq!(ctx.cluster.size, ctx.servers.len());
        assert_eq!(
            ctx.cluster.size,
            ctx.cluster.manager_count + ctx.cluster.worker_count
        );
        assert_eq!(ctx.cluster.manager_count, 2);
        assert_eq!(ctx.cluster.manager_hosts, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(ctx.current.name, "w1");
        assert_eq!(ctx.current.env["api_url"], "https://api.example.com");
        assert!(!ctx.servers.contains_key("s1"));
    }

    #[test]
    fn test_context_not_found() {
        assert!(matches!(
            build_template_context(&resolver(), "qa", "m1"),
            Err(ResolutionError::NoMatchingServers { .. })
        ));
        assert!(matches!(
            build_template_context(&resolver(), "production", "s1"),
            Err(ResolutionError::ServerNotFound { .. })
        ));
    }
}

#[cfg(test)]
mod lock_tests {
    use crate::error::LockError;
    use crate::ops::lock::{DeployLock, FsLockStore, LockStore};
    use tempfile::TempDir;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_has_one_winner() {
        let dir = TempDir::new().unwrap();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = FsLockStore::new(dir.path());
            tasks.push(tokio::spawn(async move {
                let holder = format!("runner-{}", i);
                let result = DeployLock::new(store).acquire("production", &holder).await;
                (holder, result)
            }));
        }

        let mut winners = Vec::new();
        let mut seen_holders = Vec::new();
        for task in tasks {
            let (holder, result) = task.await.unwrap();
            match result {
                Ok(_) => winners.push(holder),
                Err(LockError::AlreadyLocked { holder, .. }) => seen_holders.push(holder),
                Err(e) => panic!("unexpected lock error: {}", e),
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(seen_holders.len(), 7);
        assert!(seen_holders.iter().all(|h| *h == winners[0]));

        let status = DeployLock::new(FsLockStore::new(dir.path()))
            .status("production")
            .await
            .unwrap();
        assert!(status.locked);
        assert_eq!(status.holder.as_deref(), Some(winners[0].as_str()));
    }

    #[tokio::test]
    async fn test_reacquire_by_holder_is_noop() {
        let dir = TempDir::new().unwrap();
        let lock = DeployLock::new(FsLockStore::new(dir.path()));
        let first = lock.acquire("staging", "ci-1").await.unwrap();
        let second = lock.acquire("staging", "ci-1").await.unwrap();
        assert_eq!(first.acquired_at, second.acquired_at);
    }

    #[tokio::test]
    async fn test_release_rules() {
        let dir = TempDir::new().unwrap();
        let lock = DeployLock::new(FsLockStore::new(dir.path()));

        assert!(matches!(
            lock.release("staging", "ci-1").await,
            Err(LockError::NotLocked { .. })
        ));

        lock.acquire("staging", "ci-1").await.unwrap();
        assert!(matches!(
            lock.release("staging", "ci-2").await,
            Err(LockError::NotHolder { .. })
        ));
        assert!(lock.status("staging").await.unwrap().locked);

        lock.release("staging", "ci-1").await.unwrap();
        assert!(!lock.status("staging").await.unwrap().locked);
        lock.acquire("staging", "ci-2").await.unwrap();
    }

    #[tokio::test]
    async fn test_force_release_returns_previous_holder() {
        let dir = TempDir::new().unwrap();
        let lock = DeployLock::new(FsLockStore::new(dir.path()));
        lock.acquire("production", "stuck-job").await.unwrap();

        let previous = lock.force_release("production", "operator").await.unwrap();
        assert_eq!(previous.holder.as_deref(), Some("stuck-job"));
        assert!(!lock.status("production").await.unwrap().locked);

        let again = lock.force_release("production", "operator").await.unwrap();
        assert!(!again.locked);
    }

    #[tokio::test]
    async fn test_stale_release_keeps_successors_lock() {
        let dir = TempDir::new().unwrap();
        let store = FsLockStore::new(dir.path());
        let lock = DeployLock::new(store.clone());

        lock.acquire("production", "ci-1").await.unwrap();
        let stale = store.read("production").await.unwrap().unwrap();
        lock.force_release("production", "operator").await.unwrap();
        lock.acquire("production", "ci-2").await.unwrap();

        // ci-1 finishing late must not delete ci-2's record.
        assert!(!store.remove("production", Some(&stale.token)).await.unwrap());
        let status = lock.status("production").await.unwrap();
        assert!(status.locked);
        assert_eq!(status.holder.as_deref(), Some("ci-2"));
        assert!(matches!(
            lock.release("production", "ci-1").await,
            Err(LockError::NotHolder { .. })
        ));

        let current = store.read("production").await.unwrap().unwrap();
        assert!(store.remove("production", Some(&current.token)).await.unwrap());
        assert!(!lock.status("production").await.unwrap().locked);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_environments_lock_independently() {
        let dir = TempDir::new().unwrap();
        let lock = DeployLock::new(FsLockStore::new(dir.path()));
        lock.acquire("production", "a").await.unwrap();
        lock.acquire("staging", "b").await.unwrap();
        assert!(matches!(
            lock.acquire("../production", "c").await,
            Err(LockError::InvalidEnvironment(_))
        ));
    }

    #[tokio::test]
    async fn test_with_lock_releases_afterwards() {
        let dir = TempDir::new().unwrap();
        let lock = DeployLock::new(FsLockStore::new(dir.path()));
        let value = lock
            .with_lock("production", "ci", async { 42 })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert!(!lock.status("production").await.unwrap().locked);
    }
}

#[cfg(test)]
mod operation_tests {
    use crate::ops::operation::{OperationEvent, OperationKind, OperationRegistry, OperationStatus};
    use futures::StreamExt;

    #[tokio::test]
    async fn test_cancel_yields_single_failed_done() {
        let registry = OperationRegistry::new();
        let handle = registry.start(OperationKind::Deploy).unwrap();
        handle.log("uploading");
        assert!(registry.cancel(OperationKind::Deploy));
        assert!(handle.is_cancelled());
        assert!(!handle.log("late line"));
        assert_eq!(handle.finish(true), OperationStatus::Cancelled);

        let events: Vec<_> = registry
            .attach(OperationKind::Deploy)
            .unwrap()
            .into_stream()
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                OperationEvent::Log {
                    line: "uploading".into()
                },
                OperationEvent::Done {
                    success: false,
                    cancelled: true
                },
            ]
        );
        assert!(!registry.cancel(OperationKind::Deploy));
    }

    #[tokio::test]
    async fn test_cancel_reaches_running_work() {
        let registry = OperationRegistry::new();
        let (handle, task) = crate::ops::operation::run_operation(
            &registry,
            OperationKind::Build,
            |op| async move {
                op.log("waiting");
                op.cancel_token().cancelled().await;
                op.log("ignored");
                true
            },
        )
        .unwrap();

        let mut subscription = handle.subscribe();
        assert_eq!(
            subscription.next().await,
            Some(OperationEvent::Log {
                line: "waiting".into()
            })
        );
        handle.cancel();
        assert_eq!(task.await.unwrap(), OperationStatus::Cancelled);
        assert_eq!(
            subscription.next().await,
            Some(OperationEvent::Done {
                success: false,
                cancelled: true
            })
        );
        assert_eq!(subscription.next().await, None);
    }
}

#[cfg(test)]
mod build_tests {
    use crate::ops::build::{BuildCoordinator, BuildOptions, BuildOutcome, BuildSpec};
    use crate::ops::operation::{OperationKind, OperationRegistry};
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> BuildOptions {
        let mut options = BuildOptions::new(dir.path().join("images"));
        options.build_only = true;
        options.parallelism = 2;
        options
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_batch() {
        let dir = TempDir::new().unwrap();
        let registry = OperationRegistry::new();
        let op = registry.start(OperationKind::Build).unwrap();
        let specs = vec![
            BuildSpec::new("a", "echo building a"),
            BuildSpec::new("b", "echo building b; exit 7"),
            BuildSpec::new("c", "echo building c"),
            BuildSpec::new("d", "echo building d"),
        ];

        let records = BuildCoordinator::new(options(&dir)).run(&specs, &op).await;
        assert_eq!(records.len(), 4);
        let images: Vec<&str> = records.iter().map(|r| r.image.as_str()).collect();
        assert_eq!(images, vec!["a", "b", "c", "d"]);
        assert_eq!(records.iter().filter(|r| r.succeeded()).count(), 3);
        assert!(matches!(
            records[1].outcome,
            BuildOutcome::Failed(crate::error::BuildError::BuildFailed { exit_code: 7, .. })
        ));
        assert!(op.lines().contains(&"[c] building c".to_string()));
    }

    #[tokio::test]
    async fn test_empty_and_single_batches() {
        let dir = TempDir::new().unwrap();
        let registry = OperationRegistry::new();
        let op = registry.start(OperationKind::Build).unwrap();
        let coordinator = BuildCoordinator::new(options(&dir));

        assert!(coordinator.run(&[], &op).await.is_empty());
        let records = coordinator
            .run(&[BuildSpec::new("solo", "true")], &op)
            .await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, BuildOutcome::Built);
    }

    #[tokio::test]
    async fn test_archive_step_runs_save_command() {
        let dir = TempDir::new().unwrap();
        let registry = OperationRegistry::new();
        let op = registry.start(OperationKind::Build).unwrap();
        let mut options = options(&dir);
        options.build_only = false;
        options.save_command = "touch {archive}".into();

        let records = BuildCoordinator::new(options)
            .run(&[BuildSpec::new("shop/api:2", "true")], &op)
            .await;
        let artifact = records[0].artifact().expect("archive path");
        assert!(artifact.ends_with("images/shop-api-2.tar"));
        assert!(artifact.exists());
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_the_rest() {
        let dir = TempDir::new().unwrap();
        let registry = OperationRegistry::new();
        let op = registry.start(OperationKind::Build).unwrap();
        let mut options = options(&dir);
        options.parallelism = 1;
        options.fail_fast = true;
        let specs = vec![
            BuildSpec::new("broken", "exit 1"),
            BuildSpec::new("slow", "sleep 5"),
            BuildSpec::new("quick", "true"),
        ];

        let records = BuildCoordinator::new(options).run(&specs, &op).await;
        assert!(matches!(records[0].outcome, BuildOutcome::Failed(_)));
        assert_eq!(records[1].outcome, BuildOutcome::Cancelled);
        assert_eq!(records[2].outcome, BuildOutcome::Cancelled);
        assert!(!op.is_cancelled());
    }

    #[tokio::test]
    async fn test_operation_cancel_stops_builds() {
        let dir = TempDir::new().unwrap();
        let registry = OperationRegistry::new();
        let op = registry.start(OperationKind::Build).unwrap();
        let canceller = op.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let records = BuildCoordinator::new(options(&dir))
            .run(&[BuildSpec::new("slow", "sleep 30")], &op)
            .await;
        assert_eq!(records[0].outcome, BuildOutcome::Cancelled);
    }
}
