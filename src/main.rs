use anyhow::{anyhow, bail, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use dockflow::config::ConfigManager;
use dockflow::inventory::{self, DeployContext};
use dockflow::ops::build::{
    archive_file_name, BuildCoordinator, BuildOptions, BuildRecord, BuildSpec,
};
use dockflow::ops::context::build_template_context;
use dockflow::ops::deploy::{DeployPlan, Deployer, FailoverPolicy};
use dockflow::ops::lock::{default_holder, DeployLock, LockInfo, SwarmLockStore};
use dockflow::ops::monitor::Monitor;
use dockflow::ops::operation::{
    run_operation, OperationEvent, OperationHandle, OperationKind, OperationRegistry,
    OperationStatus,
};
use dockflow::ops::process::{OutputLine, StreamEnd};
use dockflow::ops::resolve::{ResolvedDeployment, ResolvedServer, ServerResolver};
use dockflow::ops::shell::{ConnectionInfo, Shell};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

fn cli() -> Command {
    let env_arg = || Arg::new("environment").required(true).help("Environment tag");
    let server_arg = || Arg::new("server").required(true).help("Server name");
    let holder_arg = || {
        Arg::new("holder")
            .long("holder")
            .help("Lock holder (defaults to the CI run or user@host:pid)")
    };

    Command::new("dockflow")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Docker Swarm deployments over SSH")
        .subcommand_required(true)
        .arg(
            Arg::new("debug")
                .long("debug")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Verbose logging"),
        )
        .arg(
            Arg::new("env")
                .long("env")
                .global(true)
                .action(ArgAction::Append)
                .value_name("KEY=VALUE")
                .help("Extra env variable, wins over .env"),
        )
        .subcommand(
            Command::new("servers")
                .about("List the resolved servers of an environment")
                .arg(env_arg()),
        )
        .subcommand(
            Command::new("context")
                .about("Print the template context for one server")
                .arg(env_arg())
                .arg(server_arg())
                .arg(
                    Arg::new("inventory")
                        .long("inventory")
                        .action(ArgAction::SetTrue)
                        .help("Write the Ansible deploy context instead"),
                )
                .arg(
                    Arg::new("output")
                        .long("output")
                        .short('o')
                        .help("Deploy context path"),
                ),
        )
        .subcommand(
            Command::new("exec")
                .about("Run a command on a server")
                .arg(env_arg())
                .arg(server_arg())
                .arg(
                    Arg::new("command")
                        .required(true)
                        .num_args(1..)
                        .trailing_var_arg(true)
                        .allow_hyphen_values(true),
                ),
        )
        .subcommand(
            Command::new("ssh")
                .about("Open an interactive shell on a server")
                .arg(env_arg())
                .arg(server_arg()),
        )
        .subcommand(
            Command::new("lock")
                .about("Inspect or manage the deploy lock")
                .subcommand_required(true)
                .subcommand(Command::new("status").arg(env_arg()))
                .subcommand(Command::new("acquire").arg(env_arg()).arg(holder_arg()))
                .subcommand(Command::new("release").arg(env_arg()).arg(holder_arg()))
                .subcommand(
                    Command::new("force-release")
                        .about("Drop the lock whoever holds it")
                        .arg(env_arg()),
                ),
        )
        .subcommand(
            Command::new("build")
                .about("Build and archive the configured images")
                .arg(
                    Arg::new("build-only")
                        .long("build-only")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("fail-fast")
                        .long("fail-fast")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("jobs")
                        .short('j')
                        .long("jobs")
                        .value_parser(clap::value_parser!(usize)),
                ),
        )
        .subcommand(
            Command::new("deploy")
                .about("Build, ship and deploy the stack")
                .arg(env_arg())
                .arg(
                    Arg::new("skip-build")
                        .long("skip-build")
                        .action(ArgAction::SetTrue)
                        .help("Reuse archives from the last build"),
                )
                .arg(holder_arg()),
        )
        .subcommand(
            Command::new("status")
                .about("Show lock, nodes and services")
                .arg(env_arg()),
        )
        .subcommand(
            Command::new("inventory")
                .about("Ansible dynamic inventory")
                .arg(
                    Arg::new("list")
                        .long("list")
                        .action(ArgAction::SetTrue),
                )
                .arg(Arg::new("host").long("host"))
                .arg(
                    Arg::new("context")
                        .long("context")
                        .default_value(inventory::CONTEXT_FILE),
                ),
        )
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("debug"));

    match run(&matches).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("❌ {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(matches: &ArgMatches) -> Result<i32> {
    // The inventory script runs inside the Ansible container, without a project.
    if let Some(("inventory", args)) = matches.subcommand() {
        return cmd_inventory(args);
    }

    let config = load_config(matches)?;
    let resolver = ServerResolver::new(config.servers.clone(), config.overlay.clone());

    match matches.subcommand() {
        Some(("servers", args)) => cmd_servers(&resolver, arg(args, "environment")?),
        Some(("context", args)) => cmd_context(&resolver, args),
        Some(("exec", args)) => cmd_exec(&resolver, args).await,
        Some(("ssh", args)) => {
            let (_, info) = server_connection(
                &resolver,
                arg(args, "environment")?,
                arg(args, "server")?,
            )?;
            Ok(Shell::shell(&info).await?)
        }
        Some(("lock", args)) => cmd_lock(&config, &resolver, args).await,
        Some(("build", args)) => {
            let options = build_options(
                &config,
                args.get_flag("build-only"),
                args.get_flag("fail-fast"),
                args.get_one::<usize>("jobs").copied(),
            );
            let registry = OperationRegistry::new();
            let records = run_build(&config, options, &registry).await?;
            Ok(if records.iter().all(BuildRecord::succeeded) { 0 } else { 1 })
        }
        Some(("deploy", args)) => cmd_deploy(&config, resolver, args).await,
        Some(("status", args)) => cmd_status(&config, &resolver, arg(args, "environment")?).await,
        _ => Ok(0),
    }
}

fn load_config(matches: &ArgMatches) -> Result<ConfigManager> {
    let mut config = ConfigManager::discover()?;
    let pairs: Vec<String> = matches
        .get_many::<String>("env")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    config.overlay.extend_pairs(&pairs)?;
    Ok(config)
}

fn arg<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
    args.get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("Missing argument <{}>", name))
}

fn server_connection(
    resolver: &ServerResolver,
    environment: &str,
    server: &str,
) -> Result<(ResolvedServer, ConnectionInfo)> {
    let resolved = resolver
        .resolve_servers_for_environment(environment)
        .into_iter()
        .find(|s| s.name == server)
        .ok_or_else(|| anyhow!("Server '{}' not found in environment '{}'", server, environment))?;
    let info = resolver.connection_info(environment, &resolved)?;
    Ok((resolved, info))
}

/// The environment's lock, reached through its managers, active one first.
async fn swarm_lock(
    config: &ConfigManager,
    resolver: &ServerResolver,
    environment: &str,
) -> Result<DeployLock<SwarmLockStore>> {
    let deployment = probe_deployment(config, resolver, environment).await?;
    tracing::debug!(server = %deployment.manager.name, "Using manager for lock");
    let store = SwarmLockStore::for_deployment(resolver, &deployment, COMMAND_TIMEOUT)?;
    Ok(DeployLock::new(store))
}

/// The deployment with the first manager that answers as active.
async fn probe_deployment(
    config: &ConfigManager,
    resolver: &ServerResolver,
    environment: &str,
) -> Result<ResolvedDeployment> {
    let timeout = FailoverPolicy::from(&config.project.failover).probe_timeout;
    let deployment = resolver
        .resolve_deployment_with_probe(environment, |server| {
            let info = resolver.connection_info(environment, server);
            async move {
                match info {
                    Ok(info) => Shell::test_connection(&info, timeout).await,
                    Err(_) => false,
                }
            }
        })
        .await?;
    Ok(deployment)
}

fn cmd_servers(resolver: &ServerResolver, environment: &str) -> Result<i32> {
    let resolution = resolver.resolve(environment);
    if resolution.servers.is_empty() {
        println!("⚠️  No servers tagged '{}'", environment);
    } else {
        println!("🖥️  Servers for '{}':", environment);
        for server in &resolution.servers {
            println!(
                "   {:<16} {:<8} {}@{}:{}  [{}]",
                server.name,
                server.role,
                server.user,
                server.host,
                server.port,
                server.tags.join(", ")
            );
        }
    }
    for warning in &resolution.warnings {
        println!("⚠️  {}", warning);
    }
    Ok(0)
}

fn cmd_context(resolver: &ServerResolver, args: &ArgMatches) -> Result<i32> {
    let environment = arg(args, "environment")?;
    let server = arg(args, "server")?;

    if args.get_flag("inventory") {
        let (resolved, info) = server_connection(resolver, environment, server)?;
        let ctx = DeployContext::from_connection(environment, &resolved.name, &info);
        let output = args
            .get_one::<String>("output")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(inventory::CONTEXT_FILE));
        ctx.save(&output)?;
        println!("✅ Deploy context for {} written to {}", ctx.host_name(), output.display());
        return Ok(0);
    }

    let ctx = build_template_context(resolver, environment, server)?;
    println!("{}", serde_json::to_string_pretty(&ctx.to_json())?);
    Ok(0)
}

async fn cmd_exec(resolver: &ServerResolver, args: &ArgMatches) -> Result<i32> {
    let (_, info) = server_connection(
        resolver,
        arg(args, "environment")?,
        arg(args, "server")?,
    )?;
    let command = args
        .get_many::<String>("command")
        .map(|parts| parts.cloned().collect::<Vec<_>>().join(" "))
        .unwrap_or_default();

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let stream = Shell::exec_stream(&info, &command, cancel)?;
    let end = stream
        .forward(|line| match line {
            OutputLine::Stdout(text) => println!("{}", text),
            OutputLine::Stderr(text) => eprintln!("{}", text),
        })
        .await;
    match end {
        StreamEnd::Exited(code) => Ok(code),
        StreamEnd::Cancelled => {
            eprintln!("🛑 Cancelled");
            Ok(130)
        }
    }
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}

fn cancel_operation_on_ctrl_c(handle: OperationHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });
}

fn print_lock(environment: &str, info: &LockInfo) {
    match (&info.holder, info.acquired_at) {
        (Some(holder), Some(at)) if info.locked => {
            println!("🔒 '{}' locked by {} since {}", environment, holder, at.to_rfc3339())
        }
        _ => println!("🔓 '{}' is not locked", environment),
    }
}

async fn cmd_lock(config: &ConfigManager, resolver: &ServerResolver, args: &ArgMatches) -> Result<i32> {
    let (action, sub) = args
        .subcommand()
        .ok_or_else(|| anyhow!("Use 'dockflow lock --help'"))?;
    let environment = arg(sub, "environment")?;
    let holder = sub
        .try_get_one::<String>("holder")
        .ok()
        .flatten()
        .cloned()
        .unwrap_or_else(default_holder);

    let lock = swarm_lock(config, resolver, environment).await?;

    match action {
        "status" => {
            let status = lock.status(environment).await?;
            print_lock(environment, &status);
        }
        "acquire" => {
            lock.acquire(environment, &holder).await?;
            println!("🔒 Locked '{}' as {}", environment, holder);
        }
        "release" => {
            lock.release(environment, &holder).await?;
            println!("🔓 Released '{}'", environment);
        }
        "force-release" => {
            let previous = lock.force_release(environment, &default_holder()).await?;
            match previous.holder {
                Some(previous) => println!("🔓 Force-released '{}' (was held by {})", environment, previous),
                None => println!("🔓 '{}' was not locked", environment),
            }
        }
        other => bail!("Unknown lock action '{}'", other),
    }
    Ok(0)
}

fn build_options(
    config: &ConfigManager,
    build_only: bool,
    fail_fast: bool,
    jobs: Option<usize>,
) -> BuildOptions {
    let mut options = BuildOptions::new(config.artifact_dir());
    options.build_only = build_only;
    options.fail_fast = fail_fast || config.project.build.fail_fast;
    if let Some(parallelism) = jobs.or(config.project.build.parallelism) {
        options.parallelism = parallelism.max(1);
    }
    options
}

/// Print an operation's events until it ends; returns its final status.
async fn follow(handle: OperationHandle) -> OperationStatus {
    let mut subscription = handle.subscribe();
    while let Some(event) = subscription.next().await {
        match event {
            OperationEvent::Log { line } => println!("{}", line),
            OperationEvent::Done { .. } => break,
        }
    }
    handle.status()
}

async fn run_build(
    config: &ConfigManager,
    options: BuildOptions,
    registry: &OperationRegistry,
) -> Result<Vec<BuildRecord>> {
    let specs: Vec<BuildSpec> = config
        .project
        .images
        .iter()
        .map(|image| BuildSpec::from_image_config(image, &config.root))
        .collect();
    if specs.is_empty() {
        println!("⚠️  No images configured in config.yml");
        return Ok(Vec::new());
    }
    println!(
        "🔨 Building {} image(s), {} at a time...",
        specs.len(),
        options.parallelism
    );

    let coordinator = Arc::new(BuildCoordinator::new(options));
    let (records_tx, records_rx) = tokio::sync::oneshot::channel();
    let (handle, task) = run_operation(registry, OperationKind::Build, |op| async move {
        let records = coordinator.run(&specs, &op).await;
        let success = records.iter().all(BuildRecord::succeeded);
        let _ = records_tx.send(records);
        success
    })?;
    cancel_operation_on_ctrl_c(handle.clone());

    let status = follow(handle).await;
    task.await.context("Build task panicked")?;
    let records = records_rx.await.unwrap_or_default();

    let failed = records.iter().filter(|r| !r.succeeded()).count();
    match status {
        OperationStatus::Success => println!("✅ {} image(s) built", records.len()),
        OperationStatus::Cancelled => println!("🛑 Build cancelled"),
        _ => println!("❌ {} of {} build(s) failed", failed, records.len()),
    }
    Ok(records)
}

async fn cmd_deploy(config: &ConfigManager, resolver: ServerResolver, args: &ArgMatches) -> Result<i32> {
    let environment = arg(args, "environment")?.to_string();
    let holder = args
        .get_one::<String>("holder")
        .cloned()
        .unwrap_or_else(default_holder);
    let registry = OperationRegistry::new();

    let archives = if args.get_flag("skip-build") {
        existing_archives(config)?
    } else {
        let options = build_options(config, false, true, None);
        let records = run_build(config, options, &registry).await?;
        if !records.iter().all(BuildRecord::succeeded) {
            return Ok(1);
        }
        records
            .iter()
            .filter_map(|r| r.artifact().map(Path::to_path_buf))
            .collect()
    };

    let compose_file = config.compose_path();
    if !compose_file.exists() {
        bail!("Compose file not found: {}", compose_file.display());
    }

    let plan = DeployPlan {
        environment,
        stack: config.stack_name(),
        compose_file,
        archives,
        prune: config.project.prune,
        holder,
    };
    let deployer = Deployer::new(resolver, FailoverPolicy::from(&config.project.failover));

    let (handle, task) = run_operation(&registry, OperationKind::Deploy, |op| async move {
        match deployer.deploy(&plan, &op).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Deploy failed: {:?}", e);
                op.log(format!("❌ {}", e));
                false
            }
        }
    })?;
    cancel_operation_on_ctrl_c(handle.clone());

    let status = follow(handle.clone()).await;
    task.await.context("Deploy task panicked")?;
    match status {
        OperationStatus::Success => Ok(0),
        OperationStatus::Cancelled => {
            println!("🛑 Deploy cancelled");
            Ok(130)
        }
        _ => Ok(1),
    }
}

/// Archives left by a previous `dockflow build`.
fn existing_archives(config: &ConfigManager) -> Result<Vec<PathBuf>> {
    let dir = config.artifact_dir();
    let mut archives = Vec::new();
    for image in &config.project.images {
        let path = dir.join(archive_file_name(&image.name));
        if !path.exists() {
            bail!(
                "No archive for {} at {} (run 'dockflow build' first)",
                image.name,
                path.display()
            );
        }
        archives.push(path);
    }
    Ok(archives)
}

async fn cmd_status(config: &ConfigManager, resolver: &ServerResolver, environment: &str) -> Result<i32> {
    let deployment = probe_deployment(config, resolver, environment).await?;
    let manager = &deployment.manager;
    let info = resolver.connection_info(environment, manager)?;
    println!("🖥️  Manager: {} ({})", manager.name, manager.host);

    let lock = DeployLock::new(SwarmLockStore::for_deployment(
        resolver,
        &deployment,
        COMMAND_TIMEOUT,
    )?);
    print_lock(environment, &lock.status(environment).await?);

    println!("\n📡 Nodes:");
    for node in Monitor::list_nodes(&info, COMMAND_TIMEOUT).await? {
        println!(
            "   {:<20} {:<8} {:<8} {}",
            node.hostname, node.status, node.availability, node.manager_status
        );
    }

    let stack = config.stack_name();
    println!("\n🐳 Services ({}):", stack);
    let services = Monitor::list_services(&info, Some(stack.as_str()), COMMAND_TIMEOUT).await?;
    if services.is_empty() {
        println!("   (none)");
    }
    for service in services {
        let mark = if service.is_converged() { "✅" } else { "⏳" };
        println!(
            "   {} {:<28} {:<10} {:<8} {}",
            mark, service.name, service.mode, service.replicas, service.image
        );
    }
    Ok(0)
}

fn cmd_inventory(args: &ArgMatches) -> Result<i32> {
    let context = PathBuf::from(arg(args, "context")?);
    let inventory = inventory::load_inventory(&context, Path::new(inventory::KEY_FILE));
    let output = match args.get_one::<String>("host") {
        Some(host) => inventory::host_vars(&inventory, host),
        None => inventory,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(0)
}
