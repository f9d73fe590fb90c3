use std::{path::PathBuf, time::Duration};

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use podkeeper::{
    Exit, Kubectl, PodRegistry, PodkeeperResult, RunConfig, ShutdownSignal, Supervisor,
    config::{PROJECT_CONFIG_FILE, default_kubeconfig, default_user_config},
    forwarding::build_requests,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

fn cli() -> Command {
    Command::new("podkeeper")
        .version(env!("CARGO_PKG_VERSION"))
        .author("akagi201")
        .about("Keeps kubectl port-forward tunnels alive across pod restarts")
        .arg(
            Arg::new("pods")
                .value_name("POD")
                .num_args(0..)
                .help("Pods to forward: name, name:port or name:port:destPort"),
        )
        .arg(
            Arg::new("kubeconfig")
                .long("kubeconfig")
                .value_name("PATH")
                .num_args(0..=1)
                .require_equals(true)
                .default_missing_value("")
                .help("kubeconfig to use; without a path, $KUBECONFIG or ~/.kube/config"),
        )
        .arg(
            Arg::new("namespace")
                .long("namespace")
                .value_name("NAME")
                .num_args(0..=1)
                .require_equals(true)
                .default_missing_value("default")
                .help("Namespace for pods that do not configure their own"),
        )
        .arg(
            Arg::new("exclude")
                .long("exclude")
                .value_name("NAMES")
                .value_delimiter(',')
                .action(ArgAction::Append)
                .help("Comma separated pods to leave out"),
        )
        .arg(
            Arg::new("health-interval")
                .long("health-interval")
                .value_name("MS")
                .value_parser(value_parser!(u64).range(1..))
                .default_value("5000")
                .help("Milliseconds between health checks"),
        )
        .arg(
            Arg::new("user-config")
                .long("user-config")
                .value_name("FILE")
                .help("User-global pod list (default ~/.podkeeper.json)"),
        )
        .arg(
            Arg::new("project-config")
                .long("project-config")
                .value_name("FILE")
                .help("Project-local pod list (default ./podkeeper.json)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Increase logging verbosity"),
        )
}

fn run_config(matches: &ArgMatches) -> RunConfig {
    let kubeconfig = matches
        .get_one::<String>("kubeconfig")
        .and_then(|path| match path.as_str() {
            "" => default_kubeconfig(),
            path => Some(PathBuf::from(path)),
        });

    let health_interval = matches
        .get_one::<u64>("health-interval")
        .copied()
        .unwrap_or(5000);

    RunConfig {
        kubeconfig,
        namespace: matches.get_one::<String>("namespace").cloned(),
        health_interval: Duration::from_millis(health_interval),
        ..RunConfig::default()
    }
}

async fn run(matches: &ArgMatches) -> PodkeeperResult<Exit> {
    let config = run_config(matches);

    let user_path = matches
        .get_one::<String>("user-config")
        .map(PathBuf::from)
        .or_else(default_user_config);
    let project_path = matches
        .get_one::<String>("project-config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
    let registry = PodRegistry::load(user_path.as_deref(), &project_path)?;

    let tokens: Vec<String> = matches
        .get_many::<String>("pods")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let excluded: Vec<String> = matches
        .get_many::<String>("exclude")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();

    let specs = build_requests(&tokens, &excluded, &registry)?;

    if let Some(namespace) = &config.namespace {
        info!("Namespace: {}", namespace);
    }
    for spec in &specs {
        info!("Pod: {}", spec);
    }

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if let Err(e) = forward_signals(shutdown_tx).await {
            warn!("Failed to install signal handlers: {}", e);
        }
    });

    let mut supervisor = Supervisor::new(
        config.clone(),
        Kubectl::new(config.clone()),
        Kubectl::new(config),
        specs,
    );
    info!("Starting tunnels. Press Ctrl+C to stop.");
    supervisor.run(shutdown_rx).await
}

/// Deliver the first termination signal to the supervisor
#[cfg(unix)]
async fn forward_signals(tx: mpsc::Sender<ShutdownSignal>) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let received = tokio::select! {
        _ = hangup.recv() => ShutdownSignal::Hangup,
        _ = interrupt.recv() => ShutdownSignal::Interrupt,
        _ = terminate.recv() => ShutdownSignal::Terminate,
    };

    let _ = tx.send(received).await;
    Ok(())
}

#[cfg(not(unix))]
async fn forward_signals(tx: mpsc::Sender<ShutdownSignal>) -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    let _ = tx.send(ShutdownSignal::Interrupt).await;
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let matches = cli().get_matches();

    // Initialize logging
    podkeeper::init_logging(matches.get_count("verbose"))?;

    let code = match run(&matches).await {
        Ok(exit) => {
            info!("Shutdown complete");
            exit.exit_code()
        }
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    };

    std::process::exit(code);
}
