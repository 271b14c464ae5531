use clap::{Parser, Subcommand};
use nas_tunnel::config::{ConfigError, DeadlinePolicy, HealthConfig};
use nas_tunnel::export::{self, ConfigExporter, ExportError, ExportRequest};
use nas_tunnel::health::{self, HealthError, KumaNotifier, Verdict};
use nas_tunnel::monitor::MonitorError;
use nas_tunnel::tunnel::{TunnelError, WgQuickController};
use nas_tunnel::{
    Config, MonitorSettings, ShutdownMonitor, TunnelController, TunnelSelector, jobs,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "nas-tunnel")]
#[command(about = "WireGuard tunnel coordination around TrueNAS replication windows")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ./nas-tunnel.toml, then the user and system config dirs)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring a WireGuard interface up if it is not up already
    Up {
        /// Interface name, resolved against the WireGuard config directory
        interface: Option<String>,
        /// Explicit WireGuard config file instead of an interface name
        #[arg(long)]
        config_file: Option<PathBuf>,
    },
    /// Wait for replication to finish, then bring the interface down
    ///
    /// Exit status: 0 settled or already down, 3 timed out, 4 job query
    /// unavailable (the interface is brought down in all three), 1 failure,
    /// 2 configuration error.
    Down {
        /// Interface name, resolved against the WireGuard config directory
        interface: Option<String>,
        /// Explicit WireGuard config file instead of an interface name
        #[arg(long)]
        config_file: Option<PathBuf>,
        /// Grace window in seconds (default: 60)
        #[arg(long)]
        timeout: Option<u64>,
        /// Polling interval in seconds (default: 5)
        #[arg(long)]
        interval: Option<u64>,
        /// Restart the grace window whenever replication activity is seen
        #[arg(long)]
        extend_on_activity: bool,
        /// Consecutive idle polls required before shutting down (default: 1)
        #[arg(long)]
        confirm_polls: Option<u32>,
    },
    /// Export the configuration database for off-box retention
    Export {
        /// Destination dataset directory, e.g. /mnt/tank/config-backups
        destination: PathBuf,
        /// Include the password encryption seed for full recovery
        #[arg(long)]
        include_secret: bool,
        /// Days to keep local exports (default: 5)
        #[arg(long)]
        retention: Option<u64>,
    },
    /// Check replication freshness and notify Uptime Kuma
    Check {
        /// Uptime Kuma base URL, e.g. kuma.example.com
        #[arg(long)]
        kuma_url: String,
        /// Uptime Kuma push token
        #[arg(long)]
        kuma_token: String,
        /// Message when replication is healthy
        #[arg(long)]
        msg_up: Option<String>,
        /// Message when replication is not up to date
        #[arg(long)]
        msg_down: Option<String>,
        /// Rolling window in hours for a replication to count as current (default: 24)
        #[arg(long)]
        window: Option<f64>,
    },
    /// Generate default config file
    Init {
        /// Where to write the config
        #[arg(long, default_value = nas_tunnel::config::CONFIG_FILE_NAME)]
        output: PathBuf,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Tunnel(#[from] TunnelError),
    #[error("{0}")]
    Monitor(#[from] MonitorError),
    #[error("{0}")]
    Export(#[from] ExportError),
    #[error("{0}")]
    Health(#[from] HealthError),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            CliError::Config(_) => EXIT_CONFIG,
            _ => EXIT_FAILURE,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Status lines go to stdout, logs to stderr
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            println!("error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Up {
            interface,
            config_file,
        } => {
            let config = Config::discover(config_path)?;
            bring_up(&config, TunnelSelector::from_args(interface, config_file)?).await
        }
        Commands::Down {
            interface,
            config_file,
            timeout,
            interval,
            extend_on_activity,
            confirm_polls,
        } => {
            let config = Config::discover(config_path)?;
            let selector = TunnelSelector::from_args(interface, config_file)?;
            let mut monitor = config.monitor.clone();
            if let Some(timeout) = timeout {
                monitor.timeout_secs = timeout;
            }
            if let Some(interval) = interval {
                monitor.interval_secs = interval;
            }
            if extend_on_activity {
                monitor.policy = DeadlinePolicy::ExtendOnActivity;
            }
            if let Some(confirm_polls) = confirm_polls {
                monitor.confirm_polls = confirm_polls;
            }
            let settings = MonitorSettings::from_config(&monitor, &config.inspector)?;
            bring_down(&config, selector, settings).await
        }
        Commands::Export {
            destination,
            include_secret,
            retention,
        } => {
            let config = Config::discover(config_path)?;
            let request = ExportRequest {
                destination,
                include_secret,
                retention_days: retention.unwrap_or(config.export.retention_days),
            };
            run_export(&config, &request)
        }
        Commands::Check {
            kuma_url,
            kuma_token,
            msg_up,
            msg_down,
            window,
        } => {
            let config = Config::discover(config_path)?;
            let mut health = config.health.clone();
            health.msg_up = msg_up.unwrap_or(health.msg_up);
            health.msg_down = msg_down.unwrap_or(health.msg_down);
            health.window_hours = window.unwrap_or(health.window_hours);
            check_replication(&config, &health, &kuma_url, &kuma_token).await
        }
        Commands::Init { output } => {
            info!("Generating default config...");
            Config::default().save(&output)?;
            println!("Created default config: {}", output.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn bring_up(config: &Config, selector: TunnelSelector) -> Result<ExitCode, CliError> {
    let handle = selector.resolve(&config.wireguard.config_dir)?;
    let tunnel = WgQuickController::new(&config.wireguard);

    info!("Establishing WireGuard connection {}", handle);
    tunnel.activate(&handle).await?;
    println!("up: {} is active", handle.interface());
    Ok(ExitCode::SUCCESS)
}

async fn bring_down(
    config: &Config,
    selector: TunnelSelector,
    settings: MonitorSettings,
) -> Result<ExitCode, CliError> {
    let handle = selector.resolve(&config.wireguard.config_dir)?;
    let inspector = jobs::from_config(&config.inspector);
    let tunnel = WgQuickController::new(&config.wireguard);

    println!("Monitoring replication activity for {}", handle);
    println!(
        "Timeout: {}s | Interval: {}s",
        settings.timeout().as_secs(),
        settings.interval().as_secs()
    );

    let report = ShutdownMonitor::new(inspector.as_ref(), &tunnel, settings)
        .run(&handle)
        .await?;

    if report.outcome.is_warning() {
        warn!("{}", report.summary(&handle));
    }
    println!("{}", report.summary(&handle));
    Ok(ExitCode::from(report.outcome.exit_code()))
}

fn run_export(config: &Config, request: &ExportRequest) -> Result<ExitCode, CliError> {
    println!("### Configuration Export ###");
    export::ensure_root()?;

    let report = ConfigExporter::new(&config.export).export(request, chrono::Local::now())?;
    println!("Exported {}", report.archive.display());
    for name in &report.missing {
        println!("  missing: {}", name);
    }
    if !report.pruned.is_empty() {
        println!("Pruned {} old export(s)", report.pruned.len());
    }
    println!("### DONE ###");
    Ok(ExitCode::SUCCESS)
}

async fn check_replication(
    config: &Config,
    health: &HealthConfig,
    kuma_url: &str,
    kuma_token: &str,
) -> Result<ExitCode, CliError> {
    let window = health::window_from_hours(health.window_hours);
    let notifier = KumaNotifier::new(
        kuma_url,
        kuma_token,
        Duration::from_secs(health.push_timeout_secs),
    )?;

    let query = health::query_tasks(&config.inspector.midclt, config.inspector.query_timeout());
    let verdict = match query.await {
        Ok(tasks) => health::evaluate(&tasks, window, chrono::Utc::now()),
        Err(e) => {
            // An unreadable task list is not evidence of health
            error!("{}", e);
            Verdict::Outdated(vec![("replication.query".to_string(), e.to_string())])
        }
    };

    let healthy = verdict.is_healthy();
    match &verdict {
        Verdict::Healthy { checked } => {
            println!("All {} enabled replication task(s) are up to date", checked);
        }
        Verdict::Outdated(outdated) => {
            println!(
                "Found outdated replications within the {}h window:",
                health.window_hours
            );
            for (name, reason) in outdated {
                println!("  - {}: {}", name, reason);
            }
        }
    }

    let msg = if healthy { &health.msg_up } else { &health.msg_down };
    if let Err(e) = notifier.notify(healthy, msg).await {
        warn!("Failed to notify Uptime Kuma: {}", e);
    }

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILURE)
    })
}
