use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use fbcontrol::bridge::DEFAULT_MAX_FRAME_LEN;
use fbcontrol::{
    ControllerClient, ControllerConfig, FeedbackController, FeedbackLauncher, FeedbackRegistry,
    InProcessLauncher, NetworkConfig, SignalData, SubprocessLauncher, SupervisorConfig,
    run_feedback_worker,
};

mod bench;

#[derive(Parser)]
#[command(name = "fbcontrol")]
#[command(version, about = "BCI feedback controller and client")]
struct Cli {
    /// Controller host (defaults to FB_HOST or 127.0.0.1)
    #[arg(long, global = true)]
    host: Option<IpAddr>,

    /// Controller port (defaults to FB_CONTROLLER_PORT or 12345)
    #[arg(long, global = true)]
    controller_port: Option<u16>,

    /// Reply port (defaults to FB_CLIENT_PORT or 12346)
    #[arg(long, global = true)]
    client_port: Option<u16>,

    /// How long clients wait for a reply, in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the feedback controller
    Serve {
        /// Milliseconds a feedback may take to initialize
        #[arg(long)]
        start_timeout_ms: Option<u64>,

        /// Milliseconds to wait at each step of stopping a feedback
        #[arg(long)]
        stop_timeout_ms: Option<u64>,

        /// Run feedbacks on tasks inside the controller instead of subprocesses
        #[arg(long)]
        in_process: bool,
    },
    /// Host one feedback over stdin/stdout (spawned by the controller)
    #[command(hide = true)]
    Worker {
        name: String,

        #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
        max_frame_len: usize,
    },
    /// List the feedbacks the controller can load
    List,
    /// Load a feedback
    Init { name: String },
    Play,
    Pause,
    Stop,
    Quit,
    /// Stop the feedback and shut the controller down
    Shutdown,
    /// Print the running feedback's variables
    Variables,
    /// Send an interaction signal with the given JSON object as data
    Interaction { data: String },
    /// Send a control signal with the given JSON object as data
    Control { data: String },
    /// Measure controller-to-feedback latency with BenchmarkFeedback
    Bench {
        /// Number of control signals to send; at most what one variables reply can carry
        #[arg(long, default_value_t = 1000)]
        packets: u32,

        /// Send rate in Hz; 0 sends as fast as possible
        #[arg(long, default_value_t = 0.0)]
        hz: f64,
    },
}

/// Initialize tracing with FB_LOG, FB_FEEDBACK_LOG and LOG_FORMAT support.
///
/// Always writes to stderr: a worker's stdout is its process channel.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = |var: &str| match std::env::var(var).as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        let base = level("FB_LOG");
        let feedback = if std::env::var("FB_FEEDBACK_LOG").is_ok() {
            level("FB_FEEDBACK_LOG")
        } else {
            base
        };
        EnvFilter::new(format!("fbcontrol={base},fbcontrol::feedback={feedback}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

impl Cli {
    fn network(&self) -> Result<NetworkConfig> {
        let mut network = NetworkConfig::from_env()?;
        if let Some(host) = self.host {
            network = network.with_host(host);
        }
        if let Some(port) = self.controller_port {
            network = network.with_controller_port(port);
        }
        if let Some(port) = self.client_port {
            network = network.with_client_port(port);
        }
        if let Some(ms) = self.timeout_ms {
            network = network.with_receive_timeout(Duration::from_millis(ms));
        }
        Ok(network)
    }

    async fn client(&self) -> Result<ControllerClient> {
        let network = self.network()?;
        ControllerClient::connect(&network)
            .await
            .with_context(|| format!("Failed to bind reply port {}", network.client_port))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve {
            start_timeout_ms,
            stop_timeout_ms,
            in_process,
        } => {
            let mut supervisor = SupervisorConfig::from_env()?;
            if let Some(ms) = start_timeout_ms {
                supervisor = supervisor.with_start_timeout(Duration::from_millis(*ms));
            }
            if let Some(ms) = stop_timeout_ms {
                supervisor = supervisor.with_stop_timeout(Duration::from_millis(*ms));
            }
            let config = ControllerConfig::default()
                .with_network(cli.network()?)
                .with_supervisor(supervisor);
            serve(config, *in_process).await?;
        }
        Commands::Worker {
            name,
            max_frame_len,
        } => {
            let registry = FeedbackRegistry::with_builtin();
            run_feedback_worker(
                &registry,
                name,
                tokio::io::stdin(),
                tokio::io::stdout(),
                *max_frame_len,
            )
            .await
            .with_context(|| format!("Feedback worker {name} failed"))?;
        }
        Commands::List => {
            let client = cli.client().await?;
            let Some(names) = client.get_available_feedbacks().await? else {
                bail!("No answer from controller at {}", client.controller_addr());
            };
            for name in names {
                println!("{name}");
            }
        }
        Commands::Init { name } => cli.client().await?.send_init(name).await?,
        Commands::Play => cli.client().await?.play().await?,
        Commands::Pause => cli.client().await?.pause().await?,
        Commands::Stop => cli.client().await?.stop().await?,
        Commands::Quit => cli.client().await?.quit().await?,
        Commands::Shutdown => cli.client().await?.quit_controller().await?,
        Commands::Variables => {
            let client = cli.client().await?;
            let Some(vars) = client.get_variables().await? else {
                bail!("No answer from controller at {}", client.controller_addr());
            };
            println!("{}", serde_json::to_string_pretty(&vars)?);
        }
        Commands::Interaction { data } => {
            cli.client().await?.send_interaction(parse_data(data)?).await?;
        }
        Commands::Control { data } => {
            cli.client().await?.send_control(parse_data(data)?).await?;
        }
        Commands::Bench { packets, hz } => {
            let client = cli.client().await?;
            let stats = bench::run(&client, *packets, *hz).await?;
            println!("{stats}");
        }
    }

    Ok(())
}

async fn serve(config: ControllerConfig, in_process: bool) -> Result<()> {
    let registry = FeedbackRegistry::with_builtin();
    let launcher: Arc<dyn FeedbackLauncher> = if in_process {
        Arc::new(InProcessLauncher::new(registry.clone()))
    } else {
        Arc::new(SubprocessLauncher::current_exe().context("Cannot locate own executable")?)
    };

    let controller = FeedbackController::bind(config, launcher, registry).await?;
    let handle = controller.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received SIGINT, shutting down...");
            handle.shutdown();
        }
    });

    controller.run().await;
    Ok(())
}

fn parse_data(raw: &str) -> Result<SignalData> {
    serde_json::from_str::<SignalData>(raw).with_context(|| format!("Expected a JSON object, got {raw:?}"))
}
