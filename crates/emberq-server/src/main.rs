//! EmberQ Server - embedded message broker daemon
//!
//! ```text
//! emberq serve --config emberq.toml
//! emberq embedded-demo
//! emberq queue-demo --port 5445
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use emberq_core::broker::EXIT_FAILURE;
use emberq_core::{exit_code, Broker, BrokerConfig, Client};
use emberq_types::{AckMode, Error, Message};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEMO_QUEUE: &str = "exampleQueue";
const DEMO_TEXT: &str = "How to do in java dot com";
const DEMO_RECEIVE_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Parser)]
#[command(name = "emberq", version, about = "EmberQ embedded message broker")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the listener bind address
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Override the listener port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the broker until interrupted (default)
    Serve,
    /// Start the broker, report success and stop it again
    EmbeddedDemo,
    /// Send one message to exampleQueue over TCP and receive it back
    QueueDemo,
}

impl Cli {
    fn broker_config(&self) -> anyhow::Result<BrokerConfig> {
        let mut config = match &self.config {
            Some(path) => BrokerConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => BrokerConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "emberq=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            err.downcast_ref::<Error>().map_or(EXIT_FAILURE, exit_code)
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = cli.broker_config()?;
    let broker = Broker::new();

    match cli.cmd.unwrap_or(Command::Serve) {
        Command::Serve => {
            let addr = broker.start(config).await?;
            info!(address = %addr, "EmberQ listening, press Ctrl-C to stop");

            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "Failed to listen for shutdown signal");
            }
            info!("Shutdown requested");
            Ok(broker.stop().await.exit_code())
        }

        Command::EmbeddedDemo => {
            broker.start(config).await?;
            info!("EmberQ broker started successfully");
            Ok(broker.stop().await.exit_code())
        }

        Command::QueueDemo => {
            if !config.queues.iter().any(|q| q.name == DEMO_QUEUE) {
                config = config.with_queue(DEMO_QUEUE, true);
            }
            let addr = broker.start(config).await?;

            let outcome = queue_demo(addr).await;
            let code = broker.stop().await.exit_code();
            outcome?;
            Ok(code)
        }
    }
}

async fn queue_demo(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let mut client = Client::connect(addr, Some("queue-demo")).await?;
    let session = client.open_session(AckMode::Auto).await?;

    let id = client
        .send(session, DEMO_QUEUE, Message::text(DEMO_TEXT))
        .await?;
    info!(queue = DEMO_QUEUE, message_id = %id, "Sent message: {DEMO_TEXT}");

    let Some(received) = client
        .receive(session, DEMO_QUEUE, Some(DEMO_RECEIVE_TIMEOUT))
        .await?
    else {
        bail!("no message received from {DEMO_QUEUE} within {DEMO_RECEIVE_TIMEOUT:?}");
    };
    let body = received.body_as_str().unwrap_or("<binary>");
    info!(queue = DEMO_QUEUE, message_id = %received.id, "Received message: {body}");

    client.close().await?;
    Ok(())
}
