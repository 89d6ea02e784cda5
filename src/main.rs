//! CLI for PopMQ
//!
//! Subcommands:
//! - `server`: run the STOMP broker
//! - `produce`: send numbered messages to a destination (smoke test)
//! - `consume`: print messages from a destination until idle

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use popmq::broker::Broker;
use popmq::client::StompClient;
use popmq::config::load_config;
use popmq::transport::start_server;
use popmq::utils::logging;
use tokio::sync::Mutex;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "popmq")]
enum Command {
    /// Start the STOMP server
    Server,
    /// Send `count` messages to a destination
    Produce {
        /// Broker address (default: the configured server address)
        #[arg(long)]
        addr: Option<String>,
        #[arg(long)]
        destination: String,
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    /// Print messages from a destination until it stays idle
    Consume {
        /// Broker address (default: the configured server address)
        #[arg(long)]
        addr: Option<String>,
        #[arg(long)]
        destination: String,
        /// Acknowledge each message explicitly instead of using auto-ack
        #[arg(long)]
        client_ack: bool,
        /// Stop after this many milliseconds without a message
        #[arg(long, default_value_t = 1000)]
        idle_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&config.log.level);

    let default_addr = config.server.addr();
    let result = match cmd {
        Command::Server => run_server(config).await,
        Command::Produce {
            addr,
            destination,
            count,
        } => run_producer(&addr.unwrap_or(default_addr), &destination, count).await,
        Command::Consume {
            addr,
            destination,
            client_ack,
            idle_ms,
        } => {
            let addr = addr.unwrap_or(default_addr);
            run_consumer(&addr, &destination, client_ack, Duration::from_millis(idle_ms)).await
        }
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_server(config: popmq::config::Settings) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config.server.addr();
    let broker = Arc::new(Mutex::new(Broker::from_settings(&config.broker)));
    info!(data_dir = %config.broker.data_dir.display(), "starting broker");

    tokio::select! {
        res = start_server(&addr, broker, config.server.clone()) => {
            res?;
            error!("STOMP server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    Ok(())
}

async fn run_producer(
    addr: &str,
    destination: &str,
    count: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = StompClient::connect(addr).await?;
    for i in 0..count {
        client.send(destination, format!("message {i}")).await?;
    }
    info!(destination, count, "sent");
    client.disconnect().await?;
    Ok(())
}

async fn run_consumer(
    addr: &str,
    destination: &str,
    client_ack: bool,
    idle: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = StompClient::connect(addr).await?;
    client.subscribe(destination, !client_ack).await?;

    let mut received = 0usize;
    while let Some(frame) = client.next_frame(idle).await? {
        println!(
            "{}: {}",
            frame.get("destination").unwrap_or_default(),
            String::from_utf8_lossy(&frame.body)
        );
        received += 1;
        if client_ack {
            if let Some(message_id) = frame.get("message-id") {
                let message_id = message_id.to_string();
                client.ack(&message_id).await?;
            }
        }
    }

    info!(destination, received, "idle, disconnecting");
    client.disconnect().await?;
    Ok(())
}
