use std::time::Duration;

use clap::Parser;
use experiments::MessageSender;
use internals::{Destination, Headers};
use stomp::ConnectionFactory;
use tracing::info;

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// `tcp://host:port` or a `failover:(...)` URL
    #[arg(long)]
    broker_url: String,
    /// `/queue/NAME` or `/topic/NAME`
    #[arg(long)]
    destination: Destination,
    #[arg(long, default_value_t = 1)]
    messages: usize,
    #[arg(long, default_value_t = 10_000)]
    payload_bytes: usize,
    #[arg(long, default_value_t = 30_000)]
    time_to_live_ms: u64,
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
    #[arg(long, default_value = "Message")]
    label: String,
}

async fn run_producer(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let factory = ConnectionFactory::from_url(&args.broker_url)?;
    let sender = MessageSender::new(args.payload_bytes, Duration::from_millis(args.time_to_live_ms));
    let headers: Headers = args.headers.into_iter().collect();

    info!(messages_to_produce=%args.messages, destination=%args.destination, "producing messages");
    for n in 1..=args.messages {
        let correlation_id = format!("{} - {}", args.label, n);
        sender
            .send(&factory, &args.destination, &correlation_id, Some(&headers))
            .await?;
        if args.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
        }
    }

    info!("produced all messages");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    utils::init_tracing();
    let args = Args::parse();

    run_producer(args).await?;

    info!("exiting producer");
    Ok(())
}
