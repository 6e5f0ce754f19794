use clap::{Parser, ValueEnum};
use internals::{Destination, ReceivedMessage};
use stomp::{Connection, ConnectionFactory, Consumer, ConsumerOptions, SessionMode};
use tracing::info;

#[derive(Clone, ValueEnum, Debug, PartialEq)]
enum AckMethod {
    Auto,
    Client,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long)]
    broker_url: String,

    #[arg(long)]
    source: Destination,

    /// e.g. `service = 'A'`
    #[arg(long)]
    selector: Option<String>,

    #[arg(long)]
    prefetch: Option<u32>,

    #[arg(long, value_enum, default_value_t = AckMethod::Auto)]
    ack: AckMethod,

    #[arg(long, default_value_t = 0)]
    min_delay_ms: u64,

    #[arg(long, default_value_t = 0)]
    max_delay_ms: u64,

    /// Stop after this many messages; runs until interrupted otherwise
    #[arg(long)]
    count: Option<usize>,
}

fn describe(message: &ReceivedMessage) -> String {
    let mut line = format!(
        "processed message \"{}\"",
        message.correlation_id.as_deref().unwrap_or_default()
    );
    for (key, value) in &message.headers {
        line.push_str(&format!("; {} = {}", key, value));
    }
    line
}

async fn consume(
    args: &Args,
    consumer: &mut Consumer,
    broker: &str,
) -> Result<usize, Box<dyn std::error::Error>> {
    let mut consumed = 0;
    while args.count.map_or(true, |count| consumed < count) {
        let message = tokio::select! {
            message = consumer.recv() => message?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        };
        let Some(message) = message else {
            info!("connection closed by broker");
            break;
        };

        // simulate workload
        tokio::time::sleep(utils::random_delay(args.min_delay_ms, args.max_delay_ms)).await;
        println!("Consumer ({}) {}", broker, describe(&message));
        consumer.acknowledge(&message).await?;
        consumed += 1;
    }
    Ok(consumed)
}

async fn run_consumer(
    args: Args,
    connection: &Connection,
) -> Result<(), Box<dyn std::error::Error>> {
    let mode = match args.ack {
        AckMethod::Auto => SessionMode::AutoAcknowledge,
        AckMethod::Client => SessionMode::ClientAcknowledge,
    };
    let mut options = ConsumerOptions::default();
    if let Some(selector) = &args.selector {
        options = options.selector(selector.clone());
    }
    if let Some(prefetch) = args.prefetch {
        options = options.prefetch(prefetch);
    }

    let session = connection.create_session(mode).await?;
    let mut consumer = session.create_consumer_with(&args.source, options).await?;
    connection.start();
    println!("Consuming...");

    let broker = connection.endpoint().to_string();
    let consumed = consume(&args, &mut consumer, &broker).await;

    let closed = consumer.close().await;
    session.close().await?;
    closed?;
    let consumed = consumed?;
    info!(consumed, "consumer stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    utils::init_tracing();
    let args = Args::parse();

    let factory = ConnectionFactory::from_url(&args.broker_url)?;
    let connection = factory.create_connection().await?;
    info!(endpoint=%connection.endpoint(), "connected");

    let result = run_consumer(args, &connection).await;
    connection.close().await?;
    result
}
