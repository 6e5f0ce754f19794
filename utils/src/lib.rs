use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rand::{thread_rng, Rng, RngCore};
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info";

/// Generates `length` bytes of random binary data.
///
/// # Examples
///
/// ```
/// let payload = utils::random_payload(10_000);
/// assert_eq!(payload.len(), 10_000);
/// ```
pub fn random_payload(length: usize) -> Bytes {
    let mut buffer = vec![0u8; length];
    thread_rng().fill_bytes(&mut buffer);
    Bytes::from(buffer)
}

/// Picks a random duration in `[min_ms, max_ms]` milliseconds, used to
/// simulate per-message workload.
pub fn random_delay(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(thread_rng().gen_range(min_ms..=max_ms))
}

/// Utility function for getting current time as duration since UNIX_EPOCH.
///
/// # Examples
///
/// ```
/// let now = utils::current_time_duration();
/// assert!(now.as_secs() > 0);
/// ```
pub fn current_time_duration() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
}

/// Installs the global compact `fmt` subscriber filtered by `RUST_LOG`
/// (`info` when unset). Logs go to stderr so they never mix with program
/// output on stdout. Calling it twice is a no-op.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing::subscriber::set_global_default(log_subscriber(filter, std::io::stderr));
}

fn log_subscriber<W>(filter: EnvFilter, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_writer(writer)
        .finish()
}
