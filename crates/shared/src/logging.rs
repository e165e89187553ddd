use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_DIRECTIVES: &str = "info,btleplug=warn,bluer=warn,solana_client=warn";
const DEFAULT_PRETTY_DIRECTIVES: &str = "debug,btleplug=warn,bluer=warn,solana_client=warn";

/// Initialize logging with structured JSON output
///
/// Respects `RUST_LOG`; falls back to info level with the radio and RPC stacks quietened.
pub fn init_logging() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    tracing::info!("Logging initialized");
    Ok(())
}

/// Initialize logging with pretty output for development
pub fn init_logging_pretty() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_PRETTY_DIRECTIVES));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .pretty();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    tracing::info!("Logging initialized (pretty mode)");
    Ok(())
}

/// Pick the output format from `LOG_FORMAT` (`pretty` or `json`, default json)
pub fn init_from_env() -> anyhow::Result<()> {
    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("pretty") => init_logging_pretty(),
        _ => init_logging(),
    }
}
