use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Diagnostics go to stderr so they never mix with command output.
///
/// Level is read from `IMGPRINT_LOG` (e.g. `IMGPRINT_LOG=debug`), defaulting
/// to `default_level`.
pub fn init(default_level: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_env("IMGPRINT_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()?;

    Ok(())
}
