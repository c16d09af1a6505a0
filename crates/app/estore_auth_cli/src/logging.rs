use tracing_subscriber::EnvFilter;

use crate::Error;

/// Install the stderr subscriber. `RUST_LOG` overrides the default `info`.
pub fn init() -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| Error::Custom(format!("logging: {e}")))
}
