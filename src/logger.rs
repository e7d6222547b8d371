//! Console logging through tracing. `BENCHSWEEP_LOG` overrides the level
//! (`debug`, `trace`, or any env-filter directive).

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_env("BENCHSWEEP_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
