//! Provide tracing, tailored to this program.
//!
//! The binary calls [`init_stderr`] once at startup. The rest of the crate
//! uses the `tracing` macros directly, or `use crate::tracing::prelude::*`.

use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

/// Log to stderr, keeping stdout free for samples. Filtering follows the
/// environment variable RUST_LOG, overriding the default level (ERROR) to
/// INFO, or DEBUG when `verbose`.
pub fn init_stderr(verbose: bool) {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}
