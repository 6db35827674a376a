//! Logging facade
//!
//! Contract violations are reported through `error!` and the offending call is
//! skipped. Lifecycle diagnostics such as heap peaks and pool growth go to
//! `info!` and `debug!`.

pub use log::{debug, info, warn, error, trace};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "vk_execution_core=info";

fn builder() -> env_logger::Builder {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(DEFAULT_FILTER))
}

/// Install `env_logger`, honoring `RUST_LOG` and falling back to [`DEFAULT_FILTER`].
///
/// Calling it more than once is harmless. Later calls are ignored.
pub fn init() {
    if builder().try_init().is_err() {
        debug!("Logger already initialized");
    }
}

#[cfg(test)]
pub use capture::{init_for_tests, take_captured};
