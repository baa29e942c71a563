//! Process-wide logging setup.
//!
//! The library only talks to the `log` facade; binaries (and tests that want
//! output) call [`init_logging`] once to install `env_logger`. `RUST_LOG`
//! overrides the default filter.

use env_logger::{Builder, Env};
use once_cell::sync::OnceCell;

static LOGGING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Default filter for the given verbosity.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

/// Install the global logger. Later calls are no-ops.
pub fn init_logging(verbose: bool) {
    LOGGING_INITIALIZED.get_or_init(|| {
        let env = Env::default().default_filter_or(default_filter(verbose));
        if let Err(e) = Builder::from_env(env).try_init() {
            // Another logger was installed by the embedding application.
            eprintln!("vrambatch: logger already set: {}", e);
        }
    });
}

/// Logger for tests: captured output, ignores repeated calls.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_logging(false);
        init_logging(true);
        assert!(LOGGING_INITIALIZED.get().is_some());
    }

    #[test]
    fn filter_follows_verbosity() {
        assert_eq!(default_filter(true), "debug");
        assert_eq!(default_filter(false), "info");
    }
}
