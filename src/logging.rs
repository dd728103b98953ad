//! `tracing` subscriber setup.

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// How chatty the harness should be when `RUST_LOG` is unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

impl Verbosity {
    /// Resolve `-v` / `-q` flags; quiet wins.
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        match (verbose, quiet) {
            (_, true) => Verbosity::Quiet,
            (true, false) => Verbosity::Verbose,
            (false, false) => Verbosity::Normal,
        }
    }

    pub fn is_normal(self) -> bool {
        self != Verbosity::Quiet
    }

    fn default_directive(self) -> &'static str {
        match self {
            Verbosity::Quiet => "error",
            Verbosity::Normal => "info",
            Verbosity::Verbose => "debug",
        }
    }
}

/// Install a stderr fmt subscriber. `RUST_LOG` overrides `verbosity`.
///
/// Calling it twice is harmless; the second subscriber is dropped.
pub fn init_logging(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.default_directive()));

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbosity == Verbosity::Verbose)
        .try_init();
}

/// Subscriber for tests: debug level, captured by the test harness.
pub fn init_test_logging() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_let_quiet_win_over_verbose() {
        assert_eq!(Verbosity::from_flags(true, true), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(true, false), Verbosity::Verbose);
        assert_eq!(Verbosity::from_flags(false, false), Verbosity::Normal);
    }

    #[test]
    fn should_tolerate_repeated_init() {
        init_test_logging();
        init_test_logging();
        tracing::info!("logging initialised twice");
    }
}
