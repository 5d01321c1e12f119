//! Tracing initialization and terminal colour policy.
//!
//! Both binaries log through `tracing` with an `EnvFilter` (`RUST_LOG`,
//! default `info`). Colour follows the usual CLI conventions: an explicit
//! choice wins, otherwise `NO_COLOR` or `EMACS` disable it and a TTY
//! enables it.

use anyhow::Result;
use std::env;
use tracing_subscriber::{fmt, EnvFilter};

/// When to emit ANSI colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorWhen {
    /// Colour only on an interactive terminal.
    #[default]
    Auto,
    Always,
    Never,
}

impl ColorWhen {
    // ---
    /// Resolves the policy against explicit environment facts.
    pub fn resolve(self, no_color: bool, emacs: bool, is_tty: bool) -> bool {
        // ---
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => !no_color && !emacs && is_tty,
        }
    }

    /// Whether log output on stderr should be coloured.
    pub fn should_color_stderr(self) -> bool {
        // ---
        self.resolve(
            env::var_os("NO_COLOR").is_some(),
            env::var_os("EMACS").is_some(),
            atty::is(atty::Stream::Stderr),
        )
    }
}

/// Initialize the global tracing subscriber.
///
/// # Errors
///
/// Returns error if a global subscriber is already installed.
pub fn init_tracing(color: ColorWhen) -> Result<()> {
    // ---
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(env_filter)
        .with_ansi(color.should_color_stderr())
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_auto_needs_tty() {
        // ---
        assert!(ColorWhen::Auto.resolve(false, false, true));
        assert!(!ColorWhen::Auto.resolve(false, false, false));
    }

    #[test]
    fn test_auto_respects_no_color_and_emacs() {
        // ---
        assert!(!ColorWhen::Auto.resolve(true, false, true));
        assert!(!ColorWhen::Auto.resolve(false, true, true));
    }

    #[test]
    fn test_explicit_choice_wins() {
        // ---
        assert!(ColorWhen::Always.resolve(true, true, false));
        assert!(!ColorWhen::Never.resolve(false, false, true));
    }
}
