//! Structured logging setup.
//!
//! Builds a `tracing-subscriber` filter from `LoggingConfig` and installs it
//! as the global default. Components log through the ordinary `tracing`
//! macros (`tracing::info!`, `tracing::warn!`, ...); this module only owns
//! the one-time process-wide initialization.

use crate::config::{LogFormat, LoggingConfig};

/// Build filter directives string from LoggingConfig
///
/// Constructs a tracing filter string that includes the base log level
/// and any component-specific log levels configured in the LoggingConfig.
///
/// # Examples
///
/// ```
/// use tollgate::config::LoggingConfig;
/// use tollgate::logging::build_filter_directives;
/// use std::collections::HashMap;
///
/// let mut component_levels = HashMap::new();
/// component_levels.insert("budget".to_string(), "debug".to_string());
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: tollgate::config::LogFormat::Pretty,
///     component_levels: Some(component_levels),
/// };
///
/// let filter_str = build_filter_directives(&config);
/// assert_eq!(filter_str, "info,tollgate::budget=debug");
/// ```
pub fn build_filter_directives(config: &LoggingConfig) -> String {
    let mut filter_str = config.level.clone();

    if let Some(component_levels) = &config.component_levels {
        for (component, level) in component_levels {
            filter_str.push_str(&format!(",tollgate::{}={}", component, level));
        }
    }

    filter_str
}

/// Install a global `tracing` subscriber built from `config`.
///
/// A host that already owns its own subscriber should not call this; it is
/// provided for hosts that embed Tollgate as their only observability
/// producer. Calling it twice in one process is harmless: the second call's
/// failure to install is swallowed with a debug log.
pub fn init_tracing(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_new(build_filter_directives(config))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match config.format {
        LogFormat::Pretty => fmt().with_env_filter(filter).try_init(),
        LogFormat::Json => fmt().json().with_env_filter(filter).try_init(),
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already initialized; skipping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_build_filter_directives_base_only() {
        let config = LoggingConfig {
            level: "warn".to_string(),
            format: LogFormat::Pretty,
            component_levels: None,
        };
        assert_eq!(build_filter_directives(&config), "warn");
    }

    #[test]
    fn test_build_filter_directives_with_components() {
        let mut levels = HashMap::new();
        levels.insert("policy".to_string(), "trace".to_string());
        let config = LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            component_levels: Some(levels),
        };
        assert_eq!(
            build_filter_directives(&config),
            "info,tollgate::policy=trace"
        );
    }
}
