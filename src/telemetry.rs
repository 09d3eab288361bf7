use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Directives appended to the fallback filter; sqlx logs every statement at info.
const QUIET_DEPS: &str = "sqlx=warn,reqwest=warn,hyper=warn";

/// Installs the global fmt subscriber on stderr, so binaries can print JSON on stdout.
/// `RUST_LOG` wins over `default_filter` when set.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback_directives(default_filter)))?;

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

fn fallback_directives(default_filter: &str) -> String {
    if default_filter.trim().is_empty() {
        return QUIET_DEPS.to_string();
    }
    format!("{default_filter},{QUIET_DEPS}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_keeps_dependencies_quiet() {
        assert_eq!(
            fallback_directives("info"),
            "info,sqlx=warn,reqwest=warn,hyper=warn"
        );
        assert_eq!(fallback_directives(" "), QUIET_DEPS);
        assert!(EnvFilter::try_new(fallback_directives("igdb=debug")).is_ok());
    }
}
