use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "GNSS_INGEST_LOG";

/// Directive used when `-v` is given; otherwise `GNSS_INGEST_LOG`, then
/// `RUST_LOG`, then `info`.
fn filter_directive(verbosity: u8, ingest_log: Option<String>, rust_log: Option<String>) -> String {
    match verbosity {
        0 => ingest_log
            .or(rust_log)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "info".to_string()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Installs the stderr subscriber. Stdout is reserved for command reports.
/// A second call is a no-op.
pub fn init(verbosity: u8) {
    let directive = filter_directive(
        verbosity,
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::filter_directive;

    #[test]
    fn verbosity_beats_environment() {
        assert_eq!(filter_directive(1, Some("warn".into()), None), "debug");
        assert_eq!(filter_directive(3, None, None), "trace");
    }

    #[test]
    fn ingest_log_wins_over_rust_log() {
        assert_eq!(
            filter_directive(0, Some("warn".into()), Some("error".into())),
            "warn"
        );
        assert_eq!(filter_directive(0, None, Some("error".into())), "error");
        assert_eq!(filter_directive(0, None, None), "info");
    }
}
