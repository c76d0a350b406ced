//! Logging setup for binaries and tools embedding the pipeline.

#[cfg(feature = "trace")]
pub mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{Layer, Registry};

    /// Installs the global subscriber.
    ///
    /// `RUST_LOG` overrides `level`. Output is pretty-printed unless
    /// `CHUNKFLOW_LOG_FORMAT=json` or `json` is set; `CHUNKFLOW_LOG_TO_STDERR`
    /// redirects it and `CHUNKFLOW_DISABLE_LOGS` turns it off.
    pub fn init_tracer(level: Option<LevelFilter>, json: bool) -> anyhow::Result<()> {
        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(level.unwrap_or(default_filter).into())
            .from_env_lossy();

        use tracing_subscriber::layer::SubscriberExt;

        if std::env::var("CHUNKFLOW_DISABLE_LOGS").is_ok() {
            return Ok(());
        }
        let to_stderr = std::env::var("CHUNKFLOW_LOG_TO_STDERR").is_ok();
        let use_json = json
            || std::env::var("CHUNKFLOW_LOG_FORMAT")
                .map(|v| v.to_lowercase() == "json")
                .unwrap_or(false);
        let with_location = cfg!(any(test, debug_assertions));

        let fmt_layer = match (use_json, to_stderr) {
            (true, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (true, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
            (false, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (false, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
        };

        let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| anyhow::anyhow!("error setting subscriber: {e}"))?;
        Ok(())
    }
}
