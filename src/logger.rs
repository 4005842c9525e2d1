use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub trait Logger {
    fn info(&self, message: String) -> ();
    fn error(&self, message: String) -> ();
}

/// Forwards to the global `tracing` subscriber.
#[derive(Default, Clone)]
pub struct TracingLogger;
impl Logger for TracingLogger {
    fn info(&self, message: String) -> () {
        tracing::info!("{}", message);
    }

    fn error(&self, message: String) -> () {
        tracing::error!("{}", message);
    }
}

#[derive(Default, Clone)]
pub struct NoopLogger;
impl Logger for NoopLogger {
    fn info(&self, _message: String) -> () {
        ();
    }

    fn error(&self, _message: String) -> () {
        ();
    }
}

/// Installs the stderr subscriber. `RUST_LOG` wins, otherwise `info`.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .try_init();
}
