//! Logging and tracing infrastructure.
//!
//! Structured logging via the tracing crate, with a human-readable and a
//! JSON output format. Filtering comes from `RUST_LOG` (default `info`).

use std::sync::Once;
use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

static INIT: Once = Once::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the global tracing subscriber.
///
/// This should be called once at program startup.
/// Subsequent calls are ignored.
pub fn init_tracing() {
    INIT.call_once(|| {
        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);

        // Another subscriber may already be installed (e.g. by a test harness).
        let _ = tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt_layer)
            .try_init();

        info!("objlens tracing initialized");
    });
}

/// Initialize tracing with JSON output for structured logging.
pub fn init_tracing_json() {
    INIT.call_once(|| {
        let fmt_layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_thread_ids(true)
            .with_current_span(true);

        let _ = tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt_layer)
            .try_init();

        info!("objlens tracing initialized (JSON mode)");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing::{debug, warn};

    use crate::error::ObjlensError;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_init_tracing_once() {
        init_tracing();
        init_tracing();
        init_tracing_json();
    }

    #[test]
    fn test_structured_logging() {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = tracing_subscriber::fmt::Subscriber::builder()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();

        let symbol = "main.main";
        tracing::subscriber::with_default(subscriber, || {
            debug!(symbol = %symbol, insts = 12, "decoded symbol");
            let err = ObjlensError::UnsupportedVersion { found: 0xfffffff0 };
            warn!(symbol = %symbol, error = %err, "function table present but unusable");
        });

        let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        let line = text
            .lines()
            .find(|l| l.contains("function table present but unusable"))
            .unwrap();
        assert!(line.contains("WARN"));
        assert!(line.contains("symbol=main.main"));
        assert!(line.contains("error=unsupported function table version 0xfffffff0"));
    }
}
