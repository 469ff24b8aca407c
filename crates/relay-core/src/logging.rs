//! Structured logging bootstrap.
//!
//! One subscriber for the whole process: human-readable text by default,
//! JSON when `LOG_FORMAT=json` (for log aggregation). Level filtering via
//! the standard `RUST_LOG` variable, e.g. `RUST_LOG=relay_router=debug,info`.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize the global subscriber. Call once, at process start.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_ansi(true))
            .init();
    }
}
