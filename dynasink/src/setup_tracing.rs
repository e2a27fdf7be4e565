use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

const ENV_DEBUG: &str = "DYNASINK_DEBUG";

/// Routes panics through `tracing` so they land in the same (JSON) stream as everything else,
/// on a single line when no backtrace was captured.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    // captured only when RUST_BACKTRACE or RUST_LIB_BACKTRACE is set
    let backtrace = Backtrace::capture();
    let backtrace_captured = backtrace.status() == BacktraceStatus::Captured;
    let payload = panic_info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<String>()
                .map(String::as_str)
        });

    match (panic_info.location(), payload, backtrace_captured) {
        (Some(location), Some(payload), false) => {
            tracing::error!(
                "{}:{}:{}: {}",
                location.file(),
                location.line(),
                location.column(),
                payload,
            );
        }
        _ => {
            tracing::error!("{}\n{}", panic_info, backtrace);
        }
    };
}

/// Installs the global subscriber. `RUST_LOG` overrides the default level, which is `info`, or
/// `debug` with human readable output when `DYNASINK_DEBUG=true`.
pub fn register() {
    let debug_mode = std::env::var(ENV_DEBUG).is_ok_and(|v| v.eq_ignore_ascii_case("true"));
    let default_directives = if debug_mode {
        // the http and sdk internals are too noisy at debug
        "debug,hyper=info,h2=info,aws_smithy_runtime=info,aws_config=info"
    } else {
        "info"
    };

    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .parse_lossy(
            std::env::var(EnvFilter::DEFAULT_ENV)
                .unwrap_or_else(|_| default_directives.to_string()),
        );

    let layer = if debug_mode {
        fmt::layer().boxed()
    } else {
        // JSON, flattened
        fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(report_panic));
}
