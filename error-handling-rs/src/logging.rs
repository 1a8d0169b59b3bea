//! # Structured Logging
//!
//! Installs the global `tracing` subscriber for the process. Components log
//! through `tracing` macros with structured fields; this module only decides
//! where those events go and in which format.

use std::sync::atomic::{AtomicBool, Ordering};

use config_rs::LoggingSettings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::types::{Error, ErrorKind, Result};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initializes the structured logging system.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this more
/// than once is a no-op. When a log directory is configured the returned
/// guard must be kept alive for buffered file output to be flushed.
pub fn init_logging(settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(None);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.clone()));

    // Console output goes to stderr; stdout belongs to the program's results.
    let console_layer = if settings.json_format {
        fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    };

    let (file_layer, guard) = match &settings.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(
                dir,
                format!("{}.log", settings.service_name),
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        LOGGING_INITIALIZED.store(false, Ordering::SeqCst);
        Error::new(
            ErrorKind::Internal,
            format!("Failed to set global subscriber: {}", e),
        )
    })?;

    tracing::info!(
        service = %settings.service_name,
        level = %settings.level,
        json = settings.json_format,
        "Structured logging initialized"
    );

    Ok(guard)
}

/// Logs an error at a level matching how actionable it is.
///
/// Caller-correctable and fast-fail errors are expected traffic and log at
/// `warn`; everything else logs at `error` with full context.
pub fn log_structured_error(error: &Error) {
    let service = error.service.as_deref().unwrap_or("unknown");

    match error.kind {
        ErrorKind::InputValidation | ErrorKind::CircuitOpen => {
            tracing::warn!(
                error_id = %error.id,
                error_kind = %error.kind,
                service = %service,
                message = %error.message,
                "Request rejected"
            );
        }
        _ => {
            tracing::error!(
                error_id = %error.id,
                error_kind = %error.kind,
                service = %service,
                message = %error.message,
                transient = error.transient,
                context = ?error.context,
                "Error occurred"
            );
        }
    }
}
