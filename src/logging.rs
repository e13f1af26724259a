//! # Structured Logging Module
//!
//! Environment-aware structured logging that writes to both the console and a
//! JSON log file, for following backup passes that hop between the control
//! loop, worker tasks and blocking waits.

use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        let log_dir = PathBuf::from(
            std::env::var("BACKUP_LOG_DIR").unwrap_or_else(|_| "log".to_string()),
        );
        let file_layer_available = fs::create_dir_all(&log_dir).is_ok();

        let pid = process::id();
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_filename = format!("backup.{environment}.{pid}.{timestamp}.log");
        let log_path = log_dir.join(&log_filename);

        let console = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(EnvFilter::new(log_level.clone()));

        let (file_layer, guard) = if file_layer_available {
            let file_appender = tracing_appender::rolling::never(&log_dir, &log_filename);
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(file_writer)
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .with_filter(EnvFilter::new(log_level));
            (Some(layer), Some(guard))
        } else {
            (None, None)
        };

        // An embedding host may already own the global subscriber
        if tracing_subscriber::registry()
            .with(console)
            .with(file_layer)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = pid,
            environment = %environment,
            log_file = %log_path.display(),
            file_output = file_layer_available,
            "🔧 STRUCTURED LOGGING: Initialized"
        );

        // The writer must outlive every event for the life of the process
        if let Some(guard) = guard {
            std::mem::forget(guard);
        }
    });
}

fn get_environment() -> String {
    std::env::var("BACKUP_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> String {
    match environment {
        "test" => "debug".to_string(),
        "development" => "debug".to_string(),
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for a backup pass or per-package backup step
pub fn log_backup_operation(
    operation: &str,
    package: Option<&str>,
    transport: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        package = package,
        transport = transport,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📦 BACKUP_OPERATION"
    );
}

/// Log structured data for restore operations
pub fn log_restore_operation(
    operation: &str,
    package: Option<&str>,
    restore_token: Option<u64>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        package = package,
        restore_token = restore_token,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "♻️ RESTORE_OPERATION"
    );
}

/// Log structured data for transport registration, selection and leases
pub fn log_transport_operation(
    operation: &str,
    transport: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        transport = transport,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🚚 TRANSPORT_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
