pub mod config;
pub mod logger;
pub mod metrics;
pub mod pricing;
pub mod relay;
pub mod store;

use std::sync::Arc;

use crate::metrics::LogRecorder;
use crate::pricing::PricingCatalog;
use crate::relay::AppState;
use crate::store::SqliteStore;

/// Assemble the default application state: SQLite persistence, the built-in
/// pricing catalog and the logging metrics sink.
pub fn default_state(data_dir: Option<&std::path::Path>) -> Result<AppState, String> {
    let store = SqliteStore::open(data_dir).map_err(|e| e.to_string())?;
    Ok(AppState {
        store: Arc::new(store),
        catalog: Arc::new(PricingCatalog::new()),
        recorder: Arc::new(LogRecorder),
    })
}

/// Install a panic hook that records panics through the gateway logger
/// before the process dies.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        crate::logger::error(
            "panic",
            &format!("panic: message='{}', location='{}'", message, location),
        );
        eprintln!("FATAL PANIC: {} at {}", message, location);
    }));
}
