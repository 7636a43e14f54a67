use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "Chartstamp";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the application data directory
/// ~/Chartstamp/ on all platforms (user-visible, per design requirement)
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join(APP_NAME)
}

/// Get the directory holding the stampable assessment PDFs
pub fn files_dir() -> PathBuf {
    app_data_dir().join("files")
}

/// Get the path of the operation audit database
pub fn database_path() -> PathBuf {
    app_data_dir().join("operations.db")
}

/// Default tracing filter when RUST_LOG is not set
pub fn default_log_filter() -> String {
    "warn,chartstamp=info".to_string()
}
