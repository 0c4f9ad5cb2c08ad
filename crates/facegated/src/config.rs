use facegate_core::ModelVariant;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the SCRFD ONNX models.
    pub model_dir: PathBuf,
    /// Which SCRFD model to run (default: fast).
    pub model_variant: ModelVariant,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Device/location tag recorded with camera authentication attempts.
    pub device_location: String,
    /// Upper bound on a single face detection call.
    pub detect_timeout: Duration,
    /// Also log attempts that matched no enrolled employee.
    pub audit_unknown_person: bool,
    /// Fixed seed for the simulation random source.
    pub simulate_seed: Option<u64>,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACEGATE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facegate_core::default_model_dir());

        let db_path = std::env::var("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facegate_core::data_dir().join("facegate.db"));

        let model_variant = match std::env::var("FACEGATE_MODEL_VARIANT") {
            Ok(raw) => raw.parse().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "falling back to the fast model variant");
                ModelVariant::Fast
            }),
            Err(_) => ModelVariant::Fast,
        };

        Self {
            model_dir,
            model_variant,
            db_path,
            device_location: std::env::var("FACEGATE_DEVICE_LOCATION")
                .unwrap_or_else(|_| "Main Entrance".to_string()),
            detect_timeout: Duration::from_secs(env_u64("FACEGATE_DETECT_TIMEOUT_SECS", 10)),
            audit_unknown_person: std::env::var("FACEGATE_AUDIT_UNKNOWN")
                .map(|v| v == "1")
                .unwrap_or(false),
            simulate_seed: std::env::var("FACEGATE_SIMULATE_SEED")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
