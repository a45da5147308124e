//! Process configuration, resolved once in `main` and shared by reference.

use std::path::PathBuf;
use std::time::Duration;

/// Default HTTP port of the gateway.
pub const DEFAULT_PORT: u16 = 8080;
/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 4;
/// Default registry poll interval.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var_os(key).map_or_else(|| PathBuf::from(default), PathBuf::from)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port the gateway listens on.
    pub port: u16,
    /// Number of worker processes the pool is launched with.
    pub workers: usize,
    /// Registry poll cadence.
    pub sync_interval: Duration,
    /// SQLite registry database.
    pub db_path: PathBuf,
    /// Staging directory for uploaded sources and descriptors.
    pub staging_dir: PathBuf,
    /// Base directory for compiled artifacts (`<out>/<id>/module.wasm`).
    pub out_dir: PathBuf,
    /// Directory for per-function JSON sidecars.
    pub sidecar_dir: PathBuf,
    /// Directory holding the worker and telemetry sockets.
    pub run_dir: PathBuf,
    /// Static page served on `GET /upload`.
    pub upload_page: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            db_path: PathBuf::from("faas_meta.db"),
            staging_dir: PathBuf::from("/tmp/progfile"),
            out_dir: PathBuf::from("/opt/functions"),
            sidecar_dir: PathBuf::from("/var/lib/faas_db"),
            run_dir: PathBuf::from("/tmp"),
            upload_page: PathBuf::from("pages/upload.html"),
        }
    }
}

impl Config {
    /// Resolve configuration from `FNGW_*` environment variables, falling
    /// back to the defaults above.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_or("FNGW_PORT", defaults.port),
            workers: env_or("FNGW_WORKERS", defaults.workers),
            sync_interval: Duration::from_secs(env_or(
                "FNGW_SYNC_INTERVAL_SECS",
                defaults.sync_interval.as_secs(),
            )),
            db_path: env_path("FNGW_DB", "faas_meta.db"),
            staging_dir: env_path("FNGW_STAGING_DIR", "/tmp/progfile"),
            out_dir: env_path("FNGW_OUT_DIR", "/opt/functions"),
            sidecar_dir: env_path("FNGW_SIDECAR_DIR", "/var/lib/faas_db"),
            run_dir: env_path("FNGW_RUN_DIR", "/tmp"),
            upload_page: env_path("FNGW_UPLOAD_PAGE", "pages/upload.html"),
        }
    }

    /// Unix socket path of worker `id`.
    #[must_use]
    pub fn worker_socket(&self, id: usize) -> PathBuf {
        self.run_dir.join(format!("faas_worker_{id}.sock"))
    }

    /// Datagram socket the telemetry collector binds.
    #[must_use]
    pub fn telemetry_socket(&self) -> PathBuf {
        self.run_dir.join("faas_lb_metrics.sock")
    }
}
