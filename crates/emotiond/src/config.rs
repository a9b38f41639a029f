use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Daemon configuration: defaults, then an optional TOML file, then environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address (default: 0.0.0.0).
    pub host: String,
    /// Listen port (default: 5000).
    pub port: u16,
    /// Directory containing ONNX model files, also served under /models.
    pub model_dir: PathBuf,
    /// Directory of the client bundle served as the fallback route.
    pub public_dir: PathBuf,
    /// Scratch directory for uploads in flight.
    pub upload_dir: PathBuf,
    /// Largest accepted upload, in bytes.
    pub max_upload_bytes: usize,
    /// Bound on upload + decode + inference for one request.
    pub request_timeout_secs: u64,
    /// Number of inference threads, each with its own model instance.
    pub inference_workers: usize,
    /// Requests allowed to wait for a free worker before answering 503.
    pub queue_depth: usize,
}

/// Keys accepted in the file named by `EMOTIOND_CONFIG`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    model_dir: Option<PathBuf>,
    public_dir: Option<PathBuf>,
    upload_dir: Option<PathBuf>,
    max_upload_bytes: Option<usize>,
    request_timeout_secs: Option<u64>,
    inference_workers: Option<usize>,
    queue_depth: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            model_dir: emotion_core::default_model_dir(),
            public_dir: PathBuf::from("public"),
            upload_dir: std::env::temp_dir().join("emotiond-uploads"),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            inference_workers: workers,
            queue_depth: workers * 2,
        }
    }
}

impl Config {
    /// Load configuration. Only an unreadable or invalid config file is an error;
    /// malformed environment values fall back to the previous layer.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("EMOTIOND_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }
        config.apply_env();
        config.sanitize();
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let file: FileConfig = toml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded config file");
        self.merge(file);
        Ok(())
    }

    fn merge(&mut self, file: FileConfig) {
        let workers_set = file.inference_workers.is_some();
        if let Some(v) = file.host {
            self.host = v;
        }
        if let Some(v) = file.port {
            self.port = v;
        }
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.public_dir {
            self.public_dir = v;
        }
        if let Some(v) = file.upload_dir {
            self.upload_dir = v;
        }
        if let Some(v) = file.max_upload_bytes {
            self.max_upload_bytes = v;
        }
        if let Some(v) = file.request_timeout_secs {
            self.request_timeout_secs = v;
        }
        if let Some(v) = file.inference_workers {
            self.inference_workers = v;
        }
        match file.queue_depth {
            Some(v) => self.queue_depth = v,
            None if workers_set => self.queue_depth = self.inference_workers * 2,
            None => {}
        }
    }

    fn apply_env(&mut self) {
        self.host = env_string("EMOTIOND_HOST", &self.host);
        self.port = env_parse("PORT", self.port);
        self.model_dir = env_path("EMOTIOND_MODEL_DIR", &self.model_dir);
        self.public_dir = env_path("EMOTIOND_PUBLIC_DIR", &self.public_dir);
        self.upload_dir = env_path("EMOTIOND_UPLOAD_DIR", &self.upload_dir);
        self.max_upload_bytes = env_parse("EMOTIOND_MAX_UPLOAD_BYTES", self.max_upload_bytes);
        self.request_timeout_secs =
            env_parse("EMOTIOND_REQUEST_TIMEOUT_SECS", self.request_timeout_secs);

        let workers = env_parse("EMOTIOND_INFERENCE_WORKERS", self.inference_workers);
        if workers != self.inference_workers && std::env::var("EMOTIOND_QUEUE_DEPTH").is_err() {
            self.queue_depth = workers * 2;
        }
        self.inference_workers = workers;
        self.queue_depth = env_parse("EMOTIOND_QUEUE_DEPTH", self.queue_depth);
    }

    /// Zero workers, queue slots, size or timeout would make the service unusable.
    fn sanitize(&mut self) {
        self.inference_workers = self.inference_workers.max(1);
        self.queue_depth = self.queue_depth.max(1);
        if self.max_upload_bytes == 0 {
            self.max_upload_bytes = DEFAULT_MAX_UPLOAD_BYTES;
        }
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = DEFAULT_REQUEST_TIMEOUT_SECS;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_path(key: &str, default: &Path) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| default.to_path_buf())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
