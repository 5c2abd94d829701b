use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix. Nested keys use `__` as the separator, e.g.
/// `PATCHVEC_SERVER__PORT=9000` sets `server.port`.
pub const ENV_PREFIX: &str = "PATCHVEC_";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PatchvecConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub vector_store: VectorStoreConfig,
    pub embedder: EmbedderConfig,
    pub chunk: ChunkConfig,
    pub limits: LimitsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            workers: 0,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// `none` or `static`.
    pub mode: String,
    pub global_key: Option<String>,
    pub tenants_file: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: "none".to_string(),
            global_key: None,
            tenants_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub backend: String,
    pub data_dir: PathBuf,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("patchvec");
        Self {
            kind: "embedded".to_string(),
            backend: "lance".to_string(),
            data_dir,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub model: String,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            kind: "hash".to_string(),
            model: "hash-384".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChunkConfig {
    pub txt: TxtChunkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxtChunkConfig {
    pub size: usize,
    pub overlap: usize,
}

impl Default for TxtChunkConfig {
    fn default() -> Self {
        Self {
            size: 800,
            overlap: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LimitsConfig {
    pub search: SearchLimits,
    pub ingest: IngestLimits,
    pub tenant: TenantLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchLimits {
    pub max_concurrent: usize,
    pub timeout_ms: u64,
    /// Candidate multiplier applied when a post-filter is present.
    pub overfetch: usize,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            timeout_ms: 5000,
            overfetch: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestLimits {
    pub max_concurrent: usize,
    pub max_bytes: usize,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_bytes: 32 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TenantLimits {
    pub max_concurrent: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LogConfig {
    /// `stdout`, a file path, or unset to disable the operational stream.
    pub ops_log: Option<String>,
    pub access_log: Option<String>,
}

impl PatchvecConfig {
    /// Layered load: built-in defaults < YAML file < environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
        Ok(config)
    }

    /// Parse a YAML config file; missing fields fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply `PATCHVEC_`-prefixed environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        let mut overrides: Vec<(String, String)> = std::env::vars()
            .filter_map(|(k, v)| {
                k.strip_prefix(ENV_PREFIX)
                    .map(|rest| (rest.to_lowercase().replace("__", "."), v))
            })
            .collect();
        overrides.sort();
        for (key, value) in overrides {
            self.set_key(&key, &value)
                .with_context(|| format!("bad environment override {ENV_PREFIX}{key}"))?;
        }
        Ok(())
    }

    /// Set a single dotted configuration key from its string form.
    pub fn set_key(&mut self, key: &str, raw: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.parse()
                .map_err(|e| anyhow::anyhow!("cannot parse '{raw}' for {key}: {e}"))
        }
        fn opt(raw: &str) -> Option<String> {
            match raw {
                "" | "null" | "none" => None,
                other => Some(other.to_string()),
            }
        }

        match key {
            "server.host" => self.server.host = raw.to_string(),
            "server.port" => self.server.port = parse(raw, key)?,
            "server.workers" => self.server.workers = parse(raw, key)?,
            "server.log_level" => self.server.log_level = raw.to_string(),
            "auth.mode" => self.auth.mode = raw.to_string(),
            "auth.global_key" => self.auth.global_key = opt(raw),
            "auth.tenants_file" => self.auth.tenants_file = opt(raw).map(PathBuf::from),
            "vector_store.type" => self.vector_store.kind = raw.to_string(),
            "vector_store.backend" => self.vector_store.backend = raw.to_string(),
            "vector_store.data_dir" => self.vector_store.data_dir = PathBuf::from(raw),
            "embedder.type" => self.embedder.kind = raw.to_string(),
            "embedder.model" => self.embedder.model = raw.to_string(),
            "chunk.txt.size" => self.chunk.txt.size = parse(raw, key)?,
            "chunk.txt.overlap" => self.chunk.txt.overlap = parse(raw, key)?,
            "limits.search.max_concurrent" => {
                self.limits.search.max_concurrent = parse(raw, key)?
            }
            "limits.search.timeout_ms" => self.limits.search.timeout_ms = parse(raw, key)?,
            "limits.search.overfetch" => self.limits.search.overfetch = parse(raw, key)?,
            "limits.ingest.max_concurrent" => {
                self.limits.ingest.max_concurrent = parse(raw, key)?
            }
            "limits.ingest.max_bytes" => self.limits.ingest.max_bytes = parse(raw, key)?,
            "limits.tenant.max_concurrent" => {
                self.limits.tenant.max_concurrent = match opt(raw) {
                    Some(v) => Some(parse(&v, key)?),
                    None => None,
                }
            }
            "log.ops_log" => self.log.ops_log = opt(raw),
            "log.access_log" => self.log.access_log = opt(raw),
            other => anyhow::bail!("unknown configuration key '{other}'"),
        }
        Ok(())
    }

    /// Reject clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk.txt.size == 0 {
            return Err("chunk.txt.size must be > 0".into());
        }
        if self.chunk.txt.overlap >= self.chunk.txt.size {
            return Err("chunk.txt.overlap must be < chunk.txt.size".into());
        }
        if self.limits.search.max_concurrent == 0 {
            return Err("limits.search.max_concurrent must be > 0".into());
        }
        if self.limits.ingest.max_concurrent == 0 {
            return Err("limits.ingest.max_concurrent must be > 0".into());
        }
        if self.limits.search.overfetch == 0 {
            return Err("limits.search.overfetch must be > 0".into());
        }
        if self.limits.search.timeout_ms == 0 {
            return Err("limits.search.timeout_ms must be > 0".into());
        }
        if !matches!(self.auth.mode.as_str(), "none" | "static") {
            return Err(format!("auth.mode '{}' is not recognized", self.auth.mode));
        }
        Ok(())
    }
}
