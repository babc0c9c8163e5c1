//! TOML-based configuration for the merge engine.
//!
//! The LLM API key is never stored in the file itself: `llm.api_key_env`
//! names an environment variable that is resolved at runtime via
//! [`MergeConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Worker and routing settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Timeline persistence settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// AI-assisted resolver settings.
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Language-model endpoint settings.
    #[serde(default)]
    pub llm: LlmConfig,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Files processed concurrently (default 4).
    #[serde(default = "default_max_parallel_files")]
    pub max_parallel_files: usize,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Glob patterns for files that bypass semantic merging entirely.
    #[serde(default = "default_skip_patterns")]
    pub skip_patterns: Vec<String>,

    /// Move undecodable timeline files aside instead of failing the load.
    #[serde(default)]
    pub quarantine_corrupt_timelines: bool,
}

fn default_max_parallel_files() -> usize {
    4
}
fn default_log_level() -> String {
    "info".into()
}
fn default_skip_patterns() -> Vec<String> {
    vec!["**/*.lock".into()]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_files: default_max_parallel_files(),
            log_level: default_log_level(),
            skip_patterns: default_skip_patterns(),
            quarantine_corrupt_timelines: false,
        }
    }
}

impl EngineConfig {
    /// Whether `file_path` matches one of the skip patterns.
    pub fn is_skipped(&self, file_path: &str) -> bool {
        self.skip_patterns
            .iter()
            .any(|pattern| glob_match::glob_match(pattern, file_path))
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Where timelines are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage root; timelines live under `<root>/timelines/`.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from(".semmerge")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// AI-assisted resolver behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// When false, regions that need the resolver become HUMAN_REQUIRED.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-call deadline in seconds (default 120).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries after a transient LLM failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff between retries.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Longest code excerpt included per snippet in a prompt context.
    #[serde(default = "default_max_snippet_chars")]
    pub max_snippet_chars: usize,

    /// Upper bound on a whole prompt context.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,

    /// Send all of a file's unresolved regions in one call.
    #[serde(default = "default_true")]
    pub batch_regions: bool,
}

fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_max_snippet_chars() -> usize {
    4000
}
fn default_max_context_chars() -> usize {
    24000
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_snippet_chars: default_max_snippet_chars(),
            max_context_chars: default_max_context_chars(),
            batch_regions: true,
        }
    }
}

impl ResolverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay before retry number `attempt` (0-based): base * 2^attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

/// OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Resolved API key (not serialized).
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1/chat/completions".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_api_key_env() -> String {
    "SEMMERGE_LLM_API_KEY".into()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            api_key: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl MergeConfig {
    /// Load a [`MergeConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: MergeConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve `*_env` fields from the environment.
    ///
    /// A missing API key only logs a warning: the engine then runs without a
    /// resolver and escalates unresolvable regions to a human.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");
        self.llm.api_key = resolve_optional_env(&self.llm.api_key_env, "llm.api_key_env");
        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_parallel_files == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.max_parallel_files".into(),
                detail: "must be > 0".into(),
            });
        }
        if self.resolver.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "resolver.timeout_secs".into(),
                detail: "timeout must be > 0".into(),
            });
        }
        if self.resolver.max_snippet_chars == 0
            || self.resolver.max_snippet_chars > self.resolver.max_context_chars
        {
            return Err(ConfigError::InvalidValue {
                field: "resolver.max_snippet_chars".into(),
                detail: "must be > 0 and no larger than resolver.max_context_chars".into(),
            });
        }
        if self.resolver.enabled && !self.llm.api_url.starts_with("http") {
            return Err(ConfigError::InvalidValue {
                field: "llm.api_url".into(),
                detail: "must be an http(s) URL".into(),
            });
        }
        if self.storage.root.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "storage.root".into(),
                detail: "storage root must not be empty".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[engine]
max_parallel_files = 8
log_level = "debug"
skip_patterns = ["**/*.lock", "dist/**"]
quarantine_corrupt_timelines = true

[storage]
root = "/tmp/semmerge"

[resolver]
enabled = true
timeout_secs = 30
max_retries = 1
retry_backoff_ms = 100
max_snippet_chars = 2000
max_context_chars = 10000
batch_regions = false

[llm]
api_url = "http://localhost:8080/v1/chat/completions"
model = "local-coder"
api_key_env = "LOCAL_LLM_KEY"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: MergeConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.engine.max_parallel_files, 8);
        assert_eq!(config.engine.skip_patterns.len(), 2);
        assert!(config.engine.quarantine_corrupt_timelines);
        assert_eq!(config.storage.root, PathBuf::from("/tmp/semmerge"));
        assert_eq!(config.resolver.timeout_secs, 30);
        assert!(!config.resolver.batch_regions);
        assert_eq!(config.llm.model, "local-coder");
        assert!(config.llm.api_key.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("semmerge.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = MergeConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.engine.log_level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = MergeConfig::load_from_file("/nonexistent/semmerge.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[engine\nmax_parallel_files = ").unwrap();
        let result = MergeConfig::load_from_file(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config: MergeConfig = toml::from_str(sample_toml()).unwrap();
        config.engine.max_parallel_files = 0;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "engine.max_parallel_files"
        ));
    }

    #[test]
    fn test_validate_rejects_snippet_larger_than_context() {
        let mut config = MergeConfig::default();
        config.resolver.max_snippet_chars = config.resolver.max_context_chars + 1;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "resolver.max_snippet_chars"
        ));
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("TEST_SEMMERGE_KEY", "sk-test");

        let toml_str = r#"
[llm]
api_key_env = "TEST_SEMMERGE_KEY"
"#;
        let mut config: MergeConfig = toml::from_str(toml_str).unwrap();
        config.resolve_env_vars().unwrap();
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));

        // Clean up
        std::env::remove_var("TEST_SEMMERGE_KEY");
    }

    #[test]
    fn test_defaults() {
        let config: MergeConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_parallel_files, 4);
        assert_eq!(config.engine.log_level, "info");
        assert_eq!(config.storage.root, PathBuf::from(".semmerge"));
        assert!(config.resolver.enabled);
        assert_eq!(config.resolver.timeout_secs, 120);
        assert_eq!(config.resolver.max_retries, 2);
        assert!(config.resolver.batch_regions);
        assert_eq!(config.llm.api_key_env, "SEMMERGE_LLM_API_KEY");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_skip_patterns_and_backoff() {
        let config = MergeConfig::default();
        assert!(config.engine.is_skipped("web/yarn.lock"));
        assert!(!config.engine.is_skipped("web/src/App.tsx"));

        assert_eq!(config.resolver.backoff(0), Duration::from_millis(500));
        assert_eq!(config.resolver.backoff(2), Duration::from_millis(2000));
    }
}
