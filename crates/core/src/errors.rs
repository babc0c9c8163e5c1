//! Error types for the semmerge core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! Region-level failures (a declined strategy, an unusable resolver answer)
//! never surface through these types to the engine's caller: they are folded
//! into a FAILED [`MergeResult`](crate::models::MergeResult) so one bad region
//! cannot abort a batch. Storage failures are the exception and propagate as
//! hard errors.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Timeline(#[from] TimelineError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A file's merge task panicked or was aborted.
    #[error("merge worker for '{file_path}' failed: {detail}")]
    WorkerFailed {
        file_path: String,
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Analyzer errors
// ---------------------------------------------------------------------------

/// Errors from the semantic analyzer.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// No pattern table exists for the file's extension. Callers must skip
    /// semantic merging and fall back to textual handling.
    #[error("unsupported language for '{file_path}' (extension '{extension}')")]
    UnsupportedLanguage {
        file_path: String,
        extension: String,
    },
}

// ---------------------------------------------------------------------------
// LLM client errors
// ---------------------------------------------------------------------------

/// Errors from the language-model client collaborator.
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP-level transport error (network, TLS, etc.).
    #[error("LLM HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The API returned a non-success status code.
    #[error("LLM API error (HTTP {status}): {body}")]
    ApiError {
        status: u16,
        body: String,
    },

    /// No API key was resolved from the environment.
    #[error("LLM API key is not configured")]
    MissingApiKey,

    /// The response body did not have the expected shape.
    #[error("LLM response parse error: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpError(_) => true,
            Self::ApiError { status, .. } => *status == 429 || *status >= 500,
            Self::MissingApiKey | Self::InvalidResponse(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver errors
// ---------------------------------------------------------------------------

/// Errors from the AI-assisted resolver.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// The response contained no fenced code block for the target language.
    #[error("no {language} code block found in resolver response")]
    NoCodeBlockFound {
        language: String,
    },

    /// A code block was found but is unusable.
    #[error("malformed resolver response: {0}")]
    MalformedResolverResponse(String),

    /// The caller cancelled the resolution.
    #[error("resolution cancelled")]
    Cancelled,

    /// The resolver did not answer within the configured timeout.
    #[error("resolver timed out after {secs}s")]
    TimedOut {
        secs: u64,
    },

    /// The LLM client failed (after any retries).
    #[error("resolver LLM error: {0}")]
    Llm(#[from] LlmError),
}

// ---------------------------------------------------------------------------
// Timeline errors
// ---------------------------------------------------------------------------

/// Errors from the timeline persistence layer.
#[derive(Debug, Error)]
pub enum TimelineError {
    /// A stored timeline could not be decoded. History is never guessed:
    /// callers either surface this or quarantine the file explicitly.
    #[error("timeline storage corrupted at '{path}': {detail}")]
    StorageCorruption {
        path: String,
        detail: String,
    },

    /// A storage key could not be mapped back to a file path.
    #[error("invalid timeline storage key: {0}")]
    InvalidKey(String),

    /// JSON encoding failure.
    #[error("timeline serialization error: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// Generic I/O error.
    #[error("timeline I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
