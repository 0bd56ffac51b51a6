use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_BIND: &str = "127.0.0.1:3000";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_ATTEMPTS: u32 = 2;
const DEFAULT_MAX_UPLOAD_MB: usize = 25;

/// Text-generation endpoint settings. Missing credentials are allowed: every
/// call then fails soft as "unavailable".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiSettings {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl AiSettings {
    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some() && self.api_key.is_some()
    }
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// How correction feedback is turned into directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorrectionMode {
    /// `{corrections: [...]}` validated against a schema.
    #[default]
    Structured,
    /// Plain `CELL: value` lines.
    RawText,
}

impl FromStr for CorrectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "structured" | "json" => Ok(CorrectionMode::Structured),
            "text" | "raw" => Ok(CorrectionMode::RawText),
            other => Err(format!("unknown correction mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    pub ai: AiSettings,
    pub max_upload_bytes: usize,
    pub correction_mode: CorrectionMode,
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("formfill")
        .join("formfill.db")
}

impl AppConfig {
    /// Read settings from the process environment, after loading `.env` if present.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bind = get("FORMFILL_BIND")
            .unwrap_or_else(|| DEFAULT_BIND.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| format!("FORMFILL_BIND: {}", e))?;
        let db_path = get("FORMFILL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(default_db_path);

        let timeout_secs = match get("AI_TIMEOUT_SECS") {
            Some(v) => v
                .parse::<u64>()
                .map_err(|e| format!("AI_TIMEOUT_SECS: {}", e))?,
            None => DEFAULT_TIMEOUT_SECS,
        };
        let max_attempts = match get("AI_MAX_ATTEMPTS") {
            Some(v) => v
                .parse::<u32>()
                .map_err(|e| format!("AI_MAX_ATTEMPTS: {}", e))?
                .max(1),
            None => DEFAULT_MAX_ATTEMPTS,
        };
        let ai = AiSettings {
            endpoint: get("AI_ENDPOINT").map(|e| e.trim_end_matches('/').to_string()),
            api_key: get("AI_API_KEY"),
            model: get("AI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            timeout: Duration::from_secs(timeout_secs.max(1)),
            max_attempts,
        };

        let max_upload_mb = match get("FORMFILL_MAX_UPLOAD_MB") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|e| format!("FORMFILL_MAX_UPLOAD_MB: {}", e))?,
            None => DEFAULT_MAX_UPLOAD_MB,
        };
        let correction_mode = match get("FORMFILL_CORRECTION_MODE") {
            Some(v) => v.parse()?,
            None => CorrectionMode::default(),
        };

        Ok(Self {
            bind,
            db_path,
            ai,
            max_upload_bytes: max_upload_mb * 1024 * 1024,
            correction_mode,
        })
    }
}
