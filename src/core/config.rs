use crate::core::errors::ConfigError;
use crate::core::types::SchedulingStrategy;
use std::env;
use std::time::Duration;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
}

/// Per-provider credential and model configuration.
///
/// Keys seeded here come from the operator's environment and are trusted
/// (start valid); keys added over the API start invalid until validated.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub gemini_keys: Vec<String>,
    pub openai_keys: Vec<String>,
    pub groq_keys: Vec<String>,
    pub openrouter_keys: Vec<String>,
    pub gemini_model: String,
    pub openai_model: String,
    pub groq_model: String,
    pub openrouter_model: String,
    /// Account has purchased OpenRouter credits (raises the free-model daily cap).
    pub openrouter_has_credits: bool,
}

/// Batch scheduling and retry configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Hard ceiling on in-flight units per provider; effective parallelism is
    /// min(valid credential count, this cap).
    pub max_parallel: usize,
    /// Default scheduling strategy when the request does not choose one.
    pub strategy: SchedulingStrategy,
    /// Images per provider call in grouped mode.
    pub group_size: usize,
    /// Retries after the initial attempt; a unit is attempted at most
    /// max_retries + 1 times.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Random jitter added before each dispatch to smooth burst traffic.
    pub dispatch_jitter_ms: u64,
    pub request_timeout_secs: u64,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub providers: ProviderConfig,
    pub batch: BatchConfig,
}

fn env_keys(var: &str) -> Vec<String> {
    env::var(var)
        .ok()
        .map(|keys| {
            keys.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env();
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Self {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        Self {
            server: ServerConfig {
                port: env_parse("SERVER_PORT", 1430),
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                log_level,
            },
            providers: ProviderConfig {
                gemini_keys: env_keys("GEMINI_API_KEYS"),
                openai_keys: env_keys("OPENAI_API_KEYS"),
                groq_keys: env_keys("GROQ_API_KEYS"),
                openrouter_keys: env_keys("OPENROUTER_API_KEYS"),
                gemini_model: env::var("GEMINI_MODEL")
                    .unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
                openai_model: env::var("OPENAI_MODEL")
                    .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                groq_model: env::var("GROQ_MODEL")
                    .unwrap_or_else(|_| "llama-3.2-90b-vision-preview".to_string()),
                openrouter_model: env::var("OPENROUTER_MODEL")
                    .unwrap_or_else(|_| "google/gemini-2.0-flash-exp:free".to_string()),
                openrouter_has_credits: env_parse("OPENROUTER_HAS_CREDITS", false),
            },
            batch: BatchConfig {
                max_parallel: env_parse("MAX_PARALLEL", 5),
                strategy: if env_parse("GROUPED_MODE", false) {
                    SchedulingStrategy::Grouped(env_parse("GROUP_SIZE", 4))
                } else {
                    SchedulingStrategy::PerImage
                },
                group_size: env_parse("GROUP_SIZE", 4),
                max_retries: env_parse("MAX_RETRIES", 3),
                backoff_base_ms: env_parse("BACKOFF_BASE_MS", 2_000),
                backoff_cap_ms: env_parse("BACKOFF_CAP_MS", 60_000),
                dispatch_jitter_ms: env_parse("DISPATCH_JITTER_MS", 250),
                request_timeout_secs: env_parse("API_TIMEOUT_SECONDS", 30),
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.max_retries > 10 {
            return Err(ConfigError::InvalidRetryCeiling(self.batch.max_retries));
        }
        if !(1..=300).contains(&self.batch.request_timeout_secs) {
            return Err(ConfigError::InvalidTimeout(self.batch.request_timeout_secs));
        }
        if !(1..=16).contains(&self.batch.max_parallel) {
            return Err(ConfigError::InvalidParallelism(self.batch.max_parallel));
        }
        if !(1..=16).contains(&self.batch.group_size) {
            return Err(ConfigError::InvalidGroupSize(self.batch.group_size));
        }
        if self.batch.backoff_base_ms == 0 {
            return Err(ConfigError::InvalidBackoff);
        }
        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn max_retries(&self) -> u32 {
        self.batch.max_retries
    }

    pub fn max_parallel(&self) -> usize {
        self.batch.max_parallel
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.batch.request_timeout_secs)
    }
}

// No Default implementation: Config::new() can fail and callers must handle it.

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            server: ServerConfig {
                port: 1430,
                host: "127.0.0.1".into(),
                log_level: Level::INFO,
            },
            providers: ProviderConfig {
                gemini_keys: vec![],
                openai_keys: vec![],
                groq_keys: vec![],
                openrouter_keys: vec![],
                gemini_model: "gemini-2.5-flash".into(),
                openai_model: "gpt-4o-mini".into(),
                groq_model: "llama-3.2-90b-vision-preview".into(),
                openrouter_model: "google/gemini-2.0-flash-exp:free".into(),
                openrouter_has_credits: false,
            },
            batch: BatchConfig {
                max_parallel: 5,
                strategy: SchedulingStrategy::PerImage,
                group_size: 4,
                max_retries: 3,
                backoff_base_ms: 2_000,
                backoff_cap_ms: 60_000,
                dispatch_jitter_ms: 250,
                request_timeout_secs: 30,
            },
        }
    }

    #[test]
    fn valid_defaults_pass() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut c = base();
        c.batch.request_timeout_secs = 0;
        assert!(matches!(c.validate(), Err(ConfigError::InvalidTimeout(0))));
    }

    #[test]
    fn rejects_oversized_parallelism() {
        let mut c = base();
        c.batch.max_parallel = 64;
        assert!(matches!(c.validate(), Err(ConfigError::InvalidParallelism(64))));
    }
}
