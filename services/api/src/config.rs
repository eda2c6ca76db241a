use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Defines the supported backend providers for the chat model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub provider: Provider,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub chat_model: String,
    pub log_level: Level,
    pub prompts_path: PathBuf,
    pub static_dir: PathBuf,
    pub serpapi_api_key: Option<String>,
    pub tavily_api_key: Option<String>,
    pub duckduckgo_enabled: bool,
    pub replicate_api_token: Option<String>,
    pub replicate_model: Option<String>,
    pub image_dir: Option<PathBuf>,
    pub step_budget: u32,
    pub provider_timeout: Duration,
    pub generation_timeout: Duration,
    pub max_description_len: usize,
    pub session_ttl: Duration,
}

/// Reads an optional variable, treating an empty value as unset.
fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        None => Ok(default),
    }
}

fn positive_secs(name: &str, default: u64) -> Result<Duration, ConfigError> {
    let secs = parsed::<u64>(name, default)?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(Duration::from_secs(secs))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let provider_str = std::env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "openai" => Provider::OpenAI,
            "gemini" => Provider::Gemini,
            other => {
                return Err(ConfigError::InvalidValue(
                    "LLM_PROVIDER".to_string(),
                    format!("'{}' is not one of 'openai' or 'gemini'", other),
                ));
            }
        };

        let openai_api_key = optional("OPENAI_API_KEY");
        let gemini_api_key = optional("GEMINI_API_KEY");

        let chat_model = std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));
        let static_dir = std::env::var("STATIC_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./static"));

        match provider {
            Provider::OpenAI => {
                if openai_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                    ));
                }
            }
            Provider::Gemini => {
                if gemini_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
                    ));
                }
            }
        }

        let step_budget = parsed::<u32>("STEP_BUDGET", 50)?;
        if step_budget == 0 {
            return Err(ConfigError::InvalidValue(
                "STEP_BUDGET".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            bind_address,
            provider,
            openai_api_key,
            gemini_api_key,
            chat_model,
            log_level,
            prompts_path,
            static_dir,
            serpapi_api_key: optional("SERPAPI_API_KEY"),
            tavily_api_key: optional("TAVILY_API_KEY"),
            duckduckgo_enabled: parsed::<bool>("DUCKDUCKGO_ENABLED", true)?,
            replicate_api_token: optional("REPLICATE_API_TOKEN"),
            replicate_model: optional("REPLICATE_MODEL"),
            image_dir: optional("IMAGE_DIR").map(PathBuf::from),
            step_budget,
            provider_timeout: positive_secs("PROVIDER_TIMEOUT_SECS", 30)?,
            generation_timeout: positive_secs("GENERATION_TIMEOUT_SECS", 900)?,
            max_description_len: parsed::<usize>("MAX_DESCRIPTION_LEN", 2000)?,
            session_ttl: positive_secs("SESSION_TTL_SECS", 86_400)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tracing::Level;

    const VARS: [&str; 19] = [
        "BIND_ADDRESS",
        "LLM_PROVIDER",
        "OPENAI_API_KEY",
        "GEMINI_API_KEY",
        "CHAT_MODEL",
        "RUST_LOG",
        "PROMPTS_PATH",
        "STATIC_DIR",
        "SERPAPI_API_KEY",
        "TAVILY_API_KEY",
        "DUCKDUCKGO_ENABLED",
        "REPLICATE_API_TOKEN",
        "REPLICATE_MODEL",
        "IMAGE_DIR",
        "STEP_BUDGET",
        "PROVIDER_TIMEOUT_SECS",
        "GENERATION_TIMEOUT_SECS",
        "MAX_DESCRIPTION_LEN",
        "SESSION_TTL_SECS",
    ];

    fn clear_env_vars() {
        unsafe {
            for var in VARS {
                env::remove_var(var);
            }
        }
    }

    fn set_minimal_env_openai() {
        unsafe {
            env::set_var("LLM_PROVIDER", "openai");
            env::set_var("OPENAI_API_KEY", "test-openai-key");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal_openai() {
        clear_env_vars();
        set_minimal_env_openai();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "0.0.0.0:8000");
        assert_eq!(config.provider, Provider::OpenAI);
        assert_eq!(config.openai_api_key, Some("test-openai-key".to_string()));
        assert_eq!(config.gemini_api_key, None);
        assert_eq!(config.chat_model, "gpt-4o");
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.prompts_path, PathBuf::from("./prompts"));
        assert_eq!(config.static_dir, PathBuf::from("./static"));
        assert!(config.duckduckgo_enabled);
        assert!(config.serpapi_api_key.is_none());
        assert!(config.replicate_api_token.is_none());
        assert_eq!(config.step_budget, 50);
        assert_eq!(config.provider_timeout, Duration::from_secs(30));
        assert_eq!(config.generation_timeout, Duration::from_secs(900));
        assert_eq!(config.max_description_len, 2000);
        assert_eq!(config.session_ttl, Duration::from_secs(86_400));
    }

    #[test]
    #[serial]
    fn test_config_from_env_gemini_provider() {
        clear_env_vars();
        unsafe {
            env::set_var("LLM_PROVIDER", "Gemini");
            env::set_var("GEMINI_API_KEY", "test-gemini-key");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.provider, Provider::Gemini);
        assert_eq!(config.gemini_api_key, Some("test-gemini-key".to_string()));
        assert_eq!(config.openai_api_key, None);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        set_minimal_env_openai();
        unsafe {
            env::set_var("BIND_ADDRESS", "127.0.0.1:8080");
            env::set_var("CHAT_MODEL", "gpt-4o-mini");
            env::set_var("RUST_LOG", "debug");
            env::set_var("PROMPTS_PATH", "/custom/prompts");
            env::set_var("SERPAPI_API_KEY", "serp-key");
            env::set_var("TAVILY_API_KEY", "");
            env::set_var("DUCKDUCKGO_ENABLED", "false");
            env::set_var("REPLICATE_API_TOKEN", "r8-token");
            env::set_var("IMAGE_DIR", "/tmp/images");
            env::set_var("STEP_BUDGET", "12");
            env::set_var("SESSION_TTL_SECS", "60");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "127.0.0.1:8080");
        assert_eq!(config.chat_model, "gpt-4o-mini");
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.prompts_path, PathBuf::from("/custom/prompts"));
        assert_eq!(config.serpapi_api_key.as_deref(), Some("serp-key"));
        assert_eq!(config.tavily_api_key, None);
        assert!(!config.duckduckgo_enabled);
        assert_eq!(config.replicate_api_token.as_deref(), Some("r8-token"));
        assert_eq!(config.image_dir, Some(PathBuf::from("/tmp/images")));
        assert_eq!(config.step_budget, 12);
        assert_eq!(config.session_ttl, Duration::from_secs(60));
    }

    #[test]
    #[serial]
    fn test_config_invalid_bind_address() {
        clear_env_vars();
        set_minimal_env_openai();
        unsafe {
            env::set_var("BIND_ADDRESS", "not-a-valid-address");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "BIND_ADDRESS"),
            _ => panic!("Expected InvalidValue for BIND_ADDRESS"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        set_minimal_env_openai();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }

    #[test]
    #[serial]
    fn test_config_unknown_provider() {
        clear_env_vars();
        unsafe {
            env::set_var("LLM_PROVIDER", "anthropic");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "LLM_PROVIDER"),
            _ => panic!("Expected InvalidValue for LLM_PROVIDER"),
        }
    }

    #[test]
    #[serial]
    fn test_config_rejects_bad_numbers() {
        for (var, value) in [
            ("STEP_BUDGET", "lots"),
            ("STEP_BUDGET", "0"),
            ("PROVIDER_TIMEOUT_SECS", "0"),
            ("MAX_DESCRIPTION_LEN", "-1"),
            ("DUCKDUCKGO_ENABLED", "maybe"),
        ] {
            clear_env_vars();
            set_minimal_env_openai();
            unsafe {
                env::set_var(var, value);
            }
            match Config::from_env().unwrap_err() {
                ConfigError::InvalidValue(name, _) => assert_eq!(name, var),
                other => panic!("Expected InvalidValue for {var}, got {other:?}"),
            }
        }
    }

    #[test]
    #[serial]
    fn test_config_missing_openai_key() {
        clear_env_vars();
        unsafe {
            env::set_var("LLM_PROVIDER", "openai");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => {
                assert!(msg.contains("OPENAI_API_KEY"));
            }
            _ => panic!("Expected MissingVar for OPENAI_API_KEY"),
        }
    }

    #[test]
    #[serial]
    fn test_config_missing_gemini_key() {
        clear_env_vars();
        unsafe {
            env::set_var("LLM_PROVIDER", "gemini");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => {
                assert!(msg.contains("GEMINI_API_KEY"));
            }
            _ => panic!("Expected MissingVar for GEMINI_API_KEY"),
        }
    }
}
