pub mod nats;
pub mod redis;
pub mod tracing;

use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

/// Deployment environment, selected by `APP_ENV`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Value of `key`, or `default` when unset
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Value of `key`, or an error when unset
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Parsed value of `key`, or `default` when unset.
///
/// A set but unparsable value is an error rather than silently falling back.
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Optional parsed value of `key`.
pub fn env_parse_opt<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::ParseError {
                key: key.to_string(),
                details: e.to_string(),
            }),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults_to_development() {
        temp_env::with_var_unset("APP_ENV", || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
            assert!(env.is_development());
            assert!(!env.is_production());
        });
    }

    #[test]
    fn test_environment_production_case_insensitive() {
        for value in ["production", "PRODUCTION", "Production"] {
            temp_env::with_var("APP_ENV", Some(value), || {
                assert_eq!(Environment::from_env(), Environment::Production);
            });
        }
    }

    #[test]
    fn test_environment_unknown_defaults_to_development() {
        temp_env::with_var("APP_ENV", Some("staging"), || {
            assert_eq!(Environment::from_env(), Environment::Development);
        });
    }

    #[test]
    fn test_env_or_default() {
        temp_env::with_var("JOBS_TEST_VAR", Some("set"), || {
            assert_eq!(env_or_default("JOBS_TEST_VAR", "default"), "set");
        });
        temp_env::with_var_unset("JOBS_TEST_VAR", || {
            assert_eq!(env_or_default("JOBS_TEST_VAR", "default"), "default");
        });
    }

    #[test]
    fn test_env_required_missing() {
        temp_env::with_var_unset("JOBS_MISSING_REQUIRED", || {
            let err = env_required("JOBS_MISSING_REQUIRED").unwrap_err();
            assert!(err.to_string().contains("JOBS_MISSING_REQUIRED"));
            assert!(err.to_string().contains("required"));
        });
    }

    #[test]
    fn test_env_parse() {
        temp_env::with_var("JOBS_BATCH_TEST", Some(" 25 "), || {
            assert_eq!(env_parse("JOBS_BATCH_TEST", 10usize).unwrap(), 25);
        });
        temp_env::with_var_unset("JOBS_BATCH_TEST", || {
            assert_eq!(env_parse("JOBS_BATCH_TEST", 10usize).unwrap(), 10);
        });
    }

    #[test]
    fn test_env_parse_invalid() {
        temp_env::with_var("JOBS_BATCH_TEST", Some("lots"), || {
            let err = env_parse("JOBS_BATCH_TEST", 10usize).unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { ref key, .. } if key == "JOBS_BATCH_TEST"));
        });
    }

    #[test]
    fn test_env_parse_opt() {
        temp_env::with_var("JOBS_TIMEOUT_TEST", Some(""), || {
            assert_eq!(env_parse_opt::<u64>("JOBS_TIMEOUT_TEST").unwrap(), None);
        });
        temp_env::with_var("JOBS_TIMEOUT_TEST", Some("1500"), || {
            assert_eq!(env_parse_opt::<u64>("JOBS_TIMEOUT_TEST").unwrap(), Some(1500));
        });
    }
}
