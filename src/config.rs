use std::fmt;
use std::str::FromStr;

use crate::embedding::openai::DEFAULT_EMBEDDING_MODEL;
use crate::providers::openai::OpenAiConfig;

/// Process configuration, read once at startup from the environment (with an
/// optional `.env` file loaded first).
#[derive(Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub openai: OpenAiConfig,
    pub cache: CacheConfig,
    pub redis: RedisConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .map(str::to_string)
                .to_vec(),
            allowed_headers: ["Content-Type", "Authorization"].map(str::to_string).to_vec(),
            allow_credentials: true,
            max_age: 86_400,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub enabled: bool,
    pub similarity_threshold: f64,
    pub ttl_secs: u64,
    pub embedding_model: String,
}

#[derive(Clone)]
pub struct RedisConfig {
    pub addr: String,
    pub password: String,
    pub db: u32,
    pub index_name: String,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.addr, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, self.addr, self.db)
        }
    }
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("addr", &self.addr)
            .field("password", &"<redacted>")
            .field("db", &self.db)
            .field("index_name", &self.index_name)
            .finish()
    }
}

impl Config {
    /// Load `.env` (when present) and parse the environment.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                port: env_parse("SERVER_PORT", 8080),
                read_timeout_secs: env_parse("SERVER_READ_TIMEOUT", 30),
                write_timeout_secs: env_parse("SERVER_WRITE_TIMEOUT", 30),
            },
            cors: CorsConfig {
                allowed_origins: env_list("CORS_ALLOWED_ORIGINS", &["*"]),
                allowed_methods: env_list(
                    "CORS_ALLOWED_METHODS",
                    &["GET", "POST", "PUT", "DELETE", "OPTIONS"],
                ),
                allowed_headers: env_list(
                    "CORS_ALLOWED_HEADERS",
                    &["Content-Type", "Authorization"],
                ),
                allow_credentials: env_parse("CORS_ALLOW_CREDENTIALS", true),
                max_age: env_parse("CORS_MAX_AGE", 86_400),
            },
            openai: OpenAiConfig {
                api_key: env_or("OPENAI_API_KEY", ""),
                base_url: env_or(
                    "OPENAI_BASE_URL",
                    crate::providers::openai::DEFAULT_BASE_URL,
                ),
                timeout_secs: env_parse("OPENAI_TIMEOUT", 60),
                max_retries: env_parse("OPENAI_MAX_RETRIES", 3),
            },
            cache: CacheConfig {
                enabled: env_parse("CACHE_ENABLED", false),
                similarity_threshold: env_parse(
                    "CACHE_SIMILARITY_THRESHOLD",
                    crate::cache::DEFAULT_SIMILARITY_THRESHOLD,
                ),
                ttl_secs: env_parse("CACHE_TTL_SECONDS", 3600),
                embedding_model: env_or("CACHE_EMBEDDING_MODEL", DEFAULT_EMBEDDING_MODEL),
            },
            redis: RedisConfig {
                addr: env_or("REDIS_ADDR", "127.0.0.1:6379"),
                password: env_or("REDIS_PASSWORD", ""),
                db: env_parse("REDIS_DB", 0),
                index_name: env_or("CACHE_INDEX_NAME", "calcifer-cache"),
            },
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        _ => default.iter().map(|item| item.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_url_includes_password_and_db() {
        let plain = RedisConfig {
            addr: "127.0.0.1:6379".to_string(),
            password: String::new(),
            db: 0,
            index_name: "calcifer-cache".to_string(),
        };
        assert_eq!(plain.url(), "redis://127.0.0.1:6379/0");

        let secured = RedisConfig {
            password: "hunter2".to_string(),
            db: 3,
            ..plain
        };
        assert_eq!(secured.url(), "redis://:hunter2@127.0.0.1:6379/3");
    }

    #[test]
    fn redis_debug_redacts_password() {
        let config = RedisConfig {
            addr: "127.0.0.1:6379".to_string(),
            password: "hunter2".to_string(),
            db: 0,
            index_name: "calcifer-cache".to_string(),
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
