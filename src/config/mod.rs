use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8080"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the crawl queue
    pub redis_url: String,

    /// OpenAI API key for screenshot descriptions. Only the worker needs it.
    #[serde(default)]
    pub openai_api_key: Option<String>,

    /// Vision model used for descriptions
    #[serde(default = "default_openai_model")]
    pub openai_model: String,

    /// Return a fixed description instead of calling OpenAI. Accepts
    /// `1`/`0` as well as `true`/`false`.
    #[serde(default, deserialize_with = "flag")]
    pub openai_mock: bool,

    /// Upper bound on one description request, connect to last byte
    #[serde(default = "default_openai_timeout_secs")]
    pub openai_timeout_secs: u64,

    /// How long a pending job absorbs duplicate submissions of its URL
    #[serde(default = "default_freshness_window_secs")]
    pub freshness_window_secs: u64,

    /// Redeliveries allowed before a message is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Names this worker's in-flight list; must be unique per running
    /// worker and stable across its restarts. Derived from the hostname
    /// when unset.
    #[serde(default)]
    pub worker_id: Option<String>,

    /// Explicit Chrome/Chromium executable
    #[serde(default)]
    pub chromium_path: Option<String>,

    #[serde(default = "default_robots_timeout_secs")]
    pub robots_timeout_secs: u64,

    #[serde(default = "default_navigation_timeout_secs")]
    pub navigation_timeout_secs: u64,
}

fn flag<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let raw = String::deserialize(deserializer)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(serde::de::Error::custom(format!("invalid flag: {other}"))),
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o".to_string()
}

fn default_freshness_window_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    2
}

fn default_openai_timeout_secs() -> u64 {
    60
}

fn derived_worker_id(hostname: Option<String>, pid: u32) -> String {
    match hostname.map(|h| h.trim().to_string()).filter(|h| !h.is_empty()) {
        Some(host) => format!("worker-{host}"),
        None => format!("worker-pid-{pid}"),
    }
}

fn local_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
}

fn default_robots_timeout_secs() -> u64 {
    20
}

fn default_navigation_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn freshness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.freshness_window_secs as i64)
    }

    pub fn robots_timeout(&self) -> Duration {
        Duration::from_secs(self.robots_timeout_secs)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    pub fn openai_timeout(&self) -> Duration {
        Duration::from_secs(self.openai_timeout_secs)
    }

    /// `WORKER_ID`, else `worker-<hostname>`. Several workers on one host
    /// must set `WORKER_ID` explicitly.
    pub fn worker_id(&self) -> String {
        self.worker_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| derived_worker_id(local_hostname(), std::process::id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_env() {
        let vars = vec![
            ("DATABASE_URL".to_string(), "postgres://localhost/crawl".to_string()),
            ("REDIS_URL".to_string(), "redis://localhost".to_string()),
        ];
        let config: AppConfig = envy::from_iter(vars).unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.freshness_window(), chrono::Duration::minutes(5));
        assert_eq!(config.robots_timeout(), Duration::from_secs(20));
        assert!(!config.openai_mock);
        assert!(config.openai_api_key.is_none());
        assert_eq!(config.openai_timeout(), Duration::from_secs(60));
        assert!(config.worker_id.is_none());
    }

    #[test]
    fn test_worker_id_follows_host() {
        assert_eq!(
            derived_worker_id(Some("crawler-7f9c\n".to_string()), 42),
            "worker-crawler-7f9c"
        );
        assert_eq!(derived_worker_id(Some("  ".to_string()), 42), "worker-pid-42");
        assert_eq!(derived_worker_id(None, 42), "worker-pid-42");
        assert_ne!(
            derived_worker_id(Some("host-a".to_string()), 1),
            derived_worker_id(Some("host-b".to_string()), 1)
        );
    }

    #[test]
    fn test_explicit_worker_id_wins() {
        let vars = vec![
            ("DATABASE_URL".to_string(), "postgres://localhost/crawl".to_string()),
            ("REDIS_URL".to_string(), "redis://localhost".to_string()),
            ("WORKER_ID".to_string(), "crawler-a".to_string()),
            ("OPENAI_TIMEOUT_SECS".to_string(), "5".to_string()),
        ];
        let config: AppConfig = envy::from_iter(vars).unwrap();
        assert_eq!(config.worker_id(), "crawler-a");
        assert_eq!(config.openai_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_mock_toggle() {
        let vars = vec![
            ("DATABASE_URL".to_string(), "postgres://localhost/crawl".to_string()),
            ("REDIS_URL".to_string(), "redis://localhost".to_string()),
            ("OPENAI_MOCK".to_string(), "true".to_string()),
            ("MAX_RETRIES".to_string(), "4".to_string()),
        ];
        let config: AppConfig = envy::from_iter(vars).unwrap();

        assert!(config.openai_mock);
        assert_eq!(config.max_retries, 4);
    }

    #[test]
    fn test_mock_toggle_numeric() {
        let vars = vec![
            ("DATABASE_URL".to_string(), "postgres://localhost/crawl".to_string()),
            ("REDIS_URL".to_string(), "redis://localhost".to_string()),
            ("OPENAI_MOCK".to_string(), "1".to_string()),
        ];
        let config: AppConfig = envy::from_iter(vars).unwrap();
        assert!(config.openai_mock);

        let vars = vec![
            ("DATABASE_URL".to_string(), "postgres://localhost/crawl".to_string()),
            ("REDIS_URL".to_string(), "redis://localhost".to_string()),
            ("OPENAI_MOCK".to_string(), "maybe".to_string()),
        ];
        assert!(envy::from_iter::<_, AppConfig>(vars).is_err());
    }
}
