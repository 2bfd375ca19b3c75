//! Process settings: TOML file, then environment overrides.

mod env;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::token::TokenPolicy;
use crate::credentials::{self, CredentialPool};
use crate::error::{ProxyError, Result};
use crate::forward::{
    DEFAULT_BASE_URL, DEFAULT_HOST, FilterRule, Forwarder, RequestFilter, UpstreamTarget,
};
use crate::upstream::ReqwestUpstream;

pub use env::{
    ENV_ADMIN_TOKEN, ENV_HOST, ENV_LOG_LEVEL, ENV_PORT, ENV_SECRETS_FILE, Env, parse_dotenv,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_secrets_file")]
    pub secrets_file: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default)]
    pub upstream: UpstreamSettings,
    #[serde(default)]
    pub tokens: TokenPolicy,
    #[serde(default)]
    pub server: ServerSettings,
    /// Extra rules, tried after the built-in ones.
    #[serde(default)]
    pub filters: Vec<FilterRule>,
    /// Directory of the settings file; relative secrets paths fall back to it.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

fn default_secrets_file() -> PathBuf {
    PathBuf::from("secrets.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            secrets_file: default_secrets_file(),
            log_level: default_log_level(),
            json_logs: false,
            upstream: UpstreamSettings::default(),
            tokens: TokenPolicy::default(),
            server: ServerSettings::default(),
            filters: Vec::new(),
            base_dir: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_read_timeout_secs() -> u64 {
    600
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            host: default_host(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Bearer token for `/admin/*`. Admin routes are disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
}

fn default_listen() -> String {
    "127.0.0.1:8899".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_token: None,
        }
    }
}

impl std::fmt::Debug for ServerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSettings")
            .field("listen", &self.listen)
            .field(
                "admin_token",
                &self.admin_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl ProxySettings {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| ProxyError::Settings {
            reason: format!("invalid settings TOML: {err}"),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ProxyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut settings = Self::from_toml_str(&raw)?;
        settings.base_dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf);
        Ok(settings)
    }

    pub fn apply_env(&mut self, env: &Env) -> Result<()> {
        if let Some(path) = env.get(ENV_SECRETS_FILE) {
            self.secrets_file = PathBuf::from(path);
        }
        if let Some(level) = env.get(ENV_LOG_LEVEL) {
            self.log_level = level.trim().to_ascii_lowercase();
        }
        if let Some(token) = env.get(ENV_ADMIN_TOKEN) {
            self.server.admin_token = Some(token.trim().to_string());
        }

        let host = env.get(ENV_HOST);
        let port = env.get(ENV_PORT);
        if host.is_some() || port.is_some() {
            let (current_host, current_port) = self
                .server
                .listen
                .rsplit_once(':')
                .unwrap_or((self.server.listen.as_str(), ""));
            let host = host.unwrap_or_else(|| current_host.to_string());
            let port = match port {
                Some(port) => port.trim().parse::<u16>().map_err(|_| ProxyError::Settings {
                    reason: format!("{ENV_PORT} must be a port number, got {port:?}"),
                })?,
                None => current_port.parse::<u16>().map_err(|_| ProxyError::Settings {
                    reason: format!("server.listen has no valid port: {}", self.server.listen),
                })?,
            };
            self.server.listen = format!("{}:{port}", host.trim());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.tokens.validate()?;
        let base_url = self.upstream.base_url.trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ProxyError::Settings {
                reason: format!("upstream.base_url must be an http(s) URL, got {base_url:?}"),
            });
        }
        if self.upstream.host.trim().is_empty() {
            return Err(ProxyError::Settings {
                reason: "upstream.host cannot be empty".to_string(),
            });
        }
        if self.upstream.connect_timeout_secs == 0 || self.upstream.read_timeout_secs == 0 {
            return Err(ProxyError::Settings {
                reason: "upstream timeouts must be greater than zero".to_string(),
            });
        }
        self.listen_addr()?;
        if self
            .server
            .admin_token
            .as_deref()
            .is_some_and(|token| token.trim().is_empty())
        {
            return Err(ProxyError::Settings {
                reason: "server.admin_token cannot be blank".to_string(),
            });
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen
            .trim()
            .parse()
            .map_err(|err| ProxyError::Settings {
                reason: format!("invalid server.listen {:?}: {err}", self.server.listen),
            })
    }

    pub fn load_credentials(&self) -> Result<CredentialPool> {
        credentials::load_file(&self.secrets_file, self.base_dir.as_deref())
    }

    pub fn forwarder(&self) -> Forwarder {
        Forwarder::new(
            UpstreamTarget {
                base_url: self.upstream.base_url.trim().to_string(),
                host: self.upstream.host.trim().to_string(),
            },
            RequestFilter::with_extra_rules(self.filters.iter().cloned()),
        )
    }

    pub fn upstream_client(&self) -> Result<ReqwestUpstream> {
        ReqwestUpstream::new(
            Duration::from_secs(self.upstream.connect_timeout_secs),
            Duration::from_secs(self.upstream.read_timeout_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() -> Result<()> {
        let settings = ProxySettings::from_toml_str("")?;
        assert_eq!(settings, ProxySettings::default());
        assert_eq!(settings.upstream.base_url, "https://flow.ciandt.com/flow-llm-proxy");
        assert_eq!(settings.tokens.ttl_seconds, 3600);
        assert_eq!(settings.tokens.refresh_margin_seconds, 300);
        assert_eq!(settings.listen_addr()?.port(), 8899);
        settings.validate()
    }

    #[test]
    fn parses_sections_and_filters() -> Result<()> {
        let settings = ProxySettings::from_toml_str(
            r#"
            secrets_file = "/etc/flow/secrets.json"
            json_logs = true

            [upstream]
            base_url = "http://127.0.0.1:9000/proxy"
            host = "localhost"

            [tokens]
            ttl_seconds = 600

            [server]
            listen = "0.0.0.0:8080"
            admin_token = "admin-secret"

            [[filters]]
            name = "strip-debug"
            query_params = ["debug"]
            "#,
        )?;
        settings.validate()?;
        assert!(settings.json_logs);
        assert_eq!(settings.tokens.refresh_margin_seconds, 300);
        assert_eq!(settings.upstream.read_timeout_secs, 600);
        assert_eq!(settings.filters.len(), 1);
        assert_eq!(settings.forwarder().filter().rules().len(), 2);
        assert!(!format!("{settings:?}").contains("admin-secret"));
        Ok(())
    }

    #[test]
    fn rejects_margin_not_below_ttl() -> Result<()> {
        let settings = ProxySettings::from_toml_str(
            "[tokens]\nttl_seconds = 300\nrefresh_margin_seconds = 300\n",
        )?;
        assert!(matches!(settings.validate(), Err(ProxyError::Settings { .. })));
        Ok(())
    }

    #[test]
    fn env_overrides_listen_and_secrets() -> Result<()> {
        let mut settings = ProxySettings::default();
        let env = Env::default()
            .with_var(ENV_PORT, "9100")
            .with_var(ENV_SECRETS_FILE, "other.json")
            .with_var(ENV_LOG_LEVEL, "DEBUG")
            .with_var(ENV_ADMIN_TOKEN, "root");
        settings.apply_env(&env)?;

        assert_eq!(settings.server.listen, "127.0.0.1:9100");
        assert_eq!(settings.secrets_file, PathBuf::from("other.json"));
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.server.admin_token.as_deref(), Some("root"));

        let env = Env::default().with_var(ENV_HOST, "0.0.0.0");
        settings.apply_env(&env)?;
        assert_eq!(settings.server.listen, "0.0.0.0:9100");
        Ok(())
    }

    #[test]
    fn env_rejects_bad_port() {
        let mut settings = ProxySettings::default();
        let env = Env::default().with_var(ENV_PORT, "not-a-port");
        assert!(settings.apply_env(&env).is_err());
    }

    #[test]
    fn load_records_base_dir_for_secrets() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("flow-proxy.toml"),
            "secrets_file = \"flow-proxy-settings-test-secrets.json\"\n",
        )
        .expect("write settings");
        std::fs::write(
            dir.path().join("flow-proxy-settings-test-secrets.json"),
            r#"[{"clientId": "c", "clientSecret": "s", "tenant": "t", "name": "only"}]"#,
        )
        .expect("write secrets");

        let settings = ProxySettings::load(&dir.path().join("flow-proxy.toml"))?;
        assert_eq!(settings.base_dir.as_deref(), Some(dir.path()));
        let pool = settings.load_credentials()?;
        assert_eq!(pool.records()[0].label(), "only");
        Ok(())
    }
}
