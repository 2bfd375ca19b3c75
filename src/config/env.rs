use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{ProxyError, Result};

pub const ENV_SECRETS_FILE: &str = "FLOW_PROXY_SECRETS_FILE";
pub const ENV_LOG_LEVEL: &str = "FLOW_PROXY_LOG_LEVEL";
pub const ENV_HOST: &str = "FLOW_PROXY_HOST";
pub const ENV_PORT: &str = "FLOW_PROXY_PORT";
pub const ENV_ADMIN_TOKEN: &str = "FLOW_PROXY_ADMIN_TOKEN";

/// Variable lookup: values from a `.env` file win over the process environment.
/// Blank values count as unset.
#[derive(Clone, Default)]
pub struct Env {
    overrides: BTreeMap<String, String>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Values may be secrets; only show which keys are set.
        f.debug_struct("Env")
            .field("override_keys", &self.overrides.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Env {
    pub fn from_dotenv(contents: &str) -> Self {
        Self {
            overrides: parse_dotenv(contents),
        }
    }

    /// Reads a `.env` file; a missing file yields an empty override set.
    pub fn from_dotenv_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(Self::from_dotenv(&contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ProxyError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.overrides
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
            .filter(|value| !value.trim().is_empty())
    }
}

/// `KEY=value` lines; `#` comments, `export ` prefixes and matching outer quotes are handled.
pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").map_or(line, str::trim_start);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            let value = unquote(value.trim());
            (!key.is_empty() && !value.trim().is_empty())
                .then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| {
            value
                .strip_prefix(quote)
                .and_then(|inner| inner.strip_suffix(quote))
        })
        .unwrap_or(value)
}
