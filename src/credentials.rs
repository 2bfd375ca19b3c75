//! Credential store: loads the credential array once at startup and validates it.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{error, info};

use crate::error::{FieldIssue, ProxyError, RecordIssue, Result};

pub const FIELD_ID: &str = "clientId";
pub const FIELD_SECRET: &str = "clientSecret";
pub const FIELD_TENANT: &str = "tenant";
pub const FIELD_NAME: &str = "name";

pub const REQUIRED_FIELDS: [&str; 3] = [FIELD_ID, FIELD_SECRET, FIELD_TENANT];

const LABEL_ID_CHARS: usize = 8;

/// One tenant's authentication identity.
///
/// Records are shared behind `Arc` once loaded and never mutated afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub id: String,
    pub secret: String,
    pub tenant: String,
    pub display_name: Option<String>,
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .field("tenant", &self.tenant)
            .field("display_name", &self.display_name)
            .finish()
    }
}

impl CredentialRecord {
    pub fn new(
        id: impl Into<String>,
        secret: impl Into<String>,
        tenant: impl Into<String>,
    ) -> Result<Self> {
        let record = Self {
            id: id.into(),
            secret: secret.into(),
            tenant: tenant.into(),
            display_name: None,
        };
        let missing = record.missing_fields();
        if !missing.is_empty() {
            return Err(ProxyError::InvalidCredential { missing });
        }
        Ok(record)
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.display_name = (!name.trim().is_empty()).then_some(name);
        self
    }

    /// Required fields that are empty or whitespace-only.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            (FIELD_ID, &self.id),
            (FIELD_SECRET, &self.secret),
            (FIELD_TENANT, &self.tenant),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| field)
        .collect()
    }

    /// Human identifier for logs. Never includes the secret.
    pub fn label(&self) -> String {
        if let Some(name) = self.display_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }
        let id = self.id.trim();
        if id.is_empty() {
            return "config-unnamed".to_string();
        }
        let prefix: String = id.chars().take(LABEL_ID_CHARS).collect();
        if prefix.len() < id.len() {
            format!("config-{prefix}...")
        } else {
            format!("config-{prefix}")
        }
    }
}

/// A validated, non-empty set of credential records.
#[derive(Debug, Clone)]
pub struct CredentialPool {
    records: Vec<CredentialRecord>,
}

impl CredentialPool {
    pub fn new(records: Vec<CredentialRecord>) -> Result<Self> {
        if records.is_empty() {
            return Err(ProxyError::ConfigEmpty);
        }
        Ok(Self { records })
    }

    pub fn records(&self) -> &[CredentialRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<CredentialRecord> {
        self.records
    }
}

/// Parses a JSON credential array and validates every record.
pub fn load(bytes: &[u8]) -> Result<CredentialPool> {
    let value: Value = serde_json::from_slice(bytes).map_err(|err| {
        error!(error = %err, "credential file is not valid JSON");
        ProxyError::ConfigFormat {
            reason: format!("invalid JSON: {err}"),
        }
    })?;

    let Value::Array(items) = value else {
        let found = json_type_name(&value);
        error!(found, "credential file must contain an array");
        return Err(ProxyError::ConfigFormat {
            reason: format!("secrets file must contain an array, got {found}"),
        });
    };

    if items.is_empty() {
        error!("credential array is empty");
        return Err(ProxyError::ConfigEmpty);
    }

    let records = validate_all(&items)?;
    info!(count = records.len(), "loaded and validated credential records");
    CredentialPool::new(records)
}

/// Reads `path` (resolved against the working directory, then `base_dir`) and runs [`load`].
pub fn load_file(path: impl AsRef<Path>, base_dir: Option<&Path>) -> Result<CredentialPool> {
    let original = path.as_ref();
    let resolved = resolve_config_path(original, base_dir);
    if !resolved.exists() {
        error!(
            resolved = %resolved.display(),
            original = %original.display(),
            "secrets file not found"
        );
        return Err(ProxyError::ConfigNotFound {
            resolved: resolved.display().to_string(),
            original: original.display().to_string(),
        });
    }

    info!(path = %resolved.display(), "loading credentials");
    let bytes = std::fs::read(&resolved).map_err(|source| ProxyError::Io {
        path: resolved.display().to_string(),
        source,
    })?;
    load(&bytes)
}

/// Absolute paths are kept; relative ones are tried against the working directory, then
/// `base_dir`, and otherwise reported relative to the working directory.
pub fn resolve_config_path(path: &Path, base_dir: Option<&Path>) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    if path.exists() {
        return std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    }
    if let Some(base) = base_dir {
        let candidate = base.join(path);
        if candidate.exists() {
            return candidate;
        }
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Validates every record without short-circuiting and reports all failures together.
pub fn validate_all(items: &[Value]) -> Result<Vec<CredentialRecord>> {
    let mut records = Vec::with_capacity(items.len());
    let mut failures = Vec::new();

    for (index, item) in items.iter().enumerate() {
        match validate_one(item) {
            Ok(record) => records.push(record),
            Err(issues) => {
                let failure = RecordIssue { index, issues };
                error!(%failure, "invalid credential record");
                failures.push(failure);
            }
        }
    }

    if failures.is_empty() {
        Ok(records)
    } else {
        Err(ProxyError::ConfigValidation { failures })
    }
}

/// Checks presence, type and non-emptiness of the required fields, reporting each problem.
pub fn validate_one(item: &Value) -> std::result::Result<CredentialRecord, Vec<FieldIssue>> {
    let Value::Object(map) = item else {
        return Err(vec![FieldIssue::NotAnObject {
            found: json_type_name(item),
        }]);
    };

    let [id, secret, tenant] = REQUIRED_FIELDS.map(|field| required_string(map, field));
    let (id, secret, tenant) = match (id, secret, tenant) {
        (Ok(id), Ok(secret), Ok(tenant)) => (id, secret, tenant),
        (id, secret, tenant) => {
            return Err([id.err(), secret.err(), tenant.err()]
                .into_iter()
                .flatten()
                .collect());
        }
    };
    let mut record = CredentialRecord {
        id,
        secret,
        tenant,
        display_name: None,
    };
    if let Some(Value::String(name)) = map.get(FIELD_NAME) {
        record = record.with_display_name(name.clone());
    }
    Ok(record)
}

fn required_string(
    map: &Map<String, Value>,
    field: &'static str,
) -> std::result::Result<String, FieldIssue> {
    match map.get(field) {
        None => Err(FieldIssue::Missing(field)),
        Some(Value::String(value)) if value.trim().is_empty() => Err(FieldIssue::Empty(field)),
        Some(Value::String(value)) => Ok(value.clone()),
        Some(other) => Err(FieldIssue::WrongType {
            field,
            found: json_type_name(other),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
