use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::clock::{Clock, SystemClock};
use crate::credentials::{CredentialRecord, REQUIRED_FIELDS};
use crate::error::{ProxyError, Result};

const ALGORITHM: Algorithm = Algorithm::HS256;

/// Produces a bearer token for a credential.
pub trait TokenSource: Send + Sync {
    fn mint(&self, credential: &CredentialRecord) -> Result<Token>;

    fn cache_stats(&self) -> Option<CacheStats> {
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPolicy {
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_refresh_margin_seconds")]
    pub refresh_margin_seconds: u64,
}

fn default_ttl_seconds() -> u64 {
    3600
}

fn default_refresh_margin_seconds() -> u64 {
    300
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            refresh_margin_seconds: default_refresh_margin_seconds(),
        }
    }
}

impl TokenPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.ttl_seconds == 0 {
            return Err(ProxyError::Settings {
                reason: "tokens.ttl_seconds must be greater than zero".to_string(),
            });
        }
        if self.refresh_margin_seconds >= self.ttl_seconds {
            return Err(ProxyError::Settings {
                reason: format!(
                    "tokens.refresh_margin_seconds ({}) must be less than tokens.ttl_seconds ({})",
                    self.refresh_margin_seconds, self.ttl_seconds
                ),
            });
        }
        Ok(())
    }

    fn is_fresh(&self, token: &Token, now: u64) -> bool {
        now < token.expires_at.saturating_sub(self.refresh_margin_seconds)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub minted_at: u64,
    pub expires_at: u64,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("minted_at", &self.minted_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Token {
    pub fn authorization_header_value(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

/// The complete claim set of a minted token. Nothing else is ever embedded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "clientSecret")]
    pub client_secret: String,
    pub tenant: String,
}

impl std::fmt::Debug for TokenClaims {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenClaims")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("tenant", &self.tenant)
            .finish()
    }
}

impl From<&CredentialRecord> for TokenClaims {
    fn from(credential: &CredentialRecord) -> Self {
        Self {
            client_id: credential.id.clone(),
            client_secret: credential.secret.clone(),
            tenant: credential.tenant.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
}

/// Mints HS256 tokens signed with each credential's own secret and caches them by credential id.
pub struct TokenIssuer {
    policy: TokenPolicy,
    clock: Arc<dyn Clock>,
    cache: Mutex<HashMap<String, Token>>,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("policy", &self.policy)
            .field("cache", &self.cache_stats())
            .finish()
    }
}

impl Default for TokenIssuer {
    fn default() -> Self {
        Self::new(TokenPolicy::default())
    }
}

impl TokenIssuer {
    pub fn new(policy: TokenPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: TokenPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> TokenPolicy {
        self.policy
    }

    pub fn mint(&self, credential: &CredentialRecord) -> Result<Token> {
        let missing = credential.missing_fields();
        if !missing.is_empty() {
            error!(
                credential = %credential.label(),
                missing = %missing.join(", "),
                "credential is missing required fields"
            );
            return Err(ProxyError::InvalidCredential { missing });
        }

        let now = self.clock.now_epoch_seconds();
        if let Some(token) = self.cached(&credential.id, now) {
            debug!(credential = %credential.label(), "token cache hit");
            return Ok(token);
        }

        // Signing runs outside the lock; two threads missing together may both sign.
        let value = sign(credential)?;
        if !validate_token(&value, &credential.secret) {
            error!(credential = %credential.label(), "generated token failed validation");
            return Err(ProxyError::TokenGeneration {
                reason: "generated token failed validation".to_string(),
            });
        }

        let token = Token {
            value,
            minted_at: now,
            expires_at: now.saturating_add(self.policy.ttl_seconds),
        };
        self.lock_cache()
            .insert(credential.id.clone(), token.clone());
        info!(credential = %credential.label(), "generated token");
        Ok(token)
    }

    pub fn clear_cache(&self) {
        let mut cache = self.lock_cache();
        let cleared = cache.len();
        cache.clear();
        debug!(cleared, "token cache cleared");
    }

    /// Counts fresh and stale entries without evicting anything.
    pub fn cache_stats(&self) -> CacheStats {
        let now = self.clock.now_epoch_seconds();
        let cache = self.lock_cache();
        let valid = cache
            .values()
            .filter(|token| self.policy.is_fresh(token, now))
            .count();
        CacheStats {
            total: cache.len(),
            valid,
            expired: cache.len() - valid,
        }
    }

    fn cached(&self, id: &str, now: u64) -> Option<Token> {
        self.lock_cache()
            .get(id)
            .filter(|token| self.policy.is_fresh(token, now))
            .cloned()
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<String, Token>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TokenSource for TokenIssuer {
    fn mint(&self, credential: &CredentialRecord) -> Result<Token> {
        TokenIssuer::mint(self, credential)
    }

    fn cache_stats(&self) -> Option<CacheStats> {
        Some(TokenIssuer::cache_stats(self))
    }
}

fn sign(credential: &CredentialRecord) -> Result<String> {
    let claims = TokenClaims::from(credential);
    jsonwebtoken::encode(
        &Header::new(ALGORITHM),
        &claims,
        &EncodingKey::from_secret(credential.secret.as_bytes()),
    )
    .map_err(|err| ProxyError::TokenGeneration {
        reason: format!("JWT encoding error: {err}"),
    })
}

/// Checks the signature against `secret` and that every required claim is present.
///
/// Expiry is not checked: minted tokens carry no `exp` claim.
pub fn validate_token(token: &str, secret: &str) -> bool {
    let mut validation = Validation::new(ALGORITHM);
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let decoded = match jsonwebtoken::decode::<Map<String, Value>>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    ) {
        Ok(decoded) => decoded,
        Err(err) => {
            debug!(error = %err, "token validation failed");
            return false;
        }
    };

    match REQUIRED_FIELDS
        .iter()
        .find(|field| !decoded.claims.contains_key(**field))
    {
        Some(field) => {
            debug!(field, "decoded token missing required claim");
            false
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_support::ManualClock;
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    const START: u64 = 1_700_000_000;

    fn credential(id: &str, secret: &str) -> CredentialRecord {
        CredentialRecord::new(id, secret, "tenant-a").expect("credential")
    }

    fn issuer_at(clock: &Arc<ManualClock>) -> TokenIssuer {
        TokenIssuer::with_clock(TokenPolicy::default(), clock.clone())
    }

    fn payload(token: &str) -> Map<String, Value> {
        let part = token.split('.').nth(1).expect("payload segment");
        let bytes = URL_SAFE_NO_PAD.decode(part).expect("base64 payload");
        serde_json::from_slice(&bytes).expect("json payload")
    }

    #[test]
    fn cache_hit_returns_same_token() -> Result<()> {
        let clock = Arc::new(ManualClock::new(START));
        let issuer = issuer_at(&clock);
        let record = credential("client-1", "secret-1");

        let first = issuer.mint(&record)?;
        clock.advance(60);
        let second = issuer.mint(&record)?;

        assert_eq!(first.value, second.value);
        assert_eq!(second.minted_at, START);
        assert_eq!(second.expires_at, START + 3600);
        assert_eq!(issuer.cache_stats().total, 1);
        Ok(())
    }

    #[test]
    fn remints_inside_refresh_margin() -> Result<()> {
        let clock = Arc::new(ManualClock::new(START));
        let issuer = issuer_at(&clock);
        let record = credential("client-1", "secret-1");

        let first = issuer.mint(&record)?;
        clock.set(START + 3600 - 300);
        let second = issuer.mint(&record)?;

        assert_eq!(first.minted_at, START);
        assert_eq!(second.minted_at, START + 3300);
        assert_eq!(issuer.cache_stats().total, 1);
        assert_eq!(issuer.cache_stats().valid, 1);
        Ok(())
    }

    #[test]
    fn distinct_credentials_get_distinct_tokens() -> Result<()> {
        let clock = Arc::new(ManualClock::new(START));
        let issuer = issuer_at(&clock);

        let a = issuer.mint(&credential("client-a", "secret-a"))?;
        let b = issuer.mint(&credential("client-b", "secret-b"))?;

        assert_ne!(a.value, b.value);
        assert_eq!(issuer.cache_stats().total, 2);
        Ok(())
    }

    #[test]
    fn claims_are_exactly_id_secret_tenant() -> Result<()> {
        let issuer = TokenIssuer::default();
        let record = credential("client-1", "secret-1").with_display_name("primary");

        let token = issuer.mint(&record)?;
        let claims = payload(&token.value);

        let mut keys: Vec<&str> = claims.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["clientId", "clientSecret", "tenant"]);
        assert_eq!(claims["clientId"], "client-1");
        assert_eq!(claims["clientSecret"], "secret-1");
        assert_eq!(claims["tenant"], "tenant-a");
        Ok(())
    }

    #[test]
    fn mint_rejects_incomplete_credential() {
        let issuer = TokenIssuer::default();
        let record = CredentialRecord {
            id: "client-1".to_string(),
            secret: "   ".to_string(),
            tenant: String::new(),
            display_name: None,
        };

        let err = issuer.mint(&record).unwrap_err();
        let ProxyError::InvalidCredential { missing } = err else {
            panic!("expected invalid credential error");
        };
        assert_eq!(missing, vec!["clientSecret", "tenant"]);
        assert_eq!(issuer.cache_stats().total, 0);
    }

    #[test]
    fn validate_token_rejects_wrong_secret_and_garbage() -> Result<()> {
        let issuer = TokenIssuer::default();
        let token = issuer.mint(&credential("client-1", "secret-1"))?;

        assert!(validate_token(&token.value, "secret-1"));
        assert!(!validate_token(&token.value, "other-secret"));
        assert!(!validate_token("not.a.token", "secret-1"));
        assert!(!validate_token("", "secret-1"));
        Ok(())
    }

    #[test]
    fn validate_token_requires_all_claims() {
        let mut partial = Map::new();
        partial.insert("clientId".to_string(), Value::from("client-1"));
        let token = jsonwebtoken::encode(
            &Header::new(ALGORITHM),
            &partial,
            &EncodingKey::from_secret(b"secret-1"),
        )
        .expect("encode");

        assert!(!validate_token(&token, "secret-1"));
    }

    #[test]
    fn stats_count_stale_entries_without_evicting() -> Result<()> {
        let clock = Arc::new(ManualClock::new(START));
        let issuer = issuer_at(&clock);
        issuer.mint(&credential("client-a", "secret-a"))?;
        clock.advance(3400);
        issuer.mint(&credential("client-b", "secret-b"))?;

        let stats = issuer.cache_stats();
        assert_eq!(
            stats,
            CacheStats {
                total: 2,
                valid: 1,
                expired: 1
            }
        );
        assert_eq!(issuer.cache_stats().total, 2);
        Ok(())
    }

    #[test]
    fn clear_cache_empties_entries() -> Result<()> {
        let issuer = TokenIssuer::default();
        issuer.mint(&credential("client-a", "secret-a"))?;
        issuer.clear_cache();
        assert_eq!(issuer.cache_stats(), CacheStats::default());
        Ok(())
    }

    #[test]
    fn concurrent_mints_share_one_entry() {
        let issuer = Arc::new(TokenIssuer::default());
        let record = Arc::new(credential("client-1", "secret-1"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let issuer = issuer.clone();
                let record = record.clone();
                std::thread::spawn(move || issuer.mint(&record).map(|token| token.value))
            })
            .collect();

        let values: Vec<String> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread").expect("mint"))
            .collect();
        assert!(values.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(issuer.cache_stats().total, 1);
    }

    #[test]
    fn policy_rejects_margin_not_below_ttl() {
        let policy = TokenPolicy {
            ttl_seconds: 300,
            refresh_margin_seconds: 300,
        };
        assert!(policy.validate().is_err());
        assert!(TokenPolicy::default().validate().is_ok());
    }

    #[test]
    fn debug_output_redacts_token_value() -> Result<()> {
        let token = TokenIssuer::default().mint(&credential("client-1", "secret-1"))?;
        let rendered = format!("{token:?}");
        assert!(!rendered.contains(&token.value));
        Ok(())
    }
}
