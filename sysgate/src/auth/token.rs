//! Bearer token verification against a JSON Web Key Set.
//!
//! Verification is a pure call: it returns a [`VerifiedToken`] that the
//! transport stores in the request's [`RequestContext`](crate::context::RequestContext).
//! Nothing about the last verified token is kept on the verifier.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{AuthError, AuthSettings};

/// Minimum spacing between JWKS refetches triggered by unknown key ids.
const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Resolves the verification key for a token's `kid` header.
pub trait KeyResolver: Send + Sync {
    fn resolve(&self, kid: Option<&str>) -> Result<DecodingKey, AuthError>;
}

/// A single fixed key, regardless of `kid`.
pub struct StaticKey {
    key: DecodingKey,
}

impl StaticKey {
    pub fn new(key: DecodingKey) -> Self {
        Self { key }
    }
}

impl KeyResolver for StaticKey {
    fn resolve(&self, _kid: Option<&str>) -> Result<DecodingKey, AuthError> {
        Ok(self.key.clone())
    }
}

/// Keys published at a provider's `jwks_uri`.
pub struct JwksKeys {
    uri: String,
    client: Client,
    keys: RwLock<JwkSet>,
    last_refresh: Mutex<Option<Instant>>,
}

impl JwksKeys {
    /// Fetch the key set once; later fetches happen only for unknown key ids.
    pub fn fetch(uri: impl Into<String>) -> Result<Self, AuthError> {
        Self::fetch_with_client(Client::new(), uri)
    }

    pub fn fetch_with_client(client: Client, uri: impl Into<String>) -> Result<Self, AuthError> {
        let uri = uri.into();
        let keys = download(&client, &uri)?;
        info!(%uri, keys = keys.keys.len(), "loaded JWKS");
        Ok(Self {
            uri,
            client,
            keys: RwLock::new(keys),
            last_refresh: Mutex::new(None),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn lookup(&self, kid: Option<&str>) -> Option<Jwk> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        match kid {
            Some(kid) => keys.find(kid).cloned(),
            // Without a kid only an unambiguous set can be used.
            None if keys.keys.len() == 1 => keys.keys.first().cloned(),
            None => None,
        }
    }

    fn refresh(&self) -> Result<bool, AuthError> {
        let mut last = self.last_refresh.lock().unwrap_or_else(|e| e.into_inner());
        if last.is_some_and(|at| at.elapsed() < REFRESH_INTERVAL) {
            return Ok(false);
        }
        *last = Some(Instant::now());
        let fresh = download(&self.client, &self.uri)?;
        debug!(uri = %self.uri, keys = fresh.keys.len(), "refreshed JWKS");
        *self.keys.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        Ok(true)
    }
}

impl KeyResolver for JwksKeys {
    fn resolve(&self, kid: Option<&str>) -> Result<DecodingKey, AuthError> {
        let jwk = match self.lookup(kid) {
            Some(jwk) => jwk,
            None => {
                if let Err(err) = self.refresh() {
                    warn!(error = %err, "JWKS refresh failed");
                }
                self.lookup(kid).ok_or_else(|| {
                    debug!(?kid, "no matching key in JWKS");
                    AuthError::InvalidToken
                })?
            }
        };
        DecodingKey::from_jwk(&jwk).map_err(|err| {
            debug!(error = %err, "unusable JWK");
            AuthError::InvalidToken
        })
    }
}

impl fmt::Debug for JwksKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwksKeys").field("uri", &self.uri).finish()
    }
}

fn download(client: &Client, uri: &str) -> Result<JwkSet, AuthError> {
    client
        .get(uri)
        .send()
        .and_then(|response| response.error_for_status())
        .map_err(|err| AuthError::Discovery(format!("failed to get JWKS: {err}")))?
        .json::<JwkSet>()
        .map_err(|err| AuthError::Discovery(format!("invalid JWKS: {err}")))
}

#[derive(Debug, Deserialize)]
struct Claims {
    exp: i64,
    #[serde(default)]
    scope: Option<String>,
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    scopes: Vec<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl VerifiedToken {
    pub fn new(scopes: Vec<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { scopes, expires_at }
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Split a space-delimited `scope` claim.
pub fn parse_scopes(claim: &str) -> Vec<String> {
    claim.split_whitespace().map(str::to_string).collect()
}

pub struct TokenVerifier {
    keys: Arc<dyn KeyResolver>,
    settings: AuthSettings,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(keys: Arc<dyn KeyResolver>, settings: AuthSettings) -> Self {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[settings.audience.as_str()]);
        Self {
            keys,
            settings,
            validation,
        }
    }

    /// Verify signature, algorithm, audience and expiry of `token`.
    pub fn verify(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        let header = decode_header(token).map_err(|err| {
            debug!(error = %err, "couldn't parse token header");
            AuthError::InvalidToken
        })?;
        let key = self.keys.resolve(header.kid.as_deref())?;
        let data = decode::<Claims>(token, &key, &self.validation).map_err(|err| {
            debug!(error = %err, "couldn't verify token");
            AuthError::InvalidToken
        })?;

        let scopes = parse_scopes(data.claims.scope.as_deref().unwrap_or_default());
        let expires_at = DateTime::from_timestamp(data.claims.exp, 0);
        debug!(?scopes, ?expires_at, "token verified");
        Ok(VerifiedToken::new(scopes, expires_at))
    }

    pub fn check_read(&self, token: Option<&VerifiedToken>) -> Result<bool, AuthError> {
        require_scope(token, &self.settings.read_scope)
    }

    pub fn check_write(&self, token: Option<&VerifiedToken>) -> Result<bool, AuthError> {
        require_scope(token, &self.settings.write_scope)
    }
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("settings", &self.settings)
            .finish()
    }
}

fn require_scope(token: Option<&VerifiedToken>, scope: &str) -> Result<bool, AuthError> {
    let token = token.ok_or(AuthError::MissingToken)?;
    if token.has_scope(scope) {
        Ok(true)
    } else {
        Err(AuthError::MissingScope {
            scope: scope.to_string(),
            granted: token.scopes.clone(),
        })
    }
}
