//! Authorization for every tool call.
//!
//! Three trust models are supported and exactly one is active per process:
//!
//! - **Local**: polkit decides, possibly after an interactive consent prompt
//!   (see [`polkit`]).
//! - **Remote**: the caller presents a bearer token signed by an OpenID
//!   provider; read/write map to token scopes (see [`token`]).
//! - **Disabled**: static grants configured at startup. This is the explicit
//!   "no authorization" escape hatch and is logged as such.
//!
//! The backend is chosen once when the [`AuthArbiter`] is built and never
//! re-derived per call.

pub mod discovery;
pub mod polkit;
pub mod token;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::context::RequestContext;

pub use discovery::jwks_uri;
pub use polkit::PolkitAuthority;
pub use token::{JwksKeys, KeyResolver, TokenVerifier, VerifiedToken};

/// Timeout for consent prompts and job waits when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Audience a bearer token must be issued for.
pub const DEFAULT_AUDIENCE: &str = "sysgate";

pub const READ_SCOPE: &str = "mcp:read";
pub const WRITE_SCOPE: &str = "mcp:write";

/// Permission label passed to write checks for unit state changes.
pub const MANAGE_UNITS: &str = "manage-units";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("no bearer token presented")]
    MissingToken,
    #[error("{scope} not in scopes: [{}]", granted.join(", "))]
    MissingScope { scope: String, granted: Vec<String> },
    #[error("authorization broker error: {0}")]
    Broker(String),
    #[error("{0}")]
    Discovery(String),
    #[error("both local and remote authorization are configured")]
    ConfigurationConflict,
}

impl From<zbus::Error> for AuthError {
    fn from(err: zbus::Error) -> Self {
        AuthError::Broker(err.to_string())
    }
}

/// Scope literals and audience used by remote authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSettings {
    pub audience: String,
    pub read_scope: String,
    pub write_scope: String,
}

impl AuthSettings {
    /// Scopes advertised to clients, read first.
    pub fn supported_scopes(&self) -> Vec<String> {
        vec![self.read_scope.clone(), self.write_scope.clone()]
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            audience: DEFAULT_AUDIENCE.to_string(),
            read_scope: READ_SCOPE.to_string(),
            write_scope: WRITE_SCOPE.to_string(),
        }
    }
}

/// Static allow flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Grants {
    pub read: bool,
    pub write: bool,
}

impl Grants {
    pub const ALL: Grants = Grants {
        read: true,
        write: true,
    };
    pub const NONE: Grants = Grants {
        read: false,
        write: false,
    };
}

/// A local privilege broker.
///
/// A declined or timed-out consent prompt is `Ok(false)`; `Err` is reserved
/// for failures talking to the broker.
pub trait LocalAuthority: Send + Sync {
    fn is_read_authorized(&self) -> Result<bool, AuthError>;
    fn is_write_authorized(&self, permission: &str) -> Result<bool, AuthError>;
    fn deauthorize(&self) -> Result<(), AuthError>;
    fn close(&self) -> Result<(), AuthError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Disabled,
    Local,
    Remote,
}

impl AuthMode {
    /// Mode implied by which backends are present.
    ///
    /// Both present is a configuration defect and resolves to `Disabled`.
    pub fn resolve(local: bool, remote: bool) -> AuthMode {
        match (local, remote) {
            (true, false) => AuthMode::Local,
            (false, true) => AuthMode::Remote,
            (true, true) => {
                warn!("local and remote authorization both configured, treating as disabled");
                AuthMode::Disabled
            }
            (false, false) => AuthMode::Disabled,
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthMode::Disabled => "disabled",
            AuthMode::Local => "local",
            AuthMode::Remote => "remote",
        };
        f.write_str(name)
    }
}

enum Backend {
    Disabled(Grants),
    Local(Box<dyn LocalAuthority>),
    Remote(Arc<TokenVerifier>),
}

/// The single authorization decision point of the process.
pub struct AuthArbiter {
    backend: Backend,
    timeout: Duration,
}

impl AuthArbiter {
    /// Authorization off; every check answers with `grants`.
    pub fn disabled(grants: Grants) -> Self {
        warn!(
            read = grants.read,
            write = grants.write,
            "authorization disabled, using static grants"
        );
        Self {
            backend: Backend::Disabled(grants),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn local(authority: Box<dyn LocalAuthority>, timeout: Duration) -> Self {
        Self {
            backend: Backend::Local(authority),
            timeout,
        }
    }

    pub fn remote(verifier: Arc<TokenVerifier>, timeout: Duration) -> Self {
        Self {
            backend: Backend::Remote(verifier),
            timeout,
        }
    }

    /// Build from optional backends, rejecting the local+remote combination.
    pub fn from_parts(
        local: Option<Box<dyn LocalAuthority>>,
        remote: Option<Arc<TokenVerifier>>,
        grants: Grants,
        timeout: Duration,
    ) -> Result<Self, AuthError> {
        let arbiter = match (local, remote) {
            (Some(_), Some(_)) => return Err(AuthError::ConfigurationConflict),
            (Some(authority), None) => Self::local(authority, timeout),
            (None, Some(verifier)) => Self::remote(verifier, timeout),
            (None, None) => Self::disabled(grants).with_timeout(timeout),
        };
        Ok(arbiter)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn mode(&self) -> AuthMode {
        match self.backend {
            Backend::Disabled(_) => AuthMode::Disabled,
            Backend::Local(_) => AuthMode::Local,
            Backend::Remote(_) => AuthMode::Remote,
        }
    }

    /// Bound for consent prompts and job waits.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The verifier, when remote mode is active.
    pub fn verifier(&self) -> Option<&Arc<TokenVerifier>> {
        match &self.backend {
            Backend::Remote(verifier) => Some(verifier),
            _ => None,
        }
    }

    pub fn is_read_authorized(&self, ctx: &RequestContext) -> Result<bool, AuthError> {
        match &self.backend {
            Backend::Disabled(grants) => {
                debug!(allowed = grants.read, "read check with authorization disabled");
                Ok(grants.read)
            }
            Backend::Local(authority) => authority.is_read_authorized(),
            Backend::Remote(verifier) => verifier.check_read(ctx.token()),
        }
    }

    pub fn is_write_authorized(
        &self,
        ctx: &RequestContext,
        permission: &str,
    ) -> Result<bool, AuthError> {
        match &self.backend {
            Backend::Disabled(grants) => {
                debug!(
                    allowed = grants.write,
                    permission, "write check with authorization disabled"
                );
                Ok(grants.write)
            }
            Backend::Local(authority) => authority.is_write_authorized(permission),
            Backend::Remote(verifier) => verifier.check_write(ctx.token()),
        }
    }

    /// Drop any interactive grant held for this process. No-op unless local.
    pub fn deauthorize(&self) -> Result<(), AuthError> {
        match &self.backend {
            Backend::Local(authority) => authority.deauthorize(),
            _ => Ok(()),
        }
    }

    pub fn close(&self) -> Result<(), AuthError> {
        match &self.backend {
            Backend::Local(authority) => authority.close(),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for AuthArbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthArbiter")
            .field("mode", &self.mode())
            .field("timeout", &self.timeout)
            .finish()
    }
}
