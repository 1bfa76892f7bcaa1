//! Per-request execution context.
//!
//! A [`RequestContext`] travels with every tool call. It carries the bearer
//! token verified by the transport (remote mode only) and a [`CancelToken`]
//! that blocking waits poll so a closed connection or a server shutdown does
//! not leave a thread parked on a job.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::auth::VerifiedToken;

type Probe = dyn Fn() -> bool + Send + Sync;

/// Cooperative cancellation shared between a request and its owner.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    probe: Option<Arc<Probe>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a token sharing an existing flag (e.g. the server shutdown flag).
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self { flag, probe: None }
    }

    /// Attach a check that reports cancellation on its own, such as
    /// "the peer hung up".
    pub fn with_probe(mut self, probe: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.probe {
            Some(probe) => probe(),
            None => false,
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.flag.load(Ordering::SeqCst))
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    token: Option<VerifiedToken>,
    cancel: CancelToken,
}

impl RequestContext {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            token: None,
            cancel,
        }
    }

    pub fn with_token(mut self, token: VerifiedToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn token(&self) -> Option<&VerifiedToken> {
        self.token.as_ref()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
