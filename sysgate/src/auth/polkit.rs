//! Local authorization through polkit.
//!
//! ## D-Bus Interface
//!
//! - **Bus**: System bus (`org.freedesktop.PolicyKit1`)
//! - **Path**: `/org/freedesktop/PolicyKit1/Authority`
//! - **Interface**: `org.freedesktop.PolicyKit1.Authority`
//!
//! The subject of every check is this process's own bus name, so polkit's
//! agent prompts the user running the server. A prompt that is not answered
//! within the configured timeout is cancelled and counts as a denial.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zbus::blocking::Connection;
use zbus::zvariant::{Type, Value};

use super::{AuthError, Grants, LocalAuthority};

/// Let polkit start an authentication agent prompt.
const ALLOW_USER_INTERACTION: u32 = 0x1;

pub const DEFAULT_ACTION_PREFIX: &str = "io.github.sysgate";

#[zbus::proxy(
    interface = "org.freedesktop.PolicyKit1.Authority",
    default_service = "org.freedesktop.PolicyKit1",
    default_path = "/org/freedesktop/PolicyKit1/Authority"
)]
trait Authority {
    fn check_authorization(
        &self,
        subject: &Subject<'_>,
        action_id: &str,
        details: &HashMap<&str, &str>,
        flags: u32,
        cancellation_id: &str,
    ) -> zbus::Result<AuthorizationResult>;

    fn cancel_check_authorization(&self, cancellation_id: &str) -> zbus::Result<()>;

    fn revoke_temporary_authorizations(&self, subject: &Subject<'_>) -> zbus::Result<()>;
}

/// polkit `(sa{sv})` subject.
#[derive(Debug, Serialize, Type)]
struct Subject<'a> {
    kind: &'a str,
    details: HashMap<&'a str, Value<'a>>,
}

impl<'a> Subject<'a> {
    fn bus_name(name: &'a str) -> Self {
        let mut details = HashMap::new();
        details.insert("name", Value::from(name));
        Self {
            kind: "system-bus-name",
            details,
        }
    }
}

/// polkit `(bba{ss})` result.
#[derive(Debug, Deserialize, Type)]
struct AuthorizationResult {
    is_authorized: bool,
    is_challenge: bool,
    details: HashMap<String, String>,
}

pub struct PolkitAuthority {
    connection: Mutex<Option<Connection>>,
    grants: Grants,
    timeout: Duration,
    checks: AtomicU64,
}

impl PolkitAuthority {
    /// Connect to the system bus.
    pub fn connect(grants: Grants, timeout: Duration) -> Result<Self, AuthError> {
        let connection = Connection::system()?;
        info!(
            read = grants.read,
            write = grants.write,
            "using polkit for authorization"
        );
        Ok(Self {
            connection: Mutex::new(Some(connection)),
            grants,
            timeout,
            checks: AtomicU64::new(0),
        })
    }

    fn connection(&self) -> Result<Connection, AuthError> {
        self.connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| AuthError::Broker("polkit connection closed".to_string()))
    }

    /// Ask polkit about `action_id`, giving up after the timeout.
    fn check(&self, action_id: &str) -> Result<bool, AuthError> {
        let connection = self.connection()?;
        let cancellation_id = cancellation_id(self.checks.fetch_add(1, Ordering::Relaxed));
        debug!(action_id, %cancellation_id, "asking polkit");

        let ask = {
            let connection = connection.clone();
            let action_id = action_id.to_string();
            let cancellation_id = cancellation_id.clone();
            move || check_authorization(&connection, &action_id, &cancellation_id)
        };
        bounded_check(action_id, self.timeout, ask, || {
            if let Err(err) = AuthorityProxyBlocking::new(&connection)
                .and_then(|proxy| proxy.cancel_check_authorization(&cancellation_id))
            {
                debug!(error = %err, "couldn't cancel polkit check");
            }
        })
    }
}

/// Run `ask` on a helper thread and wait at most `timeout` for its answer.
///
/// No answer in time is a denial, after `cancel` withdraws the request. A
/// failed request stays an error.
fn bounded_check<A, C>(
    action_id: &str,
    timeout: Duration,
    ask: A,
    cancel: C,
) -> Result<bool, AuthError>
where
    A: FnOnce() -> Result<AuthorizationResult, AuthError> + Send + 'static,
    C: FnOnce(),
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(ask());
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(result)) => {
            debug!(
                action_id,
                authorized = result.is_authorized,
                challenge = result.is_challenge,
                details = ?result.details,
                "polkit answered"
            );
            Ok(result.is_authorized)
        }
        Ok(Err(err)) => Err(err),
        Err(_) => {
            warn!(action_id, ?timeout, "polkit check timed out");
            cancel();
            Ok(false)
        }
    }
}

fn check_authorization(
    connection: &Connection,
    action_id: &str,
    cancellation_id: &str,
) -> Result<AuthorizationResult, AuthError> {
    let name = connection
        .unique_name()
        .ok_or_else(|| AuthError::Broker("no unique bus name".to_string()))?
        .to_string();
    let proxy = AuthorityProxyBlocking::new(connection)?;
    let result = proxy.check_authorization(
        &Subject::bus_name(&name),
        action_id,
        &HashMap::new(),
        ALLOW_USER_INTERACTION,
        cancellation_id,
    )?;
    Ok(result)
}

fn cancellation_id(sequence: u64) -> String {
    format!("sysgate-{}-{}", std::process::id(), sequence)
}

fn write_action(prefix: &str, permission: &str) -> String {
    if permission.is_empty() {
        format!("{prefix}.write")
    } else {
        format!("{prefix}.{permission}")
    }
}

impl LocalAuthority for PolkitAuthority {
    fn is_read_authorized(&self) -> Result<bool, AuthError> {
        if self.grants.read {
            return Ok(true);
        }
        self.check(&format!("{DEFAULT_ACTION_PREFIX}.read"))
    }

    fn is_write_authorized(&self, permission: &str) -> Result<bool, AuthError> {
        if self.grants.write {
            return Ok(true);
        }
        self.check(&write_action(DEFAULT_ACTION_PREFIX, permission))
    }

    fn deauthorize(&self) -> Result<(), AuthError> {
        let connection = self.connection()?;
        let name = connection
            .unique_name()
            .ok_or_else(|| AuthError::Broker("no unique bus name".to_string()))?
            .to_string();
        AuthorityProxyBlocking::new(&connection)?
            .revoke_temporary_authorizations(&Subject::bus_name(&name))?;
        info!("revoked temporary polkit authorizations");
        Ok(())
    }

    fn close(&self) -> Result<(), AuthError> {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(connection) = connection {
            connection.close()?;
        }
        Ok(())
    }
}
