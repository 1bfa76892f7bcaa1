//! Unit state changes and inventory.
//!
//! [`UnitManager`] is the process-wide entry point: it owns the service
//! manager backend, the authorization arbiter and the single [`JobTracker`].
//! A job left running by one request, on any connection, is picked up by the
//! next `check_restart_reload`.

mod action;
mod inventory;
mod jobs;
#[cfg(test)]
pub(crate) mod mock;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auth::{AuthArbiter, MANAGE_UNITS};
use crate::context::RequestContext;
use crate::error::{BackendError, UnitError};

pub use action::{JOB_MODE, UnitAction};
pub use inventory::{ListMode, ListUnitsParams, VALID_STATES};
pub use jobs::{JobCompletion, JobStatus, JobTracker};

/// One row of `ListUnits` and friends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    pub name: String,
    pub description: String,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
}

/// One row of `ListUnitFiles`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFile {
    pub path: String,
    pub state: String,
}

/// A symlink created or removed by enable/disable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFileChange {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "filename")]
    pub file: String,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnableOutcome {
    pub carries_install_info: bool,
    pub changes: Vec<UnitFileChange>,
}

/// The subset of the systemd manager used here.
///
/// Job-producing calls return the job object path.
pub trait UnitBackend: Send + Sync {
    fn list_units(&self) -> Result<Vec<UnitStatus>, BackendError>;
    fn list_units_filtered(&self, states: &[String]) -> Result<Vec<UnitStatus>, BackendError>;
    fn list_units_by_patterns(
        &self,
        states: &[String],
        patterns: &[String],
    ) -> Result<Vec<UnitStatus>, BackendError>;
    fn list_unit_files(&self) -> Result<Vec<UnitFile>, BackendError>;
    fn unit_properties(
        &self,
        name: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>, BackendError>;

    fn start_unit(&self, name: &str, mode: &str) -> Result<String, BackendError>;
    fn stop_unit(&self, name: &str, mode: &str) -> Result<String, BackendError>;
    fn restart_unit(&self, name: &str, mode: &str) -> Result<String, BackendError>;
    fn reload_or_restart_unit(&self, name: &str, mode: &str) -> Result<String, BackendError>;

    /// Enable and reload the daemon.
    fn enable_unit_files(
        &self,
        files: &[String],
        runtime: bool,
        force: bool,
    ) -> Result<EnableOutcome, BackendError>;
    /// Disable and reload the daemon.
    fn disable_unit_files(
        &self,
        files: &[String],
        runtime: bool,
    ) -> Result<Vec<UnitFileChange>, BackendError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeUnitStateParams {
    pub name: String,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ChangeOutcome {
    Job(JobStatus),
    Files {
        unit: String,
        action: UnitAction,
        #[serde(skip_serializing_if = "Option::is_none")]
        carries_install_info: Option<bool>,
        changes: Vec<UnitFileChange>,
    },
}

pub struct UnitManager {
    backend: Arc<dyn UnitBackend>,
    auth: Arc<AuthArbiter>,
    jobs: Arc<JobTracker>,
}

impl UnitManager {
    /// `jobs` must be the tracker fed by the backend's completion signals.
    pub fn new(
        backend: Arc<dyn UnitBackend>,
        auth: Arc<AuthArbiter>,
        jobs: Arc<JobTracker>,
    ) -> Self {
        Self {
            backend,
            auth,
            jobs,
        }
    }

    fn require_read(&self, ctx: &RequestContext) -> Result<(), UnitError> {
        if self.auth.is_read_authorized(ctx)? {
            Ok(())
        } else {
            Err(UnitError::unauthorized("read access denied"))
        }
    }

    fn require_write(&self, ctx: &RequestContext) -> Result<(), UnitError> {
        if self.auth.is_write_authorized(ctx, MANAGE_UNITS)? {
            Ok(())
        } else {
            Err(UnitError::unauthorized("write access denied"))
        }
    }

    pub fn list_units(
        &self,
        ctx: &RequestContext,
        params: &ListUnitsParams,
    ) -> Result<Vec<serde_json::Value>, UnitError> {
        params.validate()?;
        self.require_read(ctx)?;
        inventory::list(self.backend.as_ref(), params)
    }

    /// Request a state change for one unit.
    ///
    /// Job actions wait up to the arbiter timeout for the job to finish; a
    /// job still running at the deadline is reported as such and can be
    /// followed up with [`UnitManager::check_restart_reload`].
    pub fn change_unit_state(
        &self,
        ctx: &RequestContext,
        params: &ChangeUnitStateParams,
    ) -> Result<ChangeOutcome, UnitError> {
        let action: UnitAction = params.action.parse()?;
        if params.name.trim().is_empty() {
            return Err(UnitError::InvalidArgument("unit name is empty".to_string()));
        }
        self.require_write(ctx)?;

        let backend = self.backend.as_ref();
        let unit = params.name.as_str();
        info!(unit, %action, "changing unit state");

        match action {
            UnitAction::Enable => {
                let outcome = backend.enable_unit_files(&[unit.to_string()], false, false)?;
                Ok(ChangeOutcome::Files {
                    unit: unit.to_string(),
                    action,
                    carries_install_info: Some(outcome.carries_install_info),
                    changes: outcome.changes,
                })
            }
            UnitAction::Disable => {
                let changes = backend.disable_unit_files(&[unit.to_string()], false)?;
                Ok(ChangeOutcome::Files {
                    unit: unit.to_string(),
                    action,
                    carries_install_info: None,
                    changes,
                })
            }
            _ => {
                self.jobs.begin(unit, action)?;
                let dispatched = match action {
                    UnitAction::Start => backend.start_unit(unit, JOB_MODE),
                    UnitAction::Stop => backend.stop_unit(unit, JOB_MODE),
                    UnitAction::Restart | UnitAction::RestartForce => {
                        backend.restart_unit(unit, JOB_MODE)
                    }
                    _ => backend.reload_or_restart_unit(unit, JOB_MODE),
                };
                let job = match dispatched {
                    Ok(job) => job,
                    Err(err) => {
                        self.jobs.abort();
                        return Err(err.into());
                    }
                };
                debug!(unit, %job, "job queued");
                self.jobs.register(&job);
                let status = self.jobs.wait(self.auth.timeout(), ctx.cancel_token())?;
                Ok(ChangeOutcome::Job(status))
            }
        }
    }

    /// Wait again for the job left running by an earlier state change.
    pub fn check_restart_reload(&self, ctx: &RequestContext) -> Result<JobStatus, UnitError> {
        self.require_read(ctx)?;
        self.jobs.wait(self.auth.timeout(), ctx.cancel_token())
    }
}
