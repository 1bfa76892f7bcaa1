use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{UnitBackend, UnitStatus};
use crate::error::UnitError;

/// State names accepted by the systemd list filters: load, active, sub and
/// unit-file states.
pub const VALID_STATES: &[&str] = &[
    // load
    "stub",
    "loaded",
    "not-found",
    "bad-setting",
    "error",
    "merged",
    "masked",
    // active
    "active",
    "reloading",
    "inactive",
    "failed",
    "activating",
    "deactivating",
    "maintenance",
    "refreshing",
    // sub
    "dead",
    "running",
    "exited",
    "waiting",
    "listening",
    "mounted",
    "plugged",
    "elapsed",
    "abandoned",
    "start",
    "start-pre",
    "start-post",
    "stop",
    "stop-sigterm",
    "stop-sigkill",
    "stop-post",
    "final-sigterm",
    "final-sigkill",
    "auto-restart",
    "cleaning",
    // unit file
    "enabled",
    "enabled-runtime",
    "linked",
    "linked-runtime",
    "alias",
    "static",
    "disabled",
    "indirect",
    "generated",
    "transient",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListMode {
    #[default]
    Units,
    Files,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListUnitsParams {
    pub patterns: Vec<String>,
    pub states: Vec<String>,
    pub mode: ListMode,
    pub properties: bool,
}

impl ListUnitsParams {
    pub fn validate(&self) -> Result<(), UnitError> {
        if let Some(bad) = self
            .states
            .iter()
            .find(|s| !VALID_STATES.contains(&s.as_str()))
        {
            return Err(UnitError::InvalidArgument(format!(
                "invalid state '{bad}'. Valid states: {}",
                VALID_STATES.join(", ")
            )));
        }
        for pattern in &self.patterns {
            glob::Pattern::new(pattern).map_err(|err| {
                UnitError::InvalidArgument(format!("invalid pattern '{pattern}': {err}"))
            })?;
        }
        Ok(())
    }
}

pub(super) fn list(
    backend: &dyn UnitBackend,
    params: &ListUnitsParams,
) -> Result<Vec<Value>, UnitError> {
    match params.mode {
        ListMode::Units => list_units(backend, params),
        ListMode::Files => list_files(backend, params),
    }
}

fn list_units(backend: &dyn UnitBackend, params: &ListUnitsParams) -> Result<Vec<Value>, UnitError> {
    let units = if !params.patterns.is_empty() {
        backend.list_units_by_patterns(&params.states, &params.patterns)?
    } else if !params.states.is_empty() {
        backend.list_units_filtered(&params.states)?
    } else {
        backend.list_units()?
    };
    debug!(count = units.len(), "listed units");

    if !params.properties {
        return Ok(units.iter().map(summary).collect());
    }

    units
        .iter()
        .map(|unit| {
            let properties = backend.unit_properties(&unit.name)?;
            Ok(Value::Object(properties.into_iter().collect()))
        })
        .collect()
}

fn summary(unit: &UnitStatus) -> Value {
    json!({
        "name": unit.name,
        "state": unit.active_state,
        "description": unit.description,
    })
}

fn list_files(backend: &dyn UnitBackend, params: &ListUnitsParams) -> Result<Vec<Value>, UnitError> {
    let patterns: Vec<glob::Pattern> = params
        .patterns
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect();

    let files = backend.list_unit_files()?;
    let entries = files
        .iter()
        .filter_map(|file| {
            let name = file.path.rsplit('/').next().unwrap_or(&file.path);
            let wanted = patterns.is_empty() || patterns.iter().any(|p| p.matches(name));
            wanted.then(|| json!({ "name": name, "state": file.state }))
        })
        .collect();
    Ok(entries)
}
