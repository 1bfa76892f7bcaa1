//! In-memory [`UnitBackend`] recording every call.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{EnableOutcome, UnitBackend, UnitFile, UnitFileChange, UnitStatus};
use crate::error::BackendError;

type Hook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub(crate) struct MockBackend {
    job: String,
    units: Vec<UnitStatus>,
    files: Vec<UnitFile>,
    properties: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    changes: Vec<UnitFileChange>,
    failing: bool,
    on_dispatch: Mutex<Option<Hook>>,
    calls: Mutex<Vec<String>>,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_job(mut self, job: &str) -> Self {
        self.job = job.to_string();
        self
    }

    pub(crate) fn with_units(mut self, units: Vec<UnitStatus>) -> Self {
        self.units = units;
        self
    }

    pub(crate) fn with_files(mut self, files: Vec<UnitFile>) -> Self {
        self.files = files;
        self
    }

    pub(crate) fn with_properties(
        mut self,
        unit: &str,
        properties: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        self.properties.insert(unit.to_string(), properties);
        self
    }

    pub(crate) fn with_changes(mut self, changes: Vec<UnitFileChange>) -> Self {
        self.changes = changes;
        self
    }

    /// Every call fails with a bus error.
    pub(crate) fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// Run `hook` inside each job dispatch, before the job path is returned.
    pub(crate) fn on_dispatch(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_dispatch.lock().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<(), BackendError> {
        self.calls.lock().unwrap().push(call);
        if self.failing {
            return Err(BackendError::Bus("connection refused".to_string()));
        }
        Ok(())
    }

    fn dispatch(&self, method: &str, name: &str, mode: &str) -> Result<String, BackendError> {
        self.record(format!("{method} {name} {mode}"))?;
        if let Some(hook) = self.on_dispatch.lock().unwrap().as_ref() {
            hook();
        }
        Ok(self.job.clone())
    }

    fn matching(&self, states: &[String], patterns: &[String]) -> Vec<UnitStatus> {
        self.units
            .iter()
            .filter(|u| {
                states.is_empty()
                    || states
                        .iter()
                        .any(|s| *s == u.active_state || *s == u.load_state || *s == u.sub_state)
            })
            .filter(|u| {
                patterns.is_empty()
                    || patterns.iter().any(|p| {
                        glob::Pattern::new(p)
                            .map(|pat| pat.matches(&u.name))
                            .unwrap_or(false)
                    })
            })
            .cloned()
            .collect()
    }
}

impl UnitBackend for MockBackend {
    fn list_units(&self) -> Result<Vec<UnitStatus>, BackendError> {
        self.record("ListUnits".to_string())?;
        Ok(self.units.clone())
    }

    fn list_units_filtered(&self, states: &[String]) -> Result<Vec<UnitStatus>, BackendError> {
        self.record(format!("ListUnitsFiltered {}", states.join(",")))?;
        Ok(self.matching(states, &[]))
    }

    fn list_units_by_patterns(
        &self,
        states: &[String],
        patterns: &[String],
    ) -> Result<Vec<UnitStatus>, BackendError> {
        self.record(format!(
            "ListUnitsByPatterns {} {}",
            states.join(","),
            patterns.join(",")
        ))?;
        Ok(self.matching(states, patterns))
    }

    fn list_unit_files(&self) -> Result<Vec<UnitFile>, BackendError> {
        self.record("ListUnitFiles".to_string())?;
        Ok(self.files.clone())
    }

    fn unit_properties(
        &self,
        name: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>, BackendError> {
        self.record(format!("GetAll {name}"))?;
        self.properties
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::Unit {
                unit: name.to_string(),
                message: "no such unit".to_string(),
            })
    }

    fn start_unit(&self, name: &str, mode: &str) -> Result<String, BackendError> {
        self.dispatch("StartUnit", name, mode)
    }

    fn stop_unit(&self, name: &str, mode: &str) -> Result<String, BackendError> {
        self.dispatch("StopUnit", name, mode)
    }

    fn restart_unit(&self, name: &str, mode: &str) -> Result<String, BackendError> {
        self.dispatch("RestartUnit", name, mode)
    }

    fn reload_or_restart_unit(&self, name: &str, mode: &str) -> Result<String, BackendError> {
        self.dispatch("ReloadOrRestartUnit", name, mode)
    }

    fn enable_unit_files(
        &self,
        files: &[String],
        _runtime: bool,
        _force: bool,
    ) -> Result<EnableOutcome, BackendError> {
        self.record(format!("EnableUnitFiles {}", files.join(",")))?;
        Ok(EnableOutcome {
            carries_install_info: true,
            changes: self.changes.clone(),
        })
    }

    fn disable_unit_files(
        &self,
        files: &[String],
        _runtime: bool,
    ) -> Result<Vec<UnitFileChange>, BackendError> {
        self.record(format!("DisableUnitFiles {}", files.join(",")))?;
        Ok(self.changes.clone())
    }
}
