//! Systemd D-Bus integration.
//!
//! ## D-Bus Interface
//!
//! - **Bus**: System bus (`org.freedesktop.systemd1`)
//! - **Path**: `/org/freedesktop/systemd1`
//! - **Interface**: `org.freedesktop.systemd1.Manager`
//!
//! Job completion is observed through the manager's `JobRemoved` signal,
//! which systemd only emits to clients that called `Subscribe`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use zbus::blocking::Connection;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

use crate::error::BackendError;
use crate::units::{
    EnableOutcome, JobCompletion, JobTracker, UnitBackend, UnitFile, UnitFileChange, UnitStatus,
};

const UNIT_INTERFACE: &str = "org.freedesktop.systemd1.Unit";
const SERVICE_INTERFACE: &str = "org.freedesktop.systemd1.Service";

/// `a(ssssssouso)` row returned by the `ListUnits*` calls.
type ListedUnit = (
    String,
    String,
    String,
    String,
    String,
    String,
    OwnedObjectPath,
    u32,
    String,
    OwnedObjectPath,
);

/// Proxy for the systemd Manager interface.
#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait Systemd1Manager {
    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn restart_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn reload_or_restart_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    /// Returns (carries_install_info, Vec<(type, file, destination)>)
    fn enable_unit_files(
        &self,
        files: &[&str],
        runtime: bool,
        force: bool,
    ) -> zbus::Result<(bool, Vec<(String, String, String)>)>;

    /// Returns Vec<(type, file, destination)>
    fn disable_unit_files(
        &self,
        files: &[&str],
        runtime: bool,
    ) -> zbus::Result<Vec<(String, String, String)>>;

    /// Reload systemd daemon configuration.
    fn reload(&self) -> zbus::Result<()>;

    /// Load a unit (creates it if not loaded).
    fn load_unit(&self, name: &str) -> zbus::Result<OwnedObjectPath>;

    fn list_units(&self) -> zbus::Result<Vec<ListedUnit>>;

    fn list_units_filtered(&self, states: &[&str]) -> zbus::Result<Vec<ListedUnit>>;

    fn list_units_by_patterns(
        &self,
        states: &[&str],
        patterns: &[&str],
    ) -> zbus::Result<Vec<ListedUnit>>;

    fn list_unit_files(&self) -> zbus::Result<Vec<(String, String)>>;

    fn subscribe(&self) -> zbus::Result<()>;

    #[zbus(signal)]
    fn job_removed(
        &self,
        id: u32,
        job: OwnedObjectPath,
        unit: String,
        result: String,
    ) -> zbus::Result<()>;
}

/// `org.freedesktop.DBus.Properties` on a unit object.
#[zbus::proxy(
    interface = "org.freedesktop.DBus.Properties",
    default_service = "org.freedesktop.systemd1"
)]
trait UnitProperties {
    fn get_all(&self, interface_name: &str) -> zbus::Result<HashMap<String, OwnedValue>>;
}

/// [`UnitBackend`] backed by the system bus.
pub struct SystemdBus {
    connection: Connection,
}

impl SystemdBus {
    /// Connect to the system bus.
    pub fn connect() -> Result<Self> {
        let connection = Connection::system().context("Failed to connect to system D-Bus")?;
        let bus = Self { connection };
        bus.manager()?
            .subscribe()
            .context("Failed to subscribe to systemd signals")?;
        Ok(bus)
    }

    fn manager(&self) -> Result<Systemd1ManagerProxyBlocking<'_>, BackendError> {
        Ok(Systemd1ManagerProxyBlocking::new(&self.connection)?)
    }

    fn properties(
        &self,
        path: OwnedObjectPath,
    ) -> Result<UnitPropertiesProxyBlocking<'_>, BackendError> {
        Ok(UnitPropertiesProxyBlocking::builder(&self.connection)
            .path(path)?
            .build()?)
    }

    /// Forward every `JobRemoved` signal to `jobs` from a background thread.
    ///
    /// Returns once the signal stream is established so no completion of a
    /// job dispatched afterwards can be missed.
    pub fn watch_jobs(&self, jobs: Arc<JobTracker>) -> Result<thread::JoinHandle<()>> {
        let connection = self.connection.clone();
        let (ready_tx, ready_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("job-watcher".to_string())
            .spawn(move || {
                let manager = match Systemd1ManagerProxyBlocking::new(&connection) {
                    Ok(manager) => manager,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let signals = match manager.receive_job_removed() {
                    Ok(signals) => {
                        let _ = ready_tx.send(Ok(()));
                        signals
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                for signal in signals {
                    match signal.args() {
                        Ok(args) => {
                            let completion = JobCompletion {
                                job: args.job().as_str().to_string(),
                                unit: args.unit().to_string(),
                                result: args.result().to_string(),
                            };
                            debug!(
                                id = args.id(),
                                job = %completion.job,
                                unit = %completion.unit,
                                result = %completion.result,
                                "job removed"
                            );
                            jobs.finish(completion);
                        }
                        Err(err) => warn!(error = %err, "malformed JobRemoved signal"),
                    }
                }
                info!("job signal stream ended");
            })
            .context("Failed to spawn job watcher")?;

        ready_rx
            .recv()
            .context("Job watcher exited before subscribing")?
            .context("Failed to watch JobRemoved signals")?;
        Ok(handle)
    }
}

fn unit_error(unit: &str) -> impl Fn(zbus::Error) -> BackendError + '_ {
    move |err| BackendError::Unit {
        unit: unit.to_string(),
        message: err.to_string(),
    }
}

fn unit_status(row: ListedUnit) -> UnitStatus {
    let (name, description, load_state, active_state, sub_state, ..) = row;
    UnitStatus {
        name,
        description,
        load_state,
        active_state,
        sub_state,
    }
}

fn file_changes(changes: Vec<(String, String, String)>) -> Vec<UnitFileChange> {
    changes
        .into_iter()
        .map(|(kind, file, destination)| UnitFileChange {
            kind,
            file,
            destination,
        })
        .collect()
}

fn as_strs(items: &[String]) -> Vec<&str> {
    items.iter().map(String::as_str).collect()
}

/// Render a D-Bus value as JSON.
///
/// Containers are converted recursively. Dictionary keys become JSON strings;
/// file descriptors fall back to their textual form.
pub fn to_json(value: &Value<'_>) -> serde_json::Value {
    use serde_json::Value as Json;
    match value {
        Value::U8(v) => Json::from(*v),
        Value::Bool(v) => Json::from(*v),
        Value::I16(v) => Json::from(*v),
        Value::U16(v) => Json::from(*v),
        Value::I32(v) => Json::from(*v),
        Value::U32(v) => Json::from(*v),
        Value::I64(v) => Json::from(*v),
        Value::U64(v) => Json::from(*v),
        Value::F64(v) => Json::from(*v),
        Value::Str(v) => Json::from(v.as_str()),
        Value::ObjectPath(v) => Json::from(v.as_str()),
        Value::Signature(v) => Json::from(v.to_string()),
        Value::Value(inner) => to_json(inner),
        Value::Array(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Structure(fields) => Json::Array(fields.fields().iter().map(to_json).collect()),
        Value::Dict(dict) => Json::Object(
            dict.iter()
                .map(|(key, value)| {
                    let key = match to_json(key) {
                        Json::String(key) => key,
                        other => other.to_string(),
                    };
                    (key, to_json(value))
                })
                .collect(),
        ),
        other => Json::from(other.to_string()),
    }
}

impl UnitBackend for SystemdBus {
    fn list_units(&self) -> Result<Vec<UnitStatus>, BackendError> {
        let rows = self.manager()?.list_units()?;
        Ok(rows.into_iter().map(unit_status).collect())
    }

    fn list_units_filtered(&self, states: &[String]) -> Result<Vec<UnitStatus>, BackendError> {
        let rows = self.manager()?.list_units_filtered(&as_strs(states))?;
        Ok(rows.into_iter().map(unit_status).collect())
    }

    fn list_units_by_patterns(
        &self,
        states: &[String],
        patterns: &[String],
    ) -> Result<Vec<UnitStatus>, BackendError> {
        let rows = self
            .manager()?
            .list_units_by_patterns(&as_strs(states), &as_strs(patterns))?;
        Ok(rows.into_iter().map(unit_status).collect())
    }

    fn list_unit_files(&self) -> Result<Vec<UnitFile>, BackendError> {
        let rows = self.manager()?.list_unit_files()?;
        Ok(rows
            .into_iter()
            .map(|(path, state)| UnitFile { path, state })
            .collect())
    }

    fn unit_properties(
        &self,
        name: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>, BackendError> {
        let path = self.manager()?.load_unit(name).map_err(unit_error(name))?;
        let proxy = self.properties(path)?;

        let mut interfaces = vec![UNIT_INTERFACE];
        if name.ends_with(".service") {
            interfaces.push(SERVICE_INTERFACE);
        }

        let mut properties = BTreeMap::new();
        for interface in interfaces {
            let values = proxy.get_all(interface).map_err(unit_error(name))?;
            properties.extend(values.iter().map(|(key, value)| (key.clone(), to_json(value))));
        }
        Ok(properties)
    }

    fn start_unit(&self, name: &str, mode: &str) -> Result<String, BackendError> {
        let job = self.manager()?.start_unit(name, mode).map_err(unit_error(name))?;
        Ok(job.as_str().to_string())
    }

    fn stop_unit(&self, name: &str, mode: &str) -> Result<String, BackendError> {
        let job = self.manager()?.stop_unit(name, mode).map_err(unit_error(name))?;
        Ok(job.as_str().to_string())
    }

    fn restart_unit(&self, name: &str, mode: &str) -> Result<String, BackendError> {
        let job = self
            .manager()?
            .restart_unit(name, mode)
            .map_err(unit_error(name))?;
        Ok(job.as_str().to_string())
    }

    fn reload_or_restart_unit(&self, name: &str, mode: &str) -> Result<String, BackendError> {
        let job = self
            .manager()?
            .reload_or_restart_unit(name, mode)
            .map_err(unit_error(name))?;
        Ok(job.as_str().to_string())
    }

    fn enable_unit_files(
        &self,
        files: &[String],
        runtime: bool,
        force: bool,
    ) -> Result<EnableOutcome, BackendError> {
        let manager = self.manager()?;
        let (carries_install_info, changes) = manager
            .enable_unit_files(&as_strs(files), runtime, force)
            .map_err(unit_error(&files.join(" ")))?;

        // Reload daemon to pick up changes
        manager.reload()?;

        Ok(EnableOutcome {
            carries_install_info,
            changes: file_changes(changes),
        })
    }

    fn disable_unit_files(
        &self,
        files: &[String],
        runtime: bool,
    ) -> Result<Vec<UnitFileChange>, BackendError> {
        let manager = self.manager()?;
        let changes = manager
            .disable_unit_files(&as_strs(files), runtime)
            .map_err(unit_error(&files.join(" ")))?;

        // Reload daemon to pick up changes
        manager.reload()?;

        Ok(file_changes(changes))
    }
}
