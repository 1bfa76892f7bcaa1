//! Tool catalog and request dispatch.
//!
//! A request is one JSON object naming a tool and its arguments; the answer
//! is one JSON object carrying either the tool's result or a typed error.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::AuthArbiter;
use crate::context::RequestContext;
use crate::error::UnitError;
use crate::units::{ChangeUnitStateParams, ListUnitsParams, UnitManager, VALID_STATES};

pub const LIST_UNITS: &str = "list_units";
pub const CHANGE_UNIT_STATE: &str = "change_unit_state";
pub const CHECK_RESTART_RELOAD: &str = "check_restart_reload";
pub const DEAUTHORIZE: &str = "deauthorize";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub title: &'static str,
    pub description: String,
    pub read_only: bool,
}

/// Every tool the server can offer. Unit tools need a systemd connection.
pub fn catalog(with_units: bool) -> Vec<ToolSpec> {
    let mut tools = Vec::new();
    if with_units {
        tools.push(ToolSpec {
            name: LIST_UNITS,
            title: "List units",
            description: format!(
                "List systemd units. Filter by states ({}) or patterns. Can return detailed \
                 properties. Use mode='files' to list all installed unit files.",
                VALID_STATES.join(", ")
            ),
            read_only: true,
        });
        tools.push(ToolSpec {
            name: CHANGE_UNIT_STATE,
            title: "Change unit state",
            description: "Change the state of a unit or service (start, stop, restart, \
                          restart_force, reload, enable, disable)."
                .to_string(),
            read_only: false,
        });
        tools.push(ToolSpec {
            name: CHECK_RESTART_RELOAD,
            title: "Check restart or reload",
            description: "Check the reload or restart status of a unit. Only useful after a \
                          state change reported that its job is still running."
                .to_string(),
            read_only: true,
        });
    }
    tools.push(ToolSpec {
        name: DEAUTHORIZE,
        title: "Deauthorize",
        description: "Drop the interactive authorization granted to this server.".to_string(),
        read_only: true,
    });
    tools
}

/// Restrict `tools` to `enabled` (all when `None`), warning about unknown names.
pub fn select(tools: Vec<ToolSpec>, enabled: Option<&[String]>) -> Vec<ToolSpec> {
    let Some(enabled) = enabled else {
        return tools;
    };
    for name in enabled {
        if !tools.iter().any(|t| t.name == name) {
            warn!(tool = %name, "unknown or unavailable tool requested");
        }
    }
    tools
        .into_iter()
        .filter(|t| enabled.iter().any(|name| name == t.name))
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub token: Option<String>,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolFailure {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResponse {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
}

impl ToolResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, kind: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ToolFailure {
                kind: kind.to_string(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    Arguments(#[from] serde_json::Error),
    #[error(transparent)]
    Unit(#[from] UnitError),
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::Arguments(_) => "invalid_argument",
            ToolError::Unit(err) => err.kind(),
        }
    }
}

/// The enabled tools and their dispatcher, shared by every connection.
pub struct Toolbox {
    auth: Arc<AuthArbiter>,
    units: Option<Arc<UnitManager>>,
    tools: Vec<ToolSpec>,
}

impl Toolbox {
    pub fn new(
        auth: Arc<AuthArbiter>,
        units: Option<Arc<UnitManager>>,
        enabled: Option<&[String]>,
    ) -> Self {
        let tools = select(catalog(units.is_some()), enabled);
        debug!(
            tools = ?tools.iter().map(|t| t.name).collect::<Vec<_>>(),
            "tools registered"
        );
        Self { auth, units, tools }
    }

    pub fn auth(&self) -> &Arc<AuthArbiter> {
        &self.auth
    }

    pub fn handle(&self, ctx: &RequestContext, request: ToolRequest) -> ToolResponse {
        debug!(tool = %request.tool, "tool called");
        match self.call(ctx, &request.tool, request.arguments) {
            Ok(result) => ToolResponse::success(request.id, result),
            Err(err) => {
                debug!(tool = %request.tool, error = %err, "tool failed");
                ToolResponse::failure(request.id, err.kind(), err.to_string())
            }
        }
    }

    fn call(&self, ctx: &RequestContext, tool: &str, arguments: Value) -> Result<Value, ToolError> {
        if !self.tools.iter().any(|t| t.name == tool) {
            return Err(ToolError::UnknownTool(tool.to_string()));
        }

        if tool == DEAUTHORIZE {
            self.auth.deauthorize().map_err(UnitError::from)?;
            return Ok(serde_json::json!({ "deauthorized": true }));
        }

        let units = self
            .units
            .as_ref()
            .ok_or_else(|| ToolError::UnknownTool(tool.to_string()))?;
        let value = match tool {
            LIST_UNITS => {
                let params: ListUnitsParams = arguments_or_default(arguments)?;
                Value::Array(units.list_units(ctx, &params)?)
            }
            CHANGE_UNIT_STATE => {
                let params: ChangeUnitStateParams = serde_json::from_value(arguments)?;
                serde_json::to_value(units.change_unit_state(ctx, &params)?)?
            }
            CHECK_RESTART_RELOAD => serde_json::to_value(units.check_restart_reload(ctx)?)?,
            other => return Err(ToolError::UnknownTool(other.to_string())),
        };
        Ok(value)
    }
}

fn arguments_or_default<T: Default + serde::de::DeserializeOwned>(
    arguments: Value,
) -> Result<T, serde_json::Error> {
    if arguments.is_null() {
        Ok(T::default())
    } else {
        serde_json::from_value(arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Grants;
    use crate::units::JobTracker;
    use crate::units::mock::MockBackend;
    use crate::units::{UnitFile, UnitStatus};
    use serde_json::json;

    fn toolbox(grants: Grants, enabled: Option<&[String]>) -> Arc<Toolbox> {
        let backend = Arc::new(
            MockBackend::new()
                .with_units(vec![UnitStatus {
                    name: "sshd.service".to_string(),
                    description: "OpenSSH Daemon".to_string(),
                    load_state: "loaded".to_string(),
                    active_state: "active".to_string(),
                    sub_state: "running".to_string(),
                }])
                .with_files(vec![UnitFile {
                    path: "/usr/lib/systemd/system/sshd.service".to_string(),
                    state: "enabled".to_string(),
                }]),
        );
        let auth = Arc::new(AuthArbiter::disabled(grants));
        let units = Arc::new(UnitManager::new(backend, auth.clone(), Arc::new(JobTracker::new())));
        Arc::new(Toolbox::new(auth, Some(units), enabled))
    }

    fn request(tool: &str, arguments: Value) -> ToolRequest {
        ToolRequest {
            id: json!(1),
            token: None,
            tool: tool.to_string(),
            arguments,
        }
    }

    #[test]
    fn test_catalog_without_units() {
        let names: Vec<_> = catalog(false).iter().map(|t| t.name).collect();
        assert_eq!(names, vec![DEAUTHORIZE]);
        let names: Vec<_> = catalog(true).iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec![LIST_UNITS, CHANGE_UNIT_STATE, CHECK_RESTART_RELOAD, DEAUTHORIZE]
        );
    }

    #[test]
    fn test_select_subset() {
        let enabled = vec![LIST_UNITS.to_string(), "get_file".to_string()];
        let tools = select(catalog(true), Some(&enabled));
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, LIST_UNITS);
    }

    #[test]
    fn test_list_units_call() {
        let toolbox = toolbox(Grants::ALL, None);
        let response = toolbox.handle(&RequestContext::default(), request(LIST_UNITS, Value::Null));
        assert!(response.ok);
        assert_eq!(
            response.result,
            Some(json!([{"name": "sshd.service", "state": "active", "description": "OpenSSH Daemon"}]))
        );
    }

    #[test]
    fn test_list_files_call() {
        let toolbox = toolbox(Grants::ALL, None);
        let response = toolbox.handle(
            &RequestContext::default(),
            request(LIST_UNITS, json!({"mode": "files", "patterns": ["*.service"]})),
        );
        assert_eq!(
            response.result,
            Some(json!([{"name": "sshd.service", "state": "enabled"}]))
        );
    }

    #[test]
    fn test_read_denied() {
        let toolbox = toolbox(Grants::NONE, None);
        let response = toolbox.handle(&RequestContext::default(), request(LIST_UNITS, Value::Null));
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().kind, "unauthorized");
    }

    #[test]
    fn test_disabled_tool_is_unknown() {
        let enabled = vec![LIST_UNITS.to_string()];
        let toolbox = toolbox(Grants::ALL, Some(&enabled));
        let response = toolbox.handle(
            &RequestContext::default(),
            request(CHECK_RESTART_RELOAD, Value::Null),
        );
        assert_eq!(response.error.unwrap().kind, "unknown_tool");
    }

    #[test]
    fn test_bad_arguments() {
        let toolbox = toolbox(Grants::ALL, None);
        let response = toolbox.handle(
            &RequestContext::default(),
            request(CHANGE_UNIT_STATE, json!({"name": "sshd.service"})),
        );
        assert_eq!(response.error.unwrap().kind, "invalid_argument");
    }

    #[test]
    fn test_unsupported_action_response() {
        let toolbox = toolbox(Grants::ALL, None);
        let response = toolbox.handle(
            &RequestContext::default(),
            request(CHANGE_UNIT_STATE, json!({"name": "sshd.service", "action": "dance"})),
        );
        let error = response.error.unwrap();
        assert_eq!(error.kind, "unsupported_action");
        assert!(error.message.contains("dance"));
    }

    #[test]
    fn test_check_without_pending_job() {
        let toolbox = toolbox(Grants::ALL, None);
        let response = toolbox.handle(
            &RequestContext::default(),
            request(CHECK_RESTART_RELOAD, Value::Null),
        );
        assert_eq!(response.result, Some(json!({"status": "no_pending_operation"})));
    }

    #[test]
    fn test_deauthorize_in_disabled_mode() {
        let toolbox = toolbox(Grants::ALL, None);
        let response = toolbox.handle(&RequestContext::default(), request(DEAUTHORIZE, Value::Null));
        assert!(response.ok);
    }

    #[test]
    fn test_request_defaults() {
        let request: ToolRequest = serde_json::from_str(r#"{"tool":"list_units"}"#).unwrap();
        assert_eq!(request.id, Value::Null);
        assert!(request.token.is_none());
        assert!(request.arguments.is_null());
    }
}
