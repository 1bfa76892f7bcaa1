use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::UnitError;

/// Job mode passed to systemd for every asynchronous primitive.
pub const JOB_MODE: &str = "replace";

/// A state change that can be requested for a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitAction {
    Start,
    Stop,
    Restart,
    RestartForce,
    Reload,
    Enable,
    Disable,
}

impl UnitAction {
    pub const ALL: [UnitAction; 7] = [
        UnitAction::Start,
        UnitAction::Stop,
        UnitAction::Restart,
        UnitAction::RestartForce,
        UnitAction::Reload,
        UnitAction::Enable,
        UnitAction::Disable,
    ];

    pub const NAMES: [&'static str; 7] = [
        "start",
        "stop",
        "restart",
        "restart_force",
        "reload",
        "enable",
        "disable",
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitAction::Start => "start",
            UnitAction::Stop => "stop",
            UnitAction::Restart => "restart",
            UnitAction::RestartForce => "restart_force",
            UnitAction::Reload => "reload",
            UnitAction::Enable => "enable",
            UnitAction::Disable => "disable",
        }
    }
}

impl fmt::Display for UnitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitAction {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UnitAction::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| UnitError::UnsupportedAction(s.to_string()))
    }
}
