//! Validated server configuration derived from the command line.

use std::time::Duration;

use thiserror::Error;

use crate::auth::discovery::normalize_issuer;
use crate::auth::{AuthSettings, Grants};
use crate::cli::Cli;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--controller needs to be set when --listen is set")]
    MissingController,
    #[error("--timeout must be at least one second")]
    ZeroTimeout,
}

/// Which authorization backend the process runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSelection {
    /// No checks; static grants answer every question.
    Disabled(Grants),
    /// polkit, short-circuited by the static grants where set.
    Local(Grants),
    /// Bearer tokens issued by `issuer`.
    Remote { issuer: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: Option<String>,
    pub auth: AuthSelection,
    pub settings: AuthSettings,
    pub timeout: Duration,
    pub enabled_tools: Option<Vec<String>>,
}

impl ServerConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        if cli.timeout == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        let auth = if cli.noauth {
            AuthSelection::Disabled(Grants::ALL)
        } else if cli.listen.is_some() {
            let controller = cli
                .controller
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .ok_or(ConfigError::MissingController)?;
            AuthSelection::Remote {
                issuer: normalize_issuer(controller),
            }
        } else {
            AuthSelection::Local(Grants {
                read: cli.allow_read,
                write: cli.allow_write,
            })
        };

        Ok(Self {
            listen: cli.listen.clone(),
            auth,
            settings: AuthSettings {
                audience: cli.audience.clone(),
                ..AuthSettings::default()
            },
            timeout: Duration::from_secs(cli.timeout),
            enabled_tools: cli.enabled_tools.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn config(args: &[&str]) -> Result<ServerConfig, ConfigError> {
        let mut argv = vec!["sysgate"];
        argv.extend_from_slice(args);
        ServerConfig::from_cli(&Cli::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_default_is_local_without_grants() {
        let config = config(&[]).unwrap();
        assert_eq!(config.auth, AuthSelection::Local(Grants::NONE));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(config.listen.is_none());
    }

    #[test]
    fn test_static_grants() {
        let config = config(&["--allow-read"]).unwrap();
        assert_eq!(
            config.auth,
            AuthSelection::Local(Grants {
                read: true,
                write: false
            })
        );
    }

    #[test]
    fn test_noauth_wins() {
        let config = config(&["--noauth", "--listen", "127.0.0.1:8080"]).unwrap();
        assert_eq!(config.auth, AuthSelection::Disabled(Grants::ALL));
    }

    #[test]
    fn test_listen_requires_controller() {
        let err = config(&["--listen", "127.0.0.1:8080"]).unwrap_err();
        assert_eq!(err, ConfigError::MissingController);
    }

    #[test]
    fn test_remote_issuer_normalized() {
        let config = config(&["--listen", ":8080", "--controller", "idp.local:8180"]).unwrap();
        assert_eq!(
            config.auth,
            AuthSelection::Remote {
                issuer: "http://idp.local:8180".to_string()
            }
        );
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert_eq!(
            config(&["--timeout", "0"]).unwrap_err(),
            ConfigError::ZeroTimeout
        );
    }

    #[test]
    fn test_audience_override() {
        let config = config(&["--audience", "ops"]).unwrap();
        assert_eq!(config.settings.audience, "ops");
        assert_eq!(config.settings.read_scope, "mcp:read");
    }
}
