//! CLI argument definitions for sysgate.
//!
//! Every flag can also be set through a `SYSGATE_*` environment variable.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "sysgate")]
#[command(about = "Authorized systemd unit control over a JSON-lines tool protocol")]
#[command(version)]
pub struct Cli {
    /// Serve on this TCP address instead of stdin/stdout
    ///
    /// Unless --noauth is given, every request must then carry a bearer
    /// token issued by --controller.
    #[arg(long, env = "SYSGATE_LISTEN", value_name = "ADDR")]
    pub listen: Option<String>,

    /// Log to this file (appending) instead of stderr
    #[arg(long, env = "SYSGATE_LOGFILE", value_name = "PATH")]
    pub logfile: Option<PathBuf>,

    /// OpenID provider issuing bearer tokens (remote mode)
    #[arg(long, short = 'c', env = "SYSGATE_CONTROLLER", value_name = "URL")]
    pub controller: Option<String>,

    /// Enable verbose logging
    #[arg(long, short = 'v', env = "SYSGATE_VERBOSE")]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(long, short = 'd', env = "SYSGATE_DEBUG")]
    pub debug: bool,

    /// Output logs in JSON format
    #[arg(long, env = "SYSGATE_LOG_JSON")]
    pub log_json: bool,

    /// List the available tools and exit
    #[arg(long)]
    pub list_tools: bool,

    /// Grant read access without asking polkit
    #[arg(long, short = 'r', env = "SYSGATE_ALLOW_READ")]
    pub allow_read: bool,

    /// Grant write access without asking polkit
    #[arg(long, short = 'w', env = "SYSGATE_ALLOW_WRITE")]
    pub allow_write: bool,

    /// Only offer these tools (comma-separated). Defaults to all tools.
    #[arg(
        long,
        env = "SYSGATE_ENABLED_TOOLS",
        value_delimiter = ',',
        value_name = "TOOLS"
    )]
    pub enabled_tools: Option<Vec<String>>,

    /// Seconds to wait for consent prompts and unit jobs
    #[arg(long, env = "SYSGATE_TIMEOUT", default_value_t = 5, value_name = "SECS")]
    pub timeout: u64,

    /// Disable authorization and allow every read and write
    #[arg(long, env = "SYSGATE_NOAUTH")]
    pub noauth: bool,

    /// Audience a bearer token must be issued for
    #[arg(long, env = "SYSGATE_AUDIENCE", default_value = crate::auth::DEFAULT_AUDIENCE)]
    pub audience: String,
}
