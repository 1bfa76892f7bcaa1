use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};

use sysgate::auth::{
    self, AuthArbiter, Grants, JwksKeys, LocalAuthority, PolkitAuthority, TokenVerifier,
};
use sysgate::config::{AuthSelection, ServerConfig};
use sysgate::dbus::SystemdBus;
use sysgate::logging::{self, LogConfig};
use sysgate::output;
use sysgate::server::Server;
use sysgate::tools::{self, Toolbox};
use sysgate::units::{JobTracker, UnitManager};
use sysgate::Cli;

/// Build the arbiter for the selected mode. Any failure here is fatal.
fn build_arbiter(config: &ServerConfig) -> Result<AuthArbiter> {
    let mut local: Option<Box<dyn LocalAuthority>> = None;
    let mut remote = None;
    let mut grants = Grants::NONE;

    match &config.auth {
        AuthSelection::Disabled(static_grants) => grants = *static_grants,
        AuthSelection::Local(static_grants) => {
            let authority = PolkitAuthority::connect(*static_grants, config.timeout)
                .context("Failed to set up polkit authorization")?;
            local = Some(Box::new(authority));
        }
        AuthSelection::Remote { issuer } => {
            let uri = auth::jwks_uri(issuer)
                .with_context(|| format!("Couldn't create connection to controller {issuer}"))?;
            let keys = JwksKeys::fetch(uri).context("Failed to fetch signing keys")?;
            info!(
                %issuer,
                jwks_uri = %keys.uri(),
                scopes = ?config.settings.supported_scopes(),
                "using bearer tokens for authorization"
            );
            remote = Some(Arc::new(TokenVerifier::new(
                Arc::new(keys),
                config.settings.clone(),
            )));
        }
    }

    Ok(
        AuthArbiter::from_parts(local, remote, grants, config.timeout).unwrap_or_else(|err| {
            warn!(error = %err, "falling back to disabled authorization without grants");
            AuthArbiter::disabled(Grants::NONE).with_timeout(config.timeout)
        }),
    )
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig::from_cli(&cli))?;

    let config = ServerConfig::from_cli(&cli)?;
    debug!(?config, "configuration resolved");

    if cli.list_tools {
        let tools = tools::select(tools::catalog(true), config.enabled_tools.as_deref());
        output::print_tools(&tools, cli.verbose).context("Failed to print tools")?;
        return Ok(());
    }

    let arbiter = Arc::new(build_arbiter(&config)?);
    info!(mode = %arbiter.mode(), timeout = ?arbiter.timeout(), "authorization ready");

    let units = match SystemdBus::connect() {
        Ok(bus) => {
            let jobs = Arc::new(JobTracker::new());
            let _watcher = bus
                .watch_jobs(Arc::clone(&jobs))
                .context("Failed to watch systemd jobs")?;
            Some(Arc::new(UnitManager::new(
                Arc::new(bus),
                Arc::clone(&arbiter),
                jobs,
            )))
        }
        Err(err) => {
            warn!(error = %err, "couldn't add systemd tools");
            None
        }
    };

    let toolbox = Arc::new(Toolbox::new(
        Arc::clone(&arbiter),
        units,
        config.enabled_tools.as_deref(),
    ));
    let server = Server::new(toolbox);

    let served = match &config.listen {
        Some(addr) => server.serve_tcp(addr),
        None => server.serve_stdio(),
    };

    if let Err(err) = arbiter.close() {
        warn!(error = %err, "failed to close authorization backend");
    }
    served
}
