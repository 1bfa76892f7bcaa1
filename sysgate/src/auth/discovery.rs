//! OpenID Connect discovery.
//!
//! See <https://openid.net/specs/openid-connect-discovery-1_0.html>.

use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::AuthError;

const OPENID_CONFIGURATION: &str = "/.well-known/openid-configuration";

#[derive(Debug, Deserialize)]
struct ProviderMetadata {
    jwks_uri: String,
}

/// Prefix a bare `host:port` controller address with `http://`.
pub fn normalize_issuer(controller: &str) -> String {
    if controller.starts_with("http://") || controller.starts_with("https://") {
        controller.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", controller.trim_end_matches('/'))
    }
}

/// Look up the `jwks_uri` advertised by `issuer`.
pub fn jwks_uri(issuer: &str) -> Result<String, AuthError> {
    jwks_uri_with_client(&Client::new(), issuer)
}

pub fn jwks_uri_with_client(client: &Client, issuer: &str) -> Result<String, AuthError> {
    let url = format!("{}{}", issuer.trim_end_matches('/'), OPENID_CONFIGURATION);
    debug!(%url, "fetching openid-configuration");

    let response = client.get(&url).send().map_err(|err| {
        AuthError::Discovery(format!("failed to get openid-configuration: {err}"))
    })?;

    let status = response.status();
    if status != StatusCode::OK {
        warn!(%status, %url, "failed to get openid-configuration");
        return Err(AuthError::Discovery(format!(
            "failed to get openid-configuration: {status}"
        )));
    }

    let metadata = response.json::<ProviderMetadata>().map_err(|err| {
        AuthError::Discovery(format!("invalid openid-configuration: {err}"))
    })?;
    Ok(metadata.jwks_uri)
}
