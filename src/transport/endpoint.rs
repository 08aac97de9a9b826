//! Endpoint URL construction.
//!
//! A socket endpoint such as `https://example.com/socket` is normalised to
//! `wss://example.com/socket/websocket?vsn=2.0.0&token=...`. Params are
//! resolved by the caller on every connect so they can carry live credentials.

use serde_json::Value;
use url::Url;

use crate::core::{Payload, SocketError, WEBSOCKET_PATH};

/// Map the endpoint scheme to its websocket counterpart.
///
/// Returns an error for schemes that cannot carry a websocket.
pub fn websocket_scheme(scheme: &str) -> Result<&'static str, SocketError> {
    match scheme {
        "http" | "ws" => Ok("ws"),
        "https" | "wss" => Ok("wss"),
        other => Err(SocketError::UnsupportedScheme(other.to_string())),
    }
}

/// Parse and validate a socket endpoint.
pub fn parse_endpoint(endpoint: &str) -> Result<Url, SocketError> {
    let url = Url::parse(endpoint)?;
    websocket_scheme(url.scheme())?;
    Ok(url)
}

/// Build the fully qualified websocket URL for a connection attempt.
///
/// - the scheme becomes `ws`/`wss`
/// - the path gets a `/websocket` suffix unless it already has one
/// - `vsn` and then each param are appended to any existing query
pub fn build_endpoint_url(endpoint: &Url, params: &Payload, vsn: &str) -> Url {
    let mut url = endpoint.clone();

    if let Ok(scheme) = websocket_scheme(endpoint.scheme()) {
        // Switching between special schemes always succeeds.
        let _ = url.set_scheme(scheme);
    }

    let path = url.path().trim_end_matches('/');
    if !path.ends_with(&format!("/{WEBSOCKET_PATH}")) {
        let path = format!("{path}/{WEBSOCKET_PATH}");
        url.set_path(&path);
    }

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("vsn", vsn);
        for (key, value) in params {
            query.append_pair(key, &param_text(value));
        }
    }

    url
}

fn param_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
