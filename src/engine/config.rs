use serde_json::Value;

use crate::profile::TunnelProfile;

use super::PROXY_ENDPOINT;

/// Render the protocol-engine client config for `profile`.
///
/// Output is byte-stable for a given profile; string fields are JSON-escaped.
#[must_use]
pub fn render(profile: &TunnelProfile) -> String {
    format!(
        r#"{{
    "server": {server},
    "auth": {auth},
    "tls": {{ "insecure": {insecure} }},
    "bandwidth": {{ "up": "{up} mbps", "down": "{down} mbps" }},
    "fast_open": true,
    "lazy": true,
    "socks5": {{ "listen": "{listen}" }}
}}"#,
        server = quote(&profile.address),
        auth = quote(&profile.auth_token),
        insecure = profile.allow_insecure_tls,
        up = profile.upload_limit_mbps,
        down = profile.download_limit_mbps,
        listen = PROXY_ENDPOINT,
    )
}

fn quote(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}
