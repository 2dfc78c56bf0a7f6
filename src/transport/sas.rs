//! Shared Access Signature tokens.
//!
//! `SharedAccessSignature sr={uri}&sig={sig}&se={expiry}&skn={key_name}`, where
//! `sig` is base64(HMAC-SHA256(key, "{uri}\n{expiry}")) and `uri` is the
//! URL-encoded lowercase resource URI.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;

use super::TransportError;

/// Characters left unescaped, matching JavaScript's `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Default token lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Resource URI a hybrid connection token is scoped to.
pub fn resource_uri(namespace_fqdn: &str, entity: &str) -> String {
    format!("http://{namespace_fqdn}/{entity}").to_lowercase()
}

/// Token valid for `ttl` from now.
pub fn token(
    resource_uri: &str,
    key_name: &str,
    key: &str,
    ttl: Duration,
) -> Result<String, TransportError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| TransportError::Signing(e.to_string()))?;
    sign_at(resource_uri, key_name, key, (now + ttl).as_secs())
}

/// Token expiring at `expiry` (seconds since the Unix epoch).
pub fn sign_at(
    resource_uri: &str,
    key_name: &str,
    key: &str,
    expiry: u64,
) -> Result<String, TransportError> {
    let encoded_uri = encode(resource_uri);
    let to_sign = format!("{encoded_uri}\n{expiry}");
    let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
        .map_err(|e| TransportError::Signing(e.to_string()))?;
    mac.update(to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());
    Ok(format!(
        "SharedAccessSignature sr={encoded_uri}&sig={}&se={expiry}&skn={}",
        encode(&signature),
        encode(key_name)
    ))
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_uri_is_lowercase() {
        assert_eq!(
            resource_uri("MyRelay.servicebus.windows.net", "Docs"),
            "http://myrelay.servicebus.windows.net/docs"
        );
    }

    #[test]
    fn test_token_layout() {
        let uri = resource_uri("ns.servicebus.windows.net", "docs");
        let token = sign_at(&uri, "listen", "secret", 1_700_000_000).unwrap();
        assert!(token.starts_with(
            "SharedAccessSignature sr=http%3A%2F%2Fns.servicebus.windows.net%2Fdocs&sig="
        ));
        assert!(token.ends_with("&se=1700000000&skn=listen"));

        let sig = token
            .split("&sig=")
            .nth(1)
            .and_then(|rest| rest.split('&').next())
            .unwrap();
        let decoded = percent_encoding::percent_decode_str(sig)
            .decode_utf8()
            .unwrap();
        assert_eq!(STANDARD.decode(decoded.as_bytes()).unwrap().len(), 32);
    }

    #[test]
    fn test_signature_depends_on_key_and_expiry() {
        let uri = resource_uri("ns.servicebus.windows.net", "docs");
        let a = sign_at(&uri, "listen", "k1", 10).unwrap();
        assert_eq!(a, sign_at(&uri, "listen", "k1", 10).unwrap());
        assert_ne!(a, sign_at(&uri, "listen", "k2", 10).unwrap());
        assert_ne!(a, sign_at(&uri, "listen", "k1", 11).unwrap());
    }

    #[test]
    fn test_token_expiry_in_future() {
        let token = token("http://ns/docs", "listen", "k", DEFAULT_TTL).unwrap();
        let se: u64 = token
            .split("&se=")
            .nth(1)
            .and_then(|rest| rest.split('&').next())
            .unwrap()
            .parse()
            .unwrap();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(se > now + 3000);
    }
}
