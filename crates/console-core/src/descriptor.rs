//! Session descriptors carried inside console tokens.
//!
//! A token is `base64url(AES-CBC(JSON(SessionDescriptor)))`. Opening a token
//! decrypts and parses it; [`SessionDescriptor::validate`] then performs the
//! structural checks that decide whether the descriptor may be connected.

use crate::codec;
use crate::error::{ConsoleError, ConsoleResult};
use crate::secret::EncryptorSecret;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use url::Url;

static OPAQUE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^OpaqueRef:[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}$")
        .expect("valid OpaqueRef pattern")
});

static CONSOLE_UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}$")
        .expect("valid uuid pattern")
});

/// Decrypted console session descriptor.
///
/// Missing string fields deserialize as empty so that [`validate`](Self::validate)
/// rejects them rather than the JSON parser.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionDescriptor {
    pub client_host_address: String,
    pub client_host_port: i64,
    pub client_host_password: String,
    pub client_tag: String,
    pub ticket: String,
    pub locale: String,
    pub client_tunnel_url: String,
    pub client_tunnel_session: String,
}

impl fmt::Debug for SessionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDescriptor")
            .field("client_host_address", &self.client_host_address)
            .field("client_host_port", &self.client_host_port)
            .field("client_host_password", &"<redacted>")
            .field("client_tag", &self.client_tag)
            .field("ticket", &"<redacted>")
            .field("locale", &self.locale)
            .field("client_tunnel_url", &self.client_tunnel_url)
            .field("client_tunnel_session", &"<redacted>")
            .finish()
    }
}

impl SessionDescriptor {
    /// Run every structural check. The first failing check is reported.
    pub fn validate(&self) -> ConsoleResult<()> {
        if !OPAQUE_REF.is_match(&self.client_tunnel_session) {
            return Err(ConsoleError::Validation(
                "clientTunnelSession is not an OpaqueRef".into(),
            ));
        }

        let url = self.tunnel_url()?;

        let uuid = url
            .query_pairs()
            .find(|(k, _)| k == "uuid")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();
        if uuid.is_empty() {
            return Err(ConsoleError::Validation(
                "clientTunnelUrl has no uuid query parameter".into(),
            ));
        }
        if !CONSOLE_UUID.is_match(&uuid) {
            return Err(ConsoleError::Validation(format!(
                "console uuid {uuid:?} is malformed"
            )));
        }

        Ok(())
    }

    /// Parse `clientTunnelUrl`, requiring an absolute URL with a host.
    pub fn tunnel_url(&self) -> ConsoleResult<Url> {
        let url = Url::parse(&self.client_tunnel_url)
            .map_err(|e| ConsoleError::Validation(format!("clientTunnelUrl: {e}")))?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(ConsoleError::Validation("clientTunnelUrl has no host".into()));
        }
        Ok(url)
    }
}

/// Decrypt `token` with `secret` and parse the descriptor. Does not validate.
pub fn open_token(secret: &EncryptorSecret, token: &str) -> ConsoleResult<SessionDescriptor> {
    let plaintext = codec::decrypt(&secret.key, &secret.iv, token)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| ConsoleError::Validation(format!("descriptor json: {e}")))
}

/// Serialize and encrypt a descriptor into a token.
pub fn seal_token(secret: &EncryptorSecret, descriptor: &SessionDescriptor) -> ConsoleResult<String> {
    let json = serde_json::to_vec(descriptor)
        .map_err(|e| ConsoleError::Validation(format!("descriptor json: {e}")))?;
    codec::encrypt(&secret.key, &secret.iv, &json)
}
