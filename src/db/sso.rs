//! SSO auth-info read-through.
//!
//! Best effort by contract: any failure — missing member, store error, a
//! nonce invariant violation — yields an empty [`AuthInfo`] and never an
//! error. Nothing here participates in the write-behind pipeline; the only
//! write is the short-lived nonce row.
//!
//! The `state` parameter handed to the identity provider is an HMAC-SHA384
//! of the nonce under the controller's pre-shared key, so the redirect
//! endpoint can verify the round trip without storing per-request state.

use hmac::{Hmac, Mac};
use sha2::Sha384;
use tracing::{debug, warn};

use crate::liveness::now_ms;
use crate::record::MemberRecord;

use super::ControllerDb;

/// Nonces are valid for five minutes.
const NONCE_EXPIRY_MS: i64 = 300_000;

/// What the member-join flow needs to bounce a user through SSO.
///
/// `version` 0 carries a fully-formed `authentication_url`; version 1
/// carries the structured fields and lets the client compose the URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthInfo {
    pub enabled: bool,
    pub version: u64,
    pub authentication_url: String,
    pub sso_client_id: String,
    pub issuer_url: String,
    pub sso_provider: String,
    pub sso_nonce: String,
    pub sso_state: String,
    pub central_auth_url: String,
}

impl ControllerDb {
    /// Obtain (or mint) the SSO auth info for a member. Empty on any
    /// failure; never fails.
    pub async fn sso_auth_info(&self, member: &MemberRecord, redirect_url: &str) -> AuthInfo {
        if !self.config.sso_enabled {
            return AuthInfo::default();
        }

        let (Some(network_id), Some(member_id)) = (member.nwid, member.id) else {
            crate::metrics::record_sso_lookup("invalid");
            return AuthInfo::default();
        };

        match self
            .sso_auth_info_inner(&network_id.to_string(), &member_id.to_string(), redirect_url)
            .await
        {
            Ok(info) => {
                crate::metrics::record_sso_lookup(if info.enabled { "success" } else { "empty" });
                info
            }
            Err(e) => {
                warn!(network_id = %network_id, member_id = %member_id, error = %e,
                    "sso auth info lookup failed");
                crate::metrics::record_sso_lookup("error");
                AuthInfo::default()
            }
        }
    }

    async fn sso_auth_info_inner(
        &self,
        network_id: &str,
        member_id: &str,
        redirect_url: &str,
    ) -> Result<AuthInfo, crate::error::DbError> {
        let mut info = AuthInfo {
            enabled: true,
            ..Default::default()
        };

        if !self.store.sso_member_exists(network_id, member_id).await? {
            debug!(network_id, member_id, "sso lookup for unknown member");
            return Ok(info);
        }

        // One usable nonce per (network, member): an active one wins, an
        // unused one is recycled, otherwise mint a fresh one. More than one
        // candidate in either bucket means something else is writing rows it
        // should not; give up rather than guess.
        let active = self.store.sso_active_nonces(network_id, member_id).await?;
        let nonce = match active.len() {
            1 => active.into_iter().next().unwrap_or_default(),
            0 => {
                let unused = self.store.sso_unused_nonces(network_id, member_id).await?;
                match unused.len() {
                    1 => unused.into_iter().next().unwrap_or_default(),
                    0 => {
                        let nonce = hex::encode(rand::random::<[u8; 16]>());
                        self.store
                            .sso_insert_nonce(
                                &nonce,
                                now_ms() + NONCE_EXPIRY_MS,
                                network_id,
                                member_id,
                            )
                            .await?;
                        nonce
                    }
                    n => {
                        warn!(network_id, member_id, count = n, "more than one unused sso nonce");
                        return Ok(AuthInfo::default());
                    }
                }
            }
            n => {
                warn!(network_id, member_id, count = n, "more than one sso nonce in use");
                return Ok(AuthInfo::default());
            }
        };

        let Some(client) = self.store.sso_client_info(network_id).await? else {
            debug!(network_id, "no oidc client configured for network");
            return Ok(info);
        };
        info.version = client.version;

        if client.client_id.is_empty() || client.authorization_endpoint.is_empty() {
            debug!(network_id, "oidc client missing id or endpoint");
            return Ok(info);
        }

        let mut nonce_bytes = [0u8; 16];
        let decoded = hex::decode(&nonce).unwrap_or_default();
        let n = decoded.len().min(16);
        nonce_bytes[..n].copy_from_slice(&decoded[..n]);

        let Ok(mut mac) = Hmac::<Sha384>::new_from_slice(&self.sso_psk) else {
            return Ok(AuthInfo::default());
        };
        mac.update(&nonce_bytes);
        let state_hex = hex::encode(mac.finalize().into_bytes());

        match info.version {
            0 => {
                info.authentication_url = format!(
                    "{}?response_type=id_token&response_mode=form_post&scope=openid+email+profile\
                     &redirect_uri={}&nonce={}&state={}&client_id={}",
                    client.authorization_endpoint,
                    url_encode(redirect_url),
                    nonce,
                    state_hex,
                    client.client_id,
                );
            }
            1 => {
                info.sso_client_id = client.client_id;
                info.issuer_url = client.issuer;
                info.sso_provider = client.provider;
                info.sso_nonce = nonce;
                info.sso_state = format!("{state_hex}_{network_id}");
                info.central_auth_url = redirect_url.to_string();
            }
            v => {
                warn!(version = v, "unknown sso implementation version");
            }
        }

        Ok(info)
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn url_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_encode_unreserved_passthrough() {
        assert_eq!(url_encode("AZaz09-_.~"), "AZaz09-_.~");
    }

    #[test]
    fn test_url_encode_reserved() {
        assert_eq!(
            url_encode("https://my.example.com/auth?x=1&y=2"),
            "https%3A%2F%2Fmy.example.com%2Fauth%3Fx%3D1%26y%3D2"
        );
        assert_eq!(url_encode("a b"), "a%20b");
    }

    #[test]
    fn test_url_encode_non_ascii() {
        assert_eq!(url_encode("é"), "%C3%A9");
    }

    #[test]
    fn test_auth_info_default_is_disabled() {
        let info = AuthInfo::default();
        assert!(!info.enabled);
        assert!(info.authentication_url.is_empty());
        assert_eq!(info.version, 0);
    }
}
