use std::collections::HashMap;

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};
use thiserror::Error;
use url::Url;

pub const USER_HOST_PARAM: &str = "host";
pub const REFERER_HOST_PARAM: &str = "domain";
pub const MODIFIED_PARAM: &str = "modified";
pub const EXPIRES_PARAM: &str = "expires";
pub const SIG_PARAM: &str = "sig";

/// The fields bound together by a signed URL. Times are unix seconds; zero
/// means "not set" for both `modified` and `expires`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SigParams {
    pub host: String,
    pub method: String,
    pub path: String,
    pub modified: i64,
    pub expires: i64,
    pub user_host: String,
    pub referer_host: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("bad signature")]
    BadSignature,
    #[error("url expired")]
    Expired,
    #[error("bad userhost")]
    UserHostMismatch,
    #[error("bad referer")]
    RefererMismatch,
}

fn sha1_hex(input: &str) -> String {
    format!("{:x}", Sha1::digest(input.as_bytes()))
}

/// Strips leading/trailing spaces and slashes; the result is the canonical
/// request path used for both signing and cache addressing.
pub fn trim_path(path: &str) -> &str {
    path.trim_matches([' ', '/'])
}

/// Parses a unix-seconds query parameter; the empty string decodes to zero.
pub fn parse_unix_param(value: &str) -> Result<i64> {
    if value.is_empty() {
        return Ok(0);
    }
    value
        .parse::<i64>()
        .with_context(|| format!("invalid unix timestamp '{value}'"))
}

pub fn sign(secret: &str, p: &SigParams) -> String {
    let to_sign = [
        p.host.as_str(),
        p.method.as_str(),
        p.path.as_str(),
        &p.modified.to_string(),
        &p.expires.to_string(),
        p.user_host.as_str(),
        p.referer_host.as_str(),
    ]
    .join("&");
    sha1_hex(&format!("{secret}{}", sha1_hex(&to_sign)))
}

/// Builds a fully signed URL against `cdn_url`; the host component of the
/// signature is taken from the URL so the server-side check lines up with
/// the Host header it will see.
pub fn build_signed_url(secret: &str, cdn_url: &str, p: &SigParams) -> Result<String> {
    let mut url = Url::parse(cdn_url).with_context(|| format!("invalid cdn url '{cdn_url}'"))?;
    let mut p = p.clone();
    p.host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    };
    p.path = trim_path(&p.path).to_string();
    let sig = sign(secret, &p);
    url.set_path(&format!("/{}", p.path));
    url.query_pairs_mut()
        .clear()
        .append_pair(USER_HOST_PARAM, &p.user_host)
        .append_pair(REFERER_HOST_PARAM, &p.referer_host)
        .append_pair(MODIFIED_PARAM, &p.modified.to_string())
        .append_pair(EXPIRES_PARAM, &p.expires.to_string())
        .append_pair(SIG_PARAM, &sig);
    Ok(url.to_string())
}

/// Recomputes the signature from the request parameters and compares it to
/// the `sig` query value. Expiry and host/referer pinning are checked
/// separately so callers can distinguish the failure modes.
pub fn authenticate(
    secret: &str,
    method: &str,
    host: &str,
    path: &str,
    query: &HashMap<String, String>,
) -> Result<SigParams, SignatureError> {
    let get = |key: &str| query.get(key).cloned().unwrap_or_default();
    let modified = parse_unix_param(&get(MODIFIED_PARAM)).map_err(|_| SignatureError::BadSignature)?;
    let expires = parse_unix_param(&get(EXPIRES_PARAM)).map_err(|_| SignatureError::BadSignature)?;

    let params = SigParams {
        host: host.to_string(),
        method: method.to_string(),
        path: trim_path(path).to_string(),
        modified,
        expires,
        user_host: get(USER_HOST_PARAM),
        referer_host: get(REFERER_HOST_PARAM),
    };

    if sign(secret, &params) != get(SIG_PARAM) {
        return Err(SignatureError::BadSignature);
    }
    Ok(params)
}

impl SigParams {
    /// Zero expiry never expires.
    pub fn check_expiry(&self, now: i64) -> Result<(), SignatureError> {
        if self.expires != 0 && self.expires < now {
            return Err(SignatureError::Expired);
        }
        Ok(())
    }

    pub fn check_user_host(&self, remote: &str) -> Result<(), SignatureError> {
        if !self.user_host.is_empty() && self.user_host != remote {
            return Err(SignatureError::UserHostMismatch);
        }
        Ok(())
    }

    pub fn check_referer(&self, referer_host: Option<&str>) -> Result<(), SignatureError> {
        if self.referer_host.is_empty() {
            return Ok(());
        }
        match referer_host {
            Some(host) if host == self.referer_host => Ok(()),
            _ => Err(SignatureError::RefererMismatch),
        }
    }
}
