//! AWS Signature Version 4 request signing.
//!
//! Only what the Bedrock endpoints need: header-based signing of a request
//! whose body is fully known up front.

use crate::core::error::Result;
use crate::core::AppError;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Key material used for one signature.
pub struct SigningKey<'a> {
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub session_token: Option<&'a str>,
    pub region: &'a str,
    pub service: &'a str,
}

/// Headers to attach to the signed request.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub security_token: Option<String>,
}

impl SignedHeaders {
    pub fn into_pairs(self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("authorization", self.authorization),
            ("x-amz-date", self.amz_date),
        ];
        if let Some(token) = self.security_token {
            pairs.push(("x-amz-security-token", token));
        }
        pairs
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac: Hmac<Sha256> = Hmac::new_from_slice(key)
        .map_err(|e| AppError::Internal(format!("HMAC key rejected: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive the per-day signing key.
pub fn derive_signing_key(secret_key: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode every path segment. Non-S3 services sign the already-encoded
/// path, so `%3A` in the request line becomes `%253A` here.
fn canonical_uri(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            (
                urlencoding::encode(&k).into_owned(),
                urlencoding::encode(&v).into_owned(),
            )
        })
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Sign a request.
///
/// `extra_headers` are signed in addition to `host`, `x-amz-date` and, when a
/// session token is present, `x-amz-security-token`. Names must be lowercase.
pub fn sign_request(
    method: &str,
    url: &Url,
    extra_headers: &[(&str, &str)],
    body: &[u8],
    key: &SigningKey<'_>,
    now: DateTime<Utc>,
) -> Result<SignedHeaders> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let mut headers: Vec<(String, String)> = vec![
        ("host".to_string(), host_header(url)),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(token) = key.session_token {
        headers.push(("x-amz-security-token".to_string(), token.to_string()));
    }
    for (name, value) in extra_headers {
        headers.push((name.to_ascii_lowercase(), value.trim().to_string()));
    }
    headers.sort();

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        canonical_uri(url),
        canonical_query(url),
        canonical_headers,
        signed_headers,
        sha256_hex(body)
    );

    let scope = format!("{}/{}/{}/aws4_request", date, key.region, key.service);
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(key.secret_key, &date, key.region, key.service)?;
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

    Ok(SignedHeaders {
        authorization: format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, key.access_key, scope, signed_headers, signature
        ),
        amz_date,
        security_token: key.session_token.map(str::to_string),
    })
}
