use std::fmt::{Debug, Display};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::clock::{ClockUnsyncedError, TimeSource};
use crate::util::config::StoredConfig;
use crate::util::crypto::sha256_hex_digest;
use crate::util::http::Method;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const DEFAULT_SERVICE: &str = "iotdata";

type HmacSha256 = Hmac<Sha256>;

/// Raw secret key material.
///
/// The bytes are used as they are, never re-encoded, and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

impl From<Vec<u8>> for SecretKey {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<String> for SecretKey {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<&str> for SecretKey {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl Serialize for SecretKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let s = std::str::from_utf8(&self.0).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(s)
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Self::from)
    }
}

/// Access key pair used to sign every request
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: SecretKey,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: SecretKey) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key,
        }
    }
}

impl StoredConfig for Credentials {
    fn kind() -> &'static str {
        "credentials"
    }
}

/// The parts of an HTTP request covered by the signature
#[derive(Clone, Debug, PartialEq)]
pub struct CanonicalRequest {
    pub method: Method,

    /// Value of the `host` header, including a non-default port
    pub host: String,

    pub path: String,
    pub query: Vec<(String, String)>,

    /// Extra headers to sign and send, `host` and `x-amz-date` are added
    /// when signing
    pub headers: Vec<(String, String)>,

    pub body: Vec<u8>,
}

impl CanonicalRequest {
    pub fn new(method: Method, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            host: host.into(),
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_body(self, body: Vec<u8>) -> Self {
        Self { body, ..self }
    }

    /// Lower-cased, trimmed and sorted headers including the ones added by
    /// the signer
    fn signed_headers(&self, amz_date: &str) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.trim().to_ascii_lowercase(),
                    value.split_whitespace().collect::<Vec<_>>().join(" "),
                )
            })
            .filter(|(name, _)| name != "host" && name != "x-amz-date")
            .collect();
        headers.push(("host".into(), self.host.clone()));
        headers.push(("x-amz-date".into(), amz_date.to_owned()));
        headers.sort();
        headers
    }

    fn canonical_query(&self) -> String {
        let mut query: Vec<(String, String)> = self
            .query
            .iter()
            .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
            .collect();
        query.sort();
        query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Returns the canonical request string and the signed header list
    fn canonical_form(&self, amz_date: &str) -> (String, String) {
        let headers = self.signed_headers(amz_date);
        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();
        let signed: Vec<&str> = headers.iter().map(|(name, _)| name.as_str()).collect();
        let signed = signed.join(";");

        let path = if self.path.is_empty() {
            "/".to_owned()
        } else {
            uri_encode(&self.path, false)
        };

        let payload_hash = sha256_hex_digest(&self.body);
        let parts: [&str; 6] = [
            self.method.as_str(),
            &path,
            &self.canonical_query(),
            &canonical_headers,
            &signed,
            &payload_hash,
        ];
        let canonical = parts.join("\n");

        (canonical, signed)
    }
}

/// Hex-encoded request signature
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A request ready to be sent.
///
/// Valid only for the timestamp it was signed at; a retry needs a new one.
#[derive(Clone, Debug, PartialEq)]
pub struct SignedRequest {
    pub method: Method,
    pub path: String,

    /// All headers to send, including `authorization` and `x-amz-date`
    pub headers: Vec<(String, String)>,

    pub body: Vec<u8>,
    pub signature: Signature,
    pub timestamp: DateTime<Utc>,
}

/// AWS Signature Version 4 signer for one region and service
#[derive(Clone, Debug)]
pub struct RequestSigner {
    region: String,
    service: String,
}

impl RequestSigner {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            service: DEFAULT_SERVICE.to_owned(),
        }
    }

    pub fn with_service(self, service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..self
        }
    }

    fn scope(&self, date: &str) -> String {
        format!("{date}/{}/{}/aws4_request", self.region, self.service)
    }

    fn signature_and_headers(
        &self,
        request: &CanonicalRequest,
        credentials: &Credentials,
        timestamp: DateTime<Utc>,
    ) -> (Signature, String) {
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();
        let date = timestamp.format("%Y%m%d").to_string();
        let scope = self.scope(&date);

        let (canonical, signed_headers) = request.canonical_form(&amz_date);
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            sha256_hex_digest(&canonical)
        );

        let mut key = b"AWS4".to_vec();
        key.extend_from_slice(credentials.secret_access_key.as_bytes());
        let key = hmac_sha256(&key, date.as_bytes());
        let key = hmac_sha256(&key, self.region.as_bytes());
        let key = hmac_sha256(&key, self.service.as_bytes());
        let key = hmac_sha256(&key, b"aws4_request");

        let mut mac = new_mac(&key);
        mac.update(string_to_sign.as_bytes());
        let signature = Signature(format!("{:x}", mac.finalize().into_bytes()));

        (signature, signed_headers)
    }

    /// Compute the signature of `request` at `timestamp`.
    ///
    /// This is a pure function of its inputs.
    pub fn sign(
        &self,
        request: &CanonicalRequest,
        credentials: &Credentials,
        timestamp: DateTime<Utc>,
    ) -> Signature {
        self.signature_and_headers(request, credentials, timestamp).0
    }

    /// Sign `request` at `timestamp` and build the headers to send
    pub fn sign_at(
        &self,
        request: &CanonicalRequest,
        credentials: &Credentials,
        timestamp: DateTime<Utc>,
    ) -> SignedRequest {
        let (signature, signed_headers) =
            self.signature_and_headers(request, credentials, timestamp);
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();
        let date = timestamp.format("%Y%m%d").to_string();

        let authorization = format!(
            "{ALGORITHM} Credential={}/{}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key_id,
            self.scope(&date),
        );

        let mut headers = request.signed_headers(&amz_date);
        headers.push(("authorization".into(), authorization));

        SignedRequest {
            method: request.method.clone(),
            path: request.path.clone(),
            headers,
            body: request.body.clone(),
            signature,
            timestamp,
        }
    }

    /// Sign `request` with the current time of `clock`.
    ///
    /// Fails if the clock cannot be trusted yet; the caller is expected to
    /// sync it and try again.
    pub fn sign_request<C: TimeSource + ?Sized>(
        &self,
        request: &CanonicalRequest,
        credentials: &Credentials,
        clock: &C,
    ) -> Result<SignedRequest, ClockUnsyncedError> {
        let timestamp = clock.now()?;
        Ok(self.sign_at(request, credentials, timestamp))
    }
}

fn new_mac(key: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = new_mac(key);
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Percent-encode everything but unreserved characters. Slashes are kept
/// when encoding a path.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut encoded = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            b'/' if !encode_slash => encoded.push('/'),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}
