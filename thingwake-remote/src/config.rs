use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::signer::Credentials;
use crate::util::http::{InvalidUriError, Uri};
use crate::util::json::millis;
use crate::util::types::ThingName;

// Be careful when changing these structs. They are persisted as part of the
// thing config and a device that cannot decode them cannot reach its shadow
// anymore. Add new fields with a serde default.

/// Where the shadow lives
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct RemoteConfig {
    pub endpoint: Uri,

    /// Signing region, e.g. `us-east-1`
    pub region: String,

    #[serde(default)]
    pub request: RequestConfig,
}

impl RemoteConfig {
    /// The data endpoint of an account, `https://<prefix>.iot.<region>.amazonaws.com`
    pub fn from_prefix(prefix: &str, region: &str) -> Result<Self, InvalidUriError> {
        let endpoint = format!("https://{prefix}.iot.{region}.amazonaws.com").parse()?;
        Ok(Self {
            endpoint,
            region: region.to_owned(),
            request: RequestConfig::default(),
        })
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RequestConfig {
    /// Time allowed for one request, from connect to the last body byte
    #[serde(with = "millis")]
    pub timeout: Duration,

    /// Total tries for a request, including the first one
    pub attempts: u32,

    /// Wait before the first retry, doubled on every following one
    #[serde(with = "millis")]
    pub min_backoff: Duration,

    #[serde(with = "millis")]
    pub max_backoff: Duration,

    /// Largest response body accepted
    pub max_body_bytes: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            attempts: 3,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
            max_body_bytes: 16 * 1024,
        }
    }
}

/// Everything needed to talk to the shadow of one thing.
///
/// Built once at start and only ever borrowed afterwards.
#[derive(Clone, Debug)]
pub struct ThingIdentity {
    pub thing_name: ThingName,
    pub remote: RemoteConfig,
    pub credentials: Credentials,
}

impl ThingIdentity {
    pub fn new(thing_name: ThingName, remote: RemoteConfig, credentials: Credentials) -> Self {
        Self {
            thing_name,
            remote,
            credentials,
        }
    }

    /// `{endpoint}/things/{thing}/shadow`
    pub fn shadow_uri(&self) -> Result<Uri, InvalidUriError> {
        self.remote
            .endpoint
            .join(&format!("/things/{}/shadow", self.thing_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::SecretKey;

    #[test]
    fn it_builds_the_endpoint_from_a_prefix() {
        let remote = RemoteConfig::from_prefix("a1b2c3", "eu-west-1").unwrap();
        assert_eq!(
            remote.endpoint.to_string(),
            "https://a1b2c3.iot.eu-west-1.amazonaws.com/"
        );
        assert_eq!(remote.region, "eu-west-1");
    }

    #[test]
    fn it_builds_the_shadow_uri() {
        let identity = ThingIdentity::new(
            "shade-01".parse().unwrap(),
            RemoteConfig::from_prefix("a1b2c3", "eu-west-1").unwrap(),
            Credentials::new("AKID", SecretKey::from("secret")),
        );
        assert_eq!(
            identity.shadow_uri().unwrap().to_string(),
            "https://a1b2c3.iot.eu-west-1.amazonaws.com/things/shade-01/shadow"
        );
    }

    #[test]
    fn request_config_fills_in_missing_fields() {
        let config: RequestConfig =
            serde_json::from_str(r#"{"attempts": 5, "timeout": 1000}"#).unwrap();
        assert_eq!(config.attempts, 5);
        assert_eq!(config.timeout, Duration::from_secs(1));
        assert_eq!(config.max_backoff, Duration::from_secs(8));
    }
}
