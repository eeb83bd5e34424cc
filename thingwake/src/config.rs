use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::cli::Cli;
use crate::remote::{Credentials, RemoteConfig, SecretKey, ThingIdentity};
use crate::state::{EngineConfig, SleepConfig, TargetRange};
use crate::things::{HardwareConfig, ThingKind};
use crate::util::config::{self, ConfigStoreError, StoredConfig};
use crate::util::http::InvalidUriError;
use crate::util::store::Store;
use crate::util::types::ThingName;

fn default_position_key() -> String {
    "position".to_owned()
}

fn default_ntp_server() -> Option<String> {
    Some("pool.ntp.org:123".to_owned())
}

/// Everything the device needs to know about itself, stored on first start
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ThingConfig {
    pub thing_name: ThingName,

    #[serde(default)]
    pub kind: ThingKind,

    pub remote: RemoteConfig,

    #[serde(default = "default_position_key")]
    pub position_key: String,

    #[serde(default)]
    pub range: TargetRange,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub sleep: SleepConfig,

    #[serde(default)]
    pub hardware: HardwareConfig,

    #[serde(default = "default_ntp_server")]
    pub ntp_server: Option<String>,
}

impl StoredConfig for ThingConfig {
    fn kind() -> &'static str {
        "thing"
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing {0}: pass it as an argument on first start")]
    Missing(&'static str),

    #[error(transparent)]
    InvalidEndpoint(#[from] InvalidUriError),

    #[error(transparent)]
    Store(#[from] ConfigStoreError),
}

/// The resolved configuration of a wake cycle
#[derive(Clone, Debug)]
pub struct Settings {
    pub identity: ThingIdentity,
    pub kind: ThingKind,
    pub position_key: String,
    pub range: TargetRange,
    pub engine: EngineConfig,
    pub sleep: SleepConfig,
    pub hardware: HardwareConfig,
    pub ntp_server: Option<String>,
}

impl Settings {
    pub fn new(config: ThingConfig, credentials: Credentials) -> Self {
        Self {
            identity: ThingIdentity::new(config.thing_name, config.remote, credentials),
            kind: config.kind,
            position_key: config.position_key,
            range: config.range,
            engine: config.engine,
            sleep: config.sleep,
            hardware: config.hardware,
            ntp_server: config.ntp_server,
        }
    }
}

/// Work out the settings for this run.
///
/// The identity (thing name and endpoint) is stored on first start and
/// arguments that disagree with it afterwards are ignored. Tunables given as
/// arguments always win over the stored values, without being stored.
#[instrument(skip_all, err)]
pub async fn resolve(cli: &Cli, config_store: &Store) -> Result<Settings, ConfigError> {
    let stored: Option<ThingConfig> = config::load(config_store).await?;
    let first_start = stored.is_none();

    let mut thing = match stored {
        Some(stored) => {
            if cli
                .thing_name
                .as_ref()
                .is_some_and(|name| name != &stored.thing_name)
            {
                warn!("ignoring --thing-name argument that is different to the stored identity");
            }
            if cli
                .endpoint
                .as_ref()
                .is_some_and(|endpoint| endpoint != &stored.remote.endpoint)
                || cli.endpoint_prefix.is_some()
            {
                warn!("ignoring endpoint arguments, using stored {}", stored.remote.endpoint);
            }
            stored
        }
        None => new_thing_config(cli)?,
    };

    let stored_credentials: Option<Credentials> = config::load(config_store).await?;
    let credentials = match (&cli.access_key_id, &cli.secret_access_key) {
        (Some(access_key_id), Some(secret)) => {
            Credentials::new(access_key_id.clone(), SecretKey::from(secret.as_str()))
        }
        _ => stored_credentials
            .clone()
            .ok_or(ConfigError::Missing("credentials"))?,
    };

    // nothing is stored until the identity is complete
    if first_start {
        config::save(config_store, &thing).await?;
        info!(thing = %thing.thing_name, endpoint = %thing.remote.endpoint, "stored thing identity");
    }
    if stored_credentials.as_ref() != Some(&credentials) {
        config::save(config_store, &credentials).await?;
        info!("stored new credentials");
    }

    apply_overrides(cli, &mut thing);

    Ok(Settings::new(thing, credentials))
}

fn new_thing_config(cli: &Cli) -> Result<ThingConfig, ConfigError> {
    let thing_name = cli
        .thing_name
        .clone()
        .ok_or(ConfigError::Missing("thing name"))?;
    let region = cli.region.as_deref().ok_or(ConfigError::Missing("region"));

    let remote = match (&cli.endpoint, &cli.endpoint_prefix) {
        (Some(endpoint), _) => RemoteConfig {
            endpoint: endpoint.clone(),
            region: region?.to_owned(),
            request: Default::default(),
        },
        (None, Some(prefix)) => RemoteConfig::from_prefix(prefix, region?)?,
        (None, None) => return Err(ConfigError::Missing("endpoint")),
    };

    Ok(ThingConfig {
        thing_name,
        kind: ThingKind::default(),
        remote,
        position_key: default_position_key(),
        range: TargetRange::default(),
        engine: EngineConfig::default(),
        sleep: SleepConfig::default(),
        hardware: HardwareConfig::default(),
        ntp_server: default_ntp_server(),
    })
}

fn apply_overrides(cli: &Cli, thing: &mut ThingConfig) {
    if let Some(kind) = cli.thing_kind {
        thing.kind = kind;
    }
    if let Some(position_key) = &cli.position_key {
        thing.position_key = position_key.clone();
    }
    if let Some(ntp_server) = &cli.ntp_server {
        thing.ntp_server = Some(ntp_server.clone());
    }

    let engine = &mut thing.engine;
    engine.timeout = cli.actuation_timeout.unwrap_or(engine.timeout);
    engine.tolerance = cli.tolerance.unwrap_or(engine.tolerance);
    engine.poll_interval = cli.poll_interval.unwrap_or(engine.poll_interval);

    let sleep = &mut thing.sleep;
    sleep.base_interval = cli.base_interval.unwrap_or(sleep.base_interval);
    sleep.fault_retry_interval = cli
        .fault_retry_interval
        .unwrap_or(sleep.fault_retry_interval);

    let request = &mut thing.remote.request;
    request.timeout = cli.request_timeout.unwrap_or(request.timeout);
    request.attempts = cli.request_attempts.unwrap_or(request.attempts);

    let hardware = &mut thing.hardware;
    hardware.motor_speed = cli.motor_speed.unwrap_or(hardware.motor_speed);
    if cli.battery_mv.is_some() {
        hardware.battery_mv = cli.battery_mv;
        hardware.battery_ma = cli.battery_ma;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::time::Duration;
    use tempfile::tempdir;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("thingwake").chain(args.iter().copied())).unwrap()
    }

    const FIRST_START: &[&str] = &[
        "--thing-name",
        "lamp-01",
        "--endpoint-prefix",
        "a1b2c3",
        "--region",
        "eu-west-1",
        "--access-key-id",
        "AKIDEXAMPLE",
        "--secret-access-key",
        "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
    ];

    #[tokio::test]
    async fn it_stores_the_identity_on_first_start() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        let settings = resolve(&cli(FIRST_START), &store).await.unwrap();
        assert_eq!(settings.identity.thing_name.as_str(), "lamp-01");
        assert_eq!(
            settings.identity.remote.endpoint.to_string(),
            "https://a1b2c3.iot.eu-west-1.amazonaws.com/"
        );
        assert_eq!(settings.identity.credentials.access_key_id, "AKIDEXAMPLE");
        assert!(dir.path().join("thing.json").exists());
        assert!(dir.path().join("credentials.json").exists());

        // a later start needs no arguments
        let settings = resolve(&cli(&[]), &store).await.unwrap();
        assert_eq!(settings.identity.thing_name.as_str(), "lamp-01");
        assert_eq!(settings.identity.remote.region, "eu-west-1");
        assert_eq!(settings.identity.credentials.access_key_id, "AKIDEXAMPLE");
    }

    #[tokio::test]
    async fn it_keeps_the_stored_identity() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        resolve(&cli(FIRST_START), &store).await.unwrap();

        let settings = resolve(&cli(&["--thing-name", "other-thing"]), &store)
            .await
            .unwrap();
        assert_eq!(settings.identity.thing_name.as_str(), "lamp-01");
    }

    #[tokio::test]
    async fn it_applies_tunables_without_storing_them() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        resolve(&cli(FIRST_START), &store).await.unwrap();

        let settings = resolve(
            &cli(&[
                "--base-interval-ms",
                "60000",
                "--tolerance",
                "0.5",
                "--request-attempts",
                "5",
                "--battery-mv",
                "3100",
            ]),
            &store,
        )
        .await
        .unwrap();
        assert_eq!(settings.sleep.base_interval, Duration::from_secs(60));
        assert_eq!(settings.engine.tolerance, 0.5);
        assert_eq!(settings.identity.remote.request.attempts, 5);
        assert_eq!(settings.hardware.battery_mv, Some(3100));

        let settings = resolve(&cli(&[]), &store).await.unwrap();
        assert_eq!(settings.sleep.base_interval, Duration::from_secs(300));
        assert_eq!(settings.engine.tolerance, 2.0);
    }

    #[tokio::test]
    async fn it_requires_an_identity_on_first_start() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        let res = resolve(&cli(&[]), &store).await;
        assert!(matches!(res, Err(ConfigError::Missing("thing name"))));
    }

    #[tokio::test]
    async fn it_requires_credentials() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        let res = resolve(&cli(&FIRST_START[..6]), &store).await;
        assert!(matches!(res, Err(ConfigError::Missing("credentials"))));
        assert!(!dir.path().join("thing.json").exists());

        // a corrected identity is taken on the next start
        let mut args = FIRST_START.to_vec();
        args[1] = "lamp-02";
        let settings = resolve(&cli(&args), &store).await.unwrap();
        assert_eq!(settings.identity.thing_name.as_str(), "lamp-02");
    }

    #[test]
    fn it_fills_defaults_in_partial_configs() {
        let thing: ThingConfig = serde_json::from_str(
            r#"{
                "thing_name": "lamp-01",
                "remote": {"endpoint": "https://shadow.example.com", "region": "eu-west-1"},
                "engine": {"timeout": 10000}
            }"#,
        )
        .unwrap();
        assert_eq!(thing.kind, ThingKind::Shade);
        assert_eq!(thing.position_key, "position");
        assert_eq!(thing.engine.timeout, Duration::from_secs(10));
        assert_eq!(thing.engine.tolerance, 2.0);
        assert_eq!(thing.sleep, SleepConfig::default());
        assert_eq!(thing.ntp_server.as_deref(), Some("pool.ntp.org:123"));
    }
}
