use clap::{Parser, ValueEnum};
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use crate::things::ThingKind;
use crate::util::http::Uri;
use crate::util::types::ThingName;

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

/// What to do once the next wake is scheduled
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SleepMode {
    /// Print the sleep interval in seconds and exit, for a host that powers
    /// the device down
    #[default]
    Exit,
    /// Sleep in process and run the next cycle
    Emulate,
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Name of the thing whose shadow is reconciled
    #[arg(env = "THINGWAKE_THING_NAME", long = "thing-name", value_name = "name")]
    pub thing_name: Option<ThingName>,

    /// Kind of device this is
    #[arg(
        env = "THINGWAKE_THING_KIND",
        long = "thing-kind",
        value_name = "kind",
        value_enum
    )]
    pub thing_kind: Option<ThingKind>,

    /// Shadow data endpoint URI
    #[arg(
        env = "THINGWAKE_ENDPOINT",
        long = "endpoint",
        value_name = "uri",
        requires = "region",
        conflicts_with = "endpoint_prefix"
    )]
    pub endpoint: Option<Uri>,

    /// Account endpoint prefix, the endpoint becomes
    /// https://<prefix>.iot.<region>.amazonaws.com
    #[arg(
        env = "THINGWAKE_ENDPOINT_PREFIX",
        long = "endpoint-prefix",
        value_name = "prefix",
        requires = "region"
    )]
    pub endpoint_prefix: Option<String>,

    /// Signing region, e.g. "eu-west-1"
    #[arg(env = "THINGWAKE_REGION", long = "region", value_name = "region")]
    pub region: Option<String>,

    /// Access key id used to sign requests
    #[arg(
        env = "THINGWAKE_ACCESS_KEY_ID",
        long = "access-key-id",
        value_name = "id",
        requires = "secret_access_key"
    )]
    pub access_key_id: Option<String>,

    /// Secret access key used to sign requests
    #[arg(
        env = "THINGWAKE_SECRET_ACCESS_KEY",
        long = "secret-access-key",
        value_name = "key",
        hide_env_values = true,
        requires = "access_key_id"
    )]
    pub secret_access_key: Option<String>,

    /// SNTP server used when the clock cannot be trusted, as host:port
    #[arg(env = "THINGWAKE_NTP_SERVER", long = "ntp-server", value_name = "addr")]
    pub ntp_server: Option<String>,

    /// Shadow key holding the actuator position
    #[arg(
        env = "THINGWAKE_POSITION_KEY",
        long = "position-key",
        value_name = "key"
    )]
    pub position_key: Option<String>,

    /// Sleep between wakes in milliseconds
    #[arg(
        env = "THINGWAKE_BASE_INTERVAL_MS",
        long = "base-interval-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub base_interval: Option<Duration>,

    /// Sleep after a fault or timeout in milliseconds
    #[arg(
        env = "THINGWAKE_FAULT_RETRY_INTERVAL_MS",
        long = "fault-retry-interval-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub fault_retry_interval: Option<Duration>,

    /// Maximum actuation time in milliseconds
    #[arg(
        env = "THINGWAKE_ACTUATION_TIMEOUT_MS",
        long = "actuation-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub actuation_timeout: Option<Duration>,

    /// Distance from the target accepted as converged
    #[arg(env = "THINGWAKE_TOLERANCE", long = "tolerance", value_name = "units")]
    pub tolerance: Option<f64>,

    /// Position sampling interval in milliseconds
    #[arg(
        env = "THINGWAKE_POLL_INTERVAL_MS",
        long = "poll-interval-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub poll_interval: Option<Duration>,

    /// Shadow request timeout in milliseconds
    #[arg(
        env = "THINGWAKE_REQUEST_TIMEOUT_MS",
        long = "request-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub request_timeout: Option<Duration>,

    /// Tries per shadow request, including the first one
    #[arg(
        env = "THINGWAKE_REQUEST_ATTEMPTS",
        long = "request-attempts",
        value_name = "int"
    )]
    pub request_attempts: Option<u32>,

    /// Speed of the simulated motor in units per second
    #[arg(env = "THINGWAKE_MOTOR_SPEED", long = "motor-speed", value_name = "speed")]
    pub motor_speed: Option<f64>,

    /// Battery voltage reading in millivolts
    #[arg(env = "THINGWAKE_BATTERY_MV", long = "battery-mv", value_name = "mv")]
    pub battery_mv: Option<u32>,

    /// Battery current reading in milliamps, positive while charging
    #[arg(
        env = "THINGWAKE_BATTERY_MA",
        long = "battery-ma",
        value_name = "ma",
        allow_negative_numbers = true,
        requires = "battery_mv"
    )]
    pub battery_ma: Option<i32>,

    /// What to do once the next wake is scheduled
    #[arg(
        env = "THINGWAKE_SLEEP_MODE",
        long = "sleep-mode",
        value_name = "mode",
        value_enum,
        default_value_t = SleepMode::Exit
    )]
    pub sleep_mode: SleepMode,

    /// Stop after this many cycles when emulating sleep
    #[arg(
        env = "THINGWAKE_MAX_CYCLES",
        long = "max-cycles",
        value_name = "int"
    )]
    pub max_cycles: Option<u32>,

    /// Directory holding the thing config and credentials
    #[arg(env = "THINGWAKE_CONFIG_DIR", long = "config-dir", value_name = "path")]
    pub config_dir: Option<PathBuf>,

    /// Directory holding the state kept between wakes
    #[arg(env = "THINGWAKE_STATE_DIR", long = "state-dir", value_name = "path")]
    pub state_dir: Option<PathBuf>,
}

pub fn parse() -> Cli {
    Parser::parse()
}
