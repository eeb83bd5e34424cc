use std::error::Error;

use tracing::{debug, info, instrument, trace};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod cli;
mod config;
mod cycle;
mod things;

use thingwake_remote as remote;
use thingwake_state as state;
use thingwake_util as util;

use crate::cli::SleepMode;
use crate::config::Settings;
use crate::remote::{ShadowTransport, SntpClient, SystemClock};
use crate::state::WakeStateStore;
use crate::util::dirs::{config_dir, state_dir};
use crate::util::store::Store;

fn initialize_tracing() {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            // Use some log defaults. These can be overriden using
            // RUST_LOG
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("debug".parse().unwrap())
                    .add_directive("hyper=error".parse().unwrap())
                    .add_directive("reqwest=info".parse().unwrap()),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    initialize_tracing();

    let cli = cli::parse();

    // Create the configuration and wake state stores
    let config_store = Store::new(cli.config_dir.clone().unwrap_or_else(config_dir));
    let wake_store = WakeStateStore::new(Store::new(
        cli.state_dir.clone().unwrap_or_else(state_dir),
    ));

    let settings = config::resolve(&cli, &config_store).await?;

    start(settings, wake_store, cli.sleep_mode, cli.max_cycles).await
}

#[instrument(name = "thingwake", skip_all, err)]
async fn start(
    settings: Settings,
    wake_store: WakeStateStore,
    sleep_mode: SleepMode,
    max_cycles: Option<u32>,
) -> Result<(), Box<dyn Error>> {
    trace!(settings = ?settings, "using config:");

    let mut clock = SystemClock::new(settings.ntp_server.clone().map(SntpClient::new));
    let transport = ShadowTransport::new(settings.identity.remote.request.clone());

    let mut cycles: u32 = 0;
    loop {
        let report = cycle::run(&settings, &transport, &mut clock, &wake_store).await?;
        cycles += 1;
        if let Some(result) = &report.result {
            debug!(status = %result.status(), "cycle {cycles} done");
        }

        match sleep_mode {
            SleepMode::Exit => {
                // the host reads this and powers the device down
                println!("{}", report.interval.as_secs());
                return Ok(());
            }
            SleepMode::Emulate => {
                if max_cycles.is_some_and(|max| cycles >= max) {
                    info!(cycles, "reached the cycle limit");
                    return Ok(());
                }
                info!(secs = report.interval.as_secs(), "sleeping until next wake");
                tokio::time::sleep(report.interval).await;
            }
        }
    }
}
