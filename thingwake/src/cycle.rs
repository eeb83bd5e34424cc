use std::time::Duration;

use thiserror::Error;
use tracing::{Span, debug, error, field, info, instrument, warn};

use crate::config::Settings;
use crate::remote::{ShadowTransport, ThingIdentity, TimeSource, TimeSyncError, TransportError};
use crate::state::models::{
    Acknowledgement, FaultCode, Outcome, ReconciliationResult, ReportDocument, ShadowDocument,
};
use crate::state::{
    CycleStatus, PersistedState, ReconciliationEngine, SleepScheduler, Target, ThingState,
    WakeStateStore,
};
use crate::things::Thing;
use crate::util::store::StoreError;

/// Desired key through which the cloud asks for a sleep interval in seconds
const SLEEP_KEY: &str = "sleep";

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to sync clock: {0}")]
    TimeSync(#[from] TimeSyncError),

    #[error("failed to access wake state: {0}")]
    Store(#[from] StoreError),
}

/// How a wake cycle ended
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub status: CycleStatus,

    /// The engine result, if the cycle got that far
    pub result: Option<ReconciliationResult>,

    /// Time to sleep until the next wake
    pub interval: Duration,
}

/// What a cycle learned and did before reporting
struct Reconciled {
    document: ShadowDocument,
    state: ThingState,
    result: ReconciliationResult,

    /// Sleep seconds requested through the desired state
    requested: Option<u64>,
}

/// Run one wake cycle.
///
/// Network and clock failures before the engine runs abort the
/// reconciliation but not the cycle. A failed report keeps the engine
/// result for scheduling. The next wake is always scheduled and persisted,
/// only a failure to access the wake state is returned as an error.
#[instrument(
    name = "cycle",
    skip_all,
    fields(thing = %settings.identity.thing_name, wake = field::Empty),
    err
)]
pub async fn run<C: TimeSource>(
    settings: &Settings,
    transport: &ShadowTransport,
    clock: &mut C,
    store: &WakeStateStore,
) -> Result<CycleReport, CycleError> {
    let mut persisted = store.load().await?;
    persisted.power_on_count += 1;
    if let Ok(now) = clock.now() {
        Span::current().record("wake", field::display(now));
    }

    let mut thing = Thing::new(
        settings.kind,
        settings.identity.thing_name.clone(),
        &settings.hardware,
        settings.range,
        &persisted,
    );
    let battery = thing.battery();
    debug!(kind = ?thing.kind(), battery = ?battery, "woke {}", thing.id());

    let (status, result, requested) =
        match reconcile(settings, transport, clock, store, &mut thing, &mut persisted).await {
            Ok(reconciled) => {
                let reported =
                    report(settings, transport, clock, &thing, &persisted, &reconciled).await;
                if let Err(e) = reported {
                    error!("failed to report cycle: {e}");
                }
                let Reconciled { result, requested, .. } = reconciled;
                (
                    CycleStatus::Reconciled(result.outcome),
                    Some(result),
                    requested.map(Duration::from_secs),
                )
            }
            Err(e) => {
                error!("cycle aborted: {e}");
                persisted.last_fault = Some(FaultCode::Aborted);
                (CycleStatus::Aborted, None, None)
            }
        };

    let scheduler = SleepScheduler::new(settings.sleep.clone()).with_requested(requested);
    let interval = scheduler.next_interval(battery.as_ref(), &status);
    scheduler.commit(store, &mut persisted, interval).await?;

    Ok(CycleReport {
        status,
        result,
        interval,
    })
}

/// Fetch the shadow and drive the thing toward it
async fn reconcile<C: TimeSource>(
    settings: &Settings,
    transport: &ShadowTransport,
    clock: &mut C,
    store: &WakeStateStore,
    thing: &mut Thing,
    persisted: &mut PersistedState,
) -> Result<Reconciled, CycleError> {
    let document = fetch(transport, &settings.identity, clock).await?;
    let state = ThingState::new(&document, settings.position_key.as_str());
    let requested = state.requested_sleep_secs();

    let target = match persisted.pending.take() {
        // the pending target is not retried this wake, the fault is reported
        // first and the desired position is picked up again on the next one
        Some(pending) => {
            warn!(
                target = pending.target,
                version = pending.version,
                "previous actuation was interrupted"
            );
            Target::Reject(FaultCode::Interrupted)
        }
        None => state.target(settings.range),
    };
    debug!(changed = ?state.changed(), ?target, "shadow delta");

    let engine = ReconciliationEngine::new(settings.engine.clone());
    let result = match thing.actuator() {
        Some(actuator) => {
            if let Target::MoveTo(position) = target {
                store
                    .mark_pending(persisted, position, document.version())
                    .await?;
            }
            let result = engine.run(actuator, target).await;
            // the pending marker is gone from memory either way and the
            // scheduler commit writes it out
            if let Err(e) = store.clear_pending(persisted).await {
                warn!("failed to clear pending actuation: {e}");
            }
            result
        }
        None => ReconciliationResult {
            outcome: Outcome::Converged,
            final_position: None,
            elapsed: Duration::ZERO,
            fault: None,
            actuated: false,
        },
    };

    persisted.last_position = result.final_position.or(persisted.last_position);
    persisted.last_fault = result.fault.clone();

    Ok(Reconciled {
        document,
        state,
        result,
        requested,
    })
}

/// Report the observed state back to the shadow, if anything changed
async fn report<C: TimeSource>(
    settings: &Settings,
    transport: &ShadowTransport,
    clock: &mut C,
    thing: &Thing,
    persisted: &PersistedState,
    reconciled: &Reconciled,
) -> Result<(), CycleError> {
    let result = &reconciled.result;

    let mut telemetry = thing.telemetry(persisted);
    if let Some(secs) = reconciled.requested {
        telemetry.insert(SLEEP_KEY.to_owned(), secs.into());
    }

    let reported = reconciled.state.merge(result, telemetry);
    if reported.is_empty() {
        debug!("shadow is up to date, nothing to report");
        return Ok(());
    }

    let report = ReportDocument::new(reported, &reconciled.document);
    let ack = send_report(transport, &settings.identity, clock, &report).await?;
    info!(version = ?ack.version, status = %result.status(), "cycle reported");
    Ok(())
}

async fn fetch<C: TimeSource>(
    transport: &ShadowTransport,
    identity: &ThingIdentity,
    clock: &mut C,
) -> Result<ShadowDocument, CycleError> {
    match transport.fetch(identity, &*clock).await {
        Err(TransportError::ClockUnsynced(_)) => {
            sync_clock(clock).await?;
            Ok(transport.fetch(identity, &*clock).await?)
        }
        res => Ok(res?),
    }
}

async fn send_report<C: TimeSource>(
    transport: &ShadowTransport,
    identity: &ThingIdentity,
    clock: &mut C,
    report: &ReportDocument,
) -> Result<Acknowledgement, CycleError> {
    match transport.report(identity, &*clock, report).await {
        Err(TransportError::ClockUnsynced(_)) => {
            sync_clock(clock).await?;
            Ok(transport.report(identity, &*clock, report).await?)
        }
        res => Ok(res?),
    }
}

async fn sync_clock<C: TimeSource>(clock: &mut C) -> Result<(), CycleError> {
    warn!("clock cannot be trusted, syncing before signing");
    clock.sync().await?;
    Ok(())
}
