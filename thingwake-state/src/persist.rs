use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::models::FaultCode;
use crate::util::store::{Store, StoreError};

const WAKE_STATE: &str = "wake";

/// An actuation that was started but not yet known to be finished
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PendingActuation {
    pub target: f64,

    /// Version of the shadow document the target came from
    pub version: u64,
}

/// What a cycle needs to know about the previous one.
///
/// Read at the start of every cycle and written before going to sleep.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PersistedState {
    /// Last position observed on the actuator
    pub last_position: Option<f64>,

    pub last_fault: Option<FaultCode>,

    /// Set while the actuator is moving. Finding it on wake means the
    /// previous cycle lost power mid-actuation.
    pub pending: Option<PendingActuation>,

    /// Number of cycles run since the state was created
    pub power_on_count: u64,

    /// The sleep interval chosen by the last cycle
    pub next_wake_secs: Option<u64>,
}

/// Persisted wake state on top of a [`Store`]
#[derive(Clone, Debug)]
pub struct WakeStateStore {
    store: Store,
}

impl WakeStateStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Load the state left by the previous cycle.
    ///
    /// A missing document is a first boot. A document that cannot be decoded
    /// is discarded rather than blocking every future wake.
    #[instrument(skip_all)]
    pub async fn load(&self) -> Result<PersistedState, StoreError> {
        match self.store.read(WAKE_STATE).await {
            Ok(Some(state)) => Ok(state),
            Ok(None) => {
                debug!("no wake state found, starting fresh");
                Ok(PersistedState::default())
            }
            Err(StoreError::Serialization(e)) => {
                warn!("discarding unreadable wake state: {e}");
                Ok(PersistedState::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Durably write the state. Once this returns the device may lose power.
    #[instrument(skip_all)]
    pub async fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        self.store.write(WAKE_STATE, state).await
    }

    /// Record that the actuator is about to move toward `target`
    pub async fn mark_pending(
        &self,
        state: &mut PersistedState,
        target: f64,
        version: u64,
    ) -> Result<(), StoreError> {
        state.pending = Some(PendingActuation { target, version });
        self.save(state).await
    }

    /// Record that the actuation finished, one way or another
    pub async fn clear_pending(&self, state: &mut PersistedState) -> Result<(), StoreError> {
        if state.pending.take().is_some() {
            self.save(state).await?;
        }
        Ok(())
    }
}
