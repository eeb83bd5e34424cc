use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::store::{Store, StoreError};

/// A document kept in the config store, named after its kind
pub trait StoredConfig: Serialize + DeserializeOwned {
    fn kind() -> &'static str;
}

#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("failed to read {kind} config: {source}")]
    Read {
        kind: &'static str,
        source: StoreError,
    },

    #[error("failed to write {kind} config: {source}")]
    Write {
        kind: &'static str,
        source: StoreError,
    },
}

/// Load a config from `store`, `None` if it was never saved
pub async fn load<C: StoredConfig>(store: &Store) -> Result<Option<C>, ConfigStoreError> {
    debug!("loading {} config", C::kind());
    store
        .read(C::kind())
        .await
        .map_err(|source| ConfigStoreError::Read {
            kind: C::kind(),
            source,
        })
}

/// Save a config into `store`, replacing the previous one
pub async fn save<C: StoredConfig>(store: &Store, config: &C) -> Result<(), ConfigStoreError> {
    debug!("saving {} config", C::kind());
    store
        .write(C::kind(), config)
        .await
        .map_err(|source| ConfigStoreError::Write {
            kind: C::kind(),
            source,
        })
}
