use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tracing::trace;

use super::fs::safe_write_all;

/// JSON documents kept as files in one directory.
///
/// Writes are atomic and durable once they return. There is no locking, the
/// wake cycle is the only writer.
#[derive(Clone, Debug)]
pub struct Store {
    dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("invalid document name '{0}'")]
    InvalidName(String),
}

impl Store {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    // Documents are flat files, names cannot point outside the directory
    fn path_of(&self, name: &str) -> Result<PathBuf, StoreError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
        if !valid {
            return Err(StoreError::InvalidName(name.to_owned()));
        }
        Ok(self.dir.join(name).with_extension("json"))
    }

    /// Create or replace the document `name`
    pub async fn write<V: Serialize>(&self, name: &str, value: &V) -> Result<(), StoreError> {
        let path = self.path_of(name)?;
        let buf = serde_json::to_vec_pretty(value)?;

        fs::create_dir_all(&self.dir).await?;
        trace!("writing {}", path.display());
        tokio::task::spawn_blocking(move || safe_write_all(path, buf))
            .await
            .map_err(io::Error::other)??;
        Ok(())
    }

    /// Read the document `name`, `None` if it was never written
    pub async fn read<V: DeserializeOwned>(&self, name: &str) -> Result<Option<V>, StoreError> {
        let path = self.path_of(name)?;
        trace!("reading {}", path.display());

        let contents = match fs::read(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&contents)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        value: u32,
    }

    #[tokio::test]
    async fn it_reads_back_written_documents() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        store.write("doc", &Doc { value: 7 }).await.unwrap();
        let doc: Option<Doc> = store.read("doc").await.unwrap();
        assert_eq!(doc, Some(Doc { value: 7 }));
        assert!(dir.path().join("doc.json").exists());
    }

    #[tokio::test]
    async fn it_creates_the_directory_on_first_write() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("state").join("thingwake"));

        let doc: Option<Doc> = store.read("doc").await.unwrap();
        assert!(doc.is_none());

        store.write("doc", &Doc { value: 1 }).await.unwrap();
        assert!(dir.path().join("state/thingwake/doc.json").exists());
    }

    #[tokio::test]
    async fn it_rejects_names_leaving_the_directory() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        let res = store.write("../escape", &Doc { value: 1 }).await;
        assert!(matches!(res, Err(StoreError::InvalidName(_))));
    }

    #[tokio::test]
    async fn it_fails_on_undecodable_documents() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("doc.json"), b"{\"value\": \"seven\"}").unwrap();
        let store = Store::new(dir.path());

        let res = store.read::<Doc>("doc").await;
        assert!(matches!(res, Err(StoreError::Serialization(_))));
    }
}
