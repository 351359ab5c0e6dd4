//! Saving and restoring a [`Store`] as a CBOR file.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};

use camino::Utf8Path;

use crate::error::PersistError;
use crate::store::{Snapshot, Store};

/// Writes the forward data of `store` to `path`. Parent directories are
/// created when missing. Reverse indexes are not written; they are rebuilt by
/// [`load`].
pub fn save(store: &Store, path: impl AsRef<Utf8Path>) -> Result<(), PersistError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let snapshot = store.snapshot();
    let mut writer = BufWriter::new(File::create(path)?);
    ciborium::into_writer(&snapshot, &mut writer)?;
    writer.flush()?;

    tracing::debug!(path = %path, tasks = snapshot.tasks.len(), "saved store");
    Ok(())
}

/// Reads a store written by [`save`]. A missing file yields an empty store.
pub fn load(path: impl AsRef<Utf8Path>) -> Result<Store, PersistError> {
    let path = path.as_ref();
    if !path.exists() {
        tracing::debug!(path = %path, "no saved store, starting empty");
        return Ok(Store::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let snapshot: Snapshot = ciborium::from_reader(reader)?;

    tracing::debug!(path = %path, tasks = snapshot.tasks.len(), "loaded store");
    Ok(Store::from_snapshot(snapshot))
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::core::{Hash32, Output, Value};
    use crate::store::TaskData;
    use crate::task::TaskKey;

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("cache/store.cbor")).unwrap();

        let store = Store::new();
        let key = TaskKey::from_parts("answer", Hash32::hash("input"));
        store.set_data(
            &key,
            TaskData::new(Value::Null, Output::new(Value::from(42u64))),
        );

        save(&store, &path).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.snapshot(), store.snapshot());
        assert_eq!(loaded.output(&key), Some(Output::new(Value::from(42u64))));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("none.cbor")).unwrap();

        assert!(load(&path).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("bad.cbor")).unwrap();
        std::fs::write(&path, [0xff, 0x00, 0x13]).unwrap();

        assert!(matches!(load(&path), Err(PersistError::Decode(_))));
    }
}
