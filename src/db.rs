use std::path::PathBuf;

use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch};

use crate::{
    error::{HubError, Result},
    keys,
};

/// A set of mutations applied atomically: either every put and delete in the
/// transaction lands, or none do. Callers populate their store-specific
/// mutations here and hand the transaction to the commit coordinator, which
/// folds the event-log entry into the same batch.
#[derive(Default)]
pub struct Transaction {
    batch: WriteBatch,
    len: usize,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.batch.put(key, value);
        self.len += 1;
    }

    pub fn delete(&mut self, key: impl AsRef<[u8]>) {
        self.batch.delete(key);
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct HubDb {
    db: DBWithThreadMode<MultiThreaded>,
    read_only: bool,
}

impl HubDb {
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DBWithThreadMode::<MultiThreaded>::open(&options, path)
            .map_err(|err| HubError::Storage(err.to_string()))?;

        Ok(Self {
            db,
            read_only: false,
        })
    }

    pub fn open_read_only(path: PathBuf) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(false);
        let db = DBWithThreadMode::<MultiThreaded>::open_for_read_only(&options, path, false)
            .map_err(|err| HubError::Storage(err.to_string()))?;

        Ok(Self {
            db,
            read_only: true,
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map_err(|err| HubError::Storage(err.to_string()))
    }

    /// Durably apply a transaction as one atomic batch.
    pub fn write(&self, txn: Transaction) -> Result<()> {
        if self.read_only {
            return Err(HubError::Storage(
                "database opened in read-only mode".to_string(),
            ));
        }
        self.db
            .write(txn.batch)
            .map_err(|err| HubError::Storage(err.to_string()))
    }

    /// Visit `(key, value)` pairs in `[lower, upper)` in ascending key
    /// order. The visitor returns `false` to stop early; its errors abort
    /// the scan and surface to the caller.
    pub fn iter_range<F>(&self, lower: &[u8], upper: Option<&[u8]>, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        let iter = self
            .db
            .iterator(IteratorMode::From(lower, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|err| HubError::Storage(err.to_string()))?;
            if let Some(upper) = upper {
                if key.as_ref() >= upper {
                    break;
                }
            }
            if !visit(&key, &value)? {
                break;
            }
        }
        Ok(())
    }

    /// The largest key carrying `prefix`, found by one reverse seek.
    pub fn last_key_with_prefix(&self, prefix: &[u8]) -> Result<Option<Vec<u8>>> {
        let upper = keys::increment_prefix(prefix)?;
        let iter = self
            .db
            .iterator(IteratorMode::From(upper.as_slice(), Direction::Reverse));
        for item in iter {
            let (key, _) = item.map_err(|err| HubError::Storage(err.to_string()))?;
            if key.as_ref() >= upper.as_slice() {
                continue;
            }
            if key.starts_with(prefix) {
                return Ok(Some(key.to_vec()));
            }
            return Ok(None);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, HubDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = HubDb::open(dir.path().join("db")).unwrap();
        (dir, db)
    }

    #[test]
    fn writes_are_atomic_batches() {
        let (_dir, db) = open_temp();
        let mut txn = Transaction::new();
        txn.put([1u8, 1], b"a");
        txn.put([1u8, 2], b"b");
        assert_eq!(txn.len(), 2);
        db.write(txn).unwrap();

        assert_eq!(db.get(&[1, 1]).unwrap().unwrap(), b"a");
        assert_eq!(db.get(&[1, 2]).unwrap().unwrap(), b"b");
        assert!(db.get(&[1, 3]).unwrap().is_none());
    }

    #[test]
    fn range_iteration_respects_bounds() {
        let (_dir, db) = open_temp();
        let mut txn = Transaction::new();
        for byte in 1..=5u8 {
            txn.put([7u8, byte], [byte]);
        }
        txn.put([8u8, 0], b"outside");
        db.write(txn).unwrap();

        let mut seen = Vec::new();
        db.iter_range(&[7, 2], Some(&[7, 5]), |key, _| {
            seen.push(key.to_vec());
            Ok(true)
        })
        .unwrap();
        assert_eq!(seen, vec![vec![7, 2], vec![7, 3], vec![7, 4]]);

        let mut early_stop = 0;
        db.iter_range(&[7], Some(&[8]), |_, _| {
            early_stop += 1;
            Ok(early_stop < 2)
        })
        .unwrap();
        assert_eq!(early_stop, 2);
    }

    #[test]
    fn finds_the_last_prefixed_key() {
        let (_dir, db) = open_temp();
        assert!(db.last_key_with_prefix(&[9]).unwrap().is_none());

        let mut txn = Transaction::new();
        txn.put([9u8, 1], b"a");
        txn.put([9u8, 200], b"b");
        txn.put([10u8, 1], b"other");
        db.write(txn).unwrap();

        assert_eq!(db.last_key_with_prefix(&[9]).unwrap().unwrap(), vec![9, 200]);
        assert!(db.last_key_with_prefix(&[11]).unwrap().is_none());
    }

    #[test]
    fn read_only_handles_reject_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let db = HubDb::open(path.clone()).unwrap();
            let mut txn = Transaction::new();
            txn.put([1u8], b"x");
            db.write(txn).unwrap();
        }

        let db = HubDb::open_read_only(path).unwrap();
        assert_eq!(db.get(&[1]).unwrap().unwrap(), b"x");

        let mut txn = Transaction::new();
        txn.put([2u8], b"y");
        assert!(matches!(db.write(txn), Err(HubError::Storage(_))));
    }
}
