//! Block-hash → block-number index. RocksDB supplies the transactional
//! guarantees here; unlike the append logs, no CRC pairing is needed and
//! recovery is delegated to the database's own WAL.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use rocksdb::{DBWithThreadMode, IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions};

type Db = DBWithThreadMode<MultiThreaded>;

#[derive(Clone, Debug)]
pub struct IndexOptions {
    pub create_if_missing: bool,
    pub sync_writes: bool,
    pub paranoid_checks: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_writes: true,
            paranoid_checks: true,
        }
    }
}

#[derive(Clone)]
pub struct BlockNumberIndex {
    db: Arc<Db>,
    sync_writes: bool,
}

impl BlockNumberIndex {
    pub fn open(path: &Path, opts: &IndexOptions) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(opts.create_if_missing);
        db_opts.set_paranoid_checks(opts.paranoid_checks);
        let db = Db::open(&db_opts, path)?;
        Ok(Self {
            db: Arc::new(db),
            sync_writes: opts.sync_writes,
        })
    }

    fn write_opts(&self) -> WriteOptions {
        let mut w = WriteOptions::default();
        w.set_sync(self.sync_writes);
        w
    }

    pub fn put(&self, hash: &[u8], number: i64) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put(hash, number.to_be_bytes());
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    pub fn get(&self, hash: &[u8]) -> Result<Option<i64>> {
        match self.db.get(hash)? {
            Some(v) if v.len() == 8 => {
                let mut num = [0u8; 8];
                num.copy_from_slice(&v);
                Ok(Some(i64::from_be_bytes(num)))
            }
            Some(v) => bail!(
                "index value for {} has {} bytes, expected 8",
                hex::encode(hash),
                v.len()
            ),
            None => Ok(None),
        }
    }

    pub fn contains(&self, hash: &[u8]) -> Result<bool> {
        Ok(self.db.get(hash)?.is_some())
    }

    /// Delete every entry (the engine's `clear`).
    pub fn clear(&self) -> Result<()> {
        let mut batch = WriteBatch::default();
        for kv in self.db.iterator(IteratorMode::Start) {
            let (key, _) = kv?;
            batch.delete(key);
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
