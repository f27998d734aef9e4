//! Persistence layer.
//!
//! Backs outbound durability and inbound deduplication with two SQLite
//! tables, `fragmented_meta` and `fragmented_data`. A `rusqlite::Connection`
//! is not `Sync`, so it is wrapped in a `Mutex`; a host that shares one
//! physical database handle across several shim instances may additionally
//! install a lock/unlock callback pair that brackets every public
//! operation here.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use rusqlite::{params, Connection, DatabaseName, OptionalExtension};

use crate::error::{Result, ShimError};

type LockHook = Box<dyn Fn() + Send + Sync>;

pub struct Persistence {
    conn: Mutex<Connection>,
    external_lock: Option<LockHook>,
    external_unlock: Option<LockHook>,
}

/// A rehydrated outbound row, as read back by [`Persistence::load_outbound_pending`].
#[derive(Debug, Clone)]
pub struct OutboundPendingRow {
    pub friend: u32,
    pub msg_type: i32,
    pub id: u64,
    pub timestamp_first: u64,
    pub timestamp_last: u64,
    pub frags_done: u32,
    pub frags_num: u32,
    pub message: Vec<u8>,
    pub confirmed: Vec<u8>,
    pub receipt: u32,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS fragmented_meta (
    outbound INTEGER NOT NULL,
    friend_id INTEGER NOT NULL,
    type INTEGER NOT NULL,
    frags_id INTEGER NOT NULL,
    timestamp_first INTEGER NOT NULL,
    timestamp_last INTEGER NOT NULL,
    frags_done INTEGER NOT NULL,
    frags_num INTEGER NOT NULL,
    PRIMARY KEY(friend_id, frags_id)
);
CREATE TABLE IF NOT EXISTS fragmented_data (
    friend_id INTEGER NOT NULL,
    frags_id INTEGER NOT NULL,
    message BLOB,
    confirmed BLOB,
    receipt INTEGER,
    PRIMARY KEY(friend_id, frags_id)
);
";

impl Persistence {
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            external_lock: None,
            external_unlock: None,
        })
    }

    /// Install a host-supplied lock/unlock pair, bracketing every public
    /// operation below in addition to this layer's own mutex.
    pub fn with_lock_callbacks(
        mut self,
        lock: impl Fn() + Send + Sync + 'static,
        unlock: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        self.external_lock = Some(Box::new(lock));
        self.external_unlock = Some(Box::new(unlock));
        self
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if let Some(lock) = &self.external_lock {
            lock();
        }
        let guard = self.conn.lock().expect("persistence mutex poisoned");
        let result = f(&guard);
        drop(guard);
        if let Some(unlock) = &self.external_unlock {
            unlock();
        }
        result
    }

    fn data_rowid(conn: &Connection, friend: u32, id: u64) -> Result<Option<i64>> {
        conn.query_row(
            "SELECT rowid FROM fragmented_data WHERE friend_id=?1 AND frags_id=?2",
            params![friend, id as i64],
            |row| row.get(0),
        )
        .optional()
        .map_err(ShimError::from)
    }

    /// Returns the reassembled message and its first/last timestamps iff
    /// this call supplied the final missing part. The data is copied out
    /// of the blob store before the persistence lock is released, so the
    /// caller may safely invoke a client callback with it after this call
    /// returns, outside the lock.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_inbound_fragment(
        &self,
        friend: u32,
        msg_type: i32,
        id: u64,
        off: u32,
        sz: u32,
        num_parts: u32,
        bytes: &[u8],
        tm: u64,
    ) -> Result<Option<(u64, u64, Vec<u8>)>> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO fragmented_data (friend_id, frags_id, message)
                 SELECT ?1, ?2, zeroblob(?3)
                 WHERE NOT EXISTS (SELECT 1 FROM fragmented_meta WHERE friend_id=?1 AND frags_id=?2)",
                params![friend, id as i64, sz],
            )?;
            conn.execute(
                "INSERT INTO fragmented_meta
                    (outbound, friend_id, type, frags_id, timestamp_first, timestamp_last, frags_done, frags_num)
                 SELECT 0, ?1, ?2, ?3, ?4, ?4, 0, ?5
                 WHERE NOT EXISTS (SELECT 1 FROM fragmented_meta WHERE friend_id=?1 AND frags_id=?3)",
                params![friend, msg_type, id as i64, tm as i64, num_parts],
            )?;

            let rowid = match Self::data_rowid(conn, friend, id)? {
                Some(r) => r,
                None => {
                    // meta exists but data doesn't: the message already
                    // completed earlier, this fragment is a late duplicate.
                    tracing::debug!(friend, id, "late duplicate fragment for completed message");
                    return Ok(None);
                }
            };

            let mut blob = conn.blob_open(DatabaseName::Main, "fragmented_data", "message", rowid, false)?;
            let mut first_byte = [0u8; 1];
            blob.seek(SeekFrom::Start(off as u64))?;
            blob.read_exact(&mut first_byte)?;
            if first_byte[0] != 0 {
                if !bytes.is_empty() && first_byte[0] != bytes[0] {
                    tracing::warn!(
                        friend, id, off,
                        expected = bytes[0], found = first_byte[0],
                        "mismatching byte in reassembly blob, discarding duplicate"
                    );
                }
                return Ok(None); // duplicate fragment
            }
            blob.seek(SeekFrom::Start(off as u64))?;
            blob.write_all(bytes)?;
            drop(blob);

            conn.execute(
                "UPDATE fragmented_meta SET timestamp_last=max(timestamp_last,?1), frags_done=frags_done+1
                 WHERE friend_id=?2 AND frags_id=?3",
                params![tm as i64, friend, id as i64],
            )?;

            let (frags_done, frags_num, tm_first, tm_last): (u32, u32, i64, i64) = conn.query_row(
                "SELECT frags_done, frags_num, timestamp_first, timestamp_last
                 FROM fragmented_meta WHERE friend_id=?1 AND frags_id=?2",
                params![friend, id as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

            if frags_done == frags_num {
                let message: Vec<u8> = conn.query_row(
                    "SELECT message FROM fragmented_data WHERE friend_id=?1 AND frags_id=?2",
                    params![friend, id as i64],
                    |row| row.get(0),
                )?;
                conn.execute(
                    "DELETE FROM fragmented_data WHERE friend_id=?1 AND frags_id=?2",
                    params![friend, id as i64],
                )?;
                Ok(Some((tm_first as u64, tm_last as u64, message)))
            } else {
                Ok(None)
            }
        })
    }

    /// Records a freshly split outbound message for durability.
    pub fn insert_outbound_message(
        &self,
        friend: u32,
        msg_type: i32,
        id: u64,
        tm: u64,
        num_parts: u32,
        bytes: &[u8],
        client_receipt: u32,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO fragmented_meta
                    (outbound, friend_id, type, frags_id, timestamp_first, timestamp_last, frags_done, frags_num)
                 VALUES (1, ?1, ?2, ?3, ?4, ?4, 0, ?5)",
                params![friend, msg_type, id as i64, tm as i64, num_parts],
            )?;
            conn.execute(
                "INSERT INTO fragmented_data (friend_id, frags_id, message, confirmed, receipt)
                 VALUES (?1, ?2, ?3, zeroblob(?4), ?5)",
                params![friend, id as i64, bytes, num_parts, client_receipt],
            )?;
            Ok(())
        })
    }

    /// Marks one part confirmed in the persisted bitmap.
    pub fn outbound_part_confirmed(&self, friend: u32, id: u64, part_no: u32, tm: u64) -> Result<()> {
        self.with_conn(|conn| {
            let rowid = Self::data_rowid(conn, friend, id)?.ok_or(ShimError::NotInitialized)?;
            let mut blob = conn.blob_open(DatabaseName::Main, "fragmented_data", "confirmed", rowid, false)?;
            blob.seek(SeekFrom::Start((part_no - 1) as u64))?;
            blob.write_all(&[1u8])?;
            drop(blob);
            conn.execute(
                "UPDATE fragmented_meta SET timestamp_last=max(timestamp_last,?1), frags_done=frags_done+1
                 WHERE friend_id=?2 AND frags_id=?3",
                params![tm as i64, friend, id as i64],
            )?;
            Ok(())
        })
    }

    /// Reads back every outbound row still pending, for rehydration at
    /// startup.
    pub fn load_outbound_pending(&self) -> Result<Vec<OutboundPendingRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT friend_id, type, frags_id, timestamp_first, timestamp_last,
                        frags_done, frags_num, message, confirmed, receipt
                 FROM fragmented_meta JOIN fragmented_data USING (friend_id, frags_id)
                 WHERE outbound=1",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(OutboundPendingRow {
                        friend: row.get::<_, i64>(0)? as u32,
                        msg_type: row.get(1)?,
                        id: row.get::<_, i64>(2)? as u64,
                        timestamp_first: row.get::<_, i64>(3)? as u64,
                        timestamp_last: row.get::<_, i64>(4)? as u64,
                        frags_done: row.get(5)?,
                        frags_num: row.get(6)?,
                        message: row.get(7)?,
                        confirmed: row.get(8)?,
                        receipt: row.get(9)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Drops a fully-confirmed outbound row from the backing store.
    pub fn clear_outbound_pending(&self, friend: u32, id: u64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM fragmented_data WHERE friend_id=?1 AND frags_id=?2",
                params![friend, id as i64],
            )?;
            Ok(())
        })
    }

    /// Periodic-worker hook, currently a no-op.
    pub fn periodic(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_fragment_completes_message() {
        let db = Persistence::open_in_memory().unwrap();
        assert!(db.insert_inbound_fragment(1, 0, 42, 0, 3, 2, b"ab", 100).unwrap().is_none());
        let (tm1, tm2, msg) = db
            .insert_inbound_fragment(1, 0, 42, 2, 3, 2, b"c", 101)
            .unwrap()
            .expect("message should complete");
        assert_eq!(tm1, 100);
        assert_eq!(tm2, 101);
        assert_eq!(msg, b"abc");
    }

    #[test]
    fn duplicate_fragment_is_idempotent() {
        let db = Persistence::open_in_memory().unwrap();
        // A 2-part message; duplicating the first fragment must not
        // double-count it towards completion.
        db.insert_inbound_fragment(1, 0, 7, 0, 4, 2, b"xy", 10).unwrap();
        assert!(db.insert_inbound_fragment(1, 0, 7, 0, 4, 2, b"xy", 11).unwrap().is_none());
        let (done, num): (u32, u32) = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT frags_done, frags_num FROM fragmented_meta WHERE friend_id=1 AND frags_id=7",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(ShimError::from)
            })
            .unwrap();
        assert_eq!(done, 1);
        assert_eq!(num, 2);
    }

    #[test]
    fn late_duplicate_after_completion_is_discarded() {
        let db = Persistence::open_in_memory().unwrap();
        assert!(db.insert_inbound_fragment(1, 0, 9, 0, 1, 1, b"z", 10).unwrap().is_some());
        // The message is already complete; a further fragment for the same id is dropped.
        assert!(db.insert_inbound_fragment(1, 0, 9, 0, 1, 1, b"z", 11).unwrap().is_none());
    }

    #[test]
    fn outbound_round_trip_and_rehydration() {
        let db = Persistence::open_in_memory().unwrap();
        db.insert_outbound_message(2, 0, 55, 1000, 2, b"hello!", 0x70000001)
            .unwrap();
        db.outbound_part_confirmed(2, 55, 1, 1001).unwrap();

        let pending = db.load_outbound_pending().unwrap();
        assert_eq!(pending.len(), 1);
        let row = &pending[0];
        assert_eq!(row.friend, 2);
        assert_eq!(row.id, 55);
        assert_eq!(row.message, b"hello!");
        assert_eq!(row.confirmed, vec![1, 0]);
        assert_eq!(row.receipt, 0x70000001);

        db.clear_outbound_pending(2, 55).unwrap();
        assert!(db.load_outbound_pending().unwrap().is_empty());
    }
}
