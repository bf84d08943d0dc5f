use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{
    db::HubDb,
    error::Result,
    event::{HubEvent, HubEventBody, Message, OnChainKind, StoreKind},
    keys,
};

#[derive(Debug, Clone, Default)]
struct SetUsage {
    count: u32,
    earliest_ts_hash: Option<Vec<u8>>,
    /// Set when the earliest marker was removed; the next read recomputes it
    /// from the durable message index.
    needs_refresh: bool,
}

/// In-memory usage accounting per `(fid, set)`: live message count and the
/// tsHash of the oldest live message, plus the purchased storage units per
/// account. Written only by the post-commit hook and `sync_from_db`; reads
/// are lock-cheap and O(1) unless an earliest marker needs repair.
pub struct StorageCache {
    db: Arc<HubDb>,
    usage: RwLock<HashMap<(u64, StoreKind), SetUsage>>,
    units: RwLock<HashMap<u64, u32>>,
}

impl StorageCache {
    pub fn new(db: Arc<HubDb>) -> Self {
        Self {
            db,
            usage: RwLock::new(HashMap::new()),
            units: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_message_count(&self, fid: u64, kind: StoreKind) -> u32 {
        self.usage
            .read()
            .get(&(fid, kind))
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    /// The tsHash of the oldest live message in the set. When the cached
    /// marker was invalidated by a removal, it is lazily recomputed here
    /// from the first key under the set's message prefix.
    pub fn get_earliest_ts_hash(&self, fid: u64, kind: StoreKind) -> Result<Option<Vec<u8>>> {
        {
            let usage = self.usage.read();
            match usage.get(&(fid, kind)) {
                Some(entry) if !entry.needs_refresh => return Ok(entry.earliest_ts_hash.clone()),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        let earliest = self.scan_earliest(fid, kind)?;
        let mut usage = self.usage.write();
        let entry = usage.entry((fid, kind)).or_default();
        entry.earliest_ts_hash = earliest.clone();
        entry.needs_refresh = false;
        Ok(earliest)
    }

    pub fn get_storage_units(&self, fid: u64) -> u32 {
        let units = self.units.read().get(&fid).copied().unwrap_or(0);
        if units == 0 {
            debug!(fid, "account holds no storage units");
        }
        units
    }

    /// Apply one committed event. Calls arrive in commit order, after the
    /// owning transaction is durable.
    pub fn process_event(&self, event: &HubEvent) {
        match &event.body {
            HubEventBody::MergeMessage {
                message,
                deleted_messages,
            } => {
                self.add_message(message);
                for deleted in deleted_messages {
                    self.remove_message(deleted);
                }
            }
            HubEventBody::PruneMessage { message } | HubEventBody::RevokeMessage { message } => {
                self.remove_message(message);
            }
            HubEventBody::MergeUsernameProof(body) => {
                if let Some(message) = &body.message {
                    self.add_message(message);
                }
                if let Some(deleted) = &body.deleted_message {
                    self.remove_message(deleted);
                }
            }
            HubEventBody::MergeOnChainEvent(body) => {
                if body.kind == OnChainKind::StorageRent {
                    self.units.write().insert(body.fid, body.units);
                }
            }
        }
    }

    /// Full rebuild from the durable indices. Slow is fine; callers hold the
    /// commit slot (or run before serving) so no commit interleaves.
    pub fn sync_from_db(&self) -> Result<()> {
        let mut usage: HashMap<(u64, StoreKind), SetUsage> = HashMap::new();
        let user_prefix = [keys::RootPrefix::User as u8];
        let upper = keys::increment_prefix(&user_prefix)?;
        self.db.iter_range(&user_prefix, Some(&upper), |key, _| {
            let Some((fid, postfix, ts_hash)) = keys::message_key_parts(key) else {
                warn!(len = key.len(), "skipping malformed message key");
                return Ok(true);
            };
            let Ok(kind) = StoreKind::from_postfix(postfix) else {
                warn!(fid, postfix, "skipping message key with unknown set");
                return Ok(true);
            };
            let entry = usage.entry((fid, kind)).or_default();
            entry.count = entry.count.saturating_add(1);
            // Keys arrive in lexicographic order, so the first tsHash per
            // set is the earliest.
            if entry.earliest_ts_hash.is_none() {
                entry.earliest_ts_hash = Some(ts_hash.to_vec());
            }
            Ok(true)
        })?;

        let mut units: HashMap<u64, u32> = HashMap::new();
        let units_prefix = [keys::RootPrefix::StorageUnits as u8];
        let upper = keys::increment_prefix(&units_prefix)?;
        self.db
            .iter_range(&units_prefix, Some(&upper), |key, value| {
                let Some(fid) = keys::storage_units_fid(key) else {
                    warn!(len = key.len(), "skipping malformed storage-unit key");
                    return Ok(true);
                };
                if value.len() != 4 {
                    warn!(fid, len = value.len(), "skipping malformed storage-unit value");
                    return Ok(true);
                }
                let mut be = [0u8; 4];
                be.copy_from_slice(value);
                units.insert(fid, u32::from_be_bytes(be));
                Ok(true)
            })?;

        *self.usage.write() = usage;
        *self.units.write() = units;
        Ok(())
    }

    fn add_message(&self, message: &Message) {
        let ts_hash = match message.ts_hash() {
            Ok(ts_hash) => ts_hash,
            Err(err) => {
                warn!(fid = message.fid, %err, "ignoring unkeyable message in cache update");
                return;
            }
        };
        let mut usage = self.usage.write();
        let entry = usage.entry((message.fid, message.kind)).or_default();
        entry.count = entry.count.saturating_add(1);
        if entry.needs_refresh {
            // The floor is unknown; the durable index already holds this
            // message, so the pending recompute will see it.
            return;
        }
        match &entry.earliest_ts_hash {
            Some(current) if *current <= ts_hash => {}
            _ => entry.earliest_ts_hash = Some(ts_hash),
        }
    }

    fn remove_message(&self, message: &Message) {
        let ts_hash = match message.ts_hash() {
            Ok(ts_hash) => ts_hash,
            Err(err) => {
                warn!(fid = message.fid, %err, "ignoring unkeyable message in cache update");
                return;
            }
        };
        let mut usage = self.usage.write();
        let entry = usage.entry((message.fid, message.kind)).or_default();
        entry.count = entry.count.saturating_sub(1);
        if entry.earliest_ts_hash.as_deref() == Some(ts_hash.as_slice()) {
            debug!(
                fid = message.fid,
                ts_hash = %hex::encode(&ts_hash),
                "earliest message removed; marker will be recomputed on next read"
            );
            entry.earliest_ts_hash = None;
            entry.needs_refresh = true;
        }
    }

    fn scan_earliest(&self, fid: u64, kind: StoreKind) -> Result<Option<Vec<u8>>> {
        let prefix = keys::make_message_prefix(fid, kind.postfix());
        let upper = keys::increment_prefix(&prefix)?;
        let mut earliest = None;
        self.db.iter_range(&prefix, Some(&upper), |key, _| {
            if let Some((_, _, ts_hash)) = keys::message_key_parts(key) {
                earliest = Some(ts_hash.to_vec());
            }
            Ok(false)
        })?;
        Ok(earliest)
    }
}
