use crate::{
    error::{HubError, Result},
    event_id::EventId,
};

/// Top-level partitions of the key space. Event keys are owned by this
/// crate; message and storage-unit keys are written by the per-store
/// collaborators inside the transactions they hand to `commit`, and are
/// read here to maintain the usage cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RootPrefix {
    /// `[prefix | fid_be8 | set_postfix | ts_hash]` → message bytes.
    User = 1,
    /// `[prefix | id_be8]` → encoded hub event.
    HubEvents = 2,
    /// `[prefix | fid_be8]` → purchased storage units as `u32_be`.
    StorageUnits = 3,
}

pub const EVENT_KEY_LEN: usize = 9;
pub const FID_BYTES: usize = 8;
pub const TS_BYTES: usize = 4;

pub fn events_prefix() -> Vec<u8> {
    vec![RootPrefix::HubEvents as u8]
}

/// `id = 0` is reserved: it encodes as the bare prefix, the lower bound of
/// full-log scans, and never names a stored event.
pub fn make_event_key(id: EventId) -> Vec<u8> {
    if id.as_u64() == 0 {
        return events_prefix();
    }
    let mut key = Vec::with_capacity(EVENT_KEY_LEN);
    key.push(RootPrefix::HubEvents as u8);
    key.extend_from_slice(&id.as_u64().to_be_bytes());
    key
}

pub fn event_id_from_key(key: &[u8]) -> Result<EventId> {
    if key.len() != EVENT_KEY_LEN || key[0] != RootPrefix::HubEvents as u8 {
        return Err(HubError::InvalidParam(format!(
            "malformed event key of {} bytes",
            key.len()
        )));
    }
    let mut be = [0u8; 8];
    be.copy_from_slice(&key[1..]);
    Ok(EventId::from_u64(u64::from_be_bytes(be)))
}

pub fn make_message_prefix(fid: u64, set_postfix: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + FID_BYTES + 1);
    key.push(RootPrefix::User as u8);
    key.extend_from_slice(&fid.to_be_bytes());
    key.push(set_postfix);
    key
}

pub fn make_message_key(fid: u64, set_postfix: u8, ts_hash: &[u8]) -> Vec<u8> {
    let mut key = make_message_prefix(fid, set_postfix);
    key.extend_from_slice(ts_hash);
    key
}

/// Split a message-index key into `(fid, set_postfix, ts_hash)`. Returns
/// `None` for keys outside the message space or too short to carry a tsHash.
pub fn message_key_parts(key: &[u8]) -> Option<(u64, u8, &[u8])> {
    let min_len = 1 + FID_BYTES + 1 + TS_BYTES;
    if key.len() <= min_len || key[0] != RootPrefix::User as u8 {
        return None;
    }
    let mut be = [0u8; 8];
    be.copy_from_slice(&key[1..1 + FID_BYTES]);
    let fid = u64::from_be_bytes(be);
    let set_postfix = key[1 + FID_BYTES];
    Some((fid, set_postfix, &key[1 + FID_BYTES + 1..]))
}

pub fn make_storage_units_key(fid: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + FID_BYTES);
    key.push(RootPrefix::StorageUnits as u8);
    key.extend_from_slice(&fid.to_be_bytes());
    key
}

pub fn storage_units_fid(key: &[u8]) -> Option<u64> {
    if key.len() != 1 + FID_BYTES || key[0] != RootPrefix::StorageUnits as u8 {
        return None;
    }
    let mut be = [0u8; 8];
    be.copy_from_slice(&key[1..]);
    Some(u64::from_be_bytes(be))
}

/// `[timestamp_be4 | hash]`: lexicographic order over tsHashes equals
/// `(timestamp, hash)` tuple order.
pub fn make_ts_hash(timestamp: u32, hash: &[u8]) -> Result<Vec<u8>> {
    if hash.is_empty() {
        return Err(HubError::InvalidParam("message hash is empty".to_string()));
    }
    let mut ts_hash = Vec::with_capacity(TS_BYTES + hash.len());
    ts_hash.extend_from_slice(&timestamp.to_be_bytes());
    ts_hash.extend_from_slice(hash);
    Ok(ts_hash)
}

pub fn split_ts_hash(ts_hash: &[u8]) -> Result<(u32, &[u8])> {
    if ts_hash.len() <= TS_BYTES {
        return Err(HubError::InvalidParam(format!(
            "ts_hash of {} bytes is too short",
            ts_hash.len()
        )));
    }
    let mut be = [0u8; TS_BYTES];
    be.copy_from_slice(&ts_hash[..TS_BYTES]);
    Ok((u32::from_be_bytes(be), &ts_hash[TS_BYTES..]))
}

/// Byte-wise increment of a prefix, used as the exclusive upper bound of a
/// prefix scan. A trailing `0xFF` carries into the previous byte and the
/// tail is truncated; an all-`0xFF` prefix has no upper bound and is an
/// error rather than an invitation to scan the whole key space.
pub fn increment_prefix(prefix: &[u8]) -> Result<Vec<u8>> {
    let mut upper = prefix.to_vec();
    for i in (0..upper.len()).rev() {
        if upper[i] != 0xFF {
            upper[i] += 1;
            upper.truncate(i + 1);
            return Ok(upper);
        }
    }
    Err(HubError::InvalidParam(
        "prefix has no byte-wise increment".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_keys_round_trip() {
        let id = EventId::from_parts(123_456, 7).unwrap();
        let key = make_event_key(id);
        assert_eq!(key.len(), EVENT_KEY_LEN);
        assert_eq!(event_id_from_key(&key).unwrap(), id);
    }

    #[test]
    fn event_id_zero_encodes_the_bare_prefix() {
        assert_eq!(make_event_key(EventId::from_u64(0)), events_prefix());
        assert!(event_id_from_key(&events_prefix()).is_err());
    }

    #[test]
    fn event_key_order_matches_id_order() {
        let smaller = make_event_key(EventId::from_u64(0x0FFF));
        let larger = make_event_key(EventId::from_u64(0x1000));
        assert!(smaller < larger);
    }

    #[test]
    fn message_keys_round_trip() {
        let ts_hash = make_ts_hash(99, &[0xAB; 20]).unwrap();
        let key = make_message_key(42, 3, &ts_hash);
        let (fid, postfix, parsed) = message_key_parts(&key).unwrap();
        assert_eq!(fid, 42);
        assert_eq!(postfix, 3);
        assert_eq!(parsed, ts_hash.as_slice());

        assert!(message_key_parts(&make_message_prefix(42, 3)).is_none());
        assert!(message_key_parts(&make_storage_units_key(42)).is_none());
    }

    #[test]
    fn ts_hash_orders_by_timestamp_then_hash() {
        let early = make_ts_hash(10, &[0xFF; 20]).unwrap();
        let late = make_ts_hash(11, &[0x00; 20]).unwrap();
        assert!(early < late);

        let low_hash = make_ts_hash(10, &[0x01; 20]).unwrap();
        let high_hash = make_ts_hash(10, &[0x02; 20]).unwrap();
        assert!(low_hash < high_hash);

        assert!(make_ts_hash(10, &[]).is_err());

        let (timestamp, hash) = split_ts_hash(&early).unwrap();
        assert_eq!(timestamp, 10);
        assert_eq!(hash, &[0xFF; 20]);
    }

    #[test]
    fn prefix_increment_promotes_carries() {
        assert_eq!(increment_prefix(&[0x02]).unwrap(), vec![0x03]);
        assert_eq!(increment_prefix(&[0x01, 0xFF]).unwrap(), vec![0x02]);
        assert_eq!(
            increment_prefix(&[0x01, 0xFF, 0xFF]).unwrap(),
            vec![0x02]
        );
        assert!(increment_prefix(&[0xFF, 0xFF]).is_err());
    }
}
