use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::{
    error::{HubError, Result},
    time,
};

const TIMESTAMP_BITS: u8 = 41;
const SEQUENCE_BITS: u8 = 12;

pub const MAX_TIMESTAMP: u64 = (1 << TIMESTAMP_BITS) - 1;
pub const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// A 53-bit event id laid out as `[timestamp:41 | sequence:12]`, where the
/// timestamp counts milliseconds since the Farcaster epoch.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

impl EventId {
    pub fn from_parts(timestamp: u64, sequence: u64) -> Result<Self> {
        if timestamp > MAX_TIMESTAMP {
            return Err(HubError::InvalidParam(format!(
                "event timestamp {timestamp} does not fit in {TIMESTAMP_BITS} bits"
            )));
        }
        if sequence > MAX_SEQUENCE {
            return Err(HubError::InvalidParam(format!(
                "event sequence {sequence} does not fit in {SEQUENCE_BITS} bits"
            )));
        }
        Ok(Self((timestamp << SEQUENCE_BITS) | sequence))
    }

    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn timestamp(self) -> u64 {
        self.0 >> SEQUENCE_BITS
    }

    pub fn sequence(self) -> u64 {
        self.0 & MAX_SEQUENCE
    }

    /// The smallest id strictly greater than this one. Used as a pagination
    /// cursor; the value may exceed 53 bits only if called on the maximum id,
    /// which the generator can never issue without failing first.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventId").field(&self.0).finish()
    }
}

impl FromStr for EventId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<u64>().map(EventId)
    }
}

impl Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value
            .parse::<EventId>()
            .map_err(|err| serde::de::Error::custom(err.to_string()))
    }
}

/// Issues strictly-increasing event ids. Never sleeps: a sequence exhausted
/// within one millisecond or a timestamp past 41 bits is an error, and a
/// wall clock that moves backwards is absorbed by pinning the timestamp to
/// the highest value observed so far.
#[derive(Debug, Default)]
pub struct EventIdGenerator {
    last_timestamp: u64,
    last_sequence: u64,
    clock_regressions: u64,
}

impl EventIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reseed from the highest id already present in the event log, so a
    /// restarted process keeps issuing ids above everything durable.
    pub fn from_last_id(id: EventId) -> Self {
        Self {
            last_timestamp: id.timestamp(),
            last_sequence: id.sequence(),
            clock_regressions: 0,
        }
    }

    pub fn generate(&mut self, now_ms: u64) -> Result<EventId> {
        let timestamp = time::millis_since_epoch(now_ms)?;
        if timestamp < self.last_timestamp {
            self.clock_regressions += 1;
            debug!(
                observed = timestamp,
                pinned = self.last_timestamp,
                "wall clock moved backwards; pinning event timestamp"
            );
        }

        if timestamp <= self.last_timestamp {
            self.last_sequence += 1;
        } else {
            self.last_timestamp = timestamp;
            self.last_sequence = 0;
        }

        if self.last_sequence > MAX_SEQUENCE {
            return Err(HubError::InvalidParam(format!(
                "event sequence exhausted at timestamp {}",
                self.last_timestamp
            )));
        }
        EventId::from_parts(self.last_timestamp, self.last_sequence)
    }

    /// How many times the wall clock was observed running backwards.
    pub fn clock_regressions(&self) -> u64 {
        self.clock_regressions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::FARCASTER_EPOCH_MS;

    #[test]
    fn id_layout_composes_timestamp_and_sequence() {
        let mut generator = EventIdGenerator::new();
        let id = generator.generate(FARCASTER_EPOCH_MS + 1).unwrap();
        assert_eq!(id.as_u64(), 1 << 12);
        assert_eq!(id.timestamp(), 1);
        assert_eq!(id.sequence(), 0);

        let id = generator.generate(FARCASTER_EPOCH_MS + 1).unwrap();
        assert_eq!(id.as_u64(), (1 << 12) + 1);
        assert_eq!(id.sequence(), 1);
    }

    #[test]
    fn sequence_exhausts_after_4096_ids_in_one_millisecond() {
        let mut generator = EventIdGenerator::new();
        let now = FARCASTER_EPOCH_MS + 7;
        for _ in 0..4096 {
            generator.generate(now).unwrap();
        }
        let err = generator.generate(now).unwrap_err();
        assert!(matches!(err, HubError::InvalidParam(_)));

        // The next millisecond recovers.
        let id = generator.generate(now + 1).unwrap();
        assert_eq!(id.timestamp(), 8);
        assert_eq!(id.sequence(), 0);
    }

    #[test]
    fn ids_stay_monotonic_when_the_clock_regresses() {
        let mut generator = EventIdGenerator::new();
        let first = generator.generate(FARCASTER_EPOCH_MS + 100).unwrap();
        let second = generator.generate(FARCASTER_EPOCH_MS + 40).unwrap();
        assert!(second > first);
        assert_eq!(second.timestamp(), 100);
        assert_eq!(generator.clock_regressions(), 1);
    }

    #[test]
    fn timestamp_overflow_is_rejected() {
        assert!(EventId::from_parts(MAX_TIMESTAMP, 0).is_ok());
        assert!(EventId::from_parts(MAX_TIMESTAMP + 1, 0).is_err());
        assert!(EventId::from_parts(0, MAX_SEQUENCE + 1).is_err());
    }

    #[test]
    fn reseeding_continues_above_the_last_id() {
        let mut generator = EventIdGenerator::new();
        let now = FARCASTER_EPOCH_MS + 1_000;
        let last = generator.generate(now).unwrap();

        let mut reseeded = EventIdGenerator::from_last_id(last);
        let next = reseeded.generate(now).unwrap();
        assert!(next > last);
        assert_eq!(next.timestamp(), last.timestamp());
        assert_eq!(next.sequence(), last.sequence() + 1);
    }

    #[test]
    fn parses_and_displays_as_decimal() {
        let id = EventId::from_parts(3, 5).unwrap();
        let round_tripped: EventId = id.to_string().parse().unwrap();
        assert_eq!(round_tripped, id);
    }
}
