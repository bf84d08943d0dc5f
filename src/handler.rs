use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::{
    cache::StorageCache,
    config::HubConfig,
    db::{HubDb, Transaction},
    error::{HubError, Result},
    event::{decode_event, encode_event, EventKind, HubEvent, HubEventBody, Message, StoreKind},
    event_id::{EventId, EventIdGenerator},
    keys, time,
};

/// Wall-clock budget for one prune sweep; hitting it ends the sweep early
/// and the next invocation resumes from the front of the log.
const PRUNE_BUDGET: Duration = Duration::from_secs(600);
const PRUNE_DELETE_BATCH: usize = 1_000;

pub type EventListener = dyn Fn(&HubEvent) -> Result<()> + Send + Sync;

#[derive(Debug)]
pub struct EventsPage {
    pub events: Vec<HubEvent>,
    /// Pass back as `from_id` to fetch the next page. One past the last
    /// yielded id, or the requested `from_id` when the page came up empty.
    pub next_page_event_id: EventId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usage {
    pub used_messages: u32,
    pub earliest_timestamp: Option<u32>,
    pub earliest_hash: Option<Vec<u8>>,
}

/// The single logical permit serializing all write-path transactions. The
/// permit doubles as ownership of the id generator: holding the slot is the
/// only way to generate an id.
struct CommitSlot {
    generator: Mutex<EventIdGenerator>,
    pending: AtomicUsize,
    max_pending: usize,
    timeout: Duration,
}

impl CommitSlot {
    fn new(generator: EventIdGenerator, max_pending: usize, timeout: Duration) -> Self {
        Self {
            generator: Mutex::new(generator),
            pending: AtomicUsize::new(0),
            max_pending,
            timeout,
        }
    }

    fn acquire(&self) -> Result<MutexGuard<'_, EventIdGenerator>> {
        let queued = self.pending.fetch_add(1, Ordering::SeqCst);
        if queued >= self.max_pending {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(HubError::TooBusy(format!(
                "{queued} commits already queued"
            )));
        }
        let guard = self.generator.try_lock_for(self.timeout);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        guard.ok_or_else(|| {
            HubError::TooBusy(format!(
                "commit slot not acquired within {}ms",
                self.timeout.as_millis()
            ))
        })
    }
}

/// Serializes every store mutation into the durable event log, keeps the
/// usage cache in step, and fans committed events out to subscribers.
pub struct StoreEventHandler {
    db: Arc<HubDb>,
    cache: StorageCache,
    slot: CommitSlot,
    /// Committed events awaiting cache update and broadcast, in commit
    /// order. Fed under the commit slot, drained outside it.
    fanout_queue: Mutex<VecDeque<HubEvent>>,
    fanout_drain: Mutex<()>,
    listeners: [Mutex<Vec<Weak<EventListener>>>; EventKind::COUNT],
    prune_time_limit: Duration,
}

impl StoreEventHandler {
    /// Open over an existing database handle: reseed the id generator from
    /// the highest durable event key, then rebuild the usage cache before
    /// any commit can interleave.
    pub fn new(db: Arc<HubDb>, config: &HubConfig) -> Result<Self> {
        let generator = match Self::last_event_id(&db)? {
            Some(last) => {
                debug!(%last, "recovered event id generator from the log");
                EventIdGenerator::from_last_id(last)
            }
            None => EventIdGenerator::new(),
        };

        let handler = Self {
            cache: StorageCache::new(Arc::clone(&db)),
            db,
            slot: CommitSlot::new(generator, config.lock_max_pending, config.lock_timeout()),
            fanout_queue: Mutex::new(VecDeque::new()),
            fanout_drain: Mutex::new(()),
            listeners: std::array::from_fn(|_| Mutex::new(Vec::new())),
            prune_time_limit: config.prune_time_limit(),
        };
        handler.cache.sync_from_db()?;
        Ok(handler)
    }

    fn last_event_id(db: &HubDb) -> Result<Option<EventId>> {
        match db.last_key_with_prefix(&keys::events_prefix())? {
            Some(key) if key.len() == keys::EVENT_KEY_LEN => {
                Ok(Some(keys::event_id_from_key(&key)?))
            }
            _ => Ok(None),
        }
    }

    /// Commit the caller's transaction together with its event in one atomic
    /// batch, and return the id assigned to the event.
    ///
    /// The caller prepares `txn` entirely before calling; no lock is held
    /// during that preparation. Only id generation, the event fold-in, and
    /// the durable write run under the commit slot; cache update and
    /// broadcast follow outside it, in commit order.
    pub fn commit(&self, mut txn: Transaction, body: HubEventBody) -> Result<EventId> {
        let mut generator = self.slot.acquire()?;
        let id = generator.generate(time::current_millis()?)?;

        let event = HubEvent { id, body };
        txn.put(keys::make_event_key(id), encode_event(&event)?);
        self.db.write(txn)?;

        // Enqueue while still holding the slot so queue order is commit
        // order, then release the slot before any listener runs.
        self.fanout_queue.lock().push_back(event);
        drop(generator);

        self.drain_fanout();
        Ok(id)
    }

    /// Apply queued cache updates and broadcasts, in commit order. A single
    /// drainer runs at a time: a committer that finds the drain lock taken
    /// returns immediately and leaves its event to the active drainer, so a
    /// slow listener never backpressures the commit slot.
    fn drain_fanout(&self) {
        loop {
            {
                let Some(_drain) = self.fanout_drain.try_lock() else {
                    return;
                };
                self.apply_queued();
            }
            // An event pushed between the last pop and the unlock would
            // otherwise linger until the next commit; re-check and drain
            // again if so.
            if self.fanout_queue.lock().is_empty() {
                return;
            }
        }
    }

    /// Pop and apply queued events until empty. Callers hold `fanout_drain`.
    fn apply_queued(&self) {
        loop {
            let Some(event) = self.fanout_queue.lock().pop_front() else {
                break;
            };
            self.cache.process_event(&event);
            self.broadcast(&event);
        }
    }

    /// Register a listener for one event kind. The bus keeps only a weak
    /// reference: dropping the returned-side `Arc` unsubscribes.
    pub fn subscribe(&self, kind: EventKind, listener: &Arc<EventListener>) {
        self.listeners[kind.index()].lock().push(Arc::downgrade(listener));
    }

    fn broadcast(&self, event: &HubEvent) {
        // Snapshot live listeners so callbacks never run under the channel
        // lock; a listener is then free to subscribe or drop handles.
        let live: Vec<Arc<EventListener>> = {
            let mut channel = self.listeners[event.kind().index()].lock();
            channel.retain(|weak| weak.strong_count() > 0);
            channel.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in live {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(id = %event.id, %err, "event listener failed"),
                Err(_) => warn!(id = %event.id, "event listener panicked"),
            }
        }
    }

    pub fn get_event(&self, id: EventId) -> Result<HubEvent> {
        if id.as_u64() == 0 {
            return Err(HubError::InvalidParam(
                "event id 0 is reserved".to_string(),
            ));
        }
        match self.db.get(&keys::make_event_key(id))? {
            Some(bytes) => decode_event(&bytes),
            None => Err(HubError::NotFound),
        }
    }

    /// All events with `id >= from_id` (or the whole log), in id order.
    pub fn get_events(&self, from_id: Option<EventId>) -> Result<Vec<HubEvent>> {
        let prefix = keys::events_prefix();
        let lower = match from_id {
            Some(id) => keys::make_event_key(id),
            None => prefix.clone(),
        };
        let upper = keys::increment_prefix(&prefix)?;

        let mut events = Vec::new();
        self.db.iter_range(&lower, Some(&upper), |_, value| {
            events.push(decode_event(value)?);
            Ok(true)
        })?;
        Ok(events)
    }

    pub fn get_events_page(&self, from_id: EventId, page_size: usize) -> Result<EventsPage> {
        if page_size == 0 {
            return Ok(EventsPage {
                events: Vec::new(),
                next_page_event_id: from_id,
            });
        }

        let prefix = keys::events_prefix();
        let upper = keys::increment_prefix(&prefix)?;
        let lower = keys::make_event_key(from_id);

        let mut events = Vec::new();
        self.db.iter_range(&lower, Some(&upper), |_, value| {
            events.push(decode_event(value)?);
            Ok(events.len() < page_size)
        })?;

        let next_page_event_id = match events.last() {
            Some(event) => event.id.next(),
            None => from_id,
        };
        Ok(EventsPage {
            events,
            next_page_event_id,
        })
    }

    /// Delete events older than `time_limit` (default from config), batched,
    /// bounded by a wall-clock budget. Returns how many entries went.
    pub fn prune_events(&self, time_limit: Option<Duration>) -> Result<usize> {
        let limit = time_limit.unwrap_or(self.prune_time_limit);
        let now = time::millis_since_epoch(time::current_millis()?)?;
        let cutoff = EventId::from_parts(now.saturating_sub(limit.as_millis() as u64), 0)?;

        let lower = keys::events_prefix();
        let upper = keys::make_event_key(cutoff);
        let started = Instant::now();
        let mut pruned = 0usize;
        let mut out_of_time = false;
        let mut batch = Transaction::new();

        self.db.iter_range(&lower, Some(&upper), |key, _| {
            if started.elapsed() >= PRUNE_BUDGET {
                out_of_time = true;
                return Ok(false);
            }
            batch.delete(key);
            pruned += 1;
            if batch.len() >= PRUNE_DELETE_BATCH {
                self.db.write(std::mem::take(&mut batch))?;
            }
            Ok(true)
        })?;
        if !batch.is_empty() {
            self.db.write(batch)?;
        }

        if out_of_time {
            info!(pruned, "prune budget exhausted; the next sweep resumes from the front");
        } else {
            info!(pruned, cutoff = %cutoff, "pruned expired events");
        }
        Ok(pruned)
    }

    /// Would committing `message` right now leave it immediately
    /// prune-eligible under the size-and-time policy?
    pub fn is_prunable(
        &self,
        message: &Message,
        size_limit: u32,
        time_limit_secs: Option<u32>,
    ) -> Result<bool> {
        let now = time::farcaster_time()?;
        if let Some(limit) = time_limit_secs {
            if message.timestamp < now.saturating_sub(limit) {
                return Ok(true);
            }
        }

        let units = self.cache.get_storage_units(message.fid);
        let count = self.cache.get_message_count(message.fid, message.kind);
        if u64::from(count) < u64::from(size_limit) * u64::from(units) {
            return Ok(false);
        }

        let ts_hash = message.ts_hash()?;
        match self.cache.get_earliest_ts_hash(message.fid, message.kind)? {
            Some(earliest) => Ok(ts_hash < earliest),
            None => Ok(false),
        }
    }

    pub fn get_usage(&self, fid: u64, kind: StoreKind) -> Result<Usage> {
        let used_messages = self.cache.get_message_count(fid, kind);
        let (earliest_timestamp, earliest_hash) =
            match self.cache.get_earliest_ts_hash(fid, kind)? {
                Some(ts_hash) => {
                    let (timestamp, hash) = keys::split_ts_hash(&ts_hash)?;
                    (Some(timestamp), Some(hash.to_vec()))
                }
                None => (None, None),
            };
        Ok(Usage {
            used_messages,
            earliest_timestamp,
            earliest_hash,
        })
    }

    pub fn get_storage_units_for_account(&self, fid: u64) -> u32 {
        self.cache.get_storage_units(fid)
    }

    /// Rebuild the usage cache from the durable indices. Holds the commit
    /// slot for the duration so no commit interleaves with the rebuild, and
    /// settles queued fan-outs first so none is re-applied on top of it.
    pub fn sync_cache(&self) -> Result<()> {
        let _generator = self.slot.acquire()?;
        {
            let _drain = self.fanout_drain.lock();
            self.apply_queued();
        }
        self.cache.sync_from_db()
    }

    /// How many times the id generator has observed the wall clock running
    /// backwards since startup.
    pub fn clock_regressions(&self) -> u64 {
        self.slot.generator.lock().clock_regressions()
    }
}
