//! Readiness multiplexer
//!
//! An epoll-like registry: a caller creates a handle, registers event
//! sources with an event mask and then waits until at least one of them is
//! ready. Two kinds of sources exist, SRT sockets and external UDP
//! descriptors, both seen through the [`EventSource`] trait.
//!
//! `wait` never holds the registry lock while evaluating readiness or while
//! blocked; it works on a snapshot of the registrations, so concurrent
//! add/remove calls only affect later evaluations.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Re-evaluation period when external descriptors are watched; they have
/// no way to signal the notifier themselves.
const SYSTEM_POLL_TICK: Duration = Duration::from_millis(10);

/// Readiness event mask
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventFlags(u32);

impl EventFlags {
    /// No events
    pub const NONE: EventFlags = EventFlags(0);
    /// Data available for reading (or a pending connection to accept)
    pub const IN: EventFlags = EventFlags(0x1);
    /// Room in the send buffer (or a connection just completed)
    pub const OUT: EventFlags = EventFlags(0x4);
    /// Broken or closed
    pub const ERR: EventFlags = EventFlags(0x8);

    /// Build from raw bits, ignoring unknown bits
    pub fn from_bits_truncate(bits: u32) -> Self {
        EventFlags(bits & (Self::IN.0 | Self::OUT.0 | Self::ERR.0))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventFlags {
    type Output = EventFlags;

    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventFlags {
    fn bitor_assign(&mut self, rhs: EventFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventFlags {
    type Output = EventFlags;

    fn bitand(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 & rhs.0)
    }
}

impl fmt::Debug for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::IN) {
            names.push("IN");
        }
        if self.contains(Self::OUT) {
            names.push("OUT");
        }
        if self.contains(Self::ERR) {
            names.push("ERR");
        }
        write!(f, "EventFlags({})", names.join("|"))
    }
}

/// Anything that can report readiness
pub trait EventSource: Send + Sync {
    /// Events currently satisfied
    fn readiness(&self) -> EventFlags;
}

/// Identity of a watched source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceId {
    /// SRT socket id
    Srt(u32),
    /// External datagram descriptor, keyed by caller-chosen token
    System(u64),
}

impl SourceId {
    fn is_system(self) -> bool {
        matches!(self, SourceId::System(_))
    }
}

/// One entry in a wait result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub source: SourceId,
    /// Satisfied events, restricted to the watched mask
    pub events: EventFlags,
}

/// Epoll errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EpollError {
    #[error("Invalid epoll id: {0}")]
    InvalidId(u32),

    #[error("Source is not registered: {0:?}")]
    NotRegistered(SourceId),

    #[error("Indefinite wait on an empty watch set")]
    EmptySet,

    #[error("Epoll wait timed out")]
    Timeout,
}

/// Wake-up signal shared by all sources of one engine
///
/// Sources call [`Notifier::notify`] whenever their readiness may have
/// changed; waiters sleep until the generation counter moves.
#[derive(Default)]
pub struct Notifier {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Signal a readiness change
    pub fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Sleep until the generation differs from `seen` or `deadline` passes
    fn wait_since(&self, seen: u64, deadline: Option<Instant>) {
        let mut generation = self.generation.lock();
        while *generation == seen {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut generation, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut generation),
            }
        }
    }
}

struct Registration {
    source: Arc<dyn EventSource>,
    mask: EventFlags,
}

#[derive(Default)]
struct WatchSet {
    entries: BTreeMap<SourceId, Registration>,
}

/// Registry of epoll handles
pub struct Epoll {
    sets: Mutex<HashMap<u32, WatchSet>>,
    next_id: AtomicU32,
    notifier: Arc<Notifier>,
}

impl Epoll {
    /// Create a registry woken by `notifier`
    pub fn new(notifier: Arc<Notifier>) -> Self {
        Epoll {
            sets: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            notifier,
        }
    }

    /// Create a new handle
    pub fn create(&self) -> u32 {
        let eid = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sets.lock().insert(eid, WatchSet::default());
        tracing::debug!(eid, "epoll created");
        eid
    }

    /// Watch `source` for the events in `mask`
    ///
    /// Adding an already registered source replaces its mask.
    pub fn add(
        &self,
        eid: u32,
        id: SourceId,
        source: Arc<dyn EventSource>,
        mask: EventFlags,
    ) -> Result<(), EpollError> {
        let mut sets = self.sets.lock();
        let set = sets.get_mut(&eid).ok_or(EpollError::InvalidId(eid))?;
        set.entries.insert(id, Registration { source, mask });
        drop(sets);

        self.notifier.notify();
        Ok(())
    }

    /// Stop watching a source
    ///
    /// Removing a source that is not watched is not an error.
    pub fn remove(&self, eid: u32, id: SourceId) -> Result<(), EpollError> {
        let mut sets = self.sets.lock();
        let set = sets.get_mut(&eid).ok_or(EpollError::InvalidId(eid))?;
        set.entries.remove(&id);
        Ok(())
    }

    /// Change the mask of a watched source
    pub fn update(&self, eid: u32, id: SourceId, mask: EventFlags) -> Result<(), EpollError> {
        let mut sets = self.sets.lock();
        let set = sets.get_mut(&eid).ok_or(EpollError::InvalidId(eid))?;
        let registration = set
            .entries
            .get_mut(&id)
            .ok_or(EpollError::NotRegistered(id))?;
        registration.mask = mask;
        drop(sets);

        self.notifier.notify();
        Ok(())
    }

    /// Forget a source in every handle (the source itself went away)
    pub fn remove_everywhere(&self, id: SourceId) {
        let mut sets = self.sets.lock();
        for set in sets.values_mut() {
            set.entries.remove(&id);
        }
        drop(sets);

        self.notifier.notify();
    }

    /// Destroy a handle
    pub fn release(&self, eid: u32) -> Result<(), EpollError> {
        self.sets
            .lock()
            .remove(&eid)
            .ok_or(EpollError::InvalidId(eid))?;
        self.notifier.notify();
        tracing::debug!(eid, "epoll released");
        Ok(())
    }

    /// Wait for readiness
    ///
    /// `timeout` of `None` blocks indefinitely, `Some(Duration::ZERO)`
    /// polls once. Returns every satisfied source, never an empty list.
    pub fn wait(&self, eid: u32, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>, EpollError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let seen = self.notifier.generation();
            let snapshot = self.snapshot(eid)?;

            let ready: Vec<ReadyEvent> = snapshot
                .iter()
                .filter_map(|(id, source, mask)| {
                    let events = source.readiness() & *mask;
                    (!events.is_empty()).then_some(ReadyEvent {
                        source: *id,
                        events,
                    })
                })
                .collect();

            if !ready.is_empty() {
                return Ok(ready);
            }

            if snapshot.is_empty() && deadline.is_none() {
                return Err(EpollError::EmptySet);
            }

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return Err(EpollError::Timeout);
            }

            let watches_system = snapshot.iter().any(|(id, _, _)| id.is_system());
            let wake = match (deadline, watches_system) {
                (Some(d), true) => Some(d.min(now + SYSTEM_POLL_TICK)),
                (Some(d), false) => Some(d),
                (None, true) => Some(now + SYSTEM_POLL_TICK),
                (None, false) => None,
            };

            self.notifier.wait_since(seen, wake);
        }
    }

    fn snapshot(
        &self,
        eid: u32,
    ) -> Result<Vec<(SourceId, Arc<dyn EventSource>, EventFlags)>, EpollError> {
        let sets = self.sets.lock();
        let set = sets.get(&eid).ok_or(EpollError::InvalidId(eid))?;
        Ok(set
            .entries
            .iter()
            .map(|(id, reg)| (*id, reg.source.clone(), reg.mask))
            .collect())
    }
}
