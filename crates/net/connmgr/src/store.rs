//! Peer tag store: per-peer tag values and the cached aggregate score.
//!
//! Uses the Arc-per-peer pattern: the outer map lock is held only long enough
//! to fetch an entry's `Arc`, and all mutations serialize on that entry's own
//! mutex. Readers of one peer never block writers for another, and snapshots
//! are taken under the entry mutex so an aggregate is never observed torn.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use strand_clock::Clock;
use tracing::trace;

use crate::decay::DecayingValue;

/// Immutable snapshot of a peer's tags, aggregate score and connection state.
///
/// For an unknown peer every field is its zero value; an absent tag is
/// equivalent to a tag at value zero.
#[derive(Debug, Clone, Default)]
pub struct TagInfo {
    /// Aggregate score: the sum of all tag values below.
    pub value: i64,
    /// Static and decaying tags merged; a decaying tag shadows a static tag
    /// of the same name.
    pub tags: BTreeMap<String, i64>,
    /// Number of live connections.
    pub conns: usize,
    /// Instant of the most recent transition to connected, or of entry
    /// creation for peers that were only ever tagged.
    pub first_seen: Option<Instant>,
    /// True while the entry has never carried a live connection.
    pub temp: bool,
}

/// Mutable per-peer state, always accessed under the entry mutex.
#[derive(Debug)]
pub(crate) struct PeerEntry {
    /// Cleared by [`TagStore::maybe_gc`] under both locks when the entry is
    /// dropped from the map. A writer that fetched the `Arc` before the GC
    /// must not mutate a dead entry; [`TagStore::update`] retries instead.
    pub(crate) live: bool,
    pub(crate) first_seen: Instant,
    pub(crate) temp: bool,
    pub(crate) conns: usize,
    /// Monotonic sequence assigned when the peer (re)connects; the trim
    /// tie-break for equal scores.
    pub(crate) conn_seq: u64,
    /// Cached aggregate, kept equal to the sum of all tag values.
    pub(crate) value: i64,
    pub(crate) tags: HashMap<String, i64>,
    pub(crate) decaying: HashMap<String, DecayingValue>,
}

impl PeerEntry {
    fn new(now: Instant) -> Self {
        Self {
            live: true,
            first_seen: now,
            temp: true,
            conns: 0,
            conn_seq: 0,
            value: 0,
            tags: HashMap::new(),
            decaying: HashMap::new(),
        }
    }

    /// Recompute the cached aggregate. Static tags shadowed by a same-named
    /// decaying tag do not count, matching the merged view in [`TagInfo`].
    pub(crate) fn recompute(&mut self) {
        let mut sum: i64 = 0;
        for (name, v) in &self.tags {
            if !self.decaying.contains_key(name) {
                sum = sum.saturating_add(*v);
            }
        }
        for dv in self.decaying.values() {
            sum = sum.saturating_add(dv.value);
        }
        self.value = sum;
    }

    /// An entry with no connections and no tags is eligible for GC.
    pub(crate) fn is_empty(&self) -> bool {
        self.conns == 0 && self.tags.is_empty() && self.decaying.is_empty()
    }

    pub(crate) fn tag_info(&self) -> TagInfo {
        let mut tags: BTreeMap<String, i64> = self
            .tags
            .iter()
            .map(|(name, v)| (name.clone(), *v))
            .collect();
        for (name, dv) in &self.decaying {
            tags.insert(name.clone(), dv.value);
        }
        TagInfo {
            value: self.value,
            tags,
            conns: self.conns,
            first_seen: Some(self.first_seen),
            temp: self.temp,
        }
    }
}

/// The authoritative score source: peer → tags → cached aggregate.
#[derive(Debug)]
pub(crate) struct TagStore {
    clock: Arc<dyn Clock>,
    peers: RwLock<HashMap<PeerId, Arc<Mutex<PeerEntry>>>>,
}

impl TagStore {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the entry for a peer (double-checked locking).
    pub(crate) fn entry(&self, peer: &PeerId) -> Arc<Mutex<PeerEntry>> {
        // Fast path: read lock
        {
            let peers = self.peers.read();
            if let Some(entry) = peers.get(peer) {
                return Arc::clone(entry);
            }
        }

        // Slow path: write lock (only on first access per peer)
        let mut peers = self.peers.write();
        Arc::clone(peers.entry(*peer).or_insert_with(|| {
            trace!(%peer, "tracking new peer");
            Arc::new(Mutex::new(PeerEntry::new(self.clock.now())))
        }))
    }

    pub(crate) fn get(&self, peer: &PeerId) -> Option<Arc<Mutex<PeerEntry>>> {
        self.peers.read().get(peer).map(Arc::clone)
    }

    /// Snapshot of all tracked entries, for iteration without holding the
    /// map lock.
    pub(crate) fn entries(&self) -> Vec<(PeerId, Arc<Mutex<PeerEntry>>)> {
        self.peers
            .read()
            .iter()
            .map(|(peer, entry)| (*peer, Arc::clone(entry)))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Run a mutation against a live entry for the peer, creating one if
    /// needed. Retries when the fetched entry was GCed between the map
    /// lookup and taking its mutex, so a write never lands in an orphaned
    /// entry.
    pub(crate) fn update<R>(&self, peer: &PeerId, mut f: impl FnMut(&mut PeerEntry) -> R) -> R {
        loop {
            let entry = self.entry(peer);
            let mut e = entry.lock();
            if e.live {
                return f(&mut e);
            }
        }
    }

    pub(crate) fn set_tag(&self, peer: &PeerId, name: &str, value: i64) {
        self.update(peer, |e| {
            e.tags.insert(name.to_string(), value);
            e.recompute();
        });
    }

    pub(crate) fn remove_tag(&self, peer: &PeerId, name: &str) {
        let Some(entry) = self.get(peer) else {
            return;
        };
        let empty = {
            let mut e = entry.lock();
            if e.tags.remove(name).is_none() {
                return;
            }
            e.recompute();
            e.is_empty()
        };
        if empty {
            self.maybe_gc(peer);
        }
    }

    pub(crate) fn get_tag_info(&self, peer: &PeerId) -> TagInfo {
        self.get(peer)
            .map(|entry| entry.lock().tag_info())
            .unwrap_or_default()
    }

    /// Drop the entry if it is still empty. Takes the map write lock first,
    /// then the entry mutex, the same order as `entry()`; the entry is
    /// marked dead under both locks so late writers holding its `Arc` retry
    /// against a fresh one.
    pub(crate) fn maybe_gc(&self, peer: &PeerId) {
        let mut peers = self.peers.write();
        let Some(entry) = peers.get(peer).map(Arc::clone) else {
            return;
        };
        let mut e = entry.lock();
        if e.is_empty() {
            e.live = false;
            peers.remove(peer);
            trace!(%peer, "dropped empty peer entry");
        }
    }
}
