//! Watermark-driven connection manager.
//!
//! Tracks live connection counts per peer, lets the application weight peers
//! with static and decaying tags, and trims the lowest-valued unprotected
//! connections back to the low watermark whenever the count passes the high
//! watermark.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use libp2p::PeerId;
use parking_lot::RwLock;
use strand_clock::Clock;
use tracing::{debug, trace, warn};

use crate::config::DecayerConfig;
use crate::decay::{BumpPolicy, DecayPolicy};
use crate::error::{CloseError, ConnMgrError, RegistryError};
use crate::notifee::{ConnectionCloser, NotifeeHandle};
use crate::registry::{Decayer, DecayingTag};
use crate::store::{TagInfo, TagStore};

/// Outcome of one trim pass.
#[derive(Debug, Default)]
pub struct TrimReport {
    /// Eligible candidates considered, before the watermark cutoff.
    pub examined: usize,
    /// Peers whose connections were closed, lowest score first.
    pub closed: Vec<PeerId>,
    /// Close attempts that failed; the pass continues past them.
    pub failed: Vec<(PeerId, CloseError)>,
}

struct Inner {
    low_water: usize,
    high_water: usize,
    grace_period: Duration,
    clock: Arc<dyn Clock>,
    store: Arc<TagStore>,
    decayer: Decayer,
    /// Total live connections across all peers.
    conns: AtomicUsize,
    /// Source of connect-order sequence numbers, the trim tie-break.
    next_seq: AtomicU64,
    protected: RwLock<HashMap<PeerId, HashSet<String>>>,
    closer: RwLock<Option<Arc<dyn ConnectionCloser>>>,
    /// Set while a trim pass runs; overlapping triggers are dropped.
    trimming: AtomicBool,
}

/// The connection manager. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ConnManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnManager")
            .field("low_water", &self.inner.low_water)
            .field("high_water", &self.inner.high_water)
            .field("grace_period", &self.inner.grace_period)
            .field("conns", &self.inner.conns.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ConnManager {
    /// Create a manager with the default decay scheduler (system clock,
    /// 60s resolution). Must be called from within a tokio runtime.
    pub fn new(
        low_water: usize,
        high_water: usize,
        grace_period: Duration,
    ) -> Result<Self, ConnMgrError> {
        Self::with_decayer_config(low_water, high_water, grace_period, DecayerConfig::default())
    }

    /// Create a manager with an explicit decay scheduler configuration.
    pub fn with_decayer_config(
        low_water: usize,
        high_water: usize,
        grace_period: Duration,
        cfg: DecayerConfig,
    ) -> Result<Self, ConnMgrError> {
        if low_water > high_water {
            return Err(ConnMgrError::InvalidWatermarks {
                low: low_water,
                high: high_water,
            });
        }

        let clock = Arc::clone(&cfg.clock);
        let store = Arc::new(TagStore::new(Arc::clone(&clock)));
        let decayer = Decayer::spawn(cfg, Arc::clone(&store));

        Ok(Self {
            inner: Arc::new(Inner {
                low_water,
                high_water,
                grace_period,
                clock,
                store,
                decayer,
                conns: AtomicUsize::new(0),
                next_seq: AtomicU64::new(0),
                protected: RwLock::new(HashMap::new()),
                closer: RwLock::new(None),
                trimming: AtomicBool::new(false),
            }),
        })
    }

    pub fn low_water(&self) -> usize {
        self.inner.low_water
    }

    pub fn high_water(&self) -> usize {
        self.inner.high_water
    }

    pub fn grace_period(&self) -> Duration {
        self.inner.grace_period
    }

    /// Install the transport hook trim passes close connections through.
    /// Until one is set, trims are skipped.
    pub fn set_closer(&self, closer: Arc<dyn ConnectionCloser>) {
        *self.inner.closer.write() = Some(closer);
    }

    /// Handle to feed connection events into this manager.
    pub fn notifee(&self) -> NotifeeHandle {
        NotifeeHandle::new(self.clone())
    }

    /// Set a static tag on a peer, replacing any previous value for that
    /// name.
    pub fn tag_peer(&self, peer: &PeerId, tag: &str, value: i64) {
        self.inner.store.set_tag(peer, tag, value);
    }

    /// Remove a static tag. Unknown tags and peers are a no-op.
    pub fn untag_peer(&self, peer: &PeerId, tag: &str) {
        self.inner.store.remove_tag(peer, tag);
    }

    /// Snapshot of a peer's tags and aggregate score. Unknown peers report
    /// zero values.
    pub fn get_tag_info(&self, peer: &PeerId) -> TagInfo {
        self.inner.store.get_tag_info(peer)
    }

    /// Register a decaying tag on the shared scheduler.
    pub async fn register_decaying_tag(
        &self,
        name: &str,
        interval: Duration,
        decay: DecayPolicy,
        bump: BumpPolicy,
    ) -> Result<DecayingTag, RegistryError> {
        self.inner
            .decayer
            .register_decaying_tag(name, interval, decay, bump)
            .await
    }

    /// Wait until the decay registry has applied every command and tick
    /// accepted so far.
    pub async fn flush(&self) -> Result<(), RegistryError> {
        self.inner.decayer.flush().await
    }

    /// Exempt a peer from trimming under the given reason.
    pub fn protect(&self, peer: PeerId, reason: &str) {
        self.inner
            .protected
            .write()
            .entry(peer)
            .or_default()
            .insert(reason.to_string());
    }

    /// Drop one protection reason. Returns true while other reasons still
    /// protect the peer.
    pub fn unprotect(&self, peer: &PeerId, reason: &str) -> bool {
        let mut protected = self.inner.protected.write();
        if let Some(reasons) = protected.get_mut(peer) {
            reasons.remove(reason);
            if reasons.is_empty() {
                protected.remove(peer);
            }
        }
        protected.contains_key(peer)
    }

    pub fn is_protected(&self, peer: &PeerId) -> bool {
        self.inner.protected.read().contains_key(peer)
    }

    /// Total live connections.
    pub fn connected_count(&self) -> usize {
        self.inner.conns.load(Ordering::Relaxed)
    }

    /// Number of peers with an entry in the store (connected or tagged).
    pub fn tracked_peers(&self) -> usize {
        self.inner.store.len()
    }

    pub(crate) fn handle_connected(&self, peer: PeerId) {
        self.inner.store.update(&peer, |e| {
            if e.conns == 0 {
                // (Re)connection: restart the grace window and take a fresh
                // position in connect order.
                e.first_seen = self.inner.clock.now();
                e.conn_seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
                e.temp = false;
            }
            e.conns += 1;
        });

        let total = self.inner.conns.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(%peer, total, "peer connected");

        if total > self.inner.high_water {
            self.trim_open_conns();
        }
    }

    pub(crate) fn handle_disconnected(&self, peer: PeerId) {
        let Some(entry) = self.inner.store.get(&peer) else {
            trace!(%peer, "disconnect for untracked peer");
            return;
        };
        let empty = {
            let mut e = entry.lock();
            if e.conns == 0 {
                trace!(%peer, "unbalanced disconnect");
                return;
            }
            e.conns -= 1;
            e.is_empty()
        };

        let total = self.inner.conns.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!(%peer, total, "peer disconnected");

        if empty {
            self.inner.store.maybe_gc(&peer);
        }
    }

    /// Trim the lowest-valued eligible connections down to the low
    /// watermark. Returns an empty report when the count is already at or
    /// below the low watermark, no closer is installed, or another trim is
    /// in flight.
    pub fn trim_open_conns(&self) -> TrimReport {
        if self.inner.trimming.swap(true, Ordering::AcqRel) {
            trace!("trim already in progress");
            return TrimReport::default();
        }
        let report = self.trim_inner();
        self.inner.trimming.store(false, Ordering::Release);
        report
    }

    fn trim_inner(&self) -> TrimReport {
        let mut report = TrimReport::default();

        let total = self.connected_count();
        if total <= self.inner.low_water {
            return report;
        }
        let excess = total - self.inner.low_water;

        let Some(closer) = self.inner.closer.read().clone() else {
            debug!("trim skipped: no connection closer installed");
            return report;
        };

        let now = self.inner.clock.now();
        let protected: HashSet<PeerId> =
            self.inner.protected.read().keys().copied().collect();

        // Snapshot candidates without holding any lock across the close
        // calls below; the closer may re-enter via the notifee.
        struct Candidate {
            peer: PeerId,
            value: i64,
            seq: u64,
        }
        let mut candidates: Vec<Candidate> = Vec::new();
        for (peer, entry) in self.inner.store.entries() {
            if protected.contains(&peer) {
                continue;
            }
            let e = entry.lock();
            if e.conns == 0 {
                continue;
            }
            if now.saturating_duration_since(e.first_seen) < self.inner.grace_period {
                continue;
            }
            candidates.push(Candidate {
                peer,
                value: e.value,
                seq: e.conn_seq,
            });
        }
        candidates.sort_by_key(|c| (c.value, c.seq));
        report.examined = candidates.len();

        for candidate in candidates {
            if report.closed.len() >= excess {
                break;
            }
            match closer.close_peer(&candidate.peer) {
                Ok(()) => {
                    debug!(peer = %candidate.peer, value = candidate.value, "trimmed connection");
                    report.closed.push(candidate.peer);
                }
                Err(err) => {
                    warn!(peer = %candidate.peer, %err, "failed to close connection during trim");
                    report.failed.push((candidate.peer, err));
                }
            }
        }

        debug!(
            examined = report.examined,
            closed = report.closed.len(),
            failed = report.failed.len(),
            "trim pass finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Notifee;
    use parking_lot::Mutex;
    use strand_clock::ManualClock;

    fn test_peer_id(n: u8) -> PeerId {
        let bytes = [n; 32];
        let key = libp2p::identity::ed25519::SecretKey::try_from_bytes(bytes).unwrap();
        let keypair =
            libp2p::identity::Keypair::from(libp2p::identity::ed25519::Keypair::from(key));
        keypair.public().to_peer_id()
    }

    fn test_manager(
        low: usize,
        high: usize,
        grace: Duration,
    ) -> (ConnManager, ManualClock) {
        let clock = ManualClock::new();
        let cfg = DecayerConfig::default()
            .with_resolution(Duration::from_millis(50))
            .with_clock(Arc::new(clock.clone()));
        let mgr = ConnManager::with_decayer_config(low, high, grace, cfg).unwrap();
        (mgr, clock)
    }

    /// Records closed peers and feeds the disconnect back into the manager,
    /// like a real transport would.
    #[derive(Default)]
    struct RecordingCloser {
        closed: Mutex<Vec<PeerId>>,
        fail: Mutex<HashSet<PeerId>>,
        notifee: Mutex<Option<NotifeeHandle>>,
    }

    impl ConnectionCloser for RecordingCloser {
        fn close_peer(&self, peer: &PeerId) -> Result<(), CloseError> {
            if self.fail.lock().contains(peer) {
                return Err(CloseError::new("injected failure"));
            }
            self.closed.lock().push(*peer);
            if let Some(notifee) = self.notifee.lock().clone() {
                notifee.disconnected(*peer);
            }
            Ok(())
        }
    }

    fn install_closer(mgr: &ConnManager) -> Arc<RecordingCloser> {
        let closer = Arc::new(RecordingCloser::default());
        *closer.notifee.lock() = Some(mgr.notifee());
        mgr.set_closer(closer.clone());
        closer
    }

    #[tokio::test]
    async fn test_invalid_watermarks_rejected() {
        let err = ConnManager::new(10, 5, Duration::ZERO).unwrap_err();
        assert!(matches!(
            err,
            ConnMgrError::InvalidWatermarks { low: 10, high: 5 }
        ));
    }

    #[tokio::test]
    async fn test_connect_disconnect_counting_and_gc() {
        let (mgr, _clock) = test_manager(1, 10, Duration::ZERO);
        let notifee = mgr.notifee();
        let peer = test_peer_id(1);

        notifee.connected(peer);
        notifee.connected(peer);
        assert_eq!(mgr.connected_count(), 2);
        assert_eq!(mgr.get_tag_info(&peer).conns, 2);
        assert!(!mgr.get_tag_info(&peer).temp);

        notifee.disconnected(peer);
        assert_eq!(mgr.connected_count(), 1);
        assert_eq!(mgr.tracked_peers(), 1);

        // Last disconnect drops the untagged entry.
        notifee.disconnected(peer);
        assert_eq!(mgr.connected_count(), 0);
        assert_eq!(mgr.tracked_peers(), 0);
    }

    #[tokio::test]
    async fn test_unbalanced_disconnect_is_ignored() {
        let (mgr, _clock) = test_manager(1, 10, Duration::ZERO);
        let notifee = mgr.notifee();
        let peer = test_peer_id(1);

        notifee.disconnected(peer);
        assert_eq!(mgr.connected_count(), 0);

        notifee.connected(peer);
        notifee.disconnected(peer);
        notifee.disconnected(peer);
        assert_eq!(mgr.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_tagged_entry_survives_disconnect() {
        let (mgr, _clock) = test_manager(1, 10, Duration::ZERO);
        let notifee = mgr.notifee();
        let peer = test_peer_id(1);

        notifee.connected(peer);
        mgr.tag_peer(&peer, "important", 50);
        notifee.disconnected(peer);

        assert_eq!(mgr.tracked_peers(), 1);
        assert_eq!(mgr.get_tag_info(&peer).value, 50);
    }

    #[tokio::test]
    async fn test_trim_closes_lowest_scores_down_to_low_water() {
        let (mgr, clock) = test_manager(8, 10, Duration::from_secs(1));
        let notifee = mgr.notifee();

        let peers: Vec<PeerId> = (1..=12).map(test_peer_id).collect();
        for (i, peer) in peers.iter().enumerate() {
            mgr.tag_peer(peer, "score", (i as i64 + 1) * 10);
            notifee.connected(*peer);
        }
        assert_eq!(mgr.connected_count(), 12);

        clock.advance(Duration::from_secs(2));
        let closer = install_closer(&mgr);

        let report = mgr.trim_open_conns();
        assert_eq!(report.examined, 12);
        assert_eq!(report.closed, peers[..4].to_vec());
        assert!(report.failed.is_empty());
        assert_eq!(mgr.connected_count(), 8);
        assert_eq!(*closer.closed.lock(), peers[..4].to_vec());
    }

    #[tokio::test]
    async fn test_trim_noop_at_or_below_low_water() {
        let (mgr, clock) = test_manager(5, 10, Duration::ZERO);
        let notifee = mgr.notifee();
        install_closer(&mgr);

        for n in 1..=5 {
            notifee.connected(test_peer_id(n));
        }
        clock.advance(Duration::from_secs(1));

        let report = mgr.trim_open_conns();
        assert_eq!(report.examined, 0);
        assert!(report.closed.is_empty());
        assert_eq!(mgr.connected_count(), 5);
    }

    #[tokio::test]
    async fn test_trim_skipped_without_closer() {
        let (mgr, clock) = test_manager(1, 2, Duration::ZERO);
        let notifee = mgr.notifee();

        for n in 1..=3 {
            notifee.connected(test_peer_id(n));
        }
        clock.advance(Duration::from_secs(1));

        let report = mgr.trim_open_conns();
        assert!(report.closed.is_empty());
        assert_eq!(mgr.connected_count(), 3);
    }

    #[tokio::test]
    async fn test_grace_period_shields_new_peers() {
        let (mgr, clock) = test_manager(1, 10, Duration::from_secs(1));
        let notifee = mgr.notifee();

        let old1 = test_peer_id(1);
        let old2 = test_peer_id(2);
        notifee.connected(old1);
        notifee.connected(old2);
        clock.advance(Duration::from_secs(2));

        // Fresh peer with the lowest score of the three.
        let fresh = test_peer_id(3);
        mgr.tag_peer(&old1, "score", 100);
        mgr.tag_peer(&old2, "score", 100);
        notifee.connected(fresh);

        let closer = install_closer(&mgr);
        let report = mgr.trim_open_conns();

        assert_eq!(report.closed.len(), 2);
        assert!(!report.closed.contains(&fresh));
        assert_eq!(mgr.connected_count(), 1);
        assert!(!closer.closed.lock().contains(&fresh));
    }

    #[tokio::test]
    async fn test_grace_window_restarts_on_reconnect() {
        let (mgr, clock) = test_manager(0, 10, Duration::from_secs(1));
        let notifee = mgr.notifee();
        install_closer(&mgr);
        let peer = test_peer_id(1);

        notifee.connected(peer);
        mgr.tag_peer(&peer, "keep", 1);
        clock.advance(Duration::from_secs(2));
        notifee.disconnected(peer);
        notifee.connected(peer);

        // Reconnection started a fresh grace window.
        let report = mgr.trim_open_conns();
        assert!(report.closed.is_empty());
        assert_eq!(mgr.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_protected_peers_are_never_trimmed() {
        let (mgr, clock) = test_manager(1, 10, Duration::ZERO);
        let notifee = mgr.notifee();

        let weak = test_peer_id(1);
        let strong = test_peer_id(2);
        mgr.tag_peer(&weak, "score", 1);
        mgr.tag_peer(&strong, "score", 100);
        notifee.connected(weak);
        notifee.connected(strong);
        clock.advance(Duration::from_secs(1));

        mgr.protect(weak, "bootstrap");
        assert!(mgr.is_protected(&weak));

        let closer = install_closer(&mgr);
        let report = mgr.trim_open_conns();

        // The higher-scored peer goes because the low one is protected.
        assert_eq!(report.closed, vec![strong]);
        assert_eq!(*closer.closed.lock(), vec![strong]);
    }

    #[tokio::test]
    async fn test_unprotect_reports_remaining_reasons() {
        let (mgr, _clock) = test_manager(1, 10, Duration::ZERO);
        let peer = test_peer_id(1);

        mgr.protect(peer, "bootstrap");
        mgr.protect(peer, "relay");

        assert!(mgr.unprotect(&peer, "bootstrap"));
        assert!(mgr.is_protected(&peer));
        assert!(!mgr.unprotect(&peer, "relay"));
        assert!(!mgr.is_protected(&peer));
    }

    #[tokio::test]
    async fn test_high_water_triggers_trim_on_connect() {
        let (mgr, clock) = test_manager(10, 10, Duration::from_secs(1));
        let notifee = mgr.notifee();
        let closer = install_closer(&mgr);

        let peers: Vec<PeerId> = (1..=11).map(test_peer_id).collect();
        for (i, peer) in peers.iter().take(10).enumerate() {
            mgr.tag_peer(peer, "score", (i as i64 + 1) * 10);
            notifee.connected(*peer);
        }
        assert_eq!(mgr.connected_count(), 10);
        assert!(closer.closed.lock().is_empty());

        clock.advance(Duration::from_secs(2));

        // The 11th connection breaches the high water and trims back to 10;
        // the newcomer itself is inside its grace window.
        notifee.connected(peers[10]);
        assert_eq!(mgr.connected_count(), 10);
        assert_eq!(*closer.closed.lock(), vec![peers[0]]);
    }

    #[tokio::test]
    async fn test_trim_continues_past_close_failures() {
        let (mgr, clock) = test_manager(2, 10, Duration::ZERO);
        let notifee = mgr.notifee();

        let peers: Vec<PeerId> = (1..=4).map(test_peer_id).collect();
        for (i, peer) in peers.iter().enumerate() {
            mgr.tag_peer(peer, "score", (i as i64 + 1) * 10);
            notifee.connected(*peer);
        }
        clock.advance(Duration::from_secs(1));

        let closer = install_closer(&mgr);
        closer.fail.lock().insert(peers[0]);

        let report = mgr.trim_open_conns();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, peers[0]);
        assert_eq!(report.closed, peers[1..3].to_vec());
        assert_eq!(mgr.connected_count(), 2);
    }

    #[tokio::test]
    async fn test_equal_scores_trim_oldest_connection_first() {
        let (mgr, clock) = test_manager(2, 10, Duration::ZERO);
        let notifee = mgr.notifee();

        let peers: Vec<PeerId> = (1..=3).map(test_peer_id).collect();
        for peer in &peers {
            notifee.connected(*peer);
        }
        clock.advance(Duration::from_secs(1));

        let closer = install_closer(&mgr);
        let report = mgr.trim_open_conns();

        assert_eq!(report.closed, vec![peers[0]]);
        assert_eq!(*closer.closed.lock(), vec![peers[0]]);
    }

    #[tokio::test]
    async fn test_decaying_tags_feed_trim_scores() {
        let (mgr, clock) = test_manager(1, 10, Duration::ZERO);
        let notifee = mgr.notifee();

        let tag = mgr
            .register_decaying_tag(
                "useful",
                Duration::from_millis(50),
                DecayPolicy::Fixed { step: 100 },
                BumpPolicy::SumUnbounded,
            )
            .await
            .unwrap();

        let fading = test_peer_id(1);
        let steady = test_peer_id(2);
        notifee.connected(fading);
        notifee.connected(steady);

        tag.bump(fading, 150).await.unwrap();
        mgr.tag_peer(&steady, "score", 100);
        mgr.flush().await.unwrap();

        // After one interval the decaying peer scores 50 < 100.
        clock.advance(Duration::from_millis(50));
        mgr.flush().await.unwrap();

        let closer = install_closer(&mgr);
        let report = mgr.trim_open_conns();
        assert_eq!(report.closed, vec![fading]);
        assert_eq!(*closer.closed.lock(), vec![fading]);
    }
}
