//! Decaying tag registry: handles, the serialized command loop and the
//! resolution-granularity tick schedule.
//!
//! All mutations (bump, remove, close) and clock ticks funnel through one
//! bounded command queue consumed by a single worker task, so concurrent
//! callers never race on a peer's aggregate. The queue bound is the
//! backpressure mechanism under bump storms; a send is atomic, so a caller
//! cancelled before the send completes has changed nothing, and a command
//! that was accepted is always fully applied.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use libp2p::PeerId;
use strand_clock::{Clock, Ticker};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::config::DecayerConfig;
use crate::decay::{BumpPolicy, DecayPolicy, DecayingValue};
use crate::error::RegistryError;
use crate::store::TagStore;

/// State shared between a tag's handles and the worker.
#[derive(Debug)]
struct TagShared {
    name: String,
    closed: AtomicBool,
}

enum Cmd {
    Register {
        name: String,
        interval: Duration,
        decay: DecayPolicy,
        bump: BumpPolicy,
        reply: oneshot::Sender<Result<Arc<TagShared>, RegistryError>>,
    },
    Bump {
        tag: Arc<TagShared>,
        peer: PeerId,
        delta: i64,
    },
    Remove {
        tag: Arc<TagShared>,
        peer: PeerId,
    },
    Close {
        tag: Arc<TagShared>,
        reply: oneshot::Sender<()>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// The decaying tag registry.
///
/// Owns the scheduling clock's ticker for the lifetime of its worker task;
/// the worker exits once every command sender (registry and all tag handles)
/// is gone, which also stops the ticking.
#[derive(Debug, Clone)]
pub struct Decayer {
    tx: mpsc::Sender<Cmd>,
    resolution: Duration,
}

impl Decayer {
    /// Spawn the worker task over a shared tag store.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(cfg: DecayerConfig, store: Arc<TagStore>) -> Self {
        let (tx, rx) = mpsc::channel(cfg.command_queue_capacity.max(1));
        let ticker = cfg.clock.ticker(cfg.resolution);
        let worker = Worker {
            clock: cfg.clock,
            store,
            rx,
            ticker,
            tags: HashMap::new(),
        };
        tokio::spawn(worker.run());
        Self {
            tx,
            resolution: cfg.resolution,
        }
    }

    /// Scheduler resolution this registry quantizes tag intervals against.
    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    /// Register a new decaying tag.
    ///
    /// Fails if the name is already registered or the interval is finer than
    /// the scheduler resolution.
    pub async fn register_decaying_tag(
        &self,
        name: &str,
        interval: Duration,
        decay: DecayPolicy,
        bump: BumpPolicy,
    ) -> Result<DecayingTag, RegistryError> {
        if interval < self.resolution {
            return Err(RegistryError::IntervalTooFine {
                interval,
                resolution: self.resolution,
            });
        }

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Cmd::Register {
                name: name.to_string(),
                interval,
                decay,
                bump,
                reply,
            })
            .await
            .map_err(|_| RegistryError::RegistryShutDown)?;
        let shared = rx.await.map_err(|_| RegistryError::RegistryShutDown)??;

        Ok(DecayingTag {
            shared,
            tx: self.tx.clone(),
        })
    }

    /// Wait until every command accepted before this call has been applied.
    pub async fn flush(&self) -> Result<(), RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Cmd::Flush { reply })
            .await
            .map_err(|_| RegistryError::RegistryShutDown)?;
        rx.await.map_err(|_| RegistryError::RegistryShutDown)
    }
}

/// Handle to a registered decaying tag.
///
/// Cheap to clone; all clones share closure state, so closing one closes
/// them all.
#[derive(Debug, Clone)]
pub struct DecayingTag {
    shared: Arc<TagShared>,
    tx: mpsc::Sender<Cmd>,
}

impl DecayingTag {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Apply the tag's bump policy to a peer's value, creating the tag entry
    /// from zero if absent.
    pub async fn bump(&self, peer: PeerId, delta: i64) -> Result<(), RegistryError> {
        if self.is_closed() {
            return Err(RegistryError::TagClosed(self.shared.name.clone()));
        }
        self.tx
            .send(Cmd::Bump {
                tag: Arc::clone(&self.shared),
                peer,
                delta,
            })
            .await
            .map_err(|_| RegistryError::RegistryShutDown)
    }

    /// Delete this tag's entry for one peer. Idempotent; removing an absent
    /// entry is not an error.
    pub async fn remove(&self, peer: PeerId) -> Result<(), RegistryError> {
        if self.is_closed() {
            return Err(RegistryError::TagClosed(self.shared.name.clone()));
        }
        self.tx
            .send(Cmd::Remove {
                tag: Arc::clone(&self.shared),
                peer,
            })
            .await
            .map_err(|_| RegistryError::RegistryShutDown)
    }

    /// Remove this tag's contribution from every peer and disable the
    /// handle. Idempotent; resolves once the removal has been applied.
    pub async fn close(&self) -> Result<(), RegistryError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Cmd::Close {
                tag: Arc::clone(&self.shared),
                reply,
            })
            .await
            .map_err(|_| RegistryError::RegistryShutDown)?;
        rx.await.map_err(|_| RegistryError::RegistryShutDown)
    }
}

struct TagState {
    shared: Arc<TagShared>,
    interval: Duration,
    next_tick: Instant,
    decay: DecayPolicy,
    bump: BumpPolicy,
}

/// Single consumer of the command queue and the tick schedule.
struct Worker {
    clock: Arc<dyn Clock>,
    store: Arc<TagStore>,
    rx: mpsc::Receiver<Cmd>,
    ticker: Ticker,
    tags: HashMap<String, TagState>,
}

impl Worker {
    async fn run(mut self) {
        // Ticks drain before commands so that a command enqueued after a
        // clock advance observes all decay due at that time.
        let mut ticking = true;
        loop {
            tokio::select! {
                biased;
                tick = self.ticker.tick(), if ticking => match tick {
                    Some(now) => self.handle_tick(now),
                    None => ticking = false,
                },
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_cmd(cmd),
                    None => break,
                },
            }
        }
        debug!("decay registry worker shutting down");
    }

    fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Register {
                name,
                interval,
                decay,
                bump,
                reply,
            } => {
                if self.tags.contains_key(&name) {
                    let _ = reply.send(Err(RegistryError::DuplicateTag(name)));
                    return;
                }
                let shared = Arc::new(TagShared {
                    name: name.clone(),
                    closed: AtomicBool::new(false),
                });
                debug!(tag = %name, ?interval, "registered decaying tag");
                self.tags.insert(
                    name,
                    TagState {
                        shared: Arc::clone(&shared),
                        interval,
                        next_tick: self.clock.now() + interval,
                        decay,
                        bump,
                    },
                );
                let _ = reply.send(Ok(shared));
            }
            Cmd::Bump { tag, peer, delta } => self.handle_bump(&tag, peer, delta),
            Cmd::Remove { tag, peer } => self.handle_remove(&tag, &peer),
            Cmd::Close { tag, reply } => {
                self.handle_close(&tag);
                let _ = reply.send(());
            }
            Cmd::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }

    /// Resolve a command's handle to its registered state. `None` when the
    /// handle was closed, or when its name has since been re-registered by
    /// an unrelated handle; commands from stale handles are dropped rather
    /// than applied to the wrong tag.
    fn live_state(&self, tag: &Arc<TagShared>) -> Option<&TagState> {
        if tag.closed.load(Ordering::Acquire) {
            return None;
        }
        let state = self.tags.get(&tag.name)?;
        Arc::ptr_eq(&state.shared, tag).then_some(state)
    }

    fn handle_bump(&mut self, tag: &Arc<TagShared>, peer: PeerId, delta: i64) {
        let Some(bump) = self.live_state(tag).map(|state| state.bump) else {
            // Handle closed while the bump was in flight.
            trace!(tag = %tag.name, %peer, "dropping bump from stale tag handle");
            return;
        };
        let now = self.clock.now();
        self.store.update(&peer, |e| {
            match e.decaying.get_mut(&tag.name) {
                Some(v) => {
                    v.value = bump.apply(v.value, delta);
                    v.last_bump = now;
                }
                None => {
                    e.decaying.insert(
                        tag.name.clone(),
                        DecayingValue {
                            value: bump.apply(0, delta),
                            last_bump: now,
                        },
                    );
                }
            }
            e.recompute();
        });
    }

    fn handle_remove(&mut self, tag: &Arc<TagShared>, peer: &PeerId) {
        if self.live_state(tag).is_none() {
            trace!(tag = %tag.name, %peer, "dropping removal from stale tag handle");
            return;
        }
        let Some(entry) = self.store.get(peer) else {
            return;
        };
        let empty = {
            let mut e = entry.lock();
            if e.decaying.remove(&tag.name).is_none() {
                return;
            }
            e.recompute();
            e.is_empty()
        };
        if empty {
            self.store.maybe_gc(peer);
        }
    }

    fn handle_close(&mut self, tag: &Arc<TagShared>) {
        let name = tag.name.as_str();
        match self.tags.get(name) {
            Some(state) if Arc::ptr_eq(&state.shared, tag) => {}
            // Already superseded by a re-registration under the same name.
            _ => return,
        }
        self.tags.remove(name);
        for (peer, entry) in self.store.entries() {
            let empty = {
                let mut e = entry.lock();
                if e.decaying.remove(name).is_none() {
                    continue;
                }
                e.recompute();
                e.is_empty()
            };
            if empty {
                self.store.maybe_gc(&peer);
            }
        }
        debug!(tag = %name, "closed decaying tag");
    }

    /// Apply decay for every tag whose own interval has elapsed at this
    /// firing. `next_tick` advances one interval per firing, so a tag whose
    /// interval is not a multiple of the resolution catches up over
    /// consecutive firings while preserving its long-run decay rate.
    fn handle_tick(&mut self, now: Instant) {
        let due: Vec<String> = self
            .tags
            .iter()
            .filter(|(_, state)| state.next_tick <= now)
            .map(|(name, _)| name.clone())
            .collect();
        if due.is_empty() {
            return;
        }

        for (peer, entry) in self.store.entries() {
            let empty = {
                let mut e = entry.lock();
                let mut changed = false;
                for name in &due {
                    let Some(state) = self.tags.get(name) else {
                        continue;
                    };
                    let Some(current) = e.decaying.get(name).copied() else {
                        continue;
                    };
                    let (next, remove) = state.decay.apply(current, now);
                    if remove {
                        e.decaying.remove(name);
                    } else if let Some(v) = e.decaying.get_mut(name) {
                        v.value = next;
                    }
                    changed = true;
                }
                if !changed {
                    continue;
                }
                e.recompute();
                e.is_empty()
            };
            if empty {
                self.store.maybe_gc(&peer);
            }
        }

        for name in &due {
            if let Some(state) = self.tags.get_mut(name) {
                state.next_tick += state.interval;
            }
        }
        trace!(tags = due.len(), "applied decay tick");
    }
}
