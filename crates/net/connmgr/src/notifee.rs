//! Connection event intake and the outbound close seam.

use libp2p::PeerId;

use crate::error::CloseError;
use crate::manager::ConnManager;

/// Sink for connection lifecycle events from the network layer.
pub trait Notifee: Send + Sync {
    fn connected(&self, peer: PeerId);
    fn disconnected(&self, peer: PeerId);
}

/// [`Notifee`] implementation feeding a [`ConnManager`].
///
/// Cheap to clone; hand one to each transport that reports connection
/// events.
#[derive(Debug, Clone)]
pub struct NotifeeHandle {
    mgr: ConnManager,
}

impl NotifeeHandle {
    pub(crate) fn new(mgr: ConnManager) -> Self {
        Self { mgr }
    }
}

impl Notifee for NotifeeHandle {
    fn connected(&self, peer: PeerId) {
        self.mgr.handle_connected(peer);
    }

    fn disconnected(&self, peer: PeerId) {
        self.mgr.handle_disconnected(peer);
    }
}

/// Outbound seam the trim pass closes connections through.
///
/// Implementations must tolerate being called for a peer that has already
/// disconnected, and may call back into the manager's [`Notifee`] from
/// within `close_peer`.
pub trait ConnectionCloser: Send + Sync {
    fn close_peer(&self, peer: &PeerId) -> Result<(), CloseError>;
}
