//! Peer connection management: watermark-based trimming with tag scoring.
//!
//! The manager tracks live connections per peer and an application-assigned
//! score, the sum of named tag values. Tags are either static (set and
//! removed explicitly) or decaying (bumped by usefulness signals and aged by
//! a shared scheduler). When the connection count passes the high watermark,
//! the lowest-scored connections outside their grace period are closed until
//! the count reaches the low watermark; protected peers are never touched.
//!
//! ```no_run
//! use std::time::Duration;
//! use strand_net_connmgr::{BumpPolicy, ConnManager, DecayPolicy};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mgr = ConnManager::new(100, 300, Duration::from_secs(30))?;
//! let _notifee = mgr.notifee();
//!
//! let _useful = mgr
//!     .register_decaying_tag(
//!         "useful",
//!         Duration::from_secs(60),
//!         DecayPolicy::Linear { fraction: 0.5 },
//!         BumpPolicy::SumUnbounded,
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod decay;
pub mod error;
pub mod manager;
pub mod notifee;
pub mod registry;
pub mod store;

pub use config::{DEFAULT_COMMAND_QUEUE_CAPACITY, DEFAULT_RESOLUTION, DecayerConfig};
pub use decay::{BumpPolicy, DecayPolicy, DecayingValue};
pub use error::{CloseError, ConnMgrError, RegistryError};
pub use manager::{ConnManager, TrimReport};
pub use notifee::{ConnectionCloser, Notifee, NotifeeHandle};
pub use registry::{Decayer, DecayingTag};
pub use store::TagInfo;
