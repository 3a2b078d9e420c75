//! Expiring slot claims for distributed ID generators.
//!
//! A Snowflake-style generator needs a machine id that no other live instance
//! is using. `ferroid-lease` hands those ids out from a bounded pool
//! `[0, pool_size)` through a shared coordination service, without any static
//! configuration:
//!
//! - [`SlotAllocator::claim_expiring`] reuses a relinquished slot if one is
//!   queued, and otherwise grows a bounded counter.
//! - Each claim is a [`ClaimHandle`] valid for a fixed TTL. When the TTL
//!   elapses the [`LeaseMonitor`] relinquishes the handle and queues the slot
//!   for reuse. Claims cannot be renewed; claim again instead.
//! - Sessions come from a [`SessionManager`], which wraps a backend
//!   [`Connector`]: [`MemoryConnector`] for a single process and tests, or
//!   `EtcdConnector` with the `etcd` feature.
//!
//! ```
//! use std::time::Duration;
//! use ferroid_lease::{
//!     ClaimState, LeaseMonitor, MemoryCluster, SessionConfig, SessionManager, SlotAllocator,
//! };
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let cluster = MemoryCluster::new();
//! let manager = SessionManager::new(cluster.connector(), SessionConfig::default());
//! manager.configure("memory");
//!
//! let monitor = LeaseMonitor::spawn();
//! monitor.attach(&manager);
//! let allocator = SlotAllocator::new(monitor);
//!
//! let session = manager.get().await.unwrap();
//! let claim = allocator
//!     .claim_expiring(&session, 64, "/unique-id-generator", Duration::from_secs(2))
//!     .await
//!     .unwrap();
//!
//! assert_eq!(claim.state(), ClaimState::HasClaim);
//! assert!(claim.get().unwrap() < 64);
//! # });
//! ```
//!
//! ## Known gaps
//!
//! Expiry is enforced client-side. A process that crashes before its claims
//! expire leaks those slots; nothing reclaims them automatically.

mod claim;
mod error;
mod layout;
mod session;

pub use crate::claim::*;
pub use crate::error::*;
pub use crate::layout::*;
pub use crate::session::*;
