//! Generic record engine, change feed, subnet allocator and port
//! reservation.
//!
//! Everything here is written against [`crate::store::RecordBackend`] and is
//! parameterized by [`crate::model::ResourceKind`], so every resource kind
//! shares one implementation.
pub mod cidr_allocator;
pub mod feed;
pub mod port_reservation;
pub mod versioned;

pub use cidr_allocator::SubnetAllocator;
pub use feed::{ChangeFeed, FeedConfig, WatchEvent, WatchPage, WatchSubscription};
pub use port_reservation::{PortReserver, Reservation};
pub use versioned::VersionedStore;
