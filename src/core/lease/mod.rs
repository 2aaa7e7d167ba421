//! Authorization leases.
//!
//! A lease is a short-lived opaque token fetched from the control plane and attached to
//! every synthesis request. [`LeaseManager`] caches it, refreshes it ahead of expiry and
//! coalesces concurrent refreshes into a single fetch.

mod fetcher;
mod manager;
mod token;

pub use fetcher::{HttpLeaseFetcher, LeaseFetcher};
pub use manager::{LeaseManager, LeaseSettings};
pub use token::{LEASE_EPOCH_SECS, Lease, LeaseMetadata};
