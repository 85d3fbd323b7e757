//! Identity placement: the store contract, owner selection, and the lookup
//! that ties them together.

mod lookup;
mod rendezvous;
mod store;

pub use lookup::{IdentityLookup, LookupConfig, StoreIdentityLookup};
pub use rendezvous::select_owner;
pub use store::{AcquireOutcome, IdentityStore, InMemoryIdentityStore, StoreError};
