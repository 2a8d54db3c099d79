//! Device provisioning and offline synchronization built on the clients in
//! the crate root.

pub mod connectivity;
pub mod delivery;
pub mod mutations;
pub mod offline_queue;
pub mod provisioning;
pub mod sync;
