//! # meshcache
//! A peer embedded distributed cache for Rust services.
//!
//! This is a convenience package which includes the sub-projects of meshcache:
//!
//! ### Features
//! - `meshcache_node` - The cache node: gossip membership, the consistent hash ring and request routing.
//! - `meshcache_rpc` - The typed HTTP/2 RPC layer nodes use to talk to each other.

#[cfg(feature = "meshcache-node")]
pub use meshcache_node as node;
#[cfg(feature = "meshcache-rpc")]
pub use meshcache_rpc as rpc;
