pub(crate) mod cache_impl;
pub(crate) mod gossip_impl;
