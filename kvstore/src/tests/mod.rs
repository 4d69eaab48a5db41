//! Internal tests module
//!
//! Multi-node scenarios over real loopback sockets. Crate-internal so they
//! can reach private modules.

mod cluster;
mod single_node;
