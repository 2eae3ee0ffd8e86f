//! Device protocol implementations.

pub mod ether_dream;
