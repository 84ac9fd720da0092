//! Point-to-point KV transport.
//!
//! - [`tensor`]: Host tensors and element types
//! - [`topology`]: Peer endpoints and process groups resolved at startup
//! - [`channel`]: Tagged, framed, turn-based tensor/object channel
//! - [`metadata`]: Batch metadata and probe messages

pub mod channel;
pub mod metadata;
pub mod tensor;
pub mod topology;

pub use channel::{TransportChannel, TransportError};
