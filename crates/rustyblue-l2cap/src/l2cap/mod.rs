//! L2CAP (Logical Link Control and Adaptation Protocol) implementation
//!
//! This module provides the connection-oriented channel layer of L2CAP:
//! - Signaling command encoding and decoding
//! - The per-channel state machine for classic, LE credit based and
//!   enhanced credit based channels
//! - Configuration negotiation of classic channels
//! - Credit based flow control with SDU segmentation and reassembly
//! - Batch connection and reconfiguration of enhanced credit based channels

pub mod constants;
pub mod types;
pub mod psm;
pub mod packet;
pub mod signaling;
pub mod registry;
pub mod link;
pub mod channel;
pub mod credit;
mod batch;
mod csm;
pub mod core;
#[cfg(test)]
mod tests;

// Re-export the public API
pub use self::types::*;
pub use self::core::L2capManager;
pub use self::channel::{L2capChannel, L2capChannelType};
pub use self::link::{LinkControlBlock, LinkLayer, SecurityRequest};
pub use self::psm::{DynamicPsmAllocator, PSM};
pub use self::registry::{L2capCallbacks, Registration};
pub use self::signaling::SignalingMessage;
