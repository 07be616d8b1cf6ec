//! RustyBlue L2CAP - Bluetooth L2CAP channel layer
//!
//! This library implements the connection-oriented part of the Bluetooth
//! Logical Link Control and Adaptation Protocol on top of an abstract ACL
//! transport. It covers classic channels with configuration negotiation,
//! LE credit based channels and enhanced credit based channels with batch
//! connect and reconfigure.
//!
//! The HCI transport, link management and security are supplied by the
//! embedding stack through [`l2cap::LinkLayer`].

pub mod l2cap;

// Re-export common types for convenience
pub use l2cap::{
    BdAddr, ConnectionType, L2capCallbacks, L2capChannel, L2capChannelState, L2capChannelType,
    L2capConfig, L2capError, L2capManager, LinkLayer, Registration, PSM,
};
