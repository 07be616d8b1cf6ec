//! Type definitions for L2CAP operations
//!
//! This module contains core data structures used in L2CAP operations.

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

use super::constants::*;

/// Error types returned to the immediate caller of an L2CAP operation
#[derive(Debug, Error)]
pub enum L2capError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Malformed PDU: {0}")]
    MalformedPdu(&'static str),

    #[error("Channel not found")]
    ChannelNotFound,

    #[error("Operation not supported")]
    NotSupported,

    #[error("Invalid state for operation: {0}")]
    InvalidState(L2capChannelState),

    #[error("MTU exceeded: {len} > {mtu}")]
    MtuExceeded { len: usize, mtu: u16 },

    #[error("No resources available")]
    NoResources,

    #[error("PSM not registered")]
    PsmNotRegistered,

    #[error("PSM already registered")]
    PsmAlreadyRegistered,

    #[error("Channel is congested")]
    Congested,

    #[error("No link to peer")]
    NoLink,
}

/// Result type for L2CAP operations
pub type L2capResult<T> = std::result::Result<T, L2capError>;

/// Bluetooth device address, stored little-endian as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 6] = slice.get(..6)?.try_into().ok()?;
        Some(Self { bytes })
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

/// Transport a link runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Classic Bluetooth connection (BR/EDR ACL)
    Classic,
    /// Bluetooth Low Energy connection (LE)
    LE,
}

impl ConnectionType {
    /// CID of the signaling channel on this transport
    pub fn signaling_cid(&self) -> u16 {
        match self {
            Self::Classic => L2CAP_SIGNALING_CID,
            Self::LE => L2CAP_LE_SIGNALING_CID,
        }
    }
}

/// Channel state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capChannelState {
    /// No connection attempt in flight, or waiting for the link to come up
    Closed,
    /// Originator waiting for the security decision
    OrigWaitSecurity,
    /// Acceptor waiting for the security decision
    TermWaitSecurity,
    /// Connect request sent, waiting for the peer's response
    WaitPeerConnectRsp,
    /// Peer connect request indicated upward, waiting for the local answer
    WaitLocalConnectRsp,
    /// Configuration exchange in progress
    Config,
    /// Channel is open and ready for data transfer
    Open,
    /// Disconnect request sent, waiting for the peer's response
    WaitPeerDisconnectRsp,
    /// Peer disconnect indicated upward, waiting for the local confirmation
    WaitLocalDisconnectRsp,
}

impl fmt::Display for L2capChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::OrigWaitSecurity => "ORIG_W4_SEC_COMP",
            Self::TermWaitSecurity => "TERM_W4_SEC_COMP",
            Self::WaitPeerConnectRsp => "W4_L2CAP_CONNECT_RSP",
            Self::WaitLocalConnectRsp => "W4_L2CA_CONNECT_RSP",
            Self::Config => "CONFIG",
            Self::Open => "OPEN",
            Self::WaitPeerDisconnectRsp => "W4_L2CAP_DISCONNECT_RSP",
            Self::WaitLocalDisconnectRsp => "W4_L2CA_DISCONNECT_RSP",
        };
        f.write_str(name)
    }
}

/// Which side asked for the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionInitiator {
    Local,
    Remote,
}

/// Retransmission and Flow Control modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmissionMode {
    /// Basic L2CAP mode (no retransmission or flow control)
    Basic,
    /// Enhanced Retransmission mode
    EnhancedRetransmission,
    /// Streaming mode
    Streaming,
}

impl RetransmissionMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            L2CAP_MODE_BASIC => Some(Self::Basic),
            L2CAP_MODE_ERTM => Some(Self::EnhancedRetransmission),
            L2CAP_MODE_STREAMING => Some(Self::Streaming),
            _ => None,
        }
    }

    pub fn value(&self) -> u8 {
        match self {
            Self::Basic => L2CAP_MODE_BASIC,
            Self::EnhancedRetransmission => L2CAP_MODE_ERTM,
            Self::Streaming => L2CAP_MODE_STREAMING,
        }
    }

    /// Single-mode mask for this mode
    pub fn as_mask(&self) -> ChannelModes {
        match self {
            Self::Basic => ChannelModes::BASIC,
            Self::EnhancedRetransmission => ChannelModes::ERTM,
            Self::Streaming => ChannelModes::STREAMING,
        }
    }
}

bitflags! {
    /// Set of channel modes a service is willing to run
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelModes: u8 {
        const BASIC = 0x01;
        const ERTM = 0x02;
        const STREAMING = 0x04;
    }
}

impl ChannelModes {
    /// Mode to propose from the set, basic first: ERTM and streaming
    /// channels have no data path
    pub fn preferred(&self) -> Option<RetransmissionMode> {
        if self.contains(Self::BASIC) {
            Some(RetransmissionMode::Basic)
        } else if self.contains(Self::ERTM) {
            Some(RetransmissionMode::EnhancedRetransmission)
        } else if self.contains(Self::STREAMING) {
            Some(RetransmissionMode::Streaming)
        } else {
            None
        }
    }

    /// Modes a peer can run given its extended feature mask. Basic is always available.
    pub fn from_peer_features(features: u32) -> Self {
        let mut modes = Self::BASIC;
        if features & L2CAP_EXTFEA_ENH_RETRANS != 0 {
            modes |= Self::ERTM;
        }
        if features & L2CAP_EXTFEA_STREAM_MODE != 0 {
            modes |= Self::STREAMING;
        }
        modes
    }
}

bitflags! {
    /// Per-direction configuration progress of a classic channel
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConfigDone: u8 {
        /// Peer's configuration request accepted
        const IB_CFG_DONE = 0x01;
        /// Our configuration request accepted
        const OB_CFG_DONE = 0x02;
        /// Channel was open and is being reconfigured
        const RECONFIG_FLAG = 0x04;
    }
}

impl ConfigDone {
    pub fn both_directions(&self) -> bool {
        self.contains(Self::IB_CFG_DONE | Self::OB_CFG_DONE)
    }
}

/// Quality of Service (QoS) Flow Specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosFlowSpec {
    /// QoS service type
    pub service_type: u8,
    /// Token rate (bytes/second)
    pub token_rate: u32,
    /// Token bucket size (bytes)
    pub token_bucket_size: u32,
    /// Peak bandwidth (bytes/second)
    pub peak_bandwidth: u32,
    /// Latency (microseconds)
    pub latency: u32,
    /// Delay variation (microseconds)
    pub delay_variation: u32,
}

impl Default for QosFlowSpec {
    fn default() -> Self {
        Self {
            service_type: 0x01, // Best effort
            token_rate: 0,
            token_bucket_size: 0,
            peak_bandwidth: 0,
            latency: 0xFFFF_FFFF,
            delay_variation: 0xFFFF_FFFF,
        }
    }
}

/// Retransmission and Flow Control option contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmissionFlowControl {
    pub mode: RetransmissionMode,
    pub tx_window_size: u8,
    pub max_transmit: u8,
    pub retransmit_timeout: u16,
    pub monitor_timeout: u16,
    pub max_pdu_size: u16,
}

impl RetransmissionFlowControl {
    pub fn basic() -> Self {
        Self::for_mode(RetransmissionMode::Basic)
    }

    pub fn for_mode(mode: RetransmissionMode) -> Self {
        match mode {
            RetransmissionMode::Basic => Self {
                mode,
                tx_window_size: 0,
                max_transmit: 0,
                retransmit_timeout: 0,
                monitor_timeout: 0,
                max_pdu_size: 0,
            },
            _ => Self {
                mode,
                tx_window_size: 10,
                max_transmit: 20,
                retransmit_timeout: 2000,
                monitor_timeout: 12000,
                max_pdu_size: 1010,
            },
        }
    }
}

/// Configuration options carried in configuration requests and responses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOptions {
    /// Maximum Transmission Unit
    pub mtu: Option<u16>,
    /// Flush Timeout
    pub flush_timeout: Option<u16>,
    /// Quality of Service
    pub qos: Option<QosFlowSpec>,
    /// Retransmission and Flow Control
    pub retransmission: Option<RetransmissionFlowControl>,
    /// Frame Check Sequence
    pub fcs: Option<u8>,
    /// Extended Window Size
    pub ext_window_size: Option<u16>,
}

impl ConfigOptions {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overlay the options present in `other`
    pub fn merge(&mut self, other: &ConfigOptions) {
        if other.mtu.is_some() {
            self.mtu = other.mtu;
        }
        if other.flush_timeout.is_some() {
            self.flush_timeout = other.flush_timeout;
        }
        if other.qos.is_some() {
            self.qos = other.qos;
        }
        if other.retransmission.is_some() {
            self.retransmission = other.retransmission;
        }
        if other.fcs.is_some() {
            self.fcs = other.fcs;
        }
        if other.ext_window_size.is_some() {
            self.ext_window_size = other.ext_window_size;
        }
    }
}

/// Negotiated configuration of one direction of a classic channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub mtu: u16,
    pub flush_timeout: u16,
    pub mode: RetransmissionMode,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mtu: L2CAP_DEFAULT_MTU,
            flush_timeout: L2CAP_DEFAULT_FLUSH_TIMEOUT,
            mode: RetransmissionMode::Basic,
        }
    }
}

impl ChannelConfig {
    /// Options describing this configuration in a configuration request
    pub fn to_options(&self) -> ConfigOptions {
        ConfigOptions {
            mtu: Some(self.mtu),
            flush_timeout: if self.flush_timeout != L2CAP_DEFAULT_FLUSH_TIMEOUT {
                Some(self.flush_timeout)
            } else {
                None
            },
            retransmission: if self.mode != RetransmissionMode::Basic {
                Some(RetransmissionFlowControl::for_mode(self.mode))
            } else {
                None
            },
            ..ConfigOptions::default()
        }
    }
}

/// Credit based channel parameters for one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditBasedConfig {
    /// Maximum SDU size
    pub mtu: u16,
    /// Maximum PDU (K-frame payload) size
    pub mps: u16,
    /// Credits granted
    pub credits: u16,
}

impl Default for CreditBasedConfig {
    fn default() -> Self {
        Self {
            mtu: L2CAP_ECOC_MIN_MTU,
            mps: L2CAP_ECOC_MIN_MPS,
            credits: 0,
        }
    }
}

/// L2CAP Connection Parameter Update request structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParameterUpdate {
    /// Minimum connection interval (1.25ms units)
    pub conn_interval_min: u16,
    /// Maximum connection interval (1.25ms units)
    pub conn_interval_max: u16,
    /// Peripheral latency (number of events)
    pub conn_latency: u16,
    /// Connection supervision timeout (10ms units)
    pub supervision_timeout: u16,
}

impl ConnectionParameterUpdate {
    /// Validates that the parameters are within acceptable ranges
    pub fn validate(&self) -> bool {
        let interval_ok = self.conn_interval_min >= L2CAP_LE_CONN_INTERVAL_MIN
            && self.conn_interval_max <= L2CAP_LE_CONN_INTERVAL_MAX
            && self.conn_interval_min <= self.conn_interval_max;

        let latency_ok = self.conn_latency <= L2CAP_LE_CONN_LATENCY_MAX;

        let timeout_ok = self.supervision_timeout >= L2CAP_LE_SUPERVISION_TIMEOUT_MIN
            && self.supervision_timeout <= L2CAP_LE_SUPERVISION_TIMEOUT_MAX;

        // Supervision timeout (10ms) must exceed (1 + latency) * interval (1.25ms) * 2
        let relation_ok = (self.supervision_timeout as u32) * 4
            > (self.conn_interval_max as u32) * (self.conn_latency as u32 + 1);

        interval_ok && latency_ok && timeout_ok && relation_ok
    }
}

/// L2CAP Security Level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SecurityLevel {
    /// No security (no authentication, no encryption)
    #[default]
    None = 0,
    /// Authentication required
    Authentication = 1,
    /// Authentication and encryption required
    AuthenticationAndEncryption = 2,
    /// Secure Connections required with encryption
    SecureConnectionsWithEncryption = 3,
}

/// Answer of the security layer to an access request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityStatus {
    Granted,
    /// Decision arrives later through `L2capManager::security_complete`
    Pending,
    Denied,
}

/// Terminal failure reported through `L2capCallbacks::error`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capErrorCode {
    /// The link could not be created or dropped before the channel connected
    AclConnectionFailed,
    /// Security or access control refused the channel
    SecurityBlocked,
    /// A signaling exchange timed out
    Timeout,
    /// The peer refused the connection with the given result code
    ConnectRejected(u16),
    /// Configuration finished with different modes in each direction
    IncompatibleModes,
    /// The peer refused our configuration
    ConfigRejected(u16),
    /// The peer broke the credit or segmentation rules
    PeerProtocolViolation,
    OtherError,
}

/// Result delivered with `L2capCallbacks::disconnect_cfm`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectResult {
    Success,
    Timeout,
    /// No peer channel existed; released locally
    NoLink,
}

/// Outcome of a data write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Every PDU of the SDU went out
    Sent,
    /// Held until the channel opens or credits arrive
    Queued,
}

/// What to do when a peer grants credits beyond the protocol maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreditOverflowPolicy {
    /// Treat it as a protocol violation and disconnect
    #[default]
    Disconnect,
    /// Saturate at the maximum and carry on
    Clamp,
}

/// Tunables of the L2CAP layer
#[derive(Debug, Clone)]
pub struct L2capConfig {
    pub connect_timeout: Duration,
    /// Replaces `connect_timeout` once a pending response is seen or sent
    pub connect_pending_timeout: Duration,
    pub config_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub info_rsp_timeout: Duration,
    pub security_timeout: Duration,
    pub link_idle_timeout: Duration,
    /// Idle timeout used when the last channel failed security
    pub security_failure_idle_timeout: Duration,
    /// Size of the channel control block arena
    pub max_channels: usize,
    /// Credits granted at connect and restored on replenishment
    pub credit_default: u16,
    /// Replenish once the peer holds this many credits or fewer
    pub credit_low_water_mark: u16,
    pub credit_overflow_policy: CreditOverflowPolicy,
    /// Hold queue depth above which writes are refused
    pub xmit_high_water_mark: usize,
    pub max_config_retries: u8,
}

impl Default for L2capConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            connect_pending_timeout: Duration::from_secs(120),
            config_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(10),
            info_rsp_timeout: Duration::from_secs(3),
            security_timeout: Duration::from_secs(60),
            link_idle_timeout: Duration::from_secs(4),
            security_failure_idle_timeout: Duration::from_secs(1),
            max_channels: 32,
            credit_default: 64,
            credit_low_water_mark: 16,
            credit_overflow_policy: CreditOverflowPolicy::Disconnect,
            xmit_high_water_mark: 32,
            max_config_retries: 3,
        }
    }
}
