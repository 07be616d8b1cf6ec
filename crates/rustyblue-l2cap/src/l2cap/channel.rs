//! L2CAP Channel Control Blocks
//!
//! A CCB is the per-channel record the state machine runs on. CCBs live in
//! the manager's arena, indexed by local CID.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::credit::SduReassembly;
use super::link::LinkKey;
use super::registry::Registration;
use super::signaling::SignalId;
use super::types::*;

/// Kind of dynamic channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capChannelType {
    /// Connection-oriented channel on a BR/EDR link
    Classic,
    /// Single LE credit based channel
    LeCreditBased,
    /// Member of an enhanced credit based batch
    EnhancedCreditBased,
}

/// Channel Control Block
pub struct L2capChannel {
    pub local_cid: u16,
    /// Zero until the peer assigns it
    pub remote_cid: u16,
    pub state: L2capChannelState,
    pub channel_type: L2capChannelType,
    pub link: LinkKey,
    pub rcb: Arc<Registration>,
    pub initiator: ConnectionInitiator,
    /// Identifier of the last request we sent on this channel
    pub local_id: SignalId,
    /// Identifier of the peer request awaiting our answer
    pub remote_id: SignalId,

    /// What we asked the peer to respect (our receive side)
    pub our_cfg: ChannelConfig,
    /// What the peer asked us to respect (our send side)
    pub peer_cfg: ChannelConfig,
    pub config_done: ConfigDone,
    pub config_retries: u8,
    /// Peer configuration request options gathered across continuation packets
    pub peer_cfg_accum: ConfigOptions,
    /// Peer configuration response options gathered across continuation packets
    pub cfg_rsp_accum: ConfigOptions,

    /// Our credit based receive parameters; `credits` is what the peer may still send
    pub local_conn_cfg: CreditBasedConfig,
    /// Peer's credit based receive parameters as granted at connect time
    pub peer_conn_cfg: CreditBasedConfig,
    /// Credits left for sending to the peer
    pub remote_credit_count: u16,
    pub reconfig_started: bool,

    /// Outbound payloads held until the channel opens or credits arrive
    pub xmit_hold_q: VecDeque<Vec<u8>>,
    pub congested: bool,
    pub reassembly: SduReassembly,

    pub timer: Option<Instant>,
    /// Connect response waiting for the information exchange
    pub deferred_connect_rsp: bool,
    /// A terminal callback has been delivered; release stays quiet
    pub terminal_sent: bool,
}

impl fmt::Debug for L2capChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2capChannel")
            .field("local_cid", &format_args!("0x{:04X}", self.local_cid))
            .field("remote_cid", &format_args!("0x{:04X}", self.remote_cid))
            .field("state", &self.state)
            .field("channel_type", &self.channel_type)
            .field("psm", &format_args!("0x{:04X}", self.rcb.psm))
            .field("initiator", &self.initiator)
            .field("config_done", &self.config_done)
            .field("remote_credit_count", &self.remote_credit_count)
            .field("queued", &self.xmit_hold_q.len())
            .finish()
    }
}

impl L2capChannel {
    pub fn new(
        local_cid: u16,
        channel_type: L2capChannelType,
        link: LinkKey,
        rcb: Arc<Registration>,
        initiator: ConnectionInitiator,
    ) -> Self {
        let our_cfg = ChannelConfig {
            mtu: rcb.mtu,
            ..ChannelConfig::default()
        };

        Self {
            local_cid,
            remote_cid: 0,
            state: L2capChannelState::Closed,
            channel_type,
            link,
            rcb,
            initiator,
            local_id: 0,
            remote_id: 0,
            our_cfg,
            peer_cfg: ChannelConfig::default(),
            config_done: ConfigDone::empty(),
            config_retries: 0,
            peer_cfg_accum: ConfigOptions::default(),
            cfg_rsp_accum: ConfigOptions::default(),
            local_conn_cfg: CreditBasedConfig::default(),
            peer_conn_cfg: CreditBasedConfig::default(),
            remote_credit_count: 0,
            reconfig_started: false,
            xmit_hold_q: VecDeque::new(),
            congested: false,
            reassembly: SduReassembly::default(),
            timer: None,
            deferred_connect_rsp: false,
            terminal_sent: false,
        }
    }

    pub fn psm(&self) -> u16 {
        self.rcb.psm
    }

    pub fn is_credit_based(&self) -> bool {
        self.channel_type != L2capChannelType::Classic
    }

    pub fn is_ecoc(&self) -> bool {
        self.channel_type == L2capChannelType::EnhancedCreditBased
    }

    pub fn start_timer(&mut self, timeout: Duration) {
        self.timer = Some(Instant::now() + timeout);
    }

    pub fn stop_timer(&mut self) {
        self.timer = None;
    }

    pub fn timer_expired(&self, now: Instant) -> bool {
        matches!(self.timer, Some(deadline) if deadline <= now)
    }
}
