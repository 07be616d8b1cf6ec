//! Link Control Blocks
//!
//! One LCB per peer and transport. It owns the list of channels on the link,
//! the information exchange state and the single outstanding credit based
//! batch.

use std::time::Instant;

use super::packet::L2capPacket;
use super::signaling::SignalId;
use super::types::*;

/// Access request handed to the security layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityRequest {
    pub addr: BdAddr,
    pub psm: u16,
    pub transport: ConnectionType,
    pub is_originator: bool,
    pub local_cid: u16,
    pub level: SecurityLevel,
}

/// Lower layer the L2CAP manager drives: ACL transport, link management
/// and security.
pub trait LinkLayer: Send + Sync {
    /// Transmit one basic L2CAP frame on an ACL or LE link
    fn send_pdu(&self, handle: u16, packet: L2capPacket);

    /// Start creating a link; completion arrives as `link_connected` or `link_connect_failed`
    fn create_link(&self, addr: BdAddr, transport: ConnectionType) -> bool;

    fn disconnect_link(&self, handle: u16, reason: u8);

    /// A `Pending` answer is completed later through `L2capManager::security_complete`
    fn request_security(&self, request: &SecurityRequest) -> SecurityStatus;

    fn update_connection_parameters(&self, handle: u16, params: &ConnectionParameterUpdate) -> bool;
}

/// Links are keyed by peer address and transport
pub type LinkKey = (BdAddr, ConnectionType);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    /// Idle disconnect sent, waiting for the link to go away
    Disconnecting,
}

/// One source CID position of a batch connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcocSlot {
    Live(u16),
    /// Channel released locally before the peer answered
    Released(u16),
    /// Never allocated; the peer is told why in the response
    Refused,
}

impl EcocSlot {
    pub fn live(&self) -> Option<u16> {
        match *self {
            EcocSlot::Live(cid) => Some(cid),
            _ => None,
        }
    }
}

/// Outstanding enhanced credit based connection on a link.
///
/// Slots are positional: slot `i` answers source CID `i` of the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEcocConnection {
    pub identifier: SignalId,
    pub initiator: ConnectionInitiator,
    pub lead_cid: u16,
    pub slots: Vec<EcocSlot>,
    /// Reason reported for slots refused while validating a peer request
    pub refusal_result: Option<u16>,
}

impl PendingEcocConnection {
    pub fn local_cids(&self) -> Vec<u16> {
        self.slots.iter().filter_map(EcocSlot::live).collect()
    }

    pub fn contains(&self, cid: u16) -> bool {
        self.slots.contains(&EcocSlot::Live(cid))
    }
}

/// Outstanding credit based reconfiguration we sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReconfig {
    pub identifier: SignalId,
    pub cids: Vec<u16>,
    pub config: CreditBasedConfig,
}

/// Outcome of removing a channel from its link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRemoved {
    /// No channels remain on the link
    pub last: bool,
    /// The removed channel led a pending batch and this member took over
    pub new_lead: Option<u16>,
}

/// Link Control Block
#[derive(Debug)]
pub struct LinkControlBlock {
    pub addr: BdAddr,
    pub transport: ConnectionType,
    pub handle: Option<u16>,
    pub state: LinkState,
    /// Local CIDs of the channels on this link
    pub ccbs: Vec<u16>,
    /// Extended features request outstanding
    pub w4_info_rsp: bool,
    pub info_req_id: Option<SignalId>,
    pub info_timer: Option<Instant>,
    pub peer_ext_features: u32,
    pub idle_timer: Option<Instant>,
    pub pending_ecoc: Option<PendingEcocConnection>,
    pub pending_reconfig: Option<PendingReconfig>,
    /// A channel failed security; the next idle timeout is shortened
    pub security_failed: bool,
}

impl LinkControlBlock {
    pub fn new(addr: BdAddr, transport: ConnectionType) -> Self {
        Self {
            addr,
            transport,
            handle: None,
            state: LinkState::Connecting,
            ccbs: Vec::new(),
            w4_info_rsp: false,
            info_req_id: None,
            info_timer: None,
            peer_ext_features: 0,
            idle_timer: None,
            pending_ecoc: None,
            pending_reconfig: None,
            security_failed: false,
        }
    }

    pub fn key(&self) -> LinkKey {
        (self.addr, self.transport)
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected && self.handle.is_some()
    }

    pub fn add_channel(&mut self, cid: u16) {
        self.ccbs.push(cid);
        self.idle_timer = None;
    }

    pub fn remove_channel(&mut self, cid: u16) -> ChannelRemoved {
        self.ccbs.retain(|c| *c != cid);
        let new_lead = self.detach_from_batch(cid);
        if let Some(reconfig) = self.pending_reconfig.as_mut() {
            reconfig.cids.retain(|c| *c != cid);
            if reconfig.cids.is_empty() {
                self.pending_reconfig = None;
            }
        }
        ChannelRemoved {
            last: self.ccbs.is_empty(),
            new_lead,
        }
    }

    /// Reserve the link for a batch connection; only one may be outstanding
    pub fn begin_ecoc(&mut self, pending: PendingEcocConnection) -> L2capResult<()> {
        if self.pending_ecoc.is_some() {
            return Err(L2capError::NoResources);
        }
        self.pending_ecoc = Some(pending);
        Ok(())
    }

    /// Batch the channel belongs to, if any
    pub fn ecoc_for(&self, cid: u16) -> Option<&PendingEcocConnection> {
        self.pending_ecoc.as_ref().filter(|p| p.contains(cid))
    }

    /// Drop a released channel from the pending batch, handing the lead to
    /// the next live slot. The batch goes away with its last member.
    fn detach_from_batch(&mut self, cid: u16) -> Option<u16> {
        let pending = self.pending_ecoc.as_mut()?;
        for slot in pending.slots.iter_mut() {
            if *slot == EcocSlot::Live(cid) {
                *slot = EcocSlot::Released(cid);
            }
        }
        if pending.lead_cid != cid {
            return None;
        }
        match pending.slots.iter().find_map(EcocSlot::live) {
            Some(next) => {
                pending.lead_cid = next;
                Some(next)
            }
            None => {
                self.pending_ecoc = None;
                None
            }
        }
    }
}
