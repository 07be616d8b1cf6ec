//! L2CAP Core Manager implementation
//!
//! This module provides the core L2CAP manager that handles:
//! - Service registration
//! - Channel and link control block arenas
//! - Decoding inbound frames into state machine events
//! - The serialized event queue every transition runs from
//! - Timers

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, trace, warn};

use super::channel::{L2capChannel, L2capChannelType};
use super::constants::*;
use super::csm::{CsmEvent, Terminal};
use super::link::{LinkControlBlock, LinkKey, LinkLayer, LinkState};
use super::packet::L2capPacket;
use super::psm::{DynamicPsmAllocator, PSM};
use super::registry::Registration;
use super::signaling::{SignalId, SignalingMessage};
use super::types::*;

/// L2CAP manager.
///
/// Owns every channel and link control block. All state changes happen on
/// the caller's context: API calls and lower layer events enqueue state
/// machine events and drain the queue before returning.
pub struct L2capManager {
    pub(super) config: L2capConfig,
    pub(super) link_layer: Arc<dyn LinkLayer>,
    registrations: HashMap<(ConnectionType, u16), Arc<Registration>>,
    psm_allocator: DynamicPsmAllocator,
    /// CCB arena; slot `i` holds local CID `L2CAP_DYNAMIC_CID_MIN + i`
    channels: Vec<Option<L2capChannel>>,
    next_slot: usize,
    pub(super) links: HashMap<LinkKey, LinkControlBlock>,
    handles: HashMap<u16, LinkKey>,
    events: VecDeque<(u16, CsmEvent)>,
    dispatching: bool,
    next_signal_id: SignalId,
}

impl L2capManager {
    pub fn new(config: L2capConfig, link_layer: Arc<dyn LinkLayer>) -> Self {
        let slots = config
            .max_channels
            .min((L2CAP_DYNAMIC_CID_MAX - L2CAP_DYNAMIC_CID_MIN) as usize + 1);
        let mut channels = Vec::with_capacity(slots);
        channels.resize_with(slots, || None);

        Self {
            config,
            link_layer,
            registrations: HashMap::new(),
            psm_allocator: DynamicPsmAllocator::default(),
            channels,
            next_slot: 0,
            links: HashMap::new(),
            handles: HashMap::new(),
            events: VecDeque::new(),
            dispatching: false,
            next_signal_id: 1,
        }
    }

    pub fn config(&self) -> &L2capConfig {
        &self.config
    }

    // ---- registration ----

    /// Register a service on a PSM
    pub fn register(&mut self, registration: Registration) -> L2capResult<()> {
        registration.validate()?;
        let key = (registration.transport, registration.psm);
        if self.registrations.contains_key(&key) {
            return Err(L2capError::PsmAlreadyRegistered);
        }
        info!(
            "Registered {} on {:?}",
            PSM::from_value(registration.psm),
            registration.transport
        );
        self.registrations.insert(key, Arc::new(registration));
        Ok(())
    }

    /// Remove a registration and disconnect every channel still bound to it
    pub fn deregister(&mut self, transport: ConnectionType, psm: PSM) -> L2capResult<()> {
        let rcb = self
            .registrations
            .remove(&(transport, psm.value()))
            .ok_or(L2capError::PsmNotRegistered)?;
        info!("Deregistered {} on {:?}", psm, transport);

        let bound: Vec<u16> = self
            .channels
            .iter()
            .flatten()
            .filter(|ccb| Arc::ptr_eq(&ccb.rcb, &rcb))
            .map(|ccb| ccb.local_cid)
            .collect();
        for cid in bound {
            self.post(cid, CsmEvent::ApiDisconnectReq);
        }
        Ok(())
    }

    pub fn is_registered(&self, transport: ConnectionType, psm: u16) -> bool {
        self.registrations.contains_key(&(transport, psm))
    }

    pub(super) fn registration(
        &self,
        transport: ConnectionType,
        psm: u16,
    ) -> Option<Arc<Registration>> {
        self.registrations.get(&(transport, psm)).cloned()
    }

    /// Obtain an unused dynamic PSM for a service about to register
    pub fn obtain_dynamic_psm(&mut self, transport: ConnectionType) -> L2capResult<PSM> {
        loop {
            let psm = self
                .psm_allocator
                .obtain(transport)
                .ok_or(L2capError::NoResources)?;
            if !self.is_registered(transport, psm.value()) {
                return Ok(psm);
            }
        }
    }

    pub fn free_dynamic_psm(&mut self, psm: PSM) {
        self.psm_allocator.free(psm);
    }

    // ---- local API ----

    /// Open a classic channel to a peer; completion arrives through the callbacks
    pub fn connect_req(&mut self, psm: PSM, addr: BdAddr) -> L2capResult<u16> {
        let rcb = self
            .registration(ConnectionType::Classic, psm.value())
            .ok_or(L2capError::PsmNotRegistered)?;
        let cid = self.create_local_channel(addr, rcb, L2capChannelType::Classic)?;
        self.post(cid, CsmEvent::ApiConnectReq);
        Ok(cid)
    }

    /// Open a single LE credit based channel
    pub fn le_connect_req(&mut self, psm: PSM, addr: BdAddr) -> L2capResult<u16> {
        let rcb = self
            .registration(ConnectionType::LE, psm.value())
            .ok_or(L2capError::PsmNotRegistered)?;
        let cid = self.create_local_channel(addr, rcb, L2capChannelType::LeCreditBased)?;
        self.post(cid, CsmEvent::ApiConnectReq);
        Ok(cid)
    }

    /// Open up to five enhanced credit based channels in one request.
    ///
    /// Returns the CIDs actually allocated, which may be fewer than asked
    /// for. Each of them later receives one `credit_based_connect_cfm` or
    /// terminal error.
    pub fn credit_based_connect_req(
        &mut self,
        psm: PSM,
        addr: BdAddr,
        count: usize,
    ) -> L2capResult<Vec<u16>> {
        let rcb = self
            .registration(ConnectionType::LE, psm.value())
            .ok_or(L2capError::PsmNotRegistered)?;
        if count == 0 || count > L2CAP_CREDIT_BASED_MAX_CIDS {
            return Err(L2capError::InvalidParameter(format!(
                "{} channels requested, 1-{} allowed",
                count, L2CAP_CREDIT_BASED_MAX_CIDS
            )));
        }
        if rcb.le_mtu < L2CAP_ECOC_MIN_MTU || rcb.le_mps < L2CAP_ECOC_MIN_MPS {
            return Err(L2capError::InvalidParameter(
                "registration MTU/MPS below enhanced credit based minimum".into(),
            ));
        }
        let key = (addr, ConnectionType::LE);
        if self
            .links
            .get(&key)
            .is_some_and(|lcb| lcb.pending_ecoc.is_some())
        {
            return Err(L2capError::NoResources);
        }

        let lead = self.create_local_channel(addr, rcb, L2capChannelType::EnhancedCreditBased)?;
        let cids = self.begin_local_batch(key, lead, count);
        self.post(lead, CsmEvent::ApiConnectReq);
        Ok(cids)
    }

    /// Answer a `connect_ind`
    pub fn connect_rsp(&mut self, local_cid: u16, result: u16) -> L2capResult<()> {
        self.expect_state(local_cid, &[L2capChannelState::WaitLocalConnectRsp])?;
        let event = if result == L2CAP_CONN_SUCCESS {
            CsmEvent::ApiConnectRsp
        } else {
            CsmEvent::ApiConnectRspNeg { result }
        };
        self.post(local_cid, event);
        Ok(())
    }

    /// Answer a `credit_based_connect_ind`. Candidates missing from
    /// `accepted` are refused.
    pub fn credit_based_connect_rsp(
        &mut self,
        addr: BdAddr,
        identifier: SignalId,
        accepted: &[u16],
        result: u16,
    ) -> L2capResult<()> {
        let lead = self
            .links
            .get(&(addr, ConnectionType::LE))
            .and_then(|lcb| lcb.pending_ecoc.as_ref())
            .filter(|p| p.initiator == ConnectionInitiator::Remote && p.identifier == identifier)
            .map(|p| p.lead_cid)
            .ok_or(L2capError::ChannelNotFound)?;
        self.expect_state(lead, &[L2capChannelState::WaitLocalConnectRsp])?;
        self.post(
            lead,
            CsmEvent::ApiCreditBasedConnectRsp {
                accepted: accepted.to_vec(),
                result,
            },
        );
        Ok(())
    }

    /// Send (or resend) our configuration on a classic channel
    pub fn config_req(&mut self, local_cid: u16, options: ConfigOptions) -> L2capResult<()> {
        let ccb = self.ccb(local_cid).ok_or(L2capError::ChannelNotFound)?;
        if ccb.channel_type != L2capChannelType::Classic {
            return Err(L2capError::NotSupported);
        }
        self.expect_state(
            local_cid,
            &[L2capChannelState::Config, L2capChannelState::Open],
        )?;
        if matches!(options.mtu, Some(mtu) if mtu < L2CAP_MIN_MTU) {
            return Err(L2capError::InvalidParameter(format!(
                "MTU below minimum {}",
                L2CAP_MIN_MTU
            )));
        }
        self.post(local_cid, CsmEvent::ApiConfigReq(options));
        Ok(())
    }

    /// Disconnect a channel. Fails without side effects if it is already gone.
    pub fn disconnect_req(&mut self, local_cid: u16) -> L2capResult<()> {
        if self.ccb(local_cid).is_none() {
            return Err(L2capError::ChannelNotFound);
        }
        self.post(local_cid, CsmEvent::ApiDisconnectReq);
        Ok(())
    }

    /// Confirm a `disconnect_ind` that required confirmation
    pub fn disconnect_rsp(&mut self, local_cid: u16) -> L2capResult<()> {
        self.expect_state(local_cid, &[L2capChannelState::WaitLocalDisconnectRsp])?;
        self.post(local_cid, CsmEvent::ApiDisconnectRsp);
        Ok(())
    }

    /// Send an SDU. Classic channels hold data until they open; credit based
    /// channels hold K-frames until credits arrive.
    pub fn data_write(&mut self, local_cid: u16, data: &[u8]) -> L2capResult<WriteStatus> {
        let ccb = self.ccb(local_cid).ok_or(L2capError::ChannelNotFound)?;

        if ccb.is_credit_based() {
            if ccb.state != L2capChannelState::Open {
                return Err(L2capError::InvalidState(ccb.state));
            }
            if data.len() > ccb.peer_conn_cfg.mtu as usize {
                return Err(L2capError::MtuExceeded {
                    len: data.len(),
                    mtu: ccb.peer_conn_cfg.mtu,
                });
            }
        } else {
            match ccb.state {
                L2capChannelState::WaitPeerDisconnectRsp
                | L2capChannelState::WaitLocalDisconnectRsp
                | L2capChannelState::TermWaitSecurity
                | L2capChannelState::WaitLocalConnectRsp => {
                    return Err(L2capError::InvalidState(ccb.state))
                }
                _ => {}
            }
            if ccb.our_cfg.mode != RetransmissionMode::Basic {
                return Err(L2capError::NotSupported);
            }
            if data.len() > ccb.peer_cfg.mtu as usize {
                return Err(L2capError::MtuExceeded {
                    len: data.len(),
                    mtu: ccb.peer_cfg.mtu,
                });
            }
        }

        if ccb.xmit_hold_q.len() >= self.config.xmit_high_water_mark {
            return Err(L2capError::Congested);
        }

        self.post(local_cid, CsmEvent::ApiDataWrite(data.to_vec()));

        match self.ccb(local_cid) {
            Some(ccb) if !ccb.xmit_hold_q.is_empty() => Ok(WriteStatus::Queued),
            _ => Ok(WriteStatus::Sent),
        }
    }

    /// Grant the peer additional credits on a credit based channel
    pub fn send_flow_control_credit(&mut self, local_cid: u16, credits: u16) -> L2capResult<()> {
        let ccb = self.ccb(local_cid).ok_or(L2capError::ChannelNotFound)?;
        if !ccb.is_credit_based() {
            return Err(L2capError::NotSupported);
        }
        if ccb.state != L2capChannelState::Open {
            return Err(L2capError::InvalidState(ccb.state));
        }
        if credits == 0 || ccb.local_conn_cfg.credits.checked_add(credits).is_none() {
            return Err(L2capError::InvalidParameter(format!(
                "cannot grant {} credits",
                credits
            )));
        }
        self.post(local_cid, CsmEvent::ApiSendCredit(credits));
        Ok(())
    }

    /// Complete a security request that was answered `Pending`
    pub fn security_complete(&mut self, local_cid: u16, granted: bool) -> L2capResult<()> {
        self.expect_state(
            local_cid,
            &[
                L2capChannelState::OrigWaitSecurity,
                L2capChannelState::TermWaitSecurity,
            ],
        )?;
        let event = if granted {
            CsmEvent::SecurityComplete
        } else {
            CsmEvent::SecurityCompleteNeg
        };
        self.post(local_cid, event);
        Ok(())
    }

    // ---- accessors ----

    pub fn channel(&self, local_cid: u16) -> Option<&L2capChannel> {
        self.ccb(local_cid)
    }

    pub fn channel_state(&self, local_cid: u16) -> Option<L2capChannelState> {
        self.ccb(local_cid).map(|ccb| ccb.state)
    }

    pub fn link(&self, addr: BdAddr, transport: ConnectionType) -> Option<&LinkControlBlock> {
        self.links.get(&(addr, transport))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.iter().flatten().count()
    }

    // ---- lower layer events ----

    /// An ACL or LE link came up
    pub fn link_connected(&mut self, addr: BdAddr, transport: ConnectionType, handle: u16) {
        let key = (addr, transport);
        info!("Link to {} up on {:?}, handle 0x{:04X}", addr, transport, handle);

        let lcb = self
            .links
            .entry(key)
            .or_insert_with(|| LinkControlBlock::new(addr, transport));
        lcb.handle = Some(handle);
        lcb.state = LinkState::Connected;
        self.handles.insert(handle, key);

        if transport == ConnectionType::Classic {
            let id = self.allocate_signal_id();
            let info_timeout = self.config.info_rsp_timeout;
            if let Some(lcb) = self.links.get_mut(&key) {
                lcb.w4_info_rsp = true;
                lcb.info_req_id = Some(id);
                lcb.info_timer = Some(Instant::now() + info_timeout);
            }
            self.send_signal(
                key,
                SignalingMessage::InformationRequest {
                    identifier: id,
                    info_type: L2CAP_INFO_EXTENDED_FEATURES,
                },
            );
        }

        let cids = self.link_channels(key);
        if cids.is_empty() {
            self.arm_idle_timer(key, self.config.link_idle_timeout);
        }
        for cid in cids {
            self.post(cid, CsmEvent::LinkConnectCfm);
        }
    }

    /// Link creation failed
    pub fn link_connect_failed(&mut self, addr: BdAddr, transport: ConnectionType) {
        let key = (addr, transport);
        warn!("Link to {} on {:?} failed", addr, transport);
        for cid in self.link_channels(key) {
            self.post(cid, CsmEvent::LinkConnectCfmNeg);
        }
        self.links.remove(&key);
    }

    /// The link went down; every channel on it is released
    pub fn link_disconnected(&mut self, handle: u16, reason: u8) {
        let Some(key) = self.handles.remove(&handle) else {
            debug!("Disconnect for unknown handle 0x{:04X}", handle);
            return;
        };
        info!(
            "Link to {} down, handle 0x{:04X} reason 0x{:02X}",
            key.0, handle, reason
        );
        if let Some(lcb) = self.links.get_mut(&key) {
            lcb.state = LinkState::Disconnecting;
        }
        for cid in self.link_channels(key) {
            self.post(cid, CsmEvent::LinkDisconnectInd);
        }
        self.links.remove(&key);
    }

    /// Inbound ACL payload carrying one basic L2CAP frame
    pub fn handle_acl_data(&mut self, handle: u16, data: &[u8]) -> L2capResult<()> {
        let key = *self.handles.get(&handle).ok_or(L2capError::NoLink)?;
        let packet = L2capPacket::parse(data)?;
        let cid = packet.channel_id();

        if cid == key.1.signaling_cid() {
            self.handle_signaling(key, &packet.payload);
            return Ok(());
        }

        if cid >= L2CAP_DYNAMIC_CID_MIN {
            match self.ccb(cid) {
                Some(ccb) if ccb.link == key => {
                    self.post(cid, CsmEvent::PeerData(packet.payload));
                }
                _ => debug!("Dropping {} bytes for unknown CID 0x{:04X}", data.len(), cid),
            }
            return Ok(());
        }

        debug!("Ignoring frame on fixed CID 0x{:04X}", cid);
        Ok(())
    }

    /// Process expired channel and link timers
    pub fn process_timeouts(&mut self, now: Instant) {
        let expired: Vec<u16> = self
            .channels
            .iter()
            .flatten()
            .filter(|ccb| ccb.timer_expired(now))
            .map(|ccb| ccb.local_cid)
            .collect();

        for cid in expired {
            if let Some(ccb) = self.ccb_mut(cid) {
                ccb.stop_timer();
            }
            debug!("Timer expired on CID 0x{:04X}", cid);
            self.post(cid, CsmEvent::Timeout);
        }

        let info_expired: Vec<LinkKey> = self
            .links
            .values()
            .filter(|lcb| matches!(lcb.info_timer, Some(t) if t <= now))
            .map(|lcb| lcb.key())
            .collect();
        for key in info_expired {
            warn!("Information response from {} timed out", key.0);
            self.info_exchange_complete(key, 0);
        }

        let idle_expired: Vec<LinkKey> = self
            .links
            .values()
            .filter(|lcb| matches!(lcb.idle_timer, Some(t) if t <= now))
            .map(|lcb| lcb.key())
            .collect();
        for key in idle_expired {
            let Some(lcb) = self.links.get_mut(&key) else {
                continue;
            };
            lcb.idle_timer = None;
            if !lcb.ccbs.is_empty() || !lcb.is_connected() {
                continue;
            }
            if let Some(handle) = lcb.handle {
                info!("Link to {} idle, disconnecting", key.0);
                lcb.state = LinkState::Disconnecting;
                self.link_layer.disconnect_link(handle, HCI_ERR_PEER_USER);
            }
        }
    }

    // ---- signaling ----

    fn handle_signaling(&mut self, key: LinkKey, payload: &[u8]) {
        trace!("signaling rx from {}: {}", key.0, hex::encode(payload));

        for command in SignalingMessage::parse_all(payload) {
            match command {
                Ok(message) => {
                    debug!("Received {:?}", message);
                    self.handle_command(key, message);
                }
                Err(err) => {
                    warn!(
                        "Bad signaling command 0x{:02X} id {}: {}",
                        err.code, err.identifier, err.error
                    );
                    if err.code != L2CAP_COMMAND_REJECT {
                        self.send_command_reject(key, err.identifier, L2CAP_REJECT_NOT_UNDERSTOOD, &[]);
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, key: LinkKey, message: SignalingMessage) {
        let le = key.1 == ConnectionType::LE;

        match message {
            SignalingMessage::CommandReject {
                identifier, reason, ..
            } => self.handle_command_reject(key, identifier, reason),

            SignalingMessage::ConnectionRequest {
                identifier,
                psm,
                source_cid,
            } if !le => self.handle_connection_request(key, identifier, psm, source_cid),

            SignalingMessage::ConnectionResponse {
                destination_cid,
                source_cid,
                result,
                ..
            } if !le => {
                let Some(cid) = self.find_on_link(key, |ccb| ccb.local_cid == source_cid) else {
                    debug!("Connection response for unknown CID 0x{:04X}", source_cid);
                    return;
                };
                let event = match result {
                    L2CAP_CONN_SUCCESS => CsmEvent::PeerConnectRsp {
                        remote_cid: destination_cid,
                    },
                    L2CAP_CONN_PENDING => CsmEvent::PeerConnectRspPending {
                        remote_cid: destination_cid,
                    },
                    _ => CsmEvent::PeerConnectRspNeg { result },
                };
                self.post(cid, event);
            }

            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid,
                flags,
                options,
                unknown_options,
            } if !le => match self.find_on_link(key, |ccb| ccb.local_cid == destination_cid) {
                Some(cid) => self.post(
                    cid,
                    CsmEvent::PeerConfigReq {
                        identifier,
                        flags,
                        options,
                        unknown_options,
                    },
                ),
                None => self.reject_invalid_cid(key, identifier, destination_cid, 0),
            },

            SignalingMessage::ConfigureResponse {
                source_cid,
                flags,
                result,
                options,
                ..
            } if !le => match self.find_on_link(key, |ccb| ccb.local_cid == source_cid) {
                Some(cid) => self.post(
                    cid,
                    CsmEvent::PeerConfigRsp {
                        flags,
                        result,
                        options,
                    },
                ),
                None => debug!("Configure response for unknown CID 0x{:04X}", source_cid),
            },

            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid,
                source_cid,
            } => {
                let found = self.find_on_link(key, |ccb| {
                    ccb.local_cid == destination_cid && ccb.remote_cid == source_cid
                });
                match found {
                    Some(cid) => self.post(cid, CsmEvent::PeerDisconnectReq { identifier }),
                    None => self.reject_invalid_cid(key, identifier, destination_cid, source_cid),
                }
            }

            SignalingMessage::DisconnectionResponse { source_cid, .. } => {
                match self.find_on_link(key, |ccb| ccb.local_cid == source_cid) {
                    Some(cid) => self.post(cid, CsmEvent::PeerDisconnectRsp),
                    None => debug!("Disconnection response for unknown CID 0x{:04X}", source_cid),
                }
            }

            SignalingMessage::EchoRequest { identifier, data } if !le => {
                self.send_signal(key, SignalingMessage::EchoResponse { identifier, data });
            }

            SignalingMessage::EchoResponse { identifier, .. } if !le => {
                debug!("Echo response id {}", identifier);
            }

            SignalingMessage::InformationRequest {
                identifier,
                info_type,
            } if !le => self.handle_information_request(key, identifier, info_type),

            SignalingMessage::InformationResponse {
                identifier,
                info_type,
                result,
                data,
            } if !le => {
                let expected = self
                    .links
                    .get(&key)
                    .is_some_and(|lcb| lcb.info_req_id == Some(identifier));
                if !expected {
                    debug!("Unsolicited information response id {}", identifier);
                    return;
                }
                let features = if result == L2CAP_INFO_SUCCESS
                    && info_type == L2CAP_INFO_EXTENDED_FEATURES
                    && data.len() >= 4
                {
                    LittleEndian::read_u32(&data)
                } else {
                    0
                };
                self.info_exchange_complete(key, features);
            }

            SignalingMessage::ConnectionParameterUpdateRequest { identifier, params } if le => {
                self.handle_connection_parameter_update(key, identifier, params);
            }

            SignalingMessage::ConnectionParameterUpdateResponse { result, .. } if le => {
                debug!("Connection parameter update result {}", result);
            }

            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier,
                le_psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
            } if le => self.handle_le_connection_request(
                key,
                identifier,
                le_psm,
                source_cid,
                CreditBasedConfig {
                    mtu,
                    mps,
                    credits: initial_credits,
                },
            ),

            SignalingMessage::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
            } if le => {
                let found = self.find_on_link(key, |ccb| {
                    ccb.channel_type == L2capChannelType::LeCreditBased
                        && ccb.local_id == identifier
                        && ccb.state == L2capChannelState::WaitPeerConnectRsp
                });
                match found {
                    Some(cid) => self.post(
                        cid,
                        CsmEvent::PeerCreditBasedConnectRsp {
                            result,
                            peer_cfg: CreditBasedConfig {
                                mtu,
                                mps,
                                credits: initial_credits,
                            },
                            destination_cids: vec![destination_cid],
                        },
                    ),
                    None => debug!("LE connection response id {} matches no channel", identifier),
                }
            }

            SignalingMessage::FlowControlCredit { cid, credits, .. } => {
                match self.find_on_link(key, |ccb| ccb.is_credit_based() && ccb.remote_cid == cid) {
                    Some(local) => self.post(local, CsmEvent::PeerFlowControlCredit { credits }),
                    None => debug!("Credits for unknown remote CID 0x{:04X}", cid),
                }
            }

            SignalingMessage::CreditBasedConnectionRequest {
                identifier,
                spsm,
                mtu,
                mps,
                initial_credits,
                source_cids,
            } if le => self.handle_credit_based_connection_request(
                key,
                identifier,
                spsm,
                CreditBasedConfig {
                    mtu,
                    mps,
                    credits: initial_credits,
                },
                source_cids,
            ),

            SignalingMessage::CreditBasedConnectionResponse {
                identifier,
                mtu,
                mps,
                initial_credits,
                result,
                destination_cids,
            } if le => {
                let lead = self
                    .links
                    .get(&key)
                    .and_then(|lcb| lcb.pending_ecoc.as_ref())
                    .filter(|p| {
                        p.initiator == ConnectionInitiator::Local && p.identifier == identifier
                    })
                    .map(|p| p.lead_cid);
                match lead {
                    Some(lead) => self.post(
                        lead,
                        CsmEvent::PeerCreditBasedConnectRsp {
                            result,
                            peer_cfg: CreditBasedConfig {
                                mtu,
                                mps,
                                credits: initial_credits,
                            },
                            destination_cids,
                        },
                    ),
                    None => debug!("Credit based connection response id {} unexpected", identifier),
                }
            }

            SignalingMessage::CreditBasedReconfigureRequest {
                identifier,
                mtu,
                mps,
                destination_cids,
            } if le => self.handle_credit_based_reconfig_request(
                key,
                identifier,
                mtu,
                mps,
                destination_cids,
            ),

            SignalingMessage::CreditBasedReconfigureResponse { identifier, result } if le => {
                self.handle_credit_based_reconfig_response(key, identifier, result);
            }

            other => {
                warn!("{:?} not valid on {:?} link", other, key.1);
                if !is_response(&other) {
                    self.send_command_reject(
                        key,
                        other.identifier(),
                        L2CAP_REJECT_NOT_UNDERSTOOD,
                        &[],
                    );
                }
            }
        }
    }

    fn handle_command_reject(&mut self, key: LinkKey, identifier: SignalId, reason: u16) {
        warn!("Peer rejected command id {} reason {}", identifier, reason);

        let info_pending = self
            .links
            .get(&key)
            .is_some_and(|lcb| lcb.info_req_id == Some(identifier));
        if info_pending {
            self.info_exchange_complete(key, 0);
            return;
        }

        let reconfig_pending = self
            .links
            .get(&key)
            .and_then(|lcb| lcb.pending_reconfig.as_ref())
            .is_some_and(|p| p.identifier == identifier);
        if reconfig_pending {
            self.handle_credit_based_reconfig_response(
                key,
                identifier,
                L2CAP_RECONFIG_UNACCEPTABLE_PARAMETERS,
            );
            return;
        }

        match self.find_on_link(key, |ccb| ccb.local_id != 0 && ccb.local_id == identifier) {
            Some(cid) => self.post(cid, CsmEvent::PeerCommandReject { reason }),
            None => debug!("Reject id {} matches no request", identifier),
        }
    }

    fn handle_connection_request(
        &mut self,
        key: LinkKey,
        identifier: SignalId,
        psm: u16,
        source_cid: u16,
    ) {
        let refuse = |mgr: &mut Self, result: u16| {
            mgr.send_signal(
                key,
                SignalingMessage::ConnectionResponse {
                    identifier,
                    destination_cid: 0,
                    source_cid,
                    result,
                    status: L2CAP_CONN_STATUS_NO_INFO,
                },
            );
        };

        let Some(rcb) = self.registration(ConnectionType::Classic, psm) else {
            warn!("Connection request for unregistered PSM 0x{:04X}", psm);
            refuse(self, L2CAP_CONN_NO_PSM);
            return;
        };
        if source_cid < L2CAP_DYNAMIC_CID_MIN {
            refuse(self, L2CAP_CONN_INVALID_SOURCE_CID);
            return;
        }
        if self.find_on_link(key, |ccb| ccb.remote_cid == source_cid).is_some() {
            refuse(self, L2CAP_CONN_SOURCE_CID_ALREADY_ALLOCATED);
            return;
        }
        let cid = match self.allocate_ccb(key, rcb, L2capChannelType::Classic, ConnectionInitiator::Remote) {
            Ok(cid) => cid,
            Err(_) => {
                refuse(self, L2CAP_CONN_NO_RESOURCES);
                return;
            }
        };
        if let Some(ccb) = self.ccb_mut(cid) {
            ccb.remote_cid = source_cid;
            ccb.remote_id = identifier;
        }
        self.post(cid, CsmEvent::PeerConnectReq);
    }

    fn handle_le_connection_request(
        &mut self,
        key: LinkKey,
        identifier: SignalId,
        le_psm: u16,
        source_cid: u16,
        peer_cfg: CreditBasedConfig,
    ) {
        let refuse = |mgr: &mut Self, result: u16| {
            mgr.send_signal(
                key,
                SignalingMessage::LeCreditBasedConnectionResponse {
                    identifier,
                    destination_cid: 0,
                    mtu: 0,
                    mps: 0,
                    initial_credits: 0,
                    result,
                },
            );
        };

        let Some(rcb) = self.registration(ConnectionType::LE, le_psm) else {
            warn!("LE connection request for unregistered SPSM 0x{:04X}", le_psm);
            refuse(self, L2CAP_LE_RESULT_SPSM_NOT_SUPPORTED);
            return;
        };
        if peer_cfg.mtu < L2CAP_LE_MIN_MTU
            || peer_cfg.mps < L2CAP_LE_MIN_MPS
            || peer_cfg.mps > L2CAP_LE_MAX_MPS
        {
            refuse(self, L2CAP_LE_RESULT_UNACCEPTABLE_PARAMETERS);
            return;
        }
        if !(L2CAP_DYNAMIC_CID_MIN..=L2CAP_LE_DYNAMIC_CID_MAX).contains(&source_cid) {
            refuse(self, L2CAP_LE_RESULT_INVALID_SOURCE_CID);
            return;
        }
        if self.find_on_link(key, |ccb| ccb.remote_cid == source_cid).is_some() {
            refuse(self, L2CAP_LE_RESULT_SOURCE_CID_ALREADY_ALLOCATED);
            return;
        }
        let credits = self.config.credit_default;
        let cid = match self.allocate_ccb(
            key,
            rcb.clone(),
            L2capChannelType::LeCreditBased,
            ConnectionInitiator::Remote,
        ) {
            Ok(cid) => cid,
            Err(_) => {
                refuse(self, L2CAP_LE_RESULT_NO_RESOURCES);
                return;
            }
        };
        if let Some(ccb) = self.ccb_mut(cid) {
            ccb.remote_cid = source_cid;
            ccb.remote_id = identifier;
            ccb.peer_conn_cfg = peer_cfg;
            ccb.remote_credit_count = peer_cfg.credits;
            ccb.local_conn_cfg = rcb.local_credit_config(credits);
        }
        self.post(cid, CsmEvent::PeerConnectReq);
    }

    fn handle_information_request(&mut self, key: LinkKey, identifier: SignalId, info_type: u16) {
        let (result, data) = match info_type {
            L2CAP_INFO_CONNECTIONLESS_MTU => {
                (L2CAP_INFO_SUCCESS, L2CAP_DEFAULT_MTU.to_le_bytes().to_vec())
            }
            L2CAP_INFO_EXTENDED_FEATURES => (
                L2CAP_INFO_SUCCESS,
                L2CAP_EXTFEA_FIXED_CHNLS.to_le_bytes().to_vec(),
            ),
            L2CAP_INFO_FIXED_CHANNELS => (
                L2CAP_INFO_SUCCESS,
                L2CAP_FIXED_CHANNELS_SUPPORTED.to_le_bytes().to_vec(),
            ),
            _ => (L2CAP_INFO_NOT_SUPPORTED, Vec::new()),
        };
        self.send_signal(
            key,
            SignalingMessage::InformationResponse {
                identifier,
                info_type,
                result,
                data,
            },
        );
    }

    fn handle_connection_parameter_update(
        &mut self,
        key: LinkKey,
        identifier: SignalId,
        params: ConnectionParameterUpdate,
    ) {
        let handle = self.links.get(&key).and_then(|lcb| lcb.handle);
        let accepted = params.validate()
            && handle.is_some_and(|h| self.link_layer.update_connection_parameters(h, &params));
        let result = if accepted {
            L2CAP_CONN_PARAM_UPDATE_ACCEPTED
        } else {
            warn!("Rejecting connection parameters {:?}", params);
            L2CAP_CONN_PARAM_UPDATE_REJECTED
        };
        self.send_signal(
            key,
            SignalingMessage::ConnectionParameterUpdateResponse { identifier, result },
        );
    }

    /// Information exchange finished: by response, reject or timeout
    fn info_exchange_complete(&mut self, key: LinkKey, features: u32) {
        let Some(lcb) = self.links.get_mut(&key) else {
            return;
        };
        if !lcb.w4_info_rsp {
            return;
        }
        lcb.w4_info_rsp = false;
        lcb.info_req_id = None;
        lcb.info_timer = None;
        lcb.peer_ext_features = features;
        debug!("Peer {} extended features 0x{:08X}", key.0, features);

        for cid in self.link_channels(key) {
            self.post(cid, CsmEvent::InfoRsp);
        }
    }

    pub(super) fn send_command_reject(
        &mut self,
        key: LinkKey,
        identifier: SignalId,
        reason: u16,
        data: &[u8],
    ) {
        self.send_signal(
            key,
            SignalingMessage::CommandReject {
                identifier,
                reason,
                data: data.to_vec(),
            },
        );
    }

    fn reject_invalid_cid(&mut self, key: LinkKey, identifier: SignalId, local: u16, remote: u16) {
        let mut data = local.to_le_bytes().to_vec();
        data.extend_from_slice(&remote.to_le_bytes());
        self.send_command_reject(key, identifier, L2CAP_REJECT_INVALID_CID, &data);
    }

    /// Encode and transmit a signaling command on the link's signaling channel
    pub(super) fn send_signal(&mut self, key: LinkKey, message: SignalingMessage) {
        let Some(handle) = self.links.get(&key).and_then(|lcb| lcb.handle) else {
            warn!("No link to {} for {:?}", key.0, message);
            return;
        };
        let packet = message.to_packet(key.1);
        debug!("Sending {:?}", message);
        trace!("signaling tx to {}: {}", key.0, hex::encode(&packet.payload));
        self.link_layer.send_pdu(handle, packet);
    }

    /// Transmit a data frame on a channel's remote CID
    pub(super) fn send_frame(&mut self, key: LinkKey, remote_cid: u16, payload: Vec<u8>) {
        let Some(handle) = self.links.get(&key).and_then(|lcb| lcb.handle) else {
            warn!("No link to {} for data on CID 0x{:04X}", key.0, remote_cid);
            return;
        };
        trace!("data tx CID 0x{:04X}: {}", remote_cid, hex::encode(&payload));
        self.link_layer.send_pdu(handle, L2capPacket::new(remote_cid, payload));
    }

    /// Allocate the next signal identifier
    pub(super) fn allocate_signal_id(&mut self) -> SignalId {
        let id = self.next_signal_id;
        self.next_signal_id = self.next_signal_id.wrapping_add(1);
        if self.next_signal_id == 0 {
            self.next_signal_id = 1; // Skip 0
        }
        id
    }

    // ---- arenas ----

    pub(super) fn ccb(&self, cid: u16) -> Option<&L2capChannel> {
        let slot = cid.checked_sub(L2CAP_DYNAMIC_CID_MIN)? as usize;
        self.channels.get(slot)?.as_ref()
    }

    pub(super) fn ccb_mut(&mut self, cid: u16) -> Option<&mut L2capChannel> {
        let slot = cid.checked_sub(L2CAP_DYNAMIC_CID_MIN)? as usize;
        self.channels.get_mut(slot)?.as_mut()
    }

    pub(super) fn link_channels(&self, key: LinkKey) -> Vec<u16> {
        self.links
            .get(&key)
            .map(|lcb| lcb.ccbs.clone())
            .unwrap_or_default()
    }

    pub(super) fn find_on_link<F>(&self, key: LinkKey, pred: F) -> Option<u16>
    where
        F: Fn(&L2capChannel) -> bool,
    {
        self.links
            .get(&key)?
            .ccbs
            .iter()
            .copied()
            .find(|cid| self.ccb(*cid).is_some_and(&pred))
    }

    fn expect_state(&self, cid: u16, allowed: &[L2capChannelState]) -> L2capResult<()> {
        let ccb = self.ccb(cid).ok_or(L2capError::ChannelNotFound)?;
        if allowed.contains(&ccb.state) {
            Ok(())
        } else {
            Err(L2capError::InvalidState(ccb.state))
        }
    }

    /// Allocate a CCB on a link, round robin over the arena
    pub(super) fn allocate_ccb(
        &mut self,
        key: LinkKey,
        rcb: Arc<Registration>,
        channel_type: L2capChannelType,
        initiator: ConnectionInitiator,
    ) -> L2capResult<u16> {
        if !self.links.contains_key(&key) {
            return Err(L2capError::NoLink);
        }
        let limit = match key.1 {
            ConnectionType::LE => L2CAP_LE_DYNAMIC_CID_MAX,
            ConnectionType::Classic => L2CAP_DYNAMIC_CID_MAX,
        };
        let slots = self.channels.len();

        for step in 0..slots {
            let slot = (self.next_slot + step) % slots;
            let cid = L2CAP_DYNAMIC_CID_MIN + slot as u16;
            if cid > limit || self.channels[slot].is_some() {
                continue;
            }
            self.next_slot = (slot + 1) % slots;
            self.channels[slot] = Some(L2capChannel::new(cid, channel_type, key, rcb, initiator));
            if let Some(lcb) = self.links.get_mut(&key) {
                lcb.add_channel(cid);
            }
            debug!("Allocated CID 0x{:04X} on {} ({:?})", cid, key.0, channel_type);
            return Ok(cid);
        }

        warn!("No free channel control blocks");
        Err(L2capError::NoResources)
    }

    /// Create a locally initiated channel, bringing the link up if needed
    fn create_local_channel(
        &mut self,
        addr: BdAddr,
        rcb: Arc<Registration>,
        channel_type: L2capChannelType,
    ) -> L2capResult<u16> {
        let transport = rcb.transport;
        let key = (addr, transport);
        let new_link = !self.links.contains_key(&key);
        if new_link {
            self.links.insert(key, LinkControlBlock::new(addr, transport));
        }

        let credits = self.config.credit_default;
        let cid = match self.allocate_ccb(key, rcb.clone(), channel_type, ConnectionInitiator::Local) {
            Ok(cid) => cid,
            Err(e) => {
                if new_link {
                    self.links.remove(&key);
                }
                return Err(e);
            }
        };
        if let Some(ccb) = self.ccb_mut(cid) {
            if ccb.is_credit_based() {
                ccb.local_conn_cfg = rcb.local_credit_config(credits);
            }
        }

        if new_link && !self.link_layer.create_link(addr, transport) {
            warn!("Could not start link to {}", addr);
            self.channels[(cid - L2CAP_DYNAMIC_CID_MIN) as usize] = None;
            self.links.remove(&key);
            return Err(L2capError::NoLink);
        }
        Ok(cid)
    }

    fn arm_idle_timer(&mut self, key: LinkKey, timeout: Duration) {
        if let Some(lcb) = self.links.get_mut(&key) {
            if lcb.is_connected() && lcb.ccbs.is_empty() {
                lcb.idle_timer = Some(Instant::now() + timeout);
            }
        }
    }

    /// Release a CCB through the single teardown path.
    ///
    /// The terminal callback fires unless one was already delivered. When the
    /// link loses its last channel the idle timer is armed.
    pub(super) fn release_ccb(&mut self, cid: u16, terminal: Option<Terminal>) {
        let slot = match cid.checked_sub(L2CAP_DYNAMIC_CID_MIN) {
            Some(slot) if (slot as usize) < self.channels.len() => slot as usize,
            _ => return,
        };
        let Some(ccb) = self.channels[slot].take() else {
            debug!("CID 0x{:04X} already released", cid);
            return;
        };
        info!(
            "Releasing CID 0x{:04X} in {} ({:?})",
            cid, ccb.state, terminal
        );
        self.events.retain(|(c, _)| *c != cid);

        if let Some(terminal) = terminal.filter(|_| !ccb.terminal_sent) {
            self.deliver_terminal(&ccb, terminal);
        }

        let key = ccb.link;
        let Some(lcb) = self.links.get_mut(&key) else {
            return;
        };
        let removed = lcb.remove_channel(cid);
        if let Some(next) = removed.new_lead.and_then(|lead| self.ccb_mut(lead)) {
            // The batch deadline lives on the lead
            next.timer = ccb.timer;
        }
        if !removed.last {
            return;
        }
        let Some(lcb) = self.links.get_mut(&key) else {
            return;
        };
        let timeout = if std::mem::take(&mut lcb.security_failed) {
            self.config.security_failure_idle_timeout
        } else {
            self.config.link_idle_timeout
        };
        self.arm_idle_timer(key, timeout);
    }

    /// Deliver a terminal callback now while the channel stays allocated
    pub(super) fn notify_terminal(&mut self, cid: u16, terminal: Terminal) {
        let Some(ccb) = self.ccb_mut(cid) else {
            return;
        };
        if ccb.terminal_sent {
            return;
        }
        ccb.terminal_sent = true;
        if let Some(ccb) = self.ccb(cid) {
            self.deliver_terminal(ccb, terminal);
        }
    }

    fn deliver_terminal(&self, ccb: &L2capChannel, terminal: Terminal) {
        let cb = &ccb.rcb.callbacks;
        let cid = ccb.local_cid;
        match terminal {
            Terminal::DisconnectInd {
                confirmation_required,
            } => cb.disconnect_ind(cid, confirmation_required),
            Terminal::DisconnectCfm(result) => cb.disconnect_cfm(cid, result),
            Terminal::Error(code) => cb.error(cid, code),
            Terminal::CreditBasedConnectCfm(result) => {
                cb.credit_based_connect_cfm(ccb.link.0, cid, 0, result)
            }
        }
    }

    // ---- dispatch ----

    /// Queue an event and run the queue unless a dispatch is already in progress
    pub(super) fn post(&mut self, cid: u16, event: CsmEvent) {
        self.events.push_back((cid, event));
        if self.dispatching {
            return;
        }
        self.dispatching = true;
        while let Some((cid, event)) = self.events.pop_front() {
            self.execute(cid, event);
        }
        self.dispatching = false;
    }
}

fn is_response(message: &SignalingMessage) -> bool {
    matches!(
        message,
        SignalingMessage::CommandReject { .. }
            | SignalingMessage::ConnectionResponse { .. }
            | SignalingMessage::ConfigureResponse { .. }
            | SignalingMessage::DisconnectionResponse { .. }
            | SignalingMessage::EchoResponse { .. }
            | SignalingMessage::InformationResponse { .. }
            | SignalingMessage::ConnectionParameterUpdateResponse { .. }
            | SignalingMessage::LeCreditBasedConnectionResponse { .. }
            | SignalingMessage::CreditBasedConnectionResponse { .. }
            | SignalingMessage::CreditBasedReconfigureResponse { .. }
    )
}
