//! L2CAP Channel State Machine
//!
//! Every change of channel state happens here, one event at a time, through
//! `L2capManager::post`. Handlers are split per state; events a state does
//! not expect are logged and dropped.

use std::sync::Arc;

use log::{debug, info, trace, warn};

use super::channel::L2capChannelType;
use super::constants::*;
use super::core::L2capManager;
use super::credit::{grant_credits, replenishment, segment_sdu, CreditViolation};
use super::link::SecurityRequest;
use super::signaling::{SignalId, SignalingMessage};
use super::types::*;

/// Input to the channel state machine
#[derive(Debug, Clone, PartialEq)]
pub(super) enum CsmEvent {
    LinkConnectCfm,
    LinkConnectCfmNeg,
    LinkDisconnectInd,
    SecurityComplete,
    SecurityCompleteNeg,
    /// Information exchange on the link finished
    InfoRsp,

    PeerConnectReq,
    PeerConnectRsp {
        remote_cid: u16,
    },
    PeerConnectRspPending {
        remote_cid: u16,
    },
    PeerConnectRspNeg {
        result: u16,
    },
    PeerCreditBasedConnectRsp {
        result: u16,
        peer_cfg: CreditBasedConfig,
        destination_cids: Vec<u16>,
    },
    PeerConfigReq {
        identifier: SignalId,
        flags: u16,
        options: ConfigOptions,
        unknown_options: Vec<u8>,
    },
    PeerConfigRsp {
        flags: u16,
        result: u16,
        options: ConfigOptions,
    },
    PeerDisconnectReq {
        identifier: SignalId,
    },
    PeerDisconnectRsp,
    PeerCommandReject {
        reason: u16,
    },
    PeerData(Vec<u8>),
    PeerFlowControlCredit {
        credits: u16,
    },

    ApiConnectReq,
    ApiConnectRsp,
    ApiConnectRspNeg {
        result: u16,
    },
    ApiCreditBasedConnectRsp {
        accepted: Vec<u16>,
        result: u16,
    },
    ApiConfigReq(ConfigOptions),
    ApiDisconnectReq,
    ApiDisconnectRsp,
    ApiDataWrite(Vec<u8>),
    ApiSendCredit(u16),

    Timeout,
}

impl CsmEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::LinkConnectCfm => "LINK_CONNECT_CFM",
            Self::LinkConnectCfmNeg => "LINK_CONNECT_CFM_NEG",
            Self::LinkDisconnectInd => "LINK_DISCONNECT_IND",
            Self::SecurityComplete => "SECURITY_COMPLETE",
            Self::SecurityCompleteNeg => "SECURITY_COMPLETE_NEG",
            Self::InfoRsp => "INFO_RSP",
            Self::PeerConnectReq => "PEER_CONNECT_REQ",
            Self::PeerConnectRsp { .. } => "PEER_CONNECT_RSP",
            Self::PeerConnectRspPending { .. } => "PEER_CONNECT_RSP_PND",
            Self::PeerConnectRspNeg { .. } => "PEER_CONNECT_RSP_NEG",
            Self::PeerCreditBasedConnectRsp { .. } => "PEER_CREDIT_BASED_CONNECT_RSP",
            Self::PeerConfigReq { .. } => "PEER_CONFIG_REQ",
            Self::PeerConfigRsp { .. } => "PEER_CONFIG_RSP",
            Self::PeerDisconnectReq { .. } => "PEER_DISCONNECT_REQ",
            Self::PeerDisconnectRsp => "PEER_DISCONNECT_RSP",
            Self::PeerCommandReject { .. } => "PEER_CMD_REJECT",
            Self::PeerData(_) => "PEER_DATA",
            Self::PeerFlowControlCredit { .. } => "PEER_FLOW_CONTROL_CREDIT",
            Self::ApiConnectReq => "API_CONNECT_REQ",
            Self::ApiConnectRsp => "API_CONNECT_RSP",
            Self::ApiConnectRspNeg { .. } => "API_CONNECT_RSP_NEG",
            Self::ApiCreditBasedConnectRsp { .. } => "API_CREDIT_BASED_CONNECT_RSP",
            Self::ApiConfigReq(_) => "API_CONFIG_REQ",
            Self::ApiDisconnectReq => "API_DISCONNECT_REQ",
            Self::ApiDisconnectRsp => "API_DISCONNECT_RSP",
            Self::ApiDataWrite(_) => "API_DATA_WRITE",
            Self::ApiSendCredit(_) => "API_SEND_CREDIT",
            Self::Timeout => "TIMEOUT",
        }
    }
}

/// The one callback that ends a channel's life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Terminal {
    DisconnectInd { confirmation_required: bool },
    DisconnectCfm(DisconnectResult),
    Error(L2capErrorCode),
    /// Negative outcome of one channel of a local batch connect
    CreditBasedConnectCfm(u16),
}

impl L2capManager {
    /// Run one event against the channel's current state
    pub(super) fn execute(&mut self, cid: u16, event: CsmEvent) {
        let Some(state) = self.channel_state(cid) else {
            debug!("Dropping {} for released CID 0x{:04X}", event.name(), cid);
            return;
        };
        debug!("CID 0x{:04X} [{}] event {}", cid, state, event.name());

        match state {
            L2capChannelState::Closed => self.csm_closed(cid, event),
            L2capChannelState::OrigWaitSecurity => self.csm_orig_w4_sec(cid, event),
            L2capChannelState::TermWaitSecurity => self.csm_term_w4_sec(cid, event),
            L2capChannelState::WaitPeerConnectRsp => self.csm_w4_peer_connect_rsp(cid, event),
            L2capChannelState::WaitLocalConnectRsp => self.csm_w4_local_connect_rsp(cid, event),
            L2capChannelState::Config => self.csm_config(cid, event),
            L2capChannelState::Open => self.csm_open(cid, event),
            L2capChannelState::WaitPeerDisconnectRsp => self.csm_w4_peer_disconnect_rsp(cid, event),
            L2capChannelState::WaitLocalDisconnectRsp => {
                self.csm_w4_local_disconnect_rsp(cid, event)
            }
        }
    }

    fn csm_closed(&mut self, cid: u16, event: CsmEvent) {
        match event {
            CsmEvent::ApiConnectReq | CsmEvent::LinkConnectCfm => {
                let Some(ccb) = self.ccb(cid) else { return };
                if ccb.initiator != ConnectionInitiator::Local {
                    return;
                }
                let link = ccb.link;
                let is_lead = !ccb.is_ecoc()
                    || self
                        .links
                        .get(&link)
                        .and_then(|lcb| lcb.ecoc_for(cid))
                        .is_some_and(|p| p.lead_cid == cid);
                let connected = self.links.get(&link).is_some_and(|lcb| lcb.is_connected());
                if !is_lead || !connected {
                    return;
                }
                self.set_batch_state(cid, L2capChannelState::OrigWaitSecurity);
                self.request_security(cid);
            }
            CsmEvent::PeerConnectReq => {
                self.set_batch_state(cid, L2capChannelState::TermWaitSecurity);
                self.request_security(cid);
            }
            CsmEvent::LinkConnectCfmNeg | CsmEvent::LinkDisconnectInd => {
                self.release_ccb(cid, Some(Terminal::Error(L2capErrorCode::AclConnectionFailed)));
            }
            CsmEvent::ApiDisconnectReq => {
                self.release_ccb(cid, Some(Terminal::DisconnectCfm(DisconnectResult::NoLink)));
            }
            CsmEvent::ApiDataWrite(data) => self.queue_sdu(cid, data),
            other => self.unexpected(cid, other),
        }
    }

    fn csm_orig_w4_sec(&mut self, cid: u16, event: CsmEvent) {
        match event {
            CsmEvent::SecurityComplete => {
                let Some(ccb) = self.ccb_mut(cid) else { return };
                ccb.stop_timer();
                let (channel_type, link) = (ccb.channel_type, ccb.link);
                match channel_type {
                    L2capChannelType::EnhancedCreditBased => self.send_ecoc_connect_req(cid),
                    L2capChannelType::LeCreditBased => self.send_le_connect_req(cid),
                    L2capChannelType::Classic => {
                        if self.links.get(&link).is_some_and(|lcb| lcb.w4_info_rsp) {
                            // Connect request goes out once the peer's features are known
                            let timeout = self.config.connect_timeout;
                            if let Some(ccb) = self.ccb_mut(cid) {
                                ccb.local_id = 0;
                                ccb.state = L2capChannelState::WaitPeerConnectRsp;
                                ccb.start_timer(timeout);
                            }
                        } else {
                            self.send_connect_req(cid);
                        }
                    }
                }
            }
            CsmEvent::SecurityCompleteNeg => {
                if let Some(link) = self.ccb(cid).map(|ccb| ccb.link) {
                    if let Some(lcb) = self.links.get_mut(&link) {
                        lcb.security_failed = true;
                    }
                }
                self.release_batch(cid, Some(Terminal::Error(L2capErrorCode::SecurityBlocked)));
            }
            CsmEvent::Timeout => {
                self.release_batch(cid, Some(Terminal::Error(L2capErrorCode::Timeout)));
            }
            CsmEvent::LinkDisconnectInd => {
                self.release_ccb(cid, Some(Terminal::Error(L2capErrorCode::AclConnectionFailed)));
            }
            CsmEvent::ApiDisconnectReq => {
                self.release_ccb(cid, Some(Terminal::DisconnectCfm(DisconnectResult::NoLink)));
            }
            CsmEvent::ApiDataWrite(data) => self.queue_sdu(cid, data),
            other => self.unexpected(cid, other),
        }
    }

    fn csm_term_w4_sec(&mut self, cid: u16, event: CsmEvent) {
        match event {
            CsmEvent::SecurityComplete => {
                let timeout = self.config.connect_timeout;
                let Some(ccb) = self.ccb_mut(cid) else { return };
                ccb.stop_timer();
                if ccb.is_ecoc() {
                    self.indicate_peer_batch(cid);
                    return;
                }
                ccb.state = L2capChannelState::WaitLocalConnectRsp;
                ccb.start_timer(timeout);
                let (addr, psm, identifier) = (ccb.link.0, ccb.psm(), ccb.remote_id);
                let cb = ccb.rcb.callbacks.clone();
                cb.connect_ind(addr, cid, psm, identifier);
            }
            CsmEvent::SecurityCompleteNeg => {
                let result = match self.ccb(cid).map(|ccb| ccb.channel_type) {
                    Some(L2capChannelType::Classic) => L2CAP_CONN_SECURITY_BLOCK,
                    _ => L2CAP_LE_RESULT_INSUFFICIENT_AUTHENTICATION,
                };
                self.refuse_connection(cid, result, None);
            }
            CsmEvent::Timeout | CsmEvent::ApiDisconnectReq => {
                self.refuse_connection(cid, L2CAP_CONN_NO_RESOURCES, None);
            }
            CsmEvent::PeerDisconnectReq { identifier } => {
                self.send_disconnect_rsp(cid, identifier);
                self.release_ccb(cid, None);
            }
            CsmEvent::LinkDisconnectInd => self.release_ccb(cid, None),
            other => self.unexpected(cid, other),
        }
    }

    fn csm_w4_peer_connect_rsp(&mut self, cid: u16, event: CsmEvent) {
        match event {
            CsmEvent::PeerConnectRsp { remote_cid } => {
                let Some(ccb) = self.ccb_mut(cid) else { return };
                ccb.remote_cid = remote_cid;
                ccb.stop_timer();
                let cb = ccb.rcb.callbacks.clone();
                cb.connect_cfm(cid, L2CAP_CONN_SUCCESS);
                self.start_config(cid);
            }
            CsmEvent::PeerConnectRspPending { remote_cid } => {
                let timeout = self.config.connect_pending_timeout;
                let Some(ccb) = self.ccb_mut(cid) else { return };
                if remote_cid != 0 {
                    ccb.remote_cid = remote_cid;
                }
                ccb.start_timer(timeout);
            }
            CsmEvent::PeerConnectRspNeg { result } => {
                warn!("CID 0x{:04X} connection refused, result 0x{:04X}", cid, result);
                self.release_ccb(
                    cid,
                    Some(Terminal::Error(L2capErrorCode::ConnectRejected(result))),
                );
            }
            CsmEvent::PeerCreditBasedConnectRsp {
                result,
                peer_cfg,
                destination_cids,
            } => {
                if self.ccb(cid).is_some_and(|ccb| ccb.is_ecoc()) {
                    self.complete_local_batch(cid, result, peer_cfg, &destination_cids);
                } else {
                    let dcid = destination_cids.first().copied().unwrap_or(0);
                    self.le_connect_rsp(cid, result, peer_cfg, dcid);
                }
            }
            CsmEvent::InfoRsp => {
                let deferred = self
                    .ccb(cid)
                    .is_some_and(|ccb| ccb.channel_type == L2capChannelType::Classic && ccb.local_id == 0);
                if deferred {
                    self.send_connect_req(cid);
                }
            }
            CsmEvent::Timeout => {
                self.release_batch(cid, Some(Terminal::Error(L2capErrorCode::Timeout)));
            }
            CsmEvent::ApiDisconnectReq => {
                if self.ccb(cid).is_some_and(|ccb| ccb.remote_cid != 0) {
                    self.send_disconnect_req(cid);
                } else {
                    self.release_ccb(cid, Some(Terminal::DisconnectCfm(DisconnectResult::NoLink)));
                }
            }
            CsmEvent::PeerCommandReject { reason } => {
                warn!("CID 0x{:04X} connect request rejected, reason {}", cid, reason);
                self.release_batch(cid, Some(Terminal::Error(L2capErrorCode::OtherError)));
            }
            CsmEvent::PeerDisconnectReq { identifier } => {
                self.send_disconnect_rsp(cid, identifier);
                self.release_ccb(
                    cid,
                    Some(Terminal::DisconnectInd {
                        confirmation_required: false,
                    }),
                );
            }
            CsmEvent::LinkDisconnectInd => {
                self.release_ccb(cid, Some(Terminal::Error(L2capErrorCode::AclConnectionFailed)));
            }
            CsmEvent::ApiDataWrite(data) => self.queue_sdu(cid, data),
            other => self.unexpected(cid, other),
        }
    }

    fn csm_w4_local_connect_rsp(&mut self, cid: u16, event: CsmEvent) {
        match event {
            CsmEvent::ApiConnectRsp => {
                let Some((channel_type, link)) =
                    self.ccb(cid).map(|ccb| (ccb.channel_type, ccb.link))
                else {
                    return;
                };
                match channel_type {
                    L2capChannelType::Classic => {
                        if self.links.get(&link).is_some_and(|lcb| lcb.w4_info_rsp) {
                            if let Some(ccb) = self.ccb_mut(cid) {
                                ccb.deferred_connect_rsp = true;
                            }
                            return;
                        }
                        self.send_connect_rsp(cid, L2CAP_CONN_SUCCESS);
                        self.start_config(cid);
                    }
                    L2capChannelType::LeCreditBased => {
                        self.send_connect_rsp(cid, L2CAP_LE_RESULT_SUCCESS);
                        let Some(ccb) = self.ccb_mut(cid) else { return };
                        ccb.stop_timer();
                        ccb.state = L2capChannelState::Open;
                        info!("CID 0x{:04X} open (LE credit based)", cid);
                        self.drain_hold_queue(cid);
                    }
                    L2capChannelType::EnhancedCreditBased => {
                        warn!("Batch channel 0x{:04X} needs a credit based response", cid);
                    }
                }
            }
            CsmEvent::ApiConnectRspNeg { result } => {
                self.refuse_connection(cid, result, None);
            }
            CsmEvent::ApiCreditBasedConnectRsp { accepted, result } => {
                self.answer_peer_batch(cid, &accepted, result);
            }
            CsmEvent::InfoRsp => {
                let Some(ccb) = self.ccb_mut(cid) else { return };
                if ccb.deferred_connect_rsp {
                    ccb.deferred_connect_rsp = false;
                    self.post(cid, CsmEvent::ApiConnectRsp);
                }
            }
            CsmEvent::PeerDisconnectReq { identifier } => {
                self.send_disconnect_rsp(cid, identifier);
                self.release_ccb(
                    cid,
                    Some(Terminal::DisconnectInd {
                        confirmation_required: false,
                    }),
                );
            }
            CsmEvent::Timeout => {
                self.refuse_connection(
                    cid,
                    L2CAP_CONN_NO_RESOURCES,
                    Some(Terminal::Error(L2capErrorCode::Timeout)),
                );
            }
            CsmEvent::ApiDisconnectReq => {
                if self.ccb(cid).is_some_and(|ccb| !ccb.is_ecoc()) {
                    self.send_connect_rsp(cid, L2CAP_CONN_NO_RESOURCES);
                }
                self.release_ccb(cid, Some(Terminal::DisconnectCfm(DisconnectResult::NoLink)));
            }
            CsmEvent::LinkDisconnectInd => {
                self.release_ccb(cid, Some(Terminal::Error(L2capErrorCode::AclConnectionFailed)));
            }
            other => self.unexpected(cid, other),
        }
    }

    fn csm_config(&mut self, cid: u16, event: CsmEvent) {
        match event {
            CsmEvent::PeerConfigReq {
                identifier,
                flags,
                options,
                unknown_options,
            } => self.peer_config_req(cid, identifier, flags, options, &unknown_options),
            CsmEvent::PeerConfigRsp {
                flags,
                result,
                options,
            } => self.peer_config_rsp(cid, flags, result, options),
            CsmEvent::ApiConfigReq(options) => {
                self.apply_local_config(cid, &options);
                self.send_config_req(cid, false);
            }
            CsmEvent::PeerData(data) => {
                let ib_done = self
                    .ccb(cid)
                    .is_some_and(|ccb| ccb.config_done.contains(ConfigDone::IB_CFG_DONE));
                if ib_done {
                    self.receive_basic_frame(cid, data);
                } else {
                    debug!("CID 0x{:04X} dropping data before configuration", cid);
                }
            }
            CsmEvent::ApiDataWrite(data) => self.queue_sdu(cid, data),
            CsmEvent::ApiDisconnectReq => self.send_disconnect_req(cid),
            CsmEvent::PeerDisconnectReq { identifier } => self.peer_disconnect(cid, identifier),
            CsmEvent::Timeout => self.fail_and_disconnect(cid, L2capErrorCode::Timeout),
            CsmEvent::PeerCommandReject { reason } => {
                warn!("CID 0x{:04X} configure request rejected, reason {}", cid, reason);
                self.fail_and_disconnect(cid, L2capErrorCode::OtherError);
            }
            CsmEvent::LinkDisconnectInd => self.release_ccb(
                cid,
                Some(Terminal::DisconnectInd {
                    confirmation_required: false,
                }),
            ),
            other => self.unexpected(cid, other),
        }
    }

    fn csm_open(&mut self, cid: u16, event: CsmEvent) {
        match event {
            CsmEvent::PeerData(data) => {
                if self.ccb(cid).is_some_and(|ccb| ccb.is_credit_based()) {
                    self.receive_k_frame(cid, data);
                } else {
                    self.receive_basic_frame(cid, data);
                }
            }
            CsmEvent::ApiDataWrite(data) => {
                self.queue_sdu(cid, data);
                self.drain_hold_queue(cid);
            }
            CsmEvent::PeerFlowControlCredit { credits } => {
                let policy = self.config.credit_overflow_policy;
                let Some(ccb) = self.ccb_mut(cid) else { return };
                match grant_credits(ccb.remote_credit_count, credits, policy) {
                    Ok(total) => {
                        trace!("CID 0x{:04X} credits {} -> {}", cid, ccb.remote_credit_count, total);
                        ccb.remote_credit_count = total;
                        self.drain_hold_queue(cid);
                    }
                    Err(violation) => {
                        warn!("CID 0x{:04X}: {}", cid, violation);
                        self.fail_and_disconnect(cid, L2capErrorCode::PeerProtocolViolation);
                    }
                }
            }
            CsmEvent::ApiSendCredit(credits) => {
                let Some(ccb) = self.ccb_mut(cid) else { return };
                let Some(total) = ccb.local_conn_cfg.credits.checked_add(credits) else {
                    warn!("CID 0x{:04X} credit grant of {} overflows", cid, credits);
                    return;
                };
                ccb.local_conn_cfg.credits = total;
                self.send_credits(cid, credits);
            }
            CsmEvent::PeerConfigReq {
                identifier,
                flags,
                options,
                unknown_options,
            } => self.peer_config_req(cid, identifier, flags, options, &unknown_options),
            CsmEvent::ApiConfigReq(options) => {
                self.apply_local_config(cid, &options);
                let timeout = self.config.config_timeout;
                let Some(ccb) = self.ccb_mut(cid) else { return };
                ccb.config_done.insert(ConfigDone::RECONFIG_FLAG);
                ccb.state = L2capChannelState::Config;
                ccb.start_timer(timeout);
                self.send_config_req(cid, false);
            }
            CsmEvent::ApiDisconnectReq => self.send_disconnect_req(cid),
            CsmEvent::PeerDisconnectReq { identifier } => self.peer_disconnect(cid, identifier),
            CsmEvent::Timeout => {
                if self.ccb(cid).is_some_and(|ccb| ccb.reconfig_started) {
                    warn!("CID 0x{:04X} reconfiguration timed out", cid);
                    self.fail_and_disconnect(cid, L2capErrorCode::Timeout);
                }
            }
            CsmEvent::LinkDisconnectInd => self.release_ccb(
                cid,
                Some(Terminal::DisconnectInd {
                    confirmation_required: false,
                }),
            ),
            other => self.unexpected(cid, other),
        }
    }

    fn csm_w4_peer_disconnect_rsp(&mut self, cid: u16, event: CsmEvent) {
        match event {
            CsmEvent::PeerDisconnectRsp | CsmEvent::LinkDisconnectInd => {
                self.release_ccb(cid, Some(Terminal::DisconnectCfm(DisconnectResult::Success)));
            }
            CsmEvent::PeerDisconnectReq { identifier } => {
                self.send_disconnect_rsp(cid, identifier);
                self.release_ccb(cid, Some(Terminal::DisconnectCfm(DisconnectResult::Success)));
            }
            CsmEvent::PeerCommandReject { reason } => {
                debug!("CID 0x{:04X} disconnect rejected, reason {}", cid, reason);
                self.release_ccb(cid, Some(Terminal::DisconnectCfm(DisconnectResult::Success)));
            }
            CsmEvent::Timeout => {
                warn!("CID 0x{:04X} disconnect response timed out", cid);
                self.release_ccb(cid, Some(Terminal::DisconnectCfm(DisconnectResult::Timeout)));
            }
            CsmEvent::PeerData(_) | CsmEvent::ApiDisconnectReq | CsmEvent::PeerConfigRsp { .. } => {}
            other => self.unexpected(cid, other),
        }
    }

    fn csm_w4_local_disconnect_rsp(&mut self, cid: u16, event: CsmEvent) {
        match event {
            CsmEvent::ApiDisconnectRsp | CsmEvent::ApiDisconnectReq | CsmEvent::Timeout => {
                let identifier = self.ccb(cid).map(|ccb| ccb.remote_id).unwrap_or(0);
                self.send_disconnect_rsp(cid, identifier);
                self.release_ccb(cid, None);
            }
            CsmEvent::LinkDisconnectInd => self.release_ccb(cid, None),
            CsmEvent::PeerData(_) => {}
            other => self.unexpected(cid, other),
        }
    }

    fn unexpected(&self, cid: u16, event: CsmEvent) {
        if let Some(state) = self.channel_state(cid) {
            warn!(
                "CID 0x{:04X} ignoring {} in state {}",
                cid,
                event.name(),
                state
            );
        }
    }

    // ---- security ----

    fn request_security(&mut self, cid: u16) {
        let Some(ccb) = self.ccb(cid) else { return };
        let request = SecurityRequest {
            addr: ccb.link.0,
            psm: ccb.psm(),
            transport: ccb.link.1,
            is_originator: ccb.initiator == ConnectionInitiator::Local,
            local_cid: cid,
            level: ccb.rcb.security_level,
        };
        let classic_acceptor =
            ccb.channel_type == L2capChannelType::Classic && !request.is_originator;

        match self.link_layer.request_security(&request) {
            SecurityStatus::Granted => self.post(cid, CsmEvent::SecurityComplete),
            SecurityStatus::Denied => self.post(cid, CsmEvent::SecurityCompleteNeg),
            SecurityStatus::Pending if classic_acceptor => {
                let timeout = self.config.connect_pending_timeout;
                self.send_connect_rsp_status(
                    cid,
                    L2CAP_CONN_PENDING,
                    L2CAP_CONN_STATUS_AUTHENTICATION_PENDING,
                );
                if let Some(ccb) = self.ccb_mut(cid) {
                    ccb.start_timer(timeout);
                }
            }
            SecurityStatus::Pending => {
                let timeout = self.config.security_timeout;
                if let Some(ccb) = self.ccb_mut(cid) {
                    ccb.start_timer(timeout);
                }
            }
        }
    }

    // ---- connection ----

    /// Pick a mode the service and the peer both run, then send the connect request
    fn send_connect_req(&mut self, cid: u16) {
        let Some(ccb) = self.ccb(cid) else { return };
        let link = ccb.link;
        let peer_modes = self
            .links
            .get(&link)
            .map(|lcb| ChannelModes::from_peer_features(lcb.peer_ext_features))
            .unwrap_or(ChannelModes::BASIC);
        let Some(mode) = (ccb.rcb.allowed_modes & peer_modes).preferred() else {
            warn!("CID 0x{:04X} no channel mode shared with peer", cid);
            self.release_ccb(cid, Some(Terminal::Error(L2capErrorCode::OtherError)));
            return;
        };

        let identifier = self.allocate_signal_id();
        let timeout = self.config.connect_timeout;
        let Some(ccb) = self.ccb_mut(cid) else { return };
        ccb.our_cfg.mode = mode;
        ccb.local_id = identifier;
        ccb.state = L2capChannelState::WaitPeerConnectRsp;
        ccb.start_timer(timeout);
        let psm = ccb.psm();
        self.send_signal(
            link,
            SignalingMessage::ConnectionRequest {
                identifier,
                psm,
                source_cid: cid,
            },
        );
    }

    fn send_le_connect_req(&mut self, cid: u16) {
        let identifier = self.allocate_signal_id();
        let timeout = self.config.connect_timeout;
        let Some(ccb) = self.ccb_mut(cid) else { return };
        ccb.local_id = identifier;
        ccb.state = L2capChannelState::WaitPeerConnectRsp;
        ccb.start_timer(timeout);
        let message = SignalingMessage::LeCreditBasedConnectionRequest {
            identifier,
            le_psm: ccb.psm(),
            source_cid: cid,
            mtu: ccb.local_conn_cfg.mtu,
            mps: ccb.local_conn_cfg.mps,
            initial_credits: ccb.local_conn_cfg.credits,
        };
        let link = ccb.link;
        self.send_signal(link, message);
    }

    fn le_connect_rsp(&mut self, cid: u16, result: u16, peer_cfg: CreditBasedConfig, dcid: u16) {
        if result != L2CAP_LE_RESULT_SUCCESS {
            warn!("CID 0x{:04X} LE connection refused, result 0x{:04X}", cid, result);
            self.release_ccb(
                cid,
                Some(Terminal::Error(L2capErrorCode::ConnectRejected(result))),
            );
            return;
        }

        let Some(link) = self.ccb(cid).map(|ccb| ccb.link) else { return };
        let dcid_in_use = self
            .find_on_link(link, |other| other.local_cid != cid && other.remote_cid == dcid)
            .is_some();
        if !(L2CAP_DYNAMIC_CID_MIN..=L2CAP_LE_DYNAMIC_CID_MAX).contains(&dcid) || dcid_in_use {
            warn!("CID 0x{:04X} peer assigned invalid CID 0x{:04X}", cid, dcid);
            self.release_ccb(
                cid,
                Some(Terminal::Error(L2capErrorCode::PeerProtocolViolation)),
            );
            return;
        }

        let Some(ccb) = self.ccb_mut(cid) else { return };
        ccb.remote_cid = dcid;
        if peer_cfg.mtu < L2CAP_LE_MIN_MTU
            || peer_cfg.mps < L2CAP_LE_MIN_MPS
            || peer_cfg.mps > L2CAP_LE_MAX_MPS
        {
            warn!("CID 0x{:04X} peer sent unusable {:?}", cid, peer_cfg);
            self.fail_and_disconnect(cid, L2capErrorCode::PeerProtocolViolation);
            return;
        }

        ccb.peer_conn_cfg = peer_cfg;
        ccb.remote_credit_count = peer_cfg.credits;
        ccb.stop_timer();
        ccb.state = L2capChannelState::Open;
        let cb = ccb.rcb.callbacks.clone();
        info!("CID 0x{:04X} open (LE credit based)", cid);
        cb.connect_cfm(cid, L2CAP_CONN_SUCCESS);
        self.drain_hold_queue(cid);
    }

    /// Positive or negative answer to the peer's classic or LE connect request
    fn send_connect_rsp(&mut self, cid: u16, result: u16) {
        self.send_connect_rsp_status(cid, result, L2CAP_CONN_STATUS_NO_INFO);
    }

    fn send_connect_rsp_status(&mut self, cid: u16, result: u16, status: u16) {
        let Some(ccb) = self.ccb(cid) else { return };
        let accepted = result == L2CAP_CONN_SUCCESS || result == L2CAP_CONN_PENDING;
        let local = if accepted { cid } else { 0 };
        let message = match ccb.channel_type {
            L2capChannelType::Classic => SignalingMessage::ConnectionResponse {
                identifier: ccb.remote_id,
                destination_cid: local,
                source_cid: ccb.remote_cid,
                result,
                status,
            },
            L2capChannelType::LeCreditBased => {
                let cfg = if accepted {
                    ccb.local_conn_cfg
                } else {
                    CreditBasedConfig {
                        mtu: 0,
                        mps: 0,
                        credits: 0,
                    }
                };
                SignalingMessage::LeCreditBasedConnectionResponse {
                    identifier: ccb.remote_id,
                    destination_cid: local,
                    mtu: cfg.mtu,
                    mps: cfg.mps,
                    initial_credits: cfg.credits,
                    result,
                }
            }
            L2capChannelType::EnhancedCreditBased => return,
        };
        let link = ccb.link;
        self.send_signal(link, message);
    }

    /// Turn down a peer connect request and release what it allocated
    fn refuse_connection(&mut self, cid: u16, result: u16, terminal: Option<Terminal>) {
        if self.ccb(cid).is_some_and(|ccb| ccb.is_ecoc()) {
            self.refuse_peer_batch(cid, result, terminal);
        } else {
            self.send_connect_rsp(cid, result);
            self.release_ccb(cid, terminal);
        }
    }

    // ---- configuration ----

    fn start_config(&mut self, cid: u16) {
        let timeout = self.config.config_timeout;
        let Some(ccb) = self.ccb_mut(cid) else { return };
        ccb.state = L2capChannelState::Config;
        ccb.config_done = ConfigDone::empty();
        ccb.config_retries = 0;
        ccb.start_timer(timeout);
        self.send_config_req(cid, false);
    }

    /// Send our configuration, or an empty request that continues a
    /// fragmented exchange
    fn send_config_req(&mut self, cid: u16, continuation: bool) {
        let identifier = self.allocate_signal_id();
        let Some(ccb) = self.ccb_mut(cid) else { return };
        ccb.local_id = identifier;
        let options = if continuation {
            ConfigOptions::default()
        } else {
            ccb.our_cfg.to_options()
        };
        let message = SignalingMessage::ConfigureRequest {
            identifier,
            destination_cid: ccb.remote_cid,
            flags: 0,
            options,
            unknown_options: Vec::new(),
        };
        let link = ccb.link;
        self.send_signal(link, message);
    }

    fn send_config_rsp(
        &mut self,
        cid: u16,
        identifier: SignalId,
        flags: u16,
        result: u16,
        options: ConfigOptions,
    ) {
        let Some(ccb) = self.ccb(cid) else { return };
        let message = SignalingMessage::ConfigureResponse {
            identifier,
            source_cid: ccb.remote_cid,
            flags,
            result,
            options,
        };
        let link = ccb.link;
        self.send_signal(link, message);
    }

    fn apply_local_config(&mut self, cid: u16, options: &ConfigOptions) {
        let Some(ccb) = self.ccb_mut(cid) else { return };
        if let Some(mtu) = options.mtu {
            ccb.our_cfg.mtu = mtu;
        }
        if let Some(flush_timeout) = options.flush_timeout {
            ccb.our_cfg.flush_timeout = flush_timeout;
        }
        if let Some(rfc) = options.retransmission {
            ccb.our_cfg.mode = rfc.mode;
        }
        ccb.config_done.remove(ConfigDone::OB_CFG_DONE);
    }

    fn peer_config_req(
        &mut self,
        cid: u16,
        identifier: SignalId,
        flags: u16,
        options: ConfigOptions,
        unknown_options: &[u8],
    ) {
        if !unknown_options.is_empty() {
            warn!(
                "CID 0x{:04X} unknown config options {}",
                cid,
                hex::encode(unknown_options)
            );
            self.send_config_rsp(
                cid,
                identifier,
                0,
                L2CAP_CFG_UNKNOWN_OPTIONS,
                ConfigOptions::default(),
            );
            return;
        }

        let Some(ccb) = self.ccb_mut(cid) else { return };
        ccb.peer_cfg_accum.merge(&options);
        if flags & L2CAP_CFG_FLAG_CONTINUATION != 0 {
            self.send_config_rsp(
                cid,
                identifier,
                L2CAP_CFG_FLAG_CONTINUATION,
                L2CAP_CFG_SUCCESS,
                ConfigOptions::default(),
            );
            return;
        }
        let options = std::mem::take(&mut ccb.peer_cfg_accum);

        let mtu = options.mtu.unwrap_or(L2CAP_DEFAULT_MTU);
        if mtu < L2CAP_MIN_MTU {
            let counter = ConfigOptions {
                mtu: Some(L2CAP_MIN_MTU),
                ..ConfigOptions::default()
            };
            self.send_config_rsp(cid, identifier, 0, L2CAP_CFG_UNACCEPTABLE_PARAMS, counter);
            return;
        }

        let mode = options
            .retransmission
            .map(|rfc| rfc.mode)
            .unwrap_or(RetransmissionMode::Basic);
        if !ccb.rcb.allowed_modes.contains(mode.as_mask()) {
            let counter = ConfigOptions {
                retransmission: Some(RetransmissionFlowControl::for_mode(ccb.our_cfg.mode)),
                ..ConfigOptions::default()
            };
            self.send_config_rsp(cid, identifier, 0, L2CAP_CFG_UNACCEPTABLE_PARAMS, counter);
            return;
        }

        ccb.peer_cfg = ChannelConfig {
            mtu,
            flush_timeout: options.flush_timeout.unwrap_or(L2CAP_DEFAULT_FLUSH_TIMEOUT),
            mode,
        };
        ccb.config_done.insert(ConfigDone::IB_CFG_DONE);
        let cb = ccb.rcb.callbacks.clone();
        self.send_config_rsp(cid, identifier, 0, L2CAP_CFG_SUCCESS, ConfigOptions::default());
        cb.config_ind(cid, &options);
        self.check_config_complete(cid);
    }

    fn peer_config_rsp(&mut self, cid: u16, flags: u16, result: u16, options: ConfigOptions) {
        match result {
            L2CAP_CFG_SUCCESS => {
                let Some(ccb) = self.ccb_mut(cid) else { return };
                ccb.cfg_rsp_accum.merge(&options);
                if flags & L2CAP_CFG_FLAG_CONTINUATION != 0 {
                    self.send_config_req(cid, true);
                    return;
                }
                let options = std::mem::take(&mut ccb.cfg_rsp_accum);
                ccb.config_done.insert(ConfigDone::OB_CFG_DONE);
                ccb.config_retries = 0;
                let (initiator, cb) = (ccb.initiator, ccb.rcb.callbacks.clone());
                cb.config_cfm(cid, initiator, &options);
                self.check_config_complete(cid);
            }
            L2CAP_CFG_PENDING => {
                let timeout = self.config.config_timeout;
                if let Some(ccb) = self.ccb_mut(cid) {
                    ccb.start_timer(timeout);
                }
            }
            L2CAP_CFG_UNACCEPTABLE_PARAMS => {
                let max_retries = self.config.max_config_retries;
                let Some(ccb) = self.ccb_mut(cid) else { return };
                ccb.config_retries += 1;
                if ccb.config_retries > max_retries {
                    warn!("CID 0x{:04X} configuration retries exhausted", cid);
                    self.fail_and_disconnect(cid, L2capErrorCode::ConfigRejected(result));
                    return;
                }
                if let Some(mtu) = options.mtu {
                    ccb.our_cfg.mtu = mtu.max(L2CAP_MIN_MTU);
                }
                if let Some(rfc) = options.retransmission {
                    if !ccb.rcb.allowed_modes.contains(rfc.mode.as_mask()) {
                        self.fail_and_disconnect(cid, L2capErrorCode::IncompatibleModes);
                        return;
                    }
                    ccb.our_cfg.mode = rfc.mode;
                }
                debug!("CID 0x{:04X} retrying configuration with {:?}", cid, ccb.our_cfg);
                self.send_config_req(cid, false);
            }
            _ => {
                warn!("CID 0x{:04X} configuration refused, result {}", cid, result);
                self.fail_and_disconnect(cid, L2capErrorCode::ConfigRejected(result));
            }
        }
    }

    fn check_config_complete(&mut self, cid: u16) {
        let Some(ccb) = self.ccb_mut(cid) else { return };
        if !ccb.config_done.both_directions() {
            return;
        }
        if ccb.our_cfg.mode != ccb.peer_cfg.mode {
            warn!(
                "CID 0x{:04X} modes differ: ours {:?}, peer {:?}",
                cid, ccb.our_cfg.mode, ccb.peer_cfg.mode
            );
            self.fail_and_disconnect(cid, L2capErrorCode::IncompatibleModes);
            return;
        }
        if ccb.state == L2capChannelState::Config {
            ccb.stop_timer();
            ccb.state = L2capChannelState::Open;
            ccb.config_done.remove(ConfigDone::RECONFIG_FLAG);
            info!(
                "CID 0x{:04X} open, MTU in {} out {}",
                cid, ccb.our_cfg.mtu, ccb.peer_cfg.mtu
            );
            self.drain_hold_queue(cid);
        }
    }

    // ---- disconnection ----

    pub(super) fn send_disconnect_req(&mut self, cid: u16) {
        let identifier = self.allocate_signal_id();
        let timeout = self.config.disconnect_timeout;
        let Some(ccb) = self.ccb_mut(cid) else { return };
        ccb.local_id = identifier;
        ccb.state = L2capChannelState::WaitPeerDisconnectRsp;
        ccb.start_timer(timeout);
        ccb.xmit_hold_q.clear();
        let message = SignalingMessage::DisconnectionRequest {
            identifier,
            destination_cid: ccb.remote_cid,
            source_cid: cid,
        };
        let link = ccb.link;
        self.send_signal(link, message);
    }

    fn send_disconnect_rsp(&mut self, cid: u16, identifier: SignalId) {
        let Some(ccb) = self.ccb(cid) else { return };
        let message = SignalingMessage::DisconnectionResponse {
            identifier,
            destination_cid: cid,
            source_cid: ccb.remote_cid,
        };
        let link = ccb.link;
        self.send_signal(link, message);
    }

    fn peer_disconnect(&mut self, cid: u16, identifier: SignalId) {
        let timeout = self.config.disconnect_timeout;
        let Some(ccb) = self.ccb_mut(cid) else { return };
        if ccb.rcb.confirm_disconnect {
            ccb.remote_id = identifier;
            ccb.state = L2capChannelState::WaitLocalDisconnectRsp;
            ccb.start_timer(timeout);
            ccb.xmit_hold_q.clear();
            self.notify_terminal(
                cid,
                Terminal::DisconnectInd {
                    confirmation_required: true,
                },
            );
        } else {
            self.send_disconnect_rsp(cid, identifier);
            self.release_ccb(
                cid,
                Some(Terminal::DisconnectInd {
                    confirmation_required: false,
                }),
            );
        }
    }

    /// Report the failure now, then take the channel down with the peer
    pub(super) fn fail_and_disconnect(&mut self, cid: u16, code: L2capErrorCode) {
        self.notify_terminal(cid, Terminal::Error(code));
        if self.ccb(cid).is_some_and(|ccb| ccb.remote_cid != 0) {
            self.send_disconnect_req(cid);
        } else {
            self.release_ccb(cid, None);
        }
    }

    // ---- data path ----

    fn receive_basic_frame(&mut self, cid: u16, data: Vec<u8>) {
        let Some(ccb) = self.ccb(cid) else { return };
        if data.len() > ccb.our_cfg.mtu as usize {
            warn!(
                "CID 0x{:04X} dropping {} byte frame over MTU {}",
                cid,
                data.len(),
                ccb.our_cfg.mtu
            );
            return;
        }
        let cb = ccb.rcb.callbacks.clone();
        cb.data_ind(cid, data);
    }

    fn receive_k_frame(&mut self, cid: u16, frame: Vec<u8>) {
        let low_water = self.config.credit_low_water_mark;
        let credit_default = self.config.credit_default;
        let Some(ccb) = self.ccb_mut(cid) else { return };

        if ccb.local_conn_cfg.credits == 0 {
            warn!("CID 0x{:04X}: {}", cid, CreditViolation::NoCredit);
            self.fail_and_disconnect(cid, L2capErrorCode::PeerProtocolViolation);
            return;
        }
        ccb.local_conn_cfg.credits -= 1;

        let (mtu, mps) = (ccb.local_conn_cfg.mtu, ccb.local_conn_cfg.mps);
        let sdu = match ccb.reassembly.push(&frame, mtu, mps) {
            Ok(sdu) => sdu,
            Err(violation) => {
                warn!("CID 0x{:04X}: {}", cid, violation);
                self.fail_and_disconnect(cid, L2capErrorCode::PeerProtocolViolation);
                return;
            }
        };

        let grant = replenishment(ccb.local_conn_cfg.credits, low_water, credit_default);
        if let Some(grant) = grant {
            ccb.local_conn_cfg.credits += grant;
        }
        let cb = ccb.rcb.callbacks.clone();

        if let Some(sdu) = sdu {
            cb.data_ind(cid, sdu);
        }
        if let Some(grant) = grant {
            self.send_credits(cid, grant);
        }
    }

    fn send_credits(&mut self, cid: u16, credits: u16) {
        let identifier = self.allocate_signal_id();
        let Some(link) = self.ccb(cid).map(|ccb| ccb.link) else { return };
        trace!("CID 0x{:04X} granting {} credits", cid, credits);
        self.send_signal(
            link,
            SignalingMessage::FlowControlCredit {
                identifier,
                cid,
                credits,
            },
        );
    }

    /// Hold an SDU; credit based channels hold it as K-frames
    fn queue_sdu(&mut self, cid: u16, data: Vec<u8>) {
        let Some(ccb) = self.ccb_mut(cid) else { return };
        if ccb.is_credit_based() {
            let frames = segment_sdu(&data, ccb.peer_conn_cfg.mps);
            ccb.xmit_hold_q.extend(frames);
        } else {
            ccb.xmit_hold_q.push_back(data);
        }
        self.update_congestion(cid);
    }

    /// Send what the channel may send: everything on an open classic
    /// channel, one K-frame per credit on a credit based one
    pub(super) fn drain_hold_queue(&mut self, cid: u16) {
        let Some(ccb) = self.ccb_mut(cid) else { return };
        if ccb.state != L2capChannelState::Open {
            return;
        }
        let (link, remote_cid) = (ccb.link, ccb.remote_cid);
        let mut outgoing = Vec::new();
        if ccb.is_credit_based() {
            while ccb.remote_credit_count > 0 {
                let Some(frame) = ccb.xmit_hold_q.pop_front() else { break };
                ccb.remote_credit_count -= 1;
                outgoing.push(frame);
            }
            if !ccb.xmit_hold_q.is_empty() {
                debug!(
                    "CID 0x{:04X} out of credits, {} K-frames held",
                    cid,
                    ccb.xmit_hold_q.len()
                );
            }
        } else {
            outgoing.extend(ccb.xmit_hold_q.drain(..));
        }

        for payload in outgoing {
            self.send_frame(link, remote_cid, payload);
        }
        self.update_congestion(cid);
    }

    fn update_congestion(&mut self, cid: u16) {
        let high_water = self.config.xmit_high_water_mark;
        let Some(ccb) = self.ccb_mut(cid) else { return };
        let congested = ccb.xmit_hold_q.len() >= high_water;
        if congested == ccb.congested {
            return;
        }
        ccb.congested = congested;
        let cb = Arc::clone(&ccb.rcb.callbacks);
        debug!("CID 0x{:04X} congestion {}", cid, congested);
        cb.congestion_status(cid, congested);
    }
}
