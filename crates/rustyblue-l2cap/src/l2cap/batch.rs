//! Enhanced credit based batches
//!
//! A credit based connection request can open up to five channels with one
//! signaling exchange and a reconfigure request can resize several at once.
//! The outcome of such an exchange is computed as a list of
//! [`BatchOperation`]s first and applied in one step, so no member of a
//! batch is observed half way between states.

use std::time::Duration;

use log::{debug, info, warn};

use super::channel::L2capChannelType;
use super::constants::*;
use super::core::L2capManager;
use super::csm::{CsmEvent, Terminal};
use super::link::{EcocSlot, LinkKey, PendingEcocConnection, PendingReconfig};
use super::signaling::{SignalId, SignalingMessage};
use super::types::*;

/// One channel's share of a batch outcome
#[derive(Debug, Clone, PartialEq)]
pub(super) enum BatchOperation {
    SetState {
        cid: u16,
        state: L2capChannelState,
        timeout: Option<Duration>,
    },
    /// Channel connected; `confirm` reports it to a local initiator
    Open {
        cid: u16,
        remote_cid: u16,
        peer_cfg: CreditBasedConfig,
        confirm: bool,
    },
    Release {
        cid: u16,
        terminal: Option<Terminal>,
    },
    Reconfigured {
        cid: u16,
        local: bool,
        mtu: u16,
        mps: u16,
    },
}

fn usable_ecoc_params(cfg: &CreditBasedConfig) -> bool {
    cfg.mtu >= L2CAP_ECOC_MIN_MTU && cfg.mps >= L2CAP_ECOC_MIN_MPS && cfg.mps <= L2CAP_LE_MAX_MPS
}

fn is_le_dynamic_cid(cid: u16) -> bool {
    (L2CAP_DYNAMIC_CID_MIN..=L2CAP_LE_DYNAMIC_CID_MAX).contains(&cid)
}

impl L2capManager {
    pub(super) fn apply_batch(&mut self, ops: Vec<BatchOperation>) {
        for op in ops {
            match op {
                BatchOperation::SetState {
                    cid,
                    state,
                    timeout,
                } => {
                    let Some(ccb) = self.ccb_mut(cid) else { continue };
                    ccb.state = state;
                    match timeout {
                        Some(timeout) => ccb.start_timer(timeout),
                        None => ccb.stop_timer(),
                    }
                }
                BatchOperation::Open {
                    cid,
                    remote_cid,
                    peer_cfg,
                    confirm,
                } => {
                    let Some(ccb) = self.ccb_mut(cid) else { continue };
                    ccb.remote_cid = remote_cid;
                    ccb.peer_conn_cfg = peer_cfg;
                    ccb.remote_credit_count = peer_cfg.credits;
                    ccb.stop_timer();
                    ccb.state = L2capChannelState::Open;
                    let (addr, cb) = (ccb.link.0, ccb.rcb.callbacks.clone());
                    info!(
                        "CID 0x{:04X} open (enhanced credit based), peer CID 0x{:04X}",
                        cid, remote_cid
                    );
                    if confirm {
                        cb.credit_based_connect_cfm(addr, cid, peer_cfg.mtu, L2CAP_LE_RESULT_SUCCESS);
                    }
                    self.drain_hold_queue(cid);
                }
                BatchOperation::Release { cid, terminal } => self.release_ccb(cid, terminal),
                BatchOperation::Reconfigured {
                    cid,
                    local,
                    mtu,
                    mps,
                } => {
                    let Some(ccb) = self.ccb_mut(cid) else { continue };
                    if ccb.state != L2capChannelState::Open {
                        continue;
                    }
                    let config = if local {
                        ccb.reconfig_started = false;
                        ccb.stop_timer();
                        ccb.local_conn_cfg.mtu = mtu;
                        ccb.local_conn_cfg.mps = mps;
                        ccb.local_conn_cfg
                    } else {
                        ccb.peer_conn_cfg.mtu = mtu;
                        ccb.peer_conn_cfg.mps = mps;
                        ccb.peer_conn_cfg
                    };
                    let (addr, cb) = (ccb.link.0, ccb.rcb.callbacks.clone());
                    cb.credit_based_reconfig_completed(addr, cid, local, &config);
                }
            }
        }
    }

    /// The channel plus, for a member of a pending batch, every other member
    pub(super) fn batch_members(&self, cid: u16) -> Vec<u16> {
        let Some(ccb) = self.ccb(cid) else {
            return Vec::new();
        };
        if ccb.is_ecoc() {
            if let Some(pending) = self.links.get(&ccb.link).and_then(|lcb| lcb.ecoc_for(cid)) {
                return pending.local_cids();
            }
        }
        vec![cid]
    }

    pub(super) fn set_batch_state(&mut self, cid: u16, state: L2capChannelState) {
        let ops = self
            .batch_members(cid)
            .into_iter()
            .map(|cid| BatchOperation::SetState {
                cid,
                state,
                timeout: None,
            })
            .collect();
        self.apply_batch(ops);
    }

    pub(super) fn release_batch(&mut self, cid: u16, terminal: Option<Terminal>) {
        let ops = self
            .batch_members(cid)
            .into_iter()
            .map(|cid| BatchOperation::Release { cid, terminal })
            .collect();
        self.apply_batch(ops);
    }

    // ---- local batch connect ----

    /// Allocate the rest of a local batch behind `lead` and reserve the link for it
    pub(super) fn begin_local_batch(&mut self, key: LinkKey, lead: u16, count: usize) -> Vec<u16> {
        let Some(rcb) = self.ccb(lead).map(|ccb| ccb.rcb.clone()) else {
            return Vec::new();
        };
        let local_cfg = rcb.local_credit_config(self.config.credit_default);

        let mut cids = vec![lead];
        while cids.len() < count {
            match self.allocate_ccb(
                key,
                rcb.clone(),
                L2capChannelType::EnhancedCreditBased,
                ConnectionInitiator::Local,
            ) {
                Ok(cid) => {
                    if let Some(ccb) = self.ccb_mut(cid) {
                        ccb.local_conn_cfg = local_cfg;
                    }
                    cids.push(cid);
                }
                Err(e) => {
                    warn!("Batch to {} cut to {} channels: {}", key.0, cids.len(), e);
                    break;
                }
            }
        }

        let pending = PendingEcocConnection {
            identifier: 0,
            initiator: ConnectionInitiator::Local,
            lead_cid: lead,
            slots: cids.iter().copied().map(EcocSlot::Live).collect(),
            refusal_result: None,
        };
        if let Some(lcb) = self.links.get_mut(&key) {
            if let Err(e) = lcb.begin_ecoc(pending) {
                warn!("Link to {} already has a batch pending: {}", key.0, e);
            }
        }
        cids
    }

    pub(super) fn send_ecoc_connect_req(&mut self, lead: u16) {
        let Some((link, psm, local_cfg)) = self
            .ccb(lead)
            .map(|ccb| (ccb.link, ccb.psm(), ccb.local_conn_cfg))
        else {
            return;
        };
        let members = self.batch_members(lead);
        let identifier = self.allocate_signal_id();
        if let Some(pending) = self.links.get_mut(&link).and_then(|lcb| lcb.pending_ecoc.as_mut()) {
            pending.identifier = identifier;
        }

        let timeout = self.config.connect_timeout;
        let ops = members
            .iter()
            .map(|&cid| BatchOperation::SetState {
                cid,
                state: L2capChannelState::WaitPeerConnectRsp,
                timeout: (cid == lead).then_some(timeout),
            })
            .collect();
        self.apply_batch(ops);
        for &cid in &members {
            if let Some(ccb) = self.ccb_mut(cid) {
                ccb.local_id = identifier;
            }
        }

        self.send_signal(
            link,
            SignalingMessage::CreditBasedConnectionRequest {
                identifier,
                spsm: psm,
                mtu: local_cfg.mtu,
                mps: local_cfg.mps,
                initial_credits: local_cfg.credits,
                source_cids: members,
            },
        );
    }

    /// Peer answered our batch: each slot opens or fails on its own
    pub(super) fn complete_local_batch(
        &mut self,
        lead: u16,
        result: u16,
        peer_cfg: CreditBasedConfig,
        destination_cids: &[u16],
    ) {
        let Some(link) = self.ccb(lead).map(|ccb| ccb.link) else { return };
        let Some(pending) = self.links.get_mut(&link).and_then(|lcb| lcb.pending_ecoc.take()) else {
            return;
        };

        let params_ok = usable_ecoc_params(&peer_cfg);
        if !params_ok {
            warn!("Peer {} answered batch with unusable {:?}", link.0, peer_cfg);
        }
        let refused_result = if result == L2CAP_LE_RESULT_SUCCESS {
            L2CAP_LE_RESULT_NO_RESOURCES
        } else {
            result
        };

        let mut ops = Vec::with_capacity(pending.slots.len());
        let mut granted: Vec<u16> = Vec::new();
        for (i, slot) in pending.slots.iter().enumerate() {
            let dcid = destination_cids.get(i).copied().unwrap_or(0);
            let cid = match *slot {
                EcocSlot::Live(cid) => cid,
                EcocSlot::Released(cid) => {
                    if is_le_dynamic_cid(dcid) {
                        debug!("Peer granted CID 0x{:04X} to released 0x{:04X}", dcid, cid);
                        self.send_orphan_disconnect(link, dcid, cid);
                    }
                    continue;
                }
                EcocSlot::Refused => continue,
            };
            if dcid == 0 {
                ops.push(BatchOperation::Release {
                    cid,
                    terminal: Some(Terminal::CreditBasedConnectCfm(refused_result)),
                });
                continue;
            }

            let duplicate = granted.contains(&dcid)
                || self
                    .find_on_link(link, |ccb| ccb.local_cid != cid && ccb.remote_cid == dcid)
                    .is_some();
            if !is_le_dynamic_cid(dcid) || duplicate {
                warn!("Peer assigned invalid CID 0x{:04X} to 0x{:04X}", dcid, cid);
                ops.push(BatchOperation::Release {
                    cid,
                    terminal: Some(Terminal::CreditBasedConnectCfm(
                        L2CAP_LE_RESULT_INVALID_PARAMETERS,
                    )),
                });
                continue;
            }
            granted.push(dcid);

            if params_ok {
                ops.push(BatchOperation::Open {
                    cid,
                    remote_cid: dcid,
                    peer_cfg,
                    confirm: true,
                });
            } else {
                self.send_orphan_disconnect(link, dcid, cid);
                ops.push(BatchOperation::Release {
                    cid,
                    terminal: Some(Terminal::CreditBasedConnectCfm(
                        L2CAP_LE_RESULT_UNACCEPTABLE_PARAMETERS,
                    )),
                });
            }
        }

        self.apply_batch(ops);
    }

    /// The peer created its end of a channel we no longer hold; take it down
    fn send_orphan_disconnect(&mut self, link: LinkKey, remote_cid: u16, local_cid: u16) {
        let identifier = self.allocate_signal_id();
        self.send_signal(
            link,
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid: remote_cid,
                source_cid: local_cid,
            },
        );
    }

    // ---- peer batch connect ----

    pub(super) fn handle_credit_based_connection_request(
        &mut self,
        key: LinkKey,
        identifier: SignalId,
        spsm: u16,
        peer_cfg: CreditBasedConfig,
        source_cids: Vec<u16>,
    ) {
        let refuse_all = |mgr: &mut Self, result: u16| {
            warn!("Refusing batch from {}, result 0x{:04X}", key.0, result);
            mgr.send_signal(
                key,
                SignalingMessage::CreditBasedConnectionResponse {
                    identifier,
                    mtu: 0,
                    mps: 0,
                    initial_credits: 0,
                    result,
                    destination_cids: vec![0; source_cids.len()],
                },
            );
        };

        if source_cids.len() > L2CAP_CREDIT_BASED_MAX_CIDS {
            refuse_all(self, L2CAP_LE_RESULT_INVALID_PARAMETERS);
            return;
        }
        if self
            .links
            .get(&key)
            .is_some_and(|lcb| lcb.pending_ecoc.is_some())
        {
            refuse_all(self, L2CAP_LE_RESULT_NO_RESOURCES);
            return;
        }
        let Some(rcb) = self.registration(ConnectionType::LE, spsm) else {
            refuse_all(self, L2CAP_LE_RESULT_SPSM_NOT_SUPPORTED);
            return;
        };
        if !usable_ecoc_params(&peer_cfg) {
            refuse_all(self, L2CAP_LE_RESULT_INVALID_PARAMETERS);
            return;
        }

        let local_cfg = rcb.local_credit_config(self.config.credit_default);
        let mut slots = Vec::with_capacity(source_cids.len());
        let mut refusal = None;
        for &scid in &source_cids {
            let reason = if !is_le_dynamic_cid(scid) {
                Some(L2CAP_LE_RESULT_INVALID_SOURCE_CID)
            } else if self.find_on_link(key, |ccb| ccb.remote_cid == scid).is_some() {
                Some(L2CAP_LE_RESULT_SOURCE_CID_ALREADY_ALLOCATED)
            } else {
                None
            };
            if let Some(reason) = reason {
                refusal.get_or_insert(reason);
                slots.push(EcocSlot::Refused);
                continue;
            }

            match self.allocate_ccb(
                key,
                rcb.clone(),
                L2capChannelType::EnhancedCreditBased,
                ConnectionInitiator::Remote,
            ) {
                Ok(cid) => {
                    if let Some(ccb) = self.ccb_mut(cid) {
                        ccb.remote_cid = scid;
                        ccb.remote_id = identifier;
                        ccb.peer_conn_cfg = peer_cfg;
                        ccb.remote_credit_count = peer_cfg.credits;
                        ccb.local_conn_cfg = local_cfg;
                    }
                    slots.push(EcocSlot::Live(cid));
                }
                Err(_) => {
                    refusal.get_or_insert(L2CAP_LE_RESULT_NO_RESOURCES);
                    slots.push(EcocSlot::Refused);
                }
            }
        }

        let Some(lead) = slots.iter().find_map(EcocSlot::live) else {
            refuse_all(self, refusal.unwrap_or(L2CAP_LE_RESULT_NO_RESOURCES));
            return;
        };
        let pending = PendingEcocConnection {
            identifier,
            initiator: ConnectionInitiator::Remote,
            lead_cid: lead,
            slots,
            refusal_result: refusal,
        };
        if let Some(lcb) = self.links.get_mut(&key) {
            if let Err(e) = lcb.begin_ecoc(pending) {
                warn!("Could not start batch from {}: {}", key.0, e);
                return;
            }
        }
        self.post(lead, CsmEvent::PeerConnectReq);
    }

    /// Security passed for a peer batch: hand it to the service
    pub(super) fn indicate_peer_batch(&mut self, lead: u16) {
        let Some(ccb) = self.ccb(lead) else { return };
        let (addr, psm, peer_mtu, identifier) =
            (ccb.link.0, ccb.psm(), ccb.peer_conn_cfg.mtu, ccb.remote_id);
        let cb = ccb.rcb.callbacks.clone();
        let members = self.batch_members(lead);

        let timeout = self.config.connect_timeout;
        let ops = members
            .iter()
            .map(|&cid| BatchOperation::SetState {
                cid,
                state: L2capChannelState::WaitLocalConnectRsp,
                timeout: (cid == lead).then_some(timeout),
            })
            .collect();
        self.apply_batch(ops);
        cb.credit_based_connect_ind(addr, &members, psm, peer_mtu, identifier);
    }

    /// Service answered a peer batch; channels not in `accepted` are refused
    pub(super) fn answer_peer_batch(&mut self, lead: u16, accepted: &[u16], result: u16) {
        let Some((link, local_cfg)) = self.ccb(lead).map(|ccb| (ccb.link, ccb.local_conn_cfg)) else {
            return;
        };
        let Some(pending) = self.links.get_mut(&link).and_then(|lcb| lcb.pending_ecoc.take()) else {
            return;
        };

        let mut ops = Vec::with_capacity(pending.slots.len());
        let mut destination_cids = Vec::with_capacity(pending.slots.len());
        for slot in &pending.slots {
            match *slot {
                EcocSlot::Live(cid) if result == L2CAP_LE_RESULT_SUCCESS && accepted.contains(&cid) => {
                    let Some(ccb) = self.ccb(cid) else {
                        destination_cids.push(0);
                        continue;
                    };
                    destination_cids.push(cid);
                    ops.push(BatchOperation::Open {
                        cid,
                        remote_cid: ccb.remote_cid,
                        peer_cfg: ccb.peer_conn_cfg,
                        confirm: false,
                    });
                }
                EcocSlot::Live(cid) => {
                    destination_cids.push(0);
                    ops.push(BatchOperation::Release {
                        cid,
                        terminal: None,
                    });
                }
                EcocSlot::Released(_) | EcocSlot::Refused => destination_cids.push(0),
            }
        }

        let rsp_result = if result != L2CAP_LE_RESULT_SUCCESS {
            result
        } else if destination_cids.contains(&0) {
            pending
                .refusal_result
                .unwrap_or(L2CAP_LE_RESULT_NO_RESOURCES)
        } else {
            L2CAP_LE_RESULT_SUCCESS
        };
        let any_open = destination_cids.iter().any(|&d| d != 0);
        let cfg = if any_open {
            local_cfg
        } else {
            CreditBasedConfig {
                mtu: 0,
                mps: 0,
                credits: 0,
            }
        };

        self.send_signal(
            link,
            SignalingMessage::CreditBasedConnectionResponse {
                identifier: pending.identifier,
                mtu: cfg.mtu,
                mps: cfg.mps,
                initial_credits: cfg.credits,
                result: rsp_result,
                destination_cids,
            },
        );
        self.apply_batch(ops);
    }

    /// Refuse a whole peer batch and release its channels
    pub(super) fn refuse_peer_batch(&mut self, cid: u16, result: u16, terminal: Option<Terminal>) {
        let Some(link) = self.ccb(cid).map(|ccb| ccb.link) else { return };
        let members = self.batch_members(cid);
        let pending = self
            .links
            .get_mut(&link)
            .and_then(|lcb| lcb.pending_ecoc.take())
            .filter(|p| p.initiator == ConnectionInitiator::Remote);

        if let Some(pending) = pending {
            self.send_signal(
                link,
                SignalingMessage::CreditBasedConnectionResponse {
                    identifier: pending.identifier,
                    mtu: 0,
                    mps: 0,
                    initial_credits: 0,
                    result,
                    destination_cids: vec![0; pending.slots.len()],
                },
            );
        }

        let ops = members
            .into_iter()
            .map(|cid| BatchOperation::Release { cid, terminal })
            .collect();
        self.apply_batch(ops);
    }

    // ---- reconfiguration ----

    /// Raise our receive MTU/MPS on a set of open enhanced credit based
    /// channels sharing one link
    pub fn credit_based_reconfig_req(
        &mut self,
        addr: BdAddr,
        local_cids: &[u16],
        mtu: u16,
        mps: u16,
    ) -> L2capResult<()> {
        if local_cids.is_empty() || local_cids.len() > L2CAP_CREDIT_BASED_MAX_CIDS {
            return Err(L2capError::InvalidParameter(format!(
                "{} channels in reconfigure request",
                local_cids.len()
            )));
        }
        if mtu < L2CAP_ECOC_MIN_MTU || mps < L2CAP_ECOC_MIN_MPS || mps > L2CAP_LE_MAX_MPS {
            return Err(L2capError::InvalidParameter(format!(
                "MTU/MPS {}/{} out of range",
                mtu, mps
            )));
        }
        let key = (addr, ConnectionType::LE);
        let lcb = self.links.get(&key).ok_or(L2capError::NoLink)?;
        if lcb.pending_reconfig.is_some() {
            return Err(L2capError::NoResources);
        }

        for &cid in local_cids {
            let ccb = self.ccb(cid).ok_or(L2capError::ChannelNotFound)?;
            if ccb.link != key || !ccb.is_ecoc() {
                return Err(L2capError::InvalidParameter(format!(
                    "CID 0x{:04X} is not an enhanced credit based channel to {}",
                    cid, addr
                )));
            }
            if ccb.state != L2capChannelState::Open {
                return Err(L2capError::InvalidState(ccb.state));
            }
            if mtu < ccb.local_conn_cfg.mtu || mps < ccb.local_conn_cfg.mps {
                return Err(L2capError::InvalidParameter(
                    "MTU and MPS may not be reduced".into(),
                ));
            }
        }

        let identifier = self.allocate_signal_id();
        let timeout = self.config.config_timeout;
        for &cid in local_cids {
            if let Some(ccb) = self.ccb_mut(cid) {
                ccb.reconfig_started = true;
                ccb.local_id = identifier;
                ccb.start_timer(timeout);
            }
        }
        if let Some(lcb) = self.links.get_mut(&key) {
            lcb.pending_reconfig = Some(PendingReconfig {
                identifier,
                cids: local_cids.to_vec(),
                config: CreditBasedConfig {
                    mtu,
                    mps,
                    credits: 0,
                },
            });
        }

        self.send_signal(
            key,
            SignalingMessage::CreditBasedReconfigureRequest {
                identifier,
                mtu,
                mps,
                destination_cids: local_cids.to_vec(),
            },
        );
        Ok(())
    }

    /// Peer resizes its receive side. The whole request is checked before any
    /// channel changes.
    pub(super) fn handle_credit_based_reconfig_request(
        &mut self,
        key: LinkKey,
        identifier: SignalId,
        mtu: u16,
        mps: u16,
        destination_cids: Vec<u16>,
    ) {
        let cids: Vec<Option<u16>> = destination_cids
            .iter()
            .map(|&dcid| {
                self.find_on_link(key, |ccb| {
                    ccb.is_ecoc()
                        && ccb.remote_cid == dcid
                        && ccb.state == L2capChannelState::Open
                })
            })
            .collect();

        let current: Vec<CreditBasedConfig> = cids
            .iter()
            .flatten()
            .filter_map(|&cid| self.ccb(cid).map(|ccb| ccb.peer_conn_cfg))
            .collect();

        let result = if destination_cids.is_empty()
            || destination_cids.len() > L2CAP_CREDIT_BASED_MAX_CIDS
        {
            L2CAP_RECONFIG_UNACCEPTABLE_PARAMETERS
        } else if cids.iter().any(Option::is_none) {
            L2CAP_RECONFIG_INVALID_DESTINATION_CID
        } else if mtu < L2CAP_ECOC_MIN_MTU || mps < L2CAP_ECOC_MIN_MPS || mps > L2CAP_LE_MAX_MPS {
            L2CAP_RECONFIG_UNACCEPTABLE_PARAMETERS
        } else if current.iter().any(|cfg| mtu < cfg.mtu) {
            L2CAP_RECONFIG_MTU_REDUCTION_NOT_ALLOWED
        } else if current.iter().any(|cfg| mps < cfg.mps) {
            L2CAP_RECONFIG_MPS_REDUCTION_NOT_ALLOWED
        } else {
            L2CAP_RECONFIG_SUCCESS
        };

        self.send_signal(
            key,
            SignalingMessage::CreditBasedReconfigureResponse { identifier, result },
        );

        if result != L2CAP_RECONFIG_SUCCESS {
            warn!(
                "Refused reconfigure from {} to {}/{}, result 0x{:04X}",
                key.0, mtu, mps, result
            );
            return;
        }
        let ops = cids
            .into_iter()
            .flatten()
            .map(|cid| BatchOperation::Reconfigured {
                cid,
                local: false,
                mtu,
                mps,
            })
            .collect();
        self.apply_batch(ops);
    }

    pub(super) fn handle_credit_based_reconfig_response(
        &mut self,
        key: LinkKey,
        identifier: SignalId,
        result: u16,
    ) {
        let Some(lcb) = self.links.get_mut(&key) else { return };
        if !lcb
            .pending_reconfig
            .as_ref()
            .is_some_and(|p| p.identifier == identifier)
        {
            debug!("Reconfigure response id {} unexpected", identifier);
            return;
        }
        let Some(pending) = lcb.pending_reconfig.take() else { return };

        if result == L2CAP_RECONFIG_SUCCESS {
            let ops = pending
                .cids
                .iter()
                .map(|&cid| BatchOperation::Reconfigured {
                    cid,
                    local: true,
                    mtu: pending.config.mtu,
                    mps: pending.config.mps,
                })
                .collect();
            self.apply_batch(ops);
            return;
        }

        warn!("Peer {} refused reconfigure, result 0x{:04X}", key.0, result);
        for cid in pending.cids {
            if let Some(ccb) = self.ccb_mut(cid) {
                ccb.reconfig_started = false;
                ccb.stop_timer();
            }
            self.fail_and_disconnect(cid, L2capErrorCode::ConfigRejected(result));
        }
    }
}
