//! Tests for the L2CAP implementation

#[cfg(test)]
mod tests {
    use super::super::constants::*;
    use super::super::core::*;
    use super::super::link::*;
    use super::super::packet::*;
    use super::super::psm::*;
    use super::super::registry::*;
    use super::super::signaling::*;
    use super::super::types::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    const ACL_HANDLE: u16 = 0x0010;
    const LE_HANDLE: u16 = 0x0020;
    const LE_COC_PSM: u16 = 0x0080;

    fn peer() -> BdAddr {
        BdAddr::new([0x66, 0x55, 0x44, 0x33, 0x22, 0x11])
    }

    /// Lower layer that records everything the manager hands it
    struct MockLinkLayer {
        signals: Mutex<Vec<SignalingMessage>>,
        data: Mutex<Vec<(u16, Vec<u8>)>>,
        created: Mutex<Vec<(BdAddr, ConnectionType)>>,
        dropped: Mutex<Vec<(u16, u8)>>,
        security: Mutex<SecurityStatus>,
        security_requests: Mutex<Vec<SecurityRequest>>,
    }

    impl MockLinkLayer {
        fn new() -> Self {
            Self {
                signals: Mutex::new(Vec::new()),
                data: Mutex::new(Vec::new()),
                created: Mutex::new(Vec::new()),
                dropped: Mutex::new(Vec::new()),
                security: Mutex::new(SecurityStatus::Granted),
                security_requests: Mutex::new(Vec::new()),
            }
        }

        fn set_security(&self, status: SecurityStatus) {
            *self.security.lock().unwrap() = status;
        }

        fn take_signals(&self) -> Vec<SignalingMessage> {
            std::mem::take(&mut *self.signals.lock().unwrap())
        }

        fn take_data(&self) -> Vec<(u16, Vec<u8>)> {
            std::mem::take(&mut *self.data.lock().unwrap())
        }
    }

    impl LinkLayer for MockLinkLayer {
        fn send_pdu(&self, _handle: u16, packet: L2capPacket) {
            let cid = packet.channel_id();
            if cid == L2CAP_SIGNALING_CID || cid == L2CAP_LE_SIGNALING_CID {
                let mut signals = self.signals.lock().unwrap();
                for command in SignalingMessage::parse_all(&packet.payload) {
                    match command {
                        Ok(message) => signals.push(message),
                        Err(e) => panic!("stack sent malformed command 0x{:02X}", e.code),
                    }
                }
            } else {
                self.data.lock().unwrap().push((cid, packet.payload));
            }
        }

        fn create_link(&self, addr: BdAddr, transport: ConnectionType) -> bool {
            self.created.lock().unwrap().push((addr, transport));
            true
        }

        fn disconnect_link(&self, handle: u16, reason: u8) {
            self.dropped.lock().unwrap().push((handle, reason));
        }

        fn request_security(&self, request: &SecurityRequest) -> SecurityStatus {
            self.security_requests.lock().unwrap().push(*request);
            *self.security.lock().unwrap()
        }

        fn update_connection_parameters(&self, _handle: u16, _params: &ConnectionParameterUpdate) -> bool {
            true
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Upcall {
        ConnectInd { cid: u16, psm: u16 },
        ConnectCfm { cid: u16, result: u16 },
        ConfigInd { cid: u16 },
        ConfigCfm { cid: u16 },
        CreditBasedConnectInd { cids: Vec<u16>, peer_mtu: u16, identifier: u8 },
        CreditBasedConnectCfm { cid: u16, result: u16 },
        Reconfigured { cid: u16, local: bool, mtu: u16, mps: u16 },
        Data { cid: u16, data: Vec<u8> },
        Congestion { cid: u16, congested: bool },
        DisconnectInd { cid: u16, confirm: bool },
        DisconnectCfm { cid: u16, result: DisconnectResult },
        Error { cid: u16, code: L2capErrorCode },
    }

    impl Upcall {
        fn is_terminal_for(&self, local_cid: u16) -> bool {
            match self {
                Upcall::DisconnectInd { cid, .. }
                | Upcall::DisconnectCfm { cid, .. }
                | Upcall::Error { cid, .. } => *cid == local_cid,
                Upcall::CreditBasedConnectCfm { cid, result } => {
                    *cid == local_cid && *result != L2CAP_LE_RESULT_SUCCESS
                }
                _ => false,
            }
        }
    }

    #[derive(Default)]
    struct RecordingCallbacks {
        calls: Mutex<Vec<Upcall>>,
    }

    impl RecordingCallbacks {
        fn record(&self, call: Upcall) {
            self.calls.lock().unwrap().push(call);
        }

        fn take(&self) -> Vec<Upcall> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }
    }

    impl L2capCallbacks for RecordingCallbacks {
        fn connect_ind(&self, _addr: BdAddr, local_cid: u16, psm: u16, _identifier: u8) {
            self.record(Upcall::ConnectInd { cid: local_cid, psm });
        }

        fn connect_cfm(&self, local_cid: u16, result: u16) {
            self.record(Upcall::ConnectCfm { cid: local_cid, result });
        }

        fn config_ind(&self, local_cid: u16, _config: &ConfigOptions) {
            self.record(Upcall::ConfigInd { cid: local_cid });
        }

        fn config_cfm(&self, local_cid: u16, _initiator: ConnectionInitiator, _cfg: &ConfigOptions) {
            self.record(Upcall::ConfigCfm { cid: local_cid });
        }

        fn credit_based_connect_ind(
            &self,
            _addr: BdAddr,
            local_cids: &[u16],
            _psm: u16,
            peer_mtu: u16,
            identifier: u8,
        ) {
            self.record(Upcall::CreditBasedConnectInd {
                cids: local_cids.to_vec(),
                peer_mtu,
                identifier,
            });
        }

        fn credit_based_connect_cfm(&self, _addr: BdAddr, local_cid: u16, _peer_mtu: u16, result: u16) {
            self.record(Upcall::CreditBasedConnectCfm { cid: local_cid, result });
        }

        fn credit_based_reconfig_completed(
            &self,
            _addr: BdAddr,
            local_cid: u16,
            is_local_request: bool,
            config: &CreditBasedConfig,
        ) {
            self.record(Upcall::Reconfigured {
                cid: local_cid,
                local: is_local_request,
                mtu: config.mtu,
                mps: config.mps,
            });
        }

        fn data_ind(&self, local_cid: u16, data: Vec<u8>) {
            self.record(Upcall::Data { cid: local_cid, data });
        }

        fn congestion_status(&self, local_cid: u16, congested: bool) {
            self.record(Upcall::Congestion { cid: local_cid, congested });
        }

        fn disconnect_ind(&self, local_cid: u16, confirmation_required: bool) {
            self.record(Upcall::DisconnectInd {
                cid: local_cid,
                confirm: confirmation_required,
            });
        }

        fn disconnect_cfm(&self, local_cid: u16, result: DisconnectResult) {
            self.record(Upcall::DisconnectCfm { cid: local_cid, result });
        }

        fn error(&self, local_cid: u16, code: L2capErrorCode) {
            self.record(Upcall::Error { cid: local_cid, code });
        }
    }

    struct Harness {
        mgr: L2capManager,
        lower: Arc<MockLinkLayer>,
        upper: Arc<RecordingCallbacks>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(L2capConfig::default())
        }

        fn with_config(config: L2capConfig) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let lower = Arc::new(MockLinkLayer::new());
            let upper = Arc::new(RecordingCallbacks::default());
            let mut mgr = L2capManager::new(config, lower.clone());

            mgr.register(Registration::new(
                PSM::RFCOMM,
                ConnectionType::Classic,
                upper.clone(),
            ))
            .unwrap();
            mgr.register(
                Registration::new(PSM::SDP, ConnectionType::Classic, upper.clone())
                    .with_disconnect_confirmation(),
            )
            .unwrap();
            mgr.register(
                Registration::new(PSM::EATT, ConnectionType::LE, upper.clone())
                    .with_credit_based_params(512, 247),
            )
            .unwrap();
            mgr.register(
                Registration::new(PSM::Dynamic(LE_COC_PSM), ConnectionType::LE, upper.clone())
                    .with_credit_based_params(256, 64),
            )
            .unwrap();

            Self { mgr, lower, upper }
        }

        fn inject(&mut self, handle: u16, transport: ConnectionType, message: SignalingMessage) {
            let bytes = message.to_packet(transport).to_bytes();
            self.mgr.handle_acl_data(handle, &bytes).unwrap();
        }

        fn classic(&mut self, message: SignalingMessage) {
            self.inject(ACL_HANDLE, ConnectionType::Classic, message);
        }

        fn le(&mut self, message: SignalingMessage) {
            self.inject(LE_HANDLE, ConnectionType::LE, message);
        }

        fn frame(&mut self, handle: u16, cid: u16, payload: &[u8]) {
            let bytes = L2capPacket::new(cid, payload.to_vec()).to_bytes();
            self.mgr.handle_acl_data(handle, &bytes).unwrap();
        }

        fn signals(&self) -> Vec<SignalingMessage> {
            self.lower.take_signals()
        }

        fn upcalls(&self) -> Vec<Upcall> {
            self.upper.take()
        }

        fn state(&self, cid: u16) -> Option<L2capChannelState> {
            self.mgr.channel_state(cid)
        }

        /// Bring the ACL up and answer the extended features request
        fn classic_link_up(&mut self) {
            self.mgr
                .link_connected(peer(), ConnectionType::Classic, ACL_HANDLE);
            let signals = self.signals();
            let identifier = find(&signals, |m| match m {
                SignalingMessage::InformationRequest { identifier, .. } => Some(*identifier),
                _ => None,
            });
            self.classic(SignalingMessage::InformationResponse {
                identifier,
                info_type: L2CAP_INFO_EXTENDED_FEATURES,
                result: L2CAP_INFO_SUCCESS,
                data: vec![0x80, 0x00, 0x00, 0x00],
            });
        }

        fn le_link_up(&mut self) {
            self.mgr.link_connected(peer(), ConnectionType::LE, LE_HANDLE);
        }

        /// Connect RFCOMM and stop once our configure request is out
        fn classic_to_config(&mut self, remote_cid: u16) -> (u16, u8) {
            let cid = self.mgr.connect_req(PSM::RFCOMM, peer()).unwrap();
            let signals = self.signals();
            let identifier = find(&signals, |m| match m {
                SignalingMessage::ConnectionRequest { identifier, .. } => Some(*identifier),
                _ => None,
            });
            self.classic(SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid: remote_cid,
                source_cid: cid,
                result: L2CAP_CONN_SUCCESS,
                status: L2CAP_CONN_STATUS_NO_INFO,
            });
            let signals = self.signals();
            let cfg_id = find(&signals, |m| match m {
                SignalingMessage::ConfigureRequest { identifier, .. } => Some(*identifier),
                _ => None,
            });
            (cid, cfg_id)
        }

        /// Finish both configuration directions
        fn finish_config(&mut self, cid: u16, cfg_id: u8) {
            self.classic(SignalingMessage::ConfigureRequest {
                identifier: 0x30,
                destination_cid: cid,
                flags: 0,
                options: ConfigOptions {
                    mtu: Some(500),
                    ..ConfigOptions::default()
                },
                unknown_options: Vec::new(),
            });
            self.classic(SignalingMessage::ConfigureResponse {
                identifier: cfg_id,
                source_cid: cid,
                flags: 0,
                result: L2CAP_CFG_SUCCESS,
                options: ConfigOptions::default(),
            });
        }

        fn open_classic(&mut self, remote_cid: u16) -> u16 {
            let (cid, cfg_id) = self.classic_to_config(remote_cid);
            self.finish_config(cid, cfg_id);
            assert_eq!(self.state(cid), Some(L2capChannelState::Open));
            self.signals();
            self.upcalls();
            cid
        }

        /// Open an LE credit based channel with the given peer parameters
        fn open_le_coc(&mut self, remote_cid: u16, peer_cfg: CreditBasedConfig) -> u16 {
            let cid = self
                .mgr
                .le_connect_req(PSM::Dynamic(LE_COC_PSM), peer())
                .unwrap();
            let signals = self.signals();
            let identifier = find(&signals, |m| match m {
                SignalingMessage::LeCreditBasedConnectionRequest { identifier, .. } => {
                    Some(*identifier)
                }
                _ => None,
            });
            self.le(SignalingMessage::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid: remote_cid,
                mtu: peer_cfg.mtu,
                mps: peer_cfg.mps,
                initial_credits: peer_cfg.credits,
                result: L2CAP_LE_RESULT_SUCCESS,
            });
            assert_eq!(self.state(cid), Some(L2capChannelState::Open));
            self.upcalls();
            cid
        }

        /// Accept a peer batch of enhanced credit based channels
        fn open_peer_batch(&mut self, source_cids: Vec<u16>, mtu: u16, mps: u16) -> Vec<u16> {
            self.le(SignalingMessage::CreditBasedConnectionRequest {
                identifier: 0x21,
                spsm: PSM::EATT.value(),
                mtu,
                mps,
                initial_credits: 10,
                source_cids,
            });
            let cids = match self.upcalls().as_slice() {
                [Upcall::CreditBasedConnectInd { cids, .. }] => cids.clone(),
                other => panic!("expected batch indication, got {:?}", other),
            };
            self.mgr
                .credit_based_connect_rsp(peer(), 0x21, &cids, L2CAP_LE_RESULT_SUCCESS)
                .unwrap();
            self.signals();
            cids
        }
    }

    fn find<T>(signals: &[SignalingMessage], f: impl Fn(&SignalingMessage) -> Option<T>) -> T {
        signals
            .iter()
            .find_map(f)
            .unwrap_or_else(|| panic!("expected command not among {:?}", signals))
    }

    fn terminal_count(calls: &[Upcall], cid: u16) -> usize {
        calls.iter().filter(|c| c.is_terminal_for(cid)).count()
    }

    #[test]
    fn test_local_classic_connect_reaches_open() {
        let mut h = Harness::new();
        h.lower.set_security(SecurityStatus::Pending);

        let cid = h.mgr.connect_req(PSM::RFCOMM, peer()).unwrap();
        assert_eq!(h.state(cid), Some(L2capChannelState::Closed));
        assert_eq!(
            *h.lower.created.lock().unwrap(),
            vec![(peer(), ConnectionType::Classic)]
        );

        h.mgr
            .link_connected(peer(), ConnectionType::Classic, ACL_HANDLE);
        assert_eq!(h.state(cid), Some(L2capChannelState::OrigWaitSecurity));
        let request = h.lower.security_requests.lock().unwrap()[0];
        assert!(request.is_originator);
        assert_eq!(request.psm, PSM::RFCOMM.value());

        // Features still unknown: no connect request yet
        h.mgr.security_complete(cid, true).unwrap();
        assert_eq!(h.state(cid), Some(L2capChannelState::WaitPeerConnectRsp));
        let signals = h.signals();
        assert!(!signals
            .iter()
            .any(|m| matches!(m, SignalingMessage::ConnectionRequest { .. })));
        let info_id = find(&signals, |m| match m {
            SignalingMessage::InformationRequest { identifier, .. } => Some(*identifier),
            _ => None,
        });

        h.classic(SignalingMessage::InformationResponse {
            identifier: info_id,
            info_type: L2CAP_INFO_EXTENDED_FEATURES,
            result: L2CAP_INFO_SUCCESS,
            data: vec![0, 0, 0, 0],
        });
        let signals = h.signals();
        let connect_id = find(&signals, |m| match m {
            SignalingMessage::ConnectionRequest {
                identifier,
                psm,
                source_cid,
            } if *source_cid == cid && *psm == PSM::RFCOMM.value() => Some(*identifier),
            _ => None,
        });

        h.classic(SignalingMessage::ConnectionResponse {
            identifier: connect_id,
            destination_cid: 0x0070,
            source_cid: cid,
            result: L2CAP_CONN_SUCCESS,
            status: L2CAP_CONN_STATUS_NO_INFO,
        });
        assert_eq!(h.state(cid), Some(L2capChannelState::Config));
        let signals = h.signals();
        let cfg_id = find(&signals, |m| match m {
            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid: 0x0070,
                options,
                ..
            } => {
                assert_eq!(options.mtu, Some(L2CAP_DEFAULT_MTU));
                Some(*identifier)
            }
            _ => None,
        });

        h.finish_config(cid, cfg_id);
        assert_eq!(h.state(cid), Some(L2capChannelState::Open));
        assert_eq!(
            h.upcalls(),
            vec![
                Upcall::ConnectCfm {
                    cid,
                    result: L2CAP_CONN_SUCCESS
                },
                Upcall::ConfigInd { cid },
                Upcall::ConfigCfm { cid },
            ]
        );
        let ccb = h.mgr.channel(cid).unwrap();
        assert_eq!(ccb.peer_cfg.mtu, 500);
        assert_eq!(ccb.remote_cid, 0x0070);
        assert!(ccb.config_done.both_directions());

        let signals = h.signals();
        assert!(signals.iter().any(|m| matches!(
            m,
            SignalingMessage::ConfigureResponse {
                identifier: 0x30,
                source_cid: 0x0070,
                result: L2CAP_CFG_SUCCESS,
                ..
            }
        )));

        assert_eq!(h.mgr.data_write(cid, b"hello").unwrap(), WriteStatus::Sent);
        assert_eq!(h.lower.take_data(), vec![(0x0070, b"hello".to_vec())]);

        h.frame(ACL_HANDLE, cid, b"ping");
        assert_eq!(
            h.upcalls(),
            vec![Upcall::Data {
                cid,
                data: b"ping".to_vec()
            }]
        );
    }

    #[test]
    fn test_data_written_during_config_is_held_until_open() {
        let mut h = Harness::new();
        h.classic_link_up();
        let (cid, cfg_id) = h.classic_to_config(0x0071);

        assert_eq!(h.mgr.data_write(cid, b"early").unwrap(), WriteStatus::Queued);
        assert!(h.lower.take_data().is_empty());

        h.finish_config(cid, cfg_id);
        assert_eq!(h.lower.take_data(), vec![(0x0071, b"early".to_vec())]);
    }

    #[test]
    fn test_peer_batch_on_unregistered_psm_is_refused() {
        let mut h = Harness::new();
        h.le_link_up();

        h.le(SignalingMessage::CreditBasedConnectionRequest {
            identifier: 0x11,
            spsm: 0x00F1,
            mtu: 64,
            mps: 64,
            initial_credits: 5,
            source_cids: vec![0x0040, 0x0041, 0x0042],
        });

        assert_eq!(
            h.signals(),
            vec![SignalingMessage::CreditBasedConnectionResponse {
                identifier: 0x11,
                mtu: 0,
                mps: 0,
                initial_credits: 0,
                result: L2CAP_LE_RESULT_SPSM_NOT_SUPPORTED,
                destination_cids: vec![0, 0, 0],
            }]
        );
        assert_eq!(h.mgr.channel_count(), 0);
        assert!(h.upcalls().is_empty());
        assert!(h.mgr.link(peer(), ConnectionType::LE).unwrap().pending_ecoc.is_none());
    }

    #[test]
    fn test_reconfigure_reducing_mtu_is_refused() {
        let mut h = Harness::new();
        h.le_link_up();
        let cids = h.open_peer_batch(vec![0x0040], 200, 100);
        let cid = cids[0];
        h.upcalls();

        h.le(SignalingMessage::CreditBasedReconfigureRequest {
            identifier: 0x31,
            mtu: 100,
            mps: 100,
            destination_cids: vec![0x0040],
        });

        assert_eq!(
            h.signals(),
            vec![SignalingMessage::CreditBasedReconfigureResponse {
                identifier: 0x31,
                result: L2CAP_RECONFIG_MTU_REDUCTION_NOT_ALLOWED,
            }]
        );
        let ccb = h.mgr.channel(cid).unwrap();
        assert_eq!(ccb.state, L2capChannelState::Open);
        assert_eq!(ccb.peer_conn_cfg.mtu, 200);
        assert!(h.upcalls().is_empty());
    }

    #[test]
    fn test_reconfigure_naming_too_many_channels_is_refused() {
        let mut h = Harness::new();
        h.le_link_up();
        let source_cids: Vec<u16> = (0x0040..0x0045).collect();
        let cids = h.open_peer_batch(source_cids.clone(), 100, 100);
        assert_eq!(cids.len(), 5);
        h.upcalls();

        let mut destination_cids = source_cids;
        destination_cids.push(0x0040);
        h.le(SignalingMessage::CreditBasedReconfigureRequest {
            identifier: 0x33,
            mtu: 300,
            mps: 100,
            destination_cids,
        });

        assert_eq!(
            h.signals(),
            vec![SignalingMessage::CreditBasedReconfigureResponse {
                identifier: 0x33,
                result: L2CAP_RECONFIG_UNACCEPTABLE_PARAMETERS,
            }]
        );
        for &cid in &cids {
            assert_eq!(h.mgr.channel(cid).unwrap().peer_conn_cfg.mtu, 100);
        }
        assert!(h.upcalls().is_empty());
    }

    #[test]
    fn test_peer_reconfigure_applies_to_every_channel() {
        let mut h = Harness::new();
        h.le_link_up();
        let cids = h.open_peer_batch(vec![0x0040, 0x0041], 100, 100);
        h.upcalls();

        h.le(SignalingMessage::CreditBasedReconfigureRequest {
            identifier: 0x32,
            mtu: 300,
            mps: 120,
            destination_cids: vec![0x0040, 0x0041],
        });

        assert_eq!(
            h.signals(),
            vec![SignalingMessage::CreditBasedReconfigureResponse {
                identifier: 0x32,
                result: L2CAP_RECONFIG_SUCCESS,
            }]
        );
        let calls = h.upcalls();
        for &cid in &cids {
            assert!(calls.contains(&Upcall::Reconfigured {
                cid,
                local: false,
                mtu: 300,
                mps: 120
            }));
            assert_eq!(h.mgr.channel(cid).unwrap().peer_conn_cfg.mtu, 300);
        }

        // One unknown CID spoils the whole request
        h.le(SignalingMessage::CreditBasedReconfigureRequest {
            identifier: 0x33,
            mtu: 400,
            mps: 120,
            destination_cids: vec![0x0040, 0x0050],
        });
        assert_eq!(
            h.signals(),
            vec![SignalingMessage::CreditBasedReconfigureResponse {
                identifier: 0x33,
                result: L2CAP_RECONFIG_INVALID_DESTINATION_CID,
            }]
        );
        assert_eq!(h.mgr.channel(cids[0]).unwrap().peer_conn_cfg.mtu, 300);
    }

    #[test]
    fn test_local_reconfigure_round_trip() {
        let mut h = Harness::new();
        h.le_link_up();
        let cids = h.open_peer_batch(vec![0x0040, 0x0041], 100, 100);
        h.upcalls();

        assert!(h
            .mgr
            .credit_based_reconfig_req(peer(), &cids, 100, 100)
            .is_err());
        h.mgr
            .credit_based_reconfig_req(peer(), &cids, 1024, 247)
            .unwrap();
        let signals = h.signals();
        let identifier = find(&signals, |m| match m {
            SignalingMessage::CreditBasedReconfigureRequest {
                identifier,
                destination_cids,
                ..
            } => {
                assert_eq!(destination_cids, &cids);
                Some(*identifier)
            }
            _ => None,
        });
        assert!(h.mgr.channel(cids[0]).unwrap().reconfig_started);

        h.le(SignalingMessage::CreditBasedReconfigureResponse {
            identifier,
            result: L2CAP_RECONFIG_SUCCESS,
        });
        assert_eq!(
            h.upcalls(),
            vec![
                Upcall::Reconfigured {
                    cid: cids[0],
                    local: true,
                    mtu: 1024,
                    mps: 247
                },
                Upcall::Reconfigured {
                    cid: cids[1],
                    local: true,
                    mtu: 1024,
                    mps: 247
                },
            ]
        );
        let ccb = h.mgr.channel(cids[1]).unwrap();
        assert!(!ccb.reconfig_started);
        assert_eq!(ccb.local_conn_cfg.mtu, 1024);
        assert!(ccb.timer.is_none());
    }

    #[test]
    fn test_refused_local_reconfigure_disconnects() {
        let mut h = Harness::new();
        h.le_link_up();
        let cids = h.open_peer_batch(vec![0x0040], 100, 100);
        h.upcalls();

        h.mgr
            .credit_based_reconfig_req(peer(), &cids, 600, 247)
            .unwrap();
        let signals = h.signals();
        let identifier = find(&signals, |m| match m {
            SignalingMessage::CreditBasedReconfigureRequest { identifier, .. } => Some(*identifier),
            _ => None,
        });
        h.le(SignalingMessage::CreditBasedReconfigureResponse {
            identifier,
            result: L2CAP_RECONFIG_UNACCEPTABLE_PARAMETERS,
        });

        assert_eq!(
            h.upcalls(),
            vec![Upcall::Error {
                cid: cids[0],
                code: L2capErrorCode::ConfigRejected(L2CAP_RECONFIG_UNACCEPTABLE_PARAMETERS)
            }]
        );
        assert_eq!(h.state(cids[0]), Some(L2capChannelState::WaitPeerDisconnectRsp));
    }

    #[test]
    fn test_credit_overflow_disconnects() {
        let mut h = Harness::new();
        h.le_link_up();
        let cid = h.open_le_coc(
            0x0060,
            CreditBasedConfig {
                mtu: 100,
                mps: 50,
                credits: 65000,
            },
        );
        h.signals();

        h.le(SignalingMessage::FlowControlCredit {
            identifier: 0x41,
            cid: 0x0060,
            credits: 1000,
        });

        assert_eq!(
            h.upcalls(),
            vec![Upcall::Error {
                cid,
                code: L2capErrorCode::PeerProtocolViolation
            }]
        );
        assert_eq!(h.state(cid), Some(L2capChannelState::WaitPeerDisconnectRsp));
        assert!(h.signals().iter().any(|m| matches!(
            m,
            SignalingMessage::DisconnectionRequest {
                destination_cid: 0x0060,
                source_cid,
                ..
            } if *source_cid == cid
        )));

        // Nothing is accepted once the channel is going down
        assert!(matches!(
            h.mgr.data_write(cid, b"late"),
            Err(L2capError::InvalidState(_))
        ));
        h.frame(LE_HANDLE, cid, &[2, 0, 1, 2]);
        assert!(h.upcalls().is_empty());
    }

    #[test]
    fn test_credit_overflow_clamps_when_configured() {
        let mut h = Harness::with_config(L2capConfig {
            credit_overflow_policy: CreditOverflowPolicy::Clamp,
            ..L2capConfig::default()
        });
        h.le_link_up();
        let cid = h.open_le_coc(
            0x0060,
            CreditBasedConfig {
                mtu: 100,
                mps: 50,
                credits: 65000,
            },
        );

        h.le(SignalingMessage::FlowControlCredit {
            identifier: 0x41,
            cid: 0x0060,
            credits: 1000,
        });
        assert_eq!(h.state(cid), Some(L2capChannelState::Open));
        assert_eq!(
            h.mgr.channel(cid).unwrap().remote_credit_count,
            L2CAP_LE_MAX_CREDITS
        );
    }

    #[test]
    fn test_disconnect_while_waiting_for_connect_response() {
        let mut h = Harness::new();
        h.classic_link_up();
        let cid = h.mgr.connect_req(PSM::RFCOMM, peer()).unwrap();
        let signals = h.signals();
        let identifier = find(&signals, |m| match m {
            SignalingMessage::ConnectionRequest { identifier, .. } => Some(*identifier),
            _ => None,
        });

        h.classic(SignalingMessage::ConnectionResponse {
            identifier,
            destination_cid: 0x0072,
            source_cid: cid,
            result: L2CAP_CONN_PENDING,
            status: L2CAP_CONN_STATUS_AUTHENTICATION_PENDING,
        });
        assert_eq!(h.state(cid), Some(L2capChannelState::WaitPeerConnectRsp));

        h.mgr.disconnect_req(cid).unwrap();
        assert_eq!(h.state(cid), Some(L2capChannelState::WaitPeerDisconnectRsp));
        let signals = h.signals();
        let disc_id = find(&signals, |m| match m {
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid: 0x0072,
                source_cid,
            } if *source_cid == cid => Some(*identifier),
            _ => None,
        });

        h.classic(SignalingMessage::DisconnectionResponse {
            identifier: disc_id,
            destination_cid: 0x0072,
            source_cid: cid,
        });
        assert_eq!(
            h.upcalls(),
            vec![Upcall::DisconnectCfm {
                cid,
                result: DisconnectResult::Success
            }]
        );
        assert_eq!(h.state(cid), None);
    }

    #[test]
    fn test_link_drop_releases_every_channel_once() {
        let mut h = Harness::new();
        h.classic_link_up();
        let open = h.open_classic(0x0080);
        let (configuring, _) = h.classic_to_config(0x0081);
        assert_eq!(h.state(configuring), Some(L2capChannelState::Config));
        h.upcalls();

        h.mgr.link_disconnected(ACL_HANDLE, 0x08);

        let calls = h.upcalls();
        assert_eq!(calls.len(), 2);
        assert!(calls.contains(&Upcall::DisconnectInd {
            cid: open,
            confirm: false
        }));
        assert!(calls.contains(&Upcall::DisconnectInd {
            cid: configuring,
            confirm: false
        }));
        assert_eq!(h.mgr.channel_count(), 0);
        assert!(h.mgr.link(peer(), ConnectionType::Classic).is_none());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut h = Harness::new();
        h.classic_link_up();
        let cid = h.open_classic(0x0073);

        h.mgr.disconnect_req(cid).unwrap();
        h.mgr.disconnect_req(cid).unwrap();
        let signals = h.signals();
        let requests: Vec<u8> = signals
            .iter()
            .filter_map(|m| match m {
                SignalingMessage::DisconnectionRequest { identifier, .. } => Some(*identifier),
                _ => None,
            })
            .collect();
        assert_eq!(requests.len(), 1);

        h.classic(SignalingMessage::DisconnectionResponse {
            identifier: requests[0],
            destination_cid: 0x0073,
            source_cid: cid,
        });
        let calls = h.upcalls();
        assert_eq!(terminal_count(&calls, cid), 1);

        assert!(matches!(
            h.mgr.disconnect_req(cid),
            Err(L2capError::ChannelNotFound)
        ));
        assert!(h.upcalls().is_empty());
        assert!(h.signals().is_empty());
    }

    #[test]
    fn test_local_batch_partial_grant() {
        let mut h = Harness::new();
        h.le_link_up();

        let cids = h
            .mgr
            .credit_based_connect_req(PSM::EATT, peer(), 3)
            .unwrap();
        assert_eq!(cids.len(), 3);
        let signals = h.signals();
        let identifier = find(&signals, |m| match m {
            SignalingMessage::CreditBasedConnectionRequest {
                identifier,
                spsm,
                mtu: 512,
                mps: 247,
                source_cids,
                ..
            } if *spsm == PSM::EATT.value() => {
                assert_eq!(source_cids, &cids);
                Some(*identifier)
            }
            _ => None,
        });
        assert!(cids
            .iter()
            .all(|&c| h.state(c) == Some(L2capChannelState::WaitPeerConnectRsp)));

        // A second batch may not start while this one is outstanding
        assert!(matches!(
            h.mgr.credit_based_connect_req(PSM::EATT, peer(), 1),
            Err(L2capError::NoResources)
        ));

        h.le(SignalingMessage::CreditBasedConnectionResponse {
            identifier,
            mtu: 100,
            mps: 100,
            initial_credits: 4,
            result: L2CAP_LE_RESULT_NO_RESOURCES,
            destination_cids: vec![0x0050, 0, 0x0051],
        });

        assert_eq!(h.state(cids[0]), Some(L2capChannelState::Open));
        assert_eq!(h.state(cids[1]), None);
        assert_eq!(h.state(cids[2]), Some(L2capChannelState::Open));
        assert_eq!(h.mgr.channel(cids[2]).unwrap().remote_cid, 0x0051);
        assert_eq!(h.mgr.channel(cids[0]).unwrap().remote_credit_count, 4);

        let calls = h.upcalls();
        assert_eq!(
            calls,
            vec![
                Upcall::CreditBasedConnectCfm {
                    cid: cids[0],
                    result: L2CAP_LE_RESULT_SUCCESS
                },
                Upcall::CreditBasedConnectCfm {
                    cid: cids[1],
                    result: L2CAP_LE_RESULT_NO_RESOURCES
                },
                Upcall::CreditBasedConnectCfm {
                    cid: cids[2],
                    result: L2CAP_LE_RESULT_SUCCESS
                },
            ]
        );
        assert!(h.mgr.link(peer(), ConnectionType::LE).unwrap().pending_ecoc.is_none());
    }

    #[test]
    fn test_local_batch_timeout_fails_every_member() {
        let mut h = Harness::new();
        h.le_link_up();
        let cids = h
            .mgr
            .credit_based_connect_req(PSM::EATT, peer(), 2)
            .unwrap();
        h.signals();

        h.mgr.process_timeouts(Instant::now() + Duration::from_secs(120));

        let calls = h.upcalls();
        for &cid in &cids {
            assert_eq!(terminal_count(&calls, cid), 1);
            assert!(calls.contains(&Upcall::Error {
                cid,
                code: L2capErrorCode::Timeout
            }));
        }
        assert_eq!(h.mgr.channel_count(), 0);
    }

    #[test]
    fn test_local_batch_survives_lead_disconnect_and_times_out() {
        let mut h = Harness::new();
        h.le_link_up();
        let cids = h
            .mgr
            .credit_based_connect_req(PSM::EATT, peer(), 2)
            .unwrap();
        h.signals();

        h.mgr.disconnect_req(cids[0]).unwrap();
        assert_eq!(
            h.upcalls(),
            vec![Upcall::DisconnectCfm {
                cid: cids[0],
                result: DisconnectResult::NoLink
            }]
        );
        let lcb = h.mgr.link(peer(), ConnectionType::LE).unwrap();
        assert_eq!(lcb.pending_ecoc.as_ref().map(|p| p.lead_cid), Some(cids[1]));
        assert!(h.mgr.channel(cids[1]).unwrap().timer.is_some());

        h.mgr.process_timeouts(Instant::now() + Duration::from_secs(61));

        let calls = h.upcalls();
        assert_eq!(
            calls,
            vec![Upcall::Error {
                cid: cids[1],
                code: L2capErrorCode::Timeout
            }]
        );
        assert_eq!(h.mgr.channel_count(), 0);
        assert!(h.mgr.link(peer(), ConnectionType::LE).unwrap().pending_ecoc.is_none());
    }

    #[test]
    fn test_peer_batch_survives_lead_disconnect_and_times_out() {
        let mut h = Harness::new();
        h.le_link_up();
        h.le(SignalingMessage::CreditBasedConnectionRequest {
            identifier: 0x23,
            spsm: PSM::EATT.value(),
            mtu: 128,
            mps: 64,
            initial_credits: 3,
            source_cids: vec![0x0040, 0x0041],
        });
        let cids = match h.upcalls().as_slice() {
            [Upcall::CreditBasedConnectInd { cids, .. }] => cids.clone(),
            other => panic!("expected batch indication, got {:?}", other),
        };
        h.signals();

        h.mgr.disconnect_req(cids[0]).unwrap();
        h.upcalls();
        assert_eq!(h.state(cids[1]), Some(L2capChannelState::WaitLocalConnectRsp));

        h.mgr.process_timeouts(Instant::now() + Duration::from_secs(61));

        let calls = h.upcalls();
        assert_eq!(terminal_count(&calls, cids[1]), 1);
        assert!(calls.contains(&Upcall::Error {
            cid: cids[1],
            code: L2capErrorCode::Timeout
        }));
        let signals = h.signals();
        find(&signals, |m| match m {
            SignalingMessage::CreditBasedConnectionResponse {
                identifier: 0x23,
                destination_cids,
                result,
                ..
            } if *result != L2CAP_LE_RESULT_SUCCESS => {
                assert_eq!(destination_cids, &vec![0, 0]);
                Some(())
            }
            _ => None,
        });
        assert_eq!(h.mgr.channel_count(), 0);
    }

    #[test]
    fn test_grant_for_released_batch_member_is_disconnected() {
        let mut h = Harness::new();
        h.le_link_up();
        let cids = h
            .mgr
            .credit_based_connect_req(PSM::EATT, peer(), 2)
            .unwrap();
        let signals = h.signals();
        let identifier = find(&signals, |m| match m {
            SignalingMessage::CreditBasedConnectionRequest { identifier, .. } => Some(*identifier),
            _ => None,
        });

        h.mgr.disconnect_req(cids[1]).unwrap();
        h.upcalls();

        h.le(SignalingMessage::CreditBasedConnectionResponse {
            identifier,
            mtu: 100,
            mps: 100,
            initial_credits: 4,
            result: L2CAP_LE_RESULT_SUCCESS,
            destination_cids: vec![0x0050, 0x0051],
        });

        assert_eq!(h.state(cids[0]), Some(L2capChannelState::Open));
        let signals = h.signals();
        let (destination_cid, source_cid) = find(&signals, |m| match m {
            SignalingMessage::DisconnectionRequest {
                destination_cid,
                source_cid,
                ..
            } => Some((*destination_cid, *source_cid)),
            _ => None,
        });
        assert_eq!((destination_cid, source_cid), (0x0051, cids[1]));
        assert_eq!(
            h.upcalls(),
            vec![Upcall::CreditBasedConnectCfm {
                cid: cids[0],
                result: L2CAP_LE_RESULT_SUCCESS
            }]
        );
    }

    #[test]
    fn test_peer_batch_partial_accept() {
        let mut h = Harness::new();
        h.le_link_up();

        h.le(SignalingMessage::CreditBasedConnectionRequest {
            identifier: 0x22,
            spsm: PSM::EATT.value(),
            mtu: 128,
            mps: 64,
            initial_credits: 3,
            source_cids: vec![0x0040, 0x0041, 0x0041],
        });
        let (cids, identifier) = match h.upcalls().as_slice() {
            [Upcall::CreditBasedConnectInd {
                cids,
                peer_mtu: 128,
                identifier,
            }] => (cids.clone(), *identifier),
            other => panic!("expected batch indication, got {:?}", other),
        };
        // The duplicate source CID is refused up front
        assert_eq!(cids.len(), 2);
        assert!(cids
            .iter()
            .all(|&c| h.state(c) == Some(L2capChannelState::WaitLocalConnectRsp)));

        h.mgr
            .credit_based_connect_rsp(peer(), identifier, &cids[..1], L2CAP_LE_RESULT_SUCCESS)
            .unwrap();

        assert_eq!(
            h.signals(),
            vec![SignalingMessage::CreditBasedConnectionResponse {
                identifier: 0x22,
                mtu: 512,
                mps: 247,
                initial_credits: 64,
                result: L2CAP_LE_RESULT_SOURCE_CID_ALREADY_ALLOCATED,
                destination_cids: vec![cids[0], 0, 0],
            }]
        );
        assert_eq!(h.state(cids[0]), Some(L2capChannelState::Open));
        assert_eq!(h.state(cids[1]), None);
        assert!(h.upcalls().is_empty());
    }

    #[test]
    fn test_le_coc_segments_and_waits_for_credits() {
        let mut h = Harness::new();
        h.le_link_up();
        let cid = h.open_le_coc(
            0x0060,
            CreditBasedConfig {
                mtu: 200,
                mps: 50,
                credits: 2,
            },
        );
        h.signals();

        let sdu: Vec<u8> = (0..120).collect();
        assert_eq!(h.mgr.data_write(cid, &sdu).unwrap(), WriteStatus::Queued);
        let frames = h.lower.take_data();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].1[..2], &[120, 0]);
        assert!(frames.iter().all(|(c, f)| *c == 0x0060 && f.len() <= 50));
        assert_eq!(h.mgr.channel(cid).unwrap().remote_credit_count, 0);

        h.le(SignalingMessage::FlowControlCredit {
            identifier: 0x42,
            cid: 0x0060,
            credits: 5,
        });
        let rest = h.lower.take_data();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].1.len(), 120 + 2 - 100);
        assert_eq!(h.mgr.channel(cid).unwrap().remote_credit_count, 4);

        assert!(matches!(
            h.mgr.data_write(cid, &[0u8; 201]),
            Err(L2capError::MtuExceeded { len: 201, mtu: 200 })
        ));
    }

    #[test]
    fn test_le_coc_reassembly_and_credit_replenishment() {
        let mut h = Harness::new();
        h.le_link_up();
        let cid = h.open_le_coc(
            0x0061,
            CreditBasedConfig {
                mtu: 100,
                mps: 50,
                credits: 10,
            },
        );
        h.signals();

        h.frame(LE_HANDLE, cid, &[4, 0, 1, 2]);
        h.frame(LE_HANDLE, cid, &[3, 4]);
        assert_eq!(
            h.upcalls(),
            vec![Upcall::Data {
                cid,
                data: vec![1, 2, 3, 4]
            }]
        );

        // Two credits spent; 62 left, above the low water mark
        assert!(h.signals().is_empty());
        for _ in 0..46 {
            h.frame(LE_HANDLE, cid, &[1, 0, 9]);
        }
        assert_eq!(
            h.mgr.channel(cid).unwrap().local_conn_cfg.credits,
            L2capConfig::default().credit_default
        );
        let grants: Vec<u16> = h
            .signals()
            .iter()
            .filter_map(|m| match m {
                SignalingMessage::FlowControlCredit { cid: c, credits, .. } if *c == cid => {
                    Some(*credits)
                }
                _ => None,
            })
            .collect();
        assert_eq!(grants, vec![48]);
    }

    #[test]
    fn test_oversized_k_frame_is_a_violation() {
        let mut h = Harness::new();
        h.le_link_up();
        let cid = h.open_le_coc(
            0x0062,
            CreditBasedConfig {
                mtu: 100,
                mps: 50,
                credits: 10,
            },
        );

        // Registration MPS is 64
        h.frame(LE_HANDLE, cid, &[0u8; 65]);
        assert_eq!(
            h.upcalls(),
            vec![Upcall::Error {
                cid,
                code: L2capErrorCode::PeerProtocolViolation
            }]
        );
        assert_eq!(h.state(cid), Some(L2capChannelState::WaitPeerDisconnectRsp));
    }

    #[test]
    fn test_k_frame_without_credit_is_a_violation() {
        let mut h = Harness::with_config(L2capConfig {
            credit_default: 0,
            ..L2capConfig::default()
        });
        h.le_link_up();
        let cid = h.open_le_coc(
            0x0063,
            CreditBasedConfig {
                mtu: 100,
                mps: 50,
                credits: 10,
            },
        );
        assert_eq!(h.mgr.channel(cid).unwrap().local_conn_cfg.credits, 0);

        h.frame(LE_HANDLE, cid, &[3, 0, 1, 2, 3]);
        assert_eq!(
            h.upcalls(),
            vec![Upcall::Error {
                cid,
                code: L2capErrorCode::PeerProtocolViolation
            }]
        );
        assert_eq!(h.state(cid), Some(L2capChannelState::WaitPeerDisconnectRsp));
    }

    #[test]
    fn test_le_connect_refused_by_peer() {
        let mut h = Harness::new();
        h.le_link_up();
        let cid = h
            .mgr
            .le_connect_req(PSM::Dynamic(LE_COC_PSM), peer())
            .unwrap();
        let signals = h.signals();
        let identifier = find(&signals, |m| match m {
            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier,
                le_psm,
                mtu: 256,
                mps: 64,
                initial_credits: 64,
                ..
            } if *le_psm == LE_COC_PSM => Some(*identifier),
            _ => None,
        });

        h.le(SignalingMessage::LeCreditBasedConnectionResponse {
            identifier,
            destination_cid: 0,
            mtu: 0,
            mps: 0,
            initial_credits: 0,
            result: L2CAP_LE_RESULT_INSUFFICIENT_AUTHENTICATION,
        });
        assert_eq!(
            h.upcalls(),
            vec![Upcall::Error {
                cid,
                code: L2capErrorCode::ConnectRejected(L2CAP_LE_RESULT_INSUFFICIENT_AUTHENTICATION)
            }]
        );
        assert_eq!(h.state(cid), None);
    }

    #[test]
    fn test_peer_classic_connect_with_confirmed_disconnect() {
        let mut h = Harness::new();
        h.classic_link_up();

        h.classic(SignalingMessage::ConnectionRequest {
            identifier: 0x51,
            psm: PSM::SDP.value(),
            source_cid: 0x0045,
        });
        let cid = match h.upcalls().as_slice() {
            [Upcall::ConnectInd { cid, psm: 0x0001 }] => *cid,
            other => panic!("expected connect indication, got {:?}", other),
        };
        assert_eq!(h.state(cid), Some(L2capChannelState::WaitLocalConnectRsp));

        h.mgr.connect_rsp(cid, L2CAP_CONN_SUCCESS).unwrap();
        let signals = h.signals();
        assert!(signals.contains(&SignalingMessage::ConnectionResponse {
            identifier: 0x51,
            destination_cid: cid,
            source_cid: 0x0045,
            result: L2CAP_CONN_SUCCESS,
            status: L2CAP_CONN_STATUS_NO_INFO,
        }));
        let cfg_id = find(&signals, |m| match m {
            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid: 0x0045,
                ..
            } => Some(*identifier),
            _ => None,
        });
        h.finish_config(cid, cfg_id);
        assert_eq!(h.state(cid), Some(L2capChannelState::Open));
        h.upcalls();
        h.signals();

        h.classic(SignalingMessage::DisconnectionRequest {
            identifier: 0x52,
            destination_cid: cid,
            source_cid: 0x0045,
        });
        assert_eq!(
            h.upcalls(),
            vec![Upcall::DisconnectInd { cid, confirm: true }]
        );
        assert_eq!(h.state(cid), Some(L2capChannelState::WaitLocalDisconnectRsp));
        assert!(h.signals().is_empty());

        h.mgr.disconnect_rsp(cid).unwrap();
        assert_eq!(
            h.signals(),
            vec![SignalingMessage::DisconnectionResponse {
                identifier: 0x52,
                destination_cid: cid,
                source_cid: 0x0045,
            }]
        );
        assert_eq!(h.state(cid), None);
        assert!(h.upcalls().is_empty());
    }

    #[test]
    fn test_peer_connect_validation() {
        let mut h = Harness::new();
        h.classic_link_up();

        h.classic(SignalingMessage::ConnectionRequest {
            identifier: 0x61,
            psm: 0x1001,
            source_cid: 0x0046,
        });
        h.classic(SignalingMessage::ConnectionRequest {
            identifier: 0x62,
            psm: PSM::RFCOMM.value(),
            source_cid: 0x0002,
        });

        let results: Vec<u16> = h
            .signals()
            .iter()
            .filter_map(|m| match m {
                SignalingMessage::ConnectionResponse { result, .. } => Some(*result),
                _ => None,
            })
            .collect();
        assert_eq!(
            results,
            vec![L2CAP_CONN_NO_PSM, L2CAP_CONN_INVALID_SOURCE_CID]
        );
        assert_eq!(h.mgr.channel_count(), 0);
    }

    #[test]
    fn test_security_refusal_of_peer_connect() {
        let mut h = Harness::new();
        h.classic_link_up();
        h.lower.set_security(SecurityStatus::Denied);

        h.classic(SignalingMessage::ConnectionRequest {
            identifier: 0x63,
            psm: PSM::RFCOMM.value(),
            source_cid: 0x0047,
        });
        assert_eq!(
            h.signals(),
            vec![SignalingMessage::ConnectionResponse {
                identifier: 0x63,
                destination_cid: 0,
                source_cid: 0x0047,
                result: L2CAP_CONN_SECURITY_BLOCK,
                status: L2CAP_CONN_STATUS_NO_INFO,
            }]
        );
        assert!(h.upcalls().is_empty());
        assert_eq!(h.mgr.channel_count(), 0);
    }

    #[test]
    fn test_config_counter_proposals() {
        let mut h = Harness::new();
        h.classic_link_up();
        let (cid, _) = h.classic_to_config(0x0074);

        h.classic(SignalingMessage::ConfigureRequest {
            identifier: 0x71,
            destination_cid: cid,
            flags: 0,
            options: ConfigOptions {
                mtu: Some(40),
                ..ConfigOptions::default()
            },
            unknown_options: Vec::new(),
        });
        assert_eq!(
            h.signals(),
            vec![SignalingMessage::ConfigureResponse {
                identifier: 0x71,
                source_cid: 0x0074,
                flags: 0,
                result: L2CAP_CFG_UNACCEPTABLE_PARAMS,
                options: ConfigOptions {
                    mtu: Some(L2CAP_MIN_MTU),
                    ..ConfigOptions::default()
                },
            }]
        );

        // Option type 0x10 without the hint bit
        let mut payload = vec![L2CAP_CONFIGURE_REQUEST, 0x72, 7, 0];
        payload.extend_from_slice(&cid.to_le_bytes());
        payload.extend_from_slice(&[0x00, 0x00, 0x10, 0x01, 0xAA]);
        h.frame(ACL_HANDLE, L2CAP_SIGNALING_CID, &payload);
        let signals = h.signals();
        assert!(signals.iter().any(|m| matches!(
            m,
            SignalingMessage::ConfigureResponse {
                identifier: 0x72,
                result: L2CAP_CFG_UNKNOWN_OPTIONS,
                ..
            }
        )));
        assert_eq!(h.state(cid), Some(L2capChannelState::Config));
        assert!(!h
            .mgr
            .channel(cid)
            .unwrap()
            .config_done
            .contains(ConfigDone::IB_CFG_DONE));
    }

    #[test]
    fn test_config_continuation_is_merged() {
        let mut h = Harness::new();
        h.classic_link_up();
        let (cid, cfg_id) = h.classic_to_config(0x0075);

        h.classic(SignalingMessage::ConfigureRequest {
            identifier: 0x73,
            destination_cid: cid,
            flags: L2CAP_CFG_FLAG_CONTINUATION,
            options: ConfigOptions {
                mtu: Some(300),
                ..ConfigOptions::default()
            },
            unknown_options: Vec::new(),
        });
        assert!(h.signals().iter().any(|m| matches!(
            m,
            SignalingMessage::ConfigureResponse {
                identifier: 0x73,
                flags: L2CAP_CFG_FLAG_CONTINUATION,
                result: L2CAP_CFG_SUCCESS,
                ..
            }
        )));
        assert!(h.upcalls().iter().all(|c| !matches!(c, Upcall::ConfigInd { .. })));

        h.classic(SignalingMessage::ConfigureRequest {
            identifier: 0x74,
            destination_cid: cid,
            flags: 0,
            options: ConfigOptions {
                flush_timeout: Some(100),
                ..ConfigOptions::default()
            },
            unknown_options: Vec::new(),
        });
        let ccb = h.mgr.channel(cid).unwrap();
        assert_eq!(ccb.peer_cfg.mtu, 300);
        assert_eq!(ccb.peer_cfg.flush_timeout, 100);

        h.classic(SignalingMessage::ConfigureResponse {
            identifier: cfg_id,
            source_cid: cid,
            flags: 0,
            result: L2CAP_CFG_SUCCESS,
            options: ConfigOptions::default(),
        });
        assert_eq!(h.state(cid), Some(L2capChannelState::Open));
    }

    #[test]
    fn test_config_rejection_exhausts_retries() {
        let mut h = Harness::new();
        h.classic_link_up();
        let (cid, mut cfg_id) = h.classic_to_config(0x0076);

        let retries = L2capConfig::default().max_config_retries;
        for _ in 0..retries {
            h.classic(SignalingMessage::ConfigureResponse {
                identifier: cfg_id,
                source_cid: cid,
                flags: 0,
                result: L2CAP_CFG_UNACCEPTABLE_PARAMS,
                options: ConfigOptions {
                    mtu: Some(200),
                    ..ConfigOptions::default()
                },
            });
            let signals = h.signals();
            cfg_id = find(&signals, |m| match m {
                SignalingMessage::ConfigureRequest {
                    identifier,
                    options,
                    ..
                } => {
                    assert_eq!(options.mtu, Some(200));
                    Some(*identifier)
                }
                _ => None,
            });
        }
        h.upcalls();

        h.classic(SignalingMessage::ConfigureResponse {
            identifier: cfg_id,
            source_cid: cid,
            flags: 0,
            result: L2CAP_CFG_UNACCEPTABLE_PARAMS,
            options: ConfigOptions::default(),
        });
        assert_eq!(
            h.upcalls(),
            vec![Upcall::Error {
                cid,
                code: L2capErrorCode::ConfigRejected(L2CAP_CFG_UNACCEPTABLE_PARAMS)
            }]
        );
        assert_eq!(h.state(cid), Some(L2capChannelState::WaitPeerDisconnectRsp));

        // Disconnect completes without a second terminal callback
        let signals = h.signals();
        let disc_id = find(&signals, |m| match m {
            SignalingMessage::DisconnectionRequest { identifier, .. } => Some(*identifier),
            _ => None,
        });
        h.classic(SignalingMessage::DisconnectionResponse {
            identifier: disc_id,
            destination_cid: 0x0076,
            source_cid: cid,
        });
        assert!(h.upcalls().is_empty());
        assert_eq!(h.state(cid), None);
    }

    #[test]
    fn test_connect_timeout_and_idle_link() {
        let mut h = Harness::new();
        h.classic_link_up();
        let cid = h.mgr.connect_req(PSM::RFCOMM, peer()).unwrap();
        h.signals();

        // A channel on the link keeps it up
        h.mgr.process_timeouts(Instant::now() + Duration::from_secs(5));
        assert!(h.upcalls().is_empty());
        assert!(h.lower.dropped.lock().unwrap().is_empty());

        // Connect timer fires; the now idle link goes down with it
        h.mgr.process_timeouts(Instant::now() + Duration::from_secs(61));
        assert_eq!(
            h.upcalls(),
            vec![Upcall::Error {
                cid,
                code: L2capErrorCode::Timeout
            }]
        );
        assert_eq!(h.mgr.channel_count(), 0);
        assert_eq!(
            *h.lower.dropped.lock().unwrap(),
            vec![(ACL_HANDLE, HCI_ERR_PEER_USER)]
        );
    }

    #[test]
    fn test_info_and_echo_requests_are_answered() {
        let mut h = Harness::new();
        h.classic_link_up();
        h.signals();

        h.classic(SignalingMessage::InformationRequest {
            identifier: 0x81,
            info_type: L2CAP_INFO_EXTENDED_FEATURES,
        });
        h.classic(SignalingMessage::InformationRequest {
            identifier: 0x82,
            info_type: 0x0042,
        });
        h.classic(SignalingMessage::EchoRequest {
            identifier: 0x83,
            data: vec![1, 2, 3],
        });

        assert_eq!(
            h.signals(),
            vec![
                SignalingMessage::InformationResponse {
                    identifier: 0x81,
                    info_type: L2CAP_INFO_EXTENDED_FEATURES,
                    result: L2CAP_INFO_SUCCESS,
                    data: L2CAP_EXTFEA_FIXED_CHNLS.to_le_bytes().to_vec(),
                },
                SignalingMessage::InformationResponse {
                    identifier: 0x82,
                    info_type: 0x0042,
                    result: L2CAP_INFO_NOT_SUPPORTED,
                    data: Vec::new(),
                },
                SignalingMessage::EchoResponse {
                    identifier: 0x83,
                    data: vec![1, 2, 3],
                },
            ]
        );
    }

    #[test]
    fn test_disconnect_request_for_unknown_cid_is_rejected() {
        let mut h = Harness::new();
        h.classic_link_up();
        h.signals();

        h.classic(SignalingMessage::DisconnectionRequest {
            identifier: 0x91,
            destination_cid: 0x0123,
            source_cid: 0x0456,
        });
        assert_eq!(
            h.signals(),
            vec![SignalingMessage::CommandReject {
                identifier: 0x91,
                reason: L2CAP_REJECT_INVALID_CID,
                data: vec![0x23, 0x01, 0x56, 0x04],
            }]
        );
    }

    #[test]
    fn test_deregister_disconnects_bound_channels() {
        let mut h = Harness::new();
        h.classic_link_up();
        let cid = h.open_classic(0x0077);

        h.mgr
            .deregister(ConnectionType::Classic, PSM::RFCOMM)
            .unwrap();
        assert_eq!(h.state(cid), Some(L2capChannelState::WaitPeerDisconnectRsp));
        assert!(matches!(
            h.mgr.connect_req(PSM::RFCOMM, peer()),
            Err(L2capError::PsmNotRegistered)
        ));
        assert!(matches!(
            h.mgr
                .deregister(ConnectionType::Classic, PSM::RFCOMM),
            Err(L2capError::PsmNotRegistered)
        ));
    }

    #[test]
    fn test_registration_rules() {
        let mut h = Harness::new();
        let cb: Arc<dyn L2capCallbacks> = h.upper.clone();

        assert!(matches!(
            h.mgr
                .register(Registration::new(PSM::RFCOMM, ConnectionType::Classic, cb.clone())),
            Err(L2capError::PsmAlreadyRegistered)
        ));

        let psm = h.mgr.obtain_dynamic_psm(ConnectionType::Classic).unwrap();
        assert!(psm.is_valid_for(ConnectionType::Classic));
        h.mgr
            .register(Registration::new(psm, ConnectionType::Classic, cb))
            .unwrap();
        assert!(h.mgr.is_registered(ConnectionType::Classic, psm.value()));

        h.mgr.deregister(ConnectionType::Classic, psm).unwrap();
        h.mgr.free_dynamic_psm(psm);
        assert!(!h.mgr.is_registered(ConnectionType::Classic, psm.value()));
        assert!(matches!(
            h.mgr.deregister(ConnectionType::Classic, psm),
            Err(L2capError::PsmNotRegistered)
        ));
    }

    #[test]
    fn test_truncated_signaling_never_panics() {
        let mut h = Harness::new();
        h.le_link_up();
        h.classic_link_up();

        let valid = SignalingMessage::CreditBasedConnectionRequest {
            identifier: 0x10,
            spsm: PSM::EATT.value(),
            mtu: 100,
            mps: 100,
            initial_credits: 1,
            source_cids: vec![0x0040, 0x0041],
        }
        .serialize();

        for len in 0..valid.len() {
            let frame = L2capPacket::new(L2CAP_LE_SIGNALING_CID, valid[..len].to_vec()).to_bytes();
            h.mgr.handle_acl_data(LE_HANDLE, &frame).unwrap();
        }
        for len in 0..L2CAP_BASIC_HEADER_SIZE {
            assert!(h.mgr.handle_acl_data(LE_HANDLE, &[0u8; 4][..len]).is_err());
        }

        let mut rng = StdRng::seed_from_u64(0x1CAB);
        for _ in 0..500 {
            let len = rng.gen_range(0..40);
            let mut payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            if let Some(code) = payload.first_mut() {
                *code = rng.gen_range(0x01..=0x1A);
            }
            let transport = if rng.gen() {
                (ACL_HANDLE, L2CAP_SIGNALING_CID)
            } else {
                (LE_HANDLE, L2CAP_LE_SIGNALING_CID)
            };
            let frame = L2capPacket::new(transport.1, payload).to_bytes();
            h.mgr.handle_acl_data(transport.0, &frame).unwrap();
        }

        // Every reject we emitted decodes cleanly
        for message in h.signals() {
            if let SignalingMessage::CommandReject { reason, .. } = message {
                assert!(reason <= L2CAP_REJECT_INVALID_CID);
            }
        }
    }
}
