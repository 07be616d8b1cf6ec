//! Service registrations
//!
//! A registration binds a PSM on one transport to the callbacks and channel
//! defaults of the service listening on it.

use std::fmt;
use std::sync::Arc;

use super::constants::*;
use super::psm::PSM;
use super::signaling::SignalId;
use super::types::*;

/// Upper-layer interface of a registered service.
///
/// Callbacks run inside a dispatch step and must not call back into the
/// `L2capManager`. Every channel receives exactly one terminal callback:
/// `disconnect_ind`, `disconnect_cfm`, `error`, or a negative
/// `credit_based_connect_cfm`.
pub trait L2capCallbacks: Send + Sync {
    /// Peer asked for a channel on a classic PSM or a single LE credit based channel
    fn connect_ind(&self, _addr: BdAddr, _local_cid: u16, _psm: u16, _identifier: SignalId) {}

    /// Local connect request succeeded
    fn connect_cfm(&self, _local_cid: u16, _result: u16) {}

    /// Peer's configuration request was accepted
    fn config_ind(&self, _local_cid: u16, _config: &ConfigOptions) {}

    /// Peer accepted our configuration request
    fn config_cfm(
        &self,
        _local_cid: u16,
        _initiator: ConnectionInitiator,
        _peer_config: &ConfigOptions,
    ) {
    }

    /// Peer asked for a batch of enhanced credit based channels
    fn credit_based_connect_ind(
        &self,
        _addr: BdAddr,
        _local_cids: &[u16],
        _psm: u16,
        _peer_mtu: u16,
        _identifier: SignalId,
    ) {
    }

    /// Outcome for one channel of a local enhanced credit based connect
    fn credit_based_connect_cfm(&self, _addr: BdAddr, _local_cid: u16, _peer_mtu: u16, _result: u16) {}

    fn credit_based_reconfig_completed(
        &self,
        _addr: BdAddr,
        _local_cid: u16,
        _is_local_request: bool,
        _config: &CreditBasedConfig,
    ) {
    }

    fn data_ind(&self, local_cid: u16, data: Vec<u8>);

    /// Hold queue crossed the high water mark, or drained back below it
    fn congestion_status(&self, _local_cid: u16, _congested: bool) {}

    fn disconnect_ind(&self, local_cid: u16, confirmation_required: bool);

    fn disconnect_cfm(&self, _local_cid: u16, _result: DisconnectResult) {}

    fn error(&self, local_cid: u16, code: L2capErrorCode);
}

/// Registration Record
#[derive(Clone)]
pub struct Registration {
    pub psm: u16,
    pub transport: ConnectionType,
    pub callbacks: Arc<dyn L2capCallbacks>,
    pub security_level: SecurityLevel,
    /// Classic channel modes this service will run
    pub allowed_modes: ChannelModes,
    /// Classic receive MTU
    pub mtu: u16,
    /// Credit based receive MTU
    pub le_mtu: u16,
    pub le_mps: u16,
    /// Peer disconnects wait for `L2capManager::disconnect_rsp`
    pub confirm_disconnect: bool,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("psm", &PSM::from_value(self.psm))
            .field("transport", &self.transport)
            .field("security_level", &self.security_level)
            .field("allowed_modes", &self.allowed_modes)
            .field("mtu", &self.mtu)
            .field("le_mtu", &self.le_mtu)
            .field("le_mps", &self.le_mps)
            .field("confirm_disconnect", &self.confirm_disconnect)
            .finish()
    }
}

impl Registration {
    pub fn new(psm: PSM, transport: ConnectionType, callbacks: Arc<dyn L2capCallbacks>) -> Self {
        Self {
            psm: psm.value(),
            transport,
            callbacks,
            security_level: SecurityLevel::None,
            allowed_modes: ChannelModes::BASIC,
            mtu: L2CAP_DEFAULT_MTU,
            le_mtu: 512,
            le_mps: 247,
            confirm_disconnect: false,
        }
    }

    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }

    pub fn with_modes(mut self, modes: ChannelModes) -> Self {
        self.allowed_modes = modes;
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_credit_based_params(mut self, mtu: u16, mps: u16) -> Self {
        self.le_mtu = mtu;
        self.le_mps = mps;
        self
    }

    pub fn with_disconnect_confirmation(mut self) -> Self {
        self.confirm_disconnect = true;
        self
    }

    /// Check the registration before it is entered in the table
    pub fn validate(&self) -> L2capResult<()> {
        if !PSM::from_value(self.psm).is_valid_for(self.transport) {
            return Err(L2capError::InvalidParameter(format!(
                "PSM 0x{:04X} not valid on {:?}",
                self.psm, self.transport
            )));
        }
        match self.transport {
            ConnectionType::Classic => {
                if self.mtu < L2CAP_MIN_MTU {
                    return Err(L2capError::InvalidParameter(format!(
                        "MTU {} below minimum {}",
                        self.mtu, L2CAP_MIN_MTU
                    )));
                }
                if self.allowed_modes.is_empty() {
                    return Err(L2capError::InvalidParameter("no channel mode allowed".into()));
                }
            }
            ConnectionType::LE => {
                if self.le_mtu < L2CAP_LE_MIN_MTU
                    || self.le_mps < L2CAP_LE_MIN_MPS
                    || self.le_mps > L2CAP_LE_MAX_MPS
                {
                    return Err(L2capError::InvalidParameter(format!(
                        "credit based MTU/MPS {}/{} out of range",
                        self.le_mtu, self.le_mps
                    )));
                }
            }
        }
        Ok(())
    }

    /// Receive parameters granted to the peer when a credit based channel is created
    pub fn local_credit_config(&self, credits: u16) -> CreditBasedConfig {
        CreditBasedConfig {
            mtu: self.le_mtu,
            mps: self.le_mps,
            credits,
        }
    }
}
