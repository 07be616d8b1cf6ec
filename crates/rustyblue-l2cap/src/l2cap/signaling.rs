//! L2CAP Signaling channel codec
//!
//! Encodes and decodes the commands carried on the classic (CID 0x0001) and
//! LE (CID 0x0005) signaling channels. A classic C-frame may carry several
//! commands back to back.

use super::constants::*;
use super::packet::*;
use super::types::*;

/// Handle for identifying signaling transactions
pub type SignalId = u8;

/// L2CAP Signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    CommandReject {
        identifier: SignalId,
        reason: u16,
        data: Vec<u8>,
    },

    ConnectionRequest {
        identifier: SignalId,
        psm: u16,
        source_cid: u16,
    },

    ConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
        result: u16,
        status: u16,
    },

    ConfigureRequest {
        identifier: SignalId,
        destination_cid: u16,
        flags: u16,
        options: ConfigOptions,
        /// Types of non-hint options we could not interpret
        unknown_options: Vec<u8>,
    },

    ConfigureResponse {
        identifier: SignalId,
        source_cid: u16,
        flags: u16,
        result: u16,
        options: ConfigOptions,
    },

    DisconnectionRequest {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    DisconnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    EchoRequest {
        identifier: SignalId,
        data: Vec<u8>,
    },

    EchoResponse {
        identifier: SignalId,
        data: Vec<u8>,
    },

    InformationRequest {
        identifier: SignalId,
        info_type: u16,
    },

    InformationResponse {
        identifier: SignalId,
        info_type: u16,
        result: u16,
        data: Vec<u8>,
    },

    /// Connection Parameter Update Request (LE only)
    ConnectionParameterUpdateRequest {
        identifier: SignalId,
        params: ConnectionParameterUpdate,
    },

    /// Connection Parameter Update Response (LE only)
    ConnectionParameterUpdateResponse {
        identifier: SignalId,
        result: u16,
    },

    LeCreditBasedConnectionRequest {
        identifier: SignalId,
        le_psm: u16,
        source_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
    },

    LeCreditBasedConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        result: u16,
    },

    FlowControlCredit {
        identifier: SignalId,
        cid: u16,
        credits: u16,
    },

    /// Enhanced credit based connection request for up to five channels
    CreditBasedConnectionRequest {
        identifier: SignalId,
        spsm: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        source_cids: Vec<u16>,
    },

    /// Aggregate answer; a zero entry marks a refused channel
    CreditBasedConnectionResponse {
        identifier: SignalId,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        result: u16,
        destination_cids: Vec<u16>,
    },

    CreditBasedReconfigureRequest {
        identifier: SignalId,
        mtu: u16,
        mps: u16,
        destination_cids: Vec<u16>,
    },

    CreditBasedReconfigureResponse {
        identifier: SignalId,
        result: u16,
    },
}

/// A command in a C-frame that could not be decoded
#[derive(Debug)]
pub struct CommandError {
    pub identifier: SignalId,
    pub code: u8,
    pub error: L2capError,
}

impl SignalingMessage {
    /// Get the command code for this signaling message
    pub fn command_code(&self) -> u8 {
        match self {
            Self::CommandReject { .. } => L2CAP_COMMAND_REJECT,
            Self::ConnectionRequest { .. } => L2CAP_CONNECTION_REQUEST,
            Self::ConnectionResponse { .. } => L2CAP_CONNECTION_RESPONSE,
            Self::ConfigureRequest { .. } => L2CAP_CONFIGURE_REQUEST,
            Self::ConfigureResponse { .. } => L2CAP_CONFIGURE_RESPONSE,
            Self::DisconnectionRequest { .. } => L2CAP_DISCONNECTION_REQUEST,
            Self::DisconnectionResponse { .. } => L2CAP_DISCONNECTION_RESPONSE,
            Self::EchoRequest { .. } => L2CAP_ECHO_REQUEST,
            Self::EchoResponse { .. } => L2CAP_ECHO_RESPONSE,
            Self::InformationRequest { .. } => L2CAP_INFORMATION_REQUEST,
            Self::InformationResponse { .. } => L2CAP_INFORMATION_RESPONSE,
            Self::ConnectionParameterUpdateRequest { .. } => {
                L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST
            }
            Self::ConnectionParameterUpdateResponse { .. } => {
                L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE
            }
            Self::LeCreditBasedConnectionRequest { .. } => {
                L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST
            }
            Self::LeCreditBasedConnectionResponse { .. } => {
                L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE
            }
            Self::FlowControlCredit { .. } => L2CAP_FLOW_CONTROL_CREDIT_IND,
            Self::CreditBasedConnectionRequest { .. } => L2CAP_CREDIT_BASED_CONNECTION_REQUEST,
            Self::CreditBasedConnectionResponse { .. } => L2CAP_CREDIT_BASED_CONNECTION_RESPONSE,
            Self::CreditBasedReconfigureRequest { .. } => L2CAP_CREDIT_BASED_RECONFIGURE_REQUEST,
            Self::CreditBasedReconfigureResponse { .. } => {
                L2CAP_CREDIT_BASED_RECONFIGURE_RESPONSE
            }
        }
    }

    /// Get the identifier for this signaling message
    pub fn identifier(&self) -> SignalId {
        match self {
            Self::CommandReject { identifier, .. }
            | Self::ConnectionRequest { identifier, .. }
            | Self::ConnectionResponse { identifier, .. }
            | Self::ConfigureRequest { identifier, .. }
            | Self::ConfigureResponse { identifier, .. }
            | Self::DisconnectionRequest { identifier, .. }
            | Self::DisconnectionResponse { identifier, .. }
            | Self::EchoRequest { identifier, .. }
            | Self::EchoResponse { identifier, .. }
            | Self::InformationRequest { identifier, .. }
            | Self::InformationResponse { identifier, .. }
            | Self::ConnectionParameterUpdateRequest { identifier, .. }
            | Self::ConnectionParameterUpdateResponse { identifier, .. }
            | Self::LeCreditBasedConnectionRequest { identifier, .. }
            | Self::LeCreditBasedConnectionResponse { identifier, .. }
            | Self::FlowControlCredit { identifier, .. }
            | Self::CreditBasedConnectionRequest { identifier, .. }
            | Self::CreditBasedConnectionResponse { identifier, .. }
            | Self::CreditBasedReconfigureRequest { identifier, .. }
            | Self::CreditBasedReconfigureResponse { identifier, .. } => *identifier,
        }
    }

    /// Parse configuration options, collecting the types of unknown non-hint options
    fn parse_config_options(
        reader: &mut PduReader<'_>,
    ) -> L2capResult<(ConfigOptions, Vec<u8>)> {
        let mut options = ConfigOptions::default();
        let mut unknown = Vec::new();

        while !reader.is_empty() {
            let raw_type = reader.read_u8("option type")?;
            let length = reader.read_u8("option length")? as usize;
            let mut value = reader.sub_reader(length, "option value")?;

            match raw_type & !L2CAP_CONF_HINT_BIT {
                L2CAP_CONF_MTU if length == 2 => {
                    options.mtu = Some(value.read_u16("mtu")?);
                }
                L2CAP_CONF_FLUSH_TIMEOUT if length == 2 => {
                    options.flush_timeout = Some(value.read_u16("flush timeout")?);
                }
                L2CAP_CONF_QOS if length == 22 => {
                    let _flags = value.read_u8("qos flags")?;
                    options.qos = Some(QosFlowSpec {
                        service_type: value.read_u8("service type")?,
                        token_rate: value.read_u32("token rate")?,
                        token_bucket_size: value.read_u32("token bucket size")?,
                        peak_bandwidth: value.read_u32("peak bandwidth")?,
                        latency: value.read_u32("latency")?,
                        delay_variation: value.read_u32("delay variation")?,
                    });
                }
                L2CAP_CONF_RFC if length == 9 => {
                    let raw_mode = value.read_u8("mode")?;
                    let tx_window_size = value.read_u8("tx window")?;
                    let max_transmit = value.read_u8("max transmit")?;
                    let retransmit_timeout = value.read_u16("retransmit timeout")?;
                    let monitor_timeout = value.read_u16("monitor timeout")?;
                    let max_pdu_size = value.read_u16("max pdu size")?;
                    match RetransmissionMode::from_u8(raw_mode) {
                        Some(mode) => {
                            options.retransmission = Some(RetransmissionFlowControl {
                                mode,
                                tx_window_size,
                                max_transmit,
                                retransmit_timeout,
                                monitor_timeout,
                                max_pdu_size,
                            })
                        }
                        None => unknown.push(raw_type),
                    }
                }
                L2CAP_CONF_FCS if length == 1 => {
                    options.fcs = Some(value.read_u8("fcs")?);
                }
                L2CAP_CONF_EXT_WINDOW if length == 2 => {
                    options.ext_window_size = Some(value.read_u16("ext window")?);
                }
                L2CAP_CONF_MTU
                | L2CAP_CONF_FLUSH_TIMEOUT
                | L2CAP_CONF_QOS
                | L2CAP_CONF_RFC
                | L2CAP_CONF_FCS
                | L2CAP_CONF_EXT_WINDOW => {
                    return Err(L2capError::MalformedPdu("option length"));
                }
                _ if raw_type & L2CAP_CONF_HINT_BIT != 0 => {}
                _ => unknown.push(raw_type),
            }
        }

        Ok((options, unknown))
    }

    /// Serialize configuration options to bytes
    fn serialize_config_options(options: &ConfigOptions, w: &mut PduWriter) {
        if let Some(mtu) = options.mtu {
            w.put_u8(L2CAP_CONF_MTU);
            w.put_u8(2);
            w.put_u16(mtu);
        }

        if let Some(timeout) = options.flush_timeout {
            w.put_u8(L2CAP_CONF_FLUSH_TIMEOUT);
            w.put_u8(2);
            w.put_u16(timeout);
        }

        if let Some(qos) = options.qos {
            w.put_u8(L2CAP_CONF_QOS);
            w.put_u8(22);
            w.put_u8(0); // flags
            w.put_u8(qos.service_type);
            w.put_u32(qos.token_rate);
            w.put_u32(qos.token_bucket_size);
            w.put_u32(qos.peak_bandwidth);
            w.put_u32(qos.latency);
            w.put_u32(qos.delay_variation);
        }

        if let Some(rfc) = options.retransmission {
            w.put_u8(L2CAP_CONF_RFC);
            w.put_u8(9);
            w.put_u8(rfc.mode.value());
            w.put_u8(rfc.tx_window_size);
            w.put_u8(rfc.max_transmit);
            w.put_u16(rfc.retransmit_timeout);
            w.put_u16(rfc.monitor_timeout);
            w.put_u16(rfc.max_pdu_size);
        }

        if let Some(fcs) = options.fcs {
            w.put_u8(L2CAP_CONF_FCS);
            w.put_u8(1);
            w.put_u8(fcs);
        }

        if let Some(window) = options.ext_window_size {
            w.put_u8(L2CAP_CONF_EXT_WINDOW);
            w.put_u8(2);
            w.put_u16(window);
        }
    }

    fn read_cid_list(reader: &mut PduReader<'_>) -> L2capResult<Vec<u16>> {
        if reader.remaining() % 2 != 0 {
            return Err(L2capError::MalformedPdu("cid list"));
        }
        let mut cids = Vec::with_capacity(reader.remaining() / 2);
        while !reader.is_empty() {
            cids.push(reader.read_u16("cid")?);
        }
        Ok(cids)
    }

    /// Decode the parameters of one command
    fn parse_params(
        header: &L2capCommandHeader,
        params: &mut PduReader<'_>,
    ) -> L2capResult<Self> {
        let identifier = header.identifier;

        let message = match header.code {
            L2CAP_COMMAND_REJECT => Self::CommandReject {
                identifier,
                reason: params.read_u16("reject reason")?,
                data: params.rest(),
            },

            L2CAP_CONNECTION_REQUEST => Self::ConnectionRequest {
                identifier,
                psm: params.read_u16("psm")?,
                source_cid: params.read_u16("source cid")?,
            },

            L2CAP_CONNECTION_RESPONSE => Self::ConnectionResponse {
                identifier,
                destination_cid: params.read_u16("destination cid")?,
                source_cid: params.read_u16("source cid")?,
                result: params.read_u16("result")?,
                status: params.read_u16("status")?,
            },

            L2CAP_CONFIGURE_REQUEST => {
                let destination_cid = params.read_u16("destination cid")?;
                let flags = params.read_u16("flags")?;
                let (options, unknown_options) = Self::parse_config_options(params)?;
                Self::ConfigureRequest {
                    identifier,
                    destination_cid,
                    flags,
                    options,
                    unknown_options,
                }
            }

            L2CAP_CONFIGURE_RESPONSE => {
                let source_cid = params.read_u16("source cid")?;
                let flags = params.read_u16("flags")?;
                let result = params.read_u16("result")?;
                let (options, _) = Self::parse_config_options(params)?;
                Self::ConfigureResponse {
                    identifier,
                    source_cid,
                    flags,
                    result,
                    options,
                }
            }

            L2CAP_DISCONNECTION_REQUEST => Self::DisconnectionRequest {
                identifier,
                destination_cid: params.read_u16("destination cid")?,
                source_cid: params.read_u16("source cid")?,
            },

            L2CAP_DISCONNECTION_RESPONSE => Self::DisconnectionResponse {
                identifier,
                destination_cid: params.read_u16("destination cid")?,
                source_cid: params.read_u16("source cid")?,
            },

            L2CAP_ECHO_REQUEST => Self::EchoRequest {
                identifier,
                data: params.rest(),
            },

            L2CAP_ECHO_RESPONSE => Self::EchoResponse {
                identifier,
                data: params.rest(),
            },

            L2CAP_INFORMATION_REQUEST => Self::InformationRequest {
                identifier,
                info_type: params.read_u16("info type")?,
            },

            L2CAP_INFORMATION_RESPONSE => Self::InformationResponse {
                identifier,
                info_type: params.read_u16("info type")?,
                result: params.read_u16("result")?,
                data: params.rest(),
            },

            L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST => Self::ConnectionParameterUpdateRequest {
                identifier,
                params: ConnectionParameterUpdate {
                    conn_interval_min: params.read_u16("interval min")?,
                    conn_interval_max: params.read_u16("interval max")?,
                    conn_latency: params.read_u16("latency")?,
                    supervision_timeout: params.read_u16("timeout")?,
                },
            },

            L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE => {
                Self::ConnectionParameterUpdateResponse {
                    identifier,
                    result: params.read_u16("result")?,
                }
            }

            L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST => Self::LeCreditBasedConnectionRequest {
                identifier,
                le_psm: params.read_u16("le psm")?,
                source_cid: params.read_u16("source cid")?,
                mtu: params.read_u16("mtu")?,
                mps: params.read_u16("mps")?,
                initial_credits: params.read_u16("initial credits")?,
            },

            L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE => Self::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid: params.read_u16("destination cid")?,
                mtu: params.read_u16("mtu")?,
                mps: params.read_u16("mps")?,
                initial_credits: params.read_u16("initial credits")?,
                result: params.read_u16("result")?,
            },

            L2CAP_FLOW_CONTROL_CREDIT_IND => Self::FlowControlCredit {
                identifier,
                cid: params.read_u16("cid")?,
                credits: params.read_u16("credits")?,
            },

            L2CAP_CREDIT_BASED_CONNECTION_REQUEST => {
                let spsm = params.read_u16("spsm")?;
                let mtu = params.read_u16("mtu")?;
                let mps = params.read_u16("mps")?;
                let initial_credits = params.read_u16("initial credits")?;
                let source_cids = Self::read_cid_list(params)?;
                if source_cids.is_empty() {
                    return Err(L2capError::MalformedPdu("empty source cid list"));
                }
                Self::CreditBasedConnectionRequest {
                    identifier,
                    spsm,
                    mtu,
                    mps,
                    initial_credits,
                    source_cids,
                }
            }

            L2CAP_CREDIT_BASED_CONNECTION_RESPONSE => {
                let mtu = params.read_u16("mtu")?;
                let mps = params.read_u16("mps")?;
                let initial_credits = params.read_u16("initial credits")?;
                let result = params.read_u16("result")?;
                let destination_cids = Self::read_cid_list(params)?;
                Self::CreditBasedConnectionResponse {
                    identifier,
                    mtu,
                    mps,
                    initial_credits,
                    result,
                    destination_cids,
                }
            }

            L2CAP_CREDIT_BASED_RECONFIGURE_REQUEST => {
                let mtu = params.read_u16("mtu")?;
                let mps = params.read_u16("mps")?;
                let destination_cids = Self::read_cid_list(params)?;
                if destination_cids.is_empty() {
                    return Err(L2capError::MalformedPdu("empty destination cid list"));
                }
                Self::CreditBasedReconfigureRequest {
                    identifier,
                    mtu,
                    mps,
                    destination_cids,
                }
            }

            L2CAP_CREDIT_BASED_RECONFIGURE_RESPONSE => Self::CreditBasedReconfigureResponse {
                identifier,
                result: params.read_u16("result")?,
            },

            _ => return Err(L2capError::NotSupported),
        };

        Ok(message)
    }

    /// Parse a single signaling command from raw bytes
    pub fn parse(data: &[u8]) -> L2capResult<Self> {
        let mut reader = PduReader::new(data);
        let header = L2capCommandHeader::read(&mut reader)?;
        let mut params = reader.sub_reader(header.length as usize, "command parameters")?;
        Self::parse_params(&header, &mut params)
    }

    /// Split a signaling frame into its commands.
    ///
    /// Each command is decoded independently; a bad one yields an error entry
    /// carrying its identifier so it can be rejected. A truncated command
    /// header ends the walk.
    pub fn parse_all(payload: &[u8]) -> Vec<Result<Self, CommandError>> {
        let mut reader = PduReader::new(payload);
        let mut commands = Vec::new();

        while reader.remaining() >= L2CAP_COMMAND_HEADER_SIZE {
            let header = match L2capCommandHeader::read(&mut reader) {
                Ok(header) => header,
                Err(_) => break,
            };

            let parsed = match reader.sub_reader(header.length as usize, "command parameters") {
                Ok(mut params) => Self::parse_params(&header, &mut params),
                Err(e) => {
                    // Length runs past the frame: nothing after it can be trusted
                    commands.push(Err(CommandError {
                        identifier: header.identifier,
                        code: header.code,
                        error: e,
                    }));
                    break;
                }
            };

            commands.push(parsed.map_err(|error| CommandError {
                identifier: header.identifier,
                code: header.code,
                error,
            }));
        }

        commands
    }

    /// Serialize the signaling message to bytes for transmission
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = PduWriter::new();

        match self {
            Self::CommandReject { reason, data, .. } => {
                w.put_u16(*reason);
                w.put_bytes(data);
            }

            Self::ConnectionRequest {
                psm, source_cid, ..
            } => {
                w.put_u16(*psm);
                w.put_u16(*source_cid);
            }

            Self::ConnectionResponse {
                destination_cid,
                source_cid,
                result,
                status,
                ..
            } => {
                w.put_u16(*destination_cid);
                w.put_u16(*source_cid);
                w.put_u16(*result);
                w.put_u16(*status);
            }

            Self::ConfigureRequest {
                destination_cid,
                flags,
                options,
                ..
            } => {
                w.put_u16(*destination_cid);
                w.put_u16(*flags);
                Self::serialize_config_options(options, &mut w);
            }

            Self::ConfigureResponse {
                source_cid,
                flags,
                result,
                options,
                ..
            } => {
                w.put_u16(*source_cid);
                w.put_u16(*flags);
                w.put_u16(*result);
                Self::serialize_config_options(options, &mut w);
            }

            Self::DisconnectionRequest {
                destination_cid,
                source_cid,
                ..
            }
            | Self::DisconnectionResponse {
                destination_cid,
                source_cid,
                ..
            } => {
                w.put_u16(*destination_cid);
                w.put_u16(*source_cid);
            }

            Self::EchoRequest { data, .. } | Self::EchoResponse { data, .. } => {
                w.put_bytes(data);
            }

            Self::InformationRequest { info_type, .. } => {
                w.put_u16(*info_type);
            }

            Self::InformationResponse {
                info_type,
                result,
                data,
                ..
            } => {
                w.put_u16(*info_type);
                w.put_u16(*result);
                w.put_bytes(data);
            }

            Self::ConnectionParameterUpdateRequest { params, .. } => {
                w.put_u16(params.conn_interval_min);
                w.put_u16(params.conn_interval_max);
                w.put_u16(params.conn_latency);
                w.put_u16(params.supervision_timeout);
            }

            Self::ConnectionParameterUpdateResponse { result, .. }
            | Self::CreditBasedReconfigureResponse { result, .. } => {
                w.put_u16(*result);
            }

            Self::LeCreditBasedConnectionRequest {
                le_psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
                ..
            } => {
                w.put_u16(*le_psm);
                w.put_u16(*source_cid);
                w.put_u16(*mtu);
                w.put_u16(*mps);
                w.put_u16(*initial_credits);
            }

            Self::LeCreditBasedConnectionResponse {
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
                ..
            } => {
                w.put_u16(*destination_cid);
                w.put_u16(*mtu);
                w.put_u16(*mps);
                w.put_u16(*initial_credits);
                w.put_u16(*result);
            }

            Self::FlowControlCredit { cid, credits, .. } => {
                w.put_u16(*cid);
                w.put_u16(*credits);
            }

            Self::CreditBasedConnectionRequest {
                spsm,
                mtu,
                mps,
                initial_credits,
                source_cids,
                ..
            } => {
                w.put_u16(*spsm);
                w.put_u16(*mtu);
                w.put_u16(*mps);
                w.put_u16(*initial_credits);
                for cid in source_cids {
                    w.put_u16(*cid);
                }
            }

            Self::CreditBasedConnectionResponse {
                mtu,
                mps,
                initial_credits,
                result,
                destination_cids,
                ..
            } => {
                w.put_u16(*mtu);
                w.put_u16(*mps);
                w.put_u16(*initial_credits);
                w.put_u16(*result);
                for cid in destination_cids {
                    w.put_u16(*cid);
                }
            }

            Self::CreditBasedReconfigureRequest {
                mtu,
                mps,
                destination_cids,
                ..
            } => {
                w.put_u16(*mtu);
                w.put_u16(*mps);
                for cid in destination_cids {
                    w.put_u16(*cid);
                }
            }
        }

        let params = w.into_bytes();
        let mut out = PduWriter::new();
        L2capCommandHeader::new(self.command_code(), self.identifier(), params.len() as u16)
            .write(&mut out);
        out.put_bytes(&params);
        out.into_bytes()
    }

    /// Create a signaling L2CAP packet from this message
    pub fn to_packet(&self, transport: ConnectionType) -> L2capPacket {
        L2capPacket::new(transport.signaling_cid(), self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_request_wire_format() {
        let msg = SignalingMessage::ConnectionRequest {
            identifier: 7,
            psm: 0x0001,
            source_cid: 0x0040,
        };
        assert_eq!(
            msg.serialize(),
            vec![0x02, 0x07, 0x04, 0x00, 0x01, 0x00, 0x40, 0x00]
        );
        assert_eq!(SignalingMessage::parse(&msg.serialize()).unwrap(), msg);
    }

    #[test]
    fn test_credit_based_request_carries_cid_list() {
        let msg = SignalingMessage::CreditBasedConnectionRequest {
            identifier: 3,
            spsm: 0x0027,
            mtu: 100,
            mps: 100,
            initial_credits: 10,
            source_cids: vec![0x40, 0x41, 0x42],
        };
        let bytes = msg.serialize();
        assert_eq!(bytes[2], 14);
        assert_eq!(SignalingMessage::parse(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_config_request_reports_unknown_options() {
        // MTU 256, hinted unknown option 0x90, unknown option 0x10
        let params = [
            0x40, 0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x01, 0x90, 0x01, 0xAA, 0x10, 0x00,
        ];
        let mut frame = vec![L2CAP_CONFIGURE_REQUEST, 1, params.len() as u8, 0];
        frame.extend_from_slice(&params);

        match SignalingMessage::parse(&frame).unwrap() {
            SignalingMessage::ConfigureRequest {
                options,
                unknown_options,
                ..
            } => {
                assert_eq!(options.mtu, Some(256));
                assert_eq!(unknown_options, vec![0x10]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_all_splits_commands_and_flags_bad_ones() {
        let mut frame = SignalingMessage::EchoRequest {
            identifier: 1,
            data: vec![1, 2, 3],
        }
        .serialize();
        // Unknown command code 0x7F
        frame.extend_from_slice(&[0x7F, 0x02, 0x00, 0x00]);
        frame.extend_from_slice(
            &SignalingMessage::InformationRequest {
                identifier: 3,
                info_type: L2CAP_INFO_EXTENDED_FEATURES,
            }
            .serialize(),
        );

        let commands = SignalingMessage::parse_all(&frame);
        assert_eq!(commands.len(), 3);
        assert!(commands[0].is_ok());
        let err = commands[1].as_ref().unwrap_err();
        assert_eq!(err.identifier, 2);
        assert!(matches!(err.error, L2capError::NotSupported));
        assert!(commands[2].is_ok());
    }

    #[test]
    fn test_odd_cid_list_is_malformed() {
        let frame = [
            L2CAP_CREDIT_BASED_RECONFIGURE_REQUEST,
            1,
            7,
            0,
            0x64,
            0,
            0x64,
            0,
            0x40,
            0,
            0x41,
        ];
        assert!(matches!(
            SignalingMessage::parse(&frame),
            Err(L2capError::MalformedPdu(_))
        ));
    }
}
