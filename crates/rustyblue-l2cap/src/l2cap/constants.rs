//! L2CAP protocol constants
//!
//! Values from the Bluetooth Core Specification Vol 3, Part A.

// Basic frame
pub const L2CAP_BASIC_HEADER_SIZE: usize = 4;
pub const L2CAP_COMMAND_HEADER_SIZE: usize = 4;
/// SDU length field carried by the first K-frame of an SDU
pub const L2CAP_SDU_LENGTH_FIELD_SIZE: usize = 2;

// Fixed channel identifiers
pub const L2CAP_NULL_CID: u16 = 0x0000;
pub const L2CAP_SIGNALING_CID: u16 = 0x0001;
pub const L2CAP_CONNECTIONLESS_CID: u16 = 0x0002;
pub const L2CAP_ATTRIBUTE_PROTOCOL_CID: u16 = 0x0004;
pub const L2CAP_LE_SIGNALING_CID: u16 = 0x0005;
pub const L2CAP_SMP_CID: u16 = 0x0006;

// Dynamic channel identifiers
pub const L2CAP_DYNAMIC_CID_MIN: u16 = 0x0040;
pub const L2CAP_DYNAMIC_CID_MAX: u16 = 0xFFFF;
pub const L2CAP_LE_DYNAMIC_CID_MAX: u16 = 0x007F;

// Signaling command codes
pub const L2CAP_COMMAND_REJECT: u8 = 0x01;
pub const L2CAP_CONNECTION_REQUEST: u8 = 0x02;
pub const L2CAP_CONNECTION_RESPONSE: u8 = 0x03;
pub const L2CAP_CONFIGURE_REQUEST: u8 = 0x04;
pub const L2CAP_CONFIGURE_RESPONSE: u8 = 0x05;
pub const L2CAP_DISCONNECTION_REQUEST: u8 = 0x06;
pub const L2CAP_DISCONNECTION_RESPONSE: u8 = 0x07;
pub const L2CAP_ECHO_REQUEST: u8 = 0x08;
pub const L2CAP_ECHO_RESPONSE: u8 = 0x09;
pub const L2CAP_INFORMATION_REQUEST: u8 = 0x0A;
pub const L2CAP_INFORMATION_RESPONSE: u8 = 0x0B;
pub const L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST: u8 = 0x12;
pub const L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE: u8 = 0x13;
pub const L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST: u8 = 0x14;
pub const L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE: u8 = 0x15;
pub const L2CAP_FLOW_CONTROL_CREDIT_IND: u8 = 0x16;
pub const L2CAP_CREDIT_BASED_CONNECTION_REQUEST: u8 = 0x17;
pub const L2CAP_CREDIT_BASED_CONNECTION_RESPONSE: u8 = 0x18;
pub const L2CAP_CREDIT_BASED_RECONFIGURE_REQUEST: u8 = 0x19;
pub const L2CAP_CREDIT_BASED_RECONFIGURE_RESPONSE: u8 = 0x1A;

// Command reject reasons
pub const L2CAP_REJECT_NOT_UNDERSTOOD: u16 = 0x0000;
pub const L2CAP_REJECT_MTU_EXCEEDED: u16 = 0x0001;
pub const L2CAP_REJECT_INVALID_CID: u16 = 0x0002;

// Classic connection response results
pub const L2CAP_CONN_SUCCESS: u16 = 0x0000;
pub const L2CAP_CONN_PENDING: u16 = 0x0001;
pub const L2CAP_CONN_NO_PSM: u16 = 0x0002;
pub const L2CAP_CONN_SECURITY_BLOCK: u16 = 0x0003;
pub const L2CAP_CONN_NO_RESOURCES: u16 = 0x0004;
pub const L2CAP_CONN_INVALID_SOURCE_CID: u16 = 0x0006;
pub const L2CAP_CONN_SOURCE_CID_ALREADY_ALLOCATED: u16 = 0x0007;

// Classic connection response status (result == pending)
pub const L2CAP_CONN_STATUS_NO_INFO: u16 = 0x0000;
pub const L2CAP_CONN_STATUS_AUTHENTICATION_PENDING: u16 = 0x0001;
pub const L2CAP_CONN_STATUS_AUTHORIZATION_PENDING: u16 = 0x0002;

// Credit based (LE and enhanced) connection results
pub const L2CAP_LE_RESULT_SUCCESS: u16 = 0x0000;
pub const L2CAP_LE_RESULT_SPSM_NOT_SUPPORTED: u16 = 0x0002;
pub const L2CAP_LE_RESULT_NO_RESOURCES: u16 = 0x0004;
pub const L2CAP_LE_RESULT_INSUFFICIENT_AUTHENTICATION: u16 = 0x0005;
pub const L2CAP_LE_RESULT_INSUFFICIENT_AUTHORIZATION: u16 = 0x0006;
pub const L2CAP_LE_RESULT_INSUFFICIENT_ENCRYPTION_KEY_SIZE: u16 = 0x0007;
pub const L2CAP_LE_RESULT_INSUFFICIENT_ENCRYPTION: u16 = 0x0008;
pub const L2CAP_LE_RESULT_INVALID_SOURCE_CID: u16 = 0x0009;
pub const L2CAP_LE_RESULT_SOURCE_CID_ALREADY_ALLOCATED: u16 = 0x000A;
pub const L2CAP_LE_RESULT_UNACCEPTABLE_PARAMETERS: u16 = 0x000B;
pub const L2CAP_LE_RESULT_INVALID_PARAMETERS: u16 = 0x000C;

// Credit based reconfigure results
pub const L2CAP_RECONFIG_SUCCESS: u16 = 0x0000;
pub const L2CAP_RECONFIG_MTU_REDUCTION_NOT_ALLOWED: u16 = 0x0001;
pub const L2CAP_RECONFIG_MPS_REDUCTION_NOT_ALLOWED: u16 = 0x0002;
pub const L2CAP_RECONFIG_INVALID_DESTINATION_CID: u16 = 0x0003;
pub const L2CAP_RECONFIG_UNACCEPTABLE_PARAMETERS: u16 = 0x0004;

// Configuration response results
pub const L2CAP_CFG_SUCCESS: u16 = 0x0000;
pub const L2CAP_CFG_UNACCEPTABLE_PARAMS: u16 = 0x0001;
pub const L2CAP_CFG_REJECTED: u16 = 0x0002;
pub const L2CAP_CFG_UNKNOWN_OPTIONS: u16 = 0x0003;
pub const L2CAP_CFG_PENDING: u16 = 0x0004;
pub const L2CAP_CFG_FLOW_SPEC_REJECTED: u16 = 0x0005;

/// Continuation flag in configuration request/response
pub const L2CAP_CFG_FLAG_CONTINUATION: u16 = 0x0001;

// Configuration option types
pub const L2CAP_CONF_MTU: u8 = 0x01;
pub const L2CAP_CONF_FLUSH_TIMEOUT: u8 = 0x02;
pub const L2CAP_CONF_QOS: u8 = 0x03;
pub const L2CAP_CONF_RFC: u8 = 0x04;
pub const L2CAP_CONF_FCS: u8 = 0x05;
pub const L2CAP_CONF_EXT_FLOW_SPEC: u8 = 0x06;
pub const L2CAP_CONF_EXT_WINDOW: u8 = 0x07;
/// Hint bit on an option type: unknown hinted options are skipped silently
pub const L2CAP_CONF_HINT_BIT: u8 = 0x80;

// Information request types and results
pub const L2CAP_INFO_CONNECTIONLESS_MTU: u16 = 0x0001;
pub const L2CAP_INFO_EXTENDED_FEATURES: u16 = 0x0002;
pub const L2CAP_INFO_FIXED_CHANNELS: u16 = 0x0003;
pub const L2CAP_INFO_SUCCESS: u16 = 0x0000;
pub const L2CAP_INFO_NOT_SUPPORTED: u16 = 0x0001;

// Connection parameter update results
pub const L2CAP_CONN_PARAM_UPDATE_ACCEPTED: u16 = 0x0000;
pub const L2CAP_CONN_PARAM_UPDATE_REJECTED: u16 = 0x0001;

// LE connection parameter bounds
pub const L2CAP_LE_CONN_INTERVAL_MIN: u16 = 0x0006;
pub const L2CAP_LE_CONN_INTERVAL_MAX: u16 = 0x0C80;
pub const L2CAP_LE_CONN_LATENCY_MAX: u16 = 0x01F3;
pub const L2CAP_LE_SUPERVISION_TIMEOUT_MIN: u16 = 0x000A;
pub const L2CAP_LE_SUPERVISION_TIMEOUT_MAX: u16 = 0x0C80;

// MTU bounds
pub const L2CAP_DEFAULT_MTU: u16 = 672;
pub const L2CAP_MIN_MTU: u16 = 48;
pub const L2CAP_SIGNALING_MTU: u16 = 672;
pub const L2CAP_LE_DEFAULT_MTU: u16 = 23;
pub const L2CAP_DEFAULT_FLUSH_TIMEOUT: u16 = 0xFFFF;

// Credit based channel bounds
pub const L2CAP_LE_MIN_MTU: u16 = 23;
pub const L2CAP_LE_MIN_MPS: u16 = 23;
pub const L2CAP_LE_MAX_MPS: u16 = 65533;
pub const L2CAP_ECOC_MIN_MTU: u16 = 64;
pub const L2CAP_ECOC_MIN_MPS: u16 = 64;
pub const L2CAP_LE_MAX_CREDITS: u16 = 65535;
/// Channels one enhanced credit based connection request may carry
pub const L2CAP_CREDIT_BASED_MAX_CIDS: usize = 5;

// Channel mode values carried in the retransmission and flow control option
pub const L2CAP_MODE_BASIC: u8 = 0x00;
pub const L2CAP_MODE_RETRANSMISSION: u8 = 0x01;
pub const L2CAP_MODE_FLOW_CONTROL: u8 = 0x02;
pub const L2CAP_MODE_ERTM: u8 = 0x03;
pub const L2CAP_MODE_STREAMING: u8 = 0x04;

// Extended feature mask bits
pub const L2CAP_EXTFEA_FLOW_CONTROL: u32 = 0x0000_0001;
pub const L2CAP_EXTFEA_RETRANSMISSION: u32 = 0x0000_0002;
pub const L2CAP_EXTFEA_ENH_RETRANS: u32 = 0x0000_0008;
pub const L2CAP_EXTFEA_STREAM_MODE: u32 = 0x0000_0010;
pub const L2CAP_EXTFEA_NO_CRC: u32 = 0x0000_0020;
pub const L2CAP_EXTFEA_FIXED_CHNLS: u32 = 0x0000_0080;
pub const L2CAP_EXTFEA_ENHANCED_CREDIT_BASED: u32 = 0x0000_0400;

/// Fixed channels we report as supported: signaling, connectionless
pub const L2CAP_FIXED_CHANNELS_SUPPORTED: u64 = 0x0000_0000_0000_0006;

// HCI disconnect reason used when an idle link is dropped
pub const HCI_ERR_PEER_USER: u8 = 0x13;
