//! Protocol/Service Multiplexer (PSM) handling for L2CAP
//!
//! Classic channels are addressed by PSM, LE credit based channels by SPSM.

use std::collections::HashSet;
use std::fmt;

use super::types::ConnectionType;

/// First PSM of the classic dynamic range
pub const L2CAP_DYNAMIC_PSM_START: u16 = 0x1001;
/// First SPSM of the LE dynamic range
pub const L2CAP_LE_DYNAMIC_PSM_START: u16 = 0x0080;
pub const L2CAP_LE_PSM_MAX: u16 = 0x00FF;

/// Well-known PSM values plus a dynamic variant.
///
/// See assigned numbers: https://www.bluetooth.com/specifications/assigned-numbers/logical-link-control/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum PSM {
    /// Service Discovery Protocol
    SDP,
    /// RFCOMM protocol
    RFCOMM,
    /// BNEP protocol
    BNEP,
    /// HID Control
    HID_CONTROL,
    /// HID Interrupt
    HID_INTERRUPT,
    /// AVCTP protocol
    AVCTP,
    /// AVDTP protocol
    AVDTP,
    /// AVCTP Browsing
    AVCTP_BROWSING,
    /// ATT over a dynamic channel
    ATT,
    /// Enhanced ATT (LE SPSM)
    EATT,
    /// Any other valid value
    Dynamic(u16),
}

impl PSM {
    /// Get the PSM value as u16
    pub fn value(&self) -> u16 {
        match self {
            PSM::SDP => 0x0001,
            PSM::RFCOMM => 0x0003,
            PSM::BNEP => 0x000F,
            PSM::HID_CONTROL => 0x0011,
            PSM::HID_INTERRUPT => 0x0013,
            PSM::AVCTP => 0x0017,
            PSM::AVDTP => 0x0019,
            PSM::AVCTP_BROWSING => 0x001B,
            PSM::ATT => 0x001F,
            PSM::EATT => 0x0027,
            PSM::Dynamic(value) => *value,
        }
    }

    /// Map a raw value to a PSM, without checking validity
    pub fn from_value(value: u16) -> Self {
        match value {
            0x0001 => PSM::SDP,
            0x0003 => PSM::RFCOMM,
            0x000F => PSM::BNEP,
            0x0011 => PSM::HID_CONTROL,
            0x0013 => PSM::HID_INTERRUPT,
            0x0017 => PSM::AVCTP,
            0x0019 => PSM::AVDTP,
            0x001B => PSM::AVCTP_BROWSING,
            0x001F => PSM::ATT,
            0x0027 => PSM::EATT,
            other => PSM::Dynamic(other),
        }
    }

    /// Check the value against the addressing rules of a transport
    pub fn is_valid_for(&self, transport: ConnectionType) -> bool {
        match transport {
            ConnectionType::Classic => is_valid_classic_psm(self.value()),
            ConnectionType::LE => is_valid_le_psm(self.value()),
        }
    }
}

impl fmt::Display for PSM {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PSM::SDP => write!(f, "SDP (0x0001)"),
            PSM::RFCOMM => write!(f, "RFCOMM (0x0003)"),
            PSM::BNEP => write!(f, "BNEP (0x000F)"),
            PSM::HID_CONTROL => write!(f, "HID-Control (0x0011)"),
            PSM::HID_INTERRUPT => write!(f, "HID-Interrupt (0x0013)"),
            PSM::AVCTP => write!(f, "AVCTP (0x0017)"),
            PSM::AVDTP => write!(f, "AVDTP (0x0019)"),
            PSM::AVCTP_BROWSING => write!(f, "AVCTP-Browsing (0x001B)"),
            PSM::ATT => write!(f, "ATT (0x001F)"),
            PSM::EATT => write!(f, "EATT (0x0027)"),
            PSM::Dynamic(value) => write!(f, "PSM 0x{:04X}", value),
        }
    }
}

/// Classic PSMs have an odd low octet and an even high octet
pub fn is_valid_classic_psm(value: u16) -> bool {
    value & 0x0001 == 0x0001 && value & 0x0100 == 0
}

/// LE SPSMs occupy 0x0001-0x00FF
pub fn is_valid_le_psm(value: u16) -> bool {
    (0x0001..=L2CAP_LE_PSM_MAX).contains(&value)
}

/// Hands out dynamic PSMs that are not in use on a transport
#[derive(Debug)]
pub struct DynamicPsmAllocator {
    next_classic: u16,
    next_le: u16,
    in_use: HashSet<u16>,
}

impl Default for DynamicPsmAllocator {
    fn default() -> Self {
        Self {
            next_classic: L2CAP_DYNAMIC_PSM_START,
            next_le: L2CAP_LE_DYNAMIC_PSM_START,
            in_use: HashSet::new(),
        }
    }
}

impl DynamicPsmAllocator {
    /// Obtain a new dynamic PSM value, or `None` when the range is exhausted
    pub fn obtain(&mut self, transport: ConnectionType) -> Option<PSM> {
        match transport {
            ConnectionType::Classic => self.obtain_classic(),
            ConnectionType::LE => self.obtain_le(),
        }
    }

    fn obtain_classic(&mut self) -> Option<PSM> {
        // Odd values only; the walk skips those with bit 8 set
        let span = (0xFFFF - L2CAP_DYNAMIC_PSM_START) / 2 + 1;
        for _ in 0..span {
            let candidate = self.next_classic;
            self.next_classic = if candidate >= 0xFFFD {
                L2CAP_DYNAMIC_PSM_START
            } else {
                candidate + 2
            };
            if is_valid_classic_psm(candidate) && self.in_use.insert(candidate) {
                return Some(PSM::Dynamic(candidate));
            }
        }
        None
    }

    fn obtain_le(&mut self) -> Option<PSM> {
        let span = L2CAP_LE_PSM_MAX - L2CAP_LE_DYNAMIC_PSM_START + 1;
        for _ in 0..span {
            let candidate = self.next_le;
            self.next_le = if candidate >= L2CAP_LE_PSM_MAX {
                L2CAP_LE_DYNAMIC_PSM_START
            } else {
                candidate + 1
            };
            if self.in_use.insert(candidate) {
                return Some(PSM::Dynamic(candidate));
            }
        }
        None
    }

    /// Return a value obtained earlier
    pub fn free(&mut self, psm: PSM) -> bool {
        self.in_use.remove(&psm.value())
    }
}
