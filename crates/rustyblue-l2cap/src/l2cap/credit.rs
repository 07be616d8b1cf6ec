//! Credit based flow control
//!
//! K-frame segmentation and reassembly and the credit arithmetic shared by LE
//! credit based and enhanced credit based channels. Every K-frame costs the
//! sender one credit.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::*;
use super::types::CreditOverflowPolicy;

/// Peer behaviour that breaks the credit based rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CreditViolation {
    #[error("K-frame received without credit")]
    NoCredit,
    #[error("K-frame of {len} bytes exceeds MPS {mps}")]
    FrameExceedsMps { len: usize, mps: u16 },
    #[error("SDU length {len} exceeds MTU {mtu}")]
    SduExceedsMtu { len: usize, mtu: u16 },
    #[error("K-frame runs past the announced SDU length")]
    SduOverrun,
    #[error("first K-frame lacks the SDU length field")]
    MissingSduLength,
    #[error("credit grant overflows the maximum of {}", L2CAP_LE_MAX_CREDITS)]
    CreditOverflow,
}

/// Split an SDU into K-frame payloads of at most `mps` bytes.
///
/// The first frame starts with the two byte SDU length.
pub fn segment_sdu(sdu: &[u8], mps: u16) -> Vec<Vec<u8>> {
    let mps = mps as usize;
    let mut frames = Vec::with_capacity(sdu.len() / mps.max(1) + 1);

    let first_len = sdu.len().min(mps.saturating_sub(L2CAP_SDU_LENGTH_FIELD_SIZE));
    let mut first = Vec::with_capacity(L2CAP_SDU_LENGTH_FIELD_SIZE + first_len);
    let mut len_field = [0u8; L2CAP_SDU_LENGTH_FIELD_SIZE];
    LittleEndian::write_u16(&mut len_field, sdu.len() as u16);
    first.extend_from_slice(&len_field);
    first.extend_from_slice(&sdu[..first_len]);
    frames.push(first);

    if mps > 0 {
        for chunk in sdu[first_len..].chunks(mps) {
            frames.push(chunk.to_vec());
        }
    }

    frames
}

/// Inbound SDU being rebuilt from K-frames
#[derive(Debug, Default)]
pub struct SduReassembly {
    sdu_len: usize,
    buf: Vec<u8>,
    active: bool,
}

impl SduReassembly {
    /// Feed one K-frame payload; returns the SDU once it is complete
    pub fn push(
        &mut self,
        frame: &[u8],
        mtu: u16,
        mps: u16,
    ) -> Result<Option<Vec<u8>>, CreditViolation> {
        if frame.len() > mps as usize {
            self.reset();
            return Err(CreditViolation::FrameExceedsMps {
                len: frame.len(),
                mps,
            });
        }

        let data = if self.active {
            frame
        } else {
            if frame.len() < L2CAP_SDU_LENGTH_FIELD_SIZE {
                return Err(CreditViolation::MissingSduLength);
            }
            let sdu_len = LittleEndian::read_u16(frame) as usize;
            if sdu_len > mtu as usize {
                return Err(CreditViolation::SduExceedsMtu { len: sdu_len, mtu });
            }
            self.sdu_len = sdu_len;
            self.buf = Vec::with_capacity(sdu_len);
            self.active = true;
            &frame[L2CAP_SDU_LENGTH_FIELD_SIZE..]
        };

        if self.buf.len() + data.len() > self.sdu_len {
            self.reset();
            return Err(CreditViolation::SduOverrun);
        }
        self.buf.extend_from_slice(data);

        if self.buf.len() == self.sdu_len {
            self.active = false;
            Ok(Some(std::mem::take(&mut self.buf)))
        } else {
            Ok(None)
        }
    }

    pub fn reset(&mut self) {
        self.active = false;
        self.sdu_len = 0;
        self.buf.clear();
    }

    pub fn in_progress(&self) -> bool {
        self.active
    }
}

/// Add a peer credit grant to our send credits
pub fn grant_credits(
    current: u16,
    grant: u16,
    policy: CreditOverflowPolicy,
) -> Result<u16, CreditViolation> {
    match current.checked_add(grant) {
        Some(total) => Ok(total),
        None => match policy {
            CreditOverflowPolicy::Disconnect => Err(CreditViolation::CreditOverflow),
            CreditOverflowPolicy::Clamp => Ok(L2CAP_LE_MAX_CREDITS),
        },
    }
}

/// Credits to hand the peer once its remaining allowance falls to the low water mark
pub fn replenishment(remaining: u16, low_water_mark: u16, credit_default: u16) -> Option<u16> {
    if remaining <= low_water_mark && remaining < credit_default {
        Some(credit_default - remaining)
    } else {
        None
    }
}
