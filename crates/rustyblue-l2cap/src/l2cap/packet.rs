//! L2CAP Packet handling
//!
//! Basic frame and command headers plus the little-endian reader and writer
//! the signaling codec is built on.

use std::io::Cursor;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use super::constants::*;
use super::types::*;

/// L2CAP Packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capHeader {
    /// Length of the L2CAP payload in bytes
    pub length: u16,
    /// Channel Identifier
    pub channel_id: u16,
}

impl L2capHeader {
    pub fn new(length: u16, channel_id: u16) -> Self {
        Self { length, channel_id }
    }

    /// Parse an L2CAP header from raw bytes
    pub fn parse(data: &[u8]) -> L2capResult<Self> {
        let mut reader = PduReader::new(data);
        let length = reader.read_u16("basic header length")?;
        let channel_id = reader.read_u16("basic header cid")?;
        Ok(Self { length, channel_id })
    }

    pub fn to_bytes(&self) -> [u8; L2CAP_BASIC_HEADER_SIZE] {
        let mut result = [0u8; L2CAP_BASIC_HEADER_SIZE];
        LittleEndian::write_u16(&mut result[0..2], self.length);
        LittleEndian::write_u16(&mut result[2..4], self.channel_id);
        result
    }
}

/// A basic L2CAP frame: header plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2capPacket {
    pub header: L2capHeader,
    pub payload: Vec<u8>,
}

impl L2capPacket {
    /// Create a new L2CAP packet; the length field is taken from the payload
    pub fn new(channel_id: u16, payload: Vec<u8>) -> Self {
        Self {
            header: L2capHeader::new(payload.len() as u16, channel_id),
            payload,
        }
    }

    pub fn channel_id(&self) -> u16 {
        self.header.channel_id
    }

    /// Parse an L2CAP packet from raw bytes
    pub fn parse(data: &[u8]) -> L2capResult<Self> {
        let header = L2capHeader::parse(data)?;
        let end = L2CAP_BASIC_HEADER_SIZE + header.length as usize;
        if data.len() < end {
            return Err(L2capError::MalformedPdu("basic frame shorter than its length"));
        }
        Ok(Self {
            header,
            payload: data[L2CAP_BASIC_HEADER_SIZE..end].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.size());
        result.extend_from_slice(&self.header.to_bytes());
        result.extend_from_slice(&self.payload);
        result
    }

    /// Get the full size of the packet in bytes
    pub fn size(&self) -> usize {
        L2CAP_BASIC_HEADER_SIZE + self.payload.len()
    }
}

/// L2CAP Command header used in signaling packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capCommandHeader {
    pub code: u8,
    pub identifier: u8,
    /// Length of command parameters
    pub length: u16,
}

impl L2capCommandHeader {
    pub fn new(code: u8, identifier: u8, length: u16) -> Self {
        Self {
            code,
            identifier,
            length,
        }
    }

    pub fn read(reader: &mut PduReader<'_>) -> L2capResult<Self> {
        Ok(Self {
            code: reader.read_u8("command code")?,
            identifier: reader.read_u8("command identifier")?,
            length: reader.read_u16("command length")?,
        })
    }

    pub fn write(&self, writer: &mut PduWriter) {
        writer.put_u8(self.code);
        writer.put_u8(self.identifier);
        writer.put_u16(self.length);
    }
}

/// Bounds-checked little-endian reader over a PDU.
///
/// Every read names the field it is after so a truncated PDU reports where
/// it ran out.
pub struct PduReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> PduReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    pub fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len() as u64;
        len.saturating_sub(self.cursor.position()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self, field: &'static str) -> L2capResult<u8> {
        self.cursor.read_u8().map_err(|_| L2capError::MalformedPdu(field))
    }

    pub fn read_u16(&mut self, field: &'static str) -> L2capResult<u16> {
        self.cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| L2capError::MalformedPdu(field))
    }

    pub fn read_u32(&mut self, field: &'static str) -> L2capResult<u32> {
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| L2capError::MalformedPdu(field))
    }

    /// Split off a sub-reader over the next `len` bytes
    pub fn sub_reader(&mut self, len: usize, field: &'static str) -> L2capResult<PduReader<'a>> {
        let start = self.cursor.position() as usize;
        let data: &'a [u8] = *self.cursor.get_ref();
        let slice = data
            .get(start..start + len)
            .ok_or(L2capError::MalformedPdu(field))?;
        self.cursor.set_position((start + len) as u64);
        Ok(PduReader::new(slice))
    }

    pub fn rest(&mut self) -> Vec<u8> {
        let start = (self.cursor.position() as usize).min(self.cursor.get_ref().len());
        let data = self.cursor.get_ref()[start..].to_vec();
        self.cursor.set_position(self.cursor.get_ref().len() as u64);
        data
    }
}

/// Little-endian PDU builder
#[derive(Debug, Default)]
pub struct PduWriter {
    buf: Vec<u8>,
}

impl PduWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        let mut b = [0u8; 2];
        LittleEndian::write_u16(&mut b, value);
        self.buf.extend_from_slice(&b);
    }

    pub fn put_u32(&mut self, value: u32) {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, value);
        self.buf.extend_from_slice(&b);
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
