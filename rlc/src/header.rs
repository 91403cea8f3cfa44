//! RLC PDU Header Codec
//!
//! Packs and unpacks UMD, AMD and STATUS PDU headers according to
//! 3GPP TS 36.322 section 6.2.1. Data headers are written into the headroom
//! of a [`PduBuffer`] that already holds the payload, so the payload is never
//! copied.

use crate::RlcError;
use bitflags::bitflags;
use bytes::Buf;
use common::{PduBuffer, SnFieldLength};
use std::fmt;

/// Maximum number of length indicators in one data PDU
pub const MAX_LI_COUNT: usize = 128;

/// Largest value an 11-bit length indicator can carry
pub const MAX_LI_VALUE: usize = 0x7FF;

/// Fixed part of an AMD PDU header, always with a 10-bit SN
pub const AMD_FIXED_HEADER_LEN: usize = 2;

bitflags! {
    /// Framing Info (FI) field
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FramingInfo: u8 {
        /// Last byte of the data field is not the last byte of an SDU
        const NOT_END_ALIGNED = 0b01;
        /// First byte of the data field is not the first byte of an SDU
        const NOT_START_ALIGNED = 0b10;
    }
}

impl FramingInfo {
    /// First byte of the data field starts an SDU
    pub fn start_aligned(&self) -> bool {
        !self.contains(FramingInfo::NOT_START_ALIGNED)
    }

    /// Last byte of the data field ends an SDU
    pub fn end_aligned(&self) -> bool {
        !self.contains(FramingInfo::NOT_END_ALIGNED)
    }
}

/// Size of an E/LI chain holding `n_li` length indicators
#[inline]
pub fn li_chain_len(n_li: usize) -> usize {
    (n_li * 3 + 1) / 2
}

/// Packed size of a UMD PDU header
#[inline]
pub fn um_packed_length(sn_size: SnFieldLength, n_li: usize) -> usize {
    sn_size.fixed_header_len() + li_chain_len(n_li)
}

/// Packed size of an AMD PDU header
#[inline]
pub fn am_packed_length(n_li: usize) -> usize {
    AMD_FIXED_HEADER_LEN + li_chain_len(n_li)
}

/// Check the D/C bit of a received AM PDU
#[inline]
pub fn is_control_pdu(pdu: &[u8]) -> bool {
    pdu.first().map(|b| b & 0x80 == 0).unwrap_or(false)
}

/// UMD PDU header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UmdPduHeader {
    /// Framing info
    pub fi: FramingInfo,
    /// Sequence number
    pub sn: u16,
    /// SN field length
    pub sn_size: SnFieldLength,
    /// Length indicators
    pub li: Vec<u16>,
}

impl UmdPduHeader {
    /// Packed size of this header
    pub fn packed_len(&self) -> usize {
        um_packed_length(self.sn_size, self.li.len())
    }

    /// Prepend the header in front of the payload held by `pdu`
    pub fn write(&self, pdu: &mut PduBuffer) -> Result<(), RlcError> {
        check_li_list(&self.li)?;
        let len = self.packed_len();
        let out = pdu.prepend(len)?;
        let ext = u8::from(!self.li.is_empty());
        let fi = self.fi.bits() & 0x03;
        let fixed = match self.sn_size {
            SnFieldLength::Bits5 => {
                out[0] = fi << 6 | ext << 5 | (self.sn & 0x1F) as u8;
                1
            }
            SnFieldLength::Bits10 => {
                out[0] = fi << 3 | ext << 2 | ((self.sn & 0x300) >> 8) as u8;
                out[1] = (self.sn & 0xFF) as u8;
                2
            }
        };
        write_li_chain(&self.li, &mut out[fixed..]);
        Ok(())
    }

    /// Parse a header from the front of `pdu`, returning it with its length
    pub fn read(pdu: &[u8], sn_size: SnFieldLength) -> Result<(Self, usize), RlcError> {
        let mut buf = pdu;
        let fixed = sn_size.fixed_header_len();
        if buf.remaining() < fixed {
            return Err(RlcError::MalformedPdu(format!(
                "UMD PDU of {} bytes shorter than fixed header",
                pdu.len()
            )));
        }
        let (fi, ext, sn) = match sn_size {
            SnFieldLength::Bits5 => {
                let b = buf.get_u8();
                ((b >> 6) & 0x03, (b >> 5) & 0x01, (b & 0x1F) as u16)
            }
            SnFieldLength::Bits10 => {
                let b = buf.get_u8();
                let sn = ((b & 0x03) as u16) << 8 | buf.get_u8() as u16;
                ((b >> 3) & 0x03, (b >> 2) & 0x01, sn)
            }
        };
        let li = if ext == 1 { read_li_chain(buf)? } else { Vec::new() };
        let header = Self {
            fi: FramingInfo::from_bits_truncate(fi),
            sn,
            sn_size,
            li,
        };
        let len = header.packed_len();
        check_data_field(&header.li, pdu.len(), len)?;
        Ok((header, len))
    }
}

/// AMD PDU header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmdPduHeader {
    /// Polling bit
    pub poll: bool,
    /// Framing info
    pub fi: FramingInfo,
    /// Sequence number (10 bits)
    pub sn: u16,
    /// Length indicators
    pub li: Vec<u16>,
}

impl AmdPduHeader {
    /// Packed size of this header
    pub fn packed_len(&self) -> usize {
        am_packed_length(self.li.len())
    }

    /// Prepend the header in front of the payload held by `pdu`
    pub fn write(&self, pdu: &mut PduBuffer) -> Result<(), RlcError> {
        check_li_list(&self.li)?;
        let len = self.packed_len();
        let out = pdu.prepend(len)?;
        let ext = u8::from(!self.li.is_empty());
        // D/C = 1, RF = 0
        out[0] = 0x80
            | u8::from(self.poll) << 5
            | (self.fi.bits() & 0x03) << 3
            | ext << 2
            | ((self.sn & 0x300) >> 8) as u8;
        out[1] = (self.sn & 0xFF) as u8;
        write_li_chain(&self.li, &mut out[AMD_FIXED_HEADER_LEN..]);
        Ok(())
    }

    /// Parse a header from the front of `pdu`, returning it with its length
    pub fn read(pdu: &[u8]) -> Result<(Self, usize), RlcError> {
        let mut buf = pdu;
        if buf.remaining() < AMD_FIXED_HEADER_LEN {
            return Err(RlcError::MalformedPdu(format!(
                "AMD PDU of {} bytes shorter than fixed header",
                pdu.len()
            )));
        }
        let b0 = buf.get_u8();
        if b0 & 0x80 == 0 {
            return Err(RlcError::MalformedPdu("control PDU parsed as data".into()));
        }
        if b0 & 0x40 != 0 {
            return Err(RlcError::MalformedPdu("AMD PDU segments are not supported".into()));
        }
        let sn = ((b0 & 0x03) as u16) << 8 | buf.get_u8() as u16;
        let ext = (b0 >> 2) & 0x01;
        let li = if ext == 1 { read_li_chain(buf)? } else { Vec::new() };
        let header = Self {
            poll: b0 & 0x20 != 0,
            fi: FramingInfo::from_bits_truncate((b0 >> 3) & 0x03),
            sn,
            li,
        };
        let len = header.packed_len();
        check_data_field(&header.li, pdu.len(), len)?;
        Ok((header, len))
    }
}

/// STATUS PDU with whole-PDU NACK granularity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusPdu {
    /// SN of the next not-yet-reported PDU
    pub ack_sn: u16,
    /// Missing SNs below `ack_sn`, in transmission order
    pub nack_sn: Vec<u16>,
}

impl StatusPdu {
    /// Packed size of a status PDU carrying `n_nack` NACKs
    pub fn packed_length(n_nack: usize) -> usize {
        (15 + 12 * n_nack + 7) / 8
    }

    /// Packed size of this status PDU
    pub fn packed_len(&self) -> usize {
        Self::packed_length(self.nack_sn.len())
    }

    /// Whether `sn` is negatively acknowledged
    pub fn has_nack(&self, sn: u16) -> bool {
        self.nack_sn.contains(&sn)
    }

    /// Pack into `out`, returning the number of bytes written
    pub fn write(&self, out: &mut [u8]) -> Result<usize, RlcError> {
        let len = self.packed_len();
        if out.len() < len {
            return Err(RlcError::MalformedPdu(format!(
                "status PDU needs {} bytes, {} available",
                len,
                out.len()
            )));
        }
        let mut writer = BitWriter::new(&mut out[..len]);
        writer.put(0, 1); // D/C
        writer.put(0, 3); // CPT
        writer.put(self.ack_sn as u32, 10);
        writer.put(u32::from(!self.nack_sn.is_empty()), 1);
        for (i, sn) in self.nack_sn.iter().enumerate() {
            let more = i + 1 < self.nack_sn.len();
            writer.put(*sn as u32, 10);
            writer.put(u32::from(more), 1);
            writer.put(0, 1); // E2, no segment offsets
        }
        Ok(len)
    }

    /// Parse a status PDU
    pub fn read(pdu: &[u8]) -> Result<Self, RlcError> {
        let mut reader = BitReader::new(pdu);
        let truncated = || RlcError::MalformedPdu(format!("status PDU truncated at {} bytes", pdu.len()));
        if reader.take(1).ok_or_else(truncated)? != 0 {
            return Err(RlcError::MalformedPdu("data PDU parsed as status".into()));
        }
        let cpt = reader.take(3).ok_or_else(truncated)?;
        if cpt != 0 {
            return Err(RlcError::MalformedPdu(format!("reserved CPT value {}", cpt)));
        }
        let ack_sn = reader.take(10).ok_or_else(truncated)? as u16;
        let mut ext1 = reader.take(1).ok_or_else(truncated)?;
        let mut nack_sn = Vec::new();
        while ext1 == 1 {
            nack_sn.push(reader.take(10).ok_or_else(truncated)? as u16);
            ext1 = reader.take(1).ok_or_else(truncated)?;
            if reader.take(1).ok_or_else(truncated)? == 1 {
                // SOstart/SOend, treated as a NACK of the whole PDU
                reader.take(15).ok_or_else(truncated)?;
                reader.take(15).ok_or_else(truncated)?;
            }
        }
        Ok(Self { ack_sn, nack_sn })
    }
}

impl fmt::Display for StatusPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ACK_SN = {}, N_nack = {}", self.ack_sn, self.nack_sn.len())?;
        if !self.nack_sn.is_empty() {
            f.write_str(", NACK_SN =")?;
            for sn in &self.nack_sn {
                write!(f, " {}", sn)?;
            }
        }
        Ok(())
    }
}

fn check_li_list(li: &[u16]) -> Result<(), RlcError> {
    if li.len() > MAX_LI_COUNT {
        return Err(RlcError::MalformedPdu(format!("{} length indicators", li.len())));
    }
    if let Some(bad) = li.iter().find(|&&l| l == 0 || l as usize > MAX_LI_VALUE) {
        return Err(RlcError::MalformedPdu(format!("length indicator {}", bad)));
    }
    Ok(())
}

/// Length indicators must leave a non-empty final data field
fn check_data_field(li: &[u16], pdu_len: usize, header_len: usize) -> Result<(), RlcError> {
    check_li_list(li)?;
    let indicated: usize = li.iter().map(|&l| l as usize).sum();
    if header_len + indicated >= pdu_len {
        return Err(RlcError::MalformedPdu(format!(
            "header {} + indicated {} bytes exceed PDU of {} bytes",
            header_len, indicated, pdu_len
        )));
    }
    Ok(())
}

/// Pack length indicators, two per three bytes, padding an odd count
fn write_li_chain(li: &[u16], out: &mut [u8]) {
    let mut i = 0;
    let mut pos = 0;
    while i < li.len() {
        let ext = u8::from(i + 1 < li.len());
        out[pos] = ext << 7 | ((li[i] & 0x7F0) >> 4) as u8;
        out[pos + 1] = ((li[i] & 0x00F) << 4) as u8;
        pos += 1;
        i += 1;
        if i < li.len() {
            let ext = u8::from(i + 1 < li.len());
            out[pos] |= ext << 3 | ((li[i] & 0x700) >> 8) as u8;
            out[pos + 1] = (li[i] & 0x0FF) as u8;
            pos += 2;
            i += 1;
        }
    }
}

/// Unpack an E/LI chain that follows a fixed header with E = 1
fn read_li_chain(mut buf: &[u8]) -> Result<Vec<u16>, RlcError> {
    let mut li = Vec::new();
    let mut ext = 1;
    while ext == 1 {
        if li.len() == MAX_LI_COUNT {
            return Err(RlcError::MalformedPdu("length indicator chain too long".into()));
        }
        if buf.remaining() < 2 {
            return Err(RlcError::MalformedPdu("truncated length indicator chain".into()));
        }
        if li.len() % 2 == 0 {
            let b0 = buf.get_u8();
            // Low nibble of the next byte is shared with the following LI
            let b1 = buf[0];
            ext = (b0 >> 7) & 0x01;
            li.push(((b0 & 0x7F) as u16) << 4 | ((b1 & 0xF0) >> 4) as u16);
        } else {
            let b0 = buf.get_u8();
            let b1 = buf.get_u8();
            ext = (b0 >> 3) & 0x01;
            li.push(((b0 & 0x07) as u16) << 8 | b1 as u16);
        }
    }
    Ok(li)
}

/// MSB-first bit packer over a zeroed output slice
struct BitWriter<'a> {
    out: &'a mut [u8],
    bit: usize,
}

impl<'a> BitWriter<'a> {
    fn new(out: &'a mut [u8]) -> Self {
        out.fill(0);
        Self { out, bit: 0 }
    }

    fn put(&mut self, value: u32, width: usize) {
        for i in (0..width).rev() {
            if (value >> i) & 1 == 1 {
                self.out[self.bit / 8] |= 0x80 >> (self.bit % 8);
            }
            self.bit += 1;
        }
    }
}

/// MSB-first bit reader
struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    fn take(&mut self, width: usize) -> Option<u32> {
        if self.bit + width > self.data.len() * 8 {
            return None;
        }
        let mut value = 0u32;
        for _ in 0..width {
            let bit = (self.data[self.bit / 8] >> (7 - self.bit % 8)) & 1;
            value = value << 1 | bit as u32;
            self.bit += 1;
        }
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::PDU_HEADROOM;

    fn with_payload(len: usize) -> PduBuffer {
        let mut pdu = PduBuffer::with_headroom(PDU_HEADROOM, len);
        pdu.extend_from_slice(&vec![0xEE; len]);
        pdu
    }

    #[test]
    fn test_um_10bit_bit_layout() {
        let header = UmdPduHeader {
            fi: FramingInfo::NOT_END_ALIGNED,
            sn: 0x155,
            sn_size: SnFieldLength::Bits10,
            li: vec![5, 0x7FF],
        };
        let mut pdu = with_payload(2100);
        header.write(&mut pdu).unwrap();
        assert_eq!(&pdu.as_slice()[..5], &[0x0D, 0x55, 0x80, 0x57, 0xFF]);
        assert_eq!(pdu.as_slice()[5], 0xEE);
    }

    #[test]
    fn test_um_5bit_bit_layout() {
        let header = UmdPduHeader {
            fi: FramingInfo::NOT_START_ALIGNED | FramingInfo::NOT_END_ALIGNED,
            sn: 17,
            sn_size: SnFieldLength::Bits5,
            li: vec![],
        };
        let mut pdu = with_payload(3);
        header.write(&mut pdu).unwrap();
        assert_eq!(pdu.as_slice(), &[0xD1, 0xEE, 0xEE, 0xEE]);
    }

    #[test]
    fn test_odd_li_count_is_padded() {
        let header = UmdPduHeader {
            fi: FramingInfo::empty(),
            sn: 1,
            sn_size: SnFieldLength::Bits5,
            li: vec![0x123],
        };
        let mut pdu = with_payload(0x130);
        header.write(&mut pdu).unwrap();
        // 1 fixed byte, then E=0 LI=0x123 and 4 padding bits
        assert_eq!(&pdu.as_slice()[..3], &[0x21, 0x12, 0x30]);
    }

    #[test]
    fn test_am_data_bit_layout() {
        let header = AmdPduHeader {
            poll: true,
            fi: FramingInfo::NOT_START_ALIGNED,
            sn: 0x3FF,
            li: vec![],
        };
        let mut pdu = with_payload(1);
        header.write(&mut pdu).unwrap();
        assert_eq!(pdu.as_slice(), &[0xB3, 0xFF, 0xEE]);
        assert!(!is_control_pdu(pdu.as_slice()));
    }

    #[test]
    fn test_status_bit_layout() {
        let status = StatusPdu { ack_sn: 5, nack_sn: vec![2] };
        let mut out = [0xFFu8; 8];
        assert_eq!(status.write(&mut out).unwrap(), 4);
        assert_eq!(&out[..4], &[0x00, 0x16, 0x01, 0x00]);
        assert!(is_control_pdu(&out));

        let ack_only = StatusPdu { ack_sn: 5, nack_sn: vec![] };
        assert_eq!(ack_only.write(&mut out).unwrap(), 2);
        assert_eq!(&out[..2], &[0x00, 0x14]);
    }

    #[test]
    fn test_um_header_round_trip() {
        for sn_size in [SnFieldLength::Bits5, SnFieldLength::Bits10] {
            for n_li in [0usize, 1, 2, 3, 7, MAX_LI_COUNT] {
                for fi_bits in 0..4u8 {
                    let li: Vec<u16> = (0..n_li).map(|i| (i as u16 * 37) % 2047 + 1).collect();
                    let header = UmdPduHeader {
                        fi: FramingInfo::from_bits_truncate(fi_bits),
                        sn: (n_li as u16 * 13) % sn_size.modulus(),
                        sn_size,
                        li,
                    };
                    let payload: usize = header.li.iter().map(|&l| l as usize).sum::<usize>() + 1;
                    let mut pdu = with_payload(payload);
                    header.write(&mut pdu).unwrap();
                    assert_eq!(pdu.len(), header.packed_len() + payload);

                    let (decoded, len) = UmdPduHeader::read(pdu.as_slice(), sn_size).unwrap();
                    assert_eq!(decoded, header);
                    assert_eq!(len, sn_size.fixed_header_len() + (n_li * 3 + 1) / 2);
                }
            }
        }
    }

    #[test]
    fn test_am_header_round_trip() {
        for n_li in [0usize, 1, 2, 5] {
            for poll in [false, true] {
                let header = AmdPduHeader {
                    poll,
                    fi: FramingInfo::NOT_END_ALIGNED,
                    sn: 1000,
                    li: (1..=n_li as u16).map(|l| l * 100).collect(),
                };
                let payload: usize = header.li.iter().map(|&l| l as usize).sum::<usize>() + 10;
                let mut pdu = with_payload(payload);
                header.write(&mut pdu).unwrap();
                let (decoded, len) = AmdPduHeader::read(pdu.as_slice()).unwrap();
                assert_eq!(decoded, header);
                assert_eq!(len, am_packed_length(n_li));
            }
        }
    }

    #[test]
    fn test_packed_length_formula() {
        let expected = [0usize, 2, 3, 5, 6, 8, 9];
        for (n_li, chain) in expected.iter().enumerate() {
            assert_eq!(li_chain_len(n_li), *chain);
        }

        // Encoded size matches the formula for every allowed LI count
        for n_li in 0..=MAX_LI_COUNT {
            let li: Vec<u16> = (0..n_li).map(|i| (i as u16 % 7) + 1).collect();
            let payload = li.iter().map(|&l| l as usize).sum::<usize>() + 1;

            for sn_size in [SnFieldLength::Bits5, SnFieldLength::Bits10] {
                let header = UmdPduHeader {
                    fi: FramingInfo::empty(),
                    sn: 1,
                    sn_size,
                    li: li.clone(),
                };
                let mut pdu = with_payload(payload);
                header.write(&mut pdu).unwrap();
                assert_eq!(pdu.len() - payload, um_packed_length(sn_size, n_li));
                assert_eq!(header.packed_len(), sn_size.fixed_header_len() + (3 * n_li + 1) / 2);
            }

            let header = AmdPduHeader {
                poll: false,
                fi: FramingInfo::empty(),
                sn: 1,
                li,
            };
            let mut pdu = with_payload(payload);
            header.write(&mut pdu).unwrap();
            assert_eq!(pdu.len() - payload, am_packed_length(n_li));
            assert_eq!(header.packed_len(), am_packed_length(n_li));
        }
    }

    #[test]
    fn test_status_round_trip() {
        let status = StatusPdu { ack_sn: 1000, nack_sn: vec![990, 991, 995, 1023, 0] };
        let mut out = vec![0u8; status.packed_len()];
        status.write(&mut out).unwrap();
        assert_eq!(StatusPdu::read(&out).unwrap(), status);
        assert!(status.has_nack(995));
        assert!(!status.has_nack(996));
        assert_eq!(status.to_string(), "ACK_SN = 1000, N_nack = 5, NACK_SN = 990 991 995 1023 0");
    }

    #[test]
    fn test_status_with_segment_offsets() {
        // ACK_SN = 3, NACK_SN = 1 with E2 = 1 and SOstart/SOend present
        let mut out = [0u8; 8];
        let mut writer = BitWriter::new(&mut out);
        writer.put(0, 4);
        writer.put(3, 10);
        writer.put(1, 1);
        writer.put(1, 10);
        writer.put(0, 1);
        writer.put(1, 1);
        writer.put(10, 15);
        writer.put(20, 15);
        let status = StatusPdu::read(&out).unwrap();
        assert_eq!(status, StatusPdu { ack_sn: 3, nack_sn: vec![1] });
    }

    #[test]
    fn test_malformed_headers_rejected() {
        assert!(UmdPduHeader::read(&[], SnFieldLength::Bits5).is_err());
        assert!(UmdPduHeader::read(&[0x04], SnFieldLength::Bits10).is_err());
        // E = 1 with no room for the LI chain
        assert!(UmdPduHeader::read(&[0x20, 0x80], SnFieldLength::Bits5).is_err());
        // LI claims more bytes than the PDU holds
        assert!(UmdPduHeader::read(&[0x20, 0x00, 0x50, 0x01], SnFieldLength::Bits5).is_err());
        // Resegmented AMD PDU
        assert!(AmdPduHeader::read(&[0xC0, 0x00, 0x01]).is_err());
        // Reserved CPT
        assert!(StatusPdu::read(&[0x10, 0x00]).is_err());
        assert!(StatusPdu::read(&[0x00]).is_err());
    }
}
