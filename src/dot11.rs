//! IEEE 802.11 MAC frame parser.
//!
//! Parses the fixed prefix common to every frame type, then dispatches on
//! `type`/`subtype` to decode as much of the body as this system needs.
//! Ported from `wltrace.dot11.Dot11Packet`.

use bitops::BitOps;
use md5::{Digest, Md5};

use crate::cursor::ByteCursor;
use crate::macaddr::MacAddr;
use crate::phy::PhyInfo;

pub const TYPE_MANAGEMENT: u8 = 0;
pub const TYPE_CONTROL: u8 = 1;
pub const TYPE_DATA: u8 = 2;
pub const TYPE_RESERVED: u8 = 3;

const SUBTYPE_BEACON: u8 = 8;
const SUBTYPE_BLOCK_ACK: u8 = 9;
const SUBTYPE_ACK: u8 = 0xd;

/// One of the four 802.11 frame-type codes carried in the frame control
/// field's bits 2-3.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameType {
    Management,
    Control,
    Data,
    Reserved,
}

impl FrameType {
    fn from_bits(bits: u8) -> FrameType {
        match bits {
            TYPE_MANAGEMENT => FrameType::Management,
            TYPE_CONTROL => FrameType::Control,
            TYPE_DATA => FrameType::Data,
            _ => FrameType::Reserved,
        }
    }
}

/// Beacon fixed fields plus the SSID tag, when present and well-formed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BeaconInfo {
    pub timestamp_tsf: u64,
    pub interval: u16,
    pub capabilities: u16,
    pub ssid: Option<String>,
}

/// Block Ack control-frame fields, `wltrace.dot11`'s `ba_*` attributes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BlockAck {
    pub tid: u8,
    pub compressed: bool,
    pub multi_tid: bool,
    pub policy: bool,
    pub begin_seq: Option<u16>,
    pub begin_frag: Option<u8>,
    pub bitmap: Option<u64>,
}

/// An identifying reference to the frame that acknowledged a transmission.
///
/// Carries a copy of the ack's identifying fields rather than a handle back
/// into it: frames in this stream never outlive their yield, and an ack
/// always follows its data frame, so there is nothing to borrow from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AckRef {
    pub counter: u64,
    pub epoch_ts: f64,
}

/// A decoded IEEE 802.11 MAC frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Dot11Frame {
    pub counter: u64,
    pub phy: PhyInfo,

    pub fc: u16,
    pub frame_type: FrameType,
    pub subtype: u8,

    pub to_ds: bool,
    pub from_ds: bool,
    pub more_frag: bool,
    pub retry: bool,
    pub power: bool,
    pub more_data: bool,
    pub protected: bool,
    pub order: bool,

    pub duration: u16,
    pub addr1: Option<MacAddr>,
    pub addr2: Option<MacAddr>,
    pub addr3: Option<MacAddr>,
    pub addr4: Option<MacAddr>,

    pub seq_num: Option<u16>,
    pub frag_num: Option<u8>,
    pub qos: Option<u16>,

    pub block_ack: Option<BlockAck>,
    pub beacon: Option<BeaconInfo>,

    pub raw: Vec<u8>,
    pub(crate) hash: std::cell::RefCell<Option<[u8; 16]>>,

    /// Set when the fixed prefix decoded but a type/subtype-specific body
    /// did not; the stream keeps advancing rather than treating this as
    /// fatal.
    pub malformed: bool,

    pub acked: bool,
    pub ack_pkt: Option<AckRef>,
    pub retry_count: u16,
}

impl Dot11Frame {
    /// Parses a raw MAC frame. Never fails: bodies that don't decode set
    /// `malformed = true` and stop short rather than aborting the stream.
    pub fn parse(raw: &[u8], phy: PhyInfo, counter: u64) -> Dot11Frame {
        let mut cursor = ByteCursor::new(raw);
        let mut malformed = false;

        let (fc, duration, addr1) = match (|| -> crate::error::Result<(u16, u16, MacAddr)> {
            let fc = cursor.read_u16_le()?;
            let duration = cursor.read_u16_le()?;
            let addr1 = MacAddr(cursor.read_array6()?);
            Ok((fc, duration, addr1))
        })() {
            Ok(v) => v,
            Err(_) => {
                return Dot11Frame::blank(raw, phy, counter);
            }
        };

        let frame_type = FrameType::from_bits(fc.bits_as_int(2, 2) as u8);
        let subtype = fc.bits_as_int(4, 4) as u8;

        let mut frame = Dot11Frame {
            counter,
            phy,
            fc,
            frame_type,
            subtype,
            to_ds: fc.is_bit_set(8),
            from_ds: fc.is_bit_set(9),
            more_frag: fc.is_bit_set(10),
            retry: fc.is_bit_set(11),
            power: fc.is_bit_set(12),
            more_data: fc.is_bit_set(13),
            protected: fc.is_bit_set(14),
            order: fc.is_bit_set(15),
            duration,
            addr1: Some(addr1),
            addr2: None,
            addr3: None,
            addr4: None,
            seq_num: None,
            frag_num: None,
            qos: None,
            block_ack: None,
            beacon: None,
            raw: raw.to_vec(),
            hash: std::cell::RefCell::new(None),
            malformed: false,
            acked: false,
            ack_pkt: None,
            retry_count: 0,
        };

        let seq = match frame.frame_type {
            FrameType::Management => frame.parse_management(&mut cursor),
            FrameType::Data => frame.parse_data(&mut cursor),
            FrameType::Control => frame.parse_control(&mut cursor),
            FrameType::Reserved => Ok(None),
        };

        match seq {
            Ok(Some(seq)) => {
                frame.frag_num = Some((seq & 0x000f) as u8);
                frame.seq_num = Some((seq & 0xfff0) >> 4);
            }
            Ok(None) => {}
            Err(_) => malformed = true,
        }
        frame.malformed = malformed;
        frame
    }

    fn blank(raw: &[u8], phy: PhyInfo, counter: u64) -> Dot11Frame {
        Dot11Frame {
            counter,
            phy,
            fc: 0,
            frame_type: FrameType::Reserved,
            subtype: 0,
            to_ds: false,
            from_ds: false,
            more_frag: false,
            retry: false,
            power: false,
            more_data: false,
            protected: false,
            order: false,
            duration: 0,
            addr1: None,
            addr2: None,
            addr3: None,
            addr4: None,
            seq_num: None,
            frag_num: None,
            qos: None,
            block_ack: None,
            beacon: None,
            raw: raw.to_vec(),
            hash: std::cell::RefCell::new(None),
            malformed: true,
            acked: false,
            ack_pkt: None,
            retry_count: 0,
        }
    }

    fn parse_management(
        &mut self,
        cursor: &mut ByteCursor,
    ) -> crate::error::Result<Option<u16>> {
        let addr2 = MacAddr(cursor.read_array6()?);
        let addr3 = MacAddr(cursor.read_array6()?);
        let seq = cursor.read_u16_le()?;
        self.addr2 = Some(addr2);
        self.addr3 = Some(addr3);

        if self.order {
            let _ht_control = cursor.read_u32_le()?;
        }

        if self.subtype == SUBTYPE_BEACON {
            // Best-effort: a malformed beacon body leaves `beacon` unset but
            // does not fail the whole frame.
            self.beacon = Dot11Frame::parse_beacon(cursor).ok();
        }

        Ok(Some(seq))
    }

    fn parse_beacon(cursor: &mut ByteCursor) -> crate::error::Result<BeaconInfo> {
        let timestamp_tsf = cursor.read_u64_le()?;
        let interval = cursor.read_u16_le()?;
        let capabilities = cursor.read_u16_le()?;
        let mut ssid = None;
        if cursor.remaining() >= 2 {
            let tag = cursor.read_u8()?;
            let len = cursor.read_u8()? as usize;
            if tag == 0 && cursor.remaining() >= len {
                let bytes = cursor.read_exact(len)?;
                ssid = Some(String::from_utf8_lossy(bytes).into_owned());
            }
        }
        Ok(BeaconInfo {
            timestamp_tsf,
            interval,
            capabilities,
            ssid,
        })
    }

    fn parse_data(&mut self, cursor: &mut ByteCursor) -> crate::error::Result<Option<u16>> {
        let addr2 = MacAddr(cursor.read_array6()?);
        let addr3 = MacAddr(cursor.read_array6()?);
        let seq = cursor.read_u16_le()?;
        self.addr2 = Some(addr2);
        self.addr3 = Some(addr3);

        if self.to_ds && self.from_ds {
            self.addr4 = Some(MacAddr(cursor.read_array6()?));
        }
        if self.subtype >= 8 {
            self.qos = Some(cursor.read_u16_le()?);
        }
        Ok(Some(seq))
    }

    fn parse_control(&mut self, cursor: &mut ByteCursor) -> crate::error::Result<Option<u16>> {
        if self.subtype != SUBTYPE_BLOCK_ACK {
            return Ok(None);
        }
        let addr2 = MacAddr(cursor.read_array6()?);
        let ba_control = cursor.read_u16_le()?;
        let tid = (ba_control >> 12) as u8;
        let compressed = ba_control.is_bit_set(2);
        let multi_tid = ba_control.is_bit_set(1);
        let policy = ba_control.is_bit_set(0);
        self.addr2 = Some(addr2);

        let mut ba = BlockAck {
            tid,
            compressed,
            multi_tid,
            policy,
            begin_seq: None,
            begin_frag: None,
            bitmap: None,
        };

        if !multi_tid && compressed {
            let seq_ctrl = cursor.read_u16_le()?;
            let bitmap = cursor.read_u64_le()?;
            ba.begin_seq = Some(seq_ctrl >> 4);
            ba.begin_frag = Some((seq_ctrl & 0x000f) as u8);
            ba.bitmap = Some(bitmap);
        }
        self.block_ack = Some(ba);
        Ok(None)
    }

    /// MD5 of the raw frame bytes, computed on first access and cached.
    pub fn hash(&self) -> [u8; 16] {
        if let Some(h) = *self.hash.borrow() {
            return h;
        }
        let digest = Md5::digest(&self.raw);
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest);
        *self.hash.borrow_mut() = Some(out);
        out
    }

    /// Shortcut to `addr2`, the transmitter address.
    pub fn src(&self) -> Option<&MacAddr> {
        self.addr2.as_ref()
    }

    /// Shortcut to `addr1`, the receiver address.
    pub fn dest(&self) -> Option<&MacAddr> {
        self.addr1.as_ref()
    }

    /// Duration of the frame on air, seconds, when the rate is known.
    pub fn air_time(&self) -> Option<f64> {
        self.phy.rate.filter(|r| *r > 0.0).map(|rate| self.phy.len as f64 * 8.0 / rate * 1e-6)
    }

    pub fn is_ack(&self) -> bool {
        self.frame_type == FrameType::Control && self.subtype == SUBTYPE_ACK
    }

    pub fn is_block_ack(&self) -> bool {
        self.frame_type == FrameType::Control && self.subtype == SUBTYPE_BLOCK_ACK
    }

    pub fn is_beacon(&self) -> bool {
        self.frame_type == FrameType::Management && self.subtype == SUBTYPE_BEACON
    }

    pub fn is_qos_data(&self) -> bool {
        self.frame_type == FrameType::Data && self.subtype == 8
    }

    pub fn is_broadcast(&self) -> bool {
        self.addr1.map(|a| a.is_broadcast()).unwrap_or(false)
    }

    pub fn is_multicast(&self) -> bool {
        self.addr1.map(|a| a.is_multicast()).unwrap_or(false)
    }
}

/// Next sequence number, modulo the 12-bit sequence number space.
///
/// ```
/// use dot11trace::dot11::next_seq;
/// assert_eq!(next_seq(3), 4);
/// assert_eq!(next_seq(4095), 0);
/// ```
pub fn next_seq(seq: u16) -> u16 {
    (seq + 1) % 4096
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_data_frame(to_ds: bool, from_ds: bool, qos: bool, retry: bool) -> Vec<u8> {
        let mut fc: u16 = (TYPE_DATA as u16) << 2;
        fc |= if qos { 8u16 << 4 } else { 0 };
        if to_ds {
            fc |= 1 << 8;
        }
        if from_ds {
            fc |= 1 << 9;
        }
        if retry {
            fc |= 1 << 11;
        }
        let mut v = Vec::new();
        v.extend_from_slice(&fc.to_le_bytes());
        v.extend_from_slice(&0u16.to_le_bytes()); // duration
        v.extend_from_slice(&[1, 2, 3, 4, 5, 6]); // addr1
        v.extend_from_slice(&[0x10, 0x20, 0x30, 0x40, 0x50, 0x60]); // addr2
        v.extend_from_slice(&[0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6]); // addr3
        let seq: u16 = (42 << 4) | 1; // seq_num=42, frag_num=1
        v.extend_from_slice(&seq.to_le_bytes());
        if to_ds && from_ds {
            v.extend_from_slice(&[0xb1, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6]);
        }
        if qos {
            v.extend_from_slice(&0x0007u16.to_le_bytes());
        }
        v
    }

    #[test]
    fn parses_qos_data_frame() {
        let raw = raw_data_frame(false, true, true, true);
        let frame = Dot11Frame::parse(&raw, PhyInfo::default(), 1);
        assert!(!frame.malformed);
        assert_eq!(frame.frame_type, FrameType::Data);
        assert!(frame.from_ds);
        assert!(!frame.to_ds);
        assert!(frame.retry);
        assert_eq!(frame.seq_num, Some(42));
        assert_eq!(frame.frag_num, Some(1));
        assert_eq!(frame.qos, Some(7));
        assert!(frame.is_qos_data());
        assert_eq!(frame.addr4, None);
    }

    #[test]
    fn parses_wds_addr4() {
        let raw = raw_data_frame(true, true, false, false);
        let frame = Dot11Frame::parse(&raw, PhyInfo::default(), 1);
        assert!(!frame.malformed);
        assert_eq!(frame.addr4, Some(MacAddr([0xb1, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6])));
    }

    #[test]
    fn short_frame_is_malformed_not_fatal() {
        let raw = [0u8, 0, 0, 0]; // shorter than fixed prefix
        let frame = Dot11Frame::parse(&raw, PhyInfo::default(), 1);
        assert!(frame.malformed);
    }

    #[test]
    fn truncated_body_marks_malformed_but_keeps_prefix() {
        let mut raw = raw_data_frame(false, false, false, false);
        raw.truncate(raw.len() - 2); // chop off half of addr3
        let frame = Dot11Frame::parse(&raw, PhyInfo::default(), 1);
        assert!(frame.malformed);
        assert_eq!(frame.addr1, Some(MacAddr([1, 2, 3, 4, 5, 6])));
    }

    #[test]
    fn hash_is_stable_and_matches_md5() {
        let raw = raw_data_frame(false, false, false, false);
        let frame = Dot11Frame::parse(&raw, PhyInfo::default(), 1);
        let h1 = frame.hash();
        let h2 = frame.hash();
        assert_eq!(h1, h2);
        let expected: [u8; 16] = Md5::digest(&frame.raw).into();
        assert_eq!(h1, expected);
    }

    #[test]
    fn next_seq_wraps() {
        assert_eq!(next_seq(0), 1);
        assert_eq!(next_seq(4095), 0);
    }
}
