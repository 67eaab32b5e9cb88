//! Radiotap PHY header decoder.
//!
//! Radiotap is a self-describing, extensible header: a fixed 8-byte
//! preamble declares the total header length (`it_len`) and a 32-bit
//! "present" bitmap, which may itself be chained via further 32-bit words
//! while its top bit is set. Each present bit selects a field with a fixed
//! width and a required alignment (relative to the end of the present-word
//! chain, matching the original `radiotap.py`'s `offset`-from-`rest`
//! bookkeeping). This module walks that bitmap in bit order, decoding the
//! handful of fields this system surfaces in `PhyInfo` and skipping every
//! other standard field by its known width so offsets stay aligned, the
//! way the teacher crate's `RadiotapKind::align`/`RadiotapKind::size` do for
//! its own (larger) field set.

use bitops::BitOps;

use crate::cursor::ByteCursor;
use crate::error::{Error, MalformedKind, Result};
use crate::mcs::mcs_to_rate;
use crate::phy::PhyInfo;

const IT_VERSION: u8 = 0;

const FLAG_HAS_FCS: u8 = 0x10;
const FLAG_FCS_ERROR: u8 = 0x40;

const PRESENT_TSFT: u32 = 1 << 0;
const PRESENT_FLAGS: u32 = 1 << 1;
const PRESENT_RATE: u32 = 1 << 2;
const PRESENT_CHANNEL: u32 = 1 << 3;
const PRESENT_SIGNAL: u32 = 1 << 5;
const PRESENT_NOISE: u32 = 1 << 6;
const PRESENT_MCS: u32 = 1 << 19;
const PRESENT_AMPDU: u32 = 1 << 20;

/// `(align, size)` for every standard field bit 0..=22, reproduced from the
/// teacher crate's `ns::RadiotapKind::align`/`size` tables so that fields
/// this module does not care about still advance the cursor correctly.
const FIELD_META: [(usize, usize); 23] = [
    (8, 8), // 0 TSFT
    (1, 1), // 1 Flags
    (1, 1), // 2 Rate
    (2, 4), // 3 Channel
    (2, 2), // 4 FHSS
    (1, 1), // 5 Antenna signal
    (1, 1), // 6 Antenna noise
    (2, 2), // 7 Lock quality
    (2, 2), // 8 Tx attenuation
    (2, 2), // 9 Tx attenuation (dB)
    (1, 1), // 10 Tx power
    (1, 1), // 11 Antenna
    (1, 1), // 12 Antenna signal (dB)
    (1, 1), // 13 Antenna noise (dB)
    (2, 2), // 14 Rx flags
    (2, 2), // 15 Tx flags
    (1, 1), // 16 RTS retries
    (1, 1), // 17 Data retries
    (4, 8), // 18 XChannel
    (1, 3), // 19 MCS
    (4, 8), // 20 A-MPDU status
    (2, 12), // 21 VHT
    (8, 12), // 22 Timestamp
];

fn align_up(offset: usize, align: usize) -> usize {
    let remain = offset % align;
    if remain == 0 {
        offset
    } else {
        offset + (align - remain)
    }
}

/// Decodes a Radiotap header at the cursor's current position.
///
/// Returns the derived `PhyInfo` and the total number of bytes the header
/// occupies (`it_len`), so the caller can skip past it to the MAC frame.
pub fn decode(cursor: &mut ByteCursor) -> Result<(PhyInfo, usize)> {
    let header_start = cursor.position();

    let version = cursor.read_u8()?;
    let _pad = cursor.read_u8()?;
    let it_len = cursor.read_u16_le()? as usize;

    if version != IT_VERSION {
        return Err(Error::UnsupportedRadiotapVersion(version));
    }
    if it_len < 8 {
        return Err(Error::Malformed(
            MalformedKind::Radiotap,
            format!("it_len {} shorter than the fixed preamble", it_len),
        ));
    }

    let present = cursor.read_u32_le()?;
    let mut chained = present;
    while chained.is_bit_set(31) {
        chained = cursor.read_u32_le()?;
    }
    // Every field this system decodes lives in bits 0..=22 of the first
    // present word; further chained words only carry bits 32+, which this
    // module doesn't know how to size, so they are consumed above (to reach
    // the field data) but otherwise ignored — consistent with "any bytes
    // inside it_len beyond the parsed flags are skipped".

    let fields_start = cursor.position();
    let mut phy = PhyInfo::default();
    let mut rel = 0usize;
    let mut raw_half_mbps: Option<u8> = None;

    for bit in 0u32..=22 {
        if present & (1 << bit) == 0 {
            continue;
        }
        let (align, size) = FIELD_META[bit as usize];
        rel = align_up(rel, align);
        cursor.seek_abs(fields_start + rel)?;

        match 1u32 << bit {
            PRESENT_TSFT => {
                phy.mactime = Some(cursor.read_u64_le()?);
            }
            PRESENT_FLAGS => {
                let flags = cursor.read_u8()?;
                phy.has_fcs = flags & FLAG_HAS_FCS != 0;
                phy.fcs_error = Some(flags & FLAG_FCS_ERROR != 0);
            }
            PRESENT_RATE => {
                raw_half_mbps = Some(cursor.read_u8()?);
            }
            PRESENT_CHANNEL => {
                let channel = cursor.read_u32_le()?;
                phy.freq_mhz = Some((channel & 0xffff) as u16);
            }
            PRESENT_SIGNAL => {
                phy.signal = Some(cursor.read_i8()?);
            }
            PRESENT_NOISE => {
                phy.noise = Some(cursor.read_i8()?);
            }
            PRESENT_MCS => {
                let _known = cursor.read_u8()?;
                let flags = cursor.read_u8()?;
                let index = cursor.read_u8()?;
                let bw = if flags & 0x3 == 1 { 40 } else { 20 };
                let long_gi = flags & 0x4 == 0;
                phy.mcs = Some(index);
                phy.rate = Some(mcs_to_rate(index, bw, long_gi)?);
            }
            PRESENT_AMPDU => {
                let ampdu_ref = cursor.read_u32_le()?;
                let flags = cursor.read_u16_le()?;
                phy.ampdu_ref = Some(ampdu_ref);
                phy.last_ampdu = Some(flags & 0x8 != 0);
            }
            _ => {}
        }
        rel += size;
    }

    if phy.mcs.is_none() {
        if let Some(raw) = raw_half_mbps {
            phy.rate = Some(raw as f64 / 2.0);
        }
    }

    cursor.seek_abs(header_start + it_len)?;
    Ok((phy, it_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    // A radiotap header carrying TSFT, Flags, Rate, Channel, Signal and
    // Noise: present = bits 0,1,2,3,5,6 = 0b0110_1111 = 0x6f.
    fn sample_header() -> Vec<u8> {
        let present: u32 = (1 << 0) | (1 << 1) | (1 << 2) | (1 << 3) | (1 << 5) | (1 << 6);
        assert_eq!(present, 0x6f);
        let mut v = vec![0u8, 0, 0, 0];
        v.extend_from_slice(&present.to_le_bytes());
        // it_len filled in below.
        v.extend_from_slice(&84523414517u64.to_le_bytes()); // mactime (align 8)
        v.push(0x10); // flags: has_fcs
        v.push(12); // rate raw -> 6.0 Mbps
        v.extend_from_slice(&5200u16.to_le_bytes()); // channel: freq_mhz
        v.extend_from_slice(&0u16.to_le_bytes()); // channel: flags
        v.push((-47i8) as u8); // signal = -47
        v.push(0); // noise = 0
        let len = v.len() as u16;
        v[2..4].copy_from_slice(&len.to_le_bytes());
        v
    }

    #[test]
    fn decodes_known_fields_with_alignment() {
        let buf = sample_header();
        let mut c = ByteCursor::new(&buf);
        let (phy, it_len) = decode(&mut c).unwrap();
        assert_eq!(it_len, buf.len());
        assert_eq!(phy.mactime, Some(84523414517));
        assert!(phy.has_fcs);
        assert_eq!(phy.fcs_error, Some(false));
        assert_eq!(phy.rate, Some(6.0));
        assert_eq!(phy.freq_mhz, Some(5200));
        assert_eq!(phy.signal, Some(-47));
        assert_eq!(phy.noise, Some(0));
    }

    #[test]
    fn rejects_bad_version() {
        let buf = [1u8, 0, 8, 0, 0, 0, 0, 0];
        let mut c = ByteCursor::new(&buf);
        match decode(&mut c).unwrap_err() {
            Error::UnsupportedRadiotapVersion(1) => {}
            e => panic!("wrong error: {:?}", e),
        }
    }

    #[test]
    fn mcs_overrides_raw_rate() {
        // present = bit2 (rate) | bit19 (mcs) = 0x00080004
        let mut v = vec![0u8, 0, 0, 0];
        let present: u32 = (1 << 2) | (1 << 19);
        v.extend_from_slice(&present.to_le_bytes());
        v.push(200); // raw rate (should be overridden)
        v.extend_from_slice(&[0x07, 0x00, 5]); // known, flags=20MHz/LGI, mcs=5
        let len = v.len() as u16;
        v[2..4].copy_from_slice(&len.to_le_bytes());
        let mut c = ByteCursor::new(&v);
        let (phy, _) = decode(&mut c).unwrap();
        assert_eq!(phy.mcs, Some(5));
        assert_eq!(phy.rate, Some(52.0));
    }
}
