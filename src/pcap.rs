//! Pcap envelope decoder and encoder.
//!
//! Ported from `wltrace.pcap`: a 28-byte global header (magic selects
//! endianness and timestamp resolution), followed by a 16-byte
//! per-packet record header and the packet payload, which for linktype 127
//! begins with a Radiotap header.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use crate::cursor::ByteCursor;
use crate::dot11::Dot11Frame;
use crate::error::{Error, MalformedKind, Result};
use crate::phy::PhyInfo;
use crate::radiotap;
use crate::stream::EnvelopeDecoder;

pub const MAGIC_LE: [u8; 4] = [0xd4, 0xc3, 0xb2, 0xa1];
pub const MAGIC_BE: [u8; 4] = [0xa1, 0xb2, 0xc3, 0xd4];
pub const MAGIC_LE_NS: [u8; 4] = [0x4d, 0x3c, 0xb2, 0xa1];
pub const MAGIC_BE_NS: [u8; 4] = [0xa1, 0xb2, 0x3c, 0x4d];

const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;

const LINKTYPE_IEEE802_11: u32 = 105;
const LINKTYPE_IEEE802_11_RADIOTAP: u32 = 127;

/// Whether a 4-byte prefix matches one of the four recognized Pcap magics.
pub fn matches_magic(magic: &[u8; 4]) -> bool {
    *magic == MAGIC_LE || *magic == MAGIC_BE || *magic == MAGIC_LE_NS || *magic == MAGIC_BE_NS
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum Endian {
    Little,
    Big,
}

struct GlobalHeader {
    endian: Endian,
    nano_ts: bool,
    thiszone: i32,
    snaplen: u32,
    network: u32,
}

impl GlobalHeader {
    fn read(r: &mut impl Read) -> Result<GlobalHeader> {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf)?;

        let (endian, nano_ts) = if buf == MAGIC_LE {
            (Endian::Little, false)
        } else if buf == MAGIC_BE {
            (Endian::Big, false)
        } else if buf == MAGIC_LE_NS {
            (Endian::Little, true)
        } else if buf == MAGIC_BE_NS {
            (Endian::Big, true)
        } else {
            return Err(Error::UnknownMagic(buf));
        };

        let mut rest = [0u8; 20];
        r.read_exact(&mut rest)?;
        let mut cursor = ByteCursor::new(&rest);
        let (vmaj, vmin, thiszone, _sigfigs, snaplen, network) = match endian {
            Endian::Little => (
                cursor.read_u16_le()?,
                cursor.read_u16_le()?,
                cursor.read_i32_le()?,
                cursor.read_u32_le()?,
                cursor.read_u32_le()?,
                cursor.read_u32_le()?,
            ),
            Endian::Big => (
                cursor.read_u16_be()?,
                cursor.read_u16_be()?,
                cursor.read_i32_be()?,
                cursor.read_u32_be()?,
                cursor.read_u32_be()?,
                cursor.read_u32_be()?,
            ),
        };

        if vmaj != VERSION_MAJOR || vmin != VERSION_MINOR {
            return Err(Error::UnsupportedPcapVersion(vmaj, vmin));
        }
        if network != LINKTYPE_IEEE802_11 && network != LINKTYPE_IEEE802_11_RADIOTAP {
            return Err(Error::UnsupportedLinktype(network));
        }

        Ok(GlobalHeader {
            endian,
            nano_ts,
            thiszone,
            snaplen,
            network,
        })
    }
}

struct RecordHeader {
    epoch_ts: f64,
    incl_len: u32,
    orig_len: u32,
}

impl RecordHeader {
    fn read(r: &mut impl Read, header: &GlobalHeader) -> Result<Option<RecordHeader>> {
        let mut buf = [0u8; 16];
        if !read_exact_or_eof(r, &mut buf)? {
            return Ok(None);
        }
        let mut cursor = ByteCursor::new(&buf);
        let (ts_sec, ts_frac, incl_len, orig_len) = match header.endian {
            Endian::Little => (
                cursor.read_u32_le()?,
                cursor.read_u32_le()?,
                cursor.read_u32_le()?,
                cursor.read_u32_le()?,
            ),
            Endian::Big => (
                cursor.read_u32_be()?,
                cursor.read_u32_be()?,
                cursor.read_u32_be()?,
                cursor.read_u32_be()?,
            ),
        };

        let divisor = if header.nano_ts { 1e9 } else { 1e6 };
        let epoch_ts = ts_sec as f64 + ts_frac as f64 / divisor + header.thiszone as f64;

        if incl_len > header.snaplen {
            return Err(Error::Malformed(
                MalformedKind::Pcap,
                format!("incl_len {} exceeds snaplen {}", incl_len, header.snaplen),
            ));
        }

        Ok(Some(RecordHeader {
            epoch_ts,
            incl_len,
            orig_len,
        }))
    }
}

/// Reads into `buf`, returning `Ok(false)` on a clean EOF (zero bytes read
/// before the first byte) and `Err(ShortRead)` on a partial record.
fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut got = 0;
    while got < buf.len() {
        let n = r.read(&mut buf[got..])?;
        if n == 0 {
            if got == 0 {
                return Ok(false);
            }
            return Err(Error::ShortRead(buf.len(), got));
        }
        got += n;
    }
    Ok(true)
}

/// Drives the Pcap/Radiotap envelope, producing `Dot11Frame`s.
pub struct PcapDecoder {
    reader: Option<BufReader<File>>,
    header: GlobalHeader,
    fix_timestamp: bool,
    counter: u64,
}

impl PcapDecoder {
    pub fn open(path: impl AsRef<Path>, fix_timestamp: bool) -> Result<PcapDecoder> {
        let mut reader = BufReader::new(File::open(path)?);
        let header = GlobalHeader::read(&mut reader)?;
        Ok(PcapDecoder {
            reader: Some(reader),
            header,
            fix_timestamp,
            counter: 1,
        })
    }

    fn read_one(&mut self) -> Result<Option<Dot11Frame>> {
        let reader = match &mut self.reader {
            Some(r) => r,
            None => return Ok(None),
        };

        let record = match RecordHeader::read(reader, &self.header)? {
            Some(r) => r,
            None => {
                self.reader = None;
                return Ok(None);
            }
        };

        let mut raw = vec![0u8; record.incl_len as usize];
        if !read_exact_or_eof(reader, &mut raw)? {
            self.reader = None;
            return Ok(None);
        }

        let mut phy;
        let mac_bytes: &[u8];
        if self.header.network == LINKTYPE_IEEE802_11_RADIOTAP {
            let mut cursor = ByteCursor::new(&raw);
            let (p, it_len) = radiotap::decode(&mut cursor)?;
            phy = p;
            phy.len = record.orig_len.saturating_sub(it_len as u32);
            phy.caplen = record.incl_len.saturating_sub(it_len as u32);
            mac_bytes = &raw[it_len..];
        } else {
            phy = PhyInfo {
                has_fcs: false,
                len: record.orig_len,
                caplen: record.incl_len,
                ..Default::default()
            };
            mac_bytes = &raw[..];
        }

        phy.epoch_ts = record.epoch_ts;
        if self.fix_timestamp {
            if let Some(rate) = phy.rate {
                if rate > 0.0 {
                    phy.epoch_ts -= phy.len as f64 * 8.0 / rate * 1e-6;
                }
            }
        }
        phy.derive_end_epoch_ts();

        let frame = Dot11Frame::parse(mac_bytes, phy, self.counter);
        self.counter += 1;
        Ok(Some(frame))
    }
}

impl EnvelopeDecoder for PcapDecoder {
    /// Mirrors `PcapCapture._next`: when a frame carries an `ampdu_ref`,
    /// keeps reading subframes of that A-MPDU until the last-frame flag is
    /// seen, then propagates that subframe's rate backward onto the earlier
    /// ones collected in this same batch.
    fn next_batch(&mut self, n: usize) -> Result<Vec<Dot11Frame>> {
        let mut out = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            let mut pending = match self.read_one() {
                Ok(Some(frame)) => Some(frame),
                Ok(None) => None,
                Err(_) => {
                    self.reader = None;
                    None
                }
            };

            if let Some(ampdu_ref) = pending.as_ref().and_then(|f| f.phy.ampdu_ref) {
                // Keep pulling subframes of this A-MPDU; each non-final one
                // is buffered, the final one carries the authoritative rate
                // which is then propagated backward over the buffered ones.
                loop {
                    let frame = pending.take().unwrap();
                    if frame.phy.last_ampdu == Some(true) {
                        let rate = frame.phy.rate;
                        for p in out.iter_mut().rev() {
                            let p: &mut Dot11Frame = p;
                            if p.phy.ampdu_ref != Some(ampdu_ref) {
                                break;
                            }
                            p.phy.rate = rate;
                        }
                        pending = Some(frame);
                        break;
                    }
                    out.push(frame);
                    pending = match self.read_one() {
                        Ok(Some(f)) => Some(f),
                        Ok(None) => None,
                        Err(_) => {
                            self.reader = None;
                            None
                        }
                    };
                    match &pending {
                        Some(f) if f.phy.ampdu_ref == Some(ampdu_ref) => {}
                        _ => break,
                    }
                }
            }

            match pending {
                Some(frame) => out.push(frame),
                None => break,
            }
        }
        Ok(out)
    }
}

/// Writes a Pcap/Radiotap trace back out, the inverse of `PcapDecoder`.
pub struct PcapEncoder;

impl PcapEncoder {
    /// Writes little-endian microsecond Pcap: the global header, then one
    /// record per frame with a synthesized Radiotap header.
    pub fn write(
        writer: &mut impl Write,
        frames: impl IntoIterator<Item = Dot11Frame>,
    ) -> Result<()> {
        writer.write_all(&MAGIC_LE)?;
        writer.write_all(&VERSION_MAJOR.to_le_bytes())?;
        writer.write_all(&VERSION_MINOR.to_le_bytes())?;
        writer.write_all(&0i32.to_le_bytes())?; // thiszone
        writer.write_all(&0u32.to_le_bytes())?; // sigfigs
        writer.write_all(&65535u32.to_le_bytes())?; // snaplen
        writer.write_all(&LINKTYPE_IEEE802_11_RADIOTAP.to_le_bytes())?;

        for frame in frames {
            let radiotap_bytes = encode_radiotap(&frame.phy);
            let ts_sec = frame.phy.epoch_ts.trunc() as u32;
            let ts_usec = frame.phy.epoch_ts.fract() * 1e6;
            let incl_len = radiotap_bytes.len() as u32 + frame.phy.caplen;
            let orig_len = radiotap_bytes.len() as u32 + frame.phy.len;

            writer.write_all(&ts_sec.to_le_bytes())?;
            writer.write_all(&(ts_usec as u32).to_le_bytes())?;
            writer.write_all(&incl_len.to_le_bytes())?;
            writer.write_all(&orig_len.to_le_bytes())?;
            writer.write_all(&radiotap_bytes)?;
            writer.write_all(&frame.raw)?;
        }
        Ok(())
    }
}

/// Synthesizes a minimal Radiotap header carrying whatever of
/// signal/rate/flags/channel this `PhyInfo` knows, the write-path
/// counterpart of [`radiotap::decode`], in ascending bit order.
fn encode_radiotap(phy: &PhyInfo) -> Vec<u8> {
    let mut present = 0u32;
    let mut body = Vec::new();
    if phy.has_fcs || phy.fcs_error.is_some() {
        present |= 1 << 1;
        let mut flags_byte = 0u8;
        if phy.has_fcs {
            flags_byte |= 0x10;
        }
        if phy.fcs_error == Some(true) {
            flags_byte |= 0x40;
        }
        body.push(flags_byte);
    }
    if let Some(rate) = phy.rate {
        if phy.mcs.is_none() && rate < 256.0 {
            present |= 1 << 2;
            body.push((rate * 2.0).round() as u8);
        }
    }
    if let Some(freq) = phy.freq_mhz {
        while body.len() % 2 != 0 {
            body.push(0);
        }
        present |= 1 << 3;
        let flags: u16 = if freq < 3000 { 0x0080 | 0x0040 } else { 0x0100 | 0x0040 };
        body.extend_from_slice(&freq.to_le_bytes());
        body.extend_from_slice(&flags.to_le_bytes());
    }
    if let Some(signal) = phy.signal {
        present |= 1 << 5;
        body.push(signal as u8);
    }
    if let Some(noise) = phy.noise {
        present |= 1 << 6;
        body.push(noise as u8);
    }
    if let Some(mcs) = phy.mcs {
        present |= 1 << 19;
        body.push(0x07); // known: bandwidth, MCS index, guard interval
        body.push(0x00); // flags: 20MHz, long GI
        body.push(mcs);
    }

    let it_len = (8 + body.len()) as u16;
    let mut header = Vec::with_capacity(it_len as usize);
    header.push(0); // version
    header.push(0); // pad
    header.extend_from_slice(&it_len.to_le_bytes());
    header.extend_from_slice(&present.to_le_bytes());
    header.extend_from_slice(&body);
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_matching() {
        assert!(matches_magic(&MAGIC_LE));
        assert!(matches_magic(&MAGIC_BE));
        assert!(matches_magic(&MAGIC_LE_NS));
        assert!(matches_magic(&MAGIC_BE_NS));
        assert!(!matches_magic(&[0, 0, 0, 0]));
    }

    /// A 24-byte global header followed immediately by a 16-byte record
    /// header must leave the cursor exactly at the start of the record: a
    /// miscounted global-header length throws every subsequent read off by
    /// that many bytes.
    #[test]
    fn global_header_is_24_bytes() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC_LE);
        buf.extend_from_slice(&VERSION_MAJOR.to_le_bytes());
        buf.extend_from_slice(&VERSION_MINOR.to_le_bytes());
        buf.extend_from_slice(&0i32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&65535u32.to_le_bytes());
        buf.extend_from_slice(&LINKTYPE_IEEE802_11.to_le_bytes());
        assert_eq!(buf.len(), 24);

        // A record header right after: if the global header read consumed
        // too many or too few bytes, the sentinel below won't land on it.
        buf.extend_from_slice(&0x4242_4242u32.to_le_bytes()); // ts_sec sentinel
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());

        let mut cursor = &buf[..];
        let header = GlobalHeader::read(&mut cursor).unwrap();
        let record = RecordHeader::read(&mut cursor, &header).unwrap().unwrap();
        assert_eq!(record.epoch_ts.trunc() as u32, 0x4242_4242);
    }

    #[test]
    fn encode_radiotap_round_trips_mcs_rate() {
        let phy = PhyInfo {
            mcs: Some(5),
            rate: Some(crate::mcs::mcs_to_rate(5, 20, true).unwrap()),
            has_fcs: true,
            ..Default::default()
        };
        let bytes = encode_radiotap(&phy);
        let mut cursor = ByteCursor::new(&bytes);
        let (decoded, it_len) = radiotap::decode(&mut cursor).unwrap();
        assert_eq!(it_len, bytes.len());
        assert_eq!(decoded.mcs, Some(5));
        assert_eq!(decoded.rate, phy.rate);
    }
}
