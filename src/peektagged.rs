//! Omnipeek peek-tagged envelope decoder.
//!
//! A peek-tagged file is a sequence of sections (`{tag, len, pad}` headers),
//! ending in a `"pkts"` section whose payload is itself a stream of
//! per-packet tagged PHY blocks. Ported from `wltrace.peektagged`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::cursor::ByteCursor;
use crate::dot11::Dot11Frame;
use crate::error::{Error, MalformedKind, Result};
use crate::mcs::mcs_to_rate;
use crate::phy::PhyInfo;
use crate::stream::EnvelopeDecoder;

pub const MAGIC: [u8; 4] = *b"\x7fver";

const TAG_PKTS: [u8; 4] = *b"pkts";
const TAG_SESS: [u8; 4] = *b"sess";

const EXT_FLAGS_MCS_INDEX_USED: u32 = 0x0000_0100;
const FLAGS_FCS_ERROR: u32 = 0x0000_0002;

const WINDOWS_EPOCH_OFFSET: f64 = 11_644_473_600.0;

/// Whether a 4-byte prefix matches the peek-tagged envelope magic.
pub fn matches_magic(magic: &[u8; 4]) -> bool {
    *magic == MAGIC
}

#[derive(Default)]
struct RawHeader {
    len: Option<u32>,
    ts_low: Option<u32>,
    ts_high: Option<u32>,
    flags: Option<u32>,
    freq_mhz: Option<u32>,
    rate: Option<u32>,
    signal: Option<i32>,
    noise: Option<i32>,
    ext_flags: Option<u32>,
    caplen: Option<u32>,
}

impl RawHeader {
    fn read(r: &mut impl Read) -> Result<RawHeader> {
        let mut header = RawHeader::default();
        loop {
            let mut tag_buf = [0u8; 2];
            let mut val_buf = [0u8; 4];
            r.read_exact(&mut tag_buf)?;
            r.read_exact(&mut val_buf)?;
            let tag = u16::from_le_bytes(tag_buf);

            match tag {
                0x00 => header.len = Some(u32::from_le_bytes(val_buf)),
                0x01 => header.ts_low = Some(u32::from_le_bytes(val_buf)),
                0x02 => header.ts_high = Some(u32::from_le_bytes(val_buf)),
                0x03 => header.flags = Some(u32::from_le_bytes(val_buf)),
                0x0d => header.freq_mhz = Some(u32::from_le_bytes(val_buf)),
                0x05 => header.rate = Some(u32::from_le_bytes(val_buf)),
                0x07 => header.signal = Some(i32::from_le_bytes(val_buf)),
                0x09 => header.noise = Some(i32::from_le_bytes(val_buf)),
                0x15 => header.ext_flags = Some(u32::from_le_bytes(val_buf)),
                0xffff => {
                    header.caplen = Some(u32::from_le_bytes(val_buf));
                    break;
                }
                _ => {}
            }
        }
        Ok(header)
    }

    /// Converts to `PhyInfo`, applying the rate/MCS and timestamp rules.
    fn to_phy(&self) -> Result<PhyInfo> {
        let len = self.len.ok_or_else(|| {
            Error::Malformed(MalformedKind::PeekTagged, "missing len tag".into())
        })?;
        let caplen = self.caplen.ok_or_else(|| {
            Error::Malformed(MalformedKind::PeekTagged, "missing caplen tag".into())
        })?;
        let ts_high = self.ts_high.unwrap_or(0);
        let ts_low = self.ts_low.unwrap_or(0);
        let raw_rate = self.rate.unwrap_or(0);
        let ext_flags = self.ext_flags.unwrap_or(0);
        let flags = self.flags.unwrap_or(0);

        let (mcs, rate) = if ext_flags & EXT_FLAGS_MCS_INDEX_USED != 0 {
            let mcs = raw_rate as u8;
            (Some(mcs), mcs_to_rate(mcs, 20, true)?)
        } else {
            (None, raw_rate as f64 / 2.0)
        };

        let epoch_ts_last_bit =
            ts_high as f64 * ((1u64 << 32) as f64 / 1e9) + ts_low as f64 / 1e9 - WINDOWS_EPOCH_OFFSET;

        let (epoch_ts, end_epoch_ts) = if rate > 0.0 {
            let duration = len as f64 * 8.0 / rate * 1e-6;
            (epoch_ts_last_bit - duration, Some(epoch_ts_last_bit))
        } else {
            (epoch_ts_last_bit, None)
        };

        Ok(PhyInfo {
            signal: self.signal.map(|v| v as i8),
            noise: self.noise.map(|v| v as i8),
            freq_mhz: self.freq_mhz.map(|v| v as u16),
            has_fcs: true,
            fcs_error: Some(flags & FLAGS_FCS_ERROR != 0),
            epoch_ts,
            end_epoch_ts,
            mactime: None,
            rate: Some(rate),
            mcs,
            len,
            caplen,
            ampdu_ref: None,
            last_ampdu: None,
        })
    }
}

/// Flattens an XML section's direct children into tag -> text. `root_tag`,
/// when given, is checked against the document's root element; the
/// `"sess"` section's root element isn't normative (`peektagged.py`'s
/// `PeektaggedCapture.__init__` only checks the root tag for `"ver"`), so
/// callers pass `None` there and skip the check.
fn parse_xml_children(payload: &[u8], root_tag: Option<&str>) -> Result<HashMap<String, String>> {
    let mut reader = Reader::from_reader(payload);
    reader.config_mut().trim_text(true);

    let mut out = HashMap::new();
    let mut buf = Vec::new();
    let mut current_tag: Option<String> = None;
    let mut seen_root = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if !seen_root {
                    if let Some(expected) = root_tag {
                        if name != expected {
                            return Err(Error::Malformed(
                                MalformedKind::PeekTagged,
                                format!("expected root <{}>, got <{}>", expected, name),
                            ));
                        }
                    }
                    seen_root = true;
                } else {
                    current_tag = Some(name);
                }
            }
            Event::Text(t) => {
                if let Some(tag) = &current_tag {
                    out.insert(tag.clone(), t.decode()?.into_owned());
                }
            }
            Event::End(_) => {
                current_tag = None;
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

struct SectionHeader {
    tag: [u8; 4],
    len: u32,
}

impl SectionHeader {
    fn read(r: &mut impl Read) -> Result<SectionHeader> {
        let mut buf = [0u8; 12];
        r.read_exact(&mut buf)?;
        let mut cursor = ByteCursor::new(&buf);
        let tag_bytes = cursor.read_exact(4)?;
        let mut tag = [0u8; 4];
        tag.copy_from_slice(tag_bytes);
        let len = cursor.read_u32_le()?;
        let _pad = cursor.read_u32_le()?;
        Ok(SectionHeader { tag, len })
    }
}

/// Drives the peek-tagged envelope, producing `Dot11Frame`s.
pub struct PeekTaggedDecoder {
    reader: Option<BufReader<File>>,
    /// `VersionInfo` section children, keyed by XML tag name.
    pub version_info: HashMap<String, String>,
    /// Total packet count declared by the `"sess"` section, if present.
    pub total_packets: Option<u32>,
    counter: u64,
}

impl PeekTaggedDecoder {
    pub fn open(path: impl AsRef<Path>) -> Result<PeekTaggedDecoder> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut version_info = HashMap::new();
        let mut total_packets = None;

        loop {
            let section = SectionHeader::read(&mut reader)?;
            if section.tag == TAG_PKTS {
                break;
            }

            let mut payload = vec![0u8; section.len as usize];
            reader.read_exact(&mut payload)?;

            if section.tag == MAGIC {
                version_info = parse_xml_children(&payload, Some("VersionInfo"))?;
            } else if section.tag == TAG_SESS {
                let children = parse_xml_children(&payload, None)?;
                if let Some(count) = children.get("PacketCount") {
                    total_packets = count.parse().ok();
                }
            }
        }

        Ok(PeekTaggedDecoder {
            reader: Some(reader),
            version_info,
            total_packets,
            counter: 1,
        })
    }

    fn read_one(&mut self) -> Result<Option<Dot11Frame>> {
        let reader = match &mut self.reader {
            Some(r) => r,
            None => return Ok(None),
        };

        let header = match RawHeader::read(reader) {
            Ok(h) => h,
            Err(_) => {
                self.reader = None;
                return Ok(None);
            }
        };
        let phy = header.to_phy()?;

        let mut raw = vec![0u8; phy.caplen as usize];
        if reader.read_exact(&mut raw).is_err() {
            self.reader = None;
            return Ok(None);
        }

        let frame = Dot11Frame::parse(&raw, phy, self.counter);
        self.counter += 1;
        Ok(Some(frame))
    }
}

impl EnvelopeDecoder for PeekTaggedDecoder {
    fn next_batch(&mut self, n: usize) -> Result<Vec<Dot11Frame>> {
        let mut out = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            match self.read_one() {
                Ok(Some(frame)) => out.push(frame),
                Ok(None) => break,
                Err(_) => {
                    self.reader = None;
                    break;
                }
            }
        }
        Ok(out)
    }
}
