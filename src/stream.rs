//! The frame-stream engine: look-ahead buffering plus ack/retry inference.
//!
//! Ported from `wltrace.wltrace.WlTrace`. The abstract `_next` of the
//! original becomes the `EnvelopeDecoder` trait here, implemented by
//! `PcapDecoder` and `PeekTaggedDecoder`.

use std::collections::VecDeque;
use std::path::Path;

use log::trace;

use crate::dot11::{AckRef, Dot11Frame, FrameType};
use crate::error::Result;
use crate::pcap::{self, PcapDecoder};
use crate::peektagged::{self, PeekTaggedDecoder};

const LOOKAHEAD_LOW_WATER: usize = 2;
const BATCH_SIZE: usize = 1024;
const MAX_ACK_LATENCY_SECS: f64 = 1e-4;

/// Capability every envelope format must provide: pull the next batch of
/// decoded frames, or an empty vector at EOF.
pub trait EnvelopeDecoder {
    fn next_batch(&mut self, n: usize) -> Result<Vec<Dot11Frame>>;
}

enum Decoder {
    Pcap(PcapDecoder),
    PeekTagged(PeekTaggedDecoder),
}

impl EnvelopeDecoder for Decoder {
    fn next_batch(&mut self, n: usize) -> Result<Vec<Dot11Frame>> {
        match self {
            Decoder::Pcap(d) => d.next_batch(n),
            Decoder::PeekTagged(d) => d.next_batch(n),
        }
    }
}

/// Options controlling how a trace is loaded.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadOptions {
    /// Shift each frame's `epoch_ts` to the first bit instead of the last,
    /// when the frame's rate is known. See §4.3/§4.4.
    pub fix_timestamp: bool,
}

/// Whether `p` is eligible for ack/retry inference: a unicast Management or
/// Data frame, per `WlTrace._infer_acked`/`_infer_retry`.
fn is_inference_eligible(p: &Dot11Frame) -> bool {
    matches!(p.frame_type, FrameType::Management | FrameType::Data)
        && p.addr1.map(|d| !d.is_broadcast()).unwrap_or(false)
}

/// Infers `acked`/`ack_pkt` for `queue[idx]` by looking ahead in `queue`.
fn infer_acked(queue: &mut VecDeque<Dot11Frame>, idx: usize) {
    let (src, end_epoch_ts, seq_num) = {
        let f = &queue[idx];
        if !is_inference_eligible(f) {
            return;
        }
        (f.addr2, f.phy.end_epoch_ts, f.seq_num)
    };

    if let Some(next) = queue.get(idx + 1) {
        if next.is_ack() && next.addr1 == src {
            if let Some(end_ts) = end_epoch_ts {
                if next.phy.epoch_ts - end_ts < MAX_ACK_LATENCY_SECS {
                    let ack_ref = AckRef {
                        counter: next.counter,
                        epoch_ts: next.phy.epoch_ts,
                    };
                    let f = &mut queue[idx];
                    f.acked = true;
                    f.ack_pkt = Some(ack_ref);
                    return;
                }
            }
        }
    }

    let mut found = false;
    let mut found_seq = None;
    for j in (idx + 1)..queue.len() {
        let p = &queue[j];
        if p.addr2.is_some() && p.addr2 == src {
            found = true;
            found_seq = p.seq_num;
            break;
        }
    }
    if found && found_seq != seq_num {
        queue[idx].acked = true;
    }
}

/// Infers `retry_count` for `queue[idx]` and propagates it forward through
/// any already-queued retries of the same transmission.
fn infer_retry(queue: &mut VecDeque<Dot11Frame>, idx: usize) {
    let (retry, src, seq_num, eligible) = {
        let f = &queue[idx];
        (f.retry, f.addr2, f.seq_num, is_inference_eligible(f))
    };

    let retry_count = if !retry { 0 } else { 1 };
    queue[idx].retry_count = retry_count;

    if !eligible {
        return;
    }

    let mut current_retry = retry_count + 1;
    for j in (idx + 1)..queue.len() {
        let (p_retry, p_src, p_seq) = {
            let p = &queue[j];
            (p.retry, p.addr2, p.seq_num)
        };
        if p_src.is_none() || p_src != src || p_seq.is_none() {
            continue;
        }
        if !p_retry || p_seq != seq_num {
            break;
        }
        queue[j].retry_count = current_retry;
        current_retry += 1;
    }
}

/// An ordered stream of decoded 802.11 frames, with inferred ack/retry
/// relationships. Implements `Iterator<Item = Dot11Frame>`.
pub struct Trace {
    decoder: Decoder,
    queue: VecDeque<Dot11Frame>,
    eof: bool,
}

impl Trace {
    fn fetch(&mut self) -> Result<()> {
        if self.queue.len() < LOOKAHEAD_LOW_WATER && !self.eof {
            let batch = self.decoder.next_batch(BATCH_SIZE)?;
            if batch.is_empty() {
                self.eof = true;
            }
            self.queue.extend(batch);
        }
        Ok(())
    }

    /// Non-consuming look at the head of the queue.
    pub fn peek(&mut self) -> Option<&Dot11Frame> {
        let _ = self.fetch();
        self.queue.front()
    }
}

impl Iterator for Trace {
    type Item = Dot11Frame;

    fn next(&mut self) -> Option<Dot11Frame> {
        if let Err(e) = self.fetch() {
            trace!("trace stream ended on envelope error: {}", e);
            self.eof = true;
        }
        if self.queue.is_empty() {
            return None;
        }
        infer_acked(&mut self.queue, 0);
        infer_retry(&mut self.queue, 0);
        self.queue.pop_front()
    }
}

/// Returns whether the given path's leading magic bytes match any known
/// packet trace envelope.
pub fn is_packet_trace(path: impl AsRef<Path>) -> bool {
    let Ok(mut f) = std::fs::File::open(path) else {
        return false;
    };
    use std::io::Read;
    let mut magic = [0u8; 4];
    if f.read_exact(&mut magic).is_err() {
        return false;
    }
    pcap::matches_magic(&magic) || peektagged::matches_magic(&magic)
}

/// Opens a packet trace file, dispatching on its magic bytes.
pub fn load_trace(path: impl AsRef<Path>, opts: LoadOptions) -> Result<Trace> {
    let path = path.as_ref();
    let mut f = std::fs::File::open(path)?;
    use std::io::Read;
    let mut magic = [0u8; 4];
    f.read_exact(&mut magic)
        .map_err(|_| crate::error::Error::UnknownMagic([0, 0, 0, 0]))?;
    drop(f);

    let decoder = if pcap::matches_magic(&magic) {
        Decoder::Pcap(PcapDecoder::open(path, opts.fix_timestamp)?)
    } else if peektagged::matches_magic(&magic) {
        Decoder::PeekTagged(PeekTaggedDecoder::open(path)?)
    } else {
        return Err(crate::error::Error::UnknownMagic(magic));
    };

    Ok(Trace {
        decoder,
        queue: VecDeque::new(),
        eof: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macaddr::MacAddr;
    use crate::phy::PhyInfo;

    fn frame(counter: u64, src: [u8; 6], dest: [u8; 6], seq: u16, ts: f64, retry: bool) -> Dot11Frame {
        let mut phy = PhyInfo {
            epoch_ts: ts,
            rate: Some(12.0),
            len: 100,
            ..Default::default()
        };
        phy.derive_end_epoch_ts();
        Dot11Frame {
            counter,
            phy,
            fc: (crate::dot11::TYPE_DATA as u16) << 2,
            frame_type: FrameType::Data,
            subtype: 0,
            to_ds: false,
            from_ds: false,
            more_frag: false,
            retry,
            power: false,
            more_data: false,
            protected: false,
            order: false,
            duration: 0,
            addr1: Some(MacAddr(dest)),
            addr2: Some(MacAddr(src)),
            addr3: None,
            addr4: None,
            seq_num: Some(seq),
            frag_num: Some(0),
            qos: None,
            block_ack: None,
            beacon: None,
            raw: vec![],
            hash: Default::default(),
            malformed: false,
            acked: false,
            ack_pkt: None,
            retry_count: 0,
        }
    }

    fn ack(counter: u64, dest: [u8; 6], ts: f64) -> Dot11Frame {
        Dot11Frame {
            counter,
            phy: PhyInfo {
                epoch_ts: ts,
                ..Default::default()
            },
            fc: ((crate::dot11::TYPE_CONTROL as u16) << 2) | (0xd << 4),
            frame_type: FrameType::Control,
            subtype: 0xd,
            to_ds: false,
            from_ds: false,
            more_frag: false,
            retry: false,
            power: false,
            more_data: false,
            protected: false,
            order: false,
            duration: 0,
            addr1: Some(MacAddr(dest)),
            addr2: None,
            addr3: None,
            addr4: None,
            seq_num: None,
            frag_num: None,
            qos: None,
            block_ack: None,
            beacon: None,
            raw: vec![],
            hash: Default::default(),
            malformed: false,
            acked: false,
            ack_pkt: None,
            retry_count: 0,
        }
    }

    #[test]
    fn ack_inferred_within_window() {
        let a = [1u8, 1, 1, 1, 1, 1];
        let b = [2u8, 2, 2, 2, 2, 2];
        let data = frame(1, a, b, 5, 100.0, false);
        let end_ts = data.phy.end_epoch_ts.unwrap();
        let ack_frame = ack(2, a, end_ts + 5e-5);

        let mut queue: VecDeque<Dot11Frame> = VecDeque::from(vec![data, ack_frame]);
        infer_acked(&mut queue, 0);
        assert!(queue[0].acked);
        assert_eq!(queue[0].ack_pkt.unwrap().counter, 2);
    }

    fn block_ack(counter: u64, src: [u8; 6], dest: [u8; 6], ts: f64) -> Dot11Frame {
        Dot11Frame {
            counter,
            phy: PhyInfo {
                epoch_ts: ts,
                ..Default::default()
            },
            fc: ((crate::dot11::TYPE_CONTROL as u16) << 2) | (0x9 << 4),
            frame_type: FrameType::Control,
            subtype: 0x9,
            to_ds: false,
            from_ds: false,
            more_frag: false,
            retry: false,
            power: false,
            more_data: false,
            protected: false,
            order: false,
            duration: 0,
            addr1: Some(MacAddr(dest)),
            addr2: Some(MacAddr(src)),
            addr3: None,
            addr4: None,
            seq_num: None,
            frag_num: None,
            qos: None,
            block_ack: None,
            beacon: None,
            raw: vec![],
            hash: Default::default(),
            malformed: false,
            acked: false,
            ack_pkt: None,
            retry_count: 0,
        }
    }

    #[test]
    fn acked_via_fallback_when_next_same_source_frame_is_block_ack() {
        let a = [1u8, 1, 1, 1, 1, 1];
        let b = [2u8, 2, 2, 2, 2, 2];
        let first = frame(1, a, b, 5, 100.0, false);
        let ba = block_ack(2, a, b, 200.0);

        let mut queue: VecDeque<Dot11Frame> = VecDeque::from(vec![first, ba]);
        infer_acked(&mut queue, 0);
        assert!(queue[0].acked);
        assert!(queue[0].ack_pkt.is_none());
    }

    #[test]
    fn acked_via_station_moved_on_when_no_immediate_ack() {
        let a = [1u8, 1, 1, 1, 1, 1];
        let b = [2u8, 2, 2, 2, 2, 2];
        let first = frame(1, a, b, 5, 100.0, false);
        let second = frame(2, a, b, 6, 200.0, false);

        let mut queue: VecDeque<Dot11Frame> = VecDeque::from(vec![first, second]);
        infer_acked(&mut queue, 0);
        assert!(queue[0].acked);
        assert!(queue[0].ack_pkt.is_none());
    }

    #[test]
    fn no_ack_inferred_when_station_stays_on_same_seq() {
        let a = [1u8, 1, 1, 1, 1, 1];
        let b = [2u8, 2, 2, 2, 2, 2];
        let first = frame(1, a, b, 5, 100.0, false);
        let second = frame(2, a, b, 5, 200.0, true);

        let mut queue: VecDeque<Dot11Frame> = VecDeque::from(vec![first, second]);
        infer_acked(&mut queue, 0);
        assert!(!queue[0].acked);
    }

    #[test]
    fn retry_counts_increase_across_repeats() {
        let a = [1u8, 1, 1, 1, 1, 1];
        let b = [2u8, 2, 2, 2, 2, 2];
        let first = frame(1, a, b, 5, 100.0, false);
        let retry1 = frame(2, a, b, 5, 100.001, true);
        let retry2 = frame(3, a, b, 5, 100.002, true);

        let mut queue: VecDeque<Dot11Frame> = VecDeque::from(vec![first, retry1, retry2]);
        infer_retry(&mut queue, 0);
        assert_eq!(queue[0].retry_count, 0);
        assert_eq!(queue[1].retry_count, 1);
        assert_eq!(queue[2].retry_count, 2);
    }

    #[test]
    fn retry_count_starts_at_one_when_first_transmission_missed() {
        let a = [1u8, 1, 1, 1, 1, 1];
        let b = [2u8, 2, 2, 2, 2, 2];
        let only_retry = frame(1, a, b, 5, 100.0, true);
        let mut queue: VecDeque<Dot11Frame> = VecDeque::from(vec![only_retry]);
        infer_retry(&mut queue, 0);
        assert_eq!(queue[0].retry_count, 1);
    }
}
