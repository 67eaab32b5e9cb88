//! Capture quality metrics for a single transmitter/receiver pair.
//!
//! Ported from `wltrace.quality.CaptureQuality`: drives a trace to
//! completion, filtering to frames between `ta` and `ra`, and tallies how
//! many transmissions, acks, and sequence numbers the capture appears to
//! have missed.

use crate::dot11::{Dot11Frame, FrameType};
use crate::macaddr::MacAddr;
use crate::mcs::rate_to_mcs;

const SEQ_NUM_MODULO: i32 = 4096;

/// Missed-frame/ack statistics for one (transmitter, receiver) pair over a
/// trace.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CaptureQuality {
    pub tx_pkts_count: u64,
    pub ack_count: u64,
    pub missing_tx_count: u64,
    pub missing_ack_count: u64,
    pub dangling_ack: Vec<u64>,
    pub missing_ack: Vec<u64>,
    pub missing_seq: Vec<u64>,
}

fn is_lowest_rate(rate: Option<f64>) -> bool {
    match rate {
        Some(r) => matches!(rate_to_mcs(r, 20, true), Ok(0)),
        None => false,
    }
}

impl CaptureQuality {
    /// Drains `trace`, accumulating statistics for the `ta -> ra` link.
    pub fn compute(trace: impl Iterator<Item = Dot11Frame>, ta: MacAddr, ra: MacAddr) -> CaptureQuality {
        let mut q = CaptureQuality::default();
        let mut last_data_pkt: Option<Dot11Frame> = None;

        for pkt in trace {
            if pkt.phy.fcs_error == Some(true) {
                continue;
            }
            if pkt.frame_type == FrameType::Data {
                let matches = pkt.addr2 == Some(ta) && pkt.addr1 == Some(ra);
                if !matches {
                    continue;
                }
            }
            if pkt.is_ack() && pkt.addr1 != Some(ta) {
                continue;
            }

            if pkt.acked || pkt.is_ack() {
                q.ack_count += 1;
            }

            if pkt.is_ack() {
                q.dangling_ack.push(pkt.counter);
                q.missing_tx_count += 1;
            } else {
                q.tx_pkts_count += 1;

                if last_data_pkt.is_none() && pkt.retry {
                    q.missing_tx_count += 1;
                }

                if let Some(last) = &last_data_pkt {
                    let (pkt_seq, last_seq) = match (pkt.seq_num, last.seq_num) {
                        (Some(p), Some(l)) => (p as i32, l as i32),
                        _ => (0, 0),
                    };
                    let seq_diff = (pkt_seq - last_seq + SEQ_NUM_MODULO) % SEQ_NUM_MODULO;
                    if seq_diff > 0 {
                        q.missing_tx_count += (seq_diff - 1) as u64;
                        if seq_diff > 1 {
                            q.missing_seq.push(last.counter);
                        }
                        if pkt.retry {
                            q.missing_tx_count += 1;
                        }
                        if !last.acked && !is_lowest_rate(last.phy.rate) {
                            q.missing_ack_count += 1;
                            q.missing_ack.push(last.counter);
                        }
                    }
                }

                last_data_pkt = Some(pkt);
            }
        }

        q
    }
}
