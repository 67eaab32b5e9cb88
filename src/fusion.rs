//! Time-aligns two traces of the same physical capture.
//!
//! Ported from `wltrace.fusion.Aggregator.do_aggregate`: finds beacons
//! common to both traces (by MD5 hash), uses their `mactime` deltas to
//! compute per-interval clock drift, rescales trace 2's `mactime` onto
//! trace 1's clock, and merges the two traces interval by interval. A pure
//! function over already-collected frame vectors — the `--traces`/`--out`
//! CLI that historically drove this end-to-end is out of scope here.

use std::collections::HashMap;

use log::{debug, warn};

use crate::dot11::Dot11Frame;

struct Beacon {
    index: usize,
    mactime: u64,
}

fn common_beacons(trace1: &[Dot11Frame], trace2: &[Dot11Frame]) -> (HashMap<[u8; 16], Beacon>, HashMap<[u8; 16], Beacon>, Vec<[u8; 16]>) {
    let mut hash1: HashMap<[u8; 16], Beacon> = HashMap::new();
    let mut order1 = Vec::new();
    for (i, p) in trace1.iter().enumerate() {
        if p.is_beacon() {
            if let Some(mactime) = p.phy.mactime {
                let h = p.hash();
                if hash1.contains_key(&h) {
                    continue;
                }
                order1.push(h);
                hash1.insert(h, Beacon { index: i, mactime });
            }
        }
    }

    let mut hash2: HashMap<[u8; 16], Beacon> = HashMap::new();
    for (i, p) in trace2.iter().enumerate() {
        if p.is_beacon() {
            if let Some(mactime) = p.phy.mactime {
                let h = p.hash();
                hash2.entry(h).or_insert(Beacon { index: i, mactime });
            }
        }
    }

    let common: Vec<[u8; 16]> = order1.into_iter().filter(|h| hash2.contains_key(h)).collect();
    (hash1, hash2, common)
}

/// Merges `trace2` into `trace1`'s clock, returning the fused, re-numbered
/// sequence. If fewer than two common beacons are found, `trace1` is
/// returned unchanged (nothing to align against).
pub fn fuse(trace1: Vec<Dot11Frame>, mut trace2: Vec<Dot11Frame>) -> Vec<Dot11Frame> {
    let (hash1, hash2, common_hash) = common_beacons(&trace1, &trace2);

    debug!(
        "beacons: trace1={}, trace2={}, common={}",
        hash1.len(),
        hash2.len(),
        common_hash.len()
    );

    if common_hash.len() < 2 {
        warn!("fewer than 2 common beacons, cannot merge traces");
        return trace1;
    }

    let base_mactime = hash1[&common_hash[0]].mactime;
    let base_epoch_ts = trace1[hash1[&common_hash[0]].index].phy.epoch_ts;

    let mut merged: Vec<Dot11Frame> = Vec::new();

    for window in common_hash.windows(2) {
        let (first, second) = (window[0], window[1]);
        let t1_a = hash1[&first].mactime;
        let t1_b = hash1[&second].mactime;
        let t2_a = hash2[&first].mactime;
        let t2_b = hash2[&second].mactime;

        let duration = t1_b as f64 - t1_a as f64;
        let ratio = duration / (t2_b as f64 - t2_a as f64);

        let t2_start = hash2[&first].index;
        let t2_end = hash2[&second].index; // exclusive, matches the beacon at `second`
        for p in trace2[t2_start..t2_end].iter_mut() {
            if let Some(mactime) = p.phy.mactime {
                p.phy.mactime = Some((ratio * (mactime as f64 - t2_a as f64) + t1_a as f64) as u64);
            }
        }

        merged.push(trace1[hash1[&first].index].clone());

        let t1_start = hash1[&first].index;
        let t1_end = hash1[&second].index;
        let mut interval: Vec<&Dot11Frame> = trace1[t1_start..t1_end]
            .iter()
            .chain(trace2[t2_start..t2_end].iter())
            .filter(|p| p.phy.mactime.is_some())
            .collect();
        interval.sort_by_key(|p| p.phy.mactime.unwrap());

        for pkt in interval {
            let last = merged.last().unwrap();
            let delta = pkt.phy.mactime.unwrap() as i64 - last.phy.mactime.unwrap_or(0) as i64;
            let dup = pkt.hash() == last.hash() && delta < 5;
            if dup {
                continue;
            }
            merged.push(pkt.clone());
        }
    }

    merged.push(trace1[hash1[common_hash.last().unwrap()].index].clone());

    for (i, p) in merged.iter_mut().enumerate() {
        if let Some(mactime) = p.phy.mactime {
            let delta_us = mactime as i64 - base_mactime as i64;
            p.phy.epoch_ts = base_epoch_ts + delta_us as f64 * 1e-6;
        }
        p.counter = (i + 1) as u64;
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dot11::{BeaconInfo, FrameType};
    use crate::macaddr::MacAddr;
    use crate::phy::PhyInfo;

    fn beacon(counter: u64, mactime: u64, epoch_ts: f64, ssid: &str) -> Dot11Frame {
        Dot11Frame {
            counter,
            phy: PhyInfo {
                mactime: Some(mactime),
                epoch_ts,
                ..Default::default()
            },
            fc: (crate::dot11::TYPE_MANAGEMENT as u16) << 2 | (8 << 4),
            frame_type: FrameType::Management,
            subtype: 8,
            to_ds: false,
            from_ds: false,
            more_frag: false,
            retry: false,
            power: false,
            more_data: false,
            protected: false,
            order: false,
            duration: 0,
            addr1: Some(MacAddr::BROADCAST),
            addr2: Some(MacAddr([1, 2, 3, 4, 5, 6])),
            addr3: Some(MacAddr([1, 2, 3, 4, 5, 6])),
            addr4: None,
            seq_num: Some(0),
            frag_num: Some(0),
            qos: None,
            block_ack: None,
            beacon: Some(BeaconInfo {
                timestamp_tsf: mactime,
                interval: 100,
                capabilities: 0,
                ssid: Some(ssid.to_string()),
            }),
            raw: ssid.as_bytes().to_vec(),
            hash: Default::default(),
            malformed: false,
            acked: false,
            ack_pkt: None,
            retry_count: 0,
        }
    }

    #[test]
    fn too_few_common_beacons_returns_trace1_unchanged() {
        let t1 = vec![beacon(1, 0, 0.0, "only-one")];
        let t2 = vec![beacon(1, 0, 0.0, "only-one")];
        let fused = fuse(t1.clone(), t2);
        assert_eq!(fused.len(), t1.len());
        assert_eq!(fused[0].raw, t1[0].raw);
    }

    #[test]
    fn aligns_trace2_onto_trace1_clock() {
        let t1 = vec![
            beacon(1, 1_000_000, 1000.0, "beacon-a"),
            beacon(2, 1_100_000, 1000.1, "beacon-b"),
        ];
        let t2 = vec![
            beacon(1, 2_000_000, 2000.0, "beacon-a"),
            beacon(2, 2_100_000, 2000.1, "beacon-b"),
        ];
        let fused = fuse(t1, t2);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].counter, 1);
        assert_eq!(fused[1].counter, 2);
    }
}
