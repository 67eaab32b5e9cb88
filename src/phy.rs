//! The PHY-layer descriptor attached to every decoded frame.

/// Physical-layer metadata for a single captured frame.
///
/// Populated by whichever envelope decoder read the frame (Radiotap over
/// Pcap, or the peek-tagged per-packet header), not by the 802.11 MAC
/// parser. See `wltrace.common.PhyInfo` in the original implementation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PhyInfo {
    /// Received signal strength, dBm.
    pub signal: Option<i8>,
    /// Noise floor, dBm.
    pub noise: Option<i8>,
    /// Channel center frequency, MHz.
    pub freq_mhz: Option<u16>,
    /// Whether the capture includes the trailing 4-byte FCS.
    pub has_fcs: bool,
    /// Whether the FCS check failed, when known.
    pub fcs_error: Option<bool>,
    /// POSIX timestamp of the first bit of the frame.
    pub epoch_ts: f64,
    /// POSIX timestamp of the last bit of the frame, when derivable.
    pub end_epoch_ts: Option<f64>,
    /// MAC-layer TSF counter, microseconds.
    pub mactime: Option<u64>,
    /// Modulation rate, Mbps.
    pub rate: Option<f64>,
    /// HT MCS index, when the rate was carried as an MCS field.
    pub mcs: Option<u8>,
    /// On-air length including the 4-byte FCS.
    pub len: u32,
    /// Stored byte count, always `<= len`.
    pub caplen: u32,
    /// A-MPDU reference number, Pcap/Radiotap only.
    pub ampdu_ref: Option<u32>,
    /// Whether this subframe was the last (rate-bearing) one in its A-MPDU.
    pub last_ampdu: Option<bool>,
}

impl PhyInfo {
    /// Fills in `end_epoch_ts` from `len`/`rate`, if not already set and
    /// `rate` is known and positive.
    pub fn derive_end_epoch_ts(&mut self) {
        if self.end_epoch_ts.is_none() {
            if let Some(rate) = self.rate {
                if rate > 0.0 {
                    self.end_epoch_ts =
                        Some(self.epoch_ts + self.len as f64 * 8.0 / rate * 1e-6);
                }
            }
        }
    }
}
