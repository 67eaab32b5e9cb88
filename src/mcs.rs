//! The HT MCS rate table and conversions to/from it.
//!
//! Ported verbatim from the `MCS_TABLE` in the original `wltrace.dot11`
//! implementation (values from <http://mcsindex.com/>), which this system's
//! Radiotap and peek-tagged decoders both depend on to turn an MCS index
//! into a bitrate.

use crate::error::{Error, Result};

/// `MCS_TABLE[mcs][idx]` where `idx` selects one of
/// `{20,40,80,160} MHz x {long GI, short GI}`, in that order.
const MCS_TABLE: [[f64; 8]; 16] = [
    [6.5, 7.2, 13.5, 15.0, 29.3, 32.5, 58.5, 65.0],
    [13.0, 14.4, 27.0, 30.0, 58.5, 65.0, 117.0, 130.0],
    [19.5, 21.7, 40.5, 45.0, 87.8, 97.5, 175.5, 195.0],
    [26.0, 28.9, 54.0, 60.0, 117.0, 130.0, 234.0, 260.0],
    [39.0, 43.3, 81.0, 90.0, 175.5, 195.0, 351.0, 390.0],
    [52.0, 57.8, 108.0, 120.0, 234.0, 260.0, 468.0, 520.0],
    [58.5, 65.0, 121.5, 135.0, 263.3, 292.5, 526.5, 585.0],
    [65.0, 72.2, 135.0, 150.0, 292.5, 325.0, 585.0, 650.0],
    [13.0, 14.4, 27.0, 30.0, 58.5, 65.0, 117.0, 130.0],
    [26.0, 28.9, 54.0, 60.0, 117.0, 130.0, 234.0, 260.0],
    [39.0, 43.3, 81.0, 90.0, 175.5, 195.0, 351.0, 390.0],
    [52.0, 57.8, 108.0, 120.0, 234.0, 260.0, 468.0, 520.0],
    [78.0, 86.7, 162.0, 180.0, 351.0, 390.0, 702.0, 780.0],
    [104.0, 115.6, 216.0, 240.0, 468.0, 520.0, 936.0, 1040.0],
    [117.0, 130.3, 243.0, 270.0, 526.5, 585.0, 1053.0, 1170.0],
    [130.0, 144.4, 270.0, 300.0, 585.0, 650.0, 1170.0, 1300.0],
];

fn bw_gi_index(bw: u16, long_gi: bool) -> Result<usize> {
    let exp = match bw {
        20 => 0,
        40 => 1,
        80 => 2,
        160 => 3,
        other => {
            return Err(Error::BadArgument(format!("unknown bandwidth: {} MHz", other)));
        }
    };
    Ok(exp * 2 + if long_gi { 0 } else { 1 })
}

/// Converts an MCS index to a bitrate in Mbps.
///
/// ```
/// use dot11trace::mcs::mcs_to_rate;
/// assert_eq!(mcs_to_rate(5, 20, false).unwrap(), 57.8);
/// assert_eq!(mcs_to_rate(4, 40, true).unwrap(), 81.0);
/// assert_eq!(mcs_to_rate(3, 80, false).unwrap(), 130.0);
/// assert_eq!(mcs_to_rate(13, 160, true).unwrap(), 936.0);
/// ```
pub fn mcs_to_rate(mcs: u8, bw: u16, long_gi: bool) -> Result<f64> {
    let idx = bw_gi_index(bw, long_gi)?;
    let row = MCS_TABLE
        .get(mcs as usize)
        .ok_or_else(|| Error::BadArgument(format!("unknown MCS index: {}", mcs)))?;
    Ok(row[idx])
}

/// Converts a bitrate in Mbps back to an MCS index, the inverse of
/// [`mcs_to_rate`]. Matches by nearest rate within `1e-3` Mbps.
///
/// ```
/// use dot11trace::mcs::rate_to_mcs;
/// assert_eq!(rate_to_mcs(120.0, 40, false).unwrap(), 5);
/// ```
pub fn rate_to_mcs(rate: f64, bw: u16, long_gi: bool) -> Result<u8> {
    let idx = bw_gi_index(bw, long_gi)?;
    for (mcs, row) in MCS_TABLE.iter().enumerate() {
        if (row[idx] - rate).abs() < 1e-3 {
            return Ok(mcs as u8);
        }
    }
    Err(Error::BadArgument(format!(
        "MCS not found: rate={}, bw={}, long_gi={}",
        rate, bw, long_gi
    )))
}
