//! Decodes IEEE 802.11 packet traces into a unified, ordered frame stream.
//!
//! Two envelope formats are supported: libpcap captures carrying Radiotap
//! (or bare 802.11) frames, and Omnipeek/WildPackets "peek-tagged" files.
//! Both are exposed through the same [`Trace`](stream::Trace) iterator,
//! which also infers per-frame ack/retry relationships as it streams.
//!
//! ```no_run
//! let opts = dot11trace::stream::LoadOptions::default();
//! let trace = dot11trace::load_trace("capture.pcap", opts).unwrap();
//! for frame in trace {
//!     println!("{:?} -> {:?}", frame.src(), frame.dest());
//! }
//! ```

pub mod cursor;
pub mod dot11;
pub mod error;
pub mod fusion;
pub mod macaddr;
pub mod mcs;
pub mod pcap;
pub mod peektagged;
pub mod phy;
pub mod quality;
pub mod radiotap;
pub mod stream;

pub use dot11::Dot11Frame;
pub use error::{Error, Result};
pub use stream::{is_packet_trace, load_trace, LoadOptions, Trace};
