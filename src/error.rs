//! Crate-wide error type.

use std::io;

use quick_error::quick_error;

/// The kind of structural violation behind `Error::Malformed`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MalformedKind {
    Pcap,
    Radiotap,
    PeekTagged,
    MacBody,
}

impl std::fmt::Display for MalformedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MalformedKind::Pcap => "pcap",
            MalformedKind::Radiotap => "radiotap",
            MalformedKind::PeekTagged => "peek-tagged",
            MalformedKind::MacBody => "802.11 MAC body",
        };
        f.write_str(name)
    }
}

quick_error! {
    /// An error that can occur while decoding a packet trace.
    #[derive(Debug)]
    pub enum Error {
        /// Underlying file I/O failed.
        Io(err: io::Error) {
            display("I/O error: {}", err)
            source(err)
            from()
        }
        /// A bounded read ran off the end of the buffer.
        ShortRead(expected: usize, got: usize) {
            display("short read: expected {} bytes, got {}", expected, got)
        }
        /// The file's leading magic bytes did not match any known envelope.
        UnknownMagic(magic: [u8; 4]) {
            display("unknown file magic: {:02x?}", magic)
        }
        /// A Pcap `network` field this crate does not decode.
        UnsupportedLinktype(linktype: u32) {
            display("unsupported pcap linktype: {}", linktype)
        }
        /// A Pcap global header version other than 2.4.
        UnsupportedPcapVersion(major: u16, minor: u16) {
            display("unsupported pcap version: {}.{}", major, minor)
        }
        /// A Radiotap header version other than 0.
        UnsupportedRadiotapVersion(version: u8) {
            display("unsupported radiotap version: {}", version)
        }
        /// A header-level structural violation.
        Malformed(kind: MalformedKind, reason: String) {
            display("malformed {} header: {}", kind, reason)
        }
        /// An out-of-range argument, e.g. to `mcs_to_rate`.
        BadArgument(reason: String) {
            display("bad argument: {}", reason)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Error {
        Error::Malformed(MalformedKind::PeekTagged, err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(err: quick_xml::events::attributes::AttrError) -> Error {
        Error::Malformed(MalformedKind::PeekTagged, err.to_string())
    }
}

impl From<quick_xml::encoding::EncodingError> for Error {
    fn from(err: quick_xml::encoding::EncodingError) -> Error {
        Error::Malformed(MalformedKind::PeekTagged, err.to_string())
    }
}
