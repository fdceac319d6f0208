//! RTP packet model and the header extensions the core consumes.

pub mod extensions;
pub mod packet;

pub use packet::{is_seq_higher_than, is_seq_lower_than, is_ts_higher_than, seq_delta, RtpPacket};
