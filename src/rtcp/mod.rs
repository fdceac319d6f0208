//! RTCP feedback packet codecs: NACK, PLI/FIR, REMB and transport-cc.
//!
//! Each submodule is a pair of free `build_*`/`parse_*` (or `encode`/
//! `decode`) functions over the common feedback header in [`header`]; none
//! of them own any state, that lives in the components under
//! [`crate::nack_generator`], [`crate::key_frame_request_manager`] and
//! [`crate::tcc`].

pub mod header;
pub mod nack;
pub mod pli_fir;
pub mod remb;
pub mod transport_cc;

pub use header::{FeedbackHeader, FMT_AFB, FMT_FIR, FMT_NACK, FMT_PLI, FMT_TCC, PT_PSFB, PT_RTPFB};
pub use nack::{build_nack_packets, parse_nack_packet};
pub use pli_fir::{build_fir, build_pli, parse_fir, parse_pli};
pub use remb::{build_remb, parse_remb, Remb};
pub use transport_cc::{decode as decode_tcc_feedback, encode as encode_tcc_feedback, TccEntry, TccFeedback};
