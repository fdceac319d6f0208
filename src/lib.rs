//! Real-time media transport core for a WebRTC SFU worker.
//!
//! This crate implements the stateful, single-threaded-per-transport
//! components that sit between a raw UDP/TCP socket and the media/signalling
//! layers of an SFU: an ICE-Lite server, Generic NACK generation and
//! retransmission, PLI/FIR key-frame request throttling, a transport-wide
//! congestion control feedback producer and client-side bandwidth estimator,
//! and the pacer that schedules outbound media against the estimate.
//!
//! None of it owns a socket or a timer; [`timer::Socket`] and
//! [`clock::Clock`] are the only I/O seams, so every component can be driven
//! deterministically from a test harness as well as a real event loop
//! (`spec.md` §5).

pub mod clock;
pub mod config;
pub mod error;
pub mod glue;
pub mod ice_server;
pub mod key_frame_request_manager;
pub mod logging;
pub mod nack_generator;
pub mod rate_calculator;
pub mod retransmission_buffer;
pub mod rtcp;
pub mod rtp;
pub mod stats;
pub mod stun;
pub mod tcc;
pub mod timer;
pub mod transport;
pub mod trend_calculator;

pub use clock::{Clock, ManualClock, MonoMs, SystemClock};
pub use config::Settings;
pub use error::RtcCoreError;
pub use glue::{ExtensionIds, PacketRouter, RouteOutcome};
