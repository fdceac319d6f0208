//! Error taxonomy for the real-time media transport core (`spec.md` §7).
//!
//! Every failure is localized to the component that detected it: nothing
//! here unwinds across a component boundary. Components return a `Result`
//! for direct calls and otherwise surface failures as an observable `state`
//! field the orchestrator reads on its next tick.

use derive_more::{Display, From};

/// A packet failed to parse: a STUN header was malformed, an RTCP packet's
/// length did not match its payload, or an RTP packet was shorter than a
/// fixed header. Always non-fatal; the caller drops the packet and, at
/// most, logs at debug level.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
#[display(fmt = "malformed packet: {}", reason)]
pub struct MalformedPacket {
    pub reason: &'static str,
}

impl std::error::Error for MalformedPacket {}

impl MalformedPacket {
    #[must_use]
    pub fn new(reason: &'static str) -> Self {
        Self { reason }
    }
}

/// STUN authentication failed: bad `MESSAGE-INTEGRITY`, unknown `ufrag`, or
/// a missing `FINGERPRINT`. Per `spec.md` §4.F the offending tuple is never
/// added to the ICE tuple set.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum AuthFailure {
    #[display(fmt = "STUN message carried no FINGERPRINT attribute")]
    MissingFingerprint,
    #[display(fmt = "STUN message carried no USERNAME attribute")]
    MissingUsername,
    #[display(fmt = "USERNAME did not match the current or previous ICE credentials")]
    UnknownUfrag,
    #[display(fmt = "MESSAGE-INTEGRITY did not verify against the local password")]
    BadMessageIntegrity,
    #[display(fmt = "Binding Request carried ICE-CONTROLLED against an ICE-Lite server")]
    RoleConflict,
    #[display(fmt = "Binding Request carried no PRIORITY attribute")]
    MissingPriority,
}

impl std::error::Error for AuthFailure {}

/// Something arrived, or was asked for, outside the window this component
/// tracks: an RTP packet too old for the retransmission buffer, a NACK
/// target that already expired, a consent response arriving after its
/// deadline. The caller drops the input and the relevant state transition
/// in `spec.md` happens independently of this error.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum OutOfWindow {
    #[display(fmt = "sequence {0} already outside the retransmission window", _0)]
    RetransmissionExpired(u16),
    #[display(fmt = "NACK target expired after {0} retries", _0)]
    NackRetriesExhausted(u8),
    #[display(fmt = "consent response arrived after its 30s deadline")]
    ConsentExpired,
}

impl std::error::Error for OutOfWindow {}

/// The pacer's queue is full or the transport reported backpressure. The
/// caller sees `success = false` on the send completion and decides whether
/// to drop or re-queue (`spec.md` §7).
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[display(fmt = "pacer budget exhausted, {0} bytes queued", queued_bytes)]
pub struct BudgetExhausted {
    pub queued_bytes: usize,
}

impl std::error::Error for BudgetExhausted {}

/// A `LossBasedBweV2` configuration failed `is_config_valid`. The component
/// is not constructed in a broken state; instead it is disabled and its
/// output falls back to the delay-based estimate, per `spec.md` §7.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
#[display(fmt = "configuration field `{}` out of range: {}", field, reason)]
pub struct ConfigurationInvalid {
    pub field: &'static str,
    pub reason: String,
}

impl std::error::Error for ConfigurationInvalid {}

/// Top-level error aggregating every component error, for callers that just
/// want `?` to work across the crate boundary. Individual components never
/// return this type themselves; they return their own narrow enum above.
#[derive(Debug, Display, From)]
pub enum RtcCoreError {
    #[display(fmt = "{}", _0)]
    MalformedPacket(MalformedPacket),
    #[display(fmt = "{}", _0)]
    AuthFailure(AuthFailure),
    #[display(fmt = "{}", _0)]
    OutOfWindow(OutOfWindow),
    #[display(fmt = "{}", _0)]
    BudgetExhausted(BudgetExhausted),
    #[display(fmt = "{}", _0)]
    ConfigurationInvalid(ConfigurationInvalid),
}

impl std::error::Error for RtcCoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::MalformedPacket(e) => Some(e),
            Self::AuthFailure(e) => Some(e),
            Self::OutOfWindow(e) => Some(e),
            Self::BudgetExhausted(e) => Some(e),
            Self::ConfigurationInvalid(e) => Some(e),
        }
    }
}
