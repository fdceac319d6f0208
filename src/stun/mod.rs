//! STUN message parsing/building (RFC 5389) plus the short-term-credential
//! integrity and fingerprint primitives ICE-Lite authentication needs.

pub mod crypto;
pub mod message;

pub use message::{parse, Attributes, Class, Method, StunMessage};
