//! Transport congestion control: server-side feedback production and
//! client-side bandwidth estimation/pacing (`spec.md` §4.G-§4.L).

pub mod aimd_rate_control;
pub mod bitrate_prober;
pub mod client;
pub mod delay_based_bwe;
pub mod loss_based_bwe_v2;
pub mod paced_sender;
pub mod remb_server;
pub mod server;

pub use aimd_rate_control::AimdRateControl;
pub use bitrate_prober::{BitrateProber, ProbeCluster};
pub use client::{RtpProbationGenerator, TargetTransferRate, TccClient, TccClientConfig};
pub use delay_based_bwe::{BandwidthUsage, DelayBasedBwe};
pub use loss_based_bwe_v2::{LossBasedBweV2, LossBasedBweV2Config, LossBasedState, Observation};
pub use paced_sender::PacedSender;
pub use remb_server::RembServer;
pub use server::TccServer;
