//! Process configuration: one `Settings` aggregate assembled through the
//! `config` crate, layering a TOML file over environment overrides, with
//! a `*Config` struct per component named in `spec.md` §4 (`spec.md` §7
//! `ConfigurationInvalid`, ambient stack per `SPEC_FULL.md` §2).

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigurationInvalid;
use crate::tcc::LossBasedBweV2Config;

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigurationInvalid {
    ConfigurationInvalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NackConfig {
    pub max_retries: u8,
    pub max_list_size: usize,
    pub max_packet_age: u32,
    #[serde(with = "humantime_serde")]
    pub time_filter_period: Duration,
}

impl Default for NackConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            max_list_size: 1_000,
            max_packet_age: 10_000,
            time_filter_period: Duration::from_millis(40),
        }
    }
}

impl NackConfig {
    pub fn validate(&self) -> Result<(), ConfigurationInvalid> {
        if self.max_retries == 0 {
            return Err(invalid("max_retries", "must be at least 1"));
        }
        if self.max_list_size == 0 {
            return Err(invalid("max_list_size", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetransmissionBufferConfig {
    pub max_items: usize,
    pub clock_rate: u32,
    #[serde(with = "humantime_serde")]
    pub max_retransmission_delay: Duration,
}

impl Default for RetransmissionBufferConfig {
    fn default() -> Self {
        Self {
            max_items: 1_000,
            clock_rate: 90_000,
            max_retransmission_delay: Duration::from_millis(2_000),
        }
    }
}

impl RetransmissionBufferConfig {
    pub fn validate(&self) -> Result<(), ConfigurationInvalid> {
        if self.max_items == 0 {
            return Err(invalid("max_items", "must be at least 1"));
        }
        if self.clock_rate == 0 {
            return Err(invalid("clock_rate", "must be nonzero"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct KeyFrameRequestConfig {
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for KeyFrameRequestConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1_000),
        }
    }
}

impl KeyFrameRequestConfig {
    pub fn validate(&self) -> Result<(), ConfigurationInvalid> {
        if self.delay.is_zero() {
            return Err(invalid("delay", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub max_tuples: usize,
    #[serde(with = "humantime_serde")]
    pub consent_period: Duration,
    #[serde(with = "humantime_serde")]
    pub consent_timeout: Duration,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            max_tuples: 8,
            consent_period: Duration::from_secs(5),
            consent_timeout: Duration::from_secs(30),
        }
    }
}

impl IceConfig {
    pub fn validate(&self) -> Result<(), ConfigurationInvalid> {
        if self.max_tuples == 0 {
            return Err(invalid("max_tuples", "must be at least 1"));
        }
        if self.consent_timeout <= self.consent_period {
            return Err(invalid(
                "consent_timeout",
                "must be greater than consent_period",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TccServerConfig {
    #[serde(with = "humantime_serde")]
    pub flush_period: Duration,
    pub max_feedback_bytes: usize,
}

impl Default for TccServerConfig {
    fn default() -> Self {
        Self {
            flush_period: Duration::from_millis(100),
            max_feedback_bytes: 1_200,
        }
    }
}

impl TccServerConfig {
    pub fn validate(&self) -> Result<(), ConfigurationInvalid> {
        if self.flush_period.is_zero() {
            return Err(invalid("flush_period", "must be positive"));
        }
        if self.max_feedback_bytes < 16 {
            return Err(invalid("max_feedback_bytes", "must fit at least the header"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TccClientConfig {
    pub min_bitrate_bps: f64,
    pub max_bitrate_bps: f64,
    pub start_bitrate_bps: f64,
    pub loss_based: LossBasedBweV2Config,
}

impl Default for TccClientConfig {
    fn default() -> Self {
        Self {
            min_bitrate_bps: 5_000.0,
            max_bitrate_bps: 100_000_000.0,
            start_bitrate_bps: 300_000.0,
            loss_based: LossBasedBweV2Config::default(),
        }
    }
}

impl TccClientConfig {
    pub fn validate(&self) -> Result<(), ConfigurationInvalid> {
        if self.min_bitrate_bps <= 0.0 || self.max_bitrate_bps <= self.min_bitrate_bps {
            return Err(invalid(
                "min_bitrate_bps/max_bitrate_bps",
                "min must be > 0 and < max",
            ));
        }
        if !(self.min_bitrate_bps..=self.max_bitrate_bps).contains(&self.start_bitrate_bps) {
            return Err(invalid("start_bitrate_bps", "must lie within [min, max]"));
        }
        self.loss_based.validate()
    }
}

/// Top-level settings aggregate. Deserialized from a TOML file layered
/// with environment overrides (`RTC_CORE__<SECTION>__<FIELD>`), the way
/// Medea's own root crate composes the `config` crate.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub nack: NackConfig,
    pub retransmission_buffer: RetransmissionBufferConfig,
    pub key_frame_request: KeyFrameRequestConfig,
    pub ice: IceConfig,
    pub tcc_server: TccServerConfig,
    pub tcc_client: TccClientConfig,
}

impl Settings {
    /// Loads settings from `path` (if it exists) layered with
    /// `RTC_CORE__`-prefixed environment variables, falling back to
    /// documented defaults for anything unset.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("RTC_CORE").separator("__"));
        builder.build()?.try_deserialize()
    }

    /// Validates every component's configuration. A caller that gets
    /// `Err` degrades the corresponding component per `spec.md` §7 rather
    /// than failing the whole process, except where a component cannot
    /// sensibly run at all (ICE, retransmission buffer, NACK generator),
    /// in which case this is the hard construction-time check.
    pub fn validate(&self) -> Result<(), ConfigurationInvalid> {
        self.nack.validate()?;
        self.retransmission_buffer.validate()?;
        self.key_frame_request.validate()?;
        self.ice.validate()?;
        self.tcc_server.validate()?;
        self.tcc_client.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn zero_max_retries_is_rejected() {
        let mut nack = NackConfig::default();
        nack.max_retries = 0;
        assert!(nack.validate().is_err());
    }

    #[test]
    fn consent_timeout_must_exceed_period() {
        let mut ice = IceConfig::default();
        ice.consent_timeout = ice.consent_period;
        assert!(ice.validate().is_err());
    }

    #[test]
    fn loss_based_defaults_compose_into_client_config() {
        let client = TccClientConfig::default();
        assert!(client.validate().is_ok());
    }
}
