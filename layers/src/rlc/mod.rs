//! Radio Link Control (RLC) Layer Implementation
//!
//! Implements the LTE RLC layer according to 3GPP TS 36.322: transparent,
//! unacknowledged and acknowledged mode data transfer on top of the
//! per-bearer state kept in [`crate::rb::RadioBearer`].

pub mod pdu;
pub mod sn;
mod engine;

pub use engine::RlcEngine;

use serde::{Deserialize, Serialize};

use crate::LayerError;
use pdu::UmSnSize;

/// RLC operating modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RlcMode {
    /// Transparent Mode
    Tm,
    /// Unacknowledged Mode
    Um,
    /// Acknowledged Mode
    Am,
}

/// RLC layer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlcConfig {
    /// t-PollRetransmit in milliseconds
    #[serde(default = "default_poll_retransmit_ms")]
    pub poll_retransmit_ms: u32,
    /// UMD sequence number length in bits (5 or 10)
    #[serde(default = "default_um_sn_size")]
    pub um_sn_size: u8,
    /// Only answer AMD PDUs carrying a poll request with a STATUS PDU
    #[serde(default)]
    pub status_on_poll_only: bool,
}

fn default_poll_retransmit_ms() -> u32 {
    100
}

fn default_um_sn_size() -> u8 {
    10
}

impl Default for RlcConfig {
    fn default() -> Self {
        Self {
            poll_retransmit_ms: default_poll_retransmit_ms(),
            um_sn_size: default_um_sn_size(),
            status_on_poll_only: false,
        }
    }
}

impl RlcConfig {
    /// Check the configured values
    pub fn validate(&self) -> Result<(), LayerError> {
        if UmSnSize::from_bits(self.um_sn_size).is_none() {
            return Err(LayerError::ConfigurationError(format!(
                "um_sn_size must be 5 or 10, got {}",
                self.um_sn_size
            )));
        }
        if self.poll_retransmit_ms == 0 {
            return Err(LayerError::ConfigurationError(
                "poll_retransmit_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// UMD sequence number size, 10 bits unless 5 is configured
    pub fn um_sn_size(&self) -> UmSnSize {
        UmSnSize::from_bits(self.um_sn_size).unwrap_or(UmSnSize::Ten)
    }
}
