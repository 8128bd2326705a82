//! Message Types for Inter-Layer Communication
//!
//! Defines the signals exchanged between MAC, RLC, PDCP, RRC and the timer tick source

use common::types::{RbId, Rnti};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::InterfaceError;

/// Identifies one bearer of one user inside a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BearerRef {
    /// C-RNTI of the owning user
    pub rnti: Rnti,
    /// Bearer within the user
    pub rb: RbId,
}

impl BearerRef {
    /// Create a new bearer reference
    pub fn new(rnti: Rnti, rb: RbId) -> Self {
        Self { rnti, rb }
    }
}

impl fmt::Display for BearerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RNTI={} RB={}", self.rnti, self.rb)
    }
}

/// Commands posted to the RRC layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RrcCommand {
    /// Release the RRC connection
    Release,
}

/// Messages exchanged between layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerMessage {
    /// MAC queued an RLC PDU on the bearer
    RlcPduReady(BearerRef),
    /// PDCP queued an RLC SDU on the bearer
    RlcSduReady(BearerRef),
    /// RLC queued a MAC SDU on the bearer
    MacSduReady(BearerRef),
    /// RLC queued a reassembled PDCP PDU on the bearer
    PdcpPduReady(BearerRef),
    /// Command for the RRC layer
    RrcCommand {
        /// Target bearer
        bearer: BearerRef,
        /// Requested action
        command: RrcCommand,
    },
    /// One millisecond timer tick
    TimerTick,
}

impl LayerMessage {
    /// Bearer the message refers to, if any
    pub fn bearer(&self) -> Option<BearerRef> {
        match self {
            LayerMessage::RlcPduReady(bearer)
            | LayerMessage::RlcSduReady(bearer)
            | LayerMessage::MacSduReady(bearer)
            | LayerMessage::PdcpPduReady(bearer)
            | LayerMessage::RrcCommand { bearer, .. } => Some(*bearer),
            LayerMessage::TimerTick => None,
        }
    }

    /// Serialize for capture or trace output
    pub fn to_json(&self) -> Result<String, InterfaceError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a captured message
    pub fn from_json(json: &str) -> Result<Self, InterfaceError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = LayerMessage::MacSduReady(BearerRef::new(Rnti::new(0x46), RbId::Drb1));

        let serialized = msg.to_json().unwrap();
        let deserialized = LayerMessage::from_json(&serialized).unwrap();

        assert_eq!(msg, deserialized);
        assert_eq!(deserialized.bearer().unwrap().rb, RbId::Drb1);
    }

    #[test]
    fn test_tick_has_no_bearer() {
        assert!(LayerMessage::TimerTick.bearer().is_none());
        assert!(LayerMessage::from_json("{\"bogus\":1}").is_err());
    }

    #[test]
    fn test_bearer_display() {
        let bearer = BearerRef::new(Rnti::new(61), RbId::Srb1);
        assert_eq!(bearer.to_string(), "RNTI=61 RB=SRB1");
    }
}
