//! Common Types for the LTE eNodeB
//!
//! Defines fundamental identifiers and message containers used throughout the protocol stack

use bytes::Bytes;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::{pack_bits, unpack_bits};

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// First RNTI value usable as a C-RNTI
    pub const C_RNTI_START: u16 = 0x003D;
    /// Last RNTI value usable as a C-RNTI
    pub const C_RNTI_END: u16 = 0xFFF3;

    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }

    /// Whether the value lies in the C-RNTI range
    pub fn is_c_rnti(&self) -> bool {
        (Self::C_RNTI_START..=Self::C_RNTI_END).contains(&self.0)
    }
}

impl fmt::Display for Rnti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Radio bearer identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum RbId {
    /// Signalling radio bearer 0 (CCCH)
    Srb0 = 0,
    /// Signalling radio bearer 1
    Srb1 = 1,
    /// Signalling radio bearer 2
    Srb2 = 2,
    Drb1 = 3,
    Drb2 = 4,
    Drb3 = 5,
    Drb4 = 6,
    Drb5 = 7,
    Drb6 = 8,
    Drb7 = 9,
    Drb8 = 10,
}

impl RbId {
    /// Number of data radio bearers a user may hold
    pub const MAX_DRBS: usize = 8;

    /// Data radio bearer from its 1-based DRB id
    pub fn drb(drb_id: u8) -> Option<Self> {
        match drb_id {
            1 => Some(RbId::Drb1),
            2 => Some(RbId::Drb2),
            3 => Some(RbId::Drb3),
            4 => Some(RbId::Drb4),
            5 => Some(RbId::Drb5),
            6 => Some(RbId::Drb6),
            7 => Some(RbId::Drb7),
            8 => Some(RbId::Drb8),
            _ => None,
        }
    }

    /// 1-based DRB id, `None` for signalling bearers
    pub fn drb_id(&self) -> Option<u8> {
        match self {
            RbId::Srb0 | RbId::Srb1 | RbId::Srb2 => None,
            other => Some(*other as u8 - RbId::Drb1 as u8 + 1),
        }
    }

    /// Whether this is a signalling radio bearer
    pub fn is_srb(&self) -> bool {
        self.drb_id().is_none()
    }
}

impl fmt::Display for RbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.drb_id() {
            Some(id) => write!(f, "DRB{}", id),
            None => write!(f, "SRB{}", *self as u8),
        }
    }
}

/// Globally Unique Temporary Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Guti {
    /// Mobile Country Code
    pub mcc: u16,
    /// Mobile Network Code
    pub mnc: u16,
    /// MME group identity
    pub mme_group_id: u16,
    /// MME code
    pub mme_code: u8,
    /// M-TMSI
    pub m_tmsi: u32,
}

/// S-TMSI as carried in RRC connection requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct STmsi {
    /// MME code
    pub mmec: u8,
    /// M-TMSI
    pub m_tmsi: u32,
}

/// Bit message exchanged at layer boundaries (ASN.1 PER encoded RRC and PDCP control)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitMessage {
    bits: Vec<bool>,
}

impl BitMessage {
    /// Create from individual bits
    pub fn new(bits: Vec<bool>) -> Self {
        Self { bits }
    }

    /// Unpack a byte buffer MSB first
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self { bits: unpack_bits(bytes) }
    }

    /// Pack into bytes, zero-padding the final octet
    pub fn to_bytes(&self) -> Bytes {
        pack_bits(&self.bits)
    }

    /// Number of bits
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether the message carries no bits
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Underlying bits
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_c_rnti_range() {
        assert!(!Rnti::new(0x003C).is_c_rnti());
        assert!(Rnti::new(0x003D).is_c_rnti());
        assert!(Rnti::new(0xFFF3).is_c_rnti());
        assert!(!Rnti::new(0xFFFF).is_c_rnti());
    }

    #[test]
    fn test_rb_id_naming() {
        assert_eq!(RbId::Srb0.to_string(), "SRB0");
        assert_eq!(RbId::Srb2.to_string(), "SRB2");
        assert_eq!(RbId::Drb1.to_string(), "DRB1");
        assert_eq!(RbId::Drb8.to_string(), "DRB8");
    }

    #[test]
    fn test_drb_ids() {
        assert_eq!(RbId::drb(1), Some(RbId::Drb1));
        assert_eq!(RbId::drb(8), Some(RbId::Drb8));
        assert_eq!(RbId::drb(0), None);
        assert_eq!(RbId::drb(9), None);
        assert_eq!(RbId::Drb5.drb_id(), Some(5));
        assert!(RbId::Srb1.is_srb());
        assert_eq!(RbId::from_u8(3), Some(RbId::Drb1));
    }

    #[test]
    fn test_bit_message() {
        let msg = BitMessage::from_bytes(&[0xA5]);
        assert_eq!(msg.len(), 8);
        assert!(msg.bits()[0]);
        assert!(!msg.bits()[1]);
        assert_eq!(&msg.to_bytes()[..], &[0xA5]);

        let short = BitMessage::new(vec![true, true, false]);
        assert_eq!(&short.to_bytes()[..], &[0xC0]);
    }
}
