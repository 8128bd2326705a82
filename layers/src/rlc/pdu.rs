//! RLC PDU Codec
//!
//! Pack/unpack of UMD, AMD and STATUS PDUs according to 3GPP TS 36.322 section 6.2.

use bytes::{BufMut, Bytes, BytesMut};
use common::utils::{bits_to_value, pack_bits, unpack_bits, value_to_bits};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use crate::LayerError;

/// Maximum number of data fields carried by one UMD or AMD PDU
pub const MAX_DATA_FIELDS: usize = 5;

/// Largest value a length indicator can carry
const MAX_LI: usize = 0x7FF;

/// Control PDU type of a STATUS PDU
const CPT_STATUS: u32 = 0;

/// Framing info: how the data field maps onto SDU boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum FramingInfo {
    /// Data field is a complete SDU
    FullSdu = 0,
    /// Data field starts an SDU but does not end it
    FirstSduSegment = 1,
    /// Data field ends an SDU but does not start it
    LastSduSegment = 2,
    /// Data field neither starts nor ends an SDU
    MiddleSduSegment = 3,
}

impl FramingInfo {
    fn from_bits(bits: u8) -> Self {
        FramingInfo::from_u8(bits & 0x03).unwrap_or(FramingInfo::MiddleSduSegment)
    }

    /// First byte of the data field is the first byte of an SDU
    pub fn starts_sdu(&self) -> bool {
        matches!(self, FramingInfo::FullSdu | FramingInfo::FirstSduSegment)
    }

    /// Last byte of the data field is the last byte of an SDU
    pub fn ends_sdu(&self) -> bool {
        matches!(self, FramingInfo::FullSdu | FramingInfo::LastSduSegment)
    }

    fn from_boundaries(starts: bool, ends: bool) -> Self {
        match (starts, ends) {
            (true, true) => FramingInfo::FullSdu,
            (true, false) => FramingInfo::FirstSduSegment,
            (false, true) => FramingInfo::LastSduSegment,
            (false, false) => FramingInfo::MiddleSduSegment,
        }
    }

    /// Framing info of field `index` out of `count` fields sharing this PDU-level value
    fn for_field(&self, index: usize, count: usize) -> Self {
        let starts = index > 0 || self.starts_sdu();
        let ends = index + 1 < count || self.ends_sdu();
        Self::from_boundaries(starts, ends)
    }
}

/// Data/control indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum DcField {
    Control = 0,
    Data = 1,
}

/// Re-segmentation flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ResegmentationFlag {
    /// Complete AMD PDU
    Amd = 0,
    /// AMD PDU segment
    Segment = 1,
}

/// Polling bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum PollBit {
    NotRequested = 0,
    Requested = 1,
}

/// UMD sequence number field length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UmSnSize {
    Five,
    Ten,
}

impl UmSnSize {
    /// Size of the sequence number space
    pub fn modulus(&self) -> u16 {
        match self {
            UmSnSize::Five => super::sn::SN_MODULUS_5,
            UmSnSize::Ten => super::sn::SN_MODULUS_10,
        }
    }

    /// Build from a field length in bits
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            5 => Some(UmSnSize::Five),
            10 => Some(UmSnSize::Ten),
            _ => None,
        }
    }
}

/// Unacknowledged mode data unit carrying a single data field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UmdPdu {
    pub fi: FramingInfo,
    pub sn: u16,
    pub data: Bytes,
}

impl UmdPdu {
    /// Pack as a single-field UMD PDU
    pub fn pack(&self, sn_size: UmSnSize) -> Result<Bytes, LayerError> {
        Self::pack_fields(self.fi, self.sn, &[self.data.clone()], sn_size)
    }

    /// Pack several data fields behind one header
    pub fn pack_fields(
        fi: FramingInfo,
        sn: u16,
        fields: &[Bytes],
        sn_size: UmSnSize,
    ) -> Result<Bytes, LayerError> {
        check_field_count(fields.len())?;
        let extension = (fields.len() > 1) as u8;
        let mut buf = BytesMut::with_capacity(2 + 2 * fields.len() + total_len(fields));

        match sn_size {
            UmSnSize::Five => {
                buf.put_u8(((fi as u8) << 6) | (extension << 5) | (sn & 0x1F) as u8);
            }
            UmSnSize::Ten => {
                buf.put_u8(((fi as u8) << 3) | (extension << 2) | ((sn >> 8) & 0x03) as u8);
                buf.put_u8((sn & 0xFF) as u8);
            }
        }
        put_fields(&mut buf, fields)?;

        Ok(buf.freeze())
    }

    /// Unpack into one unit per data field
    ///
    /// Every unit carries the PDU's sequence number; framing info is
    /// rewritten so each unit describes its own SDU boundaries.
    pub fn unpack(pdu: &[u8], sn_size: UmSnSize) -> Result<Vec<UmdPdu>, LayerError> {
        let (fi, extension, sn, mut pos) = match sn_size {
            UmSnSize::Five => {
                let byte = *pdu.first().ok_or_else(|| truncated("UMD header"))?;
                (byte >> 6, (byte >> 5) & 1 == 1, (byte & 0x1F) as u16, 1)
            }
            UmSnSize::Ten => {
                if pdu.len() < 2 {
                    return Err(truncated("UMD header"));
                }
                (
                    (pdu[0] >> 3) & 0x03,
                    (pdu[0] >> 2) & 1 == 1,
                    (((pdu[0] & 0x03) as u16) << 8) | pdu[1] as u16,
                    2,
                )
            }
        };
        let fi = FramingInfo::from_bits(fi);
        let fields = get_fields(pdu, &mut pos, extension)?;
        let count = fields.len();

        Ok(fields
            .into_iter()
            .enumerate()
            .map(|(i, data)| UmdPdu {
                fi: fi.for_field(i, count),
                sn,
                data,
            })
            .collect())
    }
}

/// AMD PDU segment fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Last segment flag
    pub lsf: bool,
    /// Segment offset in bytes
    pub so: u16,
}

/// Header shared by all data fields of an AMD PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmdHeader {
    pub rf: ResegmentationFlag,
    pub poll: PollBit,
    pub fi: FramingInfo,
    pub sn: u16,
    pub segment: Option<SegmentInfo>,
}

impl AmdHeader {
    /// Header of a complete (non-segment) AMD PDU
    pub fn new(fi: FramingInfo, sn: u16, poll: PollBit) -> Self {
        Self {
            rf: ResegmentationFlag::Amd,
            poll,
            fi,
            sn: sn & 0x3FF,
            segment: None,
        }
    }
}

/// Acknowledged mode data unit carrying a single data field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmdPdu {
    pub header: AmdHeader,
    pub data: Bytes,
}

impl AmdPdu {
    pub fn new(header: AmdHeader, data: Bytes) -> Self {
        Self { header, data }
    }

    pub fn sn(&self) -> u16 {
        self.header.sn
    }

    pub fn fi(&self) -> FramingInfo {
        self.header.fi
    }

    /// Pack as a single-field AMD PDU
    pub fn pack(&self) -> Result<Bytes, LayerError> {
        Self::pack_fields(&self.header, &[self.data.clone()])
    }

    /// Pack several data fields behind one header
    pub fn pack_fields(header: &AmdHeader, fields: &[Bytes]) -> Result<Bytes, LayerError> {
        check_field_count(fields.len())?;
        let extension = (fields.len() > 1) as u8;
        let mut buf = BytesMut::with_capacity(4 + 2 * fields.len() + total_len(fields));

        buf.put_u8(
            ((DcField::Data as u8) << 7)
                | ((header.rf as u8) << 6)
                | ((header.poll as u8) << 5)
                | ((header.fi as u8) << 3)
                | (extension << 2)
                | ((header.sn >> 8) & 0x03) as u8,
        );
        buf.put_u8((header.sn & 0xFF) as u8);

        if header.rf == ResegmentationFlag::Segment {
            let segment = header.segment.ok_or_else(|| {
                LayerError::InvalidPdu("AMD PDU segment without segment offset".to_string())
            })?;
            buf.put_u8(((segment.lsf as u8) << 7) | ((segment.so >> 8) & 0x7F) as u8);
            buf.put_u8((segment.so & 0xFF) as u8);
        }
        put_fields(&mut buf, fields)?;

        Ok(buf.freeze())
    }

    /// Unpack a data PDU into one unit per data field
    pub fn unpack(pdu: &[u8]) -> Result<Vec<AmdPdu>, LayerError> {
        if pdu.len() < 2 {
            return Err(truncated("AMD header"));
        }
        if pdu[0] >> 7 != DcField::Data as u8 {
            return Err(LayerError::InvalidPdu("control PDU is not an AMD PDU".to_string()));
        }

        let rf = if (pdu[0] >> 6) & 1 == 1 {
            ResegmentationFlag::Segment
        } else {
            ResegmentationFlag::Amd
        };
        let poll = if (pdu[0] >> 5) & 1 == 1 {
            PollBit::Requested
        } else {
            PollBit::NotRequested
        };
        let fi = FramingInfo::from_bits(pdu[0] >> 3);
        let extension = (pdu[0] >> 2) & 1 == 1;
        let sn = (((pdu[0] & 0x03) as u16) << 8) | pdu[1] as u16;
        let mut pos = 2;

        let segment = if rf == ResegmentationFlag::Segment {
            if pdu.len() < 4 {
                return Err(truncated("AMD segment header"));
            }
            pos = 4;
            Some(SegmentInfo {
                lsf: pdu[2] >> 7 == 1,
                so: (((pdu[2] & 0x7F) as u16) << 8) | pdu[3] as u16,
            })
        } else {
            None
        };

        let fields = get_fields(pdu, &mut pos, extension)?;
        let count = fields.len();

        Ok(fields
            .into_iter()
            .enumerate()
            .map(|(i, data)| AmdPdu {
                header: AmdHeader {
                    rf,
                    poll,
                    fi: fi.for_field(i, count),
                    sn,
                    segment,
                },
                data,
            })
            .collect())
    }
}

/// STATUS PDU reporting acknowledged and missing sequence numbers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusPdu {
    /// Next not received SN, not itself acknowledged
    pub ack_sn: u16,
    /// Sequence numbers detected as lost, in ascending window order
    pub nack_sn: Vec<u16>,
}

impl StatusPdu {
    pub fn pack(&self) -> Bytes {
        let mut bits = Vec::with_capacity(15 + 12 * self.nack_sn.len());

        value_to_bits(DcField::Control as u32, 1, &mut bits);
        value_to_bits(CPT_STATUS, 3, &mut bits);
        value_to_bits(self.ack_sn as u32, 10, &mut bits);
        value_to_bits((!self.nack_sn.is_empty()) as u32, 1, &mut bits);
        for (i, nack_sn) in self.nack_sn.iter().enumerate() {
            value_to_bits(*nack_sn as u32, 10, &mut bits);
            value_to_bits((i + 1 < self.nack_sn.len()) as u32, 1, &mut bits);
            value_to_bits(0, 1, &mut bits);
        }

        pack_bits(&bits)
    }

    pub fn unpack(pdu: &[u8]) -> Result<Self, LayerError> {
        let bits = unpack_bits(pdu);
        let mut pos = 0;
        let read = |num_bits: usize, pos: &mut usize| {
            bits_to_value(&bits, pos, num_bits).ok_or_else(|| truncated("STATUS PDU"))
        };

        if read(1, &mut pos)? != DcField::Control as u32 {
            return Err(LayerError::InvalidPdu("data PDU is not a STATUS PDU".to_string()));
        }
        let cpt = read(3, &mut pos)?;
        if cpt != CPT_STATUS {
            return Err(LayerError::InvalidPdu(format!("unknown control PDU type {}", cpt)));
        }

        let ack_sn = read(10, &mut pos)? as u16;
        let mut e1 = read(1, &mut pos)? == 1;
        let mut nack_sn = Vec::new();
        while e1 {
            nack_sn.push(read(10, &mut pos)? as u16);
            e1 = read(1, &mut pos)? == 1;
            let e2 = read(1, &mut pos)? == 1;
            if e2 {
                // SOstart and SOend
                read(15, &mut pos)?;
                read(15, &mut pos)?;
            }
        }

        Ok(Self { ack_sn, nack_sn })
    }
}

/// Either kind of PDU received on an AM bearer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmPdu {
    Data(Vec<AmdPdu>),
    Status(StatusPdu),
}

impl AmPdu {
    /// Unpack by the D/C field
    pub fn unpack(pdu: &[u8]) -> Result<Self, LayerError> {
        let first = *pdu.first().ok_or_else(|| truncated("AM PDU"))?;
        if first >> 7 == DcField::Control as u8 {
            Ok(AmPdu::Status(StatusPdu::unpack(pdu)?))
        } else {
            Ok(AmPdu::Data(AmdPdu::unpack(pdu)?))
        }
    }
}

fn truncated(what: &str) -> LayerError {
    LayerError::InvalidPdu(format!("{} truncated", what))
}

fn total_len(fields: &[Bytes]) -> usize {
    fields.iter().map(Bytes::len).sum()
}

fn check_field_count(count: usize) -> Result<(), LayerError> {
    if count == 0 || count > MAX_DATA_FIELDS {
        return Err(LayerError::InvalidPdu(format!(
            "{} data fields, expected 1..={}",
            count, MAX_DATA_FIELDS
        )));
    }
    Ok(())
}

/// Length indicators for all but the last field, then the concatenated data
fn put_fields(buf: &mut BytesMut, fields: &[Bytes]) -> Result<(), LayerError> {
    let li_count = fields.len() - 1;
    for (i, field) in fields[..li_count].iter().enumerate() {
        let len = field.len();
        if len == 0 || len > MAX_LI {
            return Err(LayerError::InvalidPdu(format!("length indicator {} out of range", len)));
        }
        let extension = (i + 1 < li_count) as u8;
        if i % 2 == 0 {
            buf.put_u8((extension << 7) | ((len >> 4) & 0x7F) as u8);
            buf.put_u8(((len & 0x0F) << 4) as u8);
        } else {
            let last = buf.len() - 1;
            buf[last] |= (extension << 3) | ((len >> 8) & 0x07) as u8;
            buf.put_u8((len & 0xFF) as u8);
        }
    }

    for field in fields {
        buf.put_slice(field);
    }
    Ok(())
}

/// Parse length indicators starting at `*pos` and split the payload into fields
fn get_fields(pdu: &[u8], pos: &mut usize, mut extension: bool) -> Result<Vec<Bytes>, LayerError> {
    let mut lengths = Vec::new();

    while extension {
        if lengths.len() + 1 >= MAX_DATA_FIELDS {
            return Err(LayerError::InvalidPdu("too many length indicators".to_string()));
        }
        if *pos + 1 >= pdu.len() {
            return Err(truncated("length indicator"));
        }
        let (len, e) = if lengths.len() % 2 == 0 {
            let len = (((pdu[*pos] & 0x7F) as usize) << 4) | (pdu[*pos + 1] >> 4) as usize;
            let e = pdu[*pos] >> 7 == 1;
            *pos += 1;
            (len, e)
        } else {
            let len = (((pdu[*pos] & 0x07) as usize) << 8) | pdu[*pos + 1] as usize;
            let e = (pdu[*pos] >> 3) & 1 == 1;
            *pos += 2;
            (len, e)
        };
        if len == 0 {
            return Err(LayerError::InvalidPdu("zero length indicator".to_string()));
        }
        lengths.push(len);
        extension = e;
    }
    if lengths.len() % 2 == 1 {
        // Padding nibble
        *pos += 1;
    }

    let payload = pdu.get(*pos..).ok_or_else(|| truncated("data field"))?;
    let declared: usize = lengths.iter().sum();
    if declared > payload.len() {
        return Err(LayerError::InvalidPdu(format!(
            "length indicators cover {} bytes, {} present",
            declared,
            payload.len()
        )));
    }

    let mut fields = Vec::with_capacity(lengths.len() + 1);
    let mut offset = 0;
    for len in lengths {
        fields.push(Bytes::copy_from_slice(&payload[offset..offset + len]));
        offset += len;
    }
    fields.push(Bytes::copy_from_slice(&payload[offset..]));
    *pos = pdu.len();

    Ok(fields)
}
