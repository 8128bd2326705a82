//! RLC processing engine
//!
//! Segmentation on transmit, reassembly and ARQ on receive, driven by the
//! ready signals of the neighbouring layers.

use bytes::Bytes;
use common::utils::bytes_to_hex;
use interfaces::{BearerRef, LayerMessage, MessageSender};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use super::pdu::{AmPdu, AmdHeader, AmdPdu, FramingInfo, PollBit, ResegmentationFlag, StatusPdu, UmdPdu};
use super::{RlcConfig, RlcMode};
use crate::rb::RadioBearer;
use crate::timer::TimerId;
use crate::user::User;
use crate::user_mgr::UserManager;
use crate::LayerError;

/// RLC protocol engine
///
/// Stateless apart from its configuration and the queues towards MAC and
/// PDCP; all protocol state lives in the bearers.
#[derive(Debug, Clone)]
pub struct RlcEngine {
    config: RlcConfig,
    mac: MessageSender,
    pdcp: MessageSender,
}

impl RlcEngine {
    /// Create an engine signalling MAC SDUs to `mac` and PDCP PDUs to `pdcp`
    pub fn new(config: RlcConfig, mac: MessageSender, pdcp: MessageSender) -> Result<Self, LayerError> {
        config.validate()?;
        Ok(Self { config, mac, pdcp })
    }

    pub fn config(&self) -> &RlcConfig {
        &self.config
    }

    /// Dispatch a message from MAC or PDCP
    pub fn handle_msg(&self, msg: &LayerMessage, users: &UserManager) {
        match msg {
            LayerMessage::RlcPduReady(bearer) => {
                if let Some((user, rb)) = self.resolve(bearer, users) {
                    self.handle_pdu_ready(&user, &rb);
                }
            }
            LayerMessage::RlcSduReady(bearer) => {
                if let Some((user, rb)) = self.resolve(bearer, users) {
                    self.handle_sdu_ready(&user, &rb);
                }
            }
            other => warn!("RLC received unexpected message {:?}", other),
        }
    }

    fn resolve(&self, bearer: &BearerRef, users: &UserManager) -> Option<(Arc<User>, Arc<RadioBearer>)> {
        let user = match users.find_user_by_c_rnti(bearer.rnti) {
            Ok(user) => user,
            Err(e) => {
                warn!("RLC dropping message for {}: {}", bearer, e);
                return None;
            }
        };
        match user.bearer(bearer.rb) {
            Ok(rb) => Some((user, rb)),
            Err(e) => {
                warn!("RLC dropping message for {}: {}", bearer, e);
                None
            }
        }
    }

    /// Process the next PDU queued by MAC on `rb`
    pub fn handle_pdu_ready(&self, user: &User, rb: &Arc<RadioBearer>) {
        let pdu = match rb.rlc_pdu_queue().pop() {
            Ok(pdu) => pdu,
            Err(e) => {
                error!("{} {} RLC PDU ready but {}", user, rb.id(), e);
                return;
            }
        };
        trace!("{} {} RLC PDU received: {}", user, rb.id(), bytes_to_hex(&pdu));

        match rb.rlc_config() {
            RlcMode::Tm => self.handle_tm_pdu(pdu, user, rb),
            RlcMode::Um => self.handle_um_pdu(pdu, user, rb),
            RlcMode::Am => self.handle_am_pdu(pdu, user, rb),
        }
    }

    /// Process the next SDU queued by PDCP on `rb`
    pub fn handle_sdu_ready(&self, user: &User, rb: &Arc<RadioBearer>) {
        let sdu = match rb.rlc_sdu_queue().pop() {
            Ok(sdu) => sdu,
            Err(e) => {
                error!("{} {} RLC SDU ready but {}", user, rb.id(), e);
                return;
            }
        };
        trace!("{} {} RLC SDU received: {}", user, rb.id(), bytes_to_hex(&sdu));

        let result = match rb.rlc_config() {
            RlcMode::Tm => {
                self.handle_tm_sdu(sdu, user, rb);
                Ok(())
            }
            RlcMode::Um => self.handle_um_sdu(sdu, user, rb),
            RlcMode::Am => self.handle_am_sdu(sdu, user, rb),
        };
        if let Err(e) = result {
            error!("{} {} failed to transmit SDU: {}", user, rb.id(), e);
        }
    }

    // Transparent mode

    pub fn handle_tm_pdu(&self, pdu: Bytes, user: &User, rb: &RadioBearer) {
        debug!("{} {} TM PDU of {} bytes", user, rb.id(), pdu.len());
        self.deliver_sdu(rb, pdu);
    }

    pub fn handle_tm_sdu(&self, sdu: Bytes, user: &User, rb: &RadioBearer) {
        debug!("{} {} TM SDU of {} bytes", user, rb.id(), sdu.len());
        self.send_to_mac(rb, sdu);
    }

    // Unacknowledged mode

    pub fn handle_um_pdu(&self, pdu: Bytes, user: &User, rb: &RadioBearer) {
        let fields = match UmdPdu::unpack(&pdu, rb.rlc_um_sn_size()) {
            Ok(fields) => fields,
            Err(e) => {
                warn!("{} {} dropping UMD PDU: {}", user, rb.id(), e);
                return;
            }
        };
        let sn = match fields.first() {
            Some(field) => field.sn,
            None => return,
        };

        if rb.rlc_um_outside_window(sn) {
            warn!(
                "{} {} UMD SN={} outside window, VR(UR)={} VR(UH)={}",
                user,
                rb.id(),
                sn,
                rb.rlc_vrur(),
                rb.rlc_vruh()
            );
            return;
        }

        for field in fields {
            if !rb.rlc_add_to_um_reception_buffer(field.sn, field.fi, field.data) {
                continue;
            }
            if let Ok(sdu) = rb.rlc_um_reassemble() {
                self.deliver_sdu(rb, sdu);
            }
        }
    }

    pub fn handle_um_sdu(&self, sdu: Bytes, user: &User, rb: &RadioBearer) -> Result<(), LayerError> {
        let sn_size = rb.rlc_um_sn_size();
        let segments = segment(&sdu, user.max_dl_bytes_per_subframe())?;
        // VT(S) must not lap VT(A) while units are still unacknowledged
        let free = rb.rlc_am_tx_free_sns() as usize;
        if segments.len() > free {
            return Err(LayerError::InvalidState(format!(
                "{} SNs needed, {} unacknowledged SNs free",
                segments.len(),
                free
            )));
        }
        for (fi, data) in segments {
            let pdu = UmdPdu {
                fi,
                sn: rb.rlc_allocate_vtus(),
                data,
            };
            debug!("{} {} UMD SN={} {:?} {} bytes", user, rb.id(), pdu.sn, fi, pdu.data.len());
            self.send_to_mac(rb, pdu.pack(sn_size)?);
        }
        Ok(())
    }

    // Acknowledged mode

    pub fn handle_am_pdu(&self, pdu: Bytes, user: &User, rb: &Arc<RadioBearer>) {
        let units = match AmPdu::unpack(&pdu) {
            Ok(AmPdu::Status(status)) => {
                self.handle_status_pdu(&status, user, rb);
                return;
            }
            Ok(AmPdu::Data(units)) => units,
            Err(e) => {
                warn!("{} {} dropping AM PDU: {}", user, rb.id(), e);
                self.send_status_pdu(rb);
                return;
            }
        };
        let header = match units.first() {
            Some(unit) => unit.header,
            None => return,
        };

        if header.rf == ResegmentationFlag::Segment {
            warn!("{} {} AMD PDU segment SN={} not supported, dropping", user, rb.id(), header.sn);
            return;
        }

        if rb.rlc_am_rx_in_window(header.sn) {
            for unit in units {
                rb.rlc_add_to_am_reception_buffer(unit);
            }
            rb.update_rlc_vrh(header.sn);

            if header.sn == rb.rlc_vrr() {
                rb.update_rlc_vrr();
                while let Ok(sdu) = rb.rlc_am_reassemble() {
                    self.deliver_sdu(rb, sdu);
                }
            }
        } else {
            warn!(
                "{} {} AMD SN={} outside window [{}, {})",
                user,
                rb.id(),
                header.sn,
                rb.rlc_vrr(),
                rb.rlc_vrmr()
            );
        }

        if !self.config.status_on_poll_only || header.poll == PollBit::Requested {
            self.send_status_pdu(rb);
        }
    }

    /// Apply a STATUS PDU from the peer and send units it unblocked
    pub fn handle_status_pdu(&self, status: &StatusPdu, user: &User, rb: &Arc<RadioBearer>) {
        debug!(
            "{} {} STATUS ACK_SN={} NACK_SN={:?}",
            user,
            rb.id(),
            status.ack_sn,
            status.nack_sn
        );

        for unit in rb.rlc_update_transmission_buffer(status) {
            debug!("{} {} SN={} now inside transmit window", user, rb.id(), unit.sn());
            match unit.pack() {
                Ok(pdu) => self.send_to_mac(rb, pdu),
                Err(e) => error!("{} {} failed to pack SN={}: {}", user, rb.id(), unit.sn(), e),
            }
        }
    }

    pub fn handle_am_sdu(&self, sdu: Bytes, user: &User, rb: &Arc<RadioBearer>) -> Result<(), LayerError> {
        for (fi, data) in segment(&sdu, user.max_dl_bytes_per_subframe())? {
            let poll = if fi.ends_sdu() {
                PollBit::Requested
            } else {
                PollBit::NotRequested
            };
            let unit = AmdPdu::new(AmdHeader::new(fi, rb.rlc_allocate_vts(), poll), data);
            self.send_amd_pdu(unit, rb)?;
        }
        Ok(())
    }

    /// Store a new data unit for retransmission and send it if the window allows
    pub fn send_amd_pdu(&self, unit: AmdPdu, rb: &Arc<RadioBearer>) -> Result<(), LayerError> {
        let pdu = unit.pack()?;
        let sn = unit.sn();
        let in_window = rb.rlc_am_tx_in_window(sn);

        debug!("{} AMD SN={} {:?} {} bytes", rb.id(), sn, unit.fi(), unit.data.len());
        rb.rlc_add_to_transmission_buffer(unit, in_window);
        self.start_t_poll_retransmit(rb);

        if in_window {
            self.send_to_mac(rb, pdu);
        } else {
            info!(
                "{} AMD SN={} outside transmit window [{}, {}), holding",
                rb.id(),
                sn,
                rb.rlc_vta(),
                rb.rlc_vtms()
            );
        }
        Ok(())
    }

    /// Resend the unit at VT(A) after t-PollRetransmit expired
    pub fn handle_retransmit(&self, rb: &Arc<RadioBearer>, id: TimerId) {
        let unit = match rb.rlc_handle_t_poll_retransmit_expiry(id) {
            Ok(unit) => unit,
            Err(_) => return,
        };

        if let Some(mut unit) = unit {
            unit.header.poll = PollBit::Requested;
            info!("{} t-PollRetransmit expired, resending SN={}", rb.id(), unit.sn());
            match unit.pack() {
                Ok(pdu) => self.send_to_mac(rb, pdu),
                Err(e) => error!("{} failed to pack SN={}: {}", rb.id(), unit.sn(), e),
            }
        }

        if rb.rlc_transmission_buffer_len() > 0 {
            self.start_t_poll_retransmit(rb);
        }
    }

    /// Report the reception state to the peer
    pub fn send_status_pdu(&self, rb: &RadioBearer) {
        let status = rb.rlc_get_am_reception_buffer_status();
        trace!("{} sending STATUS ACK_SN={} NACK_SN={:?}", rb.id(), status.ack_sn, status.nack_sn);
        self.send_to_mac(rb, status.pack());
    }

    fn start_t_poll_retransmit(&self, rb: &Arc<RadioBearer>) {
        let engine = self.clone();
        let bearer = Arc::downgrade(rb);
        rb.rlc_start_t_poll_retransmit(move |id| {
            if let Some(rb) = bearer.upgrade() {
                engine.handle_retransmit(&rb, id);
            }
        });
    }

    fn send_to_mac(&self, rb: &RadioBearer, pdu: Bytes) {
        trace!("{} MAC SDU: {}", rb.id(), bytes_to_hex(&pdu));
        rb.mac_sdu_queue().push(pdu);
        self.signal(&self.mac, rb, LayerMessage::MacSduReady);
    }

    fn deliver_sdu(&self, rb: &RadioBearer, sdu: Bytes) {
        trace!("{} PDCP PDU: {}", rb.id(), bytes_to_hex(&sdu));
        rb.pdcp_pdu_queue().push(sdu);
        self.signal(&self.pdcp, rb, LayerMessage::PdcpPduReady);
    }

    fn signal(&self, queue: &MessageSender, rb: &RadioBearer, msg: fn(BearerRef) -> LayerMessage) {
        let rnti = match rb.rnti() {
            Some(rnti) => rnti,
            None => {
                debug!("{} has no C-RNTI, not signalling {}", rb.id(), queue.name());
                return;
            }
        };
        if let Err(e) = queue.send(msg(BearerRef::new(rnti, rb.id()))) {
            warn!("{} failed to signal {}: {}", rb.id(), queue.name(), e);
        }
    }
}

/// Split an SDU into units of at most `max_bytes`, tagged with their framing info
fn segment(sdu: &Bytes, max_bytes: u32) -> Result<Vec<(FramingInfo, Bytes)>, LayerError> {
    let max_bytes = max_bytes as usize;
    if max_bytes == 0 {
        return Err(LayerError::InvalidParam("max bytes per subframe is zero".into()));
    }
    if sdu.len() <= max_bytes {
        return Ok(vec![(FramingInfo::FullSdu, sdu.clone())]);
    }

    let count = sdu.len().div_ceil(max_bytes);
    Ok((0..count)
        .map(|i| {
            let start = i * max_bytes;
            let end = (start + max_bytes).min(sdu.len());
            let fi = match i {
                0 => FramingInfo::FirstSduSegment,
                i if i + 1 == count => FramingInfo::LastSduSegment,
                _ => FramingInfo::MiddleSduSegment,
            };
            (fi, sdu.slice(start..end))
        })
        .collect())
}
