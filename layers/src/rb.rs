//! Radio Bearer State Container
//!
//! Per-(user, bearer) state: the inter-layer FIFO queues, RLC AM/UM sequence
//! number state with its reassembly and retransmission buffers, and the
//! MME/RRC procedure enumerations used by the upper layers.
//!
//! Every queue and buffer group has its own lock. The RLC engine only works
//! through the methods below.

use bytes::{Bytes, BytesMut};
use common::types::{BitMessage, RbId, Rnti};
use common::utils::bytes_to_hex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, trace, warn};

use crate::rlc::pdu::{AmdPdu, FramingInfo, StatusPdu, UmSnSize};
use crate::rlc::sn::{in_window, sn_add, sn_offset, sn_sub, SN_MODULUS_10};
use crate::rlc::{RlcConfig, RlcMode};
use crate::timer::{TimerId, TimerManager};
use crate::user::User;
use crate::{lock, LayerError};

/// AM transmit and receive window size
pub const AM_WINDOW_SIZE: u16 = 512;

/// Pending units kept per SN in the AM reception buffer
pub const MAX_PENDING_DUPLICATES: usize = 2;

/// PDCP configuration of a bearer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdcpConfig {
    /// No PDCP processing (SRB0, SRBs before security)
    NotApplicable,
    /// Integrity protection and ciphering active
    Security,
    /// Data bearer with 12-bit sequence numbers
    LongSn,
}

/// MAC configuration of a bearer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacConfig {
    Tm,
}

/// MME procedure in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmeProcedure {
    Idle,
    Attach,
    ServiceRequest,
    Detach,
}

/// MME procedure state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmeState {
    Idle,
    IdRequestImsi,
    Reject,
    Authenticate,
    AuthRejected,
    EnableSecurity,
    Release,
    RrcSecurity,
    EsmInfoTransfer,
    AttachAccept,
    Attached,
    SetupDrb,
    SendDetachAccept,
}

/// RRC procedure in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RrcProcedure {
    Idle,
    RrcConReq,
    RrcConReestReq,
}

/// RRC procedure state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RrcState {
    Idle,
    Srb1Setup,
    WaitForConSetupComplete,
    RrcConnected,
    WaitForConReestComplete,
}

/// Upper layer scalars co-located with the bearer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BearerContext {
    pub rrc_transaction_id: u8,
    pub pdcp_rx_count: u32,
    pub pdcp_tx_count: u32,
    /// Contention resolution identity (first 48 bits of the CCCH SDU)
    pub con_res_id: u64,
    pub send_con_res_id: bool,
    pub eps_bearer_id: u8,
    pub lc_id: u8,
    pub drb_id: u8,
    pub log_chan_group: u8,
}

/// Named FIFO with its own lock
pub struct MsgQueue<T> {
    name: &'static str,
    queue: Mutex<VecDeque<T>>,
}

impl<T: Clone> MsgQueue<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Append to the back of the queue
    pub fn push(&self, msg: T) {
        lock(&self.queue).push_back(msg);
    }

    /// Copy of the oldest message, left in place
    pub fn front(&self) -> Result<T, LayerError> {
        lock(&self.queue)
            .front()
            .cloned()
            .ok_or(LayerError::NoMessageInQueue)
    }

    /// Discard the oldest message
    pub fn delete_front(&self) -> Result<(), LayerError> {
        lock(&self.queue)
            .pop_front()
            .map(|_| ())
            .ok_or(LayerError::NoMessageInQueue)
    }

    /// Remove and return the oldest message
    pub fn pop(&self) -> Result<T, LayerError> {
        lock(&self.queue)
            .pop_front()
            .ok_or(LayerError::NoMessageInQueue)
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn clear(&self) -> usize {
        let mut queue = lock(&self.queue);
        let drained = queue.len();
        queue.clear();
        drained
    }
}

struct TxEntry {
    pdu: AmdPdu,
    sent: bool,
}

struct RlcAmState {
    vr_r: u16,
    vr_mr: u16,
    vr_h: u16,
    vt_a: u16,
    vt_ms: u16,
    vt_s: u16,
    rx_buffer: BTreeMap<u16, Vec<AmdPdu>>,
    /// SNs at or above VR(R) already consumed by reassembly
    rx_delivered: BTreeSet<u16>,
    tx_buffer: BTreeMap<u16, TxEntry>,
    t_poll_retransmit: TimerId,
}

impl RlcAmState {
    fn new() -> Self {
        Self {
            vr_r: 0,
            vr_mr: AM_WINDOW_SIZE,
            vr_h: 0,
            vt_a: 0,
            vt_ms: AM_WINDOW_SIZE,
            vt_s: 0,
            rx_buffer: BTreeMap::new(),
            rx_delivered: BTreeSet::new(),
            tx_buffer: BTreeMap::new(),
            t_poll_retransmit: TimerId::INVALID,
        }
    }

    fn set_vr_r(&mut self, vr_r: u16) {
        self.vr_r = vr_r % SN_MODULUS_10;
        self.vr_mr = sn_add(self.vr_r, AM_WINDOW_SIZE, SN_MODULUS_10);
        let vr_r = self.vr_r;
        self.rx_delivered
            .retain(|sn| in_window(*sn, vr_r, AM_WINDOW_SIZE, SN_MODULUS_10));
    }

    fn set_vt_a(&mut self, vt_a: u16) {
        self.vt_a = vt_a % SN_MODULUS_10;
        self.vt_ms = sn_add(self.vt_a, AM_WINDOW_SIZE, SN_MODULUS_10);
    }

    fn is_received(&self, sn: u16) -> bool {
        self.rx_buffer.contains_key(&sn) || self.rx_delivered.contains(&sn)
    }

    /// Position of `sn` in reception order; valid for SNs within one window of VR(R)
    fn rx_order(&self, sn: u16) -> u16 {
        sn_offset(sn, sn_sub(self.vr_r, AM_WINDOW_SIZE, SN_MODULUS_10), SN_MODULUS_10)
    }

    /// Index of the unit at `sn` best matching `wanted`, falling back to `fallback`
    fn pick(&self, sn: u16, wanted: FramingInfo, fallback: impl Fn(FramingInfo) -> bool) -> Option<usize> {
        let units = self.rx_buffer.get(&sn)?;
        units
            .iter()
            .position(|unit| unit.fi() == wanted)
            .or_else(|| units.iter().position(|unit| fallback(unit.fi())))
    }

    /// Units covering one SDU as (SN, index) pairs, if all are present
    fn complete_sdu(&self, first_sn: u16, first_idx: usize) -> Option<Vec<(u16, usize)>> {
        let first = self.rx_buffer.get(&first_sn)?.get(first_idx)?;
        if first.fi() == FramingInfo::FullSdu {
            return Some(vec![(first_sn, first_idx)]);
        }

        let first_order = self.rx_order(first_sn);
        let last_sn = self
            .rx_buffer
            .iter()
            .filter(|(sn, units)| {
                self.rx_order(**sn) > first_order && units.iter().any(|u| u.fi().ends_sdu())
            })
            .map(|(sn, _)| *sn)
            .min_by_key(|sn| self.rx_order(*sn))?;

        let mut picks = vec![(first_sn, first_idx)];
        let mut sn = sn_add(first_sn, 1, SN_MODULUS_10);
        while sn != last_sn {
            let idx = self.pick(sn, FramingInfo::MiddleSduSegment, |_| true)?;
            picks.push((sn, idx));
            sn = sn_add(sn, 1, SN_MODULUS_10);
        }
        let idx = self.pick(last_sn, FramingInfo::LastSduSegment, |fi| fi.ends_sdu())?;
        picks.push((last_sn, idx));

        Some(picks)
    }

    /// Drop units behind VR(R) that can no longer complete an SDU
    ///
    /// Only the run of segments leading up to VR(R) from a FIRST unit is kept,
    /// since its remaining parts may still arrive at or above VR(R).
    fn discard_stale_units(&mut self) -> usize {
        let mut keep_from = self.vr_r;
        let mut sn = sn_sub(self.vr_r, 1, SN_MODULUS_10);
        for _ in 0..AM_WINDOW_SIZE {
            let Some(units) = self.rx_buffer.get(&sn) else {
                break;
            };
            if units.iter().any(|u| u.fi() == FramingInfo::FirstSduSegment) {
                keep_from = sn;
                break;
            }
            if !units.iter().any(|u| u.fi() == FramingInfo::MiddleSduSegment) {
                break;
            }
            sn = sn_sub(sn, 1, SN_MODULUS_10);
        }

        let kept = sn_offset(self.vr_r, keep_from, SN_MODULUS_10) + AM_WINDOW_SIZE;
        let before = self.rx_buffer.len();
        self.rx_buffer
            .retain(|sn, _| in_window(*sn, keep_from, kept, SN_MODULUS_10));
        before - self.rx_buffer.len()
    }

    fn take_units(&mut self, picks: &[(u16, usize)]) -> Bytes {
        let mut sdu = BytesMut::new();
        for (sn, idx) in picks {
            if let Some(units) = self.rx_buffer.get_mut(sn) {
                let unit = units.remove(*idx);
                sdu.extend_from_slice(&unit.data);
                if units.is_empty() {
                    self.rx_buffer.remove(sn);
                }
            }
            if in_window(*sn, self.vr_r, AM_WINDOW_SIZE, SN_MODULUS_10) {
                self.rx_delivered.insert(*sn);
            }
        }
        sdu.freeze()
    }
}

struct RlcUmState {
    vr_uh: u16,
    vr_ur: u16,
    vt_us: u16,
    sn_size: UmSnSize,
    window_size: u16,
    first_sn: Option<u16>,
    last_sn: Option<u16>,
    rx_buffer: BTreeMap<u16, Bytes>,
}

impl RlcUmState {
    fn new(sn_size: UmSnSize) -> Self {
        Self {
            vr_uh: 0,
            vr_ur: 0,
            vt_us: 0,
            sn_size,
            window_size: sn_size.modulus() / 2,
            first_sn: None,
            last_sn: None,
            rx_buffer: BTreeMap::new(),
        }
    }

    fn modulus(&self) -> u16 {
        self.sn_size.modulus()
    }

    /// Lower edge of the window ending at VR(UH)
    fn window_base(&self) -> u16 {
        sn_sub(self.vr_uh, self.window_size, self.modulus())
    }

    fn order(&self, sn: u16) -> u16 {
        sn_offset(sn, self.window_base(), self.modulus())
    }

    fn clear_markers(&mut self) {
        self.first_sn = None;
        self.last_sn = None;
    }
}

/// Snapshot of a bearer's RLC state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RbStats {
    pub vr_r: u16,
    pub vr_mr: u16,
    pub vr_h: u16,
    pub vt_a: u16,
    pub vt_ms: u16,
    pub vt_s: u16,
    pub vr_uh: u16,
    pub vr_ur: u16,
    pub vt_us: u16,
    pub am_rx_buffered: usize,
    pub am_tx_buffered: usize,
    pub um_rx_buffered: usize,
    pub t_poll_retransmit_running: bool,
}

#[derive(Debug, Clone, Copy)]
struct ProcedureState {
    mme_procedure: MmeProcedure,
    mme_state: MmeState,
    rrc_procedure: RrcProcedure,
    rrc_state: RrcState,
}

/// One logical channel of one user
pub struct RadioBearer {
    id: RbId,
    user: Mutex<Weak<User>>,
    timer_mgr: Arc<TimerManager>,
    poll_retransmit_ms: u32,

    rlc_config: Mutex<RlcMode>,
    pdcp_config: Mutex<PdcpConfig>,
    mac_config: MacConfig,

    procedures: Mutex<ProcedureState>,
    context: Mutex<BearerContext>,

    gw_data: MsgQueue<Bytes>,
    mme_nas: MsgQueue<Bytes>,
    rrc_pdu: MsgQueue<BitMessage>,
    rrc_nas: MsgQueue<Bytes>,
    pdcp_pdu: MsgQueue<Bytes>,
    pdcp_sdu: MsgQueue<BitMessage>,
    pdcp_data_sdu: MsgQueue<Bytes>,
    rlc_pdu: MsgQueue<Bytes>,
    rlc_sdu: MsgQueue<Bytes>,
    mac_sdu: MsgQueue<Bytes>,

    rlc_am: Mutex<RlcAmState>,
    rlc_um: Mutex<RlcUmState>,
}

impl RadioBearer {
    /// Create a bearer with the default configuration for its identity
    pub fn new(id: RbId, user: Weak<User>, timer_mgr: Arc<TimerManager>, config: &RlcConfig) -> Self {
        let (rlc_mode, pdcp_config) = match id {
            RbId::Srb0 => (RlcMode::Tm, PdcpConfig::NotApplicable),
            RbId::Srb1 | RbId::Srb2 => (RlcMode::Am, PdcpConfig::NotApplicable),
            _ => (RlcMode::Am, PdcpConfig::LongSn),
        };
        let context = BearerContext {
            drb_id: id.drb_id().unwrap_or(0),
            ..Default::default()
        };

        debug!("{} created: RLC {:?}, PDCP {:?}", id, rlc_mode, pdcp_config);

        Self {
            id,
            user: Mutex::new(user),
            timer_mgr,
            poll_retransmit_ms: config.poll_retransmit_ms,
            rlc_config: Mutex::new(rlc_mode),
            pdcp_config: Mutex::new(pdcp_config),
            mac_config: MacConfig::Tm,
            procedures: Mutex::new(ProcedureState {
                mme_procedure: MmeProcedure::Idle,
                mme_state: MmeState::Idle,
                rrc_procedure: RrcProcedure::Idle,
                rrc_state: RrcState::Idle,
            }),
            context: Mutex::new(context),
            gw_data: MsgQueue::new("gw_data"),
            mme_nas: MsgQueue::new("mme_nas"),
            rrc_pdu: MsgQueue::new("rrc_pdu"),
            rrc_nas: MsgQueue::new("rrc_nas"),
            pdcp_pdu: MsgQueue::new("pdcp_pdu"),
            pdcp_sdu: MsgQueue::new("pdcp_sdu"),
            pdcp_data_sdu: MsgQueue::new("pdcp_data_sdu"),
            rlc_pdu: MsgQueue::new("rlc_pdu"),
            rlc_sdu: MsgQueue::new("rlc_sdu"),
            mac_sdu: MsgQueue::new("mac_sdu"),
            rlc_am: Mutex::new(RlcAmState::new()),
            rlc_um: Mutex::new(RlcUmState::new(config.um_sn_size())),
        }
    }

    pub fn id(&self) -> RbId {
        self.id
    }

    /// Owning user, if it still exists
    pub fn user(&self) -> Option<Arc<User>> {
        lock(&self.user).upgrade()
    }

    /// C-RNTI of the owning user
    pub fn rnti(&self) -> Option<Rnti> {
        self.user().and_then(|user| user.c_rnti())
    }

    /// Re-point the back-reference after the bearer moved to another user
    pub fn reset_user(&self, user: Weak<User>) {
        *lock(&self.user) = user;
    }

    // Configuration

    pub fn rlc_config(&self) -> RlcMode {
        *lock(&self.rlc_config)
    }

    pub fn set_rlc_config(&self, mode: RlcMode) {
        *lock(&self.rlc_config) = mode;
    }

    pub fn pdcp_config(&self) -> PdcpConfig {
        *lock(&self.pdcp_config)
    }

    pub fn set_pdcp_config(&self, config: PdcpConfig) {
        *lock(&self.pdcp_config) = config;
    }

    pub fn mac_config(&self) -> MacConfig {
        self.mac_config
    }

    // Procedure state machines

    pub fn mme_procedure(&self) -> MmeProcedure {
        lock(&self.procedures).mme_procedure
    }

    pub fn set_mme_procedure(&self, procedure: MmeProcedure) {
        let mut procedures = lock(&self.procedures);
        debug!("{} MME procedure {:?} -> {:?}", self.id, procedures.mme_procedure, procedure);
        procedures.mme_procedure = procedure;
    }

    pub fn mme_state(&self) -> MmeState {
        lock(&self.procedures).mme_state
    }

    pub fn set_mme_state(&self, state: MmeState) {
        let mut procedures = lock(&self.procedures);
        debug!("{} MME state {:?} -> {:?}", self.id, procedures.mme_state, state);
        procedures.mme_state = state;
    }

    pub fn rrc_procedure(&self) -> RrcProcedure {
        lock(&self.procedures).rrc_procedure
    }

    pub fn set_rrc_procedure(&self, procedure: RrcProcedure) {
        let mut procedures = lock(&self.procedures);
        debug!("{} RRC procedure {:?} -> {:?}", self.id, procedures.rrc_procedure, procedure);
        procedures.rrc_procedure = procedure;
    }

    pub fn rrc_state(&self) -> RrcState {
        lock(&self.procedures).rrc_state
    }

    pub fn set_rrc_state(&self, state: RrcState) {
        let mut procedures = lock(&self.procedures);
        debug!("{} RRC state {:?} -> {:?}", self.id, procedures.rrc_state, state);
        procedures.rrc_state = state;
    }

    /// Upper layer scalars
    pub fn context(&self) -> MutexGuard<'_, BearerContext> {
        lock(&self.context)
    }

    // Queues

    pub fn gw_data_queue(&self) -> &MsgQueue<Bytes> {
        &self.gw_data
    }

    pub fn mme_nas_queue(&self) -> &MsgQueue<Bytes> {
        &self.mme_nas
    }

    pub fn rrc_pdu_queue(&self) -> &MsgQueue<BitMessage> {
        &self.rrc_pdu
    }

    pub fn rrc_nas_queue(&self) -> &MsgQueue<Bytes> {
        &self.rrc_nas
    }

    pub fn pdcp_pdu_queue(&self) -> &MsgQueue<Bytes> {
        &self.pdcp_pdu
    }

    pub fn pdcp_sdu_queue(&self) -> &MsgQueue<BitMessage> {
        &self.pdcp_sdu
    }

    pub fn pdcp_data_sdu_queue(&self) -> &MsgQueue<Bytes> {
        &self.pdcp_data_sdu
    }

    pub fn rlc_pdu_queue(&self) -> &MsgQueue<Bytes> {
        &self.rlc_pdu
    }

    pub fn rlc_sdu_queue(&self) -> &MsgQueue<Bytes> {
        &self.rlc_sdu
    }

    pub fn mac_sdu_queue(&self) -> &MsgQueue<Bytes> {
        &self.mac_sdu
    }

    // RLC AM receive state

    pub fn rlc_vrr(&self) -> u16 {
        lock(&self.rlc_am).vr_r
    }

    /// Set VR(R); VR(MR) follows
    pub fn set_rlc_vrr(&self, vr_r: u16) {
        lock(&self.rlc_am).set_vr_r(vr_r);
    }

    pub fn rlc_vrmr(&self) -> u16 {
        lock(&self.rlc_am).vr_mr
    }

    pub fn rlc_vrh(&self) -> u16 {
        lock(&self.rlc_am).vr_h
    }

    pub fn set_rlc_vrh(&self, vr_h: u16) {
        lock(&self.rlc_am).vr_h = vr_h % SN_MODULUS_10;
    }

    /// Raise VR(H) to `sn + 1` if `sn` is at or beyond it
    pub fn update_rlc_vrh(&self, sn: u16) {
        let mut am = lock(&self.rlc_am);
        let received = sn_offset(sn, am.vr_r, SN_MODULUS_10);
        if received >= sn_offset(am.vr_h, am.vr_r, SN_MODULUS_10) {
            am.vr_h = sn_add(sn, 1, SN_MODULUS_10);
        }
    }

    /// Advance VR(R) over every contiguously received SN below VR(H)
    pub fn update_rlc_vrr(&self) {
        let mut am = lock(&self.rlc_am);
        let mut sn = am.vr_r;
        while sn != am.vr_h && am.is_received(sn) {
            sn = sn_add(sn, 1, SN_MODULUS_10);
        }
        if sn != am.vr_r {
            trace!("{} VR(R) {} -> {}", self.id, am.vr_r, sn);
            am.set_vr_r(sn);
        }
    }

    /// Whether `sn` lies in the receive window [VR(R), VR(MR))
    pub fn rlc_am_rx_in_window(&self, sn: u16) -> bool {
        let am = lock(&self.rlc_am);
        in_window(sn, am.vr_r, AM_WINDOW_SIZE, SN_MODULUS_10)
    }

    /// Store a received data unit; returns `false` if it was dropped
    pub fn rlc_add_to_am_reception_buffer(&self, pdu: AmdPdu) -> bool {
        let mut am = lock(&self.rlc_am);
        let sn = pdu.sn();

        if am.rx_delivered.contains(&sn) {
            debug!("{} SN={} already delivered, dropping", self.id, sn);
            return false;
        }
        let units = am.rx_buffer.entry(sn).or_default();
        if units
            .iter()
            .any(|unit| unit.fi() == pdu.fi() && unit.data == pdu.data)
        {
            debug!("{} SN={} duplicate, dropping", self.id, sn);
            return false;
        }
        if units.len() >= MAX_PENDING_DUPLICATES {
            warn!("{} SN={} has {} pending units, dropping", self.id, sn, units.len());
            return false;
        }

        trace!("{} SN={} stored, {}", self.id, sn, bytes_to_hex(&pdu.data));
        units.push(pdu);
        true
    }

    /// ACK/NACK report for the current reception state
    ///
    /// Advances VR(R) to VR(H) when nothing is missing.
    pub fn rlc_get_am_reception_buffer_status(&self) -> StatusPdu {
        let mut am = lock(&self.rlc_am);
        let mut status = StatusPdu {
            ack_sn: am.vr_h,
            nack_sn: Vec::new(),
        };

        let mut sn = am.vr_r;
        while sn != am.vr_h && status.nack_sn.len() < AM_WINDOW_SIZE as usize {
            if !am.is_received(sn) {
                status.nack_sn.push(sn);
            }
            sn = sn_add(sn, 1, SN_MODULUS_10);
        }

        if status.nack_sn.is_empty() && am.vr_r != am.vr_h {
            let vr_h = am.vr_h;
            am.set_vr_r(vr_h);
        }

        status
    }

    /// Extract one complete SDU from the reception buffer
    pub fn rlc_am_reassemble(&self) -> Result<Bytes, LayerError> {
        let mut am = lock(&self.rlc_am);

        let mut starts: Vec<(u16, usize)> = am
            .rx_buffer
            .iter()
            .flat_map(|(sn, units)| {
                units
                    .iter()
                    .enumerate()
                    .filter(|(_, unit)| unit.fi().starts_sdu())
                    .map(move |(idx, _)| (*sn, idx))
            })
            .collect();
        starts.sort_by_key(|(sn, _)| am.rx_order(*sn));

        for (sn, idx) in starts {
            if let Some(picks) = am.complete_sdu(sn, idx) {
                let sdu = am.take_units(&picks);
                debug!(
                    "{} reassembled SDU of {} bytes from SN {}..={}",
                    self.id,
                    sdu.len(),
                    sn,
                    picks.last().map(|(last, _)| *last).unwrap_or(sn)
                );
                return Ok(sdu);
            }
        }

        let discarded = am.discard_stale_units();
        if discarded > 0 {
            debug!("{} discarded {} stale SNs behind VR(R)={}", self.id, discarded, am.vr_r);
        }
        Err(LayerError::CantReassembleSdu)
    }

    // RLC AM transmit state

    pub fn rlc_vta(&self) -> u16 {
        lock(&self.rlc_am).vt_a
    }

    /// Set VT(A); VT(MS) follows
    pub fn set_rlc_vta(&self, vt_a: u16) {
        lock(&self.rlc_am).set_vt_a(vt_a);
    }

    pub fn rlc_vtms(&self) -> u16 {
        lock(&self.rlc_am).vt_ms
    }

    pub fn rlc_vts(&self) -> u16 {
        lock(&self.rlc_am).vt_s
    }

    pub fn set_rlc_vts(&self, vt_s: u16) {
        lock(&self.rlc_am).vt_s = vt_s % SN_MODULUS_10;
    }

    /// Take VT(S) for a new data unit and advance it
    pub fn rlc_allocate_vts(&self) -> u16 {
        let mut am = lock(&self.rlc_am);
        let sn = am.vt_s;
        am.vt_s = sn_add(sn, 1, SN_MODULUS_10);
        sn
    }

    /// SNs still available before VT(S) would wrap onto VT(A)
    ///
    /// Units past VT(MS) are held, so VT(S) may run ahead of the transmit
    /// window but never by a full SN cycle.
    pub fn rlc_am_tx_free_sns(&self) -> u16 {
        let am = lock(&self.rlc_am);
        SN_MODULUS_10 - 1 - sn_offset(am.vt_s, am.vt_a, SN_MODULUS_10)
    }

    /// Whether `sn` lies in the transmit window [VT(A), VT(MS))
    pub fn rlc_am_tx_in_window(&self, sn: u16) -> bool {
        let am = lock(&self.rlc_am);
        in_window(sn, am.vt_a, AM_WINDOW_SIZE, SN_MODULUS_10)
    }

    /// Keep a data unit for retransmission; `sent` records whether it went to MAC
    pub fn rlc_add_to_transmission_buffer(&self, pdu: AmdPdu, sent: bool) {
        let mut am = lock(&self.rlc_am);
        let sn = pdu.sn();
        if am.tx_buffer.insert(sn, TxEntry { pdu, sent }).is_some() {
            warn!("{} SN={} overwrote an unacknowledged unit", self.id, sn);
        }
    }

    /// Data unit held for retransmission at `sn`
    pub fn rlc_transmission_buffer_unit(&self, sn: u16) -> Option<AmdPdu> {
        lock(&self.rlc_am).tx_buffer.get(&sn).map(|entry| entry.pdu.clone())
    }

    pub fn rlc_transmission_buffer_len(&self) -> usize {
        lock(&self.rlc_am).tx_buffer.len()
    }

    /// Apply a received STATUS PDU
    ///
    /// Returns units that were held back by the transmit window and now fit.
    pub fn rlc_update_transmission_buffer(&self, status: &StatusPdu) -> Vec<AmdPdu> {
        let mut am = lock(&self.rlc_am);

        let acked = sn_offset(status.ack_sn, am.vt_a, SN_MODULUS_10);
        if acked > sn_offset(am.vt_s, am.vt_a, SN_MODULUS_10) {
            warn!(
                "{} ACK_SN={} outside [VT(A)={}, VT(S)={}], ignoring status",
                self.id, status.ack_sn, am.vt_a, am.vt_s
            );
            return Vec::new();
        }

        let mut sn = am.vt_a;
        let mut update_vta = true;
        while sn != status.ack_sn {
            if status.nack_sn.contains(&sn) {
                update_vta = false;
            } else {
                am.tx_buffer.remove(&sn);
                if update_vta {
                    am.set_vt_a(sn_add(sn, 1, SN_MODULUS_10));
                }
            }
            sn = sn_add(sn, 1, SN_MODULUS_10);
        }
        trace!("{} VT(A)={} after status ACK_SN={}", self.id, am.vt_a, status.ack_sn);

        if am.tx_buffer.is_empty() {
            Self::stop_poll_timer(&self.timer_mgr, &mut am);
        }

        let vt_a = am.vt_a;
        am.tx_buffer
            .values_mut()
            .filter(|entry| !entry.sent && in_window(entry.pdu.sn(), vt_a, AM_WINDOW_SIZE, SN_MODULUS_10))
            .map(|entry| {
                entry.sent = true;
                entry.pdu.clone()
            })
            .collect()
    }

    /// Start the poll-retransmit timer unless it is already running
    pub fn rlc_start_t_poll_retransmit<F>(&self, on_expiry: F) -> bool
    where
        F: FnOnce(TimerId) + Send + 'static,
    {
        let mut am = lock(&self.rlc_am);
        if am.t_poll_retransmit.is_valid() {
            return false;
        }
        am.t_poll_retransmit = self.timer_mgr.start_timer(self.poll_retransmit_ms, on_expiry);
        trace!("{} t-PollRetransmit {} started", self.id, am.t_poll_retransmit);
        true
    }

    pub fn rlc_stop_t_poll_retransmit(&self) {
        Self::stop_poll_timer(&self.timer_mgr, &mut lock(&self.rlc_am));
    }

    pub fn rlc_t_poll_retransmit_running(&self) -> bool {
        lock(&self.rlc_am).t_poll_retransmit.is_valid()
    }

    /// Handle expiry of timer `id`; returns the unit stored at VT(A), if any
    ///
    /// Fails with `TimerNotFound` when `id` is not the bearer's running timer.
    pub fn rlc_handle_t_poll_retransmit_expiry(&self, id: TimerId) -> Result<Option<AmdPdu>, LayerError> {
        let mut am = lock(&self.rlc_am);
        if !id.is_valid() || am.t_poll_retransmit != id {
            debug!("{} ignoring stale t-PollRetransmit {}", self.id, id);
            return Err(LayerError::TimerNotFound);
        }
        am.t_poll_retransmit = TimerId::INVALID;
        let vt_a = am.vt_a;
        Ok(am.tx_buffer.get(&vt_a).map(|entry| entry.pdu.clone()))
    }

    fn stop_poll_timer(timer_mgr: &TimerManager, am: &mut RlcAmState) {
        if am.t_poll_retransmit.is_valid() {
            let _ = timer_mgr.stop_timer(am.t_poll_retransmit);
            trace!("t-PollRetransmit {} stopped", am.t_poll_retransmit);
            am.t_poll_retransmit = TimerId::INVALID;
        }
    }

    // RLC UM state

    pub fn rlc_vruh(&self) -> u16 {
        lock(&self.rlc_um).vr_uh
    }

    pub fn set_rlc_vruh(&self, vr_uh: u16) {
        let mut um = lock(&self.rlc_um);
        um.vr_uh = vr_uh % um.modulus();
    }

    pub fn rlc_vrur(&self) -> u16 {
        lock(&self.rlc_um).vr_ur
    }

    pub fn set_rlc_vrur(&self, vr_ur: u16) {
        let mut um = lock(&self.rlc_um);
        um.vr_ur = vr_ur % um.modulus();
    }

    pub fn rlc_um_window_size(&self) -> u16 {
        lock(&self.rlc_um).window_size
    }

    pub fn rlc_um_sn_size(&self) -> UmSnSize {
        lock(&self.rlc_um).sn_size
    }

    pub fn rlc_vtus(&self) -> u16 {
        lock(&self.rlc_um).vt_us
    }

    pub fn set_rlc_vtus(&self, vt_us: u16) {
        let mut um = lock(&self.rlc_um);
        um.vt_us = vt_us % um.modulus();
    }

    /// Take VT(US) for a new UMD PDU and advance it
    pub fn rlc_allocate_vtus(&self) -> u16 {
        let mut um = lock(&self.rlc_um);
        let sn = um.vt_us;
        um.vt_us = sn_add(sn, 1, um.modulus());
        sn
    }

    /// Whether `sn` falls behind the reassembly window, in [VR(UH) - W, VR(UR))
    pub fn rlc_um_outside_window(&self, sn: u16) -> bool {
        let um = lock(&self.rlc_um);
        let modulus = um.modulus();
        let base = um.window_base();
        in_window(sn, base, sn_offset(um.vr_ur, base, modulus), modulus)
    }

    /// Store one UMD data field and update the segment markers
    pub fn rlc_add_to_um_reception_buffer(&self, sn: u16, fi: FramingInfo, data: Bytes) -> bool {
        let mut um = lock(&self.rlc_um);
        if um.rx_buffer.contains_key(&sn) {
            debug!("{} UM SN={} already buffered, dropping", self.id, sn);
            return false;
        }

        if um.order(sn) >= um.window_size {
            um.vr_uh = sn_add(sn, 1, um.modulus());
        }
        um.rx_buffer.insert(sn, data);
        if fi.starts_sdu() {
            um.first_sn = Some(sn);
        }
        if fi.ends_sdu() {
            um.last_sn = Some(sn);
        }
        if let (Some(first), Some(last)) = (um.first_sn, um.last_sn) {
            if um.order(last) < um.order(first) {
                um.last_sn = None;
            }
        }
        true
    }

    /// Extract the SDU between the first and last segment markers
    pub fn rlc_um_reassemble(&self) -> Result<Bytes, LayerError> {
        let mut um = lock(&self.rlc_um);
        let (first, last) = match (um.first_sn, um.last_sn) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(LayerError::CantReassembleSdu),
        };

        let modulus = um.modulus();
        let count = sn_offset(last, first, modulus) + 1;
        let sns: Vec<u16> = (0..count).map(|i| sn_add(first, i, modulus)).collect();
        if !sns.iter().all(|sn| um.rx_buffer.contains_key(sn)) {
            return Err(LayerError::CantReassembleSdu);
        }

        let mut sdu = BytesMut::new();
        for sn in &sns {
            if let Some(data) = um.rx_buffer.remove(sn) {
                sdu.extend_from_slice(&data);
            }
        }
        um.clear_markers();
        let next = sn_add(last, 1, modulus);
        if um.order(next) > um.order(um.vr_ur) {
            um.vr_ur = next;
        }

        debug!("{} UM reassembled SDU of {} bytes from SN {}..={}", self.id, sdu.len(), first, last);
        Ok(sdu.freeze())
    }

    /// Snapshot of the RLC state variables and buffer depths
    pub fn stats(&self) -> RbStats {
        let am = lock(&self.rlc_am);
        let um = lock(&self.rlc_um);
        RbStats {
            vr_r: am.vr_r,
            vr_mr: am.vr_mr,
            vr_h: am.vr_h,
            vt_a: am.vt_a,
            vt_ms: am.vt_ms,
            vt_s: am.vt_s,
            vr_uh: um.vr_uh,
            vr_ur: um.vr_ur,
            vt_us: um.vt_us,
            am_rx_buffered: am.rx_buffer.values().map(Vec::len).sum(),
            am_tx_buffered: am.tx_buffer.len(),
            um_rx_buffered: um.rx_buffer.len(),
            t_poll_retransmit_running: am.t_poll_retransmit.is_valid(),
        }
    }

    /// Tear down: cancel the retransmission timer, drain queues and buffers
    pub fn stop(&self) {
        let drained = self.gw_data.clear()
            + self.mme_nas.clear()
            + self.rrc_pdu.clear()
            + self.rrc_nas.clear()
            + self.pdcp_pdu.clear()
            + self.pdcp_sdu.clear()
            + self.pdcp_data_sdu.clear()
            + self.rlc_pdu.clear()
            + self.rlc_sdu.clear()
            + self.mac_sdu.clear();

        {
            let mut am = lock(&self.rlc_am);
            Self::stop_poll_timer(&self.timer_mgr, &mut am);
            am.rx_buffer.clear();
            am.rx_delivered.clear();
            am.tx_buffer.clear();
        }
        {
            let mut um = lock(&self.rlc_um);
            um.rx_buffer.clear();
            um.clear_markers();
        }

        debug!("{} stopped, {} queued messages dropped", self.id, drained);
    }
}

impl Drop for RadioBearer {
    fn drop(&mut self) {
        let timer_mgr = self.timer_mgr.clone();
        let am = self
            .rlc_am
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Self::stop_poll_timer(&timer_mgr, am);
    }
}

impl fmt::Debug for RadioBearer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RadioBearer")
            .field("id", &self.id)
            .field("rlc", &self.rlc_config())
            .field("pdcp", &self.pdcp_config())
            .finish()
    }
}
