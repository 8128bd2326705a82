//! User Context
//!
//! One connected UE: identity, radio bearers, NAS/ESM context, MAC
//! bookkeeping and the inactivity timer.

use common::types::{Guti, RbId, Rnti, STmsi};
use common::utils::{digits_to_number, number_to_digits};
use interfaces::{BearerRef, LayerMessage, MessageSender, RrcCommand};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};

use crate::rb::{MmeProcedure, MmeState, RadioBearer, RrcProcedure, RrcState};
use crate::rlc::RlcConfig;
use crate::timer::{TimerId, TimerManager};
use crate::{lock, LayerError};

/// Number of decimal digits in an IMSI or IMEI
pub const ID_DIGITS: usize = 15;

/// Per-user configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    /// Downlink RLC segmentation limit
    #[serde(default = "default_max_dl_bytes_per_subframe")]
    pub max_dl_bytes_per_subframe: u32,
    #[serde(default = "default_max_ul_bytes_per_subframe")]
    pub max_ul_bytes_per_subframe: u32,
    #[serde(default = "default_inactivity_timer_ms")]
    pub inactivity_timer_ms: u32,
    /// How long a C-RNTI stays reserved without being reset
    #[serde(default = "default_c_rnti_reservation_ms")]
    pub c_rnti_reservation_ms: u32,
}

fn default_max_dl_bytes_per_subframe() -> u32 {
    325
}

fn default_max_ul_bytes_per_subframe() -> u32 {
    50
}

fn default_inactivity_timer_ms() -> u32 {
    10000
}

fn default_c_rnti_reservation_ms() -> u32 {
    5000
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            max_dl_bytes_per_subframe: default_max_dl_bytes_per_subframe(),
            max_ul_bytes_per_subframe: default_max_ul_bytes_per_subframe(),
            inactivity_timer_ms: default_inactivity_timer_ms(),
            c_rnti_reservation_ms: default_c_rnti_reservation_ms(),
        }
    }
}

/// NAS and ESM procedure context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NasContext {
    pub emm_cause: u8,
    pub attach_type: u8,
    pub pdn_type: u8,
    pub eps_bearer_id: u8,
    pub proc_transaction_id: u8,
    pub esm_info_transfer: bool,
}

#[derive(Debug, Default)]
struct Identity {
    imsi: u64,
    imei: u64,
    id_set: bool,
    guti: Option<Guti>,
    temp_id: u32,
    c_rnti: Option<Rnti>,
    ip_addr: Option<Ipv4Addr>,
}

#[derive(Debug, Default)]
struct MacContext {
    dl_ndi: bool,
    ul_ndi: bool,
    ul_buffer_size: u32,
    delete_counter: u32,
}

#[derive(Default)]
struct Bearers {
    srb1: Option<Arc<RadioBearer>>,
    srb2: Option<Arc<RadioBearer>>,
    drbs: BTreeMap<u8, Arc<RadioBearer>>,
}

impl Bearers {
    fn take_all(&mut self) -> Vec<Arc<RadioBearer>> {
        let mut taken: Vec<_> = self.srb1.take().into_iter().chain(self.srb2.take()).collect();
        taken.extend(std::mem::take(&mut self.drbs).into_values());
        taken
    }
}

/// One connected UE
pub struct User {
    self_ref: Weak<User>,
    timer_mgr: Arc<TimerManager>,
    rlc_config: RlcConfig,
    inactivity_timer_ms: u32,
    rrc: MessageSender,

    identity: Mutex<Identity>,
    nas: Mutex<NasContext>,
    mac: Mutex<MacContext>,
    max_dl_bytes_per_subframe: AtomicU32,
    max_ul_bytes_per_subframe: AtomicU32,

    srb0: Arc<RadioBearer>,
    bearers: Mutex<Bearers>,
    inactivity_timer: Mutex<TimerId>,
}

impl User {
    /// Create a user with SRB0 set up
    ///
    /// Inactivity releases are posted to `rrc`.
    pub fn new(
        config: &UserConfig,
        rlc_config: &RlcConfig,
        timer_mgr: Arc<TimerManager>,
        rrc: MessageSender,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref: &Weak<User>| Self {
            self_ref: self_ref.clone(),
            srb0: Arc::new(RadioBearer::new(
                RbId::Srb0,
                self_ref.clone(),
                timer_mgr.clone(),
                rlc_config,
            )),
            timer_mgr,
            rlc_config: rlc_config.clone(),
            inactivity_timer_ms: config.inactivity_timer_ms,
            rrc,
            identity: Mutex::new(Identity::default()),
            nas: Mutex::new(NasContext::default()),
            mac: Mutex::new(MacContext::default()),
            max_dl_bytes_per_subframe: AtomicU32::new(config.max_dl_bytes_per_subframe),
            max_ul_bytes_per_subframe: AtomicU32::new(config.max_ul_bytes_per_subframe),
            bearers: Mutex::new(Bearers::default()),
            inactivity_timer: Mutex::new(TimerId::INVALID),
        })
    }

    /// Return to the freshly created state, keeping the identity
    pub fn init(&self) {
        self.stop_inactivity_timer();
        let bearers = lock(&self.bearers).take_all();
        for rb in bearers {
            rb.stop();
        }

        self.srb0.set_mme_procedure(MmeProcedure::Idle);
        self.srb0.set_mme_state(MmeState::Idle);
        self.srb0.set_rrc_procedure(RrcProcedure::Idle);
        self.srb0.set_rrc_state(RrcState::Idle);

        lock(&self.identity).c_rnti = None;
        *lock(&self.nas) = NasContext::default();
        *lock(&self.mac) = MacContext::default();
        debug!("User {} reinitialized", self);
    }

    /// Tear down every bearer and timer
    pub fn stop(&self) {
        self.stop_inactivity_timer();
        let bearers = lock(&self.bearers).take_all();
        for rb in bearers {
            rb.stop();
        }
        self.srb0.stop();
    }

    // Identity

    /// Set IMSI and IMEI from their 15 digit decimal strings
    pub fn set_id(&self, imsi: &str, imei: &str) -> Result<(), LayerError> {
        let imsi_num = digits_to_number(imsi, ID_DIGITS)
            .ok_or_else(|| LayerError::InvalidParam(format!("IMSI {:?}", imsi)))?;
        let imei_num = digits_to_number(imei, ID_DIGITS)
            .ok_or_else(|| LayerError::InvalidParam(format!("IMEI {:?}", imei)))?;

        let mut identity = lock(&self.identity);
        identity.imsi = imsi_num;
        identity.imei = imei_num;
        identity.id_set = true;
        Ok(())
    }

    pub fn is_id_set(&self) -> bool {
        lock(&self.identity).id_set
    }

    pub fn imsi(&self) -> Option<u64> {
        let identity = lock(&self.identity);
        identity.id_set.then_some(identity.imsi)
    }

    pub fn imsi_str(&self) -> Option<String> {
        self.imsi().map(|imsi| number_to_digits(imsi, ID_DIGITS))
    }

    pub fn imei(&self) -> Option<u64> {
        let identity = lock(&self.identity);
        identity.id_set.then_some(identity.imei)
    }

    pub fn imei_str(&self) -> Option<String> {
        self.imei().map(|imei| number_to_digits(imei, ID_DIGITS))
    }

    pub fn guti(&self) -> Option<Guti> {
        lock(&self.identity).guti
    }

    pub fn set_guti(&self, guti: Guti) {
        lock(&self.identity).guti = Some(guti);
    }

    /// Whether the S-TMSI identifies this user's GUTI
    pub fn matches_s_tmsi(&self, s_tmsi: &STmsi) -> bool {
        self.guti()
            .map(|guti| guti.mme_code == s_tmsi.mmec && guti.m_tmsi == s_tmsi.m_tmsi)
            .unwrap_or(false)
    }

    pub fn temp_id(&self) -> u32 {
        lock(&self.identity).temp_id
    }

    pub fn set_temp_id(&self, temp_id: u32) {
        lock(&self.identity).temp_id = temp_id;
    }

    pub fn c_rnti(&self) -> Option<Rnti> {
        lock(&self.identity).c_rnti
    }

    pub fn set_c_rnti(&self, c_rnti: Option<Rnti>) {
        lock(&self.identity).c_rnti = c_rnti;
    }

    pub fn ip_addr(&self) -> Option<Ipv4Addr> {
        lock(&self.identity).ip_addr
    }

    pub fn set_ip_addr(&self, addr: Ipv4Addr) {
        lock(&self.identity).ip_addr = Some(addr);
    }

    /// Drop the identity so lookups no longer find this user
    pub fn prepare_for_deletion(&self) {
        lock(&self.identity).id_set = false;
    }

    // Bearers

    /// Look up any bearer of this user
    pub fn bearer(&self, id: RbId) -> Result<Arc<RadioBearer>, LayerError> {
        match id {
            RbId::Srb0 => Ok(self.srb0.clone()),
            RbId::Srb1 => self.srb1(),
            RbId::Srb2 => self.srb2(),
            drb => drb
                .drb_id()
                .ok_or(LayerError::RbNotSetup)
                .and_then(|drb_id| self.drb(drb_id)),
        }
    }

    pub fn srb0(&self) -> Arc<RadioBearer> {
        self.srb0.clone()
    }

    pub fn setup_srb1(&self) -> Result<Arc<RadioBearer>, LayerError> {
        let mut bearers = lock(&self.bearers);
        Self::setup(&mut bearers.srb1, || self.new_bearer(RbId::Srb1))
    }

    pub fn teardown_srb1(&self) -> Result<(), LayerError> {
        let rb = lock(&self.bearers).srb1.take().ok_or(LayerError::RbNotSetup)?;
        rb.stop();
        Ok(())
    }

    pub fn srb1(&self) -> Result<Arc<RadioBearer>, LayerError> {
        lock(&self.bearers).srb1.clone().ok_or(LayerError::RbNotSetup)
    }

    pub fn setup_srb2(&self) -> Result<Arc<RadioBearer>, LayerError> {
        let mut bearers = lock(&self.bearers);
        Self::setup(&mut bearers.srb2, || self.new_bearer(RbId::Srb2))
    }

    pub fn teardown_srb2(&self) -> Result<(), LayerError> {
        let rb = lock(&self.bearers).srb2.take().ok_or(LayerError::RbNotSetup)?;
        rb.stop();
        Ok(())
    }

    pub fn srb2(&self) -> Result<Arc<RadioBearer>, LayerError> {
        lock(&self.bearers).srb2.clone().ok_or(LayerError::RbNotSetup)
    }

    /// Set up DRB `drb_id` (1..=8)
    pub fn setup_drb(&self, drb_id: u8) -> Result<Arc<RadioBearer>, LayerError> {
        let id = RbId::drb(drb_id)
            .ok_or_else(|| LayerError::InvalidParam(format!("DRB id {}", drb_id)))?;
        let mut bearers = lock(&self.bearers);
        if bearers.drbs.contains_key(&drb_id) {
            return Err(LayerError::RbAlreadySetup);
        }
        let rb = self.new_bearer(id);
        bearers.drbs.insert(drb_id, rb.clone());
        Ok(rb)
    }

    pub fn teardown_drb(&self, drb_id: u8) -> Result<(), LayerError> {
        let rb = lock(&self.bearers)
            .drbs
            .remove(&drb_id)
            .ok_or(LayerError::RbNotSetup)?;
        rb.stop();
        Ok(())
    }

    pub fn drb(&self, drb_id: u8) -> Result<Arc<RadioBearer>, LayerError> {
        lock(&self.bearers)
            .drbs
            .get(&drb_id)
            .cloned()
            .ok_or(LayerError::RbNotSetup)
    }

    /// Adopt SRB1, SRB2 and the DRBs of `other`
    pub fn copy_rbs(&self, other: &User) {
        let adopted = {
            let theirs = lock(&other.bearers);
            Bearers {
                srb1: theirs.srb1.clone(),
                srb2: theirs.srb2.clone(),
                drbs: theirs.drbs.clone(),
            }
        };

        let mut bearers = lock(&self.bearers);
        for rb in adopted.srb1.iter().chain(adopted.srb2.iter()).chain(adopted.drbs.values()) {
            rb.reset_user(self.self_ref.clone());
        }
        *bearers = adopted;
    }

    /// Detach SRB1, SRB2 and the DRBs without tearing them down
    pub fn clear_rbs(&self) {
        let mut bearers = lock(&self.bearers);
        bearers.srb1 = None;
        bearers.srb2 = None;
        bearers.drbs.clear();
    }

    fn new_bearer(&self, id: RbId) -> Arc<RadioBearer> {
        debug!("User {} setting up {}", self, id);
        Arc::new(RadioBearer::new(
            id,
            self.self_ref.clone(),
            self.timer_mgr.clone(),
            &self.rlc_config,
        ))
    }

    fn setup(
        slot: &mut Option<Arc<RadioBearer>>,
        create: impl FnOnce() -> Arc<RadioBearer>,
    ) -> Result<Arc<RadioBearer>, LayerError> {
        if slot.is_some() {
            return Err(LayerError::RbAlreadySetup);
        }
        let rb = create();
        *slot = Some(rb.clone());
        Ok(rb)
    }

    // Inactivity timer

    /// (Re)start the inactivity timer
    pub fn start_inactivity_timer(&self) {
        let mut timer = lock(&self.inactivity_timer);
        if timer.is_valid() {
            let _ = self.timer_mgr.stop_timer(*timer);
        }
        let user = self.self_ref.clone();
        *timer = self.timer_mgr.start_timer(self.inactivity_timer_ms, move |id| {
            if let Some(user) = user.upgrade() {
                user.handle_inactivity_timer_expiry(id);
            }
        });
    }

    /// Restart the inactivity countdown, starting the timer if needed
    pub fn reset_inactivity_timer(&self) {
        let running = *lock(&self.inactivity_timer);
        if self.timer_mgr.reset_timer(running).is_err() {
            self.start_inactivity_timer();
        }
    }

    pub fn stop_inactivity_timer(&self) {
        let mut timer = lock(&self.inactivity_timer);
        if timer.is_valid() {
            let _ = self.timer_mgr.stop_timer(*timer);
            *timer = TimerId::INVALID;
        }
    }

    pub fn inactivity_timer_running(&self) -> bool {
        lock(&self.inactivity_timer).is_valid()
    }

    fn handle_inactivity_timer_expiry(&self, id: TimerId) {
        {
            let mut timer = lock(&self.inactivity_timer);
            if *timer != id {
                return;
            }
            *timer = TimerId::INVALID;
        }

        let c_rnti = match self.c_rnti() {
            Some(c_rnti) => c_rnti,
            None => return,
        };
        if self.srb1().is_err() {
            debug!("User {} inactive without SRB1", self);
            return;
        }

        info!("User {} inactive, requesting RRC connection release", self);
        let msg = LayerMessage::RrcCommand {
            bearer: BearerRef::new(c_rnti, RbId::Srb1),
            command: RrcCommand::Release,
        };
        if let Err(e) = self.rrc.send(msg) {
            warn!("Failed to post release for user {}: {}", self, e);
        }
    }

    // NAS

    pub fn nas(&self) -> MutexGuard<'_, NasContext> {
        lock(&self.nas)
    }

    // MAC

    /// Toggle the downlink NDI and return its new value
    pub fn flip_dl_ndi(&self) -> bool {
        let mut mac = lock(&self.mac);
        mac.dl_ndi = !mac.dl_ndi;
        mac.dl_ndi
    }

    pub fn dl_ndi(&self) -> bool {
        lock(&self.mac).dl_ndi
    }

    /// Toggle the uplink NDI and return its new value
    pub fn flip_ul_ndi(&self) -> bool {
        let mut mac = lock(&self.mac);
        mac.ul_ndi = !mac.ul_ndi;
        mac.ul_ndi
    }

    pub fn ul_ndi(&self) -> bool {
        lock(&self.mac).ul_ndi
    }

    pub fn ul_buffer_size(&self) -> u32 {
        lock(&self.mac).ul_buffer_size
    }

    pub fn set_ul_buffer_size(&self, size: u32) {
        lock(&self.mac).ul_buffer_size = size;
    }

    /// Account for `granted` bytes scheduled from the UL buffer
    pub fn update_ul_buffer_size(&self, granted: u32) {
        let mut mac = lock(&self.mac);
        mac.ul_buffer_size = mac.ul_buffer_size.saturating_sub(granted);
    }

    pub fn delete_counter(&self) -> u32 {
        lock(&self.mac).delete_counter
    }

    pub fn increment_delete_counter(&self) -> u32 {
        let mut mac = lock(&self.mac);
        mac.delete_counter += 1;
        mac.delete_counter
    }

    // QoS

    pub fn max_dl_bytes_per_subframe(&self) -> u32 {
        self.max_dl_bytes_per_subframe.load(Ordering::Relaxed)
    }

    pub fn set_max_dl_bytes_per_subframe(&self, bytes: u32) {
        self.max_dl_bytes_per_subframe.store(bytes, Ordering::Relaxed);
    }

    pub fn max_ul_bytes_per_subframe(&self) -> u32 {
        self.max_ul_bytes_per_subframe.load(Ordering::Relaxed)
    }

    pub fn set_max_ul_bytes_per_subframe(&self, bytes: u32) {
        self.max_ul_bytes_per_subframe.store(bytes, Ordering::Relaxed);
    }
}

impl Drop for User {
    fn drop(&mut self) {
        let timer = self
            .inactivity_timer
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if timer.is_valid() {
            let _ = self.timer_mgr.stop_timer(*timer);
        }
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let identity = lock(&self.identity);
        match identity.c_rnti {
            Some(c_rnti) => write!(f, "C-RNTI={}", c_rnti)?,
            None => write!(f, "C-RNTI=none")?,
        }
        if identity.id_set {
            write!(f, " IMSI={}", number_to_digits(identity.imsi, ID_DIGITS))?;
        }
        Ok(())
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "User({})", self)
    }
}
