//! User Manager
//!
//! Registry of connected users and owner of the C-RNTI pool.

use common::types::{Guti, RbId, Rnti, STmsi};
use common::utils::digits_to_number;
use interfaces::MessageSender;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

use crate::rlc::RlcConfig;
use crate::timer::{TimerId, TimerManager};
use crate::user::{User, UserConfig, ID_DIGITS};
use crate::{lock, LayerError};

struct Registry {
    users: Vec<Arc<User>>,
    /// Assigned C-RNTIs and their reservation timers
    c_rntis: BTreeMap<Rnti, TimerId>,
    next_c_rnti: u16,
}

impl Registry {
    fn allocate_c_rnti(&mut self) -> Result<Rnti, LayerError> {
        let pool = (Rnti::C_RNTI_END - Rnti::C_RNTI_START) as u32 + 1;
        for _ in 0..pool {
            let candidate = Rnti::new(self.next_c_rnti);
            self.next_c_rnti = if self.next_c_rnti >= Rnti::C_RNTI_END {
                Rnti::C_RNTI_START
            } else {
                self.next_c_rnti + 1
            };
            if !self.c_rntis.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(LayerError::NoFreeCRnti)
    }

    fn position(&self, user: &User) -> Option<usize> {
        self.users.iter().position(|u| same_user(u, user))
    }

    fn position_by_c_rnti(&self, c_rnti: Rnti) -> Option<usize> {
        self.users.iter().position(|u| u.c_rnti() == Some(c_rnti))
    }
}

/// Match by identity, else GUTI, else C-RNTI
fn same_user(a: &User, b: &User) -> bool {
    if std::ptr::eq(a, b) {
        return true;
    }
    if b.is_id_set() {
        a.imsi() == b.imsi()
    } else if let Some(guti) = b.guti() {
        a.guti() == Some(guti)
    } else {
        b.c_rnti().is_some() && a.c_rnti() == b.c_rnti()
    }
}

/// Registry of users
pub struct UserManager {
    self_ref: Weak<UserManager>,
    timer_mgr: Arc<TimerManager>,
    user_config: UserConfig,
    rlc_config: RlcConfig,
    rrc: MessageSender,
    registry: Mutex<Registry>,
    next_m_tmsi: AtomicU32,
}

impl UserManager {
    /// Create an empty user manager
    ///
    /// New users post inactivity releases to `rrc`.
    pub fn new(
        user_config: UserConfig,
        rlc_config: RlcConfig,
        timer_mgr: Arc<TimerManager>,
        rrc: MessageSender,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            timer_mgr,
            user_config,
            rlc_config,
            rrc,
            registry: Mutex::new(Registry {
                users: Vec::new(),
                c_rntis: BTreeMap::new(),
                next_c_rnti: Rnti::C_RNTI_START,
            }),
            next_m_tmsi: AtomicU32::new(1),
        })
    }

    // C-RNTI pool

    /// Reserve the next free C-RNTI
    pub fn assign_c_rnti(&self) -> Result<Rnti, LayerError> {
        let mut registry = lock(&self.registry);
        let c_rnti = registry.allocate_c_rnti()?;
        let timer = self.start_reservation_timer(c_rnti);
        registry.c_rntis.insert(c_rnti, timer);
        debug!("Assigned C-RNTI {}", c_rnti);
        Ok(c_rnti)
    }

    /// Give a C-RNTI back to the pool
    ///
    /// Its user is reinitialized when its identity is known, otherwise deleted.
    pub fn release_c_rnti(&self, c_rnti: Rnti) -> Result<(), LayerError> {
        let released = {
            let mut registry = lock(&self.registry);
            let timer = registry
                .c_rntis
                .remove(&c_rnti)
                .ok_or(LayerError::CRntiNotFound)?;
            let _ = self.timer_mgr.stop_timer(timer);

            match registry.position_by_c_rnti(c_rnti) {
                Some(idx) if registry.users[idx].is_id_set() => {
                    Some((registry.users[idx].clone(), false))
                }
                Some(idx) => Some((registry.users.remove(idx), true)),
                None => None,
            }
        };

        match released {
            Some((user, true)) => {
                debug!("Released C-RNTI {}, deleting user", c_rnti);
                user.stop();
            }
            Some((user, false)) => {
                debug!("Released C-RNTI {}, reinitializing user", c_rnti);
                user.init();
            }
            None => debug!("Released C-RNTI {}", c_rnti),
        }
        Ok(())
    }

    /// Move the C-RNTI and bearers of `old` to `new` and drop `old`
    pub fn transfer_c_rnti(&self, old: &Arc<User>, new: &Arc<User>) -> Result<(), LayerError> {
        let c_rnti = old.c_rnti().ok_or(LayerError::CRntiNotFound)?;

        let stale = {
            let mut registry = lock(&self.registry);
            if !registry.c_rntis.contains_key(&c_rnti) {
                return Err(LayerError::CRntiNotFound);
            }

            let stale = new.c_rnti().filter(|rnti| *rnti != c_rnti);
            if let Some(stale) = stale {
                if let Some(timer) = registry.c_rntis.remove(&stale) {
                    let _ = self.timer_mgr.stop_timer(timer);
                }
            }

            new.copy_rbs(old);
            old.clear_rbs();
            new.set_c_rnti(Some(c_rnti));

            registry.users.retain(|u| !Arc::ptr_eq(u, old));
            if !registry.users.iter().any(|u| Arc::ptr_eq(u, new)) {
                registry.users.push(new.clone());
            }
            stale
        };

        old.prepare_for_deletion();
        old.set_c_rnti(None);
        old.stop();
        info!(
            "Transferred C-RNTI {} to user {}{}",
            c_rnti,
            new,
            stale.map(|s| format!(", released {}", s)).unwrap_or_default()
        );
        Ok(())
    }

    /// Restart the reservation countdown of a C-RNTI
    pub fn reset_c_rnti_timer(&self, c_rnti: Rnti) -> Result<(), LayerError> {
        let registry = lock(&self.registry);
        let timer = registry
            .c_rntis
            .get(&c_rnti)
            .ok_or(LayerError::CRntiNotFound)?;
        self.timer_mgr.reset_timer(*timer)
    }

    fn start_reservation_timer(&self, c_rnti: Rnti) -> TimerId {
        let mgr = self.self_ref.clone();
        self.timer_mgr
            .start_timer(self.user_config.c_rnti_reservation_ms, move |_| {
                if let Some(mgr) = mgr.upgrade() {
                    debug!("C-RNTI {} reservation expired", c_rnti);
                    if let Err(e) = mgr.release_c_rnti(c_rnti) {
                        debug!("C-RNTI {} already released: {}", c_rnti, e);
                    }
                }
            })
    }

    // Users

    /// Create a user with a fresh C-RNTI
    pub fn add_user(&self) -> Result<Arc<User>, LayerError> {
        let user = User::new(
            &self.user_config,
            &self.rlc_config,
            self.timer_mgr.clone(),
            self.rrc.clone(),
        );

        let c_rnti = self.assign_c_rnti()?;
        user.set_c_rnti(Some(c_rnti));
        user.start_inactivity_timer();
        lock(&self.registry).users.push(user.clone());

        info!("Added user {}", user);
        Ok(user)
    }

    pub fn find_user_by_imsi(&self, imsi: &str) -> Result<Arc<User>, LayerError> {
        let imsi = digits_to_number(imsi, ID_DIGITS)
            .ok_or_else(|| LayerError::InvalidParam(format!("IMSI {:?}", imsi)))?;
        self.find(|user| user.imsi() == Some(imsi))
    }

    pub fn find_user_by_c_rnti(&self, c_rnti: Rnti) -> Result<Arc<User>, LayerError> {
        self.find(|user| user.c_rnti() == Some(c_rnti))
    }

    pub fn find_user_by_guti(&self, guti: &Guti) -> Result<Arc<User>, LayerError> {
        self.find(|user| user.guti().as_ref() == Some(guti))
    }

    pub fn find_user_by_s_tmsi(&self, s_tmsi: &STmsi) -> Result<Arc<User>, LayerError> {
        self.find(|user| user.matches_s_tmsi(s_tmsi))
    }

    pub fn find_user_by_ip_addr(&self, addr: Ipv4Addr) -> Result<Arc<User>, LayerError> {
        self.find(|user| user.ip_addr() == Some(addr))
    }

    fn find(&self, pred: impl Fn(&User) -> bool) -> Result<Arc<User>, LayerError> {
        lock(&self.registry)
            .users
            .iter()
            .find(|user| pred(user))
            .cloned()
            .ok_or(LayerError::UserNotFound)
    }

    /// Delete a user, tearing down its bearers and releasing its C-RNTI
    pub fn del_user(&self, user: &User) -> Result<(), LayerError> {
        let removed = {
            let mut registry = lock(&self.registry);
            let idx = registry.position(user).ok_or(LayerError::UserNotFound)?;
            let removed = registry.users.remove(idx);
            if let Some(c_rnti) = removed.c_rnti() {
                if let Some(timer) = registry.c_rntis.remove(&c_rnti) {
                    let _ = self.timer_mgr.stop_timer(timer);
                }
            }
            removed
        };

        info!("Deleting user {}", removed);
        removed.stop();
        Ok(())
    }

    pub fn del_user_by_imsi(&self, imsi: &str) -> Result<(), LayerError> {
        let user = self.find_user_by_imsi(imsi)?;
        self.del_user(&user)
    }

    pub fn del_user_by_c_rnti(&self, c_rnti: Rnti) -> Result<(), LayerError> {
        let user = self.find_user_by_c_rnti(c_rnti)?;
        self.del_user(&user)
    }

    /// Next M-TMSI for GUTI allocation
    pub fn get_next_m_tmsi(&self) -> u32 {
        self.next_m_tmsi.fetch_add(1, Ordering::Relaxed)
    }

    pub fn user_count(&self) -> usize {
        lock(&self.registry).users.len()
    }

    pub fn c_rnti_count(&self) -> usize {
        lock(&self.registry).c_rntis.len()
    }

    /// Snapshot of the registered users
    pub fn users(&self) -> Vec<Arc<User>> {
        lock(&self.registry).users.clone()
    }

    pub fn print_all_users(&self) {
        let users = self.users();
        if users.is_empty() {
            info!("No users");
            return;
        }
        for user in users {
            let bearers: Vec<String> = [RbId::Srb1, RbId::Srb2]
                .into_iter()
                .chain((1..=RbId::MAX_DRBS as u8).filter_map(RbId::drb))
                .filter(|id| user.bearer(*id).is_ok())
                .map(|id| id.to_string())
                .collect();
            match user.guti() {
                Some(guti) => info!(
                    "User {} GUTI M-TMSI={:#010x} bearers=[SRB0 {}]",
                    user,
                    guti.m_tmsi,
                    bearers.join(" ")
                ),
                None => info!("User {} bearers=[SRB0 {}]", user, bearers.join(" ")),
            }
        }
    }
}

impl Drop for UserManager {
    fn drop(&mut self) {
        let registry = self
            .registry
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for timer in registry.c_rntis.values() {
            let _ = self.timer_mgr.stop_timer(*timer);
        }
        if !registry.users.is_empty() {
            warn!("User manager dropped with {} users", registry.users.len());
        }
        for user in registry.users.drain(..) {
            user.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interfaces::message_queue;

    fn manager(config: UserConfig) -> (Arc<TimerManager>, Arc<UserManager>) {
        let timer_mgr = Arc::new(TimerManager::new());
        let (rrc_tx, _rrc_rx) = message_queue("rrc");
        let mgr = UserManager::new(config, RlcConfig::default(), timer_mgr.clone(), rrc_tx);
        (timer_mgr, mgr)
    }

    #[test]
    fn test_add_and_find() {
        let (_, mgr) = manager(UserConfig::default());
        let first = mgr.add_user().unwrap();
        let second = mgr.add_user().unwrap();

        assert_eq!(first.c_rnti(), Some(Rnti::new(Rnti::C_RNTI_START)));
        assert_eq!(second.c_rnti(), Some(Rnti::new(Rnti::C_RNTI_START + 1)));
        assert!(first.inactivity_timer_running());

        let found = mgr.find_user_by_c_rnti(Rnti::new(Rnti::C_RNTI_START + 1)).unwrap();
        assert!(Arc::ptr_eq(&found, &second));
        assert_eq!(
            mgr.find_user_by_c_rnti(Rnti::new(0x1000)).unwrap_err(),
            LayerError::UserNotFound
        );

        first.set_id("001010000000001", "353456789012345").unwrap();
        assert!(Arc::ptr_eq(&mgr.find_user_by_imsi("001010000000001").unwrap(), &first));

        second.set_ip_addr(Ipv4Addr::new(10, 0, 0, 2));
        assert!(Arc::ptr_eq(&mgr.find_user_by_ip_addr(Ipv4Addr::new(10, 0, 0, 2)).unwrap(), &second));

        let guti = Guti {
            mme_code: 1,
            m_tmsi: mgr.get_next_m_tmsi(),
            ..Default::default()
        };
        second.set_guti(guti);
        assert!(Arc::ptr_eq(&mgr.find_user_by_guti(&guti).unwrap(), &second));
        let s_tmsi = STmsi { mmec: 1, m_tmsi: guti.m_tmsi };
        assert!(Arc::ptr_eq(&mgr.find_user_by_s_tmsi(&s_tmsi).unwrap(), &second));
    }

    #[test]
    fn test_m_tmsi_counts_from_one() {
        let (_, mgr) = manager(UserConfig::default());
        assert_eq!(mgr.get_next_m_tmsi(), 1);
        assert_eq!(mgr.get_next_m_tmsi(), 2);
    }

    #[test]
    fn test_c_rnti_wraps_and_skips_assigned() {
        let (_, mgr) = manager(UserConfig::default());
        lock(&mgr.registry).next_c_rnti = Rnti::C_RNTI_END;

        assert_eq!(mgr.assign_c_rnti().unwrap(), Rnti::new(Rnti::C_RNTI_END));
        assert_eq!(mgr.assign_c_rnti().unwrap(), Rnti::new(Rnti::C_RNTI_START));

        lock(&mgr.registry).next_c_rnti = Rnti::C_RNTI_END;
        assert_eq!(mgr.assign_c_rnti().unwrap(), Rnti::new(Rnti::C_RNTI_START + 1));
    }

    #[test]
    fn test_c_rnti_pool_exhaustion() {
        let (_, mgr) = manager(UserConfig::default());
        {
            let mut registry = lock(&mgr.registry);
            for value in Rnti::C_RNTI_START..=Rnti::C_RNTI_END {
                registry.c_rntis.insert(Rnti::new(value), TimerId::INVALID);
            }
        }
        assert_eq!(mgr.assign_c_rnti(), Err(LayerError::NoFreeCRnti));
    }

    #[test]
    fn test_reservation_expiry_deletes_anonymous_user() {
        let config = UserConfig {
            c_rnti_reservation_ms: 1,
            ..Default::default()
        };
        let (timer_mgr, mgr) = manager(config);
        let anonymous = mgr.add_user().unwrap();
        let known = mgr.add_user().unwrap();
        known.set_id("001010000000002", "353456789012345").unwrap();
        known.setup_srb1().unwrap();

        timer_mgr.on_tick();
        timer_mgr.on_tick();

        assert_eq!(mgr.c_rnti_count(), 0);
        assert_eq!(mgr.user_count(), 1);
        assert_eq!(anonymous.c_rnti(), Some(Rnti::new(Rnti::C_RNTI_START)));
        assert_eq!(known.c_rnti(), None);
        assert!(known.srb1().is_err());
        assert!(mgr.find_user_by_imsi("001010000000002").is_ok());
    }

    #[test]
    fn test_release_unknown_c_rnti() {
        let (_, mgr) = manager(UserConfig::default());
        assert_eq!(mgr.release_c_rnti(Rnti::new(0x100)), Err(LayerError::CRntiNotFound));
        assert_eq!(mgr.reset_c_rnti_timer(Rnti::new(0x100)), Err(LayerError::CRntiNotFound));
    }

    #[test]
    fn test_transfer_c_rnti() {
        let (_, mgr) = manager(UserConfig::default());
        let known = mgr.add_user().unwrap();
        known.set_id("001010000000003", "353456789012345").unwrap();
        let known_rnti = known.c_rnti().unwrap();

        let connecting = mgr.add_user().unwrap();
        let c_rnti = connecting.c_rnti().unwrap();
        let srb1 = connecting.setup_srb1().unwrap();

        mgr.transfer_c_rnti(&connecting, &known).unwrap();

        assert_eq!(known.c_rnti(), Some(c_rnti));
        assert!(Arc::ptr_eq(&known.srb1().unwrap(), &srb1));
        assert!(Arc::ptr_eq(&srb1.user().unwrap(), &known));
        assert_eq!(mgr.user_count(), 1);
        assert_eq!(mgr.c_rnti_count(), 1);
        assert_eq!(mgr.release_c_rnti(known_rnti), Err(LayerError::CRntiNotFound));
        assert!(Arc::ptr_eq(&mgr.find_user_by_c_rnti(c_rnti).unwrap(), &known));
    }

    #[test]
    fn test_del_user_variants() {
        let (timer_mgr, mgr) = manager(UserConfig::default());
        let a = mgr.add_user().unwrap();
        let b = mgr.add_user().unwrap();
        let c = mgr.add_user().unwrap();
        a.set_id("001010000000004", "353456789012345").unwrap();
        c.setup_drb(1).unwrap();

        mgr.del_user_by_imsi("001010000000004").unwrap();
        mgr.del_user_by_c_rnti(b.c_rnti().unwrap()).unwrap();
        mgr.del_user(&c).unwrap();

        assert_eq!(mgr.user_count(), 0);
        assert_eq!(mgr.c_rnti_count(), 0);
        assert!(c.drb(1).is_err());
        assert_eq!(mgr.del_user(&c), Err(LayerError::UserNotFound));
        assert_eq!(timer_mgr.active_timers(), 0);
        mgr.print_all_users();
    }
}
