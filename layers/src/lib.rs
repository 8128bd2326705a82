//! Protocol Stack Layers Library
//!
//! This crate implements the LTE eNodeB radio link control core according to 3GPP TS 36.322:
//! the timer subsystem, per-bearer state, the RLC engine, and user bookkeeping.

pub mod timer;
pub mod rb;
pub mod rlc;
pub mod user;
pub mod user_mgr;

use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Common errors for protocol layers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayerError {
    #[error("Invalid protocol data unit: {0}")]
    InvalidPdu(String),

    #[error("No message in queue")]
    NoMessageInQueue,

    #[error("Can't reassemble SDU")]
    CantReassembleSdu,

    #[error("Timer not found")]
    TimerNotFound,

    #[error("Radio bearer already setup")]
    RbAlreadySetup,

    #[error("Radio bearer not setup")]
    RbNotSetup,

    #[error("User not found")]
    UserNotFound,

    #[error("No free C-RNTI")]
    NoFreeCRnti,

    #[error("C-RNTI not found")]
    CRntiNotFound,

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Lock a mutex, recovering the guard if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
