//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Popsync.
//
// Popsync is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Popsync is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Popsync. If not, see <http://www.gnu.org/licenses/>.

//! Process signal handling for blocking network operations.
//!
//! SIGINT only sets a flag which the connection layer checks at poll
//! boundaries and after blocking reads and writes. Normally SIGINT is
//! installed with `SA_RESTART`; `allow_interrupt()` drops that flag for the
//! duration of a blocking call so the call returns `EINTR` instead of
//! silently restarting. SIGALRM is installed without `SA_RESTART` so that an
//! alarm aborts a hung `connect()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once};

use lazy_static::lazy_static;
use log::warn;
use nix::libc::c_int;
use nix::sys::signal::{
    self, pthread_sigmask, SaFlags, SigAction, SigHandler, SigSet,
    SigmaskHow, Signal,
};

use crate::support::error::Error;

static SIG_INT: AtomicBool = AtomicBool::new(false);
static INIT: Once = Once::new();

lazy_static! {
    static ref ABORT_CHECK: Mutex<Option<Box<dyn Fn() -> bool + Send>>> =
        Mutex::new(None);
}

extern "C" fn on_sigint(_: c_int) {
    SIG_INT.store(true, Ordering::SeqCst);
}

extern "C" fn on_sigalrm(_: c_int) {}

fn sigint_action(restart: bool) -> SigAction {
    SigAction::new(
        SigHandler::Handler(on_sigint),
        if restart {
            SaFlags::SA_RESTART
        } else {
            SaFlags::empty()
        },
        SigSet::empty(),
    )
}

/// Install the handlers for SIGINT, SIGALRM and SIGPIPE.
///
/// Only the first call has any effect.
pub fn init() {
    INIT.call_once(|| {
        // Safe since the handlers only touch an atomic.
        let result = unsafe {
            signal::sigaction(
                Signal::SIGPIPE,
                &SigAction::new(
                    SigHandler::SigIgn,
                    SaFlags::empty(),
                    SigSet::empty(),
                ),
            )
            .and_then(|_| {
                signal::sigaction(
                    Signal::SIGALRM,
                    &SigAction::new(
                        SigHandler::Handler(on_sigalrm),
                        SaFlags::empty(),
                        SigSet::empty(),
                    ),
                )
            })
            .and_then(|_| {
                signal::sigaction(Signal::SIGINT, &sigint_action(true))
            })
        };

        if let Err(e) = result {
            warn!("Failed to install signal handlers: {}", e);
        }
    });
}

/// Whether SIGINT has been received since the flag was last cleared.
pub fn interrupted() -> bool {
    SIG_INT.load(Ordering::SeqCst)
}

/// Clear the SIGINT flag, returning whether it was set.
pub fn take_interrupt() -> bool {
    SIG_INT.swap(false, Ordering::SeqCst)
}

/// Install the function consulted when a wait is interrupted by SIGINT.
///
/// It returns whether the current operation should be aborted. Without one,
/// every interrupt aborts.
pub fn set_abort_check(check: impl Fn() -> bool + Send + 'static) {
    if let Ok(mut slot) = ABORT_CHECK.lock() {
        *slot = Some(Box::new(check));
    }
}

/// Called after a wait observed SIGINT. Clears the flag and returns whether
/// the operation should be abandoned.
pub fn query_abort() -> bool {
    SIG_INT.store(false, Ordering::SeqCst);
    match ABORT_CHECK.lock() {
        Ok(slot) => slot.as_ref().map_or(true, |check| check()),
        Err(_) => true,
    }
}

/// While alive, SIGINT interrupts blocking system calls.
#[must_use]
pub struct AllowInterrupt(());

impl Drop for AllowInterrupt {
    fn drop(&mut self) {
        // Safe since the handler only touches an atomic.
        if let Err(e) =
            unsafe { signal::sigaction(Signal::SIGINT, &sigint_action(true)) }
        {
            warn!("Failed to restore SIGINT handler: {}", e);
        }
    }
}

pub fn allow_interrupt() -> Result<AllowInterrupt, Error> {
    init();
    // Safe since the handler only touches an atomic.
    unsafe { signal::sigaction(Signal::SIGINT, &sigint_action(false)) }?;
    Ok(AllowInterrupt(()))
}

/// While alive, SIGWINCH is blocked on the current thread.
///
/// Some platforms abort a pending `connect()` when a signal without
/// `SA_RESTART` is delivered, and terminal resizes are common during a slow
/// connect.
#[must_use]
pub struct SigwinchBlock(SigSet);

impl Drop for SigwinchBlock {
    fn drop(&mut self) {
        if let Err(e) =
            pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.0), None)
        {
            warn!("Failed to restore signal mask: {}", e);
        }
    }
}

pub fn block_sigwinch() -> Result<SigwinchBlock, Error> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGWINCH);
    let mut old = SigSet::empty();
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut old))?;
    Ok(SigwinchBlock(old))
}
