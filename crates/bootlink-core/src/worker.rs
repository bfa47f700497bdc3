//! Background execution of session operations.
//!
//! A [`SessionHandle`] lets a front-end run one long operation at a time on
//! a worker thread while it keeps receiving events and can cancel. A second
//! operation started while one is running fails with [`FlashError::Busy`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::{self, JoinHandle};
use tracing::debug;

use crate::error::{FlashError, Result};
use crate::executor::CancelToken;
use crate::session::Session;

struct Shared {
    session: Mutex<Session>,
    busy: AtomicBool,
    cancel: CancelToken,
}

/// Clears the busy flag when the worker finishes, panics included.
struct BusyGuard(Arc<Shared>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        let cancel = session.cancel_token();
        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(session),
                busy: AtomicBool::new(false),
                cancel,
            }),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Request cancellation of the running operation.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    /// Run `op` on a named worker thread.
    pub fn spawn<T, F>(&self, name: &str, op: F) -> Result<JoinHandle<Result<T>>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Session) -> Result<T> + Send + 'static,
    {
        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FlashError::Busy);
        }

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("bootlink-{name}"))
            .spawn(move || {
                let guard = BusyGuard(shared);
                let mut session = guard
                    .0
                    .session
                    .lock()
                    .map_err(|_| FlashError::SessionClosed)?;
                debug!("Worker started");
                op(&mut session)
            });

        spawned.map_err(|e| {
            self.shared.busy.store(false, Ordering::Release);
            FlashError::Io(e)
        })
    }

    /// Run a short operation on the calling thread.
    pub fn with_session<T>(&self, f: impl FnOnce(&mut Session) -> T) -> Result<T> {
        if self.is_busy() {
            return Err(FlashError::Busy);
        }
        match self.shared.session.try_lock() {
            Ok(mut session) => Ok(f(&mut session)),
            Err(TryLockError::WouldBlock) => Err(FlashError::Busy),
            Err(TryLockError::Poisoned(_)) => Err(FlashError::SessionClosed),
        }
    }
}
