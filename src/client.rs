//! The blocking execution profile: a background receive loop plus command calls
//! that suspend the caller until the response is classified.
//!
//! The engine sits in a static behind a blocking mutex so the receive loop and
//! any number of producer tasks can share it. Producers contend for a fair
//! command-lock semaphore, so commands go out one at a time and in arrival
//! order; completion travels back over a signal that the receive loop fires
//! when the response matcher classifies the pending command.

use core::cell::RefCell;

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::semaphore::{FairSemaphore, Semaphore};
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer, WithTimeout};
use heapless::String;

use crate::RawMutex;
use crate::engine::AtEngine;
use crate::response::{AtOutcome, RECV_BUF_SIZE};
use crate::transport::Transport;
use crate::work::AtWork;

/// An engine shared between the receive loop and command-issuing tasks.
pub type SharedEngine<T> = Mutex<RawMutex, RefCell<AtEngine<T>>>;

/// Producer tasks that may simultaneously wait for the command channel.
const MAX_WAITERS: usize = 4;
/// Default expectation when the caller does not provide one.
const DEFAULT_MATCHER: &str = "OK";
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);
/// Cadence of the receive loop.
const POLL_PERIOD: Duration = Duration::from_millis(1);
/// Cadence of the wait for a quiet channel before a synchronous command.
const QUIET_WAIT: Duration = Duration::from_millis(10);
/// Margin on top of the command timeout before the completion wait gives up;
/// the engine classifies the timeout itself, this is only a backstop.
const TIMEOUT_GRACE: Duration = Duration::from_millis(100);
/// Bound on waiting for the command lock when running a script work.
const WORK_LOCK_TIMEOUT: Duration = Duration::from_secs(150);

/// Outcome of a synchronous command plus a copy of the response buffer taken at
/// completion.
pub struct SyncResponse {
    pub outcome: AtOutcome,
    pub recv: String<RECV_BUF_SIZE>,
}

impl SyncResponse {
    fn bare(outcome: AtOutcome) -> Self {
        Self {
            outcome,
            recv: String::new(),
        }
    }
}

pub struct AtClient<T: Transport + 'static> {
    engine: &'static SharedEngine<T>,
    cmd_lock: FairSemaphore<RawMutex, MAX_WAITERS>,
    completed: Signal<RawMutex, (AtOutcome, String<RECV_BUF_SIZE>)>,
}

impl<T: Transport> AtClient<T> {
    pub fn new(engine: &'static SharedEngine<T>) -> Self {
        Self {
            engine,
            cmd_lock: FairSemaphore::new(1),
            completed: Signal::new(),
        }
    }

    /// Runs an operation on the shared engine, e.g. a queue submission.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut AtEngine<T>) -> R) -> R {
        self.engine.lock(|engine| f(&mut engine.borrow_mut()))
    }

    /// The receive loop. Spawn this in its own task; every command call blocks
    /// on its progress.
    pub async fn run(&self) -> ! {
        loop {
            let completed = self.engine.lock(|engine| {
                let mut engine = engine.borrow_mut();
                engine.poll();
                engine.take_direct_outcome()
            });
            if let Some(completed) = completed {
                self.completed.signal(completed);
            }
            Timer::after(POLL_PERIOD).await;
        }
    }

    /// Sends `cmd` and waits for `OK` with the default 3 s budget.
    pub async fn do_cmd(&self, cmd: &str) -> SyncResponse {
        self.do_cmd_opts(cmd, DEFAULT_MATCHER, DEFAULT_TIMEOUT).await
    }

    /// Sends `cmd` and waits until the response contains `matcher`, the modem
    /// answers `ERROR`, or `timeout` elapses. Failing to take the command lock
    /// within `timeout` also reports `Timeout`.
    pub async fn do_cmd_opts(&self, cmd: &str, matcher: &str, timeout: Duration) -> SyncResponse {
        let Ok(Ok(_releaser)) = self.cmd_lock.acquire(1).with_timeout(timeout).await else {
            return SyncResponse::bare(AtOutcome::Timeout);
        };

        // Never cut into an unfinished URC line or a queued conversation.
        while self.engine.lock(|engine| {
            let engine = engine.borrow();
            engine.urc_pending() || !engine.channel_free()
        }) {
            Timer::after(QUIET_WAIT).await;
        }

        self.completed.reset();
        let started =
            self.engine.lock(|engine| engine.borrow_mut().start_direct(cmd, matcher, timeout));
        if started.is_err() {
            return SyncResponse::bare(AtOutcome::Error);
        }

        match select(
            self.completed.wait(),
            Timer::after(timeout + TIMEOUT_GRACE),
        )
        .await
        {
            Either::First((outcome, recv)) => SyncResponse { outcome, recv },
            Either::Second(()) => {
                // The backstop fired first: withdraw the expectation and hand
                // back whatever accumulated.
                let recv = self.engine.lock(|engine| {
                    let mut engine = engine.borrow_mut();
                    engine.cancel_direct();
                    engine.recv_copy()
                });
                SyncResponse {
                    outcome: AtOutcome::Timeout,
                    recv,
                }
            }
        }
    }

    /// Queues `work` while holding the command lock and waits for it to finish.
    ///
    /// `done` is the completion signal the engine fires when the script releases
    /// the channel; it lives in a static owned by the caller.
    pub async fn do_work(
        &self,
        param: usize,
        work: AtWork,
        done: &'static Signal<RawMutex, AtOutcome>,
    ) -> crate::Result<AtOutcome> {
        let Ok(Ok(_releaser)) = self.cmd_lock.acquire(1).with_timeout(WORK_LOCK_TIMEOUT).await
        else {
            return Ok(AtOutcome::Timeout);
        };
        done.reset();
        self.engine.lock(|engine| engine.borrow_mut().submit_work_notified(param, work, done))?;
        Ok(done.wait().await)
    }
}
