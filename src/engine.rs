//! The dispatch and matching engine.
//!
//! One poll cycle reads available bytes from the transport, offers them to the
//! URC recognizer and the response matcher in that order, then advances the
//! work-item dispatcher. The engine guarantees at most one conversation in
//! flight while keeping URC reception live, and delivers exactly one outcome
//! per submitted work item.
//!
//! The engine itself never blocks; it is the common core of both execution
//! profiles. Cooperative integrations own an [`AtEngine`] and call [`AtEngine::poll`]
//! from their main loop, the blocking profile wraps it in [`crate::client::AtClient`].

use core::str::FromStr;
#[cfg(feature = "defmt")]
use defmt::debug;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant};
use heapless::{String, Vec};
#[cfg(not(feature = "defmt"))]
use log::debug;

use crate::RawMutex;
use crate::error::Error;
use crate::response::{AtCallback, AtOutcome, CmdReport, RECV_BUF_SIZE, RespBuffer};
use crate::transport::Transport;
use crate::urc::{UrcEntry, UrcRecognizer};
use crate::work::{AtCmd, AtEnv, AtWork, Scratch, WorkHandle, WorkKind, WorkPool};

/// Size of the stack buffer one transport read fills.
const INGRESS_CHUNK: usize = 32;
/// How long after the last URC byte the channel still counts as busy.
const URC_ACTIVE_WINDOW: Duration = Duration::from_secs(2);
/// Longest matcher a synchronous command may install.
const MATCHER_LEN: usize = 32;

/// Engine configuration, captured at construction.
pub struct AtConfig {
    /// URC dispatch table; the first entry whose prefix matches a line wins.
    pub urc_table: &'static [UrcEntry],
    /// A partial URC line idle longer than this is discarded.
    pub urc_idle_timeout: Duration,
    /// Called when a conversation starts.
    pub before_at: Option<fn()>,
    /// Called when a conversation ends, whatever the outcome.
    pub after_at: Option<fn()>,
    /// Called when a conversation ends in `Error` or `Timeout`.
    pub on_error: Option<fn()>,
}

impl Default for AtConfig {
    fn default() -> Self {
        Self {
            urc_table: &[],
            urc_idle_timeout: Duration::from_millis(100),
            before_at: None,
            after_at: None,
            on_error: None,
        }
    }
}

/// Expectation installed by the blocking shell's synchronous command path.
struct DirectCmd {
    matcher: String<MATCHER_LEN>,
    timeout: Duration,
}

/// The per-transport engine. See the module documentation.
pub struct AtEngine<T: Transport> {
    transport: T,
    cfg: AtConfig,
    rcv: RespBuffer,
    urc: UrcRecognizer,
    pool: WorkPool,
    scratch: Scratch,
    resp_timer: Instant,
    suspend: bool,
    direct: Option<DirectCmd>,
    direct_outcome: Option<(AtOutcome, String<RECV_BUF_SIZE>)>,
}

impl<T: Transport> AtEngine<T> {
    pub fn new(transport: T, cfg: AtConfig) -> Self {
        let urc = UrcRecognizer::new(cfg.urc_idle_timeout);
        Self {
            transport,
            cfg,
            rcv: RespBuffer::new(),
            urc,
            pool: WorkPool::new(),
            scratch: Scratch::default(),
            resp_timer: Instant::now(),
            suspend: false,
            direct: None,
            direct_outcome: None,
        }
    }

    /// Access to the underlying transport, e.g. for power or flow control lines.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// One ingress plus dispatcher cycle. Cooperative integrations call this
    /// from their main loop; re-entering it from a callback is forbidden.
    pub fn poll(&mut self) {
        let mut buf = [0u8; INGRESS_CHUNK];
        let len = self.transport.read(&mut buf);
        let quiet = !self.waiting();
        self.urc.ingest(&buf[..len], self.cfg.urc_table, quiet);
        self.resp_ingest(&buf[..len]);
        self.dispatch();
    }

    /// Queues a one-line command; success means `OK` within the default retry
    /// policy. Fails immediately when the item pool is exhausted.
    pub fn submit_single_line(
        &mut self,
        cb: Option<AtCallback>,
        line: &str,
    ) -> crate::Result<WorkHandle> {
        let line = String::from_str(line).map_err(|_| Error::BufferTooSmall)?;
        self.pool.submit(WorkKind::SingleLine { line, cb }, 0, None)
    }

    /// Queues a batch of commands sent back to back, each acknowledged by `OK`.
    pub fn submit_multi_line(
        &mut self,
        cb: Option<AtCallback>,
        lines: &[&str],
    ) -> crate::Result<WorkHandle> {
        let mut batch = Vec::new();
        for line in lines {
            let line = String::from_str(line).map_err(|_| Error::BufferTooSmall)?;
            batch.push(line).map_err(|_| Error::BufferTooSmall)?;
        }
        self.pool.submit(WorkKind::MultiLine { lines: batch, cb }, 0, None)
    }

    /// Queues a command described by `cmd`; `param` is echoed in the completion
    /// report.
    pub fn submit_cmd(&mut self, param: usize, cmd: &'static AtCmd) -> crate::Result<WorkHandle> {
        self.pool.submit(WorkKind::Command(cmd), param, None)
    }

    /// Queues a script work. The script owns the channel until it reports done.
    pub fn submit_work(&mut self, param: usize, work: AtWork) -> crate::Result<WorkHandle> {
        self.pool.submit(WorkKind::Script(work), param, None)
    }

    pub(crate) fn submit_work_notified(
        &mut self,
        param: usize,
        work: AtWork,
        done: &'static Signal<RawMutex, AtOutcome>,
    ) -> crate::Result<WorkHandle> {
        self.pool.submit(WorkKind::Script(work), param, Some(done))
    }

    /// Asks the engine to drain the current conversation with an `Abort`
    /// outcome. Takes effect on the next poll; [`Self::resume`] re-opens the
    /// channel.
    pub fn suspend(&mut self) {
        self.suspend = true;
    }

    pub fn resume(&mut self) {
        self.suspend = false;
    }

    /// Force-completes one item. A running item is retired at the end of its
    /// next advance, a queued one the moment it would have started.
    pub fn abort_work(&mut self, handle: WorkHandle) {
        self.pool.abort(handle);
    }

    /// True while the channel has work: an item is current or queued, a
    /// synchronous command waits, or URC bytes arrived within the last 2 s.
    pub fn busy(&self) -> bool {
        self.waiting()
            || !self.pool.ready_is_empty()
            || self.urc.last_activity().elapsed() < URC_ACTIVE_WINDOW
    }

    fn waiting(&self) -> bool {
        self.direct.is_some() || self.pool.current().is_some()
    }

    /// Feeds the response accumulator and classifies a pending synchronous
    /// command. Runs on every poll so timeouts and aborts fire without traffic.
    fn resp_ingest(&mut self, chunk: &[u8]) {
        if !self.waiting() {
            return;
        }
        self.rcv.ingest(chunk);
        self.classify_direct();
    }

    fn classify_direct(&mut self) {
        let Some(direct) = &self.direct else {
            return;
        };
        let outcome = if self.rcv.find(direct.matcher.as_str()) {
            AtOutcome::Ok
        } else if self.rcv.find("ERROR") {
            AtOutcome::Error
        } else if self.resp_timer.elapsed() > direct.timeout {
            AtOutcome::Timeout
        } else if self.suspend {
            AtOutcome::Abort
        } else {
            return;
        };
        debug!("<- {}", self.rcv.text());
        if matches!(outcome, AtOutcome::Error | AtOutcome::Timeout)
            && let Some(hook) = self.cfg.on_error
        {
            hook();
        }
        if let Some(hook) = self.cfg.after_at {
            hook();
        }
        self.direct = None;
        // Snapshot the buffer now; a queued item may clear it before the caller
        // wakes up.
        self.direct_outcome = Some((outcome, self.recv_copy()));
    }

    /// Advances the work queue by one step.
    fn dispatch(&mut self) {
        if self.direct.is_some() {
            // A synchronous command owns the channel.
            return;
        }
        let slot = match self.pool.current() {
            Some(slot) => slot,
            None => {
                let Some(slot) = self.pool.start_next() else {
                    return;
                };
                self.scratch = Scratch::default();
                self.rcv.clear();
                self.resp_timer = Instant::now();
                if let Some(hook) = self.cfg.before_at {
                    hook();
                }
                slot
            }
        };

        let item = self.pool.item_mut(slot);
        let aborted = item.abort || self.suspend;
        let param = item.param;
        let mut env = AtEnv {
            vars: &mut self.scratch,
            param,
            tx: &mut self.transport,
            rcv: &mut self.rcv,
            timer: &mut self.resp_timer,
            aborted,
        };
        let finished = item.advance(&mut env);

        if let Some(outcome) = finished {
            self.complete(slot, outcome);
            self.retire(slot);
        } else if self.pool.item_mut(slot).abort {
            self.complete(slot, AtOutcome::Abort);
            self.retire(slot);
        }
    }

    /// Delivers the outcome for `slot`. The item's `done` latch makes this fire
    /// the callback and the notify signal exactly once.
    fn complete(&mut self, slot: u8, outcome: AtOutcome) {
        let item = self.pool.item_mut(slot);
        if item.done {
            return;
        }
        item.done = true;
        let cb = item.callback();
        let notify = item.notify;
        let param = item.param;

        debug!("<- {}", self.rcv.text());
        if matches!(outcome, AtOutcome::Error | AtOutcome::Timeout)
            && let Some(hook) = self.cfg.on_error
        {
            hook();
        }
        if let Some(cb) = cb {
            cb(&CmdReport {
                outcome,
                recv: self.rcv.as_bytes(),
                param,
            });
        }
        if let Some(signal) = notify {
            signal.signal(outcome);
        }
    }

    fn retire(&mut self, slot: u8) {
        self.pool.retire(slot);
        if let Some(hook) = self.cfg.after_at {
            hook();
        }
    }

    /// Writes `cmd` and installs the expectation the receive loop classifies
    /// against. Blocking-shell path; the caller must hold the command lock.
    pub(crate) fn start_direct(
        &mut self,
        cmd: &str,
        matcher: &str,
        timeout: Duration,
    ) -> crate::Result<()> {
        let matcher = String::from_str(matcher).map_err(|_| Error::BufferTooSmall)?;
        if let Some(hook) = self.cfg.before_at {
            hook();
        }
        self.rcv.clear();
        self.resp_timer = Instant::now();
        self.direct_outcome = None;
        self.transport.write(cmd.as_bytes());
        self.transport.write(b"\r\n");
        debug!("-> {}", cmd);
        self.direct = Some(DirectCmd { matcher, timeout });
        Ok(())
    }

    pub(crate) fn take_direct_outcome(&mut self) -> Option<(AtOutcome, String<RECV_BUF_SIZE>)> {
        self.direct_outcome.take()
    }

    pub(crate) fn cancel_direct(&mut self) {
        self.direct = None;
        self.direct_outcome = None;
    }

    pub(crate) fn urc_pending(&self) -> bool {
        self.urc.pending()
    }

    /// True when nothing owns or waits for the channel.
    pub(crate) fn channel_free(&self) -> bool {
        !self.waiting() && self.pool.ready_is_empty()
    }

    pub(crate) fn recv_copy(&self) -> String<RECV_BUF_SIZE> {
        String::from_str(self.rcv.text()).unwrap_or_default()
    }
}
