//! Work items: the queued units of an AT conversation.
//!
//! Items live in a fixed arena and move between an idle and a ready index queue;
//! the dispatcher advances at most one item at a time. Each item type carries its
//! own small state machine which is stepped once per poll, communicating with the
//! modem through the capability surface in [`AtEnv`].

#[cfg(feature = "defmt")]
use defmt::debug;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant};
use heapless::{Deque, String, Vec};
#[cfg(not(feature = "defmt"))]
use log::debug;

use crate::RawMutex;
use crate::error::Error;
use crate::response::{AtCallback, AtOutcome, RespBuffer};
use crate::transport::Transport;

/// Number of pre-allocated work items; submissions fail once all are taken.
pub const WORK_POOL_SIZE: usize = 10;
/// Longest command line a single- or multi-line item can carry.
pub const MAX_CMD_LEN: usize = 128;
/// Most commands in one multi-line batch.
pub const MULTILINE_MAX: usize = 8;

/// Quiet period after an `ERROR` reply before the next retry send.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);
const SINGLELINE_RETRY: u8 = 3;
const MULTILINE_RETRY: u8 = 3;
const MULTILINE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Scratch slots preserved across polls of the same item. The command state
/// machines use `i` for the attempt counter and `state` for their sub-state;
/// script works are free to use all three for their own bookkeeping.
#[derive(Default)]
pub struct Scratch {
    pub i: u8,
    pub j: u8,
    pub state: u8,
}

/// What a script work reports back to the dispatcher after each poll.
pub enum WorkStep {
    /// Keep polling; the script still owns the channel.
    Pending,
    /// Release the channel with the given outcome.
    Done(AtOutcome),
}

/// A scripted multi-step routine, polled until it reports [`WorkStep::Done`].
pub type AtWork = fn(&mut AtEnv) -> WorkStep;

/// A command descriptor: how to send, what success looks like, and the retry
/// policy. Descriptors are read-only and typically live in statics.
pub struct AtCmd {
    /// Writes the command bytes, usually via [`AtEnv::send_line`].
    pub sender: fn(&mut AtEnv),
    /// Substring whose presence in the response means success, e.g. `"OK"` or `"> "`.
    pub matcher: &'static str,
    pub cb: Option<AtCallback>,
    /// Maximum send attempts on `ERROR` or timeout, at least 1.
    pub retry: u8,
    /// Per-attempt budget.
    pub timeout: Duration,
}

/// Capability surface handed to script works and command senders.
///
/// It deliberately exposes only the conversation-side of the engine: the
/// response buffer, the per-attempt timer and the transmit path. Queue and URC
/// state stay out of reach.
pub struct AtEnv<'a> {
    /// Scratch counters reserved for the running item.
    pub vars: &'a mut Scratch,
    /// The opaque word given at submission.
    pub param: usize,
    pub(crate) tx: &'a mut dyn Transport,
    pub(crate) rcv: &'a mut RespBuffer,
    pub(crate) timer: &'a mut Instant,
    pub(crate) aborted: bool,
}

impl AtEnv<'_> {
    /// Clears the response buffer, then sends `line` followed by CRLF.
    pub fn send_line(&mut self, line: &str) {
        self.rcv.clear();
        self.tx.write(line.as_bytes());
        self.tx.write(b"\r\n");
        debug!("-> {}", line);
    }

    /// Sends raw bytes without CRLF framing, for payload phases such as an SMS
    /// body after the `"> "` prompt.
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.tx.write(bytes);
    }

    /// True when the response buffer contains `needle`.
    pub fn find(&self, needle: &str) -> bool {
        self.rcv.find(needle)
    }

    pub fn recv(&self) -> &[u8] {
        self.rcv.as_bytes()
    }

    pub fn recv_len(&self) -> usize {
        self.rcv.len()
    }

    pub fn recv_clear(&mut self) {
        self.rcv.clear();
    }

    /// Re-arms the per-attempt timer.
    pub fn reset_timer(&mut self) {
        *self.timer = Instant::now();
    }

    /// True when more than `timeout` elapsed since the last [`Self::reset_timer`].
    pub fn is_timeout(&self, timeout: Duration) -> bool {
        self.timer.elapsed() > timeout
    }

    /// True when this item was aborted or the engine is suspended. Script works
    /// should release the channel promptly once this turns true.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }
}

/// Names a submitted work item until it completes. A handle that outlives its
/// item is ignored; the generation counter keeps it from touching a successor
/// occupant of the recycled slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WorkHandle {
    pub(crate) slot: u8,
    pub(crate) seq: u8,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WorkState {
    Idle,
    Wait,
    Exec,
}

pub(crate) enum WorkKind {
    Vacant,
    Script(AtWork),
    Command(&'static AtCmd),
    SingleLine {
        line: String<MAX_CMD_LEN>,
        cb: Option<AtCallback>,
    },
    MultiLine {
        lines: Vec<String<MAX_CMD_LEN>, MULTILINE_MAX>,
        cb: Option<AtCallback>,
    },
}

pub(crate) struct WorkItem {
    pub state: WorkState,
    pub kind: WorkKind,
    pub param: usize,
    pub abort: bool,
    /// Completion latch: the callback and notify signal fire exactly once.
    pub done: bool,
    pub seq: u8,
    pub notify: Option<&'static Signal<RawMutex, AtOutcome>>,
}

impl WorkItem {
    const fn vacant() -> Self {
        Self {
            state: WorkState::Idle,
            kind: WorkKind::Vacant,
            param: 0,
            abort: false,
            done: false,
            seq: 0,
            notify: None,
        }
    }

    pub fn callback(&self) -> Option<AtCallback> {
        match &self.kind {
            WorkKind::Command(cmd) => cmd.cb,
            WorkKind::SingleLine { cb, .. } | WorkKind::MultiLine { cb, .. } => *cb,
            WorkKind::Vacant | WorkKind::Script(_) => None,
        }
    }

    /// Steps the item's state machine once. `None` keeps the item running,
    /// `Some` finishes it with the given outcome.
    pub fn advance(&mut self, env: &mut AtEnv) -> Option<AtOutcome> {
        match &self.kind {
            WorkKind::Vacant => Some(AtOutcome::Abort),
            WorkKind::Script(work) => match work(env) {
                WorkStep::Pending => None,
                WorkStep::Done(outcome) => Some(outcome),
            },
            WorkKind::Command(cmd) => step_cmd(env, cmd),
            WorkKind::SingleLine { line, .. } => step_single_line(env, line),
            WorkKind::MultiLine { lines, .. } => step_multi_line(env, lines),
        }
    }
}

/// The generic command machine: send, await, back off on `ERROR`, resend on
/// timeout, until the retry budget is spent.
fn step_cmd(env: &mut AtEnv, cmd: &AtCmd) -> Option<AtOutcome> {
    if env.is_aborted() {
        return Some(AtOutcome::Abort);
    }
    match env.vars.state {
        0 => {
            (cmd.sender)(env);
            env.recv_clear();
            env.reset_timer();
            env.vars.state = 1;
            None
        }
        1 => {
            if env.find(cmd.matcher) {
                Some(AtOutcome::Ok)
            } else if env.find("ERROR") {
                env.vars.i += 1;
                if env.vars.i >= cmd.retry {
                    Some(AtOutcome::Error)
                } else {
                    env.vars.state = 2;
                    env.reset_timer();
                    None
                }
            } else if env.is_timeout(cmd.timeout) {
                env.vars.i += 1;
                if env.vars.i >= cmd.retry {
                    Some(AtOutcome::Timeout)
                } else {
                    env.vars.state = 0;
                    None
                }
            } else {
                None
            }
        }
        2 => {
            if env.is_timeout(RETRY_BACKOFF) {
                env.vars.state = 0;
            }
            None
        }
        _ => {
            env.vars.state = 0;
            None
        }
    }
}

/// Single-line commands are the generic machine with baked-in defaults: success
/// on `OK`, three attempts, and a timeout that grows by 2 s per attempt.
fn step_single_line(env: &mut AtEnv, line: &str) -> Option<AtOutcome> {
    if env.is_aborted() {
        return Some(AtOutcome::Abort);
    }
    match env.vars.state {
        0 => {
            env.send_line(line);
            env.reset_timer();
            env.vars.state = 1;
            None
        }
        1 => {
            let timeout = Duration::from_millis(3000 + u64::from(env.vars.i) * 2000);
            if env.find("OK") {
                Some(AtOutcome::Ok)
            } else if env.find("ERROR") {
                env.vars.i += 1;
                if env.vars.i >= SINGLELINE_RETRY {
                    Some(AtOutcome::Error)
                } else {
                    env.vars.state = 2;
                    env.reset_timer();
                    None
                }
            } else if env.is_timeout(timeout) {
                env.vars.i += 1;
                if env.vars.i >= SINGLELINE_RETRY {
                    Some(AtOutcome::Timeout)
                } else {
                    env.vars.state = 0;
                    None
                }
            } else {
                None
            }
        }
        2 => {
            if env.is_timeout(RETRY_BACKOFF) {
                env.vars.state = 0;
            }
            None
        }
        _ => {
            env.vars.state = 0;
            None
        }
    }
}

/// Multi-line batches walk `lines` with `i`, retrying the current line up to
/// three times on `ERROR`; `j` is the per-line attempt counter and resets when
/// a line is acknowledged.
fn step_multi_line(env: &mut AtEnv, lines: &[String<MAX_CMD_LEN>]) -> Option<AtOutcome> {
    if env.is_aborted() {
        return Some(AtOutcome::Abort);
    }
    match env.vars.state {
        0 => {
            let Some(line) = lines.get(usize::from(env.vars.i)) else {
                return Some(AtOutcome::Ok);
            };
            env.send_line(line.as_str());
            env.reset_timer();
            env.vars.state = 1;
            None
        }
        1 => {
            if env.find("OK") {
                env.vars.i += 1;
                env.vars.j = 0;
                env.vars.state = 0;
                None
            } else if env.find("ERROR") {
                env.vars.j += 1;
                if env.vars.j >= MULTILINE_RETRY {
                    Some(AtOutcome::Error)
                } else {
                    env.vars.state = 2;
                    env.reset_timer();
                    None
                }
            } else if env.is_timeout(MULTILINE_TIMEOUT) {
                Some(AtOutcome::Timeout)
            } else {
                None
            }
        }
        2 => {
            if env.is_timeout(RETRY_BACKOFF) {
                env.vars.state = 0;
            }
            None
        }
        _ => {
            env.vars.state = 0;
            None
        }
    }
}

/// The item arena: a fixed slot array plus idle and ready index queues, so that
/// submission, scheduling and retirement are all O(1) and allocation-free.
pub(crate) struct WorkPool {
    slots: [WorkItem; WORK_POOL_SIZE],
    idle: Deque<u8, WORK_POOL_SIZE>,
    ready: Deque<u8, WORK_POOL_SIZE>,
    current: Option<u8>,
}

impl WorkPool {
    pub fn new() -> Self {
        let mut pool = Self {
            slots: [const { WorkItem::vacant() }; WORK_POOL_SIZE],
            idle: Deque::new(),
            ready: Deque::new(),
            current: None,
        };
        for slot in 0..WORK_POOL_SIZE as u8 {
            let _ = pool.idle.push_back(slot);
        }
        pool
    }

    pub fn submit(
        &mut self,
        kind: WorkKind,
        param: usize,
        notify: Option<&'static Signal<RawMutex, AtOutcome>>,
    ) -> Result<WorkHandle, Error> {
        let Some(slot) = self.idle.pop_front() else {
            return Err(Error::QueueFull);
        };
        let item = &mut self.slots[usize::from(slot)];
        item.kind = kind;
        item.param = param;
        item.state = WorkState::Wait;
        item.abort = false;
        item.done = false;
        item.notify = notify;
        item.seq = item.seq.wrapping_add(1);
        let seq = item.seq;
        // The queues have the same capacity as the arena, this cannot fail.
        let _ = self.ready.push_back(slot);
        Ok(WorkHandle { slot, seq })
    }

    pub fn abort(&mut self, handle: WorkHandle) {
        let item = &mut self.slots[usize::from(handle.slot)];
        if item.seq == handle.seq && item.state != WorkState::Idle {
            item.abort = true;
        }
    }

    pub fn current(&self) -> Option<u8> {
        self.current
    }

    pub fn ready_is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// Pops the ready head and makes it the current item.
    pub fn start_next(&mut self) -> Option<u8> {
        let slot = self.ready.pop_front()?;
        self.slots[usize::from(slot)].state = WorkState::Exec;
        self.current = Some(slot);
        Some(slot)
    }

    pub fn item_mut(&mut self, slot: u8) -> &mut WorkItem {
        &mut self.slots[usize::from(slot)]
    }

    /// Returns the item to the idle pool.
    pub fn retire(&mut self, slot: u8) {
        let item = &mut self.slots[usize::from(slot)];
        item.state = WorkState::Idle;
        item.kind = WorkKind::Vacant;
        item.notify = None;
        if self.current == Some(slot) {
            self.current = None;
        }
        let _ = self.idle.push_back(slot);
    }
}
