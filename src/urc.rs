//! Unsolicited Result Code recognition.
//!
//! The recognizer assembles newline-delimited lines out of the ingress stream and
//! dispatches each one to the first handler whose prefix matches. It runs on every
//! poll, also while a command conversation is in flight, so URCs are never lost to
//! a busy channel.

#[cfg(feature = "defmt")]
use defmt::debug;
use embassy_time::{Duration, Instant};
use heapless::Vec;
#[cfg(not(feature = "defmt"))]
use log::debug;

/// Capacity of the URC line accumulator. Lines that grow past it are dropped.
pub const URC_BUF_SIZE: usize = 128;

/// Shortest committed line that is still dispatched; `OK`/`ERROR` echoes and bare
/// CRLF pairs fall under it.
const URC_MIN_LINE: usize = 3;

pub type UrcHandler = fn(&str);

/// One row of the URC dispatch table. The first matching prefix wins.
pub struct UrcEntry {
    pub prefix: &'static str,
    pub handler: UrcHandler,
}

pub(crate) struct UrcRecognizer {
    buf: Vec<u8, URC_BUF_SIZE>,
    timer: Instant,
    idle_timeout: Duration,
}

impl UrcRecognizer {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            buf: Vec::new(),
            timer: Instant::MIN,
            idle_timeout,
        }
    }

    /// Time the last URC byte arrived, used by the engine's busy check.
    pub fn last_activity(&self) -> Instant {
        self.timer
    }

    /// True while a partial line sits in the accumulator.
    pub fn pending(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Feeds one ingress chunk.
    ///
    /// An empty chunk only checks the stall guard: a partial line that has been
    /// idle longer than the configured timeout is discarded without dispatch.
    /// `quiet` is true when no command is waiting; only then are unmatched lines
    /// forwarded to the log (boot banners and echo).
    pub fn ingest(&mut self, bytes: &[u8], table: &[UrcEntry], quiet: bool) {
        if bytes.is_empty() {
            if !self.buf.is_empty() && self.timer.elapsed() > self.idle_timeout {
                debug!("urc recv timeout => {}", self.text());
                self.buf.clear();
            }
            return;
        }
        self.timer = Instant::now();
        for &c in bytes {
            if c == b'\r' || c == b'\n' {
                if self.buf.len() >= URC_MIN_LINE {
                    self.dispatch(table, quiet);
                }
                self.buf.clear();
            } else {
                let _ = self.buf.push(c);
                if self.buf.is_full() {
                    // Overflow drops the whole line.
                    self.buf.clear();
                }
            }
        }
    }

    fn dispatch(&self, table: &[UrcEntry], quiet: bool) {
        // Lines that are not valid UTF-8 cannot be matched and are dropped.
        let Ok(line) = core::str::from_utf8(&self.buf) else {
            return;
        };
        for entry in table {
            if !entry.prefix.is_empty() && line.starts_with(entry.prefix) {
                (entry.handler)(line);
                debug!("<= {}", line);
                return;
            }
        }
        if quiet {
            debug!("{}", line);
        }
    }

    fn text(&self) -> &str {
        core::str::from_utf8(&self.buf).unwrap_or_default()
    }
}
