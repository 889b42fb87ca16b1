//! A scripted serial port, to be used in tests.

extern crate std;

use std::collections::VecDeque;
use std::string::String;
use std::vec::Vec;

use crate::transport::Transport;

/// A fake modem port driven by a script of `(expected write, canned reply)`
/// pairs. Once the write side ends with the expected bytes (given verbatim,
/// including any CRLF framing), the reply is queued on the read side. Reads
/// drain the queue in small chunks like a real UART FIFO.
pub struct FakeSerial {
    script: VecDeque<(String, String)>,
    rx: VecDeque<u8>,
    written: Vec<u8>,
}

impl FakeSerial {
    pub fn new(script: &[(&str, &str)]) -> Self {
        Self {
            script: script.iter().map(|(cmd, reply)| ((*cmd).into(), (*reply).into())).collect(),
            rx: VecDeque::new(),
            written: Vec::new(),
        }
    }

    /// Queues unsolicited bytes on the read side, as if the modem spoke up on
    /// its own.
    pub fn inject(&mut self, bytes: &str) {
        self.rx.extend(bytes.bytes());
    }

    /// Everything written to the port so far.
    pub fn written(&self) -> &str {
        core::str::from_utf8(&self.written).unwrap()
    }

    /// True once every scripted exchange has been triggered.
    pub fn script_done(&self) -> bool {
        self.script.is_empty()
    }
}

impl Transport for FakeSerial {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.rx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.rx.pop_front().unwrap();
        }
        n
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        self.written.extend_from_slice(bytes);
        if let Some((cmd, _)) = self.script.front()
            && self.written.ends_with(cmd.as_bytes())
        {
            let (_, reply) = self.script.pop_front().unwrap();
            self.rx.extend(reply.bytes());
        }
        bytes.len()
    }
}
