// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring-buffered kernel log.
//!
//! Every line is timestamped with the millisecond uptime at the time it was
//! written, then appended to a fixed-capacity circular byte queue backed by
//! [`dnx_circq::CircQ`]. When a new line would not fit, the oldest bytes are
//! dropped until it does — a log is a rolling window, not a queue that
//! should ever block or fail the caller.

use dnx_circq::CircQ;

use crate::config::KLOG_MAX_LINE;

/// The kernel log singleton. A concrete kernel constructs one with a
/// `'static mut` byte buffer sized `config::KLOG_SIZE` obtained at boot.
pub struct KernelLog<'s> {
    queue: spin::Mutex<CircQ<'s>>,
}

impl<'s> KernelLog<'s> {
    pub fn new(backing: &'s mut [u8]) -> Self {
        KernelLog {
            queue: spin::Mutex::new(CircQ::new(backing)),
        }
    }

    /// Appends one line, prefixed with `[<uptime_ms>] `. Lines longer than
    /// `KLOG_MAX_LINE` (after the prefix) are truncated. Never blocks and
    /// never fails: if the buffer is full, the oldest bytes are discarded
    /// to make room.
    pub fn write_line(&self, uptime_ms: u64, message: &str) {
        let mut line: heapless::String<KLOG_MAX_LINE> = heapless::String::new();
        let _ = core::fmt::write(&mut line, format_args!("[{uptime_ms}] "));
        let room = KLOG_MAX_LINE.saturating_sub(line.len() + 1);
        let _ = line.push_str(&message[..message.len().min(room)]);
        let _ = line.push('\n');

        let mut queue = self.queue.lock();
        let needed = line.len();
        while queue.free() < needed && !queue.is_empty() {
            let _ = queue.dequeue1();
        }
        let _ = queue.enqueue(line.as_bytes());
    }

    /// Drains up to `out.len()` bytes of the oldest buffered log data into
    /// `out`, returning how many were copied. This is destructive: bytes
    /// returned are removed from the log, matching a streaming syslog read
    /// rather than a repeatable snapshot.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let mut queue = self.queue.lock();
        let mut copied = 0;
        while copied < out.len() {
            match queue.dequeue1() {
                Ok(byte) => {
                    out[copied] = byte;
                    copied += 1;
                }
                Err(_) => break,
            }
        }
        copied
    }

    /// Discards everything currently buffered.
    pub fn clear(&self) {
        let mut queue = self.queue.lock();
        while queue.dequeue1().is_ok() {}
    }

    pub fn available_bytes(&self) -> usize {
        self.queue.lock().available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_the_line() {
        let mut backing = [0u8; 128];
        let log = KernelLog::new(&mut backing);
        log.write_line(1234, "booted");
        let mut out = [0u8; 64];
        let n = log.read(&mut out);
        let text = core::str::from_utf8(&out[..n]).unwrap();
        assert_eq!(text, "[1234] booted\n");
    }

    #[test]
    fn clear_empties_the_log() {
        let mut backing = [0u8; 64];
        let log = KernelLog::new(&mut backing);
        log.write_line(0, "hello");
        log.clear();
        assert_eq!(log.available_bytes(), 0);
    }

    #[test]
    fn oldest_lines_are_dropped_when_full() {
        let mut backing = [0u8; 16];
        let log = KernelLog::new(&mut backing);
        log.write_line(1, "aaaaaaaaaaaaaaaaaaaa");
        log.write_line(2, "b");
        let mut out = [0u8; 16];
        let n = log.read(&mut out);
        let text = core::str::from_utf8(&out[..n]).unwrap();
        assert!(text.ends_with("b\n"));
    }
}
