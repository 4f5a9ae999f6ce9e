// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel panic persistence.
//!
//! A panic descriptor lives in a memory region that survives a warm reset
//! (on real hardware, a `.noinit`-style linker section; here, a plain
//! `static` protected by the same mutex as everything else, since there is
//! no reset to survive on the host). It carries two distinct "validity
//! word" constants so that boot code can tell a genuine panic record from
//! uninitialized memory — lifted directly from the original kernel panic
//! descriptor's `valid1`/`valid2` fields.
//!
//! This module defines two escape hatches from ordinary kernel control
//! flow:
//!
//! - [`die`] is called on an internal invariant violation (bad resource
//!   tag, double-free with a mismatched purpose, unreachable dispatch arm).
//!   It is never reached because of anything a process did.
//! - [`record`] is called by the real `#[panic_handler]` (wired up by a
//!   board port; this crate does not itself bind one, matching its
//!   `no_std`-only-on-bare-metal cfg) and by `die`, and simply fills in the
//!   descriptor without halting, so it stays unit-testable.

use heapless::String;

use crate::config::MAX_NAME_LEN;

/// First validity word. Lifted verbatim from the original kernel panic
/// descriptor so that a debugger dump of kernel memory recognizes this
/// layout.
pub const VALID1: u32 = 0x7C63_EE8E;
/// Second validity word.
pub const VALID2: u32 = 0xCF4C_5484;

const CAUSE_LEN: usize = 64;

struct Descriptor {
    valid1: u32,
    valid2: u32,
    cause: String<CAUSE_LEN>,
    task_name: String<MAX_NAME_LEN>,
}

/// Report handed back across the `kernel_panic_info` syscall once a valid
/// descriptor has been found at boot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PanicReport {
    pub cause: String<CAUSE_LEN>,
    pub task_name: String<MAX_NAME_LEN>,
}

static DESCRIPTOR: spin::Mutex<Option<Descriptor>> = spin::Mutex::new(None);

/// Fills in the panic descriptor with a cause and the name of the
/// offending task, without halting or resetting. Truncates either string
/// to fit its fixed-capacity field, matching the original's "truncate if
/// the buffer fills" epitaph behavior.
pub fn record(cause: &str, task_name: &str) {
    let mut cause_buf = String::new();
    let _ = cause_buf.push_str(&cause[..cause.len().min(CAUSE_LEN)]);
    let mut name_buf = String::new();
    let _ = name_buf.push_str(&task_name[..task_name.len().min(MAX_NAME_LEN)]);

    *DESCRIPTOR.lock() = Some(Descriptor {
        valid1: VALID1,
        valid2: VALID2,
        cause: cause_buf,
        task_name: name_buf,
    });
}

/// Boot-time check for a panic descriptor left behind by a prior reset. If
/// both validity words match, returns the recorded cause and task name.
/// This backs the `kernel_panic_info` syscall.
pub fn last_panic() -> Option<PanicReport> {
    let guard = DESCRIPTOR.lock();
    let d = guard.as_ref()?;
    if d.valid1 == VALID1 && d.valid2 == VALID2 {
        Some(PanicReport {
            cause: d.cause.clone(),
            task_name: d.task_name.clone(),
        })
    } else {
        None
    }
}

/// Called on an internal kernel invariant violation. Records the descriptor
/// against the pseudo-task name `"kernel"` and halts.
///
/// This is the one place in the kernel allowed to diverge in response to
/// something that is not a process's fault. It must never be reached
/// because of a user-caused condition; those are `ErrorKind`s, not panics.
#[inline(never)]
pub fn die(msg: &str) -> ! {
    record(msg, "kernel");
    halt()
}

/// Records the descriptor against a specific task and halts. Used by the
/// syscall dispatcher and process model when a fault originates in a known
/// task context (e.g. a stack-overflow hook).
#[inline(never)]
pub fn die_in_task(msg: &str, task_name: &str) -> ! {
    record(msg, task_name);
    halt()
}

#[cfg(target_os = "none")]
fn halt() -> ! {
    loop {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(not(target_os = "none"))]
fn halt() -> ! {
    panic!("kernel died; see panic::last_panic() for the recorded descriptor");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_round_trips_through_both_validity_words() {
        record("stack overflow", "worker");
        let report = last_panic().expect("descriptor should be valid");
        assert_eq!(report.cause.as_str(), "stack overflow");
        assert_eq!(report.task_name.as_str(), "worker");
    }

    #[test]
    fn fresh_descriptor_has_no_panic_on_boot() {
        *DESCRIPTOR.lock() = None;
        assert!(last_panic().is_none());
    }
}
