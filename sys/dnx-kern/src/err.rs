// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! This module is designed around the idea that kernel code spends too much
//! time handling and recording errors, and we ought to be able to separate
//! that concern using `Result`.

use dnx_abi::ErrorKind;

/// The error type every kernel-internal operation returns.
///
/// This mirrors the user/fatal split of the original `UserError`: a
/// `Recoverable` condition is caused by something the calling process did
/// (bad path, missing file, exhausted resource) and is simply handed back
/// to it as an `ErrorKind`. A `Fatal` condition means an invariant the
/// kernel itself is responsible for has been violated (double-free with a
/// mismatched purpose tag, a resource header with a forged self-pointer, an
/// unreachable dispatch arm) and must never reach user space: the syscall
/// dispatcher converts it into a call to [`crate::panic::die`] before a
/// reply is ever written.
#[derive(Clone, Debug)]
pub enum KernelError {
    Recoverable(ErrorKind),
    Fatal(&'static str),
}

impl KernelError {
    pub fn recoverable(kind: ErrorKind) -> Self {
        KernelError::Recoverable(kind)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, KernelError::Fatal(_))
    }
}

impl From<ErrorKind> for KernelError {
    fn from(kind: ErrorKind) -> Self {
        KernelError::Recoverable(kind)
    }
}

pub type KResult<T> = Result<T, KernelError>;

/// Converts a `KernelError` that has already been confirmed recoverable
/// into the wire-level `ErrorKind`, dying on a logic bug if it wasn't.
///
/// Used at the syscall boundary, where by construction every error that
/// survives to this point must be recoverable — `Fatal` errors are
/// intercepted and turned into a `panic::die` call earlier in the
/// dispatch path (see `syscall::Dispatcher::service_one`).
pub fn expect_recoverable(err: KernelError) -> ErrorKind {
    match err {
        KernelError::Recoverable(kind) => kind,
        KernelError::Fatal(msg) => crate::panic::die(msg),
    }
}
