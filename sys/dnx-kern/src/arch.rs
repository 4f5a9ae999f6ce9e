// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! Unlike a kernel that runs tasks directly, this crate's only
//! architecture-dependent concern is the [`crate::sched::Scheduler`]
//! implementation itself, and that is supplied by whatever embeds this
//! crate — a concrete board port provides its own, reached purely through
//! the trait. The one thing that lives here is `sim`, a host-only
//! `Scheduler` built on `std::sync` primitives, so the rest of the kernel
//! can be exercised end-to-end without real hardware or a real scheduler.
//!
//! `sim` is only compiled when this crate is built hosted (`target_os !=
//! "none"`), mirroring the same `cfg` this crate's `no_std` attribute uses.

#[cfg(not(target_os = "none"))]
pub mod sim;
