// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The per-core register, emulated with a thread-local.

use core::cell::Cell;
use core::ptr;

use crate::percore::PerCoreArea;

std::thread_local! {
    static PER_CORE_AREA: Cell<*const PerCoreArea> = Cell::new(ptr::null());
}

/// Reads the per-core register of the calling thread (null if unset).
pub fn read_register() -> *const PerCoreArea {
    PER_CORE_AREA.with(|r| r.get())
}

/// Sets the per-core register of the calling thread.
///
/// # Safety
/// `area` has to stay valid for as long as the thread runs.
pub unsafe fn write_register(area: *const PerCoreArea) {
    PER_CORE_AREA.with(|r| r.set(area));
}
