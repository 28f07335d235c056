// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use log::info;

/// Value and address of the boot marker on hardware.
pub const BOOT_MARKER: (u64, u32) = (0x7a_7a90, 0xb003_b003);

/// There is no memory to poke at when hosted, so we just log the marker.
pub fn boot_marker() {
    info!("Boot marker {:#x} at {:#x}", BOOT_MARKER.1, BOOT_MARKER.0);
}
