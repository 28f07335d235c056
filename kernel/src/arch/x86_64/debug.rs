// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Serial output, the boot marker and the QEMU exit device.

use core::str::FromStr;

use log::Level;
use x86::io;

use crate::error::SubsystemError;
use crate::subsystems::{Console, SubsystemResult};

const PORT0: u16 = 0x3f8; /* COM1 */

/// Value and address of the boot marker.
pub const BOOT_MARKER: (u64, u32) = (0x7a_7a90, 0xb003_b003);

/// Exit codes reported to QEMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitReason {
    Ok = 0,
    ReturnFromMain = 1,
    KernelPanic = 2,
    OutOfMemory = 3,
    UnrecoverableError = 9,
}

/// Serial line on COM1 with `klogger` on top.
#[derive(Debug, Default)]
pub struct SerialConsole;

impl Console for SerialConsole {
    fn init_console(&self, log_filter: &str) -> SubsystemResult {
        unsafe {
            io::outb(PORT0 + 1, 0x00); // Disable all interrupts
            io::outb(PORT0 + 3, 0x80); // Enable DLAB (set baud rate divisor)
            io::outb(PORT0, 0x01); // Set divisor to 1 (lo byte) 115200 baud
            io::outb(PORT0 + 1, 0x00); //                  (hi byte)
            io::outb(PORT0 + 3, 0x03); // 8 bits, no parity, one stop bit
            io::outb(PORT0 + 2, 0xC7); // Enable FIFO, clear them, with 14-byte threshold
        }

        let (level, exact) = console_level(log_filter);
        klogger::init(level).map_err(|_| SubsystemError::new("logger already installed"))?;
        if !exact {
            log::warn!(
                "klogger only supports a global level, using '{}' for log filter '{}'",
                level,
                log_filter
            );
        }
        Ok(())
    }
}

/// Maps a log filter to a single level.
///
/// Per-module directives (`smpboot=trace`) apply their level globally; the
/// flag is false whenever the filter wasn't a plain level.
fn console_level(log_filter: &str) -> (Level, bool) {
    if let Ok(level) = Level::from_str(log_filter) {
        return (level, true);
    }
    let level = log_filter
        .rsplit('=')
        .next()
        .and_then(|l| Level::from_str(l).ok())
        .unwrap_or(Level::Info);
    (level, false)
}

/// Leaves a fixed value at a fixed address, so a debugger or memory dump can
/// tell how far the machine got.
pub fn boot_marker() {
    unsafe {
        // Safe: the bootloader identity-maps the low memory we write to.
        core::ptr::write_volatile(BOOT_MARKER.0 as *mut u32, BOOT_MARKER.1);
    }
}

/// Shutdown the processor.
///
/// Currently we only support the debug exit method from qemu, which conveniently
/// allows us to supply an exit code for testing purposes.
pub fn shutdown(val: ExitReason) -> ! {
    // Ok for QEMU with debug-exit,iobase=0xf4,iosize=0x04
    // qemu will call: exit((val << 1) | 1);
    unsafe {
        io::outb(0xf4, val as u8);
    }
    // In case this doesn't work we hang.
    super::halt()
}
