// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Functionality to boot application cores on x86.
//!
//! A woken-up core starts in 16-bit real mode at a page below 1 MiB. We copy
//! the trampoline (the assembly that takes it to long mode) there, fill in
//! its parameter slots and send the INIT/STARTUP IPI sequence.

use core::alloc::GlobalAlloc;
use core::mem;
use core::ptr;
use core::sync::atomic::{fence, AtomicBool, Ordering};

use log::trace;
use spin::Mutex;
use x86::apic::{ApicControl, ApicId};

use crate::coreboot::{ApEntry, BringupContext};
use crate::error::SubsystemError;
use crate::heap;
use crate::percore::{CoreDescriptor, CoreId};
use crate::subsystems::{SubsystemResult, Wake};

/// The 16-bit segement where our bootstrap code is.
const X86_64_REAL_MODE_SEGMENT: u16 = 0x0600;

/// The page number in real mode (this is what the IPI wants)
const REAL_MODE_PAGE: u8 = (X86_64_REAL_MODE_SEGMENT >> 8) as u8;

/// The offset, what we have to add to get a physical address.
const REAL_MODE_LINEAR_OFFSET: u16 = X86_64_REAL_MODE_SEGMENT << 4;

/// The corresponding 64-bit address (0 + offset in our case).
const REAL_MODE_BASE: usize = REAL_MODE_LINEAR_OFFSET as usize;

/// Stack size of a secondary core until its scheduler takes over.
const AP_STACK_SIZE: usize = 64 * 0x1000;

/// The trampoline and its slots have to fit in the real-mode page.
const REAL_MODE_PAGE_SIZE: usize = 0x1000;

/// Initial stack of a secondary core.
#[repr(C, align(4096))]
struct ApStack([u8; AP_STACK_SIZE]);

// `ap_landing` is entered with the SysV ABI: rsp must be 16-byte aligned.
static_assertions::const_assert_eq!(mem::align_of::<ApStack>() % 16, 0);
static_assertions::const_assert_eq!(mem::size_of::<ApStack>() % 16, 0);

/// The real-mode trampoline a woken-up core executes first.
///
/// It is expected to switch to the address space in the `pml4` slot, load
/// the `stack` slot into rsp, store `true` to the `AtomicBool` the `lock`
/// slot points to and call `entry(arg1, arg2, arg3)` with the SysV ABI.
/// Fields other than `code` are byte offsets of 64-bit slots within `code`.
#[derive(Debug, Clone, Copy)]
pub struct Trampoline {
    pub code: &'static [u8],
    pub entry: usize,
    pub arg1: usize,
    pub arg2: usize,
    pub arg3: usize,
    pub pml4: usize,
    pub stack: usize,
    pub lock: usize,
}

impl Trampoline {
    fn slots(&self) -> [usize; 7] {
        [
            self.entry, self.arg1, self.arg2, self.arg3, self.pml4, self.stack, self.lock,
        ]
    }

    /// Checks that the code fits in the real-mode page and every slot lies
    /// within the code.
    fn validate(&self) -> Result<(), SubsystemError> {
        if self.code.len() > REAL_MODE_PAGE_SIZE {
            return Err(SubsystemError::new("trampoline exceeds the real-mode page"));
        }
        if self.slots().iter().any(|off| off + 8 > self.code.len()) {
            return Err(SubsystemError::new("trampoline slot outside of the code"));
        }
        Ok(())
    }
}

/// Where the trampoline drops a secondary core into Rust.
extern "C" fn ap_landing(ctx: &'static BringupContext, core: CoreId, entry: ApEntry) -> ! {
    entry(ctx, core);
    // Only returns if local initialization failed.
    super::halt()
}

fn apic_id(core: &CoreDescriptor) -> ApicId {
    match u8::try_from(core.hw_id()) {
        Ok(id) => ApicId::XApic(id),
        Err(_) => ApicId::X2Apic(core.hw_id()),
    }
}

/// Wakes up cores with the xAPIC/x2APIC IPI protocol.
pub struct XApicWake<A> {
    apic: Mutex<A>,
    trampoline: Trampoline,
    stacks: &'static (dyn GlobalAlloc + Sync),
}

impl<A: ApicControl + Send> XApicWake<A> {
    /// Fails if the trampoline doesn't fit in the real-mode page.
    ///
    /// # Safety
    /// `trampoline` has to describe valid trampoline code, the real-mode
    /// page at `REAL_MODE_BASE` has to be identity mapped and must not be
    /// used for anything else.
    pub unsafe fn new(
        apic: A,
        trampoline: Trampoline,
        stacks: &'static (dyn GlobalAlloc + Sync),
    ) -> Result<XApicWake<A>, SubsystemError> {
        trampoline.validate()?;
        Ok(XApicWake {
            apic: Mutex::new(apic),
            trampoline,
            stacks,
        })
    }

    /// Puts the trampoline at REAL_MODE_BASE and fills in its parameters.
    ///
    /// # Safety
    /// Only one core may be in the trampoline at a time.
    unsafe fn setup_bootstrap_code(&self, params: [(usize, u64); 7]) {
        let code = self.trampoline.code;
        ptr::copy_nonoverlapping(code.as_ptr(), REAL_MODE_BASE as *mut u8, code.len());

        for (offset, value) in params {
            let slot = (REAL_MODE_BASE + offset) as *mut u64;
            ptr::write_volatile(slot, value);
            trace!("trampoline slot {:p} set to {:#x}", slot, value);
        }
        fence(Ordering::SeqCst);
    }

    /// Wakes up (resets) a core by sending a sequence of IPIs (INIT, INIT
    /// deassert, STARTUP).
    ///
    /// # Notes
    /// x86 specification technically requires to sleep between init and
    /// startup, but on most modern processors (Xeon Phi being an exception)
    /// this is not really necessary.
    unsafe fn wakeup_core(&self, core: ApicId) {
        let mut apic = self.apic.lock();
        apic.ipi_init(core);
        apic.ipi_init_deassert();
        apic.ipi_startup(core, REAL_MODE_PAGE);
    }
}

impl<A: ApicControl + Send> Wake for XApicWake<A> {
    fn wake(
        &self,
        core: &CoreDescriptor,
        entry: ApEntry,
        ctx: &'static BringupContext,
    ) -> SubsystemResult {
        // Nothing past this allocation can fail, the stack is handed to the
        // core for good.
        let stack = heap::try_alloc::<ApStack>(self.stacks)
            .map_err(|_| SubsystemError::new("no memory for the stack of a core"))?;
        let stack_top = stack.as_ptr() as u64 + mem::size_of::<ApStack>() as u64 - 16;
        let initialized = AtomicBool::new(false);

        let t = &self.trampoline;
        let landing: extern "C" fn(&'static BringupContext, CoreId, ApEntry) -> ! = ap_landing;
        unsafe {
            self.setup_bootstrap_code([
                (t.entry, landing as u64),
                (t.arg1, ctx as *const BringupContext as u64),
                (t.arg2, core.id() as u64),
                (t.arg3, entry as u64),
                (t.pml4, ctx.paging().root),
                (t.stack, stack_top),
                (t.lock, &initialized as *const AtomicBool as u64),
            ]);
            self.wakeup_core(apic_id(core));
        }

        // The core is done with the trampoline (and `initialized`) once it
        // flips the flag. No timeout: a core that never shows up hangs us.
        while !initialized.load(Ordering::Acquire) {
            super::relax();
        }
        Ok(())
    }
}
