// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-core areas: the private state block of every processor.
//!
//! Each processor stores the address of its own area in a register reserved
//! for this purpose (`gs` on x86-64, a thread-local on unix), so code running
//! on a core can find "its" state without passing pointers around. This works
//! before any lock, heap-backed map or scheduler exists.

use alloc::vec::Vec;
use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicU8, Ordering};

use log::trace;

use crate::arch;
use crate::error::{ConfigError, KError, KResult};
use crate::heap;

/// Logical identifier of a core, an index into the registry.
pub type CoreId = usize;

/// Hardware identifier of a core (APIC id on x86).
pub type HwId = u32;

/// Lifecycle of a core during bring-up.
///
/// Secondary cores go `Offline → StartupRequested → LocalInit → BarrierWait →
/// Running`, or end up in `HaltedError` if they fail before the barrier. The
/// boot core starts out in `LocalInit` once its area is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoreState {
    Offline = 0,
    StartupRequested = 1,
    LocalInit = 2,
    BarrierWait = 3,
    Running = 4,
    HaltedError = 5,
}

impl CoreState {
    fn from_u8(v: u8) -> CoreState {
        match v {
            0 => CoreState::Offline,
            1 => CoreState::StartupRequested,
            2 => CoreState::LocalInit,
            3 => CoreState::BarrierWait,
            4 => CoreState::Running,
            _ => CoreState::HaltedError,
        }
    }

    /// Is `self → next` a legal lifecycle transition?
    pub fn can_transition_to(self, next: CoreState) -> bool {
        use CoreState::*;
        matches!(
            (self, next),
            (Offline, StartupRequested)
                | (Offline, LocalInit)
                | (StartupRequested, LocalInit)
                | (LocalInit, BarrierWait)
                | (BarrierWait, Running)
                | (StartupRequested, HaltedError)
                | (LocalInit, HaltedError)
        )
    }

    /// Has a core in this state arrived at (or passed) the core barrier?
    pub fn has_reached_barrier(self) -> bool {
        matches!(self, CoreState::BarrierWait | CoreState::Running)
    }
}

/// Describes one physical processor.
///
/// The identifiers never change. The state is written by the boot core until
/// it wakes the processor up and only by the processor itself after that.
pub struct CoreDescriptor {
    id: CoreId,
    hw_id: HwId,
    is_boot: bool,
    state: AtomicU8,
}

impl CoreDescriptor {
    pub fn new(id: CoreId, hw_id: HwId, is_boot: bool) -> CoreDescriptor {
        CoreDescriptor {
            id,
            hw_id,
            is_boot,
            state: AtomicU8::new(CoreState::Offline as u8),
        }
    }

    pub fn id(&self) -> CoreId {
        self.id
    }

    pub fn hw_id(&self) -> HwId {
        self.hw_id
    }

    pub fn is_boot(&self) -> bool {
        self.is_boot
    }

    pub fn state(&self) -> CoreState {
        CoreState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, next: CoreState) {
        let current = self.state();
        debug_assert!(
            current.can_transition_to(next),
            "Core {} can't go from {:?} to {:?}",
            self.id,
            current,
            next
        );
        trace!("core {}: {:?} -> {:?}", self.id, current, next);
        self.state.store(next as u8, Ordering::Release);
    }
}

impl fmt::Debug for CoreDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreDescriptor")
            .field("id", &self.id)
            .field("hw_id", &self.hw_id)
            .field("is_boot", &self.is_boot)
            .field("state", &self.state())
            .finish()
    }
}

/// The private area of a core, what the per-core register points to.
#[repr(C)]
pub struct PerCoreArea {
    /// Points to ourselves, so `gs:[0]` yields the address of the area.
    myself: *const PerCoreArea,
    descriptor: CoreDescriptor,
}

// Safe: `myself` is only ever read, everything else is atomic or immutable.
unsafe impl Send for PerCoreArea {}
unsafe impl Sync for PerCoreArea {}

static_assertions::const_assert_eq!(mem::offset_of!(PerCoreArea, myself), 0);

impl PerCoreArea {
    /// Allocates the (still unregistered) area of core `id` from `heap`.
    pub fn allocate(
        heap: &dyn GlobalAlloc,
        id: CoreId,
        hw_id: HwId,
        is_boot: bool,
    ) -> KResult<&'static PerCoreArea> {
        let descriptor = CoreDescriptor::new(id, hw_id, is_boot);
        heap::try_leak_with(heap, |myself| PerCoreArea { myself, descriptor })
    }

    /// Points the per-core register of the calling core to this area.
    ///
    /// The register is write-once: fails if the core already registered an
    /// area.
    pub fn register(&'static self) -> KResult<()> {
        if !arch::percore::read_register().is_null() {
            return Err(KError::AreaAlreadyRegistered { core: self.id() });
        }

        unsafe {
            // Safe: `self` is never freed and the register is still unset.
            arch::percore::write_register(self.as_ptr());
        }
        trace!("core {} registered its area at {:p}", self.id(), self.as_ptr());
        Ok(())
    }

    pub fn descriptor(&self) -> &CoreDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> CoreId {
        self.descriptor.id
    }

    pub(crate) fn as_ptr(&self) -> *const PerCoreArea {
        self.myself
    }
}

impl fmt::Debug for PerCoreArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerCoreArea")
            .field("address", &self.myself)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// All per-core areas of the machine, indexed by `CoreId`.
///
/// The boot core allocates and registers its own area first, the others are
/// allocated once the core count is known. Areas are never freed. A core
/// associates itself with its area through `register_self`; the association
/// is write-once.
pub struct PerCoreAreaRegistry {
    areas: Vec<&'static PerCoreArea>,
    boot_core: CoreId,
}

impl PerCoreAreaRegistry {
    /// Allocates an area for each of the `count` cores from `heap`.
    ///
    /// `hw_id` maps a logical core to its hardware identifier.
    pub fn allocate<F>(
        heap: &dyn GlobalAlloc,
        count: usize,
        boot_core: CoreId,
        hw_id: F,
    ) -> KResult<PerCoreAreaRegistry>
    where
        F: Fn(CoreId) -> HwId,
    {
        PerCoreAreaRegistry::check_count(count, boot_core)?;
        let boot = PerCoreArea::allocate(heap, boot_core, hw_id(boot_core), true)?;
        PerCoreAreaRegistry::complete(heap, count, boot, hw_id)
    }

    /// Builds the registry around the already allocated area of the boot core
    /// by allocating the areas of the remaining `count - 1` cores.
    pub fn complete<F>(
        heap: &dyn GlobalAlloc,
        count: usize,
        boot: &'static PerCoreArea,
        hw_id: F,
    ) -> KResult<PerCoreAreaRegistry>
    where
        F: Fn(CoreId) -> HwId,
    {
        debug_assert!(boot.descriptor().is_boot());
        let boot_core = boot.id();
        PerCoreAreaRegistry::check_count(count, boot_core)?;

        let mut areas = Vec::new();
        areas.try_reserve_exact(count).map_err(|_| {
            KError::out_of_memory(
                Layout::array::<&'static PerCoreArea>(count)
                    .unwrap_or_else(|_| Layout::new::<&'static PerCoreArea>()),
            )
        })?;

        // Areas allocated before a failure are leaked, the failure is fatal.
        for id in 0..count {
            let area = if id == boot_core {
                boot
            } else {
                PerCoreArea::allocate(heap, id, hw_id(id), false)?
            };
            areas.push(area);
        }
        trace!("Allocated {} per-core areas", count);

        Ok(PerCoreAreaRegistry { areas, boot_core })
    }

    fn check_count(count: usize, boot_core: CoreId) -> KResult<()> {
        if count == 0 {
            return Err(ConfigError::NoCores.into());
        }
        if count > arch::MAX_CORES {
            return Err(ConfigError::TooManyCores {
                count,
                max: arch::MAX_CORES,
            }
            .into());
        }
        if boot_core >= count {
            return Err(ConfigError::BootCoreOutOfRange {
                boot: boot_core,
                count,
            }
            .into());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    pub fn get(&self, id: CoreId) -> Option<&'static PerCoreArea> {
        self.areas.get(id).copied()
    }

    pub fn boot_core(&self) -> CoreId {
        self.boot_core
    }

    pub fn boot_area(&self) -> &'static PerCoreArea {
        self.areas[self.boot_core]
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static PerCoreArea> + '_ {
        self.areas.iter().copied()
    }

    /// Associates the calling core with `area`.
    ///
    /// Must be called once, on the core that owns `area`, before that core
    /// uses `current_area`.
    pub fn register_self(&self, area: &'static PerCoreArea) -> KResult<()> {
        debug_assert!(
            self.areas.iter().any(|a| ptr::eq(*a, area)),
            "Area doesn't belong to this registry"
        );
        area.register()
    }

    /// Returns the area of the calling core, if it registered one.
    pub fn try_current_area() -> Option<&'static PerCoreArea> {
        let area = arch::percore::read_register();
        // Safe: the register only ever holds areas that live forever.
        unsafe { area.as_ref() }
    }

    /// Returns the area of the calling core.
    ///
    /// # Panic
    /// This will fail in case the core didn't register its area yet.
    pub fn current_area() -> &'static PerCoreArea {
        PerCoreAreaRegistry::try_current_area().expect("Per-core area not registered on this core.")
    }
}

impl fmt::Debug for PerCoreAreaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerCoreAreaRegistry")
            .field("cores", &self.areas.len())
            .field("boot_core", &self.boot_core)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::heap::test::ExhaustedHeap;
    use crate::heap::KERNEL_HEAP;

    use std::sync::Arc;
    use std::thread;

    #[test]
    fn state_transitions() {
        use CoreState::*;
        assert!(Offline.can_transition_to(StartupRequested));
        assert!(LocalInit.can_transition_to(HaltedError));
        assert!(!BarrierWait.can_transition_to(HaltedError));
        assert!(!Running.can_transition_to(Offline));
        assert!(!HaltedError.can_transition_to(BarrierWait));
        assert!(BarrierWait.has_reached_barrier());
        assert!(Running.has_reached_barrier());
        assert!(!LocalInit.has_reached_barrier());
    }

    #[test]
    fn allocate_validates_counts() {
        let r = PerCoreAreaRegistry::allocate(&KERNEL_HEAP, 0, 0, |id| id as HwId);
        assert_eq!(r.unwrap_err(), KError::from(ConfigError::NoCores));

        let r = PerCoreAreaRegistry::allocate(&KERNEL_HEAP, arch::MAX_CORES + 1, 0, |id| id as HwId);
        assert!(matches!(
            r,
            Err(KError::Config {
                source: ConfigError::TooManyCores { .. }
            })
        ));

        let r = PerCoreAreaRegistry::allocate(&KERNEL_HEAP, 2, 2, |id| id as HwId);
        assert_eq!(
            r.unwrap_err(),
            KError::from(ConfigError::BootCoreOutOfRange { boot: 2, count: 2 })
        );

        let r = PerCoreAreaRegistry::allocate(&ExhaustedHeap, 2, 0, |id| id as HwId);
        assert!(matches!(r, Err(KError::OutOfMemory { .. })));
    }

    #[test]
    fn complete_keeps_boot_area() {
        let boot = PerCoreArea::allocate(&KERNEL_HEAP, 2, 7, true).unwrap();
        let registry = PerCoreAreaRegistry::complete(&KERNEL_HEAP, 4, boot, |id| id as HwId).unwrap();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.boot_core(), 2);
        assert!(ptr::eq(registry.boot_area(), boot));
        assert_eq!(registry.boot_area().descriptor().hw_id(), 7);
        assert_eq!(registry.iter().filter(|a| a.descriptor().is_boot()).count(), 1);

        let r = PerCoreAreaRegistry::complete(&KERNEL_HEAP, 0, boot, |id| id as HwId);
        assert_eq!(r.unwrap_err(), KError::from(ConfigError::NoCores));
        let r = PerCoreAreaRegistry::complete(&KERNEL_HEAP, 2, boot, |id| id as HwId);
        assert_eq!(
            r.unwrap_err(),
            KError::from(ConfigError::BootCoreOutOfRange { boot: 2, count: 2 })
        );
    }

    /// The boot core can register its area before the registry exists.
    #[test]
    fn register_before_registry() {
        thread::spawn(|| {
            let boot = PerCoreArea::allocate(&KERNEL_HEAP, 0, 0, true).unwrap();
            boot.register().unwrap();
            assert!(ptr::eq(PerCoreAreaRegistry::current_area(), boot));
            assert_eq!(
                boot.register(),
                Err(KError::AreaAlreadyRegistered { core: 0 })
            );
        })
        .join()
        .unwrap();
    }

    #[test]
    fn allocate_describes_cores() {
        let registry = PerCoreAreaRegistry::allocate(&KERNEL_HEAP, 3, 1, |id| 10 + id as HwId).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.boot_area().id(), 1);
        for (id, area) in registry.iter().enumerate() {
            assert_eq!(area.id(), id);
            assert_eq!(area.descriptor().hw_id(), 10 + id as HwId);
            assert_eq!(area.descriptor().is_boot(), id == 1);
            assert_eq!(area.descriptor().state(), CoreState::Offline);
            assert_eq!(area.as_ptr(), area as *const PerCoreArea);
        }
    }

    /// Every core gets back exactly the area it registered, and nothing
    /// before registering.
    #[test]
    fn current_area_is_per_core() {
        let registry =
            Arc::new(PerCoreAreaRegistry::allocate(&KERNEL_HEAP, 4, 0, |id| id as HwId).unwrap());

        let handles: Vec<_> = (0..registry.len())
            .map(|id| {
                let registry = registry.clone();
                thread::spawn(move || {
                    assert!(PerCoreAreaRegistry::try_current_area().is_none());
                    let area = registry.get(id).unwrap();
                    registry.register_self(area).unwrap();
                    for _ in 0..100 {
                        assert!(ptr::eq(PerCoreAreaRegistry::current_area(), area));
                        thread::yield_now();
                    }
                    PerCoreAreaRegistry::current_area().id()
                })
            })
            .collect();

        for (id, h) in handles.into_iter().enumerate() {
            assert_eq!(h.join().unwrap(), id);
        }
    }

    #[test]
    fn registration_is_write_once() {
        let registry = PerCoreAreaRegistry::allocate(&KERNEL_HEAP, 2, 0, |id| id as HwId).unwrap();
        thread::scope(|s| {
            s.spawn(|| {
                registry.register_self(registry.get(0).unwrap()).unwrap();
                assert_eq!(
                    registry.register_self(registry.get(1).unwrap()),
                    Err(KError::AreaAlreadyRegistered { core: 1 })
                );
                assert_eq!(PerCoreAreaRegistry::current_area().id(), 0);
            });
        });
    }
}
