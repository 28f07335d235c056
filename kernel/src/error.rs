// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error types for boot sequencing and SMP bring-up.
//!
//! Every error in here is fatal for the boot sequence: there is no retry logic
//! anywhere in this crate, a failing phase aborts the remaining sequence.

use core::alloc::Layout;
use core::fmt;

use crate::percore::CoreId;
use crate::phase::BootPhase;

/// Shorthand for results returned by boot code.
pub type KResult<T> = Result<T, KError>;

/// Top-level error for everything that can go wrong while booting.
#[derive(Debug, displaydoc::Display, PartialEq, Eq, Clone, Copy)]
pub enum KError {
    /// Backing storage exhausted while allocating {size} bytes (align {align}).
    OutOfMemory { size: usize, align: usize },
    /// Invalid configuration: {source}
    Config { source: ConfigError },
    /// Subsystem initialization failed during '{phase}': {source}
    SubsystemInit {
        phase: BootPhase,
        source: SubsystemError,
    },
    /// Core {core} halted during local initialization.
    Halted { core: CoreId },
    /// Core {core} already registered a per-core area.
    AreaAlreadyRegistered { core: CoreId },
}

impl KError {
    /// Constructs the allocation failure for a given `layout`.
    pub fn out_of_memory(layout: Layout) -> KError {
        KError::OutOfMemory {
            size: layout.size(),
            align: layout.align(),
        }
    }

    /// Returns a closure that wraps a collaborator failure into a
    /// `SubsystemInit` error for `phase` (meant for `map_err`).
    pub fn subsystem(phase: BootPhase) -> impl FnOnce(SubsystemError) -> KError {
        move |source| KError::SubsystemInit { phase, source }
    }
}

impl From<ConfigError> for KError {
    fn from(source: ConfigError) -> Self {
        KError::Config { source }
    }
}

/// Invalid processor counts, barrier thresholds or command line settings.
#[derive(Debug, displaydoc::Display, PartialEq, Eq, Clone, Copy)]
pub enum ConfigError {
    /// The topology probe reported no processors.
    NoCores,
    /// A core barrier needs at least one participant (got {threshold}).
    BarrierThreshold { threshold: usize },
    /// Found {count} processors, but we don't support more than {max}.
    TooManyCores { count: usize, max: usize },
    /// Boot core {boot} is not among the {count} probed processors.
    BootCoreOutOfRange { boot: CoreId, count: usize },
    /// Invalid command line options.
    InvalidCmdLineOptions,
    /// Malformed command line.
    MalformedCmdLine,
    /// The configured workload is not known to this kernel.
    UnknownWorkload,
}

/// A failure reported by an external collaborator through its init contract.
///
/// The collaborators are opaque to us, so all we keep is a static reason that
/// ends up in the diagnostic output.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SubsystemError {
    reason: &'static str,
}

impl SubsystemError {
    pub const fn new(reason: &'static str) -> SubsystemError {
        SubsystemError { reason }
    }

    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

impl fmt::Display for SubsystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn display_carries_context() {
        let e = KError::SubsystemInit {
            phase: BootPhase::Paging,
            source: SubsystemError::new("no memory map"),
        };
        let s = e.to_string();
        assert!(s.contains("no memory map"), "{}", s);
        assert!(s.contains(&BootPhase::Paging.to_string()), "{}", s);

        let e: KError = ConfigError::NoCores.into();
        assert_eq!(e, KError::Config { source: ConfigError::NoCores });
    }

    #[test]
    fn out_of_memory_from_layout() {
        let layout = Layout::from_size_align(128, 64).unwrap();
        assert_eq!(
            KError::out_of_memory(layout),
            KError::OutOfMemory {
                size: 128,
                align: 64
            }
        );
    }
}
