// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use log::{error, info};
use x86::cpuid;

use super::debug::{self, ExitReason};
use crate::error::SubsystemError;
use crate::subsystems::{Cpu, SubsystemResult};

/// The boot core of an x86-64 machine.
#[derive(Debug, Default)]
pub struct X86Cpu;

impl Cpu for X86Cpu {
    /// Make sure the machine supports what we require.
    fn detect_features(&self) -> SubsystemResult {
        let cpuid = cpuid::CpuId::new();
        let fi = cpuid.get_feature_info();
        let has_apic = fi.as_ref().map_or(false, |f| f.has_apic());
        let has_msr = fi.as_ref().map_or(false, |f| f.has_msr());
        let has_pae = fi.as_ref().map_or(false, |f| f.has_pae());
        let has_tsc = fi.as_ref().map_or(false, |f| f.has_tsc());
        let has_sse = fi.as_ref().map_or(false, |f| f.has_sse());
        let has_fpu = fi.as_ref().map_or(false, |f| f.has_fpu());

        if !(has_apic && has_msr && has_pae && has_tsc && has_sse && has_fpu) {
            error!(
                "Missing CPU features: apic={} msr={} pae={} tsc={} sse={} fpu={}",
                has_apic, has_msr, has_pae, has_tsc, has_sse, has_fpu
            );
            return Err(SubsystemError::new("unsupported processor"));
        }
        Ok(())
    }

    fn idle(&self) -> ! {
        info!("Boot core is idle");
        loop {
            unsafe {
                x86::irq::enable();
                x86::halt();
            }
        }
    }

    fn halt(&self) -> ! {
        debug::shutdown(ExitReason::UnrecoverableError)
    }
}
