// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Cortex-M implementations of the boot target and system control.

use crate::boot::{BootTarget, VectorTable};
use crate::transport::System;
use cortex_m::peripheral::{NVIC, SCB, SYST};

/// Jumps into an application on Cortex-M.
pub struct CortexMBoot {
    deinit: fn(),
}

impl CortexMBoot {
    /// `deinit` returns every peripheral the bootloader configured to its reset state.
    pub fn new(deinit: fn()) -> Self {
        Self { deinit }
    }
}

impl BootTarget for CortexMBoot {
    unsafe fn boot(&mut self, vector_table: u32, vectors: VectorTable) -> ! {
        cortex_m::interrupt::disable();
        (self.deinit)();

        // Nothing the bootloader armed may fire once the application owns the vector table.
        let nvic = &*NVIC::PTR;
        for (icer, icpr) in nvic.icer.iter().zip(nvic.icpr.iter()) {
            icer.write(u32::MAX);
            icpr.write(u32::MAX);
        }
        let syst = &*SYST::PTR;
        syst.csr.write(0);

        (*SCB::PTR).vtor.write(vector_table);
        cortex_m::asm::dsb();
        cortex_m::asm::isb();

        info!("msp = {:#x}, rv = {:#x}", vectors.sp, vectors.entry);

        // These instructions perform the following operations:
        //
        // * Modify control register to use MSP as stack pointer (clear spsel bit)
        // * Synchronize instruction barrier
        // * Load the application stack pointer
        // * Set link register to not return (0xFF)
        // * Jump to the application reset vector
        core::arch::asm!(
            "mrs {tmp}, CONTROL",
            "bics {tmp}, {spsel}",
            "msr CONTROL, {tmp}",
            "isb",
            "msr MSP, {msp}",
            "mov lr, {new_lr}",
            "bx {rv}",
            // `out(reg) _` is not permitted in a `noreturn` asm! call,
            // so instead use `in(reg) 0` and don't restore it afterwards.
            tmp = in(reg) 0,
            spsel = in(reg) 2,
            new_lr = in(reg) 0xFFFFFFFFu32,
            msp = in(reg) vectors.sp,
            rv = in(reg) vectors.entry,
            options(noreturn),
        );
    }
}

/// Busy-wait delays and core reset.
pub struct CortexMSystem {
    cycles_per_ms: u32,
}

impl CortexMSystem {
    pub fn new(sysclk_hz: u32) -> Self {
        Self {
            cycles_per_ms: sysclk_hz / 1000,
        }
    }
}

impl System for CortexMSystem {
    fn delay_ms(&mut self, ms: u32) {
        for _ in 0..ms {
            cortex_m::asm::delay(self.cycles_per_ms);
        }
    }

    fn reset(&mut self) -> ! {
        SCB::sys_reset()
    }
}
