// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Saved user register state and the exception-stack frame built for fault upcalls
//! OWNERS: @kernel-team
//! PUBLIC API: TrapFrame, PushRegs, UTrapframe, FaultDelivery, FL_*/T_* and selector constants
//! DEPENDS_ON: mm::USTACK_TOP
//! INVARIANTS: TrapFrame is a plain Copy value of 17 little-endian words; no aliasing between copies
//!
//! The layout mirrors what the trap entry path pushes on the kernel stack, so a
//! frame can be copied to or from user memory word for word. Segment selectors
//! occupy the low half of their word; the upper half is padding.

use core::mem::size_of;

use static_assertions::const_assert_eq;

use crate::mm::USTACK_TOP;

/// Interrupt-enable flag.
pub const FL_IF: u32 = 0x0000_0200;
/// I/O privilege level field.
pub const FL_IOPL_MASK: u32 = 0x0000_3000;

/// Page fault trap number.
pub const T_PGFLT: u32 = 14;
/// System call trap number.
pub const T_SYSCALL: u32 = 48;

/// User code selector (GDT entry 3, RPL 3).
pub const GD_UT_USER: u32 = 0x18 | 3;
/// User data selector (GDT entry 4, RPL 3).
pub const GD_UD_USER: u32 = 0x20 | 3;

/// General purpose registers in `pushal` order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Ignored on restore.
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

impl PushRegs {
    const WORDS: usize = 8;

    fn to_words(self) -> [u32; Self::WORDS] {
        [self.edi, self.esi, self.ebp, self.oesp, self.ebx, self.edx, self.ecx, self.eax]
    }

    fn from_words(w: &[u32]) -> Self {
        Self {
            edi: w[0],
            esi: w[1],
            ebp: w[2],
            oesp: w[3],
            ebx: w[4],
            edx: w[5],
            ecx: w[6],
            eax: w[7],
        }
    }
}

/// Saved user context of an environment.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub regs: PushRegs,
    pub es: u32,
    pub ds: u32,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

const_assert_eq!(size_of::<TrapFrame>(), TrapFrame::SIZE);

impl TrapFrame {
    /// Size of the frame in user memory.
    pub const SIZE: usize = 17 * 4;

    /// Context of a freshly created environment: user selectors, interrupts
    /// enabled, stack at [`USTACK_TOP`]. The entry point is left at zero.
    pub fn user_initial() -> Self {
        Self {
            es: GD_UD_USER,
            ds: GD_UD_USER,
            ss: GD_UD_USER,
            cs: GD_UT_USER,
            esp: USTACK_TOP as u32,
            eflags: FL_IF,
            ..Self::default()
        }
    }

    /// Forces user privilege, enables interrupts and clears IOPL.
    pub fn sanitize(&mut self) {
        self.cs |= 3;
        self.eflags |= FL_IF;
        self.eflags &= !FL_IOPL_MASK;
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let regs = self.regs.to_words();
        let tail = [
            self.es, self.ds, self.trapno, self.err, self.eip, self.cs, self.eflags, self.esp,
            self.ss,
        ];
        let mut out = [0u8; Self::SIZE];
        for (chunk, word) in out.chunks_exact_mut(4).zip(regs.iter().chain(tail.iter())) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut w = [0u32; Self::SIZE / 4];
        for (word, chunk) in w.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let t = &w[PushRegs::WORDS..];
        Self {
            regs: PushRegs::from_words(&w[..PushRegs::WORDS]),
            es: t[0],
            ds: t[1],
            trapno: t[2],
            err: t[3],
            eip: t[4],
            cs: t[5],
            eflags: t[6],
            esp: t[7],
            ss: t[8],
        }
    }
}

/// Frame pushed on the user exception stack before entering the fault upcall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UTrapframe {
    pub fault_va: u32,
    pub err: u32,
    pub regs: PushRegs,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
}

impl UTrapframe {
    pub const SIZE: usize = 13 * 4;

    /// Captures the faulting context.
    pub fn capture(fault_va: u32, tf: &TrapFrame) -> Self {
        Self {
            fault_va,
            err: tf.err,
            regs: tf.regs,
            eip: tf.eip,
            eflags: tf.eflags,
            esp: tf.esp,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let regs = self.regs.to_words();
        let words = [self.fault_va, self.err]
            .into_iter()
            .chain(regs)
            .chain([self.eip, self.eflags, self.esp]);
        let mut out = [0u8; Self::SIZE];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut w = [0u32; Self::SIZE / 4];
        for (word, chunk) in w.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self {
            fault_va: w[0],
            err: w[1],
            regs: PushRegs::from_words(&w[2..10]),
            eip: w[10],
            eflags: w[11],
            esp: w[12],
        }
    }
}

/// Result of handing a user page fault to its environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDelivery {
    /// The environment resumes in its upcall with `esp` pointing at the pushed frame.
    Upcall { entry: usize, frame: usize },
    /// No usable upcall; the environment was destroyed.
    Destroyed,
}
