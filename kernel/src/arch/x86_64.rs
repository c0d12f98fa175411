//! x86_64 hardware port of the context switch.
//!
//! The switch routine is setjmp-style: it stores the callee-saved
//! registers, the stack pointer, and a resume address into the outgoing
//! [`Context`], then loads the same set from the incoming one and jumps.
//! A context resumed later continues right after its original switch call.
//!
//! Interrupts are masked across the switch and the previous state is
//! restored afterwards, so a timer interrupt cannot preempt a half-saved
//! context.

use core::arch::global_asm;

use super::{Context, ContextPort};
use crate::task::process::Slot;

global_asm!(
    r#"
.global ticketos_context_switch
ticketos_context_switch:
    // rdi = save: *mut Context, rsi = restore: *const Context
    //
    // Field offsets must match arch::Context:
    //   r15 r14 r13 r12 rbx rbp rsp rip
    mov [rdi + 0x00], r15
    mov [rdi + 0x08], r14
    mov [rdi + 0x10], r13
    mov [rdi + 0x18], r12
    mov [rdi + 0x20], rbx
    mov [rdi + 0x28], rbp
    mov [rdi + 0x30], rsp
    lea rax, [rip + 1f]
    mov [rdi + 0x38], rax
    mov r15, [rsi + 0x00]
    mov r14, [rsi + 0x08]
    mov r13, [rsi + 0x10]
    mov r12, [rsi + 0x18]
    mov rbx, [rsi + 0x20]
    mov rbp, [rsi + 0x28]
    mov rsp, [rsi + 0x30]
    jmp qword ptr [rsi + 0x38]
1:
    ret
"#
);

extern "C" {
    fn ticketos_context_switch(save: *mut Context, restore: *const Context);
}

/// The hardware context-switch port.
pub struct X86Port;

impl X86Port {
    /// # Safety
    /// Same contract as [`ContextPort::suspend`]; additionally `restore`
    /// must hold a context previously saved by this routine (or primed via
    /// [`Context::prime`]) — resuming a zeroed context jumps to address 0.
    unsafe fn switch(save: *mut Context, restore: *const Context) {
        let irqs_were_enabled = ::x86_64::instructions::interrupts::are_enabled();
        ::x86_64::instructions::interrupts::disable();
        unsafe {
            ticketos_context_switch(save, restore);
        }
        if irqs_were_enabled {
            ::x86_64::instructions::interrupts::enable();
        }
    }
}

impl ContextPort for X86Port {
    unsafe fn suspend(&self, _cur: Slot, save: *mut Context, resume: *const Context) {
        unsafe { Self::switch(save, resume) }
    }

    unsafe fn dispatch(&self, _next: Slot, save: *mut Context, resume: *const Context) {
        unsafe { Self::switch(save, resume) }
    }
}
