// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Instruction execution semantics
//!
//! One step of the replay: given the decoded instruction at the program
//! counter and the packet being resolved, advance the context. Returns
//! `true` once the executed instruction consumes the packet.

use std::io::{self, Write};

use log::{debug, error};

use crate::binary::{Instruction, Kind};
use crate::types::Rva;

use super::context::Context;

/// Execute one instruction against a target-carrying packet
pub(super) fn execute_tip<W: Write>(
    insn: &Instruction,
    ctx: &mut Context<W>,
    resolve_relocation: &mut dyn FnMut(Rva) -> Option<Rva>,
) -> io::Result<bool> {
    if deferred_target_check(ctx) {
        return Ok(true);
    }

    match insn.kind {
        Kind::Other => {
            ctx.pc = insn.next;
            Ok(false)
        }
        Kind::DirectJump(target) => {
            ctx.pc = target;
            Ok(false)
        }
        Kind::DirectConditional(target) => {
            if ctx.tnts.is_empty() {
                error!("conditional branch at {:#x} without a pending bit", ctx.pc);
                ctx.get_lost();
                return Ok(true);
            }
            ctx.pc = if ctx.tnts.taken() { target } else { insn.next };
            Ok(false)
        }
        Kind::DirectCall(mut target) => {
            let next = insn.next;
            if target > ctx.pc && target < next {
                // the call lands inside its own encoding: a relocation the
                // loader has patched
                match resolve_relocation(target) {
                    Some(resolved) => target = resolved,
                    None => {
                        error!("unresolvable relocation at {:#x}", ctx.pc);
                        ctx.get_lost();
                        return Ok(true);
                    }
                }
            } else if target == next {
                // call to the fall-through address: a get-pc idiom, not a
                // real call; the return address would only pollute the stack
                ctx.pc = target;
                return Ok(false);
            }

            ctx.output_instructions_before_call()?;
            ctx.pending_call = true;
            ctx.call_stack.push(next);
            debug!("saved return address {next:#x}");
            ctx.pc = target;
            Ok(false)
        }
        Kind::IndirectJump => {
            ctx.pc = ctx.tip;
            Ok(true)
        }
        Kind::IndirectCall | Kind::Syscall => {
            let next = insn.next;
            ctx.pc = ctx.tip;
            ctx.output_instructions_before_call()?;
            ctx.pending_call = true;
            ctx.call_stack.push(next);
            debug!("saved return address {next:#x}");
            Ok(true)
        }
        Kind::Return => execute_return(ctx),
        Kind::InterruptReturn => {
            ctx.output_iret(ctx.tip)?;
            ctx.pc = ctx.tip;
            Ok(true)
        }
    }
}

/// Act on a pending deferred target once the branch bits are drained
fn deferred_target_check<W: Write>(ctx: &mut Context<W>) -> bool {
    if ctx.fup != 0 && ctx.tnts.is_empty() && ctx.pc == ctx.fup {
        debug!("deferred target {:#x} reached, moving to {:#x}", ctx.fup, ctx.tip);
        ctx.pc = ctx.tip;
        ctx.fup = 0;
        true
    } else {
        false
    }
}

fn execute_return<W: Write>(ctx: &mut Context<W>) -> io::Result<bool> {
    if !ctx.tnts.is_empty() {
        // compressed return: a taken bit stands in for the target
        if ctx.tnts.taken() {
            ctx.output_instructions()?;
            match ctx.call_stack.pop() {
                Some(return_address) => {
                    ctx.pc = return_address;
                    debug!("compressed return to {return_address:#x}");
                    Ok(false)
                }
                None => {
                    error!("compressed return with an empty call stack");
                    ctx.get_lost();
                    Ok(true)
                }
            }
        } else {
            error!("compressed return with a not-taken bit");
            ctx.get_lost();
            Ok(true)
        }
    } else {
        ctx.output_instructions()?;
        if let Some(return_address) = ctx.call_stack.pop() {
            if return_address != ctx.tip {
                error!(
                    "return target {:#x} disagrees with the call stack ({return_address:#x})",
                    ctx.tip
                );
            }
        }
        ctx.pc = ctx.tip;
        Ok(true)
    }
}
