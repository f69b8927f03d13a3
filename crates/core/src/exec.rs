// nrfemu - Cortex-M instruction-level emulator
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! The single-step engine: precondition checks, fetch, IT gating, and the
//! per-instruction semantics.
//!
//! PC is kept with its Thumb bit set at all times; the fetch address is
//! `pc & !1`. After the fetch PC already points at the next instruction, so
//! branch targets are computed relative to it (the architectural base of
//! `instruction address + 4` is `pc + 2` for 16-bit encodings and `pc`
//! itself for 32-bit ones).

use crate::alu;
use crate::cpu::{LR, PC, SP};
use crate::decoder::{self, AluOp, DpOp, Instruction, ShiftKind};
use crate::machine::Machine;
use crate::{Access, EmuError, EmuResult, LogLevel, StopReason, Width, EXIT_ADDRESS};

impl Machine {
    /// Execute one instruction.
    pub fn step(&mut self) -> EmuResult<StopReason> {
        let pc = self.cpu.pc();

        // A hardware breakpoint matches the fetch address; the stored PC
        // keeps its Thumb bit.
        if self
            .hwbreak
            .iter()
            .any(|&slot| slot != 0 && slot == pc.wrapping_sub(1))
        {
            return Ok(StopReason::Break);
        }
        if pc == EXIT_ADDRESS {
            return Ok(StopReason::Exit);
        }
        if pc & 1 == 0 || pc > self.bus.flash.len() as u32 - 2 {
            return Err(EmuError::InvalidPc { pc });
        }

        let iaddr = pc & !1;
        let h1 = self.bus.flash.fetch16(iaddr as usize);
        self.cpu.set_pc(pc.wrapping_add(2));
        let wide = decoder::is_wide(h1);

        // Consume one IT slot before decoding; a failed condition skips the
        // whole encoding, 32-bit ones included.
        let mut in_it = false;
        let mut execute = true;
        if self.cpu.in_it_block() {
            in_it = true;
            execute = alu::condition_passed(self.cpu.it_condition(), &self.cpu.psr);
            self.cpu.it_advance();
        }

        if !wide {
            if !execute {
                return Ok(StopReason::Step);
            }
            let instr = decoder::decode_thumb16(h1, self.isa);
            if let Instruction::Unknown16(opcode) = instr {
                self.cpu.set_pc(pc);
                return Err(EmuError::Undefined {
                    opcode: opcode as u32,
                    pc: iaddr,
                });
            }
            if self.loglevel >= LogLevel::Instrs {
                tracing::debug!("{iaddr:#07x}: {h1:04x}      {instr:?}");
            }
            return self.execute(instr, iaddr, in_it);
        }

        let pc2 = self.cpu.pc();
        if pc2 > self.bus.flash.len() as u32 - 2 {
            return Err(EmuError::InvalidPc { pc });
        }
        let h2 = self.bus.flash.fetch16((pc2 & !1) as usize);
        if !execute {
            self.cpu.set_pc(pc2.wrapping_add(2));
            return Ok(StopReason::Step);
        }
        let instr = decoder::decode_thumb32(h1, h2, self.isa);
        if let Instruction::Unknown32(..) = instr {
            // The second halfword is never consumed; PC goes back to the
            // start of the instruction.
            self.cpu.set_pc(pc);
            return Err(EmuError::Undefined {
                opcode: ((h1 as u32) << 16) | h2 as u32,
                pc: iaddr,
            });
        }
        self.cpu.set_pc(pc2.wrapping_add(2));
        if self.loglevel >= LogLevel::Instrs {
            tracing::debug!("{iaddr:#07x}: {h1:04x} {h2:04x} {instr:?}");
        }
        self.execute(instr, iaddr, in_it)
    }

    fn reg(&self, index: u8) -> u32 {
        self.cpu.reg(index as usize)
    }

    fn set_reg(&mut self, index: u8, value: u32) {
        self.cpu.set_reg(index as usize, value);
    }

    fn shift_by(
        &self,
        kind: ShiftKind,
        value: u32,
        amount: u32,
    ) -> (u32, bool) {
        let carry_in = self.cpu.psr.c;
        match kind {
            ShiftKind::Lsl => alu::lsl_with_carry(value, amount, carry_in),
            ShiftKind::Lsr => alu::lsr_with_carry(value, amount, carry_in),
            ShiftKind::Asr => alu::asr_with_carry(value, amount, carry_in),
            ShiftKind::Ror => alu::ror_with_carry(value, amount, carry_in),
            ShiftKind::Rrx => alu::rrx_with_carry(value, carry_in),
        }
    }

    fn execute(&mut self, instr: Instruction, iaddr: u32, in_it: bool) -> EmuResult<StopReason> {
        // ALU instructions whose 16-bit encodings always set flags become
        // their non-flag-setting forms inside an IT block.
        let set_flags = !in_it;

        match instr {
            Instruction::ShiftImm { kind, rd, rm, shift } => {
                let (result, carry) = self.shift_by(kind, self.reg(rm), shift as u32);
                self.set_reg(rd, result);
                if set_flags {
                    self.cpu.psr.set_nz(result);
                    self.cpu.psr.c = carry;
                }
            }
            Instruction::AddReg { rd, rn, rm } => {
                let (result, carry, overflow) = alu::add_with_flags(self.reg(rn), self.reg(rm));
                self.set_reg(rd, result);
                if set_flags {
                    self.cpu.psr.set_nzcv(result, carry, overflow);
                }
            }
            Instruction::SubReg { rd, rn, rm } => {
                let (result, carry, overflow) = alu::sub_with_flags(self.reg(rn), self.reg(rm));
                self.set_reg(rd, result);
                if set_flags {
                    self.cpu.psr.set_nzcv(result, carry, overflow);
                }
            }
            Instruction::AddImm3 { rd, rn, imm } => {
                let (result, carry, overflow) = alu::add_with_flags(self.reg(rn), imm as u32);
                self.set_reg(rd, result);
                if set_flags {
                    self.cpu.psr.set_nzcv(result, carry, overflow);
                }
            }
            Instruction::SubImm3 { rd, rn, imm } => {
                let (result, carry, overflow) = alu::sub_with_flags(self.reg(rn), imm as u32);
                self.set_reg(rd, result);
                if set_flags {
                    self.cpu.psr.set_nzcv(result, carry, overflow);
                }
            }
            Instruction::MovImm { rd, imm } => {
                self.set_reg(rd, imm as u32);
                if set_flags {
                    self.cpu.psr.set_nz(imm as u32);
                }
            }
            Instruction::CmpImm { rn, imm } => {
                let (result, carry, overflow) = alu::sub_with_flags(self.reg(rn), imm as u32);
                self.cpu.psr.set_nzcv(result, carry, overflow);
            }
            Instruction::AddImm8 { rd, imm } => {
                let (result, carry, overflow) = alu::add_with_flags(self.reg(rd), imm as u32);
                self.set_reg(rd, result);
                if set_flags {
                    self.cpu.psr.set_nzcv(result, carry, overflow);
                }
            }
            Instruction::SubImm8 { rd, imm } => {
                let (result, carry, overflow) = alu::sub_with_flags(self.reg(rd), imm as u32);
                self.set_reg(rd, result);
                if set_flags {
                    self.cpu.psr.set_nzcv(result, carry, overflow);
                }
            }
            Instruction::Alu { op, rd, rm } => self.execute_alu(op, rd, rm, set_flags),
            Instruction::AddHi { rd, rm } => {
                let result = self.reg(rd).wrapping_add(self.reg(rm));
                self.set_reg(rd, result);
            }
            Instruction::CmpHi { rn, rm } => {
                let (result, carry, overflow) = alu::sub_with_flags(self.reg(rn), self.reg(rm));
                self.cpu.psr.set_nzcv(result, carry, overflow);
            }
            Instruction::MovHi { rd, rm } => {
                let mut value = self.reg(rm);
                if rd as usize == PC {
                    // A MOV into PC keeps the Thumb bit set.
                    value |= 1;
                }
                self.set_reg(rd, value);
            }
            Instruction::Bx { rm } => {
                let target = self.reg(rm);
                if rm as usize == LR {
                    self.trace_call(format_args!(
                        "BX lr {:6x} (sp: {:x}) <- {:x}",
                        iaddr,
                        self.cpu.sp(),
                        target.wrapping_sub(1)
                    ));
                    self.cpu.backtrace.leave();
                }
                self.cpu.set_pc(target);
            }
            Instruction::Blx { rm } => {
                let target = self.reg(rm);
                let next = self.cpu.pc();
                self.trace_call(format_args!(
                    "BLX r{rm} {:6x} (sp: {:x}) -> {:x}",
                    iaddr,
                    self.cpu.sp(),
                    target.wrapping_sub(1)
                ));
                self.cpu.backtrace.enter(iaddr, self.cpu.sp());
                self.cpu.set_pc(target);
                self.cpu.set_lr(next);
            }
            Instruction::LdrLit { rt, imm } => {
                let base = self.cpu.pc().wrapping_add(2) & !3;
                let value = self.bus.load(base.wrapping_add(imm as u32), Width::Word, false)?;
                self.set_reg(rt, value);
            }
            Instruction::MemReg {
                access,
                width,
                sign,
                rt,
                rn,
                rm,
            } => {
                let addr = self.reg(rn).wrapping_add(self.reg(rm));
                self.mem_access(access, addr, width, sign, rt)?;
            }
            Instruction::MemImm {
                access,
                width,
                rt,
                rn,
                offset,
            } => {
                let addr = self.reg(rn).wrapping_add(offset as u32);
                self.mem_access(access, addr, width, false, rt)?;
            }
            Instruction::Adr { rd, imm } => {
                let base = self.cpu.pc().wrapping_add(2) & !3;
                self.set_reg(rd, base.wrapping_add(imm as u32));
            }
            Instruction::AddSpImm { rd, imm } => {
                self.set_reg(rd, self.cpu.sp().wrapping_add(imm as u32));
            }
            Instruction::AddSp { imm } => {
                self.trace_call(format_args!("add sp, #{:#x} (sp: {:x})", imm, self.cpu.sp()));
                let sp = self.cpu.sp().wrapping_add(imm as u32);
                self.cpu.set_sp(sp);
            }
            Instruction::SubSp { imm } => {
                self.trace_call(format_args!("sub sp, #{:#x} (sp: {:x})", imm, self.cpu.sp()));
                let sp = self.cpu.sp().wrapping_sub(imm as u32);
                self.cpu.set_sp(sp);
            }
            Instruction::Sxth { rd, rm } => {
                self.set_reg(rd, self.reg(rm) as u16 as i16 as i32 as u32);
            }
            Instruction::Sxtb { rd, rm } => {
                self.set_reg(rd, self.reg(rm) as u8 as i8 as i32 as u32);
            }
            Instruction::Uxth { rd, rm } => {
                self.set_reg(rd, self.reg(rm) & 0xffff);
            }
            Instruction::Uxtb { rd, rm } => {
                self.set_reg(rd, self.reg(rm) & 0xff);
            }
            Instruction::Cbz { nonzero, rn, offset } => {
                if (self.reg(rn) == 0) != nonzero {
                    let pc = self.cpu.pc();
                    self.cpu.set_pc(pc.wrapping_add(2 + offset as u32));
                }
            }
            Instruction::Rev { rd, rm } => {
                self.set_reg(rd, self.reg(rm).swap_bytes());
            }
            Instruction::Bkpt { imm } => return Ok(self.execute_bkpt(imm, iaddr)),
            Instruction::It { firstcond, mask } => {
                self.cpu.it_start(firstcond, mask);
            }
            Instruction::Nop => {}
            Instruction::Push { registers, lr } => {
                let sp_before = self.cpu.sp();
                let mut sp = sp_before;
                if lr {
                    self.trace_call(format_args!(
                        "push lr      (sp: {:x}) (lr: {:x})",
                        sp.wrapping_sub(4),
                        self.cpu.lr()
                    ));
                    self.cpu.backtrace.enter(iaddr, sp_before);
                    sp = sp.wrapping_sub(4);
                    self.bus.store_word(sp, self.cpu.lr())?;
                }
                for i in (0..8).rev() {
                    if registers & (1 << i) != 0 {
                        sp = sp.wrapping_sub(4);
                        self.bus.store_word(sp, self.reg(i))?;
                    }
                }
                self.cpu.set_sp(sp);
            }
            Instruction::Pop { registers, pc } => {
                let mut sp = self.cpu.sp();
                for i in 0..8 {
                    if registers & (1 << i) != 0 {
                        let value = self.bus.load_word(sp)?;
                        self.set_reg(i, value);
                        sp = sp.wrapping_add(4);
                    }
                }
                if pc {
                    let target = self.bus.load_word(sp)?;
                    sp = sp.wrapping_add(4);
                    self.trace_call(format_args!(
                        "POP pc {:5x} (sp: {:x}) <- {:x}",
                        iaddr,
                        sp,
                        target.wrapping_sub(1)
                    ));
                    self.cpu.backtrace.leave();
                    self.cpu.set_pc(target);
                }
                self.cpu.set_sp(sp);
            }
            Instruction::Ldmia { rn, registers } => {
                let mut addr = self.reg(rn);
                for i in 0..8 {
                    if registers & (1 << i) != 0 {
                        let value = self.bus.load_word(addr)?;
                        self.set_reg(i, value);
                        addr = addr.wrapping_add(4);
                    }
                }
                // Writeback is suppressed when the base register was loaded.
                if registers & (1 << rn) == 0 {
                    self.set_reg(rn, addr);
                }
            }
            Instruction::Stmia { rn, registers } => {
                let mut addr = self.reg(rn);
                for i in 0..8 {
                    if registers & (1 << i) != 0 {
                        self.bus.store_word(addr, self.reg(i))?;
                        addr = addr.wrapping_add(4);
                    }
                }
                self.set_reg(rn, addr);
            }
            Instruction::BranchCond { cond, offset } => {
                let pc = self.cpu.pc();
                if alu::condition_passed(cond, &self.cpu.psr) {
                    let target = pc.wrapping_add(2).wrapping_add(offset as u32);
                    self.trace_call(format_args!(
                        "Bcond {:6x} (sp: {:x}) -> {:x}",
                        iaddr,
                        self.cpu.sp(),
                        target & !1
                    ));
                    self.cpu.set_pc(target);
                } else {
                    self.trace_call(format_args!("Bcond {:6x} not taken", iaddr));
                }
            }
            Instruction::Branch { offset } => {
                let pc = self.cpu.pc();
                let target = pc.wrapping_add(2).wrapping_add(offset as u32);
                self.trace_call(format_args!(
                    "B    {:7x} (sp: {:x}) -> {:x}",
                    iaddr,
                    self.cpu.sp(),
                    target & !1
                ));
                self.cpu.set_pc(target);
            }

            Instruction::Bl { offset } => {
                let next = self.cpu.pc();
                let target = next.wrapping_add(offset as u32);
                self.trace_call(format_args!(
                    "BL   {:7x} (sp: {:x}) -> {:x}",
                    iaddr,
                    self.cpu.sp(),
                    target & !1
                ));
                self.cpu.backtrace.enter(iaddr, self.cpu.sp());
                self.cpu.set_lr(next);
                self.cpu.set_pc(target);
            }
            Instruction::BranchW { offset } => {
                let target = self.cpu.pc().wrapping_add(offset as u32);
                self.trace_call(format_args!(
                    "B.W  {:7x} (sp: {:x}) -> {:x}",
                    iaddr,
                    self.cpu.sp(),
                    target & !1
                ));
                self.cpu.set_pc(target);
            }
            Instruction::BranchCondW { cond, offset } => {
                if alu::condition_passed(cond, &self.cpu.psr) {
                    let target = self.cpu.pc().wrapping_add(offset as u32);
                    self.cpu.set_pc(target);
                }
            }
            Instruction::DataProcImm {
                op,
                rn,
                rd,
                imm12,
                set_flags,
            } => {
                let (op2, carry) = thumb_expand_imm_c(imm12, self.cpu.psr.c);
                self.execute_data_proc(op, rn, rd, op2, carry, set_flags);
            }
            Instruction::DataProcShift {
                op,
                rn,
                rd,
                rm,
                kind,
                shift,
                set_flags,
            } => {
                let (op2, carry) = self.shift_by(kind, self.reg(rm), shift as u32);
                self.execute_data_proc(op, rn, rd, op2, carry, set_flags);
            }
            Instruction::Movw { rd, imm } => {
                self.set_reg(rd, imm as u32);
            }
            Instruction::Bfc { rd, lsb, width } => {
                let mask = bitfield_mask(lsb, width);
                self.set_reg(rd, self.reg(rd) & !mask);
            }
            Instruction::Bfi { rd, rn, lsb, width } => {
                let mask = bitfield_mask(lsb, width);
                let inserted = (self.reg(rn) << lsb) & mask;
                self.set_reg(rd, (self.reg(rd) & !mask) | inserted);
            }
            Instruction::Ubfx { rd, rn, lsb, width } => {
                let mask = if width == 32 {
                    u32::MAX
                } else {
                    (1u32 << width) - 1
                };
                self.set_reg(rd, (self.reg(rn) >> lsb) & mask);
            }
            Instruction::Sbfx { rd, rn, lsb, width } => {
                let shifted = self.reg(rn) >> lsb;
                let shift = 32 - width as u32;
                let value = ((shifted << shift) as i32 >> shift) as u32;
                self.set_reg(rd, value);
            }
            Instruction::MemImmW {
                access,
                width,
                sign,
                rt,
                rn,
                offset,
            } => {
                let addr = self.reg(rn).wrapping_add(offset as u32);
                self.mem_access(access, addr, width, sign, rt)?;
            }
            Instruction::MemIndexW {
                access,
                width,
                sign,
                rt,
                rn,
                offset,
                index,
                add,
                wback,
            } => {
                let base = self.reg(rn);
                let offset_addr = if add {
                    base.wrapping_add(offset as u32)
                } else {
                    base.wrapping_sub(offset as u32)
                };
                let addr = if index { offset_addr } else { base };
                self.mem_access(access, addr, width, sign, rt)?;
                if wback && !(access == Access::Load && rn == rt) {
                    self.set_reg(rn, offset_addr);
                }
            }
            Instruction::MemRegW {
                access,
                width,
                sign,
                rt,
                rn,
                rm,
                shift,
            } => {
                let addr = self
                    .reg(rn)
                    .wrapping_add(self.reg(rm) << shift);
                self.mem_access(access, addr, width, sign, rt)?;
            }
            Instruction::MemLit {
                width,
                sign,
                rt,
                offset,
                add,
            } => {
                let base = self.cpu.pc() & !3;
                let addr = if add {
                    base.wrapping_add(offset as u32)
                } else {
                    base.wrapping_sub(offset as u32)
                };
                self.mem_access(Access::Load, addr, width, sign, rt)?;
            }
            Instruction::Ldrd {
                rt,
                rt2,
                rn,
                offset,
                index,
                add,
                wback,
            } => {
                let base = self.reg(rn);
                let offset_addr = if add {
                    base.wrapping_add((offset as u32) << 2)
                } else {
                    base.wrapping_sub((offset as u32) << 2)
                };
                let addr = if index { offset_addr } else { base };
                let lo = self.bus.load_word(addr)?;
                let hi = self.bus.load_word(addr.wrapping_add(4))?;
                self.set_reg(rt, lo);
                self.set_reg(rt2, hi);
                if wback && rn != rt && rn != rt2 {
                    self.set_reg(rn, offset_addr);
                }
            }
            Instruction::Strd {
                rt,
                rt2,
                rn,
                offset,
                index,
                add,
                wback,
            } => {
                let base = self.reg(rn);
                let offset_addr = if add {
                    base.wrapping_add((offset as u32) << 2)
                } else {
                    base.wrapping_sub((offset as u32) << 2)
                };
                let addr = if index { offset_addr } else { base };
                self.bus.store_word(addr, self.reg(rt))?;
                self.bus.store_word(addr.wrapping_add(4), self.reg(rt2))?;
                if wback {
                    self.set_reg(rn, offset_addr);
                }
            }
            Instruction::Tbb { rn, rm } => {
                let base = if rn as usize == PC {
                    self.cpu.pc() & !1
                } else {
                    self.reg(rn)
                };
                let entry = self
                    .bus
                    .load(base.wrapping_add(self.reg(rm)), Width::Byte, false)?;
                let pc = self.cpu.pc();
                self.cpu.set_pc(pc.wrapping_add(entry << 1));
            }
            Instruction::Tbh { rn, rm } => {
                let base = if rn as usize == PC {
                    self.cpu.pc() & !1
                } else {
                    self.reg(rn)
                };
                let entry = self
                    .bus
                    .load(base.wrapping_add(self.reg(rm) << 1), Width::Half, false)?;
                let pc = self.cpu.pc();
                self.cpu.set_pc(pc.wrapping_add(entry << 1));
            }
            Instruction::LdmStmW {
                load,
                dec,
                rn,
                registers,
                wback,
            } => {
                self.execute_ldm_stm(load, dec, rn, registers, wback, iaddr)?;
            }
            Instruction::ShiftRegW {
                kind,
                rd,
                rn,
                rm,
                set_flags,
            } => {
                let amount = self.reg(rm) & 0xff;
                let (result, carry) = self.shift_by(kind, self.reg(rn), amount);
                self.set_reg(rd, result);
                if set_flags {
                    self.cpu.psr.set_nz(result);
                    self.cpu.psr.c = carry;
                }
            }
            Instruction::Clz { rd, rm } => {
                self.set_reg(rd, self.reg(rm).leading_zeros());
            }
            Instruction::Mul32 { rd, rn, rm } => {
                self.set_reg(rd, self.reg(rn).wrapping_mul(self.reg(rm)));
            }
            Instruction::Mla { rd, rn, rm, ra } => {
                let product = self.reg(rn).wrapping_mul(self.reg(rm));
                self.set_reg(rd, self.reg(ra).wrapping_add(product));
            }
            Instruction::Mls { rd, rn, rm, ra } => {
                let product = self.reg(rn).wrapping_mul(self.reg(rm));
                self.set_reg(rd, self.reg(ra).wrapping_sub(product));
            }
            Instruction::Mull {
                signed,
                rdlo,
                rdhi,
                rn,
                rm,
            } => {
                let product = if signed {
                    (self.reg(rn) as i32 as i64).wrapping_mul(self.reg(rm) as i32 as i64) as u64
                } else {
                    (self.reg(rn) as u64).wrapping_mul(self.reg(rm) as u64)
                };
                self.set_reg(rdlo, product as u32);
                self.set_reg(rdhi, (product >> 32) as u32);
            }
            Instruction::Div { signed, rd, rn, rm } => {
                let divisor = self.reg(rm);
                if divisor == 0 {
                    return Err(EmuError::DivideByZero { pc: iaddr });
                }
                let result = if signed {
                    let n = self.reg(rn) as i32;
                    let m = divisor as i32;
                    if n == i32::MIN && m == -1 {
                        i32::MIN as u32
                    } else {
                        (n / m) as u32
                    }
                } else {
                    self.reg(rn) / divisor
                };
                self.set_reg(rd, result);
            }
            Instruction::MrsMsp { rd } => {
                self.set_reg(rd, self.cpu.sp());
            }

            Instruction::Unknown16(..) | Instruction::Unknown32(..) => {
                // Rejected in `step` before execution.
                return Err(EmuError::Undefined { opcode: 0, pc: iaddr });
            }
        }
        Ok(StopReason::Step)
    }

    fn execute_alu(&mut self, op: AluOp, rd: u8, rm: u8, set_flags: bool) {
        let dst = self.reg(rd);
        let src = self.reg(rm);
        match op {
            AluOp::And | AluOp::Eor | AluOp::Orr | AluOp::Bic | AluOp::Mvn | AluOp::Mul => {
                let result = match op {
                    AluOp::And => dst & src,
                    AluOp::Eor => dst ^ src,
                    AluOp::Orr => dst | src,
                    AluOp::Bic => dst & !src,
                    AluOp::Mvn => !src,
                    _ => dst.wrapping_mul(src),
                };
                self.set_reg(rd, result);
                if set_flags {
                    self.cpu.psr.set_nz(result);
                }
            }
            AluOp::LslReg | AluOp::LsrReg | AluOp::AsrReg => {
                let kind = match op {
                    AluOp::LslReg => ShiftKind::Lsl,
                    AluOp::LsrReg => ShiftKind::Lsr,
                    _ => ShiftKind::Asr,
                };
                let (result, carry) = self.shift_by(kind, dst, src & 0xff);
                self.set_reg(rd, result);
                if set_flags {
                    self.cpu.psr.set_nz(result);
                    self.cpu.psr.c = carry;
                }
            }
            AluOp::Adc => {
                let (result, carry, overflow) = alu::adc_with_flags(dst, src, self.cpu.psr.c);
                self.set_reg(rd, result);
                if set_flags {
                    self.cpu.psr.set_nzcv(result, carry, overflow);
                }
            }
            AluOp::Sbc => {
                let (result, carry, overflow) = alu::sbc_with_flags(dst, src, self.cpu.psr.c);
                self.set_reg(rd, result);
                if set_flags {
                    self.cpu.psr.set_nzcv(result, carry, overflow);
                }
            }
            AluOp::Neg => {
                let (result, carry, overflow) = alu::sub_with_flags(0, src);
                self.set_reg(rd, result);
                if set_flags {
                    self.cpu.psr.set_nzcv(result, carry, overflow);
                }
            }
            // Comparisons always write the flags; they have no other effect.
            AluOp::Tst => self.cpu.psr.set_nz(dst & src),
            AluOp::Cmp => {
                let (result, carry, overflow) = alu::sub_with_flags(dst, src);
                self.cpu.psr.set_nzcv(result, carry, overflow);
            }
            AluOp::Cmn => {
                let (result, carry, overflow) = alu::add_with_flags(dst, src);
                self.cpu.psr.set_nzcv(result, carry, overflow);
            }
        }
    }

    /// Shared tail of the Thumb-2 data-processing forms once the second
    /// operand and its shifter/expansion carry are known.
    fn execute_data_proc(
        &mut self,
        op: DpOp,
        rn: u8,
        rd: u8,
        op2: u32,
        shifter_carry: bool,
        set_flags: bool,
    ) {
        let rn_is_pc = rn == 0xf;
        let rd_is_pc = rd == 0xf;
        let op1 = if rn_is_pc { 0 } else { self.reg(rn) };
        match op {
            DpOp::And | DpOp::Bic | DpOp::Orr | DpOp::Orn | DpOp::Eor => {
                let result = match op {
                    DpOp::And => op1 & op2,
                    DpOp::Bic => op1 & !op2,
                    // With Rn == PC the ORR/ORN rows are MOV/MVN.
                    DpOp::Orr => {
                        if rn_is_pc {
                            op2
                        } else {
                            op1 | op2
                        }
                    }
                    DpOp::Orn => {
                        if rn_is_pc {
                            !op2
                        } else {
                            op1 | !op2
                        }
                    }
                    _ => op1 ^ op2,
                };
                // With Rd == PC, AND and EOR are the TST/TEQ comparisons.
                if !rd_is_pc {
                    self.set_reg(rd, result);
                }
                if set_flags {
                    self.cpu.psr.set_nz(result);
                    self.cpu.psr.c = shifter_carry;
                }
            }
            DpOp::Add | DpOp::Adc | DpOp::Sbc | DpOp::Sub | DpOp::Rsb => {
                let (result, carry, overflow) = match op {
                    DpOp::Add => alu::add_with_flags(op1, op2),
                    DpOp::Adc => alu::adc_with_flags(op1, op2, self.cpu.psr.c),
                    DpOp::Sbc => alu::sbc_with_flags(op1, op2, self.cpu.psr.c),
                    DpOp::Sub => alu::sub_with_flags(op1, op2),
                    _ => alu::sub_with_flags(op2, op1),
                };
                // With Rd == PC, ADD and SUB are the CMN/CMP comparisons.
                if !rd_is_pc {
                    self.set_reg(rd, result);
                }
                if set_flags {
                    self.cpu.psr.set_nzcv(result, carry, overflow);
                }
            }
        }
    }

    fn execute_bkpt(&mut self, imm: u8, iaddr: u32) -> StopReason {
        match imm {
            // Magic debugging hooks: drop to errors only / raise to full
            // instruction tracing.
            0x80 => {
                self.loglevel = LogLevel::Error;
                StopReason::Step
            }
            0x81 => {
                self.loglevel = LogLevel::Instrs;
                StopReason::Step
            }
            _ => {
                tracing::error!("hit breakpoint {imm} at PC={iaddr:#x}");
                StopReason::Break
            }
        }
    }

    fn execute_ldm_stm(
        &mut self,
        load: bool,
        dec: bool,
        rn: u8,
        registers: u16,
        wback: bool,
        iaddr: u32,
    ) -> EmuResult<()> {
        let base = self.reg(rn);
        let count = registers.count_ones();
        let lowest = if dec {
            base.wrapping_sub(4 * count)
        } else {
            base
        };
        let new_base = if dec {
            lowest
        } else {
            base.wrapping_add(4 * count)
        };

        if !load && dec && wback && rn as usize == SP && registers & (1 << LR) != 0 {
            // A wide push of LR starts a frame, like its 16-bit sibling.
            self.cpu.backtrace.enter(iaddr, base);
        }

        let mut addr = lowest;
        let mut branch = None;
        for i in 0..16u8 {
            if registers & (1 << i) == 0 {
                continue;
            }
            if load {
                let value = self.bus.load_word(addr)?;
                if i as usize == PC {
                    branch = Some(value);
                } else {
                    self.set_reg(i, value);
                }
            } else {
                self.bus.store_word(addr, self.reg(i))?;
            }
            addr = addr.wrapping_add(4);
        }

        if wback && !(load && registers & (1 << rn) != 0) {
            self.set_reg(rn, new_base);
        }
        if let Some(target) = branch {
            self.trace_call(format_args!(
                "POP pc {:5x} (sp: {:x}) <- {:x}",
                iaddr,
                self.cpu.sp(),
                target.wrapping_sub(1)
            ));
            self.cpu.backtrace.leave();
            self.cpu.set_pc(target);
        }
        Ok(())
    }

    fn mem_access(
        &mut self,
        access: Access,
        addr: u32,
        width: Width,
        sign: bool,
        rt: u8,
    ) -> EmuResult<()> {
        match access {
            Access::Load => {
                let value = self.bus.load(addr, width, sign)?;
                if rt as usize == PC {
                    // A word load into PC is a function return.
                    self.cpu.backtrace.leave();
                    self.cpu.set_pc(value);
                } else {
                    self.set_reg(rt, value);
                }
            }
            Access::Store => {
                self.bus.store(addr, self.reg(rt), width)?;
            }
        }
        Ok(())
    }
}

/// Expand the 12-bit modified immediate of the Thumb-2 data-processing
/// encodings. Returns the value and the carry-out (the incoming carry when
/// the pattern form is used, bit 31 for rotated constants).
fn thumb_expand_imm_c(imm12: u16, carry_in: bool) -> (u32, bool) {
    let imm12 = imm12 as u32;
    let imm8 = imm12 & 0xff;
    if imm12 >> 10 == 0 {
        let value = match (imm12 >> 8) & 0x3 {
            0b00 => imm8,
            0b01 => (imm8 << 16) | imm8,
            0b10 => (imm8 << 24) | (imm8 << 8),
            _ => (imm8 << 24) | (imm8 << 16) | (imm8 << 8) | imm8,
        };
        (value, carry_in)
    } else {
        let unrotated = 0x80 | (imm8 & 0x7f);
        let rotation = (imm12 >> 7) & 0x1f;
        let value = unrotated.rotate_right(rotation);
        (value, value >> 31 != 0)
    }
}

fn bitfield_mask(lsb: u8, width: u8) -> u32 {
    if width == 32 {
        u32::MAX
    } else {
        ((1u32 << width) - 1) << lsb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_pattern_immediates() {
        assert_eq!(thumb_expand_imm_c(0x0ab, true), (0xab, true));
        assert_eq!(thumb_expand_imm_c(0x1ab, false), (0x00ab_00ab, false));
        assert_eq!(thumb_expand_imm_c(0x2ab, false), (0xab00_ab00, false));
        assert_eq!(thumb_expand_imm_c(0x3ab, false), (0xabab_abab, false));
    }

    #[test]
    fn expands_rotated_immediates_with_carry() {
        // imm12 = 0x4ff: rotate 0xff right by 9 -> 0x7f80_0000, carry clear.
        assert_eq!(thumb_expand_imm_c(0x4ff, false), (0x7f80_0000, false));
        // imm12 = 0x400: rotate 0x80 right by 8 lands the top bit, so the
        // carry out is set regardless of the carry in.
        assert_eq!(thumb_expand_imm_c(0x400, false), (0x8000_0000, true));
    }

    #[test]
    fn bitfield_masks() {
        assert_eq!(bitfield_mask(0, 32), u32::MAX);
        assert_eq!(bitfield_mask(4, 12), 0x0000_fff0);
        assert_eq!(bitfield_mask(31, 1), 0x8000_0000);
    }
}
