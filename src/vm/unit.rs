//! The execution unit: a register file plus the fetch-decode-execute loop.
//!
//! One unit runs per VM thread. Each dispatch iteration locks the unit's
//! register file, fetches one opcode at PC, decodes its operands from the
//! instruction stream and applies the effect. Operations that block — a
//! `THREAD_CONTROL WAIT` join or file I/O — are returned out of the
//! iteration as a [`Step`] and performed with no lock held.

use crate::bytecode::isa::Opcode;
use crate::bytecode::{
    FLAG_CARRY, FLAG_UNSIGNED, FLAG_ZERO, RV, TAG_BYTE, TAG_DOUBLE, TAG_FLOAT, TAG_INT, TAG_LONG,
    TAG_SHORT, TC_GET_REGISTER, TC_SET_REGISTER, TC_STOP, TC_WAIT,
};
use crate::errors::VmError;
use crate::memory::Memory;
use crate::vm::registers::Registers;
use crate::vm::VirtualMachine;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Outcome of one dispatch iteration.
///
/// Blocking work is described rather than performed so the register guard
/// can be dropped first.
enum Step {
    Continue,
    /// THREAD_FINISH, EXIT, or the VM left the running state.
    Finish,
    /// THREAD_CONTROL WAIT: join the target thread.
    Join(u64),
    /// THREAD_CONTROL GET_REGISTER: read `src` from the target into `dst`.
    GetRegister { tid: u64, src: u8, dst: u8 },
    /// THREAD_CONTROL SET_REGISTER: write `value` into the target's `dst`.
    SetRegister { tid: u64, dst: u8, value: u64 },
    Open { path: String, flags: u64, mode: u64, dst: u8 },
    Close { fd: u64, dst: u8 },
    Read { fd: u64, buf: u64, count: u64, dst: u8 },
    Write { fd: u64, data: Vec<u8>, dst: u8 },
}

/// Condition codes shared by the conditional-move and conditional-jump
/// families; all read FLAGS with the same mapping.
#[derive(Copy, Clone)]
enum Cond {
    E,
    Ne,
    L,
    Le,
    G,
    Ge,
    Ul,
    Ule,
    Ug,
    Uge,
}

impl Cond {
    fn holds(self, flags: u64) -> bool {
        let zero = flags & FLAG_ZERO != 0;
        let less = flags & FLAG_CARRY != 0;
        let uless = flags & FLAG_UNSIGNED != 0;
        match self {
            Cond::E => zero,
            Cond::Ne => !zero,
            Cond::L => !zero && less,
            Cond::Le => zero || less,
            Cond::G => !zero && !less,
            Cond::Ge => zero || !less,
            Cond::Ul => !zero && uless,
            Cond::Ule => zero || uless,
            Cond::Ug => !zero && !uless,
            Cond::Uge => zero || !uless,
        }
    }
}

/// Sign-extends the low `width_tag` bytes of `value`.
fn sign_extend(value: u64, width_tag: u8) -> i64 {
    match width_tag {
        TAG_BYTE => value as u8 as i8 as i64,
        TAG_SHORT => value as u16 as i16 as i64,
        TAG_INT => value as u32 as i32 as i64,
        _ => value as i64,
    }
}

/// Computes the FLAGS value for a comparison of `a` and `b` under `tag`.
///
/// Integer tags truncate and sign-extend both operands before comparing;
/// CARRY takes the signed and UNSIGNED the unsigned less-than result, ZERO
/// the equality. Float tags clear ZERO and drive CARRY and UNSIGNED both
/// from the IEEE less-than.
fn compare(tag: u8, a: u64, b: u64, flags: u64) -> Result<u64, VmError> {
    let cleared = flags & !(FLAG_ZERO | FLAG_CARRY | FLAG_UNSIGNED);
    match tag {
        TAG_FLOAT => {
            let less = f32::from_bits(a as u32) < f32::from_bits(b as u32);
            Ok(cleared | if less { FLAG_CARRY | FLAG_UNSIGNED } else { 0 })
        }
        TAG_DOUBLE => {
            let less = f64::from_bits(a) < f64::from_bits(b);
            Ok(cleared | if less { FLAG_CARRY | FLAG_UNSIGNED } else { 0 })
        }
        TAG_BYTE | TAG_SHORT | TAG_INT | TAG_LONG => {
            let x = sign_extend(a, tag);
            let y = sign_extend(b, tag);
            if x == y {
                Ok(cleared | FLAG_ZERO)
            } else {
                let mut out = cleared;
                if x < y {
                    out |= FLAG_CARRY;
                }
                if (x as u64) < (y as u64) {
                    out |= FLAG_UNSIGNED;
                }
                Ok(out)
            }
        }
        _ => Err(VmError::InvalidTypeTag { tag }),
    }
}

/// Base address used by the typed field/local/parameter families.
enum FieldBase {
    /// An object pointer taken from a register operand.
    Object,
    /// The current frame's BP.
    Local,
}

/// Maps a size tag to a byte width for the typed field/local/parameter ops.
fn width_from_tag(tag: u8) -> Result<usize, VmError> {
    match tag {
        TAG_BYTE | TAG_SHORT | TAG_INT | TAG_LONG => Ok(tag as usize),
        _ => Err(VmError::InvalidTypeTag { tag }),
    }
}

/// A register file driven over shared linear memory by one VM thread.
pub struct ExecutionUnit {
    vm: Arc<VirtualMachine>,
    memory: Arc<Memory>,
    thread_id: u64,
    /// Lowest address of this thread's stack allocation.
    stack_base: u64,
    /// Highest address of this thread's stack allocation; initial SP/BP.
    stack_top: u64,
    registers: Mutex<Registers>,
    stop: AtomicBool,
}

impl ExecutionUnit {
    pub fn new(
        vm: Arc<VirtualMachine>,
        thread_id: u64,
        stack_base: u64,
        stack_top: u64,
        entry_point: u64,
    ) -> Self {
        let memory = Arc::clone(vm.memory());
        let mut registers = Registers::new();
        registers.set_bp(stack_top);
        registers.set_sp(stack_top);
        registers.set_pc(entry_point);
        Self {
            vm,
            memory,
            thread_id,
            stack_base,
            stack_top,
            registers: Mutex::new(registers),
            stop: AtomicBool::new(false),
        }
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// Asks the run loop to stop at its next dispatch boundary.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Reads a register under this unit's mutex (cross-thread inspection).
    pub fn get_register(&self, idx: u8) -> Result<u64, VmError> {
        self.registers.lock().get(idx)
    }

    /// Writes a register under this unit's mutex (cross-thread mutation).
    pub fn set_register(&self, idx: u8, value: u64) -> Result<(), VmError> {
        self.registers.lock().set(idx, value)
    }

    /// Interprets instructions until the thread finishes, faults, is asked
    /// to stop, or the VM leaves the running state.
    pub fn run(&self) -> Result<(), VmError> {
        loop {
            if !self.vm.is_running() || self.stop.load(Ordering::Acquire) {
                return Ok(());
            }
            match self.step()? {
                Step::Continue => {}
                Step::Finish => return Ok(()),
                Step::Join(tid) => self.vm.join_thread(tid),
                Step::GetRegister { tid, src, dst } => {
                    if let Some(value) = self.vm.thread_get_register(tid, src)? {
                        self.set_register(dst, value)?;
                    }
                }
                Step::SetRegister { tid, dst, value } => {
                    self.vm.thread_set_register(tid, dst, value)?;
                }
                Step::Open {
                    path,
                    flags,
                    mode,
                    dst,
                } => {
                    let fd = self.vm.open(path, flags, mode)?;
                    self.set_register(dst, fd)?;
                }
                Step::Close { fd, dst } => {
                    self.vm.close(fd)?;
                    self.set_register(dst, 0)?;
                }
                Step::Read {
                    fd,
                    buf,
                    count,
                    dst,
                } => {
                    // Transient kernel buffer between the descriptor and
                    // linear memory.
                    let mut data = vec![0u8; count as usize];
                    let n = self.vm.read(fd, &mut data)?;
                    self.memory.set_bytes(buf, &data[..n])?;
                    self.set_register(dst, n as u64)?;
                }
                Step::Write { fd, data, dst } => {
                    let n = self.vm.write(fd, &data)?;
                    self.set_register(dst, n as u64)?;
                }
            }
        }
    }

    /// One dispatch iteration under the register mutex.
    fn step(&self) -> Result<Step, VmError> {
        let mut guard = self.registers.lock();
        let regs = &mut *guard;
        let opcode_pc = regs.pc();
        let byte = self.memory.fetch_u8(opcode_pc)?;
        regs.set_pc(opcode_pc.wrapping_add(1));
        let op = Opcode::try_from(byte).map_err(|_| VmError::IllegalOpcode {
            opcode: byte,
            pc: opcode_pc,
        })?;

        match op {
            Opcode::Nop => {}

            Opcode::Push1 => self.op_push(regs, 1)?,
            Opcode::Push2 => self.op_push(regs, 2)?,
            Opcode::Push4 => self.op_push(regs, 4)?,
            Opcode::Push8 => self.op_push(regs, 8)?,
            Opcode::Pop1 => self.op_pop(regs, 1)?,
            Opcode::Pop2 => self.op_pop(regs, 2)?,
            Opcode::Pop4 => self.op_pop(regs, 4)?,
            Opcode::Pop8 => self.op_pop(regs, 8)?,

            Opcode::Load1 => self.op_load(regs, 1)?,
            Opcode::Load2 => self.op_load(regs, 2)?,
            Opcode::Load4 => self.op_load(regs, 4)?,
            Opcode::Load8 => self.op_load(regs, 8)?,
            Opcode::Store1 => self.op_store(regs, 1)?,
            Opcode::Store2 => self.op_store(regs, 2)?,
            Opcode::Store4 => self.op_store(regs, 4)?,
            Opcode::Store8 => self.op_store(regs, 8)?,

            Opcode::Cmp => self.op_cmp(regs)?,
            Opcode::AtomicCmp => self.op_atomic_cmp(regs)?,

            Opcode::MovE => self.op_mov_cond(regs, Cond::E)?,
            Opcode::MovNe => self.op_mov_cond(regs, Cond::Ne)?,
            Opcode::MovL => self.op_mov_cond(regs, Cond::L)?,
            Opcode::MovLe => self.op_mov_cond(regs, Cond::Le)?,
            Opcode::MovG => self.op_mov_cond(regs, Cond::G)?,
            Opcode::MovGe => self.op_mov_cond(regs, Cond::Ge)?,
            Opcode::MovUl => self.op_mov_cond(regs, Cond::Ul)?,
            Opcode::MovUle => self.op_mov_cond(regs, Cond::Ule)?,
            Opcode::MovUg => self.op_mov_cond(regs, Cond::Ug)?,
            Opcode::MovUge => self.op_mov_cond(regs, Cond::Uge)?,
            Opcode::Mov => {
                let rs = self.fetch_reg(regs)?;
                let rd = self.fetch_reg(regs)?;
                let value = regs.get(rs)?;
                regs.set(rd, value)?;
            }
            Opcode::MovImmediate1 => self.op_mov_immediate(regs, 1)?,
            Opcode::MovImmediate2 => self.op_mov_immediate(regs, 2)?,
            Opcode::MovImmediate4 => self.op_mov_immediate(regs, 4)?,
            Opcode::MovImmediate8 => self.op_mov_immediate(regs, 8)?,

            Opcode::Jump => {
                let rt = self.fetch_reg(regs)?;
                let target = regs.get(rt)?;
                regs.set_pc(target);
            }
            Opcode::JumpImmediate => {
                let target = self.fetch_u64(regs)?;
                regs.set_pc(target);
            }
            Opcode::Je => self.op_jump_cond(regs, Cond::E)?,
            Opcode::Jne => self.op_jump_cond(regs, Cond::Ne)?,
            Opcode::Jl => self.op_jump_cond(regs, Cond::L)?,
            Opcode::Jle => self.op_jump_cond(regs, Cond::Le)?,
            Opcode::Jg => self.op_jump_cond(regs, Cond::G)?,
            Opcode::Jge => self.op_jump_cond(regs, Cond::Ge)?,
            Opcode::Jul => self.op_jump_cond(regs, Cond::Ul)?,
            Opcode::Jule => self.op_jump_cond(regs, Cond::Ule)?,
            Opcode::Jug => self.op_jump_cond(regs, Cond::Ug)?,
            Opcode::Juge => self.op_jump_cond(regs, Cond::Uge)?,
            Opcode::JumpIfTrue | Opcode::JumpIf => self.op_jump_if(regs, true)?,
            Opcode::JumpIfFalse => self.op_jump_if(regs, false)?,

            Opcode::Malloc => {
                let rsize = self.fetch_reg(regs)?;
                let rd = self.fetch_reg(regs)?;
                let size = regs.get(rsize)?;
                let addr = self.memory.alloc(size)?;
                regs.set(rd, addr)?;
            }
            Opcode::Free => {
                let rptr = self.fetch_reg(regs)?;
                let addr = regs.get(rptr)?;
                self.memory.free(addr)?;
            }
            Opcode::Realloc => {
                let rptr = self.fetch_reg(regs)?;
                let rsize = self.fetch_reg(regs)?;
                let rd = self.fetch_reg(regs)?;
                let addr = regs.get(rptr)?;
                let size = regs.get(rsize)?;
                let moved = self.memory.realloc(addr, size)?;
                regs.set(rd, moved)?;
            }

            Opcode::Add => self.op_binary_int(regs, |d, s| Ok(d.wrapping_add(s)))?,
            Opcode::Sub => self.op_binary_int(regs, |d, s| Ok(d.wrapping_sub(s)))?,
            Opcode::Mul => self.op_binary_int(regs, |d, s| Ok(d.wrapping_mul(s)))?,
            Opcode::Div => self.op_binary_int(regs, int_div)?,
            Opcode::Mod => self.op_binary_int(regs, int_mod)?,
            Opcode::And => self.op_binary_int(regs, |d, s| Ok(d & s))?,
            Opcode::Or => self.op_binary_int(regs, |d, s| Ok(d | s))?,
            Opcode::Xor => self.op_binary_int(regs, |d, s| Ok(d ^ s))?,
            Opcode::Shl => self.op_binary_int(regs, |d, s| Ok(d.wrapping_shl(s as u32)))?,
            Opcode::Shr => {
                self.op_binary_int(regs, |d, s| Ok((d as i64).wrapping_shr(s as u32) as u64))?
            }
            Opcode::Ushr => self.op_binary_int(regs, |d, s| Ok(d.wrapping_shr(s as u32)))?,
            Opcode::Not => self.op_unary_int(regs, |v| !v)?,
            Opcode::Neg => self.op_unary_int(regs, |v| v.wrapping_neg())?,
            Opcode::Inc => self.op_unary_int(regs, |v| v.wrapping_add(1))?,
            Opcode::Dec => self.op_unary_int(regs, |v| v.wrapping_sub(1))?,

            Opcode::AddDouble => self.op_binary_f64(regs, |d, s| d + s)?,
            Opcode::SubDouble => self.op_binary_f64(regs, |d, s| d - s)?,
            Opcode::MulDouble => self.op_binary_f64(regs, |d, s| d * s)?,
            Opcode::DivDouble => self.op_binary_f64(regs, |d, s| d / s)?,
            Opcode::ModDouble => self.op_binary_f64(regs, |d, s| d % s)?,
            Opcode::NegDouble => self.op_unary_f64(regs, |v| -v)?,
            Opcode::AddFloat => self.op_binary_f32(regs, |d, s| d + s)?,
            Opcode::SubFloat => self.op_binary_f32(regs, |d, s| d - s)?,
            Opcode::MulFloat => self.op_binary_f32(regs, |d, s| d * s)?,
            Opcode::DivFloat => self.op_binary_f32(regs, |d, s| d / s)?,
            Opcode::ModFloat => self.op_binary_f32(regs, |d, s| d % s)?,
            Opcode::NegFloat => self.op_unary_f32(regs, |v| -v)?,

            Opcode::AtomicAdd => self.op_atomic_binary_int(regs, |d, s| Ok(d.wrapping_add(s)))?,
            Opcode::AtomicSub => self.op_atomic_binary_int(regs, |d, s| Ok(d.wrapping_sub(s)))?,
            Opcode::AtomicMul => self.op_atomic_binary_int(regs, |d, s| Ok(d.wrapping_mul(s)))?,
            Opcode::AtomicDiv => self.op_atomic_binary_int(regs, int_div)?,
            Opcode::AtomicMod => self.op_atomic_binary_int(regs, int_mod)?,
            Opcode::AtomicAnd => self.op_atomic_binary_int(regs, |d, s| Ok(d & s))?,
            Opcode::AtomicOr => self.op_atomic_binary_int(regs, |d, s| Ok(d | s))?,
            Opcode::AtomicXor => self.op_atomic_binary_int(regs, |d, s| Ok(d ^ s))?,
            Opcode::AtomicShl => {
                self.op_atomic_binary_int(regs, |d, s| Ok(d.wrapping_shl(s as u32)))?
            }
            Opcode::AtomicShr => self.op_atomic_binary_int(regs, |d, s| {
                Ok((d as i64).wrapping_shr(s as u32) as u64)
            })?,
            Opcode::AtomicUshr => {
                self.op_atomic_binary_int(regs, |d, s| Ok(d.wrapping_shr(s as u32)))?
            }
            Opcode::AtomicNot => self.op_atomic_unary_int(regs, |v| !v)?,
            Opcode::AtomicNeg => self.op_atomic_unary_int(regs, |v| v.wrapping_neg())?,
            Opcode::AtomicInc => self.op_atomic_unary_int(regs, |v| v.wrapping_add(1))?,
            Opcode::AtomicDec => self.op_atomic_unary_int(regs, |v| v.wrapping_sub(1))?,
            Opcode::AtomicAddDouble => self.op_atomic_binary_f64(regs, |d, s| d + s)?,
            Opcode::AtomicSubDouble => self.op_atomic_binary_f64(regs, |d, s| d - s)?,
            Opcode::AtomicMulDouble => self.op_atomic_binary_f64(regs, |d, s| d * s)?,
            Opcode::AtomicDivDouble => self.op_atomic_binary_f64(regs, |d, s| d / s)?,
            Opcode::AtomicModDouble => self.op_atomic_binary_f64(regs, |d, s| d % s)?,
            Opcode::AtomicNegDouble => self.op_atomic_unary_f64(regs, |v| -v)?,
            Opcode::AtomicAddFloat => self.op_atomic_binary_f32(regs, |d, s| d + s)?,
            Opcode::AtomicSubFloat => self.op_atomic_binary_f32(regs, |d, s| d - s)?,
            Opcode::AtomicMulFloat => self.op_atomic_binary_f32(regs, |d, s| d * s)?,
            Opcode::AtomicDivFloat => self.op_atomic_binary_f32(regs, |d, s| d / s)?,
            Opcode::AtomicModFloat => self.op_atomic_binary_f32(regs, |d, s| d % s)?,
            Opcode::AtomicNegFloat => self.op_atomic_unary_f32(regs, |v| -v)?,

            Opcode::Cas => {
                let r1 = self.fetch_reg(regs)?;
                let r2 = self.fetch_reg(regs)?;
                let r3 = self.fetch_reg(regs)?;
                let v1 = regs.get(r1)?;
                let v2 = regs.get(r2)?;
                if v1 == v2 {
                    let v3 = regs.get(r3)?;
                    regs.set(r1, v3)?;
                    regs.set_flags(regs.flags() | FLAG_ZERO);
                } else {
                    regs.set(r2, v1)?;
                    regs.set_flags(regs.flags() & !FLAG_ZERO);
                }
            }

            Opcode::Invoke => {
                let rt = self.fetch_reg(regs)?;
                let target = regs.get(rt)?;
                self.push_u64(regs, regs.pc())?;
                regs.set_pc(target);
            }
            Opcode::InvokeImmediate => {
                let target = self.fetch_u64(regs)?;
                self.push_u64(regs, regs.pc())?;
                regs.set_pc(target);
            }
            Opcode::Return => {
                let target = self.pop_u64(regs)?;
                regs.set_pc(target);
            }
            Opcode::Interrupt => {
                let number = self.fetch_u8(regs)?;
                self.push_u64(regs, regs.flags())?;
                self.push_u64(regs, regs.pc())?;
                let vector = regs.idtr().wrapping_add(8 * number as u64);
                let target = self.memory.get_u64(vector)?;
                regs.set_pc(target);
            }
            Opcode::InterruptReturn => {
                let pc = self.pop_u64(regs)?;
                let flags = self.pop_u64(regs)?;
                regs.set_pc(pc);
                regs.set_flags(flags);
            }

            Opcode::IntTypeCast => self.op_int_type_cast(regs)?,
            Opcode::LongToDouble => {
                self.op_cast(regs, |v| ((v as i64) as f64).to_bits())?;
            }
            Opcode::DoubleToLong => {
                self.op_cast(regs, |v| (f64::from_bits(v) as i64) as u64)?;
            }
            Opcode::DoubleToFloat => {
                self.op_cast(regs, |v| (f64::from_bits(v) as f32).to_bits() as u64)?;
            }
            Opcode::FloatToDouble => {
                self.op_cast(regs, |v| (f32::from_bits(v as u32) as f64).to_bits())?;
            }

            Opcode::Open => {
                let rpath = self.fetch_reg(regs)?;
                let rflags = self.fetch_reg(regs)?;
                let rmode = self.fetch_reg(regs)?;
                let rd = self.fetch_reg(regs)?;
                let bytes = self.memory.get_cstring(regs.get(rpath)?)?;
                let path = String::from_utf8(bytes).map_err(|_| {
                    VmError::IoError(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "path is not valid utf-8",
                    ))
                })?;
                return Ok(Step::Open {
                    path,
                    flags: regs.get(rflags)?,
                    mode: regs.get(rmode)?,
                    dst: rd,
                });
            }
            Opcode::Close => {
                let rfd = self.fetch_reg(regs)?;
                let rd = self.fetch_reg(regs)?;
                return Ok(Step::Close {
                    fd: regs.get(rfd)?,
                    dst: rd,
                });
            }
            Opcode::Read => {
                let rfd = self.fetch_reg(regs)?;
                let rbuf = self.fetch_reg(regs)?;
                let rcnt = self.fetch_reg(regs)?;
                let rd = self.fetch_reg(regs)?;
                return Ok(Step::Read {
                    fd: regs.get(rfd)?,
                    buf: regs.get(rbuf)?,
                    count: regs.get(rcnt)?,
                    dst: rd,
                });
            }
            Opcode::Write => {
                let rfd = self.fetch_reg(regs)?;
                let rbuf = self.fetch_reg(regs)?;
                let rcnt = self.fetch_reg(regs)?;
                let rd = self.fetch_reg(regs)?;
                let count = regs.get(rcnt)?;
                let mut data = vec![0u8; count as usize];
                self.memory.get_bytes(regs.get(rbuf)?, &mut data)?;
                return Ok(Step::Write {
                    fd: regs.get(rfd)?,
                    data,
                    dst: rd,
                });
            }

            Opcode::CreateFrame => {
                let size = self.fetch_u64(regs)?;
                self.push_u64(regs, regs.bp())?;
                regs.set_bp(regs.sp());
                let sp = regs.sp().wrapping_sub(size);
                self.check_stack(regs.sp(), sp)?;
                regs.set_sp(sp);
            }
            Opcode::DestroyFrame => {
                let size = self.fetch_u64(regs)?;
                regs.set_sp(regs.sp().wrapping_add(size));
                let bp = self.pop_u64(regs)?;
                regs.set_bp(bp);
            }

            Opcode::Exit => {
                let rstatus = self.fetch_reg(regs)?;
                let status = regs.get(rstatus)?;
                self.vm.exit(status);
                return Ok(Step::Finish);
            }
            Opcode::ExitImmediate => {
                let status = self.fetch_u64(regs)?;
                self.vm.exit(status);
                return Ok(Step::Finish);
            }
            Opcode::ThreadFinish => return Ok(Step::Finish),

            Opcode::GetFieldAddress => {
                let robj = self.fetch_reg(regs)?;
                let offset = self.fetch_u64(regs)?;
                let rd = self.fetch_reg(regs)?;
                let addr = regs.get(robj)?.wrapping_add(offset);
                regs.set(rd, addr)?;
            }
            Opcode::GetLocalAddress => {
                let offset = self.fetch_u64(regs)?;
                let rd = self.fetch_reg(regs)?;
                regs.set(rd, regs.bp().wrapping_sub(offset))?;
            }
            Opcode::GetParameterAddress => {
                let offset = self.fetch_u64(regs)?;
                let rd = self.fetch_reg(regs)?;
                regs.set(rd, regs.bp().wrapping_add(offset))?;
            }

            Opcode::LoadField => {
                let (width, base, offset) = self.fetch_field_operands(regs, FieldBase::Object)?;
                let rd = self.fetch_reg(regs)?;
                let value = self.load_sized(base.wrapping_add(offset), width)?;
                regs.set(rd, value)?;
            }
            Opcode::StoreField => {
                let (width, base, offset) = self.fetch_field_operands(regs, FieldBase::Object)?;
                let rs = self.fetch_reg(regs)?;
                let value = regs.get(rs)?;
                self.store_sized(base.wrapping_add(offset), width, value)?;
            }
            Opcode::LoadLocal => {
                let (width, base, offset) = self.fetch_field_operands(regs, FieldBase::Local)?;
                let rd = self.fetch_reg(regs)?;
                let value = self.load_sized(base.wrapping_sub(offset), width)?;
                regs.set(rd, value)?;
            }
            Opcode::StoreLocal => {
                let (width, base, offset) = self.fetch_field_operands(regs, FieldBase::Local)?;
                let rs = self.fetch_reg(regs)?;
                let value = regs.get(rs)?;
                self.store_sized(base.wrapping_sub(offset), width, value)?;
            }
            Opcode::LoadParameter => {
                let (width, base, offset) = self.fetch_field_operands(regs, FieldBase::Local)?;
                let rd = self.fetch_reg(regs)?;
                let value = self.load_sized(base.wrapping_add(offset), width)?;
                regs.set(rd, value)?;
            }
            Opcode::StoreParameter => {
                let (width, base, offset) = self.fetch_field_operands(regs, FieldBase::Local)?;
                let rs = self.fetch_reg(regs)?;
                let value = regs.get(rs)?;
                self.store_sized(base.wrapping_add(offset), width, value)?;
            }

            Opcode::CreateThread => {
                let rentry = self.fetch_reg(regs)?;
                let rd = self.fetch_reg(regs)?;
                let entry = regs.get(rentry)?;
                let tid = self.vm.create_thread(entry)?;
                regs.set(rd, tid)?;
            }
            Opcode::ThreadControl => {
                let rtid = self.fetch_reg(regs)?;
                let command = self.fetch_u8(regs)?;
                let tid = regs.get(rtid)?;
                match command {
                    TC_STOP => self.vm.stop_thread(tid),
                    TC_WAIT => return Ok(Step::Join(tid)),
                    TC_GET_REGISTER => {
                        let src = self.fetch_u8(regs)?;
                        let dst = self.fetch_reg(regs)?;
                        return Ok(Step::GetRegister { tid, src, dst });
                    }
                    TC_SET_REGISTER => {
                        let dst = self.fetch_u8(regs)?;
                        let rs = self.fetch_reg(regs)?;
                        let value = regs.get(rs)?;
                        return Ok(Step::SetRegister { tid, dst, value });
                    }
                    _ => return Err(VmError::InvalidThreadCommand { command }),
                }
            }

            Opcode::Syscall => {
                let _rnum = self.fetch_reg(regs)?;
                regs.set(RV, 0)?;
            }
            Opcode::InvokeNative => {
                let _rptr = self.fetch_reg(regs)?;
            }
            Opcode::JitForRange => {
                let _rstart = self.fetch_reg(regs)?;
                let _rlen = self.fetch_reg(regs)?;
            }
        }

        Ok(Step::Continue)
    }

    // ==================== Operand fetch ====================

    fn fetch_u8(&self, regs: &mut Registers) -> Result<u8, VmError> {
        let pc = regs.pc();
        let byte = self.memory.fetch_u8(pc)?;
        regs.set_pc(pc.wrapping_add(1));
        Ok(byte)
    }

    /// A register operand: one byte off the instruction stream.
    fn fetch_reg(&self, regs: &mut Registers) -> Result<u8, VmError> {
        self.fetch_u8(regs)
    }

    /// A little-endian immediate of `width` ∈ {1, 2, 4, 8} bytes,
    /// zero-extended.
    fn fetch_immediate(&self, regs: &mut Registers, width: usize) -> Result<u64, VmError> {
        let pc = regs.pc();
        let mut buf = [0u8; 8];
        self.memory.fetch_bytes(pc, &mut buf[..width])?;
        regs.set_pc(pc.wrapping_add(width as u64));
        Ok(u64::from_le_bytes(buf))
    }

    fn fetch_u64(&self, regs: &mut Registers) -> Result<u64, VmError> {
        self.fetch_immediate(regs, 8)
    }

    // ==================== Stack ====================

    /// Faults when a push moves SP below the thread's stack allocation.
    /// Bytecode that repoints SP elsewhere is on its own; only growth of the
    /// unit's own stack is policed.
    fn check_stack(&self, old_sp: u64, new_sp: u64) -> Result<(), VmError> {
        let in_own_stack = old_sp >= self.stack_base && old_sp <= self.stack_top.wrapping_add(1);
        // new_sp > old_sp means the subtraction wrapped below zero.
        if in_own_stack && (new_sp < self.stack_base || new_sp > old_sp) {
            return Err(VmError::StackOverflow {
                sp: new_sp,
                limit: self.stack_base,
            });
        }
        Ok(())
    }

    fn push_u64(&self, regs: &mut Registers, value: u64) -> Result<(), VmError> {
        let sp = regs.sp().wrapping_sub(8);
        self.check_stack(regs.sp(), sp)?;
        self.memory.set_u64(sp, value)?;
        regs.set_sp(sp);
        Ok(())
    }

    fn pop_u64(&self, regs: &mut Registers) -> Result<u64, VmError> {
        let sp = regs.sp();
        let value = self.memory.get_u64(sp)?;
        regs.set_sp(sp.wrapping_add(8));
        Ok(value)
    }

    fn op_push(&self, regs: &mut Registers, width: u64) -> Result<(), VmError> {
        let rs = self.fetch_reg(regs)?;
        let value = regs.get(rs)?;
        let sp = regs.sp().wrapping_sub(width);
        self.check_stack(regs.sp(), sp)?;
        self.memory
            .set_bytes(sp, &value.to_le_bytes()[..width as usize])?;
        regs.set_sp(sp);
        Ok(())
    }

    fn op_pop(&self, regs: &mut Registers, width: u64) -> Result<(), VmError> {
        let rd = self.fetch_reg(regs)?;
        let sp = regs.sp();
        let value = self.load_sized(sp, width as usize)?;
        regs.set(rd, value)?;
        regs.set_sp(sp.wrapping_add(width));
        Ok(())
    }

    // ==================== Memory ====================

    fn load_sized(&self, addr: u64, width: usize) -> Result<u64, VmError> {
        let mut buf = [0u8; 8];
        self.memory.get_bytes(addr, &mut buf[..width])?;
        Ok(u64::from_le_bytes(buf))
    }

    fn store_sized(&self, addr: u64, width: usize, value: u64) -> Result<(), VmError> {
        self.memory.set_bytes(addr, &value.to_le_bytes()[..width])
    }

    fn op_load(&self, regs: &mut Registers, width: usize) -> Result<(), VmError> {
        let raddr = self.fetch_reg(regs)?;
        let rd = self.fetch_reg(regs)?;
        let value = self.load_sized(regs.get(raddr)?, width)?;
        regs.set(rd, value)
    }

    fn op_store(&self, regs: &mut Registers, width: usize) -> Result<(), VmError> {
        let raddr = self.fetch_reg(regs)?;
        let rs = self.fetch_reg(regs)?;
        let value = regs.get(rs)?;
        self.store_sized(regs.get(raddr)?, width, value)
    }

    fn fetch_field_operands(
        &self,
        regs: &mut Registers,
        base: FieldBase,
    ) -> Result<(usize, u64, u64), VmError> {
        let tag = self.fetch_u8(regs)?;
        let width = width_from_tag(tag)?;
        let base = match base {
            FieldBase::Object => {
                let robj = self.fetch_reg(regs)?;
                regs.get(robj)?
            }
            FieldBase::Local => regs.bp(),
        };
        let offset = self.fetch_u64(regs)?;
        Ok((width, base, offset))
    }

    // ==================== Compare / moves / jumps ====================

    fn op_cmp(&self, regs: &mut Registers) -> Result<(), VmError> {
        let tag = self.fetch_u8(regs)?;
        let r1 = self.fetch_reg(regs)?;
        let r2 = self.fetch_reg(regs)?;
        let flags = compare(tag, regs.get(r1)?, regs.get(r2)?, regs.flags())?;
        regs.set_flags(flags);
        Ok(())
    }

    fn op_atomic_cmp(&self, regs: &mut Registers) -> Result<(), VmError> {
        let tag = self.fetch_u8(regs)?;
        let raddr = self.fetch_reg(regs)?;
        let r2 = self.fetch_reg(regs)?;
        let addr = regs.get(raddr)?;
        let rhs = regs.get(r2)?;
        let mem = self.memory.lock();
        let lhs = mem.get_u64(addr)?;
        let flags = compare(tag, lhs, rhs, regs.flags())?;
        regs.set_flags(flags);
        Ok(())
    }

    fn op_mov_cond(&self, regs: &mut Registers, cond: Cond) -> Result<(), VmError> {
        let rs = self.fetch_reg(regs)?;
        let rd = self.fetch_reg(regs)?;
        if cond.holds(regs.flags()) {
            let value = regs.get(rs)?;
            regs.set(rd, value)?;
        }
        Ok(())
    }

    fn op_mov_immediate(&self, regs: &mut Registers, width: usize) -> Result<(), VmError> {
        let imm = self.fetch_immediate(regs, width)?;
        let rd = self.fetch_reg(regs)?;
        regs.set(rd, imm)
    }

    fn op_jump_cond(&self, regs: &mut Registers, cond: Cond) -> Result<(), VmError> {
        let rt = self.fetch_reg(regs)?;
        if cond.holds(regs.flags()) {
            let target = regs.get(rt)?;
            regs.set_pc(target);
        }
        Ok(())
    }

    fn op_jump_if(&self, regs: &mut Registers, when_true: bool) -> Result<(), VmError> {
        let rcond = self.fetch_reg(regs)?;
        let rt = self.fetch_reg(regs)?;
        if (regs.get(rcond)? != 0) == when_true {
            let target = regs.get(rt)?;
            regs.set_pc(target);
        }
        Ok(())
    }

    // ==================== Arithmetic ====================

    fn op_binary_int(
        &self,
        regs: &mut Registers,
        f: impl Fn(u64, u64) -> Result<u64, VmError>,
    ) -> Result<(), VmError> {
        let rs = self.fetch_reg(regs)?;
        let rd = self.fetch_reg(regs)?;
        let result = f(regs.get(rd)?, regs.get(rs)?)?;
        regs.set(rd, result)
    }

    fn op_unary_int(&self, regs: &mut Registers, f: impl Fn(u64) -> u64) -> Result<(), VmError> {
        let r = self.fetch_reg(regs)?;
        let result = f(regs.get(r)?);
        regs.set(r, result)
    }

    fn op_binary_f64(
        &self,
        regs: &mut Registers,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<(), VmError> {
        let rs = self.fetch_reg(regs)?;
        let rd = self.fetch_reg(regs)?;
        let result = f(f64::from_bits(regs.get(rd)?), f64::from_bits(regs.get(rs)?));
        regs.set(rd, result.to_bits())
    }

    fn op_unary_f64(&self, regs: &mut Registers, f: impl Fn(f64) -> f64) -> Result<(), VmError> {
        let r = self.fetch_reg(regs)?;
        let result = f(f64::from_bits(regs.get(r)?));
        regs.set(r, result.to_bits())
    }

    fn op_binary_f32(
        &self,
        regs: &mut Registers,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<(), VmError> {
        let rs = self.fetch_reg(regs)?;
        let rd = self.fetch_reg(regs)?;
        let result = f(
            f32::from_bits(regs.get(rd)? as u32),
            f32::from_bits(regs.get(rs)? as u32),
        );
        regs.set(rd, result.to_bits() as u64)
    }

    fn op_unary_f32(&self, regs: &mut Registers, f: impl Fn(f32) -> f32) -> Result<(), VmError> {
        let r = self.fetch_reg(regs)?;
        let result = f(f32::from_bits(regs.get(r)? as u32));
        regs.set(r, result.to_bits() as u64)
    }

    // ==================== Atomics ====================
    //
    // Operands decode before the guard is taken; the read-modify-write then
    // happens entirely under the memory mutex.

    fn op_atomic_binary_int(
        &self,
        regs: &mut Registers,
        f: impl Fn(u64, u64) -> Result<u64, VmError>,
    ) -> Result<(), VmError> {
        let raddr = self.fetch_reg(regs)?;
        let rs = self.fetch_reg(regs)?;
        let addr = regs.get(raddr)?;
        let rhs = regs.get(rs)?;
        let mut mem = self.memory.lock();
        let current = mem.get_u64(addr)?;
        mem.set_u64(addr, f(current, rhs)?)
    }

    fn op_atomic_unary_int(
        &self,
        regs: &mut Registers,
        f: impl Fn(u64) -> u64,
    ) -> Result<(), VmError> {
        let raddr = self.fetch_reg(regs)?;
        let addr = regs.get(raddr)?;
        let mut mem = self.memory.lock();
        let current = mem.get_u64(addr)?;
        mem.set_u64(addr, f(current))
    }

    fn op_atomic_binary_f64(
        &self,
        regs: &mut Registers,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<(), VmError> {
        let raddr = self.fetch_reg(regs)?;
        let rs = self.fetch_reg(regs)?;
        let addr = regs.get(raddr)?;
        let rhs = f64::from_bits(regs.get(rs)?);
        let mut mem = self.memory.lock();
        let current = mem.get_f64(addr)?;
        mem.set_f64(addr, f(current, rhs))
    }

    fn op_atomic_unary_f64(
        &self,
        regs: &mut Registers,
        f: impl Fn(f64) -> f64,
    ) -> Result<(), VmError> {
        let raddr = self.fetch_reg(regs)?;
        let addr = regs.get(raddr)?;
        let mut mem = self.memory.lock();
        let current = mem.get_f64(addr)?;
        mem.set_f64(addr, f(current))
    }

    fn op_atomic_binary_f32(
        &self,
        regs: &mut Registers,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<(), VmError> {
        let raddr = self.fetch_reg(regs)?;
        let rs = self.fetch_reg(regs)?;
        let addr = regs.get(raddr)?;
        let rhs = f32::from_bits(regs.get(rs)? as u32);
        let mut mem = self.memory.lock();
        let current = mem.get_f32(addr)?;
        mem.set_f32(addr, f(current, rhs))
    }

    fn op_atomic_unary_f32(
        &self,
        regs: &mut Registers,
        f: impl Fn(f32) -> f32,
    ) -> Result<(), VmError> {
        let raddr = self.fetch_reg(regs)?;
        let addr = regs.get(raddr)?;
        let mut mem = self.memory.lock();
        let current = mem.get_f32(addr)?;
        mem.set_f32(addr, f(current))
    }

    // ==================== Casts ====================

    fn op_cast(&self, regs: &mut Registers, f: impl Fn(u64) -> u64) -> Result<(), VmError> {
        let rs = self.fetch_reg(regs)?;
        let rd = self.fetch_reg(regs)?;
        let result = f(regs.get(rs)?);
        regs.set(rd, result)
    }

    /// Integer-to-integer cast: the tags byte packs the source width in its
    /// high nibble and the destination width in its low nibble. The value is
    /// sign-extended from the source width, then truncated to the
    /// destination width (zero bits above it in the register).
    fn op_int_type_cast(&self, regs: &mut Registers) -> Result<(), VmError> {
        let tags = self.fetch_u8(regs)?;
        let rs = self.fetch_reg(regs)?;
        let rd = self.fetch_reg(regs)?;
        let src_width = tags >> 4;
        let dst_width = tags & 0x0F;
        width_from_tag(src_width).map_err(|_| VmError::InvalidTypeTag { tag: tags })?;
        width_from_tag(dst_width).map_err(|_| VmError::InvalidTypeTag { tag: tags })?;

        let extended = sign_extend(regs.get(rs)?, src_width) as u64;
        let result = match dst_width {
            8 => extended,
            w => extended & ((1u64 << (8 * w as u32)) - 1),
        };
        regs.set(rd, result)
    }
}

fn int_div(d: u64, s: u64) -> Result<u64, VmError> {
    if s == 0 {
        return Err(VmError::DivisionByZero);
    }
    Ok((d as i64).wrapping_div(s as i64) as u64)
}

fn int_mod(d: u64, s: u64) -> Result<u64, VmError> {
    if s == 0 {
        return Err(VmError::DivisionByZero);
    }
    Ok((d as i64).wrapping_rem(s as i64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_extend_by_width() {
        assert_eq!(sign_extend(0xFF, TAG_BYTE), -1);
        assert_eq!(sign_extend(0x7F, TAG_BYTE), 127);
        assert_eq!(sign_extend(0xFFFF, TAG_SHORT), -1);
        assert_eq!(sign_extend(0x8000_0000, TAG_INT), i32::MIN as i64);
        assert_eq!(sign_extend(u64::MAX, TAG_LONG), -1);
    }

    #[test]
    fn compare_sets_zero_on_equality() {
        let flags = compare(TAG_LONG, 5, 5, 0).unwrap();
        assert_eq!(flags, FLAG_ZERO);
    }

    #[test]
    fn compare_signed_and_unsigned_differ() {
        // -1 < 2 signed, but 0xFFFF... > 2 unsigned.
        let flags = compare(TAG_LONG, u64::MAX, 2, 0).unwrap();
        assert_eq!(flags & FLAG_ZERO, 0);
        assert_ne!(flags & FLAG_CARRY, 0);
        assert_eq!(flags & FLAG_UNSIGNED, 0);
    }

    #[test]
    fn compare_truncates_to_tag_width() {
        // Equal in the low byte, different above it.
        let flags = compare(TAG_BYTE, 0x1FF, 0x2FF, 0).unwrap();
        assert_ne!(flags & FLAG_ZERO, 0);
    }

    #[test]
    fn compare_float_clears_zero() {
        let a = (1.0f32).to_bits() as u64;
        let b = (2.0f32).to_bits() as u64;
        let flags = compare(TAG_FLOAT, a, b, FLAG_ZERO).unwrap();
        assert_eq!(flags & FLAG_ZERO, 0);
        assert_ne!(flags & FLAG_CARRY, 0);
        assert_ne!(flags & FLAG_UNSIGNED, 0);
        let flags = compare(TAG_FLOAT, b, a, 0).unwrap();
        assert_eq!(flags, 0);
    }

    #[test]
    fn compare_rejects_unknown_tag() {
        assert!(matches!(
            compare(3, 0, 0, 0),
            Err(VmError::InvalidTypeTag { tag: 3 })
        ));
    }

    #[test]
    fn condition_mapping_matches_flag_algebra() {
        let eq = FLAG_ZERO;
        let lt = FLAG_CARRY | FLAG_UNSIGNED;
        let gt = 0;
        assert!(Cond::E.holds(eq) && !Cond::E.holds(lt));
        assert!(Cond::Ne.holds(lt) && !Cond::Ne.holds(eq));
        assert!(Cond::L.holds(lt) && !Cond::L.holds(eq) && !Cond::L.holds(gt));
        assert!(Cond::Le.holds(lt) && Cond::Le.holds(eq) && !Cond::Le.holds(gt));
        assert!(Cond::G.holds(gt) && !Cond::G.holds(eq) && !Cond::G.holds(lt));
        assert!(Cond::Ge.holds(gt) && Cond::Ge.holds(eq) && !Cond::Ge.holds(lt));
        assert!(Cond::Ul.holds(lt) && Cond::Uge.holds(gt) && Cond::Ule.holds(eq));
        assert!(Cond::Ug.holds(gt) && !Cond::Ug.holds(eq));
    }
}
