//! Instruction Set Architecture definitions.
//!
//! [`for_each_opcode!`](crate::for_each_opcode) holds the canonical opcode
//! list and invokes a callback macro for code generation, so the enum, the
//! decoder and the assembler never drift apart. This module generates:
//!
//! - The [`Opcode`] enum with the wire numbering
//! - `TryFrom<u8>` for decoding
//! - [`Opcode::mnemonic`] and [`Opcode::from_mnemonic`]
//! - [`Opcode::operands`], the operand shape used by the assembler
//!
//! # Encoding
//!
//! Instructions are variable length: a one-byte opcode followed by its
//! operands in table order. Register operands are one byte (an index into
//! the 42-slot register file), immediates are 1/2/4/8 bytes little-endian,
//! type tags and thread-control commands are one byte. `THREAD_CONTROL`
//! additionally carries two register bytes for its GET/SET commands.

use crate::errors::VmError;

/// Operand kinds appearing in the canonical opcode list.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Operand {
    /// One-byte register index.
    Reg,
    /// 1-byte immediate.
    Imm1,
    /// 2-byte immediate, little-endian.
    Imm2,
    /// 4-byte immediate, little-endian.
    Imm4,
    /// 8-byte immediate, little-endian. Also used for offsets and addresses.
    Imm8,
    /// One-byte type tag (`TAG_*`).
    Tag,
    /// One-byte thread-control command (`TC_*`).
    Cmd,
}

impl Operand {
    /// Encoded width in bytes.
    pub const fn width(&self) -> usize {
        match self {
            Operand::Reg | Operand::Imm1 | Operand::Tag | Operand::Cmd => 1,
            Operand::Imm2 => 2,
            Operand::Imm4 => 4,
            Operand::Imm8 => 8,
        }
    }
}

/// Invokes a callback macro with the complete opcode definition list.
///
/// The numbering is part of the wire format and must never be reordered;
/// new opcodes go at the end.
#[macro_export]
macro_rules! for_each_opcode {
    ($callback:ident) => {
        $callback! {
            /// NOP ; no effect
            Nop = 0, "NOP" => [],
            // =========================
            // Stack
            // =========================
            /// PUSH_1 rs ; SP -= 1, m8[SP] = rs
            Push1 = 1, "PUSH_1" => [rs: Reg],
            /// PUSH_2 rs ; SP -= 2, m16[SP] = rs
            Push2 = 2, "PUSH_2" => [rs: Reg],
            /// PUSH_4 rs ; SP -= 4, m32[SP] = rs
            Push4 = 3, "PUSH_4" => [rs: Reg],
            /// PUSH_8 rs ; SP -= 8, m64[SP] = rs
            Push8 = 4, "PUSH_8" => [rs: Reg],
            /// POP_1 rd ; rd = m8[SP], SP += 1
            Pop1 = 5, "POP_1" => [rd: Reg],
            /// POP_2 rd ; rd = m16[SP], SP += 2
            Pop2 = 6, "POP_2" => [rd: Reg],
            /// POP_4 rd ; rd = m32[SP], SP += 4
            Pop4 = 7, "POP_4" => [rd: Reg],
            /// POP_8 rd ; rd = m64[SP], SP += 8
            Pop8 = 8, "POP_8" => [rd: Reg],
            // =========================
            // Load / store
            // =========================
            /// LOAD_1 raddr, rd ; rd = m8[raddr]
            Load1 = 9, "LOAD_1" => [raddr: Reg, rd: Reg],
            /// LOAD_2 raddr, rd ; rd = m16[raddr]
            Load2 = 10, "LOAD_2" => [raddr: Reg, rd: Reg],
            /// LOAD_4 raddr, rd ; rd = m32[raddr]
            Load4 = 11, "LOAD_4" => [raddr: Reg, rd: Reg],
            /// LOAD_8 raddr, rd ; rd = m64[raddr]
            Load8 = 12, "LOAD_8" => [raddr: Reg, rd: Reg],
            /// STORE_1 raddr, rs ; m8[raddr] = rs
            Store1 = 13, "STORE_1" => [raddr: Reg, rs: Reg],
            /// STORE_2 raddr, rs ; m16[raddr] = rs
            Store2 = 14, "STORE_2" => [raddr: Reg, rs: Reg],
            /// STORE_4 raddr, rs ; m32[raddr] = rs
            Store4 = 15, "STORE_4" => [raddr: Reg, rs: Reg],
            /// STORE_8 raddr, rs ; m64[raddr] = rs
            Store8 = 16, "STORE_8" => [raddr: Reg, rs: Reg],
            // =========================
            // Compare
            // =========================
            /// CMP tag, r1, r2 ; FLAGS = compare(r1, r2) under tag
            Cmp = 17, "CMP" => [tag: Tag, r1: Reg, r2: Reg],
            /// ATOMIC_CMP tag, raddr, r2 ; FLAGS = compare(m64[raddr], r2), locked
            AtomicCmp = 18, "ATOMIC_CMP" => [tag: Tag, raddr: Reg, r2: Reg],
            // =========================
            // Moves
            // =========================
            /// MOV_E rs, rd ; rd = rs when ZERO
            MovE = 19, "MOV_E" => [rs: Reg, rd: Reg],
            /// MOV_NE rs, rd ; rd = rs when !ZERO
            MovNe = 20, "MOV_NE" => [rs: Reg, rd: Reg],
            /// MOV_L rs, rd ; rd = rs when signed less
            MovL = 21, "MOV_L" => [rs: Reg, rd: Reg],
            /// MOV_LE rs, rd ; rd = rs when signed less-or-equal
            MovLe = 22, "MOV_LE" => [rs: Reg, rd: Reg],
            /// MOV_G rs, rd ; rd = rs when signed greater
            MovG = 23, "MOV_G" => [rs: Reg, rd: Reg],
            /// MOV_GE rs, rd ; rd = rs when signed greater-or-equal
            MovGe = 24, "MOV_GE" => [rs: Reg, rd: Reg],
            /// MOV_UL rs, rd ; rd = rs when unsigned less
            MovUl = 25, "MOV_UL" => [rs: Reg, rd: Reg],
            /// MOV_ULE rs, rd ; rd = rs when unsigned less-or-equal
            MovUle = 26, "MOV_ULE" => [rs: Reg, rd: Reg],
            /// MOV_UG rs, rd ; rd = rs when unsigned greater
            MovUg = 27, "MOV_UG" => [rs: Reg, rd: Reg],
            /// MOV_UGE rs, rd ; rd = rs when unsigned greater-or-equal
            MovUge = 28, "MOV_UGE" => [rs: Reg, rd: Reg],
            /// MOV rs, rd ; rd = rs
            Mov = 29, "MOV" => [rs: Reg, rd: Reg],
            /// MOV_IMMEDIATE1 imm8, rd ; rd = zero-extended immediate
            MovImmediate1 = 30, "MOV_IMMEDIATE1" => [imm: Imm1, rd: Reg],
            /// MOV_IMMEDIATE2 imm16, rd ; rd = zero-extended immediate
            MovImmediate2 = 31, "MOV_IMMEDIATE2" => [imm: Imm2, rd: Reg],
            /// MOV_IMMEDIATE4 imm32, rd ; rd = zero-extended immediate
            MovImmediate4 = 32, "MOV_IMMEDIATE4" => [imm: Imm4, rd: Reg],
            /// MOV_IMMEDIATE8 imm64, rd ; rd = immediate
            MovImmediate8 = 33, "MOV_IMMEDIATE8" => [imm: Imm8, rd: Reg],
            // =========================
            // Jumps
            // =========================
            /// JUMP rt ; PC = rt
            Jump = 34, "JUMP" => [rt: Reg],
            /// JUMP_IMMEDIATE addr64 ; PC = addr
            JumpImmediate = 35, "JUMP_IMMEDIATE" => [target: Imm8],
            /// JE rt ; PC = rt when ZERO
            Je = 36, "JE" => [rt: Reg],
            /// JNE rt ; PC = rt when !ZERO
            Jne = 37, "JNE" => [rt: Reg],
            /// JL rt ; PC = rt when signed less
            Jl = 38, "JL" => [rt: Reg],
            /// JLE rt ; PC = rt when signed less-or-equal
            Jle = 39, "JLE" => [rt: Reg],
            /// JG rt ; PC = rt when signed greater
            Jg = 40, "JG" => [rt: Reg],
            /// JGE rt ; PC = rt when signed greater-or-equal
            Jge = 41, "JGE" => [rt: Reg],
            /// JUL rt ; PC = rt when unsigned less
            Jul = 42, "JUL" => [rt: Reg],
            /// JULE rt ; PC = rt when unsigned less-or-equal
            Jule = 43, "JULE" => [rt: Reg],
            /// JUG rt ; PC = rt when unsigned greater
            Jug = 44, "JUG" => [rt: Reg],
            /// JUGE rt ; PC = rt when unsigned greater-or-equal
            Juge = 45, "JUGE" => [rt: Reg],
            // =========================
            // Memory management
            // =========================
            /// MALLOC rsize, rd ; rd = alloc(rsize)
            Malloc = 46, "MALLOC" => [rsize: Reg, rd: Reg],
            /// FREE rptr ; free(rptr)
            Free = 47, "FREE" => [rptr: Reg],
            /// REALLOC rptr, rsize, rd ; rd = realloc(rptr, rsize)
            Realloc = 48, "REALLOC" => [rptr: Reg, rsize: Reg, rd: Reg],
            // =========================
            // Integer arithmetic (rd = rd op rs, wrapping)
            // =========================
            /// ADD rs, rd ; rd = rd + rs
            Add = 49, "ADD" => [rs: Reg, rd: Reg],
            /// SUB rs, rd ; rd = rd - rs
            Sub = 50, "SUB" => [rs: Reg, rd: Reg],
            /// MUL rs, rd ; rd = rd * rs
            Mul = 51, "MUL" => [rs: Reg, rd: Reg],
            /// DIV rs, rd ; rd = rd / rs, fatal when rs = 0
            Div = 52, "DIV" => [rs: Reg, rd: Reg],
            /// MOD rs, rd ; rd = rd % rs, fatal when rs = 0
            Mod = 53, "MOD" => [rs: Reg, rd: Reg],
            /// AND rs, rd ; rd = rd & rs
            And = 54, "AND" => [rs: Reg, rd: Reg],
            /// OR rs, rd ; rd = rd | rs
            Or = 55, "OR" => [rs: Reg, rd: Reg],
            /// XOR rs, rd ; rd = rd ^ rs
            Xor = 56, "XOR" => [rs: Reg, rd: Reg],
            /// NOT r ; r = !r (bitwise)
            Not = 57, "NOT" => [r: Reg],
            /// NEG r ; r = -r (two's complement)
            Neg = 58, "NEG" => [r: Reg],
            /// SHL rs, rd ; rd = rd << (rs & 63)
            Shl = 59, "SHL" => [rs: Reg, rd: Reg],
            /// SHR rs, rd ; rd = rd >> (rs & 63), arithmetic
            Shr = 60, "SHR" => [rs: Reg, rd: Reg],
            /// USHR rs, rd ; rd = rd >> (rs & 63), logical
            Ushr = 61, "USHR" => [rs: Reg, rd: Reg],
            /// INC r ; r = r + 1
            Inc = 62, "INC" => [r: Reg],
            /// DEC r ; r = r - 1
            Dec = 63, "DEC" => [r: Reg],
            // =========================
            // Float arithmetic
            // =========================
            /// ADD_DOUBLE rs, rd ; rd = rd + rs as f64
            AddDouble = 64, "ADD_DOUBLE" => [rs: Reg, rd: Reg],
            /// SUB_DOUBLE rs, rd ; rd = rd - rs as f64
            SubDouble = 65, "SUB_DOUBLE" => [rs: Reg, rd: Reg],
            /// MUL_DOUBLE rs, rd ; rd = rd * rs as f64
            MulDouble = 66, "MUL_DOUBLE" => [rs: Reg, rd: Reg],
            /// DIV_DOUBLE rs, rd ; rd = rd / rs as f64
            DivDouble = 67, "DIV_DOUBLE" => [rs: Reg, rd: Reg],
            /// MOD_DOUBLE rs, rd ; rd = rd % rs as f64
            ModDouble = 68, "MOD_DOUBLE" => [rs: Reg, rd: Reg],
            /// ADD_FLOAT rs, rd ; low 32 bits as f32
            AddFloat = 69, "ADD_FLOAT" => [rs: Reg, rd: Reg],
            /// SUB_FLOAT rs, rd ; low 32 bits as f32
            SubFloat = 70, "SUB_FLOAT" => [rs: Reg, rd: Reg],
            /// MUL_FLOAT rs, rd ; low 32 bits as f32
            MulFloat = 71, "MUL_FLOAT" => [rs: Reg, rd: Reg],
            /// DIV_FLOAT rs, rd ; low 32 bits as f32
            DivFloat = 72, "DIV_FLOAT" => [rs: Reg, rd: Reg],
            /// MOD_FLOAT rs, rd ; low 32 bits as f32
            ModFloat = 73, "MOD_FLOAT" => [rs: Reg, rd: Reg],
            // =========================
            // Atomic arithmetic (memory cell addressed by the first operand,
            // read-modify-write under the memory lock)
            // =========================
            /// ATOMIC_ADD raddr, rs ; m64[raddr] += rs
            AtomicAdd = 74, "ATOMIC_ADD" => [raddr: Reg, rs: Reg],
            /// ATOMIC_SUB raddr, rs ; m64[raddr] -= rs
            AtomicSub = 75, "ATOMIC_SUB" => [raddr: Reg, rs: Reg],
            /// ATOMIC_MUL raddr, rs ; m64[raddr] *= rs
            AtomicMul = 76, "ATOMIC_MUL" => [raddr: Reg, rs: Reg],
            /// ATOMIC_DIV raddr, rs ; m64[raddr] /= rs
            AtomicDiv = 77, "ATOMIC_DIV" => [raddr: Reg, rs: Reg],
            /// ATOMIC_MOD raddr, rs ; m64[raddr] %= rs
            AtomicMod = 78, "ATOMIC_MOD" => [raddr: Reg, rs: Reg],
            /// ATOMIC_AND raddr, rs ; m64[raddr] &= rs
            AtomicAnd = 79, "ATOMIC_AND" => [raddr: Reg, rs: Reg],
            /// ATOMIC_OR raddr, rs ; m64[raddr] |= rs
            AtomicOr = 80, "ATOMIC_OR" => [raddr: Reg, rs: Reg],
            /// ATOMIC_XOR raddr, rs ; m64[raddr] ^= rs
            AtomicXor = 81, "ATOMIC_XOR" => [raddr: Reg, rs: Reg],
            /// ATOMIC_NOT raddr ; m64[raddr] = !m64[raddr]
            AtomicNot = 82, "ATOMIC_NOT" => [raddr: Reg],
            /// ATOMIC_NEG raddr ; m64[raddr] = -m64[raddr]
            AtomicNeg = 83, "ATOMIC_NEG" => [raddr: Reg],
            /// ATOMIC_SHL raddr, rs ; m64[raddr] <<= rs
            AtomicShl = 84, "ATOMIC_SHL" => [raddr: Reg, rs: Reg],
            /// ATOMIC_SHR raddr, rs ; arithmetic shift
            AtomicShr = 85, "ATOMIC_SHR" => [raddr: Reg, rs: Reg],
            /// ATOMIC_USHR raddr, rs ; logical shift
            AtomicUshr = 86, "ATOMIC_USHR" => [raddr: Reg, rs: Reg],
            /// ATOMIC_INC raddr ; m64[raddr] += 1
            AtomicInc = 87, "ATOMIC_INC" => [raddr: Reg],
            /// ATOMIC_DEC raddr ; m64[raddr] -= 1
            AtomicDec = 88, "ATOMIC_DEC" => [raddr: Reg],
            /// ATOMIC_ADD_DOUBLE raddr, rs ; f64 cell
            AtomicAddDouble = 89, "ATOMIC_ADD_DOUBLE" => [raddr: Reg, rs: Reg],
            /// ATOMIC_SUB_DOUBLE raddr, rs ; f64 cell
            AtomicSubDouble = 90, "ATOMIC_SUB_DOUBLE" => [raddr: Reg, rs: Reg],
            /// ATOMIC_MUL_DOUBLE raddr, rs ; f64 cell
            AtomicMulDouble = 91, "ATOMIC_MUL_DOUBLE" => [raddr: Reg, rs: Reg],
            /// ATOMIC_DIV_DOUBLE raddr, rs ; f64 cell
            AtomicDivDouble = 92, "ATOMIC_DIV_DOUBLE" => [raddr: Reg, rs: Reg],
            /// ATOMIC_MOD_DOUBLE raddr, rs ; f64 cell
            AtomicModDouble = 93, "ATOMIC_MOD_DOUBLE" => [raddr: Reg, rs: Reg],
            /// ATOMIC_ADD_FLOAT raddr, rs ; f32 cell
            AtomicAddFloat = 94, "ATOMIC_ADD_FLOAT" => [raddr: Reg, rs: Reg],
            /// ATOMIC_SUB_FLOAT raddr, rs ; f32 cell
            AtomicSubFloat = 95, "ATOMIC_SUB_FLOAT" => [raddr: Reg, rs: Reg],
            /// ATOMIC_MUL_FLOAT raddr, rs ; f32 cell
            AtomicMulFloat = 96, "ATOMIC_MUL_FLOAT" => [raddr: Reg, rs: Reg],
            /// ATOMIC_DIV_FLOAT raddr, rs ; f32 cell
            AtomicDivFloat = 97, "ATOMIC_DIV_FLOAT" => [raddr: Reg, rs: Reg],
            /// ATOMIC_MOD_FLOAT raddr, rs ; f32 cell
            AtomicModFloat = 98, "ATOMIC_MOD_FLOAT" => [raddr: Reg, rs: Reg],
            // =========================
            // Call / return / interrupts
            // =========================
            /// CAS r1, r2, r3 ; r1 == r2 ? (r1 = r3, ZERO) : (r2 = r1, !ZERO)
            Cas = 99, "CAS" => [r1: Reg, r2: Reg, r3: Reg],
            /// INVOKE rt ; push return PC, PC = rt
            Invoke = 100, "INVOKE" => [rt: Reg],
            /// INVOKE_IMMEDIATE addr64 ; push return PC, PC = addr
            InvokeImmediate = 101, "INVOKE_IMMEDIATE" => [target: Imm8],
            /// RETURN ; PC = pop
            Return = 102, "RETURN" => [],
            /// INTERRUPT n ; push FLAGS, push PC, PC = m64[IDTR + 8n]
            Interrupt = 103, "INTERRUPT" => [n: Imm1],
            /// INTERRUPT_RETURN ; pop PC, pop FLAGS
            InterruptReturn = 104, "INTERRUPT_RETURN" => [],
            // =========================
            // Casts
            // =========================
            /// INT_TYPE_CAST tags, rs, rd ; widths: high nibble src, low dst
            IntTypeCast = 105, "INT_TYPE_CAST" => [tags: Imm1, rs: Reg, rd: Reg],
            /// LONG_TO_DOUBLE rs, rd
            LongToDouble = 106, "LONG_TO_DOUBLE" => [rs: Reg, rd: Reg],
            /// DOUBLE_TO_LONG rs, rd
            DoubleToLong = 107, "DOUBLE_TO_LONG" => [rs: Reg, rd: Reg],
            /// DOUBLE_TO_FLOAT rs, rd
            DoubleToFloat = 108, "DOUBLE_TO_FLOAT" => [rs: Reg, rd: Reg],
            /// FLOAT_TO_DOUBLE rs, rd
            FloatToDouble = 109, "FLOAT_TO_DOUBLE" => [rs: Reg, rd: Reg],
            // =========================
            // I/O
            // =========================
            /// OPEN rpath, rflags, rmode, rd ; rd = fd
            Open = 110, "OPEN" => [rpath: Reg, rflags: Reg, rmode: Reg, rd: Reg],
            /// CLOSE rfd, rd ; rd = 0
            Close = 111, "CLOSE" => [rfd: Reg, rd: Reg],
            /// READ rfd, rbuf, rcnt, rd ; rd = bytes read
            Read = 112, "READ" => [rfd: Reg, rbuf: Reg, rcnt: Reg, rd: Reg],
            /// WRITE rfd, rbuf, rcnt, rd ; rd = bytes written
            Write = 113, "WRITE" => [rfd: Reg, rbuf: Reg, rcnt: Reg, rd: Reg],
            // =========================
            // Frames
            // =========================
            /// CREATE_FRAME size64 ; push BP, BP = SP, SP -= size
            CreateFrame = 114, "CREATE_FRAME" => [size: Imm8],
            /// DESTROY_FRAME size64 ; SP += size, BP = pop
            DestroyFrame = 115, "DESTROY_FRAME" => [size: Imm8],
            // =========================
            // Termination
            // =========================
            /// EXIT rstatus ; request VM exit with status
            Exit = 116, "EXIT" => [rstatus: Reg],
            /// EXIT_IMMEDIATE status64
            ExitImmediate = 117, "EXIT_IMMEDIATE" => [status: Imm8],
            // =========================
            // Addressing
            // =========================
            /// GET_FIELD_ADDRESS robj, off64, rd ; rd = robj + off
            GetFieldAddress = 118, "GET_FIELD_ADDRESS" => [robj: Reg, off: Imm8, rd: Reg],
            /// GET_LOCAL_ADDRESS off64, rd ; rd = BP - off
            GetLocalAddress = 119, "GET_LOCAL_ADDRESS" => [off: Imm8, rd: Reg],
            /// GET_PARAMETER_ADDRESS off64, rd ; rd = BP + off
            GetParameterAddress = 120, "GET_PARAMETER_ADDRESS" => [off: Imm8, rd: Reg],
            // =========================
            // Threads
            // =========================
            /// CREATE_THREAD rentry, rd ; rd = new thread id
            CreateThread = 121, "CREATE_THREAD" => [rentry: Reg, rd: Reg],
            /// THREAD_CONTROL rtid, cmd ; GET/SET carry two register bytes
            ThreadControl = 122, "THREAD_CONTROL" => [rtid: Reg, cmd: Cmd],
            // =========================
            // Typed field / local / parameter access
            // =========================
            /// LOAD_FIELD size, robj, off64, rd ; rd = m[robj + off]
            LoadField = 123, "LOAD_FIELD" => [size: Tag, robj: Reg, off: Imm8, rd: Reg],
            /// STORE_FIELD size, robj, off64, rs ; m[robj + off] = rs
            StoreField = 124, "STORE_FIELD" => [size: Tag, robj: Reg, off: Imm8, rs: Reg],
            /// LOAD_LOCAL size, off64, rd ; rd = m[BP - off]
            LoadLocal = 125, "LOAD_LOCAL" => [size: Tag, off: Imm8, rd: Reg],
            /// STORE_LOCAL size, off64, rs ; m[BP - off] = rs
            StoreLocal = 126, "STORE_LOCAL" => [size: Tag, off: Imm8, rs: Reg],
            /// LOAD_PARAMETER size, off64, rd ; rd = m[BP + off]
            LoadParameter = 127, "LOAD_PARAMETER" => [size: Tag, off: Imm8, rd: Reg],
            /// STORE_PARAMETER size, off64, rs ; m[BP + off] = rs
            StoreParameter = 128, "STORE_PARAMETER" => [size: Tag, off: Imm8, rs: Reg],
            // =========================
            // Late additions kept in wire order
            // =========================
            /// JUMP_IF_TRUE rcond, rt ; PC = rt when rcond != 0
            JumpIfTrue = 129, "JUMP_IF_TRUE" => [rcond: Reg, rt: Reg],
            /// JUMP_IF_FALSE rcond, rt ; PC = rt when rcond == 0
            JumpIfFalse = 130, "JUMP_IF_FALSE" => [rcond: Reg, rt: Reg],
            /// SYSCALL rnum ; reserved, RV = 0
            Syscall = 131, "SYSCALL" => [rnum: Reg],
            /// THREAD_FINISH ; terminate the current thread
            ThreadFinish = 132, "THREAD_FINISH" => [],
            /// NEG_DOUBLE r ; r = -r as f64
            NegDouble = 133, "NEG_DOUBLE" => [r: Reg],
            /// NEG_FLOAT r ; low 32 bits as f32
            NegFloat = 134, "NEG_FLOAT" => [r: Reg],
            /// ATOMIC_NEG_DOUBLE raddr ; f64 cell
            AtomicNegDouble = 135, "ATOMIC_NEG_DOUBLE" => [raddr: Reg],
            /// ATOMIC_NEG_FLOAT raddr ; f32 cell
            AtomicNegFloat = 136, "ATOMIC_NEG_FLOAT" => [raddr: Reg],
            /// JUMP_IF rcond, rt ; alias of JUMP_IF_TRUE
            JumpIf = 137, "JUMP_IF" => [rcond: Reg, rt: Reg],
            /// INVOKE_NATIVE rptr ; reserved, no effect
            InvokeNative = 138, "INVOKE_NATIVE" => [rptr: Reg],
            /// JIT_FOR_RANGE rstart, rlen ; reserved, no effect
            JitForRange = 139, "JIT_FOR_RANGE" => [rstart: Reg, rlen: Reg],
        }
    };
}

#[macro_export]
macro_rules! define_opcodes {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $code:literal, $mnemonic:literal => [
                $( $field:ident : $kind:ident ),* $(,)?
            ]
        ),* $(,)?
    ) => {
        /// One-byte instruction opcodes, in wire numbering.
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $(
                $(#[$doc])*
                $name = $code,
            )*
        }

        impl TryFrom<u8> for Opcode {
            type Error = VmError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $code => Ok(Opcode::$name), )*
                    _ => Err(VmError::IllegalOpcode {
                        opcode: value,
                        pc: 0,
                    }),
                }
            }
        }

        impl Opcode {
            /// Returns the assembly mnemonic for this opcode.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            /// Resolves a mnemonic (case-insensitive) to its opcode.
            pub fn from_mnemonic(token: &str) -> Option<Opcode> {
                $(
                    if token.eq_ignore_ascii_case($mnemonic) {
                        return Some(Opcode::$name);
                    }
                )*
                None
            }

            /// Returns the operand shape used by the assembler.
            ///
            /// `THREAD_CONTROL` carries two extra register bytes for its
            /// GET/SET commands on top of the listed operands.
            pub fn operands(&self) -> &'static [Operand] {
                match self {
                    $( Opcode::$name => &[ $( Operand::$kind, )* ], )*
                }
            }
        }
    };
}

for_each_opcode!(define_opcodes);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_try_from_invalid() {
        assert!(matches!(
            Opcode::try_from(0xFF),
            Err(VmError::IllegalOpcode { opcode: 0xFF, .. })
        ));
    }

    #[test]
    fn wire_numbering_is_stable() {
        assert_eq!(Opcode::Nop as u8, 0);
        assert_eq!(Opcode::Cmp as u8, 17);
        assert_eq!(Opcode::Mov as u8, 29);
        assert_eq!(Opcode::Malloc as u8, 46);
        assert_eq!(Opcode::Cas as u8, 99);
        assert_eq!(Opcode::ThreadFinish as u8, 132);
        assert_eq!(Opcode::JitForRange as u8, 139);
    }

    #[test]
    fn mnemonic_round_trip() {
        for code in 0..=139u8 {
            let op = Opcode::try_from(code).expect("every code below 140 decodes");
            assert_eq!(Opcode::from_mnemonic(op.mnemonic()), Some(op));
        }
    }

    #[test]
    fn from_mnemonic_is_case_insensitive() {
        assert_eq!(Opcode::from_mnemonic("push_8"), Some(Opcode::Push8));
        assert_eq!(Opcode::from_mnemonic("Thread_Finish"), Some(Opcode::ThreadFinish));
        assert_eq!(Opcode::from_mnemonic("BOGUS"), None);
    }
}
