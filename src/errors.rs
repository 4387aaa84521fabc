use thiserror::Error;

/// Errors that can occur while loading a module, assembling source, or
/// executing bytecode.
///
/// Every runtime variant is fatal for the thread that raised it; the thread
/// terminates and reports the error through its handle.
#[derive(Debug, Error)]
pub enum VmError {
    /// Access to an address with no backing page.
    #[error("illegal address {address:#x}")]
    IllegalAddress { address: u64 },
    /// Access to a page lacking the required permission.
    #[error("permission denied: {access} at {address:#x}")]
    PermissionDenied {
        address: u64,
        /// The access kind that was refused: "read", "write" or "execute".
        access: &'static str,
    },
    /// Unknown opcode byte encountered at `pc`.
    #[error("illegal opcode {opcode:#04x} at {pc:#x}")]
    IllegalOpcode { opcode: u8, pc: u64 },
    /// Register operand outside the 42-slot register file.
    #[error("register index {index} out of bounds")]
    InvalidRegister { index: u8 },
    /// Type tag operand that names no supported type.
    #[error("invalid type tag {tag:#04x}")]
    InvalidTypeTag { tag: u8 },
    /// Unknown THREAD_CONTROL command byte.
    #[error("invalid thread control command {command}")]
    InvalidThreadCommand { command: u8 },
    /// No free-list interval can satisfy the allocation.
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: u64 },
    /// The freed address lies inside an interval that is already free.
    #[error("double free at {address:#x}")]
    DoubleFree { address: u64 },
    /// Integer division or modulo by zero.
    #[error("division by zero")]
    DivisionByZero,
    /// Descriptor not present in the file table.
    #[error("invalid file descriptor {fd}")]
    InvalidFileDescriptor { fd: u64 },
    /// Underlying I/O failure during OPEN/CLOSE/READ/WRITE.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    /// The module container is malformed.
    #[error("invalid module: {reason}")]
    InvalidModule { reason: String },
    /// A push or frame grew the stack below its base.
    #[error("stack overflow: sp {sp:#x} below {limit:#x}")]
    StackOverflow { sp: u64, limit: u64 },

    /// Unrecognized instruction mnemonic during assembly.
    #[error("line {line}: unknown mnemonic {mnemonic}")]
    UnknownMnemonic { line: usize, mnemonic: String },
    /// Reference to a label that is never defined.
    #[error("undefined label: {label}")]
    UnknownLabel { label: String },
    /// Label defined more than once.
    #[error("line {line}: duplicate label {label}")]
    DuplicateLabel { line: usize, label: String },
    /// Malformed operand or directive.
    #[error("line {line}: {message}")]
    SyntaxError { line: usize, message: String },
}
