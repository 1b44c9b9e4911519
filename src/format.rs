//! The binary image contract shared by the compiler, the verifier and the VM.
//!
//! Images are little-endian throughout. A fixed 64-byte header is followed by
//! six 8-byte section descriptors and then the six sections themselves,
//! packed back-to-back in descriptor order.

use serde::{Deserialize, Serialize};

/// First magic constant of the fixed header ("BvSc").
pub const MAGIC0: u32 = 0x6353_7642;
/// Second magic constant; any format change bumps this.
pub const MAGIC1: u32 = 0x9c8a_7e0a;

pub const FIX_HEADER_SIZE: usize = 64;
pub const SECTION_HEADER_SIZE: usize = 8;
pub const FUNCTION_HEADER_SIZE: usize = 16;
pub const ROLE_HEADER_SIZE: usize = 8;
pub const STRING_HEADER_SIZE: usize = 8;
pub const NUM_SECTIONS: usize = 6;

/// Number of general-purpose value registers per activation.
pub const NUM_REGS: u8 = 16;
/// Pseudo-register tracking ownership of the outgoing packet buffer.
/// Takes a bit in the allocation mask but never appears in save masks.
pub const BUFFER_REG: u8 = 17;

/// Largest payload a register write or format target may occupy.
pub const MAX_PACKET_SIZE: u32 = 236;

/// Instruction budget for a single resumption of a fiber.
pub const MAX_STEPS: u32 = 128 * 1024;

/// Panic code raised for VM or image contract violations.
pub const PANIC_INTERNAL: u32 = 0x3f_ffff;
/// Panic code used internally to request a clean restart.
pub const PANIC_RESTART: u32 = 0x3f_fffe;
/// Largest panic code a script may raise itself.
pub const MAX_USER_PANIC: u32 = 0xffff;

/// Top 4 bits of every 16-bit instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum OpTop {
    /// ARG[12]
    SetA = 0,
    /// ARG[12]
    SetB = 1,
    /// ARG[12]
    SetC = 2,
    /// ARG[12]
    SetD = 3,
    /// A/B/C/D[2] ARG[10] — ORs `ARG << 12` into the selected accumulator
    SetHigh = 4,
    /// OP[4] DST[4] SRC[4]
    Unary = 5,
    /// OP[4] DST[4] SRC[4]
    Binary = 6,
    /// DST[4] A:CELLKIND[2] B:IDX[6]; C = buffer byte offset
    LoadCell = 7,
    /// SRC[4] A:CELLKIND[2] B:IDX[6]; C = buffer byte offset
    StoreCell = 8,
    /// REG[4] BACK[1] IF_ZERO[1] B:OFF[6]
    Jump = 9,
    /// NUMARGS[4] MODE[2] B:FNIDX[6]; D = register save mask
    Call = 10,
    /// A:ARG[4] OP[8]
    Sync = 11,
    /// D:SAVEMASK[4] OP[8]
    Async = 12,
}

impl OpTop {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::SetA,
            1 => Self::SetB,
            2 => Self::SetC,
            3 => Self::SetD,
            4 => Self::SetHigh,
            5 => Self::Unary,
            6 => Self::Binary,
            7 => Self::LoadCell,
            8 => Self::StoreCell,
            9 => Self::Jump,
            10 => Self::Call,
            11 => Self::Sync,
            12 => Self::Async,
            _ => return None,
        })
    }
}

/// Synchronous operations; complete within the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpSync {
    /// Pop the current activation
    Return = 0,
    /// A = size; zero the packet buffer
    SetupBuffer = 1,
    /// A = role index; park the fiber until a packet for the role arrives
    ObserveRole = 2,
    /// A = string index, B = number of argument registers, C = offset
    Format = 3,
    /// A = string index; copy the string into the buffer
    Memcpy = 4,
    /// Like `Format` but the result is logged instead of kept
    LogFormat = 5,
    /// A = math op; r0 := op(r0)
    Math1 = 6,
    /// A = math op; r0 := op(r0, r1)
    Math2 = 7,
    /// A = panic code
    Panic = 8,
}

impl OpSync {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Return,
            1 => Self::SetupBuffer,
            2 => Self::ObserveRole,
            3 => Self::Format,
            4 => Self::Memcpy,
            5 => Self::LogFormat,
            6 => Self::Math1,
            7 => Self::Math2,
            8 => Self::Panic,
            _ => return None,
        })
    }
}

/// Asynchronous operations; save live registers and suspend the fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpAsync {
    /// A = timeout in ms (0 = until next event)
    Yield = 0,
    /// A = number of argument registers; the label is the current buffer
    CloudUpload = 1,
    /// A = role index, B = register code, C = refresh timeout in ms
    QueryReg = 2,
    /// A = role index, B = register code, C = payload size
    SetReg = 3,
}

impl OpAsync {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Yield,
            1 => Self::CloudUpload,
            2 => Self::QueryReg,
            3 => Self::SetReg,
            _ => return None,
        })
    }
}

/// Call modes, bits 6..8 of a CALL word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCall {
    /// Ordinary call in the current fiber
    Sync = 0,
    /// Start a new fiber
    Bg = 1,
    /// Start a new fiber unless one for this function is already running
    BgMax1 = 2,
    /// Like `BgMax1`, but a duplicate marks the running fiber for one restart
    BgMax1Pend1 = 3,
}

impl OpCall {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Sync,
            1 => Self::Bg,
            2 => Self::BgMax1,
            3 => Self::BgMax1Pend1,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpUnary {
    Id = 0,
    Neg = 1,
    Not = 2,
    Abs = 3,
}

impl OpUnary {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Id,
            1 => Self::Neg,
            2 => Self::Not,
            3 => Self::Abs,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpBinary {
    Add = 1,
    Sub = 2,
    Div = 3,
    Mul = 4,
    Lt = 5,
    Le = 6,
    Eq = 7,
    Ne = 8,
    And = 9,
    Or = 10,
}

impl OpBinary {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Add,
            2 => Self::Sub,
            3 => Self::Div,
            4 => Self::Mul,
            5 => Self::Lt,
            6 => Self::Le,
            7 => Self::Eq,
            8 => Self::Ne,
            9 => Self::And,
            10 => Self::Or,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpMath1 {
    Floor = 0,
    Round = 1,
    Ceil = 2,
    LogE = 3,
    /// r0 := r0 * random_uniform(0, 1)
    Random = 4,
}

impl OpMath1 {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Floor,
            1 => Self::Round,
            2 => Self::Ceil,
            3 => Self::LogE,
            4 => Self::Random,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpMath2 {
    Min = 0,
    Max = 1,
    Pow = 2,
}

impl OpMath2 {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Min,
            1 => Self::Max,
            2 => Self::Pow,
            _ => return None,
        })
    }
}

/// Addressing kinds for LOAD_CELL / STORE_CELL.
///
/// Values below `0x100` may appear in emitted bytecode; the `X_*` kinds are
/// compiler-internal descriptors that must be lowered before emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CellKind {
    Local = 0,
    Global = 1,
    FloatConst = 2,
    /// Small non-negative integer encoded directly in the index
    Identity = 3,
    /// Packet buffer field; idx = shift[4]:numfmt[4], C accumulator = offset
    Buffer = 4,
    /// Well-known runtime values, see [`ValueSpecial`]
    Special = 5,

    XEvent = 0x100,
    XReg = 0x101,
    XRole = 0x102,
    XValueSeq = 0x103,
    XCurrBuffer = 0x104,
    XString = 0x105,
    XFpReg = 0x106,
    XFloat = 0x107,
    XFunction = 0x108,
    XError = 0x109,
}

impl CellKind {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => Self::Local,
            1 => Self::Global,
            2 => Self::FloatConst,
            3 => Self::Identity,
            4 => Self::Buffer,
            5 => Self::Special,
            _ => return None,
        })
    }

    /// Whether values of this kind may appear in emitted instructions.
    pub fn is_concrete(self) -> bool {
        (self as u16) < 0x100
    }
}

/// Indices of `CellKind::Special`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ValueSpecial {
    Nan = 0,
    /// Size of the current packet payload
    Size = 1,
    /// Event code of the current packet
    EvCode = 2,
    /// Register code of the current packet
    RegGetCode = 3,
    /// Role index the current packet was dispatched for
    RoleId = 4,
}

pub const VALUE_SPECIAL_MAX: u16 = ValueSpecial::RoleId as u16;

impl ValueSpecial {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => Self::Nan,
            1 => Self::Size,
            2 => Self::EvCode,
            3 => Self::RegGetCode,
            4 => Self::RoleId,
            _ => return None,
        })
    }
}

/// Numeric formats for buffer field access; idx = shift[4]:numfmt[4].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpFmt {
    U8 = 0b0000,
    U16 = 0b0001,
    U32 = 0b0010,
    U64 = 0b0011,
    I8 = 0b0100,
    I16 = 0b0101,
    I32 = 0b0110,
    I64 = 0b0111,
    F32 = 0b1010,
    F64 = 0b1011,
}

impl OpFmt {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0b0000 => Self::U8,
            0b0001 => Self::U16,
            0b0010 => Self::U32,
            0b0011 => Self::U64,
            0b0100 => Self::I8,
            0b0101 => Self::I16,
            0b0110 => Self::I32,
            0b0111 => Self::I64,
            0b1010 => Self::F32,
            0b1011 => Self::F64,
            _ => return None,
        })
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }
}

/// Width in bits of a buffer field format.
pub fn bit_size(fmt: OpFmt) -> u32 {
    8 << (fmt as u32 & 0b11)
}

/// Prefix instructions accumulate immediates; everything else consumes them.
pub fn is_prefix_instr(instr: u16) -> bool {
    (instr >> 12) <= OpTop::SetHigh as u16
}

/// Population count of a register mask.
pub fn num_set_bits(mask: u32) -> u32 {
    mask.count_ones()
}

/// Resolves indices to names while disassembling.
pub trait InstrArgResolver {
    fn describe_cell(&self, kind: CellKind, idx: u32) -> Option<String> {
        let _ = (kind, idx);
        None
    }
    fn fun_name(&self, idx: u32) -> Option<String> {
        let _ = idx;
        None
    }
    fn role_name(&self, idx: u32) -> Option<String> {
        let _ = idx;
        None
    }
}

/// Resolver that leaves every index numeric.
pub struct NoResolver;

impl InstrArgResolver for NoResolver {}

/// Accumulator state carried across a run of prefix instructions while
/// disassembling; mirrors the VM's `params`.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstrParams {
    pub params: [u32; 4],
}

impl InstrParams {
    pub fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self) -> [u32; 4] {
        let p = self.params;
        self.params = [0; 4];
        p
    }
}

/// Renders one instruction word, updating `state` the way execution would.
pub fn stringify_instr(
    state: &mut InstrParams,
    instr: u16,
    resolver: &dyn InstrArgResolver,
) -> String {
    const ABCD: [&str; 4] = ["A", "B", "C", "D"];

    let op = instr >> 12;
    let arg12 = u32::from(instr & 0xfff);
    let arg10 = u32::from(instr & 0x3ff);
    let arg8 = (instr & 0xff) as u8;
    let arg6 = u32::from(instr & 0x3f);
    let subop = (instr >> 8) as u8 & 0xf;
    let reg1 = (instr >> 8) & 0xf;
    let reg2 = (instr >> 4) & 0xf;
    let reg3 = instr & 0xf;

    let top = match OpTop::from_u8(op as u8) {
        Some(top) => top,
        None => return format!("???op {:#x}", instr),
    };

    if top <= OpTop::SetD {
        state.params[op as usize] = arg12;
        return format!("[{} {:#x}] ", ABCD[op as usize], arg12);
    }
    if top == OpTop::SetHigh {
        let sel = (arg12 >> 10) as usize;
        state.params[sel] |= arg10 << 12;
        return format!("[upper {} {:#x}] ", ABCD[sel], arg10);
    }

    let [a, b, c, d] = state.consume();

    let cell = |kind: u32, idx: u32, off: u32| -> String {
        let kind = match CellKind::from_u16(kind as u16) {
            Some(kind) => kind,
            None => return format!("C?{}[{}]", kind, idx),
        };
        if let Some(name) = resolver.describe_cell(kind, idx) {
            return name;
        }
        match kind {
            CellKind::Local => format!("LOC[{}]", idx),
            CellKind::Global => format!("GLB[{}]", idx),
            CellKind::FloatConst => format!("F64[{}]", idx),
            CellKind::Identity => format!("{}", idx),
            CellKind::Buffer => format!("BUF[fmt={:#x} off={}]", idx, off),
            CellKind::Special => format!("SPEC[{}]", idx),
            _ => unreachable!(),
        }
    };

    match top {
        OpTop::Unary => {
            let name = match OpUnary::from_u8(subop) {
                Some(OpUnary::Id) => "",
                Some(OpUnary::Neg) => "-",
                Some(OpUnary::Not) => "!",
                Some(OpUnary::Abs) => "abs ",
                None => "?un?",
            };
            format!("r{} := {}r{}", reg2, name, reg3)
        }
        OpTop::Binary => {
            let name = match OpBinary::from_u8(subop) {
                Some(OpBinary::Add) => "+",
                Some(OpBinary::Sub) => "-",
                Some(OpBinary::Div) => "/",
                Some(OpBinary::Mul) => "*",
                Some(OpBinary::Lt) => "<",
                Some(OpBinary::Le) => "<=",
                Some(OpBinary::Eq) => "==",
                Some(OpBinary::Ne) => "!=",
                Some(OpBinary::And) => "&&",
                Some(OpBinary::Or) => "||",
                None => "?bin?",
            };
            format!("r{} := r{} {} r{}", reg2, reg2, name, reg3)
        }
        OpTop::LoadCell => {
            let kind = (a << 2) | ((u32::from(instr) >> 6) & 0x3);
            let idx = (b << 6) | arg6;
            format!("r{} := {}", reg1, cell(kind, idx, c))
        }
        OpTop::StoreCell => {
            let kind = (a << 2) | ((u32::from(instr) >> 6) & 0x3);
            let idx = (b << 6) | arg6;
            format!("{} := r{}", cell(kind, idx, c), reg1)
        }
        OpTop::Jump => {
            let off = (b << 6) | arg6;
            let back = instr & (1 << 7) != 0;
            let cond = instr & (1 << 6) != 0;
            format!(
                "jump {}{}{}",
                if back { "-" } else { "+" },
                off,
                if cond {
                    format!(" if not r{}", reg1)
                } else {
                    String::new()
                }
            )
        }
        OpTop::Call => {
            let fnidx = (b << 6) | arg6;
            let mode = match OpCall::from_u8((arg8 >> 6) & 0x3) {
                Some(OpCall::Sync) => "",
                Some(OpCall::Bg) => " bg",
                Some(OpCall::BgMax1) => " bg (max1)",
                Some(OpCall::BgMax1Pend1) => " bg (max1 pend1)",
                None => " ?mode?",
            };
            let name = resolver
                .fun_name(fnidx)
                .unwrap_or_else(|| format!("fn{}", fnidx));
            format!("call{} {} #args={} save={:#x}", mode, name, reg1, d)
        }
        OpTop::Sync => {
            let arg = (a << 4) | u32::from(reg1);
            match OpSync::from_u8(arg8) {
                Some(OpSync::Return) => "return r0".to_string(),
                Some(OpSync::SetupBuffer) => format!("setup buffer sz={}", arg),
                Some(OpSync::ObserveRole) => format!(
                    "observe {}",
                    resolver
                        .role_name(arg)
                        .unwrap_or_else(|| format!("role{}", arg))
                ),
                Some(OpSync::Format) => format!("format str={} off={} #regs={}", arg, c, b),
                Some(OpSync::Memcpy) => format!("memcpy str={}", arg),
                Some(OpSync::LogFormat) => format!("log str={} #regs={}", arg, b),
                Some(OpSync::Math1) => format!("math1 op={}", arg),
                Some(OpSync::Math2) => format!("math2 op={}", arg),
                Some(OpSync::Panic) => format!("panic code={}", arg),
                None => format!("sync ?op={}", arg8),
            }
        }
        OpTop::Async => {
            let save = (d << 4) | u32::from(reg1);
            let body = match OpAsync::from_u8(arg8) {
                Some(OpAsync::Yield) => format!("yield ms={}", a),
                Some(OpAsync::CloudUpload) => format!("upload #regs={}", a),
                Some(OpAsync::QueryReg) => format!(
                    "query {} reg={:#x} timeout={}",
                    resolver
                        .role_name(a)
                        .unwrap_or_else(|| format!("role{}", a)),
                    b,
                    c
                ),
                Some(OpAsync::SetReg) => format!(
                    "set {} reg={:#x} sz={}",
                    resolver
                        .role_name(a)
                        .unwrap_or_else(|| format!("role{}", a)),
                    b,
                    c
                ),
                None => format!("async ?op={}", arg8),
            };
            format!("{} save={:#x}", body, save)
        }
        _ => unreachable!(),
    }
}

/// Per-function source map entry: 1-based source line, first halfword of the
/// range, halfword count.
pub type SrcMapEntry = (u32, u32, u32);

/// Debug information emitted next to the binary image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugInfo {
    pub functions: Vec<FunctionDebugInfo>,
    pub globals: Vec<String>,
    pub roles: Vec<RoleDebugInfo>,
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionDebugInfo {
    pub name: String,
    /// (line, start halfword, halfword count) triples
    pub srcmap: Vec<SrcMapEntry>,
    pub locals: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleDebugInfo {
    pub name: String,
    pub service_class: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_detection() {
        assert!(is_prefix_instr((OpTop::SetA as u16) << 12));
        assert!(is_prefix_instr((OpTop::SetHigh as u16) << 12 | 0x123));
        assert!(!is_prefix_instr((OpTop::Unary as u16) << 12));
        assert!(!is_prefix_instr((OpTop::Async as u16) << 12));
    }

    #[test]
    fn fmt_bit_sizes() {
        assert_eq!(bit_size(OpFmt::U8), 8);
        assert_eq!(bit_size(OpFmt::I16), 16);
        assert_eq!(bit_size(OpFmt::F32), 32);
        assert_eq!(bit_size(OpFmt::F64), 64);
    }

    #[test]
    fn accumulators_reset_after_real_instr() {
        let mut st = InstrParams::new();
        stringify_instr(&mut st, (OpTop::SetB as u16) << 12 | 0x7, &NoResolver);
        assert_eq!(st.params[1], 0x7);
        stringify_instr(&mut st, (OpTop::Jump as u16) << 12 | 0x1, &NoResolver);
        assert_eq!(st.params, [0; 4]);
    }

    #[test]
    fn set_high_extends() {
        let mut st = InstrParams::new();
        stringify_instr(&mut st, (OpTop::SetA as u16) << 12 | 0xfff, &NoResolver);
        stringify_instr(&mut st, (OpTop::SetHigh as u16) << 12 | 0x3, &NoResolver);
        assert_eq!(st.params[0], 0x3fff);
    }

    #[test]
    fn cell_kind_concreteness() {
        assert!(CellKind::Global.is_concrete());
        assert!(CellKind::Special.is_concrete());
        assert!(!CellKind::XRole.is_concrete());
        assert!(!CellKind::XCurrBuffer.is_concrete());
    }

    proptest::proptest! {
        #[test]
        fn stringify_handles_any_word(words in proptest::collection::vec(proptest::prelude::any::<u16>(), 0..32)) {
            let mut st = InstrParams::new();
            for word in words {
                let _ = stringify_instr(&mut st, word, &NoResolver);
            }
        }
    }
}
