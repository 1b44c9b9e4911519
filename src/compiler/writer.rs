//! Instruction emission for one procedure: register scopes, labels and the
//! raw halfword buffer.

use crate::{
    error::{CompileError, CompileErrorTy, CompileResult, Span},
    format::{
        num_set_bits, OpAsync, OpBinary, OpSync, OpTop, OpUnary, BUFFER_REG, NUM_REGS,
    },
};

use derive_more::{From, Into};
use log::trace;
use shrinkwraprs::Shrinkwrap;

/// Handle to a jump target owned by an [`OpWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, From, Into, Shrinkwrap)]
#[repr(transparent)]
pub struct LabelId(usize);

#[derive(Debug)]
struct Label {
    name: &'static str,
    /// Halfword offset the label resolves to; `None` until emitted
    offset: Option<usize>,
    /// Halfword offsets of the SET_B of each jump pair using this label
    uses: Vec<usize>,
}

/// Emits 16-bit instruction words for a single procedure.
///
/// Registers are a bank of 16 shared by arguments, temporaries and
/// call-saved state. Allocation is scope-based: `push`/`pop` bracket a
/// lexical region and every register allocated inside is freed on `pop`.
#[derive(Debug, Default)]
pub struct OpWriter {
    binary: Vec<u16>,
    labels: Vec<Label>,
    allocated_regs_mask: u32,
    scopes: Vec<Vec<u8>>,
    max_regs: u8,
}

impl OpWriter {
    pub fn new() -> Self {
        Self {
            scopes: vec![Vec::new()],
            ..Self::default()
        }
    }

    /// Current halfword offset; the next instruction lands here.
    pub fn here(&self) -> usize {
        self.binary.len()
    }

    pub fn max_regs(&self) -> u8 {
        self.max_regs
    }

    pub fn push(&mut self) {
        self.scopes.push(Vec::new());
    }

    pub fn pop(&mut self) {
        self.pop_except(None);
    }

    /// Pop the innermost scope, optionally keeping one register alive by
    /// re-homing it into the enclosing scope.
    pub fn pop_except(&mut self, keep: Option<u8>) {
        let scope = self.scopes.pop().unwrap_or_default();
        for reg in scope {
            if Some(reg) == keep {
                if let Some(outer) = self.scopes.last_mut() {
                    outer.push(reg);
                }
                continue;
            }
            self.allocated_regs_mask &= !(1 << reg);
        }
        if self.scopes.is_empty() {
            self.scopes.push(Vec::new());
        }
    }

    /// Allocate the highest-numbered free register.
    pub fn alloc_reg(&mut self, span: Span) -> CompileResult<u8> {
        for reg in (0..NUM_REGS).rev() {
            if self.allocated_regs_mask & (1 << reg) == 0 {
                self.take_reg(reg);
                return Ok(reg);
            }
        }
        Err(CompileError::new(
            CompileErrorTy::OverflowedRegisters,
            "expression too complex (out of registers)",
            span,
        ))
    }

    /// Claim registers `0..n` for outgoing call arguments.
    pub fn alloc_arg_regs(&mut self, n: u8, span: Span) -> CompileResult<Vec<u8>> {
        let mut regs = Vec::with_capacity(n as usize);
        for reg in 0..n {
            if self.allocated_regs_mask & (1 << reg) != 0 {
                return Err(CompileError::new(
                    CompileErrorTy::OverflowedRegisters,
                    "argument registers unavailable",
                    span,
                ));
            }
            self.take_reg(reg);
            regs.push(reg);
        }
        Ok(regs)
    }

    fn take_reg(&mut self, reg: u8) {
        self.allocated_regs_mask |= 1 << reg;
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(reg);
        }
        let used = num_set_bits(self.allocated_regs_mask & 0xffff) as u8;
        if used > self.max_regs {
            self.max_regs = used;
        }
    }

    /// Reserve the outgoing packet buffer. Exactly one value may compose
    /// into it at a time.
    pub fn alloc_buf(&mut self, span: Span) -> CompileResult<()> {
        if self.allocated_regs_mask & (1 << BUFFER_REG) != 0 {
            return Err(CompileError::new(
                CompileErrorTy::InvalidArgument,
                "buffer already in use here",
                span,
            ));
        }
        self.allocated_regs_mask |= 1 << BUFFER_REG;
        Ok(())
    }

    pub fn free_buf(&mut self) {
        self.allocated_regs_mask &= !(1 << BUFFER_REG);
    }

    /// Registers that must survive a suspension point.
    fn save_regs(&mut self) -> u32 {
        let d = self.allocated_regs_mask & 0xffff;
        let regs = num_set_bits(d) as u8;
        if regs > self.max_regs {
            self.max_regs = regs;
        }
        d
    }

    fn emit_instr(&mut self, instr: u16) {
        self.binary.push(instr);
    }

    pub fn emit_raw(&mut self, op: OpTop, arg: u16) {
        debug_assert!(arg >> 12 == 0);
        self.emit_instr(((op as u16) << 12) | arg);
    }

    /// Load nonzero accumulators ahead of the next real instruction.
    /// Wide values get a SET_HIGH extension after their SET_x.
    pub fn emit_prefix(&mut self, a: u32, b: u32, c: u32, d: u32) {
        let vals = [a, b, c, d];
        for (i, &v) in vals.iter().enumerate() {
            if v == 0 {
                continue;
            }
            let set_x = OpTop::from_u8(OpTop::SetA as u8 + i as u8).unwrap();
            self.emit_raw(set_x, (v & 0xfff) as u16);
            let high = v >> 12;
            if high != 0 {
                debug_assert!(high >> 10 == 0);
                self.emit_raw(OpTop::SetHigh, ((i as u16) << 10) | high as u16);
            }
        }
    }

    pub fn emit_sync(&mut self, op: OpSync, a: u32, b: u32, c: u32, d: u32) {
        self.emit_prefix(a >> 4, b, c, d);
        self.emit_raw(OpTop::Sync, (((a & 0xf) as u16) << 8) | op as u16);
    }

    pub fn emit_async(&mut self, op: OpAsync, a: u32, b: u32, c: u32) {
        let d = self.save_regs();
        self.emit_prefix(a, b, c, d >> 4);
        self.emit_raw(OpTop::Async, (((d & 0xf) as u16) << 8) | op as u16);
    }

    pub fn emit_mov(&mut self, dst: u8, src: u8) {
        if dst != src {
            self.emit_unary(OpUnary::Id, dst, src);
        }
    }

    pub fn emit_unary(&mut self, op: OpUnary, dst: u8, src: u8) {
        self.emit_raw(
            OpTop::Unary,
            ((op as u16) << 8) | (u16::from(dst) << 4) | u16::from(src),
        );
    }

    pub fn emit_binary(&mut self, op: OpBinary, dst: u8, src: u8) {
        self.emit_raw(
            OpTop::Binary,
            ((op as u16) << 8) | (u16::from(dst) << 4) | u16::from(src),
        );
    }

    /// LOAD_CELL / STORE_CELL with the cell kind and index split across the
    /// accumulators and the instruction word.
    pub fn emit_load_store(&mut self, op: OpTop, reg: u8, celltype: u16, idx: u32, arg_c: u32) {
        debug_assert!(op == OpTop::LoadCell || op == OpTop::StoreCell);
        self.emit_prefix(u32::from(celltype) >> 2, idx >> 6, arg_c, 0);
        self.emit_raw(
            op,
            (u16::from(reg) << 8) | ((celltype & 0x3) << 6) | (idx & 0x3f) as u16,
        );
    }

    /// CALL; only synchronous calls save registers.
    pub fn emit_call(&mut self, fn_idx: u32, num_args: u8, mode: crate::format::OpCall) {
        let d = if mode == crate::format::OpCall::Sync {
            self.save_regs()
        } else {
            0
        };
        self.emit_prefix(0, fn_idx >> 6, 0, d);
        self.emit_raw(
            OpTop::Call,
            (u16::from(num_args) << 8) | ((mode as u16) << 6) | (fn_idx & 0x3f) as u16,
        );
    }

    pub fn mk_label(&mut self, name: &'static str) -> LabelId {
        self.labels.push(Label {
            name,
            offset: None,
            uses: Vec::new(),
        });
        LabelId(self.labels.len() - 1)
    }

    pub fn emit_label(&mut self, label: LabelId) {
        trace!("lbl {} @{}", self.labels[label.0].name, self.binary.len());
        debug_assert!(self.labels[label.0].offset.is_none());
        self.labels[label.0].offset = Some(self.binary.len());
    }

    /// Halfword offset a label resolved to.
    pub fn label_offset(&self, label: LabelId) -> Option<usize> {
        self.labels[label.0].offset
    }

    /// Emit a SET_B + JUMP pair; the offset is patched in `patch_labels`.
    /// With `cond`, the jump is taken only when the register is zero.
    pub fn emit_jump(&mut self, label: LabelId, cond: Option<u8>) {
        trace!("jump {}", self.labels[label.0].name);
        self.labels[label.0].uses.push(self.binary.len());
        self.emit_raw(OpTop::SetB, 0);
        let arg = match cond {
            Some(reg) => (u16::from(reg) << 8) | (1 << 6),
            None => 0,
        };
        self.emit_raw(OpTop::Jump, arg);
    }

    /// Resolve every jump. A zero-distance jump is rejected as it would
    /// spin forever re-reading its own prefix.
    pub fn patch_labels(&mut self, span: Span) -> CompileResult<()> {
        for label in &self.labels {
            if label.uses.is_empty() {
                continue;
            }
            let target = match label.offset {
                Some(offset) => offset as isize,
                None => {
                    return Err(CompileError::new(
                        CompileErrorTy::Syntax,
                        format!("label `{}` never emitted", label.name),
                        span,
                    ))
                }
            };
            for &u in &label.uses {
                let mut op0 = self.binary[u];
                let mut op1 = self.binary[u + 1];
                debug_assert!(op0 >> 12 == OpTop::SetB as u16);
                debug_assert!(op1 >> 12 == OpTop::Jump as u16);
                let mut off = target - u as isize - 2;
                if off == -2 {
                    return Err(CompileError::new(
                        CompileErrorTy::Syntax,
                        "jump to itself",
                        span,
                    ));
                }
                if off < 0 {
                    off = -off;
                    op1 |= 1 << 7;
                }
                if off > 0x3ffff {
                    return Err(CompileError::new(
                        CompileErrorTy::Syntax,
                        "function too large (jump out of range)",
                        span,
                    ));
                }
                debug_assert!(op0 & 0xfff == 0);
                debug_assert!(op1 & 0x3f == 0);
                op0 |= (off >> 6) as u16;
                op1 |= (off & 0x3f) as u16;
                self.binary[u] = op0;
                self.binary[u + 1] = op1;
            }
        }
        Ok(())
    }

    pub fn into_binary(self) -> Vec<u16> {
        self.binary
    }

    pub fn binary(&self) -> &[u16] {
        &self.binary
    }
}

/// Byte accumulator for one section of the output image.
#[derive(Debug, Default)]
pub struct SectionWriter {
    data: Vec<u8>,
}

impl SectionWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn append_u32(&mut self, v: u32) {
        self.append(&v.to_le_bytes());
    }

    pub fn append_u16(&mut self, v: u16) {
        self.append(&v.to_le_bytes());
    }

    /// Pad with zero bytes to the given alignment.
    pub fn align(&mut self, alignment: usize) {
        while self.data.len() % alignment != 0 {
            self.data.push(0);
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{stringify_instr, InstrParams, NoResolver, OpCall};

    fn span() -> Span {
        Span::new(0, 0)
    }

    #[test]
    fn alloc_highest_free() {
        let mut w = OpWriter::new();
        assert_eq!(w.alloc_reg(span()).unwrap(), 15);
        assert_eq!(w.alloc_reg(span()).unwrap(), 14);
    }

    #[test]
    fn scopes_free_registers() {
        let mut w = OpWriter::new();
        let outer = w.alloc_reg(span()).unwrap();
        w.push();
        let inner = w.alloc_reg(span()).unwrap();
        w.pop();
        // inner slot is free again, outer still taken
        assert_eq!(w.alloc_reg(span()).unwrap(), inner);
        assert_ne!(w.alloc_reg(span()).unwrap(), outer);
    }

    #[test]
    fn pop_except_keeps_result() {
        let mut w = OpWriter::new();
        w.push();
        let keep = w.alloc_reg(span()).unwrap();
        let drop = w.alloc_reg(span()).unwrap();
        w.pop_except(Some(keep));
        assert_eq!(w.alloc_reg(span()).unwrap(), drop);
        // keep is still allocated
        assert_ne!(w.alloc_reg(span()).unwrap(), keep);
    }

    #[test]
    fn register_exhaustion() {
        let mut w = OpWriter::new();
        for _ in 0..16 {
            w.alloc_reg(span()).unwrap();
        }
        let err = w.alloc_reg(span()).unwrap_err();
        assert_eq!(err.ty(), CompileErrorTy::OverflowedRegisters);
    }

    #[test]
    fn buffer_double_acquire() {
        let mut w = OpWriter::new();
        w.alloc_buf(span()).unwrap();
        assert!(w.alloc_buf(span()).is_err());
        w.free_buf();
        assert!(w.alloc_buf(span()).is_ok());
    }

    #[test]
    fn small_immediates_cost_no_prefix() {
        let mut w = OpWriter::new();
        w.emit_sync(OpSync::Return, 0, 0, 0, 0);
        assert_eq!(w.binary().len(), 1);
    }

    #[test]
    fn wide_immediate_uses_set_high() {
        let mut w = OpWriter::new();
        w.emit_prefix(0x3ffff, 0, 0, 0);
        let bin = w.binary();
        assert_eq!(bin.len(), 2);
        assert_eq!(bin[0] >> 12, OpTop::SetA as u16);
        assert_eq!(bin[1] >> 12, OpTop::SetHigh as u16);

        // decoding reproduces the operand
        let mut st = InstrParams::new();
        stringify_instr(&mut st, bin[0], &NoResolver);
        stringify_instr(&mut st, bin[1], &NoResolver);
        assert_eq!(st.params[0], 0x3ffff);
    }

    #[test]
    fn forward_jump_patching() {
        let mut w = OpWriter::new();
        let l = w.mk_label("fwd");
        w.emit_jump(l, None);
        w.emit_sync(OpSync::Return, 0, 0, 0, 0);
        w.emit_label(l);
        w.emit_sync(OpSync::Return, 0, 0, 0, 0);
        w.patch_labels(span()).unwrap();

        let bin = w.binary();
        // SET_B carries off >> 6, JUMP carries off & 0x3f; off = 3 - 0 - 2
        assert_eq!(bin[0] & 0xfff, 0);
        assert_eq!(bin[1] & 0x3f, 1);
        assert_eq!(bin[1] & (1 << 7), 0);
    }

    #[test]
    fn backward_jump_sets_sign() {
        let mut w = OpWriter::new();
        let top = w.mk_label("top");
        w.emit_label(top);
        w.emit_sync(OpSync::Return, 0, 0, 0, 0);
        w.emit_jump(top, None);
        w.patch_labels(span()).unwrap();

        let bin = w.binary();
        assert_ne!(bin[2] & (1 << 7), 0);
        assert_eq!(bin[2] & 0x3f, 3);
    }

    #[test]
    fn self_jump_rejected() {
        let mut w = OpWriter::new();
        let l = w.mk_label("self");
        w.emit_label(l);
        w.emit_jump(l, None);
        assert!(w.patch_labels(span()).is_err());
    }

    #[test]
    fn sync_calls_carry_save_mask() {
        let mut w = OpWriter::new();
        let regs = w.alloc_arg_regs(2, span()).unwrap();
        assert_eq!(regs, vec![0, 1]);
        w.emit_call(1, 2, OpCall::Sync);
        let bin = w.binary();
        // SET_D prefix holds the mask for r0 and r1
        assert_eq!(bin[0] >> 12, OpTop::SetD as u16);
        assert_eq!(bin[0] & 0xfff, 0b11);
    }

    #[test]
    fn bg_calls_save_nothing() {
        let mut w = OpWriter::new();
        w.alloc_reg(span()).unwrap();
        w.emit_call(1, 0, OpCall::Bg);
        assert_eq!(w.binary().len(), 1);
    }

    #[test]
    fn section_alignment() {
        let mut s = SectionWriter::new();
        s.append(&[1, 2, 3]);
        s.align(8);
        assert_eq!(s.len(), 8);
    }
}
