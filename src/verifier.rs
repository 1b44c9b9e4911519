//! Static checks on a binary image.
//!
//! Every image is verified before the interpreter will load it: section
//! layout, instruction encoding, cell and index bounds, jump targets and
//! a register-liveness pass that rejects reads of registers that were
//! never written (or were lost across a suspension point).

use crate::{
    error::{VerifyError, VerifyResult},
    format::{
        CellKind, OpAsync, OpBinary, OpCall, OpFmt, OpMath1, OpMath2, OpSync, OpTop, OpUnary,
        FIX_HEADER_SIZE, MAX_PACKET_SIZE, MAX_USER_PANIC, NUM_REGS, NUM_SECTIONS,
        SECTION_HEADER_SIZE, VALUE_SPECIAL_MAX,
    },
    image::{FunctionInfo, ImageInfo, SECT_CODE, SECT_FLOATS},
};

use std::collections::HashMap;

/// Parse and fully verify a binary image.
pub fn verify(image: &[u8]) -> VerifyResult<()> {
    let info = ImageInfo::parse(image)?;
    verify_info(&info)
}

/// Verify an already-parsed image.
pub fn verify_info(info: &ImageInfo) -> VerifyResult<()> {
    verify_sections(info)?;
    verify_roles(info)?;
    verify_layout(info)?;

    for (idx, fun) in info.functions.iter().enumerate() {
        FunVerifier::new(info, fun).run().map_err(|err| {
            VerifyError::new(err.offset, format!("fn{}: {}", idx, err.message))
        })?;
    }
    Ok(())
}

fn verify_sections(info: &ImageInfo) -> VerifyResult<()> {
    let table_end = FIX_HEADER_SIZE + NUM_SECTIONS * SECTION_HEADER_SIZE;
    if info.sections[0].start != table_end {
        return Err(VerifyError::new(
            info.sections[0].start,
            "first section does not follow the header",
        ));
    }
    for pair in info.sections.windows(2) {
        if pair[1].start != pair[0].end() {
            return Err(VerifyError::new(pair[1].start, "sections not contiguous"));
        }
    }
    if info.sections[NUM_SECTIONS - 1].end() != info.data().len() {
        return Err(VerifyError::new(
            info.sections[NUM_SECTIONS - 1].end(),
            "trailing bytes after last section",
        ));
    }
    if info.sections[SECT_FLOATS].start % 8 != 0 {
        return Err(VerifyError::new(
            info.sections[SECT_FLOATS].start,
            "float literals misaligned",
        ));
    }
    Ok(())
}

fn verify_roles(info: &ImageInfo) -> VerifyResult<()> {
    for (i, &class) in info.role_classes.iter().enumerate() {
        let top = class >> 28;
        if top != 0x1 && top != 0x2 {
            return Err(VerifyError::new(
                info.sections[crate::image::SECT_ROLES].start + i * 8,
                format!("role class {:#x} outside service namespace", class),
            ));
        }
    }
    Ok(())
}

/// Function bodies must tile the code section in order, with at most the
/// alignment slack left at the end.
fn verify_layout(info: &ImageInfo) -> VerifyResult<()> {
    let code = &info.sections[SECT_CODE];
    if info.functions.is_empty() {
        return Err(VerifyError::new(code.start, "no functions"));
    }
    if info.functions[0].num_args != 0 {
        return Err(VerifyError::new(code.start, "entry function takes arguments"));
    }

    let mut expected = (code.start / 2) as u32;
    for fun in &info.functions {
        if fun.start_pc != expected {
            return Err(VerifyError::new(
                fun.start_pc as usize * 2,
                "function bodies not contiguous",
            ));
        }
        if fun.num_words == 0 {
            return Err(VerifyError::new(fun.start_pc as usize * 2, "empty function"));
        }
        if usize::from(fun.num_args) > usize::from(fun.num_locals) {
            return Err(VerifyError::new(
                fun.start_pc as usize * 2,
                "more arguments than locals",
            ));
        }
        expected = fun.end_pc();
    }

    let code_end = (code.end() / 2) as u32;
    if expected > code_end || code_end - expected > 3 {
        return Err(VerifyError::new(
            expected as usize * 2,
            "code section does not match function bodies",
        ));
    }
    Ok(())
}

struct FunVerifier<'i> {
    info: &'i ImageInfo,
    fun: &'i FunctionInfo,
    params: [u32; 4],
    /// Registers known to hold a value at the current pc
    live: u32,
    /// Liveness observed at each pc during the linear scan
    seen: Vec<u32>,
    /// Whether a prefix accumulator was pending when this pc was reached
    prefix_at: Vec<bool>,
    /// Forward jump targets -> intersection of incoming masks
    pending: HashMap<u32, u32>,
}

impl<'i> FunVerifier<'i> {
    fn new(info: &'i ImageInfo, fun: &'i FunctionInfo) -> Self {
        let words = fun.num_words as usize;
        Self {
            info,
            fun,
            params: [0; 4],
            live: 0,
            seen: vec![0; words],
            prefix_at: vec![false; words],
            pending: HashMap::new(),
        }
    }

    fn err(&self, pc: u32, message: impl Into<String>) -> VerifyError {
        VerifyError::new(pc as usize * 2, message)
    }

    fn read_reg(&self, pc: u32, reg: u16) -> VerifyResult<()> {
        if self.live & (1 << reg) == 0 {
            return Err(self.err(pc, format!("r{} read before it is written", reg)));
        }
        Ok(())
    }

    fn write_reg(&mut self, reg: u16) {
        self.live |= 1 << reg;
    }

    fn run(&mut self) -> VerifyResult<()> {
        let start = self.fun.start_pc;
        let end = self.fun.end_pc();

        for pc in start..end {
            let i = (pc - start) as usize;
            self.prefix_at[i] = self.params != [0; 4];
            if let Some(mask) = self.pending.get(&pc).copied() {
                if self.prefix_at[i] {
                    return Err(self.err(pc, "jump lands inside an instruction prefix"));
                }
                self.live &= mask;
            }
            self.seen[i] = self.live;

            self.step(pc)?;
        }

        let last = self.info.word(end - 1);
        if last != ((OpTop::Sync as u16) << 12) | OpSync::Return as u16 {
            return Err(self.err(end - 1, "function does not end in RETURN"));
        }
        Ok(())
    }

    fn step(&mut self, pc: u32) -> VerifyResult<()> {
        let instr = self.info.word(pc);
        let op = (instr >> 12) as u8;
        let arg12 = u32::from(instr & 0xfff);
        let arg10 = u32::from(instr & 0x3ff);
        let arg8 = (instr & 0xff) as u8;
        let arg6 = u32::from(instr & 0x3f);
        let subop = (instr >> 8) as u8 & 0xf;
        let reg1 = (instr >> 8) & 0xf;
        let reg2 = (instr >> 4) & 0xf;
        let reg3 = instr & 0xf;

        let top = OpTop::from_u8(op)
            .ok_or_else(|| self.err(pc, format!("invalid instruction {:#06x}", instr)))?;

        if top <= OpTop::SetD {
            self.params[op as usize] = arg12;
            return Ok(());
        }
        if top == OpTop::SetHigh {
            let sel = (arg12 >> 10) as usize;
            self.params[sel] |= arg10 << 12;
            return Ok(());
        }

        let [a, b, c, d] = self.params;
        self.params = [0; 4];

        match top {
            OpTop::Unary => {
                OpUnary::from_u8(subop)
                    .ok_or_else(|| self.err(pc, format!("invalid unary op {}", subop)))?;
                self.read_reg(pc, reg3)?;
                self.write_reg(reg2);
            }
            OpTop::Binary => {
                OpBinary::from_u8(subop)
                    .ok_or_else(|| self.err(pc, format!("invalid binary op {}", subop)))?;
                self.read_reg(pc, reg2)?;
                self.read_reg(pc, reg3)?;
                self.write_reg(reg2);
            }
            OpTop::LoadCell => {
                let kind = (a << 2) | (u32::from(instr >> 6) & 0x3);
                let idx = (b << 6) | arg6;
                self.check_cell(pc, kind, idx, c, false)?;
                self.write_reg(reg1);
            }
            OpTop::StoreCell => {
                let kind = (a << 2) | (u32::from(instr >> 6) & 0x3);
                let idx = (b << 6) | arg6;
                self.check_cell(pc, kind, idx, c, true)?;
                self.read_reg(pc, reg1)?;
            }
            OpTop::Jump => {
                let off = (b << 6) | arg6;
                let back = instr & (1 << 7) != 0;
                let cond = instr & (1 << 6) != 0;
                if cond {
                    self.read_reg(pc, reg1)?;
                }
                self.check_jump(pc, off, back, cond)?;
            }
            OpTop::Call => {
                // mode always decodes; 2 bits cover all four
                let mode = OpCall::from_u8((arg8 >> 6) & 0x3).unwrap();
                let fn_idx = ((b << 6) | arg6) as usize;
                let callee = self
                    .info
                    .functions
                    .get(fn_idx)
                    .ok_or_else(|| self.err(pc, format!("call to missing fn{}", fn_idx)))?;
                if reg1 as u8 != callee.num_args {
                    return Err(self.err(
                        pc,
                        format!(
                            "fn{} takes {} args, called with {}",
                            fn_idx, callee.num_args, reg1
                        ),
                    ));
                }
                for arg in 0..reg1 {
                    self.read_reg(pc, arg)?;
                }
                if mode == OpCall::Sync {
                    // the callee clobbers everything but the save set; r0
                    // carries the return value
                    self.live = (d & 0xffff) | 1;
                } else {
                    // background starts leave the caller's registers in
                    // place; r0 is still treated as written so a
                    // discarded-result move stays legal
                    self.live |= 1;
                }
            }
            OpTop::Sync => self.check_sync(pc, arg8, (a << 4) | u32::from(reg1), b, c)?,
            OpTop::Async => {
                self.check_async(pc, arg8, a, b, c)?;
                // only the declared save set survives the suspension
                self.live = ((d << 4) | u32::from(reg1)) & 0xffff;
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn check_cell(&self, pc: u32, kind: u32, idx: u32, offset: u32, store: bool) -> VerifyResult<()> {
        let kind = CellKind::from_u16(kind as u16)
            .filter(|k| k.is_concrete())
            .ok_or_else(|| self.err(pc, format!("invalid cell kind {}", kind)))?;

        if store && !matches!(kind, CellKind::Local | CellKind::Global | CellKind::Buffer) {
            return Err(self.err(pc, format!("cell kind {:?} is not writable", kind)));
        }

        match kind {
            CellKind::Local => {
                if idx >= u32::from(self.fun.num_locals) {
                    return Err(self.err(pc, format!("local {} out of range", idx)));
                }
            }
            CellKind::Global => {
                if idx >= u32::from(self.info.num_globals) {
                    return Err(self.err(pc, format!("global {} out of range", idx)));
                }
            }
            CellKind::FloatConst => {
                if idx as usize >= self.info.floats.len() {
                    return Err(self.err(pc, format!("float literal {} out of range", idx)));
                }
            }
            CellKind::Identity => {
                if idx > 0xffff {
                    return Err(self.err(pc, "identity immediate too large"));
                }
            }
            CellKind::Buffer => {
                let fmt = OpFmt::from_u8((idx & 0xf) as u8)
                    .ok_or_else(|| self.err(pc, format!("invalid buffer format {}", idx & 0xf)))?;
                let shift = idx >> 4;
                if shift > 64 {
                    return Err(self.err(pc, format!("buffer shift {} too large", shift)));
                }
                let size = crate::format::bit_size(fmt) / 8;
                if offset + size > MAX_PACKET_SIZE {
                    return Err(self.err(pc, format!("buffer access at {} out of range", offset)));
                }
            }
            CellKind::Special => {
                if idx > u32::from(VALUE_SPECIAL_MAX) {
                    return Err(self.err(pc, format!("special value {} out of range", idx)));
                }
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn check_jump(&mut self, pc: u32, off: u32, back: bool, cond: bool) -> VerifyResult<()> {
        let next = pc + 1;
        let target = if back {
            next.checked_sub(off)
                .ok_or_else(|| self.err(pc, "jump before function start"))?
        } else {
            next + off
        };
        if target < self.fun.start_pc || target >= self.fun.end_pc() {
            return Err(self.err(pc, format!("jump target {} out of range", target)));
        }

        if back {
            let i = (target - self.fun.start_pc) as usize;
            if self.prefix_at[i] {
                return Err(self.err(pc, "jump lands inside an instruction prefix"));
            }
            // arriving with fewer live registers than the target was checked
            // against would let later reads see garbage
            if self.seen[i] & !self.live != 0 {
                return Err(self.err(pc, "registers lost across backward jump"));
            }
        } else {
            let live = self.live;
            self.pending
                .entry(target)
                .and_modify(|mask| *mask &= live)
                .or_insert(live);
        }

        if !cond {
            // fall-through is unreachable unless some forward jump lands on
            // it; until then, don't constrain it
            self.live = self.pending.get(&next).copied().unwrap_or(0xffff);
        }
        Ok(())
    }

    fn check_sync(&mut self, pc: u32, op: u8, arg: u32, b: u32, c: u32) -> VerifyResult<()> {
        let op = OpSync::from_u8(op)
            .ok_or_else(|| self.err(pc, format!("invalid sync op {}", op)))?;
        match op {
            OpSync::Return => {
                self.live = 0;
            }
            OpSync::SetupBuffer => {
                if arg == 0 || arg > MAX_PACKET_SIZE {
                    return Err(self.err(pc, format!("buffer size {} out of range", arg)));
                }
            }
            OpSync::ObserveRole => {
                self.check_role(pc, arg)?;
            }
            OpSync::Format | OpSync::LogFormat => {
                self.check_string(pc, arg)?;
                if b > u32::from(NUM_REGS) {
                    return Err(self.err(pc, format!("format uses {} registers", b)));
                }
                for reg in 0..b {
                    self.read_reg(pc, reg as u16)?;
                }
                if op == OpSync::Format && c >= MAX_PACKET_SIZE {
                    return Err(self.err(pc, format!("format offset {} out of range", c)));
                }
            }
            OpSync::Memcpy => {
                self.check_string(pc, arg)?;
            }
            OpSync::Math1 => {
                OpMath1::from_u8(arg as u8)
                    .ok_or_else(|| self.err(pc, format!("invalid math1 op {}", arg)))?;
                self.read_reg(pc, 0)?;
                self.write_reg(0);
            }
            OpSync::Math2 => {
                OpMath2::from_u8(arg as u8)
                    .ok_or_else(|| self.err(pc, format!("invalid math2 op {}", arg)))?;
                self.read_reg(pc, 0)?;
                self.read_reg(pc, 1)?;
                self.write_reg(0);
            }
            OpSync::Panic => {
                if arg == 0 || arg > MAX_USER_PANIC {
                    return Err(self.err(pc, format!("panic code {} out of range", arg)));
                }
            }
        }
        Ok(())
    }

    fn check_async(&mut self, pc: u32, op: u8, a: u32, _b: u32, c: u32) -> VerifyResult<()> {
        let op = OpAsync::from_u8(op)
            .ok_or_else(|| self.err(pc, format!("invalid async op {}", op)))?;
        match op {
            OpAsync::Yield => {}
            OpAsync::CloudUpload => {
                if a > u32::from(NUM_REGS) {
                    return Err(self.err(pc, format!("upload uses {} registers", a)));
                }
                for reg in 0..a {
                    self.read_reg(pc, reg as u16)?;
                }
            }
            OpAsync::QueryReg => {
                self.check_role(pc, a)?;
            }
            OpAsync::SetReg => {
                self.check_role(pc, a)?;
                if c == 0 || c > MAX_PACKET_SIZE {
                    return Err(self.err(pc, format!("register size {} out of range", c)));
                }
            }
        }
        Ok(())
    }

    fn check_role(&self, pc: u32, idx: u32) -> VerifyResult<()> {
        if idx as usize >= self.info.role_classes.len() {
            return Err(self.err(pc, format!("role {} out of range", idx)));
        }
        Ok(())
    }

    fn check_string(&self, pc: u32, idx: u32) -> VerifyResult<()> {
        if idx as usize >= self.info.strings.len() {
            return Err(self.err(pc, format!("string {} out of range", idx)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, MemoryHost};
    use crate::format::{OpBinary, OpTop};

    fn compiled(src: &str) -> Vec<u8> {
        let mut host = MemoryHost::default();
        let out = compile(&mut host, src);
        assert!(out.success, "{:?}", out.errors);
        out.binary
    }

    fn main_body_offset(image: &[u8]) -> usize {
        let info = ImageInfo::parse(image).unwrap();
        info.functions[0].start_pc as usize * 2
    }

    fn patch_word(image: &mut [u8], byte_offset: usize, word: u16) {
        image[byte_offset..byte_offset + 2].copy_from_slice(&word.to_le_bytes());
    }

    #[test]
    fn accepts_compiled_programs() {
        for src in &[
            "",
            "var a = 1; var b = a * 2;",
            "var b = roles.button(); var n = 0; b.down.sub(() => { n = n + 1; });",
            "var t = roles.temperature(); t.temperature.onChange(0.5, () => { print(\"chg\"); });",
            "function add(a, b) { return a + b; } var x = add(1, 2);",
            "every(1, () => { upload(format(\"v={0}\", 1), 2); });",
        ] {
            verify(&compiled(src)).unwrap();
        }
    }

    #[test]
    fn rejects_invalid_opcode() {
        let mut image = compiled("var a = 1;");
        let off = main_body_offset(&image);
        patch_word(&mut image, off, 0xffff);
        assert!(verify(&image).is_err());
    }

    #[test]
    fn rejects_read_before_write() {
        let mut image = compiled("var a = 1;");
        let off = main_body_offset(&image);
        // r0 := r0 + r0 with nothing written yet
        let word = ((OpTop::Binary as u16) << 12) | ((OpBinary::Add as u16) << 8);
        patch_word(&mut image, off, word);
        let err = verify(&image).unwrap_err();
        assert!(err.message.contains("before it is written"), "{}", err);
    }

    #[test]
    fn rejects_wild_jump() {
        let mut image = compiled("var a = 1;");
        let off = main_body_offset(&image);
        let word = ((OpTop::Jump as u16) << 12) | 0x3f;
        patch_word(&mut image, off, word);
        let err = verify(&image).unwrap_err();
        assert!(err.message.contains("jump target"), "{}", err);
    }

    #[test]
    fn rejects_bad_role_class() {
        let mut image = compiled("var b = roles.button();");
        let info = ImageInfo::parse(&image).unwrap();
        let role_off = info.sections[crate::image::SECT_ROLES].start;
        image[role_off + 3] = 0x90;
        let err = verify(&image).unwrap_err();
        assert!(err.message.contains("namespace"), "{}", err);
    }

    #[test]
    fn rejects_out_of_range_global() {
        let mut image = compiled("var a = 1;");
        let info = ImageInfo::parse(&image).unwrap();
        let main = info.functions[0];
        // find the STORE_CELL into global 0 and retarget it at global 40
        for pc in main.start_pc..main.end_pc() {
            let word = info.word(pc);
            if word >> 12 == OpTop::StoreCell as u16 {
                patch_word(
                    &mut image,
                    pc as usize * 2,
                    (word & !0x3f) | 40,
                );
                break;
            }
        }
        let err = verify(&image).unwrap_err();
        assert!(err.message.contains("global"), "{}", err);
    }

    #[test]
    fn rejects_missing_return() {
        let mut image = compiled("var a = 1;");
        let info = ImageInfo::parse(&image).unwrap();
        let main = info.functions[0];
        let last = (main.end_pc() - 1) as usize * 2;
        // overwrite the trailing RETURN with a bare prefix
        patch_word(&mut image, last, (OpTop::SetA as u16) << 12);
        let err = verify(&image).unwrap_err();
        assert!(err.message.contains("RETURN"), "{}", err);
    }
}
