//! Cooperative bytecode interpreter.
//!
//! One [`Vm`] runs every fiber of a verified image. Fibers execute until
//! they hit a suspension point (YIELD, an unsatisfied register query, a
//! parked register write); the host drives the interpreter through the
//! external event surface: [`Vm::run`], [`Vm::self_announce`],
//! [`Vm::process_packet`], [`Vm::device_disconnected`] and
//! [`Vm::timer_fired`].

pub mod bus;

pub use bus::{Bus, MockBus, Packet};

use crate::{
    error::{RuntimeError, RuntimeErrorTy, RuntimeResult},
    format::{
        bit_size, CellKind, OpAsync, OpBinary, OpCall, OpFmt, OpMath1, OpMath2, OpSync, OpTop,
        OpUnary, ValueSpecial, MAX_PACKET_SIZE, MAX_STEPS, PANIC_INTERNAL, PANIC_RESTART,
    },
    image::{FunctionInfo, ImageInfo},
    strfmt::strfmt,
    verifier,
};

use log::{error, info, trace};
use std::io::{self, Write};

/// Interpreter tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Delay before the entry function starts, in ms
    pub start_delay_ms: u64,
    /// Restart the program after a user panic
    pub restart_after_panic: bool,
    /// Delay before a restart, in ms
    pub restart_delay_ms: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            start_delay_ms: 0,
            restart_after_panic: false,
            restart_delay_ms: 500,
        }
    }
}

fn truthy(v: f64) -> bool {
    v != 0.0 && !v.is_nan()
}

struct Activation {
    fn_idx: usize,
    pc: u32,
    /// Locals followed by the register save area; NaN until written
    slots: Vec<f64>,
    /// Registers parked in the save area across a synchronous call
    saved_mask: u32,
}

impl Activation {
    fn new(info: &ImageInfo, fn_idx: usize, args: &[f64]) -> Self {
        let fun = &info.functions[fn_idx];
        let mut slots = vec![f64::NAN; fun.num_slots()];
        for (i, &arg) in args.iter().take(fun.num_args as usize).enumerate() {
            slots[i] = arg;
        }
        Self {
            fn_idx,
            pc: fun.start_pc,
            slots,
            saved_mask: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FiberWait {
    /// Runnable once `wake_time` passes
    Sleep,
    /// Parked until any packet for the role arrives
    Role(u32),
    /// Parked until the role reports this register
    RegQuery { role: u32, code: u16 },
    /// Register write waiting for the role to bind
    RegSet { role: u32, code: u16, data: Vec<u8> },
}

struct Fiber {
    first_fun: usize,
    initial_args: Vec<f64>,
    activations: Vec<Activation>,
    wake_time: u64,
    wait: FiberWait,
    /// Role marked by OBSERVE_ROLE; consumed by the next YIELD
    observed: Option<u32>,
    /// Mask of registers saved at the last suspension
    resume_mask: u32,
    /// One queued re-run (BG_MAX1_PEND1)
    pending: bool,
    done: bool,
}

struct Role {
    class: u32,
    binding: Option<(u64, u8)>,
}

enum Flow {
    Continue,
    Suspend,
    Done,
}

/// Interpreter state for one loaded image.
struct Ctx {
    info: ImageInfo,
    globals: Vec<f64>,
    regs: [f64; 16],
    params: [u32; 4],
    buffer: [u8; MAX_PACKET_SIZE as usize],
    buffer_size: usize,
    fibers: Vec<Fiber>,
    roles: Vec<Role>,
    cur_event: Option<u16>,
    cur_reg: Option<u16>,
    cur_role: Option<u32>,
    panic_code: Option<u32>,
}

impl Ctx {
    fn new(info: ImageInfo) -> Self {
        let globals = vec![f64::NAN; usize::from(info.num_globals)];
        let roles = info
            .role_classes
            .iter()
            .map(|&class| Role {
                class,
                binding: None,
            })
            .collect();
        Self {
            info,
            globals,
            regs: [f64::NAN; 16],
            params: [0; 4],
            buffer: [0; MAX_PACKET_SIZE as usize],
            buffer_size: 0,
            fibers: Vec::new(),
            roles,
            cur_event: None,
            cur_reg: None,
            cur_role: None,
            panic_code: None,
        }
    }

    fn spawn(&mut self, fn_idx: usize, args: &[f64], wake_time: u64) {
        let activation = Activation::new(&self.info, fn_idx, args);
        self.fibers.push(Fiber {
            first_fun: fn_idx,
            initial_args: args.to_vec(),
            activations: vec![activation],
            wake_time,
            wait: FiberWait::Sleep,
            observed: None,
            resume_mask: 0,
            pending: false,
            done: false,
        });
    }

    fn top_num_locals(&self, fiber_idx: usize) -> usize {
        let act = self.fibers[fiber_idx].activations.last().unwrap();
        usize::from(self.info.functions[act.fn_idx].num_locals)
    }

    /// Park the masked registers in the top activation's save area.
    fn save_regs(&mut self, fiber_idx: usize, mask: u32) {
        let base = self.top_num_locals(fiber_idx);
        let act = self.fibers[fiber_idx].activations.last_mut().unwrap();
        let mut slot = base;
        for reg in 0..16 {
            if mask & (1 << reg) != 0 {
                if let Some(cell) = act.slots.get_mut(slot) {
                    *cell = self.regs[reg];
                }
                slot += 1;
            }
        }
    }

    fn restore_regs(&mut self, fiber_idx: usize, mask: u32) {
        let base = self.top_num_locals(fiber_idx);
        let act = self.fibers[fiber_idx].activations.last_mut().unwrap();
        let mut slot = base;
        for reg in 0..16 {
            if mask & (1 << reg) != 0 {
                if let Some(&cell) = act.slots.get(slot) {
                    self.regs[reg] = cell;
                }
                slot += 1;
            }
        }
    }

    /// Run one fiber until it suspends, finishes or panics.
    fn run_fiber(
        &mut self,
        fiber_idx: usize,
        bus: &mut dyn Bus,
        sink: &mut dyn Write,
    ) -> RuntimeResult<()> {
        let mask = self.fibers[fiber_idx].resume_mask;
        if mask != 0 {
            self.restore_regs(fiber_idx, mask);
            self.fibers[fiber_idx].resume_mask = 0;
        }
        self.params = [0; 4];

        let mut steps = 0u32;
        loop {
            match self.step(fiber_idx, bus, sink)? {
                Flow::Continue => {
                    steps += 1;
                    if steps > MAX_STEPS {
                        return Err(RuntimeError::new(
                            RuntimeErrorTy::StepLimit,
                            "step limit exceeded (infinite loop?)",
                        ));
                    }
                }
                Flow::Suspend | Flow::Done => return Ok(()),
            }
        }
    }

    fn step(
        &mut self,
        fiber_idx: usize,
        bus: &mut dyn Bus,
        sink: &mut dyn Write,
    ) -> RuntimeResult<Flow> {
        let (fn_idx, pc) = {
            let act = self.fibers[fiber_idx].activations.last().unwrap();
            (act.fn_idx, act.pc)
        };
        let fun: FunctionInfo = self.info.functions[fn_idx];
        if pc < fun.start_pc || pc >= fun.end_pc() {
            return Err(RuntimeError::new(
                RuntimeErrorTy::InvalidJump,
                format!("pc {} outside fn{}", pc, fn_idx),
            ));
        }

        let instr = self.info.word(pc);
        self.fibers[fiber_idx].activations.last_mut().unwrap().pc = pc + 1;
        trace!("f{} pc={} {:#06x}", fiber_idx, pc, instr);

        let op = (instr >> 12) as u8;
        let arg12 = u32::from(instr & 0xfff);
        let arg10 = u32::from(instr & 0x3ff);
        let arg8 = (instr & 0xff) as u8;
        let arg6 = u32::from(instr & 0x3f);
        let subop = (instr >> 8) as u8 & 0xf;
        let reg1 = usize::from((instr >> 8) & 0xf);
        let reg2 = usize::from((instr >> 4) & 0xf);
        let reg3 = usize::from(instr & 0xf);

        let top = OpTop::from_u8(op).ok_or_else(|| {
            RuntimeError::new(
                RuntimeErrorTy::IllegalInstruction,
                format!("bad instruction {:#06x}", instr),
            )
        })?;

        if top <= OpTop::SetD {
            self.params[op as usize] = arg12;
            return Ok(Flow::Continue);
        }
        if top == OpTop::SetHigh {
            self.params[(arg12 >> 10) as usize] |= arg10 << 12;
            return Ok(Flow::Continue);
        }

        let [a, b, c, d] = self.params;
        self.params = [0; 4];

        match top {
            OpTop::Unary => {
                let op = OpUnary::from_u8(subop).ok_or_else(|| illegal("unary", subop))?;
                let v = self.regs[reg3];
                self.regs[reg2] = match op {
                    OpUnary::Id => v,
                    OpUnary::Neg => -v,
                    OpUnary::Not => {
                        if truthy(v) {
                            0.0
                        } else {
                            1.0
                        }
                    }
                    OpUnary::Abs => v.abs(),
                };
                Ok(Flow::Continue)
            }
            OpTop::Binary => {
                let op = OpBinary::from_u8(subop).ok_or_else(|| illegal("binary", subop))?;
                let x = self.regs[reg2];
                let y = self.regs[reg3];
                self.regs[reg2] = match op {
                    OpBinary::Add => x + y,
                    OpBinary::Sub => x - y,
                    OpBinary::Div => x / y,
                    OpBinary::Mul => x * y,
                    OpBinary::Lt => bool_num(x < y),
                    OpBinary::Le => bool_num(x <= y),
                    OpBinary::Eq => bool_num(x == y),
                    OpBinary::Ne => bool_num(x != y),
                    OpBinary::And => {
                        if truthy(x) {
                            y
                        } else {
                            x
                        }
                    }
                    OpBinary::Or => {
                        if truthy(x) {
                            x
                        } else {
                            y
                        }
                    }
                };
                Ok(Flow::Continue)
            }
            OpTop::LoadCell => {
                let kind = (a << 2) | (u32::from(instr >> 6) & 0x3);
                let idx = (b << 6) | arg6;
                self.regs[reg1] = self.load_cell(fiber_idx, kind, idx, c)?;
                Ok(Flow::Continue)
            }
            OpTop::StoreCell => {
                let kind = (a << 2) | (u32::from(instr >> 6) & 0x3);
                let idx = (b << 6) | arg6;
                self.store_cell(fiber_idx, kind, idx, c, self.regs[reg1])?;
                Ok(Flow::Continue)
            }
            OpTop::Jump => {
                let off = (b << 6) | arg6;
                let back = instr & (1 << 7) != 0;
                let cond = instr & (1 << 6) != 0;
                if cond && truthy(self.regs[reg1]) {
                    return Ok(Flow::Continue);
                }
                let next = pc + 1;
                let target = if back {
                    next.checked_sub(off).ok_or_else(|| {
                        RuntimeError::new(RuntimeErrorTy::InvalidJump, "jump underflow")
                    })?
                } else {
                    next + off
                };
                if target < fun.start_pc || target >= fun.end_pc() {
                    return Err(RuntimeError::new(
                        RuntimeErrorTy::InvalidJump,
                        format!("jump to {} outside fn{}", target, fn_idx),
                    ));
                }
                self.fibers[fiber_idx].activations.last_mut().unwrap().pc = target;
                Ok(Flow::Continue)
            }
            OpTop::Call => {
                let mode =
                    OpCall::from_u8((arg8 >> 6) & 0x3).ok_or_else(|| illegal("call", arg8))?;
                self.do_call(fiber_idx, bus, ((b << 6) | arg6) as usize, reg1, mode, d & 0xffff)
            }
            OpTop::Sync => self.do_sync(fiber_idx, sink, arg8, (a << 4) | reg1 as u32, b, c),
            OpTop::Async => {
                let save = ((d << 4) | reg1 as u32) & 0xffff;
                self.do_async(fiber_idx, bus, arg8, a, b, c, save)
            }
            _ => unreachable!(),
        }
    }

    fn do_call(
        &mut self,
        fiber_idx: usize,
        bus: &mut dyn Bus,
        fn_idx: usize,
        num_args: usize,
        mode: OpCall,
        save: u32,
    ) -> RuntimeResult<Flow> {
        if fn_idx >= self.info.functions.len() {
            return Err(RuntimeError::new(
                RuntimeErrorTy::InvalidFunction,
                format!("no fn{}", fn_idx),
            ));
        }
        let args: Vec<f64> = self.regs[..num_args].to_vec();

        match mode {
            OpCall::Sync => {
                self.save_regs(fiber_idx, save);
                self.fibers[fiber_idx]
                    .activations
                    .last_mut()
                    .unwrap()
                    .saved_mask = save;
                let activation = Activation::new(&self.info, fn_idx, &args);
                self.fibers[fiber_idx].activations.push(activation);
            }
            OpCall::Bg => {
                self.spawn(fn_idx, &args, bus.now());
            }
            OpCall::BgMax1 | OpCall::BgMax1Pend1 => {
                if let Some(fiber) = self
                    .fibers
                    .iter_mut()
                    .find(|f| !f.done && f.first_fun == fn_idx)
                {
                    if mode == OpCall::BgMax1Pend1 {
                        fiber.pending = true;
                    }
                } else {
                    self.spawn(fn_idx, &args, bus.now());
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn do_sync(
        &mut self,
        fiber_idx: usize,
        sink: &mut dyn Write,
        op: u8,
        arg: u32,
        b: u32,
        c: u32,
    ) -> RuntimeResult<Flow> {
        let op = OpSync::from_u8(op).ok_or_else(|| illegal("sync", op))?;
        match op {
            OpSync::Return => self.do_return(fiber_idx),
            OpSync::SetupBuffer => {
                let size = arg as usize;
                self.buffer_size = size.min(MAX_PACKET_SIZE as usize);
                for byte in &mut self.buffer[..self.buffer_size] {
                    *byte = 0;
                }
                Ok(Flow::Continue)
            }
            OpSync::ObserveRole => {
                self.fibers[fiber_idx].observed = Some(arg);
                Ok(Flow::Continue)
            }
            OpSync::Format => {
                let text = self.format_string(arg, b)?;
                let offset = (c as usize).min(MAX_PACKET_SIZE as usize);
                let len = text.len().min(MAX_PACKET_SIZE as usize - offset);
                self.buffer[offset..offset + len].copy_from_slice(&text.as_bytes()[..len]);
                self.buffer_size = offset + len;
                Ok(Flow::Continue)
            }
            OpSync::Memcpy => {
                let text = self
                    .info
                    .strings
                    .get(arg as usize)
                    .cloned()
                    .ok_or_else(|| illegal("string", arg as u8))?;
                let offset = (c as usize).min(MAX_PACKET_SIZE as usize);
                let len = text.len().min(MAX_PACKET_SIZE as usize - offset);
                self.buffer[offset..offset + len].copy_from_slice(&text.as_bytes()[..len]);
                self.buffer_size = self.buffer_size.max(offset + len);
                Ok(Flow::Continue)
            }
            OpSync::LogFormat => {
                let text = self.format_string(arg, b)?;
                writeln!(sink, "{}", text).map_err(|err| {
                    RuntimeError::new(RuntimeErrorTy::StdoutError, err.to_string())
                })?;
                Ok(Flow::Continue)
            }
            OpSync::Math1 => {
                let op = OpMath1::from_u8(arg as u8).ok_or_else(|| illegal("math1", arg as u8))?;
                let v = self.regs[0];
                self.regs[0] = match op {
                    OpMath1::Floor => v.floor(),
                    OpMath1::Round => v.round(),
                    OpMath1::Ceil => v.ceil(),
                    OpMath1::LogE => v.ln(),
                    OpMath1::Random => v * rand::random::<f64>(),
                };
                Ok(Flow::Continue)
            }
            OpSync::Math2 => {
                let op = OpMath2::from_u8(arg as u8).ok_or_else(|| illegal("math2", arg as u8))?;
                let x = self.regs[0];
                let y = self.regs[1];
                self.regs[0] = match op {
                    OpMath2::Min => x.min(y),
                    OpMath2::Max => x.max(y),
                    OpMath2::Pow => x.powf(y),
                };
                Ok(Flow::Continue)
            }
            OpSync::Panic => {
                self.panic_code = Some(arg);
                Ok(Flow::Done)
            }
        }
    }

    fn do_return(&mut self, fiber_idx: usize) -> RuntimeResult<Flow> {
        let retval = self.regs[0];
        let fiber = &mut self.fibers[fiber_idx];
        fiber.activations.pop();

        if fiber.activations.is_empty() {
            if fiber.pending {
                fiber.pending = false;
                let fn_idx = fiber.first_fun;
                let args = fiber.initial_args.clone();
                let activation = Activation::new(&self.info, fn_idx, &args);
                self.fibers[fiber_idx].activations.push(activation);
                return Ok(Flow::Continue);
            }
            fiber.done = true;
            return Ok(Flow::Done);
        }

        let mask = fiber.activations.last().unwrap().saved_mask;
        self.fibers[fiber_idx].activations.last_mut().unwrap().saved_mask = 0;
        self.restore_regs(fiber_idx, mask);
        self.regs[0] = retval;
        Ok(Flow::Continue)
    }

    fn do_async(
        &mut self,
        fiber_idx: usize,
        bus: &mut dyn Bus,
        op: u8,
        a: u32,
        b: u32,
        c: u32,
        save: u32,
    ) -> RuntimeResult<Flow> {
        let op = OpAsync::from_u8(op).ok_or_else(|| illegal("async", op))?;
        self.save_regs(fiber_idx, save);
        self.fibers[fiber_idx].resume_mask = save;

        match op {
            OpAsync::Yield => {
                let fiber = &mut self.fibers[fiber_idx];
                match fiber.observed.take() {
                    Some(role) => {
                        fiber.wait = FiberWait::Role(role);
                        fiber.wake_time = u64::MAX;
                    }
                    None => {
                        fiber.wait = FiberWait::Sleep;
                        fiber.wake_time = bus.now() + u64::from(a);
                    }
                }
                Ok(Flow::Suspend)
            }
            OpAsync::CloudUpload => {
                let label =
                    String::from_utf8_lossy(&self.buffer[..self.buffer_size]).into_owned();
                let values: Vec<f64> = self.regs[..a as usize].to_vec();
                bus.cloud_upload(&label, &values)?;
                self.fibers[fiber_idx].resume_mask = 0;
                Ok(Flow::Continue)
            }
            OpAsync::QueryReg => {
                let role = a;
                let code = b as u16;
                let binding = self.role_binding(role)?;
                if let Some((dev, srv)) = binding {
                    if let Some(data) = bus.cached_register(dev, srv, code, c) {
                        self.load_packet_data(&data, None, Some(code), Some(role));
                        self.fibers[fiber_idx].resume_mask = 0;
                        return Ok(Flow::Continue);
                    }
                    bus.query_register(dev, srv, code);
                }
                let fiber = &mut self.fibers[fiber_idx];
                fiber.wait = FiberWait::RegQuery { role, code };
                fiber.wake_time = u64::MAX;
                Ok(Flow::Suspend)
            }
            OpAsync::SetReg => {
                let role = a;
                let code = b as u16;
                let size = (c as usize).min(self.buffer_size);
                let data = self.buffer[..size].to_vec();
                match self.role_binding(role)? {
                    Some((dev, srv)) => {
                        bus.set_register(dev, srv, code, &data);
                        self.fibers[fiber_idx].resume_mask = 0;
                        Ok(Flow::Continue)
                    }
                    None => {
                        let fiber = &mut self.fibers[fiber_idx];
                        fiber.wait = FiberWait::RegSet { role, code, data };
                        fiber.wake_time = u64::MAX;
                        Ok(Flow::Suspend)
                    }
                }
            }
        }
    }

    fn role_binding(&self, role: u32) -> RuntimeResult<Option<(u64, u8)>> {
        self.roles
            .get(role as usize)
            .map(|r| r.binding)
            .ok_or_else(|| {
                RuntimeError::new(RuntimeErrorTy::InvalidRole, format!("no role {}", role))
            })
    }

    fn format_string(&self, idx: u32, num_regs: u32) -> RuntimeResult<String> {
        let fmt = self
            .info
            .strings
            .get(idx as usize)
            .ok_or_else(|| illegal("string", idx as u8))?;
        Ok(strfmt(fmt, &self.regs[..(num_regs as usize).min(16)]))
    }

    fn load_cell(&self, fiber_idx: usize, kind: u32, idx: u32, offset: u32) -> RuntimeResult<f64> {
        let kind = CellKind::from_u16(kind as u16)
            .filter(|k| k.is_concrete())
            .ok_or_else(|| invalid_cell(kind, idx))?;
        match kind {
            CellKind::Local => {
                let act = self.fibers[fiber_idx].activations.last().unwrap();
                act.slots
                    .get(idx as usize)
                    .copied()
                    .ok_or_else(|| invalid_cell(kind as u32, idx))
            }
            CellKind::Global => self
                .globals
                .get(idx as usize)
                .copied()
                .ok_or_else(|| invalid_cell(kind as u32, idx)),
            CellKind::FloatConst => self
                .info
                .floats
                .get(idx as usize)
                .copied()
                .ok_or_else(|| invalid_cell(kind as u32, idx)),
            CellKind::Identity => Ok(f64::from(idx)),
            CellKind::Buffer => Ok(self.read_buffer(idx, offset)),
            CellKind::Special => {
                let special = ValueSpecial::from_u16(idx as u16)
                    .ok_or_else(|| invalid_cell(kind as u32, idx))?;
                Ok(match special {
                    ValueSpecial::Nan => f64::NAN,
                    ValueSpecial::Size => self.buffer_size as f64,
                    ValueSpecial::EvCode => {
                        self.cur_event.map_or(f64::NAN, f64::from)
                    }
                    ValueSpecial::RegGetCode => {
                        self.cur_reg.map_or(f64::NAN, f64::from)
                    }
                    ValueSpecial::RoleId => {
                        self.cur_role.map_or(f64::NAN, |r| r as f64)
                    }
                })
            }
            _ => Err(invalid_cell(kind as u32, idx)),
        }
    }

    fn store_cell(
        &mut self,
        fiber_idx: usize,
        kind: u32,
        idx: u32,
        offset: u32,
        value: f64,
    ) -> RuntimeResult<()> {
        let kind = CellKind::from_u16(kind as u16)
            .filter(|k| k.is_concrete())
            .ok_or_else(|| invalid_cell(kind, idx))?;
        match kind {
            CellKind::Local => {
                let act = self.fibers[fiber_idx].activations.last_mut().unwrap();
                match act.slots.get_mut(idx as usize) {
                    Some(slot) => {
                        *slot = value;
                        Ok(())
                    }
                    None => Err(invalid_cell(kind as u32, idx)),
                }
            }
            CellKind::Global => match self.globals.get_mut(idx as usize) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(invalid_cell(kind as u32, idx)),
            },
            CellKind::Buffer => self.write_buffer(idx, offset, value),
            _ => Err(invalid_cell(kind as u32, idx)),
        }
    }

    /// Decode a fixed-point field from the packet buffer. Reads past the
    /// current payload produce NaN.
    fn read_buffer(&self, idx: u32, offset: u32) -> f64 {
        let fmt = match OpFmt::from_u8((idx & 0xf) as u8) {
            Some(fmt) => fmt,
            None => return f64::NAN,
        };
        let shift = idx >> 4;
        let size = (bit_size(fmt) / 8) as usize;
        let offset = offset as usize;
        if offset + size > self.buffer_size {
            return f64::NAN;
        }

        let mut raw = 0u64;
        for (i, &byte) in self.buffer[offset..offset + size].iter().enumerate() {
            raw |= u64::from(byte) << (8 * i);
        }

        let v = if fmt == OpFmt::F64 {
            f64::from_bits(raw)
        } else if fmt == OpFmt::F32 {
            f64::from(f32::from_bits(raw as u32))
        } else if fmt.is_signed() {
            let bits = bit_size(fmt);
            let shifted = (raw << (64 - bits)) as i64;
            (shifted >> (64 - bits)) as f64
        } else {
            raw as f64
        };
        v / f64::powi(2.0, shift as i32)
    }

    fn write_buffer(&mut self, idx: u32, offset: u32, value: f64) -> RuntimeResult<()> {
        let fmt = OpFmt::from_u8((idx & 0xf) as u8).ok_or_else(|| invalid_cell(idx, offset))?;
        let shift = idx >> 4;
        let size = (bit_size(fmt) / 8) as usize;
        let offset = offset as usize;
        if offset + size > self.buffer_size {
            return Err(RuntimeError::new(
                RuntimeErrorTy::InvalidCell,
                format!("buffer store at {} past payload", offset),
            ));
        }

        let scaled = value * f64::powi(2.0, shift as i32);
        let raw = if fmt == OpFmt::F64 {
            scaled.to_bits()
        } else if fmt == OpFmt::F32 {
            u64::from((scaled as f32).to_bits())
        } else {
            let bits = bit_size(fmt);
            if fmt.is_signed() {
                let max = ((1i64 << (bits - 1)) - 1) as f64;
                let min = -(1i64 << (bits - 1)) as f64;
                let clamped = if scaled.is_nan() {
                    0.0
                } else {
                    scaled.round().max(min).min(max)
                };
                (clamped as i64) as u64
            } else {
                let max = if bits == 64 {
                    u64::MAX as f64
                } else {
                    ((1u64 << bits) - 1) as f64
                };
                let clamped = if scaled.is_nan() {
                    0.0
                } else {
                    scaled.round().max(0.0).min(max)
                };
                clamped as u64
            }
        };

        for i in 0..size {
            self.buffer[offset + i] = (raw >> (8 * i)) as u8;
        }
        Ok(())
    }

    /// Copy a packet payload into the shared buffer and expose its codes.
    fn load_packet_data(
        &mut self,
        data: &[u8],
        event: Option<u16>,
        reg: Option<u16>,
        role: Option<u32>,
    ) {
        let len = data.len().min(MAX_PACKET_SIZE as usize);
        self.buffer[..len].copy_from_slice(&data[..len]);
        self.buffer_size = len;
        self.cur_event = event;
        self.cur_reg = reg;
        self.cur_role = role;
    }
}

fn bool_num(v: bool) -> f64 {
    if v {
        1.0
    } else {
        0.0
    }
}

fn illegal(what: &str, code: u8) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorTy::IllegalInstruction,
        format!("invalid {} op {}", what, code),
    )
}

fn invalid_cell(kind: u32, idx: u32) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorTy::InvalidCell,
        format!("invalid cell {}:{}", kind, idx),
    )
}

/// A loaded program plus the bus it runs against.
pub struct Vm<B: Bus> {
    bus: B,
    ctx: Ctx,
    config: VmConfig,
    sink: Box<dyn Write>,
    on_panic: Option<Box<dyn FnMut(u32)>>,
    restart_at: Option<u64>,
}

impl<B: Bus> Vm<B> {
    /// Verify and load an image. Images that fail verification never run.
    pub fn load(bus: B, image: &[u8], config: VmConfig) -> Result<Self, crate::error::VerifyError> {
        verifier::verify(image)?;
        let info = ImageInfo::parse(image)?;
        Ok(Self {
            bus,
            ctx: Ctx::new(info),
            config,
            sink: Box::new(io::sink()),
            on_panic: None,
            restart_at: None,
        })
    }

    /// Where `print` output goes.
    pub fn set_sink(&mut self, sink: Box<dyn Write>) {
        self.sink = sink;
    }

    pub fn on_panic(&mut self, callback: Box<dyn FnMut(u32)>) {
        self.on_panic = Some(callback);
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn global(&self, idx: usize) -> Option<f64> {
        self.ctx.globals.get(idx).copied()
    }

    pub fn fibers_alive(&self) -> usize {
        self.ctx.fibers.iter().filter(|f| !f.done).count()
    }

    /// Start the program: schedules the entry function and binds roles.
    pub fn run(&mut self) {
        info!("starting program, {} roles", self.ctx.roles.len());
        let start = self.bus.now() + self.config.start_delay_ms;
        self.ctx.spawn(0, &[], start);
        self.bind_roles();
        self.poll();
    }

    /// Periodic announce; also drives role binding.
    pub fn self_announce(&mut self) {
        self.bind_roles();
        self.poll();
    }

    /// A timer requested through [`Bus::set_timer`] fired.
    pub fn timer_fired(&mut self) {
        self.poll();
    }

    /// A device dropped off the bus: unbind its roles and wake their
    /// observers with a synthetic disconnect packet.
    pub fn device_disconnected(&mut self, device_id: u64) {
        let mut dropped = Vec::new();
        for (idx, role) in self.ctx.roles.iter_mut().enumerate() {
            if let Some((dev, srv)) = role.binding {
                if dev == device_id {
                    role.binding = None;
                    dropped.push((idx as u32, srv));
                }
            }
        }
        for (role, srv) in dropped {
            let pkt = Packet::disconnected(device_id, srv);
            self.deliver(role, &pkt);
        }
        self.poll();
    }

    /// An incoming packet from a bound service.
    pub fn process_packet(&mut self, pkt: &Packet) {
        let roles: Vec<u32> = self
            .ctx
            .roles
            .iter()
            .enumerate()
            .filter(|(_, r)| r.binding == Some((pkt.device_id, pkt.service_index)))
            .map(|(idx, _)| idx as u32)
            .collect();
        for role in roles {
            self.deliver(role, pkt);
        }
        self.poll();
    }

    fn bind_roles(&mut self) {
        let mut newly_bound = Vec::new();
        for (idx, role) in self.ctx.roles.iter_mut().enumerate() {
            if role.binding.is_none() {
                if let Some(binding) = self.bus.find_service(role.class) {
                    info!("role {} bound to {:x}:{}", idx, binding.0, binding.1);
                    role.binding = Some(binding);
                    newly_bound.push(idx as u32);
                }
            }
        }

        // flush fibers that were parked on an unbound role
        for role in newly_bound {
            let (dev, srv) = match self.ctx.roles[role as usize].binding {
                Some(binding) => binding,
                None => continue,
            };
            for i in 0..self.ctx.fibers.len() {
                enum Parked {
                    Set(u16, Vec<u8>),
                    Query(u16),
                }
                let parked = match &self.ctx.fibers[i].wait {
                    FiberWait::RegSet { role: r, code, data } if *r == role => {
                        Some(Parked::Set(*code, data.clone()))
                    }
                    FiberWait::RegQuery { role: r, code } if *r == role => {
                        Some(Parked::Query(*code))
                    }
                    _ => None,
                };
                match parked {
                    Some(Parked::Set(code, data)) => {
                        self.bus.set_register(dev, srv, code, &data);
                        self.ctx.fibers[i].wait = FiberWait::Sleep;
                        self.ctx.fibers[i].wake_time = self.bus.now();
                    }
                    Some(Parked::Query(code)) => {
                        // stays parked until the report arrives
                        self.bus.query_register(dev, srv, code);
                    }
                    None => {}
                }
            }
        }
    }

    /// Hand a packet to every fiber parked on the role and run them to
    /// their next suspension point.
    fn deliver(&mut self, role: u32, pkt: &Packet) {
        for i in 0..self.ctx.fibers.len() {
            if self.ctx.fibers[i].done {
                continue;
            }
            let wake = match &self.ctx.fibers[i].wait {
                FiberWait::Role(r) => *r == role,
                FiberWait::RegQuery { role: r, code } => {
                    *r == role
                        && (pkt.register_code() == Some(*code) || pkt.is_disconnect())
                }
                FiberWait::RegSet { role: r, .. } => *r == role && pkt.is_disconnect(),
                FiberWait::Sleep => false,
            };
            if !wake {
                continue;
            }

            self.ctx.load_packet_data(
                &pkt.data,
                pkt.event_code(),
                pkt.register_code(),
                Some(role),
            );
            self.ctx.fibers[i].wait = FiberWait::Sleep;
            self.ctx.fibers[i].wake_time = self.bus.now();
            self.run_one(i);
            if self.ctx.panic_code.is_some() {
                break;
            }
        }
    }

    fn run_one(&mut self, fiber_idx: usize) {
        if let Err(err) = self
            .ctx
            .run_fiber(fiber_idx, &mut self.bus, &mut *self.sink)
        {
            error!("fiber {} fault: {}", fiber_idx, err);
            self.ctx.panic_code = Some(PANIC_INTERNAL);
        }
    }

    /// Run every due fiber, then re-arm the wake timer.
    fn poll(&mut self) {
        let now = self.bus.now();

        if let Some(at) = self.restart_at {
            if at <= now {
                self.restart_at = None;
                info!("restarting program");
                let info = self.ctx.info.clone();
                self.ctx = Ctx::new(info);
                self.ctx.spawn(0, &[], now);
                self.bind_roles();
            }
        }

        let mut i = 0;
        while i < self.ctx.fibers.len() {
            let due = {
                let fiber = &self.ctx.fibers[i];
                !fiber.done && fiber.wait == FiberWait::Sleep && fiber.wake_time <= now
            };
            if due {
                self.run_one(i);
            }
            if self.ctx.panic_code.is_some() {
                break;
            }
            i += 1;
        }

        self.ctx.fibers.retain(|f| !f.done);

        if let Some(code) = self.ctx.panic_code.take() {
            self.handle_panic(code);
        }

        self.arm_timer();
    }

    fn handle_panic(&mut self, code: u32) {
        error!("program panic {:#x}", code);
        if let Some(callback) = &mut self.on_panic {
            callback(code);
        }
        self.ctx.fibers.clear();
        if self.config.restart_after_panic || code == PANIC_RESTART {
            self.restart_at = Some(self.bus.now() + self.config.restart_delay_ms);
        }
    }

    fn arm_timer(&mut self) {
        let mut next = self.restart_at;
        for fiber in &self.ctx.fibers {
            if fiber.done || fiber.wait != FiberWait::Sleep || fiber.wake_time == u64::MAX {
                continue;
            }
            next = Some(match next {
                Some(at) => at.min(fiber.wake_time),
                None => fiber.wake_time,
            });
        }
        if let Some(at) = next {
            self.bus.set_timer(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, MemoryHost};

    fn load(src: &str, bus: MockBus) -> Vm<MockBus> {
        let mut host = MemoryHost::default();
        let out = compile(&mut host, src);
        assert!(out.success, "{:?}", out.errors);
        Vm::load(bus, &out.binary, VmConfig::default()).unwrap()
    }

    #[test]
    fn arithmetic_runs_to_completion() {
        let mut vm = load("var a = 2; var b = a * 3 + 1;", MockBus::new());
        vm.run();
        assert_eq!(vm.global(0), Some(2.0));
        assert_eq!(vm.global(1), Some(7.0));
        assert_eq!(vm.fibers_alive(), 0);
    }

    #[test]
    fn function_calls_preserve_registers() {
        let mut vm = load(
            "function add(a, b) { return a + b; } var x = add(3, 4) + add(1, 2);",
            MockBus::new(),
        );
        vm.run();
        assert_eq!(vm.global(0), Some(10.0));
    }

    #[test]
    fn if_else_picks_branch() {
        let mut vm = load(
            "var a = 5; var b = 0; if (a < 3) { b = 1; } else { b = 2; }",
            MockBus::new(),
        );
        vm.run();
        assert_eq!(vm.global(1), Some(2.0));
    }

    #[test]
    fn event_subscription_counts_presses() {
        let bus = MockBus::new().with_service(0xdead, 1, 0x1473_a263);
        let mut vm = load(
            "var b = roles.button(); var n = 0; b.down.sub(() => { n = n + 1; });",
            bus,
        );
        vm.run();
        assert_eq!(vm.global(0), Some(0.0));

        for _ in 0..3 {
            vm.process_packet(&Packet::event(0xdead, 1, 0x1, vec![]));
        }
        assert_eq!(vm.global(0), Some(3.0));

        // a different event code does not fire the handler
        vm.process_packet(&Packet::event(0xdead, 1, 0x2, vec![]));
        assert_eq!(vm.global(0), Some(3.0));
    }

    #[test]
    fn wait_parks_until_timer() {
        let mut vm = load("var a = 0; wait(1); a = 1;", MockBus::new());
        vm.run();
        assert_eq!(vm.global(0), Some(0.0));

        vm.bus_mut().now = 1000;
        vm.timer_fired();
        assert_eq!(vm.global(0), Some(1.0));
    }

    #[test]
    fn panic_stops_everything() {
        let mut vm = load("panic(7); ", MockBus::new());
        let mut seen = Vec::new();
        let codes: std::rc::Rc<std::cell::RefCell<Vec<u32>>> = Default::default();
        let inner = codes.clone();
        vm.on_panic(Box::new(move |code| inner.borrow_mut().push(code)));
        vm.run();
        seen.extend(codes.borrow().iter().copied());
        assert_eq!(seen, vec![7]);
        assert_eq!(vm.fibers_alive(), 0);
    }

    #[test]
    fn register_query_uses_fresh_cache() {
        let mut bus = MockBus::new().with_service(0xbeef, 2, 0x1421_bac7);
        // 21.5 C at 10 fractional bits
        let raw = (21.5f64 * 1024.0) as i32;
        bus.registers
            .insert((0xbeef, 2, 0x101), raw.to_le_bytes().to_vec());

        let mut vm = load(
            "var t = roles.temperature(); var v = t.temperature.read();",
            bus,
        );
        vm.run();
        assert_eq!(vm.global(0), Some(21.5));
        assert!(vm.bus().queries.is_empty());
    }

    #[test]
    fn register_query_parks_until_report() {
        let bus = MockBus::new().with_service(0xbeef, 2, 0x1421_bac7);
        let mut vm = load(
            "var t = roles.temperature(); var v = t.temperature.read();",
            bus,
        );
        vm.run();
        assert!(vm.global(0).unwrap().is_nan());
        assert_eq!(vm.bus().queries, vec![(0xbeef, 2, 0x101)]);

        let raw = (-4.25f64 * 1024.0) as i32;
        vm.process_packet(&Packet::register_report(
            0xbeef,
            2,
            0x101,
            raw.to_le_bytes().to_vec(),
        ));
        assert_eq!(vm.global(0), Some(-4.25));
    }

    #[test]
    fn register_write_reaches_bus() {
        let bus = MockBus::new().with_service(0xf00d, 3, 0x1cab_054c);
        let mut vm = load(
            "var l = roles.lightBulb(); l.brightness.write(0.5);",
            bus,
        );
        vm.run();
        let sets = &vm.bus().sets;
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].2, 0x1);
        // 0.5 at 16 fractional bits
        assert_eq!(sets[0].3, 0x8000u16.to_le_bytes().to_vec());
    }

    #[test]
    fn unbound_register_write_parks_until_announce() {
        let mut vm = load(
            "var l = roles.lightBulb(); l.brightness.write(1);",
            MockBus::new(),
        );
        vm.run();
        assert!(vm.bus().sets.is_empty());
        assert_eq!(vm.fibers_alive(), 1);

        vm.bus_mut().services.push((0xf00d, 3, 0x1cab_054c));
        vm.self_announce();
        assert_eq!(vm.bus().sets.len(), 1);
        assert_eq!(vm.fibers_alive(), 0);
    }

    #[test]
    fn on_change_fires_on_first_report() {
        let bus = MockBus::new().with_service(0xbeef, 2, 0x1421_bac7);
        let mut vm = load(
            "var t = roles.temperature(); var n = 0;\n\
             t.temperature.onChange(1, () => { n = n + 1; });",
            bus,
        );
        vm.run();

        let report = |v: f64| {
            let raw = (v * 1024.0) as i32;
            Packet::register_report(0xbeef, 2, 0x101, raw.to_le_bytes().to_vec())
        };

        // first report always fires
        vm.process_packet(&report(20.0));
        assert_eq!(vm.global(0), Some(1.0));
        // small delta stays quiet
        vm.process_packet(&report(20.5));
        assert_eq!(vm.global(0), Some(1.0));
        // crossing the threshold fires again
        vm.process_packet(&report(21.5));
        assert_eq!(vm.global(0), Some(2.0));
    }

    #[test]
    fn disconnect_wakes_observers_without_firing() {
        let bus = MockBus::new().with_service(0xdead, 1, 0x1473_a263);
        let mut vm = load(
            "var b = roles.button(); var n = 0; b.down.sub(() => { n = n + 1; });",
            bus,
        );
        vm.run();
        vm.process_packet(&Packet::event(0xdead, 1, 0x1, vec![]));
        assert_eq!(vm.global(0), Some(1.0));

        vm.bus_mut().drop_device(0xdead);
        vm.device_disconnected(0xdead);
        // dispatcher woke, saw no event, and is parked again
        assert_eq!(vm.global(0), Some(1.0));
        assert_eq!(vm.fibers_alive(), 1);
    }

    #[test]
    fn every_reschedules() {
        let mut vm = load("var n = 0; every(0.1, () => { n = n + 1; });", MockBus::new());
        vm.run();
        assert_eq!(vm.global(0), Some(0.0));

        vm.bus_mut().now = 101;
        vm.timer_fired();
        assert_eq!(vm.global(0), Some(1.0));

        vm.bus_mut().now = 202;
        vm.timer_fired();
        assert_eq!(vm.global(0), Some(2.0));
    }

    #[test]
    fn restart_after_user_panic() {
        let bus = MockBus::new();
        let mut host = MemoryHost::default();
        let out = compile(&mut host, "var a = 1; panic(3);");
        assert!(out.success);
        let config = VmConfig {
            restart_after_panic: true,
            restart_delay_ms: 100,
            ..VmConfig::default()
        };
        let mut vm = Vm::load(bus, &out.binary, config).unwrap();
        vm.run();
        assert_eq!(vm.fibers_alive(), 0);

        vm.bus_mut().now = 100;
        vm.timer_fired();
        // fresh run re-initialized globals and panicked again
        assert_eq!(vm.global(0), Some(1.0));
    }

    #[test]
    fn upload_sends_label_and_values() {
        let mut vm = load(
            "upload(format(\"t={0}\", 42), 1, 2);",
            MockBus::new(),
        );
        vm.run();
        let uploads = &vm.bus().uploads;
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "t=42");
        assert_eq!(uploads[0].1, vec![1.0, 2.0]);
    }
}
