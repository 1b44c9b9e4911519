//! Lowers the restricted script AST into a packed binary instruction image.
//!
//! Compilation is best-effort: errors are collected per statement and
//! emission continues, but the final image is only serialized (and
//! verified) when no error was recorded.

mod writer;

pub use writer::{LabelId, OpWriter, SectionWriter};

use crate::{
    ast::{
        AssignTarget, BinaryOp, Expr, ExprKind, Script, Stmt, StmtKind, UnaryOp, VarDeclarator,
    },
    error::{CompileError, CompileErrorTy, CompileResult, Span},
    format::{
        CellKind, DebugInfo, FunctionDebugInfo, OpAsync, OpBinary, OpCall, OpFmt, OpMath1,
        OpMath2, OpSync, OpTop, OpUnary, RoleDebugInfo, SrcMapEntry, ValueSpecial,
        FIX_HEADER_SIZE, FUNCTION_HEADER_SIZE, MAGIC0, MAGIC1, MAX_USER_PANIC, NUM_SECTIONS,
        SECTION_HEADER_SIZE,
    },
    parser::Parser,
    spec::{service_by_name, PacketKind, PacketSpec, ServiceSpec},
    verifier,
};

use log::{info, trace};
use std::collections::HashMap;
use string_interner::{StringInterner, Sym};

/// Refresh timeout for `.read()` on a constant register.
const REFRESH_MS_NEVER: u32 = 0;
/// Refresh timeout for `.read()` on everything else.
const REFRESH_MS_NORMAL: u32 = 500;

/// Shortest legal `every()` period.
const MIN_PERIOD_MS: f64 = 20.0;

/// Widest millisecond immediate a prefix run can encode.
const MAX_TIME_MS: f64 = 0x3f_ffff as f64;

/// Persists the compiled artifacts.
pub trait Host {
    fn write(&mut self, name: &str, contents: &[u8]);
}

/// In-memory host; keeps everything it is handed.
#[derive(Debug, Default)]
pub struct MemoryHost {
    pub files: HashMap<String, Vec<u8>>,
}

impl Host for MemoryHost {
    fn write(&mut self, name: &str, contents: &[u8]) {
        self.files.insert(name.to_string(), contents.to_vec());
    }
}

#[derive(Debug)]
pub struct CompileOutput {
    pub success: bool,
    pub binary: Vec<u8>,
    pub dbg: DebugInfo,
    pub errors: Vec<CompileError>,
}

/// Compile `source`, writing `prog.img` and `prog-dbg.json` to the host on
/// success.
pub fn compile(host: &mut dyn Host, source: &str) -> CompileOutput {
    let (script, interner, parse_errors) = Parser::new(source).parse();

    let mut program = Program::new(source, interner);
    program.errors.extend(parse_errors);
    program.emit(&script);

    if !program.errors.is_empty() {
        return CompileOutput {
            success: false,
            binary: Vec::new(),
            dbg: DebugInfo::default(),
            errors: program.errors,
        };
    }

    match program.serialize() {
        Ok((binary, dbg)) => {
            if let Err(err) = verifier::verify(&binary) {
                let mut errors = program.errors;
                errors.push(CompileError::new(
                    CompileErrorTy::Syntax,
                    format!("produced image failed verification: {}", err),
                    Span::default(),
                ));
                return CompileOutput {
                    success: false,
                    binary: Vec::new(),
                    dbg: DebugInfo::default(),
                    errors,
                };
            }

            host.write("prog.img", &binary);
            let json = serde_json::to_vec_pretty(&dbg).unwrap_or_default();
            host.write("prog-dbg.json", &json);

            info!("compiled {} bytes of image", binary.len());
            CompileOutput {
                success: true,
                binary,
                dbg,
                errors: Vec::new(),
            }
        }
        Err(err) => CompileOutput {
            success: false,
            binary: Vec::new(),
            dbg: DebugInfo::default(),
            errors: vec![err],
        },
    }
}

/// Where a compiled expression's value currently lives.
///
/// Only the first six kinds may reach emitted instructions; the rest are
/// transient descriptors that must be lowered first.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Reg(u8),
    Local(u16),
    Global(u16),
    Float(f64),
    Special(u16),
    BufferField {
        fmt: OpFmt,
        shift: u8,
        offset: u32,
    },

    Role(usize),
    PacketReg {
        role: usize,
        spec: &'static PacketSpec,
    },
    PacketEvent {
        role: usize,
        spec: &'static PacketSpec,
    },
    /// Multi-field register read; consumable only by `[a, b] = ...`
    ValueSeq {
        role: usize,
        spec: &'static PacketSpec,
    },
    /// The formatted packet buffer, pending consumption
    CurrBuffer,
    Str(u16),
}

impl Value {
    fn is_runtime(&self) -> bool {
        matches!(
            self,
            Value::Reg(_)
                | Value::Local(_)
                | Value::Global(_)
                | Value::Float(_)
                | Value::Special(_)
                | Value::BufferField { .. }
        )
    }
}

struct RoleCell {
    name: Sym,
    spec: &'static ServiceSpec,
    index: usize,
    dispatcher: Option<usize>,
}

struct Procedure {
    name: String,
    writer: OpWriter,
    ret_label: LabelId,
    /// Loop-back target for dispatchers and `every` bodies
    top_label: Option<LabelId>,
    locals: Vec<String>,
    local_map: HashMap<Sym, u16>,
    num_args: u8,
    span: Span,
    srcmap: Vec<SrcMapEntry>,
}

impl Procedure {
    fn new(name: String, span: Span) -> Self {
        let mut writer = OpWriter::new();
        let ret_label = writer.mk_label("ret");
        Self {
            name,
            writer,
            ret_label,
            top_label: None,
            locals: Vec::new(),
            local_map: HashMap::new(),
            num_args: 0,
            span,
            srcmap: Vec::new(),
        }
    }
}

struct Program<'a> {
    source: &'a str,
    interner: StringInterner<Sym>,
    roles: Vec<RoleCell>,
    globals: Vec<Sym>,
    global_map: HashMap<Sym, u16>,
    functions: HashMap<Sym, usize>,
    float_literals: Vec<f64>,
    string_literals: Vec<String>,
    procs: Vec<Procedure>,
    cur: usize,
    errors: Vec<CompileError>,
}

impl<'a> Program<'a> {
    fn new(source: &'a str, interner: StringInterner<Sym>) -> Self {
        let main = Procedure::new("main".to_string(), Span::default());
        Self {
            source,
            interner,
            roles: Vec::new(),
            globals: Vec::new(),
            global_map: HashMap::new(),
            functions: HashMap::new(),
            float_literals: Vec::new(),
            string_literals: Vec::new(),
            procs: vec![main],
            cur: 0,
            errors: Vec::new(),
        }
    }

    fn w(&mut self) -> &mut OpWriter {
        &mut self.procs[self.cur].writer
    }

    fn with_procedure<R>(&mut self, idx: usize, f: impl FnOnce(&mut Self) -> R) -> R {
        let prev = self.cur;
        self.cur = idx;
        let result = f(self);
        self.cur = prev;
        result
    }

    fn resolve(&self, sym: Sym) -> String {
        self.interner.resolve(sym).unwrap_or("").to_string()
    }

    fn line_of(&self, span: Span) -> u32 {
        let upto = span.start().min(self.source.len());
        self.source[..upto].bytes().filter(|&b| b == b'\n').count() as u32 + 1
    }

    fn err(&mut self, ty: CompileErrorTy, message: impl Into<String>, span: Span) {
        self.errors.push(CompileError::new(ty, message, span));
    }

    fn add_float(&mut self, v: f64) -> u32 {
        if let Some(i) = self
            .float_literals
            .iter()
            .position(|f| f.to_bits() == v.to_bits())
        {
            return i as u32;
        }
        self.float_literals.push(v);
        self.float_literals.len() as u32 - 1
    }

    fn add_string(&mut self, s: &str) -> u32 {
        if let Some(i) = self.string_literals.iter().position(|x| x == s) {
            return i as u32;
        }
        self.string_literals.push(s.to_string());
        self.string_literals.len() as u32 - 1
    }

    fn add_local(&mut self, name: Option<Sym>) -> u16 {
        let text = name.map(|sym| self.resolve(sym));
        let proc = &mut self.procs[self.cur];
        let idx = proc.locals.len() as u16;
        match (name, text) {
            (Some(sym), Some(text)) => {
                proc.locals.push(text);
                proc.local_map.insert(sym, idx);
            }
            _ => proc.locals.push(format!("_cache{}", idx)),
        }
        idx
    }

    // ---- top-level driving ----------------------------------------------

    fn emit(&mut self, script: &Script) {
        self.hoist(script);

        for stmt in &script.stmts {
            if let Err(err) = self.emit_top_stmt(stmt) {
                self.errors.push(err);
            }
        }

        self.finalize_dispatchers();
        self.finalize_procs();
    }

    /// Pre-scan top-level declarations so forward references resolve:
    /// role cells, global variables and function cells.
    fn hoist(&mut self, script: &Script) {
        for stmt in &script.stmts {
            match &stmt.kind {
                StmtKind::VarDecl(decls) => {
                    for decl in decls {
                        if self.is_role_init(&decl.init) {
                            self.hoist_role(decl);
                        } else {
                            self.hoist_global(decl);
                        }
                    }
                }
                StmtKind::FunctionDecl { name, params, .. } => {
                    if self.functions.contains_key(name) {
                        self.err(
                            CompileErrorTy::UnknownName,
                            format!("function `{}` already defined", self.resolve(*name)),
                            stmt.span,
                        );
                        continue;
                    }
                    let fn_name = self.resolve(*name);
                    let mut proc = Procedure::new(fn_name, stmt.span);
                    proc.num_args = params.len() as u8;
                    let idx = self.procs.len();
                    self.procs.push(proc);
                    self.functions.insert(*name, idx);
                    self.with_procedure(idx, |prog| {
                        for param in params {
                            prog.add_local(Some(param.name));
                        }
                    });
                }
                _ => {}
            }
        }
    }

    fn is_role_init(&self, init: &Option<Expr>) -> bool {
        if let Some(Expr {
            kind: ExprKind::Call { callee, .. },
            ..
        }) = init
        {
            if let ExprKind::Member { object, .. } = &callee.kind {
                if let ExprKind::Ident(sym) = &object.kind {
                    return self.interner.resolve(*sym) == Some("roles");
                }
            }
        }
        false
    }

    fn hoist_role(&mut self, decl: &VarDeclarator) {
        let service_span;
        let service = match &decl.init {
            Some(Expr {
                kind: ExprKind::Call { callee, args },
                ..
            }) => match &callee.kind {
                ExprKind::Member {
                    prop, prop_span, ..
                } => {
                    service_span = *prop_span;
                    if !args.is_empty() {
                        self.err(
                            CompileErrorTy::ArityMismatch,
                            "role constructors take no arguments",
                            decl.span,
                        );
                    }
                    self.resolve(*prop)
                }
                _ => return,
            },
            _ => return,
        };

        match service_by_name(&service) {
            Some(spec) => {
                let index = self.roles.len();
                self.roles.push(RoleCell {
                    name: decl.name,
                    spec,
                    index,
                    dispatcher: None,
                });
            }
            None => self.err(
                CompileErrorTy::UnknownService,
                format!("no service `{}`", service),
                service_span,
            ),
        }
    }

    fn hoist_global(&mut self, decl: &VarDeclarator) {
        if self.global_map.contains_key(&decl.name) {
            self.err(
                CompileErrorTy::UnknownName,
                format!("`{}` already declared", self.resolve(decl.name)),
                decl.span,
            );
            return;
        }
        let idx = self.globals.len() as u16;
        self.globals.push(decl.name);
        self.global_map.insert(decl.name, idx);
    }

    fn emit_top_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match &stmt.kind {
            StmtKind::FunctionDecl { name, body, .. } => {
                let idx = match self.functions.get(name) {
                    Some(&idx) => idx,
                    None => return Ok(()),
                };
                self.with_procedure(idx, |prog| {
                    for stmt in body {
                        if let Err(err) = prog.emit_stmt(stmt) {
                            prog.errors.push(err);
                        }
                    }
                    Ok(())
                })
            }
            _ => self.emit_stmt(stmt),
        }
    }

    // ---- statements ------------------------------------------------------

    fn emit_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        let line = self.line_of(stmt.span);
        let start = self.w().here() as u32;

        let result = self.emit_stmt_inner(stmt);

        let end = self.w().here() as u32;
        self.procs[self.cur]
            .srcmap
            .push((line, start, end.saturating_sub(start)));
        result
    }

    fn emit_stmt_inner(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match &stmt.kind {
            StmtKind::VarDecl(decls) => {
                for decl in decls {
                    self.emit_var_decl(decl)?;
                }
                Ok(())
            }
            StmtKind::If {
                cond,
                then,
                otherwise,
            } => self.emit_if(cond, then, otherwise.as_deref()),
            StmtKind::Return(value) => self.emit_return(value.as_ref(), stmt.span),
            StmtKind::Block(body) => {
                for stmt in body {
                    self.emit_stmt(stmt)?;
                }
                Ok(())
            }
            StmtKind::Expr(expr) => {
                self.w().push();
                let result = self.emit_expr(expr);
                self.w().pop();
                result.map(|_| ())
            }
            StmtKind::FunctionDecl { .. } => Err(CompileError::new(
                CompileErrorTy::UnsupportedSyntax,
                "functions may only be declared at the top level",
                stmt.span,
            )),
        }
    }

    fn emit_var_decl(&mut self, decl: &VarDeclarator) -> CompileResult<()> {
        if self.cur == 0 {
            // top-level vars became globals (or roles) during hoisting
            if self.roles.iter().any(|r| r.name == decl.name) {
                return Ok(());
            }
            if let Some(init) = &decl.init {
                let idx = match self.global_map.get(&decl.name) {
                    Some(&idx) => idx,
                    None => return Ok(()),
                };
                self.w().push();
                let value = self.emit_runtime_expr(init)?;
                self.store_cell(Value::Global(idx), value, init.span)?;
                self.w().pop();
            }
            return Ok(());
        }

        if self.is_role_init(&decl.init) {
            return Err(CompileError::new(
                CompileErrorTy::UnsupportedSyntax,
                "roles must be declared at the top level",
                decl.span,
            ));
        }

        let idx = self.add_local(Some(decl.name));
        if let Some(init) = &decl.init {
            self.w().push();
            let value = self.emit_runtime_expr(init)?;
            self.store_cell(Value::Local(idx), value, init.span)?;
            self.w().pop();
        }
        Ok(())
    }

    fn emit_if(
        &mut self,
        cond: &Expr,
        then: &Stmt,
        otherwise: Option<&Stmt>,
    ) -> CompileResult<()> {
        self.w().push();
        let value = self.emit_runtime_expr(cond)?;
        let reg = self.force_reg(value, cond.span)?;

        if let Some(otherwise) = otherwise {
            let else_label = self.w().mk_label("elseif");
            let end_label = self.w().mk_label("endif");
            self.w().emit_jump(else_label, Some(reg));
            self.w().pop();
            self.emit_stmt(then)?;
            self.w().emit_jump(end_label, None);
            self.w().emit_label(else_label);
            self.emit_stmt(otherwise)?;
            self.w().emit_label(end_label);
        } else {
            let skip_label = self.w().mk_label("skipif");
            self.w().emit_jump(skip_label, Some(reg));
            self.w().pop();
            self.emit_stmt(then)?;
            self.w().emit_label(skip_label);
        }
        Ok(())
    }

    fn emit_return(&mut self, value: Option<&Expr>, span: Span) -> CompileResult<()> {
        self.w().push();
        match value {
            Some(expr) => {
                let v = self.emit_runtime_expr(expr)?;
                self.load_into_reg(v, 0, expr.span)?;
            }
            None => {
                self.load_into_reg(Value::Float(f64::NAN), 0, span)?;
            }
        }
        self.w().pop();
        let ret = self.procs[self.cur].ret_label;
        self.w().emit_jump(ret, None);
        Ok(())
    }

    // ---- expressions -----------------------------------------------------

    /// Emit an expression and insist the result is a runtime value.
    fn emit_runtime_expr(&mut self, expr: &Expr) -> CompileResult<Value> {
        let value = self.emit_expr(expr)?;
        self.require_runtime(value, expr.span)?;
        Ok(value)
    }

    fn require_runtime(&self, value: Value, span: Span) -> CompileResult<()> {
        if value.is_runtime() {
            Ok(())
        } else {
            Err(CompileError::new(
                CompileErrorTy::ValueRequired,
                "value required here",
                span,
            ))
        }
    }

    fn emit_expr(&mut self, expr: &Expr) -> CompileResult<Value> {
        match &expr.kind {
            ExprKind::Number(v) => Ok(Value::Float(*v)),
            ExprKind::String(s) => {
                let idx = self.add_string(s);
                Ok(Value::Str(idx as u16))
            }
            ExprKind::Ident(sym) => self.lookup(*sym, expr.span),
            ExprKind::Unary { op, expr: inner } => self.emit_unary(*op, inner),
            ExprKind::Binary { op, lhs, rhs } => self.emit_binary(*op, lhs, rhs, expr.span),
            ExprKind::Member {
                object,
                prop,
                prop_span,
            } => self.emit_member(object, *prop, *prop_span),
            ExprKind::Call { callee, args } => self.emit_call(callee, args, expr.span),
            ExprKind::Arrow { .. } => Err(CompileError::new(
                CompileErrorTy::UnsupportedSyntax,
                "handlers are only allowed as subscription arguments",
                expr.span,
            )),
            ExprKind::Assign { target, value } => self.emit_assign(target, value, expr.span),
        }
    }

    fn lookup(&mut self, sym: Sym, span: Span) -> CompileResult<Value> {
        if self.cur != 0 {
            if let Some(&idx) = self.procs[self.cur].local_map.get(&sym) {
                return Ok(Value::Local(idx));
            }
        }
        if let Some(&idx) = self.global_map.get(&sym) {
            return Ok(Value::Global(idx));
        }
        if let Some(role) = self.roles.iter().find(|r| r.name == sym) {
            return Ok(Value::Role(role.index));
        }
        Err(CompileError::new(
            CompileErrorTy::UnknownName,
            format!("unknown name `{}`", self.resolve(sym)),
            span,
        ))
    }

    fn emit_unary(&mut self, op: UnaryOp, inner: &Expr) -> CompileResult<Value> {
        let value = self.emit_runtime_expr(inner)?;
        if op == UnaryOp::Plus {
            return Ok(value);
        }
        let reg = self.force_reg(value, inner.span)?;
        let unop = match op {
            UnaryOp::Neg => OpUnary::Neg,
            UnaryOp::Not => OpUnary::Not,
            UnaryOp::Plus => unreachable!(),
        };
        self.w().emit_unary(unop, reg, reg);
        Ok(Value::Reg(reg))
    }

    fn emit_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> CompileResult<Value> {
        if op == BinaryOp::Pow {
            return self.emit_math2(OpMath2::Pow, lhs, rhs, span);
        }

        // `a > b` is compiled as `b < a`
        let (op, lhs, rhs) = match op {
            BinaryOp::Gt => (BinaryOp::Lt, rhs, lhs),
            BinaryOp::Ge => (BinaryOp::Le, rhs, lhs),
            _ => (op, lhs, rhs),
        };

        let binop = match op {
            BinaryOp::Add => OpBinary::Add,
            BinaryOp::Sub => OpBinary::Sub,
            BinaryOp::Mul => OpBinary::Mul,
            BinaryOp::Div => OpBinary::Div,
            BinaryOp::Lt => OpBinary::Lt,
            BinaryOp::Le => OpBinary::Le,
            BinaryOp::Eq => OpBinary::Eq,
            BinaryOp::Ne => OpBinary::Ne,
            BinaryOp::And => OpBinary::And,
            BinaryOp::Or => OpBinary::Or,
            BinaryOp::Pow | BinaryOp::Gt | BinaryOp::Ge => unreachable!(),
        };

        let lv = self.emit_runtime_expr(lhs)?;
        let dst = self.force_reg_fresh(lv, lhs.span)?;
        self.w().push();
        let rv = self.emit_runtime_expr(rhs)?;
        let src = self.force_reg(rv, rhs.span)?;
        self.w().emit_binary(binop, dst, src);
        self.w().pop();
        Ok(Value::Reg(dst))
    }

    fn emit_member(&mut self, object: &Expr, prop: Sym, prop_span: Span) -> CompileResult<Value> {
        // Math.* only makes sense as a callee; handled in emit_call
        if let ExprKind::Ident(sym) = &object.kind {
            if self.interner.resolve(*sym) == Some("Math") {
                return Err(CompileError::new(
                    CompileErrorTy::UnsupportedSyntax,
                    "Math members must be called",
                    prop_span,
                ));
            }
        }

        let obj = self.emit_expr(object)?;
        match obj {
            Value::Role(role) => {
                let member = self.resolve(prop);
                let spec = self.roles[role].spec;
                match spec.lookup(&member) {
                    Some(pkt) if pkt.kind.is_register() => Ok(Value::PacketReg { role, spec: pkt }),
                    Some(pkt) => Ok(Value::PacketEvent { role, spec: pkt }),
                    None => Err(CompileError::new(
                        CompileErrorTy::UnknownMember,
                        format!("service `{}` has no member `{}`", spec.name, member),
                        prop_span,
                    )),
                }
            }
            _ => Err(CompileError::new(
                CompileErrorTy::UnknownMember,
                "member access is only valid on roles",
                prop_span,
            )),
        }
    }

    fn emit_assign(
        &mut self,
        target: &AssignTarget,
        value: &Expr,
        span: Span,
    ) -> CompileResult<Value> {
        match target {
            AssignTarget::Ident(sym, target_span) => {
                let cell = self.lookup(*sym, *target_span)?;
                match cell {
                    Value::Local(_) | Value::Global(_) => {}
                    _ => {
                        return Err(CompileError::new(
                            CompileErrorTy::UnsupportedSyntax,
                            "cannot assign to this",
                            *target_span,
                        ))
                    }
                }
                let v = self.emit_runtime_expr(value)?;
                self.store_cell(cell, v, span)?;
                Ok(v)
            }
            AssignTarget::ArrayPattern(names) => {
                let v = self.emit_expr(value)?;
                let spec = match v {
                    Value::ValueSeq { spec, .. } => spec,
                    _ => {
                        return Err(CompileError::new(
                            CompileErrorTy::InvalidArgument,
                            "destructuring needs a multi-field register read",
                            value.span,
                        ))
                    }
                };
                if names.len() > spec.fields.len() {
                    return Err(CompileError::new(
                        CompileErrorTy::ArityMismatch,
                        format!(
                            "register `{}` has {} fields",
                            spec.name,
                            spec.fields.len()
                        ),
                        span,
                    ));
                }

                let mut offset = 0u32;
                for (param, field) in names.iter().zip(spec.fields.iter()) {
                    let fmt = self.field_fmt(field, span)?;
                    let cell = self.lookup(param.name, param.span)?;
                    self.w().push();
                    let reg = self.w().alloc_reg(param.span)?;
                    self.load_into_reg(
                        Value::BufferField {
                            fmt,
                            shift: field.shift,
                            offset,
                        },
                        reg,
                        param.span,
                    )?;
                    self.store_cell(cell, Value::Reg(reg), param.span)?;
                    self.w().pop();
                    offset += field.size();
                }
                Ok(Value::Float(f64::NAN))
            }
        }
    }

    fn field_fmt(
        &self,
        field: &crate::spec::PacketField,
        span: Span,
    ) -> CompileResult<OpFmt> {
        field.numfmt().ok_or_else(|| {
            CompileError::new(
                CompileErrorTy::InvalidArgument,
                format!("field `{}` has unsupported storage", field.name),
                span,
            )
        })
    }

    // ---- calls -----------------------------------------------------------

    fn emit_call(&mut self, callee: &Expr, args: &[Expr], span: Span) -> CompileResult<Value> {
        if let ExprKind::Ident(sym) = &callee.kind {
            let name = self.resolve(*sym);
            match name.as_str() {
                "wait" => return self.emit_wait(args, span),
                "every" => return self.emit_every(args, span),
                "print" => return self.emit_format_op(args, span, true),
                "format" => return self.emit_format_op(args, span, false),
                "upload" => return self.emit_upload(args, span),
                "panic" => return self.emit_panic(args, span),
                _ => {}
            }
            if let Some(&idx) = self.functions.get(sym) {
                return self.emit_proc_call(idx, args, span, OpCall::Sync);
            }
        }

        if let ExprKind::Member {
            object,
            prop,
            prop_span,
        } = &callee.kind
        {
            if let ExprKind::Ident(sym) = &object.kind {
                match self.interner.resolve(*sym) {
                    Some("Math") => {
                        let fun = self.resolve(*prop);
                        return self.emit_math(&fun, args, span, *prop_span);
                    }
                    Some("roles") => {
                        return Err(CompileError::new(
                            CompileErrorTy::UnsupportedSyntax,
                            "role constructors may only initialize a top-level `var`",
                            span,
                        ))
                    }
                    _ => {}
                }
            }

            let obj = self.emit_expr(object)?;
            let method = self.resolve(*prop);
            match obj {
                Value::PacketReg { role, spec } => match method.as_str() {
                    "read" => return self.emit_reg_read(role, spec, args, span),
                    "write" => return self.emit_reg_write(role, spec, args, span),
                    "onChange" => return self.emit_on_change(role, spec, args, span),
                    _ => {
                        return Err(CompileError::new(
                            CompileErrorTy::UnknownMember,
                            format!("registers have no method `{}`", method),
                            *prop_span,
                        ))
                    }
                },
                Value::PacketEvent { role, spec } => match method.as_str() {
                    "sub" => return self.emit_event_sub(role, spec, args, span),
                    _ => {
                        return Err(CompileError::new(
                            CompileErrorTy::UnknownMember,
                            format!("events have no method `{}`", method),
                            *prop_span,
                        ))
                    }
                },
                _ => {}
            }
        }

        Err(CompileError::new(
            CompileErrorTy::UnknownName,
            "cannot call this",
            span,
        ))
    }

    /// Load call arguments into registers 0..n and invoke the procedure.
    fn emit_proc_call(
        &mut self,
        idx: usize,
        args: &[Expr],
        span: Span,
        mode: OpCall,
    ) -> CompileResult<Value> {
        let num_args = self.procs[idx].num_args;
        if args.len() != num_args as usize {
            return Err(CompileError::new(
                CompileErrorTy::ArityMismatch,
                format!(
                    "`{}` takes {} argument(s), got {}",
                    self.procs[idx].name,
                    num_args,
                    args.len()
                ),
                span,
            ));
        }

        self.w().push();
        let mut temps = Vec::with_capacity(args.len());
        for arg in args {
            let v = self.emit_runtime_expr(arg)?;
            temps.push(self.force_reg(v, arg.span)?);
        }
        let arg_regs = self.w().alloc_arg_regs(args.len() as u8, span)?;
        for (i, &tmp) in temps.iter().enumerate() {
            self.w().emit_mov(arg_regs[i], tmp);
        }
        self.w().emit_call(idx as u32, num_args, mode);
        self.w().pop();

        if mode == OpCall::Sync {
            let dst = self.w().alloc_reg(span)?;
            self.w().emit_mov(dst, 0);
            Ok(Value::Reg(dst))
        } else {
            Ok(Value::Float(f64::NAN))
        }
    }

    fn literal_number(&mut self, expr: &Expr, what: &str) -> CompileResult<f64> {
        match expr.kind {
            ExprKind::Number(v) => Ok(v),
            _ => Err(CompileError::new(
                CompileErrorTy::InvalidArgument,
                format!("{} requires a numeric literal", what),
                expr.span,
            )),
        }
    }

    fn emit_wait(&mut self, args: &[Expr], span: Span) -> CompileResult<Value> {
        if args.len() != 1 {
            return Err(CompileError::new(
                CompileErrorTy::ArityMismatch,
                "wait(seconds)",
                span,
            ));
        }
        let seconds = self.literal_number(&args[0], "wait")?;
        let ms = (seconds * 1000.0).round().max(0.0);
        if ms > MAX_TIME_MS {
            return Err(CompileError::new(
                CompileErrorTy::InvalidArgument,
                format!("wait() time above the {} ms limit", MAX_TIME_MS as u32),
                args[0].span,
            ));
        }
        self.w().emit_async(OpAsync::Yield, ms as u32, 0, 0);
        Ok(Value::Float(f64::NAN))
    }

    fn emit_every(&mut self, args: &[Expr], span: Span) -> CompileResult<Value> {
        if args.len() != 2 {
            return Err(CompileError::new(
                CompileErrorTy::ArityMismatch,
                "every(seconds, handler)",
                span,
            ));
        }
        let seconds = self.literal_number(&args[0], "every")?;
        let ms = (seconds * 1000.0).round().max(MIN_PERIOD_MS);
        // the handler re-arms with YIELD ms+1
        if ms + 1.0 > MAX_TIME_MS {
            return Err(CompileError::new(
                CompileErrorTy::InvalidArgument,
                format!("every() period above the {} ms limit", MAX_TIME_MS as u32 - 1),
                args[0].span,
            ));
        }
        let ms = ms as u32;

        let body = match &args[1].kind {
            ExprKind::Arrow { params, body } if params.is_empty() => body,
            _ => {
                return Err(CompileError::new(
                    CompileErrorTy::InvalidArgument,
                    "every() takes a zero-argument handler",
                    args[1].span,
                ))
            }
        };

        let idx = self.procs.len();
        let name = format!("every_{}ms", ms);
        self.procs.push(Procedure::new(name, span));
        self.with_procedure(idx, |prog| -> CompileResult<()> {
            let top = prog.w().mk_label("top");
            prog.w().emit_label(top);
            prog.procs[prog.cur].top_label = Some(top);
            // re-armed by the trailing jump appended at finalize
            prog.w().emit_async(OpAsync::Yield, ms + 1, 0, 0);
            for stmt in body {
                prog.emit_stmt(stmt)?;
            }
            Ok(())
        })?;

        self.w().emit_call(idx as u32, 0, OpCall::BgMax1);
        Ok(Value::Float(f64::NAN))
    }

    /// `print(fmt, ...)` logs; `format(fmt, ...)` keeps the buffer pending.
    fn emit_format_op(
        &mut self,
        args: &[Expr],
        span: Span,
        log: bool,
    ) -> CompileResult<Value> {
        if args.is_empty() {
            return Err(CompileError::new(
                CompileErrorTy::ArityMismatch,
                "format string required",
                span,
            ));
        }
        let str_idx = match self.emit_expr(&args[0])? {
            Value::Str(idx) => idx,
            _ => {
                return Err(CompileError::new(
                    CompileErrorTy::InvalidArgument,
                    "format string must be a string literal",
                    args[0].span,
                ))
            }
        };

        let rest = &args[1..];
        self.w().push();
        let mut temps = Vec::with_capacity(rest.len());
        for arg in rest {
            let v = self.emit_runtime_expr(arg)?;
            temps.push(self.force_reg(v, arg.span)?);
        }
        let arg_regs = self.w().alloc_arg_regs(rest.len() as u8, span)?;
        for (i, &tmp) in temps.iter().enumerate() {
            self.w().emit_mov(arg_regs[i], tmp);
        }

        if log {
            self.w()
                .emit_sync(OpSync::LogFormat, u32::from(str_idx), rest.len() as u32, 0, 0);
            self.w().pop();
            Ok(Value::Float(f64::NAN))
        } else {
            self.w().alloc_buf(span)?;
            self.w()
                .emit_sync(OpSync::Format, u32::from(str_idx), rest.len() as u32, 0, 0);
            self.w().pop();
            Ok(Value::CurrBuffer)
        }
    }

    fn emit_upload(&mut self, args: &[Expr], span: Span) -> CompileResult<Value> {
        if args.is_empty() {
            return Err(CompileError::new(
                CompileErrorTy::ArityMismatch,
                "upload(label, ...)",
                span,
            ));
        }
        match self.emit_expr(&args[0])? {
            Value::CurrBuffer => {}
            _ => {
                return Err(CompileError::new(
                    CompileErrorTy::ValueRequired,
                    "upload label must be a formatted buffer (use format())",
                    args[0].span,
                ))
            }
        }

        let rest = &args[1..];
        self.w().push();
        let mut temps = Vec::with_capacity(rest.len());
        for arg in rest {
            let v = self.emit_runtime_expr(arg)?;
            temps.push(self.force_reg(v, arg.span)?);
        }
        let arg_regs = self.w().alloc_arg_regs(rest.len() as u8, span)?;
        for (i, &tmp) in temps.iter().enumerate() {
            self.w().emit_mov(arg_regs[i], tmp);
        }
        self.w()
            .emit_async(OpAsync::CloudUpload, rest.len() as u32, 0, 0);
        self.w().pop();
        self.w().free_buf();
        Ok(Value::Float(f64::NAN))
    }

    fn emit_panic(&mut self, args: &[Expr], span: Span) -> CompileResult<Value> {
        if args.len() != 1 {
            return Err(CompileError::new(
                CompileErrorTy::ArityMismatch,
                "panic(code)",
                span,
            ));
        }
        let code = self.literal_number(&args[0], "panic")?;
        if code.fract() != 0.0 || code < 1.0 || code > f64::from(MAX_USER_PANIC) {
            return Err(CompileError::new(
                CompileErrorTy::InvalidArgument,
                "panic code must be an integer in 1..=65535",
                args[0].span,
            ));
        }
        self.w().emit_sync(OpSync::Panic, code as u32, 0, 0, 0);
        Ok(Value::Float(f64::NAN))
    }

    // ---- Math ------------------------------------------------------------

    fn emit_math(
        &mut self,
        fun: &str,
        args: &[Expr],
        span: Span,
        prop_span: Span,
    ) -> CompileResult<Value> {
        match fun {
            "floor" => self.emit_math1(OpMath1::Floor, args, span),
            "round" => self.emit_math1(OpMath1::Round, args, span),
            "ceil" => self.emit_math1(OpMath1::Ceil, args, span),
            "log" => self.emit_math1(OpMath1::LogE, args, span),
            "random" => self.emit_random(args, span),
            "min" => self.expect_two(args, span).and_then(|(a, b)| {
                self.emit_math2(OpMath2::Min, a, b, span)
            }),
            "max" => self.expect_two(args, span).and_then(|(a, b)| {
                self.emit_math2(OpMath2::Max, a, b, span)
            }),
            "pow" => self.expect_two(args, span).and_then(|(a, b)| {
                self.emit_math2(OpMath2::Pow, a, b, span)
            }),
            "sqrt" => self.emit_math2_lit(args, span, 0.5, false),
            "cbrt" => self.emit_math2_lit(args, span, 1.0 / 3.0, false),
            "exp" => self.emit_math2_lit(args, span, std::f64::consts::E, true),
            "log10" => self.emit_log_scaled(args, span, std::f64::consts::LN_10),
            "log2" => self.emit_log_scaled(args, span, std::f64::consts::LN_2),
            _ => Err(CompileError::new(
                CompileErrorTy::UnknownMember,
                format!("no Math function `{}`", fun),
                prop_span,
            )),
        }
    }

    fn expect_two<'e>(
        &mut self,
        args: &'e [Expr],
        span: Span,
    ) -> CompileResult<(&'e Expr, &'e Expr)> {
        if args.len() == 2 {
            Ok((&args[0], &args[1]))
        } else {
            Err(CompileError::new(
                CompileErrorTy::ArityMismatch,
                "expected two arguments",
                span,
            ))
        }
    }

    fn emit_math1(&mut self, op: OpMath1, args: &[Expr], span: Span) -> CompileResult<Value> {
        if args.len() != 1 {
            return Err(CompileError::new(
                CompileErrorTy::ArityMismatch,
                "expected one argument",
                span,
            ));
        }
        self.w().push();
        let v = self.emit_runtime_expr(&args[0])?;
        let tmp = self.force_reg(v, args[0].span)?;
        let arg_regs = self.w().alloc_arg_regs(1, span)?;
        self.w().emit_mov(arg_regs[0], tmp);
        self.w().emit_sync(OpSync::Math1, op as u32, 0, 0, 0);
        self.w().pop();

        let dst = self.w().alloc_reg(span)?;
        self.w().emit_mov(dst, 0);
        Ok(Value::Reg(dst))
    }

    /// `Math.random()` scales 1; `Math.random(x)` scales x.
    fn emit_random(&mut self, args: &[Expr], span: Span) -> CompileResult<Value> {
        self.w().push();
        let scale = match args.len() {
            0 => Value::Float(1.0),
            1 => self.emit_runtime_expr(&args[0])?,
            _ => {
                return Err(CompileError::new(
                    CompileErrorTy::ArityMismatch,
                    "Math.random takes at most one argument",
                    span,
                ))
            }
        };
        let tmp = self.force_reg(scale, span)?;
        let arg_regs = self.w().alloc_arg_regs(1, span)?;
        self.w().emit_mov(arg_regs[0], tmp);
        self.w()
            .emit_sync(OpSync::Math1, OpMath1::Random as u32, 0, 0, 0);
        self.w().pop();

        let dst = self.w().alloc_reg(span)?;
        self.w().emit_mov(dst, 0);
        Ok(Value::Reg(dst))
    }

    fn emit_math2(
        &mut self,
        op: OpMath2,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> CompileResult<Value> {
        self.w().push();
        let lv = self.emit_runtime_expr(lhs)?;
        let lt = self.force_reg(lv, lhs.span)?;
        let rv = self.emit_runtime_expr(rhs)?;
        let rt = self.force_reg(rv, rhs.span)?;
        let arg_regs = self.w().alloc_arg_regs(2, span)?;
        self.w().emit_mov(arg_regs[0], lt);
        self.w().emit_mov(arg_regs[1], rt);
        self.w().emit_sync(OpSync::Math2, op as u32, 0, 0, 0);
        self.w().pop();

        let dst = self.w().alloc_reg(span)?;
        self.w().emit_mov(dst, 0);
        Ok(Value::Reg(dst))
    }

    /// pow with one literal operand; `flip` puts the literal first (exp).
    fn emit_math2_lit(
        &mut self,
        args: &[Expr],
        span: Span,
        lit: f64,
        flip: bool,
    ) -> CompileResult<Value> {
        if args.len() != 1 {
            return Err(CompileError::new(
                CompileErrorTy::ArityMismatch,
                "expected one argument",
                span,
            ));
        }
        self.w().push();
        let v = self.emit_runtime_expr(&args[0])?;
        let vt = self.force_reg(v, args[0].span)?;
        let lt = self.force_reg(Value::Float(lit), span)?;
        let arg_regs = self.w().alloc_arg_regs(2, span)?;
        if flip {
            self.w().emit_mov(arg_regs[0], lt);
            self.w().emit_mov(arg_regs[1], vt);
        } else {
            self.w().emit_mov(arg_regs[0], vt);
            self.w().emit_mov(arg_regs[1], lt);
        }
        self.w()
            .emit_sync(OpSync::Math2, OpMath2::Pow as u32, 0, 0, 0);
        self.w().pop();

        let dst = self.w().alloc_reg(span)?;
        self.w().emit_mov(dst, 0);
        Ok(Value::Reg(dst))
    }

    /// log_base(x) = ln(x) * (1 / ln(base))
    fn emit_log_scaled(&mut self, args: &[Expr], span: Span, ln_base: f64) -> CompileResult<Value> {
        let ln = self.emit_math1(OpMath1::LogE, args, span)?;
        let dst = self.force_reg(ln, span)?;
        self.w().push();
        let scale = self.force_reg(Value::Float(1.0 / ln_base), span)?;
        self.w().emit_binary(OpBinary::Mul, dst, scale);
        self.w().pop();
        Ok(Value::Reg(dst))
    }

    // ---- register / event operations ------------------------------------

    fn refresh_ms(spec: &PacketSpec) -> u32 {
        if spec.kind == PacketKind::Const {
            REFRESH_MS_NEVER
        } else {
            REFRESH_MS_NORMAL
        }
    }

    fn emit_reg_read(
        &mut self,
        role: usize,
        spec: &'static PacketSpec,
        args: &[Expr],
        span: Span,
    ) -> CompileResult<Value> {
        if !args.is_empty() {
            return Err(CompileError::new(
                CompileErrorTy::ArityMismatch,
                "read() takes no arguments",
                span,
            ));
        }
        self.w().emit_async(
            OpAsync::QueryReg,
            role as u32,
            u32::from(spec.identifier),
            Self::refresh_ms(spec),
        );

        if spec.fields.len() == 1 {
            let field = &spec.fields[0];
            let fmt = self.field_fmt(field, span)?;
            let reg = self.w().alloc_reg(span)?;
            self.load_into_reg(
                Value::BufferField {
                    fmt,
                    shift: field.shift,
                    offset: 0,
                },
                reg,
                span,
            )?;
            Ok(Value::Reg(reg))
        } else {
            Ok(Value::ValueSeq { role, spec })
        }
    }

    fn emit_reg_write(
        &mut self,
        role: usize,
        spec: &'static PacketSpec,
        args: &[Expr],
        span: Span,
    ) -> CompileResult<Value> {
        if spec.kind != PacketKind::ReadWrite {
            return Err(CompileError::new(
                CompileErrorTy::InvalidArgument,
                format!("register `{}` is not writable", spec.name),
                span,
            ));
        }
        if args.len() != spec.fields.len() {
            return Err(CompileError::new(
                CompileErrorTy::ArityMismatch,
                format!("write() expects {} value(s)", spec.fields.len()),
                span,
            ));
        }

        let size = spec.total_size();
        self.w().alloc_buf(span)?;
        self.w().emit_sync(OpSync::SetupBuffer, size, 0, 0, 0);

        let mut offset = 0u32;
        for (arg, field) in args.iter().zip(spec.fields.iter()) {
            let fmt = self.field_fmt(field, span)?;
            self.w().push();
            let v = self.emit_runtime_expr(arg)?;
            let reg = self.force_reg(v, arg.span)?;
            self.store_cell(
                Value::BufferField {
                    fmt,
                    shift: field.shift,
                    offset,
                },
                Value::Reg(reg),
                arg.span,
            )?;
            self.w().pop();
            offset += field.size();
        }

        self.w().emit_async(
            OpAsync::SetReg,
            role as u32,
            u32::from(spec.identifier),
            size,
        );
        self.w().free_buf();
        Ok(Value::Float(f64::NAN))
    }

    /// Compile a subscription handler into its own procedure.
    fn handler_proc(&mut self, name: String, expr: &Expr) -> CompileResult<usize> {
        let body = match &expr.kind {
            ExprKind::Arrow { params, body } if params.is_empty() => body,
            ExprKind::Arrow { .. } => {
                return Err(CompileError::new(
                    CompileErrorTy::InvalidArgument,
                    "handlers take no arguments",
                    expr.span,
                ))
            }
            _ => {
                return Err(CompileError::new(
                    CompileErrorTy::InvalidArgument,
                    "handler must be an arrow function",
                    expr.span,
                ))
            }
        };

        let idx = self.procs.len();
        self.procs.push(Procedure::new(name, expr.span));
        self.with_procedure(idx, |prog| -> CompileResult<()> {
            for stmt in body {
                prog.emit_stmt(stmt)?;
            }
            Ok(())
        })?;
        Ok(idx)
    }

    /// Lazily create the per-role dispatcher procedure and start its fiber
    /// from the current position.
    fn role_dispatcher(&mut self, role: usize, span: Span) -> CompileResult<usize> {
        if let Some(idx) = self.roles[role].dispatcher {
            return Ok(idx);
        }

        let name = format!("{}_disp", self.resolve(self.roles[role].name));
        let idx = self.procs.len();
        self.procs.push(Procedure::new(name, span));
        self.roles[role].dispatcher = Some(idx);

        self.with_procedure(idx, |prog| {
            let top = prog.w().mk_label("top");
            prog.w().emit_label(top);
            prog.procs[prog.cur].top_label = Some(top);
            prog.w()
                .emit_sync(OpSync::ObserveRole, role as u32, 0, 0, 0);
            prog.w().emit_async(OpAsync::Yield, 0, 0, 0);
        });

        // dispatchers run as background fibers, started once
        self.w().emit_call(idx as u32, 0, OpCall::BgMax1);
        Ok(idx)
    }

    fn emit_event_sub(
        &mut self,
        role: usize,
        spec: &'static PacketSpec,
        args: &[Expr],
        span: Span,
    ) -> CompileResult<Value> {
        if args.len() != 1 {
            return Err(CompileError::new(
                CompileErrorTy::ArityMismatch,
                "sub(handler)",
                span,
            ));
        }
        let handler_name = format!(
            "{}_{}",
            self.resolve(self.roles[role].name),
            spec.name
        );
        let handler = self.handler_proc(handler_name, &args[0])?;
        let disp = self.role_dispatcher(role, span)?;

        self.with_procedure(disp, |prog| -> CompileResult<()> {
            prog.w().push();
            let ev = prog.w().alloc_reg(span)?;
            prog.load_into_reg(
                Value::Special(ValueSpecial::EvCode as u16),
                ev,
                span,
            )?;
            let code = prog.force_reg(Value::Float(f64::from(spec.identifier)), span)?;
            prog.w().emit_binary(OpBinary::Eq, ev, code);
            let skip = prog.w().mk_label("skip");
            prog.w().emit_jump(skip, Some(ev));
            prog.w().pop();
            prog.w().emit_call(handler as u32, 0, OpCall::Sync);
            prog.w().emit_label(skip);
            Ok(())
        })?;
        Ok(Value::Float(f64::NAN))
    }

    fn emit_on_change(
        &mut self,
        role: usize,
        spec: &'static PacketSpec,
        args: &[Expr],
        span: Span,
    ) -> CompileResult<Value> {
        if args.len() != 2 {
            return Err(CompileError::new(
                CompileErrorTy::ArityMismatch,
                "onChange(threshold, handler)",
                span,
            ));
        }
        if spec.fields.len() != 1 {
            return Err(CompileError::new(
                CompileErrorTy::InvalidArgument,
                "onChange needs a single-field register",
                span,
            ));
        }
        let threshold = self.literal_number(&args[0], "onChange threshold")?;
        let field = &spec.fields[0];
        let fmt = self.field_fmt(field, span)?;
        let shift = field.shift;

        let handler_name = format!(
            "{}_{}_chg",
            self.resolve(self.roles[role].name),
            spec.name
        );
        let handler = self.handler_proc(handler_name, &args[1])?;
        let disp = self.role_dispatcher(role, span)?;

        self.with_procedure(disp, |prog| -> CompileResult<()> {
            // last observed value; starts out NaN so the very first report
            // always fires the handler
            let cache = prog.add_local(None);

            prog.w().push();
            let rc = prog.w().alloc_reg(span)?;
            prog.load_into_reg(
                Value::Special(ValueSpecial::RegGetCode as u16),
                rc,
                span,
            )?;
            let code = prog.force_reg(Value::Float(f64::from(spec.identifier)), span)?;
            prog.w().emit_binary(OpBinary::Eq, rc, code);
            let skip = prog.w().mk_label("skip");
            prog.w().emit_jump(skip, Some(rc));

            let v = prog.w().alloc_reg(span)?;
            prog.load_into_reg(
                Value::BufferField {
                    fmt,
                    shift,
                    offset: 0,
                },
                v,
                span,
            )?;
            let diff = prog.w().alloc_reg(span)?;
            prog.load_into_reg(Value::Local(cache), diff, span)?;
            prog.w().emit_binary(OpBinary::Sub, diff, v);
            prog.w().emit_unary(OpUnary::Abs, diff, diff);
            let t = prog.force_reg(Value::Float(threshold), span)?;
            prog.w().emit_binary(OpBinary::Lt, diff, t);
            prog.w().emit_unary(OpUnary::Not, diff, diff);
            let small = prog.w().mk_label("small");
            prog.w().emit_jump(small, Some(diff));
            prog.store_cell(Value::Local(cache), Value::Reg(v), span)?;
            prog.w().pop();
            prog.w().emit_call(handler as u32, 0, OpCall::Sync);
            prog.w().emit_label(small);
            prog.w().emit_label(skip);
            Ok(())
        })?;
        Ok(Value::Float(f64::NAN))
    }

    // ---- value plumbing --------------------------------------------------

    /// Place a runtime value into a specific register.
    fn load_into_reg(&mut self, value: Value, reg: u8, span: Span) -> CompileResult<()> {
        match value {
            Value::Reg(src) => {
                self.w().emit_mov(reg, src);
                Ok(())
            }
            Value::Local(idx) => {
                self.w()
                    .emit_load_store(OpTop::LoadCell, reg, CellKind::Local as u16, u32::from(idx), 0);
                Ok(())
            }
            Value::Global(idx) => {
                self.w().emit_load_store(
                    OpTop::LoadCell,
                    reg,
                    CellKind::Global as u16,
                    u32::from(idx),
                    0,
                );
                Ok(())
            }
            Value::Float(v) => {
                if v.is_nan() {
                    self.w().emit_load_store(
                        OpTop::LoadCell,
                        reg,
                        CellKind::Special as u16,
                        ValueSpecial::Nan as u32,
                        0,
                    );
                } else if v.fract() == 0.0 && (0.0..=65535.0).contains(&v) {
                    self.w().emit_load_store(
                        OpTop::LoadCell,
                        reg,
                        CellKind::Identity as u16,
                        v as u32,
                        0,
                    );
                } else {
                    let idx = self.add_float(v);
                    self.w().emit_load_store(
                        OpTop::LoadCell,
                        reg,
                        CellKind::FloatConst as u16,
                        idx,
                        0,
                    );
                }
                Ok(())
            }
            Value::Special(idx) => {
                self.w().emit_load_store(
                    OpTop::LoadCell,
                    reg,
                    CellKind::Special as u16,
                    u32::from(idx),
                    0,
                );
                Ok(())
            }
            Value::BufferField { fmt, shift, offset } => {
                let idx = (u32::from(shift) << 4) | fmt as u32;
                self.w().emit_load_store(
                    OpTop::LoadCell,
                    reg,
                    CellKind::Buffer as u16,
                    idx,
                    offset,
                );
                Ok(())
            }
            _ => Err(CompileError::new(
                CompileErrorTy::ValueRequired,
                "value required here",
                span,
            )),
        }
    }

    /// Store a runtime value into a local, global or buffer cell.
    fn store_cell(&mut self, cell: Value, value: Value, span: Span) -> CompileResult<()> {
        self.w().push();
        let src = self.force_reg(value, span)?;
        let result = match cell {
            Value::Local(idx) => {
                self.w().emit_load_store(
                    OpTop::StoreCell,
                    src,
                    CellKind::Local as u16,
                    u32::from(idx),
                    0,
                );
                Ok(())
            }
            Value::Global(idx) => {
                self.w().emit_load_store(
                    OpTop::StoreCell,
                    src,
                    CellKind::Global as u16,
                    u32::from(idx),
                    0,
                );
                Ok(())
            }
            Value::BufferField { fmt, shift, offset } => {
                let idx = (u32::from(shift) << 4) | fmt as u32;
                self.w().emit_load_store(
                    OpTop::StoreCell,
                    src,
                    CellKind::Buffer as u16,
                    idx,
                    offset,
                );
                Ok(())
            }
            _ => Err(CompileError::new(
                CompileErrorTy::ValueRequired,
                "cannot store into this",
                span,
            )),
        };
        self.w().pop_except(match value {
            Value::Reg(r) => Some(r),
            _ => None,
        });
        result
    }

    /// Materialize a value into some register.
    fn force_reg(&mut self, value: Value, span: Span) -> CompileResult<u8> {
        if let Value::Reg(reg) = value {
            return Ok(reg);
        }
        let reg = self.w().alloc_reg(span)?;
        self.load_into_reg(value, reg, span)?;
        Ok(reg)
    }

    /// Like `force_reg`, but always into a freshly allocated register so the
    /// caller may clobber it.
    fn force_reg_fresh(&mut self, value: Value, span: Span) -> CompileResult<u8> {
        let reg = self.w().alloc_reg(span)?;
        self.load_into_reg(value, reg, span)?;
        Ok(reg)
    }

    // ---- finalization ----------------------------------------------------

    /// Append the loop-back jump to every dispatcher / `every` procedure.
    fn finalize_dispatchers(&mut self) {
        for idx in 0..self.procs.len() {
            if let Some(top) = self.procs[idx].top_label {
                self.with_procedure(idx, |prog| {
                    prog.w().emit_jump(top, None);
                });
            }
        }
    }

    fn finalize_procs(&mut self) {
        for idx in 0..self.procs.len() {
            let span = self.procs[idx].span;
            let ret = self.procs[idx].ret_label;
            let result = self.with_procedure(idx, |prog| -> CompileResult<()> {
                prog.w().emit_label(ret);
                prog.w().emit_sync(OpSync::Return, 0, 0, 0, 0);
                prog.w().patch_labels(span)?;
                if prog.w().max_regs() > 15 {
                    return Err(CompileError::new(
                        CompileErrorTy::OverflowedRegisters,
                        "procedure needs too many live registers",
                        span,
                    ));
                }
                Ok(())
            });
            if let Err(err) = result {
                self.errors.push(err);
            }
        }
    }

    // ---- serialization ---------------------------------------------------

    fn serialize(&mut self) -> CompileResult<(Vec<u8>, DebugInfo)> {
        trace!(
            "serializing {} procs, {} roles, {} globals",
            self.procs.len(),
            self.roles.len(),
            self.globals.len()
        );

        // code first: function bodies packed back to back
        let mut code = SectionWriter::new();
        let mut descrs = Vec::with_capacity(self.procs.len());
        for proc in &self.procs {
            let start = code.len();
            for &word in proc.writer.binary() {
                code.append_u16(word);
            }
            descrs.push((start, code.len() - start, proc));
        }
        code.align(8);

        let fun_hd_len = self.procs.len() * FUNCTION_HEADER_SIZE;
        let code_start = FIX_HEADER_SIZE + NUM_SECTIONS * SECTION_HEADER_SIZE + fun_hd_len;

        let mut fun_hd = SectionWriter::new();
        for (start, len, proc) in &descrs {
            fun_hd.append_u32((code_start + start) as u32);
            fun_hd.append_u32(*len as u32);
            fun_hd.append_u16(proc.locals.len() as u16);
            fun_hd.append(&[proc.writer.max_regs() | (proc.num_args << 4), 0]);
            fun_hd.append_u32(0);
        }

        let mut floats = SectionWriter::new();
        for &f in &self.float_literals {
            floats.append(&f.to_le_bytes());
        }

        let mut roles = SectionWriter::new();
        for role in &self.roles {
            roles.append_u32(role.spec.class_id);
            roles.append_u32(0);
        }

        let mut str_data = SectionWriter::new();
        let mut str_hd = SectionWriter::new();
        for s in &self.string_literals {
            str_hd.append_u32(str_data.len() as u32);
            str_hd.append_u32(s.len() as u32);
            str_data.append(s.as_bytes());
            str_data.append(&[0]);
        }
        str_data.align(4);

        // fixed header + section table
        let mut image = SectionWriter::new();
        image.append_u32(MAGIC0);
        image.append_u32(MAGIC1);
        image.append_u16(self.globals.len() as u16);
        image.align(FIX_HEADER_SIZE);

        let sections = [
            fun_hd.into_bytes(),
            code.into_bytes(),
            floats.into_bytes(),
            roles.into_bytes(),
            str_hd.into_bytes(),
            str_data.into_bytes(),
        ];

        let mut offset = FIX_HEADER_SIZE + NUM_SECTIONS * SECTION_HEADER_SIZE;
        for section in &sections {
            image.append_u32(offset as u32);
            image.append_u32(section.len() as u32);
            offset += section.len();
        }
        for section in &sections {
            image.append(section);
        }

        let dbg = self.debug_info();
        Ok((image.into_bytes(), dbg))
    }

    fn debug_info(&self) -> DebugInfo {
        DebugInfo {
            functions: self
                .procs
                .iter()
                .map(|proc| FunctionDebugInfo {
                    name: proc.name.clone(),
                    srcmap: proc.srcmap.clone(),
                    locals: proc.locals.clone(),
                })
                .collect(),
            globals: self
                .globals
                .iter()
                .map(|&sym| self.interner.resolve(sym).unwrap_or("").to_string())
                .collect(),
            roles: self
                .roles
                .iter()
                .map(|role| RoleDebugInfo {
                    name: self.interner.resolve(role.name).unwrap_or("").to_string(),
                    service_class: role.spec.class_id,
                })
                .collect(),
            source: self.source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{self, InstrParams, NoResolver};

    fn compile_src(src: &str) -> CompileOutput {
        let mut host = MemoryHost::default();
        compile(&mut host, src)
    }

    fn assert_ok(src: &str) -> CompileOutput {
        let out = compile_src(src);
        assert!(out.success, "compile failed: {:?}", out.errors);
        out
    }

    #[test]
    fn empty_program() {
        let out = assert_ok("");
        assert!(out.binary.len() >= FIX_HEADER_SIZE);
    }

    #[test]
    fn globals_and_arithmetic() {
        let out = assert_ok("var a = 1; var b = 2; a = a + b * 3;");
        assert_eq!(out.dbg.globals, vec!["a", "b"]);
    }

    #[test]
    fn button_counter_shape() {
        let out =
            assert_ok("var b = roles.button(); var n = 0; b.down.sub(() => { n = n + 1; });");

        assert_eq!(out.dbg.roles.len(), 1);
        assert_eq!(out.dbg.roles[0].service_class, 0x1473_a263);
        // main, handler, dispatcher
        assert_eq!(out.dbg.functions.len(), 3);
        assert_eq!(out.dbg.functions[0].name, "main");
    }

    #[test]
    fn rejects_oversized_time_immediates() {
        let out = compile_src("wait(4200);");
        assert!(!out.success);
        assert_eq!(out.errors[0].ty(), CompileErrorTy::InvalidArgument);

        let out = compile_src("every(4200, () => {});");
        assert!(!out.success);
        assert_eq!(out.errors[0].ty(), CompileErrorTy::InvalidArgument);

        assert_ok("wait(4194);");
    }

    #[test]
    fn unknown_service_is_an_error() {
        let out = compile_src("var x = roles.waffleIron();");
        assert!(!out.success);
        assert_eq!(out.errors[0].ty(), CompileErrorTy::UnknownService);
    }

    #[test]
    fn unknown_member_is_an_error() {
        let out = compile_src("var b = roles.button(); b.frobnicate.sub(() => {});");
        assert!(!out.success);
        assert_eq!(out.errors[0].ty(), CompileErrorTy::UnknownMember);
    }

    #[test]
    fn role_used_as_value_is_rejected() {
        let out = compile_src("var b = roles.button(); var x = b + 1;");
        assert!(!out.success);
        assert!(out
            .errors
            .iter()
            .any(|e| e.ty() == CompileErrorTy::ValueRequired));
    }

    #[test]
    fn functions_and_forward_calls() {
        let out = assert_ok(
            "var x = twice(21);\nfunction twice(n) { return n * 2; }",
        );
        assert_eq!(out.dbg.functions[1].name, "twice");
        assert_eq!(out.dbg.functions[1].locals, vec!["n"]);
    }

    #[test]
    fn every_creates_looping_proc() {
        let out = assert_ok("every(0.02, () => { print(\"tick\"); });");
        assert!(out
            .dbg
            .functions
            .iter()
            .any(|f| f.name.starts_with("every_")));
    }

    #[test]
    fn upload_requires_format() {
        let out = compile_src("upload(\"label\", 1);");
        assert!(!out.success);

        let out = assert_ok("var t = roles.temperature(); upload(format(\"t={0}\", 1), 2);");
        assert!(out.success);
    }

    #[test]
    fn panic_code_range() {
        assert!(compile_src("panic(0);").errors[0].ty() == CompileErrorTy::InvalidArgument);
        assert!(compile_src("panic(70000);").errors[0].ty() == CompileErrorTy::InvalidArgument);
        assert_ok("panic(42);");
    }

    #[test]
    fn statement_errors_do_not_stop_collection() {
        let out = compile_src("var a = missing1; var b = missing2;");
        assert!(out.errors.len() >= 2);
    }

    #[test]
    fn main_ends_in_return() {
        let out = assert_ok("var a = 1;");
        let img = crate::image::ImageInfo::parse(&out.binary).unwrap();
        let main = &img.functions[0];
        let last = img.word(main.start_pc + main.num_words - 1);
        assert_eq!(last >> 12, format::OpTop::Sync as u16);
        assert_eq!(last & 0xff, format::OpSync::Return as u16);
    }

    #[test]
    fn wide_jump_disassembles() {
        // force a SET_B prefix carrying more than 6 bits of jump offset
        let mut src = String::from("var a = 0; if (a < 1) {");
        for _ in 0..40 {
            src.push_str("a = a + 1;");
        }
        src.push('}');
        let out = assert_ok(&src);

        let img = crate::image::ImageInfo::parse(&out.binary).unwrap();
        let main = &img.functions[0];
        let mut st = InstrParams::new();
        let mut text = String::new();
        for pc in main.start_pc..main.start_pc + main.num_words {
            text.push_str(&format::stringify_instr(&mut st, img.word(pc), &NoResolver));
            text.push('\n');
        }
        assert!(text.contains("jump"));
    }
}
