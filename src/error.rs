use core::{fmt, ops::Range};

/// A byte range into the source text.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Span {
    start: usize,
    end: usize,
}

impl Span {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub const fn start(&self) -> usize {
        self.start
    }

    pub const fn end(&self) -> usize {
        self.end
    }

    pub const fn merge(start: Self, end: Self) -> Self {
        Self::new(start.start, end.end)
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl From<Range<usize>> for Span {
    fn from(range: Range<usize>) -> Self {
        Self {
            start: range.start,
            end: range.end,
        }
    }
}

impl Into<Range<usize>> for Span {
    fn into(self) -> Range<usize> {
        self.start..self.end
    }
}

pub type CompileResult<T> = Result<T, CompileError>;

/// An error produced while parsing or lowering a script.
#[derive(Debug, Clone, Eq)]
pub struct CompileError {
    pub ty: CompileErrorTy,
    pub message: String,
    pub span: Span,
}

impl CompileError {
    pub fn new(ty: CompileErrorTy, message: impl Into<String>, span: Span) -> Self {
        Self {
            ty,
            message: message.into(),
            span,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn ty(&self) -> CompileErrorTy {
        self.ty
    }

    pub fn span(&self) -> Span {
        self.span
    }
}

impl PartialEq for CompileError {
    fn eq(&self, other: &Self) -> bool {
        self.ty == other.ty
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Compile Error: {:?}] {}", self.ty, self.message)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompileErrorTy {
    Syntax,
    UnknownName,
    UnknownService,
    UnknownMember,
    /// A virtual value (role, register handle, pending buffer) was used
    /// where a runtime value is required
    ValueRequired,
    ArityMismatch,
    InvalidArgument,
    UnsupportedSyntax,
    OverflowedRegisters,
}

pub type VerifyResult<T> = Result<T, VerifyError>;

/// A structural or dataflow violation found in a binary image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    /// Byte offset of the violation within the image
    pub offset: usize,
    pub message: String,
}

impl VerifyError {
    pub fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Verification Error @{:#x}] {}",
            self.offset, self.message
        )
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// A runtime fault; converted into an internal-error panic by the run loop.
#[derive(Debug, Clone, Eq)]
pub struct RuntimeError {
    pub ty: RuntimeErrorTy,
    pub message: String,
}

impl RuntimeError {
    pub fn new(ty: RuntimeErrorTy, message: impl Into<String>) -> Self {
        Self {
            ty,
            message: message.into(),
        }
    }
}

impl PartialEq for RuntimeError {
    fn eq(&self, other: &Self) -> bool {
        self.ty == other.ty
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Runtime Error: {:?}] {}", self.ty, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorTy {
    IllegalInstruction,
    InvalidJump,
    InvalidFunction,
    InvalidRole,
    InvalidCell,
    StepLimit,
    StdoutError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_merge() {
        let a = Span::new(1, 4);
        let b = Span::new(6, 9);
        assert_eq!(Span::merge(a, b), Span::new(1, 9));
    }

    #[test]
    fn compile_errors_compare_by_ty() {
        let a = CompileError::new(CompileErrorTy::Syntax, "one", Span::new(0, 1));
        let b = CompileError::new(CompileErrorTy::Syntax, "two", Span::new(5, 6));
        assert_eq!(a, b);
    }
}
