//! Compiler, verifier and cooperative VM for a small device-bus scripting
//! language.
//!
//! Scripts are a restricted JavaScript subset: every value is an `f64`,
//! functions don't nest (except zero-argument arrow handlers) and all I/O
//! goes through typed service roles. The compiler lowers a script into a
//! fixed-width 16-bit instruction image, the verifier proves the image safe
//! to run without further checks, and the VM executes it as a set of
//! cooperatively scheduled fibers over a device bus.
//!
//! ```
//! use busscript::{compile, MemoryHost};
//!
//! let mut host = MemoryHost::default();
//! let out = compile(&mut host, "var n = 1 + 2;");
//! assert!(out.success);
//! ```

pub mod ast;
pub mod cli;
pub mod compiler;
pub mod error;
pub mod format;
pub mod image;
pub mod parser;
pub mod spec;
pub mod strfmt;
pub mod token;
pub mod verifier;
pub mod vm;

pub use compiler::{compile, CompileOutput, Host, MemoryHost};
pub use error::{CompileError, RuntimeError, VerifyError};
pub use image::ImageInfo;
pub use vm::{Bus, MockBus, Packet, Vm, VmConfig};
