//! The `busscript` command line: build, check and disassemble scripts.

use crate::{
    compiler::{self, Host},
    error::CompileError,
    format::{
        stringify_instr, CellKind, DebugInfo, InstrArgResolver, InstrParams, NoResolver,
    },
    image::ImageInfo,
};

use codespan_reporting::{
    diagnostic::{Diagnostic, Label},
    files::SimpleFile,
    term::{
        self,
        termcolor::{ColorChoice, StandardStream},
    },
};
use log::{error, info};
use std::{fs, path::PathBuf};
use structopt::StructOpt;

#[derive(Debug, Clone, StructOpt)]
#[structopt(
    name = "busscript",
    about = "Compiler and disassembler for device-bus scripts",
    rename_all = "kebab-case"
)]
pub struct Opts {
    /// Enables debug logging
    #[structopt(short = "d", long = "debug-log")]
    pub debug_log: bool,

    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, StructOpt)]
#[structopt(rename_all = "kebab-case")]
pub enum Command {
    /// Compile a script into a binary image plus debug info
    Build {
        #[structopt(name = "FILE", parse(from_os_str))]
        file: PathBuf,

        /// Directory the artifacts are written to
        #[structopt(short = "o", long = "out-dir", default_value = "built")]
        out_dir: PathBuf,
    },

    /// Compile and verify a script without writing anything
    Check {
        #[structopt(name = "FILE", parse(from_os_str))]
        file: PathBuf,
    },

    /// Print the instructions of a compiled image
    Disasm {
        #[structopt(name = "FILE", parse(from_os_str))]
        file: PathBuf,
    },
}

/// Runs one command, returning the process exit code.
pub fn run(opts: Opts) -> i32 {
    match opts.command {
        Command::Build { file, out_dir } => build(&file, Some(out_dir)),
        Command::Check { file } => build(&file, None),
        Command::Disasm { file } => disasm(&file),
    }
}

/// Host writing the compiled artifacts next to each other in a directory.
struct DiskHost {
    out_dir: PathBuf,
    failed: bool,
}

impl Host for DiskHost {
    fn write(&mut self, name: &str, contents: &[u8]) {
        let path = self.out_dir.join(name);
        if let Err(err) = fs::create_dir_all(&self.out_dir).and_then(|_| fs::write(&path, contents))
        {
            error!("failed to write {}: {}", path.display(), err);
            self.failed = true;
        } else {
            info!("wrote {} ({} bytes)", path.display(), contents.len());
        }
    }
}

/// Host that drops everything, for `check`.
struct NullHost;

impl Host for NullHost {
    fn write(&mut self, _name: &str, _contents: &[u8]) {}
}

fn build(file: &PathBuf, out_dir: Option<PathBuf>) -> i32 {
    let source = match fs::read_to_string(file) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("failed to read {}: {}", file.display(), err);
            return 1;
        }
    };

    let out = match out_dir {
        Some(out_dir) => {
            let mut host = DiskHost {
                out_dir,
                failed: false,
            };
            let out = compiler::compile(&mut host, &source);
            if host.failed {
                return 1;
            }
            out
        }
        None => compiler::compile(&mut NullHost, &source),
    };

    if out.success {
        println!(
            "{}: ok, {} bytes of image",
            file.display(),
            out.binary.len()
        );
        0
    } else {
        emit_errors(file, &source, &out.errors);
        1
    }
}

fn emit_errors(file: &PathBuf, source: &str, errors: &[CompileError]) {
    let files = SimpleFile::new(file.display().to_string(), source);
    let writer = StandardStream::stderr(ColorChoice::Auto);
    let config = term::Config::default();

    for err in errors {
        let span = err.span();
        let diagnostic = Diagnostic::error()
            .with_message(err.message())
            .with_labels(vec![Label::primary((), span.start()..span.end())]);

        if let Err(err) = term::emit(&mut writer.lock(), &config, &files, &diagnostic) {
            eprintln!("failed to render diagnostic: {}", err);
        }
    }
}

/// Index-to-name resolution backed by the `-dbg.json` emitted at build time.
struct DebugResolver {
    dbg: DebugInfo,
}

impl InstrArgResolver for DebugResolver {
    fn describe_cell(&self, kind: CellKind, idx: u32) -> Option<String> {
        match kind {
            CellKind::Global => self.dbg.globals.get(idx as usize).cloned(),
            _ => None,
        }
    }

    fn fun_name(&self, idx: u32) -> Option<String> {
        self.dbg.functions.get(idx as usize).map(|f| f.name.clone())
    }

    fn role_name(&self, idx: u32) -> Option<String> {
        self.dbg.roles.get(idx as usize).map(|r| r.name.clone())
    }
}

/// Looks for `<stem>-dbg.json` next to the image.
fn load_debug_info(image_path: &PathBuf) -> Option<DebugInfo> {
    let stem = image_path.file_stem()?.to_str()?;
    let dbg_path = image_path.with_file_name(format!("{}-dbg.json", stem));
    let bytes = fs::read(dbg_path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn disasm(file: &PathBuf) -> i32 {
    let bytes = match fs::read(file) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("failed to read {}: {}", file.display(), err);
            return 1;
        }
    };

    let info = match ImageInfo::parse(&bytes) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("{}", err);
            return 1;
        }
    };

    let resolver: Box<dyn InstrArgResolver> = match load_debug_info(file) {
        Some(dbg) => Box::new(DebugResolver { dbg }),
        None => Box::new(NoResolver),
    };

    println!(
        "{} globals, {} roles, {} floats, {} strings",
        info.num_globals,
        info.role_classes.len(),
        info.floats.len(),
        info.strings.len()
    );

    for (idx, fun) in info.functions.iter().enumerate() {
        let name = resolver
            .fun_name(idx as u32)
            .unwrap_or_else(|| format!("fn{}", idx));
        println!(
            "\n{}: {} args, {} locals, {} regs",
            name, fun.num_args, fun.num_locals, fun.num_regs
        );

        let mut state = InstrParams::new();
        for pc in fun.start_pc..fun.end_pc() {
            let text = stringify_instr(&mut state, info.word(pc), &*resolver);
            println!("{:6}: {}", pc, text);
        }
    }

    0
}
