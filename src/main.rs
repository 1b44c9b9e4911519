use busscript::cli::{self, Opts};
use structopt::StructOpt;

fn main() {
    let opts = Opts::from_args();

    if opts.debug_log {
        simple_logger::init().ok();
    }

    std::process::exit(cli::run(opts));
}
