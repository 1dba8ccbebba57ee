//! Command-line front-end over [`Patcher`].

use std::path::PathBuf;
use std::process;

use clap::Parser;
use elfpatch::Patcher;

#[derive(Parser)]
#[command(
    name = "elfpatch",
    version,
    about = "Rewrite the interpreter, SONAME and runpath of ELF binaries"
)]
struct Args {
    /// Print the program interpreter
    #[arg(long, visible_alias = "pi")]
    print_interpreter: bool,

    /// Print the DT_NEEDED entries, one per line
    #[arg(long, visible_alias = "pn")]
    print_needed: bool,

    /// Print the SONAME
    #[arg(long, visible_alias = "ps")]
    print_soname: bool,

    /// Print the runpath
    #[arg(long, visible_alias = "pr")]
    print_runpath: bool,

    /// Set the program interpreter
    #[arg(long, visible_alias = "interp", value_name = "INTERP")]
    set_interpreter: Option<String>,

    /// Set the SONAME of a shared library
    #[arg(long, visible_alias = "so", value_name = "SONAME")]
    set_soname: Option<String>,

    /// Set the runtime library search path
    #[arg(long, visible_alias = "runpath", value_name = "PATH")]
    set_runpath: Option<String>,

    /// Operate on DT_RPATH instead of DT_RUNPATH
    #[arg(long)]
    force_rpath: bool,

    /// ELF file to inspect or patch
    filename: PathBuf,

    /// Where to write the patched file (default: overwrite FILENAME)
    output_file: Option<PathBuf>,
}

fn run(args: &Args) -> elfpatch::Result<()> {
    let mut patcher = Patcher::open(&args.filename)?;
    if args.force_rpath {
        patcher.use_rpath();
    }

    if let Some(interp) = &args.set_interpreter {
        patcher.set_interpreter(interp)?;
    }
    if let Some(soname) = &args.set_soname {
        patcher.set_soname(soname)?;
    }
    if let Some(runpath) = &args.set_runpath {
        patcher.set_runpath(runpath)?;
    }

    if args.print_interpreter {
        println!("{}", patcher.interpreter().unwrap_or_default());
    }
    if args.print_needed {
        for lib in patcher.needed() {
            println!("{lib}");
        }
    }
    if args.print_soname {
        println!("{}", patcher.soname().unwrap_or_default());
    }
    if args.print_runpath {
        println!("{}", patcher.runpath().unwrap_or_default());
    }

    patcher.save(args.output_file.as_deref())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .init();
    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("elfpatch: {err}");
        process::exit(1);
    }
}
