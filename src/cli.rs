use std::path::PathBuf;

/// Run a mash document: text interleaved with the code that builds it.
#[derive(clap::Parser, Debug)]
#[command(version, about)]
pub struct Args {
    /// Document to run; read standard input when omitted.
    pub path: Option<PathBuf>,

    /// Wipe the build and archive directories first. With no document,
    /// exit after cleaning.
    #[arg(short, long)]
    pub clean: bool,

    /// Print the parsed frame tree and exit without executing.
    #[arg(long)]
    pub tree: bool,

    /// Where final outputs land; defaults to the current directory.
    #[arg(long, value_name = "DIR")]
    pub keep: Option<PathBuf>,

    /// Enable backtraces and verbose logging.
    #[arg(long)]
    pub debug: bool,
}
