mod cli;
mod config;

use std::io::Read;
use std::time::Instant;

use clap::Parser;
use color_eyre::eyre::{eyre, Result, WrapErr};

use crate::config::Config;

fn main() {
    match run() {
        Ok(()) => (),
        Err(err) => {
            eprintln!("{err:?}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<()> {
    let args = cli::Args::parse();
    if args.debug {
        std::env::set_var("RUST_BACKTRACE", "1");
    }
    color_eyre::install()?;
    setup_log(args.debug)?;

    let origin = std::env::current_dir().wrap_err("Failed to determine the current directory")?;

    if args.clean {
        engine::workspace::Workspace::new(origin.clone())
            .clean()
            .map_err(|err| eyre!("{err:#}"))?;
        if args.path.is_none() {
            return Ok(());
        }
    }

    // A document on stdin can only be read once; restarts replay the
    // captured text, while file input is re-read so that edits made by the
    // run itself (spell_check) are picked up.
    let stdin_text = match args.path {
        Some(_) => None,
        None => {
            tracing::info!("reading from stdin");
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .wrap_err("Failed to read standard input")?;
            Some(text)
        }
    };

    let start = Instant::now();
    loop {
        let (file_name, text) = read_document(args.path.as_deref(), stdin_text.as_deref())?;

        let root = match parser::parse(&text) {
            Ok(root) => root,
            Err(errors) => {
                for error in errors {
                    error
                        .into_report(&file_name)
                        .eprint((file_name.as_str(), ariadne::Source::from(text.as_str())))
                        .ok();
                }
                return Err(eyre!("Failed to parse {file_name}"));
            }
        };

        if args.tree {
            print!("{}", root.as_indented_string());
            return Ok(());
        }

        let engine_config = Config::load(&origin)?.into_engine(origin.clone(), args.keep.clone());
        let engine = engine::Engine::new(engine_config).map_err(|err| eyre!("{err:#}"))?;

        match engine.execute(&root, &file_name) {
            Ok(engine::Outcome::Done(summary)) => {
                tracing::info!(
                    "{} frames; {} includes; {} shell commands; {:.02} seconds",
                    summary.frames,
                    summary.includes,
                    summary.shells,
                    start.elapsed().as_secs_f64()
                );
                return Ok(());
            }
            Ok(engine::Outcome::Restart) => {
                tracing::info!("restart requested; running again");
                continue;
            }
            Err(err) => return Err(err.into_report()),
        }
    }
}

fn read_document(path: Option<&std::path::Path>, stdin_text: Option<&str>) -> Result<(String, String)> {
    match (path, stdin_text) {
        (Some(path), _) => {
            let text = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("Failed to read '{}'", path.display()))?;
            Ok((path.display().to_string(), text))
        }
        (None, Some(text)) => Ok((engine::STDIN_NAME.to_owned(), text.to_owned())),
        (None, None) => unreachable!("stdin is captured before the run loop"),
    }
}

fn setup_log(debug: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(if debug { "debug" } else { "info" })
        });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
