use clap::crate_name;

fn main() {
    let exit_code = run_cli();
    std::process::exit(exit_code);
}

fn run_cli() -> i32 {
    let args: Vec<_> = std::env::args().collect();

    // A first, permissive pass just to read -v/-vvv before logging is
    // configured; clap's own parsing happens again inside `rbgen::run`.
    let verbosity = args.iter().filter(|a| a.as_str() == "-v" || a.as_str() == "--verbose").count();
    let loglevel = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .format_module_path(false)
        .filter(Some(crate_name!()), loglevel)
        .init();

    log::trace!("executing cli");

    match rbgen::run(args) {
        Ok(()) => libc::EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            libc::EXIT_FAILURE
        }
    }
}
