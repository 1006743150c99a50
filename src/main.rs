mod cli;

use clap::Parser;

fn main() {
    let cli = cli::Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    simple_logger::SimpleLogger::new()
        .with_level(level)
        .init()
        .expect("setting up the logger failed");

    if let Err(problem) = cli.run() {
        log::error!("{:?}", problem);
        std::process::exit(1);
    }
}
