use clap::Parser as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};
use vallox_se_tools::commands;

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Channels(commands::channels::Args),
    Read(commands::read::Args),
    Set(commands::set::Args),
    Monitor(commands::monitor::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

#[tokio::main]
async fn main() {
    let filter = std::env::var("VALLOX_SE_TOOLS_LOG")
        .unwrap_or_default()
        .parse::<tracing_subscriber::filter::targets::Targets>()
        .unwrap_or_default();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Channels(args) => end(commands::channels::run(args)),
        Commands::Read(args) => end(commands::read::run(args).await),
        Commands::Set(args) => end(commands::set::run(args).await),
        Commands::Monitor(args) => end(commands::monitor::run(args).await),
    }
}
