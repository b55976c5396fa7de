use clap::{Parser, Subcommand};

mod client;

/// Interactive WebSocket client built on wsengine.
///
/// Each line typed is sent as a text message; received messages, errors and the close event
/// are printed as they arrive. Anything after `//` on a line is kept in the history (search it
/// with ctrl+r) but not sent:
///
///   {"op": "subscribe", "channel": "trades"} // subscribe to trades
#[derive(Parser)]
#[command(author, version)]
struct Cli {
    /// Print the engine's debug logs (negotiation, state transitions, close handshake).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a session and exchange messages from the terminal.
    Client(client::Cmd),
}

fn main() {
    let args = Cli::parse();
    if args.verbose {
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Debug)
            .init();
    }

    let Commands::Client(cmd) = args.command;
    if let Err(err) = client::run(cmd) {
        eprintln!("wsenginec: {err:#}");
        std::process::exit(1);
    }
}
