use std::time::Duration;

use clap::Args;
use rustyline::ExternalPrinter;
use tokio::{
    runtime,
    sync::mpsc::{unbounded_channel, UnboundedReceiver},
};
use url::Url;
use wsengine::{
    close::CloseCode, CompressionLevel, Credentials, Event, Message, OpCode, Options,
    ProxyConfig, WebSocket,
};

/// Options of the `client` command: handshake settings and how received messages are shown.
#[derive(Args)]
#[command(alias = "c")]
pub struct Cmd {
    /// Maximum duration to wait for each handshake attempt.
    /// Accepts human-readable formats like "5s", "1m", "500ms".
    #[arg(short, long, value_parser = humantime::parse_duration, default_value = "5s")]
    timeout: Duration,

    /// When enabled, validates and pretty-prints received messages as JSON.
    /// Invalid JSON messages will result in an error.
    #[arg(long)]
    input_as_json: bool,

    /// Subprotocols to offer, in order of preference.
    #[arg(short, long = "protocol")]
    protocols: Vec<String>,

    /// Offer permessage-deflate.
    #[arg(short, long)]
    compression: bool,

    /// Credentials as "user:password", sent when the server asks for them.
    #[arg(short, long)]
    user: Option<String>,

    /// An HTTP proxy to tunnel through, e.g. "http://proxy.local:3128".
    #[arg(long)]
    proxy: Option<Url>,

    /// Follow 3xx redirects.
    #[arg(short = 'L', long)]
    follow: bool,

    /// Interval of automatic pings, e.g. "30s".
    #[arg(long, value_parser = humantime::parse_duration)]
    keepalive: Option<Duration>,

    /// The WebSocket URL to connect to (ws:// or wss://)
    url: Url,
}

impl Cmd {
    fn options(&self) -> anyhow::Result<Options> {
        let mut options = Options::default()
            .with_connect_timeout(self.timeout)
            .with_protocols(self.protocols.iter().cloned())
            .with_utf8();

        if self.compression {
            options = options.with_compression_level(CompressionLevel::default());
        }
        if let Some(user) = &self.user {
            let (username, password) = user
                .split_once(':')
                .ok_or(anyhow::anyhow!("credentials must be \"user:password\""))?;
            options = options.with_credentials(Credentials::new(username, password), false);
        }
        if let Some(proxy) = &self.proxy {
            options = options.with_proxy(ProxyConfig::new(proxy.clone()));
        }
        if self.follow {
            options = options.with_redirection();
        }
        if let Some(interval) = self.keepalive {
            options = options.with_keepalive(interval);
        }

        Ok(options)
    }
}

pub fn run(cmd: Cmd) -> anyhow::Result<()> {
    let history_path = home::home_dir()
        .ok_or(anyhow::anyhow!("unable to determine home path"))?
        .join(".wsengine_history");

    // Handle user input with history
    let mut rl = rustyline::DefaultEditor::with_config(
        rustyline::Config::builder()
            .auto_add_history(true)
            .completion_type(rustyline::CompletionType::List)
            .max_history_size(1000)?
            .build(),
    )?;
    // ignore the error
    let _ = rl.load_history(&history_path);
    // external printer
    let printer = rl.create_external_printer()?;

    let runtime = runtime::Builder::new_current_thread().enable_all().build()?;
    let _guard = runtime.enter();

    let (tx, rx) = unbounded_channel();
    let (handler, events) = wsengine::events::channel();

    let ws = runtime.block_on(
        WebSocket::connect(cmd.url.clone())
            .with_options(cmd.options()?)
            .with_handler(handler),
    )?;

    match ws.protocol() {
        Some(protocol) => println!("> Connected to {} ({protocol})", cmd.url),
        None => println!("> Connected to {}", cmd.url),
    }

    let opts = Opts {
        input_as_json: cmd.input_as_json,
    };

    runtime.spawn_blocking(move || loop {
        let readline = rl.readline("> ");
        match readline {
            Ok(mut line) => {
                let _ = rl.add_history_entry(line.as_str());
                // commented line
                if let Some(pos) = line.rfind("//") {
                    let _ = line.split_off(pos);
                }

                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(_) => {
                let _ = rl.save_history(&history_path);
                break;
            }
        }
    });
    runtime.block_on(handle_websocket(ws, rx, events, printer, opts));

    runtime.shutdown_background();

    Ok(())
}

struct Opts {
    input_as_json: bool,
}

async fn handle_websocket(
    ws: WebSocket,
    mut rx: UnboundedReceiver<String>,
    mut events: UnboundedReceiver<Event>,
    mut printer: impl ExternalPrinter,
    opts: Opts,
) {
    loop {
        tokio::select! {
            line = rx.recv() => {
                let Some(line) = line else {
                    break;
                };

                if let Err(err) = ws.send_text(line).await {
                    let _ = printer.print(format!("unable to write: {}", err));
                }
            }
            event = events.recv() => {
                match event {
                    Some(Event::Message(message)) => {
                        let _ = printer.print(render(&message, &opts));
                    }
                    Some(Event::Error(err)) => {
                        let _ = printer.print(format!("<Error: {err}>"));
                    }
                    Some(Event::Close(event)) => {
                        let _ = printer.print(format!(
                            "<Disconnected: {} {}{}>",
                            event.code,
                            event.reason,
                            if event.was_clean { "" } else { " (unclean)" },
                        ));
                        return;
                    }
                    Some(Event::Open) => {}
                    None => return,
                }
            }
        }
    }

    let _ = ws.close_with(CloseCode::Normal, "bye").await;
}

fn render(message: &Message, opts: &Opts) -> String {
    match (message.opcode, message.as_str()) {
        (OpCode::Text, Some(text)) if opts.input_as_json => {
            match serde_json::from_str::<serde_json::Value>(text) {
                Ok(ok) => format!("{:#}", ok),
                Err(err) => format!("parsing json: {}", err),
            }
        }
        (OpCode::Text, Some(text)) => text.to_string(),
        (opcode, _) => format!("<{:?} {} bytes>", opcode, message.payload.len()),
    }
}
