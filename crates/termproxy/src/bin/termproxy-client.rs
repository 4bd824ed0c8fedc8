//! Attach the local terminal to a termproxy session.
//!
//! Usage: termproxy-client [--ca PATH] [-s SERVERCERT] [-c CERT] [-k KEY] <host:port>

use std::process;

use termproxy::client::{self, ClientEnd};
use termproxy::config::{self, ClientArgs};
use termproxy::console::{self, RawTerminal};
use termproxy::{logging, tls, Result};
use tokio_rustls::TlsConnector;

async fn run(args: &ClientArgs) -> Result<ClientEnd> {
    let connector = tls::client_connector(&args.ca, &args.servercert, &args.cert, &args.key)?;

    let mut terminal = RawTerminal::acquire()?;
    let outcome = attach(args, &connector).await;
    terminal.restore();
    outcome
}

async fn attach(args: &ClientArgs, connector: &TlsConnector) -> Result<ClientEnd> {
    let size = console::window_size()?;
    let mut stream = tls::connect(connector, &args.host, &args.server_name()).await?;
    client::send_handshake(&mut stream, size).await?;
    let resizes = client::watch_resizes()?;
    client::run(stream, tokio::io::stdin(), tokio::io::stdout(), resizes).await
}

#[tokio::main]
async fn main() {
    let args: ClientArgs = match config::parse(std::env::args_os()) {
        Ok(args) => args,
        Err(early) => match early.into_result() {
            Ok(text) => {
                print!("{text}");
                process::exit(0);
            }
            Err(err) => {
                eprint!("{err}");
                process::exit(err.exit_code().into());
            }
        },
    };

    if let Err(err) = logging::init(args.log_file.as_deref()) {
        eprintln!("termproxy-client: {err}");
        process::exit(err.exit_code().into());
    }

    match run(&args).await {
        Ok(end) => {
            tracing::info!(?end, "client finished");
            println!("\n\nConnection terminated!");
            process::exit(0);
        }
        Err(err) => {
            eprintln!("termproxy-client: {err}");
            process::exit(err.exit_code().into());
        }
    }
}
