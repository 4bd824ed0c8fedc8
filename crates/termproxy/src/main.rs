//! Run a program on a PTY and share it with TLS-authenticated viewers.
//!
//! Usage: termproxy [--ca PATH] [-c CERT] [-k KEY] <listen-addr> <program> [args...]

use std::process;

use termproxy::config::{self, ServerArgs};
use termproxy::{logging, supervisor, SessionEnd};

#[tokio::main]
async fn main() {
    let args: ServerArgs = match config::parse(std::env::args_os()) {
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
        eprintln!("termproxy: {err}");
        process::exit(err.exit_code().into());
    }

    match supervisor::run_server(&args).await {
        Ok(SessionEnd::Fatal(err)) => {
            eprintln!("termproxy: {err}");
            process::exit(err.exit_code().into());
        }
        Ok(end) => {
            tracing::info!(%end, "exiting");
            println!();
            println!("Shell exited!");
            process::exit(0);
        }
        Err(err) => {
            eprintln!("termproxy: {err}");
            process::exit(err.exit_code().into());
        }
    }
}
