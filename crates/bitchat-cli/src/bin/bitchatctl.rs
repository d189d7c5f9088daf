//! One-shot control client: parse arguments, send one line, report by exit
//! code (0 ok, 2 bad arguments, 3 daemon unreachable).

use clap::Parser;

use bitchat_cli::cli::{Cli, EXIT_BAD_ARGS, EXIT_NO_SERVER, EXIT_OK};
use bitchat_cli::ipc;

fn main() {
    // clap exits with 2 on a parse error, 0 for --help/--version.
    let cli = Cli::parse();

    let line = match cli.command.to_line() {
        Ok(line) => line,
        Err(reason) => {
            eprintln!("error: {reason}");
            std::process::exit(EXIT_BAD_ARGS);
        }
    };

    let sock = ipc::resolve_sock(cli.sock.as_deref());
    match ipc::send_line(&sock, &line) {
        Ok(()) => std::process::exit(EXIT_OK),
        Err(e) => {
            eprintln!("error: cannot reach daemon at {}: {e}", sock.display());
            std::process::exit(EXIT_NO_SERVER);
        }
    }
}
