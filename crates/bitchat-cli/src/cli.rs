//! `bitchatctl` command surface.
//!
//! Each subcommand maps onto one control line; validation that would bounce
//! off the daemon anyway (empty text, malformed MAC) is rejected locally with
//! exit code 2.

use clap::{Parser, Subcommand, ValueEnum};

use bitchat_core::config::parse_peer_addr;

// Exit codes shared with scripts driving the client.
pub const EXIT_OK: i32 = 0;
pub const EXIT_BAD_ARGS: i32 = 2;
pub const EXIT_NO_SERVER: i32 = 3;

/// Control client for the bitchat daemon.
#[derive(Debug, Parser)]
#[command(name = "bitchatctl", version, about)]
pub struct Cli {
    /// Control socket path (a leading ~ expands to $HOME).
    #[arg(long)]
    pub sock: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send one chat message.
    Send {
        /// Message text; multiple words are joined with spaces.
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Toggle local echo of received messages.
    Tail { state: TailState },
    /// List discovered peers, strongest signal first.
    Peers,
    /// Hand the link over to the given peer MAC.
    Connect { addr: String },
    /// Drop the current link and stop reconnecting.
    Disconnect,
    /// Shut the daemon down.
    Quit,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TailState {
    On,
    Off,
}

impl Command {
    /// Render the request line, or a user-facing reason for exit code 2.
    pub fn to_line(&self) -> Result<String, String> {
        match self {
            Command::Send { text } => {
                let text = text.join(" ");
                if text.trim().is_empty() {
                    return Err("send: empty message".into());
                }
                if text.contains('\n') {
                    return Err("send: message must be a single line".into());
                }
                Ok(format!("SEND {text}"))
            }
            Command::Tail { state } => Ok(match state {
                TailState::On => "TAIL on".into(),
                TailState::Off => "TAIL off".into(),
            }),
            Command::Peers => Ok("PEERS".into()),
            Command::Connect { addr } => match parse_peer_addr(addr) {
                Some(mac) => Ok(format!("CONNECT {mac}")),
                None => Err(format!("connect: '{addr}' is not a MAC address")),
            },
            Command::Disconnect => Ok("DISCONNECT".into()),
            Command::Quit => Ok("QUIT".into()),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_joins_words() {
        let cmd = Command::Send {
            text: vec!["hello".into(), "over".into(), "ble".into()],
        };
        assert_eq!(cmd.to_line().unwrap(), "SEND hello over ble");
    }

    #[test]
    fn send_rejects_empty_and_multiline() {
        assert!(Command::Send {
            text: vec!["  ".into()]
        }
        .to_line()
        .is_err());
        assert!(Command::Send {
            text: vec!["two\nlines".into()]
        }
        .to_line()
        .is_err());
    }

    #[test]
    fn tail_and_simple_commands() {
        assert_eq!(
            Command::Tail {
                state: TailState::On
            }
            .to_line()
            .unwrap(),
            "TAIL on"
        );
        assert_eq!(
            Command::Tail {
                state: TailState::Off
            }
            .to_line()
            .unwrap(),
            "TAIL off"
        );
        assert_eq!(Command::Peers.to_line().unwrap(), "PEERS");
        assert_eq!(Command::Disconnect.to_line().unwrap(), "DISCONNECT");
        assert_eq!(Command::Quit.to_line().unwrap(), "QUIT");
    }

    #[test]
    fn connect_validates_and_normalizes() {
        let cmd = Command::Connect {
            addr: "aa:bb:cc:dd:ee:ff".into(),
        };
        assert_eq!(cmd.to_line().unwrap(), "CONNECT AA:BB:CC:DD:EE:FF");
        assert!(Command::Connect {
            addr: "nonsense".into()
        }
        .to_line()
        .is_err());
    }

    #[test]
    fn cli_parses() {
        let cli = Cli::try_parse_from(["bitchatctl", "send", "hi", "there"]).unwrap();
        assert!(matches!(cli.command, Command::Send { .. }));

        let cli =
            Cli::try_parse_from(["bitchatctl", "--sock", "/tmp/x.sock", "tail", "on"]).unwrap();
        assert_eq!(cli.sock.as_deref(), Some("/tmp/x.sock"));

        assert!(Cli::try_parse_from(["bitchatctl"]).is_err());
        assert!(Cli::try_parse_from(["bitchatctl", "tail", "maybe"]).is_err());
    }
}
