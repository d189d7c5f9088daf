//! Control socket IPC.
//!
//! The daemon listens on a Unix stream socket and processes exactly one
//! newline-terminated request line per connection; the client connects,
//! writes one line, and disconnects. `QUIT` ends the server loop. The socket
//! file is recreated on every daemon start and removed on shutdown.

use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixListener;
use tracing::{info, warn};

use bitchat_core::config;

// ----------------------------------------------------------------------------
// Server
// ----------------------------------------------------------------------------

/// Accept connections and hand each first line to `handler` until it returns
/// `false` (shutdown) or the listener fails.
pub async fn serve<F, Fut>(sock_path: &Path, handler: F) -> io::Result<()>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = bool>,
{
    if let Some(parent) = sock_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    // A stale socket from a previous run would make bind fail.
    let _ = std::fs::remove_file(sock_path);

    let listener = UnixListener::bind(sock_path)?;
    info!("listening on {}", sock_path.display());

    let mut keep_going = true;
    while keep_going {
        let (stream, _addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };

        let mut line = String::new();
        let mut reader = BufReader::new(stream);
        if let Err(e) = reader.read_line(&mut line).await {
            warn!("recv failed: {e}");
            continue;
        }
        let line = line.trim_end_matches(['\n', '\r']).to_string();

        keep_going = handler(line).await;
        // The connection closes when `reader` drops.
    }

    let _ = std::fs::remove_file(sock_path);
    Ok(())
}

// ----------------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------------

/// Connect, send one line (newline appended when missing), and disconnect.
pub fn send_line(sock_path: &Path, line: &str) -> io::Result<()> {
    let mut stream = std::os::unix::net::UnixStream::connect(sock_path)?;
    stream.write_all(line.as_bytes())?;
    if !line.ends_with('\n') {
        stream.write_all(b"\n")?;
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Path helpers
// ----------------------------------------------------------------------------

/// Expand a leading `~` or `~/` from `$HOME`.
pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if !home.is_empty() {
                if path == "~" {
                    return PathBuf::from(home);
                }
                return PathBuf::from(home).join(&path[2..]);
            }
        }
    }
    PathBuf::from(path)
}

/// Resolve the control socket path: explicit flag, then `BITCHAT_CTL_SOCK`,
/// then the per-user default.
pub fn resolve_sock(flag: Option<&str>) -> PathBuf {
    match flag {
        Some(path) => expand_user(path),
        None => match std::env::var(config::ENV_CTL_SOCK) {
            Ok(path) if !path.trim().is_empty() => expand_user(path.trim()),
            _ => config::default_ctl_sock(),
        },
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn temp_sock() -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        std::env::temp_dir().join(format!(
            "bitchat-ipc-test-{}-{}.sock",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::SeqCst)
        ))
    }

    #[tokio::test]
    async fn server_processes_one_line_per_connection_until_quit() {
        let sock = temp_sock();
        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let seen = lines.clone();
        let path = sock.clone();
        let server = tokio::spawn(async move {
            serve(&path, move |line| {
                let seen = seen.clone();
                async move {
                    let quit = line == "QUIT";
                    seen.lock().unwrap().push(line);
                    !quit
                }
            })
            .await
        });

        // Wait for the listener to come up.
        for _ in 0..50 {
            if sock.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        send_line(&sock, "TAIL on").unwrap();
        send_line(&sock, "SEND hello world\n").unwrap();
        send_line(&sock, "QUIT").unwrap();

        server.await.unwrap().unwrap();
        assert_eq!(
            *lines.lock().unwrap(),
            vec!["TAIL on", "SEND hello world", "QUIT"]
        );
        // The socket file is gone after shutdown.
        assert!(!sock.exists());
    }

    #[test]
    fn expand_user_handles_home_prefix() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(expand_user("~"), PathBuf::from("/home/tester"));
        assert_eq!(
            expand_user("~/run/ctl.sock"),
            PathBuf::from("/home/tester/run/ctl.sock")
        );
        assert_eq!(expand_user("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(expand_user("rel/path"), PathBuf::from("rel/path"));
    }
}
