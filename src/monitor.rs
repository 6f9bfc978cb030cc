//! Human monitor access.
//!
//! Free-form monitor commands travel inside QMP as `human-monitor-command`,
//! so they share the QMP session's one-command-at-a-time discipline
//! ([`MonitorChannel`]). When the emulator also exposes its text console on
//! the monitor port, [`MonitorConsole`] drains that socket and publishes each
//! line it prints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::QmpError;
use crate::events::{EventDispatcher, Notification};
use crate::qmp::QmpChannel;

/// QMP command that runs a monitor command line and returns its text output.
pub const HUMAN_MONITOR_COMMAND: &str = "human-monitor-command";

const PROMPT: &str = "(qemu) ";

/// Text-in, text-out wrapper over a negotiated QMP session.
#[derive(Debug, Clone)]
pub struct MonitorChannel {
    qmp: Arc<QmpChannel>,
}

impl MonitorChannel {
    pub fn new(qmp: Arc<QmpChannel>) -> Self {
        Self { qmp }
    }

    /// Run `command_line` verbatim and return the monitor's output.
    /// An empty string is a normal, successful reply.
    pub async fn execute(&self, command_line: &str) -> Result<String, QmpError> {
        let reply = self
            .qmp
            .execute(
                HUMAN_MONITOR_COMMAND,
                Some(json!({ "command-line": command_line })),
            )
            .await?;
        match reply {
            serde_json::Value::String(text) => Ok(text),
            serde_json::Value::Null => Ok(String::new()),
            other => Err(QmpError::Protocol(format!(
                "{HUMAN_MONITOR_COMMAND} returned non-text reply {other}"
            ))),
        }
    }

    pub fn qmp(&self) -> &Arc<QmpChannel> {
        &self.qmp
    }
}

// ---------------------------------------------------------------------------
// Text console
// ---------------------------------------------------------------------------

/// A connection to the emulator's `-monitor tcp::…` console.
#[derive(Debug)]
pub struct MonitorConsole {
    addr: SocketAddr,
    // Kept open so the emulator does not see the console hang up.
    _writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

impl MonitorConsole {
    /// Connect, retrying refused connections until `connect_timeout`, and
    /// start publishing console output.
    pub async fn connect(
        addr: SocketAddr,
        dispatcher: EventDispatcher,
        connect_timeout: Duration,
    ) -> std::io::Result<Self> {
        let deadline = Instant::now() + connect_timeout;
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    debug!(%addr, error = %e, "monitor socket not ready, retrying");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        };
        info!(%addr, "monitor console connected");

        let (read_half, write_half) = stream.into_split();
        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw).await {
                    Ok(0) => break,
                    Ok(_) => {
                        // Guest output is not guaranteed to be UTF-8.
                        let line = clean_console_line(&String::from_utf8_lossy(&raw));
                        if !line.is_empty() {
                            dispatcher.publish(Notification::MonitorOutput { line });
                        }
                    }
                    Err(e) => {
                        debug!(%addr, error = %e, "monitor console read failed");
                        break;
                    }
                }
            }
            debug!(%addr, "monitor console closed");
        });

        Ok(Self {
            addr,
            _writer: write_half,
            reader,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the read loop and drop the connection.
    pub fn close(&self) {
        self.reader.abort();
    }
}

impl Drop for MonitorConsole {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Remove terminal escape sequences, carriage returns and `(qemu)` prompts.
pub(crate) fn clean_console_line(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => {
                // CSI: ESC '[' params… final byte in '@'..='~'
                if chars.peek() == Some(&'[') {
                    chars.next();
                    for c in chars.by_ref() {
                        if ('@'..='~').contains(&c) {
                            break;
                        }
                    }
                }
            }
            '\r' => {}
            c => out.push(c),
        }
    }

    let mut line = out.as_str();
    while let Some(rest) = line.strip_prefix(PROMPT) {
        line = rest;
    }
    let line = line.trim_end();
    if line == PROMPT.trim_end() {
        String::new()
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn clean_strips_prompts_and_escapes() {
        assert_eq!(
            clean_console_line("QEMU 8.2.0 monitor - type 'help' for more information\r"),
            "QEMU 8.2.0 monitor - type 'help' for more information"
        );
        assert_eq!(clean_console_line("(qemu) \u{1b}[K\u{1b}[D"), "");
        assert_eq!(clean_console_line("(qemu) (qemu) VM status: running\r"), "VM status: running");
        assert_eq!(clean_console_line("(qemu)"), "");
    }

    #[tokio::test]
    async fn console_lines_are_published() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let banner = "QEMU 8.2.0 monitor - type 'help' for more information\r\n";
            stream.write_all(banner.as_bytes()).await.unwrap();
            stream.write_all(b"(qemu) \r\nVM status: paused\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let dispatcher = EventDispatcher::default();
        let mut sub = dispatcher.subscribe();
        let console = MonitorConsole::connect(addr, dispatcher, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(
            sub.recv().await,
            Some(Notification::MonitorOutput {
                line: "QEMU 8.2.0 monitor - type 'help' for more information".to_string()
            })
        );
        assert_eq!(
            sub.recv().await,
            Some(Notification::MonitorOutput {
                line: "VM status: paused".to_string()
            })
        );
        console.close();
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_end_the_console() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"caf\xe9 au lait\r\nstill here\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let dispatcher = EventDispatcher::default();
        let mut sub = dispatcher.subscribe();
        let _console = MonitorConsole::connect(addr, dispatcher, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(
            sub.recv().await,
            Some(Notification::MonitorOutput {
                line: "caf\u{fffd} au lait".to_string()
            })
        );
        assert_eq!(
            sub.recv().await,
            Some(Notification::MonitorOutput {
                line: "still here".to_string()
            })
        );
    }
}
