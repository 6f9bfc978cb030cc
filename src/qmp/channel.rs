//! QMP client over TCP.
//!
//! ```text
//! connect()  ──► read greeting ──► spawn read loop
//! negotiate() ──► qmp_capabilities
//! execute()  ──► one command in flight, reply via oneshot
//!
//! read loop:  event  → EventDispatcher
//!             reply  → pending command
//!             garbled → pending fails with Protocol, channel stays open
//!             EOF    → close, pending fails with ConnectionLost
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::protocol::{CAPABILITIES_COMMAND, Greeting, Inbound, Request};
use crate::error::QmpError;
use crate::events::{EventDispatcher, Notification};

/// Why the channel stopped accepting commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// [`QmpChannel::close`] was called.
    Closed,
    /// The socket hit EOF or an I/O error.
    Disconnected,
}

type Reply = Result<serde_json::Value, QmpError>;

struct Pending {
    id: u64,
    command: String,
    tx: oneshot::Sender<Reply>,
}

type PendingSlot = Arc<Mutex<Option<Pending>>>;

type Reader = BufReader<OwnedReadHalf>;

fn take_pending(slot: &PendingSlot) -> Option<Pending> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// A connected QMP session.
pub struct QmpChannel {
    addr: SocketAddr,
    greeting: Greeting,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: PendingSlot,
    negotiated: AtomicBool,
    next_id: AtomicU64,
    command_timeout: Duration,
    closed_tx: Arc<watch::Sender<Option<CloseReason>>>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for QmpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QmpChannel")
            .field("addr", &self.addr)
            .field("negotiated", &self.is_negotiated())
            .field("closed", &self.close_reason())
            .finish()
    }
}

impl QmpChannel {
    /// Connect to a QMP server and read its greeting.
    ///
    /// The emulator opens its socket some time after the process starts, so
    /// refused connections are retried until `connect_timeout` elapses.
    pub async fn connect(
        addr: SocketAddr,
        dispatcher: EventDispatcher,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self, QmpError> {
        let deadline = Instant::now() + connect_timeout;
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    debug!(%addr, error = %e, "QMP socket not ready, retrying");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let first = tokio::time::timeout_at(deadline, next_frame(&mut reader))
            .await
            .map_err(|_| QmpError::Timeout("greeting".to_string(), connect_timeout))??
            .ok_or(QmpError::ConnectionLost)?;
        let first = String::from_utf8_lossy(&first);
        let greeting: Greeting = serde_json::from_str(&first)
            .map_err(|e| QmpError::Protocol(format!("expected greeting, got {first:?}: {e}")))?;

        info!(
            %addr,
            version = greeting.version_string().as_deref().unwrap_or("unknown"),
            "QMP connected"
        );

        let pending: PendingSlot = Arc::new(Mutex::new(None));
        let (closed_tx, _) = watch::channel(None);
        let closed_tx = Arc::new(closed_tx);
        let reader = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            dispatcher,
            Arc::clone(&closed_tx),
        ));

        Ok(Self {
            addr,
            greeting,
            writer: tokio::sync::Mutex::new(Some(write_half)),
            pending,
            negotiated: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            command_timeout,
            closed_tx,
            reader,
        })
    }

    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    pub fn is_negotiated(&self) -> bool {
        self.negotiated.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.closed_tx.borrow()
    }

    /// Resolves with the reason once the channel closes.
    pub fn closed(&self) -> watch::Receiver<Option<CloseReason>> {
        self.closed_tx.subscribe()
    }

    /// Leave capabilities mode. Must succeed before [`QmpChannel::execute`].
    pub async fn negotiate(&self) -> Result<(), QmpError> {
        self.send(CAPABILITIES_COMMAND, None).await?;
        self.negotiated.store(true, Ordering::Release);
        debug!(addr = %self.addr, "QMP capabilities negotiated");
        Ok(())
    }

    /// Run one command and return its `return` payload.
    pub async fn execute(
        &self,
        command: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, QmpError> {
        if !self.is_negotiated() {
            return Err(QmpError::NotNegotiated);
        }
        self.send(command, arguments).await
    }

    async fn send(
        &self,
        command: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, QmpError> {
        // Held until the reply arrives: one command in flight.
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(self.closed_error(command));
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = Request {
            execute: command,
            arguments,
            id,
        }
        .to_line()
        .map_err(|e| QmpError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(Pending {
            id,
            command: command.to_string(),
            tx,
        });
        if self.close_reason().is_some() {
            take_pending(&self.pending);
            return Err(self.closed_error(command));
        }

        if let Err(e) = stream.write_all(&line).await {
            take_pending(&self.pending);
            return Err(e.into());
        }
        debug!(command, id, "QMP command sent");

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(self.closed_error(command)),
            Err(_) => {
                // A late reply carries this id and is discarded by the read loop.
                let mut slot = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.as_ref().is_some_and(|p| p.id == id) {
                    slot.take();
                }
                warn!(command, id, timeout = ?self.command_timeout, "QMP command timed out");
                Err(QmpError::Timeout(command.to_string(), self.command_timeout))
            }
        }
    }

    fn closed_error(&self, command: &str) -> QmpError {
        match self.close_reason() {
            Some(CloseReason::Closed) => QmpError::Cancelled(command.to_string()),
            _ => QmpError::ConnectionLost,
        }
    }

    /// Resolve the in-flight command, if any, as cancelled.
    pub fn cancel_pending(&self) {
        if let Some(p) = take_pending(&self.pending) {
            debug!(command = %p.command, id = p.id, "cancelling in-flight QMP command");
            let _ = p.tx.send(Err(QmpError::Cancelled(p.command)));
        }
    }

    /// Cancel any in-flight command, stop the read loop and shut the socket.
    pub async fn close(&self) {
        self.close_with(CloseReason::Closed).await;
    }

    /// Tear the channel down because its peer is gone; an in-flight command
    /// fails with [`QmpError::ConnectionLost`].
    pub async fn abandon(&self) {
        self.close_with(CloseReason::Disconnected).await;
    }

    async fn close_with(&self, why: CloseReason) {
        self.closed_tx.send_if_modified(|reason| {
            if reason.is_none() {
                *reason = Some(why);
                true
            } else {
                false
            }
        });
        match why {
            CloseReason::Closed => self.cancel_pending(),
            CloseReason::Disconnected => {
                if let Some(p) = take_pending(&self.pending) {
                    let _ = p.tx.send(Err(QmpError::ConnectionLost));
                }
            }
        }
        self.reader.abort();

        if let Some(mut stream) = self.writer.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        debug!(addr = %self.addr, "QMP channel closed");
    }
}

impl Drop for QmpChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

/// Next newline-terminated frame without its terminator; `None` at EOF.
async fn next_frame(reader: &mut Reader) -> std::io::Result<Option<Vec<u8>>> {
    let mut frame = Vec::new();
    if reader.read_until(b'\n', &mut frame).await? == 0 {
        return Ok(None);
    }
    if frame.last() == Some(&b'\n') {
        frame.pop();
    }
    Ok(Some(frame))
}

async fn read_loop(
    mut reader: Reader,
    pending: PendingSlot,
    dispatcher: EventDispatcher,
    closed_tx: Arc<watch::Sender<Option<CloseReason>>>,
) {
    loop {
        match next_frame(&mut reader).await {
            // Framing survives a bad byte; only this message is lost.
            Ok(Some(frame)) => match std::str::from_utf8(&frame) {
                Ok(line) => handle_line(line.trim(), &pending, &dispatcher),
                Err(e) => protocol_error(
                    format!("non-UTF-8 message {:?}: {e}", String::from_utf8_lossy(&frame)),
                    &pending,
                    &dispatcher,
                ),
            },
            Ok(None) => {
                info!("QMP connection closed by emulator");
                break;
            }
            Err(e) => {
                warn!(error = %e, "QMP read error");
                break;
            }
        }
    }

    closed_tx.send_if_modified(|reason| {
        if reason.is_none() {
            *reason = Some(CloseReason::Disconnected);
            true
        } else {
            false
        }
    });
    if let Some(p) = take_pending(&pending) {
        let _ = p.tx.send(Err(QmpError::ConnectionLost));
    }
}

fn handle_line(line: &str, pending: &PendingSlot, dispatcher: &EventDispatcher) {
    if line.is_empty() {
        return;
    }

    let inbound = match Inbound::parse(line) {
        Ok(inbound) => inbound,
        Err(e) => {
            protocol_error(format!("malformed message {line:?}: {e}"), pending, dispatcher);
            return;
        }
    };

    let reply_id = inbound.reply_id();
    match inbound {
        Inbound::Event {
            event,
            data,
            timestamp,
        } => {
            debug!(event = %event, "QMP event");
            dispatcher.publish(Notification::QmpEvent {
                name: event,
                data,
                timestamp: timestamp.and_then(|t| t.to_utc()).unwrap_or_else(Utc::now),
            });
        }
        Inbound::Greeting { .. } => {
            warn!("unexpected QMP greeting mid-session");
        }
        reply => {
            let mut slot = pending.lock().unwrap_or_else(PoisonError::into_inner);
            let matches = match (slot.as_ref(), reply_id) {
                (Some(p), Some(id)) => p.id == id,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !matches {
                debug!(id = ?reply_id, "discarding stale QMP reply");
                return;
            }
            let Some(p) = slot.take() else { return };
            drop(slot);

            let result = match reply {
                Inbound::Return { value, .. } => Ok(value),
                Inbound::Error { error, .. } => Err(QmpError::Command {
                    command: p.command.clone(),
                    class: error.class,
                    desc: error.desc,
                }),
                _ => return,
            };
            let _ = p.tx.send(result);
        }
    }
}

fn protocol_error(detail: String, pending: &PendingSlot, dispatcher: &EventDispatcher) {
    let error = QmpError::Protocol(detail);
    warn!(error = %error, "QMP protocol error");
    // The garbled line is most likely the reply we are waiting for.
    if let Some(p) = take_pending(pending) {
        let _ = p.tx.send(Err(error.clone()));
    }
    dispatcher.publish(Notification::failure("qmp", error));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    const GREETING: &str =
        r#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 2, "major": 8}}, "capabilities": []}}"#;

    /// Accept one connection, greet, then answer each request with `respond`.
    async fn serve<F>(respond: F) -> SocketAddr
    where
        F: Fn(serde_json::Value) -> Vec<String> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            write.write_all(format!("{GREETING}\n").as_bytes()).await.unwrap();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                for out in respond(req) {
                    if write.write_all(format!("{out}\n").as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        });
        addr
    }

    fn ok_reply(req: &serde_json::Value) -> String {
        json!({ "return": {}, "id": req["id"] }).to_string()
    }

    async fn connect(addr: SocketAddr, dispatcher: EventDispatcher) -> QmpChannel {
        QmpChannel::connect(addr, dispatcher, Duration::from_secs(2), Duration::from_millis(500))
            .await
            .expect("connect")
    }

    #[tokio::test]
    async fn commands_require_negotiation() {
        let addr = serve(|req| vec![ok_reply(&req)]).await;
        let qmp = connect(addr, EventDispatcher::default()).await;

        assert_eq!(qmp.greeting().version_string().as_deref(), Some("8.2.0"));
        assert_eq!(
            qmp.execute("query-status", None).await,
            Err(QmpError::NotNegotiated)
        );

        qmp.negotiate().await.expect("negotiate");
        assert!(qmp.is_negotiated());
        assert_eq!(qmp.execute("stop", None).await, Ok(json!({})));
    }

    #[tokio::test]
    async fn events_are_routed_to_the_dispatcher_not_the_reply() {
        let addr = serve(|req| {
            if req["execute"] == "stop" {
                vec![
                    json!({ "event": "STOP", "timestamp": { "seconds": 1, "microseconds": 0 } })
                        .to_string(),
                    json!({ "return": { "status": "paused" }, "id": req["id"] }).to_string(),
                ]
            } else {
                vec![ok_reply(&req)]
            }
        })
        .await;
        let dispatcher = EventDispatcher::default();
        let mut sub = dispatcher.subscribe();
        let qmp = connect(addr, dispatcher).await;
        qmp.negotiate().await.unwrap();

        let reply = qmp.execute("stop", None).await.unwrap();
        assert_eq!(reply, json!({ "status": "paused" }));

        match sub.recv().await {
            Some(Notification::QmpEvent { name, .. }) => assert_eq!(name, "STOP"),
            other => panic!("expected STOP event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_replies_surface_class_and_desc() {
        let addr = serve(|req| {
            if req["execute"] == "bogus" {
                vec![json!({
                    "error": { "class": "CommandNotFound", "desc": "no bogus" },
                    "id": req["id"]
                })
                .to_string()]
            } else {
                vec![ok_reply(&req)]
            }
        })
        .await;
        let qmp = connect(addr, EventDispatcher::default()).await;
        qmp.negotiate().await.unwrap();

        assert_eq!(
            qmp.execute("bogus", None).await,
            Err(QmpError::Command {
                command: "bogus".to_string(),
                class: "CommandNotFound".to_string(),
                desc: "no bogus".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn timeout_leaves_channel_usable() {
        // `slow` never gets an answer until the next command arrives, then its
        // stale reply is sent ahead of the fresh one.
        let stale = Arc::new(Mutex::new(None::<serde_json::Value>));
        let addr = serve(move |req| {
            let mut stale = stale.lock().unwrap();
            if req["execute"] == "slow" {
                *stale = Some(req["id"].clone());
                return vec![];
            }
            let mut out = Vec::new();
            if let Some(id) = stale.take() {
                out.push(json!({ "return": "late", "id": id }).to_string());
            }
            out.push(json!({ "return": "fresh", "id": req["id"] }).to_string());
            out
        })
        .await;
        let qmp = connect(addr, EventDispatcher::default()).await;
        qmp.negotiate().await.unwrap();

        assert!(matches!(
            qmp.execute("slow", None).await,
            Err(QmpError::Timeout(ref cmd, _)) if cmd == "slow"
        ));
        assert_eq!(qmp.execute("query-status", None).await, Ok(json!("fresh")));
    }

    #[tokio::test]
    async fn disconnect_fails_pending_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            write.write_all(format!("{GREETING}\n").as_bytes()).await.unwrap();
            let mut lines = BufReader::new(read).lines();
            // Answer the handshake, then hang up on the next command.
            let line = lines.next_line().await.unwrap().unwrap();
            let req: serde_json::Value = serde_json::from_str(&line).unwrap();
            write.write_all(format!("{}\n", ok_reply(&req)).as_bytes()).await.unwrap();
            let _ = lines.next_line().await;
        });

        let qmp = connect(addr, EventDispatcher::default()).await;
        let mut closed = qmp.closed();
        qmp.negotiate().await.unwrap();

        assert_eq!(qmp.execute("quit", None).await, Err(QmpError::ConnectionLost));
        closed.wait_for(|r| r.is_some()).await.unwrap();
        assert_eq!(qmp.close_reason(), Some(CloseReason::Disconnected));
    }

    #[tokio::test]
    async fn close_cancels_in_flight_command() {
        let addr = serve(|req| {
            if req["execute"] == "hang" { vec![] } else { vec![ok_reply(&req)] }
        })
        .await;
        let qmp = Arc::new(
            QmpChannel::connect(
                addr,
                EventDispatcher::default(),
                Duration::from_secs(2),
                Duration::from_secs(30),
            )
            .await
            .unwrap(),
        );
        qmp.negotiate().await.unwrap();

        let waiting = {
            let qmp = Arc::clone(&qmp);
            tokio::spawn(async move { qmp.execute("hang", None).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        qmp.close().await;

        assert_eq!(
            waiting.await.unwrap(),
            Err(QmpError::Cancelled("hang".to_string()))
        );
        assert_eq!(
            qmp.execute("query-status", None).await,
            Err(QmpError::Cancelled("query-status".to_string()))
        );
    }

    #[tokio::test]
    async fn malformed_line_fails_the_pending_command() {
        let addr = serve(|req| {
            if req["execute"] == "garble" {
                vec!["{not json".to_string()]
            } else {
                vec![ok_reply(&req)]
            }
        })
        .await;
        let qmp = connect(addr, EventDispatcher::default()).await;
        qmp.negotiate().await.unwrap();

        assert!(matches!(
            qmp.execute("garble", None).await,
            Err(QmpError::Protocol(_))
        ));
        assert_eq!(qmp.execute("cont", None).await, Ok(json!({})));
    }

    #[tokio::test]
    async fn non_utf8_reply_fails_only_that_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            write.write_all(format!("{GREETING}\n").as_bytes()).await.unwrap();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                let out = if req["execute"] == "human-monitor-command" {
                    let mut out = br#"{"return": ""#.to_vec();
                    out.extend_from_slice(&[0xff, 0xfe]);
                    out.extend_from_slice(format!("\", \"id\": {}}}\n", req["id"]).as_bytes());
                    out
                } else {
                    format!("{}\n", ok_reply(&req)).into_bytes()
                };
                if write.write_all(&out).await.is_err() {
                    return;
                }
            }
        });

        let dispatcher = EventDispatcher::default();
        let mut sub = dispatcher.subscribe();
        let qmp = connect(addr, dispatcher).await;
        qmp.negotiate().await.unwrap();

        let garbled = qmp
            .execute("human-monitor-command", Some(json!({ "command-line": "info version" })))
            .await;
        assert!(matches!(garbled, Err(QmpError::Protocol(_))), "{garbled:?}");
        assert_eq!(qmp.close_reason(), None);
        assert_eq!(qmp.execute("cont", None).await, Ok(json!({})));
        assert!(matches!(
            sub.try_recv(),
            Some(Notification::Failure { operation, .. }) if operation == "qmp"
        ));
    }
}
