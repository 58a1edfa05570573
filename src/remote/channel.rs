use crate::config::ChannelConfig;
use crate::error::AppError;
use crate::protocol::codec::{encode_frame, Frame, FrameError, FrameReader, NO_SEQ};
use crate::protocol::message::{
    CommandId, CommandPayload, CommandResult, CompletionMode, Message, MessageBody, OutputLine,
};
use crate::remote::discovery::{Discovery, Endpoint};
use crate::remote::executor::CommandSink;
use crate::utils::line_ending_handler::split_output_lines;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

type Reply = oneshot::Sender<Result<CommandResult, AppError>>;

#[derive(Debug)]
struct PendingSlot {
    output: Vec<OutputLine>,
    reply: Reply,
}

type PendingMap = Arc<StdMutex<HashMap<u64, PendingSlot>>>;

fn lock_pending(pending: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<u64, PendingSlot>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Local socket the editor dials back into. Must be bound before the address is advertised.
#[derive(Debug)]
pub struct CommandListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl CommandListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, AppError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AppError::ConnectionFailed(format!("Cannot listen on {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "Command listener bound");
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// One command-channel connection to one editor.
#[derive(Debug)]
pub struct Session {
    id: String,
    local_node_id: String,
    remote_node_id: String,
    config: ChannelConfig,
    writer: Arc<TokioMutex<OwnedWriteHalf>>,
    next_seq: AtomicU64,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

/// Asks the endpoint to dial back and waits for the connection.
///
/// The open request is repeated every second while waiting since datagrams
/// may be lost. No connection within `connect_timeout` means the host is
/// unreachable, which callers report differently from a failed command.
#[instrument(skip_all, fields(remote_node = %endpoint.node_id))]
pub async fn connect(
    listener: &CommandListener,
    discovery: &Discovery,
    endpoint: &Endpoint,
    config: &ChannelConfig,
) -> Result<Session, AppError> {
    let session_id = Uuid::new_v4().to_string();
    let local = listener.local_addr();
    let open = MessageBody::OpenConnection {
        command_ip: local.ip().to_string(),
        command_port: local.port(),
        session_id: session_id.clone(),
    };

    let started = Instant::now();
    let mut resend = interval(std::time::Duration::from_secs(1));
    let accepted = timeout(config.connect_timeout, async {
        loop {
            tokio::select! {
                _ = resend.tick() => discovery.send_to(&endpoint.node_id, open.clone()).await?,
                accepted = listener.listener.accept() => {
                    return accepted.map_err(|e| AppError::ConnectionFailed(format!("Accept failed: {}", e)));
                }
            }
        }
    })
    .await;

    let (stream, peer) = match accepted {
        Ok(result) => result?,
        Err(_) => {
            return Err(AppError::ConnectionFailed(format!(
                "Host unreachable: {} did not connect back to {} within {} ms",
                endpoint.display_name,
                local,
                started.elapsed().as_millis()
            )))
        }
    };
    info!(%peer, session_id = %session_id, "Editor connected");
    Ok(Session::from_stream(
        stream,
        session_id,
        discovery.node_id().to_string(),
        endpoint.node_id.clone(),
        config.clone(),
    ))
}

impl Session {
    /// Wraps an established connection and starts its receive loop.
    pub fn from_stream(
        stream: TcpStream,
        session_id: String,
        local_node_id: String,
        remote_node_id: String,
        config: ChannelConfig,
    ) -> Self {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = FrameReader::new(
            BufReader::with_capacity(config.receive_buffer_bytes, read_half),
            config.receive_buffer_bytes,
        );
        let reader = tokio::spawn(receive_loop(reader, pending.clone(), closed.clone(), session_id.clone()));

        Self {
            id: session_id,
            local_node_id,
            remote_node_id,
            config,
            writer: Arc::new(TokioMutex::new(write_half)),
            next_seq: AtomicU64::new(NO_SEQ + 1),
            pending,
            closed,
            reader,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Sends a command, retrying when its reply could not be decoded and nothing was observed yet.
    #[instrument(skip(self, payload), fields(session_id = %self.id, kind = payload.kind_str()))]
    pub async fn submit(
        &self,
        payload: &CommandPayload,
        mode: CompletionMode,
    ) -> Result<Option<CommandResult>, AppError> {
        let mut retries_left = self.config.decode_retries;
        loop {
            match self.submit_once(payload, mode).await {
                Err(AppError::ProtocolDecode { seq, reason, retriable: true, .. }) if retries_left > 0 => {
                    retries_left -= 1;
                    warn!(seq, reason = %reason, retries_left, "Reply undecodable before any output, resending command");
                }
                other => return other,
            }
        }
    }

    async fn submit_once(
        &self,
        payload: &CommandPayload,
        mode: CompletionMode,
    ) -> Result<Option<CommandResult>, AppError> {
        if self.is_closed() {
            return Err(AppError::SessionClosed { session_id: self.id.clone(), seq: NO_SEQ, output: Vec::new() });
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let reply = match mode {
            CompletionMode::AwaitResult => {
                let (tx, rx) = oneshot::channel();
                lock_pending(&self.pending).insert(seq, PendingSlot { output: Vec::new(), reply: tx });
                Some(rx)
            }
            CompletionMode::FireAndForget => None,
        };

        let message = Message::new(
            self.local_node_id.clone(),
            Some(self.remote_node_id.clone()),
            MessageBody::Command {
                session_id: self.id.clone(),
                seq,
                payload: payload.clone(),
                mode,
            },
        );
        let written = match encode_frame(seq, &message) {
            Ok(frame) => {
                let mut writer = self.writer.lock().await;
                writer.write_all(&frame).await.map_err(|e| {
                    AppError::ConnectionFailed(format!("Failed to send command {}: {}", seq, e))
                })
            }
            Err(e) => Err(AppError::Json(e)),
        };
        if let Err(e) = written {
            lock_pending(&self.pending).remove(&seq);
            return Err(e);
        }
        debug!(seq, "Command sent");

        let Some(rx) = reply else {
            return Ok(None);
        };

        let started = Instant::now();
        match timeout(self.config.command_timeout, rx).await {
            Ok(Ok(result)) => result.map(Some),
            Ok(Err(_)) => Err(AppError::SessionClosed {
                session_id: self.id.clone(),
                seq,
                output: Vec::new(),
            }),
            Err(_) => {
                let output = lock_pending(&self.pending)
                    .remove(&seq)
                    .map(|slot| slot.output)
                    .unwrap_or_default();
                warn!(seq, lines = output.len(), "Command timed out; remote may still be running it");
                Err(AppError::CommandTimeout {
                    seq,
                    waited_ms: started.elapsed().as_millis() as u64,
                    output,
                })
            }
        }
    }

    /// Says goodbye to the editor and cancels anything still waiting.
    pub async fn close(self) {
        let message = Message::new(
            self.local_node_id.clone(),
            Some(self.remote_node_id.clone()),
            MessageBody::CloseConnection { session_id: self.id.clone() },
        );
        if let Ok(frame) = encode_frame(NO_SEQ, &message) {
            let mut writer = self.writer.lock().await;
            let _ = writer.write_all(&frame).await;
            let _ = writer.shutdown().await;
        }
        self.closed.store(true, Ordering::Release);
        fail_all_pending(&self.pending, &self.id);
        info!(session_id = %self.id, "Session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl CommandSink for Session {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn submit(&self, payload: &CommandPayload, mode: CompletionMode) -> Result<Option<CommandResult>, AppError> {
        Session::submit(self, payload, mode).await
    }
}

fn fail_all_pending(pending: &PendingMap, session_id: &str) {
    let drained: Vec<(u64, PendingSlot)> = lock_pending(pending).drain().collect();
    for (seq, slot) in drained {
        let _ = slot.reply.send(Err(AppError::SessionClosed {
            session_id: session_id.to_string(),
            seq,
            output: slot.output,
        }));
    }
}

async fn receive_loop(
    mut reader: FrameReader<BufReader<OwnedReadHalf>>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    session_id: String,
) {
    loop {
        match reader.read_frame().await {
            Ok(frame) => {
                if !dispatch_frame(&pending, &session_id, frame) {
                    info!(session_id = %session_id, "Editor closed the session");
                    break;
                }
            }
            Err(err) if err.is_recoverable() => {
                let seq = err.seq().unwrap_or(NO_SEQ);
                warn!(session_id = %session_id, seq, error = %err, "Undecodable frame");
                let slot = lock_pending(&pending).remove(&seq);
                match slot {
                    Some(slot) => {
                        let retriable = slot.output.is_empty();
                        let _ = slot.reply.send(Err(AppError::ProtocolDecode {
                            seq,
                            reason: err.to_string(),
                            retriable,
                            output: slot.output,
                        }));
                    }
                    None => debug!(seq, "Undecodable frame belongs to no outstanding command"),
                }
            }
            Err(FrameError::Closed) => {
                info!(session_id = %session_id, "Command connection closed by peer");
                break;
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Command connection failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
    fail_all_pending(&pending, &session_id);
}

/// Routes one frame to its pending slot. Returns false when the editor ends the session.
fn dispatch_frame(pending: &PendingMap, session_id: &str, frame: Frame) -> bool {
    match frame.message.body {
        MessageBody::CommandOutput { session_id: sid, seq, line } if sid == session_id => {
            let mut guard = lock_pending(pending);
            match guard.get_mut(&seq) {
                Some(slot) => slot.output.extend(
                    split_output_lines(&line.text)
                        .into_iter()
                        .map(|text| OutputLine { kind: line.kind, text }),
                ),
                None => debug!(seq, output = %line, "Unsolicited command output"),
            }
        }
        MessageBody::CommandResult { session_id: sid, seq, success, result, error } if sid == session_id => {
            let slot = lock_pending(pending).remove(&seq);
            match slot {
                Some(slot) => {
                    let result = CommandResult {
                        id: CommandId { session_id: sid, seq },
                        success,
                        output: slot.output,
                        value: result,
                        error,
                    };
                    if slot.reply.send(Ok(result)).is_err() {
                        debug!(seq, "Caller stopped waiting before the result arrived");
                    }
                }
                None => debug!(seq, success, "Unsolicited command result"),
            }
        }
        MessageBody::CloseConnection { .. } => return false,
        other => debug!(frame_seq = frame.seq, body = ?other, "Ignoring notification"),
    }
    true
}
