// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bidirectional call multiplexer over one duplex byte stream.
//
// Each side exposes a `MethodHandler` and, once the peer's `Hello` arrives,
// gets a `PeerProxy` for calling the other way. One reader task dispatches
// inbound frames; one writer task drains two queues, control traffic first,
// so a long payload upload never delays heartbeats or replies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::channel::mpsc as chunk_mpsc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use labwerk_core::error::{ErrorCode, LabwerkError, Result};

use crate::codec::EnvelopeCodec;
use crate::protocol::{Call, Frame, Message, Method, Outcome, PayloadDescriptor};

/// Size of the body carried by each `StreamChunk` frame.
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Outbound payload frames buffered before callers are back-pressured.
const DATA_QUEUE_DEPTH: usize = 32;

/// Binary argument of a call.
pub enum Payload {
    Empty,
    Bytes(Bytes),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl Payload {
    /// Collect the whole payload in memory.
    pub async fn into_bytes(self) -> Result<Bytes> {
        match self {
            Self::Empty => Ok(Bytes::new()),
            Self::Bytes(bytes) => Ok(bytes),
            Self::Stream(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// The local method table served to the peer.
#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    /// Methods advertised in `Hello`. Calls to anything else are refused
    /// without reaching `handle`.
    fn methods(&self) -> Vec<Method>;

    async fn handle(&self, call: Call, payload: Payload) -> Result<Value>;
}

type ReplySlot = oneshot::Sender<Result<Value>>;
type ChunkSender = chunk_mpsc::UnboundedSender<std::io::Result<Bytes>>;

struct Shared {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, ReplySlot>>,
    /// Streamed payloads still being received, by stream id.
    inbound: Mutex<HashMap<u64, ChunkSender>>,
    control_tx: mpsc::UnboundedSender<Message>,
    data_tx: mpsc::Sender<Message>,
    closed: CancellationToken,
    close_reason: Mutex<Option<String>>,
    liveness: watch::Sender<Instant>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn stream_aborted() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::ConnectionAborted,
        "connection closed mid-stream",
    )
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send_control(&self, frame: Frame) -> bool {
        debug_assert!(frame.is_control());
        self.control_tx.send(Message::new(frame)).is_ok()
    }

    /// Mark the connection dead. The first reason wins; every waiting caller
    /// is released with `CallAbandoned` and every unfinished inbound stream
    /// ends in an error rather than a clean end of file.
    fn close(&self, reason: impl Into<String>) {
        {
            let mut slot = lock(&self.close_reason);
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.closed.cancel();
        lock(&self.pending).clear();
        for (_, tx) in lock(&self.inbound).drain() {
            let _ = tx.unbounded_send(Err(stream_aborted()));
        }
    }

    /// Register an inbound stream. close() cancels before it drains, so a
    /// stream opened after the drain is failed here instead.
    fn open_stream(&self, stream: u64, tx: ChunkSender) {
        let mut inbound = lock(&self.inbound);
        if self.closed.is_cancelled() {
            let _ = tx.unbounded_send(Err(stream_aborted()));
        } else {
            inbound.insert(stream, tx);
        }
    }

    fn touch(&self) {
        self.liveness.send_replace(Instant::now());
    }
}

/// Owns the reader and writer tasks of one connection. Dropping it tears the
/// connection down, abandons in-flight outbound calls and fails any payload
/// still being uploaded to a local handler.
pub struct Multiplexer {
    shared: Arc<Shared>,
    peer_ready: Option<oneshot::Receiver<PeerProxy>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Multiplexer {
    pub fn start<S>(stream: S, handler: Arc<dyn MethodHandler>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE_DEPTH);
        let (liveness, _) = watch::channel(Instant::now());
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            control_tx,
            data_tx,
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
            liveness,
        });

        let local_methods: Arc<[Method]> = handler.methods().into();
        shared.send_control(Frame::Hello {
            methods: local_methods.to_vec(),
        });

        let (peer_tx, peer_rx) = oneshot::channel();
        let writer = tokio::spawn(write_loop(
            FramedWrite::new(write_half, EnvelopeCodec::new()),
            control_rx,
            data_rx,
            Arc::clone(&shared),
        ));
        let reader = tokio::spawn(
            Reader {
                shared: Arc::clone(&shared),
                handler,
                local_methods,
                peer_tx: Some(peer_tx),
            }
            .run(FramedRead::new(read_half, EnvelopeCodec::new())),
        );

        Self {
            shared,
            peer_ready: Some(peer_rx),
            tasks: vec![writer, reader],
        }
    }

    pub fn handle(&self) -> MuxHandle {
        MuxHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Resolves once with the peer's proxy. `None` after the first take.
    pub fn take_peer_ready(&mut self) -> Option<oneshot::Receiver<PeerProxy>> {
        self.peer_ready.take()
    }

    /// Wait for the peer's `Hello`.
    pub async fn peer(&mut self) -> Result<PeerProxy> {
        let rx = self
            .take_peer_ready()
            .ok_or_else(|| LabwerkError::Protocol("peer proxy already handed out".into()))?;
        rx.await
            .map_err(|_| LabwerkError::Disconnected("closed before peer hello".into()))
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shared.close("multiplexer shut down");
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Session-side handle for liveness traffic and closure.
#[derive(Clone)]
pub struct MuxHandle {
    shared: Arc<Shared>,
}

impl MuxHandle {
    /// Queue a heartbeat ahead of any payload data.
    pub fn send_heartbeat(&self, seq: u64) -> Result<()> {
        let beat = Frame::Heartbeat {
            seq,
            sent_at: Utc::now(),
        };
        if self.shared.send_control(beat) {
            Ok(())
        } else {
            Err(LabwerkError::Disconnected("writer stopped".into()))
        }
    }

    /// Updated whenever a heartbeat or heartbeat ack arrives.
    pub fn liveness(&self) -> watch::Receiver<Instant> {
        self.shared.liveness.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves when the connection ends, with the reason.
    pub async fn closed(&self) -> LabwerkError {
        self.shared.closed.cancelled().await;
        let reason = lock(&self.shared.close_reason)
            .clone()
            .unwrap_or_else(|| "connection closed".into());
        LabwerkError::Disconnected(reason)
    }

    pub fn shutdown(&self, reason: &str) {
        self.shared.close(reason);
    }
}

/// Callable view of the methods the peer advertised.
#[derive(Clone)]
pub struct PeerProxy {
    methods: Arc<[Method]>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PeerProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerProxy")
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

impl PeerProxy {
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn supports(&self, method: Method) -> bool {
        self.methods.contains(&method)
    }

    /// Invoke a peer method and wait for its reply.
    pub async fn call(&self, call: Call, payload: Payload) -> Result<Value> {
        let method = call.method();
        if !self.supports(method) {
            return Err(LabwerkError::UnknownMethod(method.to_string()));
        }
        if self.shared.closed.is_cancelled() {
            return Err(LabwerkError::CallAbandoned);
        }

        let id = self.shared.next_id();
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, tx);
        // close() cancels before it clears, so a call registered after the
        // clear still sees the cancellation here.
        if self.shared.closed.is_cancelled() {
            lock(&self.shared.pending).remove(&id);
            return Err(LabwerkError::CallAbandoned);
        }

        if let Err(e) = self.send_call(id, call, payload).await {
            lock(&self.shared.pending).remove(&id);
            return Err(e);
        }
        trace!(id, %method, "call sent");
        rx.await.unwrap_or(Err(LabwerkError::CallAbandoned))
    }

    /// Push a decoded scan to the controller.
    pub async fn report_scan(&self, code: &str) -> Result<()> {
        self.call(
            Call::ReportScan {
                code: code.to_owned(),
            },
            Payload::Empty,
        )
        .await
        .map(|_| ())
    }

    async fn send_call(&self, id: u64, call: Call, payload: Payload) -> Result<()> {
        match payload {
            Payload::Empty => {
                let frame = Frame::Call {
                    id,
                    call,
                    payload: PayloadDescriptor::None,
                };
                self.send_data(Message::new(frame)).await
            }
            Payload::Bytes(body) => {
                let frame = Frame::Call {
                    id,
                    call,
                    payload: PayloadDescriptor::Inline,
                };
                self.send_data(Message::with_body(frame, body)).await
            }
            Payload::Stream(reader) => {
                let stream = self.shared.next_id();
                let frame = Frame::Call {
                    id,
                    call,
                    payload: PayloadDescriptor::Stream { stream },
                };
                self.send_data(Message::new(frame)).await?;

                let mut chunks = ReaderStream::with_capacity(reader, STREAM_CHUNK_SIZE);
                while let Some(chunk) = chunks.next().await {
                    match chunk {
                        Ok(bytes) => {
                            self.send_data(Message::with_body(Frame::StreamChunk { stream }, bytes))
                                .await?;
                        }
                        Err(e) => {
                            let abort = Frame::StreamAbort {
                                stream,
                                message: e.to_string(),
                            };
                            self.send_data(Message::new(abort)).await?;
                            return Err(LabwerkError::Io(e));
                        }
                    }
                }
                self.send_data(Message::new(Frame::StreamEnd { stream })).await
            }
        }
    }

    async fn send_data(&self, msg: Message) -> Result<()> {
        self.shared
            .data_tx
            .send(msg)
            .await
            .map_err(|_| LabwerkError::CallAbandoned)
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<WriteHalf<W>, EnvelopeCodec>,
    mut control: mpsc::UnboundedReceiver<Message>,
    mut data: mpsc::Receiver<Message>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Send,
{
    loop {
        let msg = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            Some(msg) = control.recv() => msg,
            Some(msg) = data.recv() => msg,
            else => break,
        };
        if let Err(e) = sink.send(msg).await {
            shared.close(format!("write failed: {e}"));
            break;
        }
    }
    debug!("writer stopped");
}

struct Reader {
    shared: Arc<Shared>,
    handler: Arc<dyn MethodHandler>,
    local_methods: Arc<[Method]>,
    peer_tx: Option<oneshot::Sender<PeerProxy>>,
}

impl Reader {
    async fn run<R>(mut self, mut frames: FramedRead<ReadHalf<R>, EnvelopeCodec>)
    where
        R: AsyncRead + Send,
    {
        let reason = loop {
            let next = tokio::select! {
                _ = self.shared.closed.cancelled() => break None,
                next = frames.next() => next,
            };
            match next {
                None => break Some("socket closed by peer".to_owned()),
                Some(Err(e)) => break Some(format!("read failed: {e}")),
                Some(Ok(msg)) => self.dispatch(msg),
            }
        };

        if let Some(reason) = reason {
            debug!(%reason, "reader stopped");
            self.shared.close(reason);
        }
    }

    fn dispatch(&mut self, msg: Message) {
        match msg.frame {
            Frame::Hello { methods } => match self.peer_tx.take() {
                Some(tx) => {
                    debug!(?methods, "peer methods ready");
                    let _ = tx.send(PeerProxy {
                        methods: methods.into(),
                        shared: Arc::clone(&self.shared),
                    });
                }
                None => debug!("ignoring repeated hello"),
            },
            Frame::Call { id, call, payload } => {
                let payload = match payload {
                    PayloadDescriptor::None => Payload::Empty,
                    PayloadDescriptor::Inline => Payload::Bytes(msg.body),
                    PayloadDescriptor::Stream { stream } => {
                        let (tx, rx) = chunk_mpsc::unbounded();
                        self.shared.open_stream(stream, tx);
                        Payload::Stream(Box::new(StreamReader::new(rx)))
                    }
                };
                self.spawn_call(id, call, payload);
            }
            Frame::Reply { id, outcome } => match lock(&self.shared.pending).remove(&id) {
                Some(slot) => {
                    let _ = slot.send(outcome.into_result());
                }
                None => debug!(id, "reply for unknown or abandoned call"),
            },
            Frame::Heartbeat { seq, .. } => {
                self.shared.send_control(Frame::HeartbeatAck { seq });
                self.shared.touch();
            }
            Frame::HeartbeatAck { seq } => {
                trace!(seq, "heartbeat acknowledged");
                self.shared.touch();
            }
            Frame::Malformed { id, reason } => {
                warn!(id, %reason, "rejecting call");
                let outcome = Outcome::Err {
                    code: ErrorCode::BadRequest,
                    message: reason,
                };
                self.shared.send_control(Frame::Reply { id, outcome });
            }
            Frame::StreamChunk { stream } => {
                let mut inbound = lock(&self.shared.inbound);
                let receiver_gone = match inbound.get(&stream) {
                    Some(tx) => tx.unbounded_send(Ok(msg.body)).is_err(),
                    None => {
                        debug!(stream, "chunk for unknown stream");
                        false
                    }
                };
                if receiver_gone {
                    inbound.remove(&stream);
                }
            }
            Frame::StreamEnd { stream } => {
                lock(&self.shared.inbound).remove(&stream);
            }
            Frame::StreamAbort { stream, message } => {
                let aborted = lock(&self.shared.inbound).remove(&stream);
                if let Some(tx) = aborted {
                    let _ = tx.unbounded_send(Err(std::io::Error::other(message)));
                }
            }
        }
    }

    fn spawn_call(&self, id: u64, call: Call, payload: Payload) {
        let method = call.method();
        let replies = self.shared.control_tx.clone();

        if !self.local_methods.contains(&method) {
            warn!(id, %method, "peer called a method we do not expose");
            let outcome = Outcome::from(Err::<Value, _>(LabwerkError::UnknownMethod(
                method.to_string(),
            )));
            let _ = replies.send(Message::new(Frame::Reply { id, outcome }));
            return;
        }

        let handler = Arc::clone(&self.handler);
        let job = tokio::spawn(async move { handler.handle(call, payload).await });
        tokio::spawn(async move {
            let outcome = match job.await {
                Ok(result) => Outcome::from(result),
                Err(e) if e.is_panic() => {
                    error!(id, %method, "method handler panicked");
                    Outcome::Err {
                        code: ErrorCode::Internal,
                        message: format!("{method} handler panicked"),
                    }
                }
                Err(e) => Outcome::Err {
                    code: ErrorCode::Internal,
                    message: format!("{method} handler did not finish: {e}"),
                },
            };
            if let Outcome::Err { code, message } = &outcome {
                debug!(id, %method, %code, %message, "call failed");
            }
            if replies
                .send(Message::new(Frame::Reply { id, outcome }))
                .is_err()
            {
                debug!(id, %method, "connection gone before reply");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::BytesMut;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::Mutex as AsyncMutex;
    use tokio_util::codec::{Encoder, LengthDelimitedCodec};

    use labwerk_core::types::DeviceSelector;

    /// Agent side: identify and print.
    struct Agent;

    #[async_trait]
    impl MethodHandler for Agent {
        fn methods(&self) -> Vec<Method> {
            vec![Method::Identify, Method::Print]
        }

        async fn handle(&self, call: Call, payload: Payload) -> Result<Value> {
            match call {
                Call::Identify => Ok(json!({"id": "node-1", "name": "bench", "devices": []})),
                Call::Print { copies, .. } => {
                    if copies == json!("boom") {
                        panic!("driver table corrupted");
                    }
                    let body = payload.into_bytes().await?;
                    Ok(json!({"len": body.len(), "copies": copies}))
                }
                Call::ReportScan { .. } => unreachable!("not advertised"),
            }
        }
    }

    /// Controller side: records scans, optionally never answers.
    #[derive(Default)]
    struct Controller {
        scans: AsyncMutex<Vec<String>>,
        stall: bool,
    }

    #[async_trait]
    impl MethodHandler for Controller {
        fn methods(&self) -> Vec<Method> {
            vec![Method::ReportScan]
        }

        async fn handle(&self, call: Call, _payload: Payload) -> Result<Value> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            if let Call::ReportScan { code } = call {
                self.scans.lock().await.push(code);
            }
            Ok(Value::Null)
        }
    }

    /// Agent side that only reports how much of an upload it received.
    struct Uploads(Mutex<Option<oneshot::Sender<Result<usize>>>>);

    #[async_trait]
    impl MethodHandler for Uploads {
        fn methods(&self) -> Vec<Method> {
            vec![Method::Print]
        }

        async fn handle(&self, _call: Call, payload: Payload) -> Result<Value> {
            let received = payload.into_bytes().await.map(|b| b.len());
            if let Some(tx) = lock(&self.0).take() {
                let _ = tx.send(received);
            }
            Ok(Value::Null)
        }
    }

    /// Encode a hand-written frame header the typed API cannot produce.
    fn raw_frame(header: Value) -> BytesMut {
        let header = serde_json::to_vec(&header).unwrap();
        let mut envelope = BytesMut::new();
        envelope.extend_from_slice(&(header.len() as u32).to_be_bytes());
        envelope.extend_from_slice(&header);
        let mut wire = BytesMut::new();
        LengthDelimitedCodec::new()
            .encode(envelope.freeze(), &mut wire)
            .unwrap();
        wire
    }

    fn pair(controller: Arc<Controller>) -> (Multiplexer, Multiplexer) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (
            Multiplexer::start(a, Arc::new(Agent)),
            Multiplexer::start(b, controller),
        )
    }

    fn print_call(copies: Value) -> Call {
        Call::Print {
            selector: DeviceSelector::Index(0),
            copies,
        }
    }

    #[tokio::test]
    async fn identify_round_trip() {
        let (_agent, mut ctrl) = pair(Arc::default());
        let agent_proxy = ctrl.peer().await.expect("hello");
        assert!(agent_proxy.supports(Method::Print));

        let info = agent_proxy
            .call(Call::Identify, Payload::Empty)
            .await
            .expect("identify");
        assert_eq!(info["id"], "node-1");
    }

    #[tokio::test]
    async fn inline_and_streamed_payloads_arrive_whole() {
        let (_agent, mut ctrl) = pair(Arc::default());
        let agent_proxy = ctrl.peer().await.unwrap();

        let inline = agent_proxy
            .call(print_call(json!(2)), Payload::Bytes(Bytes::from_static(&[7u8; 10])))
            .await
            .unwrap();
        assert_eq!(inline["len"], 10);

        // Several chunks' worth, not a multiple of the chunk size.
        let big = vec![0x5au8; STREAM_CHUNK_SIZE * 3 + 17];
        let reply = agent_proxy
            .call(
                print_call(json!(1)),
                Payload::Stream(Box::new(std::io::Cursor::new(big.clone()))),
            )
            .await
            .unwrap();
        assert_eq!(reply["len"], big.len());
    }

    #[tokio::test]
    async fn scan_reports_flow_the_other_way() {
        let controller = Arc::new(Controller::default());
        let (mut agent, _ctrl) = pair(Arc::clone(&controller));
        let ctrl_proxy = agent.peer().await.unwrap();

        ctrl_proxy.report_scan("A1B2").await.expect("report");
        assert_eq!(*controller.scans.lock().await, vec!["A1B2".to_owned()]);
    }

    #[tokio::test]
    async fn unadvertised_method_fails_locally() {
        let (mut agent, _ctrl) = pair(Arc::default());
        let ctrl_proxy = agent.peer().await.unwrap();

        let err = ctrl_proxy
            .call(Call::Identify, Payload::Empty)
            .await
            .unwrap_err();
        assert!(matches!(err, LabwerkError::UnknownMethod(m) if m == "identify"));
    }

    #[tokio::test]
    async fn unexposed_method_is_refused_by_callee() {
        let (_agent, mut ctrl) = pair(Arc::default());
        let agent_proxy = ctrl.peer().await.unwrap();
        // Forge a proxy that believes the agent serves report_scan.
        let forged = PeerProxy {
            methods: vec![Method::ReportScan].into(),
            shared: Arc::clone(&agent_proxy.shared),
        };

        let err = forged.report_scan("X").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownMethod);
    }

    #[tokio::test]
    async fn handler_panic_becomes_internal_error() {
        let (_agent, mut ctrl) = pair(Arc::default());
        let agent_proxy = ctrl.peer().await.unwrap();

        let err = agent_proxy
            .call(print_call(json!("boom")), Payload::Empty)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);

        // The connection survives.
        assert!(agent_proxy.call(Call::Identify, Payload::Empty).await.is_ok());
    }

    #[tokio::test]
    async fn peer_ready_fires_once() {
        let (_agent, mut ctrl) = pair(Arc::default());
        assert!(ctrl.peer().await.is_ok());
        assert!(matches!(
            ctrl.peer().await,
            Err(LabwerkError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn teardown_abandons_in_flight_calls() {
        let controller = Arc::new(Controller {
            stall: true,
            ..Default::default()
        });
        let (mut agent, ctrl) = pair(controller);
        let ctrl_proxy = agent.peer().await.unwrap();
        let handle = agent.handle();

        let call = tokio::spawn(async move { ctrl_proxy.report_scan("lost").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(ctrl);

        let result = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("call should resolve")
            .unwrap();
        assert!(matches!(result, Err(LabwerkError::CallAbandoned)));

        let reason = tokio::time::timeout(Duration::from_secs(5), handle.closed())
            .await
            .expect("closed");
        assert!(matches!(reason, LabwerkError::Disconnected(_)));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn bad_call_arguments_get_an_error_reply() {
        let (agent_io, wire) = tokio::io::duplex(64 * 1024);
        let agent = Multiplexer::start(agent_io, Arc::new(Agent));
        let (read, mut write) = tokio::io::split(wire);
        let mut frames = FramedRead::new(read, EnvelopeCodec::new());

        let bad = raw_frame(json!({
            "type": "call",
            "id": 1,
            "call": {"method": "print", "selector": {"shelf": 2}, "copies": 1},
            "payload": {"kind": "inline"}
        }));
        let good = raw_frame(json!({"type": "call", "id": 2, "call": {"method": "identify"}}));
        write.write_all(&bad).await.unwrap();
        write.write_all(&good).await.unwrap();

        let mut replies = Vec::new();
        while replies.len() < 2 {
            let msg = tokio::time::timeout(Duration::from_secs(5), frames.next())
                .await
                .expect("reply")
                .expect("agent still writing")
                .expect("frame decodes");
            if let Frame::Reply { id, outcome } = msg.frame {
                replies.push((id, outcome));
            }
        }
        assert!(matches!(
            &replies[0],
            (1, Outcome::Err { code: ErrorCode::BadRequest, .. })
        ));
        assert!(matches!(&replies[1], (2, Outcome::Ok { .. })));
        assert!(!agent.handle().is_closed());
    }

    #[tokio::test]
    async fn teardown_mid_upload_fails_the_payload() {
        let (tx, rx) = oneshot::channel();
        let (a, b) = tokio::io::duplex(256 * 1024);
        let agent = Multiplexer::start(a, Arc::new(Uploads(Mutex::new(Some(tx)))));
        let mut ctrl = Multiplexer::start(b, Arc::new(Controller::default()));
        let agent_proxy = ctrl.peer().await.unwrap();

        // 1000 bytes, then a source that never yields more.
        let (_stalled_writer, stalled) = tokio::io::duplex(64);
        let upload = std::io::Cursor::new(vec![1u8; 1000]).chain(stalled);
        let _call = tokio::spawn(async move {
            agent_proxy
                .call(print_call(json!(1)), Payload::Stream(Box::new(upload)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(agent);

        let received = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("handler finished")
            .expect("handler reported");
        assert!(received.is_err(), "a cut-off upload must not read as complete");
    }

    #[tokio::test]
    async fn heartbeats_are_acknowledged() {
        let (agent, ctrl) = pair(Arc::default());
        let mut agent_live = agent.handle().liveness();
        let mut ctrl_live = ctrl.handle().liveness();

        agent.handle().send_heartbeat(1).unwrap();

        tokio::time::timeout(Duration::from_secs(5), ctrl_live.changed())
            .await
            .expect("controller saw heartbeat")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), agent_live.changed())
            .await
            .expect("agent saw ack")
            .unwrap();
    }
}
