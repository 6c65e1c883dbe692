//! WebSocket push-channel manager.
//!
//! One manager owns at most one live channel, joined to a single
//! conversation. Inbound frames are decoded into
//! [`ServerEvent`](consult_core::ServerEvent) and fanned out through the
//! shared [`EventSubscriptionRegistry`]; outbound frames are queued on a
//! bounded channel and written by the channel task. When the transport
//! drops, the task re-establishes it with exponential backoff and
//! re-sends the join frame.

use std::sync::{
    Arc, Mutex as StdMutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use consult_core::{
    ClientEvent, ConnectionState, ConnectionStateMachine, EventSubscriptionRegistry,
    ReconnectPolicy, ServerEvent, SyncError, SyncErrorCategory,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message as WsMessage,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug)]
struct ActiveChannel {
    conversation_id: String,
    user_id: String,
    outbound_tx: mpsc::Sender<ClientEvent>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the push channel lifecycle for one conversation at a time.
pub struct ConnectionManager {
    ws_url: Url,
    policy: ReconnectPolicy,
    registry: Arc<EventSubscriptionRegistry>,
    machine: Arc<StdMutex<ConnectionStateMachine>>,
    state_tx: watch::Sender<ConnectionState>,
    malformed_events: Arc<AtomicU64>,
    active: Mutex<Option<ActiveChannel>>,
}

impl ConnectionManager {
    pub fn new(ws_url: Url, registry: Arc<EventSubscriptionRegistry>) -> Self {
        Self::with_policy(ws_url, registry, ReconnectPolicy::default())
    }

    pub fn with_policy(
        ws_url: Url,
        registry: Arc<EventSubscriptionRegistry>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            ws_url,
            policy,
            registry,
            machine: Arc::new(StdMutex::new(ConnectionStateMachine::default())),
            state_tx,
            malformed_events: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
        }
    }

    /// Registry shared with subscribers of this manager's events.
    pub fn registry(&self) -> &Arc<EventSubscriptionRegistry> {
        &self.registry
    }

    /// Current channel state.
    pub fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch channel-state transitions.
    pub fn state_signal(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Inbound frames dropped because they failed shape validation.
    pub fn malformed_event_count(&self) -> u64 {
        self.malformed_events.load(Ordering::Relaxed)
    }

    /// Open the channel and join `conversation_id`.
    ///
    /// Fails if a channel is already open, if the handshake is rejected,
    /// or if the server refuses the credentials (an `Auth` error; the
    /// caller must obtain fresh credentials before retrying).
    pub async fn open(
        &self,
        conversation_id: &str,
        user_id: &str,
        bearer_token: &str,
    ) -> Result<(), SyncError> {
        let mut guard = self.active.lock().await;
        if let Some(channel) = guard.as_ref() {
            // A task that declared Disconnected (terminal reconnect
            // failure) or already returned is dead weight, not an open
            // channel; reap it so a fresh open is not refused.
            let terminal = self.current_state() == ConnectionState::Disconnected;
            if !terminal && !channel.task.is_finished() {
                return Err(SyncError::new(
                    SyncErrorCategory::Config,
                    "channel_already_open",
                    "close the previous conversation channel before opening a new one",
                ));
            }
            debug!("reaping finished channel task before reopening");
            if let Some(channel) = guard.take() {
                channel.stop.cancel();
                let _ = channel.task.await;
            }
        }

        self.apply(ConnectionStateMachine::on_open_requested)?;
        let request = match build_ws_request(&self.ws_url, bearer_token) {
            Ok(request) => request,
            Err(err) => {
                self.apply_infallible(ConnectionStateMachine::on_connect_failed);
                return Err(err);
            }
        };
        let ws = match connect_async(request).await {
            Ok((ws, _response)) => ws,
            Err(err) => {
                let auth = is_auth_error(&err);
                self.apply_infallible(ConnectionStateMachine::on_connect_failed);
                return Err(SyncError::connection_failed(err.to_string(), auth));
            }
        };
        self.apply(ConnectionStateMachine::on_connected)?;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_channel(ChannelTask {
            ws,
            ws_url: self.ws_url.clone(),
            bearer_token: bearer_token.to_owned(),
            conversation_id: conversation_id.to_owned(),
            user_id: user_id.to_owned(),
            outbound_rx,
            registry: self.registry.clone(),
            machine: self.machine.clone(),
            state_tx: self.state_tx.clone(),
            stop: stop.child_token(),
            policy: self.policy,
            malformed_events: self.malformed_events.clone(),
        }));
        *guard = Some(ActiveChannel {
            conversation_id: conversation_id.to_owned(),
            user_id: user_id.to_owned(),
            outbound_tx,
            stop,
            task,
        });
        Ok(())
    }

    /// Close the channel. A best-effort leave frame is queued first.
    /// No-op when nothing is open.
    pub async fn close(&self) {
        let channel = {
            let mut guard = self.active.lock().await;
            guard.take()
        };
        let Some(channel) = channel else {
            return;
        };
        let leave = ClientEvent::LeaveConversation {
            conversation_id: channel.conversation_id,
            user_id: channel.user_id,
        };
        if channel.outbound_tx.try_send(leave).is_err() {
            debug!("outbound queue full; leave frame dropped on close");
        }
        channel.stop.cancel();
        let _ = channel.task.await;
        self.apply_infallible(ConnectionStateMachine::on_closed);
    }

    /// Queue an outbound frame. Returns `false` and drops the frame when
    /// no channel is open or the queue is full; callers treat typing and
    /// presence frames as fire-and-forget.
    pub fn send_event(&self, event: ClientEvent) -> bool {
        let Ok(guard) = self.active.try_lock() else {
            return false;
        };
        let Some(channel) = guard.as_ref() else {
            debug!("outbound frame dropped; no channel open");
            return false;
        };
        channel.outbound_tx.try_send(event).is_ok()
    }

    fn apply(
        &self,
        signal: impl FnOnce(&mut ConnectionStateMachine) -> Result<ConnectionState, SyncError>,
    ) -> Result<ConnectionState, SyncError> {
        let mut machine = self.machine.lock().unwrap_or_else(PoisonError::into_inner);
        let next = signal(&mut machine)?;
        self.state_tx.send_replace(next);
        Ok(next)
    }

    fn apply_infallible(
        &self,
        signal: impl FnOnce(&mut ConnectionStateMachine) -> ConnectionState,
    ) {
        let mut machine = self.machine.lock().unwrap_or_else(PoisonError::into_inner);
        let next = signal(&mut machine);
        self.state_tx.send_replace(next);
    }
}

struct ChannelTask {
    ws: WsStream,
    ws_url: Url,
    bearer_token: String,
    conversation_id: String,
    user_id: String,
    outbound_rx: mpsc::Receiver<ClientEvent>,
    registry: Arc<EventSubscriptionRegistry>,
    machine: Arc<StdMutex<ConnectionStateMachine>>,
    state_tx: watch::Sender<ConnectionState>,
    stop: CancellationToken,
    policy: ReconnectPolicy,
    malformed_events: Arc<AtomicU64>,
}

async fn run_channel(task: ChannelTask) {
    let ChannelTask {
        mut ws,
        ws_url,
        bearer_token,
        conversation_id,
        user_id,
        mut outbound_rx,
        registry,
        machine,
        state_tx,
        stop,
        policy,
        malformed_events,
    } = task;

    loop {
        let join = ClientEvent::JoinConversation {
            conversation_id: conversation_id.clone(),
            user_id: user_id.clone(),
        };
        let mut live = send_frame(&mut ws, &join).await.is_ok();

        while live {
            tokio::select! {
                _ = stop.cancelled() => {
                    // Flush queued frames (the leave, typically) before closing.
                    while let Ok(frame) = outbound_rx.try_recv() {
                        let _ = send_frame(&mut ws, &frame).await;
                    }
                    let _ = ws.close(None).await;
                    return;
                }
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => {
                        if send_frame(&mut ws, &frame).await.is_err() {
                            live = false;
                        }
                    }
                    None => {
                        let _ = ws.close(None).await;
                        return;
                    }
                },
                inbound = ws.next() => match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        dispatch_frame(&registry, &text, &malformed_events);
                    }
                    Some(Ok(WsMessage::Close(_))) | None => live = false,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "push channel read failed");
                        live = false;
                    }
                },
            }
        }

        // Transport dropped; messages delivered during the gap are not
        // replayed. The timeline catches up on the next history load.
        {
            let mut guard = machine.lock().unwrap_or_else(PoisonError::into_inner);
            if let Ok(next) = guard.on_transport_dropped() {
                state_tx.send_replace(next);
            }
        }

        let mut attempt: u32 = 0;
        ws = loop {
            let delay = policy.delay_for(attempt, None);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let request = match build_ws_request(&ws_url, &bearer_token) {
                Ok(request) => request,
                Err(err) => {
                    warn!(error = %err, "reconnect aborted; request could not be built");
                    let mut guard = machine.lock().unwrap_or_else(PoisonError::into_inner);
                    let next = guard.on_connect_failed();
                    state_tx.send_replace(next);
                    return;
                }
            };
            match connect_async(request).await {
                Ok((socket, _response)) => {
                    let mut guard = machine.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Ok(next) = guard.on_connected() {
                        state_tx.send_replace(next);
                    }
                    break socket;
                }
                Err(err) if is_auth_error(&err) => {
                    warn!(error = %err, "reconnect rejected by authentication; channel stays down");
                    let mut guard = machine.lock().unwrap_or_else(PoisonError::into_inner);
                    let next = guard.on_connect_failed();
                    state_tx.send_replace(next);
                    return;
                }
                Err(err) => {
                    warn!(error = %err, attempt, "reconnect attempt failed");
                    attempt = attempt.saturating_add(1);
                }
            }
        };
    }
}

async fn send_frame(ws: &mut WsStream, event: &ClientEvent) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, "outbound frame could not be encoded; dropped");
            return Ok(());
        }
    };
    ws.send(WsMessage::Text(text)).await.map_err(|err| {
        warn!(error = %err, "push channel write failed");
    })
}

fn dispatch_frame(registry: &EventSubscriptionRegistry, text: &str, malformed: &AtomicU64) {
    match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => {
            registry.dispatch(&event);
        }
        Err(err) => {
            malformed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "malformed inbound event dropped");
        }
    }
}

fn build_ws_request(
    ws_url: &Url,
    bearer_token: &str,
) -> Result<tungstenite::handshake::client::Request, SyncError> {
    let mut request = ws_url
        .as_str()
        .into_client_request()
        .map_err(|err| SyncError::connection_failed(err.to_string(), false))?;
    let value = HeaderValue::from_str(&format!("Bearer {bearer_token}")).map_err(|_| {
        SyncError::new(
            SyncErrorCategory::Config,
            "invalid_bearer_token",
            "bearer token contains characters not allowed in a header",
        )
    })?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(request)
}

fn is_auth_error(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Http(response) => {
            matches!(response.status().as_u16(), 401 | 403)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use consult_core::ServerEventKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn manager() -> ConnectionManager {
        let url = Url::parse("ws://127.0.0.1:9/push").expect("ws url");
        ConnectionManager::new(url, Arc::new(EventSubscriptionRegistry::new()))
    }

    async fn bound_manager() -> (ConnectionManager, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let url = Url::parse(&format!("ws://{addr}/push")).expect("ws url");
        let policy = ReconnectPolicy::new(Duration::from_millis(10), Duration::from_millis(10));
        let manager = ConnectionManager::with_policy(
            url,
            Arc::new(EventSubscriptionRegistry::new()),
            policy,
        );
        (manager, listener)
    }

    async fn accept_ws(listener: &TcpListener) -> WsServerStream {
        let (stream, _) = listener.accept().await.expect("accept");
        tokio_tungstenite::accept_async(stream)
            .await
            .expect("server handshake")
    }

    type WsServerStream = WebSocketStream<TcpStream>;

    async fn read_client_event(ws: &mut WsServerStream) -> Option<ClientEvent> {
        while let Some(Ok(message)) = ws.next().await {
            if let WsMessage::Text(text) = message {
                return serde_json::from_str(&text).ok();
            }
        }
        None
    }

    /// Refuse a pending handshake with HTTP 401, then close cleanly.
    async fn refuse_with_401(listener: &TcpListener) {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.expect("read request");
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            if request.windows(4).any(|window| window == b"\r\n\r\n") {
                break;
            }
        }
        stream
            .write_all(b"HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\n\r\n")
            .await
            .expect("write response");
        let _ = stream.shutdown().await;
    }

    async fn wait_for_state(manager: &ConnectionManager, wanted: ConnectionState) {
        let mut state = manager.state_signal();
        while *state.borrow_and_update() != wanted {
            state.changed().await.expect("state change");
        }
    }

    #[tokio::test]
    async fn close_without_open_is_a_noop() {
        let manager = manager();
        manager.close().await;
        manager.close().await;
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn send_event_without_channel_is_dropped() {
        let manager = manager();
        let delivered = manager.send_event(ClientEvent::UpdateOnlineStatus {
            user_id: "u1".to_owned(),
            is_online: true,
        });
        assert!(!delivered);
    }

    #[tokio::test]
    async fn failed_open_leaves_the_manager_reopenable() {
        // Port 9 (discard) is not listening; the connect is refused locally.
        let manager = manager();
        let err = manager
            .open("c1", "u1", "token")
            .await
            .expect_err("connect must fail");
        assert_eq!(err.code, "connection_failed");
        assert_eq!(err.category, SyncErrorCategory::Network);
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);

        // The machine reset, so a second attempt is not rejected as a
        // double open.
        let err = manager
            .open("c1", "u1", "token")
            .await
            .expect_err("connect must fail again");
        assert_eq!(err.code, "connection_failed");
    }

    #[test]
    fn http_401_is_classified_as_auth() {
        let response = tungstenite::http::Response::builder()
            .status(401)
            .body(None)
            .expect("response");
        assert!(is_auth_error(&tungstenite::Error::Http(response)));

        let response = tungstenite::http::Response::builder()
            .status(500)
            .body(None)
            .expect("response");
        assert!(!is_auth_error(&tungstenite::Error::Http(response)));
    }

    #[test]
    fn malformed_frames_are_counted_not_dispatched() {
        let registry = EventSubscriptionRegistry::new();
        let counter = AtomicU64::new(0);
        let _token = registry.subscribe(ServerEventKind::NewMessage, Box::new(|_| {}));

        dispatch_frame(&registry, "{\"event\":\"nope\"}", &counter);
        dispatch_frame(&registry, "not json", &counter);
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn reopen_succeeds_after_terminal_reconnect_failure() {
        let (manager, listener) = bound_manager().await;
        let server = tokio::spawn(async move {
            // First connect: take the join frame, then drop the transport.
            let mut ws = accept_ws(&listener).await;
            let first = read_client_event(&mut ws).await;
            assert!(matches!(first, Some(ClientEvent::JoinConversation { .. })));
            drop(ws);

            // Reconnect attempt: refuse with 401 so the channel task
            // gives up rather than keep retrying.
            refuse_with_401(&listener).await;

            // Fresh open with new credentials: accept normally.
            let mut ws = accept_ws(&listener).await;
            let rejoin = read_client_event(&mut ws).await;
            assert!(matches!(rejoin, Some(ClientEvent::JoinConversation { .. })));
            while read_client_event(&mut ws).await.is_some() {}
        });

        manager.open("c1", "u1", "stale-token").await.expect("open");
        wait_for_state(&manager, ConnectionState::Disconnected).await;

        manager
            .open("c1", "u1", "fresh-token")
            .await
            .expect("reopen after terminal failure");
        assert_eq!(manager.current_state(), ConnectionState::Connected);
        manager.close().await;
        server.await.expect("server");
    }

    #[tokio::test]
    async fn join_frame_is_resent_after_transport_drop() {
        let (manager, listener) = bound_manager().await;
        let server = tokio::spawn(async move {
            let mut joins = 0usize;
            // First connect, then the recovered transport.
            let mut ws = accept_ws(&listener).await;
            if matches!(
                read_client_event(&mut ws).await,
                Some(ClientEvent::JoinConversation { .. })
            ) {
                joins += 1;
            }
            drop(ws);

            let mut ws = accept_ws(&listener).await;
            if matches!(
                read_client_event(&mut ws).await,
                Some(ClientEvent::JoinConversation { .. })
            ) {
                joins += 1;
            }
            // Signal the rejoin back so the client knows recovery happened.
            let marker = ServerEvent::UserOnline {
                user_id: "u-remote".to_owned(),
            };
            let frame = serde_json::to_string(&marker).expect("encode");
            ws.send(WsMessage::Text(frame)).await.expect("send marker");
            while read_client_event(&mut ws).await.is_some() {}
            joins
        });

        let (rejoined_tx, mut rejoined_rx) = mpsc::unbounded_channel();
        let _token = manager.registry().subscribe(
            ServerEventKind::PresenceOnline,
            Box::new(move |_| {
                let _ = rejoined_tx.send(());
            }),
        );

        manager.open("c1", "u1", "token").await.expect("open");
        rejoined_rx.recv().await.expect("recovery marker");
        manager.close().await;
        assert_eq!(server.await.expect("server"), 2);
    }

    #[tokio::test]
    async fn double_close_sends_a_single_leave_frame() {
        let (manager, listener) = bound_manager().await;
        let server = tokio::spawn(async move {
            let mut ws = accept_ws(&listener).await;
            let mut frames = Vec::new();
            while let Some(event) = read_client_event(&mut ws).await {
                frames.push(event);
            }
            frames
        });

        manager.open("c1", "u1", "token").await.expect("open");
        manager.close().await;
        manager.close().await;

        let frames = server.await.expect("server");
        assert!(matches!(frames[0], ClientEvent::JoinConversation { .. }));
        let leaves = frames
            .iter()
            .filter(|event| matches!(event, ClientEvent::LeaveConversation { .. }))
            .count();
        assert_eq!(leaves, 1);
    }

    #[test]
    fn bearer_header_is_attached_to_the_handshake() {
        let url = Url::parse("wss://consult.example.com/push").expect("ws url");
        let request = build_ws_request(&url, "secret-token").expect("request");
        let header = request
            .headers()
            .get(AUTHORIZATION)
            .expect("authorization header");
        assert_eq!(header, "Bearer secret-token");
    }
}
