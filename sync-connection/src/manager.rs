use crate::transport::{Connector, LinkEvent, OutboundFrame, WsConnector};
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use sync_core::config::ConnectionConfig;
use sync_core::{mask_token, Config, ReconnectStrategy, SyncError, SyncResult};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted; only a new `connect` leaves this state.
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Unbounded retries, same delay every time.
    Fixed(Duration),
    /// Capped exponential backoff with full jitter.
    Backoff {
        base: Duration,
        max: Duration,
        max_attempts: Option<u32>,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(Duration::from_secs(2))
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        let base = Duration::from_millis(config.reconnect_delay_ms);
        match config.strategy {
            ReconnectStrategy::Fixed => ReconnectPolicy::Fixed(base),
            ReconnectStrategy::Backoff => ReconnectPolicy::Backoff {
                base,
                max: Duration::from_millis(config.max_delay_ms),
                max_attempts: config.max_attempts,
            },
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based); `None` means
    /// give up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self {
            ReconnectPolicy::Fixed(delay) => Some(*delay),
            ReconnectPolicy::Backoff {
                base,
                max,
                max_attempts,
            } => {
                if max_attempts.map(|m| attempt > m).unwrap_or(false) {
                    return None;
                }
                let exp = base.saturating_mul(1 << attempt.saturating_sub(1).min(16));
                let cap = exp.min(*max).as_millis() as u64;
                Some(Duration::from_millis(rand::thread_rng().gen_range(0..=cap)))
            }
        }
    }
}

/// Handle to the live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send(&self, text: String) -> SyncResult<()> {
        self.outbound
            .send(OutboundFrame::Text(text))
            .map_err(|_| SyncError::NotConnected)
    }

    pub fn send_json(&self, value: &serde_json::Value) -> SyncResult<()> {
        self.send(value.to_string())
    }

    fn close(&self) {
        let _ = self.outbound.send(OutboundFrame::Close);
    }
}

struct State {
    token: Option<String>,
    /// Bumped by every disconnect so in-flight opens can tell they are stale.
    generation: u64,
    live: Option<ConnectionHandle>,
    connecting: bool,
    attempt: u32,
    next_id: u64,
    reconnect_timer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    ws_base_url: String,
    policy: ReconnectPolicy,
    state: Mutex<State>,
    status_tx: watch::Sender<ConnectionStatus>,
    events_tx: mpsc::UnboundedSender<String>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

/// Owns the single persistent push connection of a session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, ws_base_url: &str, policy: ReconnectPolicy) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                connector,
                ws_base_url: ws_base_url.trim_end_matches('/').to_string(),
                policy,
                state: Mutex::new(State {
                    token: None,
                    generation: 0,
                    live: None,
                    connecting: false,
                    attempt: 0,
                    next_id: 1,
                    reconnect_timer: None,
                    reader: None,
                }),
                status_tx,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(WsConnector),
            &config.api.ws_url,
            ReconnectPolicy::from_config(&config.connection),
        )
    }

    /// Opens the connection for `token`. A no-op while a connection for the
    /// same token is live or being opened. If the first attempt fails the
    /// error is returned and a reconnect is still scheduled.
    pub async fn connect(&self, token: &str) -> SyncResult<()> {
        let generation = {
            let mut state = self.inner.lock();
            if state.token.as_deref() == Some(token) && (state.live.is_some() || state.connecting) {
                tracing::debug!("connect() ignored: connection already live or in flight");
                return Ok(());
            }
            if state.token.is_some() && state.token.as_deref() != Some(token) {
                tracing::info!("Switching session token, closing previous connection");
                self.inner.teardown(&mut state);
            }
            state.token = Some(token.to_string());
            state.attempt = 0;
            state.connecting = true;
            self.inner.set_status(ConnectionStatus::Connecting);
            state.generation
        };
        self.inner.clone().open(generation).await
    }

    pub fn current_connection(&self) -> Option<ConnectionHandle> {
        self.inner.lock().live.clone()
    }

    /// Registers the single consumer of inbound frames.
    pub fn on_event(&self) -> SyncResult<mpsc::UnboundedReceiver<String>> {
        self.inner
            .events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(SyncError::AlreadyRegistered)
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Sends a text frame over the live connection.
    pub fn send(&self, text: String) -> SyncResult<()> {
        self.current_connection()
            .ok_or(SyncError::NotConnected)?
            .send(text)
    }

    /// Clears the token, closes the connection and cancels any pending
    /// reconnect.
    pub fn disconnect(&self) {
        let mut state = self.inner.lock();
        self.inner.teardown(&mut state);
        tracing::info!("Disconnected");
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
    }

    fn teardown(&self, state: &mut State) {
        state.token = None;
        state.generation += 1;
        state.connecting = false;
        state.attempt = 0;
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        if let Some(live) = state.live.take() {
            live.close();
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    async fn open(self: Arc<Self>, generation: u64) -> SyncResult<()> {
        let url = {
            let state = self.lock();
            match &state.token {
                Some(token) => format!("{}/chat?token={}", self.ws_base_url, token),
                None => return Ok(()),
            }
        };
        tracing::info!("Connecting to {}", mask_token(&url));

        let result = self.connector.open(&url).await;

        let mut state = self.lock();
        if state.generation != generation || state.token.is_none() {
            if let Ok(link) = result {
                let _ = link.outbound.send(OutboundFrame::Close);
            }
            return Ok(());
        }
        state.connecting = false;

        match result {
            Ok(link) => {
                let id = state.next_id;
                state.next_id += 1;
                state.attempt = 0;
                if let Some(timer) = state.reconnect_timer.take() {
                    timer.abort();
                }
                state.live = Some(ConnectionHandle {
                    id,
                    outbound: link.outbound,
                });
                state.reader = Some(tokio::spawn(self.clone().read_loop(id, link.inbound)));
                self.set_status(ConnectionStatus::Connected);
                tracing::info!("Connection {} established", id);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Connection attempt failed: {}", e);
                self.schedule_reconnect(&mut state);
                Err(SyncError::Transport(e.to_string()))
            }
        }
    }

    async fn read_loop(self: Arc<Self>, id: u64, mut inbound: mpsc::UnboundedReceiver<LinkEvent>) {
        let (code, reason) = loop {
            match inbound.recv().await {
                Some(LinkEvent::Text(text)) => {
                    if self.events_tx.send(text).is_err() {
                        tracing::debug!("No event consumer, dropping frame");
                    }
                }
                Some(LinkEvent::Error(e)) => {
                    tracing::warn!("Transport error on connection {}: {}", id, e);
                }
                Some(LinkEvent::Closed { code, reason }) => break (code, reason),
                None => break (None, "link dropped".to_string()),
            }
        };

        let mut state = self.lock();
        if state.live.as_ref().map(|c| c.id) != Some(id) {
            return;
        }
        state.live = None;
        state.reader = None;
        tracing::info!("Connection {} closed (code {:?}): {}", id, code, reason);
        if state.token.is_some() {
            self.schedule_reconnect(&mut state);
        } else {
            self.set_status(ConnectionStatus::Disconnected);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut State) {
        state.attempt += 1;
        let attempt = state.attempt;
        let Some(delay) = self.policy.delay_for(attempt) else {
            tracing::warn!("Giving up after {} reconnect attempt(s), going offline", attempt - 1);
            self.set_status(ConnectionStatus::Offline);
            return;
        };

        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }
        self.set_status(ConnectionStatus::Reconnecting { attempt });
        tracing::info!("Reconnecting in {:?} (attempt {})", delay, attempt);
        state.reconnect_timer = Some(tokio::spawn(self.clone().reconnect_after(delay, state.generation)));
    }

    fn reconnect_after(
        self: Arc<Self>,
        delay: Duration,
        generation: u64,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = self.lock();
                state.reconnect_timer = None;
                if state.generation != generation
                    || state.token.is_none()
                    || state.live.is_some()
                    || state.connecting
                {
                    return;
                }
                state.connecting = true;
                self.set_status(ConnectionStatus::Connecting);
            }
            let _ = self.open(generation).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Link;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    type ServerEnd = (mpsc::UnboundedSender<LinkEvent>, mpsc::UnboundedReceiver<OutboundFrame>);

    #[derive(Default)]
    struct FakeConnector {
        opens: AtomicUsize,
        fail: AtomicBool,
        urls: Mutex<Vec<String>>,
        servers: Mutex<Vec<ServerEnd>>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn open(&self, url: &str) -> anyhow::Result<Link> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("connection refused"));
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            self.servers.lock().unwrap().push((in_tx, out_rx));
            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }

    impl FakeConnector {
        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn push(&self, index: usize, event: LinkEvent) {
            let servers = self.servers.lock().unwrap();
            servers[index].0.send(event).unwrap();
        }
    }

    fn manager(connector: &Arc<FakeConnector>, policy: ReconnectPolicy) -> ConnectionManager {
        ConnectionManager::new(connector.clone(), "ws://localhost:8080/", policy)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn closed() -> LinkEvent {
        LinkEvent::Closed {
            code: Some(1006),
            reason: "abnormal".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager(&connector, ReconnectPolicy::default());

        manager.connect("tok").await.unwrap();
        manager.connect("tok").await.unwrap();

        assert_eq!(connector.opens(), 1);
        assert_eq!(connector.urls.lock().unwrap()[0], "ws://localhost:8080/chat?token=tok");
        assert!(manager.current_connection().is_some());
        assert_eq!(*manager.status().borrow(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_reach_single_consumer() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager(&connector, ReconnectPolicy::default());
        let mut events = manager.on_event().unwrap();
        assert_eq!(manager.on_event().unwrap_err(), SyncError::AlreadyRegistered);

        manager.connect("tok").await.unwrap();
        connector.push(0, LinkEvent::Text(r#"{"type":"connected"}"#.to_string()));

        assert_eq!(events.recv().await.unwrap(), r#"{"type":"connected"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_frames_reach_the_link() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager(&connector, ReconnectPolicy::default());
        assert_eq!(manager.send("early".to_string()), Err(SyncError::NotConnected));

        manager.connect("tok").await.unwrap();
        manager.send("hello".to_string()).unwrap();

        let mut servers = connector.servers.lock().unwrap();
        assert_eq!(servers[0].1.try_recv().unwrap(), OutboundFrame::Text("hello".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_fixed_delay() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager(&connector, ReconnectPolicy::Fixed(Duration::from_secs(2)));
        let status = manager.status();

        manager.connect("tok").await.unwrap();
        connector.push(0, closed());
        settle().await;

        assert!(manager.current_connection().is_none());
        assert_eq!(*status.borrow(), ConnectionStatus::Reconnecting { attempt: 1 });
        assert_eq!(connector.opens(), 1);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        settle().await;

        assert_eq!(connector.opens(), 2);
        assert!(manager.current_connection().is_some());
        assert_eq!(*status.borrow(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_during_delay_does_not_duplicate() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager(&connector, ReconnectPolicy::default());

        manager.connect("tok").await.unwrap();
        connector.push(0, closed());
        settle().await;

        manager.connect("tok").await.unwrap();
        assert_eq!(connector.opens(), 2);
        let live = manager.current_connection().unwrap().id();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.opens(), 2);
        assert_eq!(manager.current_connection().unwrap().id(), live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager(&connector, ReconnectPolicy::default());

        manager.connect("tok").await.unwrap();
        connector.push(0, closed());
        settle().await;
        manager.disconnect();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.opens(), 1);
        assert_eq!(*manager.status().borrow(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_link() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager(&connector, ReconnectPolicy::default());

        manager.connect("tok").await.unwrap();
        manager.disconnect();
        assert!(manager.current_connection().is_none());

        let mut servers = connector.servers.lock().unwrap();
        assert_eq!(servers[0].1.try_recv().unwrap(), OutboundFrame::Close);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_alone_does_not_reconnect() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager(&connector, ReconnectPolicy::default());

        manager.connect("tok").await.unwrap();
        connector.push(0, LinkEvent::Error("broken pipe".to_string()));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(connector.opens(), 1);
        assert!(manager.current_connection().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_is_retried() {
        let connector = Arc::new(FakeConnector::default());
        connector.fail.store(true, Ordering::SeqCst);
        let manager = manager(&connector, ReconnectPolicy::default());

        assert!(matches!(manager.connect("tok").await, Err(SyncError::Transport(_))));
        connector.fail.store(false, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(connector.opens(), 2);
        assert!(manager.current_connection().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_gives_up_and_goes_offline() {
        let connector = Arc::new(FakeConnector::default());
        connector.fail.store(true, Ordering::SeqCst);
        let policy = ReconnectPolicy::Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            max_attempts: Some(2),
        };
        let manager = manager(&connector, policy);

        assert!(manager.connect("tok").await.is_err());
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(connector.opens(), 3);
        assert_eq!(*manager.status().borrow(), ConnectionStatus::Offline);
    }

    #[test]
    fn test_policy_delays() {
        let fixed = ReconnectPolicy::Fixed(Duration::from_secs(2));
        assert_eq!(fixed.delay_for(1), Some(Duration::from_secs(2)));
        assert_eq!(fixed.delay_for(500), Some(Duration::from_secs(2)));

        let backoff = ReconnectPolicy::Backoff {
            base: Duration::from_millis(500),
            max: Duration::from_secs(4),
            max_attempts: Some(10),
        };
        for attempt in 1..=10 {
            let delay = backoff.delay_for(attempt).unwrap();
            assert!(delay <= Duration::from_secs(4));
        }
        assert_eq!(backoff.delay_for(11), None);
    }

    #[test]
    fn test_policy_from_config() {
        let config = Config::default();
        assert_eq!(
            ReconnectPolicy::from_config(&config.connection),
            ReconnectPolicy::Fixed(Duration::from_secs(2))
        );
    }
}
