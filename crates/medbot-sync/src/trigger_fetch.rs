//! Trigger-fetch coordinator.
//!
//! Some telemetry is too large to stream. The backend pushes a cheap
//! `{"payload": true}` frame whenever it changes, and the coordinator pulls
//! the full snapshot from a request/response endpoint on every such signal.
//!
//! The phase cycles `Loading → Ready → Loading → …`. A failed pull records
//! `last_error` and keeps the previous snapshot.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use medbot_types::{Envelope, SyncError, SyncPayload};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::bus::EventBus;
use crate::transport::{ChannelHandler, TransportChannel};

const SOURCE: &str = "medbot-sync::trigger_fetch";

/// Pulls the current snapshot from wherever it lives.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync + 'static {
    type Snapshot: Clone + Serialize + Send + Sync + 'static;

    async fn fetch(&self) -> Result<Self::Snapshot, SyncError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// HttpFetcher
// ─────────────────────────────────────────────────────────────────────────────

/// `GET`s a JSON document and decodes it into `T`.
pub struct HttpFetcher<T> {
    url: String,
    client: reqwest::Client,
    _snapshot: PhantomData<fn() -> T>,
}

impl<T> HttpFetcher<T> {
    /// # Errors
    ///
    /// Returns [`SyncError::Fetch`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Fetch(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
            _snapshot: PhantomData,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl<T> SnapshotFetcher for HttpFetcher<T>
where
    T: DeserializeOwned + Clone + Serialize + Send + Sync + 'static,
{
    type Snapshot = T;

    async fn fetch(&self) -> Result<T, SyncError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| SyncError::Fetch(format!("GET {}: {e}", self.url)))?;

        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::Fetch(format!("decoding {}: {e}", self.url)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    Loading,
    Ready,
}

/// What a view of the snapshot sees.
#[derive(Debug, Clone)]
pub struct TriggerState<T> {
    pub phase: FetchPhase,
    /// Last successfully fetched snapshot.
    pub data: Option<T>,
    /// Error of the most recent fetch, cleared by the next success.
    pub last_error: Option<String>,
    /// Completed fetches, successful or not.
    pub fetch_count: u64,
}

impl<T> Default for TriggerState<T> {
    fn default() -> Self {
        Self {
            phase: FetchPhase::Loading,
            data: None,
            last_error: None,
            fetch_count: 0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────────────────

/// Forwards `Trigger` envelopes to the fetch worker and ignores the rest.
struct TriggerForwarder {
    triggers: mpsc::UnboundedSender<()>,
}

impl ChannelHandler for TriggerForwarder {
    fn on_envelope(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Trigger => {
                let _ = self.triggers.send(());
            }
            other => debug!(envelope = ?other, "ignoring non-trigger envelope"),
        }
    }
}

pub struct TriggerFetchCoordinator<T> {
    channel: TransportChannel,
    state: watch::Receiver<TriggerState<T>>,
    worker: Option<JoinHandle<()>>,
}

impl<T> TriggerFetchCoordinator<T>
where
    T: Clone + Serialize + Send + Sync + 'static,
{
    /// Seed the snapshot with one fetch and refetch on every trigger that
    /// arrives on `channel`.
    pub fn start<F>(channel: TransportChannel, fetcher: F) -> Self
    where
        F: SnapshotFetcher<Snapshot = T>,
    {
        Self::start_with_bus(channel, fetcher, None)
    }

    /// Like [`start`](Self::start), also publishing every fresh snapshot on
    /// the telemetry topic and every failure on the errors topic.
    pub fn start_with_bus<F>(
        mut channel: TransportChannel,
        fetcher: F,
        bus: Option<Arc<EventBus>>,
    ) -> Self
    where
        F: SnapshotFetcher<Snapshot = T>,
    {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(TriggerState::default());

        let worker = spawn_worker(fetcher, trigger_rx, state_tx, bus);
        channel.open(TriggerForwarder { triggers: trigger_tx });
        info!(endpoint = channel.endpoint(), "trigger-fetch coordinator started");

        Self {
            channel,
            state,
            worker: Some(worker),
        }
    }

    pub fn state(&self) -> TriggerState<T> {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TriggerState<T>> {
        self.state.clone()
    }

    /// Close the trigger channel and stop fetching.
    pub async fn stop(&mut self) {
        self.channel.close().await;
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        info!(endpoint = self.channel.endpoint(), "trigger-fetch coordinator stopped");
    }
}

impl<T> Drop for TriggerFetchCoordinator<T> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

/// One initial fetch, then one fetch per trigger, strictly in order.
fn spawn_worker<F: SnapshotFetcher>(
    fetcher: F,
    mut triggers: mpsc::UnboundedReceiver<()>,
    state_tx: watch::Sender<TriggerState<F::Snapshot>>,
    bus: Option<Arc<EventBus>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        refresh(&fetcher, &state_tx, bus.as_deref()).await;
        while triggers.recv().await.is_some() {
            debug!("trigger received; refreshing snapshot");
            refresh(&fetcher, &state_tx, bus.as_deref()).await;
        }
    })
}

#[instrument(name = "snapshot_refresh", skip_all)]
async fn refresh<F: SnapshotFetcher>(
    fetcher: &F,
    state_tx: &watch::Sender<TriggerState<F::Snapshot>>,
    bus: Option<&EventBus>,
) {
    state_tx.send_modify(|state| state.phase = FetchPhase::Loading);

    match fetcher.fetch().await {
        Ok(snapshot) => {
            if let Some(bus) = bus {
                match serde_json::to_value(&snapshot) {
                    Ok(value) => bus.emit(SOURCE, SyncPayload::Telemetry(value)),
                    Err(e) => warn!(error = %e, "snapshot is not representable as JSON"),
                }
            }
            state_tx.send_modify(|state| {
                state.phase = FetchPhase::Ready;
                state.data = Some(snapshot);
                state.last_error = None;
                state.fetch_count += 1;
            });
        }
        Err(e) => {
            warn!(error = %e, "snapshot fetch failed; keeping previous data");
            if let Some(bus) = bus {
                bus.emit(SOURCE, SyncPayload::Error(e.to_string()));
            }
            state_tx.send_modify(|state| {
                state.phase = FetchPhase::Ready;
                state.last_error = Some(e.to_string());
                state.fetch_count += 1;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Topic;
    use crate::reconnect::ReconnectPolicy;
    use futures_util::{SinkExt, StreamExt};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Replays scripted results; fails once the script runs out.
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<u32, SyncError>>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<u32, SyncError>>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let fetcher = Self {
                script: Mutex::new(script.into()),
                calls: Arc::clone(&calls),
            };
            (fetcher, calls)
        }
    }

    #[async_trait]
    impl SnapshotFetcher for ScriptedFetcher {
        type Snapshot = u32;

        async fn fetch(&self) -> Result<u32, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SyncError::Fetch("script exhausted".into())))
        }
    }

    async fn wait_for_count(rx: &mut watch::Receiver<TriggerState<u32>>, count: u64) -> TriggerState<u32> {
        tokio::time::timeout(TEST_TIMEOUT, rx.wait_for(|s| s.fetch_count >= count))
            .await
            .expect("fetch timed out")
            .expect("state channel closed")
            .clone()
    }

    #[test]
    fn state_starts_loading_and_empty() {
        let state = TriggerState::<u32>::default();
        assert_eq!(state.phase, FetchPhase::Loading);
        assert!(state.data.is_none());
        assert_eq!(state.fetch_count, 0);
    }

    #[tokio::test]
    async fn initial_fetch_seeds_state() {
        let (fetcher, calls) = ScriptedFetcher::new(vec![Ok(7)]);
        let (_trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (state_tx, mut state_rx) = watch::channel(TriggerState::default());

        let worker = spawn_worker(fetcher, trigger_rx, state_tx, None);
        let state = wait_for_count(&mut state_rx, 1).await;

        assert_eq!(state.phase, FetchPhase::Ready);
        assert_eq!(state.data, Some(7));
        assert!(state.last_error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        worker.abort();
    }

    #[tokio::test]
    async fn each_trigger_refetches_once() {
        let (fetcher, calls) = ScriptedFetcher::new(vec![Ok(1), Ok(2), Ok(3)]);
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (state_tx, mut state_rx) = watch::channel(TriggerState::default());

        let worker = spawn_worker(fetcher, trigger_rx, state_tx, None);
        trigger_tx.send(()).unwrap();
        trigger_tx.send(()).unwrap();

        let state = wait_for_count(&mut state_rx, 3).await;
        assert_eq!(state.data, Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        worker.abort();
    }

    #[tokio::test]
    async fn failed_fetch_keeps_previous_data() {
        let (fetcher, _calls) =
            ScriptedFetcher::new(vec![Ok(42), Err(SyncError::Fetch("backend 503".into()))]);
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (state_tx, mut state_rx) = watch::channel(TriggerState::default());

        let worker = spawn_worker(fetcher, trigger_rx, state_tx, None);
        wait_for_count(&mut state_rx, 1).await;

        trigger_tx.send(()).unwrap();
        let state = wait_for_count(&mut state_rx, 2).await;

        assert_eq!(state.data, Some(42), "stale data must survive a failed fetch");
        assert!(state.last_error.as_deref().unwrap().contains("backend 503"));
        assert_eq!(state.phase, FetchPhase::Ready);
        worker.abort();
    }

    #[tokio::test]
    async fn success_after_failure_clears_error() {
        let (fetcher, _calls) =
            ScriptedFetcher::new(vec![Err(SyncError::Fetch("down".into())), Ok(5)]);
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (state_tx, mut state_rx) = watch::channel(TriggerState::default());

        let worker = spawn_worker(fetcher, trigger_rx, state_tx, None);
        let state = wait_for_count(&mut state_rx, 1).await;
        assert!(state.data.is_none());
        assert!(state.last_error.is_some());

        trigger_tx.send(()).unwrap();
        let state = wait_for_count(&mut state_rx, 2).await;
        assert_eq!(state.data, Some(5));
        assert!(state.last_error.is_none());
        worker.abort();
    }

    #[tokio::test]
    async fn fresh_snapshots_are_published_on_the_bus() {
        let bus = Arc::new(EventBus::default());
        let mut telemetry = bus.subscribe_to(Topic::Telemetry);

        let (fetcher, _calls) = ScriptedFetcher::new(vec![Ok(11)]);
        let (_trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (state_tx, _state_rx) = watch::channel(TriggerState::default());
        let worker = spawn_worker(fetcher, trigger_rx, state_tx, Some(Arc::clone(&bus)));

        let event = tokio::time::timeout(TEST_TIMEOUT, telemetry.recv()).await.unwrap().unwrap();
        match event.payload {
            SyncPayload::Telemetry(value) => assert_eq!(value, serde_json::json!(11)),
            other => panic!("expected telemetry, got {other:?}"),
        }
        worker.abort();
    }

    #[tokio::test]
    async fn trigger_frames_on_the_channel_cause_refetch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"{"Type":"connection_established"}"#.into()))
                .await
                .unwrap();
            ws.send(Message::Text(r#"{"joints":{"elbow":1}}"#.into())).await.unwrap();
            ws.send(Message::Text(r#"{"payload":true}"#.into())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let channel = TransportChannel::new(url, ReconnectPolicy::new(Duration::from_millis(10), 3));
        let (fetcher, calls) = ScriptedFetcher::new(vec![Ok(1), Ok(2)]);
        let mut coordinator = TriggerFetchCoordinator::start(channel, fetcher);

        let mut state = coordinator.watch();
        let seen = wait_for_count(&mut state, 2).await;
        assert_eq!(seen.data, Some(2));

        // Only the trigger frame counts; handshake and data frames do not.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        coordinator.stop().await;
        let _ = tokio::time::timeout(TEST_TIMEOUT, server).await;
    }

    #[test]
    fn http_fetcher_reports_its_snapshot_url() {
        let fetcher = HttpFetcher::<serde_json::Value>::new(
            "http://robot.local/api/telemetry",
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(fetcher.url(), "http://robot.local/api/telemetry");
    }
}
