use crate::client::history::History;
use crate::client::normalize::normalize;
use crate::client::{ClientError, Transport};
use crate::snapshot::{HistoryPoint, Snapshot};
use chrono::Utc;
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Open,
}

/// What a dashboard should render.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewState {
    /// No data yet and no error.
    Loading,
    Live(Arc<Snapshot>),
    /// Last known data is still shown next to the error.
    Degraded {
        snapshot: Arc<Snapshot>,
        error: String,
    },
    /// An error before any data ever arrived.
    Failed { error: String },
}

impl ViewState {
    fn from_parts(latest: Option<Arc<Snapshot>>, error: Option<String>) -> Self {
        match (latest, error) {
            (None, None) => Self::Loading,
            (Some(snapshot), None) => Self::Live(snapshot),
            (Some(snapshot), Some(error)) => Self::Degraded { snapshot, error },
            (None, Some(error)) => Self::Failed { error },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            multiplier: 1.0,
        }
    }
}

impl ReconnectPolicy {
    /// Clamped to `max_delay`, and never below `initial_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms)
            .min(self.max_delay)
            .max(self.initial_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub streaming: bool,
    /// `None` disables the timer-driven pull loop.
    pub poll_interval: Option<Duration>,
    pub reconnect: ReconnectPolicy,
    pub history_len: usize,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            streaming: true,
            poll_interval: None,
            reconnect: ReconnectPolicy::default(),
            history_len: 30,
        }
    }
}

struct Shared {
    latest: Option<Arc<Snapshot>>,
    history: History,
    error: Option<String>,
    link: LinkState,
}

struct Inner {
    transport: Arc<dyn Transport>,
    shared: Mutex<Shared>,
    view: watch::Sender<ViewState>,
    reconnect: ReconnectPolicy,
    root: CancellationToken,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, shared: &Shared) {
        self.view.send_replace(ViewState::from_parts(
            shared.latest.clone(),
            shared.error.clone(),
        ));
    }

    /// Every mutation checks `token` under the state lock, so work started by
    /// a stopped task can never land after the stop.
    fn accept(&self, token: &CancellationToken, raw: &str) -> bool {
        let snapshot = match normalize(raw, Utc::now()) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.record_error(token, ClientError::from(err).to_string());
                return false;
            }
        };

        let mut shared = self.lock();
        if token.is_cancelled() {
            return false;
        }
        if shared.latest.as_deref() == Some(&snapshot) {
            if shared.error.take().is_some() {
                self.publish(&shared);
            }
            return false;
        }
        shared.history.push(HistoryPoint::from_snapshot(&snapshot));
        shared.latest = Some(Arc::new(snapshot));
        shared.error = None;
        self.publish(&shared);
        true
    }

    fn record_error(&self, token: &CancellationToken, error: String) {
        let mut shared = self.lock();
        if token.is_cancelled() {
            return;
        }
        warn!(error = %error, "ошибка получения данных мониторинга");
        shared.error = Some(error);
        self.publish(&shared);
    }

    fn set_link(&self, token: &CancellationToken, link: LinkState) {
        let mut shared = self.lock();
        if token.is_cancelled() {
            return;
        }
        shared.link = link;
        if link == LinkState::Open && shared.error.take().is_some() {
            self.publish(&shared);
        }
    }
}

struct TaskSlot {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Keeps a live snapshot view and a bounded history fed by a push stream,
/// a pull timer, or both.
pub struct StreamConsumer {
    inner: Arc<Inner>,
    options: ConsumerOptions,
    stream_task: tokio::sync::Mutex<Option<TaskSlot>>,
    poll_task: tokio::sync::Mutex<Option<(Duration, TaskSlot)>>,
}

impl StreamConsumer {
    pub fn new(transport: Arc<dyn Transport>, options: ConsumerOptions) -> Self {
        let (view, _) = watch::channel(ViewState::Loading);
        let inner = Arc::new(Inner {
            transport,
            shared: Mutex::new(Shared {
                latest: None,
                history: History::new(options.history_len),
                error: None,
                link: LinkState::Disconnected,
            }),
            view,
            reconnect: options.reconnect.clone(),
            root: CancellationToken::new(),
        });
        Self {
            inner,
            options,
            stream_task: tokio::sync::Mutex::new(None),
            poll_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Starts the loops enabled in the options.
    pub async fn start(&self) {
        if self.options.streaming {
            self.set_streaming(true).await;
        }
        if self.options.poll_interval.is_some() {
            self.set_polling(self.options.poll_interval).await;
        }
    }

    pub async fn set_streaming(&self, enabled: bool) {
        let mut slot = self.stream_task.lock().await;
        match (enabled, slot.is_some()) {
            (true, false) => {
                let token = self.inner.root.child_token();
                let handle = tokio::spawn(run_stream(self.inner.clone(), token.clone()));
                *slot = Some(TaskSlot { token, handle });
                info!("потоковое получение данных включено");
            }
            (false, true) => {
                if let Some(task) = slot.take() {
                    self.stop(task, true).await;
                }
                info!("потоковое получение данных выключено");
            }
            _ => {}
        }
    }

    /// `Some(interval)` (re)starts the pull loop, `None` stops it.
    pub async fn set_polling(&self, interval: Option<Duration>) {
        let mut slot = self.poll_task.lock().await;
        if slot.as_ref().map(|(current, _)| *current) == interval {
            return;
        }
        if let Some((_, task)) = slot.take() {
            self.stop(task, false).await;
        }
        if let Some(interval) = interval.filter(|i| !i.is_zero()) {
            let token = self.inner.root.child_token();
            let handle = tokio::spawn(run_poll(self.inner.clone(), token.clone(), interval));
            *slot = Some((interval, TaskSlot { token, handle }));
            info!(interval_secs = interval.as_secs_f64(), "периодический опрос включён");
        }
    }

    async fn stop(&self, task: TaskSlot, owns_link: bool) {
        {
            let mut shared = self.inner.lock();
            task.token.cancel();
            if owns_link {
                shared.link = LinkState::Disconnected;
            }
        }
        let _ = task.handle.await;
    }

    /// One-shot pull, independent of the stream and poll loops.
    pub async fn refresh(&self) -> Result<bool, ClientError> {
        let root = &self.inner.root;
        match self.inner.transport.fetch().await {
            Ok(raw) => Ok(self.inner.accept(root, &raw)),
            Err(err) => {
                self.inner.record_error(root, err.to_string());
                Err(err)
            }
        }
    }

    pub fn view(&self) -> ViewState {
        self.inner.view.borrow().clone()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<ViewState> {
        self.inner.view.subscribe()
    }

    pub fn history(&self) -> Vec<HistoryPoint> {
        self.inner.lock().history.to_vec()
    }

    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.inner.lock().latest.clone()
    }

    pub fn link_state(&self) -> LinkState {
        self.inner.lock().link
    }

    pub async fn shutdown(&self) {
        self.set_streaming(false).await;
        self.set_polling(None).await;
        self.inner.root.cancel();
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        self.inner.root.cancel();
    }
}

async fn run_stream(inner: Arc<Inner>, token: CancellationToken) {
    let mut delay = inner.reconnect.initial_delay;

    loop {
        inner.set_link(&token, LinkState::Connecting);
        let subscribed = tokio::select! {
            _ = token.cancelled() => return,
            result = inner.transport.subscribe() => result,
        };

        match subscribed {
            Ok(mut messages) => {
                inner.set_link(&token, LinkState::Open);
                delay = inner.reconnect.initial_delay;
                debug!("поток снимков открыт");
                let reason = loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        next = messages.next() => match next {
                            Some(Ok(raw)) => {
                                inner.accept(&token, &raw);
                            }
                            Some(Err(err)) => break err.to_string(),
                            None => break ClientError::Closed.to_string(),
                        },
                    }
                };
                inner.record_error(&token, reason);
            }
            Err(err) => inner.record_error(&token, err.to_string()),
        }

        inner.set_link(&token, LinkState::Disconnected);
        debug!(delay_ms = delay.as_millis() as u64, "переподключение запланировано");
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = inner.reconnect.next_delay(delay);
    }
}

async fn run_poll(inner: Arc<Inner>, token: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let fetched = tokio::select! {
            _ = token.cancelled() => return,
            result = inner.transport.fetch() => result,
        };
        match fetched {
            Ok(raw) => {
                inner.accept(&token, &raw);
            }
            Err(err) => inner.record_error(&token, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MessageStream;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use futures::channel::mpsc::{unbounded, UnboundedSender};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Session = UnboundedSender<Result<String, ClientError>>;

    #[derive(Default)]
    struct FakeTransport {
        subscribes: AtomicUsize,
        fetches: AtomicUsize,
        sessions: Mutex<VecDeque<MessageStream>>,
        pulls: Mutex<VecDeque<Result<String, ClientError>>>,
    }

    impl FakeTransport {
        fn open_session(&self) -> Session {
            let (tx, rx) = unbounded();
            self.sessions.lock().unwrap().push_back(rx.boxed());
            tx
        }

        fn queue_pull(&self, result: Result<String, ClientError>) {
            self.pulls.lock().unwrap().push_back(result);
        }

        fn subscribes(&self) -> usize {
            self.subscribes.load(Ordering::SeqCst)
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn fetch(&self) -> Result<String, ClientError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.pulls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ClientError::Status { status: 503 }))
        }

        async fn subscribe(&self) -> Result<MessageStream, ClientError> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            self.sessions
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(ClientError::Status { status: 503 })
        }
    }

    fn payload(cpu: f64) -> String {
        let mut snap =
            Snapshot::empty(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        snap.cpu.usage = cpu;
        serde_json::to_string(&snap).unwrap()
    }

    fn consumer(
        transport: &Arc<FakeTransport>,
        streaming: bool,
        poll_interval: Option<Duration>,
        history_len: usize,
    ) -> StreamConsumer {
        StreamConsumer::new(
            transport.clone(),
            ConsumerOptions {
                streaming,
                poll_interval,
                history_len,
                ..ConsumerOptions::default()
            },
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_schedules_exactly_one_reconnect() {
        let transport = Arc::new(FakeTransport::default());
        let first = transport.open_session();
        let _second = transport.open_session();
        let c = consumer(&transport, true, None, 30);

        c.start().await;
        settle().await;
        assert_eq!(transport.subscribes(), 1);
        assert_eq!(c.link_state(), LinkState::Open);

        first.unbounded_send(Ok(payload(10.0))).unwrap();
        drop(first);
        settle().await;
        assert_eq!(c.link_state(), LinkState::Disconnected);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(transport.subscribes(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.subscribes(), 2);
        assert_eq!(c.link_state(), LinkState::Open);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.subscribes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connects_retry_at_the_reconnect_delay() {
        let transport = Arc::new(FakeTransport::default());
        let c = consumer(&transport, true, None, 30);

        c.start().await;
        settle().await;
        assert_eq!(transport.subscribes(), 1);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(transport.subscribes(), 3);
        assert!(matches!(c.view(), ViewState::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_stream_cancels_pending_reconnect() {
        let transport = Arc::new(FakeTransport::default());
        drop(transport.open_session());
        let c = consumer(&transport, true, None, 30);

        c.start().await;
        settle().await;
        assert_eq!(transport.subscribes(), 1);

        c.set_streaming(false).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.subscribes(), 1);
        assert_eq!(c.link_state(), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicates_do_not_touch_history() {
        let transport = Arc::new(FakeTransport::default());
        let session = transport.open_session();
        let c = consumer(&transport, true, None, 30);
        let mut views = c.subscribe_view();

        c.start().await;
        settle().await;
        for cpu in [5.0, 5.0, 5.0, 7.0] {
            session.unbounded_send(Ok(payload(cpu))).unwrap();
        }
        settle().await;

        let cpu: Vec<f64> = c.history().iter().map(|p| p.cpu).collect();
        assert_eq!(cpu, vec![5.0, 7.0]);
        assert!(views.has_changed().unwrap());
        let latest = views.borrow_and_update().clone();
        assert!(matches!(latest, ViewState::Live(ref s) if s.cpu.usage == 7.0));
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_capped() {
        let transport = Arc::new(FakeTransport::default());
        let session = transport.open_session();
        let c = consumer(&transport, true, None, 3);

        c.start().await;
        settle().await;
        for cpu in 1..=5 {
            session.unbounded_send(Ok(payload(cpu as f64))).unwrap();
        }
        settle().await;

        let cpu: Vec<f64> = c.history().iter().map(|p| p.cpu).collect();
        assert_eq!(cpu, vec![3.0, 4.0, 5.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn view_moves_from_loading_to_live_to_degraded() {
        let transport = Arc::new(FakeTransport::default());
        let session = transport.open_session();
        let c = consumer(&transport, true, None, 30);
        assert_eq!(c.view(), ViewState::Loading);

        c.start().await;
        settle().await;
        assert_eq!(c.view(), ViewState::Loading);

        session.unbounded_send(Ok(payload(20.0))).unwrap();
        settle().await;
        assert!(matches!(c.view(), ViewState::Live(_)));

        session
            .unbounded_send(Err(ClientError::Status { status: 502 }))
            .unwrap();
        settle().await;
        match c.view() {
            ViewState::Degraded { snapshot, error } => {
                assert_eq!(snapshot.cpu.usage, 20.0);
                assert!(error.contains("502"));
            }
            other => panic!("unexpected view {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_message_is_reported_and_stream_continues() {
        let transport = Arc::new(FakeTransport::default());
        let session = transport.open_session();
        let c = consumer(&transport, true, None, 30);

        c.start().await;
        settle().await;
        session.unbounded_send(Ok("not json".to_string())).unwrap();
        settle().await;
        assert!(matches!(c.view(), ViewState::Failed { .. }));

        session.unbounded_send(Ok(payload(3.0))).unwrap();
        settle().await;
        assert!(matches!(c.view(), ViewState::Live(_)));
        assert_eq!(transport.subscribes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_refresh_pulls_once() {
        let transport = Arc::new(FakeTransport::default());
        transport.queue_pull(Ok(payload(33.0)));
        let c = consumer(&transport, false, None, 30);

        c.start().await;
        assert!(c.refresh().await.unwrap());
        assert_eq!(transport.fetches(), 1);
        assert_eq!(transport.subscribes(), 0);
        assert_eq!(c.latest().unwrap().cpu.usage, 33.0);

        assert!(c.refresh().await.is_err());
        assert!(matches!(c.view(), ViewState::Degraded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_can_be_toggled() {
        let transport = Arc::new(FakeTransport::default());
        for cpu in 1..=10 {
            transport.queue_pull(Ok(payload(cpu as f64)));
        }
        let c = consumer(&transport, false, Some(Duration::from_secs(2)), 30);

        c.start().await;
        settle().await;
        assert_eq!(transport.fetches(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(transport.fetches(), 3);
        assert_eq!(c.history().len(), 3);

        c.set_polling(None).await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(transport.fetches(), 3);
    }

    #[test]
    fn stopped_task_cannot_mutate_state() {
        let (view, _) = watch::channel(ViewState::Loading);
        let inner = Inner {
            transport: Arc::new(FakeTransport::default()),
            shared: Mutex::new(Shared {
                latest: None,
                history: History::new(30),
                error: None,
                link: LinkState::Disconnected,
            }),
            view,
            reconnect: ReconnectPolicy::default(),
            root: CancellationToken::new(),
        };
        let token = inner.root.child_token();
        token.cancel();

        assert!(!inner.accept(&token, &payload(1.0)));
        inner.record_error(&token, "late".to_string());
        inner.set_link(&token, LinkState::Open);

        let shared = inner.lock();
        assert!(shared.latest.is_none());
        assert!(shared.error.is_none());
        assert!(shared.history.is_empty());
        assert_eq!(shared.link, LinkState::Disconnected);
    }

    #[test]
    fn reconnect_policy_backs_off_and_clamps() {
        let fixed = ReconnectPolicy::default();
        assert_eq!(fixed.next_delay(Duration::from_secs(5)), Duration::from_secs(5));

        let backoff = ReconnectPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        };
        assert_eq!(backoff.next_delay(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(Duration::from_secs(8)), Duration::from_secs(10));
    }
}
