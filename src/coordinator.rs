use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use crate::config::{ControllerSettings, EdgeKind, LineId};
use crate::error::AppError;
use crate::gpio::LineBackend;

pub type EdgeCallback = Arc<dyn Fn(EdgeKind) + Send + Sync>;

pub(crate) type Registry = FxHashMap<LineId, Registration>;

/// A callback armed on one line for one kind of edge.
#[derive(Clone)]
pub struct Registration {
    pub line_id: LineId,
    pub edge: EdgeKind,
    callback: EdgeCallback,
    in_flight: Arc<AtomicBool>,
}

impl Registration {
    pub fn new(line_id: LineId, edge: EdgeKind, callback: EdgeCallback) -> Self {
        Self {
            line_id,
            edge,
            callback,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs the callback on the blocking pool without waiting for it.
    ///
    /// At most one invocation per registration is in flight; edges detected while the
    /// previous callback still runs are dropped.
    fn dispatch(&self) {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!(
                "dropping edge on line {}: previous callback still running",
                self.line_id
            );
            return;
        }

        let callback = Arc::clone(&self.callback);
        let guard = InFlight(Arc::clone(&self.in_flight));
        let edge = self.edge;
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            callback(edge);
        });
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("line_id", &self.line_id)
            .field("edge", &self.edge)
            .finish_non_exhaustive()
    }
}

// cleared on drop so a panicking callback does not wedge its line
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Register(Registration),
    Remove(LineId),
    SetInterval(Duration),
    Stop,
}

/// Sending half of the poller's command queue.
///
/// Sends wait at most `timeout` for room in the queue, so a poller that stopped
/// reading surfaces as [`AppError::MailboxClosed`] instead of a hung caller.
pub(crate) struct Mailbox {
    tx: mpsc::Sender<Command>,
    timeout: Duration,
}

impl Mailbox {
    pub(crate) fn new(tx: mpsc::Sender<Command>, timeout: Duration) -> Self {
        Self { tx, timeout }
    }

    pub(crate) async fn post(&self, command: Command) -> Result<(), AppError> {
        self.tx
            .send_timeout(command, self.timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => AppError::MailboxClosed(format!(
                    "no room in poller queue after {}ms",
                    self.timeout.as_millis()
                )),
                SendTimeoutError::Closed(_) => AppError::MailboxClosed("poller has exited".into()),
            })
    }
}

/// Sole owner of the live registry. Samples every registered line on each tick.
pub struct PollingCoordinator<B: LineBackend + ?Sized> {
    backend: Arc<B>,
    interval: Duration,
    registry: Registry,
    inbox: mpsc::Receiver<Command>,
}

impl<B: LineBackend + ?Sized + 'static> PollingCoordinator<B> {
    /// Spawns the poll loop. The join handle yields the registry once the loop exits.
    pub(crate) fn spawn(
        backend: Arc<B>,
        settings: ControllerSettings,
        registry: Registry,
    ) -> (Mailbox, JoinHandle<Registry>) {
        let (tx, inbox) = mpsc::channel(settings.mailbox_capacity.max(1));
        let coordinator = Self {
            backend,
            interval: settings.poll_interval,
            registry,
            inbox,
        };
        let task = tokio::spawn(coordinator.run());

        (Mailbox::new(tx, settings.mailbox_timeout), task)
    }

    async fn run(mut self) -> Registry {
        info!(
            "Starting edge poller with {}ms interval and {} registered lines",
            self.interval.as_millis(),
            self.registry.len()
        );
        let mut ticker = poll_ticker(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sample(),
                command = self.inbox.recv() => match command {
                    Some(Command::Register(registration)) => {
                        debug!(
                            "polling line {} for {:?} edges",
                            registration.line_id, registration.edge
                        );
                        self.registry.insert(registration.line_id, registration);
                    }
                    Some(Command::Remove(line_id)) => {
                        if self.registry.remove(&line_id).is_some() {
                            debug!("stopped polling line {line_id}");
                        }
                    }
                    Some(Command::SetInterval(interval)) => {
                        info!("Updating poll interval to {}ms", interval.as_millis());
                        self.interval = interval;
                        ticker = poll_ticker(interval);
                    }
                    Some(Command::Stop) | None => break,
                },
            }
        }

        info!("Edge poller stopped");
        self.registry
    }

    fn sample(&self) {
        for (line_id, registration) in &self.registry {
            match self.backend.poll_edge_detected(*line_id) {
                Ok(true) => registration.dispatch(),
                Ok(false) => {}
                Err(e) => warn!("edge sample failed for line {line_id}: {e}"),
            }
        }
    }
}

// first tick one full period from now
fn poll_ticker(period: Duration) -> Interval {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockGpioBackend;

    fn settings(poll_interval: Duration) -> ControllerSettings {
        ControllerSettings {
            poll_interval,
            ..ControllerSettings::default()
        }
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn noop() -> EdgeCallback {
        Arc::new(|_| {})
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_sample_every_registered_line() {
        let backend = Arc::new(MockGpioBackend::default());
        backend.open().unwrap();
        let (mailbox, task) = PollingCoordinator::spawn(
            backend.clone(),
            settings(Duration::from_millis(50)),
            Registry::default(),
        );

        mailbox
            .post(Command::Register(Registration::new(1, EdgeKind::Rising, noop())))
            .await
            .unwrap();
        mailbox
            .post(Command::Register(Registration::new(2, EdgeKind::Both, noop())))
            .await
            .unwrap();
        settle().await;
        assert_eq!(backend.samples(), 0);

        time::advance(Duration::from_millis(50)).await;
        settle().await;
        assert_eq!(backend.samples(), 2);

        mailbox.post(Command::Remove(1)).await.unwrap();
        mailbox.post(Command::Remove(42)).await.unwrap();
        settle().await;
        time::advance(Duration::from_millis(50)).await;
        settle().await;
        assert_eq!(backend.samples(), 3);

        mailbox.post(Command::Stop).await.unwrap();
        let registry = task.await.unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains_key(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_change_reschedules_from_the_reset() {
        let backend = Arc::new(MockGpioBackend::default());
        backend.open().unwrap();
        let mut registry = Registry::default();
        registry.insert(5, Registration::new(5, EdgeKind::Falling, noop()));
        let (mailbox, task) = PollingCoordinator::spawn(
            backend.clone(),
            settings(Duration::from_millis(20)),
            registry,
        );
        settle().await;

        time::advance(Duration::from_millis(15)).await;
        mailbox
            .post(Command::SetInterval(Duration::from_millis(400)))
            .await
            .unwrap();
        settle().await;

        time::advance(Duration::from_millis(399)).await;
        settle().await;
        assert_eq!(backend.samples(), 0);

        time::advance(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(backend.samples(), 1);

        mailbox.post(Command::Stop).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_mailbox_ends_the_loop() {
        let backend = Arc::new(MockGpioBackend::default());
        let (mailbox, task) = PollingCoordinator::spawn(
            backend,
            settings(Duration::from_millis(10)),
            Registry::default(),
        );

        drop(mailbox);
        let registry = task.await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn sampling_failure_counts_as_no_edge() {
        let backend = Arc::new(MockGpioBackend::default());
        backend.open().unwrap();
        backend.set_edge_mode(3, EdgeKind::Rising).unwrap();
        backend.set_fail_sampling(true);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: EdgeCallback = Arc::new(move |edge| {
            let _ = tx.send(edge);
        });
        let (mailbox, task) = PollingCoordinator::spawn(
            backend.clone(),
            settings(Duration::from_millis(5)),
            Registry::default(),
        );
        mailbox
            .post(Command::Register(Registration::new(3, EdgeKind::Rising, callback)))
            .await
            .unwrap();

        backend.inject_edge(3, EdgeKind::Rising);
        time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        backend.set_fail_sampling(false);
        let edge = time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(edge, Some(EdgeKind::Rising));

        mailbox.post(Command::Stop).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn busy_callback_drops_further_edges() {
        let backend = Arc::new(MockGpioBackend::default());
        backend.open().unwrap();
        backend.set_edge_mode(9, EdgeKind::Both).unwrap();

        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = parking_lot::Mutex::new(release_rx);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: EdgeCallback = Arc::new(move |edge| {
            let _ = tx.send(edge);
            let _ = release_rx.lock().recv_timeout(Duration::from_secs(2));
        });

        let (mailbox, task) = PollingCoordinator::spawn(
            backend.clone(),
            settings(Duration::from_millis(5)),
            Registry::default(),
        );
        mailbox
            .post(Command::Register(Registration::new(9, EdgeKind::Both, callback)))
            .await
            .unwrap();

        backend.inject_edge(9, EdgeKind::Rising);
        let edge = time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(edge, Some(EdgeKind::Both));

        // consumed by the poller while the first callback is still blocked
        backend.inject_edge(9, EdgeKind::Falling);
        time::sleep(Duration::from_millis(50)).await;
        assert!(!backend.is_latched(9));
        release_tx.send(()).unwrap();
        time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        mailbox.post(Command::Stop).await.unwrap();
        task.await.unwrap();
    }
}
