use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashSet;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::{ControllerSettings, EdgeKind, LineId};
use crate::coordinator::{Command, Mailbox, PollingCoordinator, Registration, Registry};
use crate::error::AppError;
use crate::gpio::LineBackend;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    pub open: bool,
    pub polling: bool,
    pub interval_ms: u64,
    pub lines: Vec<LineId>,
}

struct PollingSession {
    mailbox: Mailbox,
    task: JoinHandle<Registry>,
}

/// Lifecycle façade over a GPIO device and its edge poller.
///
/// Open and polling are independent flags moving Start → Poll → StopPolling → Stop;
/// each transition is a no-op when already in the target state. The controller keeps
/// its own set of registered lines so precondition checks never wait on the poller.
///
/// Device open/close failures panic: the hardware state afterwards is undefined and
/// cannot be retried in-process.
pub struct Controller<B: LineBackend + ?Sized> {
    backend: Arc<B>,
    settings: ControllerSettings,
    open: bool,
    polling: bool,
    registered_lines: FxHashSet<LineId>,
    session: Option<PollingSession>,
    // registrations held between polling sessions
    parked: Registry,
}

impl<B: LineBackend + ?Sized + 'static> Controller<B> {
    pub fn new(backend: Arc<B>, settings: ControllerSettings) -> Self {
        Self {
            backend,
            settings,
            open: false,
            polling: false,
            registered_lines: FxHashSet::default(),
            session: None,
            parked: Registry::default(),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn is_registered(&self, line_id: LineId) -> bool {
        self.registered_lines.contains(&line_id)
    }

    pub fn poll_interval(&self) -> Duration {
        self.settings.poll_interval
    }

    pub fn status(&self) -> ControllerStatus {
        let mut lines: Vec<LineId> = self.registered_lines.iter().copied().collect();
        lines.sort_unstable();

        ControllerStatus {
            open: self.open,
            polling: self.polling,
            interval_ms: self.settings.poll_interval.as_millis() as u64,
            lines,
        }
    }

    /// Opens the GPIO device.
    ///
    /// # Panics
    ///
    /// If the backend fails to open the device.
    pub fn start(&mut self) {
        if self.open {
            return;
        }

        if let Err(e) = self.backend.open() {
            panic!("unable to open GPIO: {e}");
        }

        info!("GPIO opened");
        self.open = true;
    }

    /// Spawns the edge poller. Requires the device to be open.
    pub fn poll(&mut self) -> Result<(), AppError> {
        if self.polling {
            return Ok(());
        }
        if !self.open {
            return Err(AppError::NotOpen);
        }
        if self.settings.poll_interval.is_zero() {
            return Err(AppError::InvalidValue(
                "poll interval must be positive".into(),
            ));
        }

        let registry = std::mem::take(&mut self.parked);
        let (mailbox, task) =
            PollingCoordinator::spawn(Arc::clone(&self.backend), self.settings, registry);
        self.session = Some(PollingSession { mailbox, task });
        self.polling = true;
        Ok(())
    }

    /// Stops the edge poller and waits for its loop to exit. Callbacks already
    /// running are left to finish on their own.
    pub async fn stop_polling(&mut self) {
        if !self.polling {
            return;
        }

        if let Some(session) = self.session.take() {
            if !session.task.is_finished()
                && let Err(e) = session.mailbox.post(Command::Stop).await
            {
                warn!("poller did not accept stop, aborting it: {e}");
                session.task.abort();
            }

            match session.task.await {
                Ok(registry) => self.parked = registry,
                Err(e) => {
                    warn!("poller exited abnormally, dropping its registrations: {e}");
                    self.parked.clear();
                    self.disarm_all();
                }
            }
        }

        self.polling = false;
    }

    /// Stops polling if needed, disarms every registered line and closes the device.
    ///
    /// # Panics
    ///
    /// If the backend fails to close the device.
    pub async fn stop(&mut self) {
        if !self.open {
            return;
        }

        if self.polling {
            self.stop_polling().await;
        }

        self.parked.clear();
        self.disarm_all();

        if let Err(e) = self.backend.close() {
            panic!("unable to close GPIO: {e}");
        }

        info!("GPIO closed");
        self.open = false;
    }

    /// Arms `edge` on `line_id` and hands the callback to the poller.
    ///
    /// Only one registration per line is allowed; remove it before registering again.
    pub async fn register_edge_detection<F>(
        &mut self,
        line_id: LineId,
        edge: EdgeKind,
        callback: F,
    ) -> Result<(), AppError>
    where
        F: Fn(EdgeKind) + Send + Sync + 'static,
    {
        self.ensure_polling().await?;

        if !self.registered_lines.insert(line_id) {
            return Err(AppError::AlreadyRegistered(line_id));
        }

        if let Err(e) = self.backend.set_edge_mode(line_id, edge) {
            self.registered_lines.remove(&line_id);
            return Err(e);
        }

        let registration = Registration::new(line_id, edge, Arc::new(callback));
        if let Err(e) = self.post(Command::Register(registration)).await {
            self.registered_lines.remove(&line_id);
            if let Err(clear_err) = self.backend.clear_edge_mode(line_id) {
                warn!("failed to clear edge mode on line {line_id}: {clear_err}");
            }
            return Err(e);
        }

        info!("Registered {edge:?} edge detection on line {line_id}");
        Ok(())
    }

    pub async fn remove_edge_detection_registration(
        &mut self,
        line_id: LineId,
    ) -> Result<(), AppError> {
        self.ensure_polling().await?;

        if !self.registered_lines.contains(&line_id) {
            return Err(AppError::NotRegistered(line_id));
        }

        // on refusal the line stays registered and armed
        self.post(Command::Remove(line_id)).await?;

        self.registered_lines.remove(&line_id);
        if let Err(e) = self.backend.clear_edge_mode(line_id) {
            warn!("failed to clear edge mode on line {line_id}: {e}");
        }

        info!("Removed edge detection on line {line_id}");
        Ok(())
    }

    /// Changes the sampling period. The next tick happens one full `interval` after
    /// the poller applies the change.
    ///
    /// Guarded on the device being open rather than on polling; while not polling the
    /// interval is kept for the next [`poll`](Self::poll).
    pub async fn update_poll_freq(&mut self, interval: Duration) -> Result<(), AppError> {
        if !self.open {
            return Err(AppError::NotOpen);
        }
        if interval.is_zero() {
            return Err(AppError::InvalidValue(
                "poll interval must be positive".into(),
            ));
        }

        self.reap_exited_poller().await;
        if let Some(session) = &self.session {
            session.mailbox.post(Command::SetInterval(interval)).await?;
        }

        self.settings.poll_interval = interval;
        Ok(())
    }

    async fn ensure_polling(&mut self) -> Result<(), AppError> {
        if !self.open {
            return Err(AppError::NotOpen);
        }
        self.reap_exited_poller().await;
        if !self.polling {
            return Err(AppError::NotPolling);
        }
        Ok(())
    }

    /// Folds a poller that exited on its own back into the stopped state.
    async fn reap_exited_poller(&mut self) {
        if self
            .session
            .as_ref()
            .is_some_and(|session| session.task.is_finished())
        {
            warn!("edge poller exited unexpectedly");
            self.stop_polling().await;
        }
    }

    fn disarm_all(&mut self) {
        for line_id in self.registered_lines.drain() {
            if let Err(e) = self.backend.clear_edge_mode(line_id) {
                warn!("failed to clear edge mode on line {line_id}: {e}");
            }
        }
    }

    async fn post(&self, command: Command) -> Result<(), AppError> {
        match &self.session {
            Some(session) => session.mailbox.post(command).await,
            None => Err(AppError::NotPolling),
        }
    }
}
