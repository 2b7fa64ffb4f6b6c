use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config::{EdgeKind, LineId};
use crate::error::AppError;
use crate::gpio::LineBackend;

/// In-memory GPIO device. Lines spring into existence on first use.
#[derive(Default)]
pub struct MockGpioBackend {
    open: AtomicBool,
    lines: Mutex<FxHashMap<LineId, MockLineState>>, // keyed by line id
    fail_open: AtomicBool,
    fail_close: AtomicBool,
    fail_sampling: AtomicBool,
    samples: AtomicUsize,
}

#[derive(Default, Clone)]
struct MockLineState {
    edge: EdgeKind,
    value: u8,
    latched: bool,
}

impl MockGpioBackend {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::Release);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::Release);
    }

    pub fn set_fail_sampling(&self, fail: bool) {
        self.fail_sampling.store(fail, Ordering::Release);
    }

    /// Number of `poll_edge_detected` calls made so far.
    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::Acquire)
    }

    pub fn edge_mode(&self, line_id: LineId) -> EdgeKind {
        self.lines
            .lock()
            .get(&line_id)
            .map(|l| l.edge)
            .unwrap_or_default()
    }

    pub fn is_latched(&self, line_id: LineId) -> bool {
        self.lines
            .lock()
            .get(&line_id)
            .map(|l| l.latched)
            .unwrap_or(false)
    }

    /// Simulates a transition on the line; latches only if the armed mode matches.
    pub fn inject_edge(&self, line_id: LineId, observed: EdgeKind) {
        let mut lines = self.lines.lock();
        let line = lines.entry(line_id).or_default();
        if line.edge.matches(observed) {
            line.latched = true;
        }
    }

    /// Latches an edge regardless of the armed mode.
    pub fn force_edge(&self, line_id: LineId) {
        self.lines.lock().entry(line_id).or_default().latched = true;
    }

    /// Drives the input level as an external circuit would.
    pub fn set_level(&self, line_id: LineId, value: u8) {
        let observed = {
            let mut lines = self.lines.lock();
            let line = lines.entry(line_id).or_default();
            let old = line.value;
            line.value = value.min(1);
            match (old, line.value) {
                (0, 1) => EdgeKind::Rising,
                (1, 0) => EdgeKind::Falling,
                _ => return,
            }
        };
        self.inject_edge(line_id, observed);
    }

    fn ensure_open(&self) -> Result<(), AppError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AppError::Gpio("device not open".into()))
        }
    }
}

impl LineBackend for MockGpioBackend {
    fn open(&self) -> Result<(), AppError> {
        if self.fail_open.load(Ordering::Acquire) {
            return Err(AppError::Gpio("mock device refused to open".into()));
        }
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) -> Result<(), AppError> {
        if self.fail_close.load(Ordering::Acquire) {
            return Err(AppError::Gpio("mock device refused to close".into()));
        }
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn set_edge_mode(&self, line_id: LineId, edge: EdgeKind) -> Result<(), AppError> {
        self.ensure_open()?;
        let mut lines = self.lines.lock();
        let line = lines.entry(line_id).or_default();
        line.edge = edge;
        line.latched = false;
        Ok(())
    }

    fn poll_edge_detected(&self, line_id: LineId) -> Result<bool, AppError> {
        self.samples.fetch_add(1, Ordering::AcqRel);
        if self.fail_sampling.load(Ordering::Acquire) {
            return Err(AppError::Gpio(format!("mock sample failure on line {line_id}")));
        }
        self.ensure_open()?;

        Ok(self
            .lines
            .lock()
            .get_mut(&line_id)
            .map(|l| std::mem::take(&mut l.latched))
            .unwrap_or(false))
    }

    fn read_value(&self, line_id: LineId) -> Result<u8, AppError> {
        self.ensure_open()?;
        Ok(self
            .lines
            .lock()
            .get(&line_id)
            .map(|l| l.value)
            .unwrap_or(0))
    }
}
