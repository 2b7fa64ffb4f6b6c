use log::{debug, info};
use std::path::PathBuf;
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::config::{AppConfig, EdgeKind, LineBias, LineConfig, LineId};
use crate::error::AppError;
use crate::gpio::LineBackend;

const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_BACKEND_MAX_DRAIN_ROUNDS: usize = 8;

/// Character-device GPIO backend. Every configured line is requested as an input
/// on `open` and released on `close`; edge modes are programmed into the kernel and
/// the queued edge events are drained on each sample.
pub struct LibgpiodBackend {
    lines: FxHashMap<LineId, LineConfig>,
    handles: RwLock<FxHashMap<LineId, Mutex<GpiodHandle>>>, // populated while open
}

struct GpiodHandle {
    offset: u32,
    bias: LineBias,
    request: request::Request,
    buffer: request::Buffer,
}

impl GpiodHandle {
    fn new(cfg: &LineConfig) -> Result<Self, AppError> {
        let settings = make_line_settings(cfg.bias, EdgeKind::None)?;
        let line_cfg = make_line_config(cfg.line, settings)?;
        let chip = Self::open_chip(&cfg.chip)?;
        let request = Self::request_lines(&chip, &line_cfg)?;
        let buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| AppError::Gpio(format!("event buffer: {e}")))?;

        Ok(Self {
            offset: cfg.line,
            bias: cfg.bias,
            request,
            buffer,
        })
    }

    fn open_chip(path: &str) -> Result<Chip, AppError> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| AppError::Gpio(format!("open chip {path}: {e}")))
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, AppError> {
        let mut req_cfg =
            request::Config::new().map_err(|e| AppError::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| AppError::Gpio(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| AppError::Gpio(format!("request lines: {e}")))
    }

    fn set_edge(&mut self, edge: EdgeKind) -> Result<(), AppError> {
        let settings = make_line_settings(self.bias, edge)?;
        let line_cfg = make_line_config(self.offset, settings)?;
        self.request
            .reconfigure_lines(&line_cfg)
            .map_err(|e| AppError::Gpio(format!("reconfigure lines: {e}")))?;

        // events queued under the previous mode must not fire the new registration
        self.drain_events()?;
        Ok(())
    }

    /// Consumes queued edge events, reporting whether there were any.
    fn drain_events(&mut self) -> Result<bool, AppError> {
        let mut detected = false;

        for _ in 0..LIBGPIOD_BACKEND_MAX_DRAIN_ROUNDS {
            let pending = self
                .request
                .wait_edge_events(Some(Duration::ZERO))
                .map_err(|e| AppError::Gpio(format!("wait edge events: {e}")))?;
            if !pending {
                break;
            }

            let events = self
                .request
                .read_edge_events(&mut self.buffer)
                .map_err(|e| AppError::Gpio(format!("read edge events: {e}")))?;
            for evt in events {
                if evt.is_ok() {
                    detected = true;
                }
            }
        }

        Ok(detected)
    }

    fn value(&self) -> Result<u8, AppError> {
        let value = self
            .request
            .value(self.offset)
            .map_err(|e| AppError::Gpio(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => 0,
            line::Value::Active => 1,
        })
    }
}

fn make_line_settings(bias: LineBias, edge: EdgeKind) -> Result<line::Settings, AppError> {
    let mut ls =
        line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;

    ls.set_direction(line::Direction::Input)
        .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
    let bias = match bias {
        LineBias::Floating => None,
        LineBias::PullUp => Some(line::Bias::PullUp),
        LineBias::PullDown => Some(line::Bias::PullDown),
    };
    ls.set_bias(bias)
        .map_err(|e| AppError::Gpio(format!("set bias: {e}")))?;

    let edge = match edge {
        EdgeKind::None => None,
        EdgeKind::Rising => Some(line::Edge::Rising),
        EdgeKind::Falling => Some(line::Edge::Falling),
        EdgeKind::Both => Some(line::Edge::Both),
    };
    let armed = edge.is_some();
    ls.set_edge_detection(edge)
        .map_err(|e| AppError::Gpio(format!("set edge detection: {e}")))?;
    if armed {
        ls.set_event_clock(EventClock::Realtime)
            .map_err(|e| AppError::Gpio(format!("set event clock: {e}")))?;
    }

    Ok(ls)
}

fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, AppError> {
    let mut cfg = line::Config::new().map_err(|e| AppError::Gpio(format!("line config: {e}")))?;
    cfg.add_line_settings(&[offset], settings)
        .map_err(|e| AppError::Gpio(format!("line config add settings: {e}")))?;
    Ok(cfg)
}

impl LibgpiodBackend {
    pub fn new(config: &AppConfig) -> Result<Self, AppError> {
        Ok(Self {
            lines: config.lines.clone(),
            handles: RwLock::new(FxHashMap::default()),
        })
    }

    fn with_handle<T>(
        &self,
        line_id: LineId,
        f: impl FnOnce(&mut GpiodHandle) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        if !self.lines.contains_key(&line_id) {
            return Err(AppError::NotFoundLine(line_id.to_string()));
        }

        let handles = self.handles.read();
        let handle = handles
            .get(&line_id)
            .ok_or_else(|| AppError::Gpio("device not open".into()))?;
        let mut handle = handle.lock();
        f(&mut *handle)
    }
}

impl LineBackend for LibgpiodBackend {
    fn open(&self) -> Result<(), AppError> {
        let mut handles = self.handles.write();
        if !handles.is_empty() {
            return Ok(());
        }

        // on error the partially requested lines drop here and are released
        let mut requested = FxHashMap::default();
        for (line_id, cfg) in &self.lines {
            let handle = GpiodHandle::new(cfg)?;
            debug!("requested {}:{} as line {line_id}", cfg.chip, cfg.line);
            requested.insert(*line_id, Mutex::new(handle));
        }

        info!("Requested {} GPIO lines", requested.len());
        *handles = requested;
        Ok(())
    }

    fn close(&self) -> Result<(), AppError> {
        let released = std::mem::take(&mut *self.handles.write());
        info!("Released {} GPIO lines", released.len());
        Ok(())
    }

    fn set_edge_mode(&self, line_id: LineId, edge: EdgeKind) -> Result<(), AppError> {
        self.with_handle(line_id, |handle| handle.set_edge(edge))
    }

    fn poll_edge_detected(&self, line_id: LineId) -> Result<bool, AppError> {
        self.with_handle(line_id, GpiodHandle::drain_events)
    }

    fn read_value(&self, line_id: LineId) -> Result<u8, AppError> {
        self.with_handle(line_id, |handle| handle.value())
    }
}
