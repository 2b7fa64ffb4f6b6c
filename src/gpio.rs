use serde::Serialize;

use crate::config::{EdgeKind, LineConfig, LineId};
use crate::error::AppError;

/// Hardware capability set the poller needs from a GPIO device.
///
/// `open`/`close` acquire and release the whole device. Edge modes are latched by the
/// hardware between samples; `poll_edge_detected` reports and consumes that latch.
pub trait LineBackend: Send + Sync {
    fn open(&self) -> Result<(), AppError>;
    fn close(&self) -> Result<(), AppError>;
    fn set_edge_mode(&self, line_id: LineId, edge: EdgeKind) -> Result<(), AppError>;
    fn clear_edge_mode(&self, line_id: LineId) -> Result<(), AppError> {
        self.set_edge_mode(line_id, EdgeKind::None)
    }
    fn poll_edge_detected(&self, line_id: LineId) -> Result<bool, AppError>;
    fn read_value(&self, line_id: LineId) -> Result<u8, AppError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct LineDescriptor {
    pub info: LineConfig,
    pub registered: bool,
}
