pub mod backend;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod gpio;
pub mod routes;

pub use config::{AppConfig, ControllerSettings, EdgeKind, HttpConfig, LineBias, LineConfig, LineId};
pub use controller::{Controller, ControllerStatus};
pub use coordinator::{EdgeCallback, PollingCoordinator, Registration};
pub use error::AppError;
pub use events::{EdgeEvent, EventCallbackHandler, EventHandler};
pub use gpio::{LineBackend, LineDescriptor};
pub use routes::AppState;

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::MockGpioBackend;
