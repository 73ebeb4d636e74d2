//! Session control for Sonorium.
//!
//! Binds the higher-level intent of a session — a theme, an optional
//! preset, a volume and a set of target speakers — to the engine
//! primitives: a pool channel, a theme mixer and the stream URL external
//! transports should point the speakers at. The engine itself never talks
//! to speakers; delivery is announced on a fire-and-forget event bus
//! consumed by the transport integrations.

mod errors;
mod events;
mod session;

#[cfg(feature = "api")]
pub mod api;
#[cfg(feature = "api")]
pub mod openapi;
#[cfg(feature = "server")]
mod server_ext;

pub use errors::ControlError;
pub use events::{TransportAction, TransportEvent, TransportEventBus};
pub use session::{EngineSettings, Session, SessionController, SessionSpec, SessionUpdate};

#[cfg(feature = "server")]
pub use server_ext::ControlSurfaceExt;
