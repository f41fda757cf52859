pub mod connection;
pub mod dispatcher;
pub mod handler;
pub mod session;
pub mod types;

pub use connection::{DeliveryReport, RoomRegistry, SessionId, WsSender};
pub use dispatcher::Dispatcher;
pub use handler::ws_handler;
pub use session::SessionHub;
pub use types::{ClientMessage, ServerEvent};
