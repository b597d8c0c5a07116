pub extern crate bincode;
pub extern crate euclid;
pub extern crate serde;
pub extern crate serde_json;
pub extern crate uuid;

mod config;
mod cursor_throttle;
mod error;
mod geometry;
mod message;
mod mutation;
mod presence;
mod reconnection;
mod replay_log;
mod session;
mod shape;
mod shape_store;
mod types;
mod viewport_culler;

pub use config::*;
pub use cursor_throttle::*;
pub use error::*;
pub use geometry::*;
pub use message::*;
pub use mutation::*;
pub use presence::*;
pub use reconnection::*;
pub use replay_log::*;
pub use session::*;
pub use shape::*;
pub use shape_store::*;
pub use types::*;
pub use viewport_culler::*;
