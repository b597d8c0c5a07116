pub extern crate actix_web;

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod handlers;
pub mod registry;
pub mod session_actor;
pub mod transport;
