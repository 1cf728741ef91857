#![forbid(unsafe_code)]

pub mod handler;
pub mod proxy_http;
pub mod room_manager;
