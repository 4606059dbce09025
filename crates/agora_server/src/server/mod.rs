#![forbid(unsafe_code)]

pub mod app;
pub mod auth;
pub mod fanout;
pub mod http;
pub mod ingest;
pub mod quic_conn;
pub mod registry;
pub mod session;
pub mod store;
pub mod sweeper;
pub mod websocket;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod fanout_tests;


#[cfg(test)]
mod session_tests;
