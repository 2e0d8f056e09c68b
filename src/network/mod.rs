//! Network front end.
//!
//! - [`server`]: the upload/execute/info line protocol served over TCP
//! - [`channel_io`]: console adapters between a session task and a VM worker

pub mod channel_io;
pub mod server;
