//! Console output adapter that connects a VM worker thread to an async session.
//!
//! The session task drains a [`ChannelOutput`] back onto the socket while the guest runs
//! on a blocking worker. Input goes the other way through
//! [`ChannelInput`](crate::virtual_machine::vm::context::ChannelInput).

use std::io::{self, Write};
use tokio::sync::mpsc::UnboundedSender;

/// Guest stdout forwarded chunk by chunk to the session task.
pub struct ChannelOutput {
    tx: UnboundedSender<Vec<u8>>,
}

impl ChannelOutput {
    pub fn new(tx: UnboundedSender<Vec<u8>>) -> Self {
        Self { tx }
    }
}

impl Write for ChannelOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "session closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
