use serial_link::{PortError, SerialPort};

/// [`SerialPort`] whose transmits are carried out by the async writer.
///
/// `begin_transmit` parks a copy of the chunk; the driver takes it, writes it
/// to the stream outside the session lock, then reports completion.
#[derive(Debug, Default)]
pub struct StreamPort {
    queued: Option<Vec<u8>>,
    complete: bool,
}

impl StreamPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the chunk waiting to be written
    pub fn take_queued(&mut self) -> Option<Vec<u8>> {
        self.queued.take()
    }

    /// The last taken chunk reached the stream
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }
}

impl SerialPort for StreamPort {
    fn begin_transmit(&mut self, bytes: &[u8]) -> Result<(), PortError> {
        if self.queued.is_some() {
            return Err(PortError::Busy);
        }
        self.queued = Some(bytes.to_vec());
        Ok(())
    }

    fn poll_complete(&mut self) -> bool {
        std::mem::replace(&mut self.complete, false)
    }
}
