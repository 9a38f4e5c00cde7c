use log::{debug, info};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::hex_dump;

pub const MAX_NOTIFICATION_LEN: usize = 256;
pub const HEADER_LEN: usize = 2;
pub const TRAILER_LEN: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("notification of {0} bytes exceeds the 256 byte limit")]
    TooLong(usize),
    #[error("uplink queue is full, dropped {0} bytes")]
    QueueFull(usize),
    #[error("uplink writer has quit")]
    Closed,
}

/// Cut the header and trailer off a raw notification.
///
/// Frames shorter than header plus trailer carry no payload.
pub fn strip_frame(raw: &[u8]) -> Result<&[u8], RelayError> {
    if raw.len() > MAX_NOTIFICATION_LEN {
        return Err(RelayError::TooLong(raw.len()));
    }
    let len = raw.len().saturating_sub(HEADER_LEN + TRAILER_LEN);
    Ok(&raw[HEADER_LEN.min(raw.len())..][..len])
}

/// Hands notification payloads to the serial writer without blocking.
#[derive(Debug, Clone)]
pub struct NotificationRelay {
    uplink: mpsc::Sender<Vec<u8>>,
}

impl NotificationRelay {
    pub fn new(uplink: mpsc::Sender<Vec<u8>>) -> Self {
        NotificationRelay { uplink }
    }

    /// Returns the number of payload bytes queued.
    pub fn forward(&self, raw: &[u8]) -> Result<usize, RelayError> {
        let payload = strip_frame(raw)?;

        info!(
            "[BARCODE READ] length: {}, raw bytes: {}",
            raw.len(),
            hex_dump(raw)
        );

        if payload.is_empty() {
            debug!("notification carried no payload");
            return Ok(0);
        }

        match self.uplink.try_send(payload.to_vec()) {
            Ok(()) => Ok(payload.len()),
            Err(TrySendError::Full(x)) => Err(RelayError::QueueFull(x.len())),
            Err(TrySendError::Closed(_)) => Err(RelayError::Closed),
        }
    }
}
