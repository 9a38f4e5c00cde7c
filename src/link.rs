//! The serial byte-stream between the central and the uplink node.
//!
//! The link carries no framing of its own. A frame is whatever the central
//! wrote in one go, recovered on the other side by waiting for the line to go
//! quiet.

use std::{io, time::Duration};

use anyhow::{bail, Context, Result};
use log::{debug, trace, warn};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    time::timeout,
};
use tokio_serial::{DataBits, FlowControl, Parity, SerialStream, StopBits};

use crate::config::SerialConfig;

/// Size of the receive buffer on the uplink node.
pub const MAX_FRAME_LEN: usize = 2048;
/// Reads of this many bytes or fewer are line noise, not a barcode.
pub const NOISE_THRESHOLD: usize = 2;

pub fn open(cfg: &SerialConfig) -> Result<SerialStream> {
    let builder = tokio_serial::new(&cfg.path, cfg.baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(Duration::from_secs(1));

    SerialStream::open(&builder)
        .with_context(|| format!("failed to open serial port `{}`", cfg.path))
}

async fn finish_frame<W>(port: &mut W, rest: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    port.write_all(rest).await?;
    port.flush().await
}

/// Write queued frames to the link until the queue closes.
///
/// A frame the link does not start accepting within `write_timeout` is
/// dropped whole, so a stalled link never backs up into the bluetooth side.
/// Once the first byte is out the frame is finished, since the reader on the
/// other side can not tell a fragment from a barcode. A frame that stalls
/// half way is an error like any write error, the caller is expected to
/// reopen the port.
pub async fn drain_uplink<W>(
    frames: &mut mpsc::Receiver<Vec<u8>>,
    port: &mut W,
    write_timeout: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if frame.is_empty() {
            continue;
        }

        let sent = match timeout(write_timeout, port.write(&frame)).await {
            Err(_) => {
                warn!(
                    "serial write stalled for {:?}, dropped {} bytes",
                    write_timeout,
                    frame.len()
                );
                continue;
            }
            Ok(x) => x.context("error writing to serial link")?,
        };
        if sent == 0 {
            bail!("serial link closed");
        }

        match timeout(write_timeout, finish_frame(port, &frame[sent..])).await {
            Ok(x) => x.context("error writing to serial link")?,
            Err(_) => bail!(
                "serial write stalled after {} of {} bytes",
                sent,
                frame.len()
            ),
        }
        trace!("transmission over uart complete, {} bytes", frame.len());
    }
    debug!("uplink queue closed");
    Ok(())
}

/// Turn one read off the link into barcode text.
///
/// The text ends at the first NUL. A read that filled the whole buffer loses
/// its last byte to the terminator.
pub fn barcode_from_bytes(b: &[u8]) -> Option<String> {
    if b.len() <= NOISE_THRESHOLD {
        return None;
    }
    let b = &b[..b.len().min(MAX_FRAME_LEN - 1)];
    let end = b.iter().position(|&x| x == 0).unwrap_or(b.len());
    Some(String::from_utf8_lossy(&b[..end]).into_owned())
}

pub struct FrameReader<R> {
    port: R,
    buffer: Box<[u8; MAX_FRAME_LEN]>,
    poll_timeout: Duration,
    frame_gap: Duration,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(port: R, poll_timeout: Duration, frame_gap: Duration) -> Self {
        FrameReader {
            port,
            buffer: Box::new([0u8; MAX_FRAME_LEN]),
            poll_timeout,
            frame_gap,
        }
    }

    /// Wait up to one poll interval for a frame.
    ///
    /// Returns `None` when nothing arrived or the read was below the noise
    /// threshold. A closed link is an error.
    pub async fn poll_frame(&mut self) -> Result<Option<String>> {
        let mut len = match timeout(self.poll_timeout, self.port.read(&mut self.buffer[..])).await
        {
            Err(_) => return Ok(None),
            Ok(x) => x.context("error reading from serial link")?,
        };
        if len == 0 {
            bail!("serial link closed");
        }

        while len < MAX_FRAME_LEN {
            match timeout(self.frame_gap, self.port.read(&mut self.buffer[len..])).await {
                Err(_) | Ok(Ok(0)) => break,
                Ok(x) => len += x.context("error reading from serial link")?,
            }
        }

        let barcode = barcode_from_bytes(&self.buffer[..len]);
        match barcode {
            Some(_) => debug!("bytes read: {len}"),
            None => trace!("discarded {len} bytes of noise"),
        }
        Ok(barcode)
    }
}
