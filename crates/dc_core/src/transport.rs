//! Connection I/O tasks.
//!
//! `spawn_io` splits a stream into a reader task and a writer task:
//!
//! - the reader decodes frames one at a time under the idle deadline and
//!   forwards them, in order, on `inbound`;
//! - the writer drains `outbound` under the write deadline.
//!
//! A failure in either task is delivered as the last item on `inbound`.
//! Dropping the [`Connection`] aborts both tasks.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use dc_proto::{read_frame, write_frame, Frame};

use crate::config::TimeoutConfig;
use crate::error::CourierError;

const INBOUND_CAPACITY: usize = 64;
pub const OUTBOUND_CAPACITY: usize = 256;

pub type Inbound = mpsc::Receiver<Result<Frame, CourierError>>;

pub struct Connection {
    pub inbound: Inbound,
    pub outbound: mpsc::Sender<Frame>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

pub fn spawn_io<S>(stream: S, timeouts: &TimeoutConfig) -> Connection
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut rd, mut wr) = tokio::io::split(stream);
    let (in_tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
    let (outbound, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_CAPACITY);
    let idle = timeouts.idle_timeout();
    let write_deadline = timeouts.write_timeout();

    let reader_tx = in_tx.clone();
    let reader = tokio::spawn(async move {
        loop {
            let item = match timeout(idle, read_frame(&mut rd)).await {
                Err(_) => Err(CourierError::Timeout("read a frame")),
                Ok(Err(e)) => Err(CourierError::from(e)),
                Ok(Ok(frame)) => Ok(frame),
            };
            let done = item.is_err();
            if reader_tx.send(item).await.is_err() || done {
                break;
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write_with_deadline(&mut wr, &frame, write_deadline).await {
                let _ = in_tx.send(Err(e)).await;
                return;
            }
        }
        let _ = wr.shutdown().await;
    });

    Connection { inbound, outbound, reader, writer }
}

async fn write_with_deadline<W>(wr: &mut W, frame: &Frame, deadline: Duration) -> Result<(), CourierError>
where
    W: AsyncWrite + Unpin,
{
    match timeout(deadline, write_frame(wr, frame)).await {
        Err(_) => Err(CourierError::Timeout("write a frame")),
        Ok(result) => result.map_err(CourierError::from),
    }
}
