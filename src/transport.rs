//! TCP plumbing shared by both PIM dialects.
//!
//! The socket is split once connected: a writer task owns the write half
//! behind an unbounded channel, and a dialect specific reader task feeds the
//! line parser in arrival order. The RawAscii dialect lives here; the
//! framed gateway dialect is in [`crate::gateway`].

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Error;
use crate::gateway;
use crate::pulse::Pulse;

/// Which wire dialect the connection speaks.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum Dialect {
    /// Carriage return delimited ASCII, straight to the PIM serial port.
    RawAscii,
    /// Length prefixed frames through a PulseWorx gateway.
    Gateway,
}

/// Handle for writing to the PIM, shared by the multiplexer, the gateway
/// command queue and the resend timers.
#[derive(Clone)]
pub(crate) struct LineTx {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    dialect: Dialect,
}

impl LineTx {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Vec<u8>>, dialect: Dialect) -> LineTx {
        LineTx { tx, dialect }
    }

    /// Send bytes destined for the PIM serial port, wrapping them for the
    /// gateway dialect when needed.
    pub(crate) fn send_serial(&self, bytes: &[u8]) {
        let frame = match self.dialect {
            Dialect::RawAscii => bytes.to_vec(),
            Dialect::Gateway => gateway::wrap_serial(bytes),
        };
        let _ = self.tx.send(frame);
    }

    /// Send an already framed gateway command.
    pub(crate) fn send_frame(&self, frame: Vec<u8>) {
        let _ = self.tx.send(frame);
    }
}

/// Open the TCP connection with a bounded connect time.
pub(crate) async fn connect_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, Error> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(Error::Transport(io::Error::new(
            io::ErrorKind::TimedOut,
            "connect timed out",
        ))),
    }
}

/// Spawn the task owning the write half. Frames are written in submission
/// order; a write failure ends the task and the reader will notice the
/// broken connection on its side.
pub(crate) fn spawn_writer(
    mut half: OwnedWriteHalf,
) -> (mpsc::UnboundedSender<Vec<u8>>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(err) = half.write_all(&frame).await {
                warn!("write to PIM failed: {err}");
                break;
            }
        }
    });
    (tx, handle)
}

/// Reader task for the RawAscii dialect: split the byte stream on carriage
/// returns and hand every non-empty line to the parser.
pub(crate) fn spawn_raw_reader(
    mut half: OwnedReadHalf,
    pulse: Arc<Mutex<Pulse>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match half.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!("PIM closed the connection");
                    break;
                }
                Ok(_) => {
                    while let Some(pos) = buf.iter().position(|&b| b == b'\r') {
                        let line = buf.split_to(pos + 1);
                        let line = &line[..pos];
                        if !line.is_empty() {
                            pulse.lock().unwrap().line_received(line);
                        }
                    }
                }
                Err(err) => {
                    warn!("read from PIM failed: {err}");
                    break;
                }
            }
        }
    })
}

/// Reader task for the gateway dialect: parse wrapped frames, forward
/// serial payloads to the line parser and everything else to the gateway
/// command queue.
pub(crate) fn spawn_gateway_reader(
    mut half: OwnedReadHalf,
    pulse: Arc<Mutex<Pulse>>,
    commands: Arc<Mutex<gateway::GatewayCommands>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match half.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!("gateway closed the connection");
                    break;
                }
                Ok(_) => {
                    while let Some(parsed) = gateway::take_frame(&mut buf) {
                        match parsed {
                            Ok(frame) => {
                                if frame.cmd == gateway::GatewayCommand::SerialMessage as u8 {
                                    // The serial payload carries one trailing
                                    // byte past the PIM line.
                                    if frame.payload.len() > 1 {
                                        let line = &frame.payload[..frame.payload.len() - 1];
                                        pulse.lock().unwrap().line_received(line);
                                    }
                                } else {
                                    commands.lock().unwrap().resolve(frame);
                                }
                            }
                            Err(err) => warn!("dropping gateway frame: {err}"),
                        }
                    }
                }
                Err(err) => {
                    warn!("read from gateway failed: {err}");
                    break;
                }
            }
        }
    })
}
