//! PulseWorx gateway dialect.
//!
//! A gateway fronts the PIM serial port with two phases. The handshake
//! phase speaks null terminated ASCII lines and may demand HMAC-MD5
//! authentication. After `AUTH SUCCEEDED` the connection switches to
//! wrapped mode: binary frames `cmd | len(2 BE) | payload | cksum` where
//! the checksum is the usual packet checksum minus one. The off-by-one is
//! how the device actually behaves, not a mistake here; keep it.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use bytes::BytesMut;
use hmac::{Hmac, Mac};
use md5::Md5;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Error;
use crate::packet::{cksum, hex_upper, hexdump};
use crate::transport::LineTx;

/// Client identification sent as the first handshake line.
const CLIENT_HELLO: &[u8] = b"UPStart/8.3.4/1";

/// Greeting strings with which the gateway refuses service outright.
const REFUSALS: [&str; 4] = [
    "MAX CONNECTIONS REACHED",
    "PULSE MODE ACTIVE",
    "PIM NOT INITIALIZED",
    "FIRMWARE CORRUPT - FLASH WITH UPSTART",
];

/// Resend interval for both the handshake line queue and the wrapped
/// command queue.
const RESEND_INTERVAL: Duration = Duration::from_secs(10);

// cmd | len | cksum
const FRAME_OVERHEAD: usize = 4;

/// Wrapped phase frame commands.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub(crate) enum GatewayCommand {
    /// Forward the payload to the PIM serial port.
    SendToSerial = 0x70,
    StartPulseMode = 0x71,
    ExitPulseMode = 0x72,
    KeepAlive = 0x73,
    /// Inbound: one PIM line, plus one trailing byte to discard.
    SerialMessage = 0x78,
}

/// One decoded wrapped phase frame.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) struct GatewayFrame {
    pub cmd: u8,
    pub payload: Vec<u8>,
}

/// Encode a wrapped phase frame, including the gateway's minus-one
/// checksum.
pub(crate) fn encode_frame(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.push(cmd);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame.push(cksum(&frame).wrapping_sub(1));
    frame
}

/// Wrap raw PIM serial bytes for the gateway.
pub(crate) fn wrap_serial(bytes: &[u8]) -> Vec<u8> {
    encode_frame(GatewayCommand::SendToSerial as u8, bytes)
}

/// Pull one complete frame out of the read buffer, or `None` until more
/// bytes arrive. A checksum mismatch consumes the frame and reports it.
pub(crate) fn take_frame(buf: &mut BytesMut) -> Option<Result<GatewayFrame, Error>> {
    if buf.len() < FRAME_OVERHEAD {
        return None;
    }
    let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    let total = len + FRAME_OVERHEAD;
    if buf.len() < total {
        return None;
    }
    let frame = buf.split_to(total);
    let expected = cksum(&frame[..total - 1]).wrapping_sub(1);
    if frame[total - 1] != expected {
        return Some(Err(Error::Framing(format!(
            "gateway frame checksum {:#04x} != computed {:#04x}",
            frame[total - 1],
            expected
        ))));
    }
    Some(Ok(GatewayFrame {
        cmd: frame[0],
        payload: frame[3..total - 1].to_vec(),
    }))
}

/// The authentication digest: HMAC-MD5 of the challenge under the account
/// password, hex encoded with the case swapped.
fn auth_digest(password: &str, challenge: &[u8]) -> String {
    let mut mac = Hmac::<Md5>::new_from_slice(password.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(challenge);
    hex_upper(&mac.finalize().into_bytes())
}

/// Parsed gateway greeting.
#[derive(Debug)]
struct Greeting {
    auth_required: bool,
    challenge: Vec<u8>,
}

fn parse_greeting(line: &[u8]) -> Result<Greeting, Error> {
    let text = String::from_utf8_lossy(line).into_owned();
    if REFUSALS.contains(&text.as_str()) {
        return Err(Error::Handshake(text));
    }
    let parts: Vec<&str> = text.splitn(5, '/').collect();
    if parts.len() < 5 {
        return Err(Error::Handshake(format!("malformed greeting: {text}")));
    }
    debug!(version = parts[1], protocol = parts[2], "gateway greeting");
    let auth_required = parts[3] == "AUTH REQUIRED";
    let challenge = if auth_required {
        hex::decode(parts[4])
            .map_err(|_| Error::Handshake(format!("bad challenge: {}", parts[4])))?
    } else {
        Vec::new()
    };
    Ok(Greeting {
        auth_required,
        challenge,
    })
}

/// Run the handshake phase on a fresh connection. On success the gateway
/// has switched to wrapped mode and the socket can be split for framed
/// traffic.
pub(crate) async fn authenticate(
    stream: &mut TcpStream,
    username: &str,
    password: &str,
) -> Result<(), Error> {
    let mut buf = BytesMut::with_capacity(1024);
    let line = request(stream, &mut buf, CLIENT_HELLO).await?;
    let greeting = parse_greeting(&line)?;
    if !greeting.auth_required {
        return Ok(());
    }
    let mut reply = Vec::with_capacity(username.len() + 34);
    reply.extend_from_slice(username.as_bytes());
    reply.push(b'/');
    reply.extend_from_slice(auth_digest(password, &greeting.challenge).as_bytes());
    let line = request(stream, &mut buf, &reply).await?;
    let text = String::from_utf8_lossy(&line);
    if text.starts_with("AUTH SUCCEEDED") {
        Ok(())
    } else if text.starts_with("AUTHENTICATION FAILED") {
        Err(Error::Auth)
    } else {
        Err(Error::Handshake(format!("unexpected auth reply: {text}")))
    }
}

/// Send one null terminated line and wait for the answer, resending on the
/// usual interval. Handshake lines are strictly request/reply, so the
/// queue of one is implicit.
async fn request(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    line: &[u8],
) -> Result<Vec<u8>, Error> {
    loop {
        stream.write_all(line).await?;
        stream.write_all(&[0]).await?;
        match tokio::time::timeout(RESEND_INTERVAL, read_nt_line(stream, buf)).await {
            Ok(result) => return result,
            Err(_) => warn!(
                "handshake line timed out, resending: {}",
                hexdump(line)
            ),
        }
    }
}

async fn read_nt_line(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<Vec<u8>, Error> {
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == 0) {
            let line = buf.split_to(pos + 1);
            if pos > 0 {
                return Ok(line[..pos].to_vec());
            }
            continue;
        }
        let read = stream.read_buf(buf).await?;
        if read == 0 {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "gateway closed during handshake",
            )));
        }
    }
}

/// Wrapped phase command queue: one frame in flight, 10 second resend,
/// independent of the bus multiplexer. Serial forwards bypass this queue;
/// the bus multiplexer paces those itself.
pub(crate) struct GatewayCommands {
    sink: Option<LineTx>,
    waiters: VecDeque<(oneshot::Sender<Result<GatewayFrame, Error>>, Vec<u8>)>,
    in_flight: Option<oneshot::Sender<Result<GatewayFrame, Error>>>,
    cmd_timeout: Option<JoinHandle<()>>,
}

impl GatewayCommands {
    pub(crate) fn new() -> GatewayCommands {
        GatewayCommands {
            sink: None,
            waiters: VecDeque::new(),
            in_flight: None,
            cmd_timeout: None,
        }
    }

    pub(crate) fn set_sink(&mut self, sink: LineTx) {
        self.sink = Some(sink);
    }

    /// Queue a gateway command; resolves with the gateway's reply frame.
    pub(crate) fn send(
        &mut self,
        cmd: GatewayCommand,
        payload: &[u8],
    ) -> oneshot::Receiver<Result<GatewayFrame, Error>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back((tx, encode_frame(cmd as u8, payload)));
        self.send_next();
        rx
    }

    /// An inbound frame that is not serial traffic answers the in-flight
    /// command.
    pub(crate) fn resolve(&mut self, frame: GatewayFrame) {
        match self.in_flight.take() {
            Some(waiter) => {
                self.clear_resend();
                let _ = waiter.send(Ok(frame));
                self.send_next();
            }
            None => debug!("unsolicited gateway frame: {:#04x}", frame.cmd),
        }
    }

    pub(crate) fn disconnect(&mut self) {
        self.clear_resend();
        self.sink = None;
        if let Some(waiter) = self.in_flight.take() {
            let _ = waiter.send(Err(Error::Disconnected));
        }
        for (waiter, _) in self.waiters.drain(..) {
            let _ = waiter.send(Err(Error::Disconnected));
        }
    }

    fn send_next(&mut self) {
        if self.in_flight.is_some() || self.waiters.is_empty() {
            return;
        }
        let Some(sink) = self.sink.clone() else {
            for (waiter, _) in self.waiters.drain(..) {
                let _ = waiter.send(Err(Error::Disconnected));
            }
            return;
        };
        let Some((waiter, frame)) = self.waiters.pop_front() else {
            return;
        };
        debug!("sending gateway command: {}", hexdump(&frame));
        sink.send_frame(frame.clone());
        self.in_flight = Some(waiter);
        self.clear_resend();
        self.cmd_timeout = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(RESEND_INTERVAL).await;
                warn!("resending gateway command due to timeout");
                sink.send_frame(frame.clone());
            }
        }));
    }

    fn clear_resend(&mut self) {
        if let Some(timer) = self.cmd_timeout.take() {
            timer.abort();
        }
    }
}
