//! Connection orchestration: setup with automatic retry, PIM
//! initialization, and the device register read with password recovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::device::{DeviceMemory, DeviceRegistry, REGISTER_COUNT};
use crate::error::Error;
use crate::gateway::{self, GatewayCommand, GatewayCommands};
use crate::packet::{self, DeviceControlCmd, Mdid, PacketBody, TransmitOptions, UpbPacket};
use crate::pim::{PimRegister, PIM_OPTIONS_MESSAGE_MODE};
use crate::pulse::Pulse;
use crate::transport::{self, Dialect, LineTx};

/// Default TCP port of serial-over-ethernet PIMs and gateways.
pub const DEFAULT_PORT: u16 = 2101;

/// Largest checksum delta a two byte password can explain.
const MAX_PASSWORD_SUM: i64 = 512;

/// Largest delta reachable by a password with every nibble in 0..=9.
const MAX_NUMERIC_SUM: u16 = 306;

/// Device register reads are fanned out in chunks of this many registers.
const READ_CHUNK: u16 = 16;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Connection settings.
///
/// Supplying both `username` and `password` selects the authenticated
/// gateway dialect; otherwise the connection speaks raw ASCII straight to
/// the PIM.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    /// TCP port, defaults to 2101.
    pub port: u16,
    /// Gateway account name.
    pub username: Option<String>,
    /// Gateway account password, also the HMAC key for the auth challenge.
    pub password: Option<String>,
    /// How long a TCP connect may take before the attempt counts as failed.
    pub connect_timeout: Duration,
    /// Pause between setup attempts.
    pub reconnect_interval: Duration,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>) -> ClientConfig {
        ClientConfig {
            host: host.into(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
            connect_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(10),
        }
    }
}

/// PIM identity read during initialization.
#[derive(Debug, Default, Copy, Clone)]
pub struct PimInfo {
    pub firmware_version: u16,
    pub pim_options: u8,
    pub manufacturer_id: u16,
    pub product_id: u16,
    pub upb_options: u8,
    pub upb_version: u8,
    pub noise_floor: u8,
    pub network_id: u8,
}

/// Client handle for one PIM. Cheap to clone; all clones share the same
/// connection and device registry.
#[derive(Clone)]
pub struct UpbClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    pulse: Arc<Mutex<Pulse>>,
    commands: Arc<Mutex<GatewayCommands>>,
    devices: Arc<Mutex<DeviceRegistry>>,
    pim_info: Mutex<Option<PimInfo>>,
    reconnect: AtomicBool,
    connected: watch::Sender<bool>,
    conn: Mutex<Option<Connection>>,
    disconnect_callback: Mutex<Option<Callback>>,
    reconnect_callback: Mutex<Option<Callback>>,
}

struct Connection {
    reader: tokio::task::AbortHandle,
    writer: JoinHandle<()>,
}

impl UpbClient {
    /// Connect to the PIM and run its initialization.
    ///
    /// Failed attempts are retried every `reconnect_interval` until one
    /// succeeds; only a rejected gateway login gives up, since retrying
    /// bad credentials cannot converge. After the initial connect a
    /// supervisor task keeps reconnecting whenever the link drops, until
    /// [`UpbClient::stop`].
    pub async fn connect(config: ClientConfig) -> Result<UpbClient, Error> {
        let devices = Arc::new(Mutex::new(DeviceRegistry::new()));
        let (connected, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            pulse: Arc::new(Mutex::new(Pulse::new(devices.clone()))),
            commands: Arc::new(Mutex::new(GatewayCommands::new())),
            devices,
            pim_info: Mutex::new(None),
            reconnect: AtomicBool::new(true),
            connected,
            conn: Mutex::new(None),
            disconnect_callback: Mutex::new(None),
            reconnect_callback: Mutex::new(None),
            config,
        });
        match Inner::setup_loop(&inner).await? {
            Some(reader) => {
                tokio::spawn(Inner::supervise(inner.clone(), reader));
                Ok(UpbClient { inner })
            }
            // Stopped before the first attempt succeeded.
            None => Err(Error::Disconnected),
        }
    }

    /// Stop reconnecting and drop the connection. Outstanding requests
    /// complete with [`Error::Disconnected`].
    pub fn stop(&self) {
        self.inner.reconnect.store(false, Ordering::SeqCst);
        self.inner.handle_disconnect();
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.subscribe().borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe_connection(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Run a closure every time the connection is lost.
    pub fn set_disconnect_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.inner.disconnect_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Run a closure every time a connection attempt succeeds.
    pub fn set_reconnect_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.inner.reconnect_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Identity of the connected PIM, once initialization has run.
    pub fn pim_info(&self) -> Option<PimInfo> {
        *self.inner.pim_info.lock().unwrap()
    }

    /// Snapshot of a device's register memory, if it has been heard from.
    pub fn device_memory(&self, network_id: u8, device_id: u8) -> Option<DeviceMemory> {
        self.inner
            .devices
            .lock()
            .unwrap()
            .get(&(network_id, device_id))
            .cloned()
    }

    /// Transmit a bus packet and wait for its completion: the correlated
    /// report for commands that are answered, the transmitted echo for
    /// everything else.
    pub async fn transmit(
        &self,
        network_id: u8,
        destination_id: u8,
        mdid: Mdid,
        data: &[u8],
        options: TransmitOptions,
    ) -> Result<UpbPacket, Error> {
        self.inner
            .send_bus(packet::format_transmit(
                network_id,
                destination_id,
                mdid,
                data,
                options,
            ))
            .await
    }

    /// Convenience wrapper for the device control command set.
    pub async fn device_control(
        &self,
        network_id: u8,
        destination_id: u8,
        cmd: DeviceControlCmd,
        data: &[u8],
        link: bool,
    ) -> Result<UpbPacket, Error> {
        self.transmit(
            network_id,
            destination_id,
            Mdid::DeviceControl(cmd),
            data,
            TransmitOptions {
                link,
                ..TransmitOptions::default()
            },
        )
        .await
    }

    /// Gateway keep-alive. Only meaningful on authenticated connections.
    pub async fn keep_alive(&self) -> Result<(), Error> {
        if !self.inner.is_gateway() {
            return Err(Error::Invariant(
                "keep-alive is a gateway command".into(),
            ));
        }
        self.inner
            .gateway_command(GatewayCommand::KeepAlive)
            .await?;
        Ok(())
    }

    /// Read a device's full 256 byte register image, recovering its
    /// password along the way when one is set.
    ///
    /// The procedure: ask for the device signature, fan out register reads
    /// over the reported image length, then compare the device's checksums
    /// with sums over the image we read. A device with a password reports
    /// registers 2..4 as zero outside setup mode, so both checksums come up
    /// short by the same amount: the sum of the two password bytes. That
    /// delta drives a bounded search; each candidate is presented with
    /// start-setup and probed with a setup time query, which only a device
    /// in setup mode answers with a running timer.
    pub async fn read_device_registers(
        &self,
        network_id: u8,
        device_id: u8,
    ) -> Result<[u8; REGISTER_COUNT], Error> {
        let reply = self
            .inner
            .send_bus(packet::signature_request(network_id, device_id))
            .await?;
        let sig = match reply.body {
            PacketBody::DeviceSignature(sig) => sig,
            other => {
                return Err(Error::Invariant(format!(
                    "expected a signature report, got {:?}",
                    other
                )))
            }
        };
        debug!(
            "device {}:{} signature: id {:#06x}, setup {:#06x}, {} bytes",
            network_id, device_id, sig.id_checksum, sig.setup_checksum, sig.ct_bytes
        );

        // Queue every chunk up front; the multiplexer serializes them on
        // the wire.
        let pending: Vec<_> = {
            let mut pulse = self.inner.pulse.lock().unwrap();
            (0..sig.ct_bytes)
                .step_by(READ_CHUNK as usize)
                .map(|start| {
                    let count = (sig.ct_bytes - start).min(READ_CHUNK) as u8;
                    pulse.send_bus(packet::register_request(
                        network_id, device_id, start as u8, count,
                    ))
                })
                .collect()
        };
        for waiter in pending {
            waiter.await.map_err(|_| Error::Disconnected)??;
        }

        let (upbid_sum, setup_sum) = {
            let devices = self.inner.devices.lock().unwrap();
            let memory = devices
                .get(&(network_id, device_id))
                .ok_or_else(|| Error::Invariant("no register image after reads".into()))?;
            (memory.upbid_sum(), memory.setup_sum())
        };
        let id_delta = i64::from(sig.id_checksum) - i64::from(upbid_sum);
        let setup_delta = i64::from(sig.setup_checksum) - i64::from(setup_sum);
        if id_delta != setup_delta {
            return Err(Error::Invariant(format!(
                "checksum deltas disagree: id {id_delta}, setup {setup_delta}"
            )));
        }
        if !(0..=MAX_PASSWORD_SUM).contains(&id_delta) {
            return Err(Error::Invariant(format!(
                "checksum delta {id_delta} cannot be a password sum"
            )));
        }
        if id_delta != 0 {
            let password = self
                .recover_password(network_id, device_id, id_delta as u16)
                .await?;
            info!(
                "device {}:{} password recovered: {:#06x}",
                network_id, device_id, password
            );
        }

        let devices = self.inner.devices.lock().unwrap();
        Ok(*devices
            .get(&(network_id, device_id))
            .ok_or_else(|| Error::Invariant("device image vanished".into()))?
            .registers())
    }

    /// Try password candidates until the device enters setup mode.
    async fn recover_password(
        &self,
        network_id: u8,
        device_id: u8,
        delta: u16,
    ) -> Result<u16, Error> {
        debug!("searching for a password summing to {delta}");
        for (hi, lo) in password_candidates(delta) {
            let password = u16::from_be_bytes([hi, lo]);
            self.inner
                .send_bus(packet::start_setup_request(network_id, device_id, password))
                .await?;
            let reply = self
                .inner
                .send_bus(packet::setup_time_request(network_id, device_id))
                .await?;
            let timer = match reply.body {
                PacketBody::SetupTime {
                    setup_mode_timer, ..
                } => setup_mode_timer,
                _ => 0,
            };
            if timer == 0 {
                continue;
            }
            // In setup mode the device reports its password truthfully;
            // cross-check before trusting the candidate.
            self.inner
                .send_bus(packet::register_request(network_id, device_id, 2, 2))
                .await?;
            let reported = self
                .inner
                .devices
                .lock()
                .unwrap()
                .get(&(network_id, device_id))
                .map(DeviceMemory::password);
            if reported == Some(password) {
                return Ok(password);
            }
            return Err(Error::Invariant(format!(
                "device entered setup mode but reports password {:#06x?}",
                reported
            )));
        }
        Err(Error::Invariant(format!(
            "password search for delta {delta} exhausted"
        )))
    }
}

impl Inner {
    fn is_gateway(&self) -> bool {
        self.config.username.is_some() && self.config.password.is_some()
    }

    async fn send_bus(&self, packet: Vec<u8>) -> Result<UpbPacket, Error> {
        let waiter = self.pulse.lock().unwrap().send_bus(packet);
        waiter.await.map_err(|_| Error::Disconnected)?
    }

    async fn gateway_command(&self, cmd: GatewayCommand) -> Result<(), Error> {
        let waiter = self.commands.lock().unwrap().send(cmd, &[]);
        waiter.await.map_err(|_| Error::Disconnected)??;
        Ok(())
    }

    /// Retry setup until it succeeds, the client is stopped (`Ok(None)`),
    /// or the gateway rejects the credentials.
    async fn setup_loop(inner: &Arc<Inner>) -> Result<Option<JoinHandle<()>>, Error> {
        loop {
            if !inner.reconnect.load(Ordering::SeqCst) {
                return Ok(None);
            }
            match Inner::setup_once(inner).await {
                Ok(reader) => {
                    let callback = inner.reconnect_callback.lock().unwrap().clone();
                    if let Some(callback) = callback {
                        callback();
                    }
                    return Ok(Some(reader));
                }
                Err(Error::Auth) => return Err(Error::Auth),
                Err(err) => warn!("could not connect to PIM: {err}"),
            }
            tokio::time::sleep(inner.config.reconnect_interval).await;
        }
    }

    /// One connection attempt: TCP, gateway handshake when configured,
    /// PIM initialization, pulse mode.
    async fn setup_once(inner: &Arc<Inner>) -> Result<JoinHandle<()>, Error> {
        let config = &inner.config;
        let mut stream =
            transport::connect_tcp(&config.host, config.port, config.connect_timeout).await?;
        let dialect = if inner.is_gateway() {
            Dialect::Gateway
        } else {
            Dialect::RawAscii
        };
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            gateway::authenticate(&mut stream, username, password).await?;
        }

        let (read_half, write_half) = stream.into_split();
        let (tx, writer) = transport::spawn_writer(write_half);
        let sink = LineTx::new(tx, dialect);
        inner.pulse.lock().unwrap().set_sink(sink.clone());
        let reader = match dialect {
            Dialect::RawAscii => transport::spawn_raw_reader(read_half, inner.pulse.clone()),
            Dialect::Gateway => {
                inner.commands.lock().unwrap().set_sink(sink);
                transport::spawn_gateway_reader(
                    read_half,
                    inner.pulse.clone(),
                    inner.commands.clone(),
                )
            }
        };
        *inner.conn.lock().unwrap() = Some(Connection {
            reader: reader.abort_handle(),
            writer,
        });

        match Inner::initialize(inner, dialect).await {
            Ok(()) => {
                inner.connected.send_replace(true);
                info!("connected to PIM at {}:{}", config.host, config.port);
                Ok(reader)
            }
            Err(err) => {
                reader.abort();
                inner.handle_disconnect();
                Err(err)
            }
        }
    }

    async fn initialize(inner: &Arc<Inner>, dialect: Dialect) -> Result<(), Error> {
        if dialect == Dialect::Gateway {
            // Pulse telemetry would drown the register replies; pause it
            // around initialization.
            inner.gateway_command(GatewayCommand::ExitPulseMode).await?;
        }
        inner.pim_init().await?;
        if dialect == Dialect::Gateway {
            inner.gateway_command(GatewayCommand::StartPulseMode).await?;
        }
        Ok(())
    }

    /// Read the PIM's identity registers and switch it into message mode.
    async fn pim_init(&self) -> Result<(), Error> {
        let info = PimInfo {
            firmware_version: self.pim_read_u16(PimRegister::FirmwareVersion).await?,
            pim_options: self.pim_read_u8(PimRegister::PimOptions).await?,
            manufacturer_id: self.pim_read_u16(PimRegister::ManufacturerId).await?,
            network_id: self.pim_read_u8(PimRegister::NetworkId).await?,
            product_id: self.pim_read_u16(PimRegister::ProductId).await?,
            upb_options: self.pim_read_u8(PimRegister::UpbOptions).await?,
            upb_version: self.pim_read_u8(PimRegister::UpbVersion).await?,
            noise_floor: self.pim_read_u8(PimRegister::NoiseFloor).await?,
        };
        info!(
            "PIM firmware {:#06x}, manufacturer {:#06x}, product {:#06x}, network {}, noise floor {:#04x}",
            info.firmware_version,
            info.manufacturer_id,
            info.product_id,
            info.network_id,
            info.noise_floor
        );
        *self.pim_info.lock().unwrap() = Some(info);
        self.pulse
            .lock()
            .unwrap()
            .pim_write(PimRegister::PimOptions, &[PIM_OPTIONS_MESSAGE_MODE]);
        Ok(())
    }

    async fn pim_read(&self, register: PimRegister) -> Result<Vec<u8>, Error> {
        let waiter = self.pulse.lock().unwrap().pim_read(register);
        waiter.await.map_err(|_| Error::Disconnected)?
    }

    async fn pim_read_u8(&self, register: PimRegister) -> Result<u8, Error> {
        let values = self.pim_read(register).await?;
        values.first().copied().ok_or_else(|| {
            Error::Framing(format!("empty register reply for {:?}", register))
        })
    }

    async fn pim_read_u16(&self, register: PimRegister) -> Result<u16, Error> {
        let values = self.pim_read(register).await?;
        if values.len() < 2 {
            return Err(Error::Framing(format!(
                "short register reply for {:?}",
                register
            )));
        }
        Ok(u16::from_be_bytes([values[0], values[1]]))
    }

    /// Drop the connection and complete everything waiting on it.
    fn handle_disconnect(&self) {
        if let Some(conn) = self.conn.lock().unwrap().take() {
            conn.reader.abort();
            conn.writer.abort();
        }
        self.pulse.lock().unwrap().disconnect();
        self.commands.lock().unwrap().disconnect();
        self.connected.send_replace(false);
    }

    /// Keep the connection alive until stopped: wait for the reader task
    /// to die, tear down, reconnect.
    async fn supervise(inner: Arc<Inner>, mut reader: JoinHandle<()>) {
        loop {
            let _ = reader.await;
            if *inner.connected.subscribe().borrow() {
                error!("connection to PIM lost");
            }
            inner.handle_disconnect();
            let callback = inner.disconnect_callback.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback();
            }
            if !inner.reconnect.load(Ordering::SeqCst) {
                break;
            }
            debug!("reconnecting to PIM");
            match Inner::setup_loop(&inner).await {
                Ok(Some(handle)) => reader = handle,
                Ok(None) => break,
                Err(err) => {
                    error!("giving up on reconnecting: {err}");
                    break;
                }
            }
        }
    }
}

/// Is every nibble a decimal digit?
fn is_numeric(byte: u8) -> bool {
    byte & 0x0F <= 9 && byte >> 4 <= 9
}

/// Enumerate password candidates whose byte sum equals `delta`.
///
/// Installers overwhelmingly pick passwords that read as four decimal
/// digits, so those are tried first: ascending first byte over every pair
/// with all nibbles in 0..=9 (possible only for deltas up to 306). The
/// exhaustive phase then walks the remaining pairs, again by ascending
/// first byte, skipping the all-decimal ones already tried. Together the
/// phases cover each candidate pair exactly once, at most 512 in total.
fn password_candidates(delta: u16) -> Vec<(u8, u8)> {
    let mut candidates = Vec::new();
    let numeric_tried = delta <= MAX_NUMERIC_SUM;
    if numeric_tried {
        for hi in 0..=delta.min(0x99) {
            let lo = delta - hi;
            if lo <= 0x99 && is_numeric(hi as u8) && is_numeric(lo as u8) {
                candidates.push((hi as u8, lo as u8));
            }
        }
    }
    for hi in delta.saturating_sub(0xFF)..=delta.min(0xFF) {
        let lo = delta - hi;
        if numeric_tried && is_numeric(hi as u8) && is_numeric(lo as u8) {
            continue;
        }
        candidates.push((hi as u8, lo as u8));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pim::{PimCommand, PimLine};
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    #[test]
    fn config_defaults() {
        let config = ClientConfig::new("pim.local");
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.username.is_none());
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect_interval, Duration::from_secs(10));
    }

    #[test]
    fn candidates_cover_every_pair_exactly_once() {
        for delta in [1u16, 3, 18, 255, 306, 307, 400, 510, 512] {
            let candidates = password_candidates(delta);
            assert!(candidates.len() <= 512, "delta {delta}");
            let unique: HashSet<_> = candidates.iter().copied().collect();
            assert_eq!(unique.len(), candidates.len(), "duplicates for {delta}");
            for (hi, lo) in &candidates {
                assert_eq!(u16::from(*hi) + u16::from(*lo), delta);
            }
            let expected = (delta.saturating_sub(0xFF)..=delta.min(0xFF)).count();
            assert_eq!(unique.len(), expected, "coverage for {delta}");
        }
    }

    #[test]
    fn numeric_candidates_come_first_for_small_deltas() {
        let candidates = password_candidates(3);
        // 0x01 + 0x02 = 3 must be among the decimal-digit candidates.
        let split = candidates
            .iter()
            .position(|&(hi, lo)| !(is_numeric(hi) && is_numeric(lo)))
            .unwrap_or(candidates.len());
        let numeric = &candidates[..split];
        assert!(numeric.contains(&(0x01, 0x02)));
        assert!(numeric.contains(&(0x00, 0x03)));
        assert!(numeric.contains(&(0x03, 0x00)));
        for (hi, lo) in numeric {
            assert!(is_numeric(*hi) && is_numeric(*lo));
        }
    }

    #[test]
    fn large_deltas_skip_the_numeric_phase() {
        let candidates = password_candidates(400);
        // 400 > 306: no pair of all-decimal bytes can reach it.
        assert!(!candidates.is_empty());
        assert_eq!(
            candidates.first().copied(),
            Some((400u16.saturating_sub(0xFF) as u8, 0xFF))
        );
    }

    #[test]
    fn numeric_bytes_are_bcd_shaped() {
        assert!(is_numeric(0x09));
        assert!(is_numeric(0x99));
        assert!(!is_numeric(0x0A));
        assert!(!is_numeric(0xA0));
    }

    /// A client whose line parser writes to a channel instead of a socket.
    fn test_client() -> (UpbClient, mpsc::UnboundedReceiver<Vec<u8>>) {
        let devices = Arc::new(Mutex::new(DeviceRegistry::new()));
        let pulse = Arc::new(Mutex::new(Pulse::new(devices.clone())));
        let (tx, wire) = mpsc::unbounded_channel();
        pulse.lock().unwrap().set_sink(LineTx::new(tx, Dialect::RawAscii));
        let (connected, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            config: ClientConfig::new("simulated"),
            pulse,
            commands: Arc::new(Mutex::new(GatewayCommands::new())),
            devices,
            pim_info: Mutex::new(None),
            reconnect: AtomicBool::new(true),
            connected,
            conn: Mutex::new(None),
            disconnect_callback: Mutex::new(None),
            reconnect_callback: Mutex::new(None),
        });
        (UpbClient { inner }, wire)
    }

    /// A core report from device 3 on network 5.
    fn device_report(report: packet::CoreReport, payload: &[u8]) -> Vec<u8> {
        let mut bytes = packet::format_transmit(
            5,
            0xFF,
            Mdid::Report(report),
            payload,
            TransmitOptions::default(),
        );
        bytes[4] = 3;
        let last = bytes.len() - 1;
        bytes[last] = packet::cksum(&bytes[..last]);
        bytes
    }

    /// Feed one bus packet as pulse telemetry: start token, four crumb
    /// lines per byte, ACK. The sequence counter restarts at zero because
    /// every packet here is bracketed by an ACK.
    fn feed_lines(pulse: &Mutex<Pulse>, bytes: &[u8], transmitted: bool) {
        let mut pulse = pulse.lock().unwrap();
        pulse.line_received(b"$");
        let mut seq = 0u8;
        for &byte in bytes {
            for crumb_no in 0..4 {
                let two_bits = (byte >> (6 - 2 * crumb_no)) & 0x03;
                let seq_char = format!("{:x}", seq).as_bytes()[0];
                let line = if transmitted {
                    [PimLine::Transmitted as u8, 0x30 + two_bits, seq_char]
                } else {
                    [0x30 + two_bits, 0x30 + two_bits, seq_char]
                };
                pulse.line_received(&line);
                seq = (seq + 1) & 0x0F;
            }
        }
        pulse.line_received(b"K");
    }

    /// Walk `read_device_registers` against a simulated device whose
    /// password bytes read as zero and whose checksums are off by the
    /// password sum. The client has to try start-setup candidates until
    /// 0x0102 lands, then confirm it from registers 2..4.
    #[tokio::test]
    async fn recovers_a_device_password_end_to_end() {
        let (client, mut wire) = test_client();
        let pulse = client.inner.pulse.clone();

        let mut true_regs = [0u8; 256];
        true_regs[0] = 5; // network id
        true_regs[1] = 3; // unit id
        true_regs[2] = 0x01;
        true_regs[3] = 0x02;
        let id_checksum: u16 = true_regs[..64].iter().map(|&b| u16::from(b)).sum();
        let ct_bytes = 64u16;
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let sim_attempts = attempts.clone();
        let simulator = tokio::spawn(async move {
            let mut in_setup = false;
            loop {
                let frame =
                    match tokio::time::timeout(Duration::from_millis(5), wire.recv()).await {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(_) => {
                            // Quiet line; lets the multiplexer start the
                            // next queued send.
                            pulse.lock().unwrap().line_received(b"-");
                            continue;
                        }
                    };
                if frame[0] != PimCommand::NetworkTransmit as u8 {
                    continue;
                }
                let bytes = hex::decode(&frame[1..frame.len() - 1]).unwrap();
                let request = packet::parse_packet(&bytes).unwrap();

                // Echo what the PIM put on the wire, header byte first.
                let mut echo = vec![0x00];
                echo.extend_from_slice(&bytes);
                feed_lines(&pulse, &echo, true);

                let reply = match request.mdid {
                    Mdid::Core(packet::CoreCmd::GetDeviceSignature) => {
                        let mut payload = vec![0x12, 0x34, 0x40, 0x08];
                        payload.extend_from_slice(&id_checksum.to_be_bytes());
                        payload.extend_from_slice(&id_checksum.to_be_bytes());
                        payload.push(ct_bytes as u8);
                        payload.extend_from_slice(&[0u8; 8]);
                        Some(device_report(packet::CoreReport::DeviceSignature, &payload))
                    }
                    Mdid::Core(packet::CoreCmd::GetRegisterValues) => {
                        let (start, count) = match &request.body {
                            PacketBody::Raw(data) => (data[0] as usize, data[1] as usize),
                            _ => (0, 0),
                        };
                        let mut window = true_regs[start..start + count].to_vec();
                        if !in_setup {
                            // Outside setup mode the password reads as zero.
                            for (offset, value) in window.iter_mut().enumerate() {
                                if (2..4).contains(&(start + offset)) {
                                    *value = 0;
                                }
                            }
                        }
                        let mut payload = vec![start as u8];
                        payload.extend_from_slice(&window);
                        Some(device_report(packet::CoreReport::RegisterValues, &payload))
                    }
                    Mdid::Core(packet::CoreCmd::StartSetup) => {
                        if let PacketBody::StartSetup { password } = request.body {
                            sim_attempts.lock().unwrap().push(password);
                            if password == 0x0102 {
                                in_setup = true;
                            }
                        }
                        None
                    }
                    Mdid::Core(packet::CoreCmd::GetSetupTime) => {
                        let timer = if in_setup { 0xF0 } else { 0x00 };
                        Some(device_report(packet::CoreReport::SetupTime, &[0x00, timer]))
                    }
                    _ => None,
                };
                if let Some(reply) = reply {
                    feed_lines(&pulse, &reply, false);
                }
            }
        });

        let registers = client.read_device_registers(5, 3).await.unwrap();
        assert_eq!(&registers[..4], &[5, 3, 0x01, 0x02]);
        // Delta 3: 0x0003 is probed and rejected, then 0x0102 succeeds.
        assert_eq!(*attempts.lock().unwrap(), vec![0x0003, 0x0102]);
        assert_eq!(client.device_memory(5, 3).unwrap().password(), 0x0102);
        simulator.abort();
    }
}
