//! PIM line parser, bit stream reassembler and request multiplexer.
//!
//! In message mode the PIM reports every powerline pulse as one short ASCII
//! line. Bus packets arrive as two bit crumbs, four to a byte, bracketed by
//! sync/start tokens and finished by an ACK or NAK. The bus protocol has no
//! request ids, so replies are correlated by the transmitted bytes
//! themselves: the PIM echoes what it puts on the wire, the echo is kept as
//! `last_transmitted`, and the next matching report resolves the waiter
//! registered under exactly those bytes. That only works because at most one
//! request is ever in flight.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::device::DeviceRegistry;
use crate::error::Error;
use crate::packet::{self, cksum, hexdump, CoreCmd, Mdid, PacketBody, UpbPacket};
use crate::pim::{PimCommand, PimLine, PimRegister, PimReport};
use crate::transport::LineTx;

/// How long to wait for the PIM before rewriting the active frame.
const RESEND_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound on a reassembled bus packet.
const PACKET_BUF_LEN: usize = 64;

/// A queued request waiting for its turn on the wire.
enum Waiter {
    Bus(oneshot::Sender<Result<UpbPacket, Error>>),
    Reg(oneshot::Sender<Result<Vec<u8>, Error>>),
}

impl Waiter {
    fn fail(self) {
        match self {
            Waiter::Bus(tx) => {
                let _ = tx.send(Err(Error::Disconnected));
            }
            Waiter::Reg(tx) => {
                let _ = tx.send(Err(Error::Disconnected));
            }
        }
    }
}

/// Frame a payload for the PIM serial port: command byte, upper-cased hex,
/// carriage return.
fn wire_frame(cmd: PimCommand, packet: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(packet.len() * 2 + 2);
    msg.push(cmd as u8);
    msg.extend_from_slice(packet::hex_upper(packet).as_bytes());
    msg.push(b'\r');
    msg
}

/// Commands that are answered by a core report. Everything else is done
/// once the PIM has echoed it onto the wire.
fn expects_report(mdid: Mdid) -> bool {
    matches!(
        mdid,
        Mdid::Core(
            CoreCmd::GetRegisterValues
                | CoreCmd::GetDeviceSignature
                | CoreCmd::GetSetupTime
                | CoreCmd::GetDeviceStatus
        )
    )
}

pub(crate) struct Pulse {
    sink: Option<LineTx>,
    devices: Arc<Mutex<DeviceRegistry>>,

    // Request multiplexer.
    waiters: VecDeque<(Waiter, PimCommand, Vec<u8>)>,
    in_flight_tx: HashMap<Vec<u8>, oneshot::Sender<Result<UpbPacket, Error>>>,
    in_flight_reg: HashMap<u8, oneshot::Sender<Result<Vec<u8>, Error>>>,
    in_transaction: bool,
    active_packet: Option<(PimCommand, Vec<u8>)>,
    last_transmitted: Option<Vec<u8>>,
    cmd_timeout: Option<JoinHandle<()>>,

    // Line state.
    pulse_mode: bool,
    idle_count: u32,

    // Bit stream reassembly.
    transmitted: bool,
    packet_buf: [u8; PACKET_BUF_LEN],
    packet_byte: usize,
    packet_crumb: u8,
    pulse_data_seq: u8,
}

impl Pulse {
    pub(crate) fn new(devices: Arc<Mutex<DeviceRegistry>>) -> Pulse {
        Pulse {
            sink: None,
            devices,
            waiters: VecDeque::new(),
            in_flight_tx: HashMap::new(),
            in_flight_reg: HashMap::new(),
            in_transaction: false,
            active_packet: None,
            last_transmitted: None,
            cmd_timeout: None,
            pulse_mode: false,
            idle_count: 0,
            transmitted: false,
            packet_buf: [0; PACKET_BUF_LEN],
            packet_byte: 0,
            packet_crumb: 0,
            pulse_data_seq: 0,
        }
    }

    pub(crate) fn set_sink(&mut self, sink: LineTx) {
        self.sink = Some(sink);
    }

    /// Queue a bus packet for transmission. The returned receiver resolves
    /// with the correlated reply, or with the transmitted echo for commands
    /// that have none.
    pub(crate) fn send_bus(&mut self, packet: Vec<u8>) -> oneshot::Receiver<Result<UpbPacket, Error>> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .push_back((Waiter::Bus(tx), PimCommand::NetworkTransmit, packet));
        if !self.pulse_mode {
            self.send_next();
        }
        rx
    }

    /// Queue a PIM register read. Resolves with the raw register values.
    pub(crate) fn pim_read(&mut self, register: PimRegister) -> oneshot::Receiver<Result<Vec<u8>, Error>> {
        let mut packet = vec![register.addr(), register.read_len()];
        packet.push(cksum(&packet));
        let (tx, rx) = oneshot::channel();
        self.waiters
            .push_back((Waiter::Reg(tx), PimCommand::ReadRegisters, packet));
        if !self.pulse_mode {
            self.send_next();
        }
        rx
    }

    /// Write PIM registers. Register writes produce no report frame, so
    /// this bypasses the in-flight bookkeeping.
    pub(crate) fn pim_write(&mut self, register: PimRegister, values: &[u8]) {
        let mut packet = vec![register.addr()];
        packet.extend_from_slice(values);
        packet.push(cksum(&packet));
        debug!("writing pim registers: {}", hexdump(&packet));
        self.send_wire(&wire_frame(PimCommand::WriteRegisters, &packet));
    }

    /// Tear down for a lost connection: stop the timer and complete every
    /// queued and in-flight waiter so nothing leaks across reconnects.
    pub(crate) fn disconnect(&mut self) {
        self.clear_resend();
        self.sink = None;
        for (_, waiter) in self.in_flight_tx.drain() {
            let _ = waiter.send(Err(Error::Disconnected));
        }
        for (_, waiter) in self.in_flight_reg.drain() {
            let _ = waiter.send(Err(Error::Disconnected));
        }
        for (waiter, _, _) in self.waiters.drain(..) {
            waiter.fail();
        }
        self.in_transaction = false;
        self.active_packet = None;
        self.last_transmitted = None;
        self.pulse_mode = false;
        self.idle_count = 0;
        self.set_state_zero();
    }

    fn send_wire(&self, bytes: &[u8]) {
        match &self.sink {
            Some(sink) => sink.send_serial(bytes),
            None => warn!("dropping write, not connected"),
        }
    }

    fn arm_resend(&mut self, wire: Vec<u8>) {
        self.clear_resend();
        let Some(sink) = self.sink.clone() else {
            return;
        };
        self.cmd_timeout = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(RESEND_INTERVAL).await;
                warn!("resending packet due to timeout");
                sink.send_serial(&wire);
            }
        }));
    }

    fn clear_resend(&mut self) {
        if let Some(timer) = self.cmd_timeout.take() {
            timer.abort();
        }
    }

    /// Start the next queued request if nothing is in flight. Bus
    /// transmissions additionally wait for pulse mode to be confirmed live
    /// and are requeued until then.
    fn send_next(&mut self) {
        if self.waiters.is_empty()
            || self.in_transaction
            || !self.in_flight_tx.is_empty()
            || !self.in_flight_reg.is_empty()
        {
            return;
        }
        let Some((waiter, cmd, packet)) = self.waiters.pop_front() else {
            return;
        };
        match (cmd, waiter) {
            (PimCommand::NetworkTransmit, Waiter::Bus(tx)) => {
                if !self.pulse_mode {
                    debug!("waiting on pulse mode, requeueing transmission");
                    self.waiters
                        .push_back((Waiter::Bus(tx), cmd, packet));
                    return;
                }
                self.in_flight_tx.insert(packet.clone(), tx);
            }
            (PimCommand::ReadRegisters, Waiter::Reg(tx)) => {
                self.in_flight_reg.insert(packet[0], tx);
            }
            (cmd, waiter) => {
                error!("unqueueable pim command: {:?}", cmd);
                waiter.fail();
                return;
            }
        }
        self.in_transaction = true;
        self.active_packet = Some((cmd, packet.clone()));
        let wire = wire_frame(cmd, &packet);
        debug!("sending packet: {}", hexdump(&packet));
        self.send_wire(&wire);
        self.arm_resend(wire);
    }

    /// The line went quiet: pulse mode is live and the wire is ours.
    fn handle_blackout(&mut self) {
        self.pulse_mode = true;
        self.send_next();
    }

    fn set_state_zero(&mut self) {
        self.transmitted = false;
        self.pulse_data_seq = 0;
        self.packet_crumb = 0;
        self.packet_byte = 0;
    }

    /// Consume one PIM line. Lines must be fed in arrival order; the
    /// reassembly depends on it.
    pub(crate) fn line_received(&mut self, line: &[u8]) {
        let Some(&first) = line.first() else {
            return;
        };
        let Ok(token) = PimLine::try_from(first) else {
            error!("PIM failed to parse line: {}", hexdump(line));
            return;
        };
        if token == PimLine::Idle {
            self.handle_blackout();
            self.idle_count += 1;
        } else {
            if self.idle_count != 0 {
                debug!("PIM idle count: {}", self.idle_count);
            }
            self.idle_count = 0;
        }
        match token {
            PimLine::Idle => {}
            PimLine::Drop => {
                error!("PIM dropped a message");
                self.set_state_zero();
            }
            PimLine::PimReport => self.pim_report(line),
            PimLine::Sync | PimLine::Start => {
                self.handle_blackout();
                self.packet_byte = 0;
                self.packet_crumb = 0;
            }
            token if token.is_data() => {
                self.handle_blackout();
                if line.len() == 3 {
                    self.take_crumb(token as u8 - PimLine::Data0 as u8, line[2]);
                }
            }
            PimLine::Transmitted => {
                self.handle_blackout();
                self.transmitted = true;
                if line.len() == 3 {
                    let crumb = line[1].wrapping_sub(PimLine::Data0 as u8);
                    self.take_crumb(crumb, line[2]);
                }
            }
            PimLine::Ack | PimLine::Nak => {
                self.handle_blackout();
                let message = self.packet_buf[..self.packet_byte].to_vec();
                let was_transmitted = self.transmitted;
                self.set_state_zero();
                if !message.is_empty() {
                    if was_transmitted {
                        self.process_transmitted(&message);
                    } else {
                        self.process_received(&message);
                    }
                }
            }
            _ => unreachable!("data tokens matched above"),
        }
    }

    /// Pack one two bit crumb into the reassembly buffer, high bits first.
    fn take_crumb(&mut self, two_bits: u8, seq_char: u8) {
        let Some(seq) = (seq_char as char).to_digit(16) else {
            warn!("unparseable pulse sequence digit: {:#04x}", seq_char);
            self.set_state_zero();
            return;
        };
        if seq as u8 != self.pulse_data_seq {
            warn!(
                "bad pulse sequence: got {:#03x}, expected {:#03x}",
                seq, self.pulse_data_seq
            );
            self.set_state_zero();
            return;
        }
        if two_bits > 3 || self.packet_byte >= PACKET_BUF_LEN {
            warn!("pulse data overflow, dropping packet");
            self.set_state_zero();
            return;
        }
        let shift = (3 - self.packet_crumb) * 2;
        if self.packet_crumb == 0 {
            self.packet_buf[self.packet_byte] = two_bits << 6;
        } else {
            self.packet_buf[self.packet_byte] |= two_bits << shift;
        }
        self.packet_crumb += 1;
        if self.packet_crumb == 4 {
            self.packet_crumb = 0;
            self.packet_byte += 1;
        }
        self.pulse_data_seq = (self.pulse_data_seq + 1) & 0x0F;
    }

    /// Out of band report from the PIM itself.
    fn pim_report(&mut self, line: &[u8]) {
        if line.len() < 2 {
            error!("got corrupt pim report: {}", hexdump(line));
            return;
        }
        match PimReport::try_from(line[1]) {
            Ok(PimReport::Registers) => match hex::decode(&line[2..]) {
                Ok(register_data) if !register_data.is_empty() => {
                    let start = register_data[0];
                    let register_val = register_data[1..].to_vec();
                    debug!(
                        "pim registers start {:#04x}: {}",
                        start,
                        hexdump(&register_val)
                    );
                    let is_active = matches!(
                        &self.active_packet,
                        Some((PimCommand::ReadRegisters, packet))
                            if packet.first() == Some(&start)
                    );
                    if is_active {
                        self.resolve_reg(start, register_val);
                    }
                }
                _ => error!("corrupt pim register report: {}", hexdump(line)),
            },
            Ok(PimReport::Accept) => debug!("got pim accept"),
            Ok(PimReport::Busy) => self.rewrite_active(),
            Ok(other) => debug!("pim report: {:?}", other),
            Err(_) => error!("unknown pim report subtype: {:#04x}", line[1]),
        }
    }

    /// The PIM was busy; put the active frame back on the wire.
    fn rewrite_active(&mut self) {
        if !self.in_transaction {
            return;
        }
        if let Some((cmd, packet)) = &self.active_packet {
            warn!("pim busy, rewriting packet: {}", hexdump(packet));
            let wire = wire_frame(*cmd, packet);
            self.send_wire(&wire);
        }
    }

    fn resolve_reg(&mut self, address: u8, registers: Vec<u8>) {
        if let Some(waiter) = self.in_flight_reg.remove(&address) {
            self.clear_resend();
            let _ = waiter.send(Ok(registers));
            self.in_transaction = false;
            self.active_packet = None;
            self.send_next();
        }
    }

    /// Complete the in-flight transmission keyed by the transmitted echo.
    fn resolve_tx(&mut self, reply: UpbPacket) {
        let Some(key) = self.last_transmitted.take() else {
            return;
        };
        if let Some(waiter) = self.in_flight_tx.remove(&key) {
            self.clear_resend();
            let _ = waiter.send(Ok(reply));
            self.in_transaction = false;
            self.active_packet = None;
            self.send_next();
        }
    }

    /// A complete packet arrived from the bus.
    fn process_received(&mut self, message: &[u8]) {
        debug!("got upb message data: {}", hexdump(message));
        let packet = match packet::parse_packet(message) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("dropping bus packet: {err}");
                return;
            }
        };
        match &packet.body {
            PacketBody::RegisterValues {
                setup_register,
                values,
            } => {
                let key = (packet.network_id, packet.device_id);
                self.devices
                    .lock()
                    .unwrap()
                    .entry(key)
                    .or_default()
                    .update_registers(*setup_register as usize, values);
                self.resolve_tx(packet);
            }
            PacketBody::DeviceSignature(sig) => {
                let key = (packet.network_id, packet.device_id);
                self.devices
                    .lock()
                    .unwrap()
                    .entry(key)
                    .or_default()
                    .update_signature(sig.id_checksum, sig.setup_checksum, sig.ct_bytes);
                self.resolve_tx(packet);
            }
            PacketBody::SetupTime { .. } => self.resolve_tx(packet),
            _ => debug!("unhandled bus packet: {:?}", packet),
        }
    }

    /// The PIM echoed a packet it transmitted for us. The first byte is a
    /// PIM header, not part of the bus packet.
    fn process_transmitted(&mut self, message: &[u8]) {
        if message.len() < 2 {
            return;
        }
        let packet = message[1..].to_vec();
        debug!("pim transmitted packet: {}", hexdump(&packet));
        self.last_transmitted = Some(packet.clone());
        match packet::parse_packet(&packet) {
            Ok(parsed) => {
                if !expects_report(parsed.mdid) {
                    // No reply is coming; the echo completes the request.
                    self.resolve_tx(parsed);
                }
            }
            Err(err) => warn!("unparseable transmitted packet: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{register_request, signature_request};
    use crate::transport::{Dialect, LineTx};
    use tokio::sync::mpsc;

    fn test_pulse() -> (Pulse, Arc<Mutex<DeviceRegistry>>) {
        let devices = Arc::new(Mutex::new(DeviceRegistry::new()));
        (Pulse::new(devices.clone()), devices)
    }

    fn sink_pulse() -> (
        Pulse,
        Arc<Mutex<DeviceRegistry>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (mut pulse, devices) = test_pulse();
        let (tx, rx) = mpsc::unbounded_channel();
        pulse.set_sink(LineTx::new(tx, Dialect::RawAscii));
        (pulse, devices, rx)
    }

    /// Feed one packet byte as four data token lines.
    fn feed_data_byte(pulse: &mut Pulse, byte: u8, transmitted: bool) {
        for crumb_no in 0..4 {
            let two_bits = (byte >> (6 - 2 * crumb_no)) & 0x03;
            let seq = format!("{:x}", pulse.pulse_data_seq).as_bytes()[0];
            let line = if transmitted {
                [PimLine::Transmitted as u8, 0x30 + two_bits, seq]
            } else {
                [0x30 + two_bits, 0x30 + two_bits, seq]
            };
            pulse.line_received(&line);
        }
    }

    fn feed_packet(pulse: &mut Pulse, bytes: &[u8], transmitted: bool) {
        pulse.line_received(b"$");
        for &byte in bytes {
            feed_data_byte(pulse, byte, transmitted);
        }
        pulse.line_received(b"K");
    }

    /// A register values report from device 3 on network 1.
    fn register_report(start: u8, values: &[u8]) -> Vec<u8> {
        let mut payload = vec![start];
        payload.extend_from_slice(values);
        let mut bytes = packet::format_transmit(
            1,
            0xFF,
            Mdid::Report(crate::packet::CoreReport::RegisterValues),
            &payload,
            Default::default(),
        );
        bytes[4] = 3; // source is the device, not the PIM
        let last = bytes.len() - 1;
        bytes[last] = cksum(&bytes[..last]);
        bytes
    }

    #[test]
    fn reassembles_and_dispatches_a_received_report() {
        let (mut pulse, devices) = test_pulse();
        let report = register_report(0x10, &[0xDE, 0xAD, 0xBE]);
        feed_packet(&mut pulse, &report, false);

        let devices = devices.lock().unwrap();
        let memory = devices.get(&(1, 3)).expect("device registered");
        assert_eq!(&memory.registers()[0x10..0x13], &[0xDE, 0xAD, 0xBE]);
        // Zero state after the ACK.
        assert_eq!(pulse.packet_byte, 0);
        assert_eq!(pulse.packet_crumb, 0);
        assert_eq!(pulse.pulse_data_seq, 0);
        assert!(!pulse.transmitted);
    }

    #[test]
    fn bad_sequence_resets_the_reassembler() {
        let (mut pulse, _devices) = test_pulse();
        pulse.line_received(b"$");
        feed_data_byte(&mut pulse, 0xAA, false);
        assert_eq!(pulse.packet_byte, 1);
        // Sequence jumps ahead: the packet is dropped.
        pulse.line_received(&[0x31, 0x31, b'9']);
        assert_eq!(pulse.packet_byte, 0);
        assert_eq!(pulse.pulse_data_seq, 0);
    }

    #[test]
    fn reassembler_state_stays_bounded() {
        let (mut pulse, _devices) = test_pulse();
        pulse.line_received(b"$");
        for _ in 0..(PACKET_BUF_LEN + 8) {
            feed_data_byte(&mut pulse, 0x55, false);
            assert!(pulse.packet_byte <= PACKET_BUF_LEN);
            assert!(pulse.packet_crumb <= 3);
            assert!(pulse.pulse_data_seq <= 0x0F);
        }
    }

    #[tokio::test]
    async fn multiplexer_preserves_fifo_order() {
        let (mut pulse, _devices, mut wire) = sink_pulse();
        pulse.line_received(b"-"); // pulse mode confirmed live

        let request_a = register_request(1, 3, 0x00, 16);
        let request_b = register_request(1, 3, 0x10, 16);
        let request_c = register_request(1, 3, 0x20, 16);
        let rx_a = pulse.send_bus(request_a.clone());
        let _rx_b = pulse.send_bus(request_b.clone());
        let _rx_c = pulse.send_bus(request_c.clone());

        // Nothing goes out until the line idles again.
        assert!(wire.try_recv().is_err());
        pulse.line_received(b"-");
        let sent = wire.try_recv().expect("A on the wire");
        assert_eq!(sent, wire_frame(PimCommand::NetworkTransmit, &request_a));
        // B stays queued while A is in flight.
        assert!(wire.try_recv().is_err());

        // PIM echoes A (with its one byte header), then the device answers.
        let mut echo = vec![0x99];
        echo.extend_from_slice(&request_a);
        feed_packet(&mut pulse, &echo, true);
        assert!(wire.try_recv().is_err());
        feed_packet(&mut pulse, &register_report(0x00, &[0u8; 16]), false);

        let reply = rx_a.await.unwrap().unwrap();
        assert!(matches!(reply.body, PacketBody::RegisterValues { .. }));

        // B went out on resolution; C is still waiting.
        let sent = wire.try_recv().expect("B on the wire");
        assert_eq!(sent, wire_frame(PimCommand::NetworkTransmit, &request_b));
        assert!(wire.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_setup_resolves_on_the_transmitted_echo() {
        let (mut pulse, _devices, mut wire) = sink_pulse();
        pulse.line_received(b"-");
        let request = packet::start_setup_request(1, 3, 0x0102);
        let rx = pulse.send_bus(request.clone());
        pulse.line_received(b"-");
        wire.try_recv().expect("request on the wire");

        let mut echo = vec![0x99];
        echo.extend_from_slice(&request);
        feed_packet(&mut pulse, &echo, true);

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.body, PacketBody::StartSetup { password: 0x0102 });
    }

    #[tokio::test]
    async fn pim_register_read_resolves_by_address() {
        let (mut pulse, _devices, mut wire) = sink_pulse();
        let rx = pulse.pim_read(PimRegister::FirmwareVersion);
        // Reads go out immediately before pulse mode is up.
        let sent = wire.try_recv().expect("read on the wire");
        assert_eq!(sent[0], PimCommand::ReadRegisters as u8);

        // Report for a different address is ignored.
        pulse.line_received(b"PR0EFFFF");
        // Matching report resolves the waiter.
        pulse.line_received(b"PR0A0405");
        let values = rx.await.unwrap().unwrap();
        assert_eq!(values, vec![0x04, 0x05]);
    }

    #[tokio::test]
    async fn disconnect_fails_all_waiters() {
        let (mut pulse, _devices, _wire) = sink_pulse();
        let rx_read = pulse.pim_read(PimRegister::NoiseFloor);
        let rx_bus = pulse.send_bus(signature_request(1, 3));
        pulse.disconnect();
        assert!(matches!(rx_read.await.unwrap(), Err(Error::Disconnected)));
        assert!(matches!(rx_bus.await.unwrap(), Err(Error::Disconnected)));
    }
}
