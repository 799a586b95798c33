//! UPB bus packet encoding and decoding.
//!
//! A bus packet is at most 24 bytes on the wire: a two byte control word,
//! network id, destination id, source id, one MDID byte, an optional data
//! field and a trailing one byte checksum.

use num_enum::TryFromPrimitive;

use crate::error::Error;

/// Source id the PIM stamps on packets it originates.
pub const DEFAULT_SOURCE_ID: u8 = 0xFF;

// Header (5 bytes) + MDID + checksum.
const PACKET_OVERHEAD: usize = 7;

/// UPB packet checksum: two's complement of the byte sum.
pub fn cksum(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// Hex encode with the digits upper-cased.
///
/// The PIM wants its ASCII hex "case swapped"; since plain hex encoding is
/// lower case that amounts to upper-casing every digit. Kept as a named
/// helper so the oddity has exactly one home.
pub fn hex_upper(data: &[u8]) -> String {
    let mut s = hex::encode(data);
    s.make_ascii_uppercase();
    s
}

/// Colon separated hex for log output.
pub fn hexdump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// The high three bits of the MDID byte select a command set.
#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum MdidSet {
    Core = 0x00,
    DeviceControl = 0x20,
    CoreReport = 0x80,
}

/// Core command set (MDID set 0x00).
#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum CoreCmd {
    Null = 0x00,
    WriteEnable = 0x01,
    WriteProtect = 0x02,
    StartSetup = 0x03,
    StopSetup = 0x04,
    GetSetupTime = 0x05,
    AutoAddress = 0x06,
    GetDeviceStatus = 0x07,
    SetDeviceControl = 0x08,
    GetDeviceSignature = 0x0F,
    GetRegisterValues = 0x10,
    SetRegisterValues = 0x11,
}

/// Device control command set (MDID set 0x20).
#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum DeviceControlCmd {
    Activate = 0x00,
    Deactivate = 0x01,
    Goto = 0x02,
    FadeStart = 0x03,
    FadeStop = 0x04,
    Blink = 0x05,
    Indicate = 0x06,
    Toggle = 0x07,
    ReportState = 0x10,
    StoreState = 0x11,
}

/// Core report set (MDID set 0x80). Reports carry the command value of the
/// request they answer.
#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum CoreReport {
    Ack = 0x00,
    SetupTime = 0x05,
    DeviceState = 0x06,
    DeviceStatus = 0x07,
    DeviceSignature = 0x0F,
    RegisterValues = 0x10,
}

/// Decoded MDID byte: set plus command within the set.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Mdid {
    Core(CoreCmd),
    DeviceControl(DeviceControlCmd),
    Report(CoreReport),
}

impl Mdid {
    pub fn from_byte(byte: u8) -> Result<Mdid, Error> {
        let set = MdidSet::try_from(byte & 0xE0)
            .map_err(|_| Error::Framing(format!("unknown MDID set in {:#04x}", byte)))?;
        let cmd = byte & 0x1F;
        let unknown = || Error::Framing(format!("unknown MDID command {:#04x}", byte));
        Ok(match set {
            MdidSet::Core => Mdid::Core(CoreCmd::try_from(cmd).map_err(|_| unknown())?),
            MdidSet::DeviceControl => {
                Mdid::DeviceControl(DeviceControlCmd::try_from(cmd).map_err(|_| unknown())?)
            }
            MdidSet::CoreReport => Mdid::Report(CoreReport::try_from(cmd).map_err(|_| unknown())?),
        })
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Mdid::Core(cmd) => MdidSet::Core as u8 | cmd as u8,
            Mdid::DeviceControl(cmd) => MdidSet::DeviceControl as u8 | cmd as u8,
            Mdid::Report(cmd) => MdidSet::CoreReport as u8 | cmd as u8,
        }
    }

    pub fn set(self) -> MdidSet {
        match self {
            Mdid::Core(_) => MdidSet::Core,
            Mdid::DeviceControl(_) => MdidSet::DeviceControl,
            Mdid::Report(_) => MdidSet::CoreReport,
        }
    }
}

/// Acknowledgement behavior requested from the destination device.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum AckRequest {
    /// Acknowledge but do not requeue on NAK. This is the behavior the PIM
    /// applies to everything the client transmits.
    NoRequeueOnNak = 0x00,
    /// Request an acknowledgement message from the destination.
    Message = 0x02,
}

impl Default for AckRequest {
    fn default() -> AckRequest {
        AckRequest::NoRequeueOnNak
    }
}

/// Repeater request field of the control word.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum Repeater {
    None = 0x00,
    One = 0x01,
    Two = 0x02,
    Four = 0x03,
}

impl Default for Repeater {
    fn default() -> Repeater {
        Repeater::None
    }
}

/// Control word options for an outbound transmission.
///
/// The defaults match what the PIM itself uses for directed commands:
/// unicast, acknowledge without requeue, no repeating, count and sequence
/// both zero.
#[derive(Debug, Default, Copy, Clone)]
pub struct TransmitOptions {
    /// Broadcast to a link instead of addressing a single device.
    pub link: bool,
    pub ack: AckRequest,
    pub repeater: Repeater,
    /// Transmit count, 0..=3.
    pub cnt: u8,
    /// Transmit sequence, 0..=3.
    pub seq: u8,
}

/// Typed view of a decoded packet body, selected by MDID.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum PacketBody {
    /// Register values report: starting register plus the values read.
    RegisterValues { setup_register: u8, values: Vec<u8> },
    DeviceSignature(DeviceSignature),
    SetupTime {
        setup_mode_register: u8,
        setup_mode_timer: u8,
    },
    /// Start-setup echo; carries the password the PIM just put on the wire.
    StartSetup { password: u16 },
    Raw(Vec<u8>),
}

/// Device signature report payload.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct DeviceSignature {
    pub random_number: u16,
    pub device_signal: u8,
    pub device_noise: u8,
    /// Checksum the device computed over its first 64 registers.
    pub id_checksum: u16,
    /// Checksum the device computed over its whole setup image.
    pub setup_checksum: u16,
    /// Length of the setup image. The wire encodes 256 as zero.
    pub ct_bytes: u16,
    pub diagnostic: [u8; 8],
}

/// A decoded bus packet.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct UpbPacket {
    pub link: bool,
    pub repeater: u8,
    pub ack_request: u8,
    pub transmit_cnt: u8,
    pub transmit_seq: u8,
    pub network_id: u8,
    pub destination_id: u8,
    /// Source of the packet (the answering device for reports).
    pub device_id: u8,
    pub mdid: Mdid,
    pub body: PacketBody,
}

/// Assemble a transmit packet: control word, addressing, MDID, data and
/// trailing checksum. The source id is always the PIM default.
pub fn format_transmit(
    network_id: u8,
    destination_id: u8,
    mdid: Mdid,
    data: &[u8],
    options: TransmitOptions,
) -> Vec<u8> {
    let data_len = (PACKET_OVERHEAD + data.len()) as u8;
    let link_bit = (options.link as u8) << 7;
    let repeater_request = (options.repeater as u8) << 5;
    let ack_request = (options.ack as u8) << 4;
    let transmit_cnt = (options.cnt & 0x03) << 2;
    let transmit_seq = options.seq & 0x03;

    let mut msg = Vec::with_capacity(data_len as usize);
    msg.push(data_len | link_bit | repeater_request);
    msg.push(ack_request | transmit_cnt | transmit_seq);
    msg.push(network_id);
    msg.push(destination_id);
    msg.push(DEFAULT_SOURCE_ID);
    msg.push(mdid.to_byte());
    msg.extend_from_slice(data);
    msg.push(cksum(&msg));
    msg
}

/// Encode a register read request for a device.
pub fn register_request(network_id: u8, device_id: u8, start: u8, count: u8) -> Vec<u8> {
    format_transmit(
        network_id,
        device_id,
        Mdid::Core(CoreCmd::GetRegisterValues),
        &[start, count],
        TransmitOptions::default(),
    )
}

/// Encode a device signature request.
pub fn signature_request(network_id: u8, device_id: u8) -> Vec<u8> {
    format_transmit(
        network_id,
        device_id,
        Mdid::Core(CoreCmd::GetDeviceSignature),
        &[],
        TransmitOptions::default(),
    )
}

/// Encode a start-setup request carrying the device password.
pub fn start_setup_request(network_id: u8, device_id: u8, password: u16) -> Vec<u8> {
    format_transmit(
        network_id,
        device_id,
        Mdid::Core(CoreCmd::StartSetup),
        &password.to_be_bytes(),
        TransmitOptions::default(),
    )
}

/// Encode a setup mode timer query.
pub fn setup_time_request(network_id: u8, device_id: u8) -> Vec<u8> {
    format_transmit(
        network_id,
        device_id,
        Mdid::Core(CoreCmd::GetSetupTime),
        &[],
        TransmitOptions::default(),
    )
}

/// Decode and validate a reassembled bus packet.
///
/// The length field of the control word counts the whole packet including
/// the checksum byte. A checksum mismatch rejects the packet; the caller is
/// expected to log and drop it rather than hand it to any waiter.
pub fn parse_packet(packet: &[u8]) -> Result<UpbPacket, Error> {
    if packet.len() < PACKET_OVERHEAD {
        return Err(Error::Framing(format!(
            "short bus packet: {} bytes",
            packet.len()
        )));
    }
    let len = (packet[0] & 0x1F) as usize;
    if len < PACKET_OVERHEAD || len > packet.len() {
        return Err(Error::Framing(format!(
            "bad length field {} for {} byte packet",
            len,
            packet.len()
        )));
    }
    let crc = packet[len - 1];
    let computed = cksum(&packet[..len - 1]);
    if crc != computed {
        return Err(Error::Framing(format!(
            "checksum {:#04x} != computed {:#04x}",
            crc, computed
        )));
    }
    let mdid = Mdid::from_byte(packet[5])?;
    let payload = &packet[6..len - 1];
    let body = decode_body(mdid, payload)?;
    Ok(UpbPacket {
        link: packet[0] & 0x80 != 0,
        repeater: (packet[0] >> 5) & 0x03,
        ack_request: (packet[1] >> 4) & 0x07,
        transmit_cnt: (packet[1] >> 2) & 0x03,
        transmit_seq: packet[1] & 0x03,
        network_id: packet[2],
        destination_id: packet[3],
        device_id: packet[4],
        mdid,
        body,
    })
}

fn decode_body(mdid: Mdid, payload: &[u8]) -> Result<PacketBody, Error> {
    let short = |what: &str| Error::Framing(format!("short {} payload: {} bytes", what, payload.len()));
    Ok(match mdid {
        Mdid::Report(CoreReport::RegisterValues) => {
            if payload.is_empty() {
                return Err(short("register values"));
            }
            PacketBody::RegisterValues {
                setup_register: payload[0],
                values: payload[1..].to_vec(),
            }
        }
        Mdid::Report(CoreReport::DeviceSignature) => {
            if payload.len() < 17 {
                return Err(short("device signature"));
            }
            let ct_bytes = match payload[8] {
                0 => 256,
                n => u16::from(n),
            };
            let mut diagnostic = [0u8; 8];
            diagnostic.copy_from_slice(&payload[9..17]);
            PacketBody::DeviceSignature(DeviceSignature {
                random_number: u16::from_be_bytes([payload[0], payload[1]]),
                device_signal: payload[2],
                device_noise: payload[3],
                id_checksum: u16::from_be_bytes([payload[4], payload[5]]),
                setup_checksum: u16::from_be_bytes([payload[6], payload[7]]),
                ct_bytes,
                diagnostic,
            })
        }
        Mdid::Report(CoreReport::SetupTime) => {
            if payload.len() < 2 {
                return Err(short("setup time"));
            }
            PacketBody::SetupTime {
                setup_mode_register: payload[0],
                setup_mode_timer: payload[1],
            }
        }
        Mdid::Core(CoreCmd::StartSetup) => {
            if payload.len() < 2 {
                return Err(short("start setup"));
            }
            PacketBody::StartSetup {
                password: u16::from_be_bytes([payload[0], payload[1]]),
            }
        }
        _ => PacketBody::Raw(payload.to_vec()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cksum_known_vector() {
        assert_eq!(cksum(&[0x07, 0x00, 0x05, 0x03, 0xFF, 0x80]), 0x72);
    }

    #[test]
    fn cksum_self_cancels() {
        let data = [0x12u8, 0x34, 0x56, 0x78, 0x9A];
        let mut framed = data.to_vec();
        framed.push(cksum(&data));
        assert_eq!(cksum(&framed), 0);
    }

    #[test]
    fn hex_upper_swaps_case() {
        assert_eq!(hex_upper(&[0xAB, 0x01, 0xEF]), "AB01EF");
    }

    #[test]
    fn signature_request_round_trips() {
        let bytes = signature_request(5, 3);
        assert_eq!(
            bytes,
            vec![0x07, 0x00, 0x05, 0x03, 0xFF, 0x0F, cksum(&[0x07, 0x00, 0x05, 0x03, 0xFF, 0x0F])]
        );
        let packet = parse_packet(&bytes).unwrap();
        assert_eq!(packet.network_id, 5);
        assert_eq!(packet.destination_id, 3);
        assert_eq!(packet.device_id, DEFAULT_SOURCE_ID);
        assert_eq!(packet.mdid, Mdid::Core(CoreCmd::GetDeviceSignature));
        assert!(!packet.link);
        assert_eq!(packet.body, PacketBody::Raw(Vec::new()));
    }

    #[test]
    fn start_setup_password_is_big_endian() {
        let bytes = start_setup_request(1, 2, 0x0102);
        assert_eq!(&bytes[6..8], &[0x01, 0x02]);
        let packet = parse_packet(&bytes).unwrap();
        assert_eq!(packet.body, PacketBody::StartSetup { password: 0x0102 });
    }

    #[test]
    fn register_values_report_parses() {
        let mut payload = vec![0x10];
        payload.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        let bytes = format_transmit(
            1,
            0xFF,
            Mdid::Report(CoreReport::RegisterValues),
            &payload,
            TransmitOptions::default(),
        );
        let packet = parse_packet(&bytes).unwrap();
        assert_eq!(
            packet.body,
            PacketBody::RegisterValues {
                setup_register: 0x10,
                values: vec![0xAA, 0xBB, 0xCC],
            }
        );
    }

    #[test]
    fn signature_report_maps_zero_length_to_256() {
        let mut payload = vec![
            0x12, 0x34, // random
            0x40, // signal
            0x08, // noise
            0x21, 0x17, // id checksum
            0x43, 0x99, // setup checksum
            0x00, // ct bytes, wire zero
        ];
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let bytes = format_transmit(
            1,
            0xFF,
            Mdid::Report(CoreReport::DeviceSignature),
            &payload,
            TransmitOptions::default(),
        );
        let packet = parse_packet(&bytes).unwrap();
        match packet.body {
            PacketBody::DeviceSignature(sig) => {
                assert_eq!(sig.random_number, 0x1234);
                assert_eq!(sig.id_checksum, 0x2117);
                assert_eq!(sig.setup_checksum, 0x4399);
                assert_eq!(sig.ct_bytes, 256);
                assert_eq!(sig.diagnostic, [1, 2, 3, 4, 5, 6, 7, 8]);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn corrupt_checksum_is_rejected() {
        let mut bytes = signature_request(5, 3);
        let last = bytes.len() - 1;
        bytes[last] = bytes[last].wrapping_add(1);
        assert!(matches!(parse_packet(&bytes), Err(Error::Framing(_))));
    }

    #[test]
    fn link_and_repeater_bits_round_trip() {
        let bytes = format_transmit(
            9,
            0x42,
            Mdid::DeviceControl(DeviceControlCmd::Goto),
            &[0x64, 0x00],
            TransmitOptions {
                link: true,
                repeater: Repeater::Two,
                cnt: 1,
                seq: 2,
                ..TransmitOptions::default()
            },
        );
        let packet = parse_packet(&bytes).unwrap();
        assert!(packet.link);
        assert_eq!(packet.repeater, Repeater::Two as u8);
        assert_eq!(packet.transmit_cnt, 1);
        assert_eq!(packet.transmit_seq, 2);
        assert_eq!(packet.mdid, Mdid::DeviceControl(DeviceControlCmd::Goto));
    }
}
