//! Powerline Interface Module constants: serial commands, register
//! addresses and the message mode line tokens.

use num_enum::TryFromPrimitive;

/// Commands accepted by the PIM on its serial side. Each outbound frame is
/// the command byte, the upper-cased hex of the payload and a carriage
/// return.
#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum PimCommand {
    /// Transmit a complete bus packet onto the powerline.
    NetworkTransmit = 0x14,
    /// Read PIM registers; payload is `address | count | cksum`.
    ReadRegisters = 0x72,
    /// Write PIM registers; payload is `address | values.. | cksum`.
    WriteRegisters = 0x77,
}

/// PIM register addresses the client touches.
///
/// The low addresses mirror the UPBID layout every bus device carries; the
/// high ones are PIM specific.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum PimRegister {
    NetworkId = 0x00,
    Password = 0x02,
    UpbOptions = 0x04,
    UpbVersion = 0x05,
    ManufacturerId = 0x06,
    ProductId = 0x08,
    FirmwareVersion = 0x0A,
    NoiseFloor = 0x69,
    PimOptions = 0x70,
}

impl PimRegister {
    pub fn addr(self) -> u8 {
        self as u8
    }

    /// How many registers a read of this address covers.
    pub fn read_len(self) -> u8 {
        match self {
            PimRegister::FirmwareVersion
            | PimRegister::ManufacturerId
            | PimRegister::ProductId
            | PimRegister::Password => 2,
            _ => 1,
        }
    }
}

/// PIM options value that turns on message mode, the verbose per-pulse
/// telemetry the line parser consumes.
pub const PIM_OPTIONS_MESSAGE_MODE: u8 = 0xF0;

/// First byte of every PIM line in message mode.
///
/// The data tokens `0`..`3` carry a two bit crumb in the token itself; four
/// crumbs make one packet byte. Data and transmitted lines are three bytes,
/// with the 4 bit pulse sequence as the trailing hex digit.
#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum PimLine {
    /// `!` - echo of a crumb the PIM itself is transmitting.
    Transmitted = 0x21,
    /// `$` - a bus packet starts.
    Start = 0x24,
    /// `%` - sync pulses.
    Sync = 0x25,
    /// `-` - powerline idle.
    Idle = 0x2D,
    Data0 = 0x30,
    Data1 = 0x31,
    Data2 = 0x32,
    Data3 = 0x33,
    /// `K` - packet acknowledged.
    Ack = 0x4B,
    /// `N` - packet not acknowledged.
    Nak = 0x4E,
    /// `P` - out of band PIM report, subtype in the second byte.
    PimReport = 0x50,
    /// `X` - the PIM dropped a garbled message.
    Drop = 0x58,
}

impl PimLine {
    pub fn is_data(self) -> bool {
        matches!(
            self,
            PimLine::Data0 | PimLine::Data1 | PimLine::Data2 | PimLine::Data3
        )
    }
}

/// Subtype byte of a PIM report line, matching the PIM's reply letters.
#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum PimReport {
    /// `A` - the PIM accepted a transmit request.
    Accept = 0x41,
    /// `B` - the PIM is busy; the active request should be rewritten.
    Busy = 0x42,
    /// `E` - the PIM rejected the request.
    Error = 0x45,
    /// `K` - transmitted packet was acknowledged on the wire.
    Ack = 0x4B,
    /// `N` - transmitted packet was not acknowledged.
    Nak = 0x4E,
    /// `R` - register report, `start | values..` hex encoded.
    Registers = 0x52,
    /// `U` - an unsolicited bus message in command mode.
    Message = 0x55,
}
