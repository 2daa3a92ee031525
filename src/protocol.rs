//! Wire framing for the USART bootloader protocol (AN3155).
//!
//! Every function here is a pure transform between protocol values and the
//! bytes that go on the wire, the [`Programmer`](crate::Programmer) owns the
//! ordering of frames and acknowledgements.

use crate::plan::EraseSelection;

/// Wake byte sent on first contact, used by the bootloader for baud detection
pub const UART_DISC: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Maximum payload of a single read or write packet
pub const MAX_CHUNK: usize = 256;

/// Standard erase count byte requesting a global erase
const ERASE_MASS: u8 = 0xFF;

/// Extended erase count word requesting a mass erase
const EXTENDED_ERASE_MASS: u16 = 0xFFFF;

/// Extended erase count words from 0xFFF0 upwards are special erase codes
const EXTENDED_ERASE_MAX_SECTORS: usize = 0xFFF0;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version and the Read Protection status of the Flash memory.
    GetVersionReadStatus = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory pages.
    Erase = 0x43,

    /// Erases from one to all the Flash memory pages using two byte addressing mode (available only for v3.0 USART bootloader versions and above).
    ExtendedErase = 0x44,

    /// Enables the write protection for some sectors.
    WriteProtect = 0x63,

    /// Disables the write protection for all Flash memory sectors
    WriteUnprotect = 0x73,

    /// Enables the read protection
    ReadoutProtect = 0x82,

    /// Disables the read protection.
    ReadoutUnprotect = 0x92,
}

impl Command {
    pub fn opcode(self) -> u8 {
        self as u8
    }

    /// Look up a command from an opcode reported by the bootloader
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        let c = match opcode {
            0x00 => Command::Get,
            0x01 => Command::GetVersionReadStatus,
            0x02 => Command::GetId,
            0x11 => Command::ReadMemory,
            0x21 => Command::Go,
            0x31 => Command::WriteMemory,
            0x43 => Command::Erase,
            0x44 => Command::ExtendedErase,
            0x63 => Command::WriteProtect,
            0x73 => Command::WriteUnprotect,
            0x82 => Command::ReadoutProtect,
            0x92 => Command::ReadoutUnprotect,
            _ => return None,
        };

        Some(c)
    }
}

/// Acknowledgement received from the bootloader
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Response {
    Ack,
    Nack,
}

/// Encodings available for erase requests
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum EraseVariant {
    /// One byte sector count and indices (bootloader v2.x and older)
    Standard,
    /// Two byte big-endian sector count and indices
    Extended,
}

impl EraseVariant {
    pub fn command(self) -> Command {
        match self {
            EraseVariant::Standard => Command::Erase,
            EraseVariant::Extended => Command::ExtendedErase,
        }
    }

    /// Check whether a selection can be expressed with this variant's field widths
    pub fn fits(self, selection: &EraseSelection) -> bool {
        let sectors = match selection {
            EraseSelection::Mass => return true,
            EraseSelection::Sectors(s) => s,
        };

        if sectors.start >= sectors.end {
            return false;
        }

        let (max_count, max_index) = match self {
            EraseVariant::Standard => (ERASE_MASS as usize, u8::MAX as usize),
            EraseVariant::Extended => (EXTENDED_ERASE_MAX_SECTORS, u16::MAX as usize),
        };

        sectors.len() <= max_count && sectors.end - 1 <= max_index
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("payload of {0} bytes is outside 1..={max}", max = MAX_CHUNK)]
    PayloadLength(usize),

    #[error("checksum mismatch (expected 0x{expected:02x}, got 0x{actual:02x})")]
    Checksum { expected: u8, actual: u8 },

    #[error("frame carries {actual} payload bytes but declares {declared}")]
    Length { declared: usize, actual: usize },

    #[error("unexpected response byte 0x{0:02x}")]
    UnexpectedByte(u8),

    #[error("sector selection {0:?} cannot be encoded as a {1:?} erase")]
    Erase(EraseSelection, EraseVariant),
}

/// XOR of all bytes, the checksum used by every bootloader frame
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |c, b| c ^ b)
}

/// Command selection frame, the opcode followed by its complement
pub fn encode_command(command: Command) -> [u8; 2] {
    let c = command.opcode();
    [c, c ^ 0xFF]
}

/// Big-endian address followed by the XOR of its bytes
pub fn encode_address(address: u32) -> [u8; 5] {
    let a = address.to_be_bytes();
    [a[0], a[1], a[2], a[3], checksum(&a)]
}

/// Byte count for a read request, sent as N-1 followed by its complement
pub fn encode_length(length: usize) -> Result<[u8; 2], FrameError> {
    if length == 0 || length > MAX_CHUNK {
        return Err(FrameError::PayloadLength(length));
    }

    let n = (length - 1) as u8;
    Ok([n, n ^ 0xFF])
}

/// Data packet: N-1, the payload, then the XOR of the length byte and payload
pub fn encode_data(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() || payload.len() > MAX_CHUNK {
        return Err(FrameError::PayloadLength(payload.len()));
    }

    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push((payload.len() - 1) as u8);
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));

    Ok(frame)
}

/// Validate a data packet, returning its payload
pub fn decode_data(frame: &[u8]) -> Result<&[u8], FrameError> {
    if frame.len() < 3 {
        return Err(FrameError::PayloadLength(frame.len().saturating_sub(2)));
    }

    let declared = frame[0] as usize + 1;
    let actual = frame.len() - 2;
    if declared != actual {
        return Err(FrameError::Length { declared, actual });
    }

    let (body, tail) = frame.split_at(frame.len() - 1);
    let expected = checksum(body);
    if expected != tail[0] {
        return Err(FrameError::Checksum {
            expected,
            actual: tail[0],
        });
    }

    Ok(&body[1..])
}

pub fn decode_ack(byte: u8) -> Result<Response, FrameError> {
    match byte {
        UART_ACK => Ok(Response::Ack),
        UART_NACK => Ok(Response::Nack),
        v => Err(FrameError::UnexpectedByte(v)),
    }
}

/// Erase parameters following the erase command acknowledge
pub fn encode_erase(
    selection: &EraseSelection,
    variant: EraseVariant,
) -> Result<Vec<u8>, FrameError> {
    if !variant.fits(selection) {
        return Err(FrameError::Erase(selection.clone(), variant));
    }

    let mut frame = Vec::new();

    match (selection, variant) {
        (EraseSelection::Mass, EraseVariant::Standard) => frame.push(ERASE_MASS),
        (EraseSelection::Mass, EraseVariant::Extended) => {
            frame.extend_from_slice(&EXTENDED_ERASE_MASS.to_be_bytes())
        }
        (EraseSelection::Sectors(s), EraseVariant::Standard) => {
            frame.push((s.len() - 1) as u8);
            frame.extend(s.clone().map(|i| i as u8));
        }
        (EraseSelection::Sectors(s), EraseVariant::Extended) => {
            frame.extend_from_slice(&((s.len() - 1) as u16).to_be_bytes());
            for i in s.clone() {
                frame.extend_from_slice(&(i as u16).to_be_bytes());
            }
        }
    }

    // A lone mass erase byte is protected by its complement, everything else by XOR
    let check = match frame.as_slice() {
        [single] => single ^ 0xFF,
        bytes => checksum(bytes),
    };
    frame.push(check);

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frames_carry_complement() {
        assert_eq!(encode_command(Command::Get), [0x00, 0xFF]);
        assert_eq!(encode_command(Command::GetId), [0x02, 0xFD]);
        assert_eq!(encode_command(Command::WriteMemory), [0x31, 0xCE]);
        assert_eq!(encode_command(Command::ExtendedErase), [0x44, 0xBB]);
    }

    #[test]
    fn opcodes_round_trip_through_lookup() {
        for c in &[Command::Get, Command::ReadMemory, Command::Go, Command::ReadoutUnprotect] {
            assert_eq!(Command::from_opcode(c.opcode()), Some(*c));
        }
        assert_eq!(Command::from_opcode(0x50), None);
    }

    #[test]
    fn address_is_big_endian_with_xor() {
        assert_eq!(encode_address(0x0800_0000), [0x08, 0x00, 0x00, 0x00, 0x08]);
        assert_eq!(encode_address(0x0800_1234), [0x08, 0x00, 0x12, 0x34, 0x2E]);
        assert_eq!(encode_address(0x2000_0000), [0x20, 0x00, 0x00, 0x00, 0x20]);
    }

    #[test]
    fn read_length_is_n_minus_one_with_complement() {
        assert_eq!(encode_length(1), Ok([0x00, 0xFF]));
        assert_eq!(encode_length(256), Ok([0xFF, 0x00]));
        assert_eq!(encode_length(44), Ok([0x2B, 0xD4]));
        assert_eq!(encode_length(0), Err(FrameError::PayloadLength(0)));
        assert_eq!(encode_length(257), Err(FrameError::PayloadLength(257)));
    }

    #[test]
    fn data_packet_layout() {
        assert_eq!(
            encode_data(&[0x01, 0x02, 0x03, 0x04]),
            Ok(vec![0x03, 0x01, 0x02, 0x03, 0x04, 0x07])
        );
        assert_eq!(encode_data(&[]), Err(FrameError::PayloadLength(0)));
        assert_eq!(encode_data(&[0u8; 257]), Err(FrameError::PayloadLength(257)));
    }

    #[test]
    fn data_checksum_holds_for_every_payload_length() {
        for len in 1..=MAX_CHUNK {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();
            let frame = encode_data(&payload).unwrap();

            assert_eq!(frame.len(), len + 2);
            assert_eq!(frame[len + 1], checksum(&frame[..len + 1]));
            assert_eq!(decode_data(&frame), Ok(&payload[..]));
        }
    }

    #[test]
    fn decode_rejects_corrupt_packets() {
        let mut frame = encode_data(&[0xAA, 0x55]).unwrap();
        frame[1] ^= 0x01;
        assert!(matches!(decode_data(&frame), Err(FrameError::Checksum { .. })));

        let frame = [0x03, 0x01, 0x02, 0x03];
        assert_eq!(
            decode_data(&frame),
            Err(FrameError::Length {
                declared: 4,
                actual: 2
            })
        );
    }

    #[test]
    fn ack_sentinels() {
        assert_eq!(decode_ack(UART_ACK), Ok(Response::Ack));
        assert_eq!(decode_ack(UART_NACK), Ok(Response::Nack));
        assert_eq!(decode_ack(0x00), Err(FrameError::UnexpectedByte(0x00)));
    }

    #[test]
    fn mass_erase_payloads() {
        assert_eq!(
            encode_erase(&EraseSelection::Mass, EraseVariant::Standard),
            Ok(vec![0xFF, 0x00])
        );
        assert_eq!(
            encode_erase(&EraseSelection::Mass, EraseVariant::Extended),
            Ok(vec![0xFF, 0xFF, 0x00])
        );
    }

    #[test]
    fn sector_erase_payloads() {
        assert_eq!(
            encode_erase(&EraseSelection::Sectors(0..2), EraseVariant::Standard),
            Ok(vec![0x01, 0x00, 0x01, 0x00])
        );
        assert_eq!(
            encode_erase(&EraseSelection::Sectors(3..4), EraseVariant::Extended),
            Ok(vec![0x00, 0x00, 0x00, 0x03, 0x03])
        );
        assert_eq!(
            encode_erase(&EraseSelection::Sectors(1..4), EraseVariant::Extended),
            Ok(vec![0x00, 0x02, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03, 0x02])
        );
    }

    #[test]
    fn wide_indices_need_extended_erase() {
        let sel = EraseSelection::Sectors(250..260);
        assert!(!EraseVariant::Standard.fits(&sel));
        assert!(EraseVariant::Extended.fits(&sel));
        assert!(encode_erase(&sel, EraseVariant::Standard).is_err());

        assert!(!EraseVariant::Extended.fits(&EraseSelection::Sectors(0..0)));
    }
}
