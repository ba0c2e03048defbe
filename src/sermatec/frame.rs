use crate::prelude::*;

use nom::{bytes::streaming::tag, number::streaming::u8 as byte, IResult};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const SIGNATURE: [u8; 2] = [0xfe, 0x55];
pub const APP_ADDRESS: u8 = 0x64;
pub const INVERTER_ADDRESS: u8 = 0x14;
pub const FOOTER: u8 = 0xae;
pub const CHECKSUM_SEED: u8 = 0x0f;

/// Signature, addresses, command, reserved zero and length byte.
pub const HEADER_LEN: usize = 7;
/// Checksum and footer.
pub const TRAILER_LEN: usize = 2;
pub const MIN_FRAME_LEN: usize = 8;

// KnownCommand {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum KnownCommand {
    BatteryStatus = 0x0a,
    GridPvStatus = 0x0b,
    RunningStatus = 0x0c,
    BmsStatus = 0x0d,
    SetOnOff = 0x64,
    SetWorkingParameters = 0x66,
    SetBatteryParameters = 0x6a,
    WorkingParameters = 0x95,
    SystemInformation = 0x98,
    WorkingParametersExtended = 0x9d,
}

impl KnownCommand {
    /// Reply frames the inverter sends for this request, in order.
    pub fn reply_codes(self) -> &'static [u8] {
        use KnownCommand::*;

        match self {
            // parameter query answers with two frames
            WorkingParameters => &[0x95, 0x9d],
            // set commands are not answered
            SetOnOff | SetWorkingParameters | SetBatteryParameters => &[],
            BatteryStatus => &[0x0a],
            GridPvStatus => &[0x0b],
            RunningStatus => &[0x0c],
            BmsStatus => &[0x0d],
            SystemInformation => &[0x98],
            WorkingParametersExtended => &[0x9d],
        }
    }
}

/// Expected reply codes for any request code. Unknown commands are
/// answered by a single frame carrying the same code.
pub fn reply_commands(command: u8) -> Vec<u8> {
    match KnownCommand::try_from(command) {
        Ok(known) => known.reply_codes().to_vec(),
        Err(_) => vec![command],
    }
}
// }}}

// Direction {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// app -> inverter
    Request,
    /// inverter -> app
    Reply,
}

impl Direction {
    pub fn addresses(self) -> (u8, u8) {
        match self {
            Direction::Request => (APP_ADDRESS, INVERTER_ADDRESS),
            Direction::Reply => (INVERTER_ADDRESS, APP_ADDRESS),
        }
    }
} // }}}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub sender: u8,
    pub recipient: u8,
    pub command: u8,
    pub reserved: u8,
    pub length: u8,
}

impl FrameHeader {
    /// Streaming parser: yields `Incomplete` until all seven header bytes are
    /// available, which the stream framer relies on.
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&SIGNATURE[..])(input)?;
        let (input, sender) = byte(input)?;
        let (input, recipient) = byte(input)?;
        let (input, command) = byte(input)?;
        let (input, reserved) = byte(input)?;
        let (input, length) = byte(input)?;

        Ok((
            input,
            Self {
                sender,
                recipient,
                command,
                reserved,
                length,
            },
        ))
    }

    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.length as usize + TRAILER_LEN
    }
}

/// XOR-fold of `data` seeded with 0x0F.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(CHECKSUM_SEED, |acc, b| acc ^ b)
}

/// Payload bytes of a complete frame, bounded by both the length byte and
/// the actual frame size.
pub fn payload(frame: &[u8]) -> &[u8] {
    if frame.len() < HEADER_LEN {
        return &[];
    }
    let declared = HEADER_LEN + frame[6] as usize;
    let end = declared.min(frame.len().saturating_sub(TRAILER_LEN));
    &frame[HEADER_LEN.min(end)..end]
}

pub struct FrameFactory;
impl FrameFactory {
    /// Builds a request frame for `command` wrapping `payload`.
    pub fn build(command: u8, payload: &[u8]) -> Result<Vec<u8>> {
        Self::build_directed(Direction::Request, command, payload)
    }

    /// Builds a frame as the inverter would send it; used by simulators.
    pub fn build_reply(command: u8, payload: &[u8]) -> Result<Vec<u8>> {
        Self::build_directed(Direction::Reply, command, payload)
    }

    pub fn build_directed(direction: Direction, command: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let length = u8::try_from(payload.len()).map_err(|_| Error::PayloadTooLong(payload.len()))?;
        let (sender, recipient) = direction.addresses();

        let mut r = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
        r.extend_from_slice(&SIGNATURE);
        r.push(sender);
        r.push(recipient);
        r.push(command);
        r.push(0);
        r.push(length);
        r.extend_from_slice(payload);
        r.push(checksum(&r));
        r.push(FOOTER);

        trace!("built frame {}", hex(&r));

        Ok(r)
    }
}

pub struct FrameCheck;
impl FrameCheck {
    /// Envelope integrity of a single reply frame.
    pub fn validate(frame: &[u8], expected_command: u8) -> bool {
        Self::validate_directed(frame, expected_command, Direction::Reply)
    }

    pub fn validate_directed(frame: &[u8], expected_command: u8, direction: Direction) -> bool {
        let len = frame.len();
        if len < MIN_FRAME_LEN {
            debug!("frame too short ({} bytes)", len);
            return false;
        }

        let header = match FrameHeader::parse(frame) {
            Ok((_, header)) => header,
            Err(_) => {
                debug!("bad frame signature: {}", hex(&frame[0..2]));
                return false;
            }
        };

        let (sender, recipient) = direction.addresses();
        if header.sender != sender {
            debug!("bad sender address 0x{:02x}", header.sender);
            return false;
        }
        if header.recipient != recipient {
            debug!("bad recipient address 0x{:02x}", header.recipient);
            return false;
        }
        if header.command != expected_command {
            debug!(
                "bad command code, expected 0x{:02x}, got 0x{:02x}",
                expected_command, header.command
            );
            return false;
        }
        if header.reserved != 0 {
            debug!("reserved byte is 0x{:02x}, expected zero", header.reserved);
            return false;
        }

        let expected_checksum = checksum(&frame[..len - 2]);
        if frame[len - 2] != expected_checksum {
            debug!(
                "bad checksum, expected 0x{:02x}, got 0x{:02x}",
                expected_checksum,
                frame[len - 2]
            );
            return false;
        }
        if frame[len - 1] != FOOTER {
            debug!("bad footer 0x{:02x}", frame[len - 1]);
            return false;
        }

        true
    }

    /// Validates every reply to `request` against the known reply-code list;
    /// count and order must match exactly.
    pub fn validate_replies<F: AsRef<[u8]>>(frames: &[F], request: u8) -> bool {
        let expected = reply_commands(request);

        if frames.len() != expected.len() {
            debug!(
                "expected {} reply frames to 0x{:02x}, got {}",
                expected.len(),
                request,
                frames.len()
            );
            return false;
        }

        frames
            .iter()
            .zip(expected)
            .all(|(frame, code)| Self::validate(frame.as_ref(), code))
    }
}

pub fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
