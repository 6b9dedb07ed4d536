// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Packet codec for the Gen3 wire protocol.
//!
//! A frame is `[length][opcode + payload][checksum]` where length counts
//! the opcode and payload bytes and the checksum is a Dallas/Maxim CRC-8
//! over exactly those bytes.  Inbound frames carry a response code where
//! outbound frames carry the opcode.

use crate::error::ProtocolError;

/// Most bytes (opcode included) a single frame may carry.
pub const MAX_PAYLOAD: usize = 32;

/// Largest EEPROM chunk in one motherboard frame.
pub const MAX_EEPROM_FRAME: usize = 16;

/// Largest EEPROM chunk in one chained tool write.
pub const MAX_TOOL_EEPROM_FRAME: usize = 11;

/// Motherboard opcodes.  Values with the high bit set are buffered
/// commands, the rest are answered immediately.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum HostCode {
    Version = 0,
    Init = 1,
    GetBufferSize = 2,
    ClearBuffer = 3,
    GetPosition = 4,
    Abort = 7,
    Pause = 8,
    ToolQuery = 10,
    IsFinished = 11,
    ReadEeprom = 12,
    WriteEeprom = 13,
    CaptureToFile = 14,
    EndCapture = 15,
    PlaybackCapture = 16,
    Reset = 17,
    NextFilename = 18,
    GetBuildName = 20,
    ExtendedStop = 22,
    QueuePointAbs = 129,
    SetPosition = 130,
    FindAxesMinimum = 131,
    FindAxesMaximum = 132,
    Delay = 133,
    ChangeTool = 134,
    WaitForTool = 135,
    ToolCommand = 136,
    EnableAxes = 137,
    WaitForPlatform = 141,
    StoreHomePositions = 143,
    RecallHomePositions = 144,
}

impl HostCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Opcodes forwarded to a tool controller inside `ToolQuery` /
/// `ToolCommand` frames.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ToolCode {
    Version = 0,
    Init = 1,
    GetTemperature = 2,
    SetTemperature = 3,
    SetMotor1Pwm = 4,
    SetMotor2Pwm = 5,
    SetMotor1Rpm = 6,
    SetMotor2Rpm = 7,
    ToggleMotor1 = 10,
    ToggleMotor2 = 11,
    ToggleFan = 12,
    ToggleValve = 13,
    ReadEeprom = 25,
    WriteEeprom = 26,
    ToggleAbp = 27,
    GetPlatformTemperature = 30,
    SetPlatformTemperature = 31,
    GetSetpoint = 32,
    GetPlatformSetpoint = 33,
    GetToolStatus = 36,
}

impl ToolCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// True for buffered commands, false for immediate queries.
pub fn is_buffered(opcode: u8) -> bool {
    opcode & 0x80 != 0
}

/// Dallas/Maxim (iButton) CRC-8, the polynomial the Gen3 firmware uses.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        let mut b = byte;
        for _ in 0..8 {
            let mix = (crc ^ b) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8c;
            }
            b >>= 1;
        }
    }
    crc
}

/// Accumulates an outbound frame; all multi-byte fields little-endian.
pub struct PacketBuilder {
    body: Vec<u8>,
}

impl PacketBuilder {
    pub fn new(opcode: u8) -> Self {
        PacketBuilder { body: vec![opcode] }
    }

    pub fn add8(&mut self, value: u8) -> &mut Self {
        self.body.push(value);
        self
    }

    pub fn add16(&mut self, value: u16) -> &mut Self {
        self.body.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn add32(&mut self, value: u32) -> &mut Self {
        self.body.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.body.extend_from_slice(bytes);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        debug_assert!(self.body.len() <= MAX_PAYLOAD, "frame payload too large");
        let mut frame = Vec::with_capacity(self.body.len() + 2);
        frame.push(self.body.len() as u8);
        frame.extend_from_slice(&self.body);
        frame.push(crc8(&self.body));
        frame
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitLength,
    AwaitCode,
    Payload,
    Checksum,
}

/// Byte-at-a-time frame decoder.
///
/// Feed inbound bytes one by one; a completed frame comes back as a
/// `Response`.  On a checksum mismatch the frame is discarded and the
/// decoder resynchronizes on the next byte as a length.
pub struct Decoder {
    state: DecodeState,
    remaining: usize,
    body: Vec<u8>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Decoder { state: DecodeState::AwaitLength, remaining: 0, body: vec![] }
    }

    pub fn feed(&mut self, byte: u8) -> Result<Option<Response>, ProtocolError> {
        match self.state {
            DecodeState::AwaitLength => {
                // a zero length can't frame anything, treat it as noise
                if byte != 0 {
                    self.remaining = byte as usize;
                    self.body.clear();
                    self.state = DecodeState::AwaitCode;
                }
                Ok(None)
            }
            DecodeState::AwaitCode | DecodeState::Payload => {
                self.body.push(byte);
                self.remaining -= 1;
                self.state = if self.remaining == 0 {
                    DecodeState::Checksum
                } else {
                    DecodeState::Payload
                };
                Ok(None)
            }
            DecodeState::Checksum => {
                self.state = DecodeState::AwaitLength;
                if byte == crc8(&self.body) {
                    Ok(Some(Response::new(std::mem::take(&mut self.body))))
                } else {
                    Err(ProtocolError::ChecksumFault)
                }
            }
        }
    }
}

/// Response codes from the first body byte of an inbound frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResponseCode {
    Ok,
    BufferOverflow,
    Unsupported,
    /// The controller timed out talking to a downstream tool board.
    DownstreamTimeout,
    Cancel,
    GenericFailure,
}

impl ResponseCode {
    fn from_wire(byte: u8) -> Self {
        match byte {
            0x81 => ResponseCode::Ok,
            0x82 => ResponseCode::BufferOverflow,
            0x85 => ResponseCode::Unsupported,
            0x87 => ResponseCode::DownstreamTimeout,
            0x89 => ResponseCode::Cancel,
            _ => ResponseCode::GenericFailure,
        }
    }
}

/// A decoded inbound frame.  Payload fields are consumed in order with
/// the `read*` accessors; reading past the end is a programming error
/// and panics.
#[derive(Clone, Debug)]
pub struct Response {
    body: Vec<u8>,
    cursor: usize,
}

impl Response {
    fn new(body: Vec<u8>) -> Self {
        debug_assert!(!body.is_empty());
        Response { body, cursor: 1 }
    }

    pub fn code(&self) -> ResponseCode {
        ResponseCode::from_wire(self.body[0])
    }

    /// The raw first body byte; for loopback decoding of an outbound
    /// frame this is the opcode.
    pub fn raw_code(&self) -> u8 {
        self.body[0]
    }

    pub fn is_ok(&self) -> bool {
        self.code() == ResponseCode::Ok
    }

    pub fn payload(&self) -> &[u8] {
        &self.body[1..]
    }

    pub fn remaining(&self) -> usize {
        self.body.len() - self.cursor
    }

    pub fn read8(&mut self) -> u8 {
        let v = self.body[self.cursor];
        self.cursor += 1;
        v
    }

    pub fn read16(&mut self) -> u16 {
        u16::from_le_bytes([self.read8(), self.read8()])
    }

    pub fn read32(&mut self) -> u32 {
        u32::from_le_bytes([self.read8(), self.read8(), self.read8(), self.read8()])
    }
}
