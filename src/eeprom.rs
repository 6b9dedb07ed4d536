// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Persisted machine settings in controller EEPROM.
//!
//! The motherboard and each tool controller carry their own EEPROM with
//! a fixed offset layout (additive evolution only: existing offsets
//! never move).  Motherboard frames move at most 16 bytes; tool writes
//! are chained through `ToolQuery` and capped at 11 bytes per frame,
//! so larger logical accesses are split here, in byte order, with the
//! offset advancing by the bytes already transferred.

use std::sync::atomic::Ordering;

use log::{debug, warn};

use crate::driver::{Driver, Link, DEFAULT_RETRIES};
use crate::error::ProtocolError;
use crate::machine::{Axis, AxisSet};
use crate::protocol::{HostCode, PacketBuilder, ToolCode, MAX_EEPROM_FRAME, MAX_TOOL_EEPROM_FRAME};

/// Two-byte signature marking an initialized motherboard EEPROM.
pub const SIGNATURE: [u8; 2] = [0x5a, 0x78];

/// Motherboard offsets.
pub mod offsets {
    pub const SIGNATURE: u16 = 0x0000;
    pub const AXIS_INVERSION: u16 = 0x0002;
    pub const ENDSTOP_INVERSION: u16 = 0x0003;
    pub const MACHINE_NAME: u16 = 0x0020;
    /// Base of five 4-byte little-endian step counts, one per axis.
    pub const AXIS_HOME_POSITIONS: u16 = 0x0060;
    pub const ESTOP_CONFIGURATION: u16 = 0x0074;

    pub const MACHINE_NAME_LEN: usize = 16;
}

/// Tool controller offsets.
pub mod tool_offsets {
    pub const BACKOFF_STOP_TIME: u16 = 0x0004;
    pub const BACKOFF_REVERSE_TIME: u16 = 0x0006;
    pub const BACKOFF_FORWARD_TIME: u16 = 0x0008;
    pub const BACKOFF_TRIGGER_TIME: u16 = 0x000a;
    pub const PID_EXTRUDER: u16 = 0x000c;
    pub const PID_PLATFORM: u16 = 0x0012;
    pub const EXTRA_FEATURES: u16 = 0x0018;
    pub const SLAVE_ID: u16 = 0x001a;
    /// Bases of the two thermistor tables (extruder, platform).
    pub const THERMISTOR_TABLES: [u16; 2] = [0x00f0, 0x0170];

    // relative to a PID base
    pub const PID_P_TERM: u16 = 0;
    pub const PID_I_TERM: u16 = 2;
    pub const PID_D_TERM: u16 = 4;

    // relative to a thermistor table base
    pub const THERM_R0: u16 = 0x00;
    pub const THERM_T0: u16 = 0x04;
    pub const THERM_BETA: u16 = 0x08;
    pub const THERM_DATA: u16 = 0x10;
}

/// End of the region the blank-reset wipes.
const WIPE_END: u16 = 0x0200;
const BLANK: u8 = 0xff;

/// PID channel selector for the typed accessors.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PidChannel {
    Extruder,
    Platform,
}

impl PidChannel {
    fn base(self) -> u16 {
        match self {
            PidChannel::Extruder => tool_offsets::PID_EXTRUDER,
            PidChannel::Platform => tool_offsets::PID_PLATFORM,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct PidParameters {
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

impl Default for PidParameters {
    fn default() -> Self {
        PidParameters { p: 7.0, i: 0.325, d: 36.0 }
    }
}

/// Reversal ("backoff") timings for DC extruders, all milliseconds.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BackoffParameters {
    pub stop_ms: u16,
    pub reverse_ms: u16,
    pub forward_ms: u16,
    pub trigger_ms: u16,
}

impl Default for BackoffParameters {
    fn default() -> Self {
        BackoffParameters { stop_ms: 5, reverse_ms: 500, forward_ms: 300, trigger_ms: 300 }
    }
}

/// Decoded extra-features word of a tool controller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ExtraFeatures {
    pub swap_motor_controller: bool,
    pub heater_channel: u8,
    pub platform_channel: u8,
    pub abp_channel: u8,
}

impl ExtraFeatures {
    const DEFAULT_WORD: u16 = 0x4084;

    fn from_wire(word: u16) -> Self {
        ExtraFeatures {
            swap_motor_controller: word & 0x0001 != 0,
            heater_channel: ((word >> 2) & 0x03) as u8,
            platform_channel: ((word >> 4) & 0x03) as u8,
            abp_channel: ((word >> 6) & 0x03) as u8,
        }
    }

    fn to_wire(self) -> u16 {
        0x4000
            | self.swap_motor_controller as u16
            | (self.heater_channel as u16) << 2
            | (self.platform_channel as u16) << 4
            | (self.abp_channel as u16) << 6
    }
}

impl Default for ExtraFeatures {
    fn default() -> Self {
        ExtraFeatures::from_wire(ExtraFeatures::DEFAULT_WORD)
    }
}

/// Firmware stores PID terms as 8.8 fixed point, integer byte first.
fn fixed_8_8_to_f64(bytes: [u8; 2]) -> f64 {
    bytes[0] as f64 + bytes[1] as f64 / 256.0
}

fn f64_to_fixed_8_8(value: f64) -> [u8; 2] {
    let value = value.clamp(0.0, 255.996);
    [value as u8, (value.fract() * 256.0) as u8]
}

impl Driver {
    /// Read from motherboard EEPROM, chunking at the frame limit.  The
    /// link stays locked for the whole sequence so other callers never
    /// interleave traffic between chunks.
    pub fn read_eeprom(&self, offset: u16, len: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut link = self.lock_link();
        self.check_eeprom(&mut **link)?;
        self.read_eeprom_chunks(&mut **link, offset, len)
    }

    fn read_eeprom_chunks(&self, link: &mut dyn Link, mut offset: u16, len: usize)
                          -> Result<Vec<u8>, ProtocolError> {
        let mut data = Vec::with_capacity(len);
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(MAX_EEPROM_FRAME);
            let mut pb = PacketBuilder::new(HostCode::ReadEeprom.code());
            pb.add16(offset).add8(chunk as u8);
            let resp = self.exchange(link, &pb.build(), DEFAULT_RETRIES)?;
            if resp.payload().len() < chunk {
                return Err(ProtocolError::Exchange(
                    format!("short EEPROM read at offset {:#x}", offset)));
            }
            data.extend_from_slice(&resp.payload()[..chunk]);
            offset += chunk as u16;
            remaining -= chunk;
        }
        Ok(data)
    }

    /// Write to motherboard EEPROM, chunking at the frame limit and
    /// preserving byte order across chunks.  Holds the link like
    /// [`Driver::read_eeprom`] does.
    pub fn write_eeprom(&self, offset: u16, data: &[u8]) -> Result<(), ProtocolError> {
        let mut link = self.lock_link();
        self.check_eeprom(&mut **link)?;
        self.write_eeprom_chunks(&mut **link, offset, data)
    }

    fn write_eeprom_chunks(&self, link: &mut dyn Link, mut offset: u16, data: &[u8])
                           -> Result<(), ProtocolError> {
        for chunk in data.chunks(MAX_EEPROM_FRAME) {
            let mut pb = PacketBuilder::new(HostCode::WriteEeprom.code());
            pb.add16(offset).add8(chunk.len() as u8).add_bytes(chunk);
            let mut resp = self.exchange(link, &pb.build(), DEFAULT_RETRIES)?;
            if resp.remaining() < 1 || resp.read8() as usize != chunk.len() {
                return Err(ProtocolError::Exchange(
                    format!("EEPROM write at offset {:#x} not acknowledged", offset)));
            }
            offset += chunk.len() as u16;
        }
        Ok(())
    }

    /// Read from a tool controller's EEPROM.
    pub fn read_tool_eeprom(&self, tool: usize, offset: u16, len: usize)
                            -> Result<Vec<u8>, ProtocolError> {
        let mut link = self.lock_link();
        self.read_tool_chunks(&mut **link, tool, offset, len)
    }

    fn read_tool_chunks(&self, link: &mut dyn Link, tool: usize, mut offset: u16, len: usize)
                        -> Result<Vec<u8>, ProtocolError> {
        let mut data = Vec::with_capacity(len);
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(MAX_TOOL_EEPROM_FRAME);
            let mut pb = PacketBuilder::new(HostCode::ToolQuery.code());
            pb.add8(tool as u8).add8(ToolCode::ReadEeprom.code()).add16(offset).add8(chunk as u8);
            let resp = self.exchange(link, &pb.build(), DEFAULT_RETRIES)?;
            if resp.payload().len() < chunk {
                return Err(ProtocolError::Exchange(
                    format!("short tool EEPROM read at offset {:#x}", offset)));
            }
            data.extend_from_slice(&resp.payload()[..chunk]);
            offset += chunk as u16;
            remaining -= chunk;
        }
        Ok(data)
    }

    /// Write to a tool controller's EEPROM.  Chained writes carry at
    /// most 11 bytes each; the offset advances by the bytes already
    /// written so the chunks land contiguously.
    pub fn write_tool_eeprom(&self, tool: usize, offset: u16, data: &[u8])
                             -> Result<(), ProtocolError> {
        let mut link = self.lock_link();
        self.write_tool_chunks(&mut **link, tool, offset, data)
    }

    fn write_tool_chunks(&self, link: &mut dyn Link, tool: usize, mut offset: u16, data: &[u8])
                         -> Result<(), ProtocolError> {
        for chunk in data.chunks(MAX_TOOL_EEPROM_FRAME) {
            let mut pb = PacketBuilder::new(HostCode::ToolQuery.code());
            pb.add8(tool as u8).add8(ToolCode::WriteEeprom.code())
                .add16(offset).add8(chunk.len() as u8).add_bytes(chunk);
            let mut resp = self.exchange(link, &pb.build(), DEFAULT_RETRIES)?;
            // broadcast addresses answer for no tool in particular
            if tool != 127 && tool != 255 {
                if resp.remaining() < 1 || resp.read8() as usize != chunk.len() {
                    return Err(ProtocolError::Exchange(
                        format!("tool EEPROM write at offset {:#x} not acknowledged", offset)));
                }
            }
            offset += chunk.len() as u16;
        }
        Ok(())
    }

    /// Verify the EEPROM signature once per session.  Pre-2.0 firmware
    /// shipped with uninitialized EEPROM; a missing signature there
    /// means the region content is garbage, so wipe it to a known-blank
    /// state and stamp it.  Runs under the caller's link lock so the
    /// check-and-wipe cannot interleave with other traffic.
    fn check_eeprom(&self, link: &mut dyn Link) -> Result<(), ProtocolError> {
        if self.eeprom_checked().swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.version().major >= 2 {
            return Ok(());
        }
        let sig = self.read_eeprom_chunks(link, offsets::SIGNATURE, 2)?;
        if sig == SIGNATURE {
            return Ok(());
        }
        warn!("EEPROM signature missing, wiping to a blank state");
        let mut first_row = [BLANK; MAX_EEPROM_FRAME];
        first_row[..2].copy_from_slice(&SIGNATURE);
        self.write_eeprom_chunks(link, 0, &first_row)?;
        let mut offset = MAX_EEPROM_FRAME as u16;
        while offset < WIPE_END {
            self.write_eeprom_chunks(link, offset, &[BLANK; MAX_EEPROM_FRAME])?;
            offset += MAX_EEPROM_FRAME as u16;
        }
        Ok(())
    }

    pub fn inverted_axes(&self) -> Result<AxisSet, ProtocolError> {
        let data = self.read_eeprom(offsets::AXIS_INVERSION, 1)?;
        Ok(AxisSet::from_bits(data[0]))
    }

    pub fn set_inverted_axes(&self, axes: AxisSet) -> Result<(), ProtocolError> {
        self.write_eeprom(offsets::AXIS_INVERSION, &[axes.bits()])
    }

    /// Raw endstop inversion byte; the bit layout is firmware-defined.
    pub fn endstop_inversion(&self) -> Result<u8, ProtocolError> {
        Ok(self.read_eeprom(offsets::ENDSTOP_INVERSION, 1)?[0])
    }

    pub fn set_endstop_inversion(&self, value: u8) -> Result<(), ProtocolError> {
        self.write_eeprom(offsets::ENDSTOP_INVERSION, &[value])
    }

    pub fn estop_configuration(&self) -> Result<u8, ProtocolError> {
        Ok(self.read_eeprom(offsets::ESTOP_CONFIGURATION, 1)?[0])
    }

    pub fn set_estop_configuration(&self, value: u8) -> Result<(), ProtocolError> {
        self.write_eeprom(offsets::ESTOP_CONFIGURATION, &[value])
    }

    pub fn machine_name(&self) -> Result<String, ProtocolError> {
        let data = self.read_eeprom(offsets::MACHINE_NAME, offsets::MACHINE_NAME_LEN)?;
        let end = data.iter().position(|&b| b == 0 || b == BLANK).unwrap_or(data.len());
        Ok(data[..end].iter().map(|&b| b as char).collect())
    }

    pub fn set_machine_name(&self, name: &str) -> Result<(), ProtocolError> {
        let mut data = [0u8; offsets::MACHINE_NAME_LEN];
        for (slot, ch) in data.iter_mut().zip(name.chars()) {
            // the display only understands 8-bit characters
            *slot = if (ch as u32) < 256 { ch as u8 } else { b'?' };
        }
        self.write_eeprom(offsets::MACHINE_NAME, &data)
    }

    /// Stored home offset of one axis, in mm.
    pub fn axis_home_offset(&self, axis: Axis) -> Result<f64, ProtocolError> {
        let offset = offsets::AXIS_HOME_POSITIONS + 4 * axis.index() as u16;
        let data = self.read_eeprom(offset, 4)?;
        let steps = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        Ok(steps as f64 / self.config().steps_per_mm.get(axis))
    }

    pub fn set_axis_home_offset(&self, axis: Axis, mm: f64) -> Result<(), ProtocolError> {
        let offset = offsets::AXIS_HOME_POSITIONS + 4 * axis.index() as u16;
        let steps = (mm * self.config().steps_per_mm.get(axis)).round() as i32;
        self.write_eeprom(offset, &steps.to_le_bytes())
    }

    fn read16_tool(&self, tool: usize, offset: u16, default: u16) -> Result<u16, ProtocolError> {
        let data = self.read_tool_eeprom(tool, offset, 2)?;
        let value = u16::from_le_bytes([data[0], data[1]]);
        // blank cells read back as all ones
        Ok(if value == 0xffff { default } else { value })
    }

    pub fn backoff_parameters(&self, tool: usize) -> Result<BackoffParameters, ProtocolError> {
        let defaults = BackoffParameters::default();
        Ok(BackoffParameters {
            stop_ms: self.read16_tool(tool, tool_offsets::BACKOFF_STOP_TIME, defaults.stop_ms)?,
            reverse_ms: self.read16_tool(tool, tool_offsets::BACKOFF_REVERSE_TIME,
                                         defaults.reverse_ms)?,
            forward_ms: self.read16_tool(tool, tool_offsets::BACKOFF_FORWARD_TIME,
                                         defaults.forward_ms)?,
            trigger_ms: self.read16_tool(tool, tool_offsets::BACKOFF_TRIGGER_TIME,
                                         defaults.trigger_ms)?,
        })
    }

    pub fn set_backoff_parameters(&self, tool: usize, params: BackoffParameters)
                                  -> Result<(), ProtocolError> {
        let mut link = self.lock_link();
        self.write_tool_chunks(&mut **link, tool, tool_offsets::BACKOFF_STOP_TIME,
                               &params.stop_ms.to_le_bytes())?;
        self.write_tool_chunks(&mut **link, tool, tool_offsets::BACKOFF_REVERSE_TIME,
                               &params.reverse_ms.to_le_bytes())?;
        self.write_tool_chunks(&mut **link, tool, tool_offsets::BACKOFF_FORWARD_TIME,
                               &params.forward_ms.to_le_bytes())?;
        self.write_tool_chunks(&mut **link, tool, tool_offsets::BACKOFF_TRIGGER_TIME,
                               &params.trigger_ms.to_le_bytes())
    }

    fn read_fixed_tool(&self, tool: usize, offset: u16, default: f64)
                       -> Result<f64, ProtocolError> {
        let data = self.read_tool_eeprom(tool, offset, 2)?;
        if data[0] == BLANK && data[1] == BLANK {
            return Ok(default);
        }
        Ok(fixed_8_8_to_f64([data[0], data[1]]))
    }

    pub fn pid_parameters(&self, tool: usize, channel: PidChannel)
                          -> Result<PidParameters, ProtocolError> {
        let base = channel.base();
        let defaults = PidParameters::default();
        Ok(PidParameters {
            p: self.read_fixed_tool(tool, base + tool_offsets::PID_P_TERM, defaults.p)?,
            i: self.read_fixed_tool(tool, base + tool_offsets::PID_I_TERM, defaults.i)?,
            d: self.read_fixed_tool(tool, base + tool_offsets::PID_D_TERM, defaults.d)?,
        })
    }

    pub fn set_pid_parameters(&self, tool: usize, channel: PidChannel, params: PidParameters)
                              -> Result<(), ProtocolError> {
        let base = channel.base();
        let mut link = self.lock_link();
        self.write_tool_chunks(&mut **link, tool, base + tool_offsets::PID_P_TERM,
                               &f64_to_fixed_8_8(params.p))?;
        self.write_tool_chunks(&mut **link, tool, base + tool_offsets::PID_I_TERM,
                               &f64_to_fixed_8_8(params.i))?;
        self.write_tool_chunks(&mut **link, tool, base + tool_offsets::PID_D_TERM,
                               &f64_to_fixed_8_8(params.d))
    }

    pub fn extra_features(&self, tool: usize) -> Result<ExtraFeatures, ProtocolError> {
        let word = self.read16_tool(tool, tool_offsets::EXTRA_FEATURES,
                                    ExtraFeatures::DEFAULT_WORD)?;
        Ok(ExtraFeatures::from_wire(word))
    }

    pub fn set_extra_features(&self, tool: usize, features: ExtraFeatures)
                              -> Result<(), ProtocolError> {
        self.write_tool_eeprom(tool, tool_offsets::EXTRA_FEATURES,
                               &features.to_wire().to_le_bytes())
    }

    /// Generate and store a thermistor lookup table from the sensor's
    /// datasheet constants (Steinhart-Hart beta model), 20 entries of
    /// (ADC, temperature) pairs in descending ADC order.
    pub fn set_thermistor_table(&self, tool: usize, table: usize, r0: f64, t0: f64, beta: f64)
                                -> Result<(), ProtocolError> {
        let base = tool_offsets::THERMISTOR_TABLES[table];

        let mut header = Vec::with_capacity(12);
        header.extend_from_slice(&(r0 as i32).to_le_bytes());
        header.extend_from_slice(&(t0 as i32).to_le_bytes());
        header.extend_from_slice(&(beta as i32).to_le_bytes());
        let mut link = self.lock_link();
        self.write_tool_chunks(&mut **link, tool, base + tool_offsets::THERM_R0, &header)?;

        // series resistor and ADC range of the tool controller board
        const SERIES_R: f64 = 4700.0;
        const ADC_RANGE: f64 = 1024.0;
        const ENTRIES: i32 = 20;

        let k = 1.0 / (t0 + 273.15) - (r0.ln() / beta);
        let mut data = Vec::with_capacity(ENTRIES as usize * 4);
        for i in 0..ENTRIES {
            // span the ADC range without touching the degenerate ends
            let adc = ADC_RANGE * (i + 1) as f64 / (ENTRIES + 1) as f64;
            let resistance = SERIES_R * adc / (ADC_RANGE - adc);
            let celsius = 1.0 / (resistance.ln() / beta + k) - 273.15;
            data.extend_from_slice(&(adc as i16).to_le_bytes());
            data.extend_from_slice(&(celsius as i16).to_le_bytes());
        }
        self.write_tool_chunks(&mut **link, tool, base + tool_offsets::THERM_DATA, &data)
    }

    /// Reassign the slave address of the single connected tool
    /// controller.  Broadcast on both address conventions so any
    /// firmware vintage hears it.
    pub fn set_connected_tool_index(&self, index: usize) -> Result<(), ProtocolError> {
        debug!("reassigning connected tool controller to index {}", index);
        let mut link = self.lock_link();
        self.write_tool_chunks(&mut **link, 255, tool_offsets::SLAVE_ID, &[index as u8])?;
        self.write_tool_chunks(&mut **link, 127, tool_offsets::SLAVE_ID, &[index as u8])
    }

    /// Factory reset: blank the whole settings region.
    pub fn reset_settings_to_blank(&self) -> Result<(), ProtocolError> {
        let mut link = self.lock_link();
        let mut offset = 0;
        while offset < WIPE_END {
            self.write_eeprom_chunks(&mut **link, offset, &[BLANK; MAX_EEPROM_FRAME])?;
            offset += MAX_EEPROM_FRAME as u16;
        }
        Ok(())
    }

    pub fn reset_tool_settings_to_blank(&self, tool: usize) -> Result<(), ProtocolError> {
        let mut link = self.lock_link();
        let mut offset = 0;
        while offset < WIPE_END {
            self.write_tool_chunks(&mut **link, tool, offset, &[BLANK; MAX_TOOL_EEPROM_FRAME])?;
            offset += MAX_TOOL_EEPROM_FRAME as u16;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{MockLink, MockState};
    use crate::machine::MachineConfig;
    use crate::protocol::crc8;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    fn driver() -> (Driver, Arc<Mutex<MockState>>) {
        let (link, state) = MockLink::new();
        (Driver::new(MachineConfig::default(), Box::new(link)), state)
    }

    /// Pull the tool-write fields back out of a captured frame:
    /// `[len][136 or 10][tool][opcode][off lo][off hi][n][data..][crc]`.
    fn tool_write_parts(frame: &[u8]) -> (u16, &[u8]) {
        assert_eq!(frame[1], HostCode::ToolQuery.code());
        assert_eq!(frame[3], ToolCode::WriteEeprom.code());
        let offset = u16::from_le_bytes([frame[4], frame[5]]);
        let len = frame[6] as usize;
        (offset, &frame[7..7 + len])
    }

    #[test]
    fn oversized_tool_write_is_split_in_order() {
        let (driver, state) = driver();
        let data: Vec<u8> = (0..25).collect();
        {
            let mut s = state.lock().unwrap();
            s.script_response(0x81, &[11]);
            s.script_response(0x81, &[11]);
            s.script_response(0x81, &[3]);
        }
        driver.write_tool_eeprom(0, 0x100, &data).unwrap();

        let s = state.lock().unwrap();
        assert_eq!(s.written.len(), 3);
        let mut reassembled = vec![];
        for (frame, expected_offset) in s.written.iter().zip([0x100, 0x10b, 0x116]) {
            let (offset, chunk) = tool_write_parts(frame);
            assert_eq!(offset, expected_offset);
            reassembled.extend_from_slice(chunk);
        }
        assert_eq!(reassembled, data);
    }

    #[test]
    fn oversized_motherboard_write_is_split_at_sixteen() {
        let (driver, state) = driver();
        let data: Vec<u8> = (0..20).collect();
        {
            let mut s = state.lock().unwrap();
            s.script_response(0x81, &[16]);
            s.script_response(0x81, &[4]);
        }
        // chunk path directly, skipping the signature check
        let mut link = driver.lock_link();
        driver.write_eeprom_chunks(&mut **link, 0x40, &data).unwrap();
        drop(link);

        let s = state.lock().unwrap();
        assert_eq!(s.written.len(), 2);
        let first = &s.written[0];
        assert_eq!(first[1], HostCode::WriteEeprom.code());
        assert_eq!(u16::from_le_bytes([first[2], first[3]]), 0x40);
        assert_eq!(first[4], 16);
        let second = &s.written[1];
        assert_eq!(u16::from_le_bytes([second[2], second[3]]), 0x50);
        assert_eq!(second[4], 4);
    }

    /// Acknowledges every frame it sees and yields the thread after
    /// each write, inviting a competing caller to grab the link.
    struct AckLink {
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        pending: VecDeque<u8>,
    }

    impl Link for AckLink {
        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            self.written.lock().unwrap().push(data.to_vec());
            let body = if data[1] == HostCode::ToolQuery.code()
                && data[3] == ToolCode::WriteEeprom.code()
            {
                // echo the chunk length, as a tool write ack does
                vec![0x81, data[6]]
            } else {
                vec![0x81]
            };
            self.pending.push_back(body.len() as u8);
            self.pending.extend(body.iter());
            self.pending.push_back(crc8(&body));
            thread::sleep(Duration::from_millis(2));
            Ok(())
        }

        fn read_byte(&mut self) -> io::Result<Option<u8>> {
            Ok(self.pending.pop_front())
        }

        fn clear(&mut self) -> io::Result<()> {
            self.pending.clear();
            Ok(())
        }

        fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }

        fn pulse_reset(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn chained_write_holds_the_link_for_the_whole_sequence() {
        let written = Arc::new(Mutex::new(vec![]));
        let link = AckLink { written: written.clone(), pending: VecDeque::new() };
        let driver = Driver::new(MachineConfig::default(), Box::new(link));
        let data = [0u8; 25];

        thread::scope(|scope| {
            scope.spawn(|| driver.write_tool_eeprom(0, 0x100, &data).unwrap());
            scope.spawn(|| {
                let init = PacketBuilder::new(HostCode::Init.code()).build();
                for _ in 0..20 {
                    driver.run_command(&init, DEFAULT_RETRIES).unwrap();
                }
            });
        });

        let frames = written.lock().unwrap();
        let chunks: Vec<usize> = frames.iter().enumerate()
            .filter(|(_, f)| f[1] == HostCode::ToolQuery.code())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2] - chunks[0], 2,
                   "sub-writes of one chained write must stay back to back: {:?}", chunks);
    }

    #[test]
    fn missing_signature_wipes_to_blank() {
        let (driver, state) = driver();
        {
            let mut s = state.lock().unwrap();
            // wrong signature, then an ack for each of the 32 wipe rows
            s.script_response(0x81, &[0x00, 0x00]);
            for _ in 0..32 {
                s.script_response(0x81, &[16]);
            }
            // the read the caller actually asked for
            s.script_response(0x81, &[0x1f]);
        }
        let axes = driver.inverted_axes().unwrap();
        assert_eq!(axes.bits(), 0x1f);

        let s = state.lock().unwrap();
        // signature read + 32 wipe writes + settings read
        assert_eq!(s.written.len(), 34);
        let first_wipe = &s.written[1];
        assert_eq!(first_wipe[1], HostCode::WriteEeprom.code());
        assert_eq!(&first_wipe[5..7], &SIGNATURE);
        assert_eq!(&first_wipe[7..21], &[BLANK; 14]);
    }

    #[test]
    fn intact_signature_is_checked_only_once() {
        let (driver, state) = driver();
        {
            let mut s = state.lock().unwrap();
            s.script_response(0x81, &SIGNATURE);
            s.script_response(0x81, &[0x00]);
            s.script_response(0x81, &[0x00]);
        }
        driver.inverted_axes().unwrap();
        driver.endstop_inversion().unwrap();
        // signature read + two settings reads, no re-check
        assert_eq!(state.lock().unwrap().written.len(), 3);
    }

    #[test]
    fn fixed_point_round_trips_typical_pid_terms() {
        for value in [7.0, 0.325, 36.0, 0.0, 255.5] {
            let back = fixed_8_8_to_f64(f64_to_fixed_8_8(value));
            assert!((back - value).abs() < 1.0 / 256.0 + 1e-9, "{} -> {}", value, back);
        }
    }

    #[test]
    fn blank_cells_read_as_defaults() {
        let (driver, state) = driver();
        {
            let mut s = state.lock().unwrap();
            for _ in 0..4 {
                s.script_response(0x81, &[0xff, 0xff]);
            }
        }
        let params = driver.backoff_parameters(0).unwrap();
        assert_eq!(params, BackoffParameters::default());
    }
}
