// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Protocol driver: owns the physical link and executes the command
//! vocabulary against Gen3 firmware.
//!
//! The link sits behind a mutex; every exchange, retries included, runs
//! under one acquisition so concurrent callers can never interleave
//! half-duplex traffic.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::command::{Command, HomingDirection, Rotation};
use crate::error::ProtocolError;
use crate::machine::{Axis, AxisSet, MachineConfig, Point5};
use crate::protocol::{Decoder, HostCode, PacketBuilder, Response, ResponseCode, ToolCode};

/// Default retry budget for a buffered command.
pub const DEFAULT_RETRIES: i32 = 5;

/// Version-query timeout; also the boot window the firmware needs after
/// the auto-reset that opening the port can trigger.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(2600);

/// Protocol version the host advertises in the version query.
const HOST_VERSION: u16 = 100;

/// Oldest firmware this driver is tested against.
pub const MINIMUM_VERSION: FirmwareVersion = FirmwareVersion { major: 3, minor: 0 };

const EXTENDED_STOP_VERSION: FirmwareVersion = FirmwareVersion { major: 2, minor: 7 };
const WDT_RESET_VERSION: FirmwareVersion = FirmwareVersion { major: 1, minor: 4 };

/// Polling interval while waiting for the command queue to drain.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// How long to keep reading stray bytes after a cancellation before
/// clearing the link.
const CANCEL_DRAIN: Duration = Duration::from_millis(10);

/// Byte transport under the packet codec.  The one seam a test or a
/// different physical layer has to fill in.
pub trait Link: Send {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    /// Blocking single-byte read; `None` on timeout.
    fn read_byte(&mut self) -> io::Result<Option<u8>>;
    /// Drop unread inbound bytes.
    fn clear(&mut self) -> io::Result<()>;
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
    /// Pulse the reset line to reboot the controller.
    fn pulse_reset(&mut self) -> io::Result<()>;
}

/// `Link` over a real serial port.
pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLink {
    pub fn open(path: &str, baud: u32) -> Result<Self, ProtocolError> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| ProtocolError::HandshakeFailure(
                format!("cannot open {}: {}", path, e)))?;
        Ok(SerialLink { port })
    }
}

impl Link for SerialLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn clear(&mut self) -> io::Result<()> {
        self.port.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout)?;
        Ok(())
    }

    fn pulse_reset(&mut self) -> io::Result<()> {
        self.port.write_request_to_send(false)?;
        thread::sleep(Duration::from_millis(100));
        self.port.write_request_to_send(true)?;
        Ok(())
    }
}

/// Firmware version from the version query, encoded on the wire as
/// `major * 100 + minor`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
}

impl FirmwareVersion {
    pub fn from_wire(value: u16) -> Self {
        FirmwareVersion { major: value / 100, minor: value % 100 }
    }

    pub fn at_least(self, other: FirmwareVersion) -> bool {
        self >= other
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DriverState {
    Disconnected,
    Connecting,
    Initialized,
    Executing,
    Paused,
}

pub struct Driver {
    config: MachineConfig,
    link: Mutex<Box<dyn Link>>,
    state: Mutex<DriverState>,
    /// Tracked machine position; `None` means unknown and triggers a
    /// firmware query before the next position-dependent operation.
    position: Mutex<Option<Point5>>,
    version: Mutex<Option<FirmwareVersion>>,
    feedrate: Mutex<f64>,
    tool: Mutex<usize>,
    motor_direction: Mutex<Rotation>,
    spindle_direction: Mutex<Rotation>,
    eeprom_checked: AtomicBool,
    cancelled: AtomicBool,
}

impl Driver {
    pub fn new(config: MachineConfig, link: Box<dyn Link>) -> Self {
        Driver {
            config,
            link: Mutex::new(link),
            state: Mutex::new(DriverState::Disconnected),
            position: Mutex::new(None),
            version: Mutex::new(None),
            feedrate: Mutex::new(0.0),
            tool: Mutex::new(0),
            motor_direction: Mutex::new(Rotation::Clockwise),
            spindle_direction: Mutex::new(Rotation::Clockwise),
            eeprom_checked: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn state(&self) -> DriverState {
        *self.state.lock().unwrap()
    }

    pub fn version(&self) -> FirmwareVersion {
        self.version.lock().unwrap().unwrap_or_default()
    }

    /// Ask the in-flight (and any future) exchange to abort.  Cleared by
    /// `resume_after_cancel`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn resume_after_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub(crate) fn eeprom_checked(&self) -> &AtomicBool {
        &self.eeprom_checked
    }

    /// Take the link for a multi-packet sequence that must not be
    /// interleaved with other callers; pair with [`Driver::exchange`].
    pub(crate) fn lock_link(&self) -> MutexGuard<'_, Box<dyn Link>> {
        self.link.lock().unwrap()
    }

    /// Handshake with the controller and bring every configured tool up.
    ///
    /// One silent attempt, one more after waiting out the firmware boot
    /// window, then a reset-line pulse and a last try.
    pub fn connect(&self) -> Result<FirmwareVersion, ProtocolError> {
        *self.state.lock().unwrap() = DriverState::Connecting;
        self.link.lock().unwrap().set_timeout(HANDSHAKE_TIMEOUT)?;

        for attempt in 0..3 {
            match attempt {
                1 => {
                    // opening the port may itself have reset the board
                    debug!("no version reply, waiting out the boot window");
                    thread::sleep(HANDSHAKE_TIMEOUT);
                }
                2 => {
                    warn!("still no version reply, pulsing the reset line");
                    self.link.lock().unwrap().pulse_reset()?;
                    thread::sleep(HANDSHAKE_TIMEOUT);
                }
                _ => (),
            }
            if let Some(version) = self.attempt_handshake()? {
                info!("connected to firmware v{}", version);
                if !version.at_least(MINIMUM_VERSION) {
                    warn!("firmware v{} is older than the tested v{}",
                          version, MINIMUM_VERSION);
                }
                *self.version.lock().unwrap() = Some(version);
                self.send_init()?;
                for tool in 0..self.config.tools.len() {
                    self.init_tool(tool)?;
                }
                *self.state.lock().unwrap() = DriverState::Initialized;
                return Ok(version);
            }
        }

        *self.state.lock().unwrap() = DriverState::Disconnected;
        Err(ProtocolError::HandshakeFailure(
            "no response to the version query, even after a reset".into()))
    }

    fn attempt_handshake(&self) -> Result<Option<FirmwareVersion>, ProtocolError> {
        self.link.lock().unwrap().clear()?;
        let mut pb = PacketBuilder::new(HostCode::Version.code());
        pb.add16(HOST_VERSION);
        match self.run_command(&pb.build(), 1) {
            Ok(mut resp) => {
                if resp.remaining() < 2 {
                    error!("version reply too short");
                    return Ok(None);
                }
                let raw = resp.read16();
                if raw == 0 {
                    error!("firmware reported a null version");
                    return Ok(None);
                }
                Ok(Some(FirmwareVersion::from_wire(raw)))
            }
            Err(ProtocolError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn send_init(&self) -> Result<(), ProtocolError> {
        let pb = PacketBuilder::new(HostCode::Init.code());
        self.run_command(&pb.build(), DEFAULT_RETRIES)?;
        Ok(())
    }

    /// Probe a tool controller and restore its cached motor speed.  The
    /// probe is deliberately unreliable: a missing tool is a warning,
    /// not a connect failure.
    fn init_tool(&self, tool: usize) -> Result<(), ProtocolError> {
        let mut pb = PacketBuilder::new(HostCode::ToolQuery.code());
        pb.add8(tool as u8).add8(ToolCode::Version.code()).add16(HOST_VERSION);
        match self.run_command(&pb.build(), -2) {
            Ok(mut resp) if resp.remaining() >= 2 => {
                debug!("tool {} firmware v{}", tool, FirmwareVersion::from_wire(resp.read16()));
            }
            Ok(_) | Err(ProtocolError::Timeout) => {
                warn!("tool {} did not answer its version probe", tool);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        let cfg = self.config.tools[tool].clone();
        if cfg.motor_is_stepper {
            self.set_motor_rpm(tool, cfg.motor_rpm)?;
        } else {
            self.set_motor_pwm(tool, cfg.motor_pwm)?;
        }
        Ok(())
    }

    /// Send one packet and return the first valid OK response.
    ///
    /// `retries` is the remaining budget: a checksum fault, a read
    /// timeout or a retriable error response each consume one attempt
    /// and resend.  A non-positive starting budget runs the same loop
    /// silently, counting up toward zero (the "unreliable probe" used
    /// when absence of a device is expected).  Buffer-overflow and
    /// cancel replies return at once and never touch the budget.
    pub fn run_command(&self, packet: &[u8], retries: i32) -> Result<Response, ProtocolError> {
        let mut link = self.link.lock().unwrap();
        self.exchange(&mut **link, packet, retries)
    }

    pub(crate) fn exchange(&self, link: &mut dyn Link, packet: &[u8], mut retries: i32)
                           -> Result<Response, ProtocolError> {
        if packet.len() < 3 {
            return Err(ProtocolError::Exchange("refusing to send an undersized packet".into()));
        }
        let silent = retries <= 0;
        loop {
            if retries == 0 {
                if !silent {
                    error!("packet {:02x?} timed out after exhausting retries", packet);
                }
                return Err(ProtocolError::Timeout);
            }
            if self.cancelled.load(Ordering::SeqCst) {
                // drain trailing bytes so the next exchange syncs cleanly
                thread::sleep(CANCEL_DRAIN);
                let _ = link.clear();
                return Err(ProtocolError::Cancelled);
            }

            link.write_all(packet)?;
            debug!("OUT {:02x?}", packet);

            let mut decoder = Decoder::new();
            let outcome = loop {
                match link.read_byte()? {
                    None => break None,
                    Some(byte) => match decoder.feed(byte) {
                        Ok(Some(response)) => break Some(response),
                        Ok(None) => (),
                        Err(ProtocolError::ChecksumFault) => {
                            if !silent {
                                error!("checksum fault on inbound frame, resending");
                            }
                            break None;
                        }
                        Err(e) => return Err(e),
                    },
                }
            };

            match outcome {
                Some(response) => match response.code() {
                    ResponseCode::Ok => {
                        debug!("IN  {:02x?}", response.payload());
                        return Ok(response);
                    }
                    ResponseCode::BufferOverflow => return Err(ProtocolError::BufferOverflow),
                    ResponseCode::Cancel => {
                        error!("build cancelled by the machine");
                        return Err(ProtocolError::Cancelled);
                    }
                    code => {
                        if !silent {
                            warn!("error response {:?}, resending", code);
                        }
                    }
                },
                None => {
                    if !silent {
                        warn!("read timed out, {} attempts left", retries - 1);
                    }
                }
            }
            retries += if silent { 1 } else { -1 };
        }
    }

    /// Execute one vocabulary command against the live machine.
    pub fn execute(&self, command: &Command) -> Result<(), ProtocolError> {
        match command {
            Command::QueuePoint(target) => self.queue_point(*target),
            Command::SetFeedrate(feedrate) => {
                *self.feedrate.lock().unwrap() = *feedrate;
                Ok(())
            }
            Command::SelectTool(tool) => self.select_tool(*tool),
            Command::WaitForTool { tool, timeout_s } => self.wait_for_tool(*tool, *timeout_s),
            Command::HomeAxes { axes, direction, feedrate } => {
                self.home_axes(*axes, *direction, *feedrate)
            }
            Command::Delay { millis } => {
                let mut pb = PacketBuilder::new(HostCode::Delay.code());
                pb.add32(*millis as u32);
                self.run_command(&pb.build(), DEFAULT_RETRIES)?;
                Ok(())
            }
            Command::SetTemperature(celsius) => {
                let tool = *self.tool.lock().unwrap();
                let target = celsius.round().clamp(0.0, 65535.0) as u16;
                self.tool_command(tool, ToolCode::SetTemperature, &target.to_le_bytes())?;
                Ok(())
            }
            Command::SetPlatformTemperature(celsius) => {
                let tool = *self.tool.lock().unwrap();
                let target = celsius.round().clamp(0.0, 65535.0) as u16;
                self.tool_command(tool, ToolCode::SetPlatformTemperature, &target.to_le_bytes())?;
                Ok(())
            }
            Command::ReadTemperature => {
                let tool = *self.tool.lock().unwrap();
                let mut resp = self.tool_query(tool, ToolCode::GetTemperature, &[])?;
                if resp.remaining() < 2 {
                    return Err(ProtocolError::Exchange("truncated temperature reply".into()));
                }
                info!("tool {} temperature: {} C", tool, resp.read16());
                Ok(())
            }
            Command::ToggleFan(on) => {
                let tool = *self.tool.lock().unwrap();
                self.tool_command(tool, ToolCode::ToggleFan, &[*on as u8])?;
                Ok(())
            }
            Command::ToggleValve(on) => {
                let tool = *self.tool.lock().unwrap();
                self.tool_command(tool, ToolCode::ToggleValve, &[*on as u8])?;
                Ok(())
            }
            Command::ToggleAbp(on) => {
                let tool = *self.tool.lock().unwrap();
                self.tool_command(tool, ToolCode::ToggleAbp, &[*on as u8])?;
                Ok(())
            }
            Command::SetMotorDirection(dir) => {
                *self.motor_direction.lock().unwrap() = *dir;
                Ok(())
            }
            Command::EnableMotor => self.toggle_motor(ToolCode::ToggleMotor1,
                                                      *self.motor_direction.lock().unwrap(), true),
            Command::DisableMotor => self.toggle_motor(ToolCode::ToggleMotor1,
                                                       *self.motor_direction.lock().unwrap(), false),
            Command::SetMotorRpm(rpm) => {
                let tool = *self.tool.lock().unwrap();
                self.set_motor_rpm(tool, *rpm)
            }
            Command::SetMotorPwm(pwm) => {
                let tool = *self.tool.lock().unwrap();
                self.set_motor_pwm(tool, *pwm)
            }
            Command::SetSpindleDirection(dir) => {
                *self.spindle_direction.lock().unwrap() = *dir;
                Ok(())
            }
            Command::EnableSpindle => self.toggle_motor(ToolCode::ToggleMotor2,
                                                        *self.spindle_direction.lock().unwrap(), true),
            Command::DisableSpindle => self.toggle_motor(ToolCode::ToggleMotor2,
                                                         *self.spindle_direction.lock().unwrap(), false),
            Command::SetSpindleRpm(rpm) => {
                let tool = *self.tool.lock().unwrap();
                let micros = rpm_to_micros(*rpm);
                self.tool_command(tool, ToolCode::SetMotor2Rpm, &micros.to_le_bytes())?;
                Ok(())
            }
            Command::EnableFloodCoolant(_) | Command::EnableMistCoolant(_) => {
                debug!("coolant control not present on this machine");
                Ok(())
            }
            Command::EnableAxes(axes) => self.enable_axes(*axes, true),
            Command::DisableAxes(axes) => self.enable_axes(*axes, false),
            Command::EnableDrives => self.enable_axes(AxisSet::all(), true),
            Command::DisableDrives => self.enable_axes(AxisSet::all(), false),
            Command::OpenClamp(index) | Command::CloseClamp(index) => {
                debug!("no clamp {} on this machine", index);
                Ok(())
            }
            Command::OpenCollet | Command::CloseCollet => {
                debug!("no collet on this machine");
                Ok(())
            }
            Command::WaitUntilEmpty => self.wait_until_empty(),
            Command::ProgramEnd => self.stop(false),
            Command::ProgramRewind => {
                info!("program rewind requested");
                Ok(())
            }
            Command::Halt { optional, message } => {
                if message.is_empty() {
                    info!("halt (optional: {})", optional);
                } else {
                    info!("halt (optional: {}): {}", optional, message);
                }
                self.stop(true)
            }
            Command::StoreHomePositions(axes) => {
                let mut pb = PacketBuilder::new(HostCode::StoreHomePositions.code());
                pb.add8(axes.bits());
                self.run_command(&pb.build(), DEFAULT_RETRIES)?;
                Ok(())
            }
            Command::RecallHomePositions(axes) => {
                let mut pb = PacketBuilder::new(HostCode::RecallHomePositions.code());
                pb.add8(axes.bits());
                self.run_command(&pb.build(), DEFAULT_RETRIES)?;
                self.invalidate_position();
                Ok(())
            }
            Command::SetCurrentPosition(position) => self.set_current_position(*position),
            Command::GetPosition => {
                let position = self.current_position()?;
                info!("machine position: {:?}", position);
                Ok(())
            }
            Command::Initialize => self.send_init(),
            Command::StartDataCapture(filename) => {
                self.begin_capture(filename)?;
                Ok(())
            }
            Command::StopDataCapture => {
                let bytes = self.end_capture()?;
                info!("capture finished, {} bytes written", bytes);
                Ok(())
            }
        }
    }

    /// Queue a straight-line move.  Timing is expressed as microseconds
    /// per step of the dominant axis; moves that round to zero steps are
    /// never submitted.
    fn queue_point(&self, target: Point5) -> Result<(), ProtocolError> {
        let current = self.current_position()?;
        let delta_mm = target.sub(current).abs();
        let delta_steps = self.config.mm_to_steps(delta_mm);
        let master_steps = delta_steps.max_component();
        if master_steps <= 0.0 {
            return Ok(());
        }

        let feedrate = self.safe_feedrate(delta_mm);
        let duration_us = delta_mm.magnitude() / feedrate * 60_000_000.0;
        let step_delay = (duration_us / master_steps).round() as u32;

        let steps = self.config.mm_to_steps(target);
        let mut pb = PacketBuilder::new(HostCode::QueuePointAbs.code());
        pb.add32(steps.x.round() as i32 as u32);
        pb.add32(steps.y.round() as i32 as u32);
        pb.add32(steps.z.round() as i32 as u32);
        pb.add32(step_delay);
        self.run_command(&pb.build(), DEFAULT_RETRIES)?;
        *self.position.lock().unwrap() = Some(target);
        Ok(())
    }

    /// Clamp the session feed rate to every moving axis's maximum.
    fn safe_feedrate(&self, delta: Point5) -> f64 {
        let max = self.config.max_feedrates;
        let mut feedrate = *self.feedrate.lock().unwrap();
        if feedrate <= 0.0 {
            // no feed rate set yet, start from the fastest axis
            for axis in Axis::ALL {
                feedrate = feedrate.max(max.get(axis));
            }
        }
        for axis in Axis::ALL {
            if delta.get(axis) > 0.0 {
                feedrate = feedrate.min(max.get(axis));
            }
        }
        feedrate
    }

    fn select_tool(&self, tool: usize) -> Result<(), ProtocolError> {
        let mut pb = PacketBuilder::new(HostCode::ChangeTool.code());
        pb.add8(tool as u8);
        self.run_command(&pb.build(), DEFAULT_RETRIES)?;
        *self.tool.lock().unwrap() = tool;
        Ok(())
    }

    /// Tool change: select, then block until the heaters report ready.
    fn wait_for_tool(&self, tool: usize, timeout_s: u16) -> Result<(), ProtocolError> {
        self.select_tool(tool)?;
        let cfg = match self.config.tool(tool) {
            Some(cfg) => cfg.clone(),
            None => return Ok(()),
        };
        // delay between firmware-side polls, in ms
        const PING_DELAY: u16 = 100;
        if cfg.target_temperature > 0.0 {
            let mut pb = PacketBuilder::new(HostCode::WaitForTool.code());
            pb.add8(tool as u8).add16(PING_DELAY).add16(timeout_s);
            self.run_command(&pb.build(), DEFAULT_RETRIES)?;
        }
        if cfg.has_heated_platform && cfg.platform_target_temperature > 0.0 {
            let mut pb = PacketBuilder::new(HostCode::WaitForPlatform.code());
            pb.add8(tool as u8).add16(PING_DELAY).add16(timeout_s);
            self.run_command(&pb.build(), DEFAULT_RETRIES)?;
        }
        Ok(())
    }

    fn home_axes(&self, axes: AxisSet, direction: HomingDirection, feedrate: f64)
                 -> Result<(), ProtocolError> {
        // a unit move along each homed axis gives the timing vector
        let mut unit = Point5::default();
        let mut timeout_s = 0.0f64;
        for axis in axes.iter() {
            unit.set(axis, 1.0);
            timeout_s = timeout_s.max(self.config.homing_timeouts.get(axis));
        }
        let master_steps = self.config.mm_to_steps(unit).max_component();
        if master_steps <= 0.0 || feedrate <= 0.0 {
            return Ok(());
        }
        let duration_us = unit.magnitude() / feedrate * 60_000_000.0;
        let step_delay = (duration_us / master_steps).round() as u32;

        let opcode = match direction {
            HomingDirection::Positive => HostCode::FindAxesMaximum,
            HomingDirection::Negative => HostCode::FindAxesMinimum,
        };
        let mut pb = PacketBuilder::new(opcode.code());
        pb.add8(axes.bits()).add32(step_delay).add16(timeout_s as u16);
        self.run_command(&pb.build(), DEFAULT_RETRIES)?;
        // wherever the endstops are, it is not where we thought
        self.invalidate_position();
        Ok(())
    }

    fn enable_axes(&self, axes: AxisSet, enable: bool) -> Result<(), ProtocolError> {
        let mut pb = PacketBuilder::new(HostCode::EnableAxes.code());
        pb.add8(axes.bits() | if enable { 0x80 } else { 0 });
        self.run_command(&pb.build(), DEFAULT_RETRIES)?;
        Ok(())
    }

    fn toggle_motor(&self, motor: ToolCode, direction: Rotation, enable: bool)
                    -> Result<(), ProtocolError> {
        let tool = *self.tool.lock().unwrap();
        let mut flags = 0u8;
        if enable {
            flags |= 1;
        }
        if direction == Rotation::Clockwise {
            flags |= 2;
        }
        self.tool_command(tool, motor, &[flags])?;
        Ok(())
    }

    fn set_motor_rpm(&self, tool: usize, rpm: f64) -> Result<(), ProtocolError> {
        let micros = rpm_to_micros(rpm);
        self.tool_command(tool, ToolCode::SetMotor1Rpm, &micros.to_le_bytes())?;
        Ok(())
    }

    fn set_motor_pwm(&self, tool: usize, pwm: u8) -> Result<(), ProtocolError> {
        self.tool_command(tool, ToolCode::SetMotor1Pwm, &[pwm])?;
        Ok(())
    }

    /// Forward a buffered command to a tool controller.
    pub(crate) fn tool_command(&self, tool: usize, code: ToolCode, payload: &[u8])
                               -> Result<Response, ProtocolError> {
        let mut pb = PacketBuilder::new(HostCode::ToolCommand.code());
        pb.add8(tool as u8).add8(code.code()).add8(payload.len() as u8).add_bytes(payload);
        self.run_command(&pb.build(), DEFAULT_RETRIES)
    }

    /// Forward an immediate query to a tool controller.
    pub(crate) fn tool_query(&self, tool: usize, code: ToolCode, args: &[u8])
                             -> Result<Response, ProtocolError> {
        let mut pb = PacketBuilder::new(HostCode::ToolQuery.code());
        pb.add8(tool as u8).add8(code.code()).add_bytes(args);
        self.run_command(&pb.build(), DEFAULT_RETRIES)
    }

    fn wait_until_empty(&self) -> Result<(), ProtocolError> {
        loop {
            let pb = PacketBuilder::new(HostCode::IsFinished.code());
            match self.run_command(&pb.build(), DEFAULT_RETRIES) {
                Ok(mut resp) => {
                    if resp.remaining() == 0 || resp.read8() != 0 {
                        return Ok(());
                    }
                }
                Err(ProtocolError::Timeout) => {
                    // old firmware without is-finished support
                    warn!("is-finished query went unanswered, assuming drained");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            thread::sleep(DRAIN_POLL);
        }
    }

    pub fn invalidate_position(&self) {
        *self.position.lock().unwrap() = None;
    }

    /// Tracked position, reconciling against the controller when the
    /// cache was invalidated by a home, stop or reset.
    pub fn current_position(&self) -> Result<Point5, ProtocolError> {
        let mut cache = self.position.lock().unwrap();
        if let Some(position) = *cache {
            return Ok(position);
        }
        let pb = PacketBuilder::new(HostCode::GetPosition.code());
        let mut resp = self.run_command(&pb.build(), DEFAULT_RETRIES)?;
        if resp.remaining() < 12 {
            return Err(ProtocolError::Exchange("truncated position reply".into()));
        }
        let steps = Point5::new(
            resp.read32() as i32 as f64,
            resp.read32() as i32 as f64,
            resp.read32() as i32 as f64,
            0.0,
            0.0,
        );
        let position = self.config.steps_to_mm(steps);
        debug!("reconciled position to {:?}", position);
        *cache = Some(position);
        Ok(position)
    }

    fn set_current_position(&self, position: Point5) -> Result<(), ProtocolError> {
        let steps = self.config.mm_to_steps(position);
        let mut pb = PacketBuilder::new(HostCode::SetPosition.code());
        pb.add32(steps.x.round() as i32 as u32);
        pb.add32(steps.y.round() as i32 as u32);
        pb.add32(steps.z.round() as i32 as u32);
        self.run_command(&pb.build(), DEFAULT_RETRIES)?;
        *self.position.lock().unwrap() = Some(position);
        Ok(())
    }

    /// Stop motion.  Newer firmware gets the extended stop that also
    /// clears the command queue; `abort` or old firmware falls back to
    /// the hard abort.
    pub fn stop(&self, abort: bool) -> Result<(), ProtocolError> {
        let frame = if !abort && self.version().at_least(EXTENDED_STOP_VERSION) {
            let mut pb = PacketBuilder::new(HostCode::ExtendedStop.code());
            // bit 0: stop motion, bit 1: clear the queue
            pb.add8(0x03);
            pb.build()
        } else {
            PacketBuilder::new(HostCode::Abort.code()).build()
        };
        self.run_command(&frame, DEFAULT_RETRIES)?;
        self.invalidate_position();
        Ok(())
    }

    /// Soft-reset the controller (watchdog reset, firmware >= 1.4).  The
    /// driver must reconnect afterwards.
    pub fn reset(&self) -> Result<(), ProtocolError> {
        if self.version().at_least(WDT_RESET_VERSION) {
            let pb = PacketBuilder::new(HostCode::Reset.code());
            self.run_command(&pb.build(), DEFAULT_RETRIES)?;
        }
        self.invalidate_position();
        *self.state.lock().unwrap() = DriverState::Disconnected;
        Ok(())
    }

    /// Pause and unpause are one firmware-side toggle.
    pub fn pause(&self) -> Result<(), ProtocolError> {
        let pb = PacketBuilder::new(HostCode::Pause.code());
        self.run_command(&pb.build(), DEFAULT_RETRIES)?;
        let mut state = self.state.lock().unwrap();
        *state = match *state {
            DriverState::Paused => DriverState::Executing,
            _ => DriverState::Paused,
        };
        Ok(())
    }
}

/// RPM to the firmware's microseconds-per-revolution representation.
fn rpm_to_micros(rpm: f64) -> u32 {
    if rpm <= 0.0 {
        0
    } else {
        (60_000_000.0 / rpm).round() as u32
    }
}
