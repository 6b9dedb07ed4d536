// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Stateful G-code interpreter.
//!
//! Each line is tokenized and dispatched on exactly one of G, M or T,
//! producing zero or more `Command`s.  All session state lives here;
//! the emitted commands are self-contained.  A failed line emits
//! nothing and leaves the session state untouched.

use std::collections::VecDeque;
use std::f64::consts::PI;

use crate::command::{Command, HomingDirection, Rotation};
use crate::error::GcodeError;
use crate::machine::{Axis, AxisSet, MachineConfig, Point5};
use crate::parse::{tokenize, Instruction};

const MM_PER_INCH: f64 = 25.4;

/// Wait-for-tool timeout handed to the firmware when M6 carries no P.
const DEFAULT_TOOL_TIMEOUT_S: u16 = 65535;

/// Letters whose values are lengths and thus subject to inch conversion.
const LENGTH_LETTERS: [char; 10] = ['X', 'Y', 'Z', 'A', 'B', 'E', 'I', 'J', 'K', 'R'];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Units {
    Mm,
    Inch,
}

/// One coordinate-system offset slot.  Only the planar axes are
/// offsettable; the auxiliary axes always run unshifted.
#[derive(Clone, Copy, Default, Debug)]
pub struct Offset {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Mutable translator state for one job.
#[derive(Clone, Debug)]
pub struct SessionState {
    /// Current position, always in mm.
    pub position: Point5,
    pub absolute: bool,
    pub units: Units,
    /// Arc segment length in current-session mm terms, rescaled with the
    /// unit system so arcs keep the same resolution.
    pub curve_segment: f64,
    /// Feed rate in mm/min; 0 until the first F word.
    pub feedrate: f64,
    pub tool: usize,
    /// Slot 0 is the master system (G53), slots 1-6 map to G54-G59.
    pub offsets: [Offset; 7],
    pub active_offset: usize,
}

pub struct Interpreter {
    config: MachineConfig,
    state: SessionState,
}

impl Interpreter {
    pub fn new(config: MachineConfig) -> Self {
        let curve_segment = config.curve_segment_mm;
        Interpreter {
            config,
            state: SessionState {
                position: Point5::default(),
                absolute: false,
                units: Units::Mm,
                curve_segment,
                feedrate: 0.0,
                tool: 0,
                offsets: Default::default(),
                active_offset: 0,
            },
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Overwrite the tracked position, e.g. after the driver reconciled
    /// against the controller.
    pub fn set_position(&mut self, position: Point5) {
        self.state.position = position;
    }

    /// Translate one line, appending the resulting commands to `out`.
    /// Lines without G, M or T (including blank and comment-only lines)
    /// are no-ops.
    pub fn parse(&mut self, line: &str, out: &mut VecDeque<Command>) -> Result<(), GcodeError> {
        let instr = tokenize(line)?;
        if instr.has('G') {
            self.g_codes(&instr, out)
        } else if instr.has('M') {
            self.m_codes(&instr, out)
        } else if instr.has('T') {
            self.t_codes(&instr, out)
        } else {
            Ok(())
        }
    }

    /// Letter value with inch conversion applied for length words.
    fn length(&self, instr: &Instruction, letter: char) -> Option<f64> {
        let value = instr.value(letter)?;
        if self.state.units == Units::Inch && LENGTH_LETTERS.contains(&letter) {
            Some(value * MM_PER_INCH)
        } else {
            Some(value)
        }
    }

    fn motor_axis(&self) -> Axis {
        self.config.tool(self.state.tool).map_or(Axis::A, |t| t.motor_axis)
    }

    /// Target of a motion line.  In absolute mode named planar axes get
    /// the offset-adjusted value, in relative mode values add to the
    /// current position.  E maps onto the active tool's motor axis and
    /// is applied after A, so E wins over an A word on the same line; B
    /// is applied last and wins over both.
    fn target_position(&self, instr: &Instruction) -> Point5 {
        let mut pos = self.state.position;
        let offset = self.state.offsets[self.state.active_offset];
        let motor = self.motor_axis();
        if self.state.absolute {
            if let Some(v) = self.length(instr, 'X') {
                pos.x = v + offset.x;
            }
            if let Some(v) = self.length(instr, 'Y') {
                pos.y = v + offset.y;
            }
            if let Some(v) = self.length(instr, 'Z') {
                pos.z = v + offset.z;
            }
            if let Some(v) = self.length(instr, 'A') {
                pos.a = v;
            }
            if let Some(v) = self.length(instr, 'E') {
                pos.set(motor, v);
            }
            if let Some(v) = self.length(instr, 'B') {
                pos.b = v;
            }
        } else {
            if let Some(v) = self.length(instr, 'X') {
                pos.x += v;
            }
            if let Some(v) = self.length(instr, 'Y') {
                pos.y += v;
            }
            if let Some(v) = self.length(instr, 'Z') {
                pos.z += v;
            }
            if let Some(v) = self.length(instr, 'A') {
                pos.a += v;
            }
            if let Some(v) = self.length(instr, 'E') {
                pos.set(motor, pos.get(motor) + v);
            }
            if let Some(v) = self.length(instr, 'B') {
                pos.b += v;
            }
        }
        pos
    }

    /// Derived feed rate for rapids: the most restrictive axis maximum
    /// scaled onto the whole move.
    fn rapid_feedrate(&self, target: Point5) -> f64 {
        let delta = target.sub(self.state.position).abs();
        let length = delta.magnitude();
        let max = self.config.max_feedrates;
        let mut feedrate = f64::INFINITY;
        for axis in Axis::ALL {
            let d = delta.get(axis);
            if d > 0.0 {
                feedrate = feedrate.min(max.get(axis) * length / d);
            }
        }
        if feedrate.is_finite() {
            feedrate
        } else {
            max.get(Axis::X)
        }
    }

    /// Feed rate a motion code must use: the F word on this line if any,
    /// else the session feed rate, which must be positive by then.
    fn motion_feedrate(&self, instr: &Instruction, number: u32) -> Result<f64, GcodeError> {
        let feedrate = match self.length_feed(instr) {
            Some(f) => f,
            None => self.state.feedrate,
        };
        if feedrate <= 0.0 {
            return Err(GcodeError::MissingParameter { family: 'G', number, letter: 'F' });
        }
        Ok(feedrate)
    }

    /// F is a rate, not a length: it is taken verbatim in mm/min.
    fn length_feed(&self, instr: &Instruction) -> Option<f64> {
        instr.value('F')
    }

    fn named_axes(instr: &Instruction) -> AxisSet {
        let mut axes = AxisSet::empty();
        for axis in Axis::ALL {
            let letter = match axis {
                Axis::X => 'X',
                Axis::Y => 'Y',
                Axis::Z => 'Z',
                Axis::A => 'A',
                Axis::B => 'B',
            };
            if instr.has(letter) {
                axes.insert(axis);
            }
        }
        axes
    }

    /// Shared by T lines and M6: validates the index and moves the
    /// active offset slot along with the tool.
    fn switch_tool(&mut self, tool: usize) -> Result<(), GcodeError> {
        if self.config.tool(tool).is_none() {
            return Err(GcodeError::InvalidTool(tool));
        }
        self.state.tool = tool;
        self.state.active_offset = (tool + 1).min(6);
        Ok(())
    }

    fn g_codes(&mut self, instr: &Instruction, out: &mut VecDeque<Command>) -> Result<(), GcodeError> {
        let number = instr.value_or_zero('G') as u32;
        // Reject unknown codes before anything can touch session state.
        match number {
            0 | 1 | 2 | 3 | 4 | 10 | 20 | 21 | 28 | 53..=59 | 70 | 71 | 90 | 91 | 92 | 97
            | 161 | 162 => (),
            _ => return Err(GcodeError::UnsupportedCode { family: 'G', number }),
        }

        let mut cmds: Vec<Command> = vec![];
        let mut new_position = None;

        match number {
            0 => {
                let target = self.target_position(instr);
                let feedrate = match self.length_feed(instr) {
                    Some(f) => f,
                    None => self.rapid_feedrate(target),
                };
                cmds.push(Command::SetFeedrate(feedrate));
                cmds.push(Command::QueuePoint(target));
                new_position = Some(target);
            }
            1 => {
                let target = self.target_position(instr);
                let feedrate = self.motion_feedrate(instr, 1)?;
                cmds.push(Command::SetFeedrate(feedrate));
                cmds.push(Command::QueuePoint(target));
                new_position = Some(target);
            }
            2 | 3 => {
                if instr.has_any(&['I', 'J']) {
                    let target = self.target_position(instr);
                    let feedrate = self.motion_feedrate(instr, number)?;
                    let center = (
                        self.state.position.x + self.length(instr, 'I').unwrap_or(0.0),
                        self.state.position.y + self.length(instr, 'J').unwrap_or(0.0),
                    );
                    cmds.push(Command::SetFeedrate(feedrate));
                    self.draw_arc(center, target, number == 2, &mut cmds);
                    new_position = Some(target);
                } else if instr.has('R') {
                    // radius-form arcs are not part of this dialect
                    return Err(GcodeError::UnsupportedCode { family: 'G', number });
                }
            }
            4 => {
                cmds.push(Command::Delay { millis: instr.value_or_zero('P') as u64 });
            }
            10 => {
                let slot = instr.value_or_zero('P') as usize;
                if !(1..=6).contains(&slot) {
                    return Err(GcodeError::MissingParameter { family: 'G', number: 10, letter: 'P' });
                }
                let mut offset = self.state.offsets[slot];
                if let Some(v) = self.length(instr, 'X') {
                    offset.x = v;
                }
                if let Some(v) = self.length(instr, 'Y') {
                    offset.y = v;
                }
                if let Some(v) = self.length(instr, 'Z') {
                    offset.z = v;
                }
                self.state.offsets[slot] = offset;
            }
            20 | 70 => {
                self.state.units = Units::Inch;
                self.state.curve_segment = self.config.curve_segment_mm / MM_PER_INCH;
            }
            21 | 71 => {
                self.state.units = Units::Mm;
                self.state.curve_segment = self.config.curve_segment_mm;
            }
            28 | 161 | 162 => {
                let mut axes = Self::named_axes(instr);
                if axes.is_empty() {
                    axes = AxisSet::all();
                }
                let direction = if number == 161 {
                    HomingDirection::Negative
                } else {
                    HomingDirection::Positive
                };
                let feedrate = match self.length_feed(instr) {
                    Some(f) => f,
                    None => axes
                        .iter()
                        .map(|ax| self.config.homing_feedrates.get(ax))
                        .fold(f64::INFINITY, f64::min),
                };
                cmds.push(Command::HomeAxes { axes, direction, feedrate });
            }
            53..=59 => {
                self.state.active_offset = (number - 53) as usize;
            }
            90 => self.state.absolute = true,
            91 => self.state.absolute = false,
            92 => {
                // named axes overwrite the tracked position outright
                let mut pos = self.state.position;
                let offset = self.state.offsets[self.state.active_offset];
                let motor = self.motor_axis();
                if let Some(v) = self.length(instr, 'X') {
                    pos.x = v + offset.x;
                }
                if let Some(v) = self.length(instr, 'Y') {
                    pos.y = v + offset.y;
                }
                if let Some(v) = self.length(instr, 'Z') {
                    pos.z = v + offset.z;
                }
                if let Some(v) = self.length(instr, 'A') {
                    pos.a = v;
                }
                if let Some(v) = self.length(instr, 'E') {
                    pos.set(motor, v);
                }
                if let Some(v) = self.length(instr, 'B') {
                    pos.b = v;
                }
                cmds.push(Command::SetCurrentPosition(pos));
                new_position = Some(pos);
            }
            97 => {
                cmds.push(Command::SetSpindleRpm(instr.value_or_zero('S')));
            }
            _ => unreachable!(),
        }

        // Commit only after the whole line interpreted cleanly.
        if let Some(f) = self.length_feed(instr) {
            self.state.feedrate = f;
        }
        if let Some(pos) = new_position {
            self.state.position = pos;
        }
        out.extend(cmds);
        Ok(())
    }

    /// Interpolate a circular arc as a chain of queued points.
    ///
    /// Angles are measured at the center; the sweep always runs from
    /// `angle_a` to `angle_b` counterclockwise, so for clockwise arcs
    /// the endpoints swap roles and the emitted points run backwards
    /// through the sweep.  A non-positive sweep gets a full turn, which
    /// also makes coincident endpoints trace a complete circle.
    fn draw_arc(&self, center: (f64, f64), target: Point5, clockwise: bool,
                out: &mut Vec<Command>) {
        let current = self.state.position;
        let (ax, ay) = (current.x - center.0, current.y - center.1);
        let (bx, by) = (target.x - center.0, target.y - center.1);

        let (angle_a, mut angle_b) = if clockwise {
            (by.atan2(bx), ay.atan2(ax))
        } else {
            (ay.atan2(ax), by.atan2(bx))
        };
        if angle_b <= angle_a {
            angle_b += 2.0 * PI;
        }
        let sweep = angle_b - angle_a;
        let radius = ax.hypot(ay);
        let length = radius * sweep;

        let steps = ((sweep * 2.4).max(length / self.state.curve_segment).ceil() as u32).max(1);

        let mut point = current;
        for s in 1..=steps {
            let step = if clockwise { steps - s } else { s };
            let angle = angle_a + sweep * step as f64 / steps as f64;
            point.x = center.0 + radius * angle.cos();
            point.y = center.1 + radius * angle.sin();
            // helical moves spread the Z delta evenly over the arc
            point.z = current.z + (target.z - current.z) * s as f64 / steps as f64;
            out.push(Command::QueuePoint(point));
        }
    }

    fn m_codes(&mut self, instr: &Instruction, out: &mut VecDeque<Command>) -> Result<(), GcodeError> {
        let number = instr.value_or_zero('M') as u32;
        let mut cmds: Vec<Command> = vec![];

        match number {
            0 => {
                cmds.push(Command::WaitUntilEmpty);
                cmds.push(Command::Halt { optional: false, message: instr.comment().into() });
            }
            1 => {
                cmds.push(Command::WaitUntilEmpty);
                cmds.push(Command::Halt { optional: true, message: instr.comment().into() });
            }
            2 => {
                cmds.push(Command::WaitUntilEmpty);
                cmds.push(Command::ProgramEnd);
            }
            3 => {
                cmds.push(Command::SetSpindleDirection(Rotation::Clockwise));
                cmds.push(Command::EnableSpindle);
            }
            4 => {
                cmds.push(Command::SetSpindleDirection(Rotation::Counterclockwise));
                cmds.push(Command::EnableSpindle);
            }
            5 => cmds.push(Command::DisableSpindle),
            6 => {
                let tool = instr
                    .value('T')
                    .ok_or(GcodeError::MissingParameter { family: 'M', number: 6, letter: 'T' })?
                    as usize;
                let timeout_s = match instr.value('P') {
                    Some(p) => p as u16,
                    None => DEFAULT_TOOL_TIMEOUT_S,
                };
                self.switch_tool(tool)?;
                cmds.push(Command::WaitForTool { tool, timeout_s });
            }
            7 => cmds.push(Command::EnableFloodCoolant(true)),
            8 => cmds.push(Command::EnableMistCoolant(true)),
            9 => {
                cmds.push(Command::EnableFloodCoolant(false));
                cmds.push(Command::EnableMistCoolant(false));
            }
            10 | 11 => {
                let clamp = instr
                    .value('Q')
                    .ok_or(GcodeError::MissingParameter { family: 'M', number, letter: 'Q' })?
                    as u8;
                cmds.push(if number == 10 {
                    Command::OpenClamp(clamp)
                } else {
                    Command::CloseClamp(clamp)
                });
            }
            13 => {
                cmds.push(Command::SetSpindleDirection(Rotation::Clockwise));
                cmds.push(Command::EnableSpindle);
                cmds.push(Command::EnableFloodCoolant(true));
            }
            14 => {
                cmds.push(Command::SetSpindleDirection(Rotation::Counterclockwise));
                cmds.push(Command::EnableSpindle);
                cmds.push(Command::EnableFloodCoolant(true));
            }
            17 => {
                let axes = Self::named_axes(instr);
                cmds.push(if axes.is_empty() {
                    Command::EnableDrives
                } else {
                    Command::EnableAxes(axes)
                });
            }
            18 => {
                let axes = Self::named_axes(instr);
                cmds.push(if axes.is_empty() {
                    Command::DisableDrives
                } else {
                    Command::DisableAxes(axes)
                });
            }
            21 => cmds.push(Command::OpenCollet),
            22 => cmds.push(Command::CloseCollet),
            30 => {
                cmds.push(Command::WaitUntilEmpty);
                cmds.push(Command::ProgramRewind);
            }
            101 => {
                cmds.push(Command::SetMotorDirection(Rotation::Clockwise));
                cmds.push(Command::EnableMotor);
            }
            102 => {
                cmds.push(Command::SetMotorDirection(Rotation::Counterclockwise));
                cmds.push(Command::EnableMotor);
            }
            103 => cmds.push(Command::DisableMotor),
            104 => cmds.push(Command::SetTemperature(instr.value_or_zero('S'))),
            105 => cmds.push(Command::ReadTemperature),
            106 => cmds.push(if self.config.has_abp {
                Command::ToggleAbp(true)
            } else {
                Command::ToggleFan(true)
            }),
            107 => cmds.push(if self.config.has_abp {
                Command::ToggleAbp(false)
            } else {
                Command::ToggleFan(false)
            }),
            108 => {
                if let Some(s) = instr.value('S') {
                    cmds.push(Command::SetMotorPwm(s as u8));
                } else if let Some(r) = instr.value('R') {
                    cmds.push(Command::SetMotorRpm(r));
                } else {
                    return Err(GcodeError::MissingParameter { family: 'M', number: 108, letter: 'S' });
                }
            }
            109 | 140 => cmds.push(Command::SetPlatformTemperature(instr.value_or_zero('S'))),
            126 => cmds.push(Command::ToggleValve(true)),
            127 => cmds.push(Command::ToggleValve(false)),
            128 => cmds.push(Command::GetPosition),
            131 => cmds.push(Command::StoreHomePositions(Self::named_axes(instr))),
            132 => {
                cmds.push(Command::RecallHomePositions(Self::named_axes(instr)));
                cmds.push(Command::WaitUntilEmpty);
            }
            // handled host-side by slicers, nothing for the machine to do
            141 | 142 => (),
            200 => cmds.push(Command::Initialize),
            310 => {
                cmds.push(Command::WaitUntilEmpty);
                cmds.push(Command::StartDataCapture(instr.comment().into()));
            }
            311 => {
                cmds.push(Command::WaitUntilEmpty);
                cmds.push(Command::StopDataCapture);
            }
            _ => return Err(GcodeError::UnsupportedCode { family: 'M', number }),
        }

        out.extend(cmds);
        Ok(())
    }

    fn t_codes(&mut self, instr: &Instruction, out: &mut VecDeque<Command>) -> Result<(), GcodeError> {
        let tool = instr.value_or_zero('T') as usize;
        self.switch_tool(tool)?;
        out.push_back(Command::SelectTool(tool));
        Ok(())
    }
}
