// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according
// to those terms.

//! The machine-agnostic command vocabulary.
//!
//! This enum is the seam between interpretation and execution: the
//! interpreter emits it, and anything that consumes it is a valid
//! backend (the live protocol driver, a file writer, a simulator).

use crate::machine::{AxisSet, Point5};

/// Rotation direction for extruder motors and spindles.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Rotation {
    Clockwise,
    Counterclockwise,
}

/// Direction of travel for a homing move.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HomingDirection {
    Positive,
    Negative,
}

/// One machine operation.  Coordinates are always millimeters, feed
/// rates mm/min; variants carry everything the backend needs.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Move in a straight line to an absolute five-axis position.
    QueuePoint(Point5),
    /// Set the feed rate used by subsequent queued points.
    SetFeedrate(f64),
    SelectTool(usize),
    /// Select a tool and block until it reaches its target temperature.
    WaitForTool { tool: usize, timeout_s: u16 },
    /// Home the given axes; the feed rate is already resolved.
    HomeAxes { axes: AxisSet, direction: HomingDirection, feedrate: f64 },
    Delay { millis: u64 },
    /// Extruder target temperature, degrees C.
    SetTemperature(f64),
    SetPlatformTemperature(f64),
    ReadTemperature,
    ToggleFan(bool),
    ToggleValve(bool),
    /// Automated build platform conveyor on/off.
    ToggleAbp(bool),
    SetMotorDirection(Rotation),
    EnableMotor,
    DisableMotor,
    SetMotorRpm(f64),
    SetMotorPwm(u8),
    SetSpindleDirection(Rotation),
    EnableSpindle,
    DisableSpindle,
    SetSpindleRpm(f64),
    EnableFloodCoolant(bool),
    EnableMistCoolant(bool),
    EnableAxes(AxisSet),
    DisableAxes(AxisSet),
    /// All stepper drivers at once.
    EnableDrives,
    DisableDrives,
    OpenClamp(u8),
    CloseClamp(u8),
    OpenCollet,
    CloseCollet,
    /// Block until the controller's command queue has drained.
    WaitUntilEmpty,
    ProgramEnd,
    ProgramRewind,
    Halt { optional: bool, message: String },
    StoreHomePositions(AxisSet),
    RecallHomePositions(AxisSet),
    /// Overwrite the controller's idea of where it is.
    SetCurrentPosition(Point5),
    GetPosition,
    Initialize,
    /// Start capturing the buffered command stream to an SD file.
    StartDataCapture(String),
    StopDataCapture,
}
