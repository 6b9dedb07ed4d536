// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Static machine model: axes, five-axis points, tool and machine
//! configuration.

use std::fmt;
use strum_macros::Display;

/// One of the five controllable axes.  A and B are the auxiliary axes
/// driven by the extruder controllers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display)]
pub enum Axis {
    X,
    Y,
    Z,
    A,
    B,
}

impl Axis {
    pub const ALL: [Axis; 5] = [Axis::X, Axis::Y, Axis::Z, Axis::A, Axis::B];

    /// Bit position in the wire bitfield, also the index into `Point5`.
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
            Axis::A => 3,
            Axis::B => 4,
        }
    }
}

/// A set of axes, stored as the controller's wire bitfield (bit n is
/// axis n).
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct AxisSet(u8);

impl AxisSet {
    pub fn empty() -> Self {
        AxisSet(0)
    }

    pub fn all() -> Self {
        AxisSet(0x1f)
    }

    pub fn from_bits(bits: u8) -> Self {
        AxisSet(bits & 0x1f)
    }

    pub fn insert(&mut self, axis: Axis) {
        self.0 |= 1 << axis.index();
    }

    pub fn contains(self, axis: Axis) -> bool {
        self.0 & (1 << axis.index()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn iter(self) -> impl Iterator<Item = Axis> {
        Axis::ALL.iter().copied().filter(move |ax| self.contains(*ax))
    }
}

impl FromIterator<Axis> for AxisSet {
    fn from_iter<I: IntoIterator<Item = Axis>>(iter: I) -> Self {
        let mut set = AxisSet::empty();
        for axis in iter {
            set.insert(axis);
        }
        set
    }
}

impl fmt::Display for AxisSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for axis in self.iter() {
            write!(f, "{}", axis)?;
        }
        Ok(())
    }
}

/// A five-axis coordinate.  Interpreter and driver positions are always
/// in millimeters; step-space points only occur transiently around the
/// wire conversions.
#[derive(Clone, Copy, PartialEq, Default)]
pub struct Point5 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub a: f64,
    pub b: f64,
}

impl Point5 {
    pub fn new(x: f64, y: f64, z: f64, a: f64, b: f64) -> Self {
        Point5 { x, y, z, a, b }
    }

    pub fn get(self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::A => self.a,
            Axis::B => self.b,
        }
    }

    pub fn set(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
            Axis::A => self.a = value,
            Axis::B => self.b = value,
        }
    }

    pub fn sub(self, other: Point5) -> Point5 {
        Point5::new(self.x - other.x, self.y - other.y, self.z - other.z,
                    self.a - other.a, self.b - other.b)
    }

    pub fn abs(self) -> Point5 {
        Point5::new(self.x.abs(), self.y.abs(), self.z.abs(),
                    self.a.abs(), self.b.abs())
    }

    /// Componentwise product, used for the mm <-> step conversions.
    pub fn mul(self, other: Point5) -> Point5 {
        Point5::new(self.x * other.x, self.y * other.y, self.z * other.z,
                    self.a * other.a, self.b * other.b)
    }

    pub fn div(self, other: Point5) -> Point5 {
        Point5::new(self.x / other.x, self.y / other.y, self.z / other.z,
                    self.a / other.a, self.b / other.b)
    }

    pub fn magnitude(self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z +
         self.a * self.a + self.b * self.b).sqrt()
    }

    /// Largest component; on an absolute delta this is the dominant axis.
    pub fn max_component(self) -> f64 {
        self.x.max(self.y).max(self.z).max(self.a).max(self.b)
    }
}

impl fmt::Debug for Point5 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {}, {}, {}, {})", self.x, self.y, self.z, self.a, self.b)
    }
}

/// Which auxiliary axis a tool's motor drives, and the cached speeds to
/// restore after a controller reset.
#[derive(Clone, Debug)]
pub struct ToolConfig {
    pub motor_axis: Axis,
    /// Stepper-driven extruders take an RPM, DC-driven ones a PWM duty.
    pub motor_is_stepper: bool,
    pub motor_rpm: f64,
    pub motor_pwm: u8,
    pub motor_clockwise: bool,
    pub target_temperature: f64,
    pub has_heated_platform: bool,
    pub platform_target_temperature: f64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        ToolConfig {
            motor_axis: Axis::A,
            motor_is_stepper: false,
            motor_rpm: 1.98,
            motor_pwm: 255,
            motor_clockwise: true,
            target_temperature: 0.0,
            has_heated_platform: false,
            platform_target_temperature: 0.0,
        }
    }
}

/// Full machine definition handed to interpreter and driver at
/// construction.  Feed rates are mm/min, timeouts are seconds.
#[derive(Clone, Debug)]
pub struct MachineConfig {
    pub steps_per_mm: Point5,
    pub max_feedrates: Point5,
    pub homing_feedrates: Point5,
    pub homing_timeouts: Point5,
    /// Arc interpolation segment length in mm.
    pub curve_segment_mm: f64,
    pub tools: Vec<ToolConfig>,
    /// Automated build platform installed (changes the meaning of the
    /// fan-toggle codes).
    pub has_abp: bool,
}

impl MachineConfig {
    pub fn mm_to_steps(&self, point: Point5) -> Point5 {
        point.mul(self.steps_per_mm)
    }

    pub fn steps_to_mm(&self, point: Point5) -> Point5 {
        point.div(self.steps_per_mm)
    }

    pub fn tool(&self, index: usize) -> Option<&ToolConfig> {
        self.tools.get(index)
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            steps_per_mm: Point5::new(11.767, 11.767, 320.0, 50.235, 50.235),
            max_feedrates: Point5::new(5000.0, 5000.0, 150.0, 1600.0, 1600.0),
            homing_feedrates: Point5::new(2500.0, 2500.0, 150.0, 0.0, 0.0),
            homing_timeouts: Point5::new(20.0, 20.0, 60.0, 0.0, 0.0),
            curve_segment_mm: 1.0,
            tools: vec![ToolConfig::default()],
            has_abp: false,
        }
    }
}
