// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according
// to those terms.

use std::collections::VecDeque;

use s3g::command::{Command, HomingDirection};
use s3g::error::GcodeError;
use s3g::interp::Interpreter;
use s3g::machine::{MachineConfig, Point5, ToolConfig};

fn interp() -> Interpreter {
    Interpreter::new(MachineConfig::default())
}

fn run(interp: &mut Interpreter, line: &str) -> Vec<Command> {
    let mut queue = VecDeque::new();
    interp.parse(line, &mut queue).unwrap_or_else(|e| panic!("line {:?} failed: {}", line, e));
    queue.into_iter().collect()
}

fn fail(interp: &mut Interpreter, line: &str) -> GcodeError {
    let mut queue = VecDeque::new();
    let err = interp.parse(line, &mut queue).expect_err("line should fail");
    assert!(queue.is_empty(), "failed line must not emit commands");
    err
}

fn points(commands: &[Command]) -> Vec<Point5> {
    commands.iter().filter_map(|cmd| match cmd {
        Command::QueuePoint(p) => Some(*p),
        _ => None,
    }).collect()
}

#[test]
fn absolute_move_with_explicit_feedrate() {
    let mut it = interp();
    run(&mut it, "G90");
    let cmds = run(&mut it, "G1 X10 Y10 F500");
    assert_eq!(cmds, vec![
        Command::SetFeedrate(500.0),
        Command::QueuePoint(Point5::new(10.0, 10.0, 0.0, 0.0, 0.0)),
    ]);
    assert_eq!(it.state().feedrate, 500.0);
    assert_eq!(it.state().position, Point5::new(10.0, 10.0, 0.0, 0.0, 0.0));
}

#[test]
fn relative_move_adds_to_position() {
    let mut it = interp();
    run(&mut it, "G90");
    run(&mut it, "G1 X1 Y1 F500");
    run(&mut it, "G91");
    let cmds = run(&mut it, "G1 X5");
    assert_eq!(points(&cmds), vec![Point5::new(6.0, 1.0, 0.0, 0.0, 0.0)]);
}

#[test]
fn session_feedrate_carries_across_lines() {
    let mut it = interp();
    run(&mut it, "G90");
    run(&mut it, "G1 X1 F1200");
    let cmds = run(&mut it, "G1 X2");
    assert_eq!(cmds[0], Command::SetFeedrate(1200.0));
}

#[test]
fn motion_without_feedrate_fails_without_state_change() {
    let mut it = interp();
    run(&mut it, "G90");
    match fail(&mut it, "G1 X5") {
        GcodeError::MissingParameter { family: 'G', number: 1, letter: 'F' } => (),
        err => panic!("unexpected error: {}", err),
    }
    assert_eq!(it.state().position, Point5::default());
    assert_eq!(it.state().feedrate, 0.0);
}

#[test]
fn inch_mode_converts_lengths_but_not_feedrate() {
    let mut it = interp();
    run(&mut it, "G90");
    run(&mut it, "G20");
    let cmds = run(&mut it, "G1 X1 F500");
    assert_eq!(cmds[0], Command::SetFeedrate(500.0));
    assert_eq!(points(&cmds), vec![Point5::new(25.4, 0.0, 0.0, 0.0, 0.0)]);
    // and back
    run(&mut it, "G21");
    let cmds = run(&mut it, "G1 X1");
    assert_eq!(points(&cmds), vec![Point5::new(1.0, 0.0, 0.0, 0.0, 0.0)]);
}

#[test]
fn rapid_feedrate_is_derived_from_axis_maxima() {
    let mut it = interp();
    run(&mut it, "G90");
    // dominant constraint is the slow Z axis (150 mm/min)
    let cmds = run(&mut it, "G0 X10 Z1");
    let length = (10.0f64 * 10.0 + 1.0).sqrt();
    let expected = (5000.0 * length / 10.0).min(150.0 * length / 1.0);
    match cmds[0] {
        Command::SetFeedrate(f) => assert!((f - expected).abs() < 1e-9),
        ref cmd => panic!("expected set-feedrate, got {:?}", cmd),
    }
    // rapids do not overwrite the session feed rate
    assert_eq!(it.state().feedrate, 0.0);
}

#[test]
fn unknown_codes_are_rejected_and_inert() {
    let mut it = interp();
    run(&mut it, "G90");
    run(&mut it, "G1 X3 Y4 F600");
    let before = it.state().clone();

    match fail(&mut it, "M999") {
        GcodeError::UnsupportedCode { family: 'M', number: 999 } => (),
        err => panic!("unexpected error: {}", err),
    }
    match fail(&mut it, "G33") {
        GcodeError::UnsupportedCode { family: 'G', number: 33 } => (),
        err => panic!("unexpected error: {}", err),
    }

    let after = it.state();
    assert_eq!(after.position, before.position);
    assert_eq!(after.feedrate, before.feedrate);
    assert_eq!(after.absolute, before.absolute);
    assert_eq!(after.tool, before.tool);
    assert_eq!(after.active_offset, before.active_offset);
}

#[test]
fn bare_axis_words_are_a_no_op() {
    let mut it = interp();
    let cmds = run(&mut it, "X10 Y10");
    assert!(cmds.is_empty());
    assert_eq!(it.state().position, Point5::default());
}

#[test]
fn coincident_arc_endpoints_trace_a_full_circle() {
    let mut it = interp();
    run(&mut it, "G90");
    run(&mut it, "G92 X10 Y0");
    let cmds = run(&mut it, "G2 X10 Y0 I-10 J0 F300");
    let pts = points(&cmds);
    // a 10 mm radius circle is 62.8 mm long; at 1 mm per segment that
    // is well over the angular minimum
    assert!(pts.len() >= 60, "only {} segments", pts.len());
    for p in &pts {
        let radius = (p.x * p.x + p.y * p.y).sqrt();
        assert!((radius - 10.0).abs() < 1e-6, "point {:?} off the circle", p);
    }
    let last = pts.last().unwrap();
    assert!((last.x - 10.0).abs() < 1e-6 && last.y.abs() < 1e-6,
            "circle does not close: {:?}", last);
    assert_eq!(it.state().position, Point5::new(10.0, 0.0, 0.0, 0.0, 0.0));
}

#[test]
fn counterclockwise_quarter_arc_ends_at_target() {
    let mut it = interp();
    run(&mut it, "G90");
    run(&mut it, "G92 X10 Y0");
    let cmds = run(&mut it, "G3 X0 Y10 I-10 J0 F300");
    let pts = points(&cmds);
    let last = pts.last().unwrap();
    assert!(last.x.abs() < 1e-6 && (last.y - 10.0).abs() < 1e-6);
    // the sweep must pass through the 45 degree point going CCW
    let mid = pts[pts.len() / 2];
    assert!(mid.x > 0.0 && mid.y > 0.0);
}

#[test]
fn helical_arc_interpolates_z() {
    let mut it = interp();
    run(&mut it, "G90");
    run(&mut it, "G92 X10 Y0 Z0");
    let cmds = run(&mut it, "G2 X10 Y0 Z2 I-10 J0 F300");
    let pts = points(&cmds);
    assert!((pts.last().unwrap().z - 2.0).abs() < 1e-9);
    // strictly increasing Z across the sweep
    for pair in pts.windows(2) {
        assert!(pair[1].z > pair[0].z);
    }
}

#[test]
fn radius_form_arcs_are_unsupported() {
    let mut it = interp();
    run(&mut it, "G90");
    match fail(&mut it, "G2 X5 Y5 R5 F300") {
        GcodeError::UnsupportedCode { family: 'G', number: 2 } => (),
        err => panic!("unexpected error: {}", err),
    }
}

#[test]
fn center_form_wins_over_a_stray_r_word() {
    let mut it = interp();
    run(&mut it, "G90");
    let cmds = run(&mut it, "G3 X0 Y10 I-10 R5 F300");
    assert!(!points(&cmds).is_empty());
}

#[test]
fn homing_uses_min_of_selected_axis_rates() {
    let mut it = interp();
    let cmds = run(&mut it, "G28 X Y");
    assert_eq!(cmds, vec![Command::HomeAxes {
        axes: [s3g::machine::Axis::X, s3g::machine::Axis::Y].into_iter().collect(),
        direction: HomingDirection::Positive,
        feedrate: 2500.0,
    }]);

    let cmds = run(&mut it, "G161 Z F100");
    match &cmds[0] {
        Command::HomeAxes { direction: HomingDirection::Negative, feedrate, .. } => {
            assert_eq!(*feedrate, 100.0);
        }
        cmd => panic!("expected home-axes, got {:?}", cmd),
    }
}

#[test]
fn offset_slots_apply_in_absolute_mode() {
    let mut it = interp();
    run(&mut it, "G90");
    run(&mut it, "G10 P1 X5 Y-2");
    run(&mut it, "G54");
    let cmds = run(&mut it, "G1 X0 Y0 F500");
    assert_eq!(points(&cmds), vec![Point5::new(5.0, -2.0, 0.0, 0.0, 0.0)]);
    // back to the master system
    run(&mut it, "G53");
    let cmds = run(&mut it, "G1 X0 Y0");
    assert_eq!(points(&cmds), vec![Point5::default()]);
}

#[test]
fn set_position_overwrites_named_axes() {
    let mut it = interp();
    let cmds = run(&mut it, "G92 X7 Y8");
    assert_eq!(cmds, vec![Command::SetCurrentPosition(Point5::new(7.0, 8.0, 0.0, 0.0, 0.0))]);
    assert_eq!(it.state().position, Point5::new(7.0, 8.0, 0.0, 0.0, 0.0));
}

#[test]
fn e_words_drive_the_active_tool_motor_axis() {
    let mut config = MachineConfig::default();
    config.tools = vec![
        ToolConfig { motor_axis: s3g::machine::Axis::A, ..ToolConfig::default() },
        ToolConfig { motor_axis: s3g::machine::Axis::B, ..ToolConfig::default() },
    ];
    let mut it = Interpreter::new(config);
    run(&mut it, "G90");
    let cmds = run(&mut it, "G1 X1 E3 F500");
    assert_eq!(points(&cmds), vec![Point5::new(1.0, 0.0, 0.0, 3.0, 0.0)]);

    run(&mut it, "T1");
    let cmds = run(&mut it, "G1 X2 E5");
    assert_eq!(points(&cmds)[0].b, 5.0);
}

#[test]
fn e_outranks_a_on_the_same_line_and_b_outranks_e() {
    let mut config = MachineConfig::default();
    config.tools = vec![
        ToolConfig { motor_axis: s3g::machine::Axis::A, ..ToolConfig::default() },
        ToolConfig { motor_axis: s3g::machine::Axis::B, ..ToolConfig::default() },
    ];
    let mut it = Interpreter::new(config);
    run(&mut it, "G90");

    // motor on A: E applies after A and takes the axis
    let cmds = run(&mut it, "G1 A2 E5 F500");
    assert_eq!(points(&cmds)[0].a, 5.0);

    // motor on B: the explicit B word applies last and wins
    run(&mut it, "T1");
    let cmds = run(&mut it, "G1 E5 B2");
    assert_eq!(points(&cmds)[0].b, 2.0);
}

#[test]
fn tool_selection_moves_the_offset_slot() {
    let mut config = MachineConfig::default();
    config.tools = vec![ToolConfig::default(), ToolConfig::default()];
    let mut it = Interpreter::new(config);

    let cmds = run(&mut it, "T1");
    assert_eq!(cmds, vec![Command::SelectTool(1)]);
    assert_eq!(it.state().tool, 1);
    assert_eq!(it.state().active_offset, 2);

    match fail(&mut it, "T5") {
        GcodeError::InvalidTool(5) => (),
        err => panic!("unexpected error: {}", err),
    }
}

#[test]
fn tool_change_requires_t_and_defaults_the_timeout() {
    let mut it = interp();
    match fail(&mut it, "M6") {
        GcodeError::MissingParameter { family: 'M', number: 6, letter: 'T' } => (),
        err => panic!("unexpected error: {}", err),
    }
    let cmds = run(&mut it, "M6 T0 P120");
    assert_eq!(cmds, vec![Command::WaitForTool { tool: 0, timeout_s: 120 }]);
    let cmds = run(&mut it, "M6 T0");
    assert_eq!(cmds, vec![Command::WaitForTool { tool: 0, timeout_s: 65535 }]);
}

#[test]
fn fan_codes_follow_the_abp_flag() {
    let mut it = interp();
    assert_eq!(run(&mut it, "M106"), vec![Command::ToggleFan(true)]);
    assert_eq!(run(&mut it, "M107"), vec![Command::ToggleFan(false)]);

    let mut config = MachineConfig::default();
    config.has_abp = true;
    let mut it = Interpreter::new(config);
    assert_eq!(run(&mut it, "M106"), vec![Command::ToggleAbp(true)]);
}

#[test]
fn temperature_and_motor_codes() {
    let mut it = interp();
    assert_eq!(run(&mut it, "M104 S220"), vec![Command::SetTemperature(220.0)]);
    assert_eq!(run(&mut it, "M109 S110"), vec![Command::SetPlatformTemperature(110.0)]);
    assert_eq!(run(&mut it, "M108 R1.98"), vec![Command::SetMotorRpm(1.98)]);
    assert_eq!(run(&mut it, "M108 S255"), vec![Command::SetMotorPwm(255)]);
    assert_eq!(run(&mut it, "M101"), vec![
        Command::SetMotorDirection(s3g::command::Rotation::Clockwise),
        Command::EnableMotor,
    ]);
    assert_eq!(run(&mut it, "M103"), vec![Command::DisableMotor]);
}

#[test]
fn program_stops_drain_the_queue_first() {
    let mut it = interp();
    let cmds = run(&mut it, "M0 (all done)");
    assert_eq!(cmds, vec![
        Command::WaitUntilEmpty,
        Command::Halt { optional: false, message: "all done".into() },
    ]);
    let cmds = run(&mut it, "M2");
    assert_eq!(cmds, vec![Command::WaitUntilEmpty, Command::ProgramEnd]);
}

#[test]
fn slicer_side_codes_are_silently_ignored() {
    let mut it = interp();
    assert!(run(&mut it, "M141 S30").is_empty());
    assert!(run(&mut it, "M142 S5").is_empty());
}

#[test]
fn data_capture_codes() {
    let mut it = interp();
    let cmds = run(&mut it, "M310 (JOB.S3G)");
    assert_eq!(cmds, vec![
        Command::WaitUntilEmpty,
        Command::StartDataCapture("JOB.S3G".into()),
    ]);
    assert_eq!(run(&mut it, "M311"),
               vec![Command::WaitUntilEmpty, Command::StopDataCapture]);
}

#[test]
fn dwell_is_milliseconds() {
    let mut it = interp();
    assert_eq!(run(&mut it, "G4 P2000"), vec![Command::Delay { millis: 2000 }]);
}
