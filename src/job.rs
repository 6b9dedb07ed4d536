// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Job pipeline: one producer interpreting lines, one consumer driving
//! the machine, meeting at a bounded channel.  The channel is the only
//! synchronization point; interpretation runs ahead of the wire without
//! unbounded buffering.

use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;

use crate::command::Command;
use crate::driver::Driver;
use crate::error::{GcodeError, ProtocolError};
use crate::interp::Interpreter;

/// Commands buffered between interpreter and driver.
const QUEUE_DEPTH: usize = 64;

/// Back-off before resending after the firmware reported a full buffer.
const OVERFLOW_BACKOFF: Duration = Duration::from_millis(50);

/// What to do with a line that fails to interpret.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorPolicy {
    /// Log the error and keep going with the next line.
    SkipLine,
    /// Fail the whole job on the first bad line.
    AbortJob,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("line {line}: {source}")]
    Gcode { line: usize, source: GcodeError },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("error reading job input: {0}")]
    Io(#[from] std::io::Error),
}

/// Run a whole job from a line source against the driver.
///
/// The interpreter runs on the calling side of a scoped producer thread
/// and the driver on a consumer thread; buffer-overflow replies from the
/// firmware back off and resend the same command here, which is separate
/// from the transport's checksum/timeout retries.
pub fn run_job<R: BufRead + Send>(input: R, interpreter: &mut Interpreter, driver: &Driver,
                           policy: ErrorPolicy) -> Result<(), JobError> {
    let (tx, rx) = mpsc::sync_channel::<Command>(QUEUE_DEPTH);

    thread::scope(|scope| {
        let producer = scope.spawn(move || -> Result<(), JobError> {
            let mut queue = VecDeque::new();
            for (index, line) in input.lines().enumerate() {
                let line = line?;
                if let Err(err) = interpreter.parse(&line, &mut queue) {
                    match policy {
                        ErrorPolicy::SkipLine => {
                            warn!("line {}: {} (skipped)", index + 1, err);
                            queue.clear();
                            continue;
                        }
                        ErrorPolicy::AbortJob => {
                            return Err(JobError::Gcode { line: index + 1, source: err });
                        }
                    }
                }
                for command in queue.drain(..) {
                    if tx.send(command).is_err() {
                        // consumer is gone and carries the real error
                        return Ok(());
                    }
                }
            }
            Ok(())
        });

        let consumer = scope.spawn(|| -> Result<(), JobError> {
            for command in rx {
                loop {
                    match driver.execute(&command) {
                        Ok(()) => break,
                        Err(ProtocolError::BufferOverflow) => thread::sleep(OVERFLOW_BACKOFF),
                        Err(err) => return Err(err.into()),
                    }
                }
            }
            Ok(())
        });

        let produced = producer.join().expect("producer panicked");
        let consumed = consumer.join().expect("consumer panicked");
        consumed.and(produced)?;
        info!("job finished");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockLink;
    use crate::machine::MachineConfig;
    use std::io::Cursor;

    fn scripted_driver(ok_responses: usize) -> Driver {
        let (link, state) = MockLink::new();
        {
            let mut s = state.lock().unwrap();
            for _ in 0..ok_responses {
                s.script_response(0x81, &[]);
            }
        }
        Driver::new(MachineConfig::default(), Box::new(link))
    }

    #[test]
    fn bad_line_aborts_with_line_number() {
        let driver = scripted_driver(0);
        let mut interp = Interpreter::new(MachineConfig::default());
        let input = Cursor::new("G90\nM999\nG91\n");
        match run_job(input, &mut interp, &driver, ErrorPolicy::AbortJob) {
            Err(JobError::Gcode { line: 2, source: GcodeError::UnsupportedCode { family: 'M', number: 999 } }) => (),
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[test]
    fn bad_line_can_be_skipped() {
        // two motion lines, each a set-position packet away from a move:
        // G92 X0 Y0 emits one frame, G1 emits one frame
        let driver = scripted_driver(4);
        let mut interp = Interpreter::new(MachineConfig::default());
        let input = Cursor::new("G90\nG92 X0 Y0\nM999\nG1 X1 F500\n");
        run_job(input, &mut interp, &driver, ErrorPolicy::SkipLine).unwrap();
        assert_eq!(interp.state().position.x, 1.0);
    }
}
