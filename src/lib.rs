// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Host-side pipeline for Gen3 motion controllers: a stateful G-code
//! interpreter and a binary packet protocol driver.
//!
//! G-code lines go through `parse::tokenize` and `interp::Interpreter`,
//! which turns them into the machine-agnostic `command::Command`
//! vocabulary.  `driver::Driver` executes that vocabulary over a serial
//! link using the length-prefixed, checksummed packet protocol in
//! `protocol`, with EEPROM access in `eeprom` and SD capture in `sd`.
//! `job::run_job` wires interpreter and driver together with a bounded
//! queue for whole files.
//!
//! ## Basic usage
//!
//! The following code (the same as the "s3g-dump" demo binary) takes a
//! file as an argument, interprets it against a default machine and
//! prints the resulting command stream instead of sending it anywhere:
//!
//! ```rust,no_run
//! use std::collections::VecDeque;
//! use std::{env, fs};
//! use s3g::interp::Interpreter;
//! use s3g::machine::MachineConfig;
//!
//! fn main() {
//!     let filename = env::args().nth(1).unwrap();
//!     let input = fs::read_to_string(&filename).unwrap();
//!
//!     let mut interp = Interpreter::new(MachineConfig::default());
//!     let mut queue = VecDeque::new();
//!     for (n, line) in input.lines().enumerate() {
//!         match interp.parse(line, &mut queue) {
//!             Err(e) => eprintln!("line {}: {}", n + 1, e),
//!             Ok(()) => queue.drain(..).for_each(|cmd| println!("{:?}", cmd)),
//!         }
//!     }
//! }
//! ```
//!
//! To drive a real machine, open a `driver::SerialLink`, wrap it in a
//! `Driver`, `connect`, and hand `job::run_job` the same interpreter.

pub mod command;
pub mod driver;
pub mod eeprom;
pub mod error;
pub mod interp;
pub mod job;
pub mod machine;
pub mod parse;
pub mod protocol;
pub mod sd;
