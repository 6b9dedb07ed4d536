// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Interpret a G-code file against a default machine and print the
//! resulting command stream.

use std::collections::VecDeque;
use std::{env, fs};

use s3g::interp::Interpreter;
use s3g::machine::MachineConfig;

fn main() {
    let filename = env::args().nth(1).expect("usage: s3g-dump <file>");
    let input = fs::read_to_string(&filename).unwrap();

    let mut interp = Interpreter::new(MachineConfig::default());
    let mut queue = VecDeque::new();
    for (n, line) in input.lines().enumerate() {
        match interp.parse(line, &mut queue) {
            Err(e) => eprintln!("line {}: {}", n + 1, e),
            Ok(()) => queue.drain(..).for_each(|cmd| println!("{:?}", cmd)),
        }
    }
}
