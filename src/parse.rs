// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Line tokenizer: splits one instruction line into letter/value words
//! and an optional comment.  Purely lexical, no session state.

use std::collections::HashMap;
use itertools::Itertools;
use pest::Parser;
use pest_derive::Parser;

use crate::error::GcodeError;

#[derive(Parser)]
#[grammar = "gcode.pest"]
struct LineParser;

/// One tokenized line.  Letters are uppercased; if a letter repeats on a
/// line, the first occurrence wins.  A word without a value carries 0.
#[derive(Debug, Clone, Default)]
pub struct Instruction {
    codes: HashMap<char, f64>,
    comment: String,
}

impl Instruction {
    pub fn has(&self, letter: char) -> bool {
        self.codes.contains_key(&letter)
    }

    pub fn value(&self, letter: char) -> Option<f64> {
        self.codes.get(&letter).copied()
    }

    pub fn value_or_zero(&self, letter: char) -> f64 {
        self.value(letter).unwrap_or(0.0)
    }

    /// True if the line names any of the given letters.
    pub fn has_any(&self, letters: &[char]) -> bool {
        letters.iter().any(|&l| self.has(l))
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Tokenize a single line.  Malformed numbers, unclosed comments and
/// stray characters are reported as `GcodeError::Parse`.
pub fn tokenize(line: &str) -> Result<Instruction, GcodeError> {
    let parsed = LineParser::parse(Rule::line, line)
        .map_err(|e| GcodeError::Parse(e.to_string()))?;
    let (line_pair,) = parsed.collect_tuple().expect("single line rule");

    let mut instr = Instruction::default();
    for pair in line_pair.into_inner() {
        match pair.as_rule() {
            Rule::word => {
                let mut inner = pair.into_inner();
                let letter = inner.next().expect("letter").as_str()
                    .chars().next().expect("nonempty").to_ascii_uppercase();
                let value = match inner.next() {
                    Some(num) => num.as_str().parse::<f64>()
                        .map_err(|_| GcodeError::Parse(
                            format!("bad numeric value {:?}", num.as_str())))?,
                    None => 0.0,
                };
                instr.codes.entry(letter).or_insert(value);
            }
            Rule::comment => {
                let text = pair.as_str();
                let text = text.strip_prefix('(')
                    .and_then(|t| t.strip_suffix(')'))
                    .or_else(|| text.strip_prefix(';'))
                    .unwrap_or(text)
                    .trim();
                if instr.comment.is_empty() {
                    instr.comment = text.into();
                }
            }
            Rule::EOI => (),
            _ => unreachable!(),
        }
    }
    Ok(instr)
}
