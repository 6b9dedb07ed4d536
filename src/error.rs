// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according
// to those terms.

use thiserror::Error;

/// A line-local failure from tokenizing or interpreting an instruction.
///
/// These never corrupt interpreter session state; the caller decides
/// whether to skip the offending line or abort the whole job.
#[derive(Debug, Error)]
pub enum GcodeError {
    /// The line did not tokenize (malformed number, unclosed comment, ...).
    #[error("parse error: {0}")]
    Parse(String),

    /// The code family/number combination is not part of the dialect.
    #[error("unsupported code: {family}{number}")]
    UnsupportedCode { family: char, number: u32 },

    /// A code that mandates a parameter was given without it.
    #[error("{family}{number} requires a {letter} parameter")]
    MissingParameter { family: char, number: u32, letter: char },

    /// A tool index outside the configured tool count.
    #[error("tool index {0} is out of range")]
    InvalidTool(usize),
}

/// A transport or link-session failure from the protocol driver.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// An inbound frame failed checksum verification.  Retried internally;
    /// only surfaces from the codec itself.
    #[error("checksum mismatch on inbound frame")]
    ChecksumFault,

    /// The retry budget was exhausted without a valid response.
    #[error("packet timed out after exhausting retries")]
    Timeout,

    /// The firmware accepted the packet but its command queue is full.
    /// This is a back-off signal for the caller, not a transport fault,
    /// and never consumes transport retries.
    #[error("firmware command buffer is full, retry later")]
    BufferOverflow,

    /// The machine cancelled the build, or the host cancelled the
    /// in-flight exchange.  Fatal to the job.
    #[error("build cancelled")]
    Cancelled,

    /// Connecting failed even after the reset-and-retry escalation.
    #[error("no handshake from firmware: {0}")]
    HandshakeFailure(String),

    /// A malformed exchange (undersized packet, short reply, ...).
    #[error("malformed exchange: {0}")]
    Exchange(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
