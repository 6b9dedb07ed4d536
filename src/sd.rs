// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according
// to those terms.

//! SD card capture and playback.
//!
//! The controller can mirror the buffered command stream into a file on
//! its SD card and replay it later without a host attached.  These
//! operations have their own status byte on top of the packet response
//! code.

use log::info;

use crate::driver::{Driver, DEFAULT_RETRIES};
use crate::error::ProtocolError;
use crate::protocol::{HostCode, PacketBuilder};

/// SD subsystem status, the first payload byte of every SD reply.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SdStatus {
    Success,
    NoCard,
    InitFailed,
    PartitionFailed,
    FilesystemFailed,
    RootDirFailed,
    CardLocked,
    NoSuchFile,
    GenericFailure,
}

impl SdStatus {
    fn from_wire(byte: u8) -> Self {
        match byte {
            0 => SdStatus::Success,
            1 => SdStatus::NoCard,
            2 => SdStatus::InitFailed,
            3 => SdStatus::PartitionFailed,
            4 => SdStatus::FilesystemFailed,
            5 => SdStatus::RootDirFailed,
            6 => SdStatus::CardLocked,
            7 => SdStatus::NoSuchFile,
            _ => SdStatus::GenericFailure,
        }
    }
}

/// Longest filename (8.3 plus slack) the firmware accepts.
const MAX_FILENAME: usize = 12;

fn add_filename(pb: &mut PacketBuilder, filename: &str) {
    let name: Vec<u8> = filename.bytes().take(MAX_FILENAME).collect();
    pb.add_bytes(&name);
    pb.add8(0);
}

impl Driver {
    /// Start mirroring buffered commands into an SD file.
    pub fn begin_capture(&self, filename: &str) -> Result<SdStatus, ProtocolError> {
        let mut pb = PacketBuilder::new(HostCode::CaptureToFile.code());
        add_filename(&mut pb, filename);
        let mut resp = self.run_command(&pb.build(), DEFAULT_RETRIES)?;
        if resp.remaining() < 1 {
            return Err(ProtocolError::Exchange("capture reply carried no status".into()));
        }
        let status = SdStatus::from_wire(resp.read8());
        info!("capture to {:?}: {:?}", filename, status);
        Ok(status)
    }

    /// Stop capturing; returns the number of bytes written to the card.
    pub fn end_capture(&self) -> Result<u32, ProtocolError> {
        let pb = PacketBuilder::new(HostCode::EndCapture.code());
        let mut resp = self.run_command(&pb.build(), DEFAULT_RETRIES)?;
        if resp.remaining() < 4 {
            return Err(ProtocolError::Exchange("truncated end-capture reply".into()));
        }
        Ok(resp.read32())
    }

    /// Replay a previously captured file.
    pub fn playback_capture(&self, filename: &str) -> Result<SdStatus, ProtocolError> {
        let mut pb = PacketBuilder::new(HostCode::PlaybackCapture.code());
        add_filename(&mut pb, filename);
        let mut resp = self.run_command(&pb.build(), DEFAULT_RETRIES)?;
        if resp.remaining() < 1 {
            return Err(ProtocolError::Exchange("playback reply carried no status".into()));
        }
        Ok(SdStatus::from_wire(resp.read8()))
    }

    /// List the files on the card.  The firmware iterates one filename
    /// per query; an empty name ends the listing.
    pub fn file_list(&self) -> Result<Vec<String>, ProtocolError> {
        let mut files = vec![];
        let mut restart = 1u8;
        loop {
            let mut pb = PacketBuilder::new(HostCode::NextFilename.code());
            pb.add8(restart);
            restart = 0;
            let mut resp = self.run_command(&pb.build(), DEFAULT_RETRIES)?;
            if resp.remaining() < 1 {
                return Err(ProtocolError::Exchange("filename reply carried no status".into()));
            }
            let status = SdStatus::from_wire(resp.read8());
            if status != SdStatus::Success {
                return Ok(files);
            }
            let mut name = String::new();
            while resp.remaining() > 0 {
                match resp.read8() {
                    0 => break,
                    b => name.push(b as char),
                }
            }
            if name.is_empty() {
                return Ok(files);
            }
            files.push(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockLink;
    use crate::machine::MachineConfig;

    #[test]
    fn file_list_iterates_until_empty_name() {
        let (link, state) = MockLink::new();
        let driver = Driver::new(MachineConfig::default(), Box::new(link));
        {
            let mut s = state.lock().unwrap();
            s.script_response(0x81, b"\x00JOB1.S3G\x00");
            s.script_response(0x81, b"\x00JOB2.S3G\x00");
            s.script_response(0x81, b"\x00\x00");
        }
        let files = driver.file_list().unwrap();
        assert_eq!(files, vec!["JOB1.S3G".to_string(), "JOB2.S3G".to_string()]);

        let s = state.lock().unwrap();
        // restart flag set only on the first query
        assert_eq!(s.written[0][2], 1);
        assert_eq!(s.written[1][2], 0);
        assert_eq!(s.written[2][2], 0);
    }

    #[test]
    fn truncated_end_capture_reply_is_an_error() {
        let (link, state) = MockLink::new();
        let driver = Driver::new(MachineConfig::default(), Box::new(link));
        // OK frame with only half of the byte-count word
        state.lock().unwrap().script_response(0x81, &[0x12, 0x34]);
        assert!(matches!(driver.end_capture(), Err(ProtocolError::Exchange(_))));
    }

    #[test]
    fn capture_reports_card_status() {
        let (link, state) = MockLink::new();
        let driver = Driver::new(MachineConfig::default(), Box::new(link));
        state.lock().unwrap().script_response(0x81, &[1]);
        let status = driver.begin_capture("JOB.S3G").unwrap();
        assert_eq!(status, SdStatus::NoCard);

        let s = state.lock().unwrap();
        let frame = &s.written[0];
        assert_eq!(frame[1], HostCode::CaptureToFile.code());
        assert_eq!(&frame[2..9], b"JOB.S3G");
        assert_eq!(frame[9], 0);
    }
}
