//! Decoding of the records emitted by the exec probe.
//!
//! The probe submits a fixed-layout struct per `execve`:
//!
//! | offset | size | field    |
//! |--------|------|----------|
//! | 0      | 4    | pid (LE) |
//! | 4      | 80   | comm     |
//! | 84     | 1024 | filename |
//!
//! Strings are NUL-terminated inside their fixed-size arrays. Fields are read one by
//! one from the byte buffer, never by casting the buffer to a struct.

use bytes::Buf;
use thiserror::Error;

pub const COMM_LEN: usize = 80;
pub const FILENAME_LEN: usize = 1024;
pub const RECORD_SIZE: usize = 4 + COMM_LEN + FILENAME_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    pub pid: u32,
    pub command: String,
    pub filename: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("record too short: {len} bytes, expected {RECORD_SIZE}")]
    TooShort { len: usize },
    #[error("record has an empty filename (pid {pid})")]
    EmptyFilename { pid: u32 },
}

impl ExecRecord {
    /// Decode a raw record. Trailing bytes after [`RECORD_SIZE`] (ring buffer
    /// padding) are ignored.
    pub fn decode(mut buf: &[u8]) -> Result<Self, RecordError> {
        if buf.len() < RECORD_SIZE {
            return Err(RecordError::TooShort { len: buf.len() });
        }

        let pid = buf.get_u32_le();
        let mut comm = [0u8; COMM_LEN];
        buf.copy_to_slice(&mut comm);
        let mut filename = [0u8; FILENAME_LEN];
        buf.copy_to_slice(&mut filename);

        let filename = nul_terminated(&filename);
        if filename.is_empty() {
            return Err(RecordError::EmptyFilename { pid });
        }

        let mut command = nul_terminated(&comm);
        if command.is_empty() {
            command = basename(&filename).to_string();
        }

        Ok(Self {
            pid,
            command,
            filename,
        })
    }
}

fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pid: u32, comm: &str, filename: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_SIZE);
        buf.extend_from_slice(&pid.to_le_bytes());
        let mut comm_field = [0u8; COMM_LEN];
        comm_field[..comm.len()].copy_from_slice(comm.as_bytes());
        buf.extend_from_slice(&comm_field);
        let mut filename_field = [0u8; FILENAME_LEN];
        filename_field[..filename.len()].copy_from_slice(filename.as_bytes());
        buf.extend_from_slice(&filename_field);
        buf
    }

    #[test]
    fn decodes_little_endian_fields() {
        let record = ExecRecord::decode(&raw(0x0102_0304, "nginx", "/usr/sbin/nginx")).unwrap();
        assert_eq!(
            record,
            ExecRecord {
                pid: 0x0102_0304,
                command: "nginx".to_string(),
                filename: "/usr/sbin/nginx".to_string(),
            }
        );
    }

    #[test]
    fn pid_bytes_are_little_endian() {
        let mut buf = raw(0, "sh", "/bin/sh");
        buf[..4].copy_from_slice(&[0x39, 0x05, 0x00, 0x00]);
        assert_eq!(ExecRecord::decode(&buf).unwrap().pid, 1337);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let buf = raw(1, "sh", "/bin/sh");
        assert_eq!(
            ExecRecord::decode(&buf[..RECORD_SIZE - 1]),
            Err(RecordError::TooShort {
                len: RECORD_SIZE - 1
            })
        );
    }

    #[test]
    fn padding_is_ignored() {
        let mut buf = raw(7, "cat", "/bin/cat");
        buf.extend_from_slice(&[0xff; 4]);
        assert_eq!(ExecRecord::decode(&buf).unwrap().filename, "/bin/cat");
    }

    #[test]
    fn command_falls_back_to_filename() {
        let record = ExecRecord::decode(&raw(7, "", "/tmp/malware")).unwrap();
        assert_eq!(record.command, "malware");
    }

    #[test]
    fn empty_filename_is_rejected() {
        assert_eq!(
            ExecRecord::decode(&raw(9, "sh", "")),
            Err(RecordError::EmptyFilename { pid: 9 })
        );
    }

    #[test]
    fn full_length_strings_without_terminator() {
        let filename = "a".repeat(FILENAME_LEN);
        let record = ExecRecord::decode(&raw(1, "x", &filename)).unwrap();
        assert_eq!(record.filename.len(), FILENAME_LEN);
    }
}
