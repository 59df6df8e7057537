//! The information region: who owns the lock and how to reach them.

use crate::error::{FileLockError, Result};
use std::io::{Read, Write};

/// Bytes reserved for the information region.
pub(crate) const INFORMATION_REGION_SIZE: u64 = 2052;

const INFORMATION_VERSION: u8 = 3;
const MAX_STRING_LENGTH: usize = 1000;

/// Details the current exclusive owner publishes for waiting processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    /// Port the owner's contention handler listens on, if any.
    pub port: Option<u16>,
    /// Id of the owner's lock, sent back in unlock requests.
    pub lock_id: u64,
    /// Owner process id.
    pub pid: String,
    /// What the owner is doing.
    pub operation: String,
}

impl Default for LockInfo {
    fn default() -> Self {
        Self {
            port: None,
            lock_id: 0,
            pid: "unknown".to_string(),
            operation: "unknown".to_string(),
        }
    }
}

impl LockInfo {
    pub(crate) fn write(&self, output: &mut dyn Write) -> Result<()> {
        let mut buffer = Vec::with_capacity(64);
        buffer.push(INFORMATION_VERSION);
        buffer.extend_from_slice(&self.port.map_or(-1, i32::from).to_be_bytes());
        buffer.extend_from_slice(&self.lock_id.to_be_bytes());
        write_string(&mut buffer, &self.pid);
        write_string(&mut buffer, &self.operation);
        output.write_all(&buffer)?;
        Ok(())
    }

    pub(crate) fn read(input: &mut dyn Read) -> Result<Self> {
        let mut version = [0u8; 1];
        input.read_exact(&mut version)?;
        if version[0] != INFORMATION_VERSION {
            return Err(FileLockError::UnexpectedProtocol {
                expected: INFORMATION_VERSION,
                found: version[0],
            });
        }
        let mut port = [0u8; 4];
        input.read_exact(&mut port)?;
        let mut lock_id = [0u8; 8];
        input.read_exact(&mut lock_id)?;
        Ok(Self {
            port: u16::try_from(i32::from_be_bytes(port)).ok(),
            lock_id: u64::from_be_bytes(lock_id),
            pid: read_string(input)?,
            operation: read_string(input)?,
        })
    }
}

/// Length-prefixed UTF-8, cut on a character boundary so the region never
/// overflows.
fn write_string(buffer: &mut Vec<u8>, value: &str) {
    let mut end = value.len().min(MAX_STRING_LENGTH);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    let bytes = &value.as_bytes()[..end];
    let length = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
    buffer.extend_from_slice(&length.to_be_bytes());
    buffer.extend_from_slice(bytes);
}

fn read_string(input: &mut dyn Read) -> Result<String> {
    let mut length = [0u8; 2];
    input.read_exact(&mut length)?;
    let mut bytes = vec![0u8; usize::from(u16::from_be_bytes(length))];
    input.read_exact(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_owner_without_port() {
        let info = LockInfo {
            port: None,
            lock_id: 42,
            pid: "1234".to_string(),
            operation: "compile".to_string(),
        };
        let mut bytes = Vec::new();
        info.write(&mut bytes).unwrap();
        assert_eq!(&bytes[1..5], &(-1i32).to_be_bytes());
        assert_eq!(LockInfo::read(&mut Cursor::new(bytes)).unwrap(), info);
    }

    #[test]
    fn test_long_operation_is_truncated_to_fit() {
        let info = LockInfo {
            port: Some(5000),
            lock_id: 1,
            pid: "1".to_string(),
            operation: "é".repeat(MAX_STRING_LENGTH),
        };
        let mut bytes = Vec::new();
        info.write(&mut bytes).unwrap();
        assert!(bytes.len() as u64 <= INFORMATION_REGION_SIZE);

        let read = LockInfo::read(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(read.operation.chars().count(), MAX_STRING_LENGTH / 2);
        assert_eq!(read.port, Some(5000));
    }
}
