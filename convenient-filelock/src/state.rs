//! The state region: what the last owner did with the protected file.

use crate::error::{FileLockError, Result};
use std::io::{Read, Write};

/// Snapshot of a lock file's state region.
///
/// A write is bracketed by [`LockState::mark_dirty`] and
/// [`LockState::mark_clean`], each persisted before moving on, so an owner
/// that dies in between leaves the state dirty for the next one to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockState {
    creation: u64,
    sequence: u64,
    dirty: bool,
    detects_changes: bool,
}

impl LockState {
    /// Whether the last write finished.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the protected file has never been written cleanly.
    #[must_use]
    pub fn is_in_initial_state(&self) -> bool {
        self.sequence == 0
    }

    /// Whether the serializer that produced this state can tell
    /// consecutive states apart.
    #[must_use]
    pub fn can_detect_changes(&self) -> bool {
        self.detects_changes
    }

    /// Whether anybody wrote the protected file after `previous` was taken.
    ///
    /// Always true for states that cannot detect changes.
    #[must_use]
    pub fn has_been_updated_since(&self, previous: &LockState) -> bool {
        !self.detects_changes
            || self.creation != previous.creation
            || self.sequence != previous.sequence
    }

    pub(crate) fn mark_dirty(self) -> Self {
        Self {
            dirty: true,
            ..self
        }
    }

    pub(crate) fn mark_clean(self) -> Self {
        Self {
            sequence: self.sequence.wrapping_add(1).max(1),
            dirty: false,
            ..self
        }
    }
}

/// Binary encoding of the state region.
pub trait LockStateSerializer: Send + Sync {
    /// Bytes reserved for the state region.
    fn size(&self) -> u64;

    /// Protocol version written as the first byte.
    fn version(&self) -> u8;

    /// State of a freshly created lock file: initial and dirty.
    fn create_initial_state(&self) -> LockState;

    /// Write `state` including the version byte.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    fn write(&self, output: &mut dyn Write, state: &LockState) -> Result<()>;

    /// Read a state written by [`LockStateSerializer::write`].
    ///
    /// # Errors
    ///
    /// Returns `FileLockError::UnexpectedProtocol` for another version and
    /// propagates read failures.
    fn read(&self, input: &mut dyn Read) -> Result<LockState>;
}

fn check_version(input: &mut dyn Read, expected: u8) -> Result<()> {
    let mut version = [0u8; 1];
    input.read_exact(&mut version)?;
    if version[0] == expected {
        Ok(())
    } else {
        Err(FileLockError::UnexpectedProtocol {
            expected,
            found: version[0],
        })
    }
}

/// Current format: creation number, sequence number and dirty flag.
///
/// The creation number is random per lock file, so a deleted and recreated
/// lock file is never mistaken for an unchanged one.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLockStateSerializer;

impl LockStateSerializer for DefaultLockStateSerializer {
    fn size(&self) -> u64 {
        18
    }

    fn version(&self) -> u8 {
        3
    }

    fn create_initial_state(&self) -> LockState {
        LockState {
            creation: rand::random(),
            sequence: 0,
            dirty: true,
            detects_changes: true,
        }
    }

    fn write(&self, output: &mut dyn Write, state: &LockState) -> Result<()> {
        let mut buffer = Vec::with_capacity(18);
        buffer.push(self.version());
        buffer.extend_from_slice(&state.creation.to_be_bytes());
        buffer.extend_from_slice(&state.sequence.to_be_bytes());
        buffer.push(u8::from(state.dirty));
        output.write_all(&buffer)?;
        Ok(())
    }

    fn read(&self, input: &mut dyn Read) -> Result<LockState> {
        check_version(input, self.version())?;
        let mut body = [0u8; 17];
        input.read_exact(&mut body)?;
        let mut creation = [0u8; 8];
        let mut sequence = [0u8; 8];
        creation.copy_from_slice(&body[0..8]);
        sequence.copy_from_slice(&body[8..16]);
        Ok(LockState {
            creation: u64::from_be_bytes(creation),
            sequence: u64::from_be_bytes(sequence),
            dirty: body[16] != 0,
            detects_changes: true,
        })
    }
}

/// Format understood by older processes: the dirty flag only.
#[derive(Debug, Default, Clone, Copy)]
pub struct Version1LockStateSerializer;

impl LockStateSerializer for Version1LockStateSerializer {
    fn size(&self) -> u64 {
        2
    }

    fn version(&self) -> u8 {
        1
    }

    fn create_initial_state(&self) -> LockState {
        LockState {
            creation: 0,
            sequence: 0,
            dirty: true,
            detects_changes: false,
        }
    }

    fn write(&self, output: &mut dyn Write, state: &LockState) -> Result<()> {
        output.write_all(&[self.version(), u8::from(state.dirty)])?;
        Ok(())
    }

    fn read(&self, input: &mut dyn Read) -> Result<LockState> {
        check_version(input, self.version())?;
        let mut dirty = [0u8; 1];
        input.read_exact(&mut dirty)?;
        let dirty = dirty[0] != 0;
        Ok(LockState {
            creation: 0,
            // Clean means written at least once; that is all version 1 knows.
            sequence: u64::from(!dirty),
            dirty,
            detects_changes: false,
        })
    }
}
