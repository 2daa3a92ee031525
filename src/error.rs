//! Errors reported by the bootloader engine.
//!
//! Exchange failures carry the [`Step`] at which they occurred so callers can
//! judge how much of a flash operation was applied before deciding to retry.

use core::fmt::{self, Debug};

use crate::protocol::{Command, FrameError};

/// Phase of a bootloader exchange
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Phase {
    /// DTR/RTS reset pulse before first contact
    Reset,
    /// Discovery byte and its acknowledge
    Wake,
    /// Command byte pair and its acknowledge
    Command,
    Address,
    /// Byte count of a read request
    Length,
    /// Data packet of a write request
    Data,
    /// Erase count and sector indices
    Sectors,
    /// Bytes returned by the bootloader
    Response,
    /// Acknowledge closing the exchange
    FinalAck,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Reset => "reset",
            Phase::Wake => "wake-up",
            Phase::Command => "command",
            Phase::Address => "address",
            Phase::Length => "length",
            Phase::Data => "data",
            Phase::Sectors => "sector list",
            Phase::Response => "response",
            Phase::FinalAck => "final acknowledge",
        };
        f.write_str(s)
    }
}

/// Position of a chunk within a transfer, 1-based
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct ChunkPos {
    pub index: usize,
    pub count: usize,
}

/// Location of a failure within a high-level operation
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Step {
    /// Command being exchanged, `None` while connecting
    pub command: Option<Command>,
    pub phase: Phase,
    /// Set for chunked reads and writes
    pub chunk: Option<ChunkPos>,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.phase)?;
        if let Some(c) = self.command {
            write!(f, " of {:?}", c)?;
        }
        if let Some(ChunkPos { index, count }) = self.chunk {
            write!(f, " (chunk {} of {})", index, count)?;
        }
        Ok(())
    }
}

/// Failure of a single blocking exchange on the serial link
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum LinkError<E: Debug> {
    #[error("serial error: {0:?}")]
    Serial(E),

    #[error("timed out after receiving {received} of {expected} bytes")]
    Timeout { expected: usize, received: usize },

    #[error("unexpected response byte 0x{0:02x}")]
    Unexpected(u8),
}

impl<E: Debug> LinkError<E> {
    /// Attach the step at which the exchange failed
    pub fn at(self, step: Step) -> Error<E> {
        match self {
            LinkError::Serial(e) => Error::Serial(e, step),
            LinkError::Timeout { .. } => Error::Timeout(step),
            LinkError::Unexpected(v) => Error::InvalidResponse(step, v),
        }
    }
}

/// Requested range cannot be mapped onto erase units
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RangeError {
    #[error("range 0x{address:08x}+0x{length:x} lies outside the memory map")]
    OutOfMap { address: u32, length: u32 },

    #[error("range 0x{address:08x}+0x{length:x} is not covered by the memory map at 0x{at:08x}")]
    Gap { address: u32, length: u32, at: u64 },
}

/// Invalid arguments, detected before anything is sent
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Precondition {
    #[error("address 0x{0:08x} is not 4-byte aligned")]
    Misaligned(u32),

    #[error("zero length request")]
    ZeroLength,

    #[error("range 0x{address:08x}+0x{length:x} overflows the address space")]
    Overflow { address: u32, length: usize },

    #[error("chunk size must be between 1 and {max}", max = crate::protocol::MAX_CHUNK)]
    ChunkSize,

    #[error("memory map sector {0} is empty or overlaps its predecessor")]
    InvalidMap(usize),
}

/// Planner failures, split by whether the map or the arguments are at fault
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    Precondition(#[from] Precondition),
}

#[derive(Debug, thiserror::Error)]
pub enum Error<E: Debug> {
    #[error("serial error at {1}: {0:?}")]
    Serial(E, Step),

    #[error("timed out at {0}")]
    Timeout(Step),

    #[error("nack at {0}")]
    Nack(Step),

    #[error("unexpected response 0x{1:02x} at {0}")]
    InvalidResponse(Step, u8),

    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    Precondition(#[from] Precondition),

    #[error("bootloader does not support {0:?}")]
    Unsupported(Command),

    #[error("verification failed at 0x{address:08x} (expected 0x{expected:02x}, read 0x{actual:02x})")]
    Verify { address: u32, expected: u8, actual: u8 },
}

impl<E: Debug> Error<E> {
    /// Step at which an exchange failed, if the failure came from the link
    pub fn step(&self) -> Option<&Step> {
        match self {
            Error::Serial(_, s) | Error::Timeout(s) | Error::Nack(s) => Some(s),
            Error::InvalidResponse(s, _) => Some(s),
            _ => None,
        }
    }

    /// Timeouts leave the device waiting and may be retried after re-init,
    /// anything else needs caller intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

impl<E: Debug> From<PlanError> for Error<E> {
    fn from(e: PlanError) -> Self {
        match e {
            PlanError::Range(e) => Error::Range(e),
            PlanError::Precondition(e) => Error::Precondition(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_names_phase_command_and_chunk() {
        let step = Step {
            command: Some(Command::WriteMemory),
            phase: Phase::Address,
            chunk: Some(ChunkPos { index: 3, count: 9 }),
        };
        let e: Error<()> = Error::Nack(step);

        assert_eq!(e.to_string(), "nack at address of WriteMemory (chunk 3 of 9)");
        assert_eq!(e.step(), Some(&step));
        assert!(!e.is_retryable());
    }

    #[test]
    fn link_errors_pick_up_step() {
        let step = Step {
            command: None,
            phase: Phase::Wake,
            chunk: None,
        };

        let e = LinkError::<()>::Timeout {
            expected: 1,
            received: 0,
        }
        .at(step);
        assert!(e.is_retryable());
        assert_eq!(e.to_string(), "timed out at wake-up");

        match LinkError::<()>::Unexpected(0x42).at(step) {
            Error::InvalidResponse(s, 0x42) => assert_eq!(s, step),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn plan_errors_keep_their_category() {
        let e: Error<()> = PlanError::from(Precondition::ZeroLength).into();
        assert!(matches!(e, Error::Precondition(Precondition::ZeroLength)));

        let e: Error<()> = PlanError::from(RangeError::OutOfMap {
            address: 0,
            length: 1,
        })
        .into();
        assert!(matches!(e, Error::Range(RangeError::OutOfMap { .. })));
        assert_eq!(e.step(), None);
    }
}
