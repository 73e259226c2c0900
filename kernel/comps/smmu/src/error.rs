// SPDX-License-Identifier: MPL-2.0

use crate::{cmdq::CmdqError, page_table::PageTableError};

/// The error type which is returned from the APIs of this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    InvalidArgs,
    NoMemory,
    NotEnoughResources,
    /// The address window of a domain has no free range of the requested size.
    NoSpace,
    /// A requested IO virtual address range collides with a live range.
    Overlap,
    /// A range was released although it is not live.
    DoubleFree,
    NotMapped,
    AlreadyMapped,
    /// The address lies outside the window of the domain.
    OutOfRange,
    /// The stream ID is not covered by the stream table.
    UnknownDevice,
    Busy,
    /// The operation was cancelled by a pending signal.
    Interrupted,
    /// The hardware did not make progress in time.
    Timeout,
    /// The unit has entered service failure mode.
    DeviceDisabled,
    Unsupported,
    AttestationFailed,
}

impl From<PageTableError> for Error {
    fn from(err: PageTableError) -> Error {
        match err {
            PageTableError::OutOfRange(_) => Error::OutOfRange,
            PageTableError::Unaligned(_) => Error::InvalidArgs,
            PageTableError::AlreadyMapped(_) => Error::AlreadyMapped,
            PageTableError::WouldSplitBlock(_) => Error::InvalidArgs,
            PageTableError::Corrupted(_) => Error::InvalidArgs,
        }
    }
}

impl From<CmdqError> for Error {
    fn from(err: CmdqError) -> Error {
        match err {
            CmdqError::Timeout => Error::Timeout,
            CmdqError::Disabled => Error::DeviceDisabled,
            CmdqError::BatchTooLarge => Error::InvalidArgs,
        }
    }
}
