//! Fault kinds delivered by the trap handler.

/// The kind of TLB fault being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// A load missed in the TLB.
    Read,
    /// A store missed in the TLB.
    Write,
    /// A store hit a TLB entry without the dirty bit.
    ReadOnly,
}

impl FaultKind {
    /// Raw trap code for [`FaultKind::Read`].
    pub const READ: u32 = 0;
    /// Raw trap code for [`FaultKind::Write`].
    pub const WRITE: u32 = 1;
    /// Raw trap code for [`FaultKind::ReadOnly`].
    pub const READ_ONLY: u32 = 2;

    /// Returns the raw trap code for this kind.
    pub const fn code(self) -> u32 {
        match self {
            Self::Read => Self::READ,
            Self::Write => Self::WRITE,
            Self::ReadOnly => Self::READ_ONLY,
        }
    }
}

impl TryFrom<u32> for FaultKind {
    type Error = crate::VmError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            Self::READ => Ok(Self::Read),
            Self::WRITE => Ok(Self::Write),
            Self::READ_ONLY => Ok(Self::ReadOnly),
            other => Err(crate::VmError::InvalidFaultKind(other)),
        }
    }
}
