/*!
    # Errors

    Flat error codes for the PMwCAS/BzTree core. Retryable internal errors
    (`EFrozen`, `ERace`, `EPmwcasFail`, `EPmwcasAlloc`) are caught and retried
    inside `traverse`/`commit` and should never reach a caller in practice;
    they're public anyway so tests can assert on retry behavior.
*/

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Error {
    /// target node/slot is frozen; caller must restart from the root
    EFrozen,
    /// insert found an existing visible record for the key
    EUniqueKey,
    /// no visible record for the key
    ENotFound,
    /// node has no room to reserve the requested record size
    EAllocSize,
    /// caller-provided buffer is too small for the value
    ENoSpace,
    /// lost a race with a concurrent delete/update; reservation was yielded back
    ERace,
    /// an SMO determined no structural change is needed
    ENoNeed,
    /// the descriptor pool is exhausted
    EPmwcasAlloc,
    /// a PMwCAS commit did not reach SUCCESS
    EPmwcasFail,
    /// pool/descriptor-pool creation or initialization failed
    EGcCreate,
}

impl Error {
    /// `true` for errors the core itself retries; these should never be
    /// returned from a public `Tree` method under correct operation.
    pub const fn is_retryable_internal(self) -> bool {
        matches!(
            self,
            Error::EFrozen | Error::ERace | Error::EPmwcasFail | Error::EPmwcasAlloc
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::EFrozen => "node is frozen",
            Self::EUniqueKey => "key already exists",
            Self::ENotFound => "key not found",
            Self::EAllocSize => "node has insufficient free space",
            Self::ENoSpace => "destination buffer too small",
            Self::ERace => "lost race with a concurrent writer",
            Self::ENoNeed => "no structural modification is needed",
            Self::EPmwcasAlloc => "descriptor pool exhausted",
            Self::EPmwcasFail => "PMwCAS commit failed",
            Self::EGcCreate => "failed to initialize pool/descriptor state",
        };
        f.write_str(s)
    }
}

impl std::error::Error for Error {}
