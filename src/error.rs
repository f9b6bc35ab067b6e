use thiserror::Error;

/// Errors reported by storage operations. Marked non-exhaustive so variants
/// can be added without breaking the API; callers typically only need to
/// branch on `NotFound`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The storage has not been mounted yet, or the last mount failed.
    #[error("storage not initialized")]
    NotInitialized,

    /// Key or namespace not found. Either nothing was ever written under
    /// this name or a corrupt copy was reclaimed during mount.
    #[error("key not found")]
    NotFound,

    /// The operation is not permitted in the current state, e.g. a write
    /// through a read-only handle or to a page that is not active.
    #[error("invalid state")]
    InvalidState,

    /// Malformed argument, e.g. a partition that is not sector aligned or
    /// an empty key.
    #[error("invalid argument")]
    InvalidArg,

    /// Allocation failure. Not produced on hosted targets.
    #[error("out of memory")]
    NoMem,

    /// No page can accept the item, even after garbage collection.
    #[error("not enough space")]
    NotEnoughSpace,

    /// The value exceeds the structural maximum for its type. Strings are
    /// limited to one page of payload, blobs to `max_pages` chunks.
    #[error("value too long")]
    ValueTooLong,

    /// Comparison found the stored bytes differ from the given ones.
    #[error("content differs")]
    ContentDiffers,

    /// A buffer length does not match the stored item, e.g. a read buffer
    /// smaller than the value or a scalar of the wrong width.
    #[error("invalid length")]
    InvalidLength,

    /// The partition cannot hold at least two pages.
    #[error("no free pages")]
    NoFreePages,

    /// The underlying flash driver reported a failure.
    #[error("flash error")]
    Flash,

    /// Used internally to request allocation of a new page. Never surfaced
    /// by a public operation.
    #[error("page full")]
    PageFull,
}
