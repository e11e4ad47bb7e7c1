use crate::physical::RegionClass;

/// Recoverable failures of the memory core. Corruption of heap metadata is not one of them: it
/// halts the kernel through a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("no run of free frames left in the {0} window")]
    OutOfFrames(RegionClass),
    #[error("heap region exhausted")]
    HeapExhausted,
    #[error("all temporary window slots are in use")]
    WindowExhausted,
    #[error("fixed-capacity index is full")]
    IndexFull,
    #[error("zero-sized request")]
    ZeroSize,
    #[error("null pointer")]
    NullPointer,
    #[error("address {0:#010x} is misaligned")]
    Misaligned(u32),
    #[error("address {0:#010x} is out of range")]
    OutOfRange(u32),
    #[error("address {0:#010x} lies in the kernel region")]
    KernelRegion(u32),
    #[error("page {0:#010x} is already mapped")]
    AlreadyMapped(u32),
    #[error("page {0:#010x} is not mapped")]
    NotMapped(u32),
    #[error("frame {0:#010x} is not allocated")]
    UnownedFrame(u32),
    #[error("frame {0:#010x} is reserved")]
    ReservedFrame(u32),
    #[error("address {0:#010x} was already freed")]
    DoubleFree(u32),
    #[error("address space is the kernel's or currently active")]
    SpaceInUse,
    #[error("no address space with directory {0:#010x}")]
    UnknownSpace(u32),
    #[error("frame {0:#010x} lies in the low window")]
    LowFrame(u32),
    #[error("heap block at {0:#010x} failed verification")]
    Corrupted(u32),
    #[error("invalid memory layout: {0}")]
    InvalidLayout(&'static str),
}
