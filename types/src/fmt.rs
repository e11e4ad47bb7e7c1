use core::fmt::{Display, Formatter, Result};

/// Formats a length in bytes with the largest binary unit that keeps at least two digits in
/// front of the decimal point, e.g. `4823 B`, `12 KiB` or `896 MiB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSize(pub u64);

impl From<u64> for ByteSize {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<u32> for ByteSize {
    fn from(value: u32) -> Self {
        Self(value as u64)
    }
}

impl Display for ByteSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self.0 {
            b if b < 10 << 10 => write!(f, "{b} B"),
            kb if kb < 10 << 20 => write!(f, "{} KiB", kb >> 10),
            mb if mb < 10 << 30 => write!(f, "{} MiB", mb >> 20),
            gb => write!(f, "{} GiB", gb >> 30),
        }
    }
}
