use std::{fmt::Display, num::NonZeroU32};

/// 1-based ordinal address of a message inside one session.
///
/// Positions carry no meaning across sessions once a deletion has been
/// committed, so they are never stored beyond the session that produced them.
#[derive(Debug, PartialEq, Clone, Copy, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SequencePosition(NonZeroU32);

impl SequencePosition {
    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Steps by a signed offset, staying inside `1..=count`.
    pub fn offset(self, by: i64, count: u32) -> Option<Self> {
        let moved = i64::from(self.get()) + by;
        if moved < 1 || moved > i64::from(count) {
            return None;
        }
        u32::try_from(moved).ok().and_then(|n| n.try_into().ok())
    }
}

impl Display for SequencePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<u32> for SequencePosition {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(Self(
            NonZeroU32::new(value).ok_or("sequence positions start at 1")?,
        ))
    }
}

impl From<SequencePosition> for u32 {
    fn from(value: SequencePosition) -> Self {
        value.0.into()
    }
}
