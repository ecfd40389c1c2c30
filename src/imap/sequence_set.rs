use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result},
};

use crate::mailbox::SequencePosition;

#[derive(Debug, PartialEq)]
struct SequenceRange {
    start: u32,
    end: u32,
}

impl Display for SequenceRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

/// Message sequence numbers in the compact `3:5,12,14:15` form of IMAP
/// commands.
#[derive(Debug, PartialEq)]
pub struct SequenceSet {
    ranges: Vec<SequenceRange>,
}

impl SequenceSet {
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl FromIterator<SequencePosition> for SequenceSet {
    fn from_iter<T: IntoIterator<Item = SequencePosition>>(iter: T) -> Self {
        let sorted: BTreeSet<u32> = iter.into_iter().map(u32::from).collect();
        let mut ranges: Vec<SequenceRange> = Vec::new();
        for num in sorted {
            match ranges.last_mut() {
                Some(range) if range.end + 1 == num => range.end = num,
                _ => ranges.push(SequenceRange {
                    start: num,
                    end: num,
                }),
            }
        }

        Self { ranges }
    }
}

impl Display for SequenceSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        for (index, range) in self.ranges.iter().enumerate() {
            if index > 0 {
                write!(f, ",")?;
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}
