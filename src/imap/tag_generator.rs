use std::num::Wrapping;

#[derive(Debug)]
pub struct TagGenerator {
    last_tag: Wrapping<u16>,
}

impl TagGenerator {
    pub fn next(&mut self) -> String {
        self.last_tag += Wrapping(1);
        format!("{:04x}", self.last_tag)
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self {
            last_tag: Wrapping(u16::MAX),
        }
    }
}
