/// Hands out non-zero packet identifiers, skipping ids still in use.
#[derive(Debug)]
pub struct PacketIdGenerator {
    next: u16,
}

impl PacketIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: 1,
        }
    }

    /// Next id after the last one handed out, wrapping past `u16::MAX` to 1.
    pub fn next(&mut self) -> u16 {
        let current = self.next;
        self.next = if current == u16::MAX { 1 } else { current + 1 };
        current
    }

    /// First id for which `in_use` is false, or `None` when all 65535 are taken.
    pub fn next_free(&mut self, in_use: impl Fn(u16) -> bool) -> Option<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next();
            if !in_use(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

impl Default for PacketIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
