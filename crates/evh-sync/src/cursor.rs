//! Per-stream pagination position.

/// Offset is counted in pages; the request offset is `offset * page_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCursor {
    offset: u64,
    page_size: u64,
    exhausted: bool,
}

impl StreamCursor {
    pub fn new(page_size: u64) -> Self {
        Self {
            offset: 0,
            page_size,
            exhausted: false,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    /// Record offset of the next page to request.
    pub fn start(&self) -> u64 {
        self.offset.saturating_mul(self.page_size)
    }

    pub fn advance(&mut self) {
        self.offset = self.offset.saturating_add(1);
    }

    pub fn mark_exhausted(&mut self) {
        self.exhausted = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_scales_page_offset_by_page_size() {
        let mut cursor = StreamCursor::new(8);
        assert_eq!(cursor.start(), 0);
        cursor.advance();
        cursor.advance();
        assert_eq!(cursor.offset(), 2);
        assert_eq!(cursor.start(), 16);
    }

    #[test]
    fn exhaustion_is_sticky_and_does_not_stop_advancing() {
        let mut cursor = StreamCursor::new(6);
        cursor.mark_exhausted();
        cursor.mark_exhausted();
        assert!(cursor.exhausted());
        cursor.advance();
        assert_eq!(cursor.start(), 6);
        assert!(cursor.exhausted());
    }
}
