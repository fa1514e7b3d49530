//! Silence based frame boundary detection.
//!
//! The serial back-ends only tell how many bytes wait in the receive buffer,
//! not when each byte arrived. A frame is therefore considered complete once
//! that count stops changing for one poll interval, or drops back to zero
//! after data was seen. Both transports feed [`FrameDetector`] from their poll
//! loops; they differ only in how they sleep between polls.

/// Tracks the receive buffer fill level across polls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameDetector {
    size: usize,
    more_data: bool,
}

impl FrameDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one observation of the buffered byte count.
    ///
    /// Returns `true` when the frame is complete and polling should stop.
    pub fn observe(&mut self, available: usize) -> bool {
        if self.more_data && (available == 0 || available == self.size) {
            return true;
        }
        if available != 0 && available != self.size {
            self.more_data = true;
            self.size = available;
        }
        false
    }

    /// The byte count of the frame seen so far.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether any data arrived since polling started.
    pub fn has_data(&self) -> bool {
        self.more_data
    }
}
