/// Growable receive buffer reused across collectives.
///
/// Contents are never meaningful between calls; each collective treats the
/// buffer as fresh scratch. The allocation only grows.
#[derive(Debug, Default)]
pub struct ScratchBuffer {
    buf: Vec<u8>,
}

impl ScratchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow at least `min_bytes` of scratch, growing the allocation if needed.
    ///
    /// The returned slice is exactly `min_bytes` long; the capacity kept
    /// behind it is `max(previous, min_bytes)`.
    pub fn acquire(&mut self, min_bytes: usize) -> &mut [u8] {
        if self.buf.len() < min_bytes {
            tracing::trace!(from = self.buf.len(), to = min_bytes, "growing scratch buffer");
            // Old contents are scratch; drop them instead of copying.
            self.buf = vec![0u8; min_bytes];
        }
        &mut self.buf[..min_bytes]
    }

    /// Bytes currently held.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}
