//! Data segment instance: an addressable byte buffer that `memory.init` can
//! copy from and `data.drop` can invalidate.

#[derive(Debug, Clone)]
pub struct DataInstance {
    bytes: Vec<u8>,
    passive: bool,
    dropped: bool,
}

impl DataInstance {
    pub fn new(bytes: Vec<u8>, passive: bool) -> Self {
        Self {
            bytes,
            passive,
            dropped: false,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_passive(&self) -> bool {
        self.passive
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    /// Marks the segment dropped. The flag is monotonic; dropping an already
    /// dropped segment is a no-op.
    pub fn drop_segment(&mut self) {
        self.dropped = true;
    }
}
