//! Byte-buffer cache for a generated export document.
//!
//! Holds the serialized bytes until something invalidates it; the next
//! access rebuilds via the supplied generator.

use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Default)]
pub struct Cache {
    buffer: Mutex<Option<Arc<Vec<u8>>>>,
}

impl Cache {
    /// Return the cached bytes, building them with `generate` if stale.
    pub fn get(&self, generate: impl FnOnce() -> Vec<u8>) -> Arc<Vec<u8>> {
        let mut buffer = self.buffer.lock();
        match &*buffer {
            Some(bytes) => bytes.clone(),
            None => {
                let bytes = Arc::new(generate());
                *buffer = Some(bytes.clone());
                bytes
            }
        }
    }

    pub fn invalidate(&self) {
        *self.buffer.lock() = None;
    }
}
