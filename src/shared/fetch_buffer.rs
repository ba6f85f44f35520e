//! Fetch buffer: raw response bytes plus three metadata cells.

use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

use super::{SharedBufferError, WaitCell};

pub const META_READY: usize = 0;
pub const META_HEADER_LEN: usize = 1;
pub const META_BODY_LEN: usize = 2;

/// Bytes received for one response, split into header block and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedResponse {
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct FetchBuffer {
    data: Box<[AtomicU8]>,
    ready: WaitCell,
    header_len: AtomicI32,
    body_len: AtomicI32,
}

impl FetchBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: (0..capacity).map(|_| AtomicU8::new(0)).collect(),
            ready: WaitCell::new(0),
            header_len: AtomicI32::new(0),
            body_len: AtomicI32::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Metadata cell `index`: 0 ready flag, 1 header length, 2 body length.
    pub fn meta(&self, index: usize) -> Option<i32> {
        match index {
            META_READY => Some(self.ready.load()),
            META_HEADER_LEN => Some(self.header_len.load(Ordering::Acquire)),
            META_BODY_LEN => Some(self.body_len.load(Ordering::Acquire)),
            _ => None,
        }
    }

    pub fn byte(&self, index: usize) -> Option<u8> {
        self.data.get(index).map(|b| b.load(Ordering::Acquire))
    }

    // ---------------------------------------------------------------------
    // host side
    // ---------------------------------------------------------------------

    /// Write one slice at offset 0, record the full response lengths, set the
    /// ready flag and wake one waiter.
    pub fn publish(
        &self,
        chunk: &[u8],
        header_len: usize,
        body_len: usize,
    ) -> Result<(), SharedBufferError> {
        if self.ready.is_closed() {
            return Err(SharedBufferError::Closed);
        }
        if chunk.len() > self.capacity() {
            return Err(SharedBufferError::Overflow {
                needed: chunk.len(),
                capacity: self.capacity(),
            });
        }
        let header_len =
            i32::try_from(header_len).map_err(|_| SharedBufferError::LengthOutOfRange(header_len))?;
        let body_len =
            i32::try_from(body_len).map_err(|_| SharedBufferError::LengthOutOfRange(body_len))?;

        for (slot, byte) in self.data.iter().zip(chunk) {
            slot.store(*byte, Ordering::Release);
        }
        self.header_len.store(header_len, Ordering::Release);
        self.body_len.store(body_len, Ordering::Release);
        self.ready.store_and_notify(1);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // sandbox side
    // ---------------------------------------------------------------------

    /// Block until a full response has arrived. `request_more` is invoked
    /// after each slice that leaves bytes outstanding.
    pub fn receive<F>(&self, mut request_more: F) -> Result<ReceivedResponse, SharedBufferError>
    where
        F: FnMut(),
    {
        let mut bytes = Vec::new();
        loop {
            self.ready.wait_while(0)?;
            let header_len = self.header_len.load(Ordering::Acquire).max(0) as usize;
            let body_len = self.body_len.load(Ordering::Acquire).max(0) as usize;
            let total = header_len + body_len;
            let take = (total - bytes.len().min(total)).min(self.capacity());
            bytes.extend(self.data[..take].iter().map(|b| b.load(Ordering::Acquire)));
            self.ready.store(0);

            if bytes.len() >= total {
                let body = bytes.split_off(header_len.min(bytes.len()));
                return Ok(ReceivedResponse {
                    header: bytes,
                    body,
                });
            }
            request_more();
        }
    }

    pub fn close(&self) {
        self.ready.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_zeroed() {
        let buf = FetchBuffer::new(8);
        assert_eq!(buf.meta(META_READY), Some(0));
        assert_eq!(buf.meta(META_HEADER_LEN), Some(0));
        assert_eq!(buf.meta(META_BODY_LEN), Some(0));
        assert!((0..8).all(|i| buf.byte(i) == Some(0)));
    }

    #[test]
    fn test_out_of_range_cells_are_none() {
        let buf = FetchBuffer::new(8);
        assert_eq!(buf.meta(3), None);
        assert_eq!(buf.byte(8), None);
    }

    #[test]
    fn test_single_slice_response() {
        let buf = FetchBuffer::new(32);
        buf.publish(b"{}hello", 2, 5).unwrap();
        assert_eq!(buf.meta(META_READY), Some(1));

        let received = buf.receive(|| panic!("no continuation expected")).unwrap();
        assert_eq!(received.header, b"{}");
        assert_eq!(received.body, b"hello");
        assert_eq!(buf.meta(META_READY), Some(0));
    }

    #[test]
    fn test_publish_rejects_oversized_slice() {
        let buf = FetchBuffer::new(4);
        assert_eq!(
            buf.publish(b"12345", 0, 5),
            Err(SharedBufferError::Overflow { needed: 5, capacity: 4 })
        );
    }

    #[test]
    fn test_closed_buffer_unblocks_receiver() {
        let buf = FetchBuffer::new(4);
        buf.close();
        assert_eq!(buf.receive(|| {}), Err(SharedBufferError::Closed));
    }
}
