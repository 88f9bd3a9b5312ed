/// Bounded single-producer-multi-consumer ring buffer queue of
/// variable-length records.
///
/// Ported from the frame layout in the original `BufferQueue.cpp`: a
/// fixed byte buffer, two monotonically increasing counters (`top`,
/// `bottom`) taken modulo the buffer size for physical offsets, and a
/// record header `{ payload_size, alignment_pad }` immediately preceding
/// each payload. `alignment_pad` is filler recorded so that advancing
/// `bottom` past it lands exactly at offset 0 when the *next* record's
/// header would otherwise straddle the wrap point; an individual payload
/// may still wrap and is reassembled by `drain` into a scratch buffer.
///
/// One `parking_lot::Mutex` guards both producers and consumers -- a
/// single-lock design, not lock-free, despite the counters being plain
/// `u64`s rather than atomics (nothing reads them outside the lock).
use parking_lot::Mutex;

/// Default ring capacity, rounded up to the next page boundary at
/// construction.
pub const RING_QUEUE_DEFAULT_CAPACITY: usize = 64 * 1024;

const PAGE_SIZE: usize = 4096;
const HEADER_SIZE: usize = std::mem::size_of::<u64>() * 2;

fn round_up_to_page(size: usize) -> usize {
    if size == 0 {
        return PAGE_SIZE;
    }
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

struct Inner {
    buffer: Vec<u8>,
    capacity: u64,
    top: u64,
    bottom: u64,
    scratch: Vec<u8>,
}

impl Inner {
    fn write_header(&mut self, offset: usize, payload_size: u64, alignment_pad: u64) {
        let cap = self.capacity as usize;
        for (i, byte) in payload_size.to_le_bytes().into_iter().enumerate() {
            self.buffer[(offset + i) % cap] = byte;
        }
        for (i, byte) in alignment_pad.to_le_bytes().into_iter().enumerate() {
            self.buffer[(offset + 8 + i) % cap] = byte;
        }
    }

    fn read_header(&self, offset: usize) -> (u64, u64) {
        let cap = self.capacity as usize;
        let mut size_bytes = [0u8; 8];
        let mut pad_bytes = [0u8; 8];
        for i in 0..8 {
            size_bytes[i] = self.buffer[(offset + i) % cap];
            pad_bytes[i] = self.buffer[(offset + 8 + i) % cap];
        }
        (u64::from_le_bytes(size_bytes), u64::from_le_bytes(pad_bytes))
    }

    fn write_payload(&mut self, offset: usize, payload: &[u8]) {
        let cap = self.capacity as usize;
        for (i, byte) in payload.iter().enumerate() {
            self.buffer[(offset + i) % cap] = *byte;
        }
    }

    /// Reads `len` payload bytes starting at `offset`, into a contiguous
    /// slice if possible, otherwise into `self.scratch` (grown as needed).
    fn read_payload<'a>(&'a mut self, offset: usize, len: usize) -> &'a [u8] {
        let cap = self.capacity as usize;
        if offset + len <= cap {
            &self.buffer[offset..offset + len]
        } else {
            if self.scratch.len() < len {
                self.scratch.resize(len, 0);
            }
            let first = cap - offset;
            self.scratch[..first].copy_from_slice(&self.buffer[offset..cap]);
            self.scratch[first..len].copy_from_slice(&self.buffer[..len - first]);
            &self.scratch[..len]
        }
    }
}

pub struct RingQueue {
    inner: Mutex<Inner>,
}

impl RingQueue {
    pub fn new(requested_capacity: usize) -> Self {
        let capacity = round_up_to_page(requested_capacity);
        RingQueue {
            inner: Mutex::new(Inner {
                buffer: vec![0u8; capacity],
                capacity: capacity as u64,
                top: 0,
                bottom: 0,
                scratch: Vec::new(),
            }),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(RING_QUEUE_DEFAULT_CAPACITY)
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity as usize
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.top == inner.bottom
    }

    /// Pushes one record. Returns `false` (queue unchanged) if the payload
    /// plus framing does not fit in the remaining capacity. Never blocks,
    /// never grows the backing buffer (I6).
    pub fn push(&self, payload: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        let cap = inner.capacity as usize;
        let top_offset = (inner.top % inner.capacity) as usize;

        // Reject up front using the unpadded frame size -- padding can
        // only grow the reservation, so if even this doesn't fit we're
        // full. `raw_end` is the offset (not yet wrapped) one past the
        // payload's last byte; since the unpadded frame already fits
        // within one buffer length of `top_offset`, `raw_end < 2 * cap`
        // and a single `% cap` below is exact.
        let base_frame = HEADER_SIZE + payload.len();
        if inner.top + base_frame as u64 > inner.bottom + inner.capacity {
            return false;
        }

        let raw_end = top_offset + base_frame;
        let next_header_offset = raw_end % cap;

        // Pad only if the *next* record's header would straddle the wrap
        // point -- i.e. it doesn't start exactly at 0 and doesn't have
        // room before the buffer end.
        let alignment_pad = if next_header_offset != 0 && cap - next_header_offset < HEADER_SIZE {
            (cap - next_header_offset) as u64
        } else {
            0
        };

        let frame_size = base_frame as u64 + alignment_pad;
        if inner.top + frame_size > inner.bottom + inner.capacity {
            // Padding pushed us over capacity; fail without mutating state.
            return false;
        }

        inner.write_header(top_offset, payload.len() as u64, alignment_pad);
        inner.write_payload(top_offset + HEADER_SIZE, payload);
        inner.top += frame_size;
        true
    }

    /// Reads the oldest record into `out` if it fits. Leaves the queue
    /// unchanged and returns `None` if `out` is too small or the queue is
    /// empty.
    pub fn pop_one(&self, out: &mut [u8]) -> Option<usize> {
        let mut inner = self.inner.lock();
        if inner.top == inner.bottom {
            return None;
        }
        let bottom_offset = (inner.bottom % inner.capacity) as usize;
        let (size, pad) = inner.read_header(bottom_offset);
        let size = size as usize;
        if size > out.len() {
            return None;
        }
        let payload_offset = (bottom_offset + HEADER_SIZE) % inner.capacity as usize;
        let bytes = {
            let slice = inner.read_payload(payload_offset, size);
            out[..size].copy_from_slice(slice);
            size
        };
        inner.bottom += HEADER_SIZE as u64 + size as u64 + pad;
        Some(bytes)
    }

    /// Repeatedly pops the oldest record and hands it to `f`, stopping when
    /// the queue is empty (I4, I5). `f` sees a contiguous slice regardless
    /// of whether the underlying payload wrapped.
    pub fn drain(&self, mut f: impl FnMut(&[u8])) {
        loop {
            let mut inner = self.inner.lock();
            if inner.top == inner.bottom {
                return;
            }
            let bottom_offset = (inner.bottom % inner.capacity) as usize;
            let (size, pad) = inner.read_header(bottom_offset);
            let size = size as usize;
            let payload_offset = (bottom_offset + HEADER_SIZE) % inner.capacity as usize;

            // `read_payload` hands back a contiguous view -- straight into
            // the backing buffer if the payload didn't wrap, or into the
            // queue's own scratch buffer (grown as needed) if it did. Copy
            // it out before releasing the lock so `f` runs lock-free (it
            // must not call back into this queue; that would deadlock).
            let data = inner.read_payload(payload_offset, size).to_vec();
            inner.bottom += HEADER_SIZE as u64 + size as u64 + pad;
            drop(inner);

            f(&data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_simple_roundtrip() {
        let q = RingQueue::new(PAGE_SIZE);
        assert!(q.push(b"hello"));
        let mut out = [0u8; 16];
        let n = q.pop_one(&mut out).unwrap();
        assert_eq!(&out[..n], b"hello");
        assert!(q.is_empty());
    }

    #[test]
    fn pop_one_rejects_undersized_output_without_mutating() {
        let q = RingQueue::new(PAGE_SIZE);
        assert!(q.push(b"0123456789"));
        let mut out = [0u8; 4];
        assert_eq!(q.pop_one(&mut out), None);
        // Queue unchanged -- a second attempt with a big enough buffer works.
        let mut out2 = [0u8; 16];
        let n = q.pop_one(&mut out2).unwrap();
        assert_eq!(&out2[..n], b"0123456789");
    }

    /// I6: push of a payload exceeding remaining capacity returns false and
    /// leaves the queue unchanged.
    #[test]
    fn push_full_is_total() {
        let q = RingQueue::new(PAGE_SIZE);
        let cap = q.capacity();
        let big = vec![7u8; cap];
        assert!(!q.push(&big));
        assert!(q.is_empty());
        // A small push still succeeds afterwards.
        assert!(q.push(b"ok"));
    }

    /// I4: records drain in exactly the order pushed, each with exact
    /// length and bytes.
    #[test]
    fn drain_preserves_order_length_and_bytes() {
        let q = RingQueue::new(PAGE_SIZE);
        let records: Vec<Vec<u8>> = (0..20)
            .map(|i| vec![i as u8; 3 + (i as usize % 7)])
            .collect();
        for r in &records {
            assert!(q.push(r));
        }

        let mut seen = Vec::new();
        q.drain(|data| seen.push(data.to_vec()));
        assert_eq!(seen, records);
        assert!(q.is_empty());
    }

    /// I5: I4 holds even when individual payloads straddle the physical
    /// wrap point.
    #[test]
    fn drain_handles_wrapped_payloads() {
        let q = RingQueue::new(PAGE_SIZE);
        let mut expected = Vec::new();

        // Push/drain in a loop with payload sizes chosen so that the
        // write cursor repeatedly crosses the buffer boundary.
        for round in 0..200u32 {
            let len = 25 + (round as usize % 11);
            let payload: Vec<u8> = (0..len).map(|i| ((round as usize + i) % 251) as u8).collect();
            if !q.push(&payload) {
                // Drain what's there before retrying, to exercise wrap
                // under sustained push/drain interleaving (scenario 5).
                q.drain(|data| expected.push(data.to_vec()));
                assert!(q.push(&payload));
            }
            expected.push(payload);
            if round % 3 == 0 {
                let mut seen = Vec::new();
                q.drain(|data| seen.push(data.to_vec()));
                assert_eq!(seen, expected);
                expected.clear();
            }
        }
        let mut seen = Vec::new();
        q.drain(|data| seen.push(data.to_vec()));
        assert_eq!(seen, expected);
    }

    #[test]
    fn capacity_rounds_up_to_page_boundary() {
        let q = RingQueue::new(1);
        assert_eq!(q.capacity(), PAGE_SIZE);
        let q2 = RingQueue::new(PAGE_SIZE + 1);
        assert_eq!(q2.capacity(), 2 * PAGE_SIZE);
    }
}
