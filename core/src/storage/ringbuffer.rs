/// Fixed-capacity FIFO that can always hand out its contents as one contiguous slice.
///
/// Every write lands twice, at `pos` and `pos + capacity`, so the newest
/// `len` elements are contiguous somewhere in the doubled backing vector.
pub struct SliceableRingBuffer<T: Clone> {
    buffer: Vec<T>,
    write_position: usize,
    capacity: usize,
    len: usize,
}

impl<T: Clone> SliceableRingBuffer<T> {
    pub fn new(capacity: usize, default_value: T) -> Self {
        let capacity = capacity.max(1);
        SliceableRingBuffer {
            buffer: vec![default_value; capacity * 2],
            write_position: 0,
            capacity,
            len: 0,
        }
    }

    /// Appends `data`, evicting the oldest element once full. Returns whether one was evicted.
    pub fn write(&mut self, data: T) -> bool {
        let adjusted_position = self.write_position % self.capacity;
        self.buffer[adjusted_position] = data.clone();
        self.buffer[adjusted_position + self.capacity] = data;

        self.write_position = (self.write_position + 1) % self.capacity;
        if self.len < self.capacity {
            self.len += 1;
            false
        } else {
            true
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Everything currently held, oldest first.
    pub fn get_slice(&self) -> &[T] {
        self.get_slice_with_len(self.len)
    }

    /// The newest `len` elements, oldest first. `len` is clamped to what is held.
    pub fn get_slice_with_len(&self, len: usize) -> &[T] {
        let len = len.min(self.len);
        let start = (self.write_position + (self.capacity - len)) % self.capacity;
        &self.buffer[start..start + len]
    }

    pub fn last(&self) -> Option<&T> {
        self.get_slice_with_len(1).first()
    }

    pub fn clear(&mut self) {
        self.write_position = 0;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::SliceableRingBuffer;

    #[test]
    fn it_initializes_empty() {
        let rb = SliceableRingBuffer::new(5, 0);
        assert!(rb.is_empty());
        assert_eq!(rb.get_slice(), &[] as &[i32]);
        assert_eq!(rb.last(), None);
    }

    #[test]
    fn partially_filled() {
        let mut rb = SliceableRingBuffer::new(5, 0);
        rb.write(1);
        rb.write(2);
        assert_eq!(rb.get_slice(), &[1, 2]);
        assert_eq!(rb.last(), Some(&2));
    }

    #[test]
    fn writing_and_reading() {
        let mut rb = SliceableRingBuffer::new(5, 0);
        for i in 1..=5 {
            assert!(!rb.write(i));
        }
        assert_eq!(rb.get_slice(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn overwriting_elements() {
        let mut rb = SliceableRingBuffer::new(5, 0);
        for i in 1..=13 {
            rb.write(i);
        }
        assert_eq!(rb.len(), 5);
        assert_eq!(rb.get_slice(), &[9, 10, 11, 12, 13]);
    }

    #[test]
    fn get_slice_with_len() {
        let mut rb = SliceableRingBuffer::new(5, 0);
        for i in 1..=13 {
            rb.write(i);
        }
        assert_eq!(rb.get_slice_with_len(3), &[11, 12, 13]);
        assert_eq!(rb.get_slice_with_len(50), &[9, 10, 11, 12, 13]);
    }

    #[test]
    fn clear_resets() {
        let mut rb = SliceableRingBuffer::new(3, 0);
        rb.write(7);
        rb.clear();
        assert!(rb.is_empty());
        rb.write(8);
        assert_eq!(rb.get_slice(), &[8]);
    }
}
