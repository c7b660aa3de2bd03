use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use super::error::CompressionError;

pub const DEFAULT_LEVEL: u32 = 6;

pub struct Deflater {
    stream: Compress,
    out: Vec<u8>,
    dirty: bool,
    plain_since_flush: usize,
}

impl Deflater {
    pub fn new(level: u32) -> Self {
        Self {
            stream: Compress::new(Compression::new(level), true),
            out: Vec::new(),
            dirty: false,
            plain_since_flush: 0,
        }
    }

    pub fn feed(&mut self, mut input: &[u8]) -> Result<(), CompressionError> {
        if input.is_empty() {
            return Ok(());
        }
        self.dirty = true;
        self.plain_since_flush += input.len();

        while !input.is_empty() {
            // A bit more than the input is enough to do everything in one go.
            self.out.reserve(input.len() + 20);
            let before = self.stream.total_in();
            self.stream
                .compress_vec(input, &mut self.out, FlushCompress::None)?;
            let consumed = (self.stream.total_in() - before) as usize;
            input = &input[consumed..];
        }

        Ok(())
    }

    /// Forces out everything fed so far, ending on a partial-flush boundary.
    /// Returns the compressed bytes, empty when nothing was fed.
    pub fn flush(&mut self) -> Result<Vec<u8>, CompressionError> {
        if self.dirty {
            loop {
                self.out.reserve(1000);
                let spare = self.out.capacity() - self.out.len();
                let before = self.out.len();
                self.stream
                    .compress_vec(&[], &mut self.out, FlushCompress::Partial)?;
                if self.out.len() - before < spare {
                    break;
                }
            }
            self.dirty = false;
        }

        log::trace!(
            "deflate flush: {} -> {} bytes",
            self.plain_since_flush,
            self.out.len()
        );
        self.plain_since_flush = 0;
        Ok(std::mem::take(&mut self.out))
    }
}

pub struct Inflater {
    stream: Decompress,
    input: Vec<u8>,
    pos: usize,
    needs_input: bool,
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            stream: Decompress::new(true),
            input: Vec::new(),
            pos: 0,
            needs_input: true,
        }
    }

    pub fn needs_input(&self) -> bool {
        self.needs_input
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.input.drain(..self.pos);
        self.pos = 0;
        self.input.extend_from_slice(data);
        if !self.input.is_empty() {
            self.needs_input = false;
        }
    }

    /// Decompresses into `out`. Producing less than `out.len()` means the
    /// buffered input is exhausted and [`Inflater::needs_input`] turns true.
    pub fn drain(&mut self, out: &mut [u8]) -> Result<usize, CompressionError> {
        if out.is_empty() {
            return Ok(0);
        }

        let before_in = self.stream.total_in();
        let before_out = self.stream.total_out();
        self.stream
            .decompress(&self.input[self.pos..], out, FlushDecompress::None)?;
        let consumed = (self.stream.total_in() - before_in) as usize;
        let produced = (self.stream.total_out() - before_out) as usize;
        self.pos += consumed;

        if produced < out.len() {
            self.needs_input = true;
            if self.pos == self.input.len() {
                self.input.clear();
                self.pos = 0;
            }
        }

        Ok(produced)
    }
}

pub struct StreamCompression {
    pub deflate: Deflater,
    pub inflate: Inflater,
}

impl StreamCompression {
    pub fn new(level: u32) -> Self {
        Self {
            deflate: Deflater::new(level),
            inflate: Inflater::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_all(inflater: &mut Inflater, chunk: usize) -> Vec<u8> {
        let mut plain = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            let n = inflater.drain(&mut buf).unwrap();
            plain.extend_from_slice(&buf[..n]);
            if inflater.needs_input() {
                return plain;
            }
        }
    }

    #[test]
    fn test_flushed_chunk_is_self_contained() {
        let mut deflater = Deflater::new(DEFAULT_LEVEL);
        let mut inflater = Inflater::new();

        deflater.feed(b"first message").unwrap();
        let first = deflater.flush().unwrap();
        deflater.feed(b"second message").unwrap();
        let second = deflater.flush().unwrap();

        inflater.feed(&first);
        assert_eq!(drain_all(&mut inflater, 64), b"first message");

        inflater.feed(&second);
        assert_eq!(drain_all(&mut inflater, 64), b"second message");
    }

    #[test]
    fn test_flush_without_input_emits_nothing() {
        let mut deflater = Deflater::new(DEFAULT_LEVEL);
        assert!(deflater.flush().unwrap().is_empty());

        deflater.feed(b"x").unwrap();
        assert!(!deflater.flush().unwrap().is_empty());
        assert!(deflater.flush().unwrap().is_empty());
    }

    #[test]
    fn test_large_payload_through_small_output_buffer() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 251) as u8).collect();
        let mut deflater = Deflater::new(DEFAULT_LEVEL);
        deflater.feed(&payload).unwrap();
        let wire = deflater.flush().unwrap();

        let mut inflater = Inflater::new();
        let mut plain = Vec::new();
        for piece in wire.chunks(333) {
            inflater.feed(piece);
            plain.extend(drain_all(&mut inflater, 97));
        }
        assert_eq!(plain, payload);
    }

    #[test]
    fn test_split_input_is_carried_over() {
        let mut deflater = Deflater::new(DEFAULT_LEVEL);
        deflater.feed(b"hello lockstep").unwrap();
        let wire = deflater.flush().unwrap();

        let mut inflater = Inflater::new();
        inflater.feed(&wire[..3]);
        let mut plain = drain_all(&mut inflater, 8);
        inflater.feed(&wire[3..]);
        plain.extend(drain_all(&mut inflater, 8));
        assert_eq!(plain, b"hello lockstep");
    }

    #[test]
    fn test_garbage_is_an_error() {
        let mut inflater = Inflater::new();
        inflater.feed(&[0xff; 16]);
        let mut buf = [0u8; 16];
        assert!(inflater.drain(&mut buf).is_err());
    }
}
