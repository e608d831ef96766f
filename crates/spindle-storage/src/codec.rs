//! Streaming zlib decoding over whatever input window is resident

use flate2::{Decompress, DecompressError, FlushDecompress, Status};

/// Progress made by one decode call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DecodeStep {
    pub(crate) consumed: usize,
    pub(crate) produced: usize,
    pub(crate) finished: bool,
}

/// zlib inflate state that can be fed input piecewise and rewound
pub(crate) struct StreamDecoder {
    inner: Decompress,
}

impl StreamDecoder {
    pub(crate) fn new() -> Self {
        Self {
            inner: Decompress::new(true),
        }
    }

    /// Forget all stream state; the next input must be a stream header.
    pub(crate) fn reset(&mut self) {
        self.inner.reset(true);
    }

    /// Inflate as much of `input` into `output` as fits.
    pub(crate) fn decode(
        &mut self,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<DecodeStep, DecompressError> {
        let in_before = self.inner.total_in();
        let out_before = self.inner.total_out();
        let status = self
            .inner
            .decompress(input, output, FlushDecompress::None)?;
        Ok(DecodeStep {
            consumed: (self.inner.total_in() - in_before) as usize,
            produced: (self.inner.total_out() - out_before) as usize,
            finished: status == Status::StreamEnd,
        })
    }
}
