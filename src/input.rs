//! The encoder pipeline turning raw PCM byte streams into Opus frames.

use crate::constants::*;
use crate::error::PlayError;
use audiopus::{coder::Encoder as OpusEncoder, Application as CodingMode, Channels};
use byteorder::{ByteOrder, LittleEndian};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Lazily re-chunks a stream of 16-bit little-endian interleaved stereo PCM
/// at 48 kHz into 20 ms frames, Opus-encoding each one.
///
/// Once the source runs dry, [`SILENT_FRAME_COUNT`] copies of the canonical
/// silent frame are yielded to flush jitter buffers on the remote end; a
/// trailing chunk shorter than one full frame is discarded. The pipeline
/// holds no more than one frame of audio at a time.
pub struct OpusStream<R> {
    reader: R,
    encoder: OpusEncoder,
    pcm_bytes: [u8; STEREO_FRAME_BYTE_SIZE],
    pcm: [i16; STEREO_FRAME_SIZE],
    silent_remaining: usize,
    finished: bool,
}

impl<R: AsyncRead + Unpin> OpusStream<R> {
    /// Wraps a PCM byte source in a fresh encoder.
    ///
    /// Encode for Discord in stereo, as required.
    pub fn new(reader: R) -> Result<Self, PlayError> {
        let mut encoder = OpusEncoder::new(SAMPLE_RATE, Channels::Stereo, CodingMode::Audio)?;
        encoder.set_bitrate(DEFAULT_BITRATE)?;

        Ok(Self {
            reader,
            encoder,
            pcm_bytes: [0u8; STEREO_FRAME_BYTE_SIZE],
            pcm: [0i16; STEREO_FRAME_SIZE],
            silent_remaining: SILENT_FRAME_COUNT,
            finished: false,
        })
    }

    /// Encodes the next frame into `output` and returns its length, or
    /// `None` once the source and the trailing silence are both exhausted.
    ///
    /// Encoder failures propagate; there is no retry.
    pub async fn next_frame(&mut self, output: &mut [u8]) -> Result<Option<usize>, PlayError> {
        if !self.finished {
            if self.fill_frame().await? {
                LittleEndian::read_i16_into(&self.pcm_bytes, &mut self.pcm);
                let len = self.encoder.encode(&self.pcm, output)?;

                return Ok(Some(len));
            }

            self.finished = true;
        }

        if self.silent_remaining > 0 {
            self.silent_remaining -= 1;
            output[..SILENT_FRAME.len()].copy_from_slice(&SILENT_FRAME);

            return Ok(Some(SILENT_FRAME.len()));
        }

        Ok(None)
    }

    /// Reads exactly one frame of PCM, returning `false` at end of stream.
    async fn fill_frame(&mut self) -> Result<bool, PlayError> {
        let mut filled = 0;

        while filled < STEREO_FRAME_BYTE_SIZE {
            let n = self.reader.read(&mut self.pcm_bytes[filled..]).await?;

            if n == 0 {
                if filled > 0 {
                    trace!("Discarding {} bytes of trailing partial frame.", filled);
                }

                return Ok(false);
            }

            filled += n;
        }

        Ok(true)
    }
}
