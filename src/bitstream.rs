//! Bitstream records and per-frame compression outputs
//!
//! A [`BitstreamRecord`] is what one entropy sub-model produces for one tensor: the
//! main latent stream (`prior`), the side-information stream (`hyperprior`) and the
//! latent shape needed to size the decoder. Each stream carries a small header:
//!
//! ```text
//! +----------------+----------------+-----------+------------------+
//! | symbols (u32)  | payload (u32)  | crc16     | ANS words (LE)   |
//! +----------------+----------------+-----------+------------------+
//! ```
//!
//! Records are grouped per frame into a [`VcRecord`], tagged by GOP role, and per
//! video into a [`CompressedVideo`].

use crate::codec::gop::FrameRole;
use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::Array4;
use std::io::{Cursor, Read};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Size of the per-stream header in bytes
pub const STREAM_HEADER_SIZE: usize = 10;

/// Magic bytes in front of a persisted record
pub const RECORD_MAGIC: &[u8; 4] = b"VSRB";

/// Largest number of symbols a single stream may carry
pub const MAX_STREAM_SYMBOLS: usize = 1 << 27;

// ─────────────────────────────────────────────────────────────────────────────
// Latent Shape
// ─────────────────────────────────────────────────────────────────────────────

/// Shape of the latent tensor a record decodes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatentShape {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl LatentShape {
    /// Shape of a `[B, C, H, W]` tensor
    pub fn of(tensor: &Array4<f32>) -> Self {
        let (batch, channels, height, width) = tensor.dim();
        Self {
            batch,
            channels,
            height,
            width,
        }
    }

    /// Shape as an ndarray dimension tuple
    pub fn dim(&self) -> (usize, usize, usize, usize) {
        (self.batch, self.channels, self.height, self.width)
    }

    /// Number of latent elements; `None` on overflow
    pub fn num_elements(&self) -> Option<usize> {
        self.batch
            .checked_mul(self.channels)?
            .checked_mul(self.height)?
            .checked_mul(self.width)
    }

    /// Shape of the side-information latent: spatial dimensions halved, rounded up
    pub fn pooled(&self) -> Self {
        Self {
            batch: self.batch,
            channels: self.channels,
            height: self.height.div_ceil(2),
            width: self.width.div_ceil(2),
        }
    }

    /// All dimensions zero
    pub fn is_zero(&self) -> bool {
        self.batch == 0
            && self.channels == 0
            && self.height == 0
            && self.width == 0
    }

    /// Shape as a slice-friendly vector, for error messages
    pub fn to_vec(&self) -> Vec<usize> {
        vec![self.batch, self.channels, self.height, self.width]
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bitstream Record
// ─────────────────────────────────────────────────────────────────────────────

/// One coded tensor: prior stream, hyperprior stream and latent shape
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitstreamRecord {
    /// Main latent stream
    pub prior: Vec<u8>,
    /// Side-information stream
    pub hyperprior: Vec<u8>,
    /// Latent shape
    pub shape: LatentShape,
}

impl BitstreamRecord {
    /// Create a record
    pub fn new(prior: Vec<u8>, hyperprior: Vec<u8>, shape: LatentShape) -> Self {
        Self {
            prior,
            hyperprior,
            shape,
        }
    }

    /// The placeholder motion record emitted at keyframes: two empty streams and a
    /// zero shape
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether this record is the keyframe placeholder
    pub fn is_sentinel(&self) -> bool {
        self.prior.is_empty() && self.hyperprior.is_empty() && self.shape.is_zero()
    }

    /// Coded size in bytes (both streams, headers included)
    pub fn num_bytes(&self) -> usize {
        self.prior.len() + self.hyperprior.len()
    }

    /// Coded size in bits
    pub fn num_bits(&self) -> usize {
        self.num_bytes() * 8
    }

    /// Serialize for storage or transport
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 8 + self.num_bytes() + 16);
        out.extend_from_slice(RECORD_MAGIC);
        // Writes into a Vec cannot fail
        let _ = out.write_u32::<LittleEndian>(self.prior.len() as u32);
        out.extend_from_slice(&self.prior);
        let _ = out.write_u32::<LittleEndian>(self.hyperprior.len() as u32);
        out.extend_from_slice(&self.hyperprior);
        for dim in [
            self.shape.batch,
            self.shape.channels,
            self.shape.height,
            self.shape.width,
        ] {
            let _ = out.write_u32::<LittleEndian>(dim as u32);
        }
        out
    }

    /// Parse a record written by [`BitstreamRecord::to_bytes`]
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < RECORD_MAGIC.len() || &data[..RECORD_MAGIC.len()] != RECORD_MAGIC {
            return Err(Error::bitstream_corrupted(0, "missing record magic"));
        }
        let mut cursor = Cursor::new(&data[RECORD_MAGIC.len()..]);

        let prior = read_block(&mut cursor, "prior")?;
        let hyperprior = read_block(&mut cursor, "hyperprior")?;

        let mut dims = [0usize; 4];
        for dim in dims.iter_mut() {
            *dim = cursor.read_u32::<LittleEndian>().map_err(|_| {
                Error::bitstream_corrupted(
                    RECORD_MAGIC.len() + cursor.position() as usize,
                    "truncated shape",
                )
            })? as usize;
        }

        Ok(Self {
            prior,
            hyperprior,
            shape: LatentShape {
                batch: dims[0],
                channels: dims[1],
                height: dims[2],
                width: dims[3],
            },
        })
    }
}

fn read_block(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<Vec<u8>> {
    let offset = RECORD_MAGIC.len() + cursor.position() as usize;
    let len = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::bitstream_corrupted(offset, format!("truncated {} length", what)))?
        as usize;
    let remaining = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    if len > remaining {
        return Err(Error::bitstream_corrupted(
            offset,
            format!("{} length {} exceeds the {} remaining bytes", what, len, remaining),
        ));
    }
    let mut block = vec![0u8; len];
    cursor
        .read_exact(&mut block)
        .map_err(|_| Error::bitstream_corrupted(offset + 4, format!("truncated {} stream", what)))?;
    Ok(block)
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream Framing
// ─────────────────────────────────────────────────────────────────────────────

/// Wrap ANS words in a stream header
pub(crate) fn frame_stream(num_symbols: usize, words: &[u32]) -> Vec<u8> {
    let payload = words_to_bytes(words);
    let mut out = Vec::with_capacity(STREAM_HEADER_SIZE + payload.len());
    let _ = out.write_u32::<LittleEndian>(num_symbols as u32);
    let _ = out.write_u32::<LittleEndian>(payload.len() as u32);
    let _ = out.write_u16::<LittleEndian>(calculate_crc16(&payload));
    out.extend_from_slice(&payload);
    out
}

/// Symbol count declared in a stream header, read without touching the payload
pub(crate) fn stream_symbols(data: &[u8]) -> Result<usize> {
    let mut cursor = Cursor::new(data);
    let num_symbols = cursor.read_u32::<LittleEndian>().map_err(|_| {
        Error::bitstream_corrupted(
            data.len(),
            format!(
                "truncated stream header ({} of {} bytes)",
                data.len(),
                STREAM_HEADER_SIZE
            ),
        )
    })?;
    Ok(num_symbols as usize)
}

/// Validate a stream header and return the ANS words
pub(crate) fn unframe_stream(data: &[u8], expected_symbols: usize) -> Result<Vec<u32>> {
    if data.len() < STREAM_HEADER_SIZE {
        return Err(Error::bitstream_corrupted(
            data.len(),
            format!(
                "truncated stream header ({} of {} bytes)",
                data.len(),
                STREAM_HEADER_SIZE
            ),
        ));
    }

    let mut cursor = Cursor::new(data);
    let num_symbols = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::bitstream_corrupted(0, "unreadable symbol count"))?
        as usize;
    let payload_len = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::bitstream_corrupted(4, "unreadable payload length"))?
        as usize;
    let checksum = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| Error::bitstream_corrupted(8, "unreadable checksum"))?;

    if num_symbols != expected_symbols {
        return Err(Error::decoding_failed(format!(
            "stream holds {} symbols but the shape implies {}",
            num_symbols, expected_symbols
        )));
    }

    let payload = &data[STREAM_HEADER_SIZE..];
    if payload.len() != payload_len {
        return Err(Error::bitstream_corrupted(
            STREAM_HEADER_SIZE + payload.len().min(payload_len),
            format!(
                "payload length {} does not match header ({})",
                payload.len(),
                payload_len
            ),
        ));
    }
    if payload_len % 4 != 0 {
        return Err(Error::bitstream_corrupted(
            STREAM_HEADER_SIZE,
            "payload is not a whole number of words",
        ));
    }
    if calculate_crc16(payload) != checksum {
        return Err(Error::bitstream_corrupted(
            STREAM_HEADER_SIZE,
            "payload checksum mismatch",
        ));
    }

    Ok(bytes_to_words(payload))
}

/// Convert compressed u32 words to bytes
pub(crate) fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for &word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to u32 words
pub(crate) fn bytes_to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// CRC-16-CCITT over a byte slice
pub fn calculate_crc16(data: &[u8]) -> u16 {
    const POLY: u16 = 0x1021;

    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ POLY;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-frame and per-video outputs
// ─────────────────────────────────────────────────────────────────────────────

/// Coded output of the compression task for one frame
///
/// `motion` is `None` for policies without a motion stream. Under the
/// motion-compensated policy every record carries a motion slot: the sentinel at
/// keyframes, a coded record at predicted frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcRecord {
    /// Frame coded by the keyframe codec
    Keyframe {
        content: BitstreamRecord,
        motion: Option<BitstreamRecord>,
    },
    /// Frame coded relative to the previous reconstruction
    Predicted {
        content: BitstreamRecord,
        motion: Option<BitstreamRecord>,
    },
}

impl VcRecord {
    /// GOP role this record was coded with
    pub fn role(&self) -> FrameRole {
        match self {
            VcRecord::Keyframe { .. } => FrameRole::Keyframe,
            VcRecord::Predicted { .. } => FrameRole::Predicted,
        }
    }

    /// Content (feature or residual) record
    pub fn content(&self) -> &BitstreamRecord {
        match self {
            VcRecord::Keyframe { content, .. } | VcRecord::Predicted { content, .. } => content,
        }
    }

    /// Motion slot, if the policy has one
    pub fn motion(&self) -> Option<&BitstreamRecord> {
        match self {
            VcRecord::Keyframe { motion, .. } | VcRecord::Predicted { motion, .. } => {
                motion.as_ref()
            }
        }
    }

    /// Coded size of all streams in this record
    pub fn num_bytes(&self) -> usize {
        self.content().num_bytes() + self.motion().map_or(0, BitstreamRecord::num_bytes)
    }
}

/// Output of `compress` for a whole video
#[derive(Debug, Clone, Default)]
pub struct CompressedVideo {
    records: Vec<VcRecord>,
    auxiliary: Vec<(String, Vec<Array4<f32>>)>,
    reconstructions: Option<Vec<Array4<f32>>>,
}

impl CompressedVideo {
    /// Create an empty container for the given auxiliary task names
    pub fn new<S: AsRef<str>>(auxiliary_tasks: &[S]) -> Self {
        Self {
            records: Vec::new(),
            auxiliary: auxiliary_tasks
                .iter()
                .map(|t| (t.as_ref().to_string(), Vec::new()))
                .collect(),
            reconstructions: None,
        }
    }

    /// Append the compression record of the next frame
    pub fn push_record(&mut self, record: VcRecord) {
        self.records.push(record);
    }

    /// Append an auxiliary task output for the next frame
    pub fn push_auxiliary(&mut self, task: &str, output: Array4<f32>) -> Result<()> {
        let slot = self
            .auxiliary
            .iter_mut()
            .find(|(name, _)| name == task)
            .ok_or_else(|| Error::internal(format!("no auxiliary slot for task '{}'", task)))?;
        slot.1.push(output);
        Ok(())
    }

    /// Append an encoder-side reconstruction
    pub fn push_reconstruction(&mut self, frame: Array4<f32>) {
        self.reconstructions.get_or_insert_with(Vec::new).push(frame);
    }

    /// Per-frame compression records, in frame order
    pub fn records(&self) -> &[VcRecord] {
        &self.records
    }

    /// Per-frame outputs of an auxiliary task
    pub fn auxiliary(&self, task: &str) -> Option<&[Array4<f32>]> {
        self.auxiliary
            .iter()
            .find(|(name, _)| name == task)
            .map(|(_, outputs)| outputs.as_slice())
    }

    /// Names of the auxiliary tasks, in task order
    pub fn auxiliary_tasks(&self) -> impl Iterator<Item = &str> {
        self.auxiliary.iter().map(|(name, _)| name.as_str())
    }

    /// Reconstructions the encoder computed while compressing; only adaptive
    /// predictive encodes produce them
    pub fn reconstructions(&self) -> Option<&[Array4<f32>]> {
        self.reconstructions.as_deref()
    }

    /// Number of coded frames
    pub fn num_frames(&self) -> usize {
        self.records.len()
    }

    /// Coded size of every frame, in bytes
    pub fn frame_sizes(&self) -> Vec<usize> {
        self.records.iter().map(VcRecord::num_bytes).collect()
    }

    /// Total coded size in bytes
    pub fn total_bytes(&self) -> usize {
        self.frame_sizes().iter().sum()
    }

    /// Bits per pixel of each frame: `bits / (batch * height * width)`
    pub fn frame_bits_per_pixel(&self, batch: usize, height: usize, width: usize) -> Vec<f64> {
        let pixels = batch * height * width;
        self.frame_sizes()
            .into_iter()
            .map(|bytes| {
                if pixels == 0 {
                    0.0
                } else {
                    (bytes * 8) as f64 / pixels as f64
                }
            })
            .collect()
    }

    /// Per-frame bits per pixel averaged over the video
    pub fn mean_bits_per_pixel(&self, batch: usize, height: usize, width: usize) -> f64 {
        let per_frame = self.frame_bits_per_pixel(batch, height, width);
        if per_frame.is_empty() {
            return 0.0;
        }
        per_frame.iter().sum::<f64>() / per_frame.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> BitstreamRecord {
        BitstreamRecord::new(
            vec![1, 2, 3, 4, 5],
            vec![9, 8],
            LatentShape {
                batch: 1,
                channels: 6,
                height: 4,
                width: 3,
            },
        )
    }

    #[test]
    fn test_sentinel_record() {
        let sentinel = BitstreamRecord::empty();
        assert!(sentinel.is_sentinel());
        assert_eq!(sentinel.num_bytes(), 0);
        assert!(!sample_record().is_sentinel());
    }

    #[test]
    fn test_record_persistence() {
        let record = sample_record();
        let bytes = record.to_bytes();
        assert_eq!(BitstreamRecord::from_bytes(&bytes).unwrap(), record);
    }

    #[test]
    fn test_record_from_truncated_bytes() {
        let bytes = sample_record().to_bytes();
        for cut in [0, 3, 6, 10, bytes.len() - 1] {
            let err = BitstreamRecord::from_bytes(&bytes[..cut]).unwrap_err();
            assert!(err.is_decode_error(), "cut at {} gave {:?}", cut, err);
        }
    }

    #[test]
    fn test_stream_framing() {
        let words = vec![0xDEADBEEF, 0x00000001];
        let framed = frame_stream(7, &words);
        assert_eq!(framed.len(), STREAM_HEADER_SIZE + 8);
        assert_eq!(unframe_stream(&framed, 7).unwrap(), words);
    }

    #[test]
    fn test_stream_framing_rejects_damage() {
        let framed = frame_stream(7, &[0x12345678, 0x9ABCDEF0]);

        let err = unframe_stream(&framed[..framed.len() - 4], 7).unwrap_err();
        assert!(err.is_decode_error());

        let err = unframe_stream(&framed[..5], 7).unwrap_err();
        assert!(err.is_decode_error());

        let err = unframe_stream(&framed, 8).unwrap_err();
        assert!(err.is_decode_error());

        let mut flipped = framed.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x01;
        let err = unframe_stream(&flipped, 7).unwrap_err();
        assert!(matches!(err, Error::BitstreamCorrupted { .. }));
    }

    #[test]
    fn test_crc16_known_value() {
        // CRC-16/CCITT-FALSE check value
        assert_eq!(calculate_crc16(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_vc_record_accessors() {
        let key = VcRecord::Keyframe {
            content: sample_record(),
            motion: Some(BitstreamRecord::empty()),
        };
        assert_eq!(key.role(), FrameRole::Keyframe);
        assert!(key.motion().unwrap().is_sentinel());
        assert_eq!(key.num_bytes(), 7);

        let pred = VcRecord::Predicted {
            content: sample_record(),
            motion: None,
        };
        assert_eq!(pred.role(), FrameRole::Predicted);
        assert!(pred.motion().is_none());
    }

    #[test]
    fn test_compressed_video_accounting() {
        let mut video = CompressedVideo::new(&["vsr"]);
        video.push_record(VcRecord::Keyframe {
            content: sample_record(),
            motion: None,
        });
        video.push_record(VcRecord::Predicted {
            content: sample_record(),
            motion: None,
        });
        video
            .push_auxiliary("vsr", Array4::zeros((1, 3, 4, 4)))
            .unwrap();
        assert!(video.push_auxiliary("depth", Array4::zeros((1, 1, 1, 1))).is_err());

        assert_eq!(video.num_frames(), 2);
        assert_eq!(video.total_bytes(), 14);
        assert_eq!(video.auxiliary("vsr").unwrap().len(), 1);
        assert!(video.reconstructions().is_none());
        // 7 bytes * 8 bits per frame of 1x2x2 pixels
        assert_eq!(video.frame_bits_per_pixel(1, 2, 2), vec![14.0, 14.0]);
        assert!((video.mean_bits_per_pixel(1, 2, 2) - 14.0).abs() < 1e-9);
        assert_eq!(CompressedVideo::new::<&str>(&[]).mean_bits_per_pixel(1, 2, 2), 0.0);
    }

    #[test]
    fn test_record_with_oversized_block_length() {
        let mut bytes = sample_record().to_bytes();
        // prior length field sits right after the magic
        bytes[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = BitstreamRecord::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::BitstreamCorrupted { offset: 4, .. }), "{:?}", err);

        let mut bytes = sample_record().to_bytes();
        let hyper_len_at = 4 + 4 + 5;
        bytes[hyper_len_at..hyper_len_at + 4].copy_from_slice(&1_000_000u32.to_le_bytes());
        assert!(BitstreamRecord::from_bytes(&bytes).unwrap_err().is_decode_error());
    }

    #[test]
    fn test_latent_shape_element_count() {
        let shape = sample_record().shape;
        assert_eq!(shape.num_elements(), Some(72));
        assert_eq!(
            shape.pooled(),
            LatentShape {
                batch: 1,
                channels: 6,
                height: 2,
                width: 2,
            }
        );

        let huge = LatentShape {
            batch: 1 << 20,
            channels: 3,
            height: 1 << 20,
            width: 1 << 30,
        };
        assert_eq!(huge.num_elements(), None);
    }

    #[test]
    fn test_stream_symbols_reads_header_only() {
        let framed = frame_stream(7, &[0x12345678]);
        assert_eq!(stream_symbols(&framed).unwrap(), 7);
        assert_eq!(stream_symbols(&framed[..4]).unwrap(), 7);
        assert!(stream_symbols(&framed[..3]).unwrap_err().is_decode_error());
    }
}
