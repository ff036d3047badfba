//! Post-processing of packed raw sensor frames.
//!
//! Raw rows are delivered in the sensor's packed 12-bit layout: three bytes `(s0, s1, s2)` carry
//! two samples, `s0`/`s1` hold the upper eight bits of the even/odd sample and `s2` holds the two
//! low nibbles (even sample in the low nibble).

use ndarray::{Array2, ArrayView2, Zip, s};
use thiserror::Error;

/// Largest 12-bit sample value, a sample at this level is saturated.
pub const SATURATION_LEVEL: u16 = 0xFFF;
/// Marks binned samples that contain at least one saturated source sample.
pub const SATURATED_SENTINEL: u16 = 0xFFFF;

#[derive(Debug, Error, PartialEq)]
pub enum ProcessingError {
    #[error("clip window exceeds frame. window: {window:?}, frame rows: {rows}, frame bytes per row: {cols}")]
    WindowOutOfBounds { window: [u32; 4], rows: usize, cols: usize },
    #[error("clip window is not aligned to packed pixel pairs. x: {x}, width: {width}")]
    UnalignedWindow { x: u32, width: u32 },
    #[error("packed row length does not match pixel width. bytes: {bytes}, width: {width}")]
    PackedWidthMismatch { bytes: usize, width: usize },
    #[error("cannot bin odd dimensions. iteration: {iteration}, rows: {rows}, cols: {cols}")]
    OddDimensions { iteration: u32, rows: usize, cols: usize },
}

/// Output of the post-processing chain for one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessedFrame {
    /// cropped packed bytes, as delivered by the sensor
    Packed(Array2<u8>),
    /// one sample per pixel
    Samples(Array2<u16>),
}

impl ProcessedFrame {
    pub fn dim(&self) -> (usize, usize) {
        match self {
            ProcessedFrame::Packed(bytes) => bytes.dim(),
            ProcessedFrame::Samples(samples) => samples.dim(),
        }
    }
}

/// Crops a packed frame to `[x, y, width, height]` given in pixels.
///
/// Horizontal coordinates are scaled by 1.5 (three bytes per two pixels), vertical ones are not.
pub fn crop_packed(raw: ArrayView2<u8>, window: [u32; 4]) -> Result<Array2<u8>, ProcessingError> {
    let [x, y, width, height] = window;
    let (rows, cols) = raw.dim();

    let col_start = x as usize * 3 / 2;
    let col_end = (x as usize + width as usize) * 3 / 2;
    let row_start = y as usize;
    let row_end = row_start + height as usize;

    if col_end > cols || row_end > rows {
        return Err(ProcessingError::WindowOutOfBounds { window, rows, cols });
    }

    Ok(raw
        .slice(s![row_start..row_end, col_start..col_end])
        .to_owned())
}

/// Checks that a crop window starts and ends on a packed byte-group boundary.
pub fn check_unpack_alignment(window: [u32; 4]) -> Result<(), ProcessingError> {
    let [x, _, width, _] = window;
    if x % 2 != 0 || width % 2 != 0 {
        return Err(ProcessingError::UnalignedWindow { x, width });
    }
    Ok(())
}

#[inline]
pub fn unpack_pair(s0: u8, s1: u8, s2: u8) -> (u16, u16) {
    let even = (u16::from(s0) << 4) | (u16::from(s2) & 0xF);
    let odd = (u16::from(s1) << 4) | ((u16::from(s2) >> 4) & 0xF);
    (even, odd)
}

#[inline]
pub fn pack_pair(even: u16, odd: u16) -> (u8, u8, u8) {
    let s0 = (even >> 4) as u8;
    let s1 = (odd >> 4) as u8;
    let s2 = ((even & 0xF) | ((odd & 0xF) << 4)) as u8;
    (s0, s1, s2)
}

/// Unpacks packed 12-bit rows into one `u16` per pixel, values in `0..=0xFFF`.
pub fn unpack_12bit(packed: ArrayView2<u8>) -> Result<Array2<u16>, ProcessingError> {
    let (rows, bytes) = packed.dim();
    if bytes % 3 != 0 {
        return Err(ProcessingError::PackedWidthMismatch {
            bytes,
            width: bytes * 2 / 3,
        });
    }
    let width = bytes / 3 * 2;

    let mut samples = Array2::<u16>::zeros((rows, width));
    for row in 0..rows {
        for group in 0..bytes / 3 {
            let (even, odd) = unpack_pair(
                packed[[row, group * 3]],
                packed[[row, group * 3 + 1]],
                packed[[row, group * 3 + 2]],
            );
            samples[[row, group * 2]] = even;
            samples[[row, group * 2 + 1]] = odd;
        }
    }
    Ok(samples)
}

/// Packs 12-bit samples into the sensor layout, the inverse of [`unpack_12bit`].
pub fn pack_12bit(samples: ArrayView2<u16>) -> Result<Array2<u8>, ProcessingError> {
    let (rows, width) = samples.dim();
    if width % 2 != 0 {
        return Err(ProcessingError::PackedWidthMismatch {
            bytes: width * 3 / 2,
            width,
        });
    }

    let mut packed = Array2::<u8>::zeros((rows, width / 2 * 3));
    for row in 0..rows {
        for group in 0..width / 2 {
            let (s0, s1, s2) = pack_pair(samples[[row, group * 2]], samples[[row, group * 2 + 1]]);
            packed[[row, group * 3]] = s0;
            packed[[row, group * 3 + 1]] = s1;
            packed[[row, group * 3 + 2]] = s2;
        }
    }
    Ok(packed)
}

/// Halves both dimensions `iterations` times by summing 2x2 blocks.
///
/// Saturation is detected once on the input (`>= 0xFFF`) and OR-ed through every iteration;
/// output cells with a saturated source are replaced by [`SATURATED_SENTINEL`].
///
/// Sums that do not fit in 16 bits saturate at `0xFFFF` instead of wrapping around as a plain
/// `uint16` sum would. Such a cell is then indistinguishable from the sentinel, which is accepted:
/// a wrapped value would be a small, plausible looking reading instead.
///
/// Binning stops early once a dimension reaches zero.
pub fn bin_saturation_aware(samples: Array2<u16>, iterations: u32) -> Result<Array2<u16>, ProcessingError> {
    if iterations == 0 {
        return Ok(samples);
    }

    let mut mask = samples.mapv(|sample| sample >= SATURATION_LEVEL);
    let mut samples = samples;

    for iteration in 0..iterations {
        let (rows, cols) = samples.dim();
        if rows == 0 || cols == 0 {
            break;
        }
        if rows % 2 != 0 || cols % 2 != 0 {
            return Err(ProcessingError::OddDimensions { iteration, rows, cols });
        }

        let binned = Array2::from_shape_fn((rows / 2, cols / 2), |(row, col)| {
            let (r, c) = (row * 2, col * 2);
            samples[[r, c]]
                .saturating_add(samples[[r + 1, c]])
                .saturating_add(samples[[r, c + 1]])
                .saturating_add(samples[[r + 1, c + 1]])
        });
        let binned_mask = Array2::from_shape_fn((rows / 2, cols / 2), |(row, col)| {
            let (r, c) = (row * 2, col * 2);
            mask[[r, c]] | mask[[r + 1, c]] | mask[[r, c + 1]] | mask[[r + 1, c + 1]]
        });

        samples = binned;
        mask = binned_mask;
    }

    Zip::from(&mut samples)
        .and(&mask)
        .for_each(|sample, saturated| {
            if *saturated {
                *sample = SATURATED_SENTINEL;
            }
        });

    Ok(samples)
}

/// Crop, then optionally unpack and bin, a single raw frame.
pub fn process_frame(
    raw: ArrayView2<u8>,
    window: [u32; 4],
    demosaic: bool,
    bin_iterations: u32,
) -> Result<ProcessedFrame, ProcessingError> {
    if demosaic {
        check_unpack_alignment(window)?;
    }

    let cropped = crop_packed(raw, window)?;
    if !demosaic {
        return Ok(ProcessedFrame::Packed(cropped));
    }

    let samples = unpack_12bit(cropped.view())?;
    let samples = bin_saturation_aware(samples, bin_iterations)?;
    Ok(ProcessedFrame::Samples(samples))
}
