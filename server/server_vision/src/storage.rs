use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ndarray::ArrayView2;

use crate::processing::ProcessedFrame;

const NPY_MAGIC: &[u8] = b"\x93NUMPY";
const NPY_ALIGNMENT: usize = 64;

/// Element types that can be written to an `.npy` array file.
pub trait NpyElement: Copy {
    const DESCR: &'static str;

    fn extend_le(&self, out: &mut Vec<u8>);
}

impl NpyElement for u8 {
    const DESCR: &'static str = "|u1";

    fn extend_le(&self, out: &mut Vec<u8>) {
        out.push(*self);
    }
}

impl NpyElement for u16 {
    const DESCR: &'static str = "<u2";

    fn extend_le(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

/// Encodes a 2-D array as NumPy `.npy` version 1.0, C order.
pub fn encode_npy<T: NpyElement>(array: ArrayView2<T>) -> Vec<u8> {
    let (rows, cols) = array.dim();
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': ({}, {}), }}",
        T::DESCR,
        rows,
        cols
    );
    // magic + version + header length field, header padded with spaces and terminated by '\n'
    let preamble = NPY_MAGIC.len() + 2 + 2;
    let unpadded = preamble + header.len() + 1;
    let padding = (NPY_ALIGNMENT - unpadded % NPY_ALIGNMENT) % NPY_ALIGNMENT;
    header.extend(std::iter::repeat_n(' ', padding));
    header.push('\n');

    let mut out = Vec::with_capacity(preamble + header.len() + array.len() * size_of::<T>());
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for element in array.iter() {
        element.extend_le(&mut out);
    }
    out
}

pub fn frame_file_name(prefix: &str, exposure_time: u32, frame_index: u32) -> String {
    format!("{}_ss={}_{:04}.raw", prefix, exposure_time, frame_index)
}

pub fn capture_log_file_name(prefix: &str) -> String {
    format!("{}_SSCapture.log", prefix)
}

pub fn write_frame(path: &Path, frame: &ProcessedFrame) -> io::Result<()> {
    let bytes = match frame {
        ProcessedFrame::Packed(bytes) => encode_npy(bytes.view()),
        ProcessedFrame::Samples(samples) => encode_npy(samples.view()),
    };
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&bytes)?;
    writer.flush()
}

#[derive(Debug, Clone)]
pub struct CaptureLogEntry {
    pub path: PathBuf,
    pub capture_duration: Duration,
    pub save_duration: Duration,
    pub target_exposure_time: u32,
    pub actual_exposure_time: u32,
    pub frame_duration: u32,
}

/// Correlates requested and reported exposure for every frame of a sequence.
#[derive(Debug, Default)]
pub struct CaptureLog {
    lines: Vec<String>,
}

impl CaptureLog {
    pub fn record(&mut self, entry: &CaptureLogEntry) {
        self.lines.push(format!(
            "fName:{};tCap:{:.3};tSav:{:.3};sSS:{};iSS:{};FD:{}",
            entry.path.display(),
            entry.capture_duration.as_secs_f64(),
            entry.save_duration.as_secs_f64(),
            entry.target_exposure_time,
            entry.actual_exposure_time,
            entry.frame_duration,
        ));
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        for line in &self.lines {
            writeln!(writer, "{}", line)?;
        }
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn npy_header_is_aligned_and_describes_the_array() {
        let samples = array![[1_u16, 2, 3], [0x0FFF, 0xFFFF, 0]];
        let bytes = encode_npy(samples.view());

        assert_eq!(&bytes[..6], NPY_MAGIC);
        assert_eq!(&bytes[6..8], &[1, 0]);
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % NPY_ALIGNMENT, 0);

        let header = std::str::from_utf8(&bytes[10..10 + header_len]).unwrap();
        assert!(header.starts_with("{'descr': '<u2', 'fortran_order': False, 'shape': (2, 3), }"));
        assert!(header.ends_with('\n'));

        let data = &bytes[10 + header_len..];
        assert_eq!(data.len(), 12);
        assert_eq!(&data[6..8], &0x0FFF_u16.to_le_bytes());
        assert_eq!(&data[8..10], &[0xFF, 0xFF]);
    }

    #[test]
    fn npy_bytes_use_u1_descriptor() {
        let bytes = encode_npy(array![[7_u8, 8], [9, 10]].view());
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        let header = std::str::from_utf8(&bytes[10..10 + header_len]).unwrap();

        assert!(header.contains("'descr': '|u1'"));
        assert_eq!(&bytes[10 + header_len..], &[7, 8, 9, 10]);
    }

    #[test]
    fn file_names() {
        assert_eq!(frame_file_name("demo", 1000, 2), "demo_ss=1000_0002.raw");
        assert_eq!(frame_file_name("demo", 31500, 12345), "demo_ss=31500_12345.raw");
        assert_eq!(capture_log_file_name("demo"), "demo_SSCapture.log");
    }

    #[test]
    fn capture_log_writes_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = CaptureLog::default();
        for index in 0..3 {
            log.record(&CaptureLogEntry {
                path: dir.path().join(frame_file_name("x", 100, index)),
                capture_duration: Duration::from_millis(105),
                save_duration: Duration::from_millis(2),
                target_exposure_time: 100,
                actual_exposure_time: 98,
                frame_duration: 100_000,
            });
        }

        let path = dir.path().join(capture_log_file_name("x"));
        log.write_to(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines = contents.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("x_ss=100_0000.raw;tCap:0.105;tSav:0.002;sSS:100;iSS:98;FD:100000"));
    }
}
