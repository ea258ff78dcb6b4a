//! Serialized-size checks against hard store and transport ceilings.

use std::io;

use serde::Serialize;

use crate::Error;

/// Outcome of measuring a candidate payload against a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeCheck {
    pub bytes: usize,
    pub limit: usize,
}

impl SizeCheck {
    pub fn fits(&self) -> bool {
        self.bytes <= self.limit
    }

    pub fn size_kb(&self) -> f64 {
        kilobytes(self.bytes)
    }
}

/// Byte sink that only counts what serde_json writes.
struct CountingWriter(usize);

impl io::Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Length in bytes of the compact JSON encoding of `value`.
pub fn serialized_size<T: Serialize + ?Sized>(value: &T) -> Result<usize, Error> {
    let mut counter = CountingWriter(0);
    serde_json::to_writer(&mut counter, value)?;
    Ok(counter.0)
}

/// Measure `value` against `limit`.
pub fn check<T: Serialize + ?Sized>(value: &T, limit: usize) -> Result<SizeCheck, Error> {
    Ok(SizeCheck { bytes: serialized_size(value)?, limit })
}

/// Kilobytes rounded to one decimal, as reported to users.
pub fn kilobytes(bytes: usize) -> f64 {
    (bytes as f64 / 1024.0 * 10.0).round() / 10.0
}
