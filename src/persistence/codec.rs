//! Big-endian record encoding shared by every persisted file.
//!
//! Integers are fixed-width big-endian; strings are a `u16` byte length
//! followed by UTF-8 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{BackupError, BackupResult};

pub fn put_utf(buf: &mut BytesMut, value: &str) -> BackupResult<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        BackupError::Persistence(format!(
            "string of {} bytes does not fit a record",
            value.len()
        ))
    })?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Encode a single string record
pub fn utf_record(value: &str) -> BackupResult<Bytes> {
    let mut buf = BytesMut::with_capacity(2 + value.len());
    put_utf(&mut buf, value)?;
    Ok(buf.freeze())
}

/// Cursor over a record file's bytes
pub struct RecordReader {
    buf: Bytes,
    file: String,
}

impl RecordReader {
    pub fn new(data: impl Into<Bytes>, file: impl Into<String>) -> Self {
        Self {
            buf: data.into(),
            file: file.into(),
        }
    }

    pub fn has_remaining(&self) -> bool {
        self.buf.has_remaining()
    }

    fn require(&self, needed: usize, what: &str) -> BackupResult<()> {
        if self.buf.remaining() < needed {
            return Err(BackupError::corrupt(
                &self.file,
                format!(
                    "truncated {what}: need {needed} bytes, have {}",
                    self.buf.remaining()
                ),
            ));
        }
        Ok(())
    }

    pub fn read_i32(&mut self) -> BackupResult<i32> {
        self.require(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    pub fn read_i64(&mut self) -> BackupResult<i64> {
        self.require(8, "i64")?;
        Ok(self.buf.get_i64())
    }

    pub fn read_utf(&mut self) -> BackupResult<String> {
        self.require(2, "string length")?;
        let len = self.buf.get_u16() as usize;
        self.require(len, "string body")?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec())
            .map_err(|e| BackupError::corrupt(&self.file, format!("invalid utf-8: {e}")))
    }

    /// Read string records until the end of the buffer.
    ///
    /// A torn final record (crash mid-append) ends the sequence without error.
    pub fn read_utf_sequence(&mut self) -> Vec<String> {
        let mut values = Vec::new();
        while self.has_remaining() {
            match self.read_utf() {
                Ok(value) => values.push(value),
                Err(e) => {
                    tracing::warn!(file = %self.file, error = %e, "Ignoring torn record tail");
                    break;
                }
            }
        }
        values
    }
}
