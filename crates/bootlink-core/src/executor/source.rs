use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

use crate::error::Result;
use crate::sparse::SPARSE_HEADER_SIZE;

/// Byte stream to be written to a partition, with its on-disk length.
pub struct WriteSource {
    reader: Box<dyn Read + Send>,
    len: u64,
}

impl std::fmt::Debug for WriteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSource").field("len", &self.len).finish()
    }
}

impl WriteSource {
    pub fn new(reader: impl Read + Send + 'static, len: u64) -> Self {
        Self {
            reader: Box::new(reader),
            len,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Self::new(Cursor::new(bytes), len)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self::new(file, len))
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Split off up to a sparse header's worth of leading bytes so the
    /// format can be sniffed without losing them.
    pub(crate) fn peek_header(mut self) -> Result<(Vec<u8>, Box<dyn Read + Send>, u64)> {
        let mut head = Vec::with_capacity(SPARSE_HEADER_SIZE);
        (&mut self.reader)
            .take(SPARSE_HEADER_SIZE as u64)
            .read_to_end(&mut head)?;
        Ok((head, self.reader, self.len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_keeps_all_bytes() {
        let data: Vec<u8> = (0..100u8).collect();
        let source = WriteSource::from_bytes(data.clone());
        assert_eq!(source.len(), 100);
        let (head, rest, len) = source.peek_header().unwrap();
        assert_eq!(head.len(), SPARSE_HEADER_SIZE);
        let mut all = Vec::new();
        Cursor::new(head).chain(rest).read_to_end(&mut all).unwrap();
        assert_eq!(all, data);
        assert_eq!(len, 100);
    }

    #[test]
    fn test_peek_short_source() {
        let (head, _, len) = WriteSource::from_bytes(vec![1, 2, 3]).peek_header().unwrap();
        assert_eq!(head, vec![1, 2, 3]);
        assert_eq!(len, 3);
    }
}
