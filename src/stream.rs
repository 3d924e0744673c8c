// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Cursor, Read, Write},
};

const ZEROS: [u8; 16384] = [0u8; 16384];

/// A trait for streams whose length can be set to an exact value. Growing a
/// stream fills the new region with zeros.
pub trait Truncate {
    fn truncate(&mut self, size: u64) -> io::Result<()>;
}

impl Truncate for File {
    fn truncate(&mut self, size: u64) -> io::Result<()> {
        self.set_len(size)
    }
}

impl Truncate for Cursor<Vec<u8>> {
    fn truncate(&mut self, size: u64) -> io::Result<()> {
        let size = usize::try_from(size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Size out of range"))?;

        self.get_mut().resize(size, 0);

        Ok(())
    }
}

impl<T: Truncate + ?Sized> Truncate for &mut T {
    fn truncate(&mut self, size: u64) -> io::Result<()> {
        (**self).truncate(size)
    }
}

/// Extensions for writers to easily write zeros (eg. for padding).
pub trait WriteZerosExt {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64>;

    fn write_zeros_exact(&mut self, size: u64) -> io::Result<()> {
        let n = self.write_zeros(size)?;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected to write {size} bytes, but reached EOF after {n} bytes"),
            ));
        }
        Ok(())
    }
}

impl<W: Write> WriteZerosExt for W {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64> {
        // We don't use std::io::copy() on std::io::repeat(0) because it fails
        // if the writer hits EOF before all data is written.
        let mut written = 0;

        while written < size {
            let to_write = (size - written).min(ZEROS.len() as u64) as usize;
            let n = self.write(&ZEROS[..to_write])?;
            written += n as u64;

            if n < to_write {
                break;
            }
        }

        Ok(written)
    }
}

/// Extensions for readers to fill a buffer as far as EOF allows.
pub trait ReadFillExt {
    /// Read until the buffer is full or EOF is reached. Returns the number of
    /// bytes read, which is only less than the buffer size at EOF.
    fn read_fill(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<R: Read> ReadFillExt for R {
    fn read_fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut n = 0;

        while n < buf.len() {
            let count = self.read(&mut buf[n..])?;
            if count == 0 {
                break;
            }
            n += count;
        }

        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek, SeekFrom};

    use super::*;

    #[test]
    fn truncate_cursor() {
        let mut cursor = Cursor::new(b"foobar".to_vec());
        cursor.truncate(3).unwrap();
        assert_eq!(cursor.get_ref(), b"foo");

        cursor.truncate(5).unwrap();
        assert_eq!(cursor.get_ref(), b"foo\0\0");
    }

    #[test]
    fn read_fill_short() {
        let mut cursor = Cursor::new(b"foobar".to_vec());
        let mut buf = [0u8; 16];

        assert_eq!(cursor.read_fill(&mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"foobar");

        cursor.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(cursor.read_fill(&mut buf[..4]).unwrap(), 4);
    }
}
