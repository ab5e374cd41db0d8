//! Big-endian bit reading for stream headers.

use std::io;

use bitstream_io::{BigEndian, BitRead, BitReader, UnsignedInteger};

#[derive(Debug)]
pub struct BitstreamIoReader<R: io::Read> {
    bs: BitReader<R, BigEndian>,
    len: u64,
    consumed: u64,
}

pub type BsIoSliceReader<'a> = BitstreamIoReader<io::Cursor<&'a [u8]>>;

impl<'a> BsIoSliceReader<'a> {
    pub fn from_slice(data: &'a [u8]) -> Self {
        Self::new(io::Cursor::new(data), data.len() as u64)
    }
}

impl<R: io::Read> BitstreamIoReader<R> {
    pub fn new(read: R, len_bytes: u64) -> Self {
        Self {
            bs: BitReader::new(read),
            len: len_bytes << 3,
            consumed: 0,
        }
    }

    #[inline(always)]
    pub fn get(&mut self) -> io::Result<bool> {
        self.check(1)?;
        self.consumed += 1;
        self.bs.read_bit()
    }

    #[inline(always)]
    pub fn get_n<I: UnsignedInteger>(&mut self, n: u32) -> io::Result<I> {
        self.check(n)?;
        self.consumed += n as u64;
        self.bs.read_unsigned_var(n)
    }

    pub fn skip_n(&mut self, n: u32) -> io::Result<()> {
        self.check(n)?;
        self.consumed += n as u64;
        self.bs.skip(n)
    }

    pub fn available(&self) -> u64 {
        self.len - self.consumed
    }

    fn check(&self, n: u32) -> io::Result<()> {
        if n as u64 > self.available() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("get_n({n}): out of bounds bits at {}", self.consumed),
            ));
        }
        Ok(())
    }
}

#[test]
fn reads_big_endian_fields() {
    let data = [0x52, 0x41, 0x57, 0x56, 0x01, 0x80];
    let mut reader = BsIoSliceReader::from_slice(&data);
    assert_eq!(reader.get_n::<u32>(32).unwrap(), 0x5241_5756);
    assert_eq!(reader.get_n::<u8>(8).unwrap(), 1);
    assert!(reader.get().unwrap());
    reader.skip_n(7).unwrap();
    assert_eq!(reader.available(), 0);
    assert_eq!(
        reader.get_n::<u8>(1).unwrap_err().kind(),
        std::io::ErrorKind::UnexpectedEof
    );
}
