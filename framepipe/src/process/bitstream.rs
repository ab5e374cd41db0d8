use std::fmt::{Debug, Formatter};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

/// Default size of the bitstream window.
pub const BITSTREAM_CAPACITY: usize = 1024 * 1024;

/// Where a pipeline reads its elementary stream from.
pub enum StreamSource {
    /// A file; `-` means standard input.
    Path(PathBuf),
    Stdin,
    Reader(Box<dyn Read + Send>),
}

impl StreamSource {
    pub fn is_pipe(&self) -> bool {
        match self {
            StreamSource::Path(path) => path.as_os_str() == "-",
            StreamSource::Stdin | StreamSource::Reader(_) => true,
        }
    }

    fn open(self) -> io::Result<(Box<dyn Read + Send>, Option<PathBuf>)> {
        match self {
            StreamSource::Path(path) if path.as_os_str() == "-" => Ok((Box::new(io::stdin()), None)),
            StreamSource::Path(path) => {
                let file = File::open(&path)?;
                Ok((Box::new(BufReader::new(file)), Some(path)))
            }
            StreamSource::Stdin => Ok((Box::new(io::stdin()), None)),
            StreamSource::Reader(reader) => Ok((reader, None)),
        }
    }
}

impl Debug for StreamSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamSource::Path(path) => write!(f, "Path({})", path.display()),
            StreamSource::Stdin => write!(f, "Stdin"),
            StreamSource::Reader(_) => write!(f, "Reader"),
        }
    }
}

impl From<PathBuf> for StreamSource {
    fn from(path: PathBuf) -> Self {
        StreamSource::Path(path)
    }
}

impl From<&Path> for StreamSource {
    fn from(path: &Path) -> Self {
        StreamSource::Path(path.to_path_buf())
    }
}

impl From<&str> for StreamSource {
    fn from(path: &str) -> Self {
        StreamSource::Path(PathBuf::from(path))
    }
}

impl From<Vec<u8>> for StreamSource {
    fn from(data: Vec<u8>) -> Self {
        StreamSource::Reader(Box::new(io::Cursor::new(data)))
    }
}

/// Input cursor handed to the decode stage.
///
/// Holds a window of not yet consumed bytes. [`feed`](Self::feed) moves the
/// remaining bytes to the front and tops the window up from the source.
pub struct Bitstream {
    data: Vec<u8>,
    offset: usize,
    length: usize,
    reader: Box<dyn Read + Send>,
    path: Option<PathBuf>,
    repeat: bool,
    eos: bool,
    total_read: u64,
}

impl Bitstream {
    pub fn open(source: StreamSource, capacity: usize) -> io::Result<Self> {
        let (reader, path) = source.open()?;
        Ok(Self {
            data: vec![0; capacity.max(1)],
            offset: 0,
            length: 0,
            reader,
            path,
            repeat: false,
            eos: false,
            total_read: 0,
        })
    }

    /// Restart file input from the beginning when it runs out.
    pub fn set_repeat(&mut self, repeat: bool) {
        if repeat && self.path.is_none() {
            log::warn!("Repeat mode needs a file input, ignoring");
            return;
        }
        self.repeat = repeat;
    }

    /// Unconsumed bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.length]
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    /// Marks `count` bytes as consumed.
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.length);
        self.offset += count;
        self.length -= count;
    }

    /// Drops every buffered byte.
    pub fn discard(&mut self) {
        self.consume(self.length);
    }

    /// Grows the window so `bytes` can be buffered at once.
    pub fn require(&mut self, bytes: usize) {
        if bytes > self.data.len() {
            log::debug!("Growing bitstream window to {bytes} bytes");
            self.data.resize(bytes, 0);
        }
    }

    /// The source is exhausted; buffered bytes may remain.
    pub fn source_exhausted(&self) -> bool {
        self.eos
    }

    /// The source is exhausted and every byte has been consumed.
    pub fn is_end(&self) -> bool {
        self.eos && self.length == 0
    }

    /// Compacts the window and reads from the source until it is full or the
    /// source ends. Returns the number of bytes read.
    pub fn feed(&mut self) -> io::Result<usize> {
        if self.offset > 0 {
            self.data
                .copy_within(self.offset..self.offset + self.length, 0);
            self.offset = 0;
        }

        let mut read = 0;
        let mut rewound = false;
        while !self.eos && self.length < self.data.len() {
            let n = match self.reader.read(&mut self.data[self.length..]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n == 0 {
                // an empty file would rewind forever
                if rewound || !self.rewind()? {
                    self.eos = true;
                }
                rewound = true;
                if read > 0 && self.eos {
                    break;
                }
                continue;
            }
            rewound = false;
            self.length += n;
            read += n;
        }

        self.total_read += read as u64;
        Ok(read)
    }

    fn rewind(&mut self) -> io::Result<bool> {
        match (&self.path, self.repeat) {
            (Some(path), true) => {
                log::debug!("Restarting {} from the beginning", path.display());
                self.reader = Box::new(BufReader::new(File::open(path)?));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl Debug for Bitstream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitstream")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("capacity", &self.data.len())
            .field("eos", &self.eos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_compacts_and_reaches_end() {
        let mut bs = Bitstream::open((0u8..10).collect::<Vec<_>>().into(), 4).unwrap();
        assert_eq!(bs.feed().unwrap(), 4);
        assert_eq!(bs.data(), &[0, 1, 2, 3]);

        bs.consume(3);
        assert_eq!(bs.feed().unwrap(), 3);
        assert_eq!(bs.data(), &[3, 4, 5, 6]);

        bs.consume(4);
        assert_eq!(bs.feed().unwrap(), 3);
        assert_eq!(bs.data(), &[7, 8, 9]);
        assert!(bs.source_exhausted());
        assert!(!bs.is_end());

        bs.consume(3);
        assert!(bs.is_end());
        assert_eq!(bs.feed().unwrap(), 0);
        assert_eq!(bs.total_read(), 10);
    }

    #[test]
    fn require_grows_window() {
        let mut bs = Bitstream::open(vec![1u8; 100].into(), 8).unwrap();
        bs.feed().unwrap();
        assert_eq!(bs.len(), 8);
        bs.require(64);
        bs.feed().unwrap();
        assert_eq!(bs.len(), 64);
        assert_eq!(bs.capacity(), 64);
    }

    #[test]
    fn repeat_restarts_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, &[9, 8, 7]).unwrap();

        let mut bs = Bitstream::open(file.path().into(), 8).unwrap();
        bs.set_repeat(true);
        bs.feed().unwrap();
        assert_eq!(bs.data(), &[9, 8, 7, 9, 8, 7, 9, 8]);
        assert!(!bs.source_exhausted());
    }

    #[test]
    fn repeat_needs_a_file() {
        let mut bs = Bitstream::open(vec![1u8, 2].into(), 8).unwrap();
        bs.set_repeat(true);
        bs.feed().unwrap();
        assert_eq!(bs.data(), &[1, 2]);
        assert!(bs.source_exhausted());
    }
}
