use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};

/// File or stdin input behind one buffered reader.
pub struct InputReader {
    reader: Box<dyn Read>,
    is_pipe: bool,
    size: Option<u64>,
}

impl InputReader {
    /// Opens `input_path`; "-" reads standard input.
    pub fn new<P: AsRef<Path>>(input_path: P) -> Result<Self> {
        let path = input_path.as_ref();
        if is_pipe(path) {
            return Ok(Self {
                reader: Box::new(io::stdin().lock()),
                is_pipe: true,
                size: None,
            });
        }

        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let size = file.metadata().ok().map(|m| m.len());
        Ok(Self {
            reader: Box::new(BufReader::new(file)),
            is_pipe: false,
            size,
        })
    }

    pub fn is_pipe(&self) -> bool {
        self.is_pipe
    }

    /// Size of a file input in bytes.
    pub fn size(&self) -> Option<u64> {
        self.size
    }
}

impl Read for InputReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

pub fn is_pipe(path: &Path) -> bool {
    path.as_os_str() == "-"
}
