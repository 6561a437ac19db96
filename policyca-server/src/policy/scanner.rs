//! Logical-line reader for policy rule files.
//!
//! Blank lines and `#` comment lines are skipped. A line ending in an odd
//! number of backslashes continues onto the next physical line; the final
//! backslash and the line break are removed and nothing else changes. Each
//! logical line is trimmed.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek};
use std::path::Path;

/// One logical line and the physical line number it started on (1-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub number: usize,
    pub text: String,
}

pub struct Scanner<R> {
    reader: R,
    line_no: usize,
}

impl Scanner<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> Scanner<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, line_no: 0 }
    }

    /// Next logical line, or `""` once the input is exhausted.
    pub fn next_line(&mut self) -> io::Result<String> {
        Ok(self.next_logical()?.map(|l| l.text).unwrap_or_default())
    }

    fn next_logical(&mut self) -> io::Result<Option<Line>> {
        loop {
            let Some(first) = self.read_physical()? else {
                return Ok(None);
            };
            let number = self.line_no;
            let lead = first.trim_start();
            if lead.is_empty() || lead.starts_with('#') {
                continue;
            }

            let mut text = String::new();
            let mut current = first;
            while ends_with_continuation(&current) {
                current.pop();
                text.push_str(&current);
                match self.read_physical()? {
                    Some(next) => current = next,
                    None => {
                        current.clear();
                        break;
                    }
                }
            }
            text.push_str(&current);

            let text = text.trim();
            if !text.is_empty() {
                return Ok(Some(Line {
                    number,
                    text: text.to_string(),
                }));
            }
        }
    }

    /// One physical line without its terminator (`\n` or `\r\n`).
    fn read_physical(&mut self) -> io::Result<Option<String>> {
        let mut buf = String::new();
        if self.reader.read_line(&mut buf)? == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        if buf.ends_with('\n') {
            buf.pop();
            if buf.ends_with('\r') {
                buf.pop();
            }
        }
        Ok(Some(buf))
    }
}

impl<R: BufRead + Seek> Scanner<R> {
    /// Restart from the beginning of the source.
    pub fn rewind(&mut self) -> io::Result<()> {
        self.reader.rewind()?;
        self.line_no = 0;
        Ok(())
    }
}

impl<R: BufRead> Iterator for Scanner<R> {
    type Item = io::Result<Line>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_logical().transpose()
    }
}

fn ends_with_continuation(line: &str) -> bool {
    let trailing = line.bytes().rev().take_while(|b| *b == b'\\').count();
    trailing % 2 == 1
}
