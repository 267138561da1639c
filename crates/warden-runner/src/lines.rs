//! Bounded line splitting for child output streams.
//!
//! Lines are delimited by `\n` and capped at `max_line_bytes`. A line that
//! is exactly at the cap comes out as one ordinary record; anything longer
//! is cut at the cap and flagged truncated, with the remainder continuing
//! as the following record(s). Bytes decode as UTF-8 with replacement.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

pub struct LineReader<R> {
    reader: R,
    max_line_bytes: usize,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            max_line_bytes: max_line_bytes.max(1),
            buf: Vec::new(),
        }
    }

    /// Next logical line, or `None` at end of stream. The boolean marks a
    /// line that was cut at the cap.
    pub async fn next_line(&mut self) -> std::io::Result<Option<(String, bool)>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                // EOF; flush any unterminated tail.
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some((self.take(), false)));
            }

            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    if self.buf.len() + pos <= self.max_line_bytes {
                        self.buf.extend_from_slice(&available[..pos]);
                        self.reader.consume(pos + 1);
                        return Ok(Some((self.take(), false)));
                    }
                    let room = self.max_line_bytes - self.buf.len();
                    self.buf.extend_from_slice(&available[..room]);
                    self.reader.consume(room);
                    return Ok(Some((self.take(), true)));
                }
                None => {
                    let n = available.len();
                    if self.buf.len() + n > self.max_line_bytes {
                        let room = self.max_line_bytes - self.buf.len();
                        self.buf.extend_from_slice(&available[..room]);
                        self.reader.consume(room);
                        return Ok(Some((self.take(), true)));
                    }
                    self.buf.extend_from_slice(available);
                    self.reader.consume(n);
                }
            }
        }
    }

    fn take(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        line
    }
}
