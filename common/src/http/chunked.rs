use super::error::HttpClientError;

const MAX_LINE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data { remaining: usize },
    DataEnd,
    Trailers,
    Done,
}

/// Incremental decoder for `Transfer-Encoding: chunked` bodies.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
    line: Vec<u8>,
    total: usize,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Size,
            line: Vec::new(),
            total: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Body bytes decoded so far.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Decodes as much of `input` as possible into `body` and returns the bytes consumed.
    /// Anything after the final chunk and its trailers is left unconsumed.
    pub fn feed(&mut self, input: &[u8], body: &mut Vec<u8>) -> Result<usize, HttpClientError> {
        let mut pos = 0;
        while pos < input.len() && self.state != State::Done {
            match self.state {
                State::Data { remaining } => {
                    let take = remaining.min(input.len() - pos);
                    body.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    self.total += take;
                    self.state = if take == remaining {
                        State::DataEnd
                    } else {
                        State::Data {
                            remaining: remaining - take,
                        }
                    };
                }
                State::Size | State::DataEnd | State::Trailers => {
                    let Some(line) = self.next_line(input, &mut pos)? else {
                        break;
                    };
                    self.state = match self.state {
                        State::Size => match parse_size(&line)? {
                            0 => State::Trailers,
                            size => State::Data { remaining: size },
                        },
                        State::DataEnd if line.is_empty() => State::Size,
                        State::DataEnd => return Err(HttpClientError::MalformedChunk),
                        _ if line.is_empty() => State::Done,
                        other => other,
                    };
                }
                State::Done => {}
            }
        }
        Ok(pos)
    }

    /// Checks the decoded size against a Content-Length sent alongside the chunks.
    pub fn finish(&self, content_length: Option<usize>) -> Result<usize, HttpClientError> {
        match content_length {
            Some(expected) if expected != self.total => Err(HttpClientError::StreamWrite),
            _ => Ok(self.total),
        }
    }

    /// Collects one line without its terminator, or `None` when it is still incomplete.
    fn next_line(
        &mut self,
        input: &[u8],
        pos: &mut usize,
    ) -> Result<Option<Vec<u8>>, HttpClientError> {
        while *pos < input.len() {
            let byte = input[*pos];
            *pos += 1;
            if byte == b'\n' {
                let mut line = std::mem::take(&mut self.line);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(line));
            }
            if self.line.len() >= MAX_LINE {
                return Err(HttpClientError::MalformedChunk);
            }
            self.line.push(byte);
        }
        Ok(None)
    }
}

fn parse_size(line: &[u8]) -> Result<usize, HttpClientError> {
    let text = std::str::from_utf8(line).map_err(|_| HttpClientError::MalformedChunk)?;
    let digits = text.split(';').next().unwrap_or_default().trim();
    if digits.is_empty() {
        return Err(HttpClientError::MalformedChunk);
    }
    usize::from_str_radix(digits, 16).map_err(|_| HttpClientError::MalformedChunk)
}
