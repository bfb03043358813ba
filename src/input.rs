use std::io::{self, BufRead};

use bstr::ByteSlice;

use crate::error::{PageboundError, Result};

/// Reads records from input, splitting on the specified delimiter
pub struct RecordReader<R> {
    reader: R,
    delimiter: u8,
    buffer: Vec<u8>,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R, delimiter: u8) -> Self {
        Self {
            reader,
            delimiter,
            buffer: Vec::new(),
        }
    }

    /// Read the next record, returning None at EOF
    pub fn read_record(&mut self) -> io::Result<Option<&[u8]>> {
        self.buffer.clear();
        let bytes_read = self.reader.read_until(self.delimiter, &mut self.buffer)?;

        if bytes_read == 0 {
            return Ok(None);
        }

        // Strip delimiter if present at end
        if self.buffer.last() == Some(&self.delimiter) {
            self.buffer.pop();
        }

        Ok(Some(&self.buffer))
    }
}

/// Split one `key<sep>value` line. Blank lines yield `None`.
///
/// Without a separator the value is the last whitespace-separated field and
/// the key is everything before it.
pub fn parse_tuple(line: &[u8], separator: Option<u8>, line_no: usize) -> Result<Option<(String, i64)>> {
    let line = line.trim_end_with(|c| c == '\r');
    if line.trim().is_empty() {
        return Ok(None);
    }

    let invalid = |reason: &str| PageboundError::InvalidInput {
        line: line_no,
        reason: reason.to_string(),
    };

    let split = match separator {
        Some(sep) => line.rfind_byte(sep).map(|at| (&line[..at], &line[at + 1..])),
        None => {
            let line = line.trim();
            line.rfind_byteset(b" \t")
                .map(|at| (line[..at].trim_end(), &line[at + 1..]))
        }
    };
    let (key, value) = split.ok_or_else(|| invalid("expected a key and a value"))?;

    let key = key
        .to_str()
        .map_err(|_| invalid("key is not valid UTF-8"))?;
    let value = value
        .trim()
        .to_str()
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or_else(|| invalid(&format!("value {:?} is not an integer", value.as_bstr())))?;

    Ok(Some((key.to_string(), value)))
}

/// Read every tuple from a reader
pub fn read_tuples<R: BufRead>(reader: R, delimiter: u8, separator: Option<u8>) -> Result<Vec<(String, i64)>> {
    let mut tuples = Vec::new();
    let mut rec_reader = RecordReader::new(reader, delimiter);
    let mut line_no = 0;

    while let Some(record) = rec_reader.read_record()? {
        line_no += 1;
        if let Some(tuple) = parse_tuple(record, separator, line_no)? {
            tuples.push(tuple);
        }
    }

    Ok(tuples)
}
