//! Text-format counter parsing.
//!
//! Sums every series of a single counter from a metrics response body. The
//! scanner only ever inspects lines that start with the counter name and
//! skips everything else, including over-long lines that exceed the line
//! buffer. Payloads from busy apiservers run to megabytes, so the scanner
//! works on a bounded buffer and never holds more than one line.

use std::io::BufRead;

use crate::error::ParseError;

/// Counter summed from upstream apiserver responses.
pub const DEFAULT_COUNTER_NAME: &str = "apiserver_request_total";

/// Longest line the scanner buffers. Longer lines are discarded whole.
const MAX_LINE_LEN: usize = 4096;

enum Line {
    Eof,
    Full,
    /// The line exceeded [`MAX_LINE_LEN`] and was discarded, including any
    /// continuation up to the next newline.
    TooLong,
}

/// Reads one CR/LF-delimited line into `buf`.
fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Line> {
    buf.clear();
    let mut too_long = false;
    loop {
        let (consumed, at_boundary) = {
            let available = reader.fill_buf()?;
            if available.is_empty() {
                (0, true)
            } else if let Some(pos) = available.iter().position(|&b| b == b'\n') {
                if !too_long && buf.len() + pos <= MAX_LINE_LEN {
                    buf.extend_from_slice(&available[..pos]);
                } else {
                    too_long = true;
                }
                (pos + 1, true)
            } else {
                if !too_long && buf.len() + available.len() <= MAX_LINE_LEN {
                    buf.extend_from_slice(available);
                } else {
                    too_long = true;
                }
                (available.len(), false)
            }
        };
        reader.consume(consumed);
        if at_boundary {
            if too_long {
                return Ok(Line::TooLong);
            }
            if consumed == 0 && buf.is_empty() {
                return Ok(Line::Eof);
            }
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            return Ok(Line::Full);
        }
    }
}

/// Sums every series of `counter_name` in the metrics text from `reader`.
///
/// Returns [`ParseError::NoCountersFound`] when the stream holds no series
/// with that name. Lines that do not start with the counter name (after
/// optional ASCII whitespace) are ignored, whatever their content.
pub fn sum_counter<R: BufRead>(mut reader: R, counter_name: &str) -> Result<i64, ParseError> {
    let name = counter_name.as_bytes();
    let mut total: i64 = 0;
    let mut found = false;
    let mut buf = Vec::with_capacity(256);

    loop {
        match read_line(&mut reader, &mut buf)? {
            Line::Eof => break,
            Line::TooLong => continue, // never of interest
            Line::Full => {}
        }

        let line = skip_space(&buf);
        if !line.starts_with(name) {
            // One of the other metrics, or a comment.
            continue;
        }

        total = total.saturating_add(parse_line(line, name.len())?);
        found = true;
    }

    if !found {
        return Err(ParseError::NoCountersFound {
            counter: counter_name.to_owned(),
        });
    }
    Ok(total)
}

/// Parses the value of one series line. `line` starts with the counter name;
/// `name_len` is its length.
///
/// Sample line:
/// `apiserver_request_total{code="200",resource="configmaps",verb="LIST"} 15`
fn parse_line(line: &[u8], name_len: usize) -> Result<i64, ParseError> {
    let malformed = || ParseError::Malformed {
        line: String::from_utf8_lossy(line).into_owned(),
    };

    if line.contains(&0) {
        return Err(malformed());
    }

    let mut rest = &line[name_len..];
    if rest.is_empty() {
        return Err(malformed());
    }

    // Optional labels block. Only brace-matched, content uninterpreted.
    rest = skip_space(rest);
    if rest.first() == Some(&b'{') {
        match rest.iter().position(|&b| b == b'}') {
            Some(close) => rest = &rest[close + 1..],
            None => return Err(malformed()),
        }
    }

    // Value section: up to the next whitespace or end of line.
    rest = skip_space(rest);
    if rest.is_empty() {
        return Err(malformed());
    }
    let end = rest
        .iter()
        .position(|&b| b == b' ' || b == b'\t')
        .unwrap_or(rest.len());
    let value = std::str::from_utf8(&rest[..end]).map_err(|_| malformed())?;

    if value.contains(['e', 'E']) {
        // Large counters come in scientific notation, e.g. 1.234567e+06.
        // The f64 significand is 53 bits, enough to carry a request count.
        let float: f64 = value.parse().map_err(|_| malformed())?;
        if !float.is_finite() || float < i64::MIN as f64 || float > i64::MAX as f64 {
            return Err(malformed());
        }
        Ok(float as i64)
    } else {
        value.parse::<i64>().map_err(|_| malformed())
    }
}

fn skip_space(mut bytes: &[u8]) -> &[u8] {
    while let Some((b' ' | b'\t', rest)) = bytes.split_first() {
        bytes = rest;
    }
    bytes
}
