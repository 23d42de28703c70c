/// A single satisfiable byte range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
    /// `bytes=N-`: the client left the end to the server.
    pub open_ended: bool,
}

impl RangeSpec {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// Not a single `bytes=` range we understand; callers ignore the header.
    Invalid,
    /// Well formed, but no byte of the resource falls inside it.
    Unsatisfiable,
}

/// Parses a single-range `Range` header against a resource of `size` bytes,
/// clamping the end to the last byte.
pub fn parse_range(header: &str, size: u64) -> Result<RangeSpec, RangeError> {
    let range = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or(RangeError::Invalid)?
        .trim();
    if range.is_empty() || range.contains(',') {
        return Err(RangeError::Invalid);
    }
    let (start_str, end_str) = range.split_once('-').ok_or(RangeError::Invalid)?;
    let start_str = start_str.trim();
    let end_str = end_str.trim();

    if start_str.is_empty() {
        // suffix range: bytes=-N
        let suffix: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
        if suffix == 0 || size == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        return Ok(RangeSpec {
            start: size.saturating_sub(suffix),
            end: size - 1,
            open_ended: false,
        });
    }

    let start: u64 = start_str.parse().map_err(|_| RangeError::Invalid)?;
    let explicit_end = if end_str.is_empty() {
        None
    } else {
        Some(end_str.parse::<u64>().map_err(|_| RangeError::Invalid)?)
    };
    if let Some(end) = explicit_end {
        if end < start {
            return Err(RangeError::Invalid);
        }
    }
    if start >= size {
        return Err(RangeError::Unsatisfiable);
    }

    let last = size - 1;
    Ok(RangeSpec {
        start,
        end: explicit_end.map(|end| end.min(last)).unwrap_or(last),
        open_ended: explicit_end.is_none(),
    })
}

pub fn build_content_range(start: u64, end: u64, size: u64) -> String {
    format!("bytes {}-{}/{}", start, end, size)
}

pub fn unsatisfied_content_range(size: u64) -> String {
    format!("bytes */{}", size)
}
