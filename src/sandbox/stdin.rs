// Splitting host input into ring-sized chunks

/// One ring-sized piece of an input value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputChunk {
    /// Bytes to deliver now.
    pub bytes: Vec<u8>,
    /// Text held back for the next `stdin` request, if any.
    pub remainder: Option<String>,
}

/// Split `value` so the first chunk encodes to at most `limit` bytes without
/// cutting a codepoint in half.
///
/// The cut lands on the last codepoint boundary at or before `limit`; every
/// whole codepoint that fits is sent now and nothing more is held back.
///
/// At least one codepoint is always delivered, so `limit` must be at least 4
/// for a chunk to be guaranteed to fit.
pub fn split_input(value: &str, limit: usize) -> InputChunk {
    if value.len() <= limit {
        return InputChunk {
            bytes: value.as_bytes().to_vec(),
            remainder: None,
        };
    }

    let mut cut = limit;
    while cut > 0 && !value.is_char_boundary(cut) {
        cut -= 1;
    }
    if cut == 0 {
        cut = value.chars().next().map(char::len_utf8).unwrap_or(0);
    }

    let (head, tail) = value.split_at(cut);
    InputChunk {
        bytes: head.as_bytes().to_vec(),
        remainder: (!tail.is_empty()).then(|| tail.to_string()),
    }
}
