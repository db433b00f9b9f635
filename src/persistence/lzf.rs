//! LZF decompression for compressed RDB strings.
//!
//! Only decompression is implemented: the snapshot writer never
//! compresses, but real Redis dumps routinely carry LZF-encoded
//! values that the reader must accept.
//!
//! The format is a sequence of chunks selected by a control byte:
//! values below 32 are a literal run of `ctrl + 1` bytes; anything
//! else is a back-reference of `(ctrl >> 5) + 2` bytes (with an extra
//! length byte when the 3-bit length saturates) at an offset built
//! from the low 5 bits and the following byte.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LzfError {
    #[error("truncated LZF input")]
    Truncated,

    #[error("LZF back-reference out of range")]
    BadReference,

    #[error("LZF output length {got}, expected {expected}")]
    LengthMismatch { got: usize, expected: usize },
}

/// Decompresses `input`, which must expand to exactly `expected_len`
/// bytes.
pub fn decompress(input: &[u8], expected_len: usize) -> Result<Vec<u8>, LzfError> {
    let mut out = Vec::with_capacity(expected_len);
    let mut i = 0usize;

    while i < input.len() {
        let ctrl = input[i] as usize;
        i += 1;

        if ctrl < 32 {
            // Literal run of ctrl + 1 bytes.
            let run = ctrl + 1;
            if i + run > input.len() {
                return Err(LzfError::Truncated);
            }
            out.extend_from_slice(&input[i..i + run]);
            i += run;
        } else {
            // Back-reference.
            let mut len = ctrl >> 5;
            if len == 7 {
                let extra = *input.get(i).ok_or(LzfError::Truncated)? as usize;
                len += extra;
                i += 1;
            }
            let low = *input.get(i).ok_or(LzfError::Truncated)? as usize;
            i += 1;

            let offset = ((ctrl & 0x1f) << 8) | low;
            let start = out
                .len()
                .checked_sub(offset + 1)
                .ok_or(LzfError::BadReference)?;

            // Copies may overlap their own output; go byte by byte.
            for j in 0..len + 2 {
                let byte = out[start + j];
                out.push(byte);
            }
        }
    }

    if out.len() != expected_len {
        return Err(LzfError::LengthMismatch {
            got: out.len(),
            expected: expected_len,
        });
    }
    Ok(out)
}
