//! Constant-time comparison of shared secrets.

use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};

/// Compare a client-supplied secret against the expected one.
///
/// The work done depends only on the length of `expected`: the length check
/// and the byte-wise content check are both evaluated unconditionally and
/// merged with a constant-time select, so a length mismatch and a content
/// mismatch are indistinguishable by timing. Functionally identical to
/// `expected == provided`.
pub fn constant_time_eq(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();

    let len_eq = (expected.len() as u64).ct_eq(&(provided.len() as u64));

    let mut content_eq = Choice::from(1u8);
    for (i, byte) in expected.iter().enumerate() {
        // Past the end of `provided` compare against a fixed byte; the
        // length check already rules the result out in that case.
        let other = provided.get(i).copied().unwrap_or(0);
        content_eq &= byte.ct_eq(&other);
    }

    u8::conditional_select(&0, &content_eq.unwrap_u8(), len_eq) == 1
}
