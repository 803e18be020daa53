//! Little-endian byte encoding helpers for the log serializer.
//!
//! All multi-byte integers in the on-disk log format are little-endian.
//! Readers are parse-and-advance: they return the decoded value together
//! with the remaining input, or `None` on short input.

#[inline]
pub fn append_u16_le(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn append_u32_le(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn append_u64_le(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn append_i64_le(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

#[inline]
#[must_use]
pub fn read_u16_le(input: &[u8]) -> Option<(u16, &[u8])> {
    let (head, rest) = input.split_first_chunk::<2>()?;
    Some((u16::from_le_bytes(*head), rest))
}

#[inline]
#[must_use]
pub fn read_u32_le(input: &[u8]) -> Option<(u32, &[u8])> {
    let (head, rest) = input.split_first_chunk::<4>()?;
    Some((u32::from_le_bytes(*head), rest))
}

#[inline]
#[must_use]
pub fn read_u64_le(input: &[u8]) -> Option<(u64, &[u8])> {
    let (head, rest) = input.split_first_chunk::<8>()?;
    Some((u64::from_le_bytes(*head), rest))
}

#[inline]
#[must_use]
pub fn read_i64_le(input: &[u8]) -> Option<(i64, &[u8])> {
    let (head, rest) = input.split_first_chunk::<8>()?;
    Some((i64::from_le_bytes(*head), rest))
}
