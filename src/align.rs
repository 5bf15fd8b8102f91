//! Byte-alignment helpers.
//!
//! Padding is transport framing only. It is counted when sizing reads and
//! expected frame lengths, never in a header's `payload_len`.

/// Round `len` up to the next multiple of `align`.
///
/// Already-aligned lengths are returned unchanged. `align` must be non-zero;
/// [`crate::config::Config::validate`] rejects a zero alignment and any
/// alignment that pads a Stage-B message past one datagram.
pub fn aligned_len(align: usize, len: usize) -> usize {
    len + (align - len % align) % align
}

/// Number of padding bytes needed after `len` bytes.
pub fn padding(align: usize, len: usize) -> usize {
    aligned_len(align, len) - len
}

/// Copy `bytes` and append zero bytes up to the next `align` boundary.
pub fn pad(align: usize, bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(aligned_len(align, bytes.len()));
    out.extend_from_slice(bytes);
    out.resize(aligned_len(align, bytes.len()), 0);
    out
}

/// Drop the alignment tail from a padded payload, keeping `declared` bytes.
///
/// Returns `None` when `padded` is shorter than `declared`.
pub fn strip(padded: &[u8], declared: usize) -> Option<&[u8]> {
    padded.get(..declared)
}
