/// Streaming LF to CRLF conversion
///
/// Existing CRLF pairs pass through unchanged, also when a chunk boundary
/// falls between the CR and the LF.
#[derive(Debug, Default)]
pub(crate) struct CrlfNormalizer {
    last_cr: bool,
}

impl CrlfNormalizer {
    pub(crate) fn push(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.reserve(input.len());
        for &byte in input {
            if byte == b'\n' && !self.last_cr {
                out.push(b'\r');
            }
            out.push(byte);
            self.last_cr = byte == b'\r';
        }
    }
}
