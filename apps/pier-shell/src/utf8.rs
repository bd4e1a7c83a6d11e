/// Turns a byte stream into UTF-8 text, holding back a multi-byte sequence
/// that was split across reads until the rest of it arrives. Bytes that can
/// never form valid UTF-8 become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more.
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is held back, lossily.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_emoji_is_carried() {
        let bytes = "ok 🚢!".as_bytes();
        let mut carry = Utf8Carry::default();
        let mut out = String::new();
        for chunk in bytes.chunks(1) {
            out.push_str(&carry.push(chunk));
        }
        assert_eq!(out, "ok 🚢!");
        assert_eq!(carry.pending(), 0);
    }

    #[test]
    fn held_back_bytes_wait_for_the_rest() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.push(&[b'a', 0xE2, 0x82]), "a");
        assert_eq!(carry.pending(), 2);
        assert_eq!(carry.push(&[0xAC, b'b']), "€b");
    }

    #[test]
    fn invalid_bytes_are_replaced_and_scanning_continues() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.push(&[b'x', 0xFF, b'y']), "x\u{FFFD}y");
    }

    #[test]
    fn finish_flushes_a_truncated_tail() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.push(&[0xF0, 0x9F]), "");
        assert_eq!(carry.finish(), "\u{FFFD}");
        assert_eq!(carry.pending(), 0);
    }
}
