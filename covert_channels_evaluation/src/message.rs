use bit_field::BitField;
use rand::Rng;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Upper bound on a message, in bits.
pub const MAX_MSG_SIZE: usize = 1 << 16;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("failed to read message: {0}")]
    Io(#[from] std::io::Error),
    #[error("byte {byte:#04x} at position {position} is not '0' or '1'")]
    InvalidBit { position: usize, byte: u8 },
    #[error("message has {len} bits, at most {max} are allowed")]
    TooLong { len: usize, max: usize },
}

/// A pre-serialized bit string, one ASCII character per bit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitMessage {
    bits: Vec<bool>,
}

impl BitMessage {
    pub fn new(bits: Vec<bool>) -> Self {
        BitMessage { bits }
    }

    pub fn parse(text: &[u8], max_bits: usize) -> Result<Self, MessageError> {
        let text = text
            .strip_suffix(b"\r\n")
            .or_else(|| text.strip_suffix(b"\n"))
            .unwrap_or(text);
        if text.len() > max_bits {
            return Err(MessageError::TooLong {
                len: text.len(),
                max: max_bits,
            });
        }
        let bits = text
            .iter()
            .enumerate()
            .map(|(position, &byte)| match byte {
                b'0' => Ok(false),
                b'1' => Ok(true),
                byte => Err(MessageError::InvalidBit { position, byte }),
            })
            .collect::<Result<Vec<bool>, MessageError>>()?;
        Ok(BitMessage { bits })
    }

    pub fn load(path: impl AsRef<Path>, max_bits: usize) -> Result<Self, MessageError> {
        let text = std::fs::read(path)?;
        Self::parse(&text, max_bits)
    }

    /// Arbitrary file contents, eight bits per byte.
    pub fn load_raw(path: impl AsRef<Path>, max_bits: usize) -> Result<Self, MessageError> {
        let bytes = std::fs::read(path)?;
        let len = bytes.len().saturating_mul(u8::BIT_LENGTH);
        if len > max_bits {
            return Err(MessageError::TooLong { len, max: max_bits });
        }
        Ok(Self::from_bytes(&bytes))
    }

    pub fn random(len: usize) -> Self {
        let mut rng = rand::thread_rng();
        BitMessage {
            bits: (0..len).map(|_| rng.gen_bool(0.5)).collect(),
        }
    }

    /// Most significant bit first.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut bits = Vec::with_capacity(bytes.len() * u8::BIT_LENGTH);
        for byte in bytes {
            for i in (0..u8::BIT_LENGTH).rev() {
                bits.push(byte.get_bit(i));
            }
        }
        BitMessage { bits }
    }

    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

impl fmt::Display for BitMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bit in self.bits.iter() {
            f.write_str(if *bit { "1" } else { "0" })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ascii_bits() {
        let m = BitMessage::parse(b"1011", MAX_MSG_SIZE).unwrap();
        assert_eq!(m.bits(), &[true, false, true, true]);
        assert_eq!(m.to_string(), "1011");
    }

    #[test]
    fn trailing_newline_is_ignored() {
        assert_eq!(BitMessage::parse(b"01\n", MAX_MSG_SIZE).unwrap().len(), 2);
        assert_eq!(BitMessage::parse(b"01\r\n", MAX_MSG_SIZE).unwrap().len(), 2);
    }

    #[test]
    fn rejects_other_characters() {
        match BitMessage::parse(b"10a1", MAX_MSG_SIZE) {
            Err(MessageError::InvalidBit { position, byte }) => {
                assert_eq!(position, 2);
                assert_eq!(byte, b'a');
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(BitMessage::parse(b"1\n1", MAX_MSG_SIZE).is_err());
    }

    #[test]
    fn enforces_maximum_size() {
        assert!(BitMessage::parse(b"1111", 4).is_ok());
        assert!(matches!(
            BitMessage::parse(b"11111", 4),
            Err(MessageError::TooLong { len: 5, max: 4 })
        ));
    }

    #[test]
    fn empty_file_is_empty_message() {
        assert!(BitMessage::parse(b"", MAX_MSG_SIZE).unwrap().is_empty());
    }

    #[test]
    fn bytes_are_msb_first() {
        let m = BitMessage::from_bytes(&[0x55, 0x0f]);
        assert_eq!(m.to_string(), "0101010100001111");
    }

    #[test]
    fn raw_file_is_serialized_bytewise() {
        let path = std::env::temp_dir().join(format!("message_raw_{}.bin", std::process::id()));
        std::fs::write(&path, b"Hi").unwrap();
        let m = BitMessage::load_raw(&path, MAX_MSG_SIZE).unwrap();
        let too_long = BitMessage::load_raw(&path, 15);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(m.to_string(), "0100100001101001");
        assert!(matches!(
            too_long,
            Err(MessageError::TooLong { len: 16, max: 15 })
        ));
    }

    #[test]
    fn random_message_has_requested_length() {
        assert_eq!(BitMessage::random(333).len(), 333);
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("message_{}.txt", std::process::id()));
        std::fs::write(&path, "0110\n").unwrap();
        let m = BitMessage::load(&path, MAX_MSG_SIZE).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(m.to_string(), "0110");
    }
}
