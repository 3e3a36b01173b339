//! Chunk accumulation and final decoding of captured child output.
//!
//! Chunks are stored as raw bytes and measured by their encoded length, so
//! the byte cap applies to what the child actually wrote, not to a decoded
//! character count. Decoding into text happens once, on the concatenated
//! bytes, when the accumulator is finalized.

use std::borrow::Cow;
use std::sync::{Mutex, OnceLock, PoisonError};

use serde::Serialize;

/// Text encodings recognized for decoding captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
    Latin1,
    /// Each byte masked to its low 7 bits.
    Ascii,
    /// Lowercase hexadecimal digits, two per byte.
    Hex,
}

/// How captured output is returned: decoded text or raw bytes.
///
/// Chosen once when the request is built. `"buffer"`, a missing label, and
/// any label that is not a recognized text encoding all select `Buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    Text(TextEncoding),
    #[default]
    Buffer,
}

impl Encoding {
    /// Map an encoding label to an `Encoding`, falling back to raw bytes.
    pub fn from_label(label: Option<&str>) -> Self {
        let Some(label) = label else {
            return Encoding::Buffer;
        };
        let text = match label.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => TextEncoding::Utf8,
            "utf16le" | "utf-16le" | "ucs2" | "ucs-2" => TextEncoding::Utf16Le,
            "latin1" | "binary" => TextEncoding::Latin1,
            "ascii" => TextEncoding::Ascii,
            "hex" => TextEncoding::Hex,
            _ => return Encoding::Buffer,
        };
        Encoding::Text(text)
    }
}

/// Finalized output of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Output {
    Text(String),
    Bytes(Vec<u8>),
}

impl Output {
    /// An empty value of the variant selected by `encoding`.
    pub fn empty(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Text(_) => Output::Text(String::new()),
            Encoding::Buffer => Output::Bytes(Vec::new()),
        }
    }

    /// Length in bytes of the finalized value.
    pub fn len(&self) -> usize {
        match self {
            Output::Text(s) => s.len(),
            Output::Bytes(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text view of the output; raw bytes are decoded as lossy UTF-8.
    pub fn to_text_lossy(&self) -> Cow<'_, str> {
        match self {
            Output::Text(s) => Cow::Borrowed(s.as_str()),
            Output::Bytes(b) => String::from_utf8_lossy(b),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Output::Text(s) => Some(s),
            Output::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Output::Text(_) => None,
            Output::Bytes(b) => Some(b),
        }
    }
}

/// Ordered chunks of one stream plus a running byte counter.
#[derive(Debug, Clone)]
pub struct ChunkAccumulator {
    chunks: Vec<Vec<u8>>,
    byte_len: usize,
    encoding: Encoding,
}

impl ChunkAccumulator {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            chunks: Vec::new(),
            byte_len: 0,
            encoding,
        }
    }

    pub fn append(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.byte_len += chunk.len();
        self.chunks.push(chunk.to_vec());
    }

    /// Total encoded bytes appended so far.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Merge the chunks into the final value.
    pub fn finalize(self) -> Output {
        let bytes = self.chunks.concat();
        match self.encoding {
            Encoding::Buffer => Output::Bytes(bytes),
            Encoding::Text(text) => Output::Text(decode(text, &bytes)),
        }
    }
}

fn decode(encoding: TextEncoding, bytes: &[u8]) -> String {
    match encoding {
        TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        TextEncoding::Utf16Le => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        TextEncoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        TextEncoding::Ascii => bytes.iter().map(|&b| char::from(b & 0x7f)).collect(),
        TextEncoding::Hex => hex::encode(bytes),
    }
}

/// Output of one stream whose merge is deferred until first read.
///
/// Results are often discarded unread (e.g. when only the exit status
/// matters), so the concatenation and decoding run only on demand.
#[derive(Debug)]
pub struct LazyOutput {
    pending: Mutex<Option<ChunkAccumulator>>,
    value: OnceLock<Output>,
    encoding: Encoding,
}

impl LazyOutput {
    pub fn new(chunks: ChunkAccumulator) -> Self {
        let encoding = chunks.encoding();
        Self {
            pending: Mutex::new(Some(chunks)),
            value: OnceLock::new(),
            encoding,
        }
    }

    /// Output for a stream that was never captured.
    pub fn empty(encoding: Encoding) -> Self {
        Self::new(ChunkAccumulator::new(encoding))
    }

    pub fn get(&self) -> &Output {
        self.value.get_or_init(|| {
            let pending = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match pending {
                Some(chunks) => chunks.finalize(),
                None => Output::empty(self.encoding),
            }
        })
    }

    pub fn is_finalized(&self) -> bool {
        self.value.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_map_to_text_encodings() {
        assert_eq!(
            Encoding::from_label(Some("utf8")),
            Encoding::Text(TextEncoding::Utf8)
        );
        assert_eq!(
            Encoding::from_label(Some("UTF-8")),
            Encoding::Text(TextEncoding::Utf8)
        );
        assert_eq!(
            Encoding::from_label(Some("ucs2")),
            Encoding::Text(TextEncoding::Utf16Le)
        );
        assert_eq!(
            Encoding::from_label(Some("binary")),
            Encoding::Text(TextEncoding::Latin1)
        );
        assert_eq!(
            Encoding::from_label(Some("hex")),
            Encoding::Text(TextEncoding::Hex)
        );
    }

    #[test]
    fn buffer_missing_and_unknown_labels_fall_back_to_bytes() {
        assert_eq!(Encoding::from_label(Some("buffer")), Encoding::Buffer);
        assert_eq!(Encoding::from_label(None), Encoding::Buffer);
        assert_eq!(Encoding::from_label(Some("klingon")), Encoding::Buffer);
        assert_eq!(Encoding::from_label(Some("base64")), Encoding::Buffer);
    }

    #[test]
    fn finalize_concatenates_in_arrival_order() {
        let mut acc = ChunkAccumulator::new(Encoding::Text(TextEncoding::Utf8));
        acc.append(b"hello ");
        acc.append(b"");
        acc.append(b"world");
        assert_eq!(acc.byte_len(), 11);
        assert_eq!(acc.finalize(), Output::Text("hello world".into()));
    }

    #[test]
    fn buffer_encoding_returns_raw_bytes() {
        let mut acc = ChunkAccumulator::new(Encoding::Buffer);
        acc.append(&[0xc3]);
        acc.append(&[0xa8, 0x00]);
        assert_eq!(acc.finalize(), Output::Bytes(vec![0xc3, 0xa8, 0x00]));
    }

    #[test]
    fn multibyte_sequence_split_across_chunks_decodes_whole() {
        let mut acc = ChunkAccumulator::new(Encoding::Text(TextEncoding::Utf8));
        acc.append(&[b'S', b't', 0xc3]);
        acc.append(&[0xb6, b'r']);
        assert_eq!(acc.byte_len(), 5);
        assert_eq!(acc.finalize(), Output::Text("Stör".into()));
    }

    #[test]
    fn truncated_utf8_is_replaced() {
        let mut acc = ChunkAccumulator::new(Encoding::Text(TextEncoding::Utf8));
        acc.append(&[b'a', 0xc3]);
        assert_eq!(acc.finalize(), Output::Text("a\u{fffd}".into()));
    }

    #[test]
    fn ascii_masks_high_bit() {
        let mut acc = ChunkAccumulator::new(Encoding::Text(TextEncoding::Ascii));
        acc.append("mc²".as_bytes());
        assert_eq!(acc.finalize(), Output::Text("mcB2".into()));
    }

    #[test]
    fn latin1_maps_bytes_to_code_points() {
        let mut acc = ChunkAccumulator::new(Encoding::Text(TextEncoding::Latin1));
        acc.append(&[b'a', 0xe8]);
        assert_eq!(acc.finalize(), Output::Text("aè".into()));
    }

    #[test]
    fn hex_and_utf16_decode() {
        let mut acc = ChunkAccumulator::new(Encoding::Text(TextEncoding::Hex));
        acc.append(&[0x0f, 0xa0]);
        assert_eq!(acc.finalize(), Output::Text("0fa0".into()));

        let mut acc = ChunkAccumulator::new(Encoding::Text(TextEncoding::Utf16Le));
        acc.append(&[b'h', 0, b'i']);
        acc.append(&[0]);
        assert_eq!(acc.finalize(), Output::Text("hi".into()));
    }

    #[test]
    fn lazy_output_finalizes_on_first_read_only() {
        let mut acc = ChunkAccumulator::new(Encoding::Text(TextEncoding::Utf8));
        acc.append(b"out");
        let lazy = LazyOutput::new(acc);
        assert!(!lazy.is_finalized());
        assert_eq!(lazy.get(), &Output::Text("out".into()));
        assert!(lazy.is_finalized());
        assert_eq!(lazy.get().len(), 3);
    }

    #[test]
    fn empty_output_keeps_encoding_variant() {
        let text = Encoding::Text(TextEncoding::Utf8);
        assert_eq!(LazyOutput::empty(text).get(), &Output::Text(String::new()));
        assert_eq!(
            LazyOutput::empty(Encoding::Buffer).get(),
            &Output::Bytes(Vec::new())
        );
    }

    #[test]
    fn output_serializes_as_string_or_byte_array() {
        let text = serde_json::to_string(&Output::Text("x".into())).unwrap();
        assert_eq!(text, "\"x\"");
        let bytes = serde_json::to_string(&Output::Bytes(vec![1, 2])).unwrap();
        assert_eq!(bytes, "[1,2]");
    }
}
