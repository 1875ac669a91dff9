//! Text record decompression for Mobipocket books: PalmDOC LZ77 and
//! HUFF/CDIC.

use crate::error::{EbookError, Result};

const MAX_PHRASE_DEPTH: usize = 32;

/// Decodes one PalmDOC LZ77 record.
///
/// - `0x01..=0x08`: copy that many following bytes verbatim
/// - `0x00`, `0x09..=0x7F`: literal byte
/// - `0x80..=0xBF`: back-reference, 11 bits distance and 3 bits length
/// - `0xC0..=0xFF`: a space followed by `byte ^ 0x80`
pub fn palmdoc_decompress(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len() * 2);
    let mut i = 0;

    while i < input.len() {
        let byte = input[i];
        i += 1;

        match byte {
            0x01..=0x08 => {
                let end = (i + usize::from(byte)).min(input.len());
                output.extend_from_slice(&input[i..end]);
                i = end;
            }
            0x00 | 0x09..=0x7F => output.push(byte),
            0xC0..=0xFF => {
                output.push(b' ');
                output.push(byte ^ 0x80);
            }
            0x80..=0xBF => {
                let Some(&next) = input.get(i) else {
                    break;
                };
                i += 1;

                let pair = u16::from_be_bytes([byte, next]);
                let distance = usize::from((pair & 0x3FFF) >> 3);
                let length = usize::from(pair & 0x07) + 3;
                if distance == 0 || distance > output.len() {
                    continue;
                }
                for _ in 0..length {
                    output.push(output[output.len() - distance]);
                }
            }
        }
    }

    output
}

enum Phrase {
    Literal(Vec<u8>),
    /// Still Huffman-coded; expanded on first use.
    Packed(Vec<u8>),
}

/// Huffman decoder built from a HUFF record and its CDIC phrase records.
pub struct HuffCdic {
    /// Indexed by the top byte of a code: (code length, terminal, max code).
    dict1: Vec<(u8, bool, u32)>,
    mincode: Vec<u32>,
    maxcode: Vec<u32>,
    phrases: Vec<Phrase>,
}

impl HuffCdic {
    pub fn new(huff: &[u8], cdics: &[&[u8]]) -> Result<Self> {
        let mut decoder = Self {
            dict1: Vec::with_capacity(256),
            mincode: Vec::with_capacity(33),
            maxcode: Vec::with_capacity(33),
            phrases: Vec::new(),
        };

        decoder.load_huff(huff)?;
        for cdic in cdics {
            decoder.load_cdic(cdic)?;
        }
        Ok(decoder)
    }

    fn load_huff(&mut self, huff: &[u8]) -> Result<()> {
        if huff.len() < 24 || &huff[0..8] != b"HUFF\x00\x00\x00\x18" {
            return Err(invalid("bad HUFF record header"));
        }

        let off1 = be_u32(huff, 8) as usize;
        let off2 = be_u32(huff, 12) as usize;
        if huff.len() < off1 + 256 * 4 || huff.len() < off2 + 64 * 4 {
            return Err(invalid("truncated HUFF tables"));
        }

        for entry in 0..256 {
            let value = be_u32(huff, off1 + entry * 4);
            let codelen = (value & 0x1F) as u8;
            let terminal = value & 0x80 != 0;
            let maxcode = if codelen > 0 {
                ((value >> 8).wrapping_add(1) << (32 - u32::from(codelen))).wrapping_sub(1)
            } else {
                0
            };
            self.dict1.push((codelen, terminal, maxcode));
        }

        self.mincode.push(0);
        self.maxcode.push(0);
        for idx in 0..32u32 {
            let pos = off2 + idx as usize * 8;
            let shift = 32 - (idx + 1);
            self.mincode.push(be_u32(huff, pos) << shift);
            self.maxcode
                .push((be_u32(huff, pos + 4).wrapping_add(1) << shift).wrapping_sub(1));
        }

        Ok(())
    }

    fn load_cdic(&mut self, cdic: &[u8]) -> Result<()> {
        if cdic.len() < 16 || &cdic[0..8] != b"CDIC\x00\x00\x00\x10" {
            return Err(invalid("bad CDIC record header"));
        }

        let phrase_count = be_u32(cdic, 8) as usize;
        let bits = be_u32(cdic, 12);
        let per_record = 1usize.checked_shl(bits).unwrap_or(usize::MAX);
        let count = per_record.min(phrase_count.saturating_sub(self.phrases.len()));
        if cdic.len() < 16 + count * 2 {
            return Err(invalid("truncated CDIC offset table"));
        }

        for idx in 0..count {
            let offset = 16 + usize::from(be_u16(cdic, 16 + idx * 2));
            if offset + 2 > cdic.len() {
                return Err(invalid("CDIC phrase out of bounds"));
            }

            let header = be_u16(cdic, offset);
            let start = offset + 2;
            let end = (start + usize::from(header & 0x7FFF)).min(cdic.len());
            let bytes = cdic[start..end].to_vec();

            self.phrases.push(if header & 0x8000 != 0 {
                Phrase::Literal(bytes)
            } else {
                Phrase::Packed(bytes)
            });
        }

        Ok(())
    }

    pub fn decompress(&mut self, record: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        self.unpack(record, &mut output, 0)?;
        Ok(output)
    }

    fn unpack(&mut self, data: &[u8], output: &mut Vec<u8>, depth: usize) -> Result<()> {
        if depth > MAX_PHRASE_DEPTH {
            return Err(invalid("CDIC phrases nest too deeply"));
        }

        let mut padded = data.to_vec();
        padded.extend_from_slice(&[0u8; 8]);

        let mut bits_left = data.len() as i64 * 8;
        let mut pos = 0usize;
        let mut window = be_u64(&padded, pos);
        let mut n: i32 = 32;

        while bits_left > 0 {
            if n <= 0 {
                pos += 4;
                window = be_u64(&padded, pos);
                n += 32;
            }

            let code = ((window >> n) & 0xFFFF_FFFF) as u32;
            let (mut codelen, terminal, mut maxcode) = self.dict1[(code >> 24) as usize];
            if !terminal {
                while codelen < 32 && code < self.mincode[usize::from(codelen)] {
                    codelen += 1;
                }
                maxcode = self.maxcode[usize::from(codelen)];
            }
            if codelen == 0 {
                return Err(invalid("zero-length Huffman code"));
            }

            n -= i32::from(codelen);
            bits_left -= i64::from(codelen);
            if bits_left < 0 {
                break;
            }

            let index = (maxcode.wrapping_sub(code) >> (32 - u32::from(codelen))) as usize;
            match self.phrases.get(index) {
                Some(Phrase::Literal(bytes)) => output.extend_from_slice(bytes),
                Some(Phrase::Packed(bytes)) => {
                    let packed = bytes.clone();
                    let mut expanded = Vec::new();
                    self.unpack(&packed, &mut expanded, depth + 1)?;
                    output.extend_from_slice(&expanded);
                    self.phrases[index] = Phrase::Literal(expanded);
                }
                None => {
                    return Err(invalid(&format!(
                        "phrase {} out of range ({} phrases)",
                        index,
                        self.phrases.len()
                    )))
                }
            }
        }

        Ok(())
    }
}

fn invalid(reason: &str) -> EbookError {
    EbookError::InvalidContainer {
        reason: reason.to_string(),
    }
}

/// Callers check bounds first.
fn be_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn be_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn be_u64(data: &[u8], at: usize) -> u64 {
    data.get(at..at + 8)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}
