//! Per-column compression: chunk statistics, deterministic scheme
//! selection and the encode/decode pair for every scheme.
//!
//! A column chunk is stored as `(tag, bytes)` behind one lock so the
//! pair can only be observed together. The first byte of every encoded
//! payload repeats the tag; decode validates it against the tag the
//! caller stored and fails with `CorruptChunk` on mismatch.

use std::collections::HashMap;

use heron_common::{CompressionConfig, Datum, StorageError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Compression scheme tag. Closed set; `Invalid` never names a real
/// encoding and is only produced for unrecognized tag bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionType {
    Invalid,
    Uncompressed,
    Constant,
    Rle,
    BitPacking,
    Dictionary,
    ValidityUncompressed,
}

impl CompressionType {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionType::Invalid => "invalid",
            CompressionType::Uncompressed => "uncompressed",
            CompressionType::Constant => "constant",
            CompressionType::Rle => "rle",
            CompressionType::BitPacking => "bit_packing",
            CompressionType::Dictionary => "dictionary",
            CompressionType::ValidityUncompressed => "validity_uncompressed",
        }
    }

    fn tag_byte(&self) -> u8 {
        match self {
            CompressionType::Invalid => 0,
            CompressionType::Uncompressed => 1,
            CompressionType::Constant => 2,
            CompressionType::Rle => 3,
            CompressionType::BitPacking => 4,
            CompressionType::Dictionary => 5,
            CompressionType::ValidityUncompressed => 6,
        }
    }

    fn from_tag_byte(b: u8) -> CompressionType {
        match b {
            1 => CompressionType::Uncompressed,
            2 => CompressionType::Constant,
            3 => CompressionType::Rle,
            4 => CompressionType::BitPacking,
            5 => CompressionType::Dictionary,
            6 => CompressionType::ValidityUncompressed,
            _ => CompressionType::Invalid,
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable byte key for a datum, used for distinct counting, run
/// detection and dictionary building. NULLs share one key here; scheme
/// selection only needs representational equality.
fn datum_key(d: &Datum) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    match d {
        Datum::Null => key.push(0),
        Datum::Boolean(b) => {
            key.push(1);
            key.push(*b as u8);
        }
        Datum::Int64(v) => {
            key.push(2);
            key.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Float64(v) => {
            key.push(3);
            key.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Datum::Text(s) => {
            key.push(4);
            key.extend_from_slice(s.as_bytes());
        }
        Datum::Bytea(b) => {
            key.push(5);
            key.extend_from_slice(b);
        }
    }
    key
}

/// Statistics gathered from one column chunk, input to `select`.
#[derive(Debug, Clone)]
pub struct ChunkStats {
    pub row_count: usize,
    pub distinct_count: usize,
    pub null_count: usize,
    pub run_count: usize,
    /// Present when every value is a non-null Int64.
    pub int_range: Option<(i64, i64)>,
    pub all_equal: bool,
}

impl ChunkStats {
    pub fn from_values(values: &[Datum]) -> ChunkStats {
        let mut distinct: HashMap<Vec<u8>, ()> = HashMap::new();
        let mut null_count = 0;
        let mut run_count = 0;
        let mut last_key: Option<Vec<u8>> = None;
        let mut int_min: Option<i64> = None;
        let mut int_max: Option<i64> = None;
        let mut all_ints = !values.is_empty();

        for v in values {
            if v.is_null() {
                null_count += 1;
            }
            match v {
                Datum::Int64(i) => {
                    int_min = Some(int_min.map_or(*i, |m| m.min(*i)));
                    int_max = Some(int_max.map_or(*i, |m| m.max(*i)));
                }
                _ => all_ints = false,
            }
            let key = datum_key(v);
            if last_key.as_ref() != Some(&key) {
                run_count += 1;
                last_key = Some(key.clone());
            }
            distinct.entry(key).or_insert(());
        }

        ChunkStats {
            row_count: values.len(),
            distinct_count: distinct.len(),
            null_count,
            run_count,
            int_range: if all_ints {
                int_min.zip(int_max)
            } else {
                None
            },
            all_equal: !values.is_empty() && distinct.len() == 1,
        }
    }

    pub fn avg_run_length(&self) -> f64 {
        if self.run_count == 0 {
            0.0
        } else {
            self.row_count as f64 / self.run_count as f64
        }
    }
}

/// Deterministic scheme selection. The order is fixed: constant, then
/// RLE, then dictionary, then bit packing, then the validity split,
/// then plain. Same stats in, same tag out.
///
/// RLE deliberately precedes dictionary: a chunk with long runs always
/// has few distinct values too, so checking the distinct ratio first
/// would leave RLE unreachable at the default thresholds.
pub fn select(stats: &ChunkStats, config: &CompressionConfig) -> CompressionType {
    if stats.row_count == 0 {
        return CompressionType::Uncompressed;
    }
    if stats.all_equal {
        return CompressionType::Constant;
    }
    if stats.avg_run_length() >= config.rle_min_avg_run {
        return CompressionType::Rle;
    }
    let distinct_ratio = stats.distinct_count as f64 / stats.row_count as f64;
    if distinct_ratio < config.dictionary_max_ratio {
        return CompressionType::Dictionary;
    }
    if stats.null_count == 0 {
        if let Some((min, max)) = stats.int_range {
            let range = (max as i128 - min as i128) as u128;
            if range <= config.bitpack_max_range as u128 {
                return CompressionType::BitPacking;
            }
        }
    }
    if stats.null_count > 0 {
        return CompressionType::ValidityUncompressed;
    }
    CompressionType::Uncompressed
}

#[derive(Serialize, Deserialize)]
struct BitPacked {
    base: i64,
    width: u8,
    count: u32,
    bits: Vec<u8>,
}

fn ser<T: Serialize>(tag: CompressionType, value: &T) -> Result<Vec<u8>, StorageError> {
    let body = bincode::serialize(value)
        .map_err(|e| StorageError::Serialization(format!("encode {}: {e}", tag.name())))?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(tag.tag_byte());
    out.extend_from_slice(&body);
    Ok(out)
}

fn de<'a, T: Deserialize<'a>>(tag: CompressionType, body: &'a [u8]) -> Result<T, StorageError> {
    bincode::deserialize(body)
        .map_err(|e| StorageError::Serialization(format!("decode {}: {e}", tag.name())))
}

/// Encode a chunk with the given scheme.
pub fn encode(values: &[Datum], tag: CompressionType) -> Result<Vec<u8>, StorageError> {
    match tag {
        CompressionType::Invalid => Err(StorageError::Serialization(
            "cannot encode with the invalid tag".to_string(),
        )),
        CompressionType::Uncompressed => ser(tag, &values.to_vec()),
        CompressionType::Constant => {
            let first = values.first().cloned().unwrap_or(Datum::Null);
            ser(tag, &(first, values.len() as u32))
        }
        CompressionType::Rle => {
            let mut runs: Vec<(Datum, u32)> = Vec::new();
            for v in values {
                match runs.last_mut() {
                    Some((last, count)) if datum_key(last) == datum_key(v) => *count += 1,
                    _ => runs.push((v.clone(), 1)),
                }
            }
            ser(tag, &runs)
        }
        CompressionType::Dictionary => {
            let mut dict: Vec<Datum> = Vec::new();
            let mut positions: HashMap<Vec<u8>, u32> = HashMap::new();
            let mut indices: Vec<u32> = Vec::with_capacity(values.len());
            for v in values {
                let key = datum_key(v);
                let idx = *positions.entry(key).or_insert_with(|| {
                    dict.push(v.clone());
                    (dict.len() - 1) as u32
                });
                indices.push(idx);
            }
            ser(tag, &(dict, indices))
        }
        CompressionType::BitPacking => {
            let mut ints = Vec::with_capacity(values.len());
            for v in values {
                match v {
                    Datum::Int64(i) => ints.push(*i),
                    other => {
                        return Err(StorageError::Serialization(format!(
                            "bit packing requires non-null int64 values, found {}",
                            other.type_name()
                        )))
                    }
                }
            }
            let base = ints.iter().copied().min().unwrap_or(0);
            let range = ints
                .iter()
                .map(|v| (*v as i128 - base as i128) as u128)
                .max()
                .unwrap_or(0);
            let width = (128 - range.leading_zeros()).max(1) as u8;
            let mut bits = vec![0u8; (ints.len() * width as usize + 7) / 8];
            for (i, v) in ints.iter().enumerate() {
                let delta = (*v as i128 - base as i128) as u64;
                for bit in 0..width {
                    if delta >> bit & 1 == 1 {
                        let pos = i * width as usize + bit as usize;
                        bits[pos / 8] |= 1 << (pos % 8);
                    }
                }
            }
            ser(
                tag,
                &BitPacked {
                    base,
                    width,
                    count: ints.len() as u32,
                    bits,
                },
            )
        }
        CompressionType::ValidityUncompressed => {
            let mut bitmap = vec![0u8; (values.len() + 7) / 8];
            let mut present: Vec<Datum> = Vec::new();
            for (i, v) in values.iter().enumerate() {
                if !v.is_null() {
                    bitmap[i / 8] |= 1 << (i % 8);
                    present.push(v.clone());
                }
            }
            ser(tag, &(values.len() as u32, bitmap, present))
        }
    }
}

/// Decode a chunk previously encoded with `tag`. The leading tag byte
/// must agree with `tag`; a mismatch means the stored pair is corrupt.
pub fn decode(bytes: &[u8], tag: CompressionType, column: &str) -> Result<Vec<Datum>, StorageError> {
    let (first, body) = bytes.split_first().ok_or_else(|| StorageError::CorruptChunk {
        column: column.to_string(),
        stored: tag.name().to_string(),
        encoded: "empty".to_string(),
    })?;
    let encoded_tag = CompressionType::from_tag_byte(*first);
    if encoded_tag != tag || tag == CompressionType::Invalid {
        return Err(StorageError::CorruptChunk {
            column: column.to_string(),
            stored: tag.name().to_string(),
            encoded: encoded_tag.name().to_string(),
        });
    }
    match tag {
        CompressionType::Invalid => unreachable!("rejected above"),
        CompressionType::Uncompressed => de::<Vec<Datum>>(tag, body),
        CompressionType::Constant => {
            let (value, count): (Datum, u32) = de(tag, body)?;
            Ok(vec![value; count as usize])
        }
        CompressionType::Rle => {
            let runs: Vec<(Datum, u32)> = de(tag, body)?;
            let mut out = Vec::new();
            for (value, count) in runs {
                out.extend(std::iter::repeat(value).take(count as usize));
            }
            Ok(out)
        }
        CompressionType::Dictionary => {
            let (dict, indices): (Vec<Datum>, Vec<u32>) = de(tag, body)?;
            let mut out = Vec::with_capacity(indices.len());
            for idx in indices {
                let value = dict.get(idx as usize).ok_or_else(|| {
                    StorageError::Serialization(format!(
                        "dictionary index {idx} out of range for column `{column}`"
                    ))
                })?;
                out.push(value.clone());
            }
            Ok(out)
        }
        CompressionType::BitPacking => {
            let packed: BitPacked = de(tag, body)?;
            let width = packed.width as usize;
            let mut out = Vec::with_capacity(packed.count as usize);
            for i in 0..packed.count as usize {
                let mut delta: u64 = 0;
                for bit in 0..width {
                    let pos = i * width + bit;
                    let byte = packed.bits.get(pos / 8).copied().unwrap_or(0);
                    if byte >> (pos % 8) & 1 == 1 {
                        delta |= 1 << bit;
                    }
                }
                out.push(Datum::Int64(
                    (packed.base as i128 + delta as i128) as i64,
                ));
            }
            Ok(out)
        }
        CompressionType::ValidityUncompressed => {
            let (count, bitmap, present): (u32, Vec<u8>, Vec<Datum>) = de(tag, body)?;
            let mut out = Vec::with_capacity(count as usize);
            let mut next = present.into_iter();
            for i in 0..count as usize {
                let set = bitmap.get(i / 8).copied().unwrap_or(0) >> (i % 8) & 1 == 1;
                if set {
                    let value = next.next().ok_or_else(|| {
                        StorageError::Serialization(format!(
                            "validity bitmap disagrees with value count for column `{column}`"
                        ))
                    })?;
                    out.push(value);
                } else {
                    out.push(Datum::Null);
                }
            }
            Ok(out)
        }
    }
}

/// One encoded column chunk. Tag and bytes swap together under a
/// single lock, so readers can never observe bytes from one encoding
/// paired with the tag of another.
pub struct EncodedChunk {
    column: String,
    state: RwLock<(CompressionType, Vec<u8>)>,
}

impl EncodedChunk {
    /// Select a scheme from fresh stats and encode.
    pub fn build(
        column: &str,
        values: &[Datum],
        config: &CompressionConfig,
    ) -> Result<EncodedChunk, StorageError> {
        let stats = ChunkStats::from_values(values);
        let tag = select(&stats, config);
        let bytes = encode(values, tag)?;
        Ok(EncodedChunk {
            column: column.to_string(),
            state: RwLock::new((tag, bytes)),
        })
    }

    pub fn tag(&self) -> CompressionType {
        self.state.read().0
    }

    pub fn read(&self) -> Result<Vec<Datum>, StorageError> {
        let state = self.state.read();
        decode(&state.1, state.0, &self.column)
    }

    /// Re-select and swap the (tag, bytes) pair atomically.
    pub fn reencode(
        &self,
        values: &[Datum],
        config: &CompressionConfig,
    ) -> Result<CompressionType, StorageError> {
        let stats = ChunkStats::from_values(values);
        let tag = select(&stats, config);
        let bytes = encode(values, tag)?;
        *self.state.write() = (tag, bytes);
        Ok(tag)
    }

    #[cfg(test)]
    fn poison_tag(&self, tag: CompressionType) {
        self.state.write().0 = tag;
    }
}
