//! Array dtype handling: parsing both metadata spellings, default fill
//! values, and raw little-endian chunk decoding into f32 staging buffers.

use crate::error::{EngineError, EngineResult};

/// Element type of a stored array. Fixed-length byte strings carry their
/// length so coordinate labels can be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    U8,
    F4,
    F8,
    S(usize),
}

impl Dtype {
    /// Parse either the v2 (`<f4`, `|u1`, `|S8`) or v3 (`float32`, `uint8`)
    /// spelling.
    pub fn parse(s: &str) -> EngineResult<Self> {
        let out = match s {
            "<i1" | "|i1" | "int8" => Dtype::I1,
            "|u1" | "<u1" | "uint8" => Dtype::U1,
            "<i2" | "int16" => Dtype::I2,
            "<u2" | "uint16" => Dtype::U2,
            "<i4" | "int32" => Dtype::I4,
            "<u4" | "uint32" => Dtype::U4,
            "<u8" | "uint64" => Dtype::U8,
            "<f4" | "float32" => Dtype::F4,
            "<f8" | "float64" => Dtype::F8,
            other => {
                if let Some(len) = other.strip_prefix("|S").and_then(|n| n.parse().ok()) {
                    Dtype::S(len)
                } else {
                    return Err(EngineError::metadata(format!("unsupported dtype: {other}")));
                }
            }
        };
        Ok(out)
    }

    /// Bytes per element.
    pub fn size(self) -> usize {
        match self {
            Dtype::I1 | Dtype::U1 => 1,
            Dtype::I2 | Dtype::U2 => 2,
            Dtype::I4 | Dtype::U4 | Dtype::F4 => 4,
            Dtype::U8 | Dtype::F8 => 8,
            Dtype::S(n) => n,
        }
    }

    /// Default fill value when the store metadata leaves it null.
    pub fn default_fill(self) -> f32 {
        match self {
            Dtype::S(_) => 0.0,
            Dtype::I1 => -127.0,
            Dtype::U1 => 255.0,
            Dtype::I2 => -32767.0,
            Dtype::U2 => 65535.0,
            Dtype::I4 => -2147483647.0,
            Dtype::U4 => 4294967295.0,
            Dtype::U8 => 1.8446744073709552e19,
            Dtype::F4 | Dtype::F8 => 9.969209968386869e36,
        }
    }
}

/// Decode a raw little-endian chunk into f32 values. The caller supplies the
/// expected element count; short buffers are an error, excess bytes are
/// ignored (some stores pad the trailing chunk).
pub fn decode_values(data: &[u8], dtype: Dtype, count: usize) -> EngineResult<Vec<f32>> {
    let elem = dtype.size();
    if data.len() < count * elem {
        return Err(EngineError::metadata(format!(
            "chunk too short: {} bytes for {} x {:?}",
            data.len(),
            count,
            dtype
        )));
    }

    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let b = &data[i * elem..(i + 1) * elem];
        let v = match dtype {
            Dtype::I1 => b[0] as i8 as f32,
            Dtype::U1 => b[0] as f32,
            Dtype::I2 => i16::from_le_bytes([b[0], b[1]]) as f32,
            Dtype::U2 => u16::from_le_bytes([b[0], b[1]]) as f32,
            Dtype::I4 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32,
            Dtype::U4 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32,
            Dtype::U8 => u64::from_le_bytes(b.try_into().unwrap()) as f32,
            Dtype::F4 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            Dtype::F8 => f64::from_le_bytes(b.try_into().unwrap()) as f32,
            Dtype::S(_) => {
                return Err(EngineError::metadata(
                    "string dtype cannot be decoded to numeric values",
                ))
            }
        };
        out.push(v);
    }
    Ok(out)
}

/// Decode a 1-D coordinate array into labels: numeric dtypes yield their
/// decimal rendering, byte strings are trimmed of NUL padding.
pub fn decode_labels(data: &[u8], dtype: Dtype, count: usize) -> EngineResult<Vec<String>> {
    match dtype {
        Dtype::S(n) => {
            if data.len() < count * n {
                return Err(EngineError::metadata("coordinate array too short"));
            }
            Ok((0..count)
                .map(|i| {
                    let raw = &data[i * n..(i + 1) * n];
                    String::from_utf8_lossy(raw).trim_end_matches('\0').to_string()
                })
                .collect())
        }
        _ => {
            let values = decode_values(data, dtype, count)?;
            Ok(values.iter().map(|v| format_number(*v as f64)).collect())
        }
    }
}

/// Render a numeric coordinate the way band names spell it: integral values
/// without a trailing `.0`.
pub fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_both_spellings() {
        assert_eq!(Dtype::parse("<f4").unwrap(), Dtype::F4);
        assert_eq!(Dtype::parse("float32").unwrap(), Dtype::F4);
        assert_eq!(Dtype::parse("|u1").unwrap(), Dtype::U1);
        assert_eq!(Dtype::parse("uint64").unwrap(), Dtype::U8);
        assert_eq!(Dtype::parse("|S12").unwrap(), Dtype::S(12));
        assert!(Dtype::parse("complex64").is_err());
    }

    #[test]
    fn default_fill_table() {
        assert_eq!(Dtype::I1.default_fill(), -127.0);
        assert_eq!(Dtype::U2.default_fill(), 65535.0);
        assert_eq!(Dtype::F8.default_fill(), 9.969209968386869e36);
    }

    #[test]
    fn decode_f4_roundtrip() {
        let src = [1.0f32, -2.5, 3.25];
        let bytes: Vec<u8> = src.iter().flat_map(|v| v.to_le_bytes()).collect();
        let out = decode_values(&bytes, Dtype::F4, 3).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn decode_i2_widens() {
        let bytes = (-3i16).to_le_bytes().to_vec();
        assert_eq!(decode_values(&bytes, Dtype::I2, 1).unwrap(), vec![-3.0]);
    }

    #[test]
    fn decode_short_buffer_errors() {
        assert!(decode_values(&[0u8; 3], Dtype::F4, 1).is_err());
    }

    #[test]
    fn labels_from_bytes() {
        let data = b"tavg\0\0prec\0\0";
        let labels = decode_labels(data, Dtype::S(6), 2).unwrap();
        assert_eq!(labels, vec!["tavg", "prec"]);
    }

    #[test]
    fn numbers_format_like_band_tokens() {
        assert_eq!(format_number(2020.0), "2020");
        assert_eq!(format_number(0.5), "0.5");
    }
}
