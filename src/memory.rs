//! FPGA memory descriptors.
//!
//! This module contains [`MemoryDesc`], the validated form of the memory
//! descriptors given in the configuration, and the word formats ([`Dtype`])
//! used to encode and decode the contents of the FPGA block memories. All the
//! reads and writes of memories go through a descriptor, so that the word
//! width, signedness and endianness are always explicit.

use crate::error::Error;
use roachcal_json::{BramNames, MemoryInfo};
use std::str::FromStr;

/// Endianness.
///
/// The endianness indicates the order of the bytes forming a multi-byte word
/// in memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Endianness {
    /// Little-endian.
    Le,
    /// Big-endian.
    Be,
}

/// Word kind.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Kind {
    /// Signed integer.
    Int,
    /// Unsigned integer.
    Uint,
    /// IEEE 754 floating point.
    Float,
}

/// Memory word dtype.
///
/// A dtype is written as a numpy dtype string, such as `">i8"` (big-endian
/// 64-bit signed integer) or `">u4"` (big-endian 32-bit unsigned integer).
/// Names such as `"int32"` are also accepted and are big-endian.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Dtype {
    /// Word kind.
    pub kind: Kind,
    /// Word size in bytes.
    pub size: usize,
    /// Word endianness.
    pub endianness: Endianness,
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let endianness = match self.endianness {
            Endianness::Le => "<",
            Endianness::Be => ">",
        };
        let kind = match self.kind {
            Kind::Int => "i",
            Kind::Uint => "u",
            Kind::Float => "f",
        };
        write!(f, "{endianness}{kind}{}", self.size)
    }
}

impl FromStr for Dtype {
    type Err = Error;

    fn from_str(s: &str) -> Result<Dtype, Error> {
        let invalid = || Error::Config(format!("invalid dtype {s:?}"));
        let (kind, size, endianness) = if let Some(bits) = s.strip_prefix("uint") {
            (Kind::Uint, bits, Endianness::Be)
        } else if let Some(bits) = s.strip_prefix("int") {
            (Kind::Int, bits, Endianness::Be)
        } else if let Some(bits) = s.strip_prefix("float") {
            (Kind::Float, bits, Endianness::Be)
        } else {
            let (endianness, rest) = match s.chars().next() {
                Some('>') | Some('!') => (Endianness::Be, &s[1..]),
                Some('<') => (Endianness::Le, &s[1..]),
                Some('|') => (Endianness::Be, &s[1..]),
                _ => (Endianness::Be, s),
            };
            let mut chars = rest.chars();
            let kind = match chars.next() {
                Some('i') => Kind::Int,
                Some('u') => Kind::Uint,
                Some('f') => Kind::Float,
                _ => return Err(invalid()),
            };
            let size: usize = chars.as_str().parse().map_err(|_| invalid())?;
            return Dtype::new(kind, size, endianness).ok_or_else(invalid);
        };
        let bits: usize = size.parse().map_err(|_| invalid())?;
        if bits % 8 != 0 {
            return Err(invalid());
        }
        Dtype::new(kind, bits / 8, endianness).ok_or_else(invalid)
    }
}

impl Dtype {
    fn new(kind: Kind, size: usize, endianness: Endianness) -> Option<Dtype> {
        let valid = match kind {
            Kind::Int | Kind::Uint => matches!(size, 1 | 2 | 4 | 8),
            Kind::Float => matches!(size, 4 | 8),
        };
        valid.then_some(Dtype {
            kind,
            size,
            endianness,
        })
    }

    /// Decodes a byte buffer into words.
    ///
    /// Trailing bytes that do not form a full word are ignored.
    pub fn decode(&self, bytes: &[u8]) -> Vec<f64> {
        bytes
            .chunks_exact(self.size)
            .map(|chunk| self.decode_word(chunk))
            .collect()
    }

    fn decode_word(&self, chunk: &[u8]) -> f64 {
        let mut word = [0u8; 8];
        match self.endianness {
            Endianness::Be => word[8 - self.size..].copy_from_slice(chunk),
            Endianness::Le => {
                for (dst, src) in word[8 - self.size..].iter_mut().zip(chunk.iter().rev()) {
                    *dst = *src;
                }
            }
        }
        let raw = u64::from_be_bytes(word);
        let bits = 8 * self.size as u32;
        match self.kind {
            Kind::Uint => raw as f64,
            Kind::Int => {
                // sign extension
                let shift = 64 - bits;
                (((raw << shift) as i64) >> shift) as f64
            }
            Kind::Float if self.size == 4 => f32::from_bits(raw as u32) as f64,
            Kind::Float => f64::from_bits(raw),
        }
    }

    /// Encodes words into a byte buffer.
    ///
    /// Integer values are converted to the word size with two's complement
    /// wrapping. Floating point values written to integer words are truncated
    /// toward zero.
    pub fn encode(&self, values: &[Value]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(values.len() * self.size);
        for value in values {
            let raw: u64 = match (self.kind, *value) {
                (Kind::Int | Kind::Uint, Value::Int(n)) => n as u64,
                (Kind::Int | Kind::Uint, Value::Float(x)) => x as i128 as u64,
                (Kind::Float, v) if self.size == 4 => (v.as_f64() as f32).to_bits() as u64,
                (Kind::Float, v) => v.as_f64().to_bits(),
            };
            let word = raw.to_be_bytes();
            let word = &word[8 - self.size..];
            match self.endianness {
                Endianness::Be => bytes.extend_from_slice(word),
                Endianness::Le => bytes.extend(word.iter().rev()),
            }
        }
        bytes
    }
}

/// A value to be written into a memory word.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Value {
    /// Integer value.
    Int(i128),
    /// Floating point value.
    Float(f64),
}

impl Value {
    fn as_f64(self) -> f64 {
        match self {
            Value::Int(n) => n as f64,
            Value::Float(x) => x,
        }
    }
}

/// Native element type that can be written into a memory.
///
/// The element type is compared against the dtype of the memory when
/// writing. A mismatch is reported as a warning and the values are converted.
pub trait Word: Copy {
    /// Kind of the element type.
    const KIND: Kind;
    /// Size of the element type in bytes.
    const SIZE: usize;
    /// Converts the element to a [`Value`].
    fn value(self) -> Value;
}

macro_rules! impl_word {
    ($($ty:ty => $kind:ident, $variant:ident);* $(;)?) => {
        $(
            impl Word for $ty {
                const KIND: Kind = Kind::$kind;
                const SIZE: usize = std::mem::size_of::<$ty>();
                fn value(self) -> Value {
                    Value::$variant(self.into())
                }
            }
        )*
    };
}

impl_word!(
    i8 => Int, Int;
    i16 => Int, Int;
    i32 => Int, Int;
    i64 => Int, Int;
    u8 => Uint, Int;
    u16 => Uint, Int;
    u32 => Uint, Int;
    u64 => Uint, Int;
    f32 => Float, Float;
    f64 => Float, Float;
);

/// Returns `true` if the element type `W` matches `dtype` (ignoring
/// endianness).
pub fn word_matches<W: Word>(dtype: &Dtype) -> bool {
    W::KIND == dtype.kind && W::SIZE == dtype.size
}

/// Interleaves parallel FFT lanes.
///
/// For `n` lanes of length `m`, the output has length `n * m` and
/// `out[i * n + j] == lanes[j][i]`.
pub fn interleave<T: Copy>(lanes: &[Vec<T>]) -> Vec<T> {
    let m = lanes.iter().map(Vec::len).min().unwrap_or(0);
    (0..m)
        .flat_map(|i| lanes.iter().map(move |lane| lane[i]))
        .collect()
}

/// Splits interleaved data into `n` lanes.
///
/// This is the inverse of [`interleave`].
pub fn deinterleave<T: Copy>(data: &[T], n: usize) -> Vec<Vec<T>> {
    (0..n)
        .map(|j| data.iter().skip(j).step_by(n).copied().collect())
        .collect()
}

/// Memory descriptor.
///
/// This struct is the validated form of a
/// [`MemoryInfo`](roachcal_json::MemoryInfo). It describes one memory or a
/// group of memories sharing the same word format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDesc {
    key: String,
    names: BramNames,
    addr_width: u32,
    data_width: u32,
    dtype: Dtype,
    acc_len_reg: Option<String>,
    interleave: bool,
}

impl MemoryDesc {
    /// Validates a memory descriptor.
    ///
    /// The `key` is the configuration key of the descriptor and is used in the
    /// error messages.
    pub fn from_info(key: &str, info: &MemoryInfo) -> Result<MemoryDesc, Error> {
        let err = |msg: String| Error::Config(format!("{key}: {msg}"));
        let dtype: Dtype = info
            .data_type
            .parse()
            .map_err(|_| err(format!("invalid dtype {:?}", info.data_type)))?;
        if info.data_width != 8 * dtype.size as u32 {
            return Err(err(format!(
                "data_width {} does not match dtype {dtype}",
                info.data_width
            )));
        }
        if info.addr_width > 24 {
            return Err(err(format!("addr_width {} too large", info.addr_width)));
        }
        match &info.names {
            BramNames::Name(name) if name.is_empty() => {
                return Err(err("empty memory name".to_string()));
            }
            BramNames::List(list) if list.is_empty() => {
                return Err(err("empty memory list".to_string()));
            }
            BramNames::List2d(rows) => {
                if rows.is_empty() || rows.iter().any(Vec::is_empty) {
                    return Err(err("empty memory list".to_string()));
                }
                if rows.iter().any(|row| row.len() != rows[0].len()) {
                    return Err(err("rows of bram_list2d differ in length".to_string()));
                }
            }
            _ => (),
        }
        Ok(MemoryDesc {
            key: key.to_string(),
            names: info.names.clone(),
            addr_width: info.addr_width,
            data_width: info.data_width,
            dtype,
            acc_len_reg: info.acc_len_reg.clone(),
            interleave: info.interleave,
        })
    }

    /// Creates a descriptor of a single memory with the word format of this
    /// descriptor.
    pub fn single(&self, name: &str) -> MemoryDesc {
        MemoryDesc {
            names: BramNames::Name(name.to_string()),
            ..self.clone()
        }
    }

    /// Configuration key of the descriptor.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Memory names.
    pub fn names(&self) -> &BramNames {
        &self.names
    }

    /// All the memory names of the descriptor, in order.
    pub fn all_names(&self) -> Vec<&str> {
        match &self.names {
            BramNames::Name(name) => vec![name.as_str()],
            BramNames::List(list) => list.iter().map(String::as_str).collect(),
            BramNames::List2d(rows) => rows.iter().flatten().map(String::as_str).collect(),
        }
    }

    /// Number of words of each memory.
    pub fn words(&self) -> usize {
        1 << self.addr_width
    }

    /// Size of each memory in bytes.
    pub fn nbytes(&self) -> usize {
        self.words() * self.data_width as usize / 8
    }

    /// Word dtype.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Word width in bits.
    pub fn data_width(&self) -> u32 {
        self.data_width
    }

    /// Accumulation length register.
    pub fn acc_len_reg(&self) -> Option<&str> {
        self.acc_len_reg.as_deref()
    }

    /// Returns `true` if lists are parallel lanes to be interleaved.
    pub fn interleave(&self) -> bool {
        self.interleave
    }

    /// Number of lanes of each logical array.
    pub fn lanes(&self) -> usize {
        match (&self.names, self.interleave) {
            (BramNames::List(list), true) => list.len(),
            (BramNames::List2d(rows), true) => rows[0].len(),
            _ => 1,
        }
    }

    /// Number of elements of each logical array (channels of a spectrum).
    pub fn logical_len(&self) -> usize {
        self.lanes() * self.words()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn info(names: BramNames, data_type: &str, data_width: u32) -> MemoryInfo {
        MemoryInfo {
            addr_width: 3,
            data_width,
            data_type: data_type.to_string(),
            acc_len_reg: Some("acc_len".to_string()),
            interleave: false,
            names,
        }
    }

    #[test]
    fn parse_dtype() {
        let d: Dtype = ">i8".parse().unwrap();
        assert_eq!(
            d,
            Dtype {
                kind: Kind::Int,
                size: 8,
                endianness: Endianness::Be
            }
        );
        assert_eq!(d.to_string(), ">i8");
        let d: Dtype = "<u2".parse().unwrap();
        assert_eq!(d.endianness, Endianness::Le);
        assert_eq!(d.kind, Kind::Uint);
        let d: Dtype = "int32".parse().unwrap();
        assert_eq!(d.to_string(), ">i4");
        assert!("f2".parse::<Dtype>().is_err());
        assert!(">x4".parse::<Dtype>().is_err());
        assert!("uint12".parse::<Dtype>().is_err());
    }

    #[test]
    fn decode_big_endian() {
        let d: Dtype = ">i4".parse().unwrap();
        assert_eq!(
            d.decode(&[0xff, 0xff, 0xff, 0xfe, 0x00, 0x00, 0x01, 0x00]),
            vec![-2.0, 256.0]
        );
        let d: Dtype = ">u2".parse().unwrap();
        assert_eq!(d.decode(&[0xff, 0xfe, 0x00, 0x01]), vec![65534.0, 1.0]);
        let d: Dtype = "<i2".parse().unwrap();
        assert_eq!(d.decode(&[0xfe, 0xff]), vec![-2.0]);
        let d: Dtype = ">f4".parse().unwrap();
        assert_eq!(d.decode(&1.5f32.to_be_bytes()), vec![1.5]);
    }

    #[test]
    fn encode_words() {
        let d: Dtype = ">i4".parse().unwrap();
        let bytes = d.encode(&[Value::Int(-2), Value::Float(256.7)]);
        assert_eq!(bytes, vec![0xff, 0xff, 0xff, 0xfe, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(d.decode(&bytes), vec![-2.0, 256.0]);
        let d: Dtype = "<u2".parse().unwrap();
        assert_eq!(d.encode(&[Value::Int(0x1234)]), vec![0x34, 0x12]);
    }

    #[test]
    fn word_dtype_check() {
        let d: Dtype = ">i4".parse().unwrap();
        assert!(word_matches::<i32>(&d));
        assert!(!word_matches::<u32>(&d));
        assert!(!word_matches::<i64>(&d));
    }

    #[test]
    fn interleaving() {
        let lanes = vec![vec![0, 3, 6, 9], vec![1, 4, 7, 10], vec![2, 5, 8, 11]];
        let out = interleave(&lanes);
        assert_eq!(out, (0..12).collect::<Vec<_>>());
        for i in 0..4 {
            for (j, lane) in lanes.iter().enumerate() {
                assert_eq!(out[i * 3 + j], lane[i]);
            }
        }
        assert_eq!(deinterleave(&out, 3), lanes);
    }

    #[test]
    fn descriptor_validation() {
        let desc = MemoryDesc::from_info(
            "cal_pow_info",
            &info(
                BramNames::List(vec!["a2_0".into(), "a2_1".into()]),
                ">u8",
                64,
            ),
        )
        .unwrap();
        assert_eq!(desc.words(), 8);
        assert_eq!(desc.nbytes(), 64);
        assert_eq!(desc.lanes(), 1);
        assert_eq!(desc.all_names(), vec!["a2_0", "a2_1"]);

        let err = MemoryDesc::from_info(
            "cal_pow_info",
            &info(BramNames::Name("a2".into()), ">u8", 32),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.starts_with("cal_pow_info")));

        let err = MemoryDesc::from_info(
            "crosspow_info",
            &info(
                BramNames::List2d(vec![vec!["re".into()], vec![]]),
                ">i8",
                64,
            ),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn interleaved_lengths() {
        let mut i = info(
            BramNames::List2d(vec![
                vec!["a2_0".into(), "a2_1".into()],
                vec!["b2_0".into(), "b2_1".into()],
            ]),
            ">u8",
            64,
        );
        i.interleave = true;
        let desc = MemoryDesc::from_info("cal_pow_info", &i).unwrap();
        assert_eq!(desc.lanes(), 2);
        assert_eq!(desc.logical_len(), 16);
    }

    #[test]
    fn complex_lengths() {
        let desc = MemoryDesc::from_info(
            "const_brams_info",
            &info(
                BramNames::List2d(vec![
                    vec!["c0_re".into(), "c0_im".into()],
                    vec!["c1_re".into(), "c1_im".into()],
                ]),
                ">i4",
                32,
            ),
        )
        .unwrap();
        assert_eq!(crate::config::complex_len(&desc).unwrap(), 8);
        // built without validation
        let empty = MemoryDesc {
            names: BramNames::List2d(Vec::new()),
            ..desc
        };
        assert!(matches!(
            crate::config::complex_len(&empty),
            Err(Error::Config(ref msg)) if msg.starts_with("const_brams_info")
        ));
    }
}
