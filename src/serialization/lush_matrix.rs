//! Lush binary matrix files.
//!
//! A file is a header of 32-bit words followed by the elements in row-major
//! order:
//!
//! | word            | meaning                                         |
//! |-----------------|-------------------------------------------------|
//! | `magic`         | element type, also used to detect byte order    |
//! | `ndim`          | `-1` placeholder (no body), `0` scalar, `1..=11`|
//! | `dims[max(ndim, 3)]` | extents; words past `ndim` must be 1       |
//!
//! Readers accept either byte order and decode the body in the order the
//! magic was found in. Writers always emit little-endian.

use crate::nn::module::ModuleError;
use crate::nn::parameter::Parameter;
use ndarray::{ArrayD, IxDyn};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

pub const MAX_DIMS: usize = 11;

const BINARY_MATRIX: u32 = 0x1e3d_4c51;
const PACKED_MATRIX: u32 = 0x1e3d_4c52;
const DOUBLE_MATRIX: u32 = 0x1e3d_4c53;
const INTEGER_MATRIX: u32 = 0x1e3d_4c54;
const BYTE_MATRIX: u32 = 0x1e3d_4c55;
const SHORT_MATRIX: u32 = 0x1e3d_4c56;
const SHORT8_MATRIX: u32 = 0x1e3d_4c57;
const ASCII_MATRIX: u32 = 0x2e4d_4154;

const PLACEHOLDER_NDIM: i32 = -1;

#[derive(Error, Debug)]
pub enum MatrixFileError {
    #[error("bad matrix format: {0}")]
    BadFormat(String),

    #[error("unsupported matrix format: {0}")]
    UnsupportedFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected element type {actual:?}, expected {expected}")]
    ElementType {
        expected: &'static str,
        actual: ElementType,
    },

    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("module error: {0}")]
    Module(#[from] ModuleError),
}

type Result<T> = std::result::Result<T, MatrixFileError>;

/// Element type of a matrix file, one per magic number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    F32,
    /// Legacy packed bytes, read as `i8` and never written.
    Packed,
    F64,
    I32,
    U8,
    I16,
    I8,
}

impl ElementType {
    pub fn magic(self) -> u32 {
        match self {
            ElementType::F32 => BINARY_MATRIX,
            ElementType::Packed => PACKED_MATRIX,
            ElementType::F64 => DOUBLE_MATRIX,
            ElementType::I32 => INTEGER_MATRIX,
            ElementType::U8 => BYTE_MATRIX,
            ElementType::I16 => SHORT_MATRIX,
            ElementType::I8 => SHORT8_MATRIX,
        }
    }

    pub fn from_magic(magic: u32) -> Result<Self> {
        match magic {
            BINARY_MATRIX => Ok(ElementType::F32),
            PACKED_MATRIX => Ok(ElementType::Packed),
            DOUBLE_MATRIX => Ok(ElementType::F64),
            INTEGER_MATRIX => Ok(ElementType::I32),
            BYTE_MATRIX => Ok(ElementType::U8),
            SHORT_MATRIX => Ok(ElementType::I16),
            SHORT8_MATRIX => Ok(ElementType::I8),
            ASCII_MATRIX => Err(MatrixFileError::UnsupportedFormat(
                "ascii matrices".to_string(),
            )),
            other => Err(MatrixFileError::BadFormat(format!(
                "unknown magic {:#010x}",
                other
            ))),
        }
    }

    /// Bytes per element.
    pub fn size(self) -> usize {
        match self {
            ElementType::F64 => 8,
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::I16 => 2,
            ElementType::Packed | ElementType::U8 | ElementType::I8 => 1,
        }
    }
}

fn is_magic(word: u32) -> bool {
    word == ASCII_MATRIX || ElementType::from_magic(word).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn word(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixHeader {
    pub element: ElementType,
    /// `None` for a placeholder, empty for a scalar.
    pub shape: Option<Vec<usize>>,
    pub byte_order: ByteOrder,
}

/// A decoded matrix with its native element type.
#[derive(Debug, Clone, PartialEq)]
pub enum MatrixData {
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    I32(ArrayD<i32>),
    U8(ArrayD<u8>),
    I16(ArrayD<i16>),
    I8(ArrayD<i8>),
}

impl MatrixData {
    /// Element type this matrix is written with.
    pub fn element_type(&self) -> ElementType {
        match self {
            MatrixData::F32(_) => ElementType::F32,
            MatrixData::F64(_) => ElementType::F64,
            MatrixData::I32(_) => ElementType::I32,
            MatrixData::U8(_) => ElementType::U8,
            MatrixData::I16(_) => ElementType::I16,
            MatrixData::I8(_) => ElementType::I8,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            MatrixData::F32(a) => a.shape(),
            MatrixData::F64(a) => a.shape(),
            MatrixData::I32(a) => a.shape(),
            MatrixData::U8(a) => a.shape(),
            MatrixData::I16(a) => a.shape(),
            MatrixData::I8(a) => a.shape(),
        }
    }

    /// Converts every element to `f64`; all element types convert losslessly.
    pub fn to_f64(&self) -> ArrayD<f64> {
        match self {
            MatrixData::F32(a) => a.mapv(f64::from),
            MatrixData::F64(a) => a.clone(),
            MatrixData::I32(a) => a.mapv(f64::from),
            MatrixData::U8(a) => a.mapv(f64::from),
            MatrixData::I16(a) => a.mapv(f64::from),
            MatrixData::I8(a) => a.mapv(f64::from),
        }
    }
}

trait Element: Copy {
    const SIZE: usize;
    fn decode(bytes: &[u8], order: ByteOrder) -> Self;
    fn encode(self, out: &mut Vec<u8>);
}

macro_rules! impl_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {$(
        impl Element for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn decode(bytes: &[u8], order: ByteOrder) -> Self {
                let mut word = [0u8; std::mem::size_of::<$ty>()];
                word.copy_from_slice(bytes);
                match order {
                    ByteOrder::Little => <$ty>::from_le_bytes(word),
                    ByteOrder::Big => <$ty>::from_be_bytes(word),
                }
            }

            fn encode(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }

        impl From<ArrayD<$ty>> for MatrixData {
            fn from(array: ArrayD<$ty>) -> Self {
                MatrixData::$variant(array)
            }
        }
    )*};
}

impl_element!(f32 => F32, f64 => F64, i32 => I32, u8 => U8, i16 => I16, i8 => I8);

fn read_word<R: Read>(reader: &mut R, order: ByteOrder) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(order.word(bytes))
}

/// Reads and validates a header, leaving `reader` at the first element.
pub fn read_header<R: Read>(reader: &mut R) -> Result<MatrixHeader> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    let byte_order = if is_magic(u32::from_le_bytes(bytes)) {
        ByteOrder::Little
    } else if is_magic(u32::from_be_bytes(bytes)) {
        ByteOrder::Big
    } else {
        return Err(MatrixFileError::BadFormat(format!(
            "unknown magic {:02x?}",
            bytes
        )));
    };
    let element = ElementType::from_magic(byte_order.word(bytes))?;

    let ndim = read_word(reader, byte_order)? as i32;
    let shape = match ndim {
        PLACEHOLDER_NDIM => None,
        n if n < 0 || n as usize > MAX_DIMS => {
            return Err(MatrixFileError::BadFormat(format!(
                "bad number of dimensions ({})",
                n
            )))
        }
        0 => Some(Vec::new()),
        n => {
            let ndim = n as usize;
            let mut dims = Vec::with_capacity(ndim.max(3));
            for _ in 0..ndim.max(3) {
                dims.push(read_word(reader, byte_order)? as usize);
            }
            if dims[ndim..].iter().any(|&d| d != 1) {
                return Err(MatrixFileError::BadFormat(format!(
                    "padding dimensions {:?} are not 1",
                    &dims[ndim..]
                )));
            }
            dims.truncate(ndim);
            Some(dims)
        }
    };
    log::debug!(
        "matrix header: {:?} {:?} shape {:?}",
        element,
        byte_order,
        shape
    );
    Ok(MatrixHeader {
        element,
        shape,
        byte_order,
    })
}

fn read_array<T: Element, R: Read>(
    reader: &mut R,
    shape: &[usize],
    order: ByteOrder,
) -> Result<ArrayD<T>> {
    let bytes = shape
        .iter()
        .try_fold(T::SIZE, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| MatrixFileError::BadFormat(format!("shape {:?} is too large", shape)))?;
    let mut body = Vec::new();
    reader.by_ref().take(bytes as u64).read_to_end(&mut body)?;
    if body.len() != bytes {
        return Err(MatrixFileError::BadFormat(format!(
            "truncated body: expected {} bytes, found {}",
            bytes,
            body.len()
        )));
    }
    let values: Vec<T> = body
        .chunks_exact(T::SIZE)
        .map(|chunk| T::decode(chunk, order))
        .collect();
    Ok(ArrayD::from_shape_vec(IxDyn(shape), values)?)
}

/// Reads one matrix. Returns `None` for a placeholder.
pub fn load_matrix<R: Read>(reader: &mut R) -> Result<Option<MatrixData>> {
    let header = read_header(reader)?;
    let shape = match header.shape {
        Some(shape) => shape,
        None => return Ok(None),
    };
    let order = header.byte_order;
    let data = match header.element {
        ElementType::F32 => MatrixData::F32(read_array(reader, &shape, order)?),
        ElementType::F64 => MatrixData::F64(read_array(reader, &shape, order)?),
        ElementType::I32 => MatrixData::I32(read_array(reader, &shape, order)?),
        ElementType::U8 => MatrixData::U8(read_array(reader, &shape, order)?),
        ElementType::I16 => MatrixData::I16(read_array(reader, &shape, order)?),
        ElementType::Packed | ElementType::I8 => {
            MatrixData::I8(read_array(reader, &shape, order)?)
        }
    };
    Ok(Some(data))
}

fn header_words(element: ElementType, shape: &[usize]) -> Result<Vec<u32>> {
    if shape.len() > MAX_DIMS {
        return Err(MatrixFileError::UnsupportedFormat(format!(
            "rank {} exceeds {}",
            shape.len(),
            MAX_DIMS
        )));
    }
    let mut words = vec![element.magic(), shape.len() as u32];
    for &d in shape {
        let word = u32::try_from(d).map_err(|_| {
            MatrixFileError::UnsupportedFormat(format!("dimension {} does not fit 32 bits", d))
        })?;
        words.push(word);
    }
    if !shape.is_empty() {
        words.resize(2 + shape.len().max(3), 1);
    }
    Ok(words)
}

fn write_array<T: Element, W: Write>(
    writer: &mut W,
    element: ElementType,
    array: &ArrayD<T>,
) -> Result<()> {
    let words = header_words(element, array.shape())?;
    let mut bytes = Vec::with_capacity(4 * words.len() + T::SIZE * array.len());
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    for &value in array.iter() {
        value.encode(&mut bytes);
    }
    writer.write_all(&bytes)?;
    Ok(())
}

/// Writes `data` little-endian. `i8` data is written as SHORT8.
pub fn save_matrix<W: Write>(writer: &mut W, data: &MatrixData) -> Result<()> {
    let element = data.element_type();
    match data {
        MatrixData::F32(a) => write_array(writer, element, a),
        MatrixData::F64(a) => write_array(writer, element, a),
        MatrixData::I32(a) => write_array(writer, element, a),
        MatrixData::U8(a) => write_array(writer, element, a),
        MatrixData::I16(a) => write_array(writer, element, a),
        MatrixData::I8(a) => write_array(writer, element, a),
    }
}

pub fn load_matrix_file<P: AsRef<Path>>(path: P) -> Result<Option<MatrixData>> {
    let mut reader = BufReader::new(File::open(path)?);
    load_matrix(&mut reader)
}

pub fn save_matrix_file<P: AsRef<Path>>(path: P, data: &MatrixData) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    save_matrix(&mut writer, data)?;
    writer.flush()?;
    Ok(())
}

/// Writes the value of `param` as a DOUBLE matrix.
pub fn save_parameter<W: Write>(writer: &mut W, param: &Parameter) -> Result<()> {
    write_array(writer, ElementType::F64, &param.x)
}

/// Replaces the value of `param` with a FLOAT or DOUBLE matrix of the same
/// shape.
pub fn load_parameter<R: Read>(reader: &mut R, param: &mut Parameter) -> Result<()> {
    let data = load_matrix(reader)?.ok_or_else(|| {
        MatrixFileError::BadFormat(format!("placeholder matrix for {}", param.name()))
    })?;
    let value = match data {
        MatrixData::F64(a) => a,
        MatrixData::F32(a) => a.mapv(f64::from),
        other => {
            return Err(MatrixFileError::ElementType {
                expected: "F32 or F64",
                actual: other.element_type(),
            })
        }
    };
    param.set_value(value)?;
    Ok(())
}

pub fn save_parameter_file<P: AsRef<Path>>(path: P, param: &Parameter) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    save_parameter(&mut writer, param)?;
    writer.flush()?;
    Ok(())
}

pub fn load_parameter_file<P: AsRef<Path>>(path: P, param: &mut Parameter) -> Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    load_parameter(&mut reader, param)
}
