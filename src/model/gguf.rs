//! Synchronous reader for the GGUF model container format.
//!
//! GGUF is a little-endian binary format: a fixed header, a metadata
//! key/value table, a tensor-info table, then an aligned tensor data region.
//! This reader materializes metadata and F32 tensor payloads into memory in
//! one pass; the result is immutable.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::debug;

use crate::error::{EngineError, Result};

/// File magic: the ASCII bytes `GGUF`.
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Container versions this reader accepts.
pub const SUPPORTED_VERSIONS: &str = "2, 3";

/// Default data-region alignment when `general.alignment` is absent.
const DEFAULT_ALIGNMENT: u64 = 32;

/// Upper bound on a single metadata string or array, to keep a corrupt
/// length field from driving a huge allocation.
const MAX_METADATA_LEN: u64 = 64 * 1024 * 1024;

/// Upper bound on elements in a single tensor.
const MAX_TENSOR_ELEMENTS: u64 = 1 << 31;

/// GGML tensor dtype code for F32, the only dtype this build decodes.
const GGML_TYPE_F32: u32 = 0;

/// A decoded metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    /// Type code 0.
    Uint8(u8),
    /// Type code 1.
    Int8(i8),
    /// Type code 2.
    Uint16(u16),
    /// Type code 3.
    Int16(i16),
    /// Type code 4.
    Uint32(u32),
    /// Type code 5.
    Int32(i32),
    /// Type code 6.
    Float32(f32),
    /// Type code 7.
    Bool(bool),
    /// Type code 8: length-prefixed UTF-8.
    String(String),
    /// Type code 9: homogeneous element list.
    Array(Vec<GgufValue>),
    /// Type code 10.
    Uint64(u64),
    /// Type code 11.
    Int64(i64),
    /// Type code 12.
    Float64(f64),
}

impl GgufValue {
    /// Widen any integer-valued variant to u64.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            GgufValue::Uint8(v) => Some(v as u64),
            GgufValue::Uint16(v) => Some(v as u64),
            GgufValue::Uint32(v) => Some(v as u64),
            GgufValue::Uint64(v) => Some(v),
            GgufValue::Int8(v) if v >= 0 => Some(v as u64),
            GgufValue::Int16(v) if v >= 0 => Some(v as u64),
            GgufValue::Int32(v) if v >= 0 => Some(v as u64),
            GgufValue::Int64(v) if v >= 0 => Some(v as u64),
            _ => None,
        }
    }

    /// Narrow a float-valued variant to f32.
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            GgufValue::Float32(v) => Some(v),
            GgufValue::Float64(v) => Some(v as f32),
            _ => None,
        }
    }

    /// Borrow a string variant.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow an array variant's elements.
    pub fn as_array(&self) -> Option<&[GgufValue]> {
        match self {
            GgufValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// Entry of the tensor-info table.
#[derive(Debug, Clone)]
pub struct TensorInfo {
    /// Tensor name, unique within the container.
    pub name: String,
    /// Dimensions, innermost first.
    pub dims: Vec<usize>,
    /// GGML dtype code.
    pub dtype: u32,
    /// Byte offset relative to the start of the data region.
    pub offset: u64,
}

/// A fully materialized F32 tensor.
#[derive(Debug, Clone)]
pub struct Tensor {
    /// Dimensions, innermost first.
    pub dims: Vec<usize>,
    /// Elements in row-major order over the innermost dimension.
    pub data: Vec<f32>,
}

impl Tensor {
    /// Total element count across all dimensions.
    pub fn element_count(&self) -> usize {
        self.data.len()
    }
}

/// A parsed GGUF container.
#[derive(Debug)]
pub struct GgufFile {
    /// Container format version.
    pub version: u32,
    /// Decoded metadata key/value table.
    pub metadata: HashMap<String, GgufValue>,
    /// Materialized tensors by name.
    pub tensors: HashMap<String, Tensor>,
}

impl GgufFile {
    /// Read and validate a container from `path`.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| EngineError::FileAccess {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = GgufReader::new(BufReader::new(file));
        let parsed = reader.parse()?;
        debug!(
            path = %path.display(),
            version = parsed.version,
            metadata_keys = parsed.metadata.len(),
            tensors = parsed.tensors.len(),
            "gguf container loaded"
        );
        Ok(parsed)
    }

    /// Metadata lookup by exact key.
    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.metadata.get(key)
    }

    /// Required integer metadata field.
    pub fn require_u64(&self, key: &str) -> Result<u64> {
        self.get(key)
            .and_then(GgufValue::as_u64)
            .ok_or_else(|| EngineError::Broken(format!("missing or non-integer metadata {key:?}")))
    }

    /// Required string metadata field.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get(key)
            .and_then(GgufValue::as_str)
            .ok_or_else(|| EngineError::Broken(format!("missing or non-string metadata {key:?}")))
    }

    /// Required tensor by name.
    pub fn require_tensor(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| EngineError::Broken(format!("missing tensor {name:?}")))
    }
}

struct GgufReader<R> {
    inner: R,
}

impl<R: Read + Seek> GgufReader<R> {
    fn new(inner: R) -> Self {
        GgufReader { inner }
    }

    fn parse(&mut self) -> Result<GgufFile> {
        let mut magic = [0u8; 4];
        self.read_bytes(&mut magic)?;
        if magic != GGUF_MAGIC {
            return Err(EngineError::Broken(format!(
                "bad magic {magic:02x?}, expected \"GGUF\""
            )));
        }

        let version = self.read_u32()?;
        if version != 2 && version != 3 {
            return Err(EngineError::InvalidVersion {
                found: version,
                supported: SUPPORTED_VERSIONS,
            });
        }

        let tensor_count = self.read_u64()?;
        let kv_count = self.read_u64()?;
        if tensor_count > MAX_METADATA_LEN || kv_count > MAX_METADATA_LEN {
            return Err(EngineError::Broken(format!(
                "implausible table sizes (tensors {tensor_count}, keys {kv_count})"
            )));
        }

        let mut metadata = HashMap::with_capacity(kv_count as usize);
        for _ in 0..kv_count {
            let key = self.read_string()?;
            let value_type = self.read_u32()?;
            let value = self.read_value(value_type)?;
            metadata.insert(key, value);
        }

        let mut infos = Vec::with_capacity(tensor_count as usize);
        for _ in 0..tensor_count {
            infos.push(self.read_tensor_info()?);
        }

        let alignment = metadata
            .get("general.alignment")
            .and_then(GgufValue::as_u64)
            .unwrap_or(DEFAULT_ALIGNMENT);
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(EngineError::Broken(format!(
                "alignment {alignment} is not a power of two"
            )));
        }

        let pos = self
            .inner
            .stream_position()
            .map_err(|e| EngineError::Broken(format!("stream position lost: {e}")))?;
        let data_start = pos.div_ceil(alignment) * alignment;

        let mut tensors = HashMap::with_capacity(infos.len());
        for info in infos {
            let tensor = self.read_tensor(&info, data_start)?;
            tensors.insert(info.name, tensor);
        }

        Ok(GgufFile {
            version,
            metadata,
            tensors,
        })
    }

    fn read_tensor_info(&mut self) -> Result<TensorInfo> {
        let name = self.read_string()?;
        let n_dims = self.read_u32()?;
        if n_dims == 0 || n_dims > 4 {
            return Err(EngineError::Broken(format!(
                "tensor {name:?} has {n_dims} dimensions, expected 1..=4"
            )));
        }
        let mut dims = Vec::with_capacity(n_dims as usize);
        for _ in 0..n_dims {
            let dim = self.read_u64()?;
            if dim == 0 || dim > MAX_TENSOR_ELEMENTS {
                return Err(EngineError::Broken(format!(
                    "tensor {name:?} has implausible dimension {dim}"
                )));
            }
            dims.push(dim as usize);
        }
        let dtype = self.read_u32()?;
        let offset = self.read_u64()?;
        Ok(TensorInfo {
            name,
            dims,
            dtype,
            offset,
        })
    }

    fn read_tensor(&mut self, info: &TensorInfo, data_start: u64) -> Result<Tensor> {
        if info.dtype != GGML_TYPE_F32 {
            return Err(EngineError::Unimplemented(format!(
                "tensor {:?} uses dtype {}; only F32 (0) is decoded in this build",
                info.name, info.dtype
            )));
        }

        let elements = info
            .dims
            .iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(d as u64))
            .filter(|&n| n <= MAX_TENSOR_ELEMENTS)
            .ok_or_else(|| {
                EngineError::MemoryInsufficient(format!(
                    "tensor {:?} dimensions {:?} overflow the element budget",
                    info.name, info.dims
                ))
            })?;

        self.inner
            .seek(SeekFrom::Start(data_start + info.offset))
            .map_err(|e| EngineError::Broken(format!("tensor {:?} seek failed: {e}", info.name)))?;

        let mut data = vec![0f32; elements as usize];
        let mut buf = [0u8; 4];
        for slot in &mut data {
            self.read_bytes(&mut buf)?;
            *slot = f32::from_le_bytes(buf);
        }

        Ok(Tensor {
            dims: info.dims.clone(),
            data,
        })
    }

    fn read_value(&mut self, value_type: u32) -> Result<GgufValue> {
        let value = match value_type {
            0 => GgufValue::Uint8(self.read_fixed::<1>()?[0]),
            1 => GgufValue::Int8(self.read_fixed::<1>()?[0] as i8),
            2 => GgufValue::Uint16(u16::from_le_bytes(self.read_fixed::<2>()?)),
            3 => GgufValue::Int16(i16::from_le_bytes(self.read_fixed::<2>()?)),
            4 => GgufValue::Uint32(u32::from_le_bytes(self.read_fixed::<4>()?)),
            5 => GgufValue::Int32(i32::from_le_bytes(self.read_fixed::<4>()?)),
            6 => GgufValue::Float32(f32::from_le_bytes(self.read_fixed::<4>()?)),
            7 => match self.read_fixed::<1>()?[0] {
                0 => GgufValue::Bool(false),
                1 => GgufValue::Bool(true),
                other => {
                    return Err(EngineError::Broken(format!("invalid bool byte {other}")));
                }
            },
            8 => GgufValue::String(self.read_string()?),
            9 => {
                let elem_type = self.read_u32()?;
                let count = self.read_u64()?;
                if count > MAX_METADATA_LEN {
                    return Err(EngineError::Broken(format!(
                        "metadata array of {count} elements is implausible"
                    )));
                }
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(self.read_value(elem_type)?);
                }
                GgufValue::Array(items)
            }
            10 => GgufValue::Uint64(u64::from_le_bytes(self.read_fixed::<8>()?)),
            11 => GgufValue::Int64(i64::from_le_bytes(self.read_fixed::<8>()?)),
            12 => GgufValue::Float64(f64::from_le_bytes(self.read_fixed::<8>()?)),
            other => {
                return Err(EngineError::Broken(format!(
                    "unknown metadata value type {other}"
                )));
            }
        };
        Ok(value)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u64()?;
        if len > MAX_METADATA_LEN {
            return Err(EngineError::Broken(format!(
                "string of {len} bytes is implausible"
            )));
        }
        let mut bytes = vec![0u8; len as usize];
        self.read_bytes(&mut bytes)?;
        String::from_utf8(bytes).map_err(|_| EngineError::Broken("non-UTF-8 string".into()))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_fixed::<4>()?))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_fixed::<8>()?))
    }

    fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_bytes(&mut buf)?;
        Ok(buf)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                EngineError::Broken("container truncated".into())
            } else {
                EngineError::Other(format!("read failed: {e}"))
            }
        })
    }
}
