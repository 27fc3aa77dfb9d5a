//! Artifact Store
//!
//! Uniform byte encoding for the heterogeneous members of a cache record:
//! raster images, numeric tensors and opaque blobs.
//!
//! Two encodings exist:
//!
//! - **Body**: the bare representation of one value. Images are PNG, tensors
//!   use a small versioned binary layout, blobs are their raw bytes. The L2
//!   tier writes bodies and lets the file extension carry the kind.
//! - **Envelope**: a tagged, self-describing frame around a body, used when
//!   no file name is available to carry the kind (origin objects).
//!
//! ```text
//! envelope := "VTAF" | version:u8 | kind:u8 | compression:u8 | body
//! tensor   := "VTNS" | version:u8 | dtype:u8 | ndim:u8 | dim:u64le * ndim | data
//! ```
//!
//! Both encodings round-trip exactly: tensors are byte-identical and images
//! pixel-identical. Pure transforms; all I/O belongs to the caller.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use image::ImageEncoder;

use super::compression::{CompressionAlgorithm, CompressionManager};
use crate::error::{Error, Result};

const ENVELOPE_MAGIC: &[u8; 4] = b"VTAF";
const ENVELOPE_VERSION: u8 = 1;
const TENSOR_MAGIC: &[u8; 4] = b"VTNS";
const TENSOR_VERSION: u8 = 1;
const MAX_TENSOR_DIMS: usize = 8;

// =============================================================================
// Tensors
// =============================================================================

/// Tensor element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    U8,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    /// Element size in bytes
    pub fn size(&self) -> usize {
        match self {
            DType::U8 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    fn code(&self) -> u8 {
        match self {
            DType::U8 => 0,
            DType::I32 => 1,
            DType::I64 => 2,
            DType::F16 => 3,
            DType::BF16 => 4,
            DType::F32 => 5,
            DType::F64 => 6,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => DType::U8,
            1 => DType::I32,
            2 => DType::I64,
            3 => DType::F16,
            4 => DType::BF16,
            5 => DType::F32,
            6 => DType::F64,
            other => {
                return Err(Error::ArtifactDecode(format!("unknown dtype code {}", other)))
            }
        })
    }
}

/// Dense row-major tensor; `data` holds little-endian elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Bytes,
}

impl Tensor {
    /// Create a tensor, checking that `data` matches `shape` exactly
    pub fn new(dtype: DType, shape: Vec<usize>, data: Bytes) -> Result<Self> {
        if shape.len() > MAX_TENSOR_DIMS {
            return Err(Error::ArtifactEncode(format!(
                "tensor rank {} exceeds {}",
                shape.len(),
                MAX_TENSOR_DIMS
            )));
        }
        let expected = shape
            .iter()
            .try_fold(dtype.size(), |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| Error::ArtifactEncode("tensor size overflows".into()))?;
        if expected != data.len() {
            return Err(Error::ArtifactEncode(format!(
                "tensor shape {:?} of {:?} needs {} bytes, got {}",
                shape,
                dtype,
                expected,
                data.len()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    /// Build an f32 tensor from values
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let mut buf = BytesMut::with_capacity(values.len() * 4);
        for v in values {
            buf.put_f32_le(*v);
        }
        Self::new(DType::F32, shape, buf.freeze())
    }

    /// Read back f32 values (`None` for other dtypes)
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        if self.dtype != DType::F32 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Element size times element count
    pub fn size_bytes(&self) -> u64 {
        (self.dtype.size() * self.numel()) as u64
    }
}

// =============================================================================
// Images
// =============================================================================

/// 8-bit pixel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Luma8,
    Rgb8,
    Rgba8,
}

impl PixelFormat {
    pub fn channels(&self) -> usize {
        match self {
            PixelFormat::Luma8 => 1,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }

    fn color_type(&self) -> image::ExtendedColorType {
        match self {
            PixelFormat::Luma8 => image::ExtendedColorType::L8,
            PixelFormat::Rgb8 => image::ExtendedColorType::Rgb8,
            PixelFormat::Rgba8 => image::ExtendedColorType::Rgba8,
        }
    }
}

/// Decoded raster image
#[derive(Clone, PartialEq, Eq)]
pub struct RasterImage {
    width: u32,
    height: u32,
    format: PixelFormat,
    pixels: Bytes,
}

impl RasterImage {
    /// Create an image, checking the pixel buffer length
    pub fn new(width: u32, height: u32, format: PixelFormat, pixels: Bytes) -> Result<Self> {
        let expected = width as usize * height as usize * format.channels();
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(Error::ArtifactEncode(format!(
                "{}x{} {:?} image needs {} bytes, got {}",
                width,
                height,
                format,
                expected,
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            pixels,
        })
    }

    /// Encode as PNG
    pub fn to_png(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        image::codecs::png::PngEncoder::new(&mut out)
            .write_image(
                &self.pixels,
                self.width,
                self.height,
                self.format.color_type(),
            )
            .map_err(|e| Error::ArtifactEncode(format!("png encode: {}", e)))?;
        Ok(out)
    }

    /// Decode any supported image container.
    ///
    /// 8-bit gray, RGB and RGBA keep their layout; anything else is
    /// converted to RGBA8.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| Error::ArtifactDecode(format!("image decode: {}", e)))?;
        let (width, height) = (decoded.width(), decoded.height());
        let (format, pixels) = match decoded {
            image::DynamicImage::ImageLuma8(buf) => (PixelFormat::Luma8, buf.into_raw()),
            image::DynamicImage::ImageRgb8(buf) => (PixelFormat::Rgb8, buf.into_raw()),
            image::DynamicImage::ImageRgba8(buf) => (PixelFormat::Rgba8, buf.into_raw()),
            other => (PixelFormat::Rgba8, other.to_rgba8().into_raw()),
        };
        Self::new(width, height, format, Bytes::from(pixels))
            .map_err(|e| Error::ArtifactDecode(e.to_string()))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    /// Raw pixel buffer length
    pub fn size_bytes(&self) -> u64 {
        self.pixels.len() as u64
    }
}

impl fmt::Debug for RasterImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RasterImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish()
    }
}

// =============================================================================
// Artifacts
// =============================================================================

/// Kind discriminator shared by envelopes and L2 file extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Image,
    Tensor,
    Blob,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [ArtifactKind::Image, ArtifactKind::Tensor, ArtifactKind::Blob];

    /// File extension used by the disk tier
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Image => "png",
            ArtifactKind::Tensor => "tensor",
            ArtifactKind::Blob => "bin",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        ArtifactKind::ALL.into_iter().find(|k| k.extension() == ext)
    }

    fn tag(&self) -> u8 {
        match self {
            ArtifactKind::Image => 1,
            ArtifactKind::Tensor => 2,
            ArtifactKind::Blob => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        ArtifactKind::ALL
            .into_iter()
            .find(|k| k.tag() == tag)
            .ok_or_else(|| Error::ArtifactDecode(format!("unknown artifact tag {}", tag)))
    }
}

/// One named member of a cache record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Image(RasterImage),
    Tensor(Tensor),
    Blob(Bytes),
}

impl Artifact {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Artifact::Image(_) => ArtifactKind::Image,
            Artifact::Tensor(_) => ArtifactKind::Tensor,
            Artifact::Blob(_) => ArtifactKind::Blob,
        }
    }

    /// Exact in-memory footprint
    pub fn size_bytes(&self) -> u64 {
        match self {
            Artifact::Image(img) => img.size_bytes(),
            Artifact::Tensor(t) => t.size_bytes(),
            Artifact::Blob(b) => b.len() as u64,
        }
    }

    pub fn as_image(&self) -> Option<&RasterImage> {
        match self {
            Artifact::Image(img) => Some(img),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Artifact::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

impl From<RasterImage> for Artifact {
    fn from(img: RasterImage) -> Self {
        Artifact::Image(img)
    }
}

impl From<Tensor> for Artifact {
    fn from(t: Tensor) -> Self {
        Artifact::Tensor(t)
    }
}

// =============================================================================
// Artifact Store
// =============================================================================

/// Serializer for artifacts
pub struct ArtifactStore {
    compression: CompressionManager,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::with_compression(CompressionManager::new())
    }

    pub fn with_compression(compression: CompressionManager) -> Self {
        Self { compression }
    }

    /// Encode the bare body of an artifact
    pub fn encode_body(artifact: &Artifact) -> Result<Bytes> {
        match artifact {
            Artifact::Image(img) => Ok(Bytes::from(img.to_png()?)),
            Artifact::Tensor(t) => Ok(encode_tensor(t)),
            Artifact::Blob(b) => Ok(b.clone()),
        }
    }

    /// Decode a bare body whose kind is known from context
    pub fn decode_body(kind: ArtifactKind, body: &[u8]) -> Result<Artifact> {
        match kind {
            ArtifactKind::Image => RasterImage::decode(body).map(Artifact::Image),
            ArtifactKind::Tensor => decode_tensor(body).map(Artifact::Tensor),
            ArtifactKind::Blob => Ok(Artifact::Blob(Bytes::copy_from_slice(body))),
        }
    }

    /// Serialize to a self-describing envelope
    pub fn serialize(&self, artifact: &Artifact) -> Result<Bytes> {
        let body = Self::encode_body(artifact)?;
        let (body, algorithm) = self.compression.compress(&body);

        let mut out = BytesMut::with_capacity(body.len() + 7);
        out.put_slice(ENVELOPE_MAGIC);
        out.put_u8(ENVELOPE_VERSION);
        out.put_u8(artifact.kind().tag());
        out.put_u8(algorithm.wire_code());
        out.put_slice(&body);
        Ok(out.freeze())
    }

    /// Deserialize an envelope produced by [`ArtifactStore::serialize`]
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Artifact> {
        if bytes.len() < 7 || &bytes[..4] != ENVELOPE_MAGIC {
            return Err(Error::ArtifactDecode("missing envelope header".into()));
        }
        if bytes[4] != ENVELOPE_VERSION {
            return Err(Error::ArtifactDecode(format!(
                "unsupported envelope version {}",
                bytes[4]
            )));
        }
        let kind = ArtifactKind::from_tag(bytes[5])?;
        let algorithm = CompressionAlgorithm::from_wire_code(bytes[6])?;
        let body = self.compression.decompress(&bytes[7..], algorithm)?;
        Self::decode_body(kind, &body)
    }
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_tensor(t: &Tensor) -> Bytes {
    let mut out = BytesMut::with_capacity(7 + t.shape.len() * 8 + t.data.len());
    out.put_slice(TENSOR_MAGIC);
    out.put_u8(TENSOR_VERSION);
    out.put_u8(t.dtype.code());
    out.put_u8(t.shape.len() as u8);
    for &dim in &t.shape {
        out.put_u64_le(dim as u64);
    }
    out.put_slice(&t.data);
    out.freeze()
}

fn decode_tensor(body: &[u8]) -> Result<Tensor> {
    if body.len() < 7 || &body[..4] != TENSOR_MAGIC {
        return Err(Error::ArtifactDecode("missing tensor header".into()));
    }
    if body[4] != TENSOR_VERSION {
        return Err(Error::ArtifactDecode(format!(
            "unsupported tensor version {}",
            body[4]
        )));
    }
    let dtype = DType::from_code(body[5])?;
    let ndim = body[6] as usize;
    if ndim > MAX_TENSOR_DIMS {
        return Err(Error::ArtifactDecode(format!("tensor rank {} too large", ndim)));
    }
    let dims_end = 7 + ndim * 8;
    if body.len() < dims_end {
        return Err(Error::ArtifactDecode("truncated tensor shape".into()));
    }
    let shape = body[7..dims_end]
        .chunks_exact(8)
        .map(|c| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(c);
            usize::try_from(u64::from_le_bytes(raw))
                .map_err(|_| Error::ArtifactDecode("tensor dim overflows usize".into()))
        })
        .collect::<Result<Vec<_>>>()?;

    Tensor::new(dtype, shape, Bytes::copy_from_slice(&body[dims_end..]))
        .map_err(|e| Error::ArtifactDecode(e.to_string()))
}

// =============================================================================
// Tests
// =============================================================================
