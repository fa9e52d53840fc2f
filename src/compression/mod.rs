use repr::compression::Id as CompressionId;
use std::{fmt, io};

#[cfg(feature = "gzip")]
pub mod gzip;

#[cfg(feature = "zstd")]
pub mod zstd;

#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    /// Deflate in a zlib stream (header and adler32 trailer), not the gzip file format
    Gzip = CompressionId::GZIP.0,
    Zstd = CompressionId::ZSTD.0,
    Unknown = 0,
}

#[derive(Debug)]
pub struct Codec<C: CodecImpl> {
    config: C::Config,
    comp: C::Compressor,
    decomp: C::Decompressor,
}

impl<C: CodecImpl> Codec<C> {
    #[cfg(test)]
    fn new() -> Self {
        Self::with_config(Default::default())
    }

    fn with_config(config: C::Config) -> Self {
        Self {
            config: config.clone(),
            comp: C::compressor(config.clone()),
            decomp: C::decompressor(config),
        }
    }
}

impl<C: CodecImpl> Compressor for Codec<C> {
    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<usize> {
        self.comp.compress(src, dst)
    }
}

impl<C: CodecImpl> Decompressor for Codec<C> {
    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<usize> {
        self.decomp.decompress(src, dst)
    }
}

impl<C: CodecImpl> Clone for Codec<C> {
    fn clone(&self) -> Self {
        Self::with_config(self.config.clone())
    }
}

/// A codec chosen at runtime
///
/// Each instance holds its own compression state, so it must not be shared between threads.
/// Clone it instead.
#[derive(Debug, Clone)]
pub enum AnyCodec {
    #[cfg(feature = "gzip")]
    Gzip(Codec<gzip::Gzip>),
    #[cfg(feature = "zstd")]
    Zstd(Codec<zstd::Zstd>),
}

impl AnyCodec {
    pub fn new(kind: Kind) -> crate::Result<AnyCodec> {
        Self::configured(kind, &[])
    }

    /// Create a codec, applying `(field, value)` options in order
    pub fn configured(kind: Kind, options: &[(String, String)]) -> crate::Result<AnyCodec> {
        fn apply<C: Config>(options: &[(String, String)]) -> io::Result<C> {
            let mut config = C::default();
            for (field, value) in options {
                config.set(field, value)?;
            }
            Ok(config)
        }

        let invalid = |e: io::Error| crate::Error::InvalidConfig(e.to_string());
        let result = match kind {
            #[cfg(feature = "gzip")]
            Kind::Gzip => AnyCodec::Gzip(Codec::with_config(apply(options).map_err(invalid)?)),
            #[cfg(feature = "zstd")]
            Kind::Zstd => AnyCodec::Zstd(Codec::with_config(apply(options).map_err(invalid)?)),
            _ => return Err(crate::Error::DisabledCompression(kind)),
        };
        Ok(result)
    }

    pub fn config(&self) -> &dyn fmt::Debug {
        match self {
            #[cfg(feature = "gzip")]
            AnyCodec::Gzip(codec) => &codec.config,
            #[cfg(feature = "zstd")]
            AnyCodec::Zstd(codec) => &codec.config,
        }
    }

    pub fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(feature = "gzip")]
            AnyCodec::Gzip(gzip) => gzip.comp.compress(src, dst),
            #[cfg(feature = "zstd")]
            AnyCodec::Zstd(zstd) => zstd.comp.compress(src, dst),
        }
    }

    pub fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(feature = "gzip")]
            AnyCodec::Gzip(gzip) => gzip.decomp.decompress(src, dst),
            #[cfg(feature = "zstd")]
            AnyCodec::Zstd(zstd) => zstd.decomp.decompress(src, dst),
        }
    }

    /// The largest output `compress` can produce for `len` input bytes
    pub fn max_compressed_size(&self, len: usize) -> usize {
        match self {
            #[cfg(feature = "gzip")]
            AnyCodec::Gzip(_) => gzip::Gzip::max_compressed_size(len),
            #[cfg(feature = "zstd")]
            AnyCodec::Zstd(_) => zstd::Zstd::max_compressed_size(len),
        }
    }

    /// Compress all of `src`, replacing the contents of `dst`
    pub fn compress_into(&mut self, src: &[u8], dst: &mut Vec<u8>) -> io::Result<()> {
        dst.clear();
        dst.resize(self.max_compressed_size(src.len()), 0);
        let n = self.compress(src, dst)?;
        dst.truncate(n);
        Ok(())
    }

    /// Decompress `src` into `dst`, which must not grow past `max_size` bytes
    pub fn decompress_into(
        &mut self,
        src: &[u8],
        dst: &mut Vec<u8>,
        max_size: usize,
    ) -> io::Result<()> {
        dst.clear();
        dst.resize(max_size, 0);
        let n = self.decompress(src, dst)?;
        dst.truncate(n);
        Ok(())
    }

    pub fn kind(&self) -> Kind {
        match *self {
            #[cfg(feature = "gzip")]
            AnyCodec::Gzip(_) => Kind::Gzip,
            #[cfg(feature = "zstd")]
            AnyCodec::Zstd(_) => Kind::Zstd,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Default for Kind {
    fn default() -> Self {
        if cfg!(feature = "zstd") {
            Kind::Zstd
        } else {
            Kind::Gzip
        }
    }
}

impl Kind {
    pub fn from_name(name: &str) -> Kind {
        match name {
            "gzip" => Kind::Gzip,
            "zstd" => Kind::Zstd,
            _ => Kind::Unknown,
        }
    }

    pub fn from_id(id: CompressionId) -> Kind {
        match id {
            CompressionId::GZIP => Kind::Gzip,
            CompressionId::ZSTD => Kind::Zstd,
            _ => Kind::Unknown,
        }
    }

    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::Gzip => "gzip",
            Kind::Zstd => "zstd",
            Kind::Unknown => "unknown",
        }
    }

    pub fn supported(self) -> bool {
        match self {
            Kind::Gzip => cfg!(feature = "gzip"),
            Kind::Zstd => cfg!(feature = "zstd"),
            Kind::Unknown => false,
        }
    }
}

pub trait Compressor {
    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<usize>;
}

pub trait Decompressor {
    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<usize>;
}

pub trait Config: fmt::Debug + Default + Clone + Send {
    fn set(&mut self, field: &str, value: &str) -> io::Result<()>;
}

pub trait CodecImpl {
    type Compressor: Compressor + Send;
    type Decompressor: Decompressor + Send;
    type Config: Config;

    fn compressor(config: Self::Config) -> Self::Compressor;
    fn decompressor(config: Self::Config) -> Self::Decompressor;
    fn max_compressed_size(len: usize) -> usize;
}

pub(crate) fn parse_level<T: std::str::FromStr + PartialOrd + fmt::Display>(
    value: &str,
    range: std::ops::RangeInclusive<T>,
) -> io::Result<T> {
    let level: T = value
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Invalid compression_level"))?;
    if !range.contains(&level) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "compression_level {} is outside {}..={}",
                level,
                range.start(),
                range.end()
            ),
        ));
    }
    Ok(level)
}

pub(crate) fn unknown_field(field: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("Unknown field {}", field),
    )
}
