use crate::compression::CodecImpl;
use std::fmt::Formatter;
use std::{fmt, io};
use zstd::bulk as zbulk;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config {
    pub compression_level: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compression_level: 12,
        }
    }
}

#[derive(Debug)]
pub struct Zstd;

pub struct ZstdCompressor(Option<zbulk::Compressor<'static>>, i32);

pub struct ZstdDecompressor(Option<zbulk::Decompressor<'static>>);

impl super::Compressor for ZstdCompressor {
    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<usize> {
        let level = self.1;
        let compressor = match &mut self.0 {
            Some(compressor) => compressor,
            slot => slot.get_or_insert(zbulk::Compressor::new(level)?),
        };
        compressor.compress_to_buffer(src, dst)
    }
}

impl super::Decompressor for ZstdDecompressor {
    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<usize> {
        let decompressor = match &mut self.0 {
            Some(decompressor) => decompressor,
            slot => slot.get_or_insert(zbulk::Decompressor::new()?),
        };
        decompressor.decompress_to_buffer(src, dst)
    }
}

impl super::Config for Config {
    fn set(&mut self, field: &str, value: &str) -> io::Result<()> {
        match field {
            "compression_level" => {
                self.compression_level = super::parse_level(value, 1..=22)?;
            }
            _ => return Err(super::unknown_field(field)),
        }
        Ok(())
    }
}

impl CodecImpl for Zstd {
    type Compressor = ZstdCompressor;
    type Decompressor = ZstdDecompressor;
    type Config = Config;

    fn compressor(config: Self::Config) -> Self::Compressor {
        // Context creation can fail on allocation, so it is deferred to the first call
        ZstdCompressor(None, config.compression_level)
    }

    fn decompressor(_config: Self::Config) -> Self::Decompressor {
        ZstdDecompressor(None)
    }

    fn max_compressed_size(len: usize) -> usize {
        // ZSTD_COMPRESSBOUND
        let small_input_margin = if len < (128 << 10) {
            ((128 << 10) - len) >> 11
        } else {
            0
        };
        len + (len >> 8) + small_input_margin
    }
}

impl fmt::Debug for ZstdCompressor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ZstdCompressor").field(&self.1).finish()
    }
}

impl fmt::Debug for ZstdDecompressor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ZstdDecompressor").finish()
    }
}
