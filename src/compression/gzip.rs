use crate::compression::CodecImpl;
use flate2::{FlushCompress, FlushDecompress};
use std::io;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config {
    pub compression_level: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compression_level: 9,
        }
    }
}

impl super::Config for Config {
    fn set(&mut self, field: &str, value: &str) -> io::Result<()> {
        match field {
            "compression_level" => {
                self.compression_level = super::parse_level(value, 1..=9)?;
            }
            _ => return Err(super::unknown_field(field)),
        }
        Ok(())
    }
}

/// Deflate through `flate2`, framed as a zlib stream
#[derive(Debug)]
pub struct Gzip;

#[derive(Debug)]
pub struct GzipCompressor(flate2::Compress);

#[derive(Debug)]
pub struct GzipDecompressor(flate2::Decompress);

impl CodecImpl for Gzip {
    type Compressor = GzipCompressor;
    type Decompressor = GzipDecompressor;
    type Config = Config;

    fn compressor(config: Self::Config) -> Self::Compressor {
        let level = flate2::Compression::new(config.compression_level);
        GzipCompressor(flate2::Compress::new(level, true))
    }

    fn decompressor(_config: Self::Config) -> Self::Decompressor {
        GzipDecompressor(flate2::Decompress::new(true))
    }

    fn max_compressed_size(len: usize) -> usize {
        // Stored blocks cost 5 bytes per 64KiB, plus the zlib header and trailer
        len + (len >> 5) + 64
    }
}

impl super::Compressor for GzipCompressor {
    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<usize> {
        let compressor = &mut self.0;
        compressor.reset();
        loop {
            let in_offset = min_mem(compressor.total_in(), src.len());
            let input = &src[in_offset..];

            let out_offset = min_mem(compressor.total_out(), dst.len());
            let output = &mut dst[out_offset..];

            let before = (compressor.total_in(), compressor.total_out());
            let status = compressor.compress(input, output, FlushCompress::Finish)?;
            let progressed = before != (compressor.total_in(), compressor.total_out());
            match status {
                flate2::Status::Ok if progressed => continue,
                flate2::Status::Ok | flate2::Status::BufError => {
                    return Err(io::ErrorKind::UnexpectedEof.into())
                }
                flate2::Status::StreamEnd => break,
            }
        }
        Ok(compressor.total_out() as usize)
    }
}

impl super::Decompressor for GzipDecompressor {
    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<usize> {
        let decompressor = &mut self.0;
        decompressor.reset(true);
        loop {
            let in_offset = min_mem(decompressor.total_in(), src.len());
            let input = &src[in_offset..];

            let out_offset = min_mem(decompressor.total_out(), dst.len());
            let output = &mut dst[out_offset..];

            let before = (decompressor.total_in(), decompressor.total_out());
            let status = decompressor.decompress(input, output, FlushDecompress::Finish)?;
            let progressed = before != (decompressor.total_in(), decompressor.total_out());
            match status {
                flate2::Status::Ok if progressed => continue,
                flate2::Status::Ok | flate2::Status::BufError => {
                    return Err(io::ErrorKind::UnexpectedEof.into())
                }
                flate2::Status::StreamEnd => break,
            }
        }
        Ok(decompressor.total_out() as usize)
    }
}

fn min_mem(file_size: u64, mem_size: usize) -> usize {
    if file_size < mem_size as u64 {
        file_size as usize
    } else {
        mem_size
    }
}
