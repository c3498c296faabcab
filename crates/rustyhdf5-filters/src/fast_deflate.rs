//! Deflate backends.
//!
//! `flate2` is the primary backend. With the `fast-deflate` feature it links
//! zlib-ng, which is what C HDF5 uses; without it flate2 runs on its pure-Rust
//! miniz_oxide backend. The raw `miniz_oxide` entry points are always
//! available for cross-checking.

use std::io::{Read, Write};

/// Decompress zlib data.
///
/// When `output_hint` > 0 the output buffer is pre-sized, which is the common
/// case for chunk data since the decoded chunk size is known up front.
pub fn decompress(data: &[u8], output_hint: usize) -> Result<Vec<u8>, String> {
    if output_hint > 0 {
        decompress_preallocated(data, output_hint)
    } else {
        let mut decoder = flate2::read::ZlibDecoder::new(data);
        let mut result = Vec::new();
        decoder.read_to_end(&mut result).map_err(|e| e.to_string())?;
        Ok(result)
    }
}

fn decompress_preallocated(data: &[u8], output_size: usize) -> Result<Vec<u8>, String> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut output = vec![0u8; output_size];
    let mut total_read = 0;

    loop {
        if total_read == output.len() {
            // The hint was short; fall back to growing the buffer.
            let mut rest = Vec::new();
            decoder.read_to_end(&mut rest).map_err(|e| e.to_string())?;
            output.extend_from_slice(&rest);
            return Ok(output);
        }
        match decoder.read(&mut output[total_read..]) {
            Ok(0) => break,
            Ok(n) => total_read += n,
            Err(e) => return Err(e.to_string()),
        }
    }
    output.truncate(total_read);
    Ok(output)
}

/// Decompress zlib data, failing once the output would exceed `max_output`
/// bytes. Corrupt or hostile input stops there instead of inflating on.
pub fn decompress_bounded(data: &[u8], max_output: usize) -> Result<Vec<u8>, String> {
    let decoder = flate2::read::ZlibDecoder::new(data);
    let mut output = Vec::with_capacity(max_output);
    decoder
        .take(max_output as u64 + 1)
        .read_to_end(&mut output)
        .map_err(|e| e.to_string())?;
    if output.len() > max_output {
        return Err(format!("decompressed data exceeds {max_output} bytes"));
    }
    Ok(output)
}

/// Compress data with zlib at the given level (0-9).
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>, String> {
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(level.min(9)));
    encoder.write_all(data).map_err(|e| e.to_string())?;
    encoder.finish().map_err(|e| e.to_string())
}

/// Decompress with the raw miniz_oxide inflater.
pub fn decompress_miniz(data: &[u8]) -> Result<Vec<u8>, String> {
    miniz_oxide::inflate::decompress_to_vec_zlib(data)
        .map_err(|e| format!("miniz_oxide decompress error: {e:?}"))
}

/// Compress with the raw miniz_oxide deflater.
pub fn compress_miniz(data: &[u8], level: u32) -> Vec<u8> {
    miniz_oxide::deflate::compress_to_vec_zlib(data, level.min(10) as u8)
}

/// Name of the backend flate2 was built with.
pub fn active_backend() -> &'static str {
    if cfg!(feature = "fast-deflate") {
        "zlib-ng"
    } else {
        "miniz_oxide"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_hint() {
        let data: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        let compressed = compress(&data, 6).unwrap();
        assert_eq!(decompress(&compressed, data.len()).unwrap(), data);
    }

    #[test]
    fn short_hint_still_decodes_everything() {
        let data = vec![7u8; 1000];
        let compressed = compress(&data, 6).unwrap();
        assert_eq!(decompress(&compressed, 10).unwrap(), data);
    }

    #[test]
    fn python_zlib_stream() {
        // python3 -c "import zlib; print(list(zlib.compress(bytes(range(10)), 6)))"
        let compressed: Vec<u8> = vec![
            120, 156, 99, 96, 100, 98, 102, 97, 101, 99, 231, 224, 4, 0, 0, 175, 0, 46,
        ];
        assert_eq!(decompress(&compressed, 0).unwrap(), (0..10).collect::<Vec<u8>>());
        assert_eq!(decompress_miniz(&compressed).unwrap(), (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn miniz_and_flate2_interoperate() {
        let data: Vec<u8> = (0..500).map(|i| (i * 7 % 256) as u8).collect();
        let a = compress_miniz(&data, 6);
        assert_eq!(decompress(&a, data.len()).unwrap(), data);
        let b = compress(&data, 6).unwrap();
        assert_eq!(decompress_miniz(&b).unwrap(), data);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decompress(&[1, 2, 3, 4], 16).is_err());
    }
}
