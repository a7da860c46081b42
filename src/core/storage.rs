//! Binary framing shared by memory snapshots and model checkpoints.
//!
//! Every file is `magic[8] | version u32 | chunk*`, where a chunk is
//! `tag[4] | len u32 | uncompressed_len u32 | lz4 payload`. Readers skip
//! tags they do not know so older binaries can open newer files.

use std::io::{self, Read, Write};

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    // Strict format: raw LZ4 block with external expected size.
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u64_le<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_u64_le<R: Read>(r: &mut R) -> io::Result<u64> {
    Ok(u64::from_le_bytes(read_exact::<8, _>(r)?))
}

/// Encode a slice of `f32` as raw little-endian bits (exact round trip, NaN payloads included).
pub fn f32s_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn bytes_to_f32s(bytes: &[u8]) -> io::Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(invalid_data("f32 payload length is not a multiple of 4"));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn f64s_to_bytes(values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn bytes_to_f64s(bytes: &[u8]) -> io::Result<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return Err(invalid_data("f64 payload length is not a multiple of 8"));
    }
    let mut out = Vec::with_capacity(bytes.len() / 8);
    for c in bytes.chunks_exact(8) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(c);
        out.push(f64::from_le_bytes(raw));
    }
    Ok(out)
}

pub fn u64s_to_bytes(values: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn bytes_to_u64s(bytes: &[u8]) -> io::Result<Vec<u64>> {
    if bytes.len() % 8 != 0 {
        return Err(invalid_data("u64 payload length is not a multiple of 8"));
    }
    let mut out = Vec::with_capacity(bytes.len() / 8);
    for c in bytes.chunks_exact(8) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(c);
        out.push(u64::from_le_bytes(raw));
    }
    Ok(out)
}

pub fn u32s_to_bytes(values: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn bytes_to_u32s(bytes: &[u8]) -> io::Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(invalid_data("u32 payload length is not a multiple of 4"));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Write the file preamble.
pub fn write_header<W: Write>(w: &mut W, magic: &[u8; 8], version: u32) -> io::Result<()> {
    w.write_all(magic)?;
    write_u32_le(w, version)
}

/// Read and check the file preamble, returning the version.
pub fn read_header<R: Read>(r: &mut R, magic: &[u8; 8], max_version: u32) -> io::Result<u32> {
    let got = read_exact::<8, _>(r)?;
    if &got != magic {
        return Err(invalid_data("bad magic"));
    }
    let version = read_u32_le(r)?;
    if version == 0 || version > max_version {
        return Err(invalid_data("unsupported version"));
    }
    Ok(version)
}

/// Write a chunk: payload is LZ4-compressed and preceded by the uncompressed length (u32).
///
/// Layout:
/// - tag: [u8;4]
/// - len: u32 (bytes following, including the 4-byte uncompressed length)
/// - uncompressed_len: u32
/// - compressed payload bytes
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?;
    let total_len = 4u32.saturating_add(
        u32::try_from(compressed.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?,
    );

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}

/// Read the next chunk and decompress it. Returns `Ok(None)` at a clean end of file.
pub fn read_chunk_lz4<R: Read>(r: &mut R) -> io::Result<Option<([u8; 4], Vec<u8>)>> {
    let (tag, len) = match read_chunk_header(r) {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut take = r.take(len as u64);
    let uncompressed_len = read_u32_le(&mut take)? as usize;
    let mut compressed = Vec::with_capacity((len as usize).saturating_sub(4));
    take.read_to_end(&mut compressed)?;
    if compressed.len() + 4 != len as usize {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated chunk",
        ));
    }
    let payload = decompress_lz4(&compressed, uncompressed_len)?;
    Ok(Some((tag, payload)))
}

pub(crate) fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
