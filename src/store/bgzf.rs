//! BGZF helpers: `.gzi` offset indexes, ranged decompression, and
//! compression of plain shards.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

/// Sibling `.gzi` key for a compressed object.
pub fn gzi_key(object: &str) -> String {
    format!("{}.gzi", object)
}

/// Offsets of BGZF block starts as `(compressed, uncompressed)` pairs.
///
/// The serialized form (bgzip's `.gzi`) omits the implicit `(0, 0)` entry;
/// in memory it is kept at position 0 so range mapping can binary-search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GziIndex {
    entries: Vec<(u64, u64)>,
}

impl GziIndex {
    /// Parse the serialized `.gzi` form.
    pub fn parse(bytes: &[u8]) -> Result<Self, anyhow::Error> {
        let mut reader = std::io::Cursor::new(bytes);
        let count = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| anyhow::anyhow!("could not read gzi entry count: {}", e))?;
        let mut entries = Vec::with_capacity(count as usize + 1);
        entries.push((0, 0));
        for _ in 0..count {
            let compressed = reader
                .read_u64::<LittleEndian>()
                .map_err(|e| anyhow::anyhow!("could not read gzi entry: {}", e))?;
            let uncompressed = reader
                .read_u64::<LittleEndian>()
                .map_err(|e| anyhow::anyhow!("could not read gzi entry: {}", e))?;
            entries.push((compressed, uncompressed));
        }
        Ok(Self { entries })
    }

    /// Serialize to the `.gzi` wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + (self.entries.len() - 1) * 16);
        out.extend_from_slice(&((self.entries.len() - 1) as u64).to_le_bytes());
        for &(compressed, uncompressed) in &self.entries[1..] {
            out.extend_from_slice(&compressed.to_le_bytes());
            out.extend_from_slice(&uncompressed.to_le_bytes());
        }
        out
    }

    /// Map an uncompressed range `[start, end)` to the compressed span that
    /// covers it.
    ///
    /// Returns `(compressed_start, compressed_end, block_uncompressed_start)`
    /// where `compressed_end` is `None` when the range runs into the final
    /// block (read to end of object) and `block_uncompressed_start` is the
    /// uncompressed offset of the first fetched block.
    pub fn map_range(&self, start: u64, end: u64) -> (u64, Option<u64>, u64) {
        let i = self
            .entries
            .partition_point(|&(_, uncompressed)| uncompressed <= start)
            .saturating_sub(1);
        let (c_start, u_start) = self.entries[i];
        let j = self
            .entries
            .partition_point(|&(_, uncompressed)| uncompressed < end);
        let c_end = self.entries.get(j).map(|&(compressed, _)| compressed);
        (c_start, c_end, u_start)
    }
}

/// Inflate BGZF bytes that begin at a block boundary, skipping `skip`
/// uncompressed bytes and returning the next `len`.
pub fn inflate_range(compressed: &[u8], skip: u64, len: u64) -> Result<Vec<u8>, anyhow::Error> {
    let mut decoder = flate2::bufread::MultiGzDecoder::new(compressed);
    let skipped = std::io::copy(&mut (&mut decoder).take(skip), &mut std::io::sink())
        .map_err(|e| anyhow::anyhow!("could not skip into BGZF block: {}", e))?;
    if skipped != skip {
        anyhow::bail!("BGZF block ended after {} of {} skip bytes", skipped, skip);
    }
    let mut out = vec![0u8; len as usize];
    decoder
        .read_exact(&mut out)
        .map_err(|e| anyhow::anyhow!("could not inflate BGZF range: {}", e))?;
    Ok(out)
}

/// BGZF-compress `src` into `dst` and return the `.gzi` index of the result.
pub fn compress_file(src: &Path, dst: &Path) -> Result<GziIndex, anyhow::Error> {
    let mut reader = File::open(src)
        .map(BufReader::new)
        .map_err(|e| anyhow::anyhow!("could not open {:?}: {}", src, e))?;
    let mut writer = noodles_bgzf::Writer::new(
        File::create(dst).map_err(|e| anyhow::anyhow!("could not create {:?}: {}", dst, e))?,
    );
    std::io::copy(&mut reader, &mut writer)
        .map_err(|e| anyhow::anyhow!("could not compress {:?}: {}", src, e))?;
    writer
        .finish()
        .map_err(|e| anyhow::anyhow!("could not finish BGZF stream: {}", e))?;
    build_gzi(dst)
}

/// Inflate the BGZF file at `src` into a plain file at `dst`.
pub fn decompress_file(src: &Path, dst: &Path) -> Result<(), anyhow::Error> {
    let reader = File::open(src)
        .map(BufReader::new)
        .map_err(|e| anyhow::anyhow!("could not open {:?}: {}", src, e))?;
    let mut decoder = flate2::bufread::MultiGzDecoder::new(reader);
    let mut writer = File::create(dst)
        .map(BufWriter::new)
        .map_err(|e| anyhow::anyhow!("could not create {:?}: {}", dst, e))?;
    std::io::copy(&mut decoder, &mut writer)
        .map_err(|e| anyhow::anyhow!("could not decompress {:?}: {}", src, e))?;
    writer
        .flush()
        .map_err(|e| anyhow::anyhow!("could not flush {:?}: {}", dst, e))?;
    Ok(())
}

/// Walk the BGZF blocks of `path` and derive its `.gzi` index.
pub fn build_gzi(path: &Path) -> Result<GziIndex, anyhow::Error> {
    let mut reader = File::open(path)
        .map(BufReader::new)
        .map_err(|e| anyhow::anyhow!("could not open {:?}: {}", path, e))?;

    let mut entries = vec![(0u64, 0u64)];
    let mut compressed: u64 = 0;
    let mut uncompressed: u64 = 0;
    loop {
        let mut header = [0u8; 12];
        match reader.read_exact(&mut header) {
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            result => result.map_err(|e| anyhow::anyhow!("could not read gzip header: {}", e))?,
        }
        if header[0] != 0x1f || header[1] != 0x8b {
            anyhow::bail!("{:?} is not gzip at offset {}", path, compressed);
        }
        let xlen = u16::from_le_bytes([header[10], header[11]]) as usize;
        let mut extra = vec![0u8; xlen];
        reader
            .read_exact(&mut extra)
            .map_err(|e| anyhow::anyhow!("could not read gzip extra field: {}", e))?;
        let bsize = bgzf_block_size(&extra)
            .ok_or_else(|| anyhow::anyhow!("{:?} is not BGZF at offset {}", path, compressed))?;

        let block_size = bsize as u64 + 1;
        let cdata_len = block_size - 12 - xlen as u64 - 8;
        std::io::copy(
            &mut (&mut reader).take(cdata_len),
            &mut std::io::sink(),
        )
        .map_err(|e| anyhow::anyhow!("could not skip block data: {}", e))?;
        let _crc32 = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| anyhow::anyhow!("could not read block crc: {}", e))?;
        let isize = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| anyhow::anyhow!("could not read block isize: {}", e))?;

        compressed += block_size;
        uncompressed += isize as u64;
        let at_eof = reader
            .fill_buf()
            .map_err(|e| anyhow::anyhow!("could not read block boundary: {}", e))?
            .is_empty();
        if at_eof {
            break;
        }
        entries.push((compressed, uncompressed));
    }

    Ok(GziIndex { entries })
}

/// The BSIZE value from a BGZF `BC` extra subfield (total block size - 1).
fn bgzf_block_size(extra: &[u8]) -> Option<u16> {
    let mut i = 0usize;
    while i + 4 <= extra.len() {
        let slen = u16::from_le_bytes([extra[i + 2], extra[i + 3]]) as usize;
        if extra[i] == b'B' && extra[i + 1] == b'C' && slen == 2 && i + 6 <= extra.len() {
            return Some(u16::from_le_bytes([extra[i + 4], extra[i + 5]]));
        }
        i += 4 + slen;
    }
    None
}
