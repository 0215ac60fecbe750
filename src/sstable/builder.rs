use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};

use super::{BLOCK_SIZE, BLOOM_BITS_PER_KEY, L0_MAGIC, TABLE_MAGIC};
use crate::format;

pub(crate) const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Standard double-hashing bloom filter over 64-bit key fingerprints.
pub struct Bloom {
    bits: Vec<u8>,
    nbits: u32,
    k: u8,
}

impl Bloom {
    pub fn build(hashes: &[u64], bits_per_key: usize) -> Self {
        let nbits = (hashes.len() * bits_per_key).max(64) as u32;
        let nbytes = nbits.div_ceil(8) as usize;
        let nbits = (nbytes * 8) as u32;
        // ln(2) * bits_per_key, clamped to a sane probe count.
        let k = ((bits_per_key as f64 * 0.69) as u8).clamp(1, 30);

        let mut bits = vec![0u8; nbytes];
        for &h in hashes {
            let mut pos = (h as u32).wrapping_rem(nbits);
            let delta = ((h >> 32) as u32).wrapping_rem(nbits).max(1);
            for _ in 0..k {
                bits[(pos / 8) as usize] |= 1 << (pos % 8);
                pos = (pos + delta) % nbits;
            }
        }
        Self { bits, nbits, k }
    }

    pub fn may_contain(&self, h: u64) -> bool {
        if self.nbits == 0 {
            return true;
        }
        let mut pos = (h as u32).wrapping_rem(self.nbits);
        let delta = ((h >> 32) as u32).wrapping_rem(self.nbits).max(1);
        for _ in 0..self.k {
            if self.bits[(pos / 8) as usize] & (1 << (pos % 8)) == 0 {
                return false;
            }
            pos = (pos + delta) % self.nbits;
        }
        true
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(self.nbits).unwrap();
        buf.push(self.k);
        buf.extend_from_slice(&self.bits);
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 5 {
            return None;
        }
        let nbits = BigEndian::read_u32(&data[..4]);
        let k = data[4];
        let bits = data[5..].to_vec();
        if bits.len() * 8 != nbits as usize {
            return None;
        }
        Some(Self { bits, nbits, k })
    }
}

struct IndexEntry {
    first_key: Vec<u8>,
    offset: u64,
    len: u32,
}

/// Streams internal-key-ordered entries into a single table image.
pub struct TableBuilder {
    buf: Vec<u8>,
    block: Vec<u8>,
    block_count: u32,
    block_first_key: Vec<u8>,
    index: Vec<IndexEntry>,
    filter_hashes: Option<Vec<u64>>,
    smallest: Vec<u8>,
    biggest: Vec<u8>,
    commit_version: u64,
}

impl TableBuilder {
    pub fn new(commit_version: u64, with_filter: bool) -> Self {
        Self {
            buf: Vec::new(),
            block: Vec::new(),
            block_count: 0,
            block_first_key: Vec::new(),
            index: Vec::new(),
            filter_hashes: with_filter.then(Vec::new),
            smallest: Vec::new(),
            biggest: Vec::new(),
            commit_version,
        }
    }

    /// Add an entry. Internal keys must arrive in strictly ascending order.
    pub fn add(&mut self, ikey: &[u8], encoded_value: &[u8]) {
        debug_assert!(self.biggest.is_empty() || ikey > self.biggest.as_slice());
        if self.smallest.is_empty() {
            self.smallest = ikey.to_vec();
        }
        self.biggest.clear();
        self.biggest.extend_from_slice(ikey);

        if self.block.is_empty() {
            self.block_first_key = ikey.to_vec();
        }
        self.block.write_u16::<BigEndian>(ikey.len() as u16).unwrap();
        self.block.extend_from_slice(ikey);
        self.block
            .write_u32::<BigEndian>(encoded_value.len() as u32)
            .unwrap();
        self.block.extend_from_slice(encoded_value);
        self.block_count += 1;

        if let Some(hashes) = &mut self.filter_hashes {
            let hash = farmhash::fingerprint64(format::user_key(ikey));
            if hashes.last() != Some(&hash) {
                hashes.push(hash);
            }
        }

        if self.block.len() >= BLOCK_SIZE {
            self.finish_block();
        }
    }

    fn finish_block(&mut self) {
        if self.block.is_empty() {
            return;
        }
        let offset = self.buf.len() as u64;
        self.buf
            .write_u32::<BigEndian>(self.block_count)
            .unwrap();
        self.buf.extend_from_slice(&self.block);
        self.index.push(IndexEntry {
            first_key: std::mem::take(&mut self.block_first_key),
            offset,
            len: (self.block.len() + 4) as u32,
        });
        self.block.clear();
        self.block_count = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.block.is_empty()
    }

    pub fn estimated_size(&self) -> usize {
        self.buf.len() + self.block.len()
    }

    pub fn smallest(&self) -> &[u8] {
        &self.smallest
    }

    pub fn biggest(&self) -> &[u8] {
        &self.biggest
    }

    pub fn commit_version(&self) -> u64 {
        self.commit_version
    }

    /// Seal the image: index, filter, properties and footer.
    pub fn finish(mut self) -> Bytes {
        self.finish_block();
        let mut buf = self.buf;

        let index_off = buf.len() as u64;
        buf.write_u32::<BigEndian>(self.index.len() as u32).unwrap();
        for entry in &self.index {
            buf.write_u16::<BigEndian>(entry.first_key.len() as u16)
                .unwrap();
            buf.extend_from_slice(&entry.first_key);
            buf.write_u64::<BigEndian>(entry.offset).unwrap();
            buf.write_u32::<BigEndian>(entry.len).unwrap();
        }
        let index_len = buf.len() as u64 - index_off;

        let filter_off = buf.len() as u64;
        if let Some(hashes) = &self.filter_hashes {
            if !hashes.is_empty() {
                Bloom::build(hashes, BLOOM_BITS_PER_KEY).encode_into(&mut buf);
            }
        }
        let filter_len = buf.len() as u64 - filter_off;

        let props_off = buf.len() as u64;
        buf.write_u16::<BigEndian>(self.smallest.len() as u16)
            .unwrap();
        buf.extend_from_slice(&self.smallest);
        buf.write_u16::<BigEndian>(self.biggest.len() as u16)
            .unwrap();
        buf.extend_from_slice(&self.biggest);
        let props_len = buf.len() as u64 - props_off;

        let meta_crc = CASTAGNOLI.checksum(&buf[index_off as usize..]);

        buf.write_u64::<BigEndian>(index_off).unwrap();
        buf.write_u32::<BigEndian>(index_len as u32).unwrap();
        buf.write_u64::<BigEndian>(filter_off).unwrap();
        buf.write_u32::<BigEndian>(filter_len as u32).unwrap();
        buf.write_u64::<BigEndian>(props_off).unwrap();
        buf.write_u32::<BigEndian>(props_len as u32).unwrap();
        buf.write_u64::<BigEndian>(self.commit_version).unwrap();
        buf.write_u32::<BigEndian>(meta_crc).unwrap();
        buf.write_u32::<BigEndian>(TABLE_MAGIC).unwrap();

        Bytes::from(buf)
    }
}

/// Builds an L0 file: one table image per column family plus a trailer
/// mapping CFs to image ranges and the shared commit version.
pub struct L0Builder {
    builders: Vec<TableBuilder>,
    commit_version: u64,
}

impl L0Builder {
    pub fn new(num_cfs: usize, commit_version: u64) -> Self {
        Self {
            builders: (0..num_cfs)
                .map(|_| TableBuilder::new(commit_version, true))
                .collect(),
            commit_version,
        }
    }

    pub fn add(&mut self, cf: usize, ikey: &[u8], encoded_value: &[u8]) {
        self.builders[cf].add(ikey, encoded_value);
    }

    pub fn is_empty(&self) -> bool {
        self.builders.iter().all(|b| b.is_empty())
    }

    pub fn commit_version(&self) -> u64 {
        self.commit_version
    }

    pub fn estimated_size(&self) -> usize {
        self.builders.iter().map(|b| b.estimated_size()).sum()
    }

    /// (smallest, biggest) internal keys across all column families.
    pub fn bounds(&self) -> (Bytes, Bytes) {
        let smallest = self
            .builders
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| b.smallest())
            .min()
            .unwrap_or(&[]);
        let biggest = self
            .builders
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| b.biggest())
            .max()
            .unwrap_or(&[]);
        (
            Bytes::copy_from_slice(smallest),
            Bytes::copy_from_slice(biggest),
        )
    }

    pub fn finish(self) -> Bytes {
        let mut buf: Vec<u8> = Vec::new();
        let mut ranges = Vec::with_capacity(self.builders.len());
        for builder in self.builders {
            if builder.is_empty() {
                ranges.push((0u64, 0u32));
                continue;
            }
            let off = buf.len() as u64;
            let image = builder.finish();
            buf.extend_from_slice(&image);
            ranges.push((off, image.len() as u32));
        }

        let cf_index_off = buf.len() as u64;
        buf.write_u32::<BigEndian>(ranges.len() as u32).unwrap();
        for (off, len) in ranges {
            buf.write_u64::<BigEndian>(off).unwrap();
            buf.write_u32::<BigEndian>(len).unwrap();
        }
        let trailer_crc = CASTAGNOLI.checksum(&buf[cf_index_off as usize..]);

        buf.write_u64::<BigEndian>(cf_index_off).unwrap();
        buf.write_u64::<BigEndian>(self.commit_version).unwrap();
        buf.write_u32::<BigEndian>(trailer_crc).unwrap();
        buf.write_u32::<BigEndian>(L0_MAGIC).unwrap();
        Bytes::from(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_no_false_negatives() {
        let hashes: Vec<u64> = (0..500u64)
            .map(|i| farmhash::fingerprint64(format!("key-{i}").as_bytes()))
            .collect();
        let bloom = Bloom::build(&hashes, BLOOM_BITS_PER_KEY);
        for h in &hashes {
            assert!(bloom.may_contain(*h));
        }
    }

    #[test]
    fn test_bloom_filters_most_absent_keys() {
        let hashes: Vec<u64> = (0..500u64)
            .map(|i| farmhash::fingerprint64(format!("key-{i}").as_bytes()))
            .collect();
        let bloom = Bloom::build(&hashes, BLOOM_BITS_PER_KEY);
        let false_positives = (0..500u64)
            .map(|i| farmhash::fingerprint64(format!("absent-{i}").as_bytes()))
            .filter(|h| bloom.may_contain(*h))
            .count();
        assert!(false_positives < 50, "fp = {false_positives}");
    }

    #[test]
    fn test_bloom_roundtrip() {
        let hashes = vec![1u64, 2, 3, u64::MAX];
        let bloom = Bloom::build(&hashes, BLOOM_BITS_PER_KEY);
        let mut buf = Vec::new();
        bloom.encode_into(&mut buf);
        let decoded = Bloom::decode(&buf).unwrap();
        for h in hashes {
            assert!(decoded.may_contain(h));
        }
    }

    #[test]
    fn test_builder_tracks_bounds() {
        let mut b = TableBuilder::new(5, true);
        let k1 = format::encode_internal(b"aaa", 9);
        let k2 = format::encode_internal(b"zzz", 1);
        b.add(&k1, b"v1");
        b.add(&k2, b"v2");
        assert_eq!(b.smallest(), &k1[..]);
        assert_eq!(b.biggest(), &k2[..]);
        let image = b.finish();
        assert!(image.len() > super::super::TABLE_FOOTER_SIZE);
    }
}
