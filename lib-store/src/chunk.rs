//! Chunk manager
//!
//! Deterministic fixed-size splitting and verified recombination. Splitting
//! and combining are CPU-only; neither suspends. Combine never returns
//! partial data: any length or checksum mismatch aborts the whole operation.

use crate::errors::StoreError;
use crate::types::{sha256_hex, ChunkDescriptor, DEFAULT_CHUNK_SIZE};

/// One split-out chunk: index, bytes and their checksum.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub index: u32,
    pub bytes: Vec<u8>,
    pub checksum: String,
}

/// Splits artifacts into chunks and verifies reassembly.
#[derive(Debug, Clone)]
pub struct ChunkManager {
    chunk_size: usize,
}

impl Default for ChunkManager {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ChunkManager {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split `data` into ordered chunks of the configured size. The empty
    /// input yields zero chunks.
    pub fn split(&self, data: &[u8]) -> Vec<ChunkPiece> {
        self.split_with(data, self.chunk_size)
    }

    /// Split with an explicit chunk size for this request.
    pub fn split_with(&self, data: &[u8], chunk_size: usize) -> Vec<ChunkPiece> {
        let chunk_size = chunk_size.max(1);
        let mut pieces = Vec::with_capacity(data.len().div_ceil(chunk_size));
        let mut offset = 0usize;
        let mut index = 0u32;

        while offset < data.len() {
            let end = usize::min(offset + chunk_size, data.len());
            let bytes = data[offset..end].to_vec();
            pieces.push(ChunkPiece {
                index,
                checksum: sha256_hex(&bytes),
                bytes,
            });
            offset = end;
            index += 1;
        }

        pieces
    }

    /// Reassemble chunk bytes against their descriptors.
    ///
    /// Each chunk is length- and checksum-verified, the set must cover
    /// indexes 0..n with no gaps or duplicates, and the output is ordered by
    /// index. Any failure aborts with `ChunkValidation`.
    pub fn combine(pairs: Vec<(Vec<u8>, &ChunkDescriptor)>) -> Result<Vec<u8>, StoreError> {
        let mut verified: Vec<(u32, Vec<u8>)> = Vec::with_capacity(pairs.len());
        let mut total = 0u64;

        for (bytes, descriptor) in pairs {
            if bytes.len() as u64 != descriptor.size {
                return Err(StoreError::ChunkValidation(format!(
                    "chunk {} is {} bytes, descriptor says {}",
                    descriptor.index,
                    bytes.len(),
                    descriptor.size
                )));
            }
            let checksum = sha256_hex(&bytes);
            if checksum != descriptor.checksum {
                return Err(StoreError::ChunkValidation(format!(
                    "chunk {} checksum mismatch",
                    descriptor.index
                )));
            }
            total += descriptor.size;
            verified.push((descriptor.index, bytes));
        }

        verified.sort_by_key(|(index, _)| *index);
        for (position, (index, _)) in verified.iter().enumerate() {
            if *index as usize != position {
                return Err(StoreError::ChunkValidation(format!(
                    "chunk set has a gap or duplicate at index {}",
                    index
                )));
            }
        }

        let mut out = Vec::with_capacity(total as usize);
        for (_, bytes) in verified {
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkLocation, StorageType};
    use lib_dht::NodeId;

    fn descriptor_for(piece: &ChunkPiece) -> ChunkDescriptor {
        ChunkDescriptor {
            index: piece.index,
            size: piece.bytes.len() as u64,
            checksum: piece.checksum.clone(),
            location: ChunkLocation {
                node_id: NodeId::from_bytes([0u8; 32]),
                storage_type: StorageType::Local,
                endpoint: String::new(),
                region: None,
                availability: 1.0,
                last_seen: 0,
                health: 1.0,
            },
            replicas: 1,
            encryption: None,
            compression: None,
        }
    }

    fn round_trip(data: &[u8], chunk_size: usize) -> Vec<u8> {
        let manager = ChunkManager::new(chunk_size);
        let pieces = manager.split(data);
        let descriptors: Vec<ChunkDescriptor> = pieces.iter().map(descriptor_for).collect();
        let pairs = pieces
            .into_iter()
            .zip(descriptors.iter())
            .map(|(p, d)| (p.bytes, d))
            .collect();
        ChunkManager::combine(pairs).unwrap()
    }

    #[test]
    fn test_split_boundaries() {
        let manager = ChunkManager::new(4);
        assert_eq!(manager.split(b"").len(), 0);
        assert_eq!(manager.split(b"a").len(), 1);
        assert_eq!(manager.split(b"abcd").len(), 1);
        assert_eq!(manager.split(b"abcde").len(), 2);
        assert_eq!(manager.split(&[0u8; 12]).len(), 3);
        assert_eq!(manager.split(&[0u8; 13]).len(), 4);
    }

    #[test]
    fn test_split_covers_exact_ranges() {
        let data: Vec<u8> = (0..=255).collect();
        let pieces = ChunkManager::new(100).split(&data);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].bytes, data[0..100]);
        assert_eq!(pieces[1].bytes, data[100..200]);
        assert_eq!(pieces[2].bytes, data[200..256]);
        for piece in &pieces {
            assert_eq!(piece.checksum, sha256_hex(&piece.bytes));
        }
    }

    #[test]
    fn test_combine_inverts_split() {
        for size in [1usize, 3, 7, 64] {
            let data: Vec<u8> = (0..200u8).cycle().take(999).collect();
            assert_eq!(round_trip(&data, size), data);
        }
        assert_eq!(round_trip(b"", 8), b"");
        assert_eq!(round_trip(b"x", 1), b"x");
    }

    #[test]
    fn test_combine_orders_by_index() {
        let data = b"hello chunked world".to_vec();
        let manager = ChunkManager::new(5);
        let pieces = manager.split(&data);
        let descriptors: Vec<ChunkDescriptor> = pieces.iter().map(descriptor_for).collect();

        // Feed the chunks in reverse order.
        let pairs: Vec<(Vec<u8>, &ChunkDescriptor)> = pieces
            .into_iter()
            .rev()
            .map(|p| {
                let d = &descriptors[p.index as usize];
                (p.bytes, d)
            })
            .collect();
        assert_eq!(ChunkManager::combine(pairs).unwrap(), data);
    }

    #[test]
    fn test_combine_rejects_corrupt_chunk() {
        let manager = ChunkManager::new(4);
        let pieces = manager.split(b"abcdefgh");
        let descriptors: Vec<ChunkDescriptor> = pieces.iter().map(descriptor_for).collect();

        let mut pairs: Vec<(Vec<u8>, &ChunkDescriptor)> = pieces
            .into_iter()
            .zip(descriptors.iter())
            .map(|(p, d)| (p.bytes, d))
            .collect();
        pairs[1].0[0] ^= 0xFF;

        assert!(matches!(
            ChunkManager::combine(pairs),
            Err(StoreError::ChunkValidation(_))
        ));
    }

    #[test]
    fn test_combine_rejects_wrong_length() {
        let manager = ChunkManager::new(4);
        let pieces = manager.split(b"abcdefgh");
        let descriptors: Vec<ChunkDescriptor> = pieces.iter().map(descriptor_for).collect();

        let mut pairs: Vec<(Vec<u8>, &ChunkDescriptor)> = pieces
            .into_iter()
            .zip(descriptors.iter())
            .map(|(p, d)| (p.bytes, d))
            .collect();
        pairs[0].0.push(0);

        assert!(matches!(
            ChunkManager::combine(pairs),
            Err(StoreError::ChunkValidation(_))
        ));
    }

    #[test]
    fn test_combine_rejects_missing_chunk() {
        let manager = ChunkManager::new(4);
        let pieces = manager.split(b"abcdefghij");
        let descriptors: Vec<ChunkDescriptor> = pieces.iter().map(descriptor_for).collect();

        let pairs: Vec<(Vec<u8>, &ChunkDescriptor)> = pieces
            .into_iter()
            .zip(descriptors.iter())
            .skip(1)
            .map(|(p, d)| (p.bytes, d))
            .collect();

        assert!(matches!(
            ChunkManager::combine(pairs),
            Err(StoreError::ChunkValidation(_))
        ));
    }

    #[test]
    fn test_five_chunk_publish_shape() {
        // 4.4 MB body at the default 1 MiB chunk size: four full chunks and
        // one 205,696-byte tail.
        let data = b"hello world".repeat(400_000);
        assert_eq!(data.len(), 4_400_000);
        let pieces = ChunkManager::default().split(&data);
        assert_eq!(pieces.len(), 5);
        for piece in &pieces[..4] {
            assert_eq!(piece.bytes.len(), DEFAULT_CHUNK_SIZE);
        }
        assert_eq!(pieces[4].bytes.len(), 4_400_000 - 4 * DEFAULT_CHUNK_SIZE);
    }
}
