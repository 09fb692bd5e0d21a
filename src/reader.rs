//! Reading binary stream files back.
//!
//! Used by tests and by tools that inspect a finished experiment. A block is
//! walked packet by packet: padding is skipped, and a closed sentinel or a
//! zero size ends the block.

use crate::error::{Error, Result};
use crate::packet::{PacketHeader, CLOSED_PACKET, EMPTY_PACKET, PACKET_HEADER_SIZE};
use std::path::Path;

/// One data packet found in a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    /// Offset of the packet inside its block.
    pub offset: usize,
    /// The packet's header.
    pub header: PacketHeader,
    /// The whole packet, header included.
    pub bytes: &'a [u8],
}

/// Iterator over the data packets of one block.
#[derive(Debug)]
pub struct BlockScanner<'a> {
    block: &'a [u8],
    index: usize,
    offset: usize,
    trailer: Option<PacketHeader>,
    done: bool,
}

impl<'a> BlockScanner<'a> {
    /// Scan `block`; `index` is only used in error reports.
    pub fn new(block: &'a [u8], index: usize) -> Self {
        Self {
            block,
            index,
            offset: 0,
            trailer: None,
            done: false,
        }
    }

    /// The last sentinel seen, once the scan has ended.
    pub fn trailer(&self) -> Option<PacketHeader> {
        self.trailer
    }

    fn corrupt(&mut self) -> Option<Result<Packet<'a>>> {
        self.done = true;
        Some(Err(Error::CorruptBlock {
            block: self.index,
            offset: self.offset,
        }))
    }
}

impl<'a> Iterator for BlockScanner<'a> {
    type Item = Result<Packet<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done && self.offset < self.block.len() {
            let rest = &self.block[self.offset..];
            let Some(header) = PacketHeader::read_from(rest) else {
                return self.corrupt();
            };
            let size = header.tsize as usize;
            if size == 0 {
                self.done = true;
                break;
            }
            if size > rest.len() {
                return self.corrupt();
            }
            match header.kind {
                EMPTY_PACKET => {
                    self.trailer = Some(header);
                    self.offset += size;
                }
                CLOSED_PACKET => {
                    self.trailer = Some(header);
                    self.done = true;
                }
                _ => {
                    if size < PACKET_HEADER_SIZE {
                        return self.corrupt();
                    }
                    let packet = Packet {
                        offset: self.offset,
                        header,
                        bytes: &rest[..size],
                    };
                    self.offset += size;
                    return Some(Ok(packet));
                }
            }
        }
        self.done = true;
        None
    }
}

/// A binary stream file loaded into memory.
#[derive(Debug, Clone)]
pub struct BlockFile {
    data: Vec<u8>,
    block_size: usize,
}

impl BlockFile {
    /// Load the file at `path`, cut into `block_size` blocks.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::InvalidConfig("block size must not be zero".into()));
        }
        let data = std::fs::read(path)?;
        Ok(Self { data, block_size })
    }

    /// Wrap bytes already in memory.
    pub fn from_bytes(data: Vec<u8>, block_size: usize) -> Self {
        Self { data, block_size }
    }

    /// File length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of blocks, counting a partial last block.
    pub fn block_count(&self) -> usize {
        self.data.len().div_ceil(self.block_size)
    }

    /// Bytes of block `index`.
    pub fn block(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(self.block_size)?;
        if start >= self.data.len() {
            return None;
        }
        let end = (start + self.block_size).min(self.data.len());
        Some(&self.data[start..end])
    }

    /// Scan block `index`.
    pub fn scan(&self, index: usize) -> Option<BlockScanner<'_>> {
        self.block(index).map(|block| BlockScanner::new(block, index))
    }

    /// Every data packet of the file, in block order.
    pub fn packets(&self) -> Result<Vec<Packet<'_>>> {
        let mut packets = Vec::new();
        for index in 0..self.block_count() {
            if let Some(scanner) = self.scan(index) {
                for packet in scanner {
                    packets.push(packet?);
                }
            }
        }
        Ok(packets)
    }
}

/// Read every data packet of the binary stream file at `path`.
pub fn read_block_file(path: impl AsRef<Path>, block_size: usize) -> Result<Vec<Vec<u8>>> {
    let file = BlockFile::open(path, block_size)?;
    let packets = file.packets()?;
    Ok(packets.into_iter().map(|p| p.bytes.to_vec()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(block: &mut [u8], offset: usize, header: PacketHeader) {
        unsafe { header.write_to(block.as_mut_ptr().add(offset)) };
    }

    #[test]
    fn test_scan_skips_padding() {
        let mut block = vec![0u8; 64];
        put(&mut block, 0, PacketHeader::new(5, 12));
        put(&mut block, 12, PacketHeader::empty(8));
        put(&mut block, 20, PacketHeader::new(6, 10));
        put(&mut block, 30, PacketHeader::empty(34));

        let mut scanner = BlockScanner::new(&block, 0);
        let kinds: Vec<u32> = scanner
            .by_ref()
            .map(|p| p.unwrap().header.kind)
            .collect();
        assert_eq!(kinds, vec![5, 6]);
        assert_eq!(scanner.trailer(), Some(PacketHeader::empty(34)));
    }

    #[test]
    fn test_closed_ends_block() {
        let mut block = vec![0u8; 32];
        put(&mut block, 0, PacketHeader::new(1, 16));
        put(&mut block, 16, PacketHeader::closed(16));
        let packets: Vec<_> = BlockScanner::new(&block, 0).collect();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn test_zero_size_ends_block() {
        let block = vec![0u8; 32];
        assert_eq!(BlockScanner::new(&block, 0).count(), 0);
    }

    #[test]
    fn test_oversized_packet_is_corrupt() {
        let mut block = vec![0u8; 32];
        put(&mut block, 8, PacketHeader::new(1, 8));
        put(&mut block, 0, PacketHeader::new(1, 64));
        let mut scanner = BlockScanner::new(&block, 3);
        assert!(matches!(
            scanner.next(),
            Some(Err(Error::CorruptBlock { block: 3, offset: 0 }))
        ));
        assert!(scanner.next().is_none());
    }

    #[test]
    fn test_block_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile");
        let mut data = vec![0u8; 128];
        put(&mut data, 0, PacketHeader::new(1, 16));
        put(&mut data, 16, PacketHeader::closed(48));
        put(&mut data, 64, PacketHeader::new(2, 24));
        put(&mut data, 88, PacketHeader::empty(40));
        std::fs::write(&path, &data).unwrap();

        let file = BlockFile::open(&path, 64).unwrap();
        assert_eq!(file.block_count(), 2);
        let packets = read_block_file(&path, 64).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1].len(), 24);
        assert!(BlockFile::open(&path, 0).is_err());
    }
}
