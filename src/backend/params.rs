use std::sync::{Mutex, MutexGuard, PoisonError};

use cellminer_work_spec::{pad_to_granularity, DATA_LEN, TARGET_LEN, TRANSFER_GRANULARITY};

use crate::backend::{LedgerToken, ResourceLedger};
use crate::error::{MinerError, Result};

const DATA_AT: usize = 0;
const TARGET_AT: usize = DATA_AT + DATA_LEN;
const START_NONCE_AT: usize = TARGET_AT + TARGET_LEN;
const RANGE_AT: usize = START_NONCE_AT + 8;
const NONCE_AT: usize = RANGE_AT + 8;
const FLAGS_AT: usize = NONCE_AT + 4;

/// Bytes of the block that carry meaning; everything past this is padding.
pub const PAYLOAD_LEN: usize = FLAGS_AT + 4;

/// Bytes moved by every transfer leg, in both directions.
pub const TRANSFER_SIZE: usize = pad_to_granularity(PAYLOAD_LEN);

const _: () = assert!(TRANSFER_SIZE % TRANSFER_GRANULARITY == 0);
const _: () = assert!(std::mem::size_of::<ParameterBlock>() == TRANSFER_SIZE);
const _: () = assert!(std::mem::align_of::<TransferImage>() == TRANSFER_GRANULARITY);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockFlags(u32);

impl BlockFlags {
    pub const DEBUG: BlockFlags = BlockFlags(1);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn contains(self, other: BlockFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BlockFlags) {
        self.0 |= other.0;
    }
}

/// One unit of search work and its result slot.
#[repr(C, align(128))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterBlock {
    pub data: [u8; DATA_LEN],
    pub target: [u8; TARGET_LEN],
    pub start_nonce: u64,
    pub range: u64,
    pub nonce: u32,
    pub flags: BlockFlags,
}

impl Default for ParameterBlock {
    fn default() -> Self {
        Self {
            data: [0u8; DATA_LEN],
            target: [0u8; TARGET_LEN],
            start_nonce: 0,
            range: 0,
            nonce: 0,
            flags: BlockFlags::default(),
        }
    }
}

impl ParameterBlock {
    pub fn debug(&self) -> bool {
        self.flags.contains(BlockFlags::DEBUG)
    }

    pub fn encode(&self) -> TransferImage {
        let mut image = TransferImage::zeroed();
        let bytes = &mut image.bytes;
        bytes[DATA_AT..TARGET_AT].copy_from_slice(&self.data);
        bytes[TARGET_AT..START_NONCE_AT].copy_from_slice(&self.target);
        bytes[START_NONCE_AT..RANGE_AT].copy_from_slice(&self.start_nonce.to_be_bytes());
        bytes[RANGE_AT..NONCE_AT].copy_from_slice(&self.range.to_be_bytes());
        bytes[NONCE_AT..FLAGS_AT].copy_from_slice(&self.nonce.to_be_bytes());
        bytes[FLAGS_AT..PAYLOAD_LEN].copy_from_slice(&self.flags.bits().to_be_bytes());
        image
    }

    pub fn decode(image: &TransferImage) -> Self {
        let bytes = &image.bytes;
        let mut block = Self::default();
        block.data.copy_from_slice(&bytes[DATA_AT..TARGET_AT]);
        block.target.copy_from_slice(&bytes[TARGET_AT..START_NONCE_AT]);
        block.start_nonce = u64::from_be_bytes(word(&bytes[START_NONCE_AT..RANGE_AT]));
        block.range = u64::from_be_bytes(word(&bytes[RANGE_AT..NONCE_AT]));
        block.nonce = u32::from_be_bytes(word(&bytes[NONCE_AT..FLAGS_AT]));
        block.flags = BlockFlags::from_bits(u32::from_be_bytes(word(&bytes[FLAGS_AT..PAYLOAD_LEN])));
        block
    }
}

fn word<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Byte image of a parameter block as it crosses the memory boundary.
#[repr(C, align(128))]
#[derive(Clone)]
pub struct TransferImage {
    bytes: [u8; TRANSFER_SIZE],
}

impl TransferImage {
    pub fn zeroed() -> Self {
        Self {
            bytes: [0u8; TRANSFER_SIZE],
        }
    }

    pub fn as_bytes(&self) -> &[u8; TRANSFER_SIZE] {
        &self.bytes
    }
}

/// Parameter block living in controller memory.
pub struct HostBlock {
    storage: Mutex<Vec<ParameterBlock>>,
    _token: LedgerToken,
}

impl HostBlock {
    pub fn allocate(ledger: &ResourceLedger) -> Result<Self> {
        let mut storage: Vec<ParameterBlock> = Vec::new();
        storage
            .try_reserve_exact(1)
            .map_err(|err| MinerError::Allocation(err.to_string()))?;
        storage.push(ParameterBlock::default());
        Ok(Self {
            storage: Mutex::new(storage),
            _token: ledger.track_block(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ParameterBlock>> {
        // Plain data: a panic elsewhere cannot leave it half-invariant.
        self.storage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with<R>(&self, f: impl FnOnce(&ParameterBlock) -> R) -> R {
        let guard = self.lock();
        f(&guard[0])
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut ParameterBlock) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard[0])
    }

    pub(crate) fn snapshot(&self) -> TransferImage {
        self.with(ParameterBlock::encode)
    }

    pub(crate) fn store(&self, image: &TransferImage) {
        let incoming = ParameterBlock::decode(image);
        self.with_mut(|block| *block = incoming);
    }

    pub fn address(&self) -> usize {
        self.lock().as_ptr() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> ParameterBlock {
        let mut block = ParameterBlock::default();
        for (i, byte) in block.data.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(37).wrapping_add(11);
        }
        block.target = [0xab; TARGET_LEN];
        block.start_nonce = 0x0123_4567_89ab_cdef;
        block.range = 4096;
        block.nonce = 0xdead_beef;
        block.flags.insert(BlockFlags::DEBUG);
        block
    }

    #[test]
    fn transfer_size_covers_payload_and_excludes_struct_padding() {
        assert_eq!(PAYLOAD_LEN, 184);
        assert_eq!(TRANSFER_SIZE, 256);
    }

    #[test]
    fn image_preserves_every_field_and_zeroes_padding() {
        let block = sample_block();
        let image = block.encode();
        assert!(image.as_bytes()[PAYLOAD_LEN..].iter().all(|b| *b == 0));
        assert_eq!(ParameterBlock::decode(&image), block);
    }

    #[test]
    fn decode_ignores_padding_bytes() {
        let block = sample_block();
        let mut image = block.encode();
        image.bytes[PAYLOAD_LEN..].fill(0x5a);
        assert_eq!(ParameterBlock::decode(&image), block);
    }

    #[test]
    fn host_block_is_aligned_to_transfer_granularity() {
        let ledger = ResourceLedger::default();
        let host = HostBlock::allocate(&ledger).expect("host block should allocate");
        assert_eq!(host.address() % TRANSFER_GRANULARITY, 0);
        assert_eq!(ledger.live_blocks(), 1);
        drop(host);
        assert_eq!(ledger.live_blocks(), 0);
    }
}
