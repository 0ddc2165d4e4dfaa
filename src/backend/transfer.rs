use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::trace;
use thiserror::Error;

use super::params::{HostBlock, ParameterBlock, TRANSFER_SIZE};

pub const TAG_COUNT: u32 = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("no transfer tag available")]
    NoTag,
    /// The engine program gave up after a failed transfer on its side.
    #[error("engine program exited with code {0}")]
    EngineExit(i32),
}

/// Copy-in/copy-out of a parameter block across the controller/engine boundary.
pub trait TransferChannel: Send {
    /// Controller memory into the engine's local copy.
    fn get(&self, local: &mut ParameterBlock) -> Result<(), TransferError>;

    /// Engine's local copy back into controller memory.
    fn put(&self, local: &ParameterBlock) -> Result<(), TransferError>;
}

/// Tag space of one engine's transfer unit.
#[derive(Debug, Default)]
pub struct TagPool {
    reserved: AtomicU32,
}

impl TagPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(self: &Arc<Self>) -> Option<TagGuard> {
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            if current == u32::MAX {
                return None;
            }
            let tag = (!current).trailing_zeros();
            let next = current | (1 << tag);
            match self.reserved.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(TagGuard {
                        pool: Arc::clone(self),
                        tag,
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn reserved(&self) -> u32 {
        self.reserved.load(Ordering::Acquire).count_ones()
    }

    fn release(&self, tag: u32) {
        self.reserved.fetch_and(!(1 << tag), Ordering::AcqRel);
    }
}

pub struct TagGuard {
    pool: Arc<TagPool>,
    tag: u32,
}

impl TagGuard {
    pub fn tag(&self) -> u32 {
        self.tag
    }
}

impl Drop for TagGuard {
    fn drop(&mut self) {
        self.pool.release(self.tag);
    }
}

/// Channel used by an isolated engine: every leg reserves a tag and moves a
/// whole [`TRANSFER_SIZE`] image under the host block's lock.
pub struct HostTransfer {
    host: Arc<HostBlock>,
    tags: Arc<TagPool>,
}

impl HostTransfer {
    pub fn new(host: Arc<HostBlock>, tags: Arc<TagPool>) -> Self {
        Self { host, tags }
    }
}

impl TransferChannel for HostTransfer {
    fn get(&self, local: &mut ParameterBlock) -> Result<(), TransferError> {
        let guard = self.tags.reserve().ok_or(TransferError::NoTag)?;
        let image = self.host.snapshot();
        *local = ParameterBlock::decode(&image);
        trace!(target: "cellminer::transfer", "get {TRANSFER_SIZE} bytes on tag {}", guard.tag());
        Ok(())
    }

    fn put(&self, local: &ParameterBlock) -> Result<(), TransferError> {
        let guard = self.tags.reserve().ok_or(TransferError::NoTag)?;
        let image = local.encode();
        self.host.store(&image);
        trace!(target: "cellminer::transfer", "put {TRANSFER_SIZE} bytes on tag {}", guard.tag());
        Ok(())
    }
}

/// Channel used when the engine shares the controller's processor. No tag is
/// reserved but the block still travels as an image.
pub struct DirectTransfer<'a> {
    host: &'a HostBlock,
}

impl<'a> DirectTransfer<'a> {
    pub fn new(host: &'a HostBlock) -> Self {
        Self { host }
    }
}

impl TransferChannel for DirectTransfer<'_> {
    fn get(&self, local: &mut ParameterBlock) -> Result<(), TransferError> {
        *local = ParameterBlock::decode(&self.host.snapshot());
        Ok(())
    }

    fn put(&self, local: &ParameterBlock) -> Result<(), TransferError> {
        self.host.store(&local.encode());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ResourceLedger;

    fn host() -> Arc<HostBlock> {
        let ledger = ResourceLedger::default();
        Arc::new(HostBlock::allocate(&ledger).expect("host block should allocate"))
    }

    #[test]
    fn tag_pool_hands_out_every_tag_once_and_recycles() {
        let pool = Arc::new(TagPool::new());
        let guards: Vec<_> = (0..TAG_COUNT)
            .map(|_| pool.reserve().expect("tag should be free"))
            .collect();
        let mut tags: Vec<u32> = guards.iter().map(TagGuard::tag).collect();
        tags.sort_unstable();
        assert_eq!(tags, (0..TAG_COUNT).collect::<Vec<_>>());
        assert!(pool.reserve().is_none());

        drop(guards);
        assert_eq!(pool.reserved(), 0);
        assert!(pool.reserve().is_some());
    }

    #[test]
    fn host_transfer_round_trips_through_controller_memory() {
        let host = host();
        host.with_mut(|block| {
            block.start_nonce = 77;
            block.range = 3;
            block.target = [0x11; 32];
        });
        let channel = HostTransfer::new(Arc::clone(&host), Arc::new(TagPool::new()));

        let mut local = ParameterBlock::default();
        channel.get(&mut local).expect("get should succeed");
        assert_eq!(local.start_nonce, 77);
        assert_eq!(local.target, [0x11; 32]);

        local.nonce = 79;
        channel.put(&local).expect("put should succeed");
        assert_eq!(host.with(|block| block.nonce), 79);
    }

    #[test]
    fn host_transfer_fails_without_a_tag_and_leaves_local_untouched() {
        let host = host();
        host.with_mut(|block| block.range = 9);
        let tags = Arc::new(TagPool::new());
        let _held: Vec<_> = (0..TAG_COUNT).filter_map(|_| tags.reserve()).collect();
        let channel = HostTransfer::new(host, Arc::clone(&tags));

        let mut local = ParameterBlock::default();
        assert_eq!(channel.get(&mut local), Err(TransferError::NoTag));
        assert_eq!(local.range, 0);
        assert_eq!(channel.put(&local), Err(TransferError::NoTag));
    }
}
