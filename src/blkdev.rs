//! Block device class/instance registry and byte-granular read/write.
//!
//! A "class" groups every instance that shares an implementation (e.g. one
//! IDE class covering up to four drives); an "instance" is one addressable
//! device, identified by `(major, minor)`. Read/write requests are
//! translated into whole-block transfers against the class's callback,
//! handling a request that starts or ends mid-block by reading the whole
//! block into a scratch buffer first.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;

use crate::arch::IrqGuard;
use crate::error::{KError, KResult};

pub const NR_BLKDEV_MAJOR_TYPES: u32 = 8;

/// Implemented by a driver to move whole blocks in or out of a device.
/// Returns the number of blocks actually transferred; a short transfer is
/// retried by the generic read/write path, and a transfer of zero blocks
/// with more requested is treated as a hard failure.
pub trait BlockOps: Send + Sync {
    fn read_blocks(&self, minor: u32, start_block: u64, buf: &mut [u8], nblocks: u32) -> u32;
    fn write_blocks(&self, minor: u32, start_block: u64, buf: &[u8], nblocks: u32) -> u32;
}

struct Class {
    description: String,
    ops: Box<dyn BlockOps>,
}

struct Instance {
    major: u32,
    minor: u32,
    description: String,
    block_size: u32,
    capacity: u64,
    refcnt: u32,
}

struct Registry {
    classes: [Option<Class>; NR_BLKDEV_MAJOR_TYPES as usize],
    instances: BTreeMap<(u32, u32), Instance>,
}

impl Registry {
    const fn new() -> Self {
        const NONE_CLASS: Option<Class> = None;
        Self {
            classes: [NONE_CLASS; NR_BLKDEV_MAJOR_TYPES as usize],
            instances: BTreeMap::new(),
        }
    }
}

static REGISTRY: spin::Mutex<Registry> = spin::Mutex::new(Registry::new());

pub fn register_blkdev_class(major: u32, description: &str, ops: Box<dyn BlockOps>) -> KResult<()> {
    if major >= NR_BLKDEV_MAJOR_TYPES {
        return Err(KError::InvalidArg);
    }
    let _irq = IrqGuard::new();
    let mut reg = REGISTRY.lock();
    if reg.classes[major as usize].is_some() {
        return Err(KError::Busy);
    }
    reg.classes[major as usize] = Some(Class {
        description: String::from(description),
        ops,
    });
    Ok(())
}

/// Registers `(major, minor)`. Idempotent: calling it again for an instance
/// that already exists succeeds without creating a duplicate.
pub fn register_blkdev_instance(
    major: u32,
    minor: u32,
    description: &str,
    block_size: u32,
    capacity: u64,
) -> KResult<()> {
    if major >= NR_BLKDEV_MAJOR_TYPES || block_size == 0 {
        return Err(KError::InvalidArg);
    }
    let _irq = IrqGuard::new();
    let mut reg = REGISTRY.lock();
    if reg.classes[major as usize].is_none() {
        return Err(KError::InvalidArg);
    }
    if reg.instances.contains_key(&(major, minor)) {
        return Ok(());
    }
    reg.instances.insert(
        (major, minor),
        Instance {
            major,
            minor,
            description: String::from(description),
            block_size,
            capacity,
            refcnt: 0,
        },
    );
    Ok(())
}

/// Removes `(major, minor)`. Fails with `Busy` if any caller currently holds
/// a reference obtained from [`get_blkdev_instance`].
pub fn unregister_blkdev_instance(major: u32, minor: u32) -> KResult<()> {
    let _irq = IrqGuard::new();
    let mut reg = REGISTRY.lock();
    match reg.instances.get(&(major, minor)) {
        Some(inst) if inst.refcnt > 0 => Err(KError::Busy),
        Some(_) => {
            reg.instances.remove(&(major, minor));
            Ok(())
        }
        None => Err(KError::InvalidArg),
    }
}

pub fn get_blkdev_instance(major: u32, minor: u32) -> KResult<()> {
    let _irq = IrqGuard::new();
    let mut reg = REGISTRY.lock();
    let inst = reg
        .instances
        .get_mut(&(major, minor))
        .ok_or(KError::InvalidArg)?;
    inst.refcnt += 1;
    Ok(())
}

pub fn release_blkdev_instance(major: u32, minor: u32) {
    let _irq = IrqGuard::new();
    let mut reg = REGISTRY.lock();
    if let Some(inst) = reg.instances.get_mut(&(major, minor)) {
        inst.refcnt = inst.refcnt.saturating_sub(1);
    }
}

#[cfg(test)]
fn refcount_for_test(major: u32, minor: u32) -> u32 {
    REGISTRY
        .lock()
        .instances
        .get(&(major, minor))
        .map(|inst| inst.refcnt)
        .unwrap_or(0)
}

fn block_size_and_capacity(reg: &Registry, major: u32, minor: u32) -> KResult<(u32, u64)> {
    let inst = reg
        .instances
        .get(&(major, minor))
        .ok_or(KError::InvalidArg)?;
    Ok((inst.block_size, inst.capacity))
}

/// Reads `buf.len()` bytes starting at byte `offset` into `buf`. Holds the
/// instance's refcount for the duration of the transfer, so a concurrent
/// [`unregister_blkdev_instance`] fails with `Busy` instead of racing it.
pub fn blkdev_read(major: u32, minor: u32, offset: u64, buf: &mut [u8]) -> KResult<()> {
    get_blkdev_instance(major, minor)?;
    let result = blkdev_read_locked(major, minor, offset, buf);
    release_blkdev_instance(major, minor);
    result
}

fn blkdev_read_locked(major: u32, minor: u32, offset: u64, buf: &mut [u8]) -> KResult<()> {
    let reg = REGISTRY.lock();
    let (block_size, capacity) = block_size_and_capacity(&reg, major, minor)?;
    let class = reg.classes[major as usize]
        .as_ref()
        .ok_or(KError::InvalidArg)?;

    if offset + buf.len() as u64 > capacity * block_size as u64 {
        return Err(KError::InvalidArg);
    }

    let bs = block_size as u64;
    let mut pos = offset;
    let mut written = 0usize;

    while written < buf.len() {
        let block = pos / bs;
        let delta = (pos % bs) as usize;
        let remaining = buf.len() - written;

        if delta != 0 || remaining < block_size as usize {
            let n = (block_size as usize - delta).min(remaining);
            let mut scratch = vec![0u8; block_size as usize];
            if class.ops.read_blocks(minor, block, &mut scratch, 1) == 0 {
                return Err(KError::Fail);
            }
            buf[written..written + n].copy_from_slice(&scratch[delta..delta + n]);
            pos += n as u64;
            written += n;
            continue;
        }

        let full_blocks = (remaining as u64) / bs;
        let mut want = full_blocks as u32;
        let mut off = 0u64;
        while want > 0 {
            let got = class.ops.read_blocks(
                minor,
                block + off / bs,
                &mut buf[written + off as usize..written + remaining],
                want,
            );
            if got == 0 {
                return Err(KError::Fail);
            }
            off += got as u64 * bs;
            want -= got;
        }
        pos += full_blocks * bs;
        written += (full_blocks * bs) as usize;
    }

    Ok(())
}

/// Writes `buf` starting at byte `offset`. Holds the instance's refcount for
/// the duration of the transfer, same as [`blkdev_read`].
pub fn blkdev_write(major: u32, minor: u32, offset: u64, buf: &[u8]) -> KResult<()> {
    get_blkdev_instance(major, minor)?;
    let result = blkdev_write_locked(major, minor, offset, buf);
    release_blkdev_instance(major, minor);
    result
}

fn blkdev_write_locked(major: u32, minor: u32, offset: u64, buf: &[u8]) -> KResult<()> {
    let reg = REGISTRY.lock();
    let (block_size, capacity) = block_size_and_capacity(&reg, major, minor)?;
    let class = reg.classes[major as usize]
        .as_ref()
        .ok_or(KError::InvalidArg)?;

    write_impl(class, minor, block_size, capacity, offset, buf)
}

fn write_impl(
    class: &Class,
    minor: u32,
    block_size: u32,
    capacity: u64,
    offset: u64,
    buf: &[u8],
) -> KResult<()> {
    if offset + buf.len() as u64 > capacity * block_size as u64 {
        return Err(KError::InvalidArg);
    }

    let mut pos = offset;
    let mut remaining = buf;
    let bs = block_size as u64;

    while !remaining.is_empty() {
        let block = pos / bs;
        let delta = (pos % bs) as usize;

        if delta != 0 {
            let mut scratch = vec![0u8; block_size as usize];
            if class.ops.read_blocks(minor, block, &mut scratch, 1) == 0 {
                return Err(KError::Fail);
            }
            let n = (block_size as usize - delta).min(remaining.len());
            scratch[delta..delta + n].copy_from_slice(&remaining[..n]);
            if class.ops.write_blocks(minor, block, &scratch, 1) == 0 {
                return Err(KError::Fail);
            }
            pos += n as u64;
            remaining = &remaining[n..];
            continue;
        }

        let full_blocks = (remaining.len() as u64) / bs;
        if full_blocks > 0 {
            let mut want = full_blocks as u32;
            let mut off = 0usize;
            while want > 0 {
                let got = class
                    .ops
                    .write_blocks(minor, block + (off as u64 / bs), &remaining[off..], want);
                if got == 0 {
                    return Err(KError::Fail);
                }
                off += got as usize * block_size as usize;
                want -= got;
            }
            pos += full_blocks * bs;
            remaining = &remaining[(full_blocks * bs) as usize..];
            continue;
        }

        // Partial tail block.
        let tail_block = pos / bs;
        let mut scratch = vec![0u8; block_size as usize];
        if class.ops.read_blocks(minor, tail_block, &mut scratch, 1) == 0 {
            return Err(KError::Fail);
        }
        scratch[..remaining.len()].copy_from_slice(remaining);
        if class.ops.write_blocks(minor, tail_block, &scratch, 1) == 0 {
            return Err(KError::Fail);
        }
        break;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use spin::Mutex as SpinMutex;

    struct MemDisk {
        data: SpinMutex<alloc::vec::Vec<u8>>,
        block_size: usize,
    }

    impl BlockOps for Arc<MemDisk> {
        fn read_blocks(&self, _minor: u32, start_block: u64, buf: &mut [u8], nblocks: u32) -> u32 {
            let data = self.data.lock();
            let off = start_block as usize * self.block_size;
            let n = nblocks as usize * self.block_size;
            buf[..n].copy_from_slice(&data[off..off + n]);
            nblocks
        }

        fn write_blocks(&self, _minor: u32, start_block: u64, buf: &[u8], nblocks: u32) -> u32 {
            let mut data = self.data.lock();
            let off = start_block as usize * self.block_size;
            let n = nblocks as usize * self.block_size;
            data[off..off + n].copy_from_slice(&buf[..n]);
            nblocks
        }
    }

    fn setup(major: u32, minor: u32, nblocks: usize, block_size: usize) -> Arc<MemDisk> {
        let disk = Arc::new(MemDisk {
            data: SpinMutex::new(vec![0u8; nblocks * block_size]),
            block_size,
        });
        register_blkdev_class(major, "memdisk", Box::new(disk.clone())).ok();
        register_blkdev_instance(major, minor, "memdisk0", block_size as u32, nblocks as u64)
            .unwrap();
        disk
    }

    #[test]
    fn write_then_read_back_unaligned_range() {
        let major = 1;
        let _disk = setup(major, 0, 4, 512);

        let data: alloc::vec::Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();
        blkdev_write(major, 0, 100, &data).unwrap();

        let mut out = vec![0u8; data.len()];
        blkdev_read(major, 0, 100, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn register_instance_twice_is_idempotent() {
        let major = 2;
        let _disk = setup(major, 0, 2, 512);
        assert!(register_blkdev_instance(major, 0, "memdisk0", 512, 2).is_ok());
    }

    #[test]
    fn unregister_busy_instance_fails() {
        let major = 3;
        let _disk = setup(major, 0, 2, 512);
        get_blkdev_instance(major, 0).unwrap();
        assert_eq!(unregister_blkdev_instance(major, 0), Err(KError::Busy));
        release_blkdev_instance(major, 0);
        assert!(unregister_blkdev_instance(major, 0).is_ok());
    }

    struct Probe {
        inner: Arc<MemDisk>,
        major: u32,
        minor: u32,
        seen: SpinMutex<u32>,
    }

    impl BlockOps for Arc<Probe> {
        fn read_blocks(&self, minor: u32, start_block: u64, buf: &mut [u8], nblocks: u32) -> u32 {
            *self.seen.lock() = refcount_for_test(self.major, self.minor);
            self.inner.read_blocks(minor, start_block, buf, nblocks)
        }

        fn write_blocks(&self, minor: u32, start_block: u64, buf: &[u8], nblocks: u32) -> u32 {
            self.inner.write_blocks(minor, start_block, buf, nblocks)
        }
    }

    #[test]
    fn read_holds_the_instance_refcount_for_the_duration_of_the_call() {
        let major = 4;
        let disk = Arc::new(MemDisk {
            data: SpinMutex::new(vec![0u8; 4 * 512]),
            block_size: 512,
        });
        let probe = Arc::new(Probe {
            inner: disk,
            major,
            minor: 0,
            seen: SpinMutex::new(0),
        });
        register_blkdev_class(major, "probe", Box::new(probe.clone())).unwrap();
        register_blkdev_instance(major, 0, "probe0", 512, 4).unwrap();

        assert_eq!(refcount_for_test(major, 0), 0);
        let mut buf = vec![0u8; 512];
        blkdev_read(major, 0, 0, &mut buf).unwrap();

        assert_eq!(
            *probe.seen.lock(),
            1,
            "refcount should be held while the transfer is in flight"
        );
        assert_eq!(
            refcount_for_test(major, 0),
            0,
            "refcount should be released once the call returns"
        );
    }
}
