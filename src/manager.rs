//! C9: manager kernel.
//!
//! The public-facing datastore lifecycle (`create`/`open`/`open_read_only`/
//! `close`/`flush`), construct/find/destroy with an erased in-place
//! constructor, the three object directories wired together behind one
//! mutex (§5: "a single object-directory mutex serializes all three for
//! mutation"), snapshot/copy/remove, and metadata access.

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::object_directory::ObjectDirectory;
use crate::offset_ptr::{Offset, NULL_OFFSET};
use crate::segment_allocator::SegmentAllocator;
use crate::storage::{self, Metadata};
use log::info;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use uuid::Uuid;

/// An erased in-place constructor/destructor pair, supplied by the
/// container front-end so the kernel never names `T` beyond what's needed
/// to size and run its constructor (§9 "Dynamic type erasure").
pub trait InPlaceConstructor<T> {
    fn construct(&self, dst: *mut T, count: usize);
    fn destroy(&self, dst: *mut T, count: usize);
}

fn type_id_hash<T: 'static>() -> u64 {
    let mut hasher = DefaultHasher::new();
    std::any::type_name::<T>().hash(&mut hasher);
    hasher.finish()
}

fn type_key<T: 'static>() -> String {
    std::any::type_name::<T>().to_string()
}

struct Directories {
    named: ObjectDirectory<String>,
    unique: ObjectDirectory<String>,
    anonymous: ObjectDirectory<Offset>,
}

impl Directories {
    fn empty() -> Self {
        Directories { named: ObjectDirectory::new(), unique: ObjectDirectory::new(), anonymous: ObjectDirectory::new() }
    }

    fn load(root: &Path) -> Result<Self> {
        let named_path = storage::named_object_directory_path(root);
        let unique_path = storage::unique_object_directory_path(root);
        let anon_path = storage::anonymous_object_directory_path(root);
        Ok(Directories {
            named: if named_path.exists() { ObjectDirectory::deserialize(&named_path)? } else { ObjectDirectory::new() },
            unique: if unique_path.exists() { ObjectDirectory::deserialize(&unique_path)? } else { ObjectDirectory::new() },
            anonymous: if anon_path.exists() { ObjectDirectory::deserialize(&anon_path)? } else { ObjectDirectory::new() },
        })
    }

    fn store(&self, root: &Path) -> Result<()> {
        self.named.serialize(&storage::named_object_directory_path(root))?;
        self.unique.serialize(&storage::unique_object_directory_path(root))?;
        self.anonymous.serialize(&storage::anonymous_object_directory_path(root))
    }
}

pub struct Manager {
    root: PathBuf,
    allocator: SegmentAllocator,
    directories: Mutex<Directories>,
    metadata: Metadata,
    read_only: bool,
    closed: AtomicBool,
}

impl Manager {
    pub fn create(root: &Path, capacity: usize, config: RuntimeConfig) -> Result<Self> {
        storage::create_layout(root)?;
        let core = storage::core_dir(root);
        let allocator = SegmentAllocator::create(&core, capacity, config)?;
        let metadata = Metadata::fresh();
        metadata.write(root)?;
        info!("created datastore at {:?}, capacity {} bytes, uuid {}", root, capacity, metadata.uuid);
        Ok(Manager {
            root: root.to_path_buf(),
            allocator,
            directories: Mutex::new(Directories::empty()),
            metadata,
            read_only: false,
            closed: AtomicBool::new(false),
        })
    }

    pub fn open(root: &Path, capacity_hint: usize, config: RuntimeConfig) -> Result<Self> {
        let metadata = Metadata::read(root)?;
        if !storage::is_properly_closed(root) {
            return Err(Error::NotProperlyClosed(root.to_path_buf()));
        }
        storage::clear_properly_closed_mark(root)?;
        let core = storage::core_dir(root);
        let allocator = SegmentAllocator::open(&core, capacity_hint, false, config)?;
        let directories = Directories::load(root)?;
        info!("opened datastore at {:?}, uuid {}", root, metadata.uuid);
        Ok(Manager {
            root: root.to_path_buf(),
            allocator,
            directories: Mutex::new(directories),
            metadata,
            read_only: false,
            closed: AtomicBool::new(false),
        })
    }

    pub fn open_read_only(root: &Path, config: RuntimeConfig) -> Result<Self> {
        let metadata = Metadata::read(root)?;
        if !storage::is_properly_closed(root) {
            return Err(Error::NotProperlyClosed(root.to_path_buf()));
        }
        let core = storage::core_dir(root);
        let allocator = SegmentAllocator::open(&core, 0, true, config)?;
        let directories = Directories::load(root)?;
        info!("opened datastore read-only at {:?}, uuid {}", root, metadata.uuid);
        Ok(Manager {
            root: root.to_path_buf(),
            allocator,
            directories: Mutex::new(directories),
            metadata,
            read_only: true,
            closed: AtomicBool::new(false),
        })
    }

    fn require_writable(&self, what: &'static str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ReadOnly(what));
        }
        if self.read_only {
            return Err(Error::ReadOnly(what));
        }
        Ok(())
    }

    /// Serializes management state, syncs the segment, releases the VM
    /// region, and writes the properly-closed mark. A no-op (besides
    /// marking closed) in read-only mode, since nothing was mutated.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.read_only {
            let core = storage::core_dir(&self.root);
            self.allocator.serialize(&core)?;
            self.directories.lock().store(&self.root)?;
            self.allocator.sync(true)?;
            storage::write_properly_closed_mark(&self.root)?;
        }
        info!("closed datastore at {:?}", self.root);
        Ok(())
    }

    pub fn flush(&self, durable: bool) -> Result<()> {
        self.require_writable("flush")?;
        self.allocator.sync(durable)
    }

    fn alloc_for<T>(&self, count: usize) -> Result<(*mut T, Offset)> {
        let bytes = count * std::mem::size_of::<T>();
        let offset = self.allocator.allocate_aligned(bytes.max(1), std::mem::align_of::<T>());
        if offset == NULL_OFFSET {
            return Err(Error::OutOfSpace { requested: bytes, available: self.allocator.capacity() - self.allocator.size() });
        }
        let ptr = unsafe { self.allocator.base().offset(offset as isize) as *mut T };
        Ok((ptr, offset))
    }

    fn offset_of_ptr<T>(&self, ptr: *const T) -> Offset {
        (ptr as isize - self.allocator.base() as isize) as Offset
    }

    pub fn construct_named<T: 'static>(
        &self,
        name: &str,
        count: usize,
        try_find: bool,
        ctor: &dyn InPlaceConstructor<T>,
    ) -> Result<(*mut T, usize)> {
        self.require_writable("construct")?;
        let mut dirs = self.directories.lock();
        if let Some(record) = dirs.named.find(&name.to_string()) {
            if try_find {
                let ptr = unsafe { self.allocator.base().offset(record.offset as isize) as *mut T };
                return Ok((ptr, record.length));
            }
            return Err(Error::DuplicateKey(name.to_string()));
        }
        drop(dirs);
        let (ptr, offset) = self.alloc_for::<T>(count)?;
        let mut dirs = self.directories.lock();
        dirs.named.insert(name.to_string(), type_id_hash::<T>(), offset, count, String::new())?;
        drop(dirs);
        ctor.construct(ptr, count);
        Ok((ptr, count))
    }

    pub fn construct_unique<T: 'static>(
        &self,
        count: usize,
        try_find: bool,
        ctor: &dyn InPlaceConstructor<T>,
    ) -> Result<(*mut T, usize)> {
        self.require_writable("construct")?;
        let key = type_key::<T>();
        let mut dirs = self.directories.lock();
        if let Some(record) = dirs.unique.find(&key) {
            if try_find {
                let ptr = unsafe { self.allocator.base().offset(record.offset as isize) as *mut T };
                return Ok((ptr, record.length));
            }
            return Err(Error::DuplicateKey(key));
        }
        drop(dirs);
        let (ptr, offset) = self.alloc_for::<T>(count)?;
        let mut dirs = self.directories.lock();
        dirs.unique.insert(key, type_id_hash::<T>(), offset, count, String::new())?;
        drop(dirs);
        ctor.construct(ptr, count);
        Ok((ptr, count))
    }

    pub fn construct_anonymous<T: 'static>(&self, count: usize, ctor: &dyn InPlaceConstructor<T>) -> Result<(*mut T, usize)> {
        self.require_writable("construct")?;
        let (ptr, offset) = self.alloc_for::<T>(count)?;
        let mut dirs = self.directories.lock();
        dirs.anonymous.insert(offset, type_id_hash::<T>(), offset, count, String::new())?;
        drop(dirs);
        ctor.construct(ptr, count);
        Ok((ptr, count))
    }

    pub fn find_named<T>(&self, name: &str) -> Option<(*mut T, usize)> {
        let dirs = self.directories.lock();
        dirs.named.find(&name.to_string()).map(|r| (unsafe { self.allocator.base().offset(r.offset as isize) as *mut T }, r.length))
    }

    pub fn find_unique<T: 'static>(&self) -> Option<(*mut T, usize)> {
        let dirs = self.directories.lock();
        dirs.unique
            .find(&type_key::<T>())
            .map(|r| (unsafe { self.allocator.base().offset(r.offset as isize) as *mut T }, r.length))
    }

    pub fn destroy_named<T>(&self, name: &str, ctor: &dyn InPlaceConstructor<T>) -> Result<bool> {
        self.require_writable("destroy")?;
        let mut dirs = self.directories.lock();
        let record = match dirs.named.erase(&name.to_string()) {
            Some(r) => r,
            None => return Ok(false),
        };
        drop(dirs);
        let ptr = unsafe { self.allocator.base().offset(record.offset as isize) as *mut T };
        ctor.destroy(ptr, record.length);
        self.allocator.deallocate(record.offset);
        Ok(true)
    }

    pub fn destroy_unique<T: 'static>(&self, ctor: &dyn InPlaceConstructor<T>) -> Result<bool> {
        self.require_writable("destroy")?;
        let mut dirs = self.directories.lock();
        let record = match dirs.unique.erase(&type_key::<T>()) {
            Some(r) => r,
            None => return Ok(false),
        };
        drop(dirs);
        let ptr = unsafe { self.allocator.base().offset(record.offset as isize) as *mut T };
        ctor.destroy(ptr, record.length);
        self.allocator.deallocate(record.offset);
        Ok(true)
    }

    pub fn destroy_ptr<T>(&self, ptr: *const T, ctor: &dyn InPlaceConstructor<T>) -> Result<bool> {
        self.require_writable("destroy")?;
        let offset = self.offset_of_ptr(ptr);
        let mut dirs = self.directories.lock();
        let length = if let Some(r) = dirs.named.erase_by_offset(offset) {
            r.length
        } else if let Some(r) = dirs.unique.erase_by_offset(offset) {
            r.length
        } else if let Some(r) = dirs.anonymous.erase_by_offset(offset) {
            r.length
        } else {
            return Ok(false);
        };
        drop(dirs);
        ctor.destroy(ptr as *mut T, length);
        self.allocator.deallocate(offset);
        Ok(true)
    }

    pub fn get_instance_name<T>(&self, ptr: *const T) -> Option<String> {
        let offset = self.offset_of_ptr(ptr);
        let dirs = self.directories.lock();
        dirs.named.find_by_offset(offset).map(|r| r.key.clone())
    }

    pub fn get_instance_length<T>(&self, ptr: *const T) -> Option<usize> {
        let offset = self.offset_of_ptr(ptr);
        let dirs = self.directories.lock();
        dirs.named
            .find_by_offset(offset)
            .or_else(|| dirs.unique.find_by_offset(offset))
            .map(|r| r.length)
            .or_else(|| dirs.anonymous.find_by_offset(offset).map(|r| r.length))
    }

    pub fn get_instance_type<T>(&self, ptr: *const T) -> Option<u64> {
        let offset = self.offset_of_ptr(ptr);
        let dirs = self.directories.lock();
        dirs.named
            .find_by_offset(offset)
            .or_else(|| dirs.unique.find_by_offset(offset))
            .or_else(|| dirs.anonymous.find_by_offset(offset))
            .map(|r| r.type_id_hash)
    }

    pub fn get_uuid(&self) -> Uuid {
        self.metadata.uuid
    }

    pub fn get_version(&self) -> u32 {
        self.metadata.version
    }

    pub fn get_description(&self) -> Result<String> {
        storage::read_description(&self.root)
    }

    pub fn set_description(&self, text: &str) -> Result<()> {
        self.require_writable("set_description")?;
        storage::write_description(&self.root, text)
    }

    /// Syncs, serializes management state, then parallel-copies the whole
    /// datastore tree to `dst` with a fresh UUID and its own
    /// properly-closed mark.
    pub fn snapshot(&self, dst: &Path) -> Result<()> {
        self.require_writable("snapshot")?;
        let core = storage::core_dir(&self.root);
        self.allocator.serialize(&core)?;
        self.directories.lock().store(&self.root)?;
        self.allocator.sync(true)?;
        storage::copy_tree(&self.root, dst)?;
        let fresh = Metadata::fresh();
        fresh.write(dst)?;
        storage::write_properly_closed_mark(dst)?;
        info!("snapshotted {:?} -> {:?}, new uuid {}", self.root, dst, fresh.uuid);
        Ok(())
    }

    pub fn snapshot_async(self: Arc<Self>, dst: PathBuf) -> JoinHandle<Result<()>> {
        std::thread::spawn(move || self.snapshot(&dst))
    }

    /// Copies a closed datastore byte-for-byte, preserving its UUID.
    pub fn copy(src: &Path, dst: &Path) -> Result<()> {
        if !storage::is_properly_closed(src) {
            return Err(Error::NotProperlyClosed(src.to_path_buf()));
        }
        storage::copy_tree(src, dst)
    }

    pub fn copy_async(src: PathBuf, dst: PathBuf) -> JoinHandle<Result<()>> {
        std::thread::spawn(move || Self::copy(&src, &dst))
    }

    pub fn remove(path: &Path) -> Result<()> {
        storage::remove(path)
    }

    pub fn remove_async(path: PathBuf) -> JoinHandle<Result<()>> {
        std::thread::spawn(move || Self::remove(&path))
    }

    /// Checks for the properly-closed mark without opening the datastore.
    pub fn consistent(path: &Path) -> bool {
        storage::is_properly_closed(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct IntCtor(i32);
    impl InPlaceConstructor<i32> for IntCtor {
        fn construct(&self, dst: *mut i32, count: usize) {
            for i in 0..count {
                unsafe { dst.add(i).write(self.0) };
            }
        }
        fn destroy(&self, _dst: *mut i32, _count: usize) {}
    }

    #[test]
    fn create_construct_close_reopen_find() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("store");
        {
            let manager = Manager::create(&root, 64 * 1024 * 1024, RuntimeConfig::default()).unwrap();
            let (ptr, len) = manager.construct_named::<i32>("named_obj", 1, false, &IntCtor(10)).unwrap();
            assert_eq!(len, 1);
            unsafe { assert_eq!(*ptr, 10) };
            let (arr_ptr, arr_len) = manager.construct_named::<i32>("array_obj", 2, false, &IntCtor(10)).unwrap();
            assert_eq!(arr_len, 2);
            unsafe { assert_eq!(*arr_ptr.add(1), 10) };
            manager.close().unwrap();
        }
        assert!(Manager::consistent(&root));
        {
            let manager = Manager::open(&root, 0, RuntimeConfig::default()).unwrap();
            let (ptr, _len) = manager.find_named::<i32>("named_obj").unwrap();
            unsafe { assert_eq!(*ptr, 10) };
            manager.destroy_named("named_obj", &IntCtor(0)).unwrap();
            manager.destroy_named("array_obj", &IntCtor(0)).unwrap();
            manager.close().unwrap();
        }
        {
            let manager = Manager::open(&root, 0, RuntimeConfig::default()).unwrap();
            assert!(manager.find_named::<i32>("named_obj").is_none());
        }
    }

    #[test]
    fn open_without_close_is_rejected() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("store");
        let manager = Manager::create(&root, 16 * 1024 * 1024, RuntimeConfig::default()).unwrap();
        manager.flush(true).unwrap();
        // simulate crash: never call close(), so the mark is never written
        drop(manager);
        let reopened = Manager::open(&root, 0, RuntimeConfig::default());
        assert!(matches!(reopened, Err(Error::NotProperlyClosed(_))));
    }

    #[test]
    fn snapshot_then_mutate_source_does_not_affect_destination() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("store");
        let snap = dir.path().join("snap");
        let manager = Manager::create(&root, 16 * 1024 * 1024, RuntimeConfig::default()).unwrap();
        let (ptr, _) = manager.construct_named::<i32>("v", 1, false, &IntCtor(1)).unwrap();
        manager.snapshot(&snap).unwrap();
        unsafe { *ptr = 999 };
        manager.close().unwrap();

        let reopened = Manager::open_read_only(&snap, RuntimeConfig::default()).unwrap();
        let (snap_ptr, _) = reopened.find_named::<i32>("v").unwrap();
        unsafe { assert_eq!(*snap_ptr, 1) };
    }
}
