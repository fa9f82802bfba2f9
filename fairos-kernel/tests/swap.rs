use std::sync::Arc;

use fairos_abi::{PAGE_SIZE, SECTOR_SIZE, SECTORS_PER_PAGE};
use fairos_kernel::devices::block::{BlockDevice, BlockError};
use fairos_kernel::hosted::{HeapPageAllocator, MemDisk};
use fairos_kernel::memory::{
    PageAllocator, PageDirectory, SwapError, SwapStore, frame_bytes,
};
use fairos_kernel::thread::ThreadId;
use fairos_kernel::trace::Trace;
use spinning_top::Spinlock;
use x86_64::VirtAddr;
use x86_64::structures::paging::{Page, PhysFrame};

const OWNER: ThreadId = ThreadId::from_raw(5);

struct Fixture {
    heap: Arc<HeapPageAllocator>,
    swap: SwapStore<MemDisk>,
    root: PhysFrame,
}

impl Fixture {
    fn new(frames: usize, slots: u64) -> Self {
        let heap = Arc::new(HeapPageAllocator::new(frames));
        let pages: Arc<dyn PageAllocator> = heap.clone();
        let disk = MemDisk::new(slots * SECTORS_PER_PAGE as u64);
        let swap = SwapStore::init(disk, pages).unwrap();
        let root = PageDirectory::create(&*heap).unwrap().root();
        Self { heap, swap, root }
    }

    fn directory(&self) -> PageDirectory<'_, HeapPageAllocator> {
        PageDirectory::open(self.root, &*self.heap)
    }

    /// Map a page at `addr` filled with a pattern derived from `seed`.
    fn map_pattern(&self, addr: u64, seed: u8, writable: bool) {
        let frame = self.heap.allocate_page(false).unwrap();
        unsafe { frame_bytes(&*self.heap, frame) }.copy_from_slice(&pattern(seed));
        self.directory().map(page(addr), frame, writable).unwrap();
    }

    fn contents(&self, addr: u64) -> [u8; PAGE_SIZE] {
        let (frame, _) = self.directory().translate(page(addr)).unwrap();
        *unsafe { frame_bytes(&*self.heap, frame) }
    }

    fn evict(&self, addr: u64) -> Result<usize, SwapError> {
        self.swap
            .evict(OWNER, self.root, page(addr))
            .map(|slot| slot.index())
    }

    fn restore(&self, owner: ThreadId, addr: u64) -> Result<bool, SwapError> {
        self.swap.restore(owner, self.root, VirtAddr::new(addr))
    }
}

fn page(addr: u64) -> Page {
    Page::containing_address(VirtAddr::new(addr))
}

fn pattern(seed: u8) -> [u8; PAGE_SIZE] {
    let mut bytes = [0; PAGE_SIZE];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = (i as u8).wrapping_mul(31).wrapping_add(seed);
    }
    bytes
}

#[test]
fn round_trip_preserves_bytes_and_writability() {
    let fx = Fixture::new(16, 4);
    fx.map_pattern(0x1000, 1, true);
    fx.map_pattern(0x2000, 2, false);
    let before = fx.heap.in_use();

    assert_eq!(fx.evict(0x1000), Ok(0));
    assert_eq!(fx.evict(0x2000), Ok(1));
    assert_eq!(fx.heap.in_use(), before - 2);
    assert!(!fx.directory().is_present(page(0x1000)));
    assert!(fx.swap.contains(OWNER, VirtAddr::new(0x1abc)));
    assert!(fx.swap.accounting_holds());

    // Slot 1 starts at sector 8 and holds the second page.
    let disk = fx.swap.device();
    assert_eq!(
        disk.sector(SECTORS_PER_PAGE as u64 + 1),
        pattern(2)[SECTOR_SIZE..2 * SECTOR_SIZE]
    );

    // Any address inside the page brings it back.
    assert_eq!(fx.restore(OWNER, 0x1ff8), Ok(true));
    assert_eq!(fx.restore(OWNER, 0x2000), Ok(true));
    assert_eq!(fx.contents(0x1000), pattern(1));
    assert_eq!(fx.contents(0x2000), pattern(2));
    assert!(fx.directory().is_writable(page(0x1000)));
    assert!(!fx.directory().is_writable(page(0x2000)));
    assert_eq!(fx.heap.in_use(), before);

    let stats = fx.swap.stats();
    assert_eq!((stats.swapped_out, stats.swapped_in), (2, 2));
    assert_eq!(stats.free_slots, stats.total_slots);
    assert!(fx.swap.accounting_holds());
}

#[test]
fn lookups_are_keyed_by_owner_and_page() {
    let fx = Fixture::new(16, 4);
    fx.map_pattern(0x1000, 9, true);
    fx.evict(0x1000).unwrap();

    let stranger = ThreadId::from_raw(6);
    assert_eq!(fx.restore(stranger, 0x1000), Ok(false));
    assert!(!fx.swap.contains(stranger, VirtAddr::new(0x1000)));
    assert_eq!(fx.restore(OWNER, 0x3000), Ok(false));
    assert!(fx.swap.contains(OWNER, VirtAddr::new(0x1000)));
}

#[test]
fn release_all_frees_every_slot_of_owner() {
    let fx = Fixture::new(32, 8);
    let addrs = [0x1000, 0x2000, 0x3000, 0x4000];
    for (i, addr) in addrs.into_iter().enumerate() {
        fx.map_pattern(addr, i as u8, true);
        fx.evict(addr).unwrap();
    }
    assert_eq!(fx.swap.stats().used_slots, 4);

    assert_eq!(fx.swap.release_all(ThreadId::from_raw(99)), 0);
    assert_eq!(fx.swap.release_all(OWNER), 4);
    for addr in addrs {
        assert!(!fx.swap.contains(OWNER, VirtAddr::new(addr)));
    }

    let stats = fx.swap.stats();
    assert_eq!(stats.released, 4);
    assert_eq!(stats.free_slots, 8);
    assert!(fx.swap.accounting_holds());
    assert_eq!(fx.swap.release_all(OWNER), 0);
}

#[test]
fn slots_are_reused_first_fit() {
    let fx = Fixture::new(32, 8);
    for (i, addr) in [0x1000, 0x2000, 0x3000].into_iter().enumerate() {
        fx.map_pattern(addr, i as u8, true);
        assert_eq!(fx.evict(addr), Ok(i));
    }
    fx.restore(OWNER, 0x2000).unwrap();
    fx.map_pattern(0x4000, 4, true);
    assert_eq!(fx.evict(0x4000), Ok(1));
}

#[test]
fn full_device_rejects_eviction() {
    let fx = Fixture::new(16, 1);
    fx.map_pattern(0x1000, 1, true);
    fx.map_pattern(0x2000, 2, true);
    fx.evict(0x1000).unwrap();

    assert_eq!(fx.evict(0x2000), Err(SwapError::NoFreeSlot));
    assert_eq!(fx.contents(0x2000), pattern(2));
    assert!(fx.swap.accounting_holds());
}

#[test]
fn evicting_absent_page_fails() {
    let fx = Fixture::new(8, 2);
    assert_eq!(fx.evict(0x7000), Err(SwapError::NotMapped));
}

#[test]
fn write_failure_leaves_page_resident() {
    let fx = Fixture::new(16, 2);
    fx.map_pattern(0x1000, 3, true);

    fx.swap.device().fail_writes(true);
    assert_eq!(fx.evict(0x1000), Err(SwapError::Io(BlockError::IoError)));
    assert_eq!(fx.contents(0x1000), pattern(3));
    assert!(fx.directory().is_writable(page(0x1000)));
    assert_eq!(fx.swap.stats().free_slots, 2);
    assert!(fx.swap.accounting_holds());

    fx.swap.device().fail_writes(false);
    assert_eq!(fx.evict(0x1000), Ok(0));
}

#[test]
fn write_failure_restores_read_only_mapping() {
    let fx = Fixture::new(16, 2);
    fx.map_pattern(0x1000, 6, false);

    fx.swap.device().fail_writes(true);
    assert!(fx.evict(0x1000).is_err());
    assert!(fx.directory().is_present(page(0x1000)));
    assert!(!fx.directory().is_writable(page(0x1000)));
    assert_eq!(fx.contents(0x1000), pattern(6));
}

/// Disk that notes, on every sector write, whether the watched page is
/// still mapped.
struct WatchedDisk {
    disk: MemDisk,
    pages: Arc<HeapPageAllocator>,
    watch: Spinlock<Option<(PhysFrame, Page)>>,
    mapped_during_write: Spinlock<Vec<bool>>,
}

impl BlockDevice for WatchedDisk {
    fn sector_count(&self) -> u64 {
        self.disk.sector_count()
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        self.disk.read_sector(sector, buf)
    }

    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<(), BlockError> {
        if let Some((root, page)) = *self.watch.lock() {
            let mapped = PageDirectory::open(root, &*self.pages).is_present(page);
            self.mapped_during_write.lock().push(mapped);
        }
        self.disk.write_sector(sector, buf)
    }
}

#[test]
fn page_is_unmapped_before_it_is_written() {
    let heap = Arc::new(HeapPageAllocator::new(16));
    let pages: Arc<dyn PageAllocator> = heap.clone();
    let mut directory = PageDirectory::create(&*heap).unwrap();
    let root = directory.root();
    let frame = heap.allocate_page(false).unwrap();
    unsafe { frame_bytes(&*heap, frame) }.copy_from_slice(&pattern(7));
    directory.map(page(0x1000), frame, true).unwrap();

    let disk = WatchedDisk {
        disk: MemDisk::new(2 * SECTORS_PER_PAGE as u64),
        pages: heap.clone(),
        watch: Spinlock::new(Some((root, page(0x1000)))),
        mapped_during_write: Spinlock::new(Vec::new()),
    };
    let swap = SwapStore::init(disk, pages).unwrap();

    assert!(swap.evict(OWNER, root, page(0x1000)).is_ok());
    let seen = swap.device().mapped_during_write.lock().clone();
    assert_eq!(seen, [false; SECTORS_PER_PAGE]);

    assert_eq!(swap.restore(OWNER, root, VirtAddr::new(0x1000)), Ok(true));
    let (frame, _) = PageDirectory::open(root, &*heap).translate(page(0x1000)).unwrap();
    assert_eq!(*unsafe { frame_bytes(&*heap, frame) }, pattern(7));
}

#[test]
fn read_failure_keeps_record() {
    let fx = Fixture::new(16, 2);
    fx.map_pattern(0x1000, 4, true);
    fx.evict(0x1000).unwrap();
    let in_use = fx.heap.in_use();

    fx.swap.device().fail_reads(true);
    assert_eq!(
        fx.restore(OWNER, 0x1000),
        Err(SwapError::Io(BlockError::IoError))
    );
    assert_eq!(fx.heap.in_use(), in_use);
    assert!(fx.swap.contains(OWNER, VirtAddr::new(0x1000)));

    fx.swap.device().fail_reads(false);
    assert_eq!(fx.restore(OWNER, 0x1000), Ok(true));
    assert_eq!(fx.contents(0x1000), pattern(4));
}

#[test]
fn restore_without_frames_is_reported() {
    let fx = Fixture::new(16, 2);
    fx.map_pattern(0x1000, 5, true);
    fx.evict(0x1000).unwrap();

    fx.heap.set_capacity(fx.heap.in_use());
    assert_eq!(fx.restore(OWNER, 0x1000), Err(SwapError::ResourceExhausted));
    assert!(fx.swap.contains(OWNER, VirtAddr::new(0x1000)));
    assert!(fx.swap.accounting_holds());
}

#[test]
fn observer_sees_swap_traffic() {
    let heap = Arc::new(HeapPageAllocator::new(16));
    let pages: Arc<dyn PageAllocator> = heap.clone();
    let trace = Arc::new(Trace::new());
    let swap = SwapStore::init(MemDisk::new(32), pages)
        .unwrap()
        .with_observer(trace.clone());
    let fx = Fixture {
        root: PageDirectory::create(&*heap).unwrap().root(),
        heap,
        swap,
    };

    fx.map_pattern(0x1000, 1, true);
    fx.map_pattern(0x2000, 2, true);
    fx.evict(0x1000).unwrap();
    fx.evict(0x2000).unwrap();
    fx.restore(OWNER, 0x1000).unwrap();
    fx.swap.release_all(OWNER);

    assert_eq!(trace.swap_counts(), (2, 1, 1));
    let owner = trace.thread(OWNER).unwrap();
    assert_eq!((owner.swapped_out, owner.swapped_in, owner.released), (2, 1, 1));
}
