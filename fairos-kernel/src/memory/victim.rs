//! Second-chance victim selection across every address space.

use x86_64::structures::paging::{Page, PageTableFlags, PhysFrame};

use super::{PageAllocator, PageDirEntry, PageDirectory};
use crate::thread::ThreadId;

/// A resident user page chosen for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Victim {
    pub owner: ThreadId,
    pub root: PhysFrame,
    pub page: Page,
}

/// Scan `entries` in order for a page to evict.
///
/// The first pass gives every recently used page a second chance: a page
/// whose accessed bit is set has the bit cleared and is skipped, and the
/// first page found with the bit already clear is chosen. If every page was
/// recently used, the second pass takes the first resident page. `None`
/// means no registered address space has a resident user page.
///
/// The caller must hold the registry lock for as long as it uses the result.
pub fn select_victim<A: PageAllocator + ?Sized>(
    entries: &[PageDirEntry],
    pages: &A,
) -> Option<Victim> {
    for entry in entries {
        let mut directory = PageDirectory::open(entry.root, pages);
        let found = directory.find_resident(|_, pte| {
            let mut flags = pte.flags();
            if flags.contains(PageTableFlags::ACCESSED) {
                flags.remove(PageTableFlags::ACCESSED);
                pte.set_flags(flags);
                false
            } else {
                true
            }
        });
        if let Some(page) = found {
            return Some(victim(entry, page));
        }
    }

    for entry in entries {
        let mut directory = PageDirectory::open(entry.root, pages);
        let found = directory.find_resident(|_, pte| {
            let mut flags = pte.flags();
            flags.remove(PageTableFlags::ACCESSED);
            pte.set_flags(flags);
            true
        });
        if let Some(page) = found {
            return Some(victim(entry, page));
        }
    }

    None
}

fn victim(entry: &PageDirEntry, page: Page) -> Victim {
    Victim {
        owner: entry.owner,
        root: entry.root,
        page,
    }
}
