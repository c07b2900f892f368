// arena.rs — lifetime-scoped bump storage
//
// The engine runs four of these: persistent (demo-long), config-string
// (recycled on every gamestate), per-message temp, and a scoped temp for
// short bursts inside one function. There is no individual free; a region
// dies when its arena is cleared or released back to a mark. Handles are
// plain ranges, so slots stay valid across reallocation of the backing
// store.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaRange {
    start: u32,
    len: u32,
}

impl ArenaRange {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug)]
pub struct Arena {
    bytes: Vec<u8>,
    name: &'static str,
}

impl Arena {
    pub fn with_capacity(capacity: usize, name: &'static str) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn used(&self) -> usize {
        self.bytes.len()
    }

    pub fn alloc(&mut self, data: &[u8]) -> ArenaRange {
        let start = self.bytes.len();
        self.bytes.extend_from_slice(data);
        ArenaRange {
            start: start as u32,
            len: data.len() as u32,
        }
    }

    pub fn alloc_str(&mut self, s: &str) -> ArenaRange {
        self.alloc(s.as_bytes())
    }

    pub fn get(&self, range: ArenaRange) -> &[u8] {
        &self.bytes[range.start as usize..(range.start + range.len) as usize]
    }

    pub fn get_str(&self, range: ArenaRange) -> &str {
        std::str::from_utf8(self.get(range)).unwrap_or("")
    }

    /// Drop everything. Capacity is kept for reuse.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn mark(&self) -> usize {
        self.bytes.len()
    }

    /// Drop everything allocated after `mark`.
    pub fn release(&mut self, mark: usize) {
        self.bytes.truncate(mark);
    }

    /// Capture a mark that is released when the guard drops.
    pub fn scope(&mut self) -> ScopedArena<'_> {
        let mark = self.mark();
        ScopedArena { arena: self, mark }
    }
}

/// Stacked mark/release discipline: allocations made through the guard die
/// at scope exit.
pub struct ScopedArena<'a> {
    arena: &'a mut Arena,
    mark: usize,
}

impl std::ops::Deref for ScopedArena<'_> {
    type Target = Arena;

    fn deref(&self) -> &Arena {
        self.arena
    }
}

impl std::ops::DerefMut for ScopedArena<'_> {
    fn deref_mut(&mut self) -> &mut Arena {
        self.arena
    }
}

impl Drop for ScopedArena<'_> {
    fn drop(&mut self) {
        self.arena.release(self.mark);
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_get() {
        let mut arena = Arena::with_capacity(64, "test");
        assert_eq!(arena.name(), "test");
        let a = arena.alloc_str("hello");
        let b = arena.alloc(&[1, 2, 3]);
        assert_eq!(arena.get_str(a), "hello");
        assert_eq!(arena.get(b), &[1, 2, 3]);
        assert_eq!(arena.used(), 8);
    }

    #[test]
    fn test_clear_recycles() {
        let mut arena = Arena::with_capacity(16, "test");
        arena.alloc_str("abcdef");
        arena.clear();
        assert_eq!(arena.used(), 0);
        let r = arena.alloc_str("xy");
        assert_eq!(arena.get_str(r), "xy");
    }

    #[test]
    fn test_mark_release() {
        let mut arena = Arena::with_capacity(64, "test");
        let keep = arena.alloc_str("keep");
        let mark = arena.mark();
        arena.alloc_str("scratch");
        arena.alloc_str("more scratch");
        arena.release(mark);
        assert_eq!(arena.used(), 4);
        assert_eq!(arena.get_str(keep), "keep");
    }

    #[test]
    fn test_scope_guard_releases_on_drop() {
        let mut arena = Arena::with_capacity(64, "test");
        arena.alloc_str("keep");
        {
            let mut scope = arena.scope();
            scope.alloc_str("temporary");
            assert_eq!(scope.used(), 13);
        }
        assert_eq!(arena.used(), 4);
    }

    #[test]
    fn test_ranges_survive_growth() {
        let mut arena = Arena::with_capacity(2, "test");
        let early = arena.alloc_str("first");
        for _ in 0..100 {
            arena.alloc_str("padding padding padding");
        }
        assert_eq!(arena.get_str(early), "first");
    }
}
