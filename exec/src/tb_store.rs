//! Translated-code-block store: arena-indexed slots plus a virtual hash
//! table (pc, flags → TB) and a physical-page hash table used for
//! self-modifying-code invalidation.
//!
//! Single-owner, no internal synchronization — per the concurrency
//! model, TBs are exclusively owned by the CPU thread that runs the
//! dispatch loop (`tcg_exec::exec_loop`). A freed slot is `None`, so any
//! stale index left in a jump-cache or chain slot panics on access
//! instead of silently observing a reused block's state; this plays the
//! role the donor's design notes assign to a generation counter without
//! needing a second indirection for every TB reference.

use tcg_core::tb::{TranslationBlock, PHYS_HASH_SIZE, TB_HASH_SIZE};

/// `acc_count` at or below this value makes a TB eligible for a
/// partial flush.
pub const PARTIAL_FLUSH_THRESHOLD: u32 = 100;

/// Arena + virtual/physical hash tables for TBs.
///
/// The code buffer backing emitted host code is a plain bump allocator
/// (`tcg_backend::code_buffer::CodeBuffer`), not the donor's per-page
/// chunked arena, so bytes can only be reclaimed by resetting the whole
/// buffer. Partial flush therefore reclaims *slot* capacity (useful
/// when `MAX_TBS` is the binding constraint); only a full flush also
/// resets the code buffer and reclaims *byte* capacity. `TbStore`
/// itself only manages slots/hash tables; the caller resets the code
/// buffer offset after a full flush (see `exec_loop::tb_gen_code`).
pub struct TbStore {
    slots: Vec<Option<TranslationBlock>>,
    free_list: Vec<usize>,
    virt_hash: Vec<Option<usize>>,
    phys_hash: Vec<Option<usize>>,
    /// Alternates partial/full each time the caller asks for a flush,
    /// per spec: "two flush strategies alternate each time the arena
    /// runs empty."
    next_flush_full: bool,
}

impl TbStore {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            virt_hash: vec![None; TB_HASH_SIZE],
            phys_hash: vec![None; PHYS_HASH_SIZE],
            next_flush_full: false,
        }
    }

    /// Allocates a new TB, reusing a freed slot if one is available.
    pub fn alloc(&mut self, pc: u64, flags: u32, cflags: u32) -> usize {
        let tb = TranslationBlock::new(pc, flags, cflags);
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx] = Some(tb);
            idx
        } else {
            self.slots.push(Some(tb));
            self.slots.len() - 1
        }
    }

    pub fn get(&self, idx: usize) -> &TranslationBlock {
        self.slots[idx]
            .as_ref()
            .expect("stale TB index: slot was freed by a flush")
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut TranslationBlock {
        self.slots[idx]
            .as_mut()
            .expect("stale TB index: slot was freed by a flush")
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a live TB by (pc, flags) in the virtual hash table.
    pub fn lookup(&self, pc: u64, flags: u32) -> Option<usize> {
        let bucket = TranslationBlock::hash(pc, flags);
        let mut cur = self.virt_hash[bucket];
        while let Some(idx) = cur {
            let tb = self.get(idx);
            if tb.pc == pc && tb.flags == flags {
                return Some(idx);
            }
            cur = tb.hash_next;
        }
        None
    }

    /// Links a newly emitted TB into the virtual and physical hash
    /// tables. Must be called once, after the TB is fully emitted.
    pub fn publish(&mut self, idx: usize) {
        let (pc, flags, phys_pc) = {
            let tb = self.get(idx);
            (tb.pc, tb.flags, tb.phys_pc)
        };
        let vbucket = TranslationBlock::hash(pc, flags);
        self.get_mut(idx).hash_next = self.virt_hash[vbucket];
        self.virt_hash[vbucket] = Some(idx);

        let pbucket = TranslationBlock::phys_hash(phys_pc);
        self.get_mut(idx).phys_hash_next = self.phys_hash[pbucket];
        self.phys_hash[pbucket] = Some(idx);
    }

    /// Records a chained `goto_tb` edge from `(src, slot)` to `dst`, so
    /// freeing `dst` later can find and reset it.
    pub fn link_jump(&mut self, src: usize, slot: usize, dst: usize) {
        self.get_mut(src).jmp_target[slot] = Some(dst);
        self.get_mut(dst).jmp_list.push((src, slot));
    }

    /// Records the single-entry indirect-exit cache edge.
    pub fn link_exit(&mut self, src: usize, dst: usize) {
        self.get_mut(src).exit_target = Some(dst);
    }

    /// Self-modifying-code invalidation: frees every TB hanging off the
    /// physical-page bucket that `phys_pc` hashes into. Bucket-wide
    /// (not filtered to an exact `phys_pc` match) per spec 4.6 — hash
    /// collisions cause extra, harmless retranslation, never a missed
    /// invalidation.
    pub fn invalidate_phys_page<F: FnMut(u32, u32)>(&mut self, phys_pc: u64, mut reset_jump: F) {
        tracing::debug!(phys_pc, "invalidating TBs for self-modified page");
        let bucket = TranslationBlock::phys_hash(phys_pc);
        let mut cur = self.phys_hash[bucket];
        self.phys_hash[bucket] = None;
        while let Some(idx) = cur {
            cur = self.get(idx).phys_hash_next;
            self.free_one(idx, &mut reset_jump);
        }
    }

    /// Frees every TB whose `acc_count` is at or below
    /// `PARTIAL_FLUSH_THRESHOLD`.
    pub fn partial_flush<F: FnMut(u32, u32)>(&mut self, mut reset_jump: F) {
        let victims: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().filter(|tb| tb.acc_count <= PARTIAL_FLUSH_THRESHOLD).map(|_| i))
            .collect();
        for idx in victims {
            if self.slots[idx].is_some() {
                self.free_one(idx, &mut reset_jump);
            }
        }
    }

    /// Frees every live TB and clears both hash tables. The caller is
    /// responsible for resetting the code buffer afterward, since only
    /// a full flush reclaims emitted-code bytes.
    pub fn full_flush(&mut self) {
        self.slots.clear();
        self.free_list.clear();
        self.virt_hash.fill(None);
        self.phys_hash.fill(None);
    }

    /// Chooses and runs the next flush strategy, alternating partial
    /// and full each call, as spec 4.6 requires. Returns `true` if the
    /// code buffer should also be reset (a full flush ran).
    pub fn flush_alternating<F: FnMut(u32, u32)>(&mut self, reset_jump: F) -> bool {
        let ran_full = self.next_flush_full;
        if ran_full {
            tracing::info!(slots = self.slots.len(), "full TB flush");
            self.full_flush();
        } else {
            tracing::debug!("partial TB flush");
            self.partial_flush(reset_jump);
        }
        self.next_flush_full = !self.next_flush_full;
        ran_full
    }

    /// Unlinks `idx` from both hash chains and the jmp graph, then
    /// returns its slot to the free list. `reset_jump(insn_offset,
    /// reset_offset)` is called for every incoming edge so the caller
    /// can patch the emitted `goto_tb` back to its non-chained reset
    /// point, without needing access to `self` (which is mid-mutation).
    fn free_one<F: FnMut(u32, u32)>(&mut self, idx: usize, reset_jump: &mut F) {
        let pc = self.get(idx).pc;
        let flags = self.get(idx).flags;
        let phys_pc = self.get(idx).phys_pc;
        let jmp_list = std::mem::take(&mut self.get_mut(idx).jmp_list);
        let jmp_target = self.get(idx).jmp_target;

        // Unlink incoming edges: every (src, slot) pointing at idx.
        for (src, slot) in jmp_list {
            if self.slots[src].is_some() {
                let tb = self.get(src);
                let offs = (tb.jmp_insn_offset[slot], tb.jmp_reset_offset[slot]);
                if let (Some(insn), Some(reset)) = offs {
                    reset_jump(insn, reset);
                }
                self.get_mut(src).jmp_target[slot] = None;
            }
        }

        // Unlink outgoing edges: remove idx's (slot) entry from each
        // destination's incoming list.
        for (slot, dst) in jmp_target.into_iter().enumerate() {
            if let Some(dst) = dst {
                if self.slots[dst].is_some() {
                    self.get_mut(dst).jmp_list.retain(|&(s, sl)| !(s == idx && sl == slot));
                }
            }
        }

        self.unlink_virt(idx, pc, flags);
        self.unlink_phys(idx, phys_pc);

        self.slots[idx] = None;
        self.free_list.push(idx);
    }

    /// Splices `idx` out of its virtual-hash bucket.
    fn unlink_virt(&mut self, idx: usize, pc: u64, flags: u32) {
        let bucket = TranslationBlock::hash(pc, flags);
        let mut prev: Option<usize> = None;
        let mut cur = self.virt_hash[bucket];
        while let Some(cur_idx) = cur {
            let next = self.slots[cur_idx].as_ref().unwrap().hash_next;
            if cur_idx == idx {
                match prev {
                    Some(p) => self.slots[p].as_mut().unwrap().hash_next = next,
                    None => self.virt_hash[bucket] = next,
                }
                return;
            }
            prev = Some(cur_idx);
            cur = next;
        }
    }

    /// Splices `idx` out of its physical-page hash bucket.
    fn unlink_phys(&mut self, idx: usize, phys_pc: u64) {
        let bucket = TranslationBlock::phys_hash(phys_pc);
        let mut prev: Option<usize> = None;
        let mut cur = self.phys_hash[bucket];
        while let Some(cur_idx) = cur {
            let next = self.slots[cur_idx].as_ref().unwrap().phys_hash_next;
            if cur_idx == idx {
                match prev {
                    Some(p) => self.slots[p].as_mut().unwrap().phys_hash_next = next,
                    None => self.phys_hash[bucket] = next,
                }
                return;
            }
            prev = Some(cur_idx);
            cur = next;
        }
    }
}

impl Default for TbStore {
    fn default() -> Self {
        Self::new()
    }
}
