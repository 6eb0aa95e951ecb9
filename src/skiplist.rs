//! Rank-indexed skip list backing large sorted sets.
//!
//! Nodes live in an arena indexed by `usize` with a free list, so erase
//! and insert never touch raw pointers; level-0 links are the in-order
//! traversal. Ordering is `(score, member)` with a lexicographic
//! tie-break on the member.

use bytes::Bytes;
use rand::Rng;
use std::cmp::Ordering;

const MAX_LEVEL: usize = 32;
/// Promotion probability 0.25, expressed over a 16-bit roll.
const P_NUMERATOR: u32 = 0x4000;

const NIL: usize = usize::MAX;

/// Total order used by both sorted-set representations.
pub fn zset_order(a_score: f64, a_member: &[u8], b_score: f64, b_member: &[u8]) -> Ordering {
    a_score
        .total_cmp(&b_score)
        .then_with(|| a_member.cmp(b_member))
}

#[derive(Debug)]
struct Node {
    score: f64,
    member: Bytes,
    forward: Vec<usize>,
}

#[derive(Debug)]
pub struct SkipList {
    /// `nodes[0]` is the head sentinel.
    nodes: Vec<Node>,
    free: Vec<usize>,
    level: usize,
    len: usize,
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipList {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                score: 0.0,
                member: Bytes::new(),
                forward: vec![NIL; MAX_LEVEL],
            }],
            free: Vec::new(),
            level: 1,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn random_level<R: Rng>(rng: &mut R) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && (rng.random::<u32>() & 0xFFFF) < P_NUMERATOR {
            level += 1;
        }
        level
    }

    /// Collect, per level, the last node strictly preceding `(score, member)`.
    fn find_update(&self, score: f64, member: &[u8]) -> [usize; MAX_LEVEL] {
        let mut update = [0usize; MAX_LEVEL];
        let mut x = 0usize;
        for i in (0..self.level).rev() {
            loop {
                let next = self.nodes[x].forward[i];
                if next == NIL {
                    break;
                }
                let node = &self.nodes[next];
                if zset_order(node.score, &node.member, score, member) == Ordering::Less {
                    x = next;
                } else {
                    break;
                }
            }
            update[i] = x;
        }
        update
    }

    /// Insert `(score, member)`; returns false if that exact pair exists.
    pub fn insert<R: Rng>(&mut self, score: f64, member: Bytes, rng: &mut R) -> bool {
        let update = self.find_update(score, &member);
        let next = self.nodes[update[0]].forward[0];
        if next != NIL {
            let node = &self.nodes[next];
            if node.score == score && node.member == member {
                return false;
            }
        }
        let level = Self::random_level(rng);
        let mut update = update;
        if level > self.level {
            for slot in update.iter_mut().take(level).skip(self.level) {
                *slot = 0;
            }
            self.level = level;
        }
        let idx = self.alloc(score, member, level);
        for i in 0..level {
            self.nodes[idx].forward[i] = self.nodes[update[i]].forward[i];
            self.nodes[update[i]].forward[i] = idx;
        }
        self.len += 1;
        true
    }

    /// Remove `(score, member)`; returns whether it was present.
    pub fn erase(&mut self, score: f64, member: &[u8]) -> bool {
        let update = self.find_update(score, member);
        let target = self.nodes[update[0]].forward[0];
        if target == NIL {
            return false;
        }
        {
            let node = &self.nodes[target];
            if node.score != score || node.member != member {
                return false;
            }
        }
        for i in 0..self.level {
            if self.nodes[update[i]].forward[i] == target {
                self.nodes[update[i]].forward[i] = self.nodes[target].forward[i];
            }
        }
        while self.level > 1 && self.nodes[0].forward[self.level - 1] == NIL {
            self.level -= 1;
        }
        self.free.push(target);
        self.len -= 1;
        true
    }

    /// Append members with 0-based rank in `[start, stop]` (negative
    /// indices count from the end, out-of-range values are clamped).
    pub fn range_by_rank(&self, start: i64, stop: i64, out: &mut Vec<Bytes>) {
        if self.len == 0 {
            return;
        }
        let n = self.len as i64;
        let norm = |mut idx: i64| {
            if idx < 0 {
                idx += n;
            }
            idx.clamp(0, n - 1)
        };
        let (s, e) = (norm(start), norm(stop));
        if s > e {
            return;
        }
        let mut x = self.nodes[0].forward[0];
        let mut rank = 0i64;
        while x != NIL && rank < s {
            x = self.nodes[x].forward[0];
            rank += 1;
        }
        while x != NIL && rank <= e {
            out.push(self.nodes[x].member.clone());
            x = self.nodes[x].forward[0];
            rank += 1;
        }
    }

    /// In-order `(score, member)` sequence via a level-0 traversal.
    pub fn to_vec(&self) -> Vec<(f64, Bytes)> {
        let mut out = Vec::with_capacity(self.len);
        let mut x = self.nodes[0].forward[0];
        while x != NIL {
            let node = &self.nodes[x];
            out.push((node.score, node.member.clone()));
            x = node.forward[0];
        }
        out
    }

    fn alloc(&mut self, score: f64, member: Bytes, level: usize) -> usize {
        let node = Node {
            score,
            member,
            forward: vec![NIL; level],
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }
}
