//! Arena-backed ordered multiset (red-black tree).
//!
//! The timer service needs a deadline-ordered multiset with stable node
//! handles, O(1) access to the earliest entry, in-place key update, and
//! control over where a node lands among equal keys. Nodes live in an
//! internal arena; slot 0 is the sentinel container node whose parent
//! points at the root and whose left/right cache the leftmost and
//! rightmost nodes, so `front`/`back` are O(1).
//!
//! Rebalancing follows the standard red-black insert and erase cases;
//! erasing a node with two children swaps it with its in-order
//! successor before fixing up. [`RbTree::update_key`] relinks a node
//! without moving it in the arena, so its [`NodeRef`] stays valid.

use std::fmt;

const NIL: u32 = u32::MAX;
const HEADER: u32 = 0;

/// Where a new node lands relative to nodes comparing equal to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPolicy {
    /// Before every equal node.
    Frontmost,
    /// After every equal node.
    Backmost,
    /// Next to the first equal node met on the way down; the cheapest
    /// placement when the position among equals does not matter.
    Nearest,
    /// Do not insert if an equal node exists; hand the rejected pair
    /// back together with the existing node.
    Unique,
    /// Unlink one existing equal node (handing its pair back), then
    /// insert.
    Override,
}

/// Stable handle to a linked node.
///
/// Valid until the node is removed; a stale handle trips an assertion
/// rather than addressing a recycled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    index: u32,
    gen: u32,
}

struct Slot<K, V> {
    parent: u32,
    left: u32,
    right: u32,
    red: bool,
    gen: u32,
    entry: Option<(K, V)>,
}

pub struct RbTree<K, V> {
    slots: Vec<Slot<K, V>>,
    free_head: u32,
    len: usize,
}

impl<K, V> RbTree<K, V> {
    pub fn new() -> RbTree<K, V> {
        RbTree {
            slots: vec![Slot {
                parent: NIL, // root
                left: NIL,   // leftmost
                right: NIL,  // rightmost
                red: false,
                gen: 0,
                entry: None,
            }],
            free_head: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Leftmost (smallest) node.
    pub fn front(&self) -> Option<NodeRef> {
        let idx = self.slots[HEADER as usize].left;
        (idx != NIL).then(|| self.node_ref(idx))
    }

    /// Rightmost (largest) node.
    pub fn back(&self) -> Option<NodeRef> {
        let idx = self.slots[HEADER as usize].right;
        (idx != NIL).then(|| self.node_ref(idx))
    }

    pub fn contains_node(&self, node: NodeRef) -> bool {
        match self.slots.get(node.index as usize) {
            Some(slot) => slot.gen == node.gen && slot.entry.is_some(),
            None => false,
        }
    }

    pub fn key(&self, node: NodeRef) -> &K {
        let idx = self.resolve(node);
        &self.slots[idx as usize].entry.as_ref().expect("linked").0
    }

    pub fn value(&self, node: NodeRef) -> &V {
        let idx = self.resolve(node);
        &self.slots[idx as usize].entry.as_ref().expect("linked").1
    }

    pub fn value_mut(&mut self, node: NodeRef) -> &mut V {
        let idx = self.resolve(node);
        &mut self.slots[idx as usize].entry.as_mut().expect("linked").1
    }

    pub fn get(&self, node: NodeRef) -> Option<(&K, &V)> {
        if !self.contains_node(node) {
            return None;
        }
        let entry = self.slots[node.index as usize].entry.as_ref().expect("linked");
        Some((&entry.0, &entry.1))
    }

    /// In-order successor; O(1) amortized over a full traversal.
    pub fn next(&self, node: NodeRef) -> Option<NodeRef> {
        let idx = self.resolve(node);
        let next = self.next_idx(idx);
        (next != NIL).then(|| self.node_ref(next))
    }

    /// In-order predecessor.
    pub fn prev(&self, node: NodeRef) -> Option<NodeRef> {
        let idx = self.resolve(node);
        let prev = self.prev_idx(idx);
        (prev != NIL).then(|| self.node_ref(prev))
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            tree: self,
            cur: self.slots[HEADER as usize].left,
        }
    }

    pub fn clear(&mut self) {
        for idx in 1..self.slots.len() {
            if self.slots[idx].entry.is_some() {
                self.free_slot(idx as u32);
            }
        }
        let header = &mut self.slots[HEADER as usize];
        header.parent = NIL;
        header.left = NIL;
        header.right = NIL;
        self.len = 0;
    }

    fn node_ref(&self, idx: u32) -> NodeRef {
        NodeRef {
            index: idx,
            gen: self.slots[idx as usize].gen,
        }
    }

    fn resolve(&self, node: NodeRef) -> u32 {
        let slot = &self.slots[node.index as usize];
        assert!(
            slot.gen == node.gen && slot.entry.is_some(),
            "stale tree node handle"
        );
        node.index
    }

    fn alloc(&mut self, key: K, value: V) -> u32 {
        self.len += 1;
        if self.free_head != NIL {
            let idx = self.free_head;
            let slot = &mut self.slots[idx as usize];
            self.free_head = slot.parent;
            slot.parent = NIL;
            slot.left = NIL;
            slot.right = NIL;
            slot.entry = Some((key, value));
            idx
        } else {
            assert!(self.slots.len() < NIL as usize, "tree arena exhausted");
            self.slots.push(Slot {
                parent: NIL,
                left: NIL,
                right: NIL,
                red: false,
                gen: 0,
                entry: Some((key, value)),
            });
            (self.slots.len() - 1) as u32
        }
    }

    // Return a detached slot to the free chain (parent doubles as the
    // chain link).
    fn free_slot(&mut self, idx: u32) -> (K, V) {
        let free_head = self.free_head;
        let slot = &mut self.slots[idx as usize];
        let entry = slot.entry.take().expect("double free of tree slot");
        slot.gen = slot.gen.wrapping_add(1);
        slot.parent = free_head;
        slot.left = NIL;
        slot.right = NIL;
        self.free_head = idx;
        self.len -= 1;
        entry
    }

    fn parent(&self, idx: u32) -> u32 {
        self.slots[idx as usize].parent
    }

    fn left(&self, idx: u32) -> u32 {
        self.slots[idx as usize].left
    }

    fn right(&self, idx: u32) -> u32 {
        self.slots[idx as usize].right
    }

    fn is_red(&self, idx: u32) -> bool {
        idx != NIL && self.slots[idx as usize].red
    }

    fn minimum(&self, mut idx: u32) -> u32 {
        while self.left(idx) != NIL {
            idx = self.left(idx);
        }
        idx
    }

    fn maximum(&self, mut idx: u32) -> u32 {
        while self.right(idx) != NIL {
            idx = self.right(idx);
        }
        idx
    }

    fn next_idx(&self, mut idx: u32) -> u32 {
        if self.right(idx) != NIL {
            return self.minimum(self.right(idx));
        }
        let mut up = self.parent(idx);
        while up != HEADER && idx == self.right(up) {
            idx = up;
            up = self.parent(up);
        }
        if up == HEADER {
            NIL
        } else {
            up
        }
    }

    fn prev_idx(&self, mut idx: u32) -> u32 {
        if self.left(idx) != NIL {
            return self.maximum(self.left(idx));
        }
        let mut up = self.parent(idx);
        while up != HEADER && idx == self.left(up) {
            idx = up;
            up = self.parent(up);
        }
        if up == HEADER {
            NIL
        } else {
            up
        }
    }

    fn rotate_left(&mut self, x: u32, root: &mut u32) {
        let y = self.right(x);
        let y_left = self.left(y);
        self.slots[x as usize].right = y_left;
        if y_left != NIL {
            self.slots[y_left as usize].parent = x;
        }
        let x_parent = self.parent(x);
        self.slots[y as usize].parent = x_parent;
        if x == *root {
            *root = y;
        } else if x == self.left(x_parent) {
            self.slots[x_parent as usize].left = y;
        } else {
            self.slots[x_parent as usize].right = y;
        }
        self.slots[y as usize].left = x;
        self.slots[x as usize].parent = y;
    }

    fn rotate_right(&mut self, x: u32, root: &mut u32) {
        let y = self.left(x);
        let y_right = self.right(y);
        self.slots[x as usize].left = y_right;
        if y_right != NIL {
            self.slots[y_right as usize].parent = x;
        }
        let x_parent = self.parent(x);
        self.slots[y as usize].parent = x_parent;
        if x == *root {
            *root = y;
        } else if x == self.right(x_parent) {
            self.slots[x_parent as usize].right = y;
        } else {
            self.slots[x_parent as usize].left = y;
        }
        self.slots[y as usize].right = x;
        self.slots[x as usize].parent = y;
    }

    // Attach the detached slot `idx` as the `is_left` child of
    // `parent` (HEADER means the tree is empty) and restore the
    // red-black shape.
    fn attach_and_rebalance(&mut self, idx: u32, parent: u32, is_left: bool) {
        let mut root = self.slots[HEADER as usize].parent;
        {
            let slot = &mut self.slots[idx as usize];
            slot.parent = parent;
            slot.left = NIL;
            slot.right = NIL;
            slot.red = true;
        }
        if parent == HEADER {
            root = idx;
            self.slots[HEADER as usize].left = idx;
            self.slots[HEADER as usize].right = idx;
        } else {
            if is_left {
                self.slots[parent as usize].left = idx;
                if parent == self.slots[HEADER as usize].left {
                    self.slots[HEADER as usize].left = idx;
                }
            } else {
                self.slots[parent as usize].right = idx;
                if parent == self.slots[HEADER as usize].right {
                    self.slots[HEADER as usize].right = idx;
                }
            }
        }

        // Insert fixup.
        let mut x = idx;
        while x != root && self.is_red(self.parent(x)) {
            let p = self.parent(x);
            let g = self.parent(p);
            if p == self.left(g) {
                let uncle = self.right(g);
                if self.is_red(uncle) {
                    self.slots[p as usize].red = false;
                    self.slots[uncle as usize].red = false;
                    self.slots[g as usize].red = true;
                    x = g;
                } else {
                    if x == self.right(p) {
                        x = p;
                        self.rotate_left(x, &mut root);
                    }
                    let p = self.parent(x);
                    let g = self.parent(p);
                    self.slots[p as usize].red = false;
                    self.slots[g as usize].red = true;
                    self.rotate_right(g, &mut root);
                }
            } else {
                let uncle = self.left(g);
                if self.is_red(uncle) {
                    self.slots[p as usize].red = false;
                    self.slots[uncle as usize].red = false;
                    self.slots[g as usize].red = true;
                    x = g;
                } else {
                    if x == self.left(p) {
                        x = p;
                        self.rotate_right(x, &mut root);
                    }
                    let p = self.parent(x);
                    let g = self.parent(p);
                    self.slots[p as usize].red = false;
                    self.slots[g as usize].red = true;
                    self.rotate_left(g, &mut root);
                }
            }
        }
        self.slots[root as usize].red = false;
        self.slots[root as usize].parent = HEADER;
        self.slots[HEADER as usize].parent = root;
    }

    // Unlink `z` from the tree structure without releasing its slot.
    fn detach_and_rebalance(&mut self, z: u32) {
        let mut root = self.slots[HEADER as usize].parent;
        let mut leftmost = self.slots[HEADER as usize].left;
        let mut rightmost = self.slots[HEADER as usize].right;

        let mut y = z;
        let x;
        let mut x_parent;

        if self.left(y) == NIL {
            x = self.right(y);
        } else if self.right(y) == NIL {
            x = self.left(y);
        } else {
            y = self.minimum(self.right(y));
            x = self.right(y);
        }

        if y != z {
            // z has two children; swap its in-order successor y into
            // its place, then delete at y's old position.
            let z_left = self.left(z);
            self.slots[z_left as usize].parent = y;
            self.slots[y as usize].left = z_left;
            if y != self.right(z) {
                x_parent = self.parent(y);
                if x != NIL {
                    self.slots[x as usize].parent = x_parent;
                }
                self.slots[x_parent as usize].left = x;
                let z_right = self.right(z);
                self.slots[y as usize].right = z_right;
                self.slots[z_right as usize].parent = y;
            } else {
                x_parent = y;
            }
            let z_parent = self.parent(z);
            if root == z {
                root = y;
            } else if self.left(z_parent) == z {
                self.slots[z_parent as usize].left = y;
            } else {
                self.slots[z_parent as usize].right = y;
            }
            self.slots[y as usize].parent = z_parent;
            let y_red = self.slots[y as usize].red;
            self.slots[y as usize].red = self.slots[z as usize].red;
            self.slots[z as usize].red = y_red;
        } else {
            // At most one child.
            x_parent = self.parent(y);
            if x != NIL {
                self.slots[x as usize].parent = x_parent;
            }
            let z_parent = self.parent(z);
            if root == z {
                root = x;
            } else if self.left(z_parent) == z {
                self.slots[z_parent as usize].left = x;
            } else {
                self.slots[z_parent as usize].right = x;
            }
            if leftmost == z {
                leftmost = if self.right(z) == NIL {
                    if z_parent == HEADER {
                        NIL
                    } else {
                        z_parent
                    }
                } else {
                    self.minimum(x)
                };
            }
            if rightmost == z {
                rightmost = if self.left(z) == NIL {
                    if z_parent == HEADER {
                        NIL
                    } else {
                        z_parent
                    }
                } else {
                    self.maximum(x)
                };
            }
        }

        // The node structurally removed now carries z's original color
        // in the two-children case; fix up if a black node left the
        // tree.
        if !self.slots[z as usize].red {
            let mut x = x;
            while x != root && !self.is_red(x) {
                if x == self.left(x_parent) {
                    let mut w = self.right(x_parent);
                    if self.is_red(w) {
                        self.slots[w as usize].red = false;
                        self.slots[x_parent as usize].red = true;
                        self.rotate_left(x_parent, &mut root);
                        w = self.right(x_parent);
                    }
                    if !self.is_red(self.left(w)) && !self.is_red(self.right(w)) {
                        self.slots[w as usize].red = true;
                        x = x_parent;
                        x_parent = self.parent(x_parent);
                    } else {
                        if !self.is_red(self.right(w)) {
                            let w_left = self.left(w);
                            if w_left != NIL {
                                self.slots[w_left as usize].red = false;
                            }
                            self.slots[w as usize].red = true;
                            self.rotate_right(w, &mut root);
                            w = self.right(x_parent);
                        }
                        self.slots[w as usize].red = self.slots[x_parent as usize].red;
                        self.slots[x_parent as usize].red = false;
                        let w_right = self.right(w);
                        if w_right != NIL {
                            self.slots[w_right as usize].red = false;
                        }
                        self.rotate_left(x_parent, &mut root);
                        break;
                    }
                } else {
                    let mut w = self.left(x_parent);
                    if self.is_red(w) {
                        self.slots[w as usize].red = false;
                        self.slots[x_parent as usize].red = true;
                        self.rotate_right(x_parent, &mut root);
                        w = self.left(x_parent);
                    }
                    if !self.is_red(self.left(w)) && !self.is_red(self.right(w)) {
                        self.slots[w as usize].red = true;
                        x = x_parent;
                        x_parent = self.parent(x_parent);
                    } else {
                        if !self.is_red(self.left(w)) {
                            let w_right = self.right(w);
                            if w_right != NIL {
                                self.slots[w_right as usize].red = false;
                            }
                            self.slots[w as usize].red = true;
                            self.rotate_left(w, &mut root);
                            w = self.left(x_parent);
                        }
                        self.slots[w as usize].red = self.slots[x_parent as usize].red;
                        self.slots[x_parent as usize].red = false;
                        let w_left = self.left(w);
                        if w_left != NIL {
                            self.slots[w_left as usize].red = false;
                        }
                        self.rotate_right(x_parent, &mut root);
                        break;
                    }
                }
            }
            if x != NIL {
                self.slots[x as usize].red = false;
            }
        }

        if root != NIL {
            self.slots[root as usize].parent = HEADER;
        } else {
            leftmost = NIL;
            rightmost = NIL;
        }
        let header = &mut self.slots[HEADER as usize];
        header.parent = root;
        header.left = leftmost;
        header.right = rightmost;

        let slot = &mut self.slots[z as usize];
        slot.parent = NIL;
        slot.left = NIL;
        slot.right = NIL;
    }
}

impl<K: Ord, V> RbTree<K, V> {
    /// Insert `(key, value)` according to `policy`.
    ///
    /// The second return value is the pair handed back by the policy:
    /// the rejected input for [`InsertPolicy::Unique`] (in which case
    /// the returned node is the existing equal node) or the evicted
    /// pair for [`InsertPolicy::Override`]; `None` otherwise.
    pub fn insert(&mut self, key: K, value: V, policy: InsertPolicy) -> (NodeRef, Option<(K, V)>) {
        match policy {
            InsertPolicy::Unique => {
                if let Some(existing) = self.find(&key) {
                    return (existing, Some((key, value)));
                }
                let idx = self.alloc(key, value);
                self.descend_and_attach(idx, InsertPolicy::Nearest);
                (self.node_ref(idx), None)
            }
            InsertPolicy::Override => {
                let evicted = self.find(&key).map(|node| self.remove(node));
                let idx = self.alloc(key, value);
                self.descend_and_attach(idx, InsertPolicy::Nearest);
                (self.node_ref(idx), evicted)
            }
            _ => {
                let idx = self.alloc(key, value);
                self.descend_and_attach(idx, policy);
                (self.node_ref(idx), None)
            }
        }
    }

    /// Insert next to `hint` when the hint is adjacent to the right
    /// position, falling back to a plain descent otherwise. Sequential
    /// hints make insertion amortized O(1).
    pub fn insert_at(
        &mut self,
        hint: Option<NodeRef>,
        key: K,
        value: V,
        policy: InsertPolicy,
    ) -> (NodeRef, Option<(K, V)>) {
        let positional = matches!(
            policy,
            InsertPolicy::Frontmost | InsertPolicy::Backmost | InsertPolicy::Nearest
        );
        if let (true, Some(h)) = (positional, hint) {
            if self.contains_node(h) {
                let h_idx = h.index;
                // Hint as successor: the position right before it.
                let fits_here = match policy {
                    // lower_bound position: prev < key <= hint
                    InsertPolicy::Frontmost => &key <= self.key(h),
                    // upper_bound position: prev <= key < hint
                    _ => &key < self.key(h),
                };
                let fits_prev = match self.prev_idx(h_idx) {
                    NIL => true,
                    p => {
                        let pk = &self.slots[p as usize].entry.as_ref().expect("linked").0;
                        match policy {
                            InsertPolicy::Frontmost => pk < &key,
                            _ => pk <= &key,
                        }
                    }
                };
                if fits_here && fits_prev {
                    let idx = self.alloc(key, value);
                    self.attach_before_node(idx, h_idx);
                    return (self.node_ref(idx), None);
                }
                // Hint as predecessor: the position right after it.
                let fits_after = match policy {
                    InsertPolicy::Frontmost => self.key(h) < &key,
                    _ => self.key(h) <= &key,
                };
                let next = self.next_idx(h_idx);
                let fits_next = match next {
                    NIL => true,
                    n => {
                        let nk = &self.slots[n as usize].entry.as_ref().expect("linked").0;
                        match policy {
                            InsertPolicy::Frontmost => &key <= nk,
                            _ => &key < nk,
                        }
                    }
                };
                if fits_after && fits_next {
                    let idx = self.alloc(key, value);
                    if self.right(h_idx) == NIL {
                        self.attach_and_rebalance(idx, h_idx, false);
                    } else {
                        self.attach_before_node(idx, next);
                    }
                    return (self.node_ref(idx), None);
                }
            }
        }
        self.insert(key, value, policy)
    }

    /// Unlink `node` and return its pair.
    pub fn remove(&mut self, node: NodeRef) -> (K, V) {
        let idx = self.resolve(node);
        self.detach_and_rebalance(idx);
        self.free_slot(idx)
    }

    /// Change `node`'s key in place: the node is unlinked, rekeyed and
    /// relinked under `policy` (a positional one). The handle stays
    /// valid.
    pub fn update_key(&mut self, node: NodeRef, key: K, policy: InsertPolicy) {
        debug_assert!(
            matches!(
                policy,
                InsertPolicy::Frontmost | InsertPolicy::Backmost | InsertPolicy::Nearest
            ),
            "update_key requires a positional policy"
        );
        let idx = self.resolve(node);
        self.detach_and_rebalance(idx);
        self.slots[idx as usize].entry.as_mut().expect("linked").0 = key;
        self.descend_and_attach(idx, policy);
    }

    /// Some equal node, if any.
    pub fn find(&self, key: &K) -> Option<NodeRef> {
        let mut cur = self.slots[HEADER as usize].parent;
        while cur != NIL {
            let ck = &self.slots[cur as usize].entry.as_ref().expect("linked").0;
            if key < ck {
                cur = self.left(cur);
            } else if ck < key {
                cur = self.right(cur);
            } else {
                return Some(self.node_ref(cur));
            }
        }
        None
    }

    /// Leftmost node whose key is not less than `key`.
    pub fn lower_bound(&self, key: &K) -> Option<NodeRef> {
        let mut cur = self.slots[HEADER as usize].parent;
        let mut result = NIL;
        while cur != NIL {
            let ck = &self.slots[cur as usize].entry.as_ref().expect("linked").0;
            if ck < key {
                cur = self.right(cur);
            } else {
                result = cur;
                cur = self.left(cur);
            }
        }
        (result != NIL).then(|| self.node_ref(result))
    }

    /// Leftmost node whose key is greater than `key`.
    pub fn upper_bound(&self, key: &K) -> Option<NodeRef> {
        let mut cur = self.slots[HEADER as usize].parent;
        let mut result = NIL;
        while cur != NIL {
            let ck = &self.slots[cur as usize].entry.as_ref().expect("linked").0;
            if key < ck {
                result = cur;
                cur = self.left(cur);
            } else {
                cur = self.right(cur);
            }
        }
        (result != NIL).then(|| self.node_ref(result))
    }

    // Descend from the root for the detached slot `idx` and attach it.
    fn descend_and_attach(&mut self, idx: u32, policy: InsertPolicy) {
        let mut parent = HEADER;
        let mut cur = self.slots[HEADER as usize].parent;
        let mut is_left = true;
        while cur != NIL {
            parent = cur;
            let ord = {
                let key = &self.slots[idx as usize].entry.as_ref().expect("linked").0;
                let ck = &self.slots[cur as usize].entry.as_ref().expect("linked").0;
                key.cmp(ck)
            };
            match ord {
                std::cmp::Ordering::Less => {
                    is_left = true;
                    cur = self.left(cur);
                }
                std::cmp::Ordering::Greater => {
                    is_left = false;
                    cur = self.right(cur);
                }
                std::cmp::Ordering::Equal => match policy {
                    InsertPolicy::Frontmost => {
                        is_left = true;
                        cur = self.left(cur);
                    }
                    InsertPolicy::Nearest => {
                        self.attach_before_node(idx, cur);
                        return;
                    }
                    _ => {
                        is_left = false;
                        cur = self.right(cur);
                    }
                },
            }
        }
        self.attach_and_rebalance(idx, parent, is_left);
    }

    // Attach the detached slot `idx` immediately before `at`.
    fn attach_before_node(&mut self, idx: u32, at: u32) {
        if self.left(at) == NIL {
            self.attach_and_rebalance(idx, at, true);
        } else {
            let pred = self.maximum(self.left(at));
            self.attach_and_rebalance(idx, pred, false);
        }
    }
}

impl<K, V> Default for RbTree<K, V> {
    fn default() -> Self {
        RbTree::new()
    }
}

impl<K, V> fmt::Debug for RbTree<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RbTree").field("len", &self.len).finish()
    }
}

pub struct Iter<'a, K, V> {
    tree: &'a RbTree<K, V>,
    cur: u32,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == NIL {
            return None;
        }
        let entry = self.tree.slots[self.cur as usize]
            .entry
            .as_ref()
            .expect("linked");
        self.cur = self.tree.next_idx(self.cur);
        Some((&entry.0, &entry.1))
    }
}
