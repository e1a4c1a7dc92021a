//! Keyed list blocks.
//!
//! Children are identified by key, never by position. The patch algorithm is
//! the classic two-ended diff: four pointers walk the old and new child
//! arrays from both ends, handling in-place matches, swaps and single moves
//! without any allocation; only when all four comparisons miss does it build
//! a key-to-old-index map to find arbitrary moves. Remaining new children are
//! bulk mounted before a shared anchor; remaining old children are removed.
//!
//! The list keeps an invisible anchor text node after its content so that
//! appends have a stable insertion point even when the list is empty.

use rustc_hash::FxHashMap;

use super::Block;
use crate::dom::DomNode;

/// A child block tagged with its reconciliation key.
pub struct Keyed {
    pub key: String,
    pub block: Block,
}

impl Keyed {
    pub fn new(key: impl Into<String>, block: Block) -> Keyed {
        Keyed {
            key: key.into(),
            block,
        }
    }
}

pub struct VList {
    children: Vec<Keyed>,
    anchor: Option<DomNode>,
    parent_el: Option<DomNode>,
    is_only_child: bool,
}

impl VList {
    pub fn new(children: Vec<Keyed>, is_only_child: bool) -> VList {
        VList {
            children,
            anchor: None,
            parent_el: None,
            is_only_child,
        }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn mount(&mut self, parent: &DomNode, anchor: Option<&DomNode>) {
        let list_anchor = DomNode::text("");
        parent.insert_before(&list_anchor, anchor);
        for child in &mut self.children {
            child.block.mount(parent, Some(&list_anchor));
        }
        self.anchor = Some(list_anchor);
        self.parent_el = Some(parent.clone());
    }

    pub fn patch(&mut self, other: VList, with_before_remove: bool) {
        let (Some(parent), Some(anchor)) = (self.parent_el.clone(), self.anchor.clone()) else {
            return;
        };
        if self.children.is_empty() && other.children.is_empty() {
            return;
        }

        // full-clear fast path: when the list is the only content of its
        // parent, one truncation beats removing children one by one
        if other.children.is_empty() && self.is_only_child {
            if with_before_remove {
                for child in &mut self.children {
                    child.block.before_remove();
                }
            }
            parent.set_text_content("");
            parent.append_child(&anchor);
            self.children = Vec::new();
            return;
        }

        let mut old: Vec<Option<Keyed>> =
            std::mem::take(&mut self.children).into_iter().map(Some).collect();
        let mut new_in: Vec<Option<Keyed>> = other.children.into_iter().map(Some).collect();
        let mut out: Vec<Option<Keyed>> = (0..new_in.len()).map(|_| None).collect();

        let mut old_start = 0i64;
        let mut old_end = old.len() as i64 - 1;
        let mut new_start = 0i64;
        let mut new_end = new_in.len() as i64 - 1;
        let mut mapping: Option<FxHashMap<String, usize>> = None;

        let key_of = |slot: &Option<Keyed>| slot.as_ref().map(|k| k.key.clone());

        while old_start <= old_end && new_start <= new_end {
            // moved-out entries leave holes behind
            if old[old_start as usize].is_none() {
                old_start += 1;
                continue;
            }
            if old[old_end as usize].is_none() {
                old_end -= 1;
                continue;
            }
            let old_start_key = key_of(&old[old_start as usize]).expect("checked non-empty");
            let old_end_key = key_of(&old[old_end as usize]).expect("checked non-empty");
            let new_start_key = key_of(&new_in[new_start as usize]).expect("input slot present");
            let new_end_key = key_of(&new_in[new_end as usize]).expect("input slot present");

            if old_start_key == new_start_key {
                let mut kept = old[old_start as usize].take().expect("present");
                let next = new_in[new_start as usize].take().expect("present");
                kept.block.patch(next.block, with_before_remove);
                out[new_start as usize] = Some(kept);
                old_start += 1;
                new_start += 1;
            } else if old_end_key == new_end_key {
                let mut kept = old[old_end as usize].take().expect("present");
                let next = new_in[new_end as usize].take().expect("present");
                kept.block.patch(next.block, with_before_remove);
                out[new_end as usize] = Some(kept);
                old_end -= 1;
                new_end -= 1;
            } else if old_start_key == new_end_key {
                // moved right: patch, then relocate before whatever ended up
                // just after the new end position
                let mut kept = old[old_start as usize].take().expect("present");
                let next = new_in[new_end as usize].take().expect("present");
                kept.block.patch(next.block, with_before_remove);
                let follow = out.get((new_end + 1) as usize).and_then(Option::as_ref);
                kept.block
                    .move_before_vnode(follow.map(|k| &k.block), Some(&anchor));
                out[new_end as usize] = Some(kept);
                old_start += 1;
                new_end -= 1;
            } else if old_end_key == new_start_key {
                // moved left: relocate before the current old start
                let mut kept = old[old_end as usize].take().expect("present");
                let next = new_in[new_start as usize].take().expect("present");
                kept.block.patch(next.block, with_before_remove);
                let follow = old[old_start as usize].as_ref();
                kept.block
                    .move_before_vnode(follow.map(|k| &k.block), Some(&anchor));
                out[new_start as usize] = Some(kept);
                old_end -= 1;
                new_start += 1;
            } else {
                // all four misses: fall back to the key map
                let map = mapping.get_or_insert_with(|| {
                    let mut m = FxHashMap::default();
                    for i in old_start as usize..=old_end as usize {
                        if let Some(k) = &old[i] {
                            m.insert(k.key.clone(), i);
                        }
                    }
                    m
                });
                let mut next = new_in[new_start as usize].take().expect("present");
                let moved = map
                    .get(&next.key)
                    .copied()
                    .and_then(|idx_in_old| old[idx_in_old].take());
                match moved {
                    Some(mut kept) => {
                        let before = old[old_start as usize].as_ref();
                        kept.block
                            .move_before_vnode(before.map(|k| &k.block), Some(&anchor));
                        kept.block.patch(next.block, with_before_remove);
                        out[new_start as usize] = Some(kept);
                    }
                    None => {
                        // brand new key: mount before the current old start
                        let mount_anchor = old[old_start as usize]
                            .as_ref()
                            .and_then(|k| k.block.first_node())
                            .unwrap_or_else(|| anchor.clone());
                        next.block.mount(&parent, Some(&mount_anchor));
                        out[new_start as usize] = Some(next);
                    }
                }
                new_start += 1;
            }
        }

        if old_start > old_end {
            // leftover new children: bulk mount before a shared anchor
            let tail_anchor = out
                .get((new_end + 1) as usize)
                .and_then(Option::as_ref)
                .and_then(|k| k.block.first_node())
                .unwrap_or_else(|| anchor.clone());
            for i in new_start as usize..=new_end as usize {
                let mut next = new_in[i].take().expect("unconsumed input");
                next.block.mount(&parent, Some(&tail_anchor));
                out[i] = Some(next);
            }
        } else if new_start > new_end {
            for slot in old
                .iter_mut()
                .take(old_end as usize + 1)
                .skip(old_start as usize)
            {
                if let Some(mut gone) = slot.take() {
                    if with_before_remove {
                        gone.block.before_remove();
                    }
                    gone.block.remove();
                }
            }
        }

        self.children = out
            .into_iter()
            .map(|slot| slot.expect("every output position is filled"))
            .collect();
    }

    pub fn remove(&mut self) {
        if self.is_only_child {
            if let Some(parent) = &self.parent_el {
                parent.set_text_content("");
            }
            return;
        }
        for child in &mut self.children {
            child.block.remove();
        }
        if let Some(anchor) = &self.anchor {
            anchor.remove();
        }
    }

    pub fn before_remove(&mut self) {
        for child in &mut self.children {
            child.block.before_remove();
        }
    }

    pub fn first_node(&self) -> Option<DomNode> {
        match self.children.first() {
            Some(first) => first.block.first_node(),
            None => self.anchor.clone(),
        }
    }

    pub fn move_before_dom_node(&mut self, parent: &DomNode, anchor: Option<&DomNode>) {
        for child in &mut self.children {
            child.block.move_before_dom_node(parent, anchor);
        }
        if let Some(list_anchor) = &self.anchor {
            parent.insert_before(list_anchor, anchor);
        }
        self.parent_el = Some(parent.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::text::VText;
    use crate::dom::write_count;

    fn item(key: &str) -> Keyed {
        Keyed::new(key, Block::Text(VText::new(key)))
    }

    fn list_of(keys: &[&str]) -> VList {
        VList::new(keys.iter().map(|k| item(k)).collect(), false)
    }

    fn mounted(keys: &[&str]) -> (DomNode, VList) {
        let parent = DomNode::element("ul");
        let mut list = list_of(keys);
        list.mount(&parent, None);
        (parent, list)
    }

    #[test]
    fn test_mount_order() {
        let (parent, _list) = mounted(&["a", "b", "c"]);
        assert_eq!(parent.text_content(), "abc");
    }

    #[test]
    fn test_identity_patch_writes_nothing() {
        let (_parent, mut list) = mounted(&["a", "b", "c"]);
        let before = write_count();
        list.patch(list_of(&["a", "b", "c"]), false);
        assert_eq!(write_count(), before);
    }

    #[test]
    fn test_reverse() {
        let (parent, mut list) = mounted(&["a", "b", "c", "d"]);
        list.patch(list_of(&["d", "c", "b", "a"]), false);
        assert_eq!(parent.text_content(), "dcba");
    }

    #[test]
    fn test_insert_middle_and_tail() {
        let (parent, mut list) = mounted(&["a", "c"]);
        list.patch(list_of(&["a", "b", "c"]), false);
        assert_eq!(parent.text_content(), "abc");
        list.patch(list_of(&["a", "b", "c", "d", "e"]), false);
        assert_eq!(parent.text_content(), "abcde");
    }

    #[test]
    fn test_remove_middle() {
        let (parent, mut list) = mounted(&["a", "b", "c"]);
        list.patch(list_of(&["a", "c"]), false);
        assert_eq!(parent.text_content(), "ac");
    }

    #[test]
    fn test_arbitrary_permutation() {
        let (parent, mut list) = mounted(&["a", "b", "c", "d", "e"]);
        list.patch(list_of(&["c", "e", "a", "d", "b"]), false);
        assert_eq!(parent.text_content(), "ceadb");
        list.patch(list_of(&["b", "d", "a", "e", "c"]), false);
        assert_eq!(parent.text_content(), "bdaec");
    }

    #[test]
    fn test_replace_all_keys() {
        let (parent, mut list) = mounted(&["a", "b"]);
        list.patch(list_of(&["x", "y", "z"]), false);
        assert_eq!(parent.text_content(), "xyz");
    }

    #[test]
    fn test_single_move_costs_one_structural_write() {
        let (parent, mut list) = mounted(&["a", "b", "c", "d"]);
        let before = write_count();
        // moving d to the front is one insert, the rest matches from the end
        list.patch(list_of(&["d", "a", "b", "c"]), false);
        assert_eq!(parent.text_content(), "dabc");
        assert_eq!(write_count(), before + 1);
    }

    #[test]
    fn test_only_child_clear_truncates() {
        let parent = DomNode::element("ul");
        let mut list = VList::new(
            ["a", "b", "c"].iter().map(|k| item(k)).collect(),
            true,
        );
        list.mount(&parent, None);

        let before = write_count();
        list.patch(VList::new(Vec::new(), true), false);
        assert_eq!(parent.text_content(), "");
        // one truncation plus one anchor re-insertion
        assert_eq!(write_count(), before + 2);

        // the anchor survives, so the list can grow again
        list.patch(VList::new(vec![item("x")], true), false);
        assert_eq!(parent.text_content(), "x");
    }

    #[test]
    fn test_empty_to_empty_is_noop() {
        let (_parent, mut list) = mounted(&[]);
        let before = write_count();
        list.patch(list_of(&[]), false);
        assert_eq!(write_count(), before);
    }
}
