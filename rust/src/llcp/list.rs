// Copyright 2023 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Singly linked lists backed by a fixed capacity slab: the ordered
//! CIS list of a CIG and the per-CIS flush timeout lists.

#[derive(Clone, Debug)]
struct Node<T> {
    value: T,
    next: Option<usize>,
}

/// Singly linked list whose nodes live in a fixed capacity slab.
/// Removed nodes return to the free list.
#[derive(Clone, Debug)]
pub struct SlabList<T> {
    nodes: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    count: usize,
}

impl<T> SlabList<T> {
    pub fn with_capacity(capacity: usize) -> SlabList<T> {
        SlabList {
            nodes: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            head: None,
            tail: None,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn node(&self, slot: usize) -> Option<&Node<T>> {
        self.nodes.get(slot).and_then(Option::as_ref)
    }

    fn alloc(&mut self, value: T, next: Option<usize>) -> Result<usize, T> {
        let Some(slot) = self.free.pop() else {
            return Err(value);
        };
        self.nodes[slot] = Some(Node { value, next });
        self.count += 1;
        Ok(slot)
    }

    fn release(&mut self, slot: usize) -> Option<T> {
        let node = self.nodes.get_mut(slot)?.take()?;
        self.free.push(slot);
        self.count -= 1;
        Some(node.value)
    }

    /// Returns the value back when the slab is full.
    pub fn insert_head(&mut self, value: T) -> Result<(), T> {
        let slot = self.alloc(value, self.head)?;
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
        Ok(())
    }

    /// Returns the value back when the slab is full.
    pub fn insert_tail(&mut self, value: T) -> Result<(), T> {
        let slot = self.alloc(value, None)?;
        match self.tail.and_then(|tail| self.nodes[tail].as_mut()) {
            Some(tail) => tail.next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        Ok(())
    }

    pub fn remove_head(&mut self) -> Option<T> {
        let head = self.head?;
        self.head = self.node(head).and_then(|node| node.next);
        if self.head.is_none() {
            self.tail = None;
        }
        self.release(head)
    }

    pub fn remove_tail(&mut self) -> Option<T> {
        let tail = self.tail?;
        let prev = self.slots().take_while(|slot| *slot != tail).last();
        match prev {
            Some(prev) => {
                if let Some(node) = self.nodes[prev].as_mut() {
                    node.next = None;
                }
            }
            None => self.head = None,
        }
        self.tail = prev;
        self.release(tail)
    }

    /// Unlink the first node matching `predicate`, single pass from
    /// the head. Returns `None` when nothing matches.
    pub fn remove_where<F: Fn(&T) -> bool>(&mut self, predicate: F) -> Option<T> {
        let mut prev: Option<usize> = None;
        let mut current = self.head;
        while let Some(slot) = current {
            let node = self.node(slot)?;
            if predicate(&node.value) {
                let next = node.next;
                match prev.and_then(|prev| self.nodes[prev].as_mut()) {
                    Some(prev) => prev.next = next,
                    None => self.head = next,
                }
                if self.tail == Some(slot) {
                    self.tail = prev;
                }
                return self.release(slot);
            }
            prev = Some(slot);
            current = node.next;
        }
        None
    }

    pub fn head(&self) -> Option<&T> {
        self.head.and_then(|slot| self.node(slot)).map(|node| &node.value)
    }

    pub fn tail(&self) -> Option<&T> {
        self.tail.and_then(|slot| self.node(slot)).map(|node| &node.value)
    }

    fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.head, move |slot| self.node(*slot).and_then(|node| node.next))
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.slots().filter_map(move |slot| self.node(slot)).map(|node| &node.value)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        // Slab order differs from list order; collect the link order first.
        let order: Vec<usize> = self.slots().collect();
        let mut nodes: Vec<Option<&mut T>> =
            self.nodes.iter_mut().map(|node| node.as_mut().map(|node| &mut node.value)).collect();
        order.into_iter().filter_map(move |slot| nodes[slot].take())
    }

    pub fn clear(&mut self) {
        while self.remove_head().is_some() {}
    }
}

impl<T: PartialEq> SlabList<T> {
    /// Unlink `target`. Absence is not an error.
    pub fn remove(&mut self, target: &T) -> bool {
        self.remove_where(|value| value == target).is_some()
    }

    pub fn is_head(&self, target: &T) -> bool {
        self.head() == Some(target)
    }

    pub fn next(&self, after: &T) -> Option<&T> {
        let mut values = self.iter();
        values.by_ref().find(|value| *value == after)?;
        values.next()
    }

    pub fn prev(&self, before: &T) -> Option<&T> {
        let mut prev = None;
        for value in self.iter() {
            if value == before {
                return prev;
            }
            prev = Some(value);
        }
        None
    }
}

/// Entry of the CIS list of a CIG.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CisEntry {
    pub cis_connection_handle: u16,
    /// The CIS has completed its sub-events in the current
    /// interleaved CIG event.
    pub done: bool,
}

pub type CisList = SlabList<CisEntry>;

impl CisList {
    pub fn insert_cis(&mut self, cis_connection_handle: u16) -> bool {
        self.insert_tail(CisEntry { cis_connection_handle, done: false }).is_ok()
    }

    pub fn remove_cis(&mut self, cis_connection_handle: u16) -> bool {
        self.remove_where(|entry| entry.cis_connection_handle == cis_connection_handle).is_some()
    }

    pub fn contains(&self, cis_connection_handle: u16) -> bool {
        self.iter().any(|entry| entry.cis_connection_handle == cis_connection_handle)
    }

    pub fn head_handle(&self) -> Option<u16> {
        self.head().map(|entry| entry.cis_connection_handle)
    }

    pub fn handles(&self) -> Vec<u16> {
        self.iter().map(|entry| entry.cis_connection_handle).collect()
    }

    pub fn are_all_done(&self) -> bool {
        self.iter().all(|entry| entry.done)
    }

    pub fn clear_done(&mut self) {
        self.iter_mut().for_each(|entry| entry.done = false)
    }

    /// Mark `cis_connection_handle` alone done.
    pub fn set_done(&mut self, cis_connection_handle: u16) {
        self.iter_mut()
            .filter(|entry| entry.cis_connection_handle == cis_connection_handle)
            .for_each(|entry| entry.done = true)
    }

    /// First entry, in list order, not done yet.
    pub fn first_pending(&self) -> Option<u16> {
        self.iter().find(|entry| !entry.done).map(|entry| entry.cis_connection_handle)
    }

    /// Next entry not done after `current`, wrapping around to the head.
    /// `current` itself comes last.
    pub fn next_pending_after(&self, current: u16) -> Option<u16> {
        let entries: Vec<&CisEntry> = self.iter().collect();
        let start = entries
            .iter()
            .position(|entry| entry.cis_connection_handle == current)
            .map_or(0, |position| position + 1);
        (0..entries.len())
            .map(|offset| entries[(start + offset) % entries.len()])
            .find(|entry| !entry.done)
            .map(|entry| entry.cis_connection_handle)
    }

    /// Mark `cis_connection_handle` and every following entry done.
    pub fn set_done_from(&mut self, cis_connection_handle: u16) {
        let mut found = false;
        for entry in self.iter_mut() {
            found |= entry.cis_connection_handle == cis_connection_handle;
            if found {
                entry.done = true;
            }
        }
    }
}

/// Flush timeout bookkeeping of the payloads of one CIS event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FtParam {
    pub bn: u8,
    pub ft: u8,
    pub nse: u8,
    /// Last sub-event, cumulative, in which payload `i` may be sent.
    pub sub_evt_limit: Vec<u8>,
    /// CIS events elapsed since the payloads were queued.
    pub intv: u8,
    /// Payloads not acknowledged yet.
    pub pending: u8,
}

impl FtParam {
    pub fn new(bn: u8, ft: u8, nse: u8) -> FtParam {
        let sub_evt_limit = if bn <= 1 {
            vec![bn.max(1) * nse]
        } else {
            let per_payload = nse / bn;
            let first = per_payload + nse % bn;
            (0..bn).map(|i| first + i * per_payload).collect()
        };
        FtParam { bn, ft, nse, sub_evt_limit, intv: 0, pending: bn.max(1) }
    }

    /// A payload was acknowledged. Returns true once all of them are.
    pub fn ack(&mut self) -> bool {
        self.pending = self.pending.saturating_sub(1);
        self.pending == 0
    }

    /// Advance one CIS event. Returns true when the payloads are flushed.
    pub fn age(&mut self) -> bool {
        self.intv = self.intv.saturating_add(1);
        self.intv >= self.ft
    }
}

pub type FtList = SlabList<FtParam>;

impl FtList {
    /// Age every entry and drop the flushed ones, returning them.
    pub fn age_all(&mut self) -> Vec<FtParam> {
        let flushed = self.iter_mut().map(FtParam::age).filter(|flushed| *flushed).count();
        (0..flushed).filter_map(|_| self.remove_where(|param| param.intv >= param.ft)).collect()
    }

    /// Acknowledge one payload of the oldest entry, dropping the entry
    /// once all its payloads are acknowledged.
    pub fn ack_oldest(&mut self) {
        if self.iter_mut().next().is_some_and(FtParam::ack) {
            self.remove_head();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cis_list_round_trip() {
        let mut list = CisList::with_capacity(4);
        for handle in [0xe00, 0xe01, 0xe02, 0xe03] {
            assert!(list.insert_cis(handle));
        }
        assert!(!list.insert_cis(0xe04));
        assert_eq!(list.len(), 4);

        let mut removed = vec![];
        while let Some(entry) = list.remove_head() {
            removed.push(entry.cis_connection_handle);
        }
        assert_eq!(removed, vec![0xe00, 0xe01, 0xe02, 0xe03]);
        assert_eq!(list.len(), 0);
        assert!(list.is_empty());
        assert!(list.head().is_none());
    }

    #[test]
    fn test_head_tail_middle() {
        let mut list = SlabList::with_capacity(5);
        list.insert_tail(2).unwrap();
        list.insert_tail(3).unwrap();
        list.insert_head(1).unwrap();
        list.insert_tail(4).unwrap();
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!(list.is_head(&1));
        assert_eq!(list.next(&2), Some(&3));
        assert_eq!(list.prev(&2), Some(&1));
        assert_eq!(list.prev(&1), None);
        assert_eq!(list.next(&4), None);

        assert!(list.remove(&3));
        assert!(!list.remove(&7));
        assert_eq!(list.remove_tail(), Some(4));
        assert_eq!(list.tail(), Some(&2));
        list.insert_tail(5).unwrap();
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![1, 2, 5]);
        assert_eq!(list.remove_tail(), Some(5));
        assert_eq!(list.remove_tail(), Some(2));
        assert_eq!(list.remove_tail(), Some(1));
        assert!(list.is_empty());
        assert_eq!(list.remove_tail(), None);
    }

    #[test]
    fn test_done_flags() {
        let mut list = CisList::with_capacity(3);
        list.insert_cis(0xe00);
        list.insert_cis(0xe01);
        list.insert_cis(0xe02);
        list.set_done_from(0xe01);
        assert_eq!(list.iter().map(|entry| entry.done).collect::<Vec<_>>(), vec![false, true, true]);
        assert!(!list.are_all_done());
        list.set_done_from(0xe00);
        assert!(list.are_all_done());
        list.clear_done();
        assert!(list.iter().all(|entry| !entry.done));
    }

    #[test]
    fn test_ft_split() {
        let param = FtParam::new(3, 2, 10);
        assert_eq!(param.sub_evt_limit, vec![4, 7, 10]);
        assert_eq!(param.pending, 3);

        assert_eq!(FtParam::new(1, 1, 4).sub_evt_limit, vec![4]);
        assert_eq!(FtParam::new(2, 1, 4).sub_evt_limit, vec![2, 4]);
    }

    #[test]
    fn test_ft_aging() {
        let mut list = FtList::with_capacity(4);
        list.insert_tail(FtParam::new(1, 2, 2)).unwrap();
        assert!(list.age_all().is_empty());
        list.insert_tail(FtParam::new(1, 2, 2)).unwrap();
        assert_eq!(list.age_all().len(), 1);
        assert_eq!(list.len(), 1);
        assert_eq!(list.age_all().len(), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn test_ft_ack() {
        let mut list = FtList::with_capacity(4);
        list.insert_tail(FtParam::new(2, 1, 4)).unwrap();
        list.insert_tail(FtParam::new(1, 1, 4)).unwrap();
        list.ack_oldest();
        assert_eq!(list.head().map(|param| param.pending), Some(1));
        list.ack_oldest();
        assert_eq!(list.len(), 1);

        let flushed = list.age_all();
        assert_eq!(flushed.iter().map(|param| param.pending).collect::<Vec<_>>(), vec![1]);
        list.ack_oldest();
        assert!(list.is_empty());
    }

    #[test]
    fn test_pending_order() {
        let mut list = CisList::with_capacity(3);
        list.insert_cis(0xe00);
        list.insert_cis(0xe01);
        list.insert_cis(0xe02);
        assert_eq!(list.first_pending(), Some(0xe00));
        assert_eq!(list.next_pending_after(0xe00), Some(0xe01));
        assert_eq!(list.next_pending_after(0xe02), Some(0xe00));

        list.set_done(0xe01);
        assert_eq!(list.iter().map(|entry| entry.done).collect::<Vec<_>>(), vec![false, true, false]);
        assert_eq!(list.next_pending_after(0xe00), Some(0xe02));
        list.set_done(0xe00);
        assert_eq!(list.first_pending(), Some(0xe02));
        assert_eq!(list.next_pending_after(0xe02), Some(0xe02));
        list.set_done(0xe02);
        assert!(list.are_all_done());
        assert_eq!(list.next_pending_after(0xe02), None);
    }
}
