//! Device-managed resources.
//!
//! Every [Device] owns an ordered list of resource entries. An entry is either a plain resource
//! (payload plus release callback) or one half of a group bracket. Entries live in an arena and
//! are addressed by [DevresHandle]; a generation counter makes stale handles fail with
//! [DevresError::NotFound] instead of hitting a recycled slot.
//!
//! Releasing a span `[first, end)` works in two passes:
//! 1. plain entries are collected in list order and every marker's group color is reset;
//! 2. each marker in the span bumps its group's color once, and once more when the close marker
//!    is not in the list. A group at color 2 lies wholly inside the span and goes away with it;
//!    a group at color 1 extends past the span and stays.
//!
//! Collected entries are released last-allocated first, outside the list lock. A color outside
//! {1, 2} or a marker whose group is missing means the list is corrupted: nothing is released and
//! the list refuses every later operation.
use core::any::Any;
use std::collections::BTreeMap;

use log::error;

use utils::impl_deref;

use crate::{debug_ex, dev::Device, error::DevresError};

type Payload = Box<dyn Any + Send>;
type ReleaseCb = Box<dyn FnOnce(&Device, Payload) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevresHandle {
    index: u32,
    generation: u32,
}

/// Identity of a resource group: the handle of its open marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId {
    inner: DevresHandle,
}

impl_deref!(GroupId, DevresHandle);

/// Public view of one list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevresKind {
    Resource(&'static str),
    GroupOpen(GroupId),
    GroupClose(GroupId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevresEntry {
    pub handle: DevresHandle,
    pub kind: DevresKind,
}

pub(crate) enum EntryKind {
    Resource {
        name: &'static str,
        release: ReleaseCb,
        data: Payload,
    },
    GroupOpen(GroupId),
    GroupClose(GroupId),
}

impl EntryKind {
    fn group(&self) -> Option<GroupId> {
        match self {
            Self::Resource { .. } => None,
            Self::GroupOpen(id) | Self::GroupClose(id) => Some(*id),
        }
    }
}

pub(crate) struct Entry {
    kind: EntryKind,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

struct GroupState {
    color: u8,
    close: Option<DevresHandle>,
}

/// Arena-backed resource list of one device.
#[derive(Default)]
pub(crate) struct DevresList {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    groups: BTreeMap<GroupId, GroupState>,
    len: usize,
    corrupted: bool,
}

impl DevresList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn check(&self) -> Result<(), DevresError> {
        if self.corrupted {
            return Err(DevresError::Corrupted);
        }
        Ok(())
    }

    fn entry(&self, index: u32) -> Option<&Entry> {
        self.slots.get(index as usize)?.entry.as_ref()
    }

    fn live(&self, handle: DevresHandle) -> Option<&Entry> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn handle_of(&self, index: u32) -> DevresHandle {
        DevresHandle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    /// Append at the tail. The only failure is the arena failing to grow.
    fn push(&mut self, kind: EntryKind) -> Result<DevresHandle, DevresError> {
        self.check()?;
        let entry = Entry {
            kind,
            prev: self.tail,
            next: None,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].entry = Some(entry);
                index
            }
            None => {
                self.slots
                    .try_reserve(1)
                    .map_err(|_| DevresError::OutOfMemory)?;
                self.free
                    .try_reserve(self.slots.len() + 1)
                    .map_err(|_| DevresError::OutOfMemory)?;
                let index = u32::try_from(self.slots.len()).map_err(|_| DevresError::OutOfMemory)?;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                index
            }
        };
        match self.tail {
            Some(tail) => {
                if let Some(prev) = self.slots[tail as usize].entry.as_mut() {
                    prev.next = Some(index);
                }
            }
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
        Ok(self.handle_of(index))
    }

    fn unlink(&mut self, index: u32) -> Option<Entry> {
        let slot = self.slots.get_mut(index as usize)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        match entry.prev {
            Some(prev) => {
                if let Some(prev) = self.slots[prev as usize].entry.as_mut() {
                    prev.next = entry.next;
                }
            }
            None => self.head = entry.next,
        }
        match entry.next {
            Some(next) => {
                if let Some(next) = self.slots[next as usize].entry.as_mut() {
                    next.prev = entry.prev;
                }
            }
            None => self.tail = entry.prev,
        }
        self.free.push(index);
        self.len -= 1;
        Some(entry)
    }

    fn corrupt(&mut self, reason: &str) -> DevresError {
        error!("devres: {}, refusing further processing of this list", reason);
        self.corrupted = true;
        DevresError::Corrupted
    }

    pub fn add(
        &mut self,
        name: &'static str,
        data: Payload,
        release: ReleaseCb,
    ) -> Result<DevresHandle, DevresError> {
        self.push(EntryKind::Resource {
            name,
            release,
            data,
        })
    }

    pub fn entries(&self) -> Vec<DevresEntry> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while let Some(index) = cur {
            let Some(entry) = self.entry(index) else {
                break;
            };
            let kind = match &entry.kind {
                EntryKind::Resource { name, .. } => DevresKind::Resource(name),
                EntryKind::GroupOpen(id) => DevresKind::GroupOpen(*id),
                EntryKind::GroupClose(id) => DevresKind::GroupClose(*id),
            };
            out.push(DevresEntry {
                handle: self.handle_of(index),
                kind,
            });
            cur = entry.next;
        }
        out
    }

    /// Most recent plain entry named `name` with a `T` payload accepted by `matches`.
    pub fn find<T: Any>(
        &self,
        name: &str,
        mut matches: impl FnMut(&T) -> bool,
    ) -> Result<Option<DevresHandle>, DevresError> {
        self.check()?;
        let mut cur = self.tail;
        while let Some(index) = cur {
            let Some(entry) = self.entry(index) else {
                break;
            };
            if let EntryKind::Resource { name: n, data, .. } = &entry.kind {
                if *n == name && data.downcast_ref::<T>().is_some_and(&mut matches) {
                    return Ok(Some(self.handle_of(index)));
                }
            }
            cur = entry.prev;
        }
        Ok(None)
    }

    pub fn with<T: Any, R>(
        &mut self,
        handle: DevresHandle,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, DevresError> {
        self.check()?;
        self.live(handle).ok_or(DevresError::NotFound)?;
        let slot = &mut self.slots[handle.index as usize];
        match slot.entry.as_mut().map(|e| &mut e.kind) {
            Some(EntryKind::Resource { data, .. }) => {
                data.downcast_mut::<T>().map(f).ok_or(DevresError::NotFound)
            }
            _ => Err(DevresError::NotFound),
        }
    }

    /// Unlink a plain entry, handing back its name, release callback and payload.
    pub fn take(
        &mut self,
        handle: DevresHandle,
        payload_is: impl FnOnce(&Payload) -> bool,
    ) -> Result<(&'static str, ReleaseCb, Payload), DevresError> {
        self.check()?;
        let data = match self.live(handle).map(|e| &e.kind) {
            Some(EntryKind::Resource { data, .. }) => data,
            _ => return Err(DevresError::NotFound),
        };
        if !payload_is(data) {
            return Err(DevresError::NotFound);
        }
        match self.unlink(handle.index).map(|e| e.kind) {
            Some(EntryKind::Resource {
                name,
                release,
                data,
            }) => Ok((name, release, data)),
            _ => Err(self.corrupt("entry vanished while unlinking")),
        }
    }

    pub fn open_group(&mut self) -> Result<GroupId, DevresError> {
        let placeholder = GroupId {
            inner: DevresHandle {
                index: u32::MAX,
                generation: u32::MAX,
            },
        };
        let handle = self.push(EntryKind::GroupOpen(placeholder))?;
        let id = GroupId { inner: handle };
        if let Some(entry) = self.slots[handle.index as usize].entry.as_mut() {
            entry.kind = EntryKind::GroupOpen(id);
        }
        self.groups.insert(id, GroupState { color: 0, close: None });
        Ok(id)
    }

    /// `None` selects the most recently opened group that is still open.
    fn find_group(&self, id: Option<GroupId>) -> Result<GroupId, DevresError> {
        match id {
            Some(id) => match self.live(id.inner).map(|e| &e.kind) {
                Some(EntryKind::GroupOpen(open)) if *open == id && self.groups.contains_key(&id) => {
                    Ok(id)
                }
                _ => Err(DevresError::GroupNotFound),
            },
            None => {
                let mut cur = self.tail;
                while let Some(index) = cur {
                    let Some(entry) = self.entry(index) else {
                        break;
                    };
                    if let EntryKind::GroupOpen(id) = entry.kind {
                        if self.groups.get(&id).is_some_and(|g| g.close.is_none()) {
                            return Ok(id);
                        }
                    }
                    cur = entry.prev;
                }
                Err(DevresError::GroupNotFound)
            }
        }
    }

    fn close_live(&self, id: GroupId) -> bool {
        self.groups
            .get(&id)
            .and_then(|g| g.close)
            .is_some_and(|close| self.live(close).is_some())
    }

    pub fn close_group(&mut self, id: Option<GroupId>) -> Result<GroupId, DevresError> {
        self.check()?;
        let id = self.find_group(id)?;
        if self.close_live(id) {
            return Err(DevresError::GroupClosed);
        }
        let close = self.push(EntryKind::GroupClose(id))?;
        if let Some(group) = self.groups.get_mut(&id) {
            group.close = Some(close);
        }
        Ok(id)
    }

    /// Drop both markers of a group. Its resources stay, now owned by the enclosing scope.
    pub fn remove_group(&mut self, id: Option<GroupId>) -> Result<GroupId, DevresError> {
        self.check()?;
        let id = self.find_group(id)?;
        let close = self.groups.remove(&id).and_then(|g| g.close);
        self.unlink(id.inner.index);
        if let Some(close) = close {
            if self.live(close).is_some() {
                self.unlink(close.index);
            }
        }
        Ok(id)
    }

    /// Span of a group: from its open marker through its close marker, or to the end of the
    /// list while it is still open.
    pub fn group_span(
        &self,
        id: Option<GroupId>,
    ) -> Result<(DevresHandle, Option<DevresHandle>), DevresError> {
        self.check()?;
        let id = self.find_group(id)?;
        let end = self
            .groups
            .get(&id)
            .and_then(|g| g.close)
            .and_then(|close| self.live(close))
            .and_then(|close| close.next)
            .map(|next| self.handle_of(next));
        Ok((id.inner, end))
    }

    pub fn full_span(&self) -> Option<DevresHandle> {
        self.head.map(|head| self.handle_of(head))
    }

    /// Collect the span `[first, end)` for release. See the module documentation.
    pub fn remove_nodes(
        &mut self,
        first: DevresHandle,
        end: Option<DevresHandle>,
    ) -> Result<Vec<Entry>, DevresError> {
        self.check()?;
        self.live(first).ok_or(DevresError::NotFound)?;
        let end = match end {
            Some(end) => {
                self.live(end).ok_or(DevresError::NotFound)?;
                Some(end.index)
            }
            None => None,
        };

        // First pass: plain entries to the to-do list, group colors cleared.
        let mut todo = Vec::new();
        let mut markers = Vec::new();
        let mut cur = Some(first.index);
        while cur != end {
            let Some(index) = cur else {
                return Err(DevresError::InvalidRange);
            };
            let Some(entry) = self.entry(index) else {
                return Err(self.corrupt("broken link in resource list"));
            };
            cur = entry.next;
            match entry.kind.group() {
                None => todo.push(index),
                Some(id) => markers.push((index, id)),
            }
        }
        for (_, id) in &markers {
            match self.groups.get_mut(id) {
                Some(group) => group.color = 0,
                None => return Err(self.corrupt("marker of an unknown group")),
            }
        }

        // Second pass: color the groups.
        let mut removed = Vec::new();
        for (_, id) in &markers {
            if self.live(id.inner).is_none() {
                return Err(self.corrupt("group marker without its open marker"));
            }
            let close_live = self.close_live(*id);
            let Some(group) = self.groups.get_mut(id) else {
                return Err(self.corrupt("marker of an unknown group"));
            };
            group.color += 1;
            if !close_live {
                group.color += 1;
            }
            // A third marker of one group pushes it past 2.
            match group.color {
                1 => {}
                2 => removed.push(*id),
                color => {
                    let reason = format!("group color {} out of range", color);
                    return Err(self.corrupt(&reason));
                }
            }
        }

        let mut out = Vec::with_capacity(todo.len() + removed.len());
        out.extend(todo.into_iter().filter_map(|index| self.unlink(index)));
        for id in removed {
            let close = self.groups.remove(&id).and_then(|g| g.close);
            if let Some(close) = close {
                if self.live(close).is_some() {
                    self.unlink(close.index);
                }
            }
            out.extend(self.unlink(id.inner.index));
        }
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) fn push_raw_close(&mut self, id: GroupId) -> Result<DevresHandle, DevresError> {
        self.push(EntryKind::GroupClose(id))
    }
}

fn wrap_release<T: Any + Send>(release: impl FnOnce(&Device, T) + Send + 'static) -> ReleaseCb {
    Box::new(move |dev: &Device, data: Payload| match data.downcast::<T>() {
        Ok(data) => release(dev, *data),
        Err(_) => error!("{}: devres payload type changed", dev.name()),
    })
}

impl Device {
    /// Run the release callbacks of `todo`, last first, and return how many resources went.
    fn release_nodes(&self, todo: Vec<Entry>) -> usize {
        let mut count = 0;
        for entry in todo.into_iter().rev() {
            if let EntryKind::Resource {
                name,
                release,
                data,
            } = entry.kind
            {
                debug_ex!("{}: DEVRES REL {}", self.name(), name);
                release(self, data);
                count += 1;
            }
        }
        count
    }

    fn devres_report<R>(&self, result: Result<R, DevresError>) -> Result<R, DevresError> {
        if let Err(DevresError::Corrupted) = result {
            error!("{}: devres list corrupted", self.name());
        }
        result
    }

    /// Attach `data` to this device. `release` runs with the payload when the entry is released,
    /// at the latest when the device goes away.
    pub fn devres_alloc<T: Any + Send>(
        &self,
        name: &'static str,
        data: T,
        release: impl FnOnce(&Device, T) + Send + 'static,
    ) -> Result<DevresHandle, DevresError> {
        let handle = self.devres.lock().add(name, Box::new(data), wrap_release(release));
        if handle.is_ok() {
            debug_ex!("{}: DEVRES ADD {}", self.name(), name);
        }
        self.devres_report(handle)
    }

    /// Register an action that runs on release; there is no payload.
    pub fn devres_add_action(
        &self,
        name: &'static str,
        action: impl FnOnce(&Device) + Send + 'static,
    ) -> Result<DevresHandle, DevresError> {
        self.devres_alloc(name, (), move |dev, ()| action(dev))
    }

    /// Most recent resource named `name` whose `T` payload satisfies `matches`.
    pub fn devres_find<T: Any>(
        &self,
        name: &str,
        matches: impl FnMut(&T) -> bool,
    ) -> Result<Option<DevresHandle>, DevresError> {
        let found = self.devres.lock().find(name, matches);
        self.devres_report(found)
    }

    /// Access the payload of a live resource. `f` runs under the list lock.
    pub fn devres_with<T: Any, R>(
        &self,
        handle: DevresHandle,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, DevresError> {
        let result = self.devres.lock().with(handle, f);
        self.devres_report(result)
    }

    /// Detach a resource without running its release callback and return the payload.
    pub fn devres_remove<T: Any>(&self, handle: DevresHandle) -> Result<T, DevresError> {
        let taken = self.devres.lock().take(handle, |data| data.is::<T>());
        let (_, _, data) = self.devres_report(taken)?;
        data.downcast::<T>()
            .map(|data| *data)
            .map_err(|_| DevresError::NotFound)
    }

    /// Detach a resource and drop its payload without running the release callback.
    pub fn devres_destroy(&self, handle: DevresHandle) -> Result<(), DevresError> {
        let taken = self.devres.lock().take(handle, |_| true);
        self.devres_report(taken).map(drop)
    }

    /// Detach a resource and run its release callback.
    pub fn devres_release(&self, handle: DevresHandle) -> Result<(), DevresError> {
        let taken = self.devres.lock().take(handle, |_| true);
        let (name, release, data) = self.devres_report(taken)?;
        debug_ex!("{}: DEVRES REL {}", self.name(), name);
        release(self, data);
        Ok(())
    }

    /// Open a resource group. Everything allocated until the matching close belongs to it.
    pub fn devres_open_group(&self) -> Result<GroupId, DevresError> {
        let id = self.devres.lock().open_group();
        self.devres_report(id)
    }

    /// Close `id`, or the most recently opened open group when `id` is `None`.
    pub fn devres_close_group(&self, id: Option<GroupId>) -> Result<GroupId, DevresError> {
        let id = self.devres.lock().close_group(id);
        self.devres_report(id)
    }

    /// Remove the markers of a group, keeping its resources.
    pub fn devres_remove_group(&self, id: Option<GroupId>) -> Result<GroupId, DevresError> {
        let id = self.devres.lock().remove_group(id);
        self.devres_report(id)
    }

    /// Release every resource of a group (nested groups included) and the group itself.
    pub fn devres_release_group(&self, id: Option<GroupId>) -> Result<usize, DevresError> {
        let todo = {
            let mut list = self.devres.lock();
            list.group_span(id)
                .and_then(|(first, end)| list.remove_nodes(first, end))
        };
        self.devres_report(todo).map(|todo| self.release_nodes(todo))
    }

    /// Release the span `[first, end)`; `end == None` runs to the end of the list.
    pub fn devres_release_range(
        &self,
        first: DevresHandle,
        end: Option<DevresHandle>,
    ) -> Result<usize, DevresError> {
        let todo = self.devres.lock().remove_nodes(first, end);
        self.devres_report(todo).map(|todo| self.release_nodes(todo))
    }

    /// Release every managed resource of this device, most recent first.
    pub fn devres_release_all(&self) -> Result<usize, DevresError> {
        let todo = {
            let mut list = self.devres.lock();
            match list.full_span() {
                Some(first) => list.remove_nodes(first, None),
                None => list.check().map(|()| Vec::new()),
            }
        };
        self.devres_report(todo).map(|todo| self.release_nodes(todo))
    }

    pub fn devres_entries(&self) -> Vec<DevresEntry> {
        self.devres.lock().entries()
    }

    pub fn devres_len(&self) -> usize {
        self.devres.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn device() -> crate::kobj::Handle<Device> {
        Device::builder().name("devres-test").release(|_| {}).build()
    }

    type Release = Box<dyn FnOnce(&Device, ()) + Send>;

    fn tracker() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Release) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |name: &'static str| {
            let sink = sink.clone();
            Box::new(move |_: &Device, ()| sink.lock().unwrap().push(name)) as Release
        };
        (log, make)
    }

    fn names(dev: &Device) -> Vec<DevresKind> {
        dev.devres_entries().into_iter().map(|e| e.kind).collect()
    }

    #[test]
    fn release_all_runs_in_reverse() {
        let dev = device();
        let (log, make) = tracker();
        for name in ["R1", "R2", "R3"] {
            dev.devres_alloc(name, (), make(name)).unwrap();
        }
        assert_eq!(dev.devres_release_all().unwrap(), 3);
        assert_eq!(*log.lock().unwrap(), ["R3", "R2", "R1"]);
        assert_eq!(dev.devres_len(), 0);
    }

    #[test]
    fn drop_releases_before_device_release() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (order.clone(), order.clone());
        let dev = Device::builder()
            .name("d")
            .release(move |_| a.lock().unwrap().push("device"))
            .build();
        dev.devres_add_action("res", move |_| b.lock().unwrap().push("res"))
            .unwrap();
        drop(dev);
        assert_eq!(*order.lock().unwrap(), ["res", "device"]);
    }

    #[test]
    fn group_inside_span_is_removed_as_unit() {
        let dev = device();
        let (log, make) = tracker();
        dev.devres_alloc("X", (), make("X")).unwrap();
        let group = dev.devres_open_group().unwrap();
        dev.devres_alloc("A", (), make("A")).unwrap();
        dev.devres_alloc("B", (), make("B")).unwrap();
        dev.devres_close_group(Some(group)).unwrap();
        let y = dev.devres_alloc("Y", (), make("Y")).unwrap();

        assert_eq!(dev.devres_release_range(*group, Some(y)).unwrap(), 2);
        assert_eq!(*log.lock().unwrap(), ["B", "A"]);
        assert_eq!(
            names(&dev),
            [DevresKind::Resource("X"), DevresKind::Resource("Y")]
        );
        assert_eq!(
            dev.devres_release_group(Some(group)),
            Err(DevresError::GroupNotFound)
        );
    }

    #[test]
    fn span_with_only_open_marker_keeps_group() {
        let dev = device();
        let (log, make) = tracker();
        let x = dev.devres_alloc("X", (), make("X")).unwrap();
        let group = dev.devres_open_group().unwrap();
        let a = dev.devres_alloc("A", (), make("A")).unwrap();
        dev.devres_alloc("B", (), make("B")).unwrap();
        dev.devres_close_group(None).unwrap();

        assert_eq!(dev.devres_release_range(x, Some(a)).unwrap(), 1);
        assert_eq!(*log.lock().unwrap(), ["X"]);
        assert_eq!(
            names(&dev),
            [
                DevresKind::GroupOpen(group),
                DevresKind::Resource("A"),
                DevresKind::Resource("B"),
                DevresKind::GroupClose(group),
            ]
        );
    }

    #[test]
    fn open_group_is_removed_by_its_open_marker_alone() {
        let dev = device();
        let (log, make) = tracker();
        let group = dev.devres_open_group().unwrap();
        dev.devres_alloc("A", (), make("A")).unwrap();
        assert_eq!(dev.devres_release_group(None).unwrap(), 1);
        assert_eq!(*log.lock().unwrap(), ["A"]);
        assert!(names(&dev).is_empty());
        assert_eq!(
            dev.devres_close_group(Some(group)),
            Err(DevresError::GroupNotFound)
        );
    }

    #[test]
    fn nested_group_release() {
        let dev = device();
        let (log, make) = tracker();
        let outer = dev.devres_open_group().unwrap();
        dev.devres_alloc("A", (), make("A")).unwrap();
        let inner = dev.devres_open_group().unwrap();
        dev.devres_alloc("B", (), make("B")).unwrap();
        assert_eq!(dev.devres_close_group(None).unwrap(), inner);
        dev.devres_alloc("C", (), make("C")).unwrap();
        assert_eq!(dev.devres_close_group(None).unwrap(), outer);
        assert_eq!(
            dev.devres_close_group(Some(outer)),
            Err(DevresError::GroupClosed)
        );

        assert_eq!(dev.devres_release_group(Some(outer)).unwrap(), 3);
        assert_eq!(*log.lock().unwrap(), ["C", "B", "A"]);
        assert_eq!(dev.devres_len(), 0);
    }

    #[test]
    fn remove_group_keeps_resources() {
        let dev = device();
        let (log, make) = tracker();
        let group = dev.devres_open_group().unwrap();
        dev.devres_alloc("A", (), make("A")).unwrap();
        dev.devres_close_group(Some(group)).unwrap();
        dev.devres_remove_group(Some(group)).unwrap();
        assert_eq!(names(&dev), [DevresKind::Resource("A")]);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn find_remove_destroy_release() {
        let dev = device();
        let released = Arc::new(Mutex::new(Vec::new()));
        let sink = released.clone();
        let track = move |_: &Device, v: u32| sink.lock().unwrap().push(v);

        let one = dev.devres_alloc("irq", 1u32, track.clone()).unwrap();
        let two = dev.devres_alloc("irq", 2u32, track.clone()).unwrap();
        let three = dev.devres_alloc("irq", 3u32, track).unwrap();

        assert_eq!(dev.devres_find::<u32>("irq", |v| *v < 3), Ok(Some(two)));
        assert_eq!(dev.devres_find::<u64>("irq", |_| true), Ok(None));
        assert_eq!(dev.devres_with(one, |v: &mut u32| *v * 10), Ok(10));

        assert_eq!(dev.devres_remove::<u64>(one), Err(DevresError::NotFound));
        assert_eq!(dev.devres_remove::<u32>(one), Ok(1));
        assert_eq!(dev.devres_remove::<u32>(one), Err(DevresError::NotFound));
        dev.devres_destroy(two).unwrap();
        dev.devres_release(three).unwrap();
        assert_eq!(*released.lock().unwrap(), [3]);
        assert_eq!(dev.devres_len(), 0);
    }

    #[test]
    fn stale_handle_does_not_alias_recycled_slot() {
        let dev = device();
        let old = dev.devres_alloc("a", 1u8, |_, _| {}).unwrap();
        dev.devres_destroy(old).unwrap();
        let new = dev.devres_alloc("b", 2u8, |_, _| {}).unwrap();
        assert_ne!(old, new);
        assert_eq!(dev.devres_destroy(old), Err(DevresError::NotFound));
        assert_eq!(dev.devres_len(), 1);
    }

    #[test]
    fn range_end_must_follow_first() {
        let dev = device();
        let a = dev.devres_alloc("a", (), |_, _| {}).unwrap();
        let b = dev.devres_alloc("b", (), |_, _| {}).unwrap();
        assert_eq!(
            dev.devres_release_range(b, Some(a)),
            Err(DevresError::InvalidRange)
        );
        assert_eq!(dev.devres_len(), 2);
    }

    #[test]
    fn corruption_poisons_the_list() {
        let dev = device();
        let (log, make) = tracker();
        let group = dev.devres_open_group().unwrap();
        dev.devres_alloc("A", (), make("A")).unwrap();
        dev.devres_close_group(Some(group)).unwrap();
        dev.devres.lock().push_raw_close(group).unwrap();

        assert_eq!(dev.devres_release_all(), Err(DevresError::Corrupted));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(
            dev.devres_alloc("B", (), make("B")),
            Err(DevresError::Corrupted)
        );
        assert_eq!(dev.devres_find::<()>("A", |_| true), Err(DevresError::Corrupted));
        assert_eq!(dev.devres_len(), 4);
    }

    #[test]
    fn third_marker_overflows_group_color() {
        let mut list = DevresList::new();
        let group = list.open_group().unwrap();
        list.close_group(Some(group)).unwrap();
        list.push_raw_close(group).unwrap();
        let first = list.full_span().unwrap();

        assert!(matches!(
            list.remove_nodes(first, None),
            Err(DevresError::Corrupted)
        ));
        assert_eq!(list.groups.get(&group).map(|g| g.color), Some(3));
        assert_eq!(list.len(), 3);
        assert_eq!(list.open_group(), Err(DevresError::Corrupted));
    }
}
