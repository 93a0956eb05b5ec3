//! Intrusive doubly linked list backed by an index-addressed pool.
//!
//! Elements are identified by an index into a pool (e.g., a task arena). Each
//! element embeds one `Cell<Option<Link<Index>>>` per list kind it can be a
//! member of, which is how a single element can simultaneously belong to a
//! state list and an event list.
use core::{cell::Cell, fmt, ops};

use super::Init;

/// Circular linked list header.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

impl<Index> Init for ListHead<Index> {
    const INIT: Self = Self::new();
}

impl<Index> Default for ListHead<Index> {
    fn default() -> Self {
        Self::INIT
    }
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self { first: None }
    }

    pub const fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Error type for [`ListAccessor`]'s methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListError {
    /// The item to insert is already a member of a list of this kind.
    AlreadyLinked,
    /// The item is not a member of any list of this kind.
    NotLinked,
    /// A neighbor's link is missing.
    Inconsistent,
}

/// Accessor to a linked list whose items live in `Pool`.
///
/// `map_link` maps an element to the link cell used by this list kind.
pub struct ListAccessor<'a, Index, Pool: ?Sized, MapLink> {
    head: &'a mut ListHead<Index>,
    pool: &'a Pool,
    map_link: MapLink,
}

impl<'a, Index, Pool, MapLink, Element> ListAccessor<'a, Index, Pool, MapLink>
where
    Pool: ops::Index<Index, Output = Element> + ?Sized,
    MapLink: Fn(&Element) -> &Cell<Option<Link<Index>>>,
    Element: ?Sized + 'a,
    Index: PartialEq + Copy,
{
    pub fn new(head: &'a mut ListHead<Index>, pool: &'a Pool, map_link: MapLink) -> Self {
        ListAccessor {
            head,
            pool,
            map_link,
        }
    }

    #[inline]
    fn link(&self, i: Index) -> &Cell<Option<Link<Index>>> {
        (self.map_link)(&self.pool[i])
    }

    pub fn head(&self) -> ListHead<Index> {
        *self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }

    #[inline]
    pub fn front(&self) -> Option<Index> {
        self.head.first
    }

    #[inline]
    pub fn back(&self) -> Result<Option<Index>, ListError> {
        self.head
            .first
            .map(|p| {
                Ok(self.link(p).get().ok_or(ListError::Inconsistent)?.prev)
            })
            .transpose()
    }

    /// Check whether `item` is a member of a list of this kind (not
    /// necessarily this list).
    #[inline]
    pub fn is_linked(&self, item: Index) -> bool {
        self.link(item).get().is_some()
    }

    /// Insert `item` before the position `p` (if `at` is `Some(p)`) or to the
    /// the list's back (if `at` is `None`).
    pub fn insert(&mut self, item: Index, at: Option<Index>) -> Result<(), ListError> {
        if self.is_linked(item) {
            return Err(ListError::AlreadyLinked);
        }

        if let Some(first) = self.head.first {
            let (next, update_first) = match at {
                Some(at) => (at, at == first),
                None => (first, false),
            };

            let next_link = self.link(next);
            let mut nl = next_link.get().ok_or(ListError::Inconsistent)?;
            let prev = nl.prev;

            // next.prev = item
            nl.prev = item;
            next_link.set(Some(nl));

            // prev.next = item
            let prev_link = self.link(prev);
            let mut pl = prev_link.get().ok_or(ListError::Inconsistent)?;
            pl.next = item;
            prev_link.set(Some(pl));

            self.link(item).set(Some(Link { prev, next }));

            if update_first {
                self.head.first = Some(item);
            }
        } else {
            debug_assert!(at.is_none());

            self.link(item).set(Some(Link {
                prev: item,
                next: item,
            }));
            self.head.first = Some(item);
        }

        Ok(())
    }

    #[inline]
    pub fn push_back(&mut self, item: Index) -> Result<(), ListError> {
        self.insert(item, None)
    }

    #[inline]
    pub fn push_front(&mut self, item: Index) -> Result<(), ListError> {
        let at = self.front();
        self.insert(item, at)
    }

    /// Remove `item` from the list. Returns `item`.
    ///
    /// `item` must be a member of this list; removing an item that belongs to
    /// another list of the same kind corrupts both lists.
    pub fn remove(&mut self, item: Index) -> Result<Index, ListError> {
        let link = self.link(item).get().ok_or(ListError::NotLinked)?;

        if self.head.first == Some(item) {
            if link.next == item {
                // The list just became empty
                self.head.first = None;
                self.link(item).set(None);
                return Ok(item);
            }

            self.head.first = Some(link.next);
        }

        // link.prev.next = link.next
        let prev_link = self.link(link.prev);
        let mut pl = prev_link.get().ok_or(ListError::Inconsistent)?;
        pl.next = link.next;
        prev_link.set(Some(pl));

        // link.next.prev = link.prev
        let next_link = self.link(link.next);
        let mut nl = next_link.get().ok_or(ListError::Inconsistent)?;
        nl.prev = link.prev;
        next_link.set(Some(nl));

        self.link(item).set(None);

        Ok(item)
    }

    #[inline]
    pub fn pop_front(&mut self) -> Result<Option<Index>, ListError> {
        self.front()
            .map(|item| {
                // `NotLinked` would be unexpected here
                self.remove(item).map_err(|_| ListError::Inconsistent)
            })
            .transpose()
    }

    /// Get the next element of the specified element.
    #[inline]
    pub fn next(&self, i: Index) -> Result<Option<Index>, ListError> {
        let next = self.link(i).get().ok_or(ListError::NotLinked)?.next;
        Ok(if Some(next) == self.head.first {
            None
        } else {
            Some(next)
        })
    }

    pub fn iter(&self) -> Iter<'_, 'a, Index, Pool, MapLink> {
        Iter {
            next: self.head.first,
            accessor: self,
        }
    }
}

impl<'a, Index, Pool: ?Sized, MapLink> ops::Deref for ListAccessor<'a, Index, Pool, MapLink> {
    type Target = Pool;

    fn deref(&self) -> &Self::Target {
        self.pool
    }
}

/// An iterator over the elements of [`ListAccessor`].
pub struct Iter<'b, 'a, Index, Pool: ?Sized, MapLink> {
    accessor: &'b ListAccessor<'a, Index, Pool, MapLink>,
    next: Option<Index>,
}

impl<'b, 'a, Index, Pool, MapLink, Element> Iterator for Iter<'b, 'a, Index, Pool, MapLink>
where
    Pool: ops::Index<Index, Output = Element> + ?Sized,
    MapLink: Fn(&Element) -> &Cell<Option<Link<Index>>>,
    Element: ?Sized + 'a,
    Index: PartialEq + Copy,
{
    type Item = Result<Index, ListError>;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next.take()?;
        match self.accessor.next(cur) {
            Ok(next) => {
                self.next = next;
                Some(Ok(cur))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
