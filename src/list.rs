use std::{marker::PhantomData, ptr::NonNull};

/// Non-null pointer to `T`.
pub(crate) type Link<T> = Option<NonNull<T>>;

/// Intrusive list node. The allocator never creates nodes on its own heap,
/// they are always written straight into arena memory, so the layout is
/// fixed with `repr(C)`: the links come first and the payload follows.
#[repr(C)]
pub(crate) struct Node<T> {
    /// Pointer to the next node of the list
    pub next: Link<Self>,
    /// Pointer to the previous node of the list
    pub prev: Link<Self>,
    /// Element of the node
    pub data: T,
}

/// Doubly linked list whose nodes live in memory the list does not own.
///
/// Every method that links a node in takes a pointer to a node that is
/// already written somewhere (see [`List::write`]). The list only rewires
/// `next`/`prev`, it never allocates or frees.
pub(crate) struct List<T> {
    head: Link<Node<T>>,
    tail: Link<Node<T>>,
    len: usize,
    marker: PhantomData<T>,
}

pub(crate) struct Iter<'a, T> {
    current: Link<Node<T>>,
    remaining: usize,
    marker: PhantomData<&'a T>,
}

/// Iterator over the raw node pointers of a [`List`].
pub(crate) struct Nodes<'a, T> {
    current: Link<Node<T>>,
    marker: PhantomData<&'a List<T>>,
}

impl<T> Node<T> {
    pub const fn new(data: T) -> Self {
        Self { next: None, prev: None, data }
    }
}

impl<T> List<T> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link<Node<T>> {
        self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writes an unlinked node holding `data` at `addr` and returns it.
    ///
    /// We are the memory allocator, so nothing here may allocate. The caller
    /// decides where the node lives.
    ///
    /// **SAFETY**: `addr` must be valid for writes of `Node<T>` and suitably
    /// aligned, and must not overlap any node currently linked in a list.
    pub unsafe fn write(data: T, addr: NonNull<u8>) -> NonNull<Node<T>> {
        let node = addr.cast::<Node<T>>();

        unsafe {
            node.as_ptr().write(Node::new(data));
        }

        node
    }

    /// Links `node` in as the new head.
    ///
    /// **SAFETY**: `node` must point to a valid node that is not linked in
    /// any list.
    pub unsafe fn push_front(&mut self, mut node: NonNull<Node<T>>) {
        unsafe {
            node.as_mut().prev = None;
            node.as_mut().next = self.head;

            match self.head {
                Some(mut head) => head.as_mut().prev = Some(node),
                None => self.tail = Some(node),
            }
        }

        self.head = Some(node);
        self.len += 1;
    }

    /// Links `node` right after `at`, or at the head when `at` is `None`.
    ///
    /// **SAFETY**: `at` must be linked in this list and `node` must be valid
    /// and unlinked.
    pub unsafe fn insert_after(&mut self, at: Link<Node<T>>, mut node: NonNull<Node<T>>) {
        let Some(mut at) = at else {
            unsafe { self.push_front(node) };
            return;
        };

        unsafe {
            let next = at.as_ref().next;

            node.as_mut().prev = Some(at);
            node.as_mut().next = next;
            at.as_mut().next = Some(node);

            match next {
                Some(mut next) => next.as_mut().prev = Some(node),
                None => self.tail = Some(node),
            }
        }

        self.len += 1;
    }

    /// Puts `new` in the exact position `old` occupies and unlinks `old`.
    ///
    /// **SAFETY**: `old` must be linked in this list and `new` must be valid
    /// and unlinked.
    pub unsafe fn replace(&mut self, old: NonNull<Node<T>>, mut new: NonNull<Node<T>>) {
        unsafe {
            let prev = old.as_ref().prev;
            let next = old.as_ref().next;

            new.as_mut().prev = prev;
            new.as_mut().next = next;

            match prev {
                Some(mut prev) => prev.as_mut().next = Some(new),
                None => self.head = Some(new),
            }

            match next {
                Some(mut next) => next.as_mut().prev = Some(new),
                None => self.tail = Some(new),
            }
        }
    }

    /// Unlinks `node`, whether it is the head, the tail or somewhere in
    /// between.
    ///
    /// **SAFETY**: `node` must be linked in this list.
    pub unsafe fn remove(&mut self, mut node: NonNull<Node<T>>) {
        unsafe {
            let prev = node.as_ref().prev;
            let next = node.as_ref().next;

            match prev {
                Some(mut prev) => prev.as_mut().next = next,
                None => self.head = next,
            }

            match next {
                Some(mut next) => next.as_mut().prev = prev,
                None => self.tail = prev,
            }

            node.as_mut().next = None;
            node.as_mut().prev = None;
        }

        self.len -= 1;
    }

    /// Whether `node` is one of the nodes of this list. Linear.
    pub fn contains(&self, node: NonNull<Node<T>>) -> bool {
        self.nodes().any(|current| current == node)
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }

    pub fn nodes(&self) -> Nodes<'_, T> {
        Nodes {
            current: self.head,
            marker: PhantomData,
        }
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        unsafe {
            self.current = node.as_ref().next;
            self.remaining -= 1;

            Some(&node.as_ref().data)
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T> Iterator for Nodes<'a, T> {
    type Item = NonNull<Node<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;
        self.current = unsafe { node.as_ref().next };

        Some(node)
    }
}
