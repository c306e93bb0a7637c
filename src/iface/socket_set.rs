use core::fmt;
use managed::ManagedSlice;

use crate::socket::tcp::Socket;

/// Error returned by [`SocketSet::add`] when a borrowed storage has no free slot.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SocketSetFull;

impl fmt::Display for SocketSetFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket set full")
    }
}

impl core::error::Error for SocketSetFull {}

/// An item of a socket set.
///
/// The only reason this struct is public is to allow the socket set storage
/// to be allocated externally.
#[derive(Debug, Default)]
pub struct SocketStorage {
    inner: Option<Socket>,
}

impl SocketStorage {
    pub const EMPTY: Self = Self { inner: None };
}

/// A handle, identifying a socket in an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SocketHandle(pub(crate) usize);

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An extensible set of sockets.
///
/// The lifetime `'a` is the lifetime of borrowed slot storage. A set backed by
/// a `Vec` grows on demand and can be a `SocketSet<'static>`.
#[derive(Debug)]
pub struct SocketSet<'a> {
    sockets: ManagedSlice<'a, SocketStorage>,
}

impl<'a> SocketSet<'a> {
    /// Create a socket set using the provided storage.
    pub fn new<SocketsT>(sockets: SocketsT) -> SocketSet<'a>
    where
        SocketsT: Into<ManagedSlice<'a, SocketStorage>>,
    {
        let sockets = sockets.into();
        SocketSet { sockets }
    }

    /// Add a socket to the set, and return its handle.
    pub fn add(&mut self, socket: Socket) -> Result<SocketHandle, SocketSetFull> {
        for (index, slot) in self.sockets.iter_mut().enumerate() {
            if slot.inner.is_none() {
                net_trace!("[{}]: adding", index);
                slot.inner = Some(socket);
                return Ok(SocketHandle(index));
            }
        }

        match &mut self.sockets {
            ManagedSlice::Borrowed(_) => Err(SocketSetFull),
            ManagedSlice::Owned(sockets) => {
                let index = sockets.len();
                net_trace!("[{}]: adding", index);
                sockets.push(SocketStorage {
                    inner: Some(socket),
                });
                Ok(SocketHandle(index))
            }
        }
    }

    /// Get a socket from the set by its handle.
    ///
    /// # Panics
    /// This function may panic if the handle does not belong to this socket set.
    pub fn get(&self, handle: SocketHandle) -> &Socket {
        self.sockets[handle.0]
            .inner
            .as_ref()
            .expect("handle does not refer to a valid socket")
    }

    /// Get a mutable socket from the set by its handle.
    ///
    /// # Panics
    /// This function may panic if the handle does not belong to this socket set.
    pub fn get_mut(&mut self, handle: SocketHandle) -> &mut Socket {
        self.sockets[handle.0]
            .inner
            .as_mut()
            .expect("handle does not refer to a valid socket")
    }

    /// Get a mutable socket from the set, or `None` if the slot is empty or out of range.
    pub fn try_get_mut(&mut self, handle: SocketHandle) -> Option<&mut Socket> {
        self.sockets.get_mut(handle.0)?.inner.as_mut()
    }

    /// Remove a socket from the set, without changing its state.
    ///
    /// # Panics
    /// This function may panic if the handle does not belong to this socket set.
    pub fn remove(&mut self, handle: SocketHandle) -> Socket {
        net_trace!("[{}]: removing", handle.0);
        match self.sockets[handle.0].inner.take() {
            Some(socket) => socket,
            None => panic!("handle does not refer to a valid socket"),
        }
    }

    /// Number of sockets in the set.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get an iterator to the inner sockets.
    pub fn iter(&self) -> impl Iterator<Item = (SocketHandle, &Socket)> {
        self.sockets.iter().enumerate().filter_map(|(index, slot)| {
            slot.inner
                .as_ref()
                .map(|socket| (SocketHandle(index), socket))
        })
    }

    /// Get a mutable iterator to the inner sockets.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SocketHandle, &mut Socket)> {
        self.sockets
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.inner
                    .as_mut()
                    .map(|socket| (SocketHandle(index), socket))
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_add_reuses_free_slot() {
        let mut set = SocketSet::new(vec![]);
        let a = set.add(Socket::new()).unwrap();
        let b = set.add(Socket::new()).unwrap();
        assert_eq!((a, b), (SocketHandle(0), SocketHandle(1)));
        set.remove(a);
        assert_eq!(set.len(), 1);
        assert_eq!(set.add(Socket::new()), Ok(SocketHandle(0)));
    }

    #[test]
    fn test_borrowed_storage_full() {
        let mut storage = [SocketStorage::EMPTY];
        let mut set = SocketSet::new(&mut storage[..]);
        assert!(set.add(Socket::new()).is_ok());
        assert_eq!(set.add(Socket::new()), Err(SocketSetFull));
    }

    #[test]
    fn test_try_get_mut() {
        let mut set = SocketSet::new(vec![]);
        let handle = set.add(Socket::new()).unwrap();
        assert!(set.try_get_mut(handle).is_some());
        assert!(set.try_get_mut(SocketHandle(7)).is_none());
    }
}
