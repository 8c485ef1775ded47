//! Interned byte strings.
//!
//! Header names, URLs, origin hostnames, and error messages are all
//! represented as [`Atom`]s: refcounted, hash-consed byte strings. Two atoms
//! with equal content share storage, so equality is a pointer comparison.
//! The interner is thread-local, matching the single-threaded engine.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

thread_local! {
    static INTERNER: RefCell<HashMap<Box<[u8]>, Weak<AtomInner>>> =
        RefCell::new(HashMap::new());
    static EMPTY: Atom = Atom(Rc::new(AtomInner { bytes: Box::new([]) }));
}

#[derive(Debug)]
struct AtomInner {
    bytes: Box<[u8]>,
}

/// An interned, refcounted byte string.
///
/// Cloning an atom bumps a reference count; dropping the last clone makes the
/// interner slot collectable. Content equality is pointer equality.
#[derive(Clone, Debug)]
pub struct Atom(Rc<AtomInner>);

impl Atom {
    /// Intern `bytes`, returning the shared atom for that content.
    pub fn intern(bytes: &[u8]) -> Atom {
        if bytes.is_empty() {
            return Atom::empty();
        }
        INTERNER.with(|interner| {
            let mut map = interner.borrow_mut();
            if let Some(weak) = map.get(bytes) {
                if let Some(rc) = weak.upgrade() {
                    return Atom(rc);
                }
            }
            let rc = Rc::new(AtomInner { bytes: bytes.into() });
            map.insert(bytes.into(), Rc::downgrade(&rc));
            // Dead slots accumulate until the table doubles; prune then.
            if map.len() > 64 && map.len() > map.capacity() / 2 {
                map.retain(|_, w| w.strong_count() > 0);
            }
            Atom(rc)
        })
    }

    /// Intern the ASCII-lowercase form of `bytes`.
    ///
    /// Used for header names, which compare case-insensitively.
    pub fn intern_lower(bytes: &[u8]) -> Atom {
        if bytes.iter().any(u8::is_ascii_uppercase) {
            let lower: Vec<u8> = bytes.to_ascii_lowercase();
            Atom::intern(&lower)
        } else {
            Atom::intern(bytes)
        }
    }

    /// The shared empty atom.
    pub fn empty() -> Atom {
        EMPTY.with(Atom::clone)
    }

    /// The interned content.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0.bytes
    }

    /// Content length in bytes.
    pub fn len(&self) -> usize {
        self.0.bytes.len()
    }

    /// True for the empty atom.
    pub fn is_empty(&self) -> bool {
        self.0.bytes.is_empty()
    }
}

impl PartialEq for Atom {
    fn eq(&self, other: &Atom) -> bool {
        // Interning guarantees equal content shares one allocation.
        Rc::ptr_eq(&self.0, &other.0) || self.0.bytes == other.0.bytes
    }
}

impl Eq for Atom {}

impl Hash for Atom {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.bytes.hash(state);
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0.bytes))
    }
}

impl From<&str> for Atom {
    fn from(s: &str) -> Atom {
        Atom::intern(s.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_content_shares_storage() {
        let a = Atom::intern(b"content-type");
        let b = Atom::intern(b"content-type");
        assert!(Rc::ptr_eq(&a.0, &b.0));
        assert_eq!(a, b);
    }

    #[test]
    fn lowercase_canonicalisation() {
        let a = Atom::intern_lower(b"Content-Type");
        let b = Atom::intern(b"content-type");
        assert_eq!(a, b);
        assert_eq!(a.as_bytes(), b"content-type");
    }

    #[test]
    fn empty_atom_is_shared_sentinel() {
        let a = Atom::empty();
        let b = Atom::intern(b"");
        assert!(Rc::ptr_eq(&a.0, &b.0));
        assert!(a.is_empty());
    }

    #[test]
    fn dead_slots_are_reclaimable() {
        let a = Atom::intern(b"transient-value");
        drop(a);
        // A fresh intern after the only holder dropped must still work and
        // produce the same content.
        let b = Atom::intern(b"transient-value");
        assert_eq!(b.as_bytes(), b"transient-value");
    }
}
