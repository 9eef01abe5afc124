//! Fingerprints group semantically identical units of work.
//!
//! How a fingerprint is derived (hashing request fields, a cache key, ...) is up to the
//! caller; the core only compares them.

use std::fmt;
use std::sync::Arc;

/// Opaque, cheaply cloneable identifier shared by equivalent units of work.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(Arc<[u8]>);

impl Fingerprint {
    /// Build a fingerprint from raw bytes.
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        Self(Arc::from(bytes.as_ref()))
    }

    /// Raw bytes of the fingerprint.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of bytes in the fingerprint.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the empty fingerprint.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&[u8]> for Fingerprint {
    fn from(value: &[u8]) -> Self {
        Self::new(value)
    }
}

impl From<Vec<u8>> for Fingerprint {
    fn from(value: Vec<u8>) -> Self {
        Self(Arc::from(value))
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// UTF-8 fingerprints print as-is; anything else prints as lowercase hex.
impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => {
                for b in self.0.iter() {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// Anything that can produce a [`Fingerprint`] for itself.
///
/// Equal units of work must produce equal fingerprints.
pub trait Fingerprinter {
    fn fingerprint(&self) -> Fingerprint;
}

impl Fingerprinter for Fingerprint {
    fn fingerprint(&self) -> Fingerprint {
        self.clone()
    }
}

impl<T: Fingerprinter + ?Sized> Fingerprinter for &T {
    fn fingerprint(&self) -> Fingerprint {
        (**self).fingerprint()
    }
}

impl<T: Fingerprinter + ?Sized> Fingerprinter for Arc<T> {
    fn fingerprint(&self) -> Fingerprint {
        (**self).fingerprint()
    }
}
