//! The unit of data carried by a store.

/// An element moving through a store: either an ordinary payload or the
/// terminal (end-of-stream) payload.
///
/// The terminal element is the sole termination signal in a pipeline. A
/// module that reads `Last` must emit its own `Last` on every output before
/// it finishes; the run-loop driver in [`crate::module`] owns that
/// propagation. At most one `Last` is ever written to a given store, and it
/// is always the final element observed there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element<E> {
    /// An ordinary payload; more elements will follow.
    Data(E),
    /// The final payload on this store; nothing follows.
    Last(E),
}

impl<E> Element<E> {
    /// Whether this is the terminal element.
    pub fn is_last(&self) -> bool {
        matches!(self, Element::Last(_))
    }

    /// Borrow the payload regardless of the tag.
    pub fn payload(&self) -> &E {
        match self {
            Element::Data(e) | Element::Last(e) => e,
        }
    }

    /// Unwrap the payload, discarding the tag.
    pub fn into_payload(self) -> E {
        match self {
            Element::Data(e) | Element::Last(e) => e,
        }
    }

    /// Re-tag a new payload with this element's tag.
    pub fn retag<U>(&self, payload: U) -> Element<U> {
        match self {
            Element::Data(_) => Element::Data(payload),
            Element::Last(_) => Element::Last(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_accessors() {
        let d = Element::Data(7);
        let l = Element::Last(9);
        assert!(!d.is_last());
        assert!(l.is_last());
        assert_eq!(*d.payload(), 7);
        assert_eq!(l.into_payload(), 9);
    }

    #[test]
    fn retag_preserves_terminality() {
        let l = Element::Last(1u32);
        assert_eq!(l.retag("x"), Element::Last("x"));
        let d = Element::Data(1u32);
        assert_eq!(d.retag("x"), Element::Data("x"));
    }
}
