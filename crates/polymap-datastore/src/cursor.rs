use std::fmt;

use crate::error::DatastoreResult;

type Source<T> = Box<dyn Iterator<Item = DatastoreResult<T>>>;
type CloseHook = Box<dyn FnOnce()>;

/// A lazy, finite sequence of backend results bound to a cursor.
///
/// The cursor is released exactly once: when the sequence is exhausted,
/// when it yields an error, when [`close`](Self::close) is called, or when
/// it is dropped. After release the iterator is fused and only yields
/// `None`. Re-reading requires asking the session again.
pub struct ResultIter<T> {
    source: Option<Source<T>>,
    on_close: Option<CloseHook>,
}

impl<T: 'static> ResultIter<T> {
    pub fn new(source: impl Iterator<Item = DatastoreResult<T>> + 'static) -> Self {
        Self {
            source: Some(Box::new(source)),
            on_close: None,
        }
    }

    /// Build a sequence that runs `on_close` when its cursor is released.
    pub fn with_close(
        source: impl Iterator<Item = DatastoreResult<T>> + 'static,
        on_close: impl FnOnce() + 'static,
    ) -> Self {
        Self {
            source: Some(Box::new(source)),
            on_close: Some(Box::new(on_close)),
        }
    }

    pub fn from_vec(items: Vec<T>) -> Self {
        Self::new(items.into_iter().map(Ok))
    }

    /// Transform each item, keeping the same cursor.
    pub fn map<U: 'static>(mut self, mut f: impl FnMut(T) -> U + 'static) -> ResultIter<U> {
        let source = self.source.take();
        let on_close = self.on_close.take();
        ResultIter {
            source: source.map(|s| Box::new(s.map(move |item| item.map(&mut f))) as Source<U>),
            on_close,
        }
    }
}

impl<T> ResultIter<T> {
    /// Release the cursor. Idempotent.
    pub fn close(&mut self) {
        self.source = None;
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }

    /// Returns `true` once the cursor has been released.
    pub fn is_closed(&self) -> bool {
        self.source.is_none()
    }
}

impl<T> Iterator for ResultIter<T> {
    type Item = DatastoreResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.source.as_mut()?.next();
        match next {
            Some(Ok(item)) => Some(Ok(item)),
            Some(Err(e)) => {
                self.close();
                Some(Err(e))
            }
            None => {
                self.close();
                None
            }
        }
    }
}

impl<T> Drop for ResultIter<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> fmt::Debug for ResultIter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultIter")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatastoreError;
    use std::cell::Cell;
    use std::rc::Rc;

    fn counting(items: Vec<DatastoreResult<u32>>) -> (ResultIter<u32>, Rc<Cell<u32>>) {
        let released = Rc::new(Cell::new(0));
        let hook = released.clone();
        let iter = ResultIter::with_close(items.into_iter(), move || hook.set(hook.get() + 1));
        (iter, released)
    }

    #[test]
    fn releases_on_exhaustion() {
        let (iter, released) = counting(vec![Ok(1), Ok(2)]);
        let items: Vec<_> = iter.map(|x| x * 10).collect::<Result<_, _>>().unwrap();
        assert_eq!(items, vec![10, 20]);
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn releases_on_error_and_fuses() {
        let (mut iter, released) =
            counting(vec![Ok(1), Err(DatastoreError::Io("boom".into())), Ok(3)]);
        assert_eq!(iter.next(), Some(Ok(1)));
        assert!(matches!(iter.next(), Some(Err(DatastoreError::Io(_)))));
        assert_eq!(released.get(), 1);
        assert_eq!(iter.next(), None);
        drop(iter);
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn releases_on_early_drop() {
        let (mut iter, released) = counting(vec![Ok(1), Ok(2), Ok(3)]);
        assert_eq!(iter.next(), Some(Ok(1)));
        assert_eq!(released.get(), 0);
        drop(iter);
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn close_is_idempotent() {
        let (mut iter, released) = counting(vec![Ok(1)]);
        iter.close();
        iter.close();
        assert!(iter.is_closed());
        assert_eq!(iter.next(), None);
        assert_eq!(released.get(), 1);
    }
}
