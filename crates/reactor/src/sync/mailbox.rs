use std::sync::{Arc, Mutex};

/// Anything a mailbox can hold; items are keyed and replaced by id
pub trait MailboxItem: Clone + Send + 'static {
    fn item_id(&self) -> &str;
}

impl MailboxItem for crate::types::SyncOperation {
    fn item_id(&self) -> &str {
        &self.id
    }
}

type Callback<T> = Arc<dyn Fn(&[T]) + Send + Sync>;

struct MailboxInner<T> {
    items: Vec<T>,
    on_added: Vec<Callback<T>>,
    on_removed: Vec<Callback<T>>,
    paused: bool,
    buffered_added: Vec<T>,
    buffered_removed: Vec<T>,
}

/// Ordered, id-keyed list of items with batch change notifications
///
/// `add`/`remove` accept batches and invoke each registered callback once
/// per call, in registration order, over a snapshot taken before dispatch
/// (a callback registered during dispatch sees only later calls). While
/// paused, notifications are buffered and flushed as one batch on resume.
pub struct Mailbox<T: MailboxItem> {
    inner: Mutex<MailboxInner<T>>,
}

impl<T: MailboxItem> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MailboxInner {
                items: Vec::new(),
                on_added: Vec::new(),
                on_removed: Vec::new(),
                paused: false,
                buffered_added: Vec::new(),
                buffered_removed: Vec::new(),
            }),
        }
    }

    pub fn on_added<F>(&self, callback: F)
    where
        F: Fn(&[T]) + Send + Sync + 'static,
    {
        self.inner.lock().unwrap().on_added.push(Arc::new(callback));
    }

    pub fn on_removed<F>(&self, callback: F)
    where
        F: Fn(&[T]) + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .unwrap()
            .on_removed
            .push(Arc::new(callback));
    }

    /// Insert or replace items by id, then notify `on_added` listeners
    /// with the batch
    pub fn add(&self, batch: Vec<T>) {
        if batch.is_empty() {
            return;
        }

        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            for item in &batch {
                match inner
                    .items
                    .iter()
                    .position(|existing| existing.item_id() == item.item_id())
                {
                    Some(pos) => inner.items[pos] = item.clone(),
                    None => inner.items.push(item.clone()),
                }
            }
            if inner.paused {
                inner.buffered_added.extend(batch.iter().cloned());
                return;
            }
            inner.on_added.clone()
        };

        for callback in callbacks {
            callback(&batch);
        }
    }

    /// Remove items by id, returning what was removed, then notify
    /// `on_removed` listeners with the batch
    pub fn remove(&self, ids: &[String]) -> Vec<T> {
        let (removed, callbacks) = {
            let mut inner = self.inner.lock().unwrap();
            let mut removed = Vec::new();
            for id in ids {
                if let Some(pos) = inner.items.iter().position(|item| item.item_id() == id) {
                    removed.push(inner.items.remove(pos));
                }
            }
            if removed.is_empty() {
                return removed;
            }
            if inner.paused {
                inner.buffered_removed.extend(removed.iter().cloned());
                return removed;
            }
            (removed, inner.on_removed.clone())
        };

        for callback in callbacks {
            callback(&removed);
        }
        removed
    }

    /// Buffer notifications until `resume`
    pub fn pause(&self) {
        self.inner.lock().unwrap().paused = true;
    }

    /// Flush buffered notifications as one added and one removed batch
    pub fn resume(&self) {
        let (added, removed, on_added, on_removed) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.paused {
                return;
            }
            inner.paused = false;
            (
                std::mem::take(&mut inner.buffered_added),
                std::mem::take(&mut inner.buffered_removed),
                inner.on_added.clone(),
                inner.on_removed.clone(),
            )
        };

        if !added.is_empty() {
            for callback in &on_added {
                callback(&added);
            }
        }
        if !removed.is_empty() {
            for callback in &on_removed {
                callback(&removed);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.inner
            .lock()
            .unwrap()
            .items
            .iter()
            .find(|item| item.item_id() == id)
            .cloned()
    }

    pub fn items(&self) -> Vec<T> {
        self.inner.lock().unwrap().items.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: MailboxItem> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}
