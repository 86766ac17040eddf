//! The collection an episode walks, and the guarded access the controller
//! uses for it.
//!
//! Loading elements from backing storage is not assumed to be thread-safe, so
//! all load/unload/lookup calls can be serialised through `CollectionAccess`.
//! `ElementLease` remembers whether the element was resident before it was
//! acquired and only unloads elements it loaded itself.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::{anyhow, bail};
use tracing::{debug, warn};

use crate::dispatcher::panic_message;
use crate::error::PipelineError;

/// Elements that carry string features readable by run conditions and stages.
pub trait HasFeatures {
    fn feature(&self, key: &str) -> Option<String>;

    fn set_feature(&self, key: &str, value: &str);
}

/// Trait for the indexed collection an episode processes.
pub trait Collection: Send + Sync + 'static {
    type Element: Send + Sync + 'static;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the element at `index` is currently resident in memory.
    fn is_loaded(&self, index: usize) -> bool;

    /// Return the element at `index`, loading it from storage when needed.
    fn get(&self, index: usize) -> anyhow::Result<Arc<Self::Element>>;

    fn index_of(&self, element: &Self::Element) -> Option<usize>;

    /// Evict a resident element.
    fn unload(&self, element: &Arc<Self::Element>) -> anyhow::Result<()>;
}

// --- Guarded access ---

/// Shared handle on the collection, optionally serialising every call.
pub struct CollectionAccess<C> {
    collection: Arc<C>,
    guard: Option<Mutex<()>>,
}

impl<C: Collection> CollectionAccess<C> {
    pub fn new(collection: Arc<C>, synchronized: bool) -> Self {
        Self {
            collection,
            guard: synchronized.then(|| Mutex::new(())),
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.guard
            .as_ref()
            .map(|guard| guard.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        let _scope = self.lock();
        self.collection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index_of(&self, element: &C::Element) -> Option<usize> {
        let _scope = self.lock();
        self.collection.index_of(element)
    }

    /// Load (or look up) the element at `index`, recording whether it was
    /// already resident. Both steps happen in one critical section.
    ///
    /// A panic inside the collection's `get` is reported as a load failure
    /// for `index`.
    pub fn acquire(self: &Arc<Self>, index: usize) -> Result<ElementLease<C>, PipelineError> {
        let (element, loaded_here) = {
            let _scope = self.lock();
            let loaded_here = !self.collection.is_loaded(index);
            let element = panic::catch_unwind(AssertUnwindSafe(|| self.collection.get(index)))
                .unwrap_or_else(|payload| {
                    Err(anyhow!("collection panicked: {}", panic_message(&payload)))
                })
                .map_err(|source| PipelineError::ElementLoad { index, source })?;
            (element, loaded_here)
        };
        debug!(index, loaded_here, "Acquired element");
        Ok(ElementLease {
            access: Arc::clone(self),
            element,
            index,
            loaded_here,
        })
    }

    fn unload(&self, index: usize, element: &Arc<C::Element>) -> Result<(), PipelineError> {
        let _scope = self.lock();
        self.collection
            .unload(element)
            .map_err(|source| PipelineError::ElementUnload { index, source })
    }
}

/// An element held by one task. Unloads the element on drop if, and only if,
/// this lease loaded it.
#[must_use = "the element is released when ElementLease is dropped"]
pub struct ElementLease<C: Collection> {
    access: Arc<CollectionAccess<C>>,
    element: Arc<C::Element>,
    index: usize,
    loaded_here: bool,
}

impl<C: Collection> ElementLease<C> {
    pub fn element(&self) -> &Arc<C::Element> {
        &self.element
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn loaded_here(&self) -> bool {
        self.loaded_here
    }
}

impl<C: Collection> fmt::Debug for ElementLease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementLease")
            .field("index", &self.index)
            .field("loaded_here", &self.loaded_here)
            .finish()
    }
}

impl<C: Collection> Drop for ElementLease<C> {
    fn drop(&mut self) {
        if !self.loaded_here {
            return;
        }
        match self.access.unload(self.index, &self.element) {
            Ok(()) => debug!(index = self.index, "Unloaded element"),
            Err(e) => warn!("Warning: {}", e),
        }
    }
}

// --- In-memory corpus ---

/// A text element with a thread-safe feature map.
#[derive(Debug)]
pub struct Document {
    name: String,
    content: String,
    features: RwLock<BTreeMap<String, String>>,
}

impl Document {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_features(name, content, BTreeMap::new())
    }

    pub fn with_features(
        name: impl Into<String>,
        content: impl Into<String>,
        features: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            features: RwLock::new(features),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn features(&self) -> BTreeMap<String, String> {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl HasFeatures for Document {
    fn feature(&self, key: &str) -> Option<String> {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set_feature(&self, key: &str, value: &str) {
        self.features
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }
}

/// One load or unload performed by a `MemoryCorpus`, in call order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorpusEvent {
    Loaded(usize),
    Unloaded(usize),
}

#[derive(Clone, Debug)]
struct StoredDocument {
    name: String,
    content: String,
    features: BTreeMap<String, String>,
}

/// In-memory collection of `Document`s with a simulated backing store.
///
/// Documents start evicted. `get` loads a fresh `Document` from the store,
/// `unload` writes its features back and evicts it. Every load and unload is
/// journaled so callers can check access order and balance.
pub struct MemoryCorpus {
    stored: Mutex<Vec<StoredDocument>>,
    resident: Mutex<Vec<Option<Arc<Document>>>>,
    journal: Mutex<Vec<CorpusEvent>>,
}

impl MemoryCorpus {
    /// Build a corpus from `(name, content)` pairs.
    pub fn new<N, T>(documents: impl IntoIterator<Item = (N, T)>) -> Self
    where
        N: Into<String>,
        T: Into<String>,
    {
        let stored: Vec<StoredDocument> = documents
            .into_iter()
            .map(|(name, content)| StoredDocument {
                name: name.into(),
                content: content.into(),
                features: BTreeMap::new(),
            })
            .collect();
        let resident = vec![None; stored.len()];
        Self {
            stored: Mutex::new(stored),
            resident: Mutex::new(resident),
            journal: Mutex::new(Vec::new()),
        }
    }

    /// A corpus of `count` generated documents named `doc-00000`, `doc-00001`, ...
    pub fn synthetic(count: usize) -> Self {
        Self::new((0..count).map(|i| {
            (
                format!("doc-{:05}", i),
                format!("Synthetic document number {}.", i),
            )
        }))
    }

    /// Load the element outside any episode, so an episode sees it as resident.
    pub fn preload(&self, index: usize) -> anyhow::Result<Arc<Document>> {
        self.get(index)
    }

    pub fn journal(&self) -> Vec<CorpusEvent> {
        lock(&self.journal).clone()
    }

    pub fn loads(&self) -> Vec<usize> {
        self.journal()
            .into_iter()
            .filter_map(|event| match event {
                CorpusEvent::Loaded(index) => Some(index),
                CorpusEvent::Unloaded(_) => None,
            })
            .collect()
    }

    pub fn unloads(&self) -> Vec<usize> {
        self.journal()
            .into_iter()
            .filter_map(|event| match event {
                CorpusEvent::Unloaded(index) => Some(index),
                CorpusEvent::Loaded(_) => None,
            })
            .collect()
    }

    pub fn resident_count(&self) -> usize {
        lock(&self.resident).iter().filter(|d| d.is_some()).count()
    }

    /// Features as last written back to storage (or as resident, if loaded).
    pub fn stored_features(&self, index: usize) -> Option<BTreeMap<String, String>> {
        if let Some(Some(document)) = lock(&self.resident).get(index) {
            return Some(document.features());
        }
        lock(&self.stored).get(index).map(|d| d.features.clone())
    }
}

impl Collection for MemoryCorpus {
    type Element = Document;

    fn len(&self) -> usize {
        lock(&self.stored).len()
    }

    fn is_loaded(&self, index: usize) -> bool {
        matches!(lock(&self.resident).get(index), Some(Some(_)))
    }

    fn get(&self, index: usize) -> anyhow::Result<Arc<Document>> {
        let mut resident = lock(&self.resident);
        let Some(slot) = resident.get_mut(index) else {
            bail!("index {} out of range (corpus has {} documents)", index, lock(&self.stored).len());
        };
        if let Some(document) = slot {
            return Ok(Arc::clone(document));
        }

        let stored = lock(&self.stored)[index].clone();
        let document = Arc::new(Document::with_features(
            stored.name,
            stored.content,
            stored.features,
        ));
        *slot = Some(Arc::clone(&document));
        lock(&self.journal).push(CorpusEvent::Loaded(index));
        Ok(document)
    }

    fn index_of(&self, element: &Document) -> Option<usize> {
        lock(&self.resident).iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|document| std::ptr::eq(Arc::as_ptr(document), element))
        })
    }

    fn unload(&self, element: &Arc<Document>) -> anyhow::Result<()> {
        let Some(index) = self.index_of(element) else {
            bail!("document '{}' is not resident", element.name());
        };
        lock(&self.stored)[index].features = element.features();
        lock(&self.resident)[index] = None;
        lock(&self.journal).push(CorpusEvent::Unloaded(index));
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
