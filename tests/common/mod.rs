#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use anyhow::bail;

use lane_pipeline::collection::{Collection, Document, HasFeatures, MemoryCorpus};
use lane_pipeline::config::ExecutionConfig;
use lane_pipeline::controller::ParallelController;
use lane_pipeline::stage::{Stage, StageContext};

static NEXT_INSTANCE: AtomicUsize = AtomicUsize::new(1);

/// One stage execution observed by a `Recorder`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Visit {
    pub stage: String,
    pub instance: usize,
    pub element_index: usize,
}

/// Shared, append-only log of visits. Clones write to the same log.
#[derive(Clone, Default)]
pub struct VisitLog(Arc<Mutex<Vec<Visit>>>);

impl VisitLog {
    pub fn visits(&self) -> Vec<Visit> {
        self.0.lock().unwrap().clone()
    }

    /// Element indices the stage named `stage` ran on, sorted.
    pub fn elements(&self, stage: &str) -> Vec<usize> {
        let mut elements: Vec<usize> = self
            .visits()
            .into_iter()
            .filter(|v| v.stage == stage)
            .map(|v| v.element_index)
            .collect();
        elements.sort_unstable();
        elements
    }

    /// Distinct stage instances of `stage` that ran at least once.
    pub fn instances(&self, stage: &str) -> BTreeSet<usize> {
        self.visits()
            .into_iter()
            .filter(|v| v.stage == stage)
            .map(|v| v.instance)
            .collect()
    }

    fn push(&self, visit: Visit) {
        self.0.lock().unwrap().push(visit);
    }
}

/// Records every execution and marks the element with `<name>=done`.
pub struct Recorder {
    name: String,
    instance: usize,
    log: VisitLog,
    delay: Option<Duration>,
}

impl Recorder {
    pub fn new(name: &str, log: &VisitLog) -> Self {
        Self {
            name: name.to_string(),
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::SeqCst),
            log: log.clone(),
            delay: None,
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn boxed(self) -> Box<dyn Stage<Document>> {
        Box::new(self)
    }
}

impl Stage<Document> for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&mut self, ctx: &StageContext<'_, Document>) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        ctx.element.set_feature(&self.name, "done");
        self.log.push(Visit {
            stage: self.name.clone(),
            instance: self.instance,
            element_index: ctx.element_index,
        });
        Ok(())
    }

    fn duplicate(&self) -> anyhow::Result<Box<dyn Stage<Document>>> {
        Ok(Box::new(Recorder {
            name: self.name.clone(),
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::SeqCst),
            log: self.log.clone(),
            delay: self.delay,
        }))
    }
}

/// Fails on one element index, succeeds everywhere else.
pub struct FailOn {
    name: String,
    element_index: usize,
}

impl FailOn {
    pub fn boxed(name: &str, element_index: usize) -> Box<dyn Stage<Document>> {
        Box::new(FailOn {
            name: name.to_string(),
            element_index,
        })
    }
}

impl Stage<Document> for FailOn {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&mut self, ctx: &StageContext<'_, Document>) -> anyhow::Result<()> {
        if ctx.element_index == self.element_index {
            bail!("{} refuses element {}", self.name, ctx.element_index);
        }
        Ok(())
    }

    fn duplicate(&self) -> anyhow::Result<Box<dyn Stage<Document>>> {
        Ok(FailOn::boxed(&self.name, self.element_index))
    }
}

/// Panics on one element index.
pub struct PanicOn {
    element_index: usize,
}

impl PanicOn {
    pub fn boxed(element_index: usize) -> Box<dyn Stage<Document>> {
        Box::new(PanicOn { element_index })
    }
}

impl Stage<Document> for PanicOn {
    fn name(&self) -> &str {
        "panic_on"
    }

    fn execute(&mut self, ctx: &StageContext<'_, Document>) -> anyhow::Result<()> {
        if ctx.element_index == self.element_index {
            panic!("boom on element {}", ctx.element_index);
        }
        Ok(())
    }

    fn duplicate(&self) -> anyhow::Result<Box<dyn Stage<Document>>> {
        Ok(PanicOn::boxed(self.element_index))
    }
}

/// Counts how many lanes hold an element at once. Every stage of a lane is
/// bound while an element walks it, so bind/unbind bracket one lane checkout.
#[derive(Clone, Default)]
pub struct LaneProbe {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl LaneProbe {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn boxed(&self) -> Box<dyn Stage<Document>> {
        Box::new(self.clone())
    }
}

impl Stage<Document> for LaneProbe {
    fn name(&self) -> &str {
        "lane_probe"
    }

    fn bind(&mut self, _element: &Arc<Document>) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn unbind(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn execute(&mut self, _ctx: &StageContext<'_, Document>) -> anyhow::Result<()> {
        std::thread::sleep(Duration::from_millis(3));
        Ok(())
    }

    fn duplicate(&self) -> anyhow::Result<Box<dyn Stage<Document>>> {
        Ok(self.boxed())
    }
}

/// Blocks until its cancellation token fires, then returns. Gives up with an
/// error after five seconds so a broken interrupt cannot hang the test run.
#[derive(Clone, Default)]
pub struct WaitForCancel {
    started: Arc<AtomicUsize>,
}

impl WaitForCancel {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn boxed(&self) -> Box<dyn Stage<Document>> {
        Box::new(self.clone())
    }
}

impl Stage<Document> for WaitForCancel {
    fn name(&self) -> &str {
        "wait_for_cancel"
    }

    fn execute(&mut self, ctx: &StageContext<'_, Document>) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !ctx.cancel.is_cancelled() {
            if Instant::now() > deadline {
                bail!("never cancelled");
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }

    fn duplicate(&self) -> anyhow::Result<Box<dyn Stage<Document>>> {
        Ok(self.boxed())
    }
}

/// Counts `cleanup()` calls across all copies; `duplicate()` fails once
/// `allowed_duplicates` copies have been made.
#[derive(Clone)]
pub struct Fragile {
    duplicates: Arc<AtomicUsize>,
    cleanups: Arc<AtomicUsize>,
    allowed_duplicates: usize,
}

impl Fragile {
    pub fn new(allowed_duplicates: usize) -> Self {
        Self {
            duplicates: Arc::default(),
            cleanups: Arc::default(),
            allowed_duplicates,
        }
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates.load(Ordering::SeqCst)
    }

    pub fn boxed(&self) -> Box<dyn Stage<Document>> {
        Box::new(self.clone())
    }
}

impl Stage<Document> for Fragile {
    fn name(&self) -> &str {
        "fragile"
    }

    fn execute(&mut self, _ctx: &StageContext<'_, Document>) -> anyhow::Result<()> {
        Ok(())
    }

    fn duplicate(&self) -> anyhow::Result<Box<dyn Stage<Document>>> {
        if self.duplicates.load(Ordering::SeqCst) >= self.allowed_duplicates {
            bail!("out of copies");
        }
        self.duplicates.fetch_add(1, Ordering::SeqCst);
        Ok(self.boxed())
    }

    fn cleanup(&mut self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// How `FaultyCorpus` misbehaves on its faulty index.
#[derive(Clone, Copy, Debug)]
pub enum Fault {
    Error,
    Panic,
}

/// A `MemoryCorpus` that can fail `get` on one index. Records the thread of
/// every `get` call.
pub struct FaultyCorpus {
    inner: MemoryCorpus,
    fault: Option<(usize, Fault)>,
    loader_threads: Mutex<Vec<ThreadId>>,
}

impl FaultyCorpus {
    pub fn new(documents: usize) -> Self {
        Self {
            inner: MemoryCorpus::synthetic(documents),
            fault: None,
            loader_threads: Mutex::default(),
        }
    }

    pub fn failing_at(mut self, index: usize, fault: Fault) -> Self {
        self.fault = Some((index, fault));
        self
    }

    pub fn inner(&self) -> &MemoryCorpus {
        &self.inner
    }

    pub fn loader_threads(&self) -> Vec<ThreadId> {
        self.loader_threads.lock().unwrap().clone()
    }
}

impl Collection for FaultyCorpus {
    type Element = Document;

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn is_loaded(&self, index: usize) -> bool {
        self.inner.is_loaded(index)
    }

    fn get(&self, index: usize) -> anyhow::Result<Arc<Document>> {
        self.loader_threads.lock().unwrap().push(std::thread::current().id());
        match self.fault {
            Some((at, Fault::Error)) if at == index => bail!("storage unreadable at {}", index),
            Some((at, Fault::Panic)) if at == index => panic!("storage exploded at {}", index),
            _ => self.inner.get(index),
        }
    }

    fn index_of(&self, element: &Document) -> Option<usize> {
        self.inner.index_of(element)
    }

    fn unload(&self, element: &Arc<Document>) -> anyhow::Result<()> {
        self.inner.unload(element)
    }
}

pub fn execution(parallelism: usize, fail_fast: bool) -> ExecutionConfig {
    ExecutionConfig {
        parallelism,
        fail_fast,
        ..ExecutionConfig::default()
    }
}

/// A controller over `corpus` with no stages yet.
pub fn controller(
    corpus: &Arc<MemoryCorpus>,
    parallelism: usize,
    fail_fast: bool,
) -> ParallelController<MemoryCorpus> {
    let mut controller = ParallelController::new(execution(parallelism, fail_fast));
    controller.set_collection(Arc::clone(corpus));
    controller
}

/// Loads and unloads must pair up: same multiset of indices.
pub fn assert_balanced(corpus: &MemoryCorpus) {
    let mut loads = corpus.loads();
    let mut unloads = corpus.unloads();
    loads.sort_unstable();
    unloads.sort_unstable();
    assert_eq!(loads, unloads, "every load needs exactly one unload");
    assert_eq!(corpus.resident_count(), 0, "no document may stay resident");
}
