use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicUsize};

use parking_lot::Condvar;
use worker_pool::{PoolCallbacks, WorkerPool};

use super::*;

struct TestWalker {
    update_kind: UpdateKind,
    crop_rect: Rect,
    level_of_detail: LevelOfDetail,
    start_node: NodeId,
    requested_rect: Rect,
    checksum_valid: Arc<AtomicBool>,
    recalculations: Arc<AtomicUsize>,
}

impl MergeWalker for TestWalker {
    fn collect(&mut self, start_node: NodeId, requested_rect: Rect) {
        self.start_node = start_node;
        self.requested_rect = requested_rect;
    }

    fn recalculate(&mut self, requested_rect: Rect) {
        self.requested_rect = requested_rect;
        self.recalculations.fetch_add(1, Ordering::SeqCst);
        self.checksum_valid.store(true, Ordering::SeqCst);
    }

    fn start_node(&self) -> NodeId {
        self.start_node
    }

    fn requested_rect(&self) -> Rect {
        self.requested_rect
    }

    fn crop_rect(&self) -> Rect {
        self.crop_rect
    }

    fn update_kind(&self) -> UpdateKind {
        self.update_kind
    }

    fn level_of_detail(&self) -> LevelOfDetail {
        self.level_of_detail
    }

    fn access_rect(&self) -> Rect {
        self.requested_rect
    }

    fn change_rect(&self) -> Rect {
        self.requested_rect
    }

    fn is_checksum_valid(&self) -> bool {
        self.checksum_valid.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    fn closed() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn pass(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
    }

    fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }
}

struct TestCompositor {
    merged: Mutex<Vec<Rect>>,
    gate: Option<Arc<Gate>>,
    checksum_valid: Arc<AtomicBool>,
    recalculations: Arc<AtomicUsize>,
}

impl TestCompositor {
    fn new() -> Arc<Self> {
        Self::with_gate(None)
    }

    fn with_gate(gate: Option<Arc<Gate>>) -> Arc<Self> {
        Arc::new(Self {
            merged: Mutex::new(Vec::new()),
            gate,
            checksum_valid: Arc::new(AtomicBool::new(true)),
            recalculations: Arc::new(AtomicUsize::new(0)),
        })
    }
}

impl Compositor for TestCompositor {
    fn create_walker(
        &self,
        update_kind: UpdateKind,
        crop_rect: Rect,
        level_of_detail: LevelOfDetail,
    ) -> Box<dyn MergeWalker> {
        Box::new(TestWalker {
            update_kind,
            crop_rect,
            level_of_detail,
            start_node: NodeId::default(),
            requested_rect: Rect::EMPTY,
            checksum_valid: Arc::clone(&self.checksum_valid),
            recalculations: Arc::clone(&self.recalculations),
        })
    }

    fn merge(&self, walker: &mut dyn MergeWalker) {
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        self.merged.lock().push(walker.requested_rect());
    }
}

struct NoCallbacks;

impl PoolCallbacks for NoCallbacks {
    fn region_merged(&self, _rect: Rect) {}

    fn do_some_useful_work(&self) {}

    fn spare_slot_appeared(&self) {}
}

fn detached_pool(thread_count: usize) -> WorkerPool {
    let callbacks: Weak<dyn PoolCallbacks> = Weak::<NoCallbacks>::new();
    WorkerPool::new(thread_count, callbacks)
}

const CROP: Rect = Rect::new(0, 0, 4096, 4096);
const LOD0: LevelOfDetail = LevelOfDetail::FULL_RESOLUTION;

fn queue_for(compositor: &Arc<TestCompositor>) -> RegionUpdateQueue {
    RegionUpdateQueue::new(compositor.clone(), RegionMergeSettings::default())
}

fn update(queue: &RegionUpdateQueue, node: u64, rect: Rect) {
    queue.add_update(NodeId(node), &[rect], CROP, LOD0, UpdateKind::Update);
}

#[test]
fn adjacent_halves_fold_into_one_walker() {
    let queue = queue_for(&TestCompositor::new());
    update(&queue, 1, Rect::new(0, 0, 50, 100));
    update(&queue, 1, Rect::new(50, 0, 50, 100));
    assert_eq!(queue.pending_requested_rects(), vec![Rect::new(0, 0, 100, 100)]);
}

#[test]
fn stale_walker_does_not_take_new_rects() {
    let compositor = TestCompositor::new();
    let queue = queue_for(&compositor);
    update(&queue, 1, Rect::new(0, 0, 50, 100));
    compositor.checksum_valid.store(false, Ordering::SeqCst);
    update(&queue, 1, Rect::new(50, 0, 50, 100));
    assert_eq!(
        queue.pending_requested_rects(),
        vec![Rect::new(0, 0, 50, 100), Rect::new(50, 0, 50, 100)]
    );
}

#[test]
fn distant_rects_stay_separate() {
    let queue = queue_for(&TestCompositor::new());
    update(&queue, 1, Rect::new(0, 0, 50, 50));
    update(&queue, 1, Rect::new(200, 0, 50, 50));
    assert_eq!(queue.pending_walkers(), 2);
    assert_eq!(queue.size_metric(), 2);
}

#[test]
fn walkers_for_different_targets_never_fold() {
    let queue = queue_for(&TestCompositor::new());
    let rect = Rect::new(0, 0, 64, 64);
    queue.add_update(NodeId(1), &[rect], CROP, LOD0, UpdateKind::Update);
    queue.add_update(NodeId(2), &[rect], CROP, LOD0, UpdateKind::Update);
    queue.add_update(NodeId(1), &[rect], CROP, LOD0, UpdateKind::UpdateNoFilthy);
    queue.add_update(NodeId(1), &[rect], CROP, LevelOfDetail(1), UpdateKind::Update);
    queue.add_update(NodeId(1), &[rect], Rect::new(0, 0, 10, 10), LOD0, UpdateKind::Update);
    assert_eq!(queue.pending_walkers(), 5);
    queue.add_update(NodeId(2), &[rect], CROP, LOD0, UpdateKind::Update);
    assert_eq!(queue.pending_walkers(), 5);
}

#[test]
fn oversized_rect_is_split_into_patches() {
    let queue = queue_for(&TestCompositor::new());
    update(&queue, 1, Rect::new(10, 20, 1100, 600));
    let rects = queue.pending_requested_rects();
    assert_eq!(rects.len(), 6);
    assert!(rects.iter().all(|rect| rect.fits_patch(512, 512)));
    assert_eq!(rects.iter().map(Rect::area).sum::<i64>(), 1100 * 600);
}

#[test]
fn growing_walker_sweeps_in_cheap_neighbours() {
    let queue = queue_for(&TestCompositor::new());
    update(&queue, 1, Rect::new(0, 0, 50, 100));
    update(&queue, 1, Rect::new(100, 0, 50, 100));
    assert_eq!(queue.pending_walkers(), 2);
    update(&queue, 1, Rect::new(50, 0, 50, 100));
    assert_eq!(queue.pending_requested_rects(), vec![Rect::new(0, 0, 150, 100)]);
}

#[test]
fn optimize_uses_the_loose_ratio() {
    let queue = queue_for(&TestCompositor::new());
    update(&queue, 1, Rect::new(0, 0, 100, 100));
    update(&queue, 1, Rect::new(150, 0, 100, 100));
    update(&queue, 2, Rect::new(0, 0, 100, 100));
    assert_eq!(queue.pending_walkers(), 3);
    queue.optimize();
    assert_eq!(
        queue.pending_requested_rects(),
        vec![Rect::new(0, 0, 250, 100), Rect::new(0, 0, 100, 100)]
    );
}

struct NamedJob {
    name: &'static str,
    runs: Arc<AtomicUsize>,
}

impl SpontaneousJob for NamedJob {
    fn run(self: Box<Self>) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        self.name
    }

    fn overrides(&self, other: &dyn SpontaneousJob) -> bool {
        other.name() == self.name
    }
}

#[test]
fn newer_spontaneous_job_replaces_the_one_it_overrides() {
    let queue = queue_for(&TestCompositor::new());
    let runs = Arc::new(AtomicUsize::new(0));
    for name in ["purge-tiles", "purge-tiles", "rebuild-thumbnail"] {
        queue.add_spontaneous_job(Box::new(NamedJob {
            name,
            runs: Arc::clone(&runs),
        }));
    }
    assert_eq!(queue.size_metric(), 2);
    assert!(!queue.is_empty());
}

#[test]
fn intersecting_walker_waits_for_the_running_one() {
    let gate = Gate::closed();
    let compositor = TestCompositor::with_gate(Some(Arc::clone(&gate)));
    let queue = queue_for(&compositor);
    let pool = detached_pool(2);
    update(&queue, 1, Rect::new(0, 0, 100, 100));
    update(&queue, 2, Rect::new(50, 50, 100, 100));

    queue.process_queue(&mut pool.lock());
    assert_eq!(queue.pending_walkers(), 1);

    gate.open();
    pool.wait_for_idle();
    queue.process_queue(&mut pool.lock());
    pool.wait_for_idle();
    assert!(queue.is_empty());
    assert_eq!(compositor.merged.lock().len(), 2);
}

#[test]
fn spontaneous_job_waits_for_an_idle_pool() {
    let gate = Gate::closed();
    let compositor = TestCompositor::with_gate(Some(Arc::clone(&gate)));
    let queue = queue_for(&compositor);
    let pool = detached_pool(2);
    let runs = Arc::new(AtomicUsize::new(0));
    update(&queue, 1, Rect::new(0, 0, 100, 100));
    queue.add_spontaneous_job(Box::new(NamedJob {
        name: "purge-tiles",
        runs: Arc::clone(&runs),
    }));

    queue.process_queue(&mut pool.lock());
    assert_eq!(queue.size_metric(), 1);

    gate.open();
    pool.wait_for_idle();
    queue.process_queue(&mut pool.lock());
    pool.wait_for_idle();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(queue.is_empty());
}

/// Parks the finishing worker between releasing its slot and dropping its
/// level pin.
#[derive(Default)]
struct ParkedCompletion {
    entered: Gate,
    release: Gate,
}

impl PoolCallbacks for ParkedCompletion {
    fn region_merged(&self, _rect: Rect) {}

    fn do_some_useful_work(&self) {
        self.entered.open();
        self.release.pass();
    }

    fn spare_slot_appeared(&self) {}
}

#[test]
fn spontaneous_job_waits_for_a_finishing_slot_to_drop_its_level() {
    let callbacks = Arc::new(ParkedCompletion::default());
    let weak: Weak<dyn PoolCallbacks> = Arc::downgrade(&callbacks) as Weak<ParkedCompletion>;
    let pool = WorkerPool::new(1, weak);
    let queue = queue_for(&TestCompositor::new());
    let runs = Arc::new(AtomicUsize::new(0));
    queue.add_update(
        NodeId(1),
        &[Rect::new(0, 0, 32, 32)],
        CROP,
        LevelOfDetail(2),
        UpdateKind::Update,
    );
    queue.process_queue(&mut pool.lock());
    callbacks.entered.pass();
    assert_eq!(pool.current_level_of_detail(), Some(LevelOfDetail(2)));

    queue.add_spontaneous_job(Box::new(NamedJob {
        name: "purge-tiles",
        runs: Arc::clone(&runs),
    }));
    queue.process_queue(&mut pool.lock());
    assert_eq!(queue.size_metric(), 1);

    callbacks.release.open();
    pool.wait_for_idle();
    queue.process_queue(&mut pool.lock());
    pool.wait_for_idle();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(queue.is_empty());
}

#[test]
fn stale_walker_is_recalculated_before_dispatch() {
    let compositor = TestCompositor::new();
    let queue = queue_for(&compositor);
    let pool = detached_pool(1);
    update(&queue, 1, Rect::new(0, 0, 32, 32));
    compositor.checksum_valid.store(false, Ordering::SeqCst);
    assert_eq!(queue.override_level_of_detail(), None);

    queue.process_queue(&mut pool.lock());
    pool.wait_for_idle();
    assert_eq!(compositor.recalculations.load(Ordering::SeqCst), 1);
    assert_eq!(compositor.merged.lock().as_slice(), &[Rect::new(0, 0, 32, 32)]);
    assert_eq!(queue.override_level_of_detail(), None);
}
