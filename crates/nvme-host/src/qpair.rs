//! Submission/completion queue pair engine.
//!
//! A queue pair owns its rings, a fixed array of trackers indexed by command
//! identifier, and a request pool. All ring state sits behind one mutex;
//! completion callbacks are collected while it is held and invoked after it
//! is dropped, so a callback may submit new work on the same queue pair.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::command::{admin_opcode, Command, Completion, Status, COMMAND_SIZE, COMPLETION_SIZE};
use crate::platform::{DmaMemory, DmaRegion, Mmio};
use crate::prp::{self, BuildError};
use crate::regs;
use crate::request::{CompletionFn, Payload, PooledRequest, Request, RequestId, RequestPool};
use crate::{Error, Result};

/// Controller-wide state every queue pair needs.
pub(crate) struct QueueContext {
    pub mem: Arc<dyn DmaMemory>,
    pub regs: Arc<dyn Mmio>,
    pub page_size: u64,
    pub doorbell_stride: u64,
    pub max_retries: u32,
    /// Scattered payloads use native SGL descriptors.
    pub sgl_supported: AtomicBool,
    pub enabled_io_queues: AtomicUsize,
}

/// Backing store of a submission ring.
#[derive(Clone)]
pub(crate) enum SqRing {
    Host(DmaRegion),
    /// Ring inside the controller memory buffer, written through the BAR.
    Cmb {
        window: Arc<dyn Mmio>,
        offset: u64,
        bus: u64,
    },
}

impl SqRing {
    fn bus(&self) -> u64 {
        match self {
            SqRing::Host(region) => region.bus,
            SqRing::Cmb { bus, .. } => *bus,
        }
    }
}

struct Tracker {
    req: Option<RequestId>,
}

struct QpairState {
    sq: SqRing,
    cq: DmaRegion,
    /// One pointer-list page per tracker.
    lists: DmaRegion,
    sq_tail: u16,
    cq_head: u16,
    phase: bool,
    trackers: Vec<Tracker>,
    free: Vec<u16>,
    queued: VecDeque<RequestId>,
    pool: RequestPool,
    enabled: bool,
    failed: bool,
}

type Done = (CompletionFn, Completion);

fn run_callbacks(done: Vec<Done>) {
    for (cb, cpl) in done {
        cb(&cpl);
    }
}

/// One submission ring paired with one completion ring.
pub struct QueuePair {
    id: u16,
    entries: u16,
    ctx: Arc<QueueContext>,
    sq_doorbell: u64,
    cq_doorbell: u64,
    state: Mutex<QpairState>,
}

impl QueuePair {
    /// Allocates rings and tracker lists. The pair starts disabled.
    pub(crate) fn new(
        id: u16,
        entries: u16,
        requests: usize,
        ctx: Arc<QueueContext>,
        cmb_sq: Option<SqRing>,
    ) -> Result<Self> {
        if entries < 2 {
            return Err(Error::InvalidArgument("queue needs at least two entries"));
        }
        let page = ctx.page_size as usize;
        let alloc = |len: usize| {
            ctx.mem
                .alloc(len, page)
                .ok_or(Error::DmaAlloc { len })
        };

        let num_trackers = entries as usize - 1;
        let sq = match cmb_sq {
            Some(ring) => ring,
            None => SqRing::Host(alloc(entries as usize * COMMAND_SIZE)?),
        };
        let cq = alloc(entries as usize * COMPLETION_SIZE)?;
        let lists = alloc(num_trackers * page)?;

        let state = QpairState {
            sq,
            cq,
            lists,
            sq_tail: 0,
            cq_head: 0,
            phase: true,
            trackers: (0..num_trackers).map(|_| Tracker { req: None }).collect(),
            free: (0..num_trackers as u16).rev().collect(),
            queued: VecDeque::new(),
            pool: RequestPool::new(requests),
            enabled: false,
            failed: false,
        };
        let qp = Self {
            id,
            entries,
            sq_doorbell: regs::sq_tail_doorbell(id, ctx.doorbell_stride),
            cq_doorbell: regs::cq_head_doorbell(id, ctx.doorbell_stride),
            ctx,
            state: Mutex::new(state),
        };
        qp.reinit();
        Ok(qp)
    }

    fn lock(&self) -> MutexGuard<'_, QpairState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn entries(&self) -> u16 {
        self.entries
    }

    pub fn num_trackers(&self) -> usize {
        self.entries as usize - 1
    }

    /// Size of the request pool backing this pair.
    pub(crate) fn request_capacity(&self) -> usize {
        self.lock().pool.capacity()
    }

    pub fn outstanding(&self) -> usize {
        self.lock().trackers.iter().filter(|t| t.req.is_some()).count()
    }

    pub fn free_trackers(&self) -> usize {
        self.lock().free.len()
    }

    /// Requests waiting for a tracker or for the pair to be enabled.
    pub fn queued(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn is_failed(&self) -> bool {
        self.lock().failed
    }

    pub(crate) fn memory(&self) -> &Arc<dyn DmaMemory> {
        &self.ctx.mem
    }

    pub(crate) fn page_size(&self) -> u64 {
        self.ctx.page_size
    }

    pub(crate) fn sq_bus(&self) -> u64 {
        self.lock().sq.bus()
    }

    pub(crate) fn cq_bus(&self) -> u64 {
        self.lock().cq.bus
    }

    /// Hands `req` to the queue pair. Completion is reported through its
    /// callback from a later [`QueuePair::poll`].
    pub fn submit(&self, req: Request) -> Result<()> {
        let mut done = Vec::new();
        {
            let mut st = self.lock();
            if st.failed {
                return Err(Error::ControllerFailed);
            }
            let ids = st.pool.insert(req)?;
            for id in ids {
                self.submit_leaf(&mut st, id, &mut done);
            }
        }
        run_callbacks(done);
        Ok(())
    }

    /// Processes up to `max` new completions (0 = as many as allowed) and
    /// returns how many ring entries were consumed.
    pub fn poll(&self, max: u32) -> usize {
        let mut done = Vec::new();
        let n = {
            let mut st = self.lock();
            self.process_completions(&mut st, max, &mut done)
        };
        run_callbacks(done);
        n
    }

    fn submit_leaf(&self, st: &mut QpairState, id: RequestId, done: &mut Vec<Done>) {
        if !st.enabled {
            st.queued.push_back(id);
            return;
        }
        let Some(cid) = st.free.pop() else {
            st.queued.push_back(id);
            return;
        };
        st.trackers[cid as usize].req = Some(id);

        let page = self.ctx.page_size;
        let list = DmaRegion {
            vaddr: st.lists.vaddr + cid as u64 * page,
            bus: st.lists.bus + cid as u64 * page,
            len: page as usize,
        };
        let req = st.pool.get_mut(id);
        req.cmd.cid = cid;
        if let Err(err) = self.build_payload(req, &list) {
            tracing::warn!(qid = self.id, cid, error = ?err, "payload translation failed");
            let cpl = Completion::synthesized(self.id, cid, Status::invalid_field());
            self.retire(st, cid, &cpl, done);
            return;
        }
        let cmd = req.cmd;
        self.ring(st, &cmd);
    }

    fn build_payload(&self, req: &mut PooledRequest, list: &DmaRegion) -> std::result::Result<(), BuildError> {
        let Some(payload) = req.payload.clone() else {
            return Ok(());
        };
        if req.payload_size == 0 {
            return Ok(());
        }
        let mem = self.ctx.mem.as_ref();
        let page = self.ctx.page_size;
        match payload {
            Payload::Contiguous(vaddr) => prp::build_contiguous_prp(
                &mut req.cmd,
                mem,
                vaddr + req.payload_offset as u64,
                req.payload_size,
                page,
                list,
            ),
            Payload::Scattered(sgl) => {
                let mut sgl = sgl.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if self.ctx.sgl_supported.load(Ordering::Acquire) {
                    prp::build_sgl(
                        &mut req.cmd,
                        mem,
                        &mut *sgl,
                        req.payload_offset,
                        req.payload_size,
                        list,
                    )
                } else {
                    prp::build_scattered_prp(
                        &mut req.cmd,
                        mem,
                        &mut *sgl,
                        req.payload_offset,
                        req.payload_size,
                        page,
                        list,
                    )
                }
            }
        }
        .map(|_| ())
    }

    /// Copies `cmd` into the next ring slot and rings the doorbell.
    fn ring(&self, st: &mut QpairState, cmd: &Command) {
        let bytes = cmd.to_bytes();
        let slot = st.sq_tail as u64 * COMMAND_SIZE as u64;
        match &st.sq {
            SqRing::Host(region) => self.ctx.mem.write(region.bus + slot, &bytes),
            SqRing::Cmb { window, offset, .. } => window.write_bytes(offset + slot, &bytes),
        }
        st.sq_tail = (st.sq_tail + 1) % self.entries;
        fence(Ordering::SeqCst);
        self.ctx.regs.write32(self.sq_doorbell, st.sq_tail as u32);
    }

    fn process_completions(&self, st: &mut QpairState, max: u32, done: &mut Vec<Done>) -> usize {
        if !st.enabled {
            return 0;
        }
        let cap = self.entries as u32 - 1;
        let limit = if max == 0 || max > cap { cap } else { max };

        let mut n = 0;
        while n < limit {
            let mut raw = [0u8; COMPLETION_SIZE];
            let addr = st.cq.bus + st.cq_head as u64 * COMPLETION_SIZE as u64;
            self.ctx.mem.read(addr, &mut raw);
            let cpl = Completion::from_bytes(&raw);
            if cpl.phase != st.phase {
                break;
            }
            fence(Ordering::Acquire);

            st.cq_head += 1;
            if st.cq_head == self.entries {
                st.cq_head = 0;
                st.phase = !st.phase;
            }
            n += 1;
            self.handle_completion(st, &cpl, done);
        }

        if n > 0 {
            self.ctx.regs.write32(self.cq_doorbell, st.cq_head as u32);
        }
        if !st.queued.is_empty() {
            self.drain_queued(st, done);
        }
        n as usize
    }

    fn handle_completion(&self, st: &mut QpairState, cpl: &Completion, done: &mut Vec<Done>) {
        let cid = cpl.cid;
        let Some(id) = st.trackers.get(cid as usize).and_then(|t| t.req) else {
            tracing::warn!(qid = self.id, cid, "completion for inactive tracker");
            return;
        };

        if cpl.status.is_error() {
            let req = st.pool.get_mut(id);
            if cpl.status.is_retryable() && req.retries < self.ctx.max_retries {
                req.retries += 1;
                tracing::warn!(
                    qid = self.id,
                    cid,
                    opc = req.cmd.opc,
                    status = %cpl.status,
                    retry = req.retries,
                    "resubmitting command"
                );
                let cmd = req.cmd;
                self.ring(st, &cmd);
                return;
            }
            tracing::warn!(
                qid = self.id,
                cid,
                opc = req.cmd.opc,
                status = %cpl.status,
                "command failed"
            );
        }
        self.retire(st, cid, cpl, done);
    }

    /// Frees the tracker and retires its request.
    fn retire(&self, st: &mut QpairState, cid: u16, cpl: &Completion, done: &mut Vec<Done>) {
        let Some(id) = st.trackers[cid as usize].req.take() else {
            return;
        };
        st.free.push(cid);
        if let Some(cb) = st.pool.complete(id, cpl) {
            done.push(cb);
        }
    }

    fn drain_queued(&self, st: &mut QpairState, done: &mut Vec<Done>) {
        while st.enabled && !st.free.is_empty() {
            let Some(id) = st.queued.pop_front() else {
                break;
            };
            self.submit_leaf(st, id, done);
        }
    }

    fn abort_queued(&self, st: &mut QpairState, status: Status, done: &mut Vec<Done>) {
        while let Some(id) = st.queued.pop_front() {
            let cpl = Completion::synthesized(self.id, 0, status);
            if let Some(cb) = st.pool.complete(id, &cpl) {
                done.push(cb);
            }
        }
    }

    fn abort_outstanding(
        &self,
        st: &mut QpairState,
        status_for: impl Fn(&PooledRequest) -> Status,
        done: &mut Vec<Done>,
    ) {
        for cid in 0..st.trackers.len() as u16 {
            let Some(id) = st.trackers[cid as usize].req else {
                continue;
            };
            let status = status_for(st.pool.get(id));
            let cpl = Completion::synthesized(self.id, cid, status);
            self.retire(st, cid, &cpl, done);
        }
    }

    /// Marks the pair active. Leftover work from before a reset is aborted:
    /// on the admin pair, stale trackers (asynchronous event requests complete
    /// as "aborted: SQ deletion" so they are not reposted); on an I/O pair,
    /// stale trackers and everything queued while disabled.
    pub(crate) fn enable(&self) {
        let mut done = Vec::new();
        {
            let mut st = self.lock();
            if st.failed {
                return;
            }
            let was_enabled = std::mem::replace(&mut st.enabled, true);
            if self.id == 0 {
                self.abort_outstanding(
                    &mut st,
                    |req| {
                        if req.cmd.opc == admin_opcode::ASYNC_EVENT_REQUEST {
                            Status::aborted_sq_deletion()
                        } else {
                            Status::aborted_by_request()
                        }
                    },
                    &mut done,
                );
                self.drain_queued(&mut st, &mut done);
            } else {
                if !was_enabled {
                    self.ctx.enabled_io_queues.fetch_add(1, Ordering::AcqRel);
                }
                self.abort_outstanding(&mut st, |_| Status::aborted_by_request(), &mut done);
                self.abort_queued(&mut st, Status::aborted_by_request(), &mut done);
            }
        }
        tracing::debug!(qid = self.id, aborted = done.len(), "queue pair enabled");
        run_callbacks(done);
    }

    /// Stops completion processing; new submissions are queued.
    pub(crate) fn disable(&self) {
        let mut st = self.lock();
        let was_enabled = std::mem::replace(&mut st.enabled, false);
        if self.id != 0 && was_enabled {
            self.ctx.enabled_io_queues.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Completes every outstanding and queued request with "aborted by
    /// request" and rejects further submissions.
    pub(crate) fn fail(&self) {
        self.abort_all(true);
    }

    /// Disables the pair and aborts its work, as when its hardware queues are
    /// deleted.
    pub(crate) fn abort_all(&self, fail: bool) {
        let mut done = Vec::new();
        {
            let mut st = self.lock();
            st.failed |= fail;
            let was_enabled = std::mem::replace(&mut st.enabled, false);
            if self.id != 0 && was_enabled {
                self.ctx.enabled_io_queues.fetch_sub(1, Ordering::AcqRel);
            }
            self.abort_outstanding(&mut st, |_| Status::aborted_by_request(), &mut done);
            self.abort_queued(&mut st, Status::aborted_by_request(), &mut done);
        }
        if fail && !done.is_empty() {
            tracing::warn!(qid = self.id, aborted = done.len(), "queue pair failed");
        }
        run_callbacks(done);
    }

    /// Resets ring indices and clears both rings, as after queue (re)creation.
    pub(crate) fn reinit(&self) {
        let mut st = self.lock();
        st.sq_tail = 0;
        st.cq_head = 0;
        st.phase = true;
        self.ctx.mem.zero(&st.cq);
        if let SqRing::Host(region) = &st.sq {
            self.ctx.mem.zero(region);
        }
    }
}

impl fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePair")
            .field("id", &self.id)
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let SqRing::Host(region) = st.sq {
            self.ctx.mem.free(region);
        }
        self.ctx.mem.free(st.cq);
        self.ctx.mem.free(st.lists);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{generic_status, nvm_opcode};
    use crate::testing::SparseMemory;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct DoorbellLog(Mutex<Vec<(u64, u32)>>);

    impl Mmio for DoorbellLog {
        fn read32(&self, _offset: u64) -> u32 {
            0
        }

        fn write32(&self, offset: u64, value: u32) {
            self.0.lock().unwrap().push((offset, value));
        }
    }

    struct Harness {
        mem: Arc<SparseMemory>,
        regs: Arc<DoorbellLog>,
        qp: QueuePair,
        device_tail: u16,
        device_phase: bool,
    }

    impl Harness {
        fn new(entries: u16) -> Self {
            let mem = Arc::new(SparseMemory::new());
            let regs = Arc::new(DoorbellLog::default());
            let ctx = Arc::new(QueueContext {
                mem: mem.clone(),
                regs: regs.clone(),
                page_size: 4096,
                doorbell_stride: 4,
                max_retries: 3,
                sgl_supported: AtomicBool::new(false),
                enabled_io_queues: AtomicUsize::new(0),
            });
            let qp = QueuePair::new(1, entries, 16, ctx, None).unwrap();
            qp.enable();
            Self {
                mem,
                regs,
                qp,
                device_tail: 0,
                device_phase: true,
            }
        }

        /// Posts a completion the way the device would.
        fn complete(&mut self, cid: u16, status: Status) {
            let cpl = Completion {
                cid,
                sqid: 1,
                phase: self.device_phase,
                status,
                ..Completion::default()
            };
            let addr = self.qp.cq_bus() + self.device_tail as u64 * 16;
            self.mem.write(addr, &cpl.to_bytes());
            self.device_tail += 1;
            if self.device_tail == self.qp.entries() {
                self.device_tail = 0;
                self.device_phase = !self.device_phase;
            }
        }

        fn sq_doorbells(&self) -> Vec<u32> {
            self.regs
                .0
                .lock()
                .unwrap()
                .iter()
                .filter(|(off, _)| *off == 0x1008)
                .map(|(_, v)| *v)
                .collect()
        }

        fn submitted(&self, slot: u16) -> Command {
            let mut raw = [0u8; 64];
            self.mem.read(self.qp.sq_bus() + slot as u64 * 64, &mut raw);
            Command::from_bytes(&raw)
        }
    }

    fn counting(counter: &Arc<AtomicU32>) -> impl FnOnce(&Completion) + Send + 'static {
        let counter = Arc::clone(counter);
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn poll_without_new_entries_is_a_noop() {
        let h = Harness::new(8);
        let before = h.regs.0.lock().unwrap().len();
        assert_eq!(h.qp.poll(0), 0);
        assert_eq!(h.qp.poll(0), 0);
        assert_eq!(h.regs.0.lock().unwrap().len(), before);
        assert_eq!(h.qp.free_trackers(), 7);
    }

    #[test]
    fn debug_names_queue_without_locking() {
        let h = Harness::new(8);
        let held = h.qp.lock();
        let text = format!("{:?}", h.qp);
        assert!(text.contains("id: 1"));
        assert!(text.contains("entries: 8"));
        drop(held);
        assert_eq!(h.qp.request_capacity(), 16);
    }

    #[test]
    fn submit_writes_slot_and_doorbell() {
        let h = Harness::new(8);
        h.qp.submit(Request::new(Command::new(nvm_opcode::FLUSH).with_nsid(1)))
            .unwrap();
        assert_eq!(h.sq_doorbells(), vec![1]);
        let cmd = h.submitted(0);
        assert_eq!(cmd.opc, nvm_opcode::FLUSH);
        assert_eq!(cmd.nsid, 1);
        assert_eq!(h.qp.outstanding(), 1);
    }

    #[test]
    fn retryable_status_reuses_tracker() {
        let mut h = Harness::new(8);
        let fired = Arc::new(AtomicU32::new(0));
        let status = Arc::new(Mutex::new(None));
        let s = Arc::clone(&status);
        let f = counting(&fired);
        h.qp.submit(
            Request::new(Command::new(nvm_opcode::FLUSH)).on_complete(move |c| {
                *s.lock().unwrap() = Some(c.status);
                f(c);
            }),
        )
        .unwrap();
        let cid = h.submitted(0).cid;

        let not_ready = Status::generic(generic_status::NAMESPACE_NOT_READY, false);
        for attempt in 1..=3u16 {
            h.complete(cid, not_ready);
            assert_eq!(h.qp.poll(0), 1);
            assert_eq!(fired.load(Ordering::SeqCst), 0);
            assert_eq!(h.submitted(attempt).cid, cid);
        }
        assert_eq!(h.sq_doorbells().len(), 4);

        h.complete(cid, not_ready);
        assert_eq!(h.qp.poll(0), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(*status.lock().unwrap(), Some(not_ready));
        assert_eq!(h.qp.free_trackers(), 7);
    }

    #[test]
    fn translation_failure_completes_without_doorbell() {
        let h = Harness::new(8);
        h.mem.poison(0x5000);
        let status = Arc::new(Mutex::new(None));
        let s = Arc::clone(&status);
        h.qp.submit(
            Request::new(Command::new(nvm_opcode::READ))
                .with_payload(Payload::Contiguous(0x5000), 512)
                .on_complete(move |c| *s.lock().unwrap() = Some(c.status)),
        )
        .unwrap();
        assert_eq!(*status.lock().unwrap(), Some(Status::invalid_field()));
        assert!(h.sq_doorbells().is_empty());
        assert_eq!(h.qp.free_trackers(), 7);
    }

    #[test]
    fn exhausted_trackers_queue_until_poll() {
        let mut h = Harness::new(4);
        let fired = Arc::new(AtomicU32::new(0));
        for _ in 0..4 {
            h.qp.submit(Request::new(Command::new(nvm_opcode::FLUSH)).on_complete(counting(&fired)))
                .unwrap();
        }
        assert_eq!(h.qp.outstanding(), 3);
        assert_eq!(h.qp.queued(), 1);
        assert_eq!(h.qp.outstanding() + h.qp.free_trackers(), h.qp.num_trackers());

        let cid = h.submitted(0).cid;
        h.complete(cid, Status::SUCCESS);
        assert_eq!(h.qp.poll(0), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(h.qp.queued(), 0);
        assert_eq!(h.qp.outstanding(), 3);
        assert_eq!(h.submitted(3).cid, cid);
    }

    #[test]
    fn poll_is_bounded_by_entries_minus_one() {
        let mut h = Harness::new(4);
        for _ in 0..3 {
            h.qp.submit(Request::new(Command::new(nvm_opcode::FLUSH))).unwrap();
        }
        for slot in 0..3 {
            let cid = h.submitted(slot).cid;
            h.complete(cid, Status::SUCCESS);
        }
        assert_eq!(h.qp.poll(2), 2);
        assert_eq!(h.qp.poll(0), 1);
        assert_eq!(h.qp.poll(0), 0);
    }

    #[test]
    fn fail_aborts_outstanding_and_queued() {
        let h = Harness::new(2);
        let statuses = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let s = Arc::clone(&statuses);
            h.qp.submit(
                Request::new(Command::new(nvm_opcode::FLUSH))
                    .on_complete(move |c| s.lock().unwrap().push(c.status)),
            )
            .unwrap();
        }
        h.qp.fail();
        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses.len(), 3);
        assert!(statuses.iter().all(|s| *s == Status::aborted_by_request()));
        assert_eq!(
            h.qp.submit(Request::new(Command::new(nvm_opcode::FLUSH))),
            Err(Error::ControllerFailed)
        );
    }

    #[test]
    fn disabled_pair_queues_then_enable_aborts() {
        let h = Harness::new(8);
        h.qp.disable();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&statuses);
        h.qp.submit(
            Request::new(Command::new(nvm_opcode::FLUSH))
                .on_complete(move |c| s.lock().unwrap().push(c.status)),
        )
        .unwrap();
        assert_eq!(h.qp.queued(), 1);
        assert!(h.sq_doorbells().is_empty());

        h.qp.enable();
        assert_eq!(*statuses.lock().unwrap(), vec![Status::aborted_by_request()]);
        assert_eq!(h.qp.queued(), 0);
    }
}
