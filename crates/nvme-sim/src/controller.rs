//! Simulated NVMe controller: register file, queue processing and an
//! in-memory command set.
//!
//! Commands execute synchronously when their submission queue doorbell is
//! written, so by the time the host's MMIO write returns the completion is
//! already in the completion ring (unless the queue is held).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use nvme_host::{
    admin_opcode, command_specific_status, feature_id, generic_status, log_id, nvm_opcode,
    status_type, Clock, Command, Completion, ControllerConfig, DmaMemory, IdentifyNamespace,
    LbaFormat, Mmio, Psdt, SglDescriptor, SglType, Status, CC_SHN_NONE, CNS_ACTIVE_NAMESPACE_LIST,
    CNS_CONTROLLER, CNS_NAMESPACE, COMMAND_SIZE, COMPLETION_SIZE, DOORBELL_BASE,
    IDENTIFY_DATA_SIZE, OACS_FIRMWARE, OACS_FORMAT_NVM, OACS_NS_MANAGEMENT, ONCS_DSM,
    ONCS_RESERVATIONS, ONCS_WRITE_ZEROES, REG_ACQ, REG_AQA, REG_ASQ, REG_CAP, REG_CC,
    REG_CMBLOC, REG_CMBSZ, REG_CSTS, REG_INTMC, REG_INTMS, REG_VS, SGL_DESCRIPTOR_SIZE,
    SHST_COMPLETE, SHST_NORMAL, SHST_OCCURRING,
};

use crate::config::{NamespaceSpec, SimConfig};
use crate::memory::SimMemory;
use crate::pci::SimPciConfig;
use crate::clock::SimClock;

/// BAR the controller memory buffer is exposed through.
pub const CMB_BAR: u8 = 2;
/// Bus address the controller memory buffer BAR is programmed with.
pub const CMB_ADDRESS: u32 = 0xfe00_0000;

const ALL_NAMESPACES: u32 = 0xffff_ffff;
const DATA_SGL_LENGTH_INVALID: u8 = 0x0f;
const SGL_MAX_SEGMENTS: usize = 16;

const NAMESPACE_ID_UNAVAILABLE: u8 = 0x16;
const NAMESPACE_ALREADY_ATTACHED: u8 = 0x18;
const NAMESPACE_NOT_ATTACHED: u8 = 0x1a;
const CONTROLLER_LIST_INVALID: u8 = 0x1c;

/// Asynchronous event type for notices (namespace attribute changed etc).
pub const AER_TYPE_NOTICE: u8 = 0x2;
pub const AER_NOTICE_NS_ATTRIBUTE: u8 = 0x00;

type CmdResult = Result<u32, Status>;

fn generic(sc: u8) -> Status {
    Status::generic(sc, true)
}

fn specific(sc: u8) -> Status {
    Status::new(status_type::COMMAND_SPECIFIC, sc, true)
}

fn transfer_error() -> Status {
    generic(generic_status::DATA_TRANSFER_ERROR)
}

fn write_ascii_padded(dst: &mut [u8], s: &str) {
    dst.fill(b' ');
    let bytes = s.as_bytes();
    let len = bytes.len().min(dst.len());
    dst[..len].copy_from_slice(&bytes[..len]);
}

/// Controller memory buffer window (the CMB BAR).
pub struct SimCmb {
    bus: u64,
    bytes: Mutex<Vec<u8>>,
}

impl SimCmb {
    fn new(bus: u64, size: usize) -> Self {
        Self {
            bus,
            bytes: Mutex::new(vec![0u8; size]),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, bus: u64, len: usize) -> bool {
        let size = self.lock().len() as u64;
        bus >= self.bus && bus - self.bus + len as u64 <= size
    }

    fn read_bus(&self, bus: u64, buf: &mut [u8]) {
        let off = (bus - self.bus) as usize;
        buf.copy_from_slice(&self.lock()[off..off + buf.len()]);
    }

    fn write_bus(&self, bus: u64, data: &[u8]) {
        let off = (bus - self.bus) as usize;
        self.lock()[off..off + data.len()].copy_from_slice(data);
    }
}

impl Mmio for SimCmb {
    fn read32(&self, offset: u64) -> u32 {
        let bytes = self.lock();
        let off = offset as usize;
        match bytes.get(off..off + 4) {
            Some(word) => u32::from_le_bytes(word.try_into().unwrap()),
            None => 0xffff_ffff,
        }
    }

    fn write32(&self, offset: u64, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) {
        let mut bytes = self.lock();
        let off = offset as usize;
        match bytes.get_mut(off..off + data.len()) {
            Some(dst) => dst.copy_from_slice(data),
            None => tracing::warn!(offset, len = data.len(), "write past end of cmb"),
        }
    }
}

/// Device-side view of bus memory: host DMA memory plus the CMB.
struct Dma {
    mem: Arc<SimMemory>,
    cmb: Option<Arc<SimCmb>>,
}

impl Dma {
    fn cmb_for(&self, bus: u64, len: usize) -> Option<&SimCmb> {
        self.cmb.as_deref().filter(|cmb| cmb.contains(bus, len))
    }

    fn contains(&self, bus: u64, len: usize) -> bool {
        self.cmb_for(bus, len).is_some() || self.mem.contains(bus, len)
    }

    fn read(&self, bus: u64, buf: &mut [u8]) -> Result<(), Status> {
        if let Some(cmb) = self.cmb_for(bus, buf.len()) {
            cmb.read_bus(bus, buf);
            return Ok(());
        }
        if !self.mem.contains(bus, buf.len()) {
            return Err(transfer_error());
        }
        self.mem.read(bus, buf);
        Ok(())
    }

    fn write(&self, bus: u64, data: &[u8]) -> Result<(), Status> {
        if let Some(cmb) = self.cmb_for(bus, data.len()) {
            cmb.write_bus(bus, data);
            return Ok(());
        }
        if !self.mem.contains(bus, data.len()) {
            return Err(transfer_error());
        }
        self.mem.write(bus, data);
        Ok(())
    }

    fn read_u64(&self, bus: u64) -> Result<u64, Status> {
        let mut buf = [0u8; 8];
        self.read(bus, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

struct SubmissionQueue {
    size: u16,
    base: u64,
    head: u16,
    tail: u16,
    cqid: u16,
    priority: u8,
}

struct CompletionQueue {
    size: u16,
    base: u64,
    head: u16,
    tail: u16,
    phase: bool,
    /// Completions that did not fit; posted as the host frees entries.
    backlog: VecDeque<Completion>,
}

impl CompletionQueue {
    fn new(size: u16, base: u64) -> Self {
        Self {
            size,
            base,
            head: 0,
            tail: 0,
            phase: true,
            backlog: VecDeque::new(),
        }
    }

    fn is_full(&self) -> bool {
        (self.tail + 1) % self.size == self.head
    }

    fn write_entry(&mut self, dma: &Dma, mut cpl: Completion) {
        cpl.phase = self.phase;
        let addr = self.base + self.tail as u64 * COMPLETION_SIZE as u64;
        if dma.write(addr, &cpl.to_bytes()).is_err() {
            tracing::warn!(addr, "completion ring outside memory");
            return;
        }
        self.tail = (self.tail + 1) % self.size;
        if self.tail == 0 {
            self.phase = !self.phase;
        }
    }

    fn post(&mut self, dma: &Dma, cpl: Completion) {
        if !self.backlog.is_empty() || self.is_full() {
            self.backlog.push_back(cpl);
            return;
        }
        self.write_entry(dma, cpl);
    }

    fn drain_backlog(&mut self, dma: &Dma) {
        while !self.is_full() {
            let Some(cpl) = self.backlog.pop_front() else {
                break;
            };
            self.write_entry(dma, cpl);
        }
    }
}

struct SimNamespace {
    spec: NamespaceSpec,
    attached: bool,
    /// Written blocks; absent blocks read as zeroes.
    blocks: HashMap<u64, Vec<u8>>,
    deallocated: u64,
    key: Option<u64>,
    holder: Option<u8>,
    generation: u32,
}

impl SimNamespace {
    fn new(spec: NamespaceSpec, attached: bool) -> Self {
        Self {
            spec,
            attached,
            blocks: HashMap::new(),
            deallocated: 0,
            key: None,
            holder: None,
            generation: 0,
        }
    }

    fn identify(&self, nsid: u32, reservations: bool) -> Vec<u8> {
        let mut lbaf = [LbaFormat::default(); 16];
        for (dst, fmt) in lbaf.iter_mut().zip(&self.spec.formats) {
            *dst = *fmt;
        }
        let mut eui64 = [0u8; 8];
        eui64[4..].copy_from_slice(&nsid.to_be_bytes());
        IdentifyNamespace {
            nsze: self.spec.sectors,
            ncap: self.spec.sectors,
            nuse: self.blocks.len() as u64,
            nsfeat: 0,
            nlbaf: self.spec.formats.len().saturating_sub(1) as u8,
            flbas: self.spec.format & 0xf | (self.spec.extended as u8) << 4,
            mc: 0x1,
            dpc: 0,
            dps: self.spec.pi & 0x7,
            nmic: 0,
            rescap: if reservations { 0x7f } else { 0 },
            dlfeat: self.spec.dlfeat,
            nguid: [0; 16],
            eui64,
            lbaf,
        }
        .to_bytes()
    }

    fn check_range(&self, slba: u64, nlb: u64) -> Result<(), Status> {
        match slba.checked_add(nlb) {
            Some(end) if end <= self.spec.sectors => Ok(()),
            _ => Err(generic(generic_status::LBA_OUT_OF_RANGE)),
        }
    }

    fn check_key(&self, key: u64, ignore: bool) -> Result<(), Status> {
        match self.key {
            Some(k) if k == key || ignore => Ok(()),
            _ => Err(generic(generic_status::RESERVATION_CONFLICT)),
        }
    }
}

/// A command as fetched from a submission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggedCommand {
    pub qid: u16,
    pub cmd: Command,
}

struct InjectedError {
    qid: u16,
    opcode: u8,
    status: Status,
}

enum Outcome {
    Done(Status, u32),
    /// Completed later (asynchronous event requests).
    Deferred,
}

impl From<CmdResult> for Outcome {
    fn from(res: CmdResult) -> Self {
        match res {
            Ok(cdw0) => Outcome::Done(Status::SUCCESS, cdw0),
            Err(status) => Outcome::Done(status, 0),
        }
    }
}

struct SimState {
    cc: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    intms: u32,
    enabled: bool,
    ready_at: Option<Duration>,
    /// RDY stays set until this instant after disable.
    busy_until: Option<Duration>,
    shst: u8,
    never_ready: bool,
    ready_delay: Duration,
    enables: usize,
    shutdowns: usize,

    sqs: BTreeMap<u16, SubmissionQueue>,
    cqs: BTreeMap<u16, CompletionQueue>,
    granted: Option<u16>,
    features: HashMap<u8, u32>,

    aers: VecDeque<u16>,
    events: VecDeque<u32>,
    changed_namespaces: Vec<u32>,
    log_pages: HashMap<u8, Vec<u8>>,

    namespaces: Vec<Option<SimNamespace>>,

    firmware: String,
    firmware_slots: Vec<Option<String>>,
    firmware_image: Vec<u8>,
    pending_activation: Option<u8>,

    held_queues: HashSet<u16>,
    held: Vec<(u16, Completion)>,
    injected: VecDeque<InjectedError>,
    log: Vec<LoggedCommand>,
    doorbells: HashMap<u16, u64>,
    flushes: u64,
}

impl SimState {
    fn page_size(&self) -> usize {
        4096 << ControllerConfig::from_raw(self.cc).mps
    }

    fn ready(&self, now: Duration) -> bool {
        if self.enabled {
            self.ready_at.is_some_and(|at| now >= at)
        } else {
            self.busy_until.is_some_and(|until| now < until)
        }
    }

    fn namespace(&mut self, nsid: u32) -> Result<&mut SimNamespace, Status> {
        let idx = (nsid as usize).wrapping_sub(1);
        match self.namespaces.get_mut(idx) {
            Some(Some(ns)) if ns.attached => Ok(ns),
            _ => Err(generic(generic_status::INVALID_NAMESPACE_OR_FORMAT)),
        }
    }

    fn allocated(&mut self, nsid: u32) -> Result<&mut SimNamespace, Status> {
        let idx = (nsid as usize).wrapping_sub(1);
        match self.namespaces.get_mut(idx) {
            Some(Some(ns)) => Ok(ns),
            _ => Err(generic(generic_status::INVALID_NAMESPACE_OR_FORMAT)),
        }
    }

    fn take_injection(&mut self, qid: u16, opcode: u8) -> Option<Status> {
        let pos = self
            .injected
            .iter()
            .position(|e| e.qid == qid && e.opcode == opcode)?;
        self.injected.remove(pos).map(|e| e.status)
    }
}

/// A simulated NVMe controller behind BAR0.
pub struct SimController {
    config: SimConfig,
    clock: Arc<SimClock>,
    pci: Arc<SimPciConfig>,
    dma: Dma,
    state: Mutex<SimState>,
}

impl SimController {
    pub fn new(
        config: SimConfig,
        clock: Arc<SimClock>,
        pci: Arc<SimPciConfig>,
        mem: Arc<SimMemory>,
    ) -> Self {
        let cmb = (config.cmb_size > 0)
            .then(|| Arc::new(SimCmb::new(CMB_ADDRESS as u64, config.cmb_size as usize)));

        let mut namespaces: Vec<Option<SimNamespace>> = (0..config.max_namespaces)
            .map(|_| None)
            .collect();
        for (slot, spec) in namespaces.iter_mut().zip(&config.namespaces) {
            *slot = Some(SimNamespace::new(spec.clone(), true));
        }
        let mut firmware_slots = vec![None; config.firmware_slots.max(1) as usize];
        firmware_slots[0] = Some(config.firmware.clone());

        let (cc, enabled, ready_at) = if config.start_enabled {
            (1, true, Some(Duration::ZERO))
        } else {
            (0, false, None)
        };

        let state = SimState {
            cc,
            aqa: 0,
            asq: 0,
            acq: 0,
            intms: 0,
            enabled,
            ready_at,
            busy_until: None,
            shst: SHST_NORMAL,
            never_ready: config.never_ready,
            ready_delay: config.ready_delay,
            enables: 0,
            shutdowns: 0,
            sqs: BTreeMap::new(),
            cqs: BTreeMap::new(),
            granted: None,
            features: HashMap::new(),
            aers: VecDeque::new(),
            events: VecDeque::new(),
            changed_namespaces: Vec::new(),
            log_pages: HashMap::new(),
            namespaces,
            firmware: config.firmware.clone(),
            firmware_slots,
            firmware_image: Vec::new(),
            pending_activation: None,
            held_queues: HashSet::new(),
            held: Vec::new(),
            injected: VecDeque::new(),
            log: Vec::new(),
            doorbells: HashMap::new(),
            flushes: 0,
        };

        Self {
            config,
            clock,
            pci,
            dma: Dma { mem, cmb },
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn cmb(&self) -> Option<Arc<SimCmb>> {
        self.dma.cmb.clone()
    }

    fn cap(&self) -> u64 {
        let c = &self.config;
        c.mqes as u64
            | 1 << 16
            | (c.ams as u64 & 0x3) << 17
            | (c.timeout_units as u64) << 24
            | (c.dstrd as u64 & 0xf) << 32
            | 1 << 37
            | (c.mpsmin as u64 & 0xf) << 48
            | (c.mpsmax as u64 & 0xf) << 52
            | ((self.dma.cmb.is_some() as u64) << 57)
    }

    fn csts(&self, st: &SimState) -> u32 {
        st.ready(self.clock.now()) as u32 | (st.shst as u32) << 2
    }

    fn write_cc(&self, st: &mut SimState, value: u32) {
        let prev = ControllerConfig::from_raw(st.cc);
        let next = ControllerConfig::from_raw(value);
        st.cc = value;
        if !prev.enable && next.enable {
            self.enable(st);
        } else if prev.enable && !next.enable {
            self.disable(st);
        }

        if next.enable && next.shn != CC_SHN_NONE && prev.shn == CC_SHN_NONE {
            tracing::debug!(shn = next.shn, "shutdown notification");
            st.sqs.retain(|&qid, _| qid == 0);
            st.cqs.retain(|&qid, _| qid == 0);
            st.shutdowns += 1;
            st.shst = if self.config.shutdown_hangs {
                SHST_OCCURRING
            } else {
                SHST_COMPLETE
            };
        }
    }

    fn enable(&self, st: &mut SimState) {
        st.enabled = true;
        st.enables += 1;
        st.busy_until = None;
        st.shst = SHST_NORMAL;
        st.sqs.clear();
        st.cqs.clear();
        st.granted = None;
        st.features.clear();
        st.aers.clear();
        st.events.clear();
        st.held.clear();
        if let Some(slot) = st.pending_activation.take() {
            if let Some(Some(rev)) = st.firmware_slots.get(slot as usize - 1) {
                st.firmware = rev.clone();
            }
        }

        let page = st.page_size() as u64;
        let sq_entries = (st.aqa & 0xfff) as u16 + 1;
        let cq_entries = ((st.aqa >> 16) & 0xfff) as u16 + 1;
        let valid = sq_entries >= 2
            && cq_entries >= 2
            && st.asq != 0
            && st.acq != 0
            && st.asq % page == 0
            && st.acq % page == 0;
        if !valid {
            tracing::warn!(aqa = st.aqa, asq = st.asq, acq = st.acq, "bad admin queue setup");
            st.ready_at = None;
            return;
        }

        st.sqs.insert(
            0,
            SubmissionQueue {
                size: sq_entries,
                base: st.asq,
                head: 0,
                tail: 0,
                cqid: 0,
                priority: 0,
            },
        );
        st.cqs.insert(0, CompletionQueue::new(cq_entries, st.acq));
        st.ready_at = (!st.never_ready).then(|| self.clock.now() + st.ready_delay);
        tracing::debug!(sq_entries, cq_entries, "controller enabled");
    }

    fn disable(&self, st: &mut SimState) {
        let was_ready = st.ready(self.clock.now());
        st.enabled = false;
        st.ready_at = None;
        st.sqs.clear();
        st.cqs.clear();
        st.aers.clear();
        st.held.clear();
        st.shst = SHST_NORMAL;
        st.busy_until = was_ready.then(|| self.clock.now() + st.ready_delay);
        tracing::debug!("controller disabled");
    }

    fn write_doorbell(&self, st: &mut SimState, offset: u64, value: u32) {
        if !st.enabled || !st.ready(self.clock.now()) {
            tracing::warn!(offset, "doorbell write while not ready");
            return;
        }
        let stride = 4u64 << self.config.dstrd;
        let rel = offset - DOORBELL_BASE;
        if rel % stride != 0 {
            return;
        }
        let idx = rel / stride;
        let qid = (idx / 2) as u16;
        let val = value as u16;

        if idx % 2 == 1 {
            let Some(cq) = st.cqs.get_mut(&qid) else {
                tracing::warn!(qid, "head doorbell for missing cq");
                return;
            };
            if val >= cq.size {
                tracing::warn!(qid, head = val, "cq head out of range");
                return;
            }
            cq.head = val;
            cq.drain_backlog(&self.dma);
            return;
        }

        *st.doorbells.entry(qid).or_default() += 1;
        let Some(sq) = st.sqs.get_mut(&qid) else {
            tracing::warn!(qid, "tail doorbell for missing sq");
            return;
        };
        if val >= sq.size {
            tracing::warn!(qid, tail = val, "sq tail out of range");
            return;
        }
        sq.tail = val;
        if self.pci.bus_master() {
            self.process_sq(st, qid);
        }
    }

    fn process_sq(&self, st: &mut SimState, qid: u16) {
        loop {
            let Some(sq) = st.sqs.get_mut(&qid) else {
                return;
            };
            if sq.head == sq.tail {
                return;
            }
            let addr = sq.base + sq.head as u64 * COMMAND_SIZE as u64;
            let mut raw = [0u8; COMMAND_SIZE];
            if self.dma.read(addr, &mut raw).is_err() {
                tracing::warn!(qid, addr, "submission ring outside memory");
                return;
            }
            sq.head = (sq.head + 1) % sq.size;
            let (sqhd, cqid) = (sq.head, sq.cqid);
            let cmd = Command::from_bytes(&raw);
            st.log.push(LoggedCommand { qid, cmd });
            tracing::trace!(qid, opc = cmd.opc, cid = cmd.cid, "command fetched");

            let outcome = match st.take_injection(qid, cmd.opc) {
                Some(status) => Outcome::Done(status, 0),
                None if qid == 0 => self.execute_admin(st, &cmd),
                None => self.execute_io(st, &cmd).into(),
            };
            if let Outcome::Done(status, cdw0) = outcome {
                let cpl = Completion {
                    cdw0,
                    cdw1: 0,
                    sqhd,
                    sqid: qid,
                    cid: cmd.cid,
                    phase: false,
                    status,
                };
                self.complete(st, cqid, cpl);
            }
        }
    }

    fn complete(&self, st: &mut SimState, cqid: u16, cpl: Completion) {
        if st.held_queues.contains(&cpl.sqid) {
            st.held.push((cqid, cpl));
            return;
        }
        match st.cqs.get_mut(&cqid) {
            Some(cq) => cq.post(&self.dma, cpl),
            None => tracing::warn!(cqid, cid = cpl.cid, "completion for missing cq dropped"),
        }
    }

    fn max_transfer(&self) -> usize {
        match self.config.mdts {
            0 => usize::MAX,
            mdts => (4096usize << self.config.mpsmin) << mdts,
        }
    }

    fn data_segments(&self, cmd: &Command, len: usize, page: usize) -> Result<Vec<(u64, usize)>, Status> {
        match cmd.psdt {
            Psdt::Prp => prp_segments(&self.dma, cmd.prp1, cmd.prp2, len, page),
            _ if self.config.sgls & 0x3 == 0 => Err(generic(generic_status::INVALID_FIELD)),
            _ => sgl_segments(&self.dma, cmd, len),
        }
    }

    fn read_data(&self, cmd: &Command, len: usize, page: usize) -> Result<Vec<u8>, Status> {
        let mut out = vec![0u8; len];
        let mut pos = 0;
        for (addr, seg_len) in self.data_segments(cmd, len, page)? {
            self.dma.read(addr, &mut out[pos..pos + seg_len])?;
            pos += seg_len;
        }
        Ok(out)
    }

    fn write_data(&self, cmd: &Command, data: &[u8], page: usize) -> Result<(), Status> {
        let mut pos = 0;
        for (addr, seg_len) in self.data_segments(cmd, data.len(), page)? {
            self.dma.write(addr, &data[pos..pos + seg_len])?;
            pos += seg_len;
        }
        Ok(())
    }

    fn execute_admin(&self, st: &mut SimState, cmd: &Command) -> Outcome {
        let res = match cmd.opc {
            admin_opcode::IDENTIFY => self.cmd_identify(st, cmd),
            admin_opcode::GET_LOG_PAGE => self.cmd_get_log_page(st, cmd),
            admin_opcode::SET_FEATURES => self.cmd_set_features(st, cmd),
            admin_opcode::GET_FEATURES => self.cmd_get_features(st, cmd),
            admin_opcode::CREATE_IO_CQ => self.cmd_create_io_cq(st, cmd),
            admin_opcode::CREATE_IO_SQ => self.cmd_create_io_sq(st, cmd),
            admin_opcode::DELETE_IO_SQ => self.cmd_delete_io_sq(st, cmd),
            admin_opcode::DELETE_IO_CQ => self.cmd_delete_io_cq(st, cmd),
            admin_opcode::ABORT => self.cmd_abort(st, cmd),
            admin_opcode::ASYNC_EVENT_REQUEST => return self.cmd_async_event(st, cmd),
            admin_opcode::NS_MANAGEMENT => self.cmd_ns_management(st, cmd),
            admin_opcode::NS_ATTACHMENT => self.cmd_ns_attachment(st, cmd),
            admin_opcode::FORMAT_NVM => self.cmd_format(st, cmd),
            admin_opcode::FIRMWARE_IMAGE_DOWNLOAD => self.cmd_firmware_download(st, cmd),
            admin_opcode::FIRMWARE_COMMIT => self.cmd_firmware_commit(st, cmd),
            admin_opcode::KEEP_ALIVE => Ok(0),
            opc => {
                tracing::debug!(opc, "unsupported admin opcode");
                Err(generic(generic_status::INVALID_OPCODE))
            }
        };
        res.into()
    }

    fn identify_controller(&self, st: &SimState) -> Vec<u8> {
        let c = &self.config;
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        data[0..2].copy_from_slice(&c.pci_id.vendor.to_le_bytes());
        data[2..4].copy_from_slice(&c.pci_id.subvendor.to_le_bytes());
        write_ascii_padded(&mut data[4..24], &c.serial);
        write_ascii_padded(&mut data[24..64], &c.model);
        write_ascii_padded(&mut data[64..72], &st.firmware);
        data[77] = c.mdts;
        data[78..80].copy_from_slice(&c.cntlid.to_le_bytes());
        data[80..84].copy_from_slice(&c.version.to_le_bytes());
        data[92..96].copy_from_slice(&c.oaes.to_le_bytes());
        data[256..258].copy_from_slice(&c.oacs.to_le_bytes());
        data[258] = 3;
        data[259] = c.aerl;
        data[260] = (c.firmware_slots & 0x7) << 1;
        data[261] = c.lpa;
        data[262] = 63;
        // SQES / CQES: required and maximum entry sizes.
        data[512] = 0x66;
        data[513] = 0x44;
        data[516..520].copy_from_slice(&c.max_namespaces.to_le_bytes());
        data[520..522].copy_from_slice(&c.oncs.to_le_bytes());
        data[525] = c.vwc;
        data[536..540].copy_from_slice(&c.sgls.to_le_bytes());
        data[3072 + 3] = c.stripe_hint;
        data
    }

    fn cmd_identify(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        let cns = (cmd.cdw10 & 0xff) as u8;
        let reservations = self.config.oncs & ONCS_RESERVATIONS != 0;
        let data = match cns {
            CNS_CONTROLLER => self.identify_controller(st),
            CNS_NAMESPACE => {
                if cmd.nsid == 0 || cmd.nsid > self.config.max_namespaces {
                    return Err(generic(generic_status::INVALID_NAMESPACE_OR_FORMAT));
                }
                match &st.namespaces[cmd.nsid as usize - 1] {
                    Some(ns) if ns.attached => ns.identify(cmd.nsid, reservations),
                    _ => vec![0u8; IDENTIFY_DATA_SIZE],
                }
            }
            CNS_ACTIVE_NAMESPACE_LIST => {
                let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
                let ids = st
                    .namespaces
                    .iter()
                    .enumerate()
                    .filter(|(_, ns)| ns.as_ref().is_some_and(|ns| ns.attached))
                    .map(|(i, _)| i as u32 + 1)
                    .filter(|&nsid| nsid > cmd.nsid)
                    .take(IDENTIFY_DATA_SIZE / 4);
                for (i, nsid) in ids.enumerate() {
                    data[i * 4..i * 4 + 4].copy_from_slice(&nsid.to_le_bytes());
                }
                data
            }
            _ => return Err(generic(generic_status::INVALID_FIELD)),
        };
        self.write_data(cmd, &data, st.page_size())?;
        Ok(0)
    }

    fn cmd_get_log_page(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        let lid = (cmd.cdw10 & 0xff) as u8;
        let numd = (cmd.cdw11 & 0xffff) << 16 | cmd.cdw10 >> 16;
        let len = (numd as usize + 1) * 4;

        let mut data = match lid {
            log_id::ERROR => vec![0u8; 64],
            log_id::HEALTH => {
                let mut page = vec![0u8; 512];
                // Composite temperature 313 K, full spare.
                page[1..3].copy_from_slice(&313u16.to_le_bytes());
                page[3] = 100;
                page[4] = 10;
                page
            }
            log_id::FIRMWARE_SLOT => {
                let mut page = vec![0u8; 512];
                let active = st
                    .firmware_slots
                    .iter()
                    .position(|rev| rev.as_deref() == Some(st.firmware.as_str()))
                    .map_or(1, |i| i + 1);
                page[0] = active as u8 | st.pending_activation.unwrap_or(0) << 4;
                for (i, rev) in st.firmware_slots.iter().enumerate() {
                    if let Some(rev) = rev {
                        write_ascii_padded(&mut page[8 + i * 8..16 + i * 8], rev);
                    }
                }
                page
            }
            log_id::CHANGED_NS_LIST => {
                let mut page = vec![0u8; 4096];
                for (i, nsid) in st.changed_namespaces.drain(..).take(1024).enumerate() {
                    page[i * 4..i * 4 + 4].copy_from_slice(&nsid.to_le_bytes());
                }
                page
            }
            log_id::COMMAND_EFFECTS if self.config.lpa & nvme_host::LPA_COMMAND_EFFECTS != 0 => {
                let mut page = vec![0u8; 4096];
                let admin = [
                    admin_opcode::DELETE_IO_SQ,
                    admin_opcode::CREATE_IO_SQ,
                    admin_opcode::GET_LOG_PAGE,
                    admin_opcode::DELETE_IO_CQ,
                    admin_opcode::CREATE_IO_CQ,
                    admin_opcode::IDENTIFY,
                    admin_opcode::ABORT,
                    admin_opcode::SET_FEATURES,
                    admin_opcode::GET_FEATURES,
                    admin_opcode::ASYNC_EVENT_REQUEST,
                ];
                for opc in admin {
                    page[opc as usize * 4] = 1;
                }
                for opc in [nvm_opcode::FLUSH, nvm_opcode::WRITE, nvm_opcode::READ] {
                    page[1024 + opc as usize * 4] = 1;
                }
                page
            }
            lid => match st.log_pages.get(&lid) {
                Some(page) => page.clone(),
                None => return Err(specific(command_specific_status::INVALID_LOG_PAGE)),
            },
        };
        data.resize(len, 0);
        self.write_data(cmd, &data, st.page_size())?;
        Ok(0)
    }

    fn cmd_set_features(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        let fid = (cmd.cdw10 & 0xff) as u8;
        if fid == feature_id::NUMBER_OF_QUEUES {
            if st.sqs.len() > 1 {
                return Err(generic(generic_status::COMMAND_SEQUENCE_ERROR));
            }
            let nsq = cmd.cdw11 & 0xffff;
            let ncq = cmd.cdw11 >> 16;
            if nsq == 0xffff || ncq == 0xffff {
                return Err(generic(generic_status::INVALID_FIELD));
            }
            let max = self.config.max_io_queues as u32;
            let gsq = (nsq + 1).min(max);
            let gcq = (ncq + 1).min(max);
            st.granted = Some(gsq.min(gcq) as u16);
            return Ok((gsq - 1) | (gcq - 1) << 16);
        }
        st.features.insert(fid, cmd.cdw11);
        Ok(0)
    }

    fn cmd_get_features(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        let fid = (cmd.cdw10 & 0xff) as u8;
        if fid == feature_id::NUMBER_OF_QUEUES {
            let n = st.granted.unwrap_or(self.config.max_io_queues) as u32 - 1;
            return Ok(n | n << 16);
        }
        Ok(st.features.get(&fid).copied().unwrap_or(0))
    }

    fn io_queue_limit(&self, st: &SimState) -> u16 {
        st.granted.unwrap_or(self.config.max_io_queues)
    }

    fn cmd_create_io_cq(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        let qid = cmd.cdw10 as u16;
        let size = (cmd.cdw10 >> 16) + 1;
        if qid == 0 || qid > self.io_queue_limit(st) || st.cqs.contains_key(&qid) {
            return Err(specific(command_specific_status::INVALID_QUEUE_IDENTIFIER));
        }
        if size < 2 || size > self.config.mqes as u32 + 1 {
            return Err(specific(command_specific_status::MAXIMUM_QUEUE_SIZE_EXCEEDED));
        }
        let len = size as usize * COMPLETION_SIZE;
        if cmd.cdw11 & 1 == 0
            || cmd.prp1 % st.page_size() as u64 != 0
            || !self.dma.contains(cmd.prp1, len)
        {
            return Err(generic(generic_status::INVALID_FIELD));
        }
        st.cqs.insert(qid, CompletionQueue::new(size as u16, cmd.prp1));
        tracing::debug!(qid, size, "io cq created");
        Ok(0)
    }

    fn cmd_create_io_sq(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        let qid = cmd.cdw10 as u16;
        let size = (cmd.cdw10 >> 16) + 1;
        let cqid = (cmd.cdw11 >> 16) as u16;
        if qid == 0 || qid > self.io_queue_limit(st) || st.sqs.contains_key(&qid) {
            return Err(specific(command_specific_status::INVALID_QUEUE_IDENTIFIER));
        }
        if size < 2 || size > self.config.mqes as u32 + 1 {
            return Err(specific(command_specific_status::MAXIMUM_QUEUE_SIZE_EXCEEDED));
        }
        if cqid == 0 || !st.cqs.contains_key(&cqid) {
            return Err(specific(command_specific_status::COMPLETION_QUEUE_INVALID));
        }
        let len = size as usize * COMMAND_SIZE;
        if cmd.cdw11 & 1 == 0
            || cmd.prp1 % st.page_size() as u64 != 0
            || !self.dma.contains(cmd.prp1, len)
        {
            return Err(generic(generic_status::INVALID_FIELD));
        }
        let priority = ((cmd.cdw11 >> 1) & 0x3) as u8;
        st.sqs.insert(
            qid,
            SubmissionQueue {
                size: size as u16,
                base: cmd.prp1,
                head: 0,
                tail: 0,
                cqid,
                priority,
            },
        );
        tracing::debug!(qid, size, cqid, priority, "io sq created");
        Ok(0)
    }

    fn cmd_delete_io_sq(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        let qid = cmd.cdw10 as u16;
        if qid == 0 || st.sqs.remove(&qid).is_none() {
            return Err(specific(command_specific_status::INVALID_QUEUE_IDENTIFIER));
        }
        st.held.retain(|(_, cpl)| cpl.sqid != qid);
        Ok(0)
    }

    fn cmd_delete_io_cq(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        let qid = cmd.cdw10 as u16;
        if qid == 0 || !st.cqs.contains_key(&qid) {
            return Err(specific(command_specific_status::INVALID_QUEUE_IDENTIFIER));
        }
        if st.sqs.values().any(|sq| sq.cqid == qid) {
            return Err(specific(command_specific_status::INVALID_QUEUE_DELETION));
        }
        st.cqs.remove(&qid);
        Ok(0)
    }

    /// Aborts a held command; DW0 bit 0 is clear when the abort took effect.
    fn cmd_abort(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        let sqid = cmd.cdw10 as u16;
        let cid = (cmd.cdw10 >> 16) as u16;
        match st
            .held
            .iter_mut()
            .find(|(_, cpl)| cpl.sqid == sqid && cpl.cid == cid)
        {
            Some((_, cpl)) => {
                cpl.status = Status::aborted_by_request();
                cpl.cdw0 = 0;
                Ok(0)
            }
            None => Ok(1),
        }
    }

    fn cmd_async_event(&self, st: &mut SimState, cmd: &Command) -> Outcome {
        if st.aers.len() > self.config.aerl as usize {
            return Outcome::Done(
                specific(command_specific_status::ASYNC_EVENT_REQUEST_LIMIT_EXCEEDED),
                0,
            );
        }
        match st.events.pop_front() {
            Some(info) => Outcome::Done(Status::SUCCESS, info),
            None => {
                st.aers.push_back(cmd.cid);
                Outcome::Deferred
            }
        }
    }

    fn cmd_ns_management(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        if self.config.oacs & OACS_NS_MANAGEMENT == 0 {
            return Err(generic(generic_status::INVALID_OPCODE));
        }
        match cmd.cdw10 & 0xf {
            0 => {
                let data = self.read_data(cmd, IDENTIFY_DATA_SIZE, st.page_size())?;
                let template = IdentifyNamespace::parse(&data);
                if template.nsze == 0 {
                    return Err(generic(generic_status::INVALID_FIELD));
                }
                let Some(slot) = st.namespaces.iter().position(Option::is_none) else {
                    return Err(specific(NAMESPACE_ID_UNAVAILABLE));
                };
                let fmt = template.current_format();
                let lbads = if fmt.lbads >= 9 { fmt.lbads } else { 9 };
                let mut spec = NamespaceSpec::new(template.nsze, lbads);
                if fmt.ms != 0 {
                    spec.formats[1].ms = fmt.ms;
                    spec.format = 1;
                    spec.extended = template.extended_lba();
                }
                spec.pi = template.pi_type();
                st.namespaces[slot] = Some(SimNamespace::new(spec, false));
                tracing::debug!(nsid = slot + 1, "namespace created");
                Ok(slot as u32 + 1)
            }
            1 => {
                if cmd.nsid == ALL_NAMESPACES {
                    st.namespaces.iter_mut().for_each(|ns| *ns = None);
                    return Ok(0);
                }
                st.allocated(cmd.nsid)?;
                st.namespaces[cmd.nsid as usize - 1] = None;
                Ok(0)
            }
            _ => Err(generic(generic_status::INVALID_FIELD)),
        }
    }

    fn cmd_ns_attachment(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        if self.config.oacs & OACS_NS_MANAGEMENT == 0 {
            return Err(generic(generic_status::INVALID_OPCODE));
        }
        let attach = match cmd.cdw10 & 0xf {
            0 => true,
            1 => false,
            _ => return Err(generic(generic_status::INVALID_FIELD)),
        };
        let data = self.read_data(cmd, IDENTIFY_DATA_SIZE, st.page_size())?;
        let count = u16::from_le_bytes([data[0], data[1]]) as usize;
        let listed = (0..count.min(2047))
            .map(|i| u16::from_le_bytes([data[2 + i * 2], data[3 + i * 2]]))
            .any(|id| id == self.config.cntlid);
        if !listed {
            return Err(specific(CONTROLLER_LIST_INVALID));
        }
        let ns = st.allocated(cmd.nsid)?;
        match (attach, ns.attached) {
            (true, true) => return Err(specific(NAMESPACE_ALREADY_ATTACHED)),
            (false, false) => return Err(specific(NAMESPACE_NOT_ATTACHED)),
            _ => ns.attached = attach,
        }
        Ok(0)
    }

    fn cmd_format(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        if self.config.oacs & OACS_FORMAT_NVM == 0 {
            return Err(generic(generic_status::INVALID_OPCODE));
        }
        let lbaf = (cmd.cdw10 & 0xf) as u8;
        let mset = cmd.cdw10 & (1 << 4) != 0;
        let pi = ((cmd.cdw10 >> 5) & 0x7) as u8;

        let targets: Vec<usize> = if cmd.nsid == ALL_NAMESPACES {
            (0..st.namespaces.len())
                .filter(|&i| st.namespaces[i].is_some())
                .collect()
        } else {
            st.allocated(cmd.nsid)?;
            vec![cmd.nsid as usize - 1]
        };
        for idx in targets {
            let Some(ns) = st.namespaces[idx].as_mut() else {
                continue;
            };
            if lbaf as usize >= ns.spec.formats.len() {
                return Err(specific(command_specific_status::INVALID_FORMAT));
            }
            ns.spec.format = lbaf;
            ns.spec.extended = mset;
            ns.spec.pi = pi;
            ns.blocks.clear();
        }
        Ok(0)
    }

    fn cmd_firmware_download(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        if self.config.oacs & OACS_FIRMWARE == 0 {
            return Err(generic(generic_status::INVALID_OPCODE));
        }
        let len = (cmd.cdw10 as usize + 1) * 4;
        let offset = cmd.cdw11 as usize * 4;
        let chunk = self.read_data(cmd, len, st.page_size())?;
        if st.firmware_image.len() < offset + len {
            st.firmware_image.resize(offset + len, 0);
        }
        st.firmware_image[offset..offset + len].copy_from_slice(&chunk);
        Ok(0)
    }

    fn cmd_firmware_commit(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        if self.config.oacs & OACS_FIRMWARE == 0 {
            return Err(generic(generic_status::INVALID_OPCODE));
        }
        let slot = match (cmd.cdw10 & 0x7) as u8 {
            0 => 1,
            s => s,
        };
        let action = (cmd.cdw10 >> 3) & 0x7;
        if slot as usize > st.firmware_slots.len() {
            return Err(specific(command_specific_status::INVALID_FIRMWARE_SLOT));
        }

        if matches!(action, 0 | 1 | 3) {
            if st.firmware_image.is_empty() {
                return Err(specific(command_specific_status::INVALID_FIRMWARE_IMAGE));
            }
            let image = std::mem::take(&mut st.firmware_image);
            let rev = String::from_utf8_lossy(&image[..image.len().min(8)])
                .trim_end_matches(['\0', ' '])
                .to_string();
            st.firmware_slots[slot as usize - 1] = Some(rev);
        }
        match action {
            0 => Ok(0),
            1 | 2 => {
                if st.firmware_slots[slot as usize - 1].is_none() {
                    return Err(specific(command_specific_status::INVALID_FIRMWARE_IMAGE));
                }
                st.pending_activation = Some(slot);
                Ok(0)
            }
            3 => {
                st.pending_activation = Some(slot);
                Err(Status::new(
                    status_type::COMMAND_SPECIFIC,
                    command_specific_status::FIRMWARE_REQUIRES_RESET,
                    false,
                ))
            }
            _ => Err(generic(generic_status::INVALID_FIELD)),
        }
    }

    fn execute_io(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        let oncs = self.config.oncs;
        match cmd.opc {
            nvm_opcode::FLUSH => {
                if cmd.nsid != ALL_NAMESPACES {
                    st.namespace(cmd.nsid)?;
                }
                st.flushes += 1;
                Ok(0)
            }
            nvm_opcode::READ | nvm_opcode::WRITE => self.cmd_read_write(st, cmd),
            nvm_opcode::WRITE_ZEROES if oncs & ONCS_WRITE_ZEROES != 0 => {
                let slba = cmd.cdw10 as u64 | (cmd.cdw11 as u64) << 32;
                let nlb = (cmd.cdw12 & 0xffff) as u64 + 1;
                let ns = st.namespace(cmd.nsid)?;
                ns.check_range(slba, nlb)?;
                for lba in slba..slba + nlb {
                    ns.blocks.remove(&lba);
                }
                Ok(0)
            }
            nvm_opcode::DATASET_MANAGEMENT if oncs & ONCS_DSM != 0 => self.cmd_dsm(st, cmd),
            nvm_opcode::RESERVATION_REGISTER
            | nvm_opcode::RESERVATION_ACQUIRE
            | nvm_opcode::RESERVATION_RELEASE
            | nvm_opcode::RESERVATION_REPORT
                if oncs & ONCS_RESERVATIONS != 0 =>
            {
                self.cmd_reservation(st, cmd)
            }
            opc => {
                tracing::debug!(opc, "unsupported io opcode");
                Err(generic(generic_status::INVALID_OPCODE))
            }
        }
    }

    fn cmd_read_write(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        let page = st.page_size();
        let slba = cmd.cdw10 as u64 | (cmd.cdw11 as u64) << 32;
        let nlb = (cmd.cdw12 & 0xffff) as u64 + 1;
        let stride = {
            let ns = st.namespace(cmd.nsid)?;
            ns.check_range(slba, nlb)?;
            ns.spec.stride()
        };
        let len = nlb as usize * stride;
        if len > self.max_transfer() {
            return Err(generic(generic_status::INVALID_FIELD));
        }

        if cmd.opc == nvm_opcode::WRITE {
            let data = self.read_data(cmd, len, page)?;
            let ns = st.namespace(cmd.nsid)?;
            for (i, block) in data.chunks_exact(stride).enumerate() {
                ns.blocks.insert(slba + i as u64, block.to_vec());
            }
        } else {
            let mut data = vec![0u8; len];
            let ns = st.namespace(cmd.nsid)?;
            for (i, block) in data.chunks_exact_mut(stride).enumerate() {
                if let Some(stored) = ns.blocks.get(&(slba + i as u64)) {
                    block.copy_from_slice(stored);
                }
            }
            self.write_data(cmd, &data, page)?;
        }
        Ok(0)
    }

    fn cmd_dsm(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        let page = st.page_size();
        let nr = (cmd.cdw10 & 0xff) as usize + 1;
        st.namespace(cmd.nsid)?;
        let data = self.read_data(cmd, nr * 16, page)?;
        if cmd.cdw11 & (1 << 2) == 0 {
            return Ok(0);
        }
        let ns = st.namespace(cmd.nsid)?;
        for range in data.chunks_exact(16) {
            let nlb = u32::from_le_bytes(range[4..8].try_into().unwrap()) as u64;
            let slba = u64::from_le_bytes(range[8..16].try_into().unwrap());
            ns.check_range(slba, nlb)?;
            for lba in slba..slba + nlb {
                ns.blocks.remove(&lba);
            }
            ns.deallocated += nlb;
        }
        Ok(0)
    }

    fn cmd_reservation(&self, st: &mut SimState, cmd: &Command) -> CmdResult {
        let page = st.page_size();
        let action = cmd.cdw10 & 0x7;
        let ignore = cmd.cdw10 & (1 << 3) != 0;
        let rtype = ((cmd.cdw10 >> 8) & 0xff) as u8;
        st.namespace(cmd.nsid)?;

        match cmd.opc {
            nvm_opcode::RESERVATION_REGISTER => {
                let data = self.read_data(cmd, 16, page)?;
                let current = u64::from_le_bytes(data[0..8].try_into().unwrap());
                let new = u64::from_le_bytes(data[8..16].try_into().unwrap());
                let ns = st.namespace(cmd.nsid)?;
                match action {
                    0 => match ns.key {
                        Some(k) if k != new => {
                            return Err(generic(generic_status::RESERVATION_CONFLICT))
                        }
                        _ => ns.key = Some(new),
                    },
                    1 => {
                        ns.check_key(current, ignore)?;
                        ns.key = None;
                        ns.holder = None;
                    }
                    2 => {
                        if ns.key.is_some() || !ignore {
                            ns.check_key(current, ignore)?;
                        }
                        ns.key = Some(new);
                    }
                    _ => return Err(generic(generic_status::INVALID_FIELD)),
                }
                ns.generation += 1;
                Ok(0)
            }
            nvm_opcode::RESERVATION_ACQUIRE => {
                let data = self.read_data(cmd, 16, page)?;
                let current = u64::from_le_bytes(data[0..8].try_into().unwrap());
                let ns = st.namespace(cmd.nsid)?;
                ns.check_key(current, ignore)?;
                if !(1..=6).contains(&rtype) {
                    return Err(generic(generic_status::INVALID_FIELD));
                }
                match action {
                    0 => match ns.holder {
                        Some(held) if held != rtype => {
                            Err(generic(generic_status::RESERVATION_CONFLICT))
                        }
                        _ => {
                            ns.holder = Some(rtype);
                            Ok(0)
                        }
                    },
                    1 | 2 => {
                        ns.holder = Some(rtype);
                        ns.generation += 1;
                        Ok(0)
                    }
                    _ => Err(generic(generic_status::INVALID_FIELD)),
                }
            }
            nvm_opcode::RESERVATION_RELEASE => {
                let data = self.read_data(cmd, 8, page)?;
                let current = u64::from_le_bytes(data[0..8].try_into().unwrap());
                let ns = st.namespace(cmd.nsid)?;
                ns.check_key(current, ignore)?;
                match action {
                    0 => match ns.holder {
                        Some(held) if held != rtype => Err(generic(generic_status::INVALID_FIELD)),
                        _ => {
                            ns.holder = None;
                            Ok(0)
                        }
                    },
                    1 => {
                        ns.key = None;
                        ns.holder = None;
                        ns.generation += 1;
                        Ok(0)
                    }
                    _ => Err(generic(generic_status::INVALID_FIELD)),
                }
            }
            _ => {
                let len = (cmd.cdw10 as usize + 1) * 4;
                let ns = st.namespace(cmd.nsid)?;
                let mut report = vec![0u8; 48];
                report[0..4].copy_from_slice(&ns.generation.to_le_bytes());
                report[4] = ns.holder.unwrap_or(0);
                if let Some(key) = ns.key {
                    report[5..7].copy_from_slice(&1u16.to_le_bytes());
                    report[24..26].copy_from_slice(&self.config.cntlid.to_le_bytes());
                    report[26] = ns.holder.is_some() as u8;
                    report[40..48].copy_from_slice(&key.to_le_bytes());
                } else {
                    report.truncate(24);
                }
                report.resize(len, 0);
                self.write_data(cmd, &report, page)?;
                Ok(0)
            }
        }
    }

    fn raise(&self, st: &mut SimState, info: u32) {
        match st.aers.pop_front() {
            Some(cid) => {
                let sqhd = st.sqs.get(&0).map_or(0, |sq| sq.head);
                let cpl = Completion {
                    cdw0: info,
                    sqhd,
                    cid,
                    ..Completion::default()
                };
                self.complete(st, 0, cpl);
            }
            None => st.events.push_back(info),
        }
    }

    /// Completes an outstanding asynchronous event request, or queues the
    /// event until one is submitted.
    pub fn raise_event(&self, event_type: u8, info: u8, log_page: u8) {
        let cdw0 = (event_type as u32 & 0x7) | (info as u32) << 8 | (log_page as u32) << 16;
        let mut st = self.lock();
        self.raise(&mut st, cdw0);
    }

    /// Records `nsid` in the changed namespace list and raises a
    /// namespace-attribute notice if the host enabled it.
    pub fn notify_namespace_change(&self, nsid: u32) -> bool {
        let mut st = self.lock();
        if !st.changed_namespaces.contains(&nsid) {
            st.changed_namespaces.push(nsid);
        }
        let enabled = st
            .features
            .get(&feature_id::ASYNC_EVENT_CONFIGURATION)
            .is_some_and(|cfg| cfg & (1 << 8) != 0);
        if enabled {
            let cdw0 = AER_TYPE_NOTICE as u32
                | (AER_NOTICE_NS_ATTRIBUTE as u32) << 8
                | (log_id::CHANGED_NS_LIST as u32) << 16;
            self.raise(&mut st, cdw0);
        }
        enabled
    }

    pub fn outstanding_aers(&self) -> usize {
        self.lock().aers.len()
    }

    /// Holds back completions of commands submitted on `qid`.
    pub fn hold_completions(&self, qid: u16, hold: bool) {
        let mut st = self.lock();
        if hold {
            st.held_queues.insert(qid);
        } else {
            st.held_queues.remove(&qid);
        }
    }

    /// Posts every held completion of `qid` in submission order.
    pub fn release_held(&self, qid: u16) -> usize {
        let mut st = self.lock();
        let (released, kept): (Vec<_>, Vec<_>) =
            st.held.drain(..).partition(|(_, cpl)| cpl.sqid == qid);
        st.held = kept;
        let count = released.len();
        for (cqid, cpl) in released {
            match st.cqs.get_mut(&cqid) {
                Some(cq) => cq.post(&self.dma, cpl),
                None => tracing::warn!(cqid, "held completion for missing cq dropped"),
            }
        }
        count
    }

    pub fn held_count(&self) -> usize {
        self.lock().held.len()
    }

    /// Fails the next command with `opcode` on `qid` with `status`.
    pub fn inject_error(&self, qid: u16, opcode: u8, status: Status) {
        self.lock().injected.push_back(InjectedError {
            qid,
            opcode,
            status,
        });
    }

    pub fn commands(&self) -> Vec<LoggedCommand> {
        self.lock().log.clone()
    }

    pub fn count_commands(&self, qid: u16, opcode: u8) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|c| c.qid == qid && c.cmd.opc == opcode)
            .count()
    }

    pub fn clear_command_log(&self) {
        self.lock().log.clear();
    }

    /// Submission queue tail doorbell writes seen for `qid`.
    pub fn sq_doorbell_writes(&self, qid: u16) -> u64 {
        self.lock().doorbells.get(&qid).copied().unwrap_or(0)
    }

    pub fn set_log_page(&self, lid: u8, data: Vec<u8>) {
        self.lock().log_pages.insert(lid, data);
    }

    pub fn set_namespace_sectors(&self, nsid: u32, sectors: u64) {
        if let Ok(ns) = self.lock().allocated(nsid) {
            ns.spec.sectors = sectors;
        }
    }

    pub fn set_never_ready(&self, never: bool) {
        self.lock().never_ready = never;
    }

    pub fn set_ready_delay(&self, delay: Duration) {
        self.lock().ready_delay = delay;
    }

    /// I/O submission queue ids currently created.
    pub fn io_queues(&self) -> Vec<u16> {
        self.lock().sqs.keys().copied().filter(|&qid| qid != 0).collect()
    }

    pub fn sq_priority(&self, qid: u16) -> Option<u8> {
        self.lock().sqs.get(&qid).map(|sq| sq.priority)
    }

    pub fn sq_entries(&self, qid: u16) -> Option<u16> {
        self.lock().sqs.get(&qid).map(|sq| sq.size)
    }

    /// Whether the ring of submission queue `qid` lives in the CMB.
    pub fn sq_in_cmb(&self, qid: u16) -> bool {
        let st = self.lock();
        st.sqs
            .get(&qid)
            .is_some_and(|sq| self.dma.cmb_for(sq.base, sq.size as usize * COMMAND_SIZE).is_some())
    }

    pub fn granted_queues(&self) -> Option<u16> {
        self.lock().granted
    }

    pub fn feature(&self, fid: u8) -> Option<u32> {
        self.lock().features.get(&fid).copied()
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig::from_raw(self.lock().cc)
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready(self.clock.now())
    }

    /// Times CC.EN went from 0 to 1.
    pub fn enable_count(&self) -> usize {
        self.lock().enables
    }

    pub fn shutdown_count(&self) -> usize {
        self.lock().shutdowns
    }

    pub fn firmware_revision(&self) -> String {
        self.lock().firmware.clone()
    }

    pub fn flush_count(&self) -> u64 {
        self.lock().flushes
    }

    /// Raw stored bytes of `count` blocks (zeroes where never written).
    pub fn read_blocks(&self, nsid: u32, lba: u64, count: u64) -> Vec<u8> {
        let mut st = self.lock();
        let Ok(ns) = st.allocated(nsid) else {
            return Vec::new();
        };
        let stride = ns.spec.stride();
        let mut out = vec![0u8; count as usize * stride];
        for (i, block) in out.chunks_exact_mut(stride).enumerate() {
            if let Some(stored) = ns.blocks.get(&(lba + i as u64)) {
                block.copy_from_slice(stored);
            }
        }
        out
    }

    pub fn write_blocks(&self, nsid: u32, lba: u64, data: &[u8]) {
        let mut st = self.lock();
        let Ok(ns) = st.allocated(nsid) else {
            return;
        };
        let stride = ns.spec.stride();
        for (i, block) in data.chunks(stride).enumerate() {
            let mut stored = vec![0u8; stride];
            stored[..block.len()].copy_from_slice(block);
            ns.blocks.insert(lba + i as u64, stored);
        }
    }

    pub fn deallocated_blocks(&self, nsid: u32) -> u64 {
        self.lock().allocated(nsid).map_or(0, |ns| ns.deallocated)
    }

    pub fn namespace_spec(&self, nsid: u32) -> Option<NamespaceSpec> {
        self.lock().allocated(nsid).ok().map(|ns| ns.spec.clone())
    }

    pub fn namespace_attached(&self, nsid: u32) -> bool {
        self.lock().namespace(nsid).is_ok()
    }

    /// Registered key and held reservation type.
    pub fn reservation(&self, nsid: u32) -> (Option<u64>, Option<u8>) {
        self.lock()
            .allocated(nsid)
            .map_or((None, None), |ns| (ns.key, ns.holder))
    }
}

impl Mmio for SimController {
    fn read32(&self, offset: u64) -> u32 {
        if !self.pci.memory_enabled() {
            return 0xffff_ffff;
        }
        let st = self.lock();
        match offset {
            REG_CAP => self.cap() as u32,
            o if o == REG_CAP + 4 => (self.cap() >> 32) as u32,
            REG_VS => self.config.version,
            REG_INTMS | REG_INTMC => st.intms,
            REG_CC => st.cc,
            REG_CSTS => self.csts(&st),
            REG_AQA => st.aqa,
            REG_ASQ => st.asq as u32,
            o if o == REG_ASQ + 4 => (st.asq >> 32) as u32,
            REG_ACQ => st.acq as u32,
            o if o == REG_ACQ + 4 => (st.acq >> 32) as u32,
            REG_CMBLOC if self.dma.cmb.is_some() => CMB_BAR as u32,
            // SQS supported, 4 KiB units.
            REG_CMBSZ if self.dma.cmb.is_some() => 1 | ((self.config.cmb_size / 4096) as u32) << 12,
            _ => 0,
        }
    }

    fn write32(&self, offset: u64, value: u32) {
        if !self.pci.memory_enabled() {
            return;
        }
        let mut st = self.lock();
        let enabled = st.enabled;
        match offset {
            REG_INTMS => st.intms |= value,
            REG_INTMC => st.intms &= !value,
            REG_CC => self.write_cc(&mut st, value),
            REG_AQA if !enabled => st.aqa = value,
            REG_ASQ if !enabled => st.asq = st.asq & !0xffff_ffff | value as u64,
            o if o == REG_ASQ + 4 && !enabled => {
                st.asq = st.asq & 0xffff_ffff | (value as u64) << 32
            }
            REG_ACQ if !enabled => st.acq = st.acq & !0xffff_ffff | value as u64,
            o if o == REG_ACQ + 4 && !enabled => {
                st.acq = st.acq & 0xffff_ffff | (value as u64) << 32
            }
            o if o >= DOORBELL_BASE => self.write_doorbell(&mut st, offset, value),
            _ => {}
        }
    }
}

/// Splits a PRP-described transfer into (bus address, length) pieces,
/// following chained lists.
fn prp_segments(
    dma: &Dma,
    prp1: u64,
    prp2: u64,
    len: usize,
    page: usize,
) -> Result<Vec<(u64, usize)>, Status> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let invalid = || generic(generic_status::INVALID_FIELD);
    if prp1 == 0 {
        return Err(invalid());
    }

    let page_mask = page as u64 - 1;
    let first_len = (page - (prp1 & page_mask) as usize).min(len);
    let mut segs = vec![(prp1, first_len)];
    let mut remaining = len - first_len;
    if remaining == 0 {
        return Ok(segs);
    }
    if prp2 == 0 || prp2 & page_mask != 0 {
        return Err(invalid());
    }
    if remaining <= page {
        segs.push((prp2, remaining));
        return Ok(segs);
    }

    let entries_per_list = page / 8;
    let mut list_addr = prp2;
    while remaining > 0 {
        let pages_needed = remaining.div_ceil(page);
        let pages_this_list = if pages_needed > entries_per_list {
            // Last entry chains to the next list page.
            entries_per_list - 1
        } else {
            pages_needed
        };

        for entry in 0..pages_this_list {
            let addr = dma.read_u64(list_addr + entry as u64 * 8)?;
            if addr == 0 || addr & page_mask != 0 {
                return Err(invalid());
            }
            let chunk = remaining.min(page);
            segs.push((addr, chunk));
            remaining -= chunk;
        }
        if remaining == 0 {
            break;
        }

        list_addr = match dma.read_u64(list_addr + (entries_per_list as u64 - 1) * 8)? {
            next if next != 0 && next & page_mask == 0 => next,
            _ => return Err(invalid()),
        };
    }
    Ok(segs)
}

/// Walks an SGL starting at the command's first descriptor.
fn sgl_segments(dma: &Dma, cmd: &Command, len: usize) -> Result<Vec<(u64, usize)>, Status> {
    let bad_descriptor = || generic(generic_status::INVALID_SGL_SEGMENT_DESCRIPTOR);
    let first = cmd.sgl1().ok_or_else(bad_descriptor)?;

    let mut pending = VecDeque::from([first]);
    let mut segs = Vec::new();
    let mut covered = 0usize;
    let mut hops = 0;
    while let Some(desc) = pending.pop_front() {
        match desc.kind {
            SglType::DataBlock => {
                if covered < len && desc.length > 0 {
                    let take = (desc.length as usize).min(len - covered);
                    segs.push((desc.address, take));
                    covered += take;
                }
            }
            SglType::Segment | SglType::LastSegment => {
                if !pending.is_empty()
                    || desc.length == 0
                    || desc.length as usize % SGL_DESCRIPTOR_SIZE != 0
                {
                    return Err(bad_descriptor());
                }
                hops += 1;
                if hops > SGL_MAX_SEGMENTS {
                    return Err(bad_descriptor());
                }
                let mut raw = vec![0u8; desc.length as usize];
                dma.read(desc.address, &mut raw)?;
                for chunk in raw.chunks_exact(SGL_DESCRIPTOR_SIZE) {
                    let next = SglDescriptor::from_bytes(chunk.try_into().unwrap())
                        .ok_or_else(bad_descriptor)?;
                    if desc.kind == SglType::LastSegment && next.kind != SglType::DataBlock {
                        return Err(bad_descriptor());
                    }
                    pending.push_back(next);
                }
            }
            SglType::BitBucket => return Err(bad_descriptor()),
        }
    }
    if covered < len {
        return Err(generic(DATA_SGL_LENGTH_INVALID));
    }
    Ok(segs)
}
