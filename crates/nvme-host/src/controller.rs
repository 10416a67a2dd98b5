//! Controller bring-up, reset and the I/O queue-pair pool.
//!
//! Bring-up is a polled state machine: each call to [`Controller::init_step`]
//! samples CC and CSTS once, performs at most one transition and returns.
//! [`Controller::attach`] and [`Controller::reset`] drive it to completion,
//! sleeping [`ControllerOptions::init_poll_interval`] between steps.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::admin::{Admin, AdminData, CommitAction, FormatParams, ALL_NAMESPACES};
use crate::command::{
    admin_opcode, command_specific_status, generic_status, status_type, Command, Completion,
};
use crate::identify::{IdentifyController, IdentifyNamespace, OAES_NS_ATTRIBUTE};
use crate::log_page::{
    feature_id, log_id, supported_features, supported_log_pages, wants_intel_directory, IdSet,
    IntelLogDirectory,
};
use crate::namespace::{Namespace, NamespaceHandle};
use crate::options::{Arbitration, ControllerOptions, QpairOptions, QueuePriority};
use crate::platform::{
    Clock, Mmio, PciConfig, PciId, Platform, PCI_COMMAND, PCI_COMMAND_BUS_MASTER,
    PCI_COMMAND_INTX_DISABLE, PCI_COMMAND_MEMORY,
};
use crate::qpair::{QueueContext, QueuePair, SqRing};
use crate::quirks::{self, Quirks};
use crate::regs::{
    self, Capabilities, CmbLocation, CmbSize, ControllerConfig, ControllerStatus, Version,
    CC_SHN_NONE, CC_SHN_NORMAL, SHST_COMPLETE,
};
use crate::request::Request;
use crate::{Error, Result};

/// Host memory page size before clamping to CAP.MPSMIN/MPSMAX.
const HOST_PAGE_SIZE: u64 = 4096;
/// Pages covered by one transfer: a single pointer-list page.
const MAX_XFER_PAGES: usize = 512;
const MAX_ADMIN_ENTRIES: u32 = 4096;
const MAX_AERS: usize = 8;
/// Ids returned by one active namespace list page.
const ACTIVE_LIST_IDS: usize = 1024;
const MIN_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const AER_TYPE_NOTICE: u32 = 2;
const AER_INFO_NS_ATTR_CHANGED: u32 = 0;

/// Bring-up state. [`ControllerState::Ready`] is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Init,
    /// CC.EN was found set with CSTS.RDY clear.
    DisableWaitForReady1,
    /// CC.EN has been cleared.
    DisableWaitForReady0,
    /// CC.EN has been set.
    EnableWaitForReady1,
    Ready,
}

/// Outcome of one bring-up step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    Pending,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStat {
    pub pci_id: PciId,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    pub max_xfer_size: usize,
    pub sgl_supported: bool,
    pub namespaces: u32,
    pub io_qpairs: usize,
    pub max_queue_entries: u16,
}

struct AerState {
    handler: Option<crate::options::AerHandler>,
    ns_changed: AtomicBool,
    events: AtomicU64,
    /// Events awaiting the handler; delivered once the controller lock is released.
    pending: Mutex<Vec<Completion>>,
}

impl AerState {
    fn take_pending(&self) -> Vec<Completion> {
        let mut pending = self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *pending)
    }

    fn dispatch(&self) {
        let Some(handler) = &self.handler else {
            return;
        };
        for cpl in self.take_pending() {
            handler(&cpl);
        }
    }
}

fn submit_aer(admin: &Arc<QueuePair>, aer: &Arc<AerState>) -> Result<()> {
    let weak = Arc::downgrade(admin);
    let state = Arc::clone(aer);
    let req = Request::new(Command::new(admin_opcode::ASYNC_EVENT_REQUEST))
        .on_complete(move |cpl| aer_complete(&weak, &state, cpl));
    admin.submit(req)
}

fn aer_complete(admin: &Weak<QueuePair>, aer: &Arc<AerState>, cpl: &Completion) {
    if cpl
        .status
        .is(status_type::GENERIC, generic_status::ABORTED_SQ_DELETION)
    {
        return;
    }
    if cpl.status.is_error() {
        tracing::warn!(status = %cpl.status, "asynchronous event request failed");
        return;
    }

    let event_type = cpl.cdw0 & 0x7;
    let info = (cpl.cdw0 >> 8) & 0xff;
    let log_page = (cpl.cdw0 >> 16) & 0xff;
    tracing::debug!(event_type, info, log_page, "asynchronous event");
    aer.events.fetch_add(1, Ordering::AcqRel);
    if event_type == AER_TYPE_NOTICE && info == AER_INFO_NS_ATTR_CHANGED {
        aer.ns_changed.store(true, Ordering::Release);
    }
    if aer.handler.is_some() {
        aer.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(*cpl);
    }

    let Some(admin) = admin.upgrade() else {
        return;
    };
    if let Err(err) = submit_aer(&admin, aer) {
        tracing::debug!(error = %err, "asynchronous event request not reposted");
    }
}

/// Event requests to keep posted. One tracker and one request stay free so
/// synchronous admin commands can always be issued.
fn aer_slots(aerl: u8, trackers: usize, requests: usize) -> usize {
    (aerl as usize + 1)
        .min(MAX_AERS)
        .min(trackers.saturating_sub(1))
        .min(requests.saturating_sub(1))
}

/// Largest transfer: one pointer-list page worth of pages, capped by MDTS
/// (a power of two in units of the minimum page size, zero meaning no limit).
fn max_transfer_size(page: usize, min_page: usize, mdts: u8) -> usize {
    let max = MAX_XFER_PAGES * page;
    if mdts == 0 {
        return max;
    }
    1usize
        .checked_shl(mdts as u32)
        .and_then(|pages| pages.checked_mul(min_page))
        .map_or(max, |limit| max.min(limit))
}

/// Bus address programmed into a memory BAR.
fn bar_bus_address(cfg: &dyn PciConfig, bar: u8) -> u64 {
    let reg = 0x10 + 4 * bar as u16;
    let low = cfg.read32(reg);
    let mut addr = (low & !0xf) as u64;
    if low & 0x6 == 0x4 {
        addr |= (cfg.read32(reg + 4) as u64) << 32;
    }
    addr
}

/// Bump allocator over the controller memory buffer.
struct Cmb {
    window: Arc<dyn Mmio>,
    bar: u8,
    /// Offset of the buffer inside the mapped BAR.
    offset: u64,
    bus: u64,
    size: u64,
    used: u64,
}

impl Cmb {
    fn alloc(&mut self, len: u64, align: u64) -> Option<(u64, u64)> {
        let start = self.used.div_ceil(align) * align;
        if start + len > self.size {
            return None;
        }
        self.used = start + len;
        Some((self.offset + start, self.bus + start))
    }

    fn alloc_sq(&mut self, entries: u16, page_size: u64) -> Option<SqRing> {
        let len = entries as u64 * crate::command::COMMAND_SIZE as u64;
        let (offset, bus) = self.alloc(len, page_size)?;
        Some(SqRing::Cmb {
            window: Arc::clone(&self.window),
            offset,
            bus,
        })
    }
}

struct IoSlot {
    qpair: Arc<QueuePair>,
    /// CMB ring sized for the full queue depth, reused whenever the pair is
    /// rebuilt at a different depth.
    cmb_ring: Option<SqRing>,
    in_use: bool,
    priority: QueuePriority,
}

struct ControllerInner {
    state: ControllerState,
    deadline: Option<Duration>,
    /// Quirk delay gate; init steps before this instant do nothing.
    sleep_until: Option<Duration>,
    ready_delay_done: bool,
    failed: bool,
    detached: bool,
    arbitration: Arbitration,
    cdata: Option<IdentifyController>,
    max_xfer_size: usize,
    io_queue_entries: u16,
    io_qpairs: Vec<IoSlot>,
    /// Indexed by nsid - 1; `None` for inactive ids.
    namespaces: Vec<Option<Arc<Namespace>>>,
    open_counts: Vec<Arc<AtomicUsize>>,
    log_pages: IdSet,
    features: IdSet,
    cmb: Option<Cmb>,
    aer_count: usize,
}

/// One attached NVMe controller.
pub struct Controller {
    platform: Arc<dyn Platform>,
    pci_id: PciId,
    quirks: Quirks,
    regs: Arc<dyn Mmio>,
    clock: Arc<dyn Clock>,
    cap: Capabilities,
    version: Version,
    opts: ControllerOptions,
    ctx: Arc<QueueContext>,
    admin: Arc<QueuePair>,
    aer: Arc<AerState>,
    inner: Mutex<ControllerInner>,
}

impl Controller {
    /// Opens the device and brings it up.
    pub fn attach(platform: Arc<dyn Platform>, opts: ControllerOptions) -> Result<Controller> {
        let ctrlr = Self::open(platform, opts)?;
        ctrlr.locked(|inner| ctrlr.wait_ready(inner))?;
        tracing::info!(
            vendor = ctrlr.pci_id.vendor,
            device = ctrlr.pci_id.device,
            io_qpairs = ctrlr.num_io_qpairs(),
            "controller ready"
        );
        Ok(ctrlr)
    }

    /// Enables the PCI function, maps the registers and builds the admin
    /// queue pair. The controller is left in [`ControllerState::Init`].
    pub fn open(platform: Arc<dyn Platform>, opts: ControllerOptions) -> Result<Controller> {
        let pci = platform.pci();
        let pci_id = PciId::read(pci.as_ref());
        let quirks = quirks::lookup(&pci_id);
        if !quirks.is_empty() {
            tracing::warn!(
                vendor = pci_id.vendor,
                device = pci_id.device,
                ?quirks,
                "applying controller quirks"
            );
        }

        let command = pci.read32(PCI_COMMAND) & 0xffff;
        pci.write32(
            PCI_COMMAND,
            command | PCI_COMMAND_MEMORY | PCI_COMMAND_BUS_MASTER | PCI_COMMAND_INTX_DISABLE,
        );

        let bar0 = platform.map_bar(0, false).ok_or(Error::BarMap { bar: 0 })?;
        let cap = Capabilities(bar0.read64(regs::REG_CAP));
        let version = Version(bar0.read32(regs::REG_VS));
        let page_size = HOST_PAGE_SIZE
            .max(cap.min_page_size())
            .min(cap.max_page_size());

        let ctx = Arc::new(QueueContext {
            mem: platform.memory(),
            regs: Arc::clone(&bar0),
            page_size,
            doorbell_stride: cap.doorbell_stride(),
            max_retries: opts.max_retries,
            sgl_supported: AtomicBool::new(false),
            enabled_io_queues: AtomicUsize::new(0),
        });

        let admin_entries = opts
            .admin_queue_size
            .clamp(2, MAX_ADMIN_ENTRIES.min(cap.max_queue_entries()).max(2));
        let admin = Arc::new(QueuePair::new(
            0,
            admin_entries as u16,
            opts.admin_requests as usize,
            Arc::clone(&ctx),
            None,
        )?);

        let arbitration = match opts.arbitration.cap_bit() {
            Some(bit) if cap.ams() & bit == 0 => {
                tracing::warn!(
                    requested = ?opts.arbitration,
                    "arbitration mechanism not supported, using round robin"
                );
                Arbitration::RoundRobin
            }
            _ => opts.arbitration,
        };

        let cmb = if opts.use_cmb_sqs {
            Self::map_cmb(platform.as_ref(), pci.as_ref(), bar0.as_ref())
        } else {
            None
        };

        tracing::info!(
            vendor = pci_id.vendor,
            device = pci_id.device,
            major = version.major(),
            minor = version.minor(),
            page_size,
            "attaching NVMe controller"
        );

        let aer = Arc::new(AerState {
            handler: opts.aer_handler.clone(),
            ns_changed: AtomicBool::new(false),
            events: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
        });
        let clock = platform.clock();
        Ok(Controller {
            pci_id,
            quirks,
            regs: bar0,
            clock,
            cap,
            version,
            ctx,
            admin,
            aer,
            inner: Mutex::new(ControllerInner {
                state: ControllerState::Init,
                deadline: None,
                sleep_until: None,
                ready_delay_done: false,
                failed: false,
                detached: false,
                arbitration,
                cdata: None,
                max_xfer_size: 0,
                io_queue_entries: 0,
                io_qpairs: Vec::new(),
                namespaces: Vec::new(),
                open_counts: Vec::new(),
                log_pages: IdSet::default(),
                features: IdSet::default(),
                cmb,
                aer_count: 0,
            }),
            opts,
            platform,
        })
    }

    fn map_cmb(platform: &dyn Platform, pci: &dyn PciConfig, bar0: &dyn Mmio) -> Option<Cmb> {
        let size = CmbSize(bar0.read32(regs::REG_CMBSZ));
        if size.size_bytes() == 0 || !size.sqs() {
            return None;
        }
        let loc = CmbLocation(bar0.read32(regs::REG_CMBLOC));
        let Some(window) = platform.map_bar(loc.bar(), true) else {
            tracing::warn!(bar = loc.bar(), "failed to map controller memory buffer");
            return None;
        };
        let offset = loc.offset_units() * size.unit();
        tracing::debug!(
            bar = loc.bar(),
            offset,
            size = size.size_bytes(),
            "controller memory buffer mapped"
        );
        Some(Cmb {
            window,
            bar: loc.bar(),
            offset,
            bus: bar_bus_address(pci, loc.bar()) + offset,
            size: size.size_bytes(),
            used: 0,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` under the controller lock, then hands any asynchronous events
    /// it collected to the user handler with the lock released.
    fn locked<T>(&self, f: impl FnOnce(&mut ControllerInner) -> Result<T>) -> Result<T> {
        let result = f(&mut self.lock());
        self.aer.dispatch();
        result
    }

    fn admin_ops(&self) -> Admin<'_> {
        Admin {
            qpair: &self.admin,
            clock: self.clock.as_ref(),
            timeout: self.opts.admin_timeout,
        }
    }

    fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.cap.ready_timeout_ms())
    }

    pub fn pci_id(&self) -> PciId {
        self.pci_id
    }

    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    pub fn capabilities(&self) -> Capabilities {
        self.cap
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn page_size(&self) -> u64 {
        self.ctx.page_size
    }

    pub fn state(&self) -> ControllerState {
        self.lock().state
    }

    pub fn is_failed(&self) -> bool {
        self.lock().failed
    }

    pub fn max_xfer_size(&self) -> usize {
        self.lock().max_xfer_size
    }

    pub fn sgl_supported(&self) -> bool {
        self.ctx.sgl_supported.load(Ordering::Acquire)
    }

    /// Effective arbitration mechanism after checking CAP.AMS.
    pub fn arbitration(&self) -> Arbitration {
        self.lock().arbitration
    }

    pub fn num_io_qpairs(&self) -> usize {
        self.lock().io_qpairs.len()
    }

    /// I/O queue pairs currently accepting completions.
    pub fn enabled_io_queues(&self) -> usize {
        self.ctx.enabled_io_queues.load(Ordering::Acquire)
    }

    pub fn admin_qpair(&self) -> &Arc<QueuePair> {
        &self.admin
    }

    /// Asynchronous event requests kept outstanding.
    pub fn aer_count(&self) -> usize {
        self.lock().aer_count
    }

    pub fn async_events_seen(&self) -> u64 {
        self.aer.events.load(Ordering::Acquire)
    }

    pub fn identify_data(&self) -> Option<IdentifyController> {
        self.lock().cdata.clone()
    }

    pub fn is_log_page_supported(&self, lid: u8) -> bool {
        self.lock().log_pages.contains(lid)
    }

    pub fn is_feature_supported(&self, fid: u8) -> bool {
        self.lock().features.contains(fid)
    }

    pub fn stat(&self) -> Result<ControllerStat> {
        let inner = self.lock();
        let cdata = inner.cdata.as_ref().ok_or(Error::ControllerFailed)?;
        Ok(ControllerStat {
            pci_id: self.pci_id,
            serial: cdata.serial.clone(),
            model: cdata.model.clone(),
            firmware: cdata.firmware.clone(),
            max_xfer_size: inner.max_xfer_size,
            sgl_supported: self.sgl_supported(),
            namespaces: cdata.nn,
            io_qpairs: inner.io_qpairs.len(),
            max_queue_entries: inner.io_queue_entries,
        })
    }

    /// Runs one bring-up step.
    pub fn init_step(&self) -> Result<InitStatus> {
        self.locked(|inner| self.process_init(inner))
    }

    fn wait_ready(&self, inner: &mut ControllerInner) -> Result<()> {
        loop {
            match self.process_init(inner)? {
                InitStatus::Ready => return Ok(()),
                InitStatus::Pending => self.clock.sleep(self.opts.init_poll_interval),
            }
        }
    }

    fn transition(&self, inner: &mut ControllerInner, state: ControllerState, timeout: Option<Duration>) {
        tracing::debug!(from = ?inner.state, to = ?state, "controller state transition");
        inner.state = state;
        inner.deadline = timeout.map(|t| self.clock.now() + t);
    }

    /// Gates the next step behind a quirk delay. The deadline moves with it.
    fn delay(&self, inner: &mut ControllerInner, delay: Duration) {
        inner.sleep_until = Some(self.clock.now() + delay);
        if let Some(deadline) = inner.deadline.as_mut() {
            *deadline += delay;
        }
    }

    fn write_cc(&self, cc: ControllerConfig) {
        self.regs.write32(regs::REG_CC, cc.to_raw());
    }

    fn disable_hw(&self, inner: &mut ControllerInner, mut cc: ControllerConfig) {
        cc.enable = false;
        self.write_cc(cc);
        self.transition(inner, ControllerState::DisableWaitForReady0, Some(self.ready_timeout()));
        if self.quirks.contains(Quirks::DELAY_BEFORE_CHECK_READY) {
            self.delay(inner, quirks::DELAY_BEFORE_CHECK_READY);
        }
    }

    fn enable_hw(&self, inner: &mut ControllerInner) {
        self.admin.reinit();
        let entries = self.admin.entries();
        self.regs.write64(regs::REG_ASQ, self.admin.sq_bus());
        self.regs.write64(regs::REG_ACQ, self.admin.cq_bus());
        self.regs
            .write32(regs::REG_AQA, regs::admin_queue_attributes(entries, entries));
        self.write_cc(ControllerConfig {
            enable: true,
            css: 0,
            mps: (self.ctx.page_size.trailing_zeros() - 12) as u8,
            ams: inner.arbitration.cc_ams(),
            shn: CC_SHN_NONE,
            iosqes: 6,
            iocqes: 4,
        });
        self.transition(inner, ControllerState::EnableWaitForReady1, Some(self.ready_timeout()));
    }

    fn process_init(&self, inner: &mut ControllerInner) -> Result<InitStatus> {
        if inner.failed {
            return Err(Error::ControllerFailed);
        }
        let now = self.clock.now();
        if let Some(until) = inner.sleep_until {
            if now < until {
                return Ok(InitStatus::Pending);
            }
            inner.sleep_until = None;
        }

        let cc = ControllerConfig::from_raw(self.regs.read32(regs::REG_CC));
        let csts = ControllerStatus(self.regs.read32(regs::REG_CSTS));

        match inner.state {
            ControllerState::Init => {
                if cc.enable {
                    if csts.ready() {
                        self.disable_hw(inner, cc);
                    } else {
                        self.transition(
                            inner,
                            ControllerState::DisableWaitForReady1,
                            Some(self.ready_timeout()),
                        );
                    }
                } else if csts.ready() {
                    self.transition(
                        inner,
                        ControllerState::DisableWaitForReady0,
                        Some(self.ready_timeout()),
                    );
                } else {
                    self.enable_hw(inner);
                }
            }
            ControllerState::DisableWaitForReady1 => {
                if csts.ready() {
                    self.disable_hw(inner, cc);
                }
            }
            ControllerState::DisableWaitForReady0 => {
                if !csts.ready() {
                    self.enable_hw(inner);
                }
            }
            ControllerState::EnableWaitForReady1 => {
                if csts.ready() {
                    if self.quirks.contains(Quirks::DELAY_AFTER_READY) && !inner.ready_delay_done {
                        inner.ready_delay_done = true;
                        self.delay(inner, quirks::DELAY_AFTER_READY);
                        return Ok(InitStatus::Pending);
                    }
                    if let Err(err) = self.start(inner) {
                        tracing::error!(error = %err, "controller start sequence failed");
                        self.fail_locked(inner);
                        return Err(err);
                    }
                    self.transition(inner, ControllerState::Ready, None);
                    return Ok(InitStatus::Ready);
                }
            }
            ControllerState::Ready => return Ok(InitStatus::Ready),
        }

        if let Some(deadline) = inner.deadline {
            if self.clock.now() > deadline {
                tracing::error!(state = ?inner.state, "timed out waiting for controller ready");
                self.fail_locked(inner);
                return Err(Error::Timeout("controller ready"));
            }
        }
        Ok(InitStatus::Pending)
    }

    /// Everything that runs once CSTS.RDY is first observed.
    fn start(&self, inner: &mut ControllerInner) -> Result<()> {
        self.admin.enable();
        let admin = self.admin_ops();

        let cdata = admin.identify_controller()?;
        let page = self.ctx.page_size as usize;
        inner.max_xfer_size =
            max_transfer_size(page, self.cap.min_page_size() as usize, cdata.mdts);
        self.ctx
            .sgl_supported
            .store(cdata.sgl_supported(), Ordering::Release);
        inner.cdata = Some(cdata);

        let requested = self.opts.num_io_queues.max(1);
        let (nsqa, ncqa) = admin.set_num_queues(requested)?;
        let count = requested.min(nsqa).min(ncqa).min(u16::MAX as u32 - 1) as usize;
        tracing::info!(requested, granted = count, "negotiated I/O queue count");

        let entries = self
            .opts
            .io_queue_size
            .clamp(2, self.cap.max_queue_entries().max(2))
            .min(u16::MAX as u32) as u16;
        if inner.io_qpairs.len() != count || inner.io_queue_entries != entries {
            for slot in inner.io_qpairs.drain(..) {
                slot.qpair.fail();
            }
            inner.io_queue_entries = entries;
            if let Some(cmb) = inner.cmb.as_mut() {
                cmb.used = 0;
            }
            for qid in 1..=count as u16 {
                let cmb_ring = inner
                    .cmb
                    .as_mut()
                    .and_then(|cmb| cmb.alloc_sq(entries, self.ctx.page_size));
                let qpair = self.build_io_qpair(qid, entries, cmb_ring.clone())?;
                inner.io_qpairs.push(IoSlot {
                    qpair,
                    cmb_ring,
                    in_use: false,
                    priority: QueuePriority::Urgent,
                });
            }
        }

        self.refresh_namespaces_locked(inner)?;
        self.configure_aer(inner)?;
        self.load_capability_tables(inner);
        Ok(())
    }

    fn build_io_qpair(&self, qid: u16, entries: u16, ring: Option<SqRing>) -> Result<Arc<QueuePair>> {
        let qpair = QueuePair::new(
            qid,
            entries,
            self.opts.io_queue_requests as usize,
            Arc::clone(&self.ctx),
            ring,
        )?;
        Ok(Arc::new(qpair))
    }

    fn configure_aer(&self, inner: &mut ControllerInner) -> Result<()> {
        let Some(cdata) = inner.cdata.as_ref() else {
            return Ok(());
        };
        let mut config = 0xff;
        if cdata.oaes & OAES_NS_ATTRIBUTE != 0 {
            config |= 1 << 8;
        }
        match self
            .admin_ops()
            .set_features(feature_id::ASYNC_EVENT_CONFIGURATION, config, 0, None)
        {
            Ok(_) => {}
            Err(Error::Command(status)) => {
                tracing::warn!(%status, "async event configuration rejected");
            }
            Err(err) => return Err(err),
        }

        inner.aer_count = aer_slots(
            cdata.aerl,
            self.admin.num_trackers(),
            self.admin.request_capacity(),
        );
        if inner.aer_count < (cdata.aerl as usize + 1).min(MAX_AERS) {
            tracing::warn!(
                aerl = cdata.aerl,
                posted = inner.aer_count,
                "admin queue too small for the advertised event request limit"
            );
        }
        for _ in 0..inner.aer_count {
            submit_aer(&self.admin, &self.aer)?;
        }
        Ok(())
    }

    fn load_capability_tables(&self, inner: &mut ControllerInner) {
        let Some(cdata) = inner.cdata.as_ref() else {
            return;
        };
        let directory = if wants_intel_directory(cdata, self.quirks) {
            let mut buf = vec![0u8; IntelLogDirectory::SIZE];
            match self
                .admin_ops()
                .get_log_page(log_id::INTEL_DIRECTORY, ALL_NAMESPACES, &mut buf)
            {
                Ok(()) => Some(IntelLogDirectory::parse(&buf)),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read Intel log page directory");
                    None
                }
            }
        } else {
            None
        };
        inner.log_pages = supported_log_pages(cdata, self.quirks, directory.as_ref());
        inner.features = supported_features(cdata);
    }

    /// Ids of the namespaces attached to this controller, in `1..=nn`.
    /// Controllers older than 1.1, or that reject the list, report every id.
    fn active_namespace_list(&self, admin: &Admin<'_>, nn: u32) -> Result<Vec<u32>> {
        if self.version < Version::V1_1 {
            return Ok((1..=nn).collect());
        }
        let mut ids = Vec::new();
        let mut start = 0;
        loop {
            let page = match admin.active_namespaces(start) {
                Ok(page) => page,
                Err(Error::Command(status)) => {
                    tracing::debug!(%status, "active namespace list rejected");
                    return Ok((1..=nn).collect());
                }
                Err(err) => return Err(err),
            };
            let full = page.len() == ACTIVE_LIST_IDS;
            let Some(&last) = page.last() else {
                break;
            };
            ids.extend(page.into_iter().filter(|&id| id > start && id <= nn));
            if !full || last <= start || last >= nn {
                break;
            }
            start = last;
        }
        Ok(ids)
    }

    fn refresh_namespaces_locked(&self, inner: &mut ControllerInner) -> Result<()> {
        let Some(cdata) = inner.cdata.as_ref() else {
            return Ok(());
        };
        let admin = self.admin_ops();
        let mut namespaces: Vec<Option<Arc<Namespace>>> = vec![None; cdata.nn as usize];
        for nsid in self.active_namespace_list(&admin, cdata.nn)? {
            let data = match admin.identify_namespace(nsid) {
                Ok(data) => data,
                Err(Error::Command(status)) => {
                    tracing::debug!(nsid, %status, "identify namespace failed");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if data.is_active() {
                namespaces[nsid as usize - 1] = Some(Arc::new(Namespace::from_identify(
                    nsid,
                    data,
                    cdata,
                    self.quirks,
                    inner.max_xfer_size,
                    self.cap.min_page_size(),
                )));
            }
        }
        let active = namespaces.iter().flatten().count();
        inner.open_counts.resize_with(namespaces.len(), Default::default);
        inner.namespaces = namespaces;
        tracing::debug!(active, "namespaces refreshed");
        Ok(())
    }

    fn fail_locked(&self, inner: &mut ControllerInner) {
        if !inner.failed {
            tracing::error!(
                vendor = self.pci_id.vendor,
                device = self.pci_id.device,
                "controller failed"
            );
        }
        inner.failed = true;
        self.admin.fail();
        for slot in &inner.io_qpairs {
            slot.qpair.fail();
        }
    }

    /// Marks the controller failed and completes all pending work with
    /// "aborted by request".
    pub fn fail(&self) {
        let mut inner = self.lock();
        self.fail_locked(&mut inner);
    }

    /// Disables and re-enables the controller, then recreates the hardware
    /// queues of every I/O queue pair in use.
    pub fn reset(&self) -> Result<()> {
        self.locked(|inner| self.reset_locked(inner))
    }

    fn reset_locked(&self, inner: &mut ControllerInner) -> Result<()> {
        if inner.failed {
            return Err(Error::ControllerFailed);
        }
        tracing::info!("resetting controller");

        self.admin.disable();
        for slot in &inner.io_qpairs {
            slot.qpair.disable();
        }
        inner.state = ControllerState::Init;
        inner.deadline = None;
        inner.sleep_until = None;
        inner.ready_delay_done = false;
        self.wait_ready(inner)?;

        let in_use: Vec<_> = inner
            .io_qpairs
            .iter()
            .filter(|slot| slot.in_use)
            .map(|slot| (Arc::clone(&slot.qpair), slot.priority))
            .collect();
        for (qpair, priority) in in_use {
            if let Err(err) = self.create_hw_queues(&qpair, priority) {
                tracing::error!(qid = qpair.id(), error = %err, "failed to recreate I/O queue");
                self.fail_locked(inner);
                return Err(err);
            }
        }
        tracing::info!("controller reset complete");
        Ok(())
    }

    fn create_hw_queues(&self, qpair: &QueuePair, priority: QueuePriority) -> Result<()> {
        let admin = self.admin_ops();
        qpair.reinit();
        admin.create_io_cq(qpair.id(), qpair.entries(), qpair.cq_bus())?;
        if let Err(err) =
            admin.create_io_sq(qpair.id(), qpair.entries(), qpair.sq_bus(), qpair.id(), priority)
        {
            let _ = admin.delete_io_cq(qpair.id());
            return Err(err);
        }
        qpair.enable();
        Ok(())
    }

    /// Takes a free I/O queue pair, creating its hardware queues.
    pub fn acquire_io_qpair(&self, opts: QpairOptions) -> Result<Arc<QueuePair>> {
        self.locked(|inner| self.acquire_locked(inner, opts))
    }

    fn acquire_locked(&self, inner: &mut ControllerInner, opts: QpairOptions) -> Result<Arc<QueuePair>> {
        if inner.failed {
            return Err(Error::ControllerFailed);
        }
        if opts.priority != QueuePriority::Urgent
            && inner.arbitration != Arbitration::WeightedRoundRobin
        {
            return Err(Error::InvalidArgument(
                "queue priority requires weighted round robin arbitration",
            ));
        }
        let default_entries = inner.io_queue_entries;
        let entries = match opts.queue_size {
            None => default_entries,
            Some(n) if n < 2 || n > default_entries as u32 => {
                return Err(Error::InvalidArgument("queue depth out of range"));
            }
            Some(n) => n as u16,
        };

        let index = inner
            .io_qpairs
            .iter()
            .position(|slot| !slot.in_use)
            .ok_or(Error::NoQueuePair)?;
        let qid = index as u16 + 1;
        if inner.io_qpairs[index].qpair.entries() != entries {
            let ring = inner.io_qpairs[index].cmb_ring.clone();
            let qpair = self.build_io_qpair(qid, entries, ring)?;
            std::mem::replace(&mut inner.io_qpairs[index].qpair, qpair).fail();
        }
        let qpair = Arc::clone(&inner.io_qpairs[index].qpair);
        self.create_hw_queues(&qpair, opts.priority)?;

        let slot = &mut inner.io_qpairs[index];
        slot.in_use = true;
        slot.priority = opts.priority;
        tracing::debug!(qid, entries, "I/O queue pair acquired");
        Ok(qpair)
    }

    /// Deletes the pair's hardware queues and returns it to the pool.
    /// Outstanding requests complete with "aborted by request".
    pub fn release_io_qpair(&self, qpair: &Arc<QueuePair>) -> Result<()> {
        self.locked(|inner| self.release_locked(inner, qpair))
    }

    fn release_locked(&self, inner: &mut ControllerInner, qpair: &Arc<QueuePair>) -> Result<()> {
        let slot = inner
            .io_qpairs
            .iter_mut()
            .find(|slot| slot.in_use && Arc::ptr_eq(&slot.qpair, qpair))
            .ok_or(Error::InvalidHandle)?;
        slot.in_use = false;
        qpair.abort_all(false);
        if inner.failed {
            return Ok(());
        }
        let admin = self.admin_ops();
        admin.delete_io_sq(qpair.id())?;
        admin.delete_io_cq(qpair.id())?;
        tracing::debug!(qid = qpair.id(), "I/O queue pair released");
        Ok(())
    }

    /// Polls the admin queue pair, servicing asynchronous events.
    pub fn process_admin_completions(&self) -> Result<usize> {
        self.locked(|inner| self.process_admin_locked(inner))
    }

    fn process_admin_locked(&self, inner: &mut ControllerInner) -> Result<usize> {
        if inner.failed {
            return Err(Error::ControllerFailed);
        }
        let n = self.admin.poll(0);
        if self.aer.ns_changed.swap(false, Ordering::AcqRel) {
            if inner.log_pages.contains(log_id::CHANGED_NS_LIST) {
                let mut buf = vec![0u8; 4096];
                if let Err(err) =
                    self.admin_ops()
                        .get_log_page(log_id::CHANGED_NS_LIST, ALL_NAMESPACES, &mut buf)
                {
                    tracing::warn!(error = %err, "failed to read changed namespace list");
                }
            }
            self.refresh_namespaces_locked(inner)?;
        }
        Ok(n)
    }

    fn with_admin<T>(&self, f: impl FnOnce(&Admin<'_>, &mut ControllerInner) -> Result<T>) -> Result<T> {
        self.locked(|inner| {
            if inner.failed {
                return Err(Error::ControllerFailed);
            }
            f(&self.admin_ops(), inner)
        })
    }

    /// Runs a caller-built admin command.
    pub fn admin_raw(&self, cmd: Command, data: AdminData<'_>) -> Result<Completion> {
        self.with_admin(|admin, _| admin.execute(cmd, data))
    }

    pub fn get_feature(&self, fid: u8, cdw11: u32, data: Option<&mut [u8]>) -> Result<u32> {
        self.with_admin(|admin, _| admin.get_features(fid, cdw11, data))
    }

    pub fn set_feature(&self, fid: u8, cdw11: u32, cdw12: u32, data: Option<&[u8]>) -> Result<u32> {
        self.with_admin(|admin, _| admin.set_features(fid, cdw11, cdw12, data))
    }

    /// Reads a log page the controller is known to implement.
    pub fn get_log_page(&self, lid: u8, nsid: u32, buf: &mut [u8]) -> Result<()> {
        self.with_admin(|admin, inner| {
            if !inner.log_pages.contains(lid) {
                return Err(Error::Unsupported("log page"));
            }
            admin.get_log_page(lid, nsid, buf)
        })
    }

    /// Formats `nsid` (or every namespace with [`ALL_NAMESPACES`]) and
    /// refreshes the namespace table.
    pub fn format(&self, nsid: u32, params: FormatParams) -> Result<()> {
        self.with_admin(|admin, inner| {
            admin.format(nsid, &params)?;
            self.refresh_namespaces_locked(inner)
        })
    }

    /// Downloads `image` and commits it to `slot`. Returns true when the new
    /// image only activates after a reset.
    pub fn firmware_update(&self, image: &[u8], slot: u8, action: CommitAction) -> Result<bool> {
        self.with_admin(|admin, inner| {
            admin.firmware_download(image, inner.max_xfer_size)?;
            match admin.firmware_commit(slot, action) {
                Ok(_) => Ok(false),
                Err(Error::Command(status))
                    if status.is(
                        status_type::COMMAND_SPECIFIC,
                        command_specific_status::FIRMWARE_REQUIRES_RESET,
                    ) =>
                {
                    Ok(true)
                }
                Err(err) => Err(err),
            }
        })
    }

    /// Asks the controller to abort a command. Returns true if it did.
    pub fn abort(&self, sqid: u16, cid: u16) -> Result<bool> {
        self.with_admin(|admin, _| admin.abort(sqid, cid))
    }

    pub fn create_namespace(&self, template: &IdentifyNamespace) -> Result<u32> {
        self.with_admin(|admin, _| {
            let nsid = admin.create_namespace(template)?;
            tracing::info!(nsid, "namespace created");
            Ok(nsid)
        })
    }

    pub fn delete_namespace(&self, nsid: u32) -> Result<()> {
        self.with_admin(|admin, inner| {
            Self::ensure_closed(inner, nsid)?;
            admin.delete_namespace(nsid)?;
            tracing::info!(nsid, "namespace deleted");
            self.refresh_namespaces_locked(inner)
        })
    }

    /// Attaches `nsid` to this controller.
    pub fn attach_namespace(&self, nsid: u32) -> Result<()> {
        self.with_admin(|admin, inner| {
            let cntlid = inner.cdata.as_ref().map_or(0, |c| c.cntlid);
            admin.namespace_attachment(nsid, &[cntlid], true)?;
            self.refresh_namespaces_locked(inner)
        })
    }

    /// Detaches `nsid` from this controller.
    pub fn detach_namespace(&self, nsid: u32) -> Result<()> {
        self.with_admin(|admin, inner| {
            Self::ensure_closed(inner, nsid)?;
            let cntlid = inner.cdata.as_ref().map_or(0, |c| c.cntlid);
            admin.namespace_attachment(nsid, &[cntlid], false)?;
            self.refresh_namespaces_locked(inner)
        })
    }

    fn ensure_closed(inner: &ControllerInner, nsid: u32) -> Result<()> {
        let open = nsid
            .checked_sub(1)
            .and_then(|i| inner.open_counts.get(i as usize))
            .map_or(0, |count| count.load(Ordering::Acquire));
        if open > 0 {
            return Err(Error::Busy);
        }
        Ok(())
    }

    pub fn refresh_namespaces(&self) -> Result<()> {
        self.with_admin(|_, inner| self.refresh_namespaces_locked(inner))
    }

    /// Ids of the namespaces currently attached, as reported by the controller.
    pub fn active_namespace_ids(&self) -> Result<Vec<u32>> {
        self.with_admin(|admin, inner| {
            let nn = inner.cdata.as_ref().map_or(0, |c| c.nn);
            self.active_namespace_list(admin, nn)
        })
    }

    /// Namespace count reported by identify controller.
    pub fn num_namespaces(&self) -> u32 {
        self.lock().cdata.as_ref().map_or(0, |c| c.nn)
    }

    pub fn namespace(&self, nsid: u32) -> Option<Arc<Namespace>> {
        let inner = self.lock();
        inner
            .namespaces
            .get(nsid.checked_sub(1)? as usize)?
            .as_ref()
            .map(Arc::clone)
    }

    pub fn active_namespaces(&self) -> Vec<Arc<Namespace>> {
        self.lock().namespaces.iter().flatten().cloned().collect()
    }

    pub fn open_namespace(&self, nsid: u32) -> Result<NamespaceHandle> {
        let inner = self.lock();
        if inner.failed {
            return Err(Error::ControllerFailed);
        }
        let index = nsid
            .checked_sub(1)
            .ok_or(Error::NamespaceNotFound(nsid))? as usize;
        let ns = inner
            .namespaces
            .get(index)
            .and_then(|ns| ns.as_ref())
            .ok_or(Error::NamespaceNotFound(nsid))?;
        Ok(NamespaceHandle::new(
            Arc::clone(ns),
            Arc::clone(&inner.open_counts[index]),
        ))
    }

    fn shutdown(&self, inner: &ControllerInner) -> Result<()> {
        let admin = self.admin_ops();
        for slot in inner.io_qpairs.iter().filter(|slot| slot.in_use) {
            let qid = slot.qpair.id();
            if let Err(err) = admin.delete_io_sq(qid).and_then(|_| admin.delete_io_cq(qid)) {
                tracing::warn!(qid, error = %err, "failed to delete I/O queue on detach");
            }
        }

        let mut cc = ControllerConfig::from_raw(self.regs.read32(regs::REG_CC));
        cc.shn = CC_SHN_NORMAL;
        self.write_cc(cc);

        let timeout = self.ready_timeout().max(MIN_SHUTDOWN_TIMEOUT);
        let deadline = self.clock.now() + timeout;
        loop {
            let csts = ControllerStatus(self.regs.read32(regs::REG_CSTS));
            if csts.shst() == SHST_COMPLETE {
                tracing::debug!("controller shutdown complete");
                return Ok(());
            }
            if self.clock.now() > deadline {
                tracing::warn!(?timeout, "controller shutdown did not complete");
                return Err(Error::Timeout("controller shutdown"));
            }
            self.clock.sleep(self.opts.init_poll_interval);
        }
    }

    /// Shuts the controller down and releases its mappings. Every queue pair
    /// handed out completes its pending work with "aborted by request".
    pub fn detach(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.detached {
            return Err(Error::InvalidHandle);
        }
        let result = if inner.failed {
            Ok(())
        } else {
            self.shutdown(&inner)
        };

        inner.detached = true;
        inner.failed = true;
        self.admin.fail();
        for slot in inner.io_qpairs.drain(..) {
            slot.qpair.fail();
        }
        inner.namespaces.clear();
        if let Some(cmb) = inner.cmb.take() {
            if cmb.bar != 0 {
                self.platform.unmap_bar(cmb.bar);
            }
        }
        self.platform.unmap_bar(0);
        tracing::info!(
            vendor = self.pci_id.vendor,
            device = self.pci_id.device,
            "controller detached"
        );
        result
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("pci_id", &self.pci_id)
            .field("version", &self.version)
            .field("quirks", &self.quirks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullMmio;

    impl Mmio for NullMmio {
        fn read32(&self, _offset: u64) -> u32 {
            0
        }

        fn write32(&self, _offset: u64, _value: u32) {}
    }

    fn cmb(size: u64) -> Cmb {
        Cmb {
            window: Arc::new(NullMmio),
            bar: 2,
            offset: 0x2000,
            bus: 0xfe00_2000,
            size,
            used: 0,
        }
    }

    #[test]
    fn cmb_allocations_are_page_aligned() {
        let mut cmb = cmb(0x10000);
        assert_eq!(cmb.alloc(100, 4096), Some((0x2000, 0xfe00_2000)));
        assert_eq!(cmb.alloc(64, 4096), Some((0x3000, 0xfe00_3000)));
        assert_eq!(cmb.used, 0x1040);
    }

    #[test]
    fn cmb_exhaustion_falls_back() {
        let mut cmb = cmb(0x4000);
        assert!(cmb.alloc_sq(64, 4096).is_some());
        assert!(cmb.alloc_sq(256, 4096).is_none());
        assert!(cmb.alloc_sq(32, 4096).is_some());
    }

    #[test]
    fn max_transfer_follows_mdts() {
        assert_eq!(max_transfer_size(4096, 4096, 0), 512 * 4096);
        assert_eq!(max_transfer_size(4096, 4096, 5), 128 * 1024);
        assert_eq!(max_transfer_size(4096, 4096, 60), 512 * 4096);
        assert_eq!(max_transfer_size(4096, 4096, 200), 512 * 4096);
    }

    #[test]
    fn event_requests_leave_admin_room() {
        assert_eq!(aer_slots(3, 31, 64), 4);
        assert_eq!(aer_slots(255, 255, 64), MAX_AERS);
        assert_eq!(aer_slots(7, 3, 64), 2);
        assert_eq!(aer_slots(7, 31, 3), 2);
        assert_eq!(aer_slots(7, 1, 64), 0);
    }

    struct Bars([u32; 6]);

    impl PciConfig for Bars {
        fn read32(&self, offset: u16) -> u32 {
            self.0[(offset as usize - 0x10) / 4]
        }

        fn write32(&self, _offset: u16, _value: u32) {}
    }

    #[test]
    fn bar_addresses() {
        let bars = Bars([0xfebf_0004, 0x0000_0001, 0xfe00_0000, 0, 0, 0]);
        assert_eq!(bar_bus_address(&bars, 0), 0x1_febf_0000);
        assert_eq!(bar_bus_address(&bars, 2), 0xfe00_0000);
    }
}
