#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use nvme_host::{Completion, Controller, ControllerOptions, DmaMemory, DmaRegion, QueuePair, Status};
use nvme_sim::{SimConfig, SimMemory, SimPlatform};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn attach(config: SimConfig) -> (Arc<SimPlatform>, Controller) {
    attach_with(config, ControllerOptions::default())
}

pub fn attach_with(config: SimConfig, opts: ControllerOptions) -> (Arc<SimPlatform>, Controller) {
    init_tracing();
    let plat = SimPlatform::new(config);
    let ctrlr = Controller::attach(plat.clone(), opts).expect("controller attach");
    (plat, ctrlr)
}

/// A DMA buffer in simulated memory, freed on drop.
pub struct Buffer {
    mem: Arc<SimMemory>,
    region: DmaRegion,
}

impl Buffer {
    pub fn new(plat: &SimPlatform, len: usize) -> Self {
        let mem = Arc::clone(plat.dma());
        let region = mem.alloc(len, 4096).expect("dma alloc");
        mem.zero(&region);
        Self { mem, region }
    }

    pub fn vaddr(&self) -> u64 {
        self.region.vaddr
    }

    pub fn bus(&self) -> u64 {
        self.region.bus
    }

    pub fn fill(&self, data: &[u8]) {
        self.mem.write_cpu(self.region.vaddr, data);
    }

    pub fn contents(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.region.len];
        self.mem.read_cpu(self.region.vaddr, &mut out);
        out
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.mem.free(self.region);
    }
}

/// Collects completions delivered to request callbacks.
#[derive(Clone, Default)]
pub struct Outcomes(Arc<Mutex<Vec<Completion>>>);

impl Outcomes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl FnOnce(&Completion) + Send + 'static {
        let slot = Arc::clone(&self.0);
        move |cpl| slot.lock().unwrap().push(*cpl)
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn statuses(&self) -> Vec<Status> {
        self.0.lock().unwrap().iter().map(|c| c.status).collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.statuses().iter().all(Status::is_success)
    }
}

/// Polls until `outcomes` holds `n` completions.
pub fn poll_until(qpair: &QueuePair, outcomes: &Outcomes, n: usize) {
    for _ in 0..1000 {
        if outcomes.len() >= n {
            return;
        }
        qpair.poll(0);
    }
    panic!("expected {n} completions, saw {}", outcomes.len());
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
