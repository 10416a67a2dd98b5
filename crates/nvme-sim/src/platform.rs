use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use nvme_host::{Clock, DmaMemory, Mmio, PciConfig, Platform};

use crate::clock::SimClock;
use crate::config::SimConfig;
use crate::controller::{SimController, CMB_ADDRESS, CMB_BAR};
use crate::memory::SimMemory;
use crate::pci::SimPciConfig;

#[derive(Default)]
struct BarState {
    mapped: Vec<(u8, bool)>,
    unmapped: Vec<u8>,
    failing: HashSet<u8>,
}

/// One simulated PCI function with its memory, clock and controller.
pub struct SimPlatform {
    pci: Arc<SimPciConfig>,
    memory: Arc<SimMemory>,
    clock: Arc<SimClock>,
    controller: Arc<SimController>,
    bars: Mutex<BarState>,
}

impl SimPlatform {
    pub fn new(config: SimConfig) -> Arc<Self> {
        let cmb = (config.cmb_size > 0).then_some((CMB_BAR, CMB_ADDRESS));
        let pci = Arc::new(SimPciConfig::new(config.pci_id, cmb));
        let memory = Arc::new(SimMemory::new(config.memory_size));
        let clock = Arc::new(SimClock::new());
        let controller = Arc::new(SimController::new(
            config,
            Arc::clone(&clock),
            Arc::clone(&pci),
            Arc::clone(&memory),
        ));
        Arc::new(Self {
            pci,
            memory,
            clock,
            controller,
            bars: Mutex::new(BarState::default()),
        })
    }

    fn bars(&self) -> MutexGuard<'_, BarState> {
        self.bars.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn device(&self) -> &Arc<SimController> {
        &self.controller
    }

    pub fn dma(&self) -> &Arc<SimMemory> {
        &self.memory
    }

    pub fn sim_clock(&self) -> &Arc<SimClock> {
        &self.clock
    }

    pub fn pci_config(&self) -> &Arc<SimPciConfig> {
        &self.pci
    }

    /// Makes every later `map_bar(bar, ..)` fail.
    pub fn fail_bar_map(&self, bar: u8) {
        self.bars().failing.insert(bar);
    }

    /// BARs mapped so far, with their write-combine flag.
    pub fn mapped_bars(&self) -> Vec<(u8, bool)> {
        self.bars().mapped.clone()
    }

    pub fn unmapped_bars(&self) -> Vec<u8> {
        self.bars().unmapped.clone()
    }
}

impl Platform for SimPlatform {
    fn pci(&self) -> Arc<dyn PciConfig> {
        self.pci.clone()
    }

    fn map_bar(&self, bar: u8, write_combine: bool) -> Option<Arc<dyn Mmio>> {
        let mut bars = self.bars();
        if bars.failing.contains(&bar) {
            return None;
        }
        let window: Arc<dyn Mmio> = match bar {
            0 => self.controller.clone(),
            CMB_BAR => self.controller.cmb()?,
            _ => return None,
        };
        bars.mapped.push((bar, write_combine));
        Some(window)
    }

    fn unmap_bar(&self, bar: u8) {
        self.bars().unmapped.push(bar);
    }

    fn memory(&self) -> Arc<dyn DmaMemory> {
        self.memory.clone()
    }

    fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }
}
