//! Table of attached controllers addressed by generation-checked handles.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::controller::Controller;
use crate::options::ControllerOptions;
use crate::platform::Platform;
use crate::{Error, Result};

/// Names a registry slot. A handle outlives its controller safely: once the
/// slot is vacated or reused, lookups with it fail with
/// [`Error::InvalidHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControllerHandle {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    ctrlr: Option<Arc<Controller>>,
}

#[derive(Default)]
pub struct Registry {
    slots: Mutex<Vec<Slot>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Brings a controller up and stores it. Bring-up runs without the
    /// registry lock held.
    pub fn attach(&self, platform: Arc<dyn Platform>, opts: ControllerOptions) -> Result<ControllerHandle> {
        let ctrlr = Arc::new(Controller::attach(platform, opts)?);
        Ok(self.insert(ctrlr))
    }

    pub fn insert(&self, ctrlr: Arc<Controller>) -> ControllerHandle {
        let mut slots = self.lock();
        if let Some(index) = slots.iter().position(|slot| slot.ctrlr.is_none()) {
            let slot = &mut slots[index];
            slot.ctrlr = Some(ctrlr);
            return ControllerHandle {
                index: index as u32,
                generation: slot.generation,
            };
        }
        slots.push(Slot {
            generation: 0,
            ctrlr: Some(ctrlr),
        });
        ControllerHandle {
            index: slots.len() as u32 - 1,
            generation: 0,
        }
    }

    pub fn get(&self, handle: ControllerHandle) -> Result<Arc<Controller>> {
        let slots = self.lock();
        slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.ctrlr.clone())
            .ok_or(Error::InvalidHandle)
    }

    /// Vacates the slot, then shuts the controller down. The handle is
    /// invalid afterwards even if shutdown reports an error.
    pub fn detach(&self, handle: ControllerHandle) -> Result<()> {
        let ctrlr = {
            let mut slots = self.lock();
            let slot = slots
                .get_mut(handle.index as usize)
                .filter(|slot| slot.generation == handle.generation && slot.ctrlr.is_some())
                .ok_or(Error::InvalidHandle)?;
            slot.generation = slot.generation.wrapping_add(1);
            slot.ctrlr.take().ok_or(Error::InvalidHandle)?
        };
        ctrlr.detach()
    }

    pub fn len(&self) -> usize {
        self.lock().iter().filter(|slot| slot.ctrlr.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<ControllerHandle> {
        self.lock()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.ctrlr.is_some())
            .map(|(index, slot)| ControllerHandle {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }
}
