use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::apm::event::TopologyEvent;
use crate::error::Result;

pub type EventHook = Box<dyn Fn(&TopologyEvent) + Send + Sync>;

/// Holds the hooks run for every topology event.
pub struct Listener {
    no_hooks: AtomicBool,
    hooks: RwLock<Vec<EventHook>>,
}

impl Default for Listener {
    fn default() -> Self {
        Listener::new()
    }
}

impl Listener {
    pub fn new() -> Listener {
        Listener {
            no_hooks: AtomicBool::new(true),
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn add_hook(&self, hook: EventHook) -> Result<()> {
        let mut guard = self.hooks.write()?;
        self.no_hooks.store(false, Ordering::SeqCst);
        guard.deref_mut().push(hook);
        Ok(())
    }

    /// Runs every hook, in registration order, against `event`.
    pub fn run_hooks(&self, event: &TopologyEvent) -> Result<()> {
        if self.no_hooks.load(Ordering::SeqCst) {
            return Ok(());
        }

        let guard = self.hooks.read()?;

        for hook in guard.deref().iter() {
            hook(event);
        }

        Ok(())
    }
}
