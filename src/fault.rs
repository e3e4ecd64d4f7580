//! Fault injection for exercising failure paths without real I/O errors.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
enum Arming {
    Persistent,
    Remaining(u32),
}

/// A registry of armed fault sites.
///
/// A component that supports fault injection owns a registry and consults
/// it at its failure points, so injected faults are scoped to that one
/// instance rather than the whole process: tests arm sites through the
/// owning component's handle and need no cleanup, because the armed state
/// dies with the instance. A site can be armed persistently or for a fixed
/// number of hits, after which it disarms itself.
#[derive(Debug, Default)]
pub struct Faults {
    armed: Mutex<HashMap<String, Arming>>,
}

impl Faults {
    /// An empty registry, pre-arming any sites named in the
    /// `GRANITE_FAULTS` environment variable (a comma-separated list) so
    /// whole-process runs can inject faults without code changes.
    pub fn from_env() -> Self {
        let faults = Self::default();
        if let Ok(raw) = std::env::var("GRANITE_FAULTS") {
            let mut armed = faults.armed.lock().unwrap();
            for site in raw.split(',') {
                let site = site.trim();
                if !site.is_empty() {
                    armed.insert(site.to_string(), Arming::Persistent);
                }
            }
        }
        faults
    }

    /// Arms `site` to fail on every hit until disarmed.
    pub fn arm(&self, site: &str) {
        self.armed
            .lock()
            .unwrap()
            .insert(site.to_string(), Arming::Persistent);
    }

    /// Arms `site` to fail on the next `count` hits, then disarm itself.
    pub fn arm_times(&self, site: &str, count: u32) {
        if count == 0 {
            return;
        }
        self.armed
            .lock()
            .unwrap()
            .insert(site.to_string(), Arming::Remaining(count));
    }

    pub fn disarm(&self, site: &str) {
        self.armed.lock().unwrap().remove(site);
    }

    pub fn disarm_all(&self) {
        self.armed.lock().unwrap().clear();
    }

    pub fn is_armed(&self, site: &str) -> bool {
        self.armed.lock().unwrap().contains_key(site)
    }

    /// Consulted at a fault site: returns an error while the site is
    /// armed, counting down one-shot armings as it goes.
    pub fn check(&self, site: &str) -> io::Result<()> {
        let mut armed = self.armed.lock().unwrap();
        let exhausted = match armed.get_mut(site) {
            None => return Ok(()),
            Some(Arming::Persistent) => false,
            Some(Arming::Remaining(count)) => {
                *count -= 1;
                *count == 0
            }
        };
        if exhausted {
            armed.remove(site);
        }
        Err(io::Error::other(format!("injected fault: {site}")))
    }
}
