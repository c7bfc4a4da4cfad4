//! Thread affinity
//!
//! Per-core register reads only mean something when the calling thread is
//! running on that core. `AffinityGuard` pins for the duration of a scope
//! and restores the previous affinity on drop. Pinning does not nest.

use std::cell::Cell;
use std::fmt;

use tracing::trace;

use crate::constants::ring0::MAX_THREADS;
use crate::error::{CorewatchError, Result};

/// Affinity in effect before a pin.
///
/// Pin masks only address the first 64 CPUs, so the OS set is kept whole
/// and restored as-is.
#[derive(Clone, Copy)]
pub struct SavedAffinity {
    mask: u64,
    #[cfg(target_os = "linux")]
    os: Option<libc::cpu_set_t>,
}

impl SavedAffinity {
    pub fn from_mask(mask: u64) -> Self {
        Self {
            mask,
            #[cfg(target_os = "linux")]
            os: None,
        }
    }

    /// The part of the affinity below CPU 64.
    pub fn mask(&self) -> u64 {
        self.mask
    }
}

impl fmt::Debug for SavedAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SavedAffinity({:#x})", self.mask)
    }
}

/// Something that can move the calling thread between logical CPUs.
pub trait AffinityControl: Send + Sync {
    /// Pin the calling thread to `mask` and return the affinity in effect
    /// before the call. A zero mask is a no-op returning an empty mask.
    fn set(&self, mask: u64) -> Result<SavedAffinity>;

    /// Put back what an earlier `set` returned.
    fn restore(&self, saved: &SavedAffinity) -> Result<()> {
        self.set(saved.mask()).map(|_| ())
    }
}

/// Mask selecting a single logical CPU.
pub fn thread_mask(thread: usize) -> Result<u64> {
    if thread >= MAX_THREADS {
        return Err(CorewatchError::affinity(0, format!("thread {} exceeds 64-bit mask", thread)));
    }
    Ok(1u64 << thread)
}

/// OS thread affinity.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadAffinity;

impl ThreadAffinity {
    pub fn set(mask: u64) -> Result<SavedAffinity> {
        if mask == 0 {
            return Ok(SavedAffinity::from_mask(0));
        }
        os::set(mask)
    }
}

impl AffinityControl for ThreadAffinity {
    fn set(&self, mask: u64) -> Result<SavedAffinity> {
        ThreadAffinity::set(mask)
    }

    fn restore(&self, saved: &SavedAffinity) -> Result<()> {
        os::restore(saved)
    }
}

#[cfg(target_os = "linux")]
mod os {
    use std::mem;

    use super::*;

    const SET_SIZE: usize = mem::size_of::<libc::cpu_set_t>();

    fn os_error(mask: u64) -> CorewatchError {
        CorewatchError::affinity(mask, std::io::Error::last_os_error().to_string())
    }

    pub(super) fn saved(set: libc::cpu_set_t) -> SavedAffinity {
        let mut mask = 0u64;
        for cpu in 0..MAX_THREADS {
            // SAFETY: cpu is below CPU_SETSIZE.
            if unsafe { libc::CPU_ISSET(cpu, &set) } {
                mask |= 1u64 << cpu;
            }
        }
        SavedAffinity { mask, os: Some(set) }
    }

    pub(super) fn current() -> Result<libc::cpu_set_t> {
        // SAFETY: cpu_set_t is plain data; zeroed is a valid empty set and
        // sched_getaffinity writes at most SET_SIZE bytes into it.
        unsafe {
            let mut set: libc::cpu_set_t = mem::zeroed();
            if libc::sched_getaffinity(0, SET_SIZE, &mut set) != 0 {
                return Err(os_error(0));
            }
            Ok(set)
        }
    }

    fn apply(set: &libc::cpu_set_t, mask: u64) -> Result<()> {
        // SAFETY: `set` is a fully initialised cpu_set_t of SET_SIZE bytes.
        if unsafe { libc::sched_setaffinity(0, SET_SIZE, set) } != 0 {
            return Err(os_error(mask));
        }
        Ok(())
    }

    pub fn set(mask: u64) -> Result<SavedAffinity> {
        let previous = saved(current()?);

        // SAFETY: zeroed is a valid empty set and every cpu is below CPU_SETSIZE.
        let wanted = unsafe {
            let mut wanted: libc::cpu_set_t = mem::zeroed();
            for cpu in 0..MAX_THREADS {
                if mask & (1u64 << cpu) != 0 {
                    libc::CPU_SET(cpu, &mut wanted);
                }
            }
            wanted
        };
        apply(&wanted, mask)?;

        trace!(mask, previous = previous.mask(), "Pinned thread");
        Ok(previous)
    }

    pub fn restore(saved: &SavedAffinity) -> Result<()> {
        match &saved.os {
            Some(set) => apply(set, saved.mask()),
            None if saved.mask() == 0 => Ok(()),
            None => set(saved.mask()).map(|_| ()),
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod os {
    use super::*;

    pub fn set(mask: u64) -> Result<SavedAffinity> {
        Err(CorewatchError::affinity(mask, "thread affinity not supported on this platform"))
    }

    pub fn restore(saved: &SavedAffinity) -> Result<()> {
        if saved.mask() == 0 {
            return Ok(());
        }
        set(saved.mask()).map(|_| ())
    }
}

thread_local! {
    static PINNED: Cell<bool> = const { Cell::new(false) };
}

/// Scoped pin to a CPU mask.
///
/// Dropping the guard restores the mask that was active before. A second
/// guard on the same thread while one is alive is rejected.
pub struct AffinityGuard<'a> {
    control: &'a dyn AffinityControl,
    previous: SavedAffinity,
    active: bool,
}

impl<'a> AffinityGuard<'a> {
    pub fn pin(control: &'a dyn AffinityControl, mask: u64) -> Result<Self> {
        if mask == 0 {
            return Ok(Self {
                control,
                previous: SavedAffinity::from_mask(0),
                active: false,
            });
        }
        if PINNED.with(|p| p.get()) {
            return Err(CorewatchError::affinity(mask, "thread already pinned"));
        }
        let previous = control.set(mask)?;
        PINNED.with(|p| p.set(true));
        Ok(Self { control, previous, active: true })
    }

    /// Low 64 CPUs of the affinity this guard restores.
    pub fn previous(&self) -> u64 {
        self.previous.mask()
    }
}

impl Drop for AffinityGuard<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(e) = self.control.restore(&self.previous) {
            trace!(error = %e, "Could not restore affinity");
        }
        PINNED.with(|p| p.set(false));
    }
}
