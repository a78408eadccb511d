use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use crate::{Error, Result};

/// Timer expiry callback.
pub type Tick = Box<dyn Fn() + Send + Sync>;

/// Periodic timer used for interval-triggered sampling.
pub trait Timer: Send + Sync {
    /// Starts calling `tick` every `period`, with the first call made
    /// immediately. Replaces any previously started timer.
    fn start(&self, period: Duration, tick: Tick) -> Result<()>;

    /// Stops the timer. May be called from within `tick`.
    fn stop(&self);
}

/// Timer backed by a dedicated thread.
#[derive(Debug, Default)]
pub struct ThreadTimer(Arc<Shared>);

#[derive(Debug, Default)]
struct Shared {
    gen: Mutex<u64>,
    cv: Condvar,
}

impl ThreadTimer {
    /// Creates a stopped timer.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Timer for ThreadTimer {
    fn start(&self, period: Duration, tick: Tick) -> Result<()> {
        let gen = {
            let mut g = self.0.gen.lock();
            *g = g.wrapping_add(1);
            *g
        };
        self.0.cv.notify_all();
        let s = Arc::clone(&self.0);
        let r = std::thread::Builder::new()
            .name("warble-adc-timer".to_owned())
            .spawn(move || {
                let mut next = Instant::now();
                loop {
                    {
                        let mut g = s.gen.lock();
                        while *g == gen && Instant::now() < next {
                            s.cv.wait_until(&mut g, next);
                        }
                        if *g != gen {
                            trace!("Timer {gen} stopped");
                            return;
                        }
                    }
                    tick();
                    next += period;
                }
            });
        r.map(|_| ()).map_err(|e| {
            error!("Failed to spawn timer thread: {e}");
            Error::Timer
        })
    }

    fn stop(&self) {
        let mut g = self.0.gen.lock();
        *g = g.wrapping_add(1);
        self.0.cv.notify_all();
    }
}

impl Drop for ThreadTimer {
    #[inline]
    fn drop(&mut self) {
        self.stop();
    }
}
