use parking_lot::{Condvar, Mutex};

/// A reusable barrier that puts threads to sleep until a fixed number of
/// them have arrived. The driver uses it as its stop-the-world rendezvous.
#[derive(Debug, Default)]
pub struct SenseBarrier {
    /// (arrived, sense)
    state: Mutex<(usize, bool)>,
    cvar: Condvar,
}

impl SenseBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((0, false)),
            cvar: Condvar::new(),
        }
    }

    /// Blocks until `until` threads have called this function. Returns
    /// true on exactly one of them, the last to arrive.
    pub fn wait(&self, until: usize) -> bool {
        let mut state = self.state.lock();
        let my_sense = state.1;
        state.0 += 1;

        if state.0 == until {
            state.0 = 0;
            state.1 = !my_sense;
            self.cvar.notify_all();
            return true;
        }
        while state.1 == my_sense {
            self.cvar.wait(&mut state);
        }
        false
    }
}
