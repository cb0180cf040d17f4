//! Millisecond clock with an injectable time source.
//!
//! The monitor never reads the system clock directly; everything that needs
//! the time is handed a `Clock`. Tests drive a `Cell`-backed source to step
//! time deterministically.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Clock {
    source: Rc<dyn Fn() -> u64>,
    last: Rc<Cell<u64>>,
}

impl Clock {
    pub fn new(source: Rc<dyn Fn() -> u64>) -> Clock {
        Clock {
            source,
            last: Rc::new(Cell::new(0)),
        }
    }

    pub fn system() -> Clock {
        Clock::new(Rc::new(|| {
            let t = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            t.as_millis() as u64
        }))
    }

    /// A clock driven by the supplied cell. Reads return whatever the cell
    /// holds at the time.
    pub fn manual(cell: Rc<Cell<u64>>) -> Clock {
        Clock::new(Rc::new(move || cell.get()))
    }

    /// Current time in milliseconds. Never moves backwards, even if the
    /// underlying source does.
    pub fn now_ms(&self) -> u64 {
        let t = (self.source)();
        if t > self.last.get() {
            self.last.set(t);
        }
        self.last.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_follows_cell() {
        let cell = Rc::new(Cell::new(5));
        let c = Clock::manual(cell.clone());
        assert_eq!(c.now_ms(), 5);
        cell.set(17);
        assert_eq!(c.now_ms(), 17);
    }

    #[test]
    fn never_goes_backwards() {
        let cell = Rc::new(Cell::new(100));
        let c = Clock::manual(cell.clone());
        assert_eq!(c.now_ms(), 100);
        cell.set(40);
        assert_eq!(c.now_ms(), 100);
        cell.set(101);
        assert_eq!(c.now_ms(), 101);
    }
}
