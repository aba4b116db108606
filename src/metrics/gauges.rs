//! Level gauges that also remember their high-water mark.

use std::fmt::Write;
use std::sync::atomic::{AtomicI64, Ordering};

/// Amount of work currently in flight, such as transfer chunks.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
    peak: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicI64::new(0),
            peak: AtomicI64::new(0),
        }
    }

    /// One more unit in flight.
    pub fn inc(&self) {
        let now = self.value.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
    }

    /// One unit done.
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Highest level seen since the node started.
    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Acquire)
    }

    /// Append the level and its peak in Prometheus text format.
    pub fn write_to(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} gauge", self.name);
        let _ = writeln!(out, "{} {}", self.name, self.get());
        let _ = writeln!(out, "# TYPE {}_peak gauge", self.name);
        let _ = writeln!(out, "{}_peak {}", self.name, self.peak());
    }
}
