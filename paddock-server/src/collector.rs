//! System metrics snapshot.
//!
//! The engine treats the snapshot as opaque JSON; it rides along in
//! `states` entries and heartbeat bodies so operators can see what a host
//! is doing. A persistent `sysinfo::System` is kept so CPU usage is a delta
//! between refreshes rather than a meaningless first read.

use serde_json::{Value, json};
use sysinfo::System;

pub struct Collector {
    sys: parking_lot::Mutex<System>,
    started: std::time::Instant,
}

impl Collector {
    pub fn new() -> Self {
        Self {
            sys: parking_lot::Mutex::new(System::new()),
            started: std::time::Instant::now(),
        }
    }

    pub fn snapshot(&self) -> Value {
        let mut sys = self.sys.lock();
        sys.refresh_memory();
        sys.refresh_cpu_usage();

        let load = System::load_average();
        json!({
            "hostname": System::host_name(),
            "os": System::long_os_version(),
            "cpu_count": sys.cpus().len(),
            "cpu_percent": sys.global_cpu_usage(),
            "memory_total": sys.total_memory(),
            "memory_used": sys.used_memory(),
            "load_avg": [load.one, load.five, load.fifteen],
            "host_uptime": System::uptime(),
            "process_uptime": self.started.elapsed().as_secs(),
        })
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_has_expected_shape() {
        let c = Collector::new();
        let snap = c.snapshot();
        assert!(snap["cpu_count"].as_u64().unwrap() >= 1);
        assert!(snap["memory_total"].is_u64());
        assert!(snap["load_avg"].as_array().unwrap().len() == 3);
    }
}
