//! Final operation statistics.

use std::time::Instant;

use chrono::{DateTime, Local};

pub struct OpTimer {
    wall_started: DateTime<Local>,
    started: Instant,
}

impl OpTimer {
    pub fn start() -> Self {
        Self { wall_started: Local::now(), started: Instant::now() }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Print start/end timestamps, elapsed time, and aggregate bandwidth.
    pub fn finish(&self, bytes: u64) {
        let secs = self.elapsed_secs();
        let rate = if secs > 0.0 { bytes as f64 / secs } else { 0.0 };
        let fmt = "%b-%d-%Y, %H:%M:%S";
        println!("[partar] Started:   {}", self.wall_started.format(fmt));
        println!("[partar] Completed: {}", Local::now().format(fmt));
        println!("[partar] Seconds: {:.3}", secs);
        println!("[partar] Bytes: {:.3} MiB ({} bytes)", bytes as f64 / (1024.0 * 1024.0), bytes);
        println!("[partar] Rate: {:.3} MiB/s", rate / (1024.0 * 1024.0));
    }
}
