//! Telemetry line emission. One function, called from `Tunnel::drop`.

use std::time::Duration;

/// Prints `Hostname: <host>, Size: <bytes> bytes, Time: <seconds>.3f sec`
/// to stdout.
pub fn emit(host: &str, bytes: u64, elapsed: Duration) {
    println!(
        "Hostname: {host}, Size: {bytes} bytes, Time: {:.3} sec",
        elapsed.as_secs_f64()
    );
}
