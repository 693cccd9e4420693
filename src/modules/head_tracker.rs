//! Head tracker: reads pose records from a device node or FIFO and
//! publishes them as the global `Head` matrix.
//!
//! Record layout, little-endian, 28 bytes:
//!
//! ```text
//! [f32 qx][f32 qy][f32 qz][f32 qw][f32 px][f32 py][f32 pz]
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::time::Duration;

use super::{Module, ModuleContext};
use crate::protocol::{Matrix, MatrixKind, UpdateMode};
use crate::store::matrix;

/// Size of one pose record.
pub const RECORD_SIZE: usize = 28;

const REOPEN_INTERVAL: Duration = Duration::from_secs(1);

/// Pose reader module.
#[derive(Debug)]
pub struct HeadTracker {
    device: PathBuf,
    poll: Duration,
}

impl HeadTracker {
    /// Read from `device`, sleeping `poll` when no data is pending.
    pub fn new(device: PathBuf, poll: Duration) -> Self {
        Self { device, poll }
    }

    fn open(&self) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.device)
    }
}

impl Module for HeadTracker {
    fn name(&self) -> &str {
        "head-tracker"
    }

    fn run(self: Box<Self>, ctx: ModuleContext) {
        let mut reported = false;
        let mut device = loop {
            match self.open() {
                Ok(f) => break f,
                Err(e) => {
                    if !reported {
                        ctx.error(format!("cannot open {}: {e}", self.device.display()));
                        reported = true;
                    }
                    if !ctx.wait(REOPEN_INTERVAL) {
                        return;
                    }
                }
            }
        };
        ctx.info(format!("reading poses from {}", self.device.display()));

        let mut pending: Vec<u8> = Vec::with_capacity(RECORD_SIZE * 2);
        let mut chunk = [0u8; RECORD_SIZE * 16];
        let mut applied: u64 = 0;

        while !ctx.is_stopped() {
            match device.read(&mut chunk) {
                Ok(0) => {
                    if !ctx.wait(self.poll) {
                        break;
                    }
                }
                Ok(n) => {
                    pending.extend_from_slice(&chunk[..n]);
                    if let Some(m) = drain_latest(&mut pending) {
                        ctx.update_system_matrix_module(MatrixKind::Head, UpdateMode::Set, m);
                        applied += 1;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !ctx.wait(self.poll) {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    ctx.error(format!("read failed: {e}"));
                    break;
                }
            }
        }
        ctx.debug(format!("stopped after {applied} pose updates"));
    }
}

/// Consume every complete record in `pending` and return the pose of the
/// newest valid one. A partial trailing record stays buffered.
pub fn drain_latest(pending: &mut Vec<u8>) -> Option<Matrix> {
    let complete = pending.len() / RECORD_SIZE * RECORD_SIZE;
    let latest = pending[..complete]
        .chunks_exact(RECORD_SIZE)
        .rev()
        .find_map(parse_record);
    pending.drain(..complete);
    latest
}

/// Decode one record. Non-finite values are rejected.
pub fn parse_record(record: &[u8]) -> Option<Matrix> {
    if record.len() != RECORD_SIZE {
        return None;
    }
    let mut v = [0.0f32; 7];
    for (i, slot) in v.iter_mut().enumerate() {
        let b = &record[i * 4..i * 4 + 4];
        *slot = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
    }
    if !v.iter().all(|x| x.is_finite()) {
        return None;
    }
    Some(matrix::pose([v[0], v[1], v[2], v[3]], [v[4], v[5], v[6]]))
}

/// Encode a pose record (test and tooling helper).
pub fn encode_record(orientation: [f32; 4], position: [f32; 3]) -> [u8; RECORD_SIZE] {
    let mut out = [0u8; RECORD_SIZE];
    for (i, v) in orientation.iter().chain(position.iter()).enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ModuleHost;
    use crate::runtime::{Runtime, SharedRuntime};
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn test_parse_record_translation() {
        let m = parse_record(&encode_record([0.0, 0.0, 0.0, 1.0], [0.1, 1.6, -0.2])).unwrap();
        assert!((m[13] - 1.6).abs() < 1e-6);
        assert!((m[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_non_finite_record_rejected() {
        assert!(parse_record(&encode_record([f32::NAN, 0.0, 0.0, 1.0], [0.0; 3])).is_none());
    }

    #[test]
    fn test_drain_keeps_partial_record() {
        let mut pending = encode_record([0.0, 0.0, 0.0, 1.0], [1.0, 0.0, 0.0]).to_vec();
        pending.extend_from_slice(&encode_record([0.0, 0.0, 0.0, 1.0], [2.0, 0.0, 0.0]));
        pending.extend_from_slice(&[0u8; 5]);
        let m = drain_latest(&mut pending).unwrap();
        assert_eq!(m[12], 2.0);
        assert_eq!(pending.len(), 5);
        assert!(drain_latest(&mut pending).is_none());
    }

    #[test]
    fn test_module_publishes_head_pose() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&encode_record([0.0, 0.0, 0.0, 1.0], [0.0, 1.75, 0.0])).unwrap();
        file.flush().unwrap();

        let runtime: Arc<dyn Runtime> = Arc::new(SharedRuntime::default());
        let mut host = ModuleHost::new(Arc::clone(&runtime));
        host.spawn(Box::new(HeadTracker::new(
            file.path().to_path_buf(),
            Duration::from_millis(1),
        )))
        .unwrap();

        let mut seen = 0.0;
        for _ in 0..500 {
            seen = runtime.system_matrix(None, MatrixKind::Head)[13];
            if seen != 0.0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        host.shutdown();
        assert!((seen - 1.75).abs() < 1e-6);
    }

    #[test]
    fn test_missing_device_stops_promptly() {
        let runtime: Arc<dyn Runtime> = Arc::new(SharedRuntime::default());
        let mut host = ModuleHost::new(runtime);
        host.spawn(Box::new(HeadTracker::new(
            PathBuf::from("/nonexistent/vrms-head"),
            Duration::from_millis(1),
        )))
        .unwrap();
        let started = std::time::Instant::now();
        host.shutdown();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
