//! Application-wide constants for vrms.
//!
//! Protocol limits and timing values live here so the codec, the server and
//! the client library agree on them.
//!
//! # Categories
//!
//! - **Protocol**: frame limits and reply shape
//! - **Store**: object limits
//! - **Timeouts**: connection and module pacing

use std::time::Duration;

// ============================================================================
// Protocol
// ============================================================================

/// Maximum payload size of a single request frame, in bytes.
///
/// Frames declaring a larger payload are skipped and answered with
/// `INVALID_REQUEST`; the payload is never buffered.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Size of the frame header: `[u8 type][u16 LE payload_len]`.
pub const FRAME_HEADER_SIZE: usize = 3;

/// Size of an encoded reply: `{i32 id, i32 error_code}`.
pub const REPLY_SIZE: usize = 8;

/// Maximum scene name length (the length prefix is a single byte).
pub const MAX_SCENE_NAME_LEN: usize = 255;

/// Read buffer used by the server per `recvmsg` call.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Maximum descriptors accepted in one ancillary message.
///
/// Anything beyond this is truncated by the kernel (`MSG_CTRUNC`), which
/// the server treats as a malformed transfer.
pub const MAX_FDS_PER_READ: usize = 4;

/// Maximum socket path length (`sun_path` is 104 bytes on macOS, 108 on Linux).
pub const MAX_SOCKET_PATH: usize = 104;

// ============================================================================
// Store
// ============================================================================

/// Default cap on live objects per scene before creation reports
/// `OUT_OF_MEMORY`.
pub const DEFAULT_MAX_OBJECTS_PER_SCENE: usize = 65_536;

/// Maximum number of instructions in one program.
pub const MAX_PROGRAM_INSTRUCTIONS: usize = 256;

// ============================================================================
// Timeouts
// ============================================================================

/// Default idle timeout before a silent connection is torn down.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Upper bound on a single cooperative sleep slice in module loops.
///
/// `ModuleContext::wait` sleeps in slices of at most this length so a stop
/// request is noticed promptly.
pub const MODULE_STOP_POLL: Duration = Duration::from_millis(50);

/// How often the main thread checks the signal flag.
pub const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default head-tracker poll interval.
pub const DEFAULT_HEAD_TRACKER_POLL: Duration = Duration::from_millis(2);

/// Default script tick interval (~60 Hz).
pub const DEFAULT_SCRIPT_TICK: Duration = Duration::from_millis(16);

/// Default hotplug poll interval.
pub const DEFAULT_HOTPLUG_POLL: Duration = Duration::from_millis(250);
