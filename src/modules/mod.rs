//! Module host: background threads that feed live data into the runtime.
//!
//! Each [`Module`] runs on its own named thread and talks to the scene state
//! only through the [`ModuleContext`] it is handed. Stopping is cooperative:
//! [`ModuleHost::shutdown`] raises a shared [`StopSignal`] and joins every
//! thread, and modules notice through [`ModuleContext::wait`] or
//! [`ModuleContext::is_stopped`].
//!
//! # Built-in modules
//!
//! - [`head_tracker::HeadTracker`] - pose records from a device node
//! - [`hotplug::Hotplug`] - display connector add/remove
//! - [`script::Script`] - Lua scripts driving system matrices

pub mod head_tracker;
pub mod hotplug;
pub mod script;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::config::ModulesConfig;
use crate::constants::MODULE_STOP_POLL;
use crate::protocol::{Matrix, MatrixKind, UpdateMode};
use crate::runtime::Runtime;

/// A unit of background work.
pub trait Module: Send {
    /// Short name used for the thread and log lines.
    fn name(&self) -> &str;

    /// Run until `ctx` reports stop. Called once, on the module's thread.
    fn run(self: Box<Self>, ctx: ModuleContext);
}

/// Shared stop flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// New, not stopped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request stop.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration` in short slices. Returns `false` as soon as
    /// stop is requested, `true` if the full duration elapsed.
    pub fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(MODULE_STOP_POLL));
        }
    }
}

/// Everything a module may touch.
#[derive(Clone)]
pub struct ModuleContext {
    name: Arc<str>,
    runtime: Arc<dyn Runtime>,
    stop: StopSignal,
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("name", &self.name)
            .field("stopped", &self.stop.is_stopped())
            .finish_non_exhaustive()
    }
}

impl ModuleContext {
    /// Context for module `name`.
    pub fn new(name: &str, runtime: Arc<dyn Runtime>, stop: StopSignal) -> Self {
        Self { name: Arc::from(name), runtime, stop }
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Debug-level log line tagged with the module name.
    pub fn debug(&self, msg: impl std::fmt::Display) {
        log::debug!(target: "module", "[{}] {msg}", self.name);
    }

    /// Info-level log line tagged with the module name.
    pub fn info(&self, msg: impl std::fmt::Display) {
        log::info!(target: "module", "[{}] {msg}", self.name);
    }

    /// Error-level log line tagged with the module name.
    pub fn error(&self, msg: impl std::fmt::Display) {
        log::error!(target: "module", "[{}] {msg}", self.name);
    }

    /// Write a global system matrix slot.
    pub fn update_system_matrix_module(&self, kind: MatrixKind, mode: UpdateMode, m: Matrix) {
        self.runtime.update_system_matrix_module(kind, mode, m);
    }

    /// Read a global system matrix slot.
    pub fn system_matrix(&self, kind: MatrixKind) -> Matrix {
        self.runtime.system_matrix(None, kind)
    }

    /// Whether the host asked modules to stop.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Cooperative sleep. Returns `false` once stop is signalled.
    pub fn wait(&self, duration: Duration) -> bool {
        self.stop.wait(duration)
    }
}

/// Owns the module threads.
pub struct ModuleHost {
    runtime: Arc<dyn Runtime>,
    stop: StopSignal,
    threads: Vec<(String, JoinHandle<()>)>,
}

impl std::fmt::Debug for ModuleHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHost")
            .field("modules", &self.running())
            .field("stopped", &self.stop.is_stopped())
            .finish_non_exhaustive()
    }
}

impl ModuleHost {
    /// Host with no modules running.
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self { runtime, stop: StopSignal::new(), threads: Vec::new() }
    }

    /// Start `module` on a named thread.
    pub fn spawn(&mut self, module: Box<dyn Module>) -> Result<()> {
        let name = module.name().to_owned();
        let ctx = ModuleContext::new(&name, Arc::clone(&self.runtime), self.stop.clone());
        let handle = thread::Builder::new()
            .name(format!("module-{name}"))
            .spawn(move || module.run(ctx))
            .with_context(|| format!("Failed to spawn module thread: {name}"))?;
        log::info!("[modules] started {name}");
        self.threads.push((name, handle));
        Ok(())
    }

    /// Names of modules whose threads have not been joined.
    pub fn running(&self) -> Vec<&str> {
        self.threads.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Signal stop and join every module thread.
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.stop.stop();
        for (name, handle) in self.threads.drain(..) {
            match handle.join() {
                Ok(()) => log::info!("[modules] {name} stopped"),
                Err(_) => log::error!("[modules] {name} panicked"),
            }
        }
    }
}

impl Drop for ModuleHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Instantiate the built-in modules enabled in `config`.
pub fn from_config(config: &ModulesConfig) -> Vec<Box<dyn Module>> {
    let mut modules: Vec<Box<dyn Module>> = Vec::new();
    if let Some(device) = &config.head_tracker_device {
        modules.push(Box::new(head_tracker::HeadTracker::new(
            device.clone(),
            Duration::from_millis(config.head_tracker_poll_ms),
        )));
    }
    if let Some(dir) = &config.hotplug_dir {
        modules.push(Box::new(hotplug::Hotplug::new(
            dir.clone(),
            Duration::from_millis(config.hotplug_poll_ms),
        )));
    }
    if let Some(path) = &config.script {
        modules.push(Box::new(script::Script::new(
            path.clone(),
            Duration::from_millis(config.script_tick_ms),
        )));
    }
    modules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IDENTITY;
    use crate::runtime::SharedRuntime;

    struct Ticker {
        count: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl Module for Ticker {
        fn name(&self) -> &str {
            "ticker"
        }

        fn run(self: Box<Self>, ctx: ModuleContext) {
            let mut m = IDENTITY;
            while ctx.wait(Duration::from_millis(1)) {
                m[12] += 1.0;
                ctx.update_system_matrix_module(MatrixKind::Body, UpdateMode::Set, m);
                self.count.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    struct Panicker;

    impl Module for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }

        fn run(self: Box<Self>, _ctx: ModuleContext) {
            panic!("module failure");
        }
    }

    #[test]
    fn test_wait_returns_false_after_stop() {
        let stop = StopSignal::new();
        assert!(stop.wait(Duration::from_millis(1)));
        stop.stop();
        let started = Instant::now();
        assert!(!stop.wait(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_notices_stop_within_a_slice() {
        let stop = StopSignal::new();
        let remote = stop.clone();
        let waiter = thread::spawn(move || remote.wait(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        stop.stop();
        let started = Instant::now();
        assert!(!waiter.join().unwrap());
        assert!(started.elapsed() < MODULE_STOP_POLL * 4);
    }

    #[test]
    fn test_host_runs_and_joins_modules() {
        let runtime: Arc<dyn Runtime> = Arc::new(SharedRuntime::default());
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut host = ModuleHost::new(Arc::clone(&runtime));
        host.spawn(Box::new(Ticker { count: Arc::clone(&count) })).unwrap();
        assert_eq!(host.running(), vec!["ticker"]);

        while count.load(Ordering::SeqCst) < 5 {
            thread::sleep(Duration::from_millis(1));
        }
        host.shutdown();
        assert!(host.running().is_empty());

        let after = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), after, "thread stopped");
        assert!(runtime.system_matrix(None, MatrixKind::Body)[12] >= 5.0);
    }

    #[test]
    fn test_panicking_module_does_not_poison_host() {
        let runtime: Arc<dyn Runtime> = Arc::new(SharedRuntime::default());
        let mut host = ModuleHost::new(runtime);
        host.spawn(Box::new(Panicker)).unwrap();
        host.shutdown();
        assert!(host.running().is_empty());
    }

    #[test]
    fn test_from_config_respects_enabled_modules() {
        let mut config = ModulesConfig::default();
        config.hotplug_dir = None;
        assert!(from_config(&config).is_empty());

        config.script = Some("/tmp/does-not-matter.lua".into());
        config.hotplug_dir = Some("/dev/dri".into());
        let names: Vec<String> = from_config(&config).iter().map(|m| m.name().to_owned()).collect();
        assert_eq!(names, vec!["hotplug", "script"]);
    }
}
