//! Per task diagnostics.
//!
//! A [`Monitor`] records a tree of timed [`Watch`]es, one per stage and service execution,
//! with free-form log lines attached. A disabled monitor records nothing and every call on
//! it returns immediately.

use std::borrow::Cow;
use std::time::{Duration, Instant};

/// Handle of one watch inside its monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchId(usize);

/// A timed span of work.
#[derive(Debug, Clone)]
pub struct Watch {
    name: Cow<'static, str>,
    parent: Option<WatchId>,
    started: Instant,
    elapsed: Option<Duration>,
    logs: Vec<String>,
}

impl Watch {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<WatchId> {
        self.parent
    }

    /// Duration of the watch, `None` while it is still running.
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }
}

#[derive(Debug, Clone, Default)]
pub enum Monitor {
    #[default]
    Disabled,
    Enabled(Vec<Watch>),
}

impl Monitor {
    pub fn enabled() -> Self {
        Monitor::Enabled(Vec::new())
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        matches!(self, Monitor::Enabled(_))
    }

    /// Starts a new watch below `parent`.
    #[inline]
    pub fn start(&mut self, name: impl Into<Cow<'static, str>>, parent: Option<WatchId>) -> WatchId {
        match self {
            Monitor::Disabled => WatchId(0),
            Monitor::Enabled(watches) => {
                watches.push(Watch { name: name.into(), parent, started: Instant::now(), elapsed: None, logs: vec![] });
                WatchId(watches.len() - 1)
            }
        }
    }

    #[inline]
    pub fn stop(&mut self, id: WatchId) {
        if let Monitor::Enabled(watches) = self
            && let Some(watch) = watches.get_mut(id.0)
        {
            watch.elapsed = Some(watch.started.elapsed());
        }
    }

    #[inline]
    pub fn log(&mut self, id: WatchId, line: impl Into<String>) {
        if let Monitor::Enabled(watches) = self
            && let Some(watch) = watches.get_mut(id.0)
        {
            watch.logs.push(line.into());
        }
    }

    pub fn watches(&self) -> &[Watch] {
        match self {
            Monitor::Disabled => &[],
            Monitor::Enabled(watches) => watches,
        }
    }

    pub fn get(&self, id: WatchId) -> Option<&Watch> {
        self.watches().get(id.0)
    }
}
