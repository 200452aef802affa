//! Lifecycle entry points and the proxy scanner.
//!
//! When a patch adds a lifecycle method to a type that never declared one,
//! there is no runtime slot to detour and no cached entry to redirect. The
//! entry-point manager records `(type, kind) → method id`, and a coarse scan
//! attaches a forwarding proxy to every live component of the registered
//! types so the host scheduler still reaches the new method.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::keys::MethodId;
use crate::runtime::lock;

/// The fixed set of scheduler callbacks the host invokes on components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleKind {
    Init,
    Tick,
    FixedTick,
    Draw,
    Destroy,
}

impl LifecycleKind {
    pub const ALL: [LifecycleKind; 5] = [
        LifecycleKind::Init,
        LifecycleKind::Tick,
        LifecycleKind::FixedTick,
        LifecycleKind::Draw,
        LifecycleKind::Destroy,
    ];

    pub fn method_name(self) -> &'static str {
        match self {
            LifecycleKind::Init => "OnInit",
            LifecycleKind::Tick => "OnTick",
            LifecycleKind::FixedTick => "OnFixedTick",
            LifecycleKind::Draw => "OnDraw",
            LifecycleKind::Destroy => "OnDestroy",
        }
    }

    pub fn from_method_name(name: &str) -> Option<LifecycleKind> {
        Self::ALL.into_iter().find(|k| k.method_name() == name)
    }
}

/// A lifecycle entry point is a zero-argument, void, instance method whose
/// name is in the fixed set.
pub fn is_lifecycle_method(name: &str, param_count: usize, ret: &str, is_static: bool) -> bool {
    !is_static && param_count == 0 && ret == "void" && LifecycleKind::from_method_name(name).is_some()
}

/// Minimum idle time between proxy scans.
pub const SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// Per-type lifecycle registrations plus the scan pacing state.
pub struct EntryPointManager {
    registrations: Mutex<HashMap<String, HashMap<LifecycleKind, MethodId>>>,
    last_scan: Mutex<Option<Instant>>,
}

impl EntryPointManager {
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(HashMap::new()),
            last_scan: Mutex::new(None),
        }
    }

    pub fn register(&self, type_name: &str, kind: LifecycleKind, id: MethodId) {
        lock(&self.registrations)
            .entry(type_name.to_string())
            .or_default()
            .insert(kind, id);
    }

    pub fn registrations_for(&self, type_name: &str) -> Option<HashMap<LifecycleKind, MethodId>> {
        lock(&self.registrations).get(type_name).cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        lock(&self.registrations).keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.registrations).is_empty()
    }

    /// Cleared on playmode exit together with the hook tables.
    pub fn clear(&self) {
        lock(&self.registrations).clear();
        *lock(&self.last_scan) = None;
    }

    /// Attach proxies to live components of every registered type. Returns
    /// the number of newly attached proxies. Rate-limited unless `force`.
    pub fn scan(&self, host: &dyn crate::host::HostServices, force: bool) -> usize {
        {
            let mut last = lock(&self.last_scan);
            if !force
                && let Some(at) = *last
                && at.elapsed() < SCAN_INTERVAL
            {
                return 0;
            }
            *last = Some(Instant::now());
        }

        let registrations = lock(&self.registrations).clone();
        let mut attached = 0;
        for (type_name, hooks) in &registrations {
            for target in host.enumerate_live_components(type_name) {
                if host.attach_proxy(&target, hooks) {
                    attached += 1;
                }
            }
        }
        if attached > 0 {
            log::debug!(target: "respatch::dispatcher", "attached {attached} lifecycle proxies");
        }
        attached
    }
}

impl Default for EntryPointManager {
    fn default() -> Self {
        Self::new()
    }
}
