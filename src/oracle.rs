//! Connectivity and session oracles.
//!
//! Both are external collaborators: the host application wires them to the
//! platform's network events and its token storage. The sync core only ever
//! asks two boolean questions, so the traits stay minimal and object-safe.

use std::sync::atomic::{AtomicBool, Ordering};

/// Reports whether the network is believed to be reachable.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Reports whether a valid access credential is present. The sync manager
/// treats "no session" identically to "offline".
pub trait Session: Send + Sync {
    fn has_session(&self) -> bool;
}

/// Flag-backed oracle for wiring and tests. The host flips the flags from
/// its network/auth event handlers.
#[derive(Debug)]
pub struct FlagOracle {
    online: AtomicBool,
    session: AtomicBool,
}

impl FlagOracle {
    pub fn new(online: bool, session: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            session: AtomicBool::new(session),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_session(&self, session: bool) {
        self.session.store(session, Ordering::SeqCst);
    }
}

impl Default for FlagOracle {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl Connectivity for FlagOracle {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

impl Session for FlagOracle {
    fn has_session(&self) -> bool {
        self.session.load(Ordering::SeqCst)
    }
}
