//! Online/offline tracking

use tokio::sync::watch;

/// Edge reported when connectivity flips
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CameOnline,
    WentOffline,
}

/// Latest known connectivity, fed by the platform and by probes.
pub struct Reachability {
    tx: watch::Sender<bool>,
}

impl Reachability {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record a connectivity report. Repeated reports of the same state
    /// return `None`.
    pub fn update(&self, online: bool) -> Option<Transition> {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        match (changed, online) {
            (false, _) => None,
            (true, true) => Some(Transition::CameOnline),
            (true, false) => Some(Transition::WentOffline),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
