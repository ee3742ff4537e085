//! Channel presence: SYNC stream assembly, membership reconciliation, and
//! re-entry of this client's own members after a non-resumed attach.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::watch;

use crate::message::{PresenceAction, PresenceMessage};

/// Decide whether `candidate` supersedes `existing`. Ids carry a
/// `<connId>:<msgSerial>:<index>` shape; a greater serial wins, ties fall to
/// the timestamp.
pub(crate) fn is_newer(candidate: &PresenceMessage, existing: &PresenceMessage) -> bool {
    match (id_serial(candidate), id_serial(existing)) {
        (Some(a), Some(b)) if a != b => a > b,
        _ => candidate.timestamp.unwrap_or(0) > existing.timestamp.unwrap_or(0),
    }
}

fn id_serial(msg: &PresenceMessage) -> Option<(i64, i64)> {
    let id = msg.id.as_deref()?;
    let mut parts = id.split(':');
    let _conn = parts.next()?;
    let serial = parts.next()?.parse().ok()?;
    let index = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    Some((serial, index))
}

/// Whether a SYNC cursor of the form `<cursor>:<remaining>` marks the end of
/// the sync sequence.
fn sync_complete(channel_serial: Option<&str>) -> bool {
    match channel_serial {
        None => true,
        Some(serial) => match serial.split_once(':') {
            Some((_, remaining)) => remaining.is_empty() || remaining == "0",
            None => serial.is_empty(),
        },
    }
}

#[derive(Default)]
struct PresenceMap {
    members: HashMap<String, PresenceMessage>,
    /// Members entered through this client, re-entered after a non-resumed
    /// attach.
    internal: HashMap<String, PresenceMessage>,
    sync_in_progress: bool,
    /// Keys observed during the current sync; everything else is absent at
    /// completion.
    seen_in_sync: HashSet<String>,
    /// Realtime presence arriving mid-sync, integrated at completion.
    buffered: Vec<PresenceMessage>,
}

impl PresenceMap {
    fn apply(&mut self, msg: PresenceMessage) -> bool {
        let key = msg.member_key();
        match msg.action {
            PresenceAction::Enter | PresenceAction::Present | PresenceAction::Update => {
                if let Some(existing) = self.members.get(&key) {
                    if !is_newer(&msg, existing) {
                        return false;
                    }
                }
                let mut record = msg;
                record.action = PresenceAction::Present;
                self.members.insert(key, record);
                true
            }
            PresenceAction::Leave | PresenceAction::Absent => {
                match self.members.get(&key) {
                    Some(existing) if is_newer(&msg, existing) => {
                        self.members.remove(&key);
                        true
                    }
                    _ => false,
                }
            }
        }
    }
}

/// Per-channel presence state. Internally synchronized; reads see either the
/// pre-sync or the post-sync membership, never a partial sync presented as
/// complete.
pub(crate) struct PresenceState {
    map: Mutex<PresenceMap>,
    sync_done_tx: watch::Sender<bool>,
    sync_done_rx: watch::Receiver<bool>,
}

impl PresenceState {
    pub fn new() -> Self {
        // No sync has been requested yet; the set is trivially complete.
        let (tx, rx) = watch::channel(true);
        PresenceState {
            map: Mutex::new(PresenceMap::default()),
            sync_done_tx: tx,
            sync_done_rx: rx,
        }
    }

    fn map(&self) -> std::sync::MutexGuard<'_, PresenceMap> {
        self.map.lock().expect("presence map poisoned")
    }

    /// Current members. Combine with [`wait_sync`](Self::wait_sync) for a
    /// complete snapshot.
    pub fn members(&self) -> Vec<PresenceMessage> {
        self.map().members.values().cloned().collect()
    }

    pub fn internal_members(&self) -> Vec<PresenceMessage> {
        self.map().internal.values().cloned().collect()
    }

    /// Resolves once no sync is in progress.
    pub async fn wait_sync(&self) {
        let mut rx = self.sync_done_rx.clone();
        // wait_for yields immediately when already true.
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn sync_in_progress(&self) -> bool {
        self.map().sync_in_progress
    }

    /// The server announced presence will follow (HAS_PRESENCE); gate reads
    /// until the SYNC stream completes.
    pub fn expect_sync(&self) {
        let mut map = self.map();
        map.sync_in_progress = true;
        map.seen_in_sync.clear();
        let _ = self.sync_done_tx.send(false);
    }

    /// Apply one SYNC frame's members. Returns the members whose visible
    /// state changed.
    pub fn process_sync(
        &self,
        channel_serial: Option<&str>,
        members: Vec<PresenceMessage>,
    ) -> Vec<PresenceMessage> {
        let mut changed = Vec::new();
        let mut map = self.map();
        if !map.sync_in_progress {
            map.sync_in_progress = true;
            map.seen_in_sync.clear();
            let _ = self.sync_done_tx.send(false);
        }
        for member in members {
            map.seen_in_sync.insert(member.member_key());
            if map.apply(member.clone()) {
                changed.push(member);
            }
        }
        if sync_complete(channel_serial) {
            changed.extend(self.finish_sync(&mut map));
        }
        changed
    }

    fn finish_sync(&self, map: &mut PresenceMap) -> Vec<PresenceMessage> {
        let mut changed = Vec::new();

        // Members absent from the sync are gone.
        let stale: Vec<String> = map
            .members
            .keys()
            .filter(|k| !map.seen_in_sync.contains(*k))
            .cloned()
            .collect();
        for key in stale {
            if let Some(mut member) = map.members.remove(&key) {
                member.action = PresenceAction::Absent;
                changed.push(member);
            }
        }

        // Integrate realtime events that arrived mid-sync.
        for msg in std::mem::take(&mut map.buffered) {
            if map.apply(msg.clone()) {
                changed.push(msg);
            }
        }

        map.sync_in_progress = false;
        map.seen_in_sync.clear();
        let _ = self.sync_done_tx.send(true);
        changed
    }

    /// Apply a realtime PRESENCE event. Mid-sync events are buffered and
    /// integrated when the sync completes.
    pub fn apply_realtime(&self, msg: PresenceMessage) -> bool {
        let mut map = self.map();
        if map.sync_in_progress {
            map.buffered.push(msg);
            return false;
        }
        map.apply(msg)
    }

    /// Record a member entered through this client.
    pub fn track_internal(&self, msg: PresenceMessage) {
        let key = msg.member_key();
        self.map().internal.insert(key, msg);
    }

    pub fn untrack_internal(&self, key: &str) {
        self.map().internal.remove(key);
    }

    /// Forget everything; used when the attach explicitly lost continuity.
    pub fn reset(&self) {
        let mut map = self.map();
        map.members.clear();
        map.buffered.clear();
        map.seen_in_sync.clear();
        map.sync_in_progress = false;
        let _ = self.sync_done_tx.send(true);
    }
}
