//! Ephemeral "who is here" state for a document room.
//!
//! ## Architecture
//!
//! ```text
//! SessionManager::set_presence()
//!       │
//!       ▼
//! PresenceDirectory::set_local()  ──▶ AwarenessUpdate { clock + 1 }
//!       │
//!       ▼   (awareness channel)
//! Remote PresenceDirectory::observe()
//!       │  (stale clocks dropped, silent peers expire)
//!       ▼
//! on_presence(&[PeerPresence])
//! ```
//!
//! Nothing here is durable: a directory is rebuilt from scratch on every
//! session open and peers repopulate it by re-announcing themselves.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::{MessageType, PeerMetadata, ProtocolError, SyncMessage};

/// Peers that stay silent longer than this are considered gone.
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(30);

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGB color for a peer's caret and name tag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl CursorColor {
    /// Generate a stable, visually distinct color from a UUID.
    ///
    /// Hue comes from the id; saturation and lightness are fixed so every
    /// peer gets an equally readable color.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b }
    }

    /// CSS hex form, `#rrggbb`.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Wire form
// ───────────────────────────────────────────────────────────────────

/// One peer's awareness state as carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessUpdate {
    pub peer_id: Uuid,
    /// Per-peer monotonic clock; receivers drop anything not newer.
    pub clock: u64,
    /// `None` means the peer left the room.
    pub state: Option<PeerMetadata>,
}

impl AwarenessUpdate {
    /// Encode for the awareness channel.
    pub fn to_message(&self) -> SyncMessage {
        SyncMessage::awareness(self.peer_id, self.clock, self.state.as_ref())
    }

    /// Decode an awareness frame. Fails on any other message type.
    pub fn from_message(msg: &SyncMessage) -> Result<Self, ProtocolError> {
        if msg.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType(msg.msg_type));
        }
        Ok(Self {
            peer_id: msg.peer_id,
            clock: msg.clock,
            state: msg.awareness_state()?,
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Directory
// ───────────────────────────────────────────────────────────────────

/// Snapshot entry for one present peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPresence {
    pub peer_id: Uuid,
    pub display_name: String,
    pub display_color: String,
    pub last_seen_at: Instant,
    pub is_local: bool,
}

/// What an observed update did to the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    Joined,
    Updated,
    /// Same metadata re-announced; only the liveness timestamp moved.
    Refreshed,
    Departed,
    /// The update changed nothing visible, but silent peers timed out.
    Expired,
    /// Stale clock, our own echo, or a leave for an unknown peer.
    Ignored,
}

impl PresenceChange {
    /// Whether the visible peer list changed.
    pub fn is_visible(self) -> bool {
        matches!(
            self,
            Self::Joined | Self::Updated | Self::Departed | Self::Expired
        )
    }
}

#[derive(Debug, Clone)]
struct RemotePeer {
    metadata: PeerMetadata,
    last_seen_at: Instant,
}

/// Presence state for one session: the local peer plus every remote peer
/// heard from within the timeout.
pub struct PresenceDirectory {
    local_peer_id: Uuid,
    local: PeerMetadata,
    local_clock: u64,
    peers: HashMap<Uuid, RemotePeer>,
    /// Highest clock seen per peer. Outlives the peer entry so a delayed
    /// update cannot resurrect a peer that already left.
    clocks: HashMap<Uuid, u64>,
    timeout: Duration,
}

impl PresenceDirectory {
    /// Directory for the local peer using [`DEFAULT_PRESENCE_TIMEOUT`].
    pub fn new(local_peer_id: Uuid, local: PeerMetadata) -> Self {
        Self::with_timeout(local_peer_id, local, DEFAULT_PRESENCE_TIMEOUT)
    }

    /// Directory that forgets silent peers after `timeout`.
    pub fn with_timeout(local_peer_id: Uuid, local: PeerMetadata, timeout: Duration) -> Self {
        Self {
            local_peer_id,
            local,
            local_clock: 0,
            peers: HashMap::new(),
            clocks: HashMap::new(),
            timeout,
        }
    }

    pub fn local_peer_id(&self) -> Uuid {
        self.local_peer_id
    }

    pub fn local_metadata(&self) -> &PeerMetadata {
        &self.local
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Replace the local metadata and return the update to broadcast.
    pub fn set_local(&mut self, metadata: PeerMetadata) -> AwarenessUpdate {
        self.local = metadata;
        self.announce()
    }

    /// Re-announce the local state so remote directories keep us alive.
    pub fn heartbeat(&mut self) -> AwarenessUpdate {
        self.announce()
    }

    /// Announce the local state on a fresh connection.
    ///
    /// The relay says goodbye on our behalf with the clock after the last
    /// one it saw, so that clock is skipped.
    pub fn rejoin(&mut self) -> AwarenessUpdate {
        self.local_clock += 1;
        self.announce()
    }

    /// Update announcing that the local peer left the room.
    pub fn leave(&mut self) -> AwarenessUpdate {
        self.local_clock += 1;
        AwarenessUpdate {
            peer_id: self.local_peer_id,
            clock: self.local_clock,
            state: None,
        }
    }

    fn announce(&mut self) -> AwarenessUpdate {
        self.local_clock += 1;
        AwarenessUpdate {
            peer_id: self.local_peer_id,
            clock: self.local_clock,
            state: Some(self.local.clone()),
        }
    }

    /// Apply a remote awareness update received at `now`.
    ///
    /// Silent peers are evicted first. When the update itself leaves the
    /// visible list alone but an eviction did not, the result is
    /// [`PresenceChange::Expired`].
    pub fn observe(&mut self, update: AwarenessUpdate, now: Instant) -> PresenceChange {
        let expired = self.expire(now);
        let change = self.apply(update, now);
        if !expired.is_empty() && !change.is_visible() {
            PresenceChange::Expired
        } else {
            change
        }
    }

    fn apply(&mut self, update: AwarenessUpdate, now: Instant) -> PresenceChange {
        if update.peer_id == self.local_peer_id {
            return PresenceChange::Ignored;
        }
        if let Some(&seen) = self.clocks.get(&update.peer_id) {
            if update.clock <= seen {
                log::trace!(
                    "Dropping stale awareness from {} (clock {} <= {})",
                    update.peer_id,
                    update.clock,
                    seen
                );
                return PresenceChange::Ignored;
            }
        }
        self.clocks.insert(update.peer_id, update.clock);

        match update.state {
            None => match self.peers.remove(&update.peer_id) {
                Some(_) => PresenceChange::Departed,
                None => PresenceChange::Ignored,
            },
            Some(metadata) => match self.peers.get_mut(&update.peer_id) {
                Some(peer) => {
                    peer.last_seen_at = now;
                    if peer.metadata == metadata {
                        PresenceChange::Refreshed
                    } else {
                        peer.metadata = metadata;
                        PresenceChange::Updated
                    }
                }
                None => {
                    self.peers.insert(
                        update.peer_id,
                        RemotePeer {
                            metadata,
                            last_seen_at: now,
                        },
                    );
                    PresenceChange::Joined
                }
            },
        }
    }

    /// Evict peers not heard from within the timeout. Returns their ids.
    pub fn expire(&mut self, now: Instant) -> Vec<Uuid> {
        let timeout = self.timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen_at) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.peers.remove(id);
        }
        if !stale.is_empty() {
            log::debug!("Expired {} silent peers", stale.len());
        }
        stale
    }

    /// Forget every remote peer, keeping clocks so stale replays stay
    /// ignored.
    pub fn clear_remote(&mut self) -> bool {
        let had_peers = !self.peers.is_empty();
        self.peers.clear();
        had_peers
    }

    /// Present peers at `now`, local peer included, sorted by display name
    /// then id. Expired peers are evicted first.
    pub fn list(&mut self, now: Instant) -> Vec<PeerPresence> {
        self.expire(now);

        let mut out: Vec<PeerPresence> = self
            .peers
            .iter()
            .map(|(id, p)| PeerPresence {
                peer_id: *id,
                display_name: p.metadata.display_name.clone(),
                display_color: p.metadata.display_color.clone(),
                last_seen_at: p.last_seen_at,
                is_local: false,
            })
            .collect();
        out.push(PeerPresence {
            peer_id: self.local_peer_id,
            display_name: self.local.display_name.clone(),
            display_color: self.local.display_color.clone(),
            last_seen_at: now,
            is_local: true,
        });
        out.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then(a.peer_id.cmp(&b.peer_id))
        });
        out
    }

    /// Number of remote peers currently tracked (expiry not applied).
    pub fn remote_count(&self) -> usize {
        self.peers.len()
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str) -> PeerMetadata {
        PeerMetadata::new(name, "#000000")
    }

    fn update(peer_id: Uuid, clock: u64, name: Option<&str>) -> AwarenessUpdate {
        AwarenessUpdate {
            peer_id,
            clock,
            state: name.map(meta),
        }
    }

    fn directory() -> PresenceDirectory {
        PresenceDirectory::new(Uuid::new_v4(), meta("Me"))
    }

    // ── Color tests ──────────────────────────────────────────────

    #[test]
    fn test_cursor_color_from_uuid_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(CursorColor::from_uuid(id), CursorColor::from_uuid(id));
    }

    #[test]
    fn test_cursor_color_hex() {
        assert_eq!(CursorColor { r: 1.0, g: 0.0, b: 0.5 }.to_hex(), "#ff0080");
        let hex = CursorColor::from_uuid(Uuid::new_v4()).to_hex();
        assert_eq!(hex.len(), 7);
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_hsl_to_rgb_achromatic() {
        let (r, g, b) = hsl_to_rgb(0.0, 0.0, 0.5);
        assert_eq!((r, g, b), (0.5, 0.5, 0.5));
    }

    // ── Observe tests ────────────────────────────────────────────

    #[test]
    fn test_join_update_refresh() {
        let mut dir = directory();
        let bob = Uuid::new_v4();
        let now = Instant::now();

        assert_eq!(dir.observe(update(bob, 1, Some("Bob")), now), PresenceChange::Joined);
        assert_eq!(dir.observe(update(bob, 2, Some("Bob")), now), PresenceChange::Refreshed);
        assert_eq!(dir.observe(update(bob, 3, Some("Robert")), now), PresenceChange::Updated);
        assert_eq!(dir.remote_count(), 1);
    }

    #[test]
    fn test_stale_clock_ignored() {
        let mut dir = directory();
        let bob = Uuid::new_v4();
        let now = Instant::now();

        dir.observe(update(bob, 5, Some("Bob")), now);
        assert_eq!(dir.observe(update(bob, 4, Some("Old")), now), PresenceChange::Ignored);
        assert_eq!(dir.observe(update(bob, 5, Some("Old")), now), PresenceChange::Ignored);

        let names: Vec<String> = dir.list(now).into_iter().map(|p| p.display_name).collect();
        assert!(names.contains(&"Bob".to_string()));
    }

    #[test]
    fn test_leave_then_stale_join_does_not_resurrect() {
        let mut dir = directory();
        let bob = Uuid::new_v4();
        let now = Instant::now();

        dir.observe(update(bob, 1, Some("Bob")), now);
        assert_eq!(dir.observe(update(bob, 3, None), now), PresenceChange::Departed);
        assert_eq!(dir.observe(update(bob, 2, Some("Bob")), now), PresenceChange::Ignored);
        assert_eq!(dir.remote_count(), 0);
    }

    #[test]
    fn test_own_echo_ignored() {
        let mut dir = directory();
        let own = dir.set_local(meta("Me again"));
        assert_eq!(dir.observe(own, Instant::now()), PresenceChange::Ignored);
        assert_eq!(dir.remote_count(), 0);
    }

    #[test]
    fn test_leave_for_unknown_peer_ignored() {
        let mut dir = directory();
        assert_eq!(
            dir.observe(update(Uuid::new_v4(), 1, None), Instant::now()),
            PresenceChange::Ignored
        );
    }

    // ── Expiry tests ─────────────────────────────────────────────

    #[test]
    fn test_expiry_after_timeout() {
        let mut dir =
            PresenceDirectory::with_timeout(Uuid::new_v4(), meta("Me"), Duration::from_secs(30));
        let bob = Uuid::new_v4();
        let t0 = Instant::now();
        dir.observe(update(bob, 1, Some("Bob")), t0);

        assert_eq!(dir.list(t0 + Duration::from_secs(29)).len(), 2);
        let later = dir.list(t0 + Duration::from_secs(31));
        assert_eq!(later.len(), 1);
        assert!(later[0].is_local);
    }

    #[test]
    fn test_refresh_extends_lifetime() {
        let mut dir =
            PresenceDirectory::with_timeout(Uuid::new_v4(), meta("Me"), Duration::from_secs(10));
        let bob = Uuid::new_v4();
        let t0 = Instant::now();
        dir.observe(update(bob, 1, Some("Bob")), t0);
        dir.observe(update(bob, 2, Some("Bob")), t0 + Duration::from_secs(8));

        assert!(dir.expire(t0 + Duration::from_secs(15)).is_empty());
        assert_eq!(dir.expire(t0 + Duration::from_secs(19)), vec![bob]);
    }

    #[test]
    fn test_expired_peer_can_rejoin_with_newer_clock() {
        let mut dir =
            PresenceDirectory::with_timeout(Uuid::new_v4(), meta("Me"), Duration::from_secs(1));
        let bob = Uuid::new_v4();
        let t0 = Instant::now();
        dir.observe(update(bob, 1, Some("Bob")), t0);
        dir.expire(t0 + Duration::from_secs(2));

        let change = dir.observe(update(bob, 2, Some("Bob")), t0 + Duration::from_secs(2));
        assert_eq!(change, PresenceChange::Joined);
    }

    #[test]
    fn test_observe_evicts_silent_peers() {
        let mut dir =
            PresenceDirectory::with_timeout(Uuid::new_v4(), meta("Me"), Duration::from_secs(5));
        let (bob, carol) = (Uuid::new_v4(), Uuid::new_v4());
        let t0 = Instant::now();
        dir.observe(update(bob, 1, Some("Bob")), t0);
        dir.observe(update(carol, 1, Some("Carol")), t0 + Duration::from_secs(4));

        let later = t0 + Duration::from_secs(6);
        assert_eq!(dir.observe(update(carol, 2, Some("Carol")), later), PresenceChange::Expired);
        assert_eq!(dir.remote_count(), 1);

        let dave = Uuid::new_v4();
        let much_later = t0 + Duration::from_secs(20);
        assert_eq!(dir.observe(update(dave, 1, Some("Dave")), much_later), PresenceChange::Joined);
        assert_eq!(dir.remote_count(), 1);
    }

    #[test]
    fn test_rejoin_outranks_relay_farewell() {
        let me = Uuid::new_v4();
        let mut local = PresenceDirectory::new(me, meta("Alice"));
        let mut remote = directory();
        let now = Instant::now();

        let hello = local.set_local(meta("Alice"));
        assert_eq!(remote.observe(hello.clone(), now), PresenceChange::Joined);

        // Connection lost: the relay departs us with the next clock.
        let farewell = update(me, hello.clock + 1, None);
        assert_eq!(remote.observe(farewell, now), PresenceChange::Departed);

        let back = local.rejoin();
        assert!(back.clock > hello.clock + 1);
        assert_eq!(remote.observe(back, now), PresenceChange::Joined);
    }

    // ── Listing tests ────────────────────────────────────────────

    #[test]
    fn test_list_sorted_and_includes_local() {
        let local = Uuid::new_v4();
        let mut dir = PresenceDirectory::new(local, meta("Mallory"));
        let now = Instant::now();
        dir.observe(update(Uuid::new_v4(), 1, Some("Zed")), now);
        dir.observe(update(Uuid::new_v4(), 1, Some("Alice")), now);

        let names: Vec<String> = dir.list(now).into_iter().map(|p| p.display_name).collect();
        assert_eq!(names, vec!["Alice", "Mallory", "Zed"]);
    }

    #[test]
    fn test_clear_remote_keeps_clocks() {
        let mut dir = directory();
        let bob = Uuid::new_v4();
        let now = Instant::now();
        dir.observe(update(bob, 4, Some("Bob")), now);

        assert!(dir.clear_remote());
        assert!(!dir.clear_remote());
        assert_eq!(dir.observe(update(bob, 4, Some("Bob")), now), PresenceChange::Ignored);
        assert_eq!(dir.observe(update(bob, 5, Some("Bob")), now), PresenceChange::Joined);
    }

    // ── Local announcements ──────────────────────────────────────

    #[test]
    fn test_local_clock_increases() {
        let mut dir = directory();
        let a = dir.heartbeat();
        let b = dir.set_local(meta("Renamed"));
        let c = dir.leave();

        assert!(a.clock < b.clock && b.clock < c.clock);
        assert_eq!(b.state, Some(meta("Renamed")));
        assert_eq!(c.state, None);
    }

    #[test]
    fn test_update_message_roundtrip() {
        let mut dir = directory();
        let out = dir.heartbeat();
        let msg = SyncMessage::decode(&out.to_message().encode().unwrap()).unwrap();
        assert_eq!(AwarenessUpdate::from_message(&msg).unwrap(), out);
    }

    #[test]
    fn test_from_message_rejects_sync_frames() {
        let msg = SyncMessage::update(Uuid::new_v4(), &[]);
        assert!(AwarenessUpdate::from_message(&msg).is_err());
    }
}
