use std::sync::{Arc, Mutex};

use super::handlers::{EventKind, PeerEvent};
use super::{JoinResult, Netplay};
use crate::messages::{InputFlags, PlayerRecord, PlayerSnapshot, Role};

/// Match progress both players must agree on. The host's values win.
/// Numbers stay `f64` because the game loop's arithmetic can leave fractions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SharedProgress {
    pub score: f64,
    pub level: f64,
    pub game_over: bool,
}

/// What the local game loop knows about the other player, rebuilt from
/// netplay events. Every snapshot replaces the previous one wholesale, so
/// applying the same event twice leaves the mirror unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerMirror {
    role: Role,
    peer: Option<PlayerRecord>,
    peer_name: Option<String>,
    peer_ship: Option<String>,
    input: InputFlags,
    progress: SharedProgress,
    game_over_reason: Option<String>,
    ended: bool,
}

impl PeerMirror {
    pub fn new(role: Role) -> Self {
        PeerMirror {
            role,
            peer: None,
            peer_name: None,
            peer_ship: None,
            input: InputFlags::default(),
            progress: SharedProgress::default(),
            game_over_reason: None,
            ended: false,
        }
    }

    /// Seeds the mirror with whatever the server already had at join time.
    pub fn from_join(joined: &JoinResult) -> Self {
        let mut mirror = PeerMirror::new(joined.role);
        mirror.peer_name = match joined.role {
            Role::Host => joined.guest_name.clone(),
            Role::Guest => Some(joined.host_name.clone()),
        };
        if let Some(record) = joined.peer_state() {
            mirror.apply_snapshot(record.clone());
        }
        mirror
    }

    pub fn apply(&mut self, event: &PeerEvent) {
        match event {
            PeerEvent::PeerState { from, state } if *from != self.role => {
                self.apply_snapshot(state.clone());
            }
            PeerEvent::PeerInput { from, input } if *from != self.role => {
                self.input = input.clone();
            }
            PeerEvent::PeerJoined {
                player_name,
                ship_type,
                ..
            } => {
                self.peer_name = Some(player_name.clone());
                self.peer_ship.clone_from(ship_type);
            }
            PeerEvent::ForceGameOver { reason } => {
                self.progress.game_over = true;
                self.game_over_reason = Some(reason.clone());
            }
            PeerEvent::RoomClosed { .. } | PeerEvent::Closed { .. } => {
                self.ended = true;
            }
            PeerEvent::PeerState { .. } | PeerEvent::PeerInput { .. } => {}
        }
    }

    fn apply_snapshot(&mut self, record: PlayerRecord) {
        if self.role == Role::Guest {
            let state = &record.state;
            if let Some(score) = state.score() {
                self.progress.score = score;
            }
            if let Some(level) = state.level() {
                self.progress.level = level;
            }
            if state.game_over() == Some(true) {
                self.progress.game_over = true;
            }
        }
        if let Some(ship) = record.state.ship_type() {
            self.peer_ship = Some(ship.to_string());
        }
        self.peer = Some(record);
    }

    /// Records the local score and level. Only the host's count.
    pub fn set_local_progress(&mut self, score: f64, level: f64) {
        if self.role == Role::Host {
            self.progress.score = score;
            self.progress.level = level;
        }
    }

    /// Local game over. The host's flag is shared; a guest's is not, the
    /// match ends for it through `player_died` instead.
    pub fn set_local_game_over(&mut self) {
        if self.role == Role::Host {
            self.progress.game_over = true;
        }
    }

    /// Prepares the local snapshot for `state_update`. The host stamps the
    /// shared progress into it; a guest's copy carries none.
    pub fn outgoing_state(&self, mut local: PlayerSnapshot) -> PlayerSnapshot {
        match self.role {
            Role::Host => {
                local.set_progress(
                    self.progress.score,
                    self.progress.level,
                    self.progress.game_over,
                );
            }
            Role::Guest => local.clear_progress(),
        }
        local
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> Option<&PlayerRecord> {
        self.peer.as_ref()
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub fn peer_ship(&self) -> Option<&str> {
        self.peer_ship.as_deref()
    }

    pub fn peer_input(&self) -> &InputFlags {
        &self.input
    }

    pub fn progress(&self) -> SharedProgress {
        self.progress
    }

    pub fn game_over_reason(&self) -> Option<&str> {
        self.game_over_reason.as_deref()
    }

    /// The session is over, by `room_closed` or a lost transport.
    pub fn has_ended(&self) -> bool {
        self.ended
    }
}

/// Routes every mirror-relevant event from `netplay` into `mirror`. This takes
/// the handler slots for those kinds; register afterwards to override one.
pub fn bind(netplay: &dyn Netplay, mirror: &Arc<Mutex<PeerMirror>>) {
    for kind in [
        EventKind::PeerState,
        EventKind::PeerInput,
        EventKind::PeerJoined,
        EventKind::ForceGameOver,
        EventKind::RoomClosed,
        EventKind::Closed,
    ] {
        let mirror = mirror.clone();
        netplay.on(
            kind,
            Arc::new(move |event| {
                mirror
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .apply(event);
            }),
        );
    }
}
