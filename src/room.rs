use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clock::Millis;
use crate::messages::Role;

/// Room codes avoid characters that read alike: no 0/O, 1/I/L.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
pub const ROOM_CODE_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Full,
    Closed,
    Expired,
}

impl RoomStatus {
    pub const OPEN: [RoomStatus; 2] = [RoomStatus::Waiting, RoomStatus::Full];

    pub fn is_terminal(self) -> bool {
        matches!(self, RoomStatus::Closed | RoomStatus::Expired)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: String,
    pub host_name: String,
    pub guest_name: Option<String>,
    pub status: RoomStatus,
    pub created_at: Millis,
    pub updated_at: Millis,
    pub expires_at: Millis,
    pub host_last_seen_at: Option<Millis>,
    pub guest_last_seen_at: Option<Millis>,
}

impl Room {
    pub fn new(room_id: String, host_name: String, now: Millis, ttl: Millis) -> Self {
        Room {
            room_id,
            host_name,
            guest_name: None,
            status: RoomStatus::Waiting,
            created_at: now,
            updated_at: now,
            expires_at: now.saturating_add(ttl),
            host_last_seen_at: Some(now),
            guest_last_seen_at: None,
        }
    }

    /// The single place a display name is turned into a seat.
    pub fn role_of(&self, player_name: &str) -> Option<Role> {
        if names_match(&self.host_name, player_name) {
            Some(Role::Host)
        } else if self
            .guest_name
            .as_deref()
            .is_some_and(|guest| names_match(guest, player_name))
        {
            Some(Role::Guest)
        } else {
            None
        }
    }

    pub fn name_of(&self, role: Role) -> Option<&str> {
        match role {
            Role::Host => Some(&self.host_name),
            Role::Guest => self.guest_name.as_deref(),
        }
    }

    /// Open but past its deadline: the next access flips it to `expired`.
    pub fn is_overdue(&self, now: Millis) -> bool {
        !self.status.is_terminal() && self.expires_at < now
    }
}

pub fn generate_room_code(rng: &mut impl Rng) -> String {
    (0..ROOM_CODE_LEN)
        .map(|_| char::from(ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())]))
        .collect()
}

pub fn normalize_room_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Display names compare trimmed and case-insensitively.
pub fn normalize_name(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn names_match(a: &str, b: &str) -> bool {
    normalize_name(a) == normalize_name(b)
}

/// Trims and rejects empty names.
pub fn clean_name(raw: Option<&str>) -> Option<String> {
    let name = raw?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_come_from_the_unambiguous_alphabet() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let code = generate_room_code(&mut rng);
            assert_eq!(code.len(), ROOM_CODE_LEN);
            assert!(code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b)));
            assert!(!code.contains(['0', 'O', '1', 'I', 'L']));
        }
    }

    #[test]
    fn roles_resolve_by_normalized_name() {
        let mut room = Room::new("ABCD2345".into(), "Ace".into(), 0, 1000);
        assert_eq!(room.role_of(" ace "), Some(Role::Host));
        assert_eq!(room.role_of("Rookie"), None);

        room.guest_name = Some("Rookie".into());
        assert_eq!(room.role_of("ROOKIE"), Some(Role::Guest));
        assert_eq!(room.role_of("Wingman"), None);
    }

    #[test]
    fn overdue_only_applies_to_open_rooms() {
        let mut room = Room::new("ABCD2345".into(), "Ace".into(), 0, 1000);
        assert!(!room.is_overdue(1000));
        assert!(room.is_overdue(1001));
        room.status = RoomStatus::Closed;
        assert!(!room.is_overdue(5000));
    }

    #[test]
    fn blank_names_are_rejected() {
        assert_eq!(clean_name(Some("  ")), None);
        assert_eq!(clean_name(None), None);
        assert_eq!(clean_name(Some(" Ace ")), Some("Ace".to_string()));
    }
}
