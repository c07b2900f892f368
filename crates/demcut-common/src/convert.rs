// convert.rs — protocol-to-protocol state translation
//
// The write path re-emits with the output protocol's tables; when input
// and output sit in different protocol families the states and config
// strings need renumbering first. Same-family runs use the identity
// converter, which is a plain copy.

use crate::info::{info_set_value_for_key, info_value_for_key};
use crate::qshared::{
    convert_mean_of_death, first_location_config_string, first_player_config_string,
    obituary_event_id, EntityState, PlayerState, Protocol, Snapshot, CS_SERVERINFO,
    ET_EVENTS, EV_EVENT_BITS, MAX_CLIENTS, MAX_CONFIGSTRINGS,
};

/// Result of converting one config string. `new_string` tells the caller
/// the output bytes differ from the input, so a re-emit is required even
/// if the index did not move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigStringConversion {
    pub index: i32,
    pub string: String,
    pub new_string: bool,
}

pub trait ProtocolConverter {
    /// A new gamestate begins; drop any per-gamestate conversion state.
    fn start_game_state(&mut self) {}

    /// A snapshot at `server_time` is about to be written.
    fn start_snapshot(&mut self, _server_time: i32) {}

    fn convert_entity_state(&self, input: &EntityState) -> EntityState;

    fn convert_snapshot(&self, input: &Snapshot) -> Snapshot;

    /// None drops the config string from the output entirely.
    fn convert_config_string(&self, index: i32, string: &str)
        -> Option<ConfigStringConversion>;
}

/// Weapon ids the protocol family can represent; out-of-range ids clamp
/// to zero on conversion.
fn weapon_count(protocol: Protocol) -> i32 {
    if protocol <= Protocol::Dm68 {
        11
    } else {
        16
    }
}

fn same_family(a: Protocol, b: Protocol) -> bool {
    (a <= Protocol::Dm68) == (b <= Protocol::Dm68)
}

pub fn get_protocol_converter(
    output: Protocol,
    input: Protocol,
) -> Box<dyn ProtocolConverter + Send> {
    if same_family(output, input) {
        Box::new(IdentityConverter)
    } else {
        Box::new(CrossFamilyConverter { input, output })
    }
}

// ============================================================
// Identity
// ============================================================

pub struct IdentityConverter;

impl ProtocolConverter for IdentityConverter {
    fn convert_entity_state(&self, input: &EntityState) -> EntityState {
        *input
    }

    fn convert_snapshot(&self, input: &Snapshot) -> Snapshot {
        *input
    }

    fn convert_config_string(
        &self,
        index: i32,
        string: &str,
    ) -> Option<ConfigStringConversion> {
        Some(ConfigStringConversion {
            index,
            string: string.to_string(),
            new_string: false,
        })
    }
}

// ============================================================
// Cross-family
// ============================================================

pub struct CrossFamilyConverter {
    pub input: Protocol,
    pub output: Protocol,
}

impl CrossFamilyConverter {
    fn convert_event_id(&self, id: i32) -> i32 {
        if id == obituary_event_id(self.input) {
            obituary_event_id(self.output)
        } else {
            id
        }
    }

    fn convert_player_state(&self, input: &PlayerState) -> PlayerState {
        let mut out = *input;
        if out.weapon < 0 || out.weapon >= weapon_count(self.output) {
            out.weapon = 0;
        }
        out
    }
}

impl ProtocolConverter for CrossFamilyConverter {
    fn convert_entity_state(&self, input: &EntityState) -> EntityState {
        let mut out = *input;

        if out.weapon < 0 || out.weapon >= weapon_count(self.output) {
            out.weapon = 0;
        }

        // Event entities: renumber the event id and, for obituaries, the
        // means of death riding in eventParm.
        if input.e_type >= ET_EVENTS {
            let event = input.e_type - ET_EVENTS;
            let repeat_bits = event & EV_EVENT_BITS;
            let id = event & !EV_EVENT_BITS;
            out.e_type = ET_EVENTS + repeat_bits + self.convert_event_id(id);
            if id == obituary_event_id(self.input) {
                out.event_parm =
                    convert_mean_of_death(input.event_parm, self.input, self.output);
            }
        }
        if input.event != 0 {
            let repeat_bits = input.event & EV_EVENT_BITS;
            let id = input.event & !EV_EVENT_BITS;
            out.event = repeat_bits + self.convert_event_id(id);
        }

        out
    }

    fn convert_snapshot(&self, input: &Snapshot) -> Snapshot {
        let mut out = *input;
        out.player_state = self.convert_player_state(&input.player_state);
        out
    }

    fn convert_config_string(
        &self,
        index: i32,
        string: &str,
    ) -> Option<ConfigStringConversion> {
        let in_players = first_player_config_string(self.input);
        let in_locations = first_location_config_string(self.input);
        let out_players = first_player_config_string(self.output);
        let out_locations = first_location_config_string(self.output);

        let out_index = if index >= in_players && index < in_players + MAX_CLIENTS as i32 {
            out_players + (index - in_players)
        } else if index >= in_locations && index < in_locations + MAX_CLIENTS as i32 {
            out_locations + (index - in_locations)
        } else if index < in_players.min(out_players) {
            index
        } else {
            // No counterpart slot in the output layout.
            return None;
        };

        if out_index < 0 || out_index >= MAX_CONFIGSTRINGS as i32 {
            return None;
        }

        // The server info string names its protocol; playback tools check it.
        if index == CS_SERVERINFO && info_value_for_key(string, "protocol").is_some() {
            let rewritten = info_set_value_for_key(
                string,
                "protocol",
                &self.output.number().to_string(),
            );
            let new_string = rewritten != string;
            return Some(ConfigStringConversion {
                index: out_index,
                string: rewritten,
                new_string,
            });
        }

        Some(ConfigStringConversion {
            index: out_index,
            string: string.to_string(),
            new_string: false,
        })
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qshared::CS_PLAYERS_68;

    #[test]
    fn test_identity_for_same_family() {
        let converter = get_protocol_converter(Protocol::Dm68, Protocol::Dm66);
        let mut es = EntityState::default();
        es.number = 9;
        es.weapon = 10;
        assert_eq!(converter.convert_entity_state(&es), es);

        let conv = converter.convert_config_string(544, "\\n\\player").unwrap();
        assert_eq!(conv.index, 544);
        assert!(!conv.new_string);
    }

    #[test]
    fn test_cross_family_player_slot_remap() {
        let converter = get_protocol_converter(Protocol::Dm73, Protocol::Dm68);
        let conv = converter
            .convert_config_string(CS_PLAYERS_68 + 3, "\\n\\UnnamedPlayer\\t\\1")
            .unwrap();
        assert_eq!(conv.index, first_player_config_string(Protocol::Dm73) + 3);
        assert_eq!(conv.string, "\\n\\UnnamedPlayer\\t\\1");
    }

    #[test]
    fn test_cross_family_shared_prefix_is_stable() {
        let converter = get_protocol_converter(Protocol::Dm90, Protocol::Dm68);
        let conv = converter.convert_config_string(3, "level name").unwrap();
        assert_eq!(conv.index, 3);
    }

    #[test]
    fn test_cross_family_serverinfo_rewrites_protocol() {
        let converter = get_protocol_converter(Protocol::Dm90, Protocol::Dm68);
        let conv = converter
            .convert_config_string(CS_SERVERINFO, "\\protocol\\68\\mapname\\q3dm6")
            .unwrap();
        assert!(conv.new_string);
        assert_eq!(info_value_for_key(&conv.string, "protocol"), Some("90"));
        assert_eq!(info_value_for_key(&conv.string, "mapname"), Some("q3dm6"));
    }

    #[test]
    fn test_cross_family_weapon_clamp() {
        let converter = get_protocol_converter(Protocol::Dm68, Protocol::Dm90);
        let mut es = EntityState::default();
        es.weapon = 14; // no such weapon in the Dm68 family
        assert_eq!(converter.convert_entity_state(&es).weapon, 0);

        let mut snap = Snapshot::default();
        snap.player_state.weapon = 15;
        assert_eq!(converter.convert_snapshot(&snap).player_state.weapon, 0);
    }

    #[test]
    fn test_cross_family_obituary_event_remap() {
        let converter = get_protocol_converter(Protocol::Dm73, Protocol::Dm68);
        let mut es = EntityState::default();
        es.e_type = ET_EVENTS + obituary_event_id(Protocol::Dm68);
        es.event_parm = 23; // grapple in the Dm68 family
        let out = converter.convert_entity_state(&es);
        assert_eq!(out.e_type, ET_EVENTS + obituary_event_id(Protocol::Dm73));
        assert_eq!(out.event_parm, 28);
    }

    #[test]
    fn test_cross_family_drops_unmappable_slots() {
        // Dm73 player slots start below the Dm68 player base; the tail of
        // the Dm68 "other data" region has nowhere to go.
        let converter = get_protocol_converter(Protocol::Dm73, Protocol::Dm68);
        assert!(converter.convert_config_string(540, "orphan").is_none());
    }
}
