// obituaries.rs — death event extraction
//
// An obituary rides on an event entity: the event id names the kill, the
// entity's otherEntityNum fields carry target and attacker, eventParm the
// means of death. Player names and teams come from the per-protocol player
// config strings, tracked across gamestates and cs updates.

use std::any::Any;

use demcut_common::arena::Arena;
use demcut_common::info::{clean_string, info_value_for_key, info_value_int};
use demcut_common::qshared::{
    first_player_config_string, get_mean_of_death_name, obituary_event_id, ENTITYNUM_WORLD,
    ET_EVENTS, EV_EVENT_BITS, MAX_CLIENTS,
};

use crate::parser::Parser;
use crate::plug_in::{CommandInfo, GamestateInfo, ParserPlugIn, SnapshotInfo};

#[derive(Debug, Clone)]
pub struct ObituaryRecord {
    pub game_state_index: i32,
    pub server_time_ms: i32,
    /// Always a player slot.
    pub target_idx: i32,
    /// A player slot, or ENTITYNUM_WORLD for environmental deaths.
    pub attacker_idx: i32,
    pub target_team_idx: i32,
    pub attacker_team_idx: i32,
    pub mean_of_death: i32,
    pub mean_of_death_name: &'static str,
    pub target_name: String,
    pub attacker_name: String,
}

pub struct ObituariesAnalyzer {
    player_teams: [i32; MAX_CLIENTS],
    recording_client_num: i32,
    demos: Vec<Vec<ObituaryRecord>>,
    temp_allocator: Arena,
}

impl ObituariesAnalyzer {
    pub fn new() -> Self {
        Self {
            player_teams: [-1; MAX_CLIENTS],
            recording_client_num: -1,
            demos: Vec::new(),
            temp_allocator: Arena::with_capacity(1 << 12, "obituaries temp"),
        }
    }

    pub fn demo_count(&self) -> usize {
        self.demos.len()
    }

    pub fn obituaries(&self, demo_index: usize) -> &[ObituaryRecord] {
        self.demos
            .get(demo_index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Client slot of the player who recorded the demo, from the last
    /// gamestate seen.
    pub fn recording_client_num(&self) -> i32 {
        self.recording_client_num
    }

    fn refresh_player_team(&mut self, parser: &Parser, player_idx: usize) {
        let first = first_player_config_string(parser.protocol());
        if let Some(cs) = parser.config_string(first + player_idx as i32) {
            if let Some(team) = info_value_int(cs, "t") {
                self.player_teams[player_idx] = team;
            }
        }
    }

    fn player_name(&mut self, parser: &Parser, player_idx: i32) -> String {
        if player_idx == ENTITYNUM_WORLD {
            return "world".to_string();
        }

        let first = first_player_config_string(parser.protocol());
        let Some(cs) = parser.config_string(first + player_idx) else {
            return String::new();
        };
        let Some(raw) = info_value_for_key(cs, "n") else {
            return String::new();
        };

        let raw = self.temp_allocator.alloc_str(raw);
        clean_string(self.temp_allocator.get_str(raw))
    }
}

impl Default for ObituariesAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl ParserPlugIn for ObituariesAnalyzer {
    fn start_processing_demo(&mut self) {
        self.demos.push(Vec::new());
        self.player_teams = [-1; MAX_CLIENTS];
        self.recording_client_num = -1;
    }

    fn process_gamestate_message(&mut self, info: &GamestateInfo, parser: &Parser) {
        self.recording_client_num = info.client_num;
        for player_idx in 0..MAX_CLIENTS {
            self.refresh_player_team(parser, player_idx);
        }
    }

    fn process_command_message(&mut self, info: &CommandInfo, parser: &Parser) {
        if !info.is_config_string {
            return;
        }
        let first = first_player_config_string(parser.protocol());
        let player_idx = info.config_string_index - first;
        if player_idx >= 0 && (player_idx as usize) < MAX_CLIENTS {
            self.refresh_player_team(parser, player_idx as usize);
        }
    }

    fn process_snapshot_message(&mut self, info: &SnapshotInfo, parser: &Parser) {
        let obituary_id = obituary_event_id(parser.protocol());

        for entity in info.entities {
            if !entity.is_new_event {
                continue;
            }

            let event_type = entity.state.e_type & !EV_EVENT_BITS;
            if event_type != ET_EVENTS + obituary_id {
                continue;
            }

            let target_idx = entity.state.other_entity_num;
            if target_idx < 0 || target_idx >= MAX_CLIENTS as i32 {
                continue;
            }

            let mut attacker_idx = entity.state.other_entity_num2;
            if attacker_idx < 0 || attacker_idx >= MAX_CLIENTS as i32 {
                attacker_idx = ENTITYNUM_WORLD;
            }

            let target_team_idx = self.player_teams[target_idx as usize];
            let attacker_team_idx = if attacker_idx == ENTITYNUM_WORLD {
                -1
            } else {
                self.player_teams[attacker_idx as usize]
            };

            let mean_of_death = entity.state.event_parm;
            let record = ObituaryRecord {
                game_state_index: parser.game_state_index(),
                server_time_ms: info.snapshot.server_time,
                target_idx,
                attacker_idx,
                target_team_idx,
                attacker_team_idx,
                mean_of_death,
                mean_of_death_name: get_mean_of_death_name(mean_of_death, parser.protocol()),
                target_name: self.player_name(parser, target_idx),
                attacker_name: self.player_name(parser, attacker_idx),
            };
            if let Some(records) = self.demos.last_mut() {
                records.push(record);
            }
        }

        self.temp_allocator.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::parser::Parser;
    use crate::plug_in::PlugInList;
    use crate::test_support::{gamestate_payload, snapshot_payload};
    use demcut_common::qshared::{EntityState, PlayerState, Protocol, CS_PLAYERS_68};

    fn obituary_entity(number: i32, target: i32, attacker: i32, mod_id: i32) -> EntityState {
        let mut ent = EntityState::default();
        ent.number = number;
        ent.e_type = ET_EVENTS + obituary_event_id(Protocol::Dm68);
        ent.other_entity_num = target;
        ent.other_entity_num2 = attacker;
        ent.event_parm = mod_id;
        ent
    }

    fn analyzer(plug_ins: &PlugInList) -> &ObituariesAnalyzer {
        plug_ins[0]
            .as_any()
            .downcast_ref::<ObituariesAnalyzer>()
            .unwrap()
    }

    #[test]
    fn test_obituary_extraction() {
        let mut parser = Parser::new();
        assert!(parser.init(Protocol::Dm68, Protocol::Dm68, 0, true));
        let mut ctx = Context::new();
        let mut plug_ins: PlugInList = vec![Box::new(ObituariesAnalyzer::new())];
        plug_ins[0].start_processing_demo();

        let gs = gamestate_payload(
            Protocol::Dm68,
            0,
            &[
                (CS_PLAYERS_68 + 3, "\\n\\^1Kill^7er\\t\\1"),
                (CS_PLAYERS_68 + 5, "\\n\\Victim\\t\\2"),
            ],
            &[],
            3,
        );
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &gs));
        assert_eq!(analyzer(&plug_ins).recording_client_num(), 3);

        // Player 3 rails player 5.
        let ps = PlayerState::default();
        let zero = EntityState::default();
        let ent = obituary_entity(700, 5, 3, 10);
        let snap = snapshot_payload(Protocol::Dm68, 1, 61000, 0, None, &ps, |m| {
            m.write_delta_entity(Protocol::Dm68, &zero, Some(&ent), false);
        });
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 1, 0, &snap));

        let records = analyzer(&plug_ins).obituaries(0);
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.target_idx, 5);
        assert_eq!(r.attacker_idx, 3);
        assert_eq!(r.target_team_idx, 2);
        assert_eq!(r.attacker_team_idx, 1);
        assert_eq!(r.mean_of_death, 10);
        assert_eq!(r.mean_of_death_name, "railgun");
        assert_eq!(r.attacker_name, "Killer");
        assert_eq!(r.target_name, "Victim");
        assert_eq!(r.server_time_ms, 61000);
        assert_eq!(r.game_state_index, 0);
    }

    #[test]
    fn test_world_kill_and_bad_target() {
        let mut parser = Parser::new();
        assert!(parser.init(Protocol::Dm68, Protocol::Dm68, 0, true));
        let mut ctx = Context::new();
        let mut plug_ins: PlugInList = vec![Box::new(ObituariesAnalyzer::new())];
        plug_ins[0].start_processing_demo();

        let gs = gamestate_payload(
            Protocol::Dm68,
            0,
            &[(CS_PLAYERS_68 + 2, "\\n\\Faller\\t\\0")],
            &[],
            2,
        );
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &gs));

        let ps = PlayerState::default();
        let zero = EntityState::default();
        // Lava kill: attacker slot out of player range becomes the world.
        let lava = obituary_entity(700, 2, 900, 16);
        // Target out of range: record is dropped entirely.
        let bogus = obituary_entity(701, 80, 2, 0);
        let snap = snapshot_payload(Protocol::Dm68, 1, 5000, 0, None, &ps, |m| {
            m.write_delta_entity(Protocol::Dm68, &zero, Some(&lava), false);
            m.write_delta_entity(Protocol::Dm68, &zero, Some(&bogus), false);
        });
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 1, 0, &snap));

        let records = analyzer(&plug_ins).obituaries(0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attacker_idx, ENTITYNUM_WORLD);
        assert_eq!(records[0].attacker_team_idx, -1);
        assert_eq!(records[0].attacker_name, "world");
        assert_eq!(records[0].mean_of_death_name, "lava");
    }

    #[test]
    fn test_team_updates_via_cs_command() {
        let mut parser = Parser::new();
        assert!(parser.init(Protocol::Dm68, Protocol::Dm68, 0, true));
        let mut ctx = Context::new();
        let mut plug_ins: PlugInList = vec![Box::new(ObituariesAnalyzer::new())];
        plug_ins[0].start_processing_demo();

        let gs = gamestate_payload(
            Protocol::Dm68,
            0,
            &[(CS_PLAYERS_68 + 1, "\\n\\Drifter\\t\\1")],
            &[],
            1,
        );
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &gs));

        // The player switches teams mid-game.
        let cs_update = crate::test_support::command_payload(
            Protocol::Dm68,
            1,
            1,
            &format!("cs {} \"\\n\\Drifter\\t\\2\"", CS_PLAYERS_68 + 1),
        );
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 1, 0, &cs_update));

        let ps = PlayerState::default();
        let zero = EntityState::default();
        let ent = obituary_entity(700, 1, 1, 20);
        let snap = snapshot_payload(Protocol::Dm68, 2, 9000, 0, None, &ps, |m| {
            m.write_delta_entity(Protocol::Dm68, &zero, Some(&ent), false);
        });
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 2, 0, &snap));

        let records = analyzer(&plug_ins).obituaries(0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target_team_idx, 2);
        assert_eq!(records[0].mean_of_death_name, "suicide");
    }
}
