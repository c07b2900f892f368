// cut_by_frag.rs — frag run detection over obituary records
//
// Finds runs of kills by one player separated by at most a configured
// gap. A death or disallowed kill ends the current run; runs shorter than
// the minimum are discarded. Each surviving run becomes a cut section
// padded by the start/end offsets.

use bitflags::bitflags;

use demcut_common::qshared::{MAX_CLIENTS, Team};

use crate::cut_by_chat::CutSection;
use crate::obituaries::ObituaryRecord;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FragRuleFlags: u32 {
        /// A self kill does not end the current run.
        const ALLOW_SELF_KILLS = 1 << 0;
        /// A team kill does not end the current run (it still is not
        /// counted as a frag).
        const ALLOW_TEAM_KILLS = 1 << 1;
        /// Dying does not end the current run.
        const ALLOW_DEATHS = 1 << 2;
    }
}

#[derive(Debug, Clone)]
pub struct CutByFragArg {
    pub min_frag_count: u32,
    pub time_between_frags_sec: u32,
    pub start_offset_sec: u32,
    pub end_offset_sec: u32,
    /// Player slot to track; out-of-range means the recording player.
    pub player_index: i32,
    pub flags: FragRuleFlags,
}

fn are_teammates(team1: i32, team2: i32) -> bool {
    team1 == team2 && (team1 == Team::Red as i32 || team1 == Team::Blue as i32)
}

struct Frag {
    server_time_ms: i32,
    game_state_index: i32,
}

fn flush_run(frags: &mut Vec<Frag>, sections: &mut Vec<CutSection>, arg: &CutByFragArg) {
    let frag_count = frags.len() as u32;
    if frag_count < 2 || frag_count < arg.min_frag_count {
        frags.clear();
        return;
    }

    sections.push(CutSection {
        game_state_index: frags[0].game_state_index,
        start_time_ms: frags[0].server_time_ms - arg.start_offset_sec as i32 * 1000,
        end_time_ms: frags.last().unwrap().server_time_ms + arg.end_offset_sec as i32 * 1000,
    });
    frags.clear();
}

/// Walk the obituary list and return the cut sections for every valid
/// frag run.
pub fn find_frag_sections(
    obituaries: &[ObituaryRecord],
    recording_player: i32,
    arg: &CutByFragArg,
) -> Vec<CutSection> {
    let player_index = if arg.player_index >= 0 && arg.player_index < MAX_CLIENTS as i32 {
        arg.player_index
    } else {
        recording_player
    };
    let allow_self_kills = arg.flags.contains(FragRuleFlags::ALLOW_SELF_KILLS);
    let allow_team_kills = arg.flags.contains(FragRuleFlags::ALLOW_TEAM_KILLS);
    let allow_deaths = arg.flags.contains(FragRuleFlags::ALLOW_DEATHS);

    let mut frags: Vec<Frag> = Vec::new();
    let mut sections = Vec::new();

    for data in obituaries {
        // Got killed?
        if data.target_idx == player_index {
            if !allow_deaths || (!allow_self_kills && data.attacker_idx == data.target_idx) {
                flush_run(&mut frags, &mut sections, arg);
            }
            continue;
        }

        // Someone else did the kill?
        if data.attacker_idx != player_index {
            continue;
        }

        // We killed someone we shouldn't have?
        if are_teammates(data.target_team_idx, data.attacker_team_idx) {
            if !allow_team_kills {
                flush_run(&mut frags, &mut sections, arg);
            }
            continue;
        }

        if let Some(previous) = frags.last() {
            if data.game_state_index != previous.game_state_index
                || data.server_time_ms
                    > previous.server_time_ms + arg.time_between_frags_sec as i32 * 1000
            {
                flush_run(&mut frags, &mut sections, arg);
            }
        }

        frags.push(Frag {
            server_time_ms: data.server_time_ms,
            game_state_index: data.game_state_index,
        });
    }

    flush_run(&mut frags, &mut sections, arg);
    sections
}

// ============================================================
// Tests
// ============================================================
