//! Countdown Coordinator
//!
//! Starts a synchronized countdown on every client. Clients run the
//! pre-commands when the countdown starts and the post-commands when it
//! reaches zero. Once a countdown is started, new players are refused;
//! spectators may still join.

use crate::network::admission::Category;
use crate::network::protocol::{CountdownPhase, ServerMessage, SERVER_ID};
use crate::network::server::GhostServer;

/// Longest countdown front ends may start, in seconds.
pub const MAX_DURATION_SECS: u32 = 60;

/// Countdown durations front ends refuse to submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CountdownError {
    /// Zero or negative.
    #[error("Duration must be positive")]
    NotPositive,
    /// Longer than [`MAX_DURATION_SECS`].
    #[error("Duration too long (max 60)")]
    TooLong,
}

/// Check an operator-entered duration.
pub fn validate_duration(secs: i64) -> Result<u32, CountdownError> {
    if secs <= 0 {
        return Err(CountdownError::NotPositive);
    }
    if secs > i64::from(MAX_DURATION_SECS) {
        return Err(CountdownError::TooLong);
    }
    Ok(secs as u32)
}

/// Named pair of command scripts for common run categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountdownPreset {
    /// Display name.
    pub name: &'static str,
    /// Commands run when the countdown starts.
    pub pre_commands: &'static str,
    /// Commands run when it ends.
    pub post_commands: &'static str,
}

/// Built-in presets.
pub const PRESETS: &[CountdownPreset] = &[
    CountdownPreset {
        name: "None",
        pre_commands: "",
        post_commands: "",
    },
    CountdownPreset {
        name: "Fullgame",
        pre_commands: "ghost_sync 1\nghost_sync_countdown 3\nsvar_set sp_use_save 2\nghost_leaderboard_mode 1\nghost_leaderboard_reset\nsar_on_load conds map=sp_a1_wakeup \"ghost_sync 0\" map=sp_a2_intro \"ghost_sync 1\"",
        post_commands: "sar_speedrun_skip_cutscenes 1\nsar_speedrun_offset 18980\nsar_speedrun_reset\nstop\nsv_allow_mobile_portals 0\nload vault",
    },
    CountdownPreset {
        name: "Speedrun Mod",
        pre_commands: "ghost_sync 1\nghost_sync_countdown 3\nsvar_set sp_use_save 2\nghost_leaderboard_mode 1\nghost_leaderboard_reset",
        post_commands: "sar_speedrun_offset 0\nsar_speedrun_reset\nstop\nsv_allow_mobile_portals 0\nmap sp_a1_intro1",
    },
    CountdownPreset {
        name: "Portal Stories: Mel",
        pre_commands: "ghost_sync 1\nghost_sync_countdown 3\nghost_leaderboard_mode 1\nghost_leaderboard_reset\nsar_ent_slot_serial 838 16301",
        post_commands: "sar_speedrun_reset\nmap st_a1_tramride",
    },
];

/// Look up a preset by name, ignoring case.
pub fn preset(name: &str) -> Option<&'static CountdownPreset> {
    PRESETS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

impl GhostServer {
    /// Start a countdown on every client and stop admitting players.
    pub fn start_countdown(&mut self, pre_commands: &str, post_commands: &str, duration_secs: u32) {
        self.events.emit(format!("Countdown starting: {duration_secs} seconds"));
        self.events.emit(format!("Pre-command: {pre_commands}"));
        self.events.emit(format!("Post-command: {post_commands}"));

        let payload = ServerMessage::Countdown {
            id: SERVER_ID,
            phase: CountdownPhase::Start {
                duration: duration_secs,
                pre_commands: pre_commands.to_string(),
                post_commands: post_commands.to_string(),
            },
        }
        .encode();
        self.fan_out(None, &payload);
        self.reap_dead();

        self.set_accepting(Category::Players, false);
    }
}
