//! Persisted simulator state: the durable record, its invariants, and the JSON-backed
//! store.
//!
//! Grounded on `original_source/server/state.go` (the `name`/`pumpType`/`status`
//! triple and the `DanaI`/`DanaRSv3`/`DanaRSv1` generation tags) and
//! `original_source/server/simulator.go`'s `randomName` for the default device-name
//! shape. Everything else in [`SimulatorState`] comes from spec §3, which the Go
//! revision retrieved here predates.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::warn;

use crate::constants::{HistoryCode, PumpType};
use crate::error::Result;

pub const BASAL_SCHEDULE_LEN: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Units {
    MgDl,
    Mmol,
}

/// One append-only history log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    pub timestamp: DateTime<Utc>,
    pub code: HistoryCode,
    pub param1: u8,
    pub param2: u8,
    pub value: u16,
}

/// The USER_OPTION block (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserOptions {
    pub time_display_in_12h: bool,
    pub button_scroll: bool,
    pub beep_and_alarm: u8,
    pub lcd_on_seconds: u8,
    pub backlight_on_seconds: u8,
    pub selected_language: u8,
    pub units: Units,
    pub shutdown_in_hours: u8,
    pub low_reservoir_warning: u8,
    pub cannula_volume: u16,
    pub refill_amount: u16,
    pub target_bg: u16,
}

impl Default for UserOptions {
    fn default() -> Self {
        Self {
            time_display_in_12h: false,
            button_scroll: false,
            beep_and_alarm: 3,
            lcd_on_seconds: 30,
            backlight_on_seconds: 30,
            selected_language: 0,
            units: Units::Mmol,
            shutdown_in_hours: 0,
            low_reservoir_warning: 20,
            cannula_volume: 0,
            refill_amount: 0,
            target_bg: 100,
        }
    }
}

/// The durable record owned by the [`Store`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorState {
    pub name: String,
    pub pump_type: PumpType,
    pub status: Status,
    pub clock_skew_seconds: i64,
    pub time_zone_offset_seconds: i32,
    pub reservoir_level: f64,
    pub battery_percent: u8,
    pub is_suspended: bool,
    pub basal_schedule: Vec<f64>,
    pub temp_basal_active_till: Option<DateTime<Utc>>,
    pub temp_basal_percentage: u16,
    pub is_in_history_upload_mode: bool,
    pub history: Vec<HistoryItem>,
    pub user_options: UserOptions,
}

impl SimulatorState {
    /// Name of shape `LLL#####LL` (three letters, five digits, two letters),
    /// following the reference's `randomName`.
    pub fn random_name() -> String {
        const LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVXYZ";
        let mut rng = rand::thread_rng();
        let letter = |rng: &mut rand::rngs::ThreadRng| LETTERS[rng.gen_range(0..LETTERS.len())] as char;
        let digit = |rng: &mut rand::rngs::ThreadRng| std::char::from_digit(rng.gen_range(0u32..10), 10).unwrap();

        let mut name = String::with_capacity(10);
        name.push(letter(&mut rng));
        name.push(letter(&mut rng));
        name.push(letter(&mut rng));
        for _ in 0..5 {
            name.push(digit(&mut rng));
        }
        name.push(letter(&mut rng));
        name.push(letter(&mut rng));
        name
    }

    fn default_with_time_zone_offset(time_zone_offset_seconds: i32) -> Self {
        Self {
            name: Self::random_name(),
            pump_type: PumpType::DanaI,
            status: Status::Idle,
            clock_skew_seconds: 0,
            time_zone_offset_seconds,
            reservoir_level: 300.0,
            battery_percent: 100,
            is_suspended: false,
            basal_schedule: vec![1.0; BASAL_SCHEDULE_LEN],
            temp_basal_active_till: None,
            temp_basal_percentage: 100,
            is_in_history_upload_mode: false,
            history: Vec::new(),
            user_options: UserOptions::default(),
        }
    }
}

impl Default for SimulatorState {
    fn default() -> Self {
        let offset_seconds = chrono::Local::now().offset().local_minus_utc();
        Self::default_with_time_zone_offset(offset_seconds)
    }
}

/// Loads, mutates, and persists [`SimulatorState`] as a single JSON file.
pub struct Store {
    path: PathBuf,
    state: Mutex<SimulatorState>,
}

impl Store {
    /// Loads state from `path`; an absent or malformed file falls back to defaults
    /// (logged, never a hard error, per spec §4.4).
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<SimulatorState>(&bytes) {
                Ok(state) => state,
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "state file failed to parse, falling back to defaults");
                    SimulatorState::default()
                }
            },
            Err(err) => {
                warn!(error = %err, path = %path.display(), "state file not found, using defaults");
                SimulatorState::default()
            }
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Applies `f` to the state under lock and persists the result before releasing
    /// the lock, so a crash between mutation and save cannot be observed by a later
    /// reader.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut SimulatorState) -> R) -> Result<R> {
        let mut guard = self.state.lock().await;
        let result = f(&mut guard);
        self.save(&guard).await?;
        Ok(result)
    }

    /// Reads the state under lock without persisting.
    pub async fn read<R>(&self, f: impl FnOnce(&SimulatorState) -> R) -> R {
        let guard = self.state.lock().await;
        f(&guard)
    }

    async fn save(&self, state: &SimulatorState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}
