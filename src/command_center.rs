//! Opcode dispatch, the pairing handshake, and the bolus ticker loop.
//!
//! Grounded on `original_source/server/commandCenter.go` for the overall shape
//! (`ProcessEncryptionCommand`/`ProcessCommand`/chunked `write`) and on spec §4.3 for
//! every handler's payload layout, which the retrieved Go revision only stubs
//! (`ProcessCommand` there just logs "unsupported request" for everything).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::bolus::{full_duration, total_ticks, BolusTicker};
use crate::bytes::{ByteReader, ByteWriter};
use crate::codec::{Codec, Frame};
use crate::constants::{encryption_opcode, history_filter_for_opcode, opcode, FrameType, HistoryCode, PumpType, HISTORY_RANGE};
use crate::error::{Error, Result};
use crate::reassembler::Reassembler;
use crate::state::{HistoryItem, SimulatorState, Store};

const MAX_DAILY_UNITS: f64 = 250.0;
const MAX_BOLUS_UNITS: f64 = 25.0;
const TICK_PERIOD: Duration = Duration::from_millis(500);

/// Outbound sink for notify-characteristic traffic. A real deployment backs this with
/// a BLE peripheral stack; `dana-sim`'s binary backs it with a channel (see
/// `src/main.rs`).
pub trait Transport: Send + Sync {
    fn notify(&self, chunk: &[u8]) -> Result<()>;
}

fn pack_date(dt: NaiveDateTime) -> [u8; 6] {
    [
        (dt.format("%Y").to_string().parse::<i32>().unwrap_or(2000) - 2000) as u8,
        dt.format("%m").to_string().parse().unwrap_or(1),
        dt.format("%d").to_string().parse().unwrap_or(1),
        dt.format("%H").to_string().parse().unwrap_or(0),
        dt.format("%M").to_string().parse().unwrap_or(0),
        dt.format("%S").to_string().parse().unwrap_or(0),
    ]
}

fn parse_date(b: &[u8]) -> Result<NaiveDateTime> {
    if b.len() < 6 {
        return Err(Error::Eof);
    }
    let date = NaiveDate::from_ymd_opt(2000 + b[0] as i32, b[1] as u32, b[2] as u32)
        .ok_or(Error::InvalidValue)?;
    let time = NaiveTime::from_hms_opt(b[3] as u32, b[4] as u32, b[5] as u32).ok_or(Error::InvalidValue)?;
    Ok(NaiveDateTime::new(date, time))
}

fn basal_slot(dt: NaiveDateTime) -> usize {
    let hour = dt.format("%H").to_string().parse::<usize>().unwrap_or(0);
    let minute = dt.format("%M").to_string().parse::<usize>().unwrap_or(0);
    (hour * 2 + minute / 30).min(47)
}

/// The result of processing an `ENCRYPTION_REQUEST`/`ENCRYPTION_RESPONSE` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionOutcome {
    /// Keep the connection open, no change to the secure flag.
    Continue,
    /// A pump-busy response was sent; the caller must reject/drop the connection.
    Reject,
    /// The session is now promoted to secure (outer obfuscation applies from here on).
    Secure,
}

struct SessionState {
    codec: Codec,
    reassembler: Reassembler,
    secure: bool,
    bolus: Option<BolusTicker>,
}

/// Owns everything scoped to one open connection: the codec/session-secure flag, the
/// reassembler, the bolus ticker, and the store/transport handles needed to dispatch
/// and respond to frames.
pub struct CommandCenter {
    store: Arc<Store>,
    transport: Arc<dyn Transport>,
    session: Mutex<SessionState>,
}

impl CommandCenter {
    pub fn new(store: Arc<Store>, transport: Arc<dyn Transport>, pump_type: PumpType, device_name: String) -> Arc<Self> {
        Arc::new(Self {
            store,
            transport,
            session: Mutex::new(SessionState {
                codec: Codec::new(pump_type, device_name),
                reassembler: Reassembler::new(),
                secure: false,
                bolus: None,
            }),
        })
    }

    /// Clears connection-scoped session state: rolling key, read buffer, secure flag,
    /// and any in-flight bolus (aborting its ticker and recording the partial dose).
    pub async fn reset_session(&self) {
        let mut session = self.session.lock().await;
        session.codec.reset_pairing();
        session.reassembler.reset();
        session.secure = false;
        if let Some(ticker) = session.bolus.take() {
            ticker.handle.abort();
            drop(session);
            self.record_partial_bolus(ticker.amount, ticker.current_amount).await;
        }
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(20) {
            self.transport.notify(chunk)?;
        }
        Ok(())
    }

    async fn record_partial_bolus(&self, amount: f64, delivered: f64) {
        let _ = self
            .store
            .mutate(|state| {
                append_bolus_history(state, delivered);
                let _ = amount;
            })
            .await;
    }

    /// Feeds one BLE write fragment through the reassembler and, once a whole frame is
    /// available, decodes and dispatches it.
    pub async fn handle_fragment(self: &Arc<Self>, fragment: &[u8]) -> Result<()> {
        let maybe_frame = {
            let mut session = self.session.lock().await;
            let pump_type = session.codec.pump_type;
            match session.reassembler.push_fragment(fragment, pump_type) {
                Ok(v) => v,
                Err(err) => {
                    warn!(error = %err, "dropping garbled frame, buffer cleared");
                    return Ok(());
                }
            }
        };

        let Some((raw, obfuscated)) = maybe_frame else {
            return Ok(());
        };

        let decoded = {
            let mut session = self.session.lock().await;
            session.codec.decode(&raw, obfuscated)
        };

        let (frame_type, dec_opcode, payload) = match decoded {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "dropping garbled or unverifiable frame");
                return Ok(());
            }
        };

        match frame_type {
            FrameType::EncryptionRequest => match self.process_encryption_command(dec_opcode, &payload).await {
                Ok(EncryptionOutcome::Reject) => {
                    return Err(Error::Transport("connection rejected: pump busy".into()));
                }
                Ok(_) => {}
                Err(Error::UnsupportedOpcode { frame_type, opcode }) => {
                    warn!(frame_type, opcode, "unsupported encryption opcode, controller will time out");
                }
                Err(err) => return Err(err),
            },
            FrameType::Command => {
                if let Err(err) = self.process_command(dec_opcode, &payload).await {
                    match err {
                        Error::UnsupportedOpcode { frame_type, opcode } => {
                            warn!(frame_type, opcode, "unsupported opcode, controller will time out");
                        }
                        Error::ModeViolation { opcode } => {
                            warn!(opcode, "history opcode requested outside upload mode, not responding");
                        }
                        other => return Err(other),
                    }
                }
            }
            other => {
                warn!(?other, opcode = dec_opcode, "unsupported frame type for this direction");
            }
        }

        Ok(())
    }

    async fn encode_and_write(&self, frame_type: FrameType, op: u8, payload: Vec<u8>) -> Result<()> {
        let mut session = self.session.lock().await;
        let secure = session.secure;
        let wire = session.codec.encode(&Frame::new(frame_type, op, payload), secure);
        drop(session);
        self.write(&wire)
    }

    pub async fn process_encryption_command(&self, op: u8, payload: &[u8]) -> Result<EncryptionOutcome> {
        match op {
            encryption_opcode::PUMP_CHECK => {
                let busy = self.session.lock().await.bolus.is_some();
                if busy {
                    self.encode_and_write(FrameType::EncryptionResponse, op, vec![0x01]).await?;
                    return Ok(EncryptionOutcome::Reject);
                }

                let pump_type = self.session.lock().await.codec.pump_type;
                let keys = self.session.lock().await.codec.keys.clone();
                let response = pump_check_payload(pump_type, &keys);
                self.encode_and_write(FrameType::EncryptionResponse, op, response).await?;
                Ok(EncryptionOutcome::Continue)
            }
            encryption_opcode::TIME_INFORMATION => {
                let _ = payload;
                let pump_type = {
                    let mut session = self.session.lock().await;
                    session.codec.reset_pairing();
                    session.codec.pump_type
                };
                self.encode_and_write(FrameType::EncryptionResponse, op, vec![0x00]).await?;

                if pump_type != PumpType::RsV1 {
                    self.session.lock().await.secure = true;
                    Ok(EncryptionOutcome::Secure)
                } else {
                    Ok(EncryptionOutcome::Continue)
                }
            }
            _ => Err(Error::UnsupportedOpcode {
                frame_type: FrameType::EncryptionRequest as u8,
                opcode: op,
            }),
        }
    }

    pub async fn process_command(self: &Arc<Self>, op: u8, payload: &[u8]) -> Result<()> {
        if HISTORY_RANGE.contains(&op) {
            let in_upload_mode = self.store.read(|s| s.is_in_history_upload_mode).await;
            if !in_upload_mode {
                return Err(Error::ModeViolation { opcode: op });
            }
            return self.handle_history(op, payload).await;
        }

        let response = match op {
            opcode::KEEP_CONNECTION => vec![0x00],
            opcode::INITIAL_SCREEN_INFORMATION => self.handle_initial_screen_information().await,
            opcode::GET_PUMP_TIME => self.handle_get_pump_time().await,
            opcode::GET_PUMP_UTC_AND_TIME_ZONE => self.handle_get_pump_utc_and_time_zone().await?,
            opcode::SET_PUMP_TIME => self.handle_set_pump_time(payload).await?,
            opcode::SET_PUMP_UTC_AND_TIME_ZONE => self.handle_set_pump_utc_and_time_zone(payload).await?,
            opcode::GET_USER_OPTION => self.handle_get_user_option().await,
            opcode::SET_USER_OPTION => self.handle_set_user_option(payload).await,
            opcode::SET_HISTORY_UPLOAD_MODE => self.handle_set_history_upload_mode(payload).await,
            opcode::SET_STEP_BOLUS_START => return self.handle_step_bolus_start(op, payload).await,
            opcode::SET_STEP_BOLUS_STOP => self.handle_step_bolus_stop().await,
            opcode::SET_PROFILE_BASAL_RATE => self.handle_set_profile_basal_rate(payload).await,
            opcode::SET_PROFILE_NUMBER => vec![0x00],
            opcode::SET_SUSPEND_ON => self.handle_set_suspend(true).await,
            opcode::SET_SUSPEND_OFF => self.handle_set_suspend(false).await,
            opcode::SET_TEMPORARY_BASAL => self.handle_set_temporary_basal(payload).await,
            opcode::APS_SET_TEMPORARY_BASAL => self.handle_aps_set_temporary_basal(payload).await,
            opcode::CANCEL_TEMPORARY_BASAL => self.handle_cancel_temporary_basal().await,
            opcode::GET_BASAL_RATE => self.handle_get_basal_rate().await,
            opcode::GET_STEP_BOLUS_INFORMATION => self.handle_get_step_bolus_information(),
            _ => {
                return Err(Error::UnsupportedOpcode {
                    frame_type: FrameType::Command as u8,
                    opcode: op,
                })
            }
        };

        self.encode_and_write(FrameType::Response, op, response).await
    }

    async fn handle_initial_screen_information(&self) -> Vec<u8> {
        let pump_type = self.session.lock().await.codec.pump_type;
        let (is_suspended, reservoir, battery, temp_pct, temp_active, current_basal) = self
            .store
            .read(|s| {
                let now = effective_local_time(s);
                let slot = basal_slot(now);
                let basal = if s.temp_basal_active_till.is_some() {
                    s.basal_schedule[slot] * (s.temp_basal_percentage as f64 / 100.0)
                } else {
                    s.basal_schedule[slot]
                };
                (
                    s.is_suspended,
                    s.reservoir_level,
                    s.battery_percent,
                    s.temp_basal_percentage,
                    s.temp_basal_active_till.is_some(),
                    basal,
                )
            })
            .await;

        let mut status = 0u8;
        if is_suspended {
            status |= 0x01;
        }
        if temp_active {
            status |= 0x10;
        }

        let mut buf = Vec::new();
        let mut w = ByteWriter::new(&mut buf);
        w.write_u8(status);
        w.write_u8(0);
        w.write_u8(0);
        w.write_u16_le((MAX_DAILY_UNITS * 100.0) as u16);
        w.write_u16_le((reservoir.max(0.0) * 100.0) as u16);
        w.write_u16_le((current_basal * 100.0) as u16);
        w.write_u8(temp_pct.min(255) as u8);
        w.write_u8(battery);
        w.write_u8(0);
        w.write_u8(0);
        w.write_u8(0);
        w.write_u8(0);
        if pump_type == PumpType::DanaI {
            w.write_u8(0); // error state, always nominal in the simulator
        }
        buf
    }

    async fn handle_get_pump_time(&self) -> Vec<u8> {
        let local = self.store.read(effective_local_time).await;
        pack_date(local).to_vec()
    }

    async fn handle_get_pump_utc_and_time_zone(&self) -> Result<Vec<u8>> {
        let (utc, offset_hours) = self
            .store
            .read(|s| {
                let skewed = Utc::now() + ChronoDuration::seconds(s.clock_skew_seconds);
                (skewed.naive_utc(), (s.time_zone_offset_seconds / 3600) as i8)
            })
            .await;
        let mut out = pack_date(utc).to_vec();
        out.push(offset_hours as u8);
        Ok(out)
    }

    async fn handle_set_pump_time(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let pump_time = parse_date(payload)?;
        self.store
            .mutate(|s| {
                let now_local = now_local_with(s.time_zone_offset_seconds, s.clock_skew_seconds);
                s.clock_skew_seconds += (pump_time - now_local).num_seconds();
            })
            .await?;
        Ok(vec![0x00])
    }

    async fn handle_set_pump_utc_and_time_zone(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut r = ByteReader::new(payload);
        let date_bytes = r.read_slice(6)?;
        let pump_utc = parse_date(date_bytes)?;
        let offset_hours = r.read_u8()? as i8;

        self.store
            .mutate(|s| {
                let now_utc = Utc::now().naive_utc();
                s.clock_skew_seconds = (pump_utc - now_utc).num_seconds();
                s.time_zone_offset_seconds = offset_hours as i32 * 3600;
            })
            .await?;
        Ok(vec![0x00])
    }

    async fn handle_get_user_option(&self) -> Vec<u8> {
        let pump_type = self.session.lock().await.codec.pump_type;
        self.store
            .read(|s| {
                let o = &s.user_options;
                let mut buf = Vec::new();
                let mut w = ByteWriter::new(&mut buf);
                w.write_u8(o.time_display_in_12h as u8);
                w.write_u8(o.button_scroll as u8);
                w.write_u8(o.beep_and_alarm);
                w.write_u8(o.lcd_on_seconds);
                w.write_u8(o.backlight_on_seconds);
                w.write_u8(o.selected_language);
                w.write_u8(matches!(o.units, crate::state::Units::Mmol) as u8);
                w.write_u8(o.shutdown_in_hours);
                w.write_u8(o.low_reservoir_warning);
                w.write_u16_le(o.cannula_volume);
                w.write_u16_le(o.refill_amount);
                for _ in 0..5 {
                    w.write_u8(1);
                }
                if pump_type == PumpType::DanaI {
                    w.write_u16_le(o.target_bg);
                }
                buf
            })
            .await
    }

    async fn handle_set_user_option(&self, payload: &[u8]) -> Vec<u8> {
        let pump_type = self.session.lock().await.codec.pump_type;
        let mut r = ByteReader::new(payload);
        // SET requests carry a 2-byte prefix ahead of the GET layout's field 0.
        let _ = r.skip(2);

        let parsed = (|| -> Result<_> {
            let time_display_in_12h = r.read_u8()? != 0;
            let button_scroll = r.read_u8()? != 0;
            let beep_and_alarm = r.read_u8()?;
            let lcd_on_seconds = r.read_u8()?;
            let backlight_on_seconds = r.read_u8()?;
            let selected_language = r.read_u8()?;
            let units = if r.read_u8()? == 0 {
                crate::state::Units::MgDl
            } else {
                crate::state::Units::Mmol
            };
            let shutdown_in_hours = r.read_u8()?;
            let low_reservoir_warning = r.read_u8()?;
            let cannula_volume = r.read_u16_le()?;
            let refill_amount = r.read_u16_le()?;
            let target_bg = if pump_type == PumpType::DanaI {
                r.read_u16_le().unwrap_or(0)
            } else {
                0
            };

            Ok((
                time_display_in_12h,
                button_scroll,
                beep_and_alarm,
                lcd_on_seconds,
                backlight_on_seconds,
                selected_language,
                units,
                shutdown_in_hours,
                low_reservoir_warning,
                cannula_volume,
                refill_amount,
                target_bg,
            ))
        })();

        let Ok((
            time_display_in_12h,
            button_scroll,
            beep_and_alarm,
            lcd_on_seconds,
            backlight_on_seconds,
            selected_language,
            units,
            shutdown_in_hours,
            low_reservoir_warning,
            cannula_volume,
            refill_amount,
            target_bg,
        )) = parsed
        else {
            return vec![0x01];
        };

        let _ = self
            .store
            .mutate(|s| {
                let o = &mut s.user_options;
                o.time_display_in_12h = time_display_in_12h;
                o.button_scroll = button_scroll;
                o.beep_and_alarm = beep_and_alarm;
                o.lcd_on_seconds = lcd_on_seconds;
                o.backlight_on_seconds = backlight_on_seconds;
                o.selected_language = selected_language;
                o.units = units;
                o.shutdown_in_hours = shutdown_in_hours;
                o.low_reservoir_warning = low_reservoir_warning;
                o.cannula_volume = cannula_volume;
                o.refill_amount = refill_amount;
                o.target_bg = target_bg;
            })
            .await;

        vec![0x00]
    }

    async fn handle_set_history_upload_mode(&self, payload: &[u8]) -> Vec<u8> {
        let enable = payload.first().copied().unwrap_or(0) != 0;
        let _ = self.store.mutate(|s| s.is_in_history_upload_mode = enable).await;
        vec![0x00]
    }

    async fn handle_step_bolus_start(self: &Arc<Self>, op: u8, payload: &[u8]) -> Result<()> {
        let mut r = ByteReader::new(payload);
        let amount_hundredths = r.read_u16_le()?;
        let speed = r.read_u8()?;
        let amount = amount_hundredths as f64 / 100.0;

        let suspended = self.store.read(|s| s.is_suspended).await;
        if suspended {
            return self.encode_and_write(FrameType::Response, op, vec![0x01]).await;
        }

        self.encode_and_write(FrameType::Response, op, vec![0x00]).await?;
        self.start_bolus_ticker(amount, speed).await;
        Ok(())
    }

    async fn start_bolus_ticker(self: &Arc<Self>, amount: f64, speed: u8) {
        let duration = full_duration(amount, speed);
        let ticks = total_ticks(duration, TICK_PERIOD);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_PERIOD);
            for tick_index in 1..=ticks {
                interval.tick().await;
                let current_amount = BolusTicker::amount_at(tick_index, ticks, amount);

                {
                    let mut session = this.session.lock().await;
                    if let Some(ticker) = session.bolus.as_mut() {
                        ticker.tick_index = tick_index;
                        ticker.current_amount = current_amount;
                    } else {
                        return; // cancelled
                    }
                }

                let mut payload = Vec::new();
                ByteWriter::new(&mut payload).write_u16_le((current_amount * 100.0) as u16);
                if this
                    .encode_and_write(FrameType::Notify, opcode::DELIVERY_RATE_DISPLAY, payload)
                    .await
                    .is_err()
                {
                    return;
                }

                if current_amount >= amount {
                    this.session.lock().await.bolus = None;
                    let _ = this
                        .store
                        .mutate(|s| append_bolus_history(s, amount))
                        .await;
                    let _ = this
                        .encode_and_write(FrameType::Notify, opcode::DELIVERY_COMPLETE, vec![0x00])
                        .await;
                    return;
                }
            }
        });

        let mut session = self.session.lock().await;
        session.bolus = Some(BolusTicker {
            handle,
            amount,
            speed,
            total_ticks: ticks,
            tick_index: 0,
            current_amount: 0.0,
        });
    }

    async fn handle_step_bolus_stop(&self) -> Vec<u8> {
        let ticker = self.session.lock().await.bolus.take();
        match ticker {
            None => vec![0x01],
            Some(ticker) => {
                ticker.handle.abort();
                self.record_partial_bolus(ticker.amount, ticker.current_amount).await;
                vec![0x00]
            }
        }
    }

    async fn handle_set_profile_basal_rate(&self, payload: &[u8]) -> Vec<u8> {
        let mut r = ByteReader::new(payload);
        let mut schedule = Vec::with_capacity(crate::state::BASAL_SCHEDULE_LEN);
        for _ in 0..crate::state::BASAL_SCHEDULE_LEN {
            match r.read_u16_be() {
                Ok(v) => schedule.push(v as f64 / 100.0),
                Err(_) => return vec![0x01],
            }
        }
        let _ = self
            .store
            .mutate(|s| {
                debug_assert_eq!(schedule.len(), crate::state::BASAL_SCHEDULE_LEN);
                s.basal_schedule = schedule.clone();
            })
            .await;
        vec![0x00]
    }

    async fn handle_set_suspend(&self, suspended: bool) -> Vec<u8> {
        let _ = self.store.mutate(|s| s.is_suspended = suspended).await;
        vec![0x00]
    }

    async fn handle_set_temporary_basal(&self, payload: &[u8]) -> Vec<u8> {
        let mut r = ByteReader::new(payload);
        let percentage = match r.read_u8() {
            Ok(v) => v as u16,
            Err(_) => return vec![0x01],
        };
        let duration_hours = match r.read_u8() {
            Ok(v) => v,
            Err(_) => return vec![0x01],
        };
        self.apply_temp_basal(percentage, duration_hours as i64 * 3600).await
    }

    async fn handle_aps_set_temporary_basal(&self, payload: &[u8]) -> Vec<u8> {
        let mut r = ByteReader::new(payload);
        let percentage = match r.read_u16_le() {
            Ok(v) => v,
            Err(_) => return vec![0x01],
        };
        let duration_code = match r.read_u8() {
            Ok(v) => v,
            Err(_) => return vec![0x01],
        };
        let duration_seconds = if duration_code == 160 { 30 } else { 15 };
        self.apply_temp_basal(percentage, duration_seconds).await
    }

    async fn apply_temp_basal(&self, percentage: u16, duration_seconds: i64) -> Vec<u8> {
        if percentage > 200 && duration_seconds > 15 {
            return vec![0x01];
        }
        let _ = self
            .store
            .mutate(|s| {
                s.temp_basal_active_till = Some(Utc::now() + ChronoDuration::seconds(duration_seconds));
                s.temp_basal_percentage = percentage;
            })
            .await;
        vec![0x00]
    }

    async fn handle_cancel_temporary_basal(&self) -> Vec<u8> {
        let had_active = self.store.read(|s| s.temp_basal_active_till.is_some()).await;
        if !had_active {
            return vec![0x01];
        }
        let _ = self
            .store
            .mutate(|s| {
                s.temp_basal_active_till = None;
                s.temp_basal_percentage = 100;
            })
            .await;
        vec![0x00]
    }

    async fn handle_get_basal_rate(&self) -> Vec<u8> {
        let max_basal = self.store.read(|s| s.basal_schedule.iter().cloned().fold(0.0, f64::max)).await;
        let mut buf = Vec::new();
        let mut w = ByteWriter::new(&mut buf);
        w.write_u16_le((max_basal * 100.0) as u16);
        w.write_u8(1); // step
        for _ in 0..24 {
            w.write_u16_le(0);
        }
        buf
    }

    fn handle_get_step_bolus_information(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut w = ByteWriter::new(&mut buf);
        w.write_u8(0); // step
        for _ in 0..7 {
            w.write_u8(0);
        }
        w.write_u16_le((MAX_BOLUS_UNITS * 100.0) as u16);
        buf
    }

    async fn handle_history(&self, op: u8, payload: &[u8]) -> Result<()> {
        let from = parse_date(payload)?;
        let from_utc = DateTime::<Utc>::from_naive_utc_and_offset(from, Utc);
        let code_filter = history_filter_for_opcode(op).flatten();

        let items = self
            .store
            .read(|s| {
                s.history
                    .iter()
                    .filter(|item| item.timestamp > from_utc)
                    .filter(|item| code_filter.map(|c| c == item.code).unwrap_or(true))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .await;

        for item in items {
            let mut buf = Vec::new();
            let mut w = ByteWriter::new(&mut buf);
            w.write_u8(item.code.wire_code());
            let date = pack_date(item.timestamp.naive_utc());
            w.write_slice(&date);
            w.write_u8(item.param1);
            w.write_u8(item.param2);
            w.write_u16_le(item.value);
            self.encode_and_write(FrameType::Notify, op, buf).await?;
        }

        self.encode_and_write(FrameType::Notify, op, vec![0, 0, 0]).await
    }
}

fn pump_check_payload(pump_type: PumpType, keys: &crate::keys::Keys) -> Vec<u8> {
    match pump_type {
        PumpType::RsV1 => vec![0x04],
        PumpType::RsV3 => vec![0x05, 0x00, 0x13],
        PumpType::DanaI => {
            let mut out = b"OKM".to_vec();
            out.extend_from_slice(&[0x09, 0x50, 0x13]);
            out.extend_from_slice(&keys.ble5_keys);
            out
        }
    }
}

fn append_bolus_history(state: &mut SimulatorState, delivered: f64) {
    state.reservoir_level = (state.reservoir_level - delivered).max(0.0);
    state.history.push(HistoryItem {
        timestamp: Utc::now(),
        code: HistoryCode::Bolus,
        param1: 0,
        param2: 0,
        value: (delivered * 100.0).round() as u16,
    });
}

fn now_local_with(time_zone_offset_seconds: i32, clock_skew_seconds: i64) -> NaiveDateTime {
    (Utc::now() + ChronoDuration::seconds(clock_skew_seconds + time_zone_offset_seconds as i64)).naive_utc()
}

fn effective_local_time(s: &SimulatorState) -> NaiveDateTime {
    now_local_with(s.time_zone_offset_seconds, s.clock_skew_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingTransport {
        chunks: StdMutex<Vec<Vec<u8>>>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                chunks: StdMutex::new(Vec::new()),
            }
        }
    }

    impl Transport for RecordingTransport {
        fn notify(&self, chunk: &[u8]) -> Result<()> {
            self.chunks.lock().unwrap().push(chunk.to_vec());
            Ok(())
        }
    }

    fn center(pump_type: PumpType) -> (Arc<CommandCenter>, Arc<RecordingTransport>, tempfile_path::TempPath) {
        let path = tempfile_path::TempPath::new();
        let store = Arc::new(Store::load(&path.0));
        let transport = Arc::new(RecordingTransport::new());
        let cc = CommandCenter::new(store, transport.clone(), pump_type, "ABC12345DE".to_string());
        (cc, transport, path)
    }

    mod tempfile_path {
        pub struct TempPath(pub std::path::PathBuf);
        impl TempPath {
            pub fn new() -> Self {
                Self(std::env::temp_dir().join(format!("dana-sim-cc-test-{:?}", std::thread::current().id())))
            }
        }
        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
            }
        }
    }

    #[tokio::test]
    async fn keep_connection_acks() {
        let (cc, transport, _path) = center(PumpType::RsV3);
        cc.process_command(opcode::KEEP_CONNECTION, &[]).await.unwrap();
        let chunks = transport.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn temp_basal_rejects_high_percentage_long_duration() {
        let (cc, _transport, _path) = center(PumpType::RsV3);
        let payload = [210u8, 1]; // percentage=210, duration=1h
        let response = cc.handle_set_temporary_basal(&payload).await;
        assert_eq!(response, vec![0x01]);
    }

    #[tokio::test]
    async fn history_gated_by_upload_mode() {
        let (cc, _transport, _path) = center(PumpType::RsV3);
        let date = [24, 1, 1, 0, 0, 0];
        let err = cc.process_command(opcode::ALL_HISTORY, &date).await.unwrap_err();
        assert!(matches!(err, Error::ModeViolation { .. }));
    }

    #[tokio::test]
    async fn bolus_start_rejected_while_suspended() {
        let (cc, transport, _path) = center(PumpType::RsV3);
        cc.store.mutate(|s| s.is_suspended = true).await.unwrap();

        let mut payload = Vec::new();
        ByteWriter::new(&mut payload).write_u16_le(200);
        payload.push(0);
        cc.handle_step_bolus_start(opcode::SET_STEP_BOLUS_START, &payload)
            .await
            .unwrap();

        let chunks = transport.chunks.lock().unwrap();
        assert_eq!(chunks.last().unwrap()[5], 0x01);
    }

    #[tokio::test]
    async fn garbled_fragment_is_dropped_without_erroring() {
        let (cc, _transport, _path) = center(PumpType::RsV3);
        cc.handle_fragment(&[0x00; 8]).await.unwrap();
    }

    #[tokio::test]
    async fn unsupported_opcode_logs_and_does_not_reject_connection() {
        let (cc, transport, _path) = center(PumpType::RsV3);
        let mut encoder = Codec::new(PumpType::RsV3, "ABC12345DE".to_string());
        let wire = encoder.encode(&Frame::new(FrameType::Command, 0xFE, vec![]), false);

        cc.handle_fragment(&wire).await.unwrap();
        assert!(transport.chunks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_opcode_outside_upload_mode_does_not_reject_connection() {
        let (cc, transport, _path) = center(PumpType::RsV3);
        let mut encoder = Codec::new(PumpType::RsV3, "ABC12345DE".to_string());
        let date = [24u8, 1, 1, 0, 0, 0];
        let wire = encoder.encode(&Frame::new(FrameType::Command, opcode::ALL_HISTORY, date.to_vec()), false);

        cc.handle_fragment(&wire).await.unwrap();
        assert!(transport.chunks.lock().unwrap().is_empty());
    }
}
