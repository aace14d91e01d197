//! Tamper-resistant time and time-of-day restrictions
//!
//! The service trusts the management server's clock over the local one.
//! Once a server time has been fetched, "now" is derived from it plus the
//! monotonic time elapsed since the fetch, so changing the system clock does
//! not move the filter's notion of time. Jumps between the two clocks and
//! time-zone changes are reported as tampering.

use crate::platform::SystemClock;
use crate::web_service::RemoteApi;
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use netveil_proxy::config::{PolicyConfiguration, TimeRestrictionModel};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest accepted change in the server/local clock difference
const MAX_DRIFT_SECS: i64 = 60;

const HIGH_RES_REFRESH: Duration = Duration::from_secs(15 * 60);
const LOW_RES_REFRESH: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TamperEvent {
    /// The local clock moved relative to server time
    TimeTampering { drift_secs: i64 },
    /// The system time zone changed
    ZoneTampering { from: String, to: String },
}

#[derive(Debug, Default)]
struct TimeState {
    last_server_time: Option<DateTime<Utc>>,
    /// Monotonic reading taken when `last_server_time` was fetched
    fetched_at: Duration,
    last_difference: Option<chrono::Duration>,
    last_zone_id: Option<String>,
}

pub struct TimeDetection {
    clock: Arc<dyn SystemClock>,
    api: Arc<dyn RemoteApi>,
    state: Mutex<TimeState>,
    refetch: Notify,
    events: broadcast::Sender<TamperEvent>,
}

impl TimeDetection {
    pub fn new(clock: Arc<dyn SystemClock>, api: Arc<dyn RemoteApi>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            clock,
            api,
            state: Mutex::new(TimeState::default()),
            refetch: Notify::new(),
            events,
        }
    }

    /// Seed the last observed time zone, e.g. from persisted settings, so a
    /// change made while the service was stopped is still reported
    pub fn with_last_zone(self, zone: Option<String>) -> Self {
        self.lock().last_zone_id = zone;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TamperEvent> {
        self.events.subscribe()
    }

    pub fn observed_zone(&self) -> Option<String> {
        self.lock().last_zone_id.clone()
    }

    fn lock(&self) -> MutexGuard<'_, TimeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current time, from the server clock when one is known and from the
    /// local clock otherwise
    pub fn real_time(&self) -> DateTime<FixedOffset> {
        let local = self.clock.now_local();
        let mut state = self.lock();
        self.check_zone(&mut state);

        let Some(server) = state.last_server_time else {
            return local;
        };

        let elapsed = self.clock.monotonic().saturating_sub(state.fetched_at);
        let server_now = server + chrono::Duration::from_std(elapsed).unwrap_or_default();
        self.record_difference(&mut state, server_now - local.with_timezone(&Utc));

        server_now.with_timezone(local.offset())
    }

    /// Fetch server time once. Returns whether a server time was obtained.
    pub async fn refresh(&self) -> bool {
        match self.api.server_time().await {
            Ok(server) => {
                let local = self.clock.now_local();
                let mut state = self.lock();
                state.last_server_time = Some(server);
                state.fetched_at = self.clock.monotonic();
                self.record_difference(&mut state, server - local.with_timezone(&Utc));
                debug!("Server time refreshed: {}", server);
                true
            }
            Err(e) => {
                debug!("Server time unavailable: {}", e);
                false
            }
        }
    }

    fn record_difference(&self, state: &mut TimeState, difference: chrono::Duration) {
        if let Some(previous) = state.last_difference {
            let drift = (difference - previous).num_seconds();
            if drift.abs() > MAX_DRIFT_SECS {
                warn!(drift_secs = drift, "System clock changed relative to server time");
                let _ = self.events.send(TamperEvent::TimeTampering { drift_secs: drift });
                if !self.clock.is_high_resolution() {
                    self.refetch.notify_one();
                }
            }
        }
        state.last_difference = Some(difference);
    }

    fn check_zone(&self, state: &mut TimeState) {
        let current = self.clock.zone_id();
        match state.last_zone_id.as_deref() {
            Some(previous) if previous != current => {
                warn!("Time zone changed from {} to {}", previous, current);
                let _ = self.events.send(TamperEvent::ZoneTampering {
                    from: previous.to_string(),
                    to: current.clone(),
                });
                state.last_zone_id = Some(current);
            }
            Some(_) => {}
            None => state.last_zone_id = Some(current),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        if self.clock.is_high_resolution() {
            HIGH_RES_REFRESH
        } else {
            LOW_RES_REFRESH
        }
    }

    /// Refresh server time until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Time detection started");
        loop {
            self.refresh().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.refresh_interval()) => {}
                _ = self.refetch.notified() => debug!("Server time refetch requested"),
            }
        }
        debug!("Time detection stopped");
    }

    /// Whether `now` falls inside the allowed windows of `model`.
    ///
    /// Boundaries are decimal hours on the same calendar day as `now`; 24
    /// means the last millisecond of the day. Each start/end pair is
    /// inclusive at both ends.
    pub fn is_date_time_allowed(now: DateTime<FixedOffset>, model: &TimeRestrictionModel) -> bool {
        if !model.enabled {
            return true;
        }

        let date = now.date_naive();
        let local = now.naive_local();
        model
            .enabled_through
            .chunks(2)
            .any(|pair| match pair {
                [start, end] => boundary_on(date, *start) <= local && local <= boundary_on(date, *end),
                _ => false,
            })
    }

    /// Whether the current real time is allowed by today's restriction.
    /// No restriction configured for today means allowed.
    pub fn is_now_allowed(&self, config: &PolicyConfiguration) -> bool {
        let now = self.real_time();
        restriction_for(config, now.weekday())
            .map_or(true, |model| Self::is_date_time_allowed(now, model))
    }
}

/// Restriction model configured for a weekday
pub fn restriction_for(config: &PolicyConfiguration, weekday: Weekday) -> Option<&TimeRestrictionModel> {
    config.time_restrictions.for_weekday(weekday)
}

fn boundary_on(date: NaiveDate, hours: f64) -> NaiveDateTime {
    if hours >= 24.0 {
        return date.and_time(NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN));
    }
    let millis = (hours.max(0.0) * 3_600_000.0).round() as u32;
    let time = NaiveTime::from_num_seconds_from_midnight_opt(millis / 1000, (millis % 1000) * 1_000_000)
        .unwrap_or(NaiveTime::MIN);
    date.and_time(time)
}
