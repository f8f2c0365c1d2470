//! GeoAlertMatcher processor.
//!
//! The GeoAlertMatcher is responsible for:
//! - Periodically scanning the alert store and the live connections
//! - Matching every active alert against every located connection by
//!   great-circle distance
//! - Delivering distance-annotated frames to matched connections in paced
//!   batches, then one catch-all broadcast to the alert's city channel
//! - Receiving `ConnectionLocated` events via the `Processor` trait and
//!   sending the newly located connection the alerts that concern it
//!
//! A run moves through `Idle -> Scanning -> Matching -> Delivering -> Idle`.
//! Runs never overlap: a run triggered while another is in progress is
//! skipped, not queued.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use alertcast_sdk::objects::{
    ActiveAlert, ActiveDisasters, AlertFrame, Attributes, GeoPoint, NoticeFrame, Proximity,
    ServerEvent, Severity, WarningFrame, attribute,
};
use compact_str::CompactString;
use kanau::processor::Processor;
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertSource, AlertSourceError};
use crate::config::{ConfigStore, ConfigWatcher, MatcherConfig};
use crate::events::{ConnectionLocated, ConnectionLocatedReceiver};
use crate::gateway::{GatewayHandle, Target};
use crate::geo::distance_meters;
use crate::registry::{Channel, Connection, ConnectionId};
use crate::utils::batching::{batches, pause_between_batches};

/// `source` attribute on frames produced by a periodic scan.
const SOURCE_SCAN: &str = "automated-check";
/// `source` attribute on frames produced for a newly located connection.
const SOURCE_ARRIVAL: &str = "reconnection-update";

/// The ticker refuses anything shorter.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Public data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScanPhase {
    Idle = 0,
    Scanning = 1,
    Matching = 2,
    Delivering = 3,
}

impl ScanPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ScanPhase::Scanning,
            2 => ScanPhase::Matching,
            3 => ScanPhase::Delivering,
            _ => ScanPhase::Idle,
        }
    }
}

/// Result of one [`GeoAlertMatcher::run_scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Another run was in progress.
    Skipped,
    /// Nobody is connected; the alert store was not read.
    NoConnections,
    /// The alert store could not be read.
    SourceFailed,
    /// The gateway hub is gone.
    GatewayClosed,
    Completed {
        /// Active alerts with a usable location.
        alerts: usize,
        /// Connection/alert pairs delivered to.
        matches: usize,
    },
}

/// An active alert with its center and effective radius resolved.
#[derive(Debug, Clone)]
pub struct ScannedAlert {
    pub doc: ActiveAlert,
    pub center: GeoPoint,
    pub radius_meters: f64,
}

impl ScannedAlert {
    /// `None` for inactive documents and documents without a valid point.
    pub fn new(doc: ActiveAlert, default_radius_meters: f64) -> Option<Self> {
        if !doc.active {
            return None;
        }
        let Some(center) = doc.location.point() else {
            debug!(alert_id = %doc.id, "Skipping alert without a usable location");
            return None;
        };
        let radius_meters = doc.radius_meters(default_radius_meters);
        Some(Self {
            doc,
            center,
            radius_meters,
        })
    }

    pub fn city_channel(&self) -> Option<Channel> {
        self.doc.location.city.as_deref().and_then(Channel::city)
    }
}

/// One connection inside one alert's radius.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub connection_id: ConnectionId,
    pub user_id: CompactString,
    pub alert_id: String,
    pub distance_meters: f64,
}

/// Every located connection within `alert`'s radius (inclusive), nearest
/// first.
pub fn match_connections(alert: &ScannedAlert, connections: &[Arc<Connection>]) -> Vec<Match> {
    let mut matches: Vec<Match> = connections
        .iter()
        .filter_map(|conn| {
            let distance = distance_meters(conn.location?, alert.center);
            (distance <= alert.radius_meters).then(|| Match {
                connection_id: conn.id,
                user_id: conn.user_id.clone(),
                alert_id: alert.doc.id.clone(),
                distance_meters: distance,
            })
        })
        .collect();
    matches.sort_by(|a, b| a.distance_meters.total_cmp(&b.distance_meters));
    matches
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Wire payloads for one alert, built once and personalised per match.
struct AlertFrames {
    warning: Value,
    notice: Option<Value>,
    attributes: Attributes,
    severity: Severity,
    label: String,
}

impl AlertFrames {
    fn new(alert: &ScannedAlert, source: &str) -> Self {
        let doc = &alert.doc;
        let city = doc.location.city.as_deref().unwrap_or("Unknown");
        let state = doc.location.state.as_deref().unwrap_or("Unknown");
        let severity = doc.severity.clone().unwrap_or_else(|| Severity::High.to_string());
        let timestamp = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();

        let warning = json!({
            "id": format!("disaster-{}", doc.id),
            "title": doc.title.as_deref().unwrap_or("Disaster Warning"),
            "message": doc.description.as_deref().unwrap_or("A disaster has been reported in your area"),
            "type": doc.disaster_type.as_deref().unwrap_or("unknown"),
            "severity": severity,
            "location": {
                "city": city,
                "state": state,
                "coordinates": {
                    "latitude": alert.center.latitude,
                    "longitude": alert.center.longitude,
                },
            },
            "timestamp": timestamp,
            "instructions": doc.instructions.as_deref().unwrap_or("Stay alert and follow official guidance"),
        });

        let notice = doc.evacuation.then(|| {
            let mut notice = warning.clone();
            if let Value::Object(map) = &mut notice {
                map.insert(
                    "title".to_owned(),
                    Value::String(format!(
                        "Evacuation: {}",
                        doc.title.as_deref().unwrap_or("Disaster Warning")
                    )),
                );
                map.insert(
                    "evacuationZone".to_owned(),
                    Value::String(doc.evacuation_zone.clone().unwrap_or_else(|| "Affected area".to_owned())),
                );
                map.insert(
                    "evacuationRoutes".to_owned(),
                    json!(
                        doc.evacuation_routes
                            .clone()
                            .unwrap_or_else(|| vec!["Follow official guidance".to_owned()])
                    ),
                );
            }
            notice
        });

        let attributes = Attributes::from([
            (attribute::SEVERITY.to_owned(), severity),
            (attribute::REGION.to_owned(), format!("{city},{state}")),
            (attribute::SOURCE.to_owned(), source.to_owned()),
        ]);

        Self {
            warning,
            notice,
            attributes,
            severity: doc.severity(),
            label: doc.disaster_type.clone().unwrap_or_else(|| "disaster".to_owned()),
        }
    }

    /// Warning, then emergency for high/critical, then evacuation if
    /// recommended. Clients rely on this order.
    fn personalized(&self, distance: f64) -> Vec<ServerEvent> {
        let proximity = Proximity::new(distance);
        let message = format!(
            "You are approximately {} km from this {}.",
            proximity.distance_km, self.label
        );

        let mut events = vec![ServerEvent::DisasterWarning(WarningFrame {
            warning: self.warning.clone(),
            attributes: self.attributes.clone(),
            proximity: Some(proximity.clone().with_message(message.clone())),
        })];
        if self.severity.is_escalated() {
            events.push(ServerEvent::EmergencyAlert(AlertFrame {
                alert: self.warning.clone(),
                attributes: self.attributes.clone(),
                proximity: Some(proximity.clone().with_message(format!("URGENT: {message}"))),
            }));
        }
        if let Some(notice) = &self.notice {
            events.push(ServerEvent::EvacuationNotice(NoticeFrame {
                notice: notice.clone(),
                attributes: self.attributes.clone(),
                proximity: Some(proximity),
            }));
        }
        events
    }

    fn catch_all(&self) -> ServerEvent {
        ServerEvent::DisasterWarning(WarningFrame {
            warning: self.warning.clone(),
            attributes: self.attributes.clone(),
            proximity: None,
        })
    }
}

/// Entry of the `active-disasters` list: the document plus its distance.
fn summary(alert: &ScannedAlert, distance: f64) -> Value {
    let mut value = serde_json::to_value(&alert.doc).unwrap_or_else(|_| json!({"id": alert.doc.id}));
    if let Value::Object(map) = &mut value {
        let proximity = Proximity::new(distance);
        map.insert("distance".to_owned(), json!(proximity.distance_meters));
        map.insert("distanceKm".to_owned(), Value::String(proximity.distance_km));
    }
    value
}

// ---------------------------------------------------------------------------
// Run guard
// ---------------------------------------------------------------------------

/// Holds the matcher out of `Idle` for the lifetime of one run.
struct RunGuard<'a> {
    phase: &'a AtomicU8,
}

impl<'a> RunGuard<'a> {
    fn begin(phase: &'a AtomicU8) -> Option<Self> {
        phase
            .compare_exchange(
                ScanPhase::Idle as u8,
                ScanPhase::Scanning as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| Self { phase })
    }

    fn enter(&self, next: ScanPhase) {
        self.phase.store(next as u8, Ordering::Release);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.phase.store(ScanPhase::Idle as u8, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// GeoAlertMatcher
// ---------------------------------------------------------------------------

pub struct GeoAlertMatcher {
    gateway: GatewayHandle,
    source: Arc<dyn AlertSource>,
    config: ConfigStore<MatcherConfig>,
    phase: AtomicU8,
    scans_started: AtomicU64,
    scans_skipped: AtomicU64,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl GeoAlertMatcher {
    pub fn new(
        gateway: GatewayHandle,
        source: Arc<dyn AlertSource>,
        config: ConfigStore<MatcherConfig>,
    ) -> Self {
        Self {
            gateway,
            source,
            config,
            phase: AtomicU8::new(ScanPhase::Idle as u8),
            scans_started: AtomicU64::new(0),
            scans_skipped: AtomicU64::new(0),
            ticker: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> ScanPhase {
        ScanPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn scans_started(&self) -> u64 {
        self.scans_started.load(Ordering::Relaxed)
    }

    pub fn scans_skipped(&self) -> u64 {
        self.scans_skipped.load(Ordering::Relaxed)
    }

    /// Run the matcher until shutdown is signaled.
    ///
    /// Starts the periodic checks, re-arms them when the configured interval
    /// changes, and handles `ConnectionLocated` events on their own tasks so
    /// a slow per-connection update never delays the next event.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
        mut located_rx: ConnectionLocatedReceiver,
        mut config_watcher: ConfigWatcher<MatcherConfig>,
    ) {
        let mut interval = self.config.get().interval;
        self.start_periodic_checks(interval);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("GeoAlertMatcher received shutdown signal");
                        break;
                    }
                }

                Ok(()) = config_watcher.changed() => {
                    let next = self.config.get().interval;
                    if next != interval {
                        info!(
                            old_secs = interval.as_secs(),
                            new_secs = next.as_secs(),
                            "Scan interval changed, re-arming periodic checks"
                        );
                        interval = next;
                        self.rearm_periodic_checks(interval);
                    }
                }

                Some(event) = located_rx.recv() => {
                    let matcher = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _ = matcher.process(event).await;
                    });
                }

                else => {
                    info!("ConnectionLocated channel closed");
                    break;
                }
            }
        }

        self.stop_periodic_checks();
        info!("GeoAlertMatcher shutdown complete");
    }

    /// (Re)start the background ticker. The first scan fires immediately.
    pub fn start_periodic_checks(self: &Arc<Self>, interval: Duration) {
        self.arm_ticker(interval, Instant::now());
    }

    /// Replace the ticker after an interval change. The next scan is one
    /// full new interval away.
    fn rearm_periodic_checks(self: &Arc<Self>, interval: Duration) {
        let interval = interval.max(MIN_INTERVAL);
        self.arm_ticker(interval, Instant::now() + interval);
    }

    fn arm_ticker(self: &Arc<Self>, interval: Duration, first_tick: Instant) {
        let interval = interval.max(MIN_INTERVAL);
        let matcher = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first_tick, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                // Detached so a long delivery phase overlaps the next tick
                // and gets skipped there instead of delaying it.
                let matcher = Arc::clone(&matcher);
                tokio::spawn(async move {
                    matcher.run_scan().await;
                });
            }
        });

        let previous = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs(), "Periodic proximity checks started");
    }

    /// Cancel the ticker. Scans already running finish; no new ones start.
    pub fn stop_periodic_checks(&self) {
        let task = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            info!("Periodic proximity checks stopped");
        }
    }

    pub fn periodic_checks_running(&self) -> bool {
        self.ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// One full scan, match and deliver cycle.
    pub async fn run_scan(&self) -> ScanOutcome {
        let Some(run) = RunGuard::begin(&self.phase) else {
            self.scans_skipped.fetch_add(1, Ordering::Relaxed);
            info!(phase = ?self.phase(), "Previous proximity scan still running, skipping");
            return ScanOutcome::Skipped;
        };
        self.scans_started.fetch_add(1, Ordering::Relaxed);
        let config = self.config.get();

        let connections = match self.gateway.snapshot().await {
            Ok(connections) => connections,
            Err(e) => {
                warn!(error = %e, "Cannot snapshot connections");
                return ScanOutcome::GatewayClosed;
            }
        };
        if connections.is_empty() {
            debug!("No connected clients, skipping proximity scan");
            return ScanOutcome::NoConnections;
        }

        let alerts = match self.scan(&connections, &config).await {
            Ok(alerts) => alerts,
            Err(e) => {
                error!(error = %e, "Failed to list active alerts");
                return ScanOutcome::SourceFailed;
            }
        };
        let alert_count = alerts.len();

        run.enter(ScanPhase::Matching);
        let plans: Vec<(ScannedAlert, Vec<Match>)> = alerts
            .into_iter()
            .map(|alert| {
                let matches = match_connections(&alert, &connections);
                (alert, matches)
            })
            .filter(|(_, matches)| !matches.is_empty())
            .collect();

        run.enter(ScanPhase::Delivering);
        let mut delivered = 0;
        for (alert, matches) in &plans {
            self.deliver(alert, matches, &config).await;
            delivered += matches.len();
        }

        info!(
            connections = connections.len(),
            alerts = alert_count,
            matches = delivered,
            "Proximity scan complete"
        );
        ScanOutcome::Completed {
            alerts: alert_count,
            matches: delivered,
        }
    }

    /// Active alerts with a usable location. Does not read the store when
    /// `connections` is empty.
    pub async fn scan(
        &self,
        connections: &[Arc<Connection>],
        config: &MatcherConfig,
    ) -> Result<Vec<ScannedAlert>, AlertSourceError> {
        if connections.is_empty() {
            return Ok(Vec::new());
        }
        let docs = self.source.list_active().await?;
        Ok(docs
            .into_iter()
            .filter_map(|doc| ScannedAlert::new(doc, config.default_radius_meters))
            .collect())
    }

    /// Send `alert` to every match in paced batches, then once to the
    /// alert's city channel.
    pub async fn deliver(&self, alert: &ScannedAlert, matches: &[Match], config: &MatcherConfig) {
        let frames = AlertFrames::new(alert, SOURCE_SCAN);

        for (index, batch) in batches(matches, config.batch_size).enumerate() {
            if index > 0 {
                pause_between_batches(config.batch_stagger).await;
            }
            for m in batch {
                let target = Target::Connection(m.connection_id);
                for event in frames.personalized(m.distance_meters) {
                    self.gateway.send_to(target.clone(), Arc::new(event)).await;
                }
            }
            debug!(
                alert_id = %alert.doc.id,
                batch = index,
                size = batch.len(),
                "Delivered proximity batch"
            );
        }

        if let Some(channel) = alert.city_channel() {
            debug!(alert_id = %alert.doc.id, %channel, "Broadcasting catch-all warning");
            self.gateway
                .broadcast_to_channel(channel, Arc::new(frames.catch_all()))
                .await;
        }
    }

    /// Send one connection an `active-disasters` summary plus framed
    /// messages for every active alert it is inside of. Returns the number
    /// of such alerts.
    async fn notify_connection(&self, connection: &Connection) -> usize {
        let Some(location) = connection.location else {
            return 0;
        };
        let config = self.config.get();

        let docs = match self.source.list_active().await {
            Ok(docs) => docs,
            Err(e) => {
                warn!(connection = %connection.id, error = %e, "Failed to list active alerts");
                return 0;
            }
        };
        let relevant: Vec<(ScannedAlert, f64)> = docs
            .into_iter()
            .filter_map(|doc| ScannedAlert::new(doc, config.default_radius_meters))
            .filter_map(|alert| {
                let distance = distance_meters(location, alert.center);
                (distance <= alert.radius_meters).then_some((alert, distance))
            })
            .collect();

        let target = Target::Connection(connection.id);
        let count = relevant.len();
        let message = if count == 0 {
            "No active disasters in your area".to_owned()
        } else {
            format!("{count} active disasters in your area")
        };
        let overview = ActiveDisasters {
            count,
            message,
            disasters: relevant.iter().map(|(a, d)| summary(a, *d)).collect(),
            timestamp: OffsetDateTime::now_utc().format(&Rfc3339).ok(),
        };
        self.gateway
            .send_to(target.clone(), Arc::new(ServerEvent::ActiveDisasters(overview)))
            .await;

        for (index, batch) in batches(&relevant, config.arrival_batch_size).enumerate() {
            if index > 0 {
                pause_between_batches(config.arrival_stagger).await;
            }
            for (alert, distance) in batch {
                let frames = AlertFrames::new(alert, SOURCE_ARRIVAL);
                for event in frames.personalized(*distance) {
                    self.gateway.send_to(target.clone(), Arc::new(event)).await;
                }
            }
        }

        info!(
            connection = %connection.id,
            user_id = %connection.user_id,
            alerts = count,
            "Sent active disasters to newly located connection"
        );
        count
    }
}

// ---------------------------------------------------------------------------
// Processor trait implementation
// ---------------------------------------------------------------------------

impl Processor<ConnectionLocated> for GeoAlertMatcher {
    type Output = usize;
    type Error = Infallible;

    async fn process(&self, event: ConnectionLocated) -> Result<usize, Infallible> {
        Ok(self.notify_connection(&event.connection).await)
    }
}
