//! Shared telemetry snapshot store.
//!
//! `TelemetryStore` is the single source of truth for live device and
//! guardian state. It is mutated only by applying realtime events (or the
//! explicit guardian-location setter) and read through full-snapshot
//! subscriptions, so UI collaborators never observe a partial write.
//! Applying the same event twice yields the same snapshot, which makes the
//! realtime channel's at-least-once delivery safe.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

use crate::realtime::client::RealtimeClient;
use crate::realtime::proto::{
    LocationEventMsg, StatusEventMsg, LOCATION_EVENT, STATUS_EVENT,
};

/// A validated latitude/longitude pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// Current known state of the device and its guardian.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TelemetrySnapshot {
    pub device_online: bool,
    pub emergency: bool,
    pub device_location: Option<Coordinates>,
    pub guardian_location: Option<Coordinates>,
}

/// Errors produced while applying telemetry updates.
///
/// Malformed events are dropped with the snapshot unchanged; nothing beyond
/// a log line reaches the UI collaborators.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("malformed {event} event: {reason}")]
    MalformedEvent { event: &'static str, reason: String },

    #[error("coordinates are not finite: lat={lat}, lng={lng}")]
    InvalidCoordinates { lat: f64, lng: f64 },
}

/// Subscribable store of the live telemetry snapshot.
///
/// Clones share the same underlying snapshot.
#[derive(Clone)]
pub struct TelemetryStore {
    tx: Arc<watch::Sender<TelemetrySnapshot>>,
}

impl TelemetryStore {
    /// Creates an empty store: device offline, no emergency, locations
    /// unknown.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(TelemetrySnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Returns a copy of the current snapshot.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.tx.borrow().clone()
    }

    /// Subscribes to full-snapshot updates.
    ///
    /// Every successful mutation publishes the complete snapshot; there are
    /// no partial-update notifications.
    pub fn subscribe(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.tx.subscribe()
    }

    /// Applies a `status` event payload.
    ///
    /// Fields absent from the payload are left unchanged. A payload whose
    /// present fields have the wrong type is dropped whole.
    pub fn apply_status_event(&self, data: &Value) -> Result<(), TelemetryError> {
        let msg: StatusEventMsg =
            serde_json::from_value(data.clone()).map_err(|err| malformed(STATUS_EVENT, err))?;

        self.tx.send_modify(|snapshot| {
            if let Some(status) = msg.status.as_deref() {
                snapshot.device_online = status == "online";
            }
            if let Some(emergency) = msg.emergency {
                snapshot.emergency = emergency;
            }
        });
        Ok(())
    }

    /// Applies a `location` event payload, overwriting the device location.
    ///
    /// Both coordinates must be finite numbers; anything else drops the
    /// event with the snapshot unchanged.
    pub fn apply_location_event(&self, data: &Value) -> Result<(), TelemetryError> {
        let msg: LocationEventMsg =
            serde_json::from_value(data.clone()).map_err(|err| malformed(LOCATION_EVENT, err))?;
        let coordinates = validate_coordinates(msg.lat, msg.lng).map_err(|err| {
            warn!(event = "location_event_dropped", error = %err);
            err
        })?;

        self.tx
            .send_modify(|snapshot| snapshot.device_location = Some(coordinates));
        Ok(())
    }

    /// Sets the guardian's own location; a local-origin update, never fed by
    /// the event stream.
    pub fn set_guardian_location(&self, coordinates: Coordinates) -> Result<(), TelemetryError> {
        let coordinates = validate_coordinates(coordinates.lat, coordinates.lng)?;
        self.tx
            .send_modify(|snapshot| snapshot.guardian_location = Some(coordinates));
        Ok(())
    }

    /// Registers the store's event handlers on a realtime client.
    ///
    /// Malformed events are already logged by the `apply_*` methods, so the
    /// handlers simply discard their error.
    pub fn bind(&self, client: &RealtimeClient) {
        let store = self.clone();
        client.on(STATUS_EVENT, move |data| {
            let _ = store.apply_status_event(data);
        });
        let store = self.clone();
        client.on(LOCATION_EVENT, move |data| {
            let _ = store.apply_location_event(data);
        });
    }
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn malformed(event: &'static str, err: serde_json::Error) -> TelemetryError {
    let error = TelemetryError::MalformedEvent {
        event,
        reason: err.to_string(),
    };
    warn!(event = "telemetry_event_dropped", error = %error);
    error
}

fn validate_coordinates(lat: f64, lng: f64) -> Result<Coordinates, TelemetryError> {
    if lat.is_finite() && lng.is_finite() {
        Ok(Coordinates { lat, lng })
    } else {
        Err(TelemetryError::InvalidCoordinates { lat, lng })
    }
}
