//! Last known position of the wearer.

use tokio::sync::watch;
use tracing::debug;

use caremon_types::Location;

/// Holds the latest location fix for batches to carry.
#[derive(Debug)]
pub struct LocationTracker {
    tx: watch::Sender<Option<Location>>,
}

impl Default for LocationTracker {
    fn default() -> Self {
        Self::new(None)
    }
}

impl LocationTracker {
    pub fn new(initial: Option<Location>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Replace the last known fix.
    pub fn update(&self, location: Location) {
        debug!(latitude = location.latitude, longitude = location.longitude, "Location updated");
        self.tx.send_replace(Some(location));
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn latest(&self) -> Option<Location> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Location>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caremon_types::LocationSource;

    #[test]
    fn test_update_and_clear() {
        let tracker = LocationTracker::default();
        let rx = tracker.subscribe();
        assert!(tracker.latest().is_none());

        let fix = Location {
            latitude: 55.75,
            longitude: 37.61,
            accuracy: Some(10.0),
            source: LocationSource::Gps,
        };
        tracker.update(fix);
        assert_eq!(tracker.latest(), Some(fix));
        assert_eq!(*rx.borrow(), Some(fix));

        tracker.clear();
        assert!(rx.borrow().is_none());
    }
}
