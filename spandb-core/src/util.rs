//! Small shared helpers

use std::sync::atomic::{AtomicBool, Ordering};

/// Serde adapter for `Duration` fields written as humantime strings ("30s", "1h")
pub mod duration_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Guard that lets only one caller run a periodic job at a time
#[derive(Debug, Default)]
pub struct SingleFlight {
    running: AtomicBool,
}

/// Releases the flight when dropped
pub struct FlightGuard<'a> {
    flight: &'a SingleFlight,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` if a previous run is still in progress
    pub fn try_start(&self) -> Option<FlightGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { flight: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flight.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    struct Cfg {
        #[serde(with = "duration_format")]
        poll: Duration,
    }

    #[test]
    fn test_duration_format() {
        let cfg: Cfg = serde_json::from_str(r#"{"poll":"1m 30s"}"#).unwrap();
        assert_eq!(cfg.poll, Duration::from_secs(90));
        assert_eq!(serde_json::to_string(&cfg).unwrap(), r#"{"poll":"1m 30s"}"#);
        assert!(serde_json::from_str::<Cfg>(r#"{"poll":"soon"}"#).is_err());
    }

    #[test]
    fn test_single_flight() {
        let flight = SingleFlight::new();
        let guard = flight.try_start().unwrap();
        assert!(flight.is_running());
        assert!(flight.try_start().is_none());
        drop(guard);
        assert!(!flight.is_running());
        assert!(flight.try_start().is_some());
    }
}
