use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::info;

/// Utilización de workers durante un job, ponderada por tiempo.
#[derive(Debug, Default)]
pub struct UtilizationMonitor {
    started: Option<(Instant, DateTime<Utc>)>,
    last_sample: Option<(Instant, f64)>,
    weighted: f64,
    elapsed: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UtilizationReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub average: f64,
}

impl UtilizationMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, now: Instant) {
        *self = Self {
            started: Some((now, Utc::now())),
            ..Self::default()
        };
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Registra `busy / subscribed` en `now`. El valor anterior vale por
    /// todo el intervalo transcurrido desde la muestra previa.
    pub fn sample(&mut self, now: Instant, busy: usize, subscribed: usize) {
        if self.started.is_none() {
            return;
        }
        let ratio = if subscribed == 0 {
            0.0
        } else {
            busy as f64 / subscribed as f64
        };
        if let Some((at, prev)) = self.last_sample {
            let dt = now.saturating_duration_since(at).as_secs_f64();
            self.weighted += prev * dt;
            self.elapsed += dt;
        }
        self.last_sample = Some((now, ratio));
    }

    /// Promedio hasta ahora. Con una sola muestra, esa muestra.
    pub fn average(&self) -> Option<f64> {
        self.started?;
        if self.elapsed > 0.0 {
            Some(self.weighted / self.elapsed)
        } else {
            self.last_sample.map(|(_, r)| r)
        }
    }

    /// Cierra el job y loguea inicio, fin y utilización promedio.
    pub fn finish(&mut self, now: Instant) -> Option<UtilizationReport> {
        let (_, started_at) = self.started?;
        // cierra el último intervalo abierto
        self.sample(now, 0, 0);
        let report = UtilizationReport {
            started_at,
            finished_at: Utc::now(),
            average: self.average().unwrap_or(0.0),
        };
        info!(
            "job iniciado {} terminado {} utilización promedio {:.1}%",
            report.started_at.to_rfc3339(),
            report.finished_at.to_rfc3339(),
            report.average * 100.0
        );
        *self = Self::default();
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn average_is_time_weighted() {
        let t0 = Instant::now();
        let mut m = UtilizationMonitor::new();
        m.start(t0);
        m.sample(t0, 2, 2); // 100% durante 1s
        m.sample(t0 + Duration::from_secs(1), 0, 2); // 0% durante 3s
        m.sample(t0 + Duration::from_secs(4), 1, 2);

        let avg = m.average().unwrap();
        assert!((avg - 0.25).abs() < 1e-9, "avg={avg}");
    }

    #[test]
    fn samples_are_ignored_without_a_job() {
        let mut m = UtilizationMonitor::new();
        m.sample(Instant::now(), 1, 1);
        assert!(m.average().is_none());
        assert!(m.finish(Instant::now()).is_none());
    }

    #[test]
    fn finish_reports_and_resets() {
        let t0 = Instant::now();
        let mut m = UtilizationMonitor::new();
        m.start(t0);
        m.sample(t0, 1, 2);
        let report = m.finish(t0 + Duration::from_secs(2)).unwrap();
        assert!((report.average - 0.5).abs() < 1e-9);
        assert!(!m.is_running());
    }
}
