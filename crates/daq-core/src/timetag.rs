//! Drift-compensating time tags for fixed-rate series.
//!
//! Samples from a fixed-rate sensor arrive with system-clock time tags that
//! carry variable, strictly additive latency (serial buffering, scheduling).
//! [`TimetagAdjuster`] replaces them with an exact arithmetic progression
//! `tt0 + n * dt` and re-anchors `tt0` once per adjustment window using the
//! *minimum* latency seen in that window, which tracks slow drift of the
//! sensor's clock without following latency spikes.
//!
//! ```text
//! Unlocked --first tag--> Locked(tt0 = raw, n = 0)
//! Locked --raw backwards or gap > 1.9 dt--> Locked(tt0 = raw, n = 0)   [epoch reset]
//! Locked --n reaches window--> Locked(tt0 = est + min(raw - est), n = 0)
//! ```
//!
//! All arithmetic is in integer microseconds.

use daq_pool::{SampleId, Timetag, USECS_PER_SEC};
use tracing::{debug, trace};

use crate::error::{AppResult, DaqError};

/// Time-tag screener for one fixed-rate series.
#[derive(Debug, Clone)]
pub struct TimetagAdjuster {
    id: Option<SampleId>,
    dt_usecs: i64,
    gap_usecs: i64,
    npts_calc: u32,
    /// `None` until the first tag arrives.
    tt0: Option<Timetag>,
    tlast: Timetag,
    n_dt: u32,
    tdiff_min: i64,
    resets: u64,
    reanchors: u64,
}

impl TimetagAdjuster {
    /// Adjuster for a series sampled at `rate_hz`, re-anchored every
    /// `adjust_period_secs`.
    pub fn new(rate_hz: f64, adjust_period_secs: f64) -> AppResult<Self> {
        if !rate_hz.is_finite() || rate_hz <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "nominal rate must be positive, got {rate_hz}"
            )));
        }
        if !adjust_period_secs.is_finite() || adjust_period_secs <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "adjustment period must be positive, got {adjust_period_secs}"
            )));
        }
        let dt_usecs = ((USECS_PER_SEC as f64) / rate_hz).round() as i64;
        if dt_usecs < 1 {
            return Err(DaqError::Configuration(format!(
                "nominal rate {rate_hz} Hz is above 1 MHz"
            )));
        }
        let npts_calc = (adjust_period_secs * rate_hz).round().clamp(1.0, u32::MAX as f64) as u32;

        Ok(Self::with_window(dt_usecs, npts_calc))
    }

    /// Adjuster with an explicit `dt` and window length in samples.
    #[must_use]
    pub fn with_window(dt_usecs: i64, npts_calc: u32) -> Self {
        let dt_usecs = dt_usecs.max(1);
        Self {
            id: None,
            dt_usecs,
            gap_usecs: (dt_usecs * 19 + 5) / 10,
            npts_calc: npts_calc.max(1),
            tt0: None,
            tlast: Timetag::MIN,
            n_dt: 0,
            tdiff_min: i64::MAX,
            resets: 0,
            reanchors: 0,
        }
    }

    /// Tag log records with the series' sample id.
    #[must_use]
    pub fn for_sample(mut self, id: SampleId) -> Self {
        self.id = Some(id);
        self
    }

    /// Map a raw acquisition time tag onto the adjusted series.
    pub fn screen(&mut self, raw: Timetag) -> Timetag {
        let Some(tt0) = self.tt0 else {
            self.start_epoch(raw);
            return raw;
        };

        let step = raw - self.tlast;
        self.tlast = raw;
        if step < 0 || step > self.gap_usecs {
            self.resets += 1;
            debug!(
                id = ?self.id,
                step_usecs = step,
                gap_usecs = self.gap_usecs,
                "Time-tag epoch reset"
            );
            self.start_epoch(raw);
            return raw;
        }

        self.n_dt += 1;
        let estimate = tt0 + i64::from(self.n_dt) * self.dt_usecs;
        self.tdiff_min = self.tdiff_min.min(raw - estimate);

        if self.n_dt >= self.npts_calc {
            let next = estimate + self.tdiff_min;
            trace!(
                id = ?self.id,
                min_latency_usecs = self.tdiff_min,
                "Time-tag re-anchor"
            );
            self.reanchors += 1;
            self.tt0 = Some(next);
            self.n_dt = 0;
            self.tdiff_min = i64::MAX;
        }
        estimate
    }

    fn start_epoch(&mut self, raw: Timetag) {
        self.tt0 = Some(raw);
        self.tlast = raw;
        self.n_dt = 0;
        self.tdiff_min = i64::MAX;
    }

    /// Return to the unlocked state; the next tag starts a new epoch.
    pub fn reset(&mut self) {
        self.tt0 = None;
        self.n_dt = 0;
        self.tdiff_min = i64::MAX;
    }

    /// Whether an epoch is running.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.tt0.is_some()
    }

    /// Nominal sample interval.
    #[must_use]
    pub fn dt_usecs(&self) -> i64 {
        self.dt_usecs
    }

    /// Largest step accepted without an epoch reset.
    #[must_use]
    pub fn gap_usecs(&self) -> i64 {
        self.gap_usecs
    }

    /// Epoch resets caused by backwards time or gaps.
    #[must_use]
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Completed adjustment windows.
    #[must_use]
    pub fn reanchors(&self) -> u64 {
        self.reanchors
    }
}
