//! Trailing-silence detection
//!
//! Treats sustained silence near the end of a track as the end of the track,
//! so silent outros and padding don't leave dead air before the next one.

use serde::{ Deserialize, Serialize };


/// Tuning for the silence detector.
///
/// The defaults were tuned by ear and are not derived from anything.
#[derive( Debug, Clone, Copy, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct SilenceParams {
    /// Only evaluate within this many seconds of the end
    pub tail_window_secs: f64,
    /// Sampling period
    pub check_interval_secs: f64,
    /// Linear amplitude below which a sample counts as silent
    pub silent_amplitude_threshold: f32,
    /// How long silence must persist before the track is ended
    pub required_consecutive_secs: f64,
}


impl Default for SilenceParams {
    fn default() -> Self {
        Self {
            tail_window_secs: 20.0,
            check_interval_secs: 0.05,
            silent_amplitude_threshold: 0.01,
            required_consecutive_secs: 3.0,
        }
    }
}


/// Shortest supported sampling period.
pub const MIN_CHECK_INTERVAL_SECS: f64 = 0.01;

/// Longest supported sampling period.
pub const MAX_CHECK_INTERVAL_SECS: f64 = 1.0;


impl SilenceParams {
    /// Returns params safe to drive a timer with.
    ///
    /// The interval is clamped to [`MIN_CHECK_INTERVAL_SECS`, `MAX_CHECK_INTERVAL_SECS`];
    /// non-finite or negative fields fall back to their defaults.
    pub fn sanitized( self ) -> Self {
        let defaults = Self::default();
        let non_negative = |value: f64, fallback: f64| if value.is_finite() && value >= 0.0 { value } else { fallback };

        let check_interval_secs = if self.check_interval_secs.is_finite() && self.check_interval_secs > 0.0 {
            self.check_interval_secs.clamp( MIN_CHECK_INTERVAL_SECS, MAX_CHECK_INTERVAL_SECS )
        } else {
            defaults.check_interval_secs
        };
        let silent_amplitude_threshold = if self.silent_amplitude_threshold.is_finite() && self.silent_amplitude_threshold >= 0.0 {
            self.silent_amplitude_threshold
        } else {
            defaults.silent_amplitude_threshold
        };

        let sanitized = Self {
            tail_window_secs: non_negative( self.tail_window_secs, defaults.tail_window_secs ),
            check_interval_secs,
            silent_amplitude_threshold,
            required_consecutive_secs: non_negative( self.required_consecutive_secs, defaults.required_consecutive_secs ),
        };
        if sanitized != self {
            tracing::warn!( "Adjusted silence settings {:?} to {:?}", self, sanitized );
        }
        sanitized
    }
}


/// Converts average power in dBFS to linear amplitude.
pub fn db_to_amplitude( db: f32 ) -> f32 {
    10.0_f32.powf( db / 20.0 )
}


/// Amplitude-based early-end detector.
#[derive( Debug, Clone )]
pub struct SilenceDetector {
    params: SilenceParams,
    armed: bool,
    silent_ticks: u32,
}


impl SilenceDetector {
    pub fn new( params: SilenceParams ) -> Self {
        Self { params: params.sanitized(), armed: false, silent_ticks: 0 }
    }


    pub fn params( &self ) -> &SilenceParams {
        &self.params
    }


    /// Starts evaluating samples.
    pub fn arm( &mut self ) {
        self.armed = true;
        self.silent_ticks = 0;
    }


    /// Stops evaluating samples.
    pub fn disarm( &mut self ) {
        self.armed = false;
        self.silent_ticks = 0;
    }


    pub fn is_armed( &self ) -> bool {
        self.armed
    }


    /// Seconds of consecutive silence seen so far.
    pub fn silent_for( &self ) -> f64 {
        self.silent_ticks as f64 * self.params.check_interval_secs
    }


    /// Feeds one timer tick.
    ///
    /// @param time_remaining - Seconds left until the end of the track
    /// @param average_power_db - Instantaneous average power of the transport
    ///
    /// @returns true once when the track should be treated as ended; the
    /// detector disarms itself until armed again
    pub fn observe( &mut self, time_remaining: f64, average_power_db: f32 ) -> bool {
        if !self.armed {
            return false;
        }

        if time_remaining > self.params.tail_window_secs {
            self.silent_ticks = 0;
            return false;
        }

        let amplitude = db_to_amplitude( average_power_db );
        if amplitude >= self.params.silent_amplitude_threshold {
            self.silent_ticks = 0;
            return false;
        }

        self.silent_ticks += 1;
        // Tolerate float drift from summing the interval
        if self.silent_for() + 1e-9 >= self.params.required_consecutive_secs {
            tracing::info!( "Silence detected for {:.2}s with {:.2}s remaining", self.silent_for(), time_remaining );
            self.disarm();
            return true;
        }

        false
    }
}


#[cfg( test )]
mod tests {
    use super::*;

    const LOUD_DB: f32 = -12.0;
    const SILENT_DB: f32 = -80.0;


    fn params() -> SilenceParams {
        SilenceParams {
            tail_window_secs: 20.0,
            check_interval_secs: 0.05,
            silent_amplitude_threshold: 0.01,
            required_consecutive_secs: 3.0,
        }
    }


    /// Plays a 200s track through the detector; `silent(t)` says whether the sample at `t` is silent.
    fn run_track( silent: impl Fn( f64 ) -> bool ) -> usize {
        let mut detector = SilenceDetector::new( params() );
        detector.arm();
        let total = 200.0;
        let mut fired = 0;
        let mut tick = 0u32;
        loop {
            let position = tick as f64 * 0.05;
            if position >= total {
                break;
            }
            let db = if silent( position ) { SILENT_DB } else { LOUD_DB };
            if detector.observe( total - position, db ) {
                fired += 1;
            }
            tick += 1;
        }
        fired
    }


    #[test]
    fn test_sanitized_clamps_interval() {
        let tiny = SilenceParams { check_interval_secs: 0.001, ..params() }.sanitized();
        assert_eq!( tiny.check_interval_secs, MIN_CHECK_INTERVAL_SECS );

        let huge = SilenceParams { check_interval_secs: 1e300, ..params() }.sanitized();
        assert_eq!( huge.check_interval_secs, MAX_CHECK_INTERVAL_SECS );

        let broken = SilenceParams {
            tail_window_secs: f64::NAN,
            check_interval_secs: -1.0,
            silent_amplitude_threshold: f32::INFINITY,
            required_consecutive_secs: -3.0,
        }.sanitized();
        assert_eq!( broken, SilenceParams::default() );
        assert_eq!( params().sanitized(), params() );
    }


    #[test]
    fn test_zero_interval_still_fires() {
        let mut detector = SilenceDetector::new( SilenceParams { check_interval_secs: 0.0, ..params() } );
        detector.arm();
        // Falls back to 0.05s ticks, so 3s takes 60 ticks
        let fired = ( 0..60 ).filter( |_| detector.observe( 10.0, SILENT_DB ) ).count();
        assert_eq!( fired, 1 );
    }


    #[test]
    fn test_silence_in_tail_window_fires_once() {
        // Silent from 185s to the end: 15s remaining, well over 3s of silence
        assert_eq!( run_track( |t| t >= 185.0 ), 1 );
    }


    #[test]
    fn test_silence_outside_tail_window_never_fires() {
        // Silent between 25s and 20s remaining, loud afterwards
        assert_eq!( run_track( |t| ( 175.0..180.0 ).contains( &t ) ), 0 );
    }


    #[test]
    fn test_short_silence_does_not_fire() {
        assert_eq!( run_track( |t| ( 190.0..192.0 ).contains( &t ) ), 0 );
    }


    #[test]
    fn test_interrupted_silence_resets_counter() {
        // Two 2s stretches separated by a loud sample
        assert_eq!( run_track( |t| ( 185.0..187.0 ).contains( &t ) || ( 187.05..189.05 ).contains( &t ) ), 0 );
    }


    #[test]
    fn test_fires_after_required_duration() {
        let mut detector = SilenceDetector::new( params() );
        detector.arm();
        for _ in 0..59 {
            assert!( !detector.observe( 10.0, SILENT_DB ) );
        }
        assert!( detector.observe( 10.0, SILENT_DB ) );
        assert!( !detector.is_armed() );
    }


    #[test]
    fn test_leaving_tail_window_resets_counter() {
        let mut detector = SilenceDetector::new( params() );
        detector.arm();
        for _ in 0..40 {
            detector.observe( 10.0, SILENT_DB );
        }
        // Seek back out of the window
        detector.observe( 60.0, SILENT_DB );
        assert_eq!( detector.silent_for(), 0.0 );
    }


    #[test]
    fn test_disarmed_detector_ignores_samples() {
        let mut detector = SilenceDetector::new( params() );
        for _ in 0..200 {
            assert!( !detector.observe( 1.0, SILENT_DB ) );
        }
    }


    #[test]
    fn test_db_to_amplitude() {
        assert!( ( db_to_amplitude( 0.0 ) - 1.0 ).abs() < 1e-6 );
        assert!( ( db_to_amplitude( -40.0 ) - 0.01 ).abs() < 1e-6 );
    }
}
