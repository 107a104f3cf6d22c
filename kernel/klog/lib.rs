//! Kernel logging (`klog`) for the SoC media drivers.
//!
//! Every driver crate in the workspace logs through these macros instead of
//! printing directly. Where the bytes end up is the platform's business: it
//! registers a [`Sink`] with [`set_sink`] (UART console, ring buffer, test
//! capture). Until a sink is registered all output is discarded.
//!
//! | Macro | Filter | Stripped in release | Use |
//! |-------|--------|---------------------|-----|
//! | [`klog!`] | per level | `Debug`, `Trace` | operational logging |
//! | [`klog_always!`] | off in `Quiet` | no | init banners, pool sizes |
//! | [`kprintln!`] | off in `Quiet` | yes | ad-hoc debugging |
//! | [`klog_force!`] | none | no | dumps before a domain or device is declared dead |
//!
//! Filtering happens at run time through [`KlogProfile`]:
//! `Quiet` emits nothing, `Balanced` keeps `Warn` and `Error`, `Verbose`
//! keeps everything. Checking a level costs one relaxed atomic load.

#![no_std]

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use spin::RwLock;

// ============================================================================
// Levels
// ============================================================================

/// Message severity, least severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Per-operation tracing (stripped in release).
    Trace = 0,
    /// State transitions worth following while debugging (stripped in release).
    Debug = 1,
    Info = 2,
    /// Degraded but recoverable.
    Warn = 3,
    /// An operation failed.
    Error = 4,
}

impl Level {
    /// Short tag a sink can prefix lines with.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Trace => "T",
            Self::Debug => "D",
            Self::Info => "I",
            Self::Warn => "W",
            Self::Error => "E",
        }
    }
}

// ============================================================================
// Filter
// ============================================================================

/// `MIN_LEVEL` value that lets nothing through.
const SILENT: u8 = u8::MAX;

static MIN_LEVEL: AtomicU8 = AtomicU8::new(SILENT);
static BANNERS: AtomicBool = AtomicBool::new(false);

/// Output profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlogProfile {
    Quiet,
    /// Warnings and errors.
    Balanced,
    Verbose,
}

/// Switch the filter to `profile`. May be called again at any time.
pub fn set_profile(profile: KlogProfile) {
    let (min, banners) = match profile {
        KlogProfile::Quiet => (SILENT, false),
        KlogProfile::Balanced => (Level::Warn as u8, true),
        KlogProfile::Verbose => (Level::Trace as u8, true),
    };
    MIN_LEVEL.store(min, Ordering::Release);
    BANNERS.store(banners, Ordering::Release);
}

/// Same as `set_profile(KlogProfile::Quiet)`. [`klog_force!`] still prints.
pub fn disable() {
    set_profile(KlogProfile::Quiet);
}

/// Whether a [`klog!`] at `level` would reach the sink.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= MIN_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
#[inline(always)]
pub fn _banners_enabled() -> bool {
    BANNERS.load(Ordering::Relaxed)
}

// ============================================================================
// Sink
// ============================================================================

/// Receives one formatted message per call, without a trailing newline.
pub type Sink = fn(Level, fmt::Arguments<'_>);

static SINK: RwLock<Option<Sink>> = RwLock::new(None);

/// Route output to `sink`, replacing the previous one.
pub fn set_sink(sink: Sink) {
    *SINK.write() = Some(sink);
}

/// Drop the sink; output is discarded from now on.
pub fn clear_sink() {
    *SINK.write() = None;
}

#[doc(hidden)]
pub fn _emit(level: Level, args: fmt::Arguments<'_>) {
    let sink = *SINK.read();
    if let Some(sink) = sink {
        sink(level, args);
    }
}

// ============================================================================
// Macros
// ============================================================================

#[doc(hidden)]
#[macro_export]
macro_rules! __klog_at {
    ($lvl:ident, $($arg:tt)+) => {
        if $crate::enabled($crate::Level::$lvl) {
            $crate::_emit($crate::Level::$lvl, format_args!($($arg)+));
        }
    };
}

/// Level-filtered logging.
///
/// ```ignore
/// klog!(Error, "[SYSMMU] {}: block request timed out", name);
/// klog!(Trace, "[MPP] task {} running", id);
/// ```
#[macro_export]
macro_rules! klog {
    (Trace, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::__klog_at!(Trace, $($arg)+);
    }};
    (Debug, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::__klog_at!(Debug, $($arg)+);
    }};
    ($lvl:ident, $($arg:tt)+) => {{
        $crate::__klog_at!($lvl, $($arg)+);
    }};
}

/// Output that only the `Quiet` profile suppresses.
#[macro_export]
macro_rules! klog_always {
    ($($arg:tt)+) => {{
        if $crate::_banners_enabled() {
            $crate::_emit($crate::Level::Info, format_args!($($arg)+));
        }
    }};
}

/// Output no profile can suppress. Only reaches the platform if a sink is set.
#[macro_export]
macro_rules! klog_force {
    ($($arg:tt)+) => {{
        $crate::_emit($crate::Level::Error, format_args!($($arg)+));
    }};
}

/// [`klog_always!`] in debug builds, nothing in release.
#[macro_export]
macro_rules! kprintln {
    ($($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!($($arg)+);
    }};
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    static LINES: AtomicUsize = AtomicUsize::new(0);
    static LAST_LEVEL: AtomicU8 = AtomicU8::new(0);

    fn counting_sink(level: Level, _args: fmt::Arguments<'_>) {
        LAST_LEVEL.store(level as u8, Ordering::SeqCst);
        LINES.fetch_add(1, Ordering::SeqCst);
    }

    fn lines() -> usize {
        LINES.load(Ordering::SeqCst)
    }

    // Filter and sink are process-wide, so the whole walk is one test.
    #[test]
    fn test_profiles_gate_output() {
        set_sink(counting_sink);

        set_profile(KlogProfile::Quiet);
        assert!(!enabled(Level::Error));
        klog!(Error, "dropped");
        klog_always!("dropped");
        assert_eq!(lines(), 0);

        klog_force!("forced {}", 1);
        assert_eq!(lines(), 1);
        assert_eq!(LAST_LEVEL.load(Ordering::SeqCst), Level::Error as u8);

        set_profile(KlogProfile::Balanced);
        assert!(enabled(Level::Warn));
        assert!(!enabled(Level::Info));
        klog!(Warn, "warn");
        klog!(Info, "info");
        assert_eq!(lines(), 2);
        assert_eq!(LAST_LEVEL.load(Ordering::SeqCst), Level::Warn as u8);

        set_profile(KlogProfile::Verbose);
        assert!(enabled(Level::Trace));
        klog_always!("status");
        assert_eq!(lines(), 3);
        assert_eq!(LAST_LEVEL.load(Ordering::SeqCst), Level::Info as u8);

        clear_sink();
        klog_force!("nowhere");
        assert_eq!(lines(), 3);

        disable();
        assert!(!enabled(Level::Error));
        assert!(!_banners_enabled());
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Error > Level::Warn);
        assert!(Level::Trace < Level::Debug);
        assert_eq!(Level::Warn.tag(), "W");
    }
}
