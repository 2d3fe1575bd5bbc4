//! Verification diagnostics.
//!
//! The engine never prints or logs; conditions worth surfacing are handed
//! to a caller-supplied sink installed via
//! [`Image::set_diagnostics`](crate::Image::set_diagnostics).

/// Trait for receiving diagnostics raised during verification.
///
/// All methods take `&self` and default to no-ops, so implementors only
/// override what they care about.
pub trait DiagnosticSink: Send + Sync {
    /// The usage map contained `count` bytes that were neither 0 nor 1.
    ///
    /// Such bytes have no documented meaning and are treated as *not
    /// used*; this callback exists so callers can notice them.
    fn anomalous_map_bytes(&self, _count: u64) {}

    /// Tolerant mode only: the 8-byte marker closing the V1 usage map did
    /// not match, and verification continued anyway.
    fn trailer_magic_mismatch(&self) {}
}

/// A sink that discards all diagnostics.
pub struct SilentDiagnostics;

impl DiagnosticSink for SilentDiagnostics {}
