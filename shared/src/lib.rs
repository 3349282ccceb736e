// The pipeline modules live in `expiry_relay`; everything is re-exported at
// the crate root so binaries and tests use `relay_shared::DedupGate` etc.
mod expiry_relay;
pub use expiry_relay::*;
