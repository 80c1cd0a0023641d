//! Property harnesses for rskt's lock-free and shared-memory pieces.
//!
//! Each model drives the real code alongside a plain reference and checks
//! the two agree, without mapping any windows.

pub mod handshake_model;
pub mod ring_model;
pub mod table_model;
