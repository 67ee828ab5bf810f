//! # dossier-marshall: the evidence manager
//!
//! Hands out evidence bytes with recorded custody. Checkouts are permitted
//! only while the requesting section is EXECUTING; anything else is denied
//! with `5-2-52`. Every checkout and return appends a custody entry through
//! the locker, so the chain shows exactly who held what and when.

mod marshall;

pub use marshall::{Marshall, MarshallError};
