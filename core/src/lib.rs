//! termcast core: PTY sessions, output fan-out, session manager, event
//! broadcaster, wire formats, auth, and persistence. No HTTP lives here —
//! that is `termcast-server`'s job.

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod fanout;
pub mod persist;
pub mod pty;
pub mod screen;
pub mod session;
pub mod wire;
