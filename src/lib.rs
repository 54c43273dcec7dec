//! tubedrop: turn video links into one-time mp3 downloads
//!
//! [`convert`] drives yt-dlp and reports progress, [`session`] keeps the
//! produced files around until they are fetched exactly once, and [`router`]
//! puts both behind HTTP.

pub mod config;
pub mod convert;
pub mod router;
pub mod session;
pub mod util;
