#![forbid(unsafe_code)]

//! Twitch chat over IRC-on-websocket.

mod emotes;
mod engine;
pub mod media;
pub mod parser;
mod queue;
pub mod rate_limit;


pub use emotes::{EmoteSettings, extract_emotes, twitch_emote_url};
pub use engine::{ChatEngine, ChatEvent, ChatSettings, DEFAULT_IRC_WS_URL};
pub use media::{MediaDataProvider, NoMediaData, StaticMediaData};
pub use queue::{OutboundMessage, OutboundSink, SendQueue, run_worker};
