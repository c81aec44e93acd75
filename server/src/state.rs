use std::sync::Arc;

use crate::chat::store::{SqliteTranscriptStore, TranscriptStore};
use crate::config::RealtimeConfig;
use crate::db::DbPool;
use crate::ws::Relay;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// Chat transcripts; a trait object so tests can swap in a failing store
    pub transcripts: Arc<dyn TranscriptStore>,
    /// Live connections and room membership
    pub relay: Arc<Relay>,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// Heartbeat timing and chat limits
    pub realtime: RealtimeConfig,
}

impl AppState {
    pub fn new(db: DbPool, jwt_secret: Vec<u8>, realtime: RealtimeConfig) -> Self {
        let transcripts = Arc::new(SqliteTranscriptStore::new(db.clone()));
        Self {
            db,
            transcripts,
            relay: Arc::new(Relay::new()),
            jwt_secret,
            realtime,
        }
    }

    pub fn with_transcripts(mut self, transcripts: Arc<dyn TranscriptStore>) -> Self {
        self.transcripts = transcripts;
        self
    }
}
