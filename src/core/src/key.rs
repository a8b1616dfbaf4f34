use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one conversation thread.
///
/// Thread ids are only unique inside their room, so the room id always
/// travels with the thread id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadKey {
    pub room_id: String,
    pub thread_id: String,
}

impl ThreadKey {
    pub fn new(room_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            thread_id: thread_id.into(),
        }
    }

    /// Parse `room/thread`. The thread part may itself contain `/`.
    pub fn parse(value: &str) -> Option<Self> {
        let (room_id, thread_id) = value.split_once('/')?;
        if room_id.is_empty() || thread_id.is_empty() {
            return None;
        }
        Some(Self::new(room_id, thread_id))
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.room_id, self.thread_id)
    }
}
