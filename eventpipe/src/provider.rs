//! Providers and events (§3 Data model, §4.3). A Provider is a named
//! namespace of Events; each Event carries an atomically-updated
//! per-session enable mask so the hot write path is a single relaxed
//! load.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use eventpipe_wire::Level;

use crate::metadata;

/// Fired synchronously (outside any lock) whenever a provider's effective
/// keywords/level change because a session enabled or disabled it.
pub struct ProviderCallbackData {
    pub keywords: u64,
    pub level: Level,
    pub enabled: bool,
    pub session_index: u8,
}

pub type ProviderCallback = Box<dyn Fn(&ProviderCallbackData) + Send + Sync>;

pub struct Provider {
    pub name: String,
    pub name_utf16: Vec<u16>,
    pub keywords: AtomicU64,
    pub level: AtomicU8,
    pub enabled_sessions_mask: AtomicU64,
    pub events: Mutex<Vec<Arc<Event>>>,
    pub callback: Option<ProviderCallback>,
    pub delete_deferred: AtomicBool,
}

impl Provider {
    pub fn new(name: impl Into<String>, callback: Option<ProviderCallback>) -> Arc<Provider> {
        let name = name.into();
        let name_utf16: Vec<u16> = name.encode_utf16().collect();
        Arc::new(Provider {
            name,
            name_utf16,
            keywords: AtomicU64::new(0),
            level: AtomicU8::new(Level::LogAlways as u8),
            enabled_sessions_mask: AtomicU64::new(0),
            events: Mutex::new(Vec::new()),
            callback,
            delete_deferred: AtomicBool::new(false),
        })
    }

    pub fn keywords(&self) -> u64 {
        self.keywords.load(Ordering::Relaxed)
    }

    pub fn level(&self) -> Level {
        level_from_u8(self.level.load(Ordering::Relaxed))
    }

    pub fn is_enabled_for_any_session(&self) -> bool {
        self.enabled_sessions_mask.load(Ordering::Relaxed) != 0
    }

    /// Adds a new event under the caller's own provider-list lock. The
    /// caller (Configuration) is responsible for recomputing the event's
    /// enable mask afterwards against the currently subscribed sessions.
    pub fn add_event(
        self: &Arc<Self>,
        event_id: u32,
        keywords: u64,
        version: u32,
        level: Level,
        need_stack: bool,
        metadata: Option<Vec<u8>>,
    ) -> Arc<Event> {
        let metadata = metadata.unwrap_or_else(|| {
            metadata::auto_generate(event_id, &self.name, keywords as i64, version, level as u32)
        });
        let event = Arc::new(Event {
            provider_name: Arc::from(self.name.as_str()),
            event_id,
            version,
            keywords,
            level,
            need_stack,
            metadata,
            enabled_mask: AtomicU64::new(0),
        });
        self.events.lock().unwrap().push(event.clone());
        event
    }
}

fn level_from_u8(v: u8) -> Level {
    match v {
        0 => Level::LogAlways,
        1 => Level::Critical,
        2 => Level::Error,
        3 => Level::Warning,
        4 => Level::Informational,
        _ => Level::Verbose,
    }
}

/// An immutable event definition owned by exactly one provider for its
/// entire life.
pub struct Event {
    pub provider_name: Arc<str>,
    pub event_id: u32,
    pub version: u32,
    pub keywords: u64,
    pub level: Level,
    pub need_stack: bool,
    pub metadata: Vec<u8>,
    pub enabled_mask: AtomicU64,
}

impl Event {
    #[inline]
    pub fn is_enabled_for_session(&self, session_index: u8) -> bool {
        self.enabled_mask.load(Ordering::Relaxed) & (1u64 << session_index) != 0
    }

    #[inline]
    pub fn enabled_mask(&self) -> u64 {
        self.enabled_mask.load(Ordering::Relaxed)
    }

    pub fn set_session_bit(&self, session_index: u8, enabled: bool) {
        let bit = 1u64 << session_index;
        if enabled {
            self.enabled_mask.fetch_or(bit, Ordering::Relaxed);
        } else {
            self.enabled_mask.fetch_and(!bit, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_starts_disabled() {
        let provider = Provider::new("P", None);
        let event = provider.add_event(1, 0x1, 1, Level::Informational, false, None);
        assert_eq!(event.enabled_mask(), 0);
        assert!(!event.is_enabled_for_session(0));
    }

    #[test]
    fn set_session_bit_is_idempotent() {
        let provider = Provider::new("P", None);
        let event = provider.add_event(1, 0x1, 1, Level::Informational, false, None);
        event.set_session_bit(3, true);
        event.set_session_bit(3, true);
        assert_eq!(event.enabled_mask(), 1 << 3);
        event.set_session_bit(3, false);
        assert_eq!(event.enabled_mask(), 0);
    }
}
