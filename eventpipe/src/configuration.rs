//! The configuration singleton (§4.2): binds providers to sessions and
//! owns the enable-mask computation every event's hot write path reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use eventpipe_wire::{Level, CATCH_ALL_PROVIDER_NAME, KEYWORDS_ALL};

use crate::event_instance::EventInstance;
use crate::ids::ActivityId;
use crate::metadata::utf16_nul;
use crate::provider::{Event, Provider, ProviderCallback, ProviderCallbackData};

#[derive(Clone)]
pub struct SessionProvider {
    pub provider_name: String,
    pub keywords: u64,
    pub level: Level,
    pub filter_data: Option<String>,
}

impl SessionProvider {
    pub fn new(provider_name: impl Into<String>, keywords: u64, level: Level) -> Self {
        SessionProvider {
            provider_name: provider_name.into(),
            keywords,
            level,
            filter_data: None,
        }
    }

    pub fn catch_all() -> Self {
        SessionProvider {
            provider_name: CATCH_ALL_PROVIDER_NAME.to_string(),
            keywords: KEYWORDS_ALL,
            level: Level::Verbose,
            filter_data: None,
        }
    }

    fn matches(&self, provider_name: &str) -> bool {
        self.provider_name == CATCH_ALL_PROVIDER_NAME || self.provider_name == provider_name
    }
}

struct Inner {
    providers: Vec<Arc<Provider>>,
    session_providers: HashMap<u8, Vec<SessionProvider>>,
}

pub struct Configuration {
    inner: Mutex<Inner>,
    pub config_provider: Arc<Provider>,
    pub metadata_event: Arc<Event>,
    next_metadata_event_id: AtomicU64,
}

impl Configuration {
    pub fn new() -> Arc<Configuration> {
        let config_provider = Provider::new("EventPipeConfiguration", None);
        let metadata_event = Arc::new(Event {
            provider_name: Arc::from("EventPipeConfiguration"),
            event_id: 0,
            version: 0,
            keywords: 0,
            level: Level::LogAlways,
            need_stack: false,
            metadata: Vec::new(),
            enabled_mask: AtomicU64::new(0),
        });
        Arc::new(Configuration {
            inner: Mutex::new(Inner {
                providers: Vec::new(),
                session_providers: HashMap::new(),
            }),
            config_provider,
            metadata_event,
            next_metadata_event_id: AtomicU64::new(0),
        })
    }

    pub fn create_provider(
        &self,
        name: impl Into<String>,
        callback: Option<ProviderCallback>,
    ) -> (Arc<Provider>, Vec<ProviderCallbackData>) {
        let provider = Provider::new(name, callback);
        let mut inner = self.inner.lock().unwrap();
        inner.providers.push(provider.clone());
        let cb = recompute_and_notify(&mut inner, &provider, None);
        (provider, cb.into_iter().collect())
    }

    pub fn delete_provider(&self, provider: &Arc<Provider>) {
        let mut inner = self.inner.lock().unwrap();
        if provider.is_enabled_for_any_session() {
            provider.delete_deferred.store(true, Ordering::Relaxed);
            return;
        }
        inner.providers.retain(|p| !Arc::ptr_eq(p, provider));
    }

    pub fn delete_deferred_providers(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .providers
            .retain(|p| !(p.delete_deferred.load(Ordering::Relaxed) && !p.is_enabled_for_any_session()));
    }

    pub fn enable(&self, session_index: u8, providers: Vec<SessionProvider>) -> Vec<ProviderCallbackData> {
        let mut inner = self.inner.lock().unwrap();
        inner.session_providers.insert(session_index, providers);
        let provider_list = inner.providers.clone();
        let mut callbacks = Vec::with_capacity(provider_list.len());
        for provider in &provider_list {
            if let Some(cb) = recompute_and_notify(&mut inner, provider, Some((session_index, true))) {
                callbacks.push(cb);
            }
        }
        callbacks
    }

    pub fn disable(&self, session_index: u8) -> Vec<ProviderCallbackData> {
        let mut inner = self.inner.lock().unwrap();
        inner.session_providers.remove(&session_index);
        let provider_list = inner.providers.clone();
        let mut callbacks = Vec::with_capacity(provider_list.len());
        for provider in &provider_list {
            if let Some(cb) = recompute_and_notify(&mut inner, provider, Some((session_index, false))) {
                callbacks.push(cb);
            }
        }
        callbacks
    }

    /// Allocates a fresh metadata_id. Sessions keep their own dedup table
    /// (provider_name, event_id, version) -> metadata_id; this just hands
    /// out unique small integers.
    pub fn next_metadata_id(&self) -> u32 {
        (self.next_metadata_event_id.fetch_add(1, Ordering::Relaxed) + 1) as u32
    }

    pub fn build_event_metadata_event(&self, source: &EventInstance, metadata_id: u32) -> EventInstance {
        let mut payload = Vec::new();
        payload.extend_from_slice(&metadata_id.to_le_bytes());
        payload.extend_from_slice(&utf16_nul(&source.event.provider_name));
        payload.extend_from_slice(&source.event.metadata);
        EventInstance::new(
            self.metadata_event.clone(),
            ActivityId::NIL,
            ActivityId::NIL,
            source.thread_id,
            source.timestamp,
            source.proc_num,
            payload,
            Vec::new(),
        )
    }
}

/// Recomputes a provider's aggregate (keywords, level, enabled-session
/// mask) across all currently-subscribed sessions, updates every one of
/// its events' per-session enable bits, and returns the callback record
/// for whichever session triggered the recompute (`None` when called
/// from `create_provider`, which reports the provider's own fresh state
/// for every session already subscribed to it).
fn recompute_and_notify(
    inner: &mut Inner,
    provider: &Arc<Provider>,
    changed: Option<(u8, bool)>,
) -> Option<ProviderCallbackData> {
    let mut keywords = 0u64;
    let mut level = Level::LogAlways;
    let mut mask = 0u64;
    for idx in 0u8..64 {
        if let Some(list) = inner.session_providers.get(&idx) {
            if let Some(sp) = list.iter().find(|sp| sp.matches(&provider.name)) {
                keywords |= sp.keywords;
                if (sp.level as u32) > (level as u32) {
                    level = sp.level;
                }
                mask |= 1u64 << idx;
            }
        }
    }
    provider.keywords.store(keywords, Ordering::Relaxed);
    provider.level.store(level as u8, Ordering::Relaxed);
    provider.enabled_sessions_mask.store(mask, Ordering::Relaxed);

    for event in provider.events.lock().unwrap().iter() {
        for idx in 0u8..64 {
            let enabled = match inner.session_providers.get(&idx) {
                Some(list) => match list.iter().find(|sp| sp.matches(&provider.name)) {
                    Some(sp) => {
                        (event.keywords & sp.keywords != 0 || event.keywords == 0)
                            && (event.level == Level::LogAlways || (sp.level as u32) >= (event.level as u32))
                    }
                    None => false,
                },
                None => false,
            };
            event.set_session_bit(idx, enabled);
        }
    }

    match changed {
        Some((session_index, enabled)) => Some(ProviderCallbackData {
            keywords,
            level,
            enabled,
            session_index,
        }),
        None => {
            // create_provider: report state for each session already
            // subscribed to this (possibly brand new) provider.
            (0u8..64).find(|idx| mask & (1u64 << idx) != 0).map(|idx| ProviderCallbackData {
                keywords,
                level,
                enabled: true,
                session_index: idx,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventpipe_wire::Level;

    #[test]
    fn enable_computes_union_across_sessions() {
        let config = Configuration::new();
        let (provider, _) = config.create_provider("P", None);
        let event = provider.add_event(1, 0x1, 1, Level::Informational, false, None);

        config.enable(0, vec![SessionProvider::new("P", 0x1, Level::Verbose)]);
        assert!(event.is_enabled_for_session(0));

        config.enable(1, vec![SessionProvider::new("P", 0x2, Level::Verbose)]);
        assert!(!event.is_enabled_for_session(1));
        assert_eq!(provider.keywords(), 0x3);
    }

    #[test]
    fn disable_clears_only_that_session() {
        let config = Configuration::new();
        let (provider, _) = config.create_provider("P", None);
        let event = provider.add_event(1, 0x1, 1, Level::Informational, false, None);
        config.enable(0, vec![SessionProvider::catch_all()]);
        config.enable(1, vec![SessionProvider::catch_all()]);
        config.disable(0);
        assert!(!event.is_enabled_for_session(0));
        assert!(event.is_enabled_for_session(1));
    }

    #[test]
    fn catch_all_enables_every_provider() {
        let config = Configuration::new();
        let (provider, _) = config.create_provider("Anything", None);
        let event = provider.add_event(7, 0, 1, Level::Verbose, false, None);
        config.enable(0, vec![SessionProvider::catch_all()]);
        assert!(event.is_enabled_for_session(0));
    }
}
