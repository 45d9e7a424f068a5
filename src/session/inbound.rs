//! Applying inbound channel events to the session
//!
//! Every event is decoded and validated before anything is mutated, so a
//! malformed event leaves the transcript and playback untouched.

use std::collections::HashMap;

use super::{SessionController, SessionEvent};
use crate::conversation::{ConversationItem, ItemKind};
use crate::error::ChannelError;
use crate::protocol::{decode_audio, InboundEvent, InboundMessage, OutboundEvent, WireItem};
use crate::tracks::PlaybackFragment;

impl SessionController {
    pub(super) fn handle_inbound(&mut self, message: InboundMessage) {
        let state = self.state();
        if !state.is_connected() {
            tracing::debug!("Discarding {} in state {:?}", message.kind, state);
            return;
        }
        if let Some(event_id) = message.event_id.as_deref() {
            if !self.recent.insert(event_id) {
                tracing::debug!("Duplicate {} ({}) ignored", message.kind, event_id);
                return;
            }
        }

        tracing::debug!("<- {}", message.kind);
        if let Err(e) = self.apply(message.event) {
            tracing::warn!("Skipping {}: {}", message.kind, e);
        }
    }

    fn apply(&mut self, event: InboundEvent) -> Result<(), ChannelError> {
        match event {
            InboundEvent::Error { error } => {
                tracing::warn!("Server error ({}): {}", error.kind, error.message);
                if error.is_fatal() {
                    self.fail(ChannelError::Fatal(error.message));
                } else {
                    self.notice(format!("Server error: {}", error.message));
                }
            }

            InboundEvent::Interrupted { .. } => self.interrupt_playback(),

            InboundEvent::ItemCreated { item, .. } | InboundEvent::ItemUpdated { item } => {
                let item = tracked(&item)?;
                let id = item.id.clone();
                self.shared.transcript.write().upsert(item);
                self.shared.emit(SessionEvent::ItemUpdated(id));
            }

            InboundEvent::OutputItemDone { item } => {
                let item = tracked(&item)?;
                let id = item.id.clone();
                let mut transcript = self.shared.transcript.write();
                transcript.upsert(item);
                transcript.complete(&id);
                drop(transcript);
                self.shared.emit(SessionEvent::ItemUpdated(id));
            }

            InboundEvent::ItemDeleted { item_id } => {
                if self.shared.transcript.write().remove(&item_id).is_some() {
                    self.shared.emit(SessionEvent::ItemRemoved(item_id));
                }
            }

            InboundEvent::AudioDelta {
                item_id,
                track_id,
                delta,
            } => {
                let samples = decode_audio(&delta)?;
                let track_id = track_id.unwrap_or_else(|| item_id.clone());
                self.play_audio(item_id, track_id, samples);
            }

            InboundEvent::AudioDone { item_id, track_id } => {
                let track_id = track_id.unwrap_or(item_id);
                if let Some(playback) = self.playback.as_ref() {
                    if let Err(e) = playback.finish_track(&track_id) {
                        tracing::warn!("Cannot finish track {}: {}", track_id, e);
                    }
                }
            }

            InboundEvent::AudioTranscriptDelta { item_id, delta } | InboundEvent::TextDelta { item_id, delta } => {
                self.shared
                    .transcript
                    .write()
                    .append_text(&item_id, &delta, ItemKind::Assistant);
                self.shared.emit(SessionEvent::ItemUpdated(item_id));
            }

            InboundEvent::InputTranscriptionCompleted { item_id, transcript } => {
                self.shared
                    .transcript
                    .write()
                    .set_text(&item_id, &transcript, ItemKind::UserAudio);
                self.shared.emit(SessionEvent::ItemUpdated(item_id));
            }

            InboundEvent::ResponseDone { response } => {
                let items = response
                    .output
                    .iter()
                    .map(tracked)
                    .collect::<Result<Vec<_>, _>>()?;
                for item in items {
                    let id = item.id.clone();
                    let mut transcript = self.shared.transcript.write();
                    transcript.upsert(item);
                    transcript.complete(&id);
                    drop(transcript);
                    self.shared.emit(SessionEvent::ItemUpdated(id));
                }
            }

            InboundEvent::SessionAck { .. } => tracing::debug!("Session settings acknowledged"),

            InboundEvent::Unknown => {}
        }
        Ok(())
    }

    fn play_audio(&mut self, item_id: String, track_id: String, samples: Vec<i16>) {
        let Some(playback) = self.playback.as_ref() else {
            tracing::debug!("No playback yet, dropping audio for {}", item_id);
            return;
        };

        let bytes = samples.len() * 2;
        match playback.enqueue(PlaybackFragment::new(track_id.clone(), samples)) {
            Ok(true) => {
                self.track_items.record(&track_id, &item_id, |track| playback.has_track(track));
                self.shared.transcript.write().add_audio(&item_id, bytes);
                self.shared.emit(SessionEvent::ItemUpdated(item_id));
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("Cannot enqueue audio for {}: {}", item_id, e),
        }
    }

    /// Cut playback and tell the backend how much was heard
    fn interrupt_playback(&mut self) {
        let Some(playback) = self.playback.as_ref() else {
            return;
        };
        let marker = match playback.interrupt() {
            Ok(Some(marker)) => marker,
            Ok(None) => {
                tracing::debug!("Interruption with nothing playing");
                return;
            }
            Err(e) => {
                tracing::warn!("Interrupt failed: {}", e);
                return;
            }
        };

        tracing::info!(
            "Interrupted track {} at sample {}",
            marker.track_id,
            marker.sample_offset
        );
        if let Some(link) = self.link.as_ref() {
            if let Err(e) = link.send(OutboundEvent::ResponseCancel {
                track_id: marker.track_id.clone(),
                sample_offset: marker.sample_offset,
            }) {
                tracing::warn!("Failed to send response.cancel: {}", e);
            }
        }

        if let Some(item_id) = self.track_items.item_for(&marker.track_id).map(str::to_string) {
            let heard = marker.sample_offset as usize * 2;
            if self.shared.transcript.write().truncate_audio(&item_id, heard) {
                self.shared.emit(SessionEvent::ItemUpdated(item_id));
            }
        }
    }
}

/// Item owning each playback track
///
/// Entries follow the playback timelines: once playback evicts a track its
/// entry goes too, so the map stays as small as the retained tracks.
#[derive(Debug, Default)]
pub(super) struct TrackItems {
    items: HashMap<String, String>,
}

impl TrackItems {
    pub(super) fn record(&mut self, track_id: &str, item_id: &str, known: impl Fn(&str) -> bool) {
        if self.items.contains_key(track_id) {
            return;
        }
        self.items.retain(|track, _| known(track));
        self.items.insert(track_id.to_string(), item_id.to_string());
    }

    pub(super) fn item_for(&self, track_id: &str) -> Option<&str> {
        self.items.get(track_id).map(String::as_str)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.items.len()
    }

    pub(super) fn clear(&mut self) {
        self.items.clear();
    }
}

fn tracked(item: &WireItem) -> Result<ConversationItem, ChannelError> {
    ConversationItem::from_wire(item).ok_or_else(|| ChannelError::Protocol("item without id".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracks::TrackManager;

    #[test]
    fn test_track_items_follow_playback_eviction() {
        let mut tracks = TrackManager::new(usize::MAX, 2);
        let mut items = TrackItems::default();

        for n in 0..20 {
            let track = format!("track-{}", n);
            tracks.enqueue(PlaybackFragment::new(track.clone(), vec![1; 4]));
            items.record(&track, &format!("item-{}", n), |id| tracks.has_track(id));
            tracks.render(&mut [0i16; 4]);
            tracks.finish_track(&track);
        }

        assert!(items.len() <= 4, "{} entries kept", items.len());
        assert_eq!(items.item_for("track-19"), Some("item-19"));
        assert_eq!(items.item_for("track-0"), None);
    }

    #[test]
    fn test_track_items_keep_first_owner() {
        let mut items = TrackItems::default();
        items.record("t1", "item-a", |_| true);
        items.record("t1", "item-b", |_| true);
        assert_eq!(items.item_for("t1"), Some("item-a"));
        items.clear();
        assert_eq!(items.len(), 0);
    }
}
