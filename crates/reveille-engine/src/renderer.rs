//! Fire-time renderer.
//!
//! Runs when a trigger fires, possibly in a freshly started process where
//! nothing else has been initialized. It depends only on the codec and the
//! notification surface, and always shows something.

use std::sync::Arc;

use tracing::{info, warn};

use reveille_store::{NotificationId, NotificationRequest};

use crate::codec;
use crate::config::RenderDefaults;
use crate::platform::{NotificationSurface, RenderedNotification};

/// Longest title shown, in characters.
pub const MAX_TITLE_CHARS: usize = 64;

/// Longest body shown, in characters.
pub const MAX_BODY_CHARS: usize = 1024;

/// Result of handling one fired trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// What was rendered.
    pub notification: RenderedNotification,
    /// The decoded request, or `None` if the payload was unusable.
    pub source: Option<NotificationRequest>,
}

/// Turns fired payloads into visible notifications.
pub struct FireTimeRenderer {
    surface: Arc<dyn NotificationSurface>,
    defaults: RenderDefaults,
}

impl FireTimeRenderer {
    pub fn new(surface: Arc<dyn NotificationSurface>, defaults: RenderDefaults) -> Self {
        Self { surface, defaults }
    }

    /// Decode `raw` and render it.
    ///
    /// Undecodable payloads render the default text under
    /// [`NotificationId::UNDECODABLE`]. Decoded ones render under their own
    /// id, so repeated fires of a recurring trigger replace one slot.
    pub fn on_trigger(&self, raw: &[u8]) -> Delivery {
        let delivery = match codec::decode(raw) {
            Ok(request) => Delivery {
                notification: RenderedNotification {
                    id: request.id,
                    title: clamp(&request.title, MAX_TITLE_CHARS, &self.defaults.title),
                    body: clamp(&request.body, MAX_BODY_CHARS, &self.defaults.body),
                },
                source: Some(request),
            },
            Err(e) => {
                warn!(error = %e, len = raw.len(), "undecodable trigger payload, rendering default");
                Delivery {
                    notification: RenderedNotification {
                        id: NotificationId::UNDECODABLE,
                        title: clamp(&self.defaults.title, MAX_TITLE_CHARS, "Reminder"),
                        body: clamp(&self.defaults.body, MAX_BODY_CHARS, "Reminder"),
                    },
                    source: None,
                }
            }
        };

        self.surface.render(&delivery.notification);
        info!(id = %delivery.notification.id, "notification rendered");
        delivery
    }
}

/// Fit `text` into `max` characters, substituting `default` for blank text.
fn clamp(text: &str, max: usize, default: &str) -> String {
    let text = if text.trim().is_empty() { default } else { text };
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
