// src/subscription/push.rs

//! Push-mode delivery callback.

use std::sync::Arc;

use crate::dispatch::SinkPtr;
use crate::{log_debug, BoxFuture, InboundMessage, MessageCallback};

/// Callback handed to the broker for a push listener.
///
/// The broker awaits it per message; it returns once the message has been
/// decoded and accepted (or settled) by the dispatcher.
pub(crate) fn delivery_callback(name: Arc<str>, sink: SinkPtr) -> MessageCallback {
    // ---
    Arc::new(move |message: InboundMessage| -> BoxFuture<'static, ()> {
        let name = name.clone();
        let sink = sink.clone();

        Box::pin(async move {
            if let Some(id) = message.message_id() {
                log_debug!("listener {name}: push delivery {} msg id {id}", message.subject());
            }
            sink.dispatch(message).await;
        })
    })
}
