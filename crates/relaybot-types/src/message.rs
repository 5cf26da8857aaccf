//! The canonical message model.
//!
//! Every platform adapter converts its native payloads into a
//! [`MessageChain`] -- an ordered sequence of typed [`MessageComponent`]s --
//! and back. The component set is a closed tagged union with one open
//! [`Unknown`](MessageComponent::Unknown) escape hatch for platform
//! subtypes the core does not interpret.
//!
//! Chains handed to the pipeline are treated as immutable: stages build
//! new chains instead of mutating the one they received.

use serde::{Deserialize, Serialize};

/// A node inside a [`Forward`](MessageComponent::Forward) container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardNode {
    /// Sender id shown for this node.
    pub sender_id: String,
    /// Display name shown for this node.
    pub sender_name: String,
    /// Unix timestamp (seconds) of the node.
    pub time: i64,
    /// The wrapped chain.
    pub message_chain: MessageChain,
}

/// One element of a [`MessageChain`].
///
/// Serialized with a `type` tag so debug consoles and plugins can exchange
/// chains as plain JSON arrays, e.g. `[{"type": "Plain", "text": "hi"}]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageComponent {
    /// Message provenance. When present it is the first element.
    Source {
        /// Platform (or locally allocated) message id.
        id: i64,
        /// Unix timestamp (seconds).
        time: i64,
    },
    /// Plain text.
    Plain {
        text: String,
    },
    /// Mention of a single account.
    At {
        target: String,
    },
    /// Mention of everyone in a group.
    AtAll,
    /// An image, carried as at most one of url / base64 / local path.
    Image {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base64: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// A voice clip.
    Voice {
        url: String,
        /// Clip length in seconds.
        length: u32,
    },
    /// A quoted (replied-to) message. Precedes the content that quotes it.
    Quote {
        /// Id of the quoted message.
        id: i64,
        /// Sender of the quoted message.
        sender_id: String,
        /// Reconstructed chain of the quoted message.
        origin: MessageChain,
    },
    /// A forward-message container.
    Forward {
        node_list: Vec<ForwardNode>,
    },
    /// Platform subtype the core does not interpret (mini-programs, red
    /// envelopes, transfer notices, ...). Preserved through the pipeline.
    Unknown {
        raw: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id_in_prefix: Option<String>,
    },
}

impl MessageComponent {
    /// Shorthand for a `Plain` component.
    pub fn plain(text: impl Into<String>) -> Self {
        Self::Plain { text: text.into() }
    }

    /// Shorthand for an `At` component.
    pub fn at(target: impl Into<String>) -> Self {
        Self::At {
            target: target.into(),
        }
    }

    /// Shorthand for an `Image` carrying a URL.
    pub fn image_url(url: impl Into<String>) -> Self {
        Self::Image {
            url: Some(url.into()),
            base64: None,
            path: None,
        }
    }

    /// Shorthand for an `Image` carrying base64 data.
    pub fn image_base64(data: impl Into<String>) -> Self {
        Self::Image {
            url: None,
            base64: Some(data.into()),
            path: None,
        }
    }
}

/// An ordered sequence of [`MessageComponent`]s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageChain(pub Vec<MessageComponent>);

impl MessageChain {
    /// An empty chain.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// A chain containing a single `Plain` component.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self(vec![MessageComponent::plain(text)])
    }

    /// Concatenated text of all `Plain` components.
    pub fn plain_text(&self) -> String {
        self.0
            .iter()
            .filter_map(|c| match c {
                MessageComponent::Plain { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The `Source` component, if present.
    pub fn source(&self) -> Option<(i64, i64)> {
        self.0.iter().find_map(|c| match c {
            MessageComponent::Source { id, time } => Some((*id, *time)),
            _ => None,
        })
    }

    /// The first `At` target, if any.
    pub fn first_at(&self) -> Option<&str> {
        self.0.iter().find_map(|c| match c {
            MessageComponent::At { target } => Some(target.as_str()),
            _ => None,
        })
    }

    /// Whether the chain mentions everyone.
    pub fn has_at_all(&self) -> bool {
        self.0
            .iter()
            .any(|c| matches!(c, MessageComponent::AtAll))
    }

    /// Whether the chain contains any image component.
    pub fn has_image(&self) -> bool {
        self.0
            .iter()
            .any(|c| matches!(c, MessageComponent::Image { .. }))
    }

    /// A copy of this chain with a `Source` component prepended.
    ///
    /// Any pre-existing `Source` is removed first, keeping the invariant
    /// that `Source` appears once and leads the chain.
    pub fn with_source(&self, id: i64, time: i64) -> Self {
        let mut components = vec![MessageComponent::Source { id, time }];
        components.extend(
            self.0
                .iter()
                .filter(|c| !matches!(c, MessageComponent::Source { .. }))
                .cloned(),
        );
        Self(components)
    }

    /// A copy of this chain without image components.
    pub fn without_images(&self) -> Self {
        Self(
            self.0
                .iter()
                .filter(|c| !matches!(c, MessageComponent::Image { .. }))
                .cloned()
                .collect(),
        )
    }

    /// Append a component.
    pub fn push(&mut self, component: MessageComponent) {
        self.0.push(component);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MessageComponent> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<MessageComponent>> for MessageChain {
    fn from(components: Vec<MessageComponent>) -> Self {
        Self(components)
    }
}

impl IntoIterator for MessageChain {
    type Item = MessageComponent;
    type IntoIter = std::vec::IntoIter<MessageComponent>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a MessageChain {
    type Item = &'a MessageComponent;
    type IntoIter = std::slice::Iter<'a, MessageComponent>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_concatenates() {
        let chain = MessageChain(vec![
            MessageComponent::Source { id: 1, time: 0 },
            MessageComponent::plain("hello "),
            MessageComponent::at("42"),
            MessageComponent::plain("world"),
        ]);
        assert_eq!(chain.plain_text(), "hello world");
    }

    #[test]
    fn with_source_replaces_existing() {
        let chain = MessageChain(vec![
            MessageComponent::Source { id: 1, time: 10 },
            MessageComponent::plain("x"),
        ]);
        let updated = chain.with_source(2, 20);
        assert_eq!(updated.source(), Some((2, 20)));
        assert_eq!(updated.len(), 2);
        assert!(matches!(updated.0[0], MessageComponent::Source { .. }));
    }

    #[test]
    fn without_images_strips_all_image_variants() {
        let chain = MessageChain(vec![
            MessageComponent::plain("describe"),
            MessageComponent::image_base64("aGVsbG8="),
            MessageComponent::image_url("https://example.com/a.png"),
        ]);
        let stripped = chain.without_images();
        assert_eq!(stripped.len(), 1);
        assert_eq!(stripped.plain_text(), "describe");
    }

    #[test]
    fn serde_roundtrip_preserves_components() {
        let chain = MessageChain(vec![
            MessageComponent::Source { id: 7, time: 1000 },
            MessageComponent::at("bot"),
            MessageComponent::AtAll,
            MessageComponent::plain("hi"),
            MessageComponent::image_url("https://example.com/i.png"),
        ]);
        let json = serde_json::to_string(&chain).unwrap();
        let restored: MessageChain = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, chain);
    }

    #[test]
    fn json_shape_is_type_tagged() {
        let json = r#"[{"type": "Plain", "text": "hi"}, {"type": "AtAll"}]"#;
        let chain: MessageChain = serde_json::from_str(json).unwrap();
        assert_eq!(chain.plain_text(), "hi");
        assert!(chain.has_at_all());
    }

    #[test]
    fn quote_carries_origin_chain() {
        let origin = MessageChain::from_text("original");
        let chain = MessageChain(vec![
            MessageComponent::Quote {
                id: 99,
                sender_id: "u1".into(),
                origin: origin.clone(),
            },
            MessageComponent::plain("reply"),
        ]);
        let json = serde_json::to_value(&chain).unwrap();
        let restored: MessageChain = serde_json::from_value(json).unwrap();
        match &restored.0[0] {
            MessageComponent::Quote { id, origin: o, .. } => {
                assert_eq!(*id, 99);
                assert_eq!(o, &origin);
            }
            other => panic!("expected quote, got {other:?}"),
        }
    }

    #[test]
    fn unknown_preserves_raw_payload() {
        let raw = serde_json::json!({"kind": "red_envelope", "amount": 5});
        let chain = MessageChain(vec![MessageComponent::Unknown {
            raw: raw.clone(),
            sender_id_in_prefix: Some("wxid_123".into()),
        }]);
        let json = serde_json::to_string(&chain).unwrap();
        let restored: MessageChain = serde_json::from_str(&json).unwrap();
        match &restored.0[0] {
            MessageComponent::Unknown {
                raw: r,
                sender_id_in_prefix,
            } => {
                assert_eq!(r, &raw);
                assert_eq!(sender_id_in_prefix.as_deref(), Some("wxid_123"));
            }
            other => panic!("expected unknown, got {other:?}"),
        }
    }
}
