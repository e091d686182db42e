/// Wire-level message intent, flattened from a funnel step's payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendIntent {
    Text {
        text: String,
    },
    Media {
        kind: MediaKind,
        url: String,
        caption: Option<String>,
    },
    Audio {
        url: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// Typing-indicator state for the presence side channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Composing,
    Paused,
}
